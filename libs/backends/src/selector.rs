//! Weighted random host selection.
//!
//! Each host owns a half-open slice of `[0, total_weight)` whose width is its
//! weight. A uniform draw lands in exactly one slice, so a host is chosen with
//! probability `weight / total_weight`. Zero-weight hosts own an empty slice
//! and can never be chosen.

use rand::Rng;

use crate::config::{BackendConfig, Host};

/// Picks one backend host per incoming connection.
pub struct HostSelector;

impl HostSelector {
    /// Choose a host using the thread-local random source.
    pub fn choose(config: &BackendConfig) -> Option<&Host> {
        Self::choose_with(config, &mut rand::rng())
    }

    /// Choose a host using an injected random source.
    pub fn choose_with<'a, R: Rng>(
        config: &'a BackendConfig,
        rng: &mut R,
    ) -> Option<&'a Host> {
        let total = config.total_weight();
        if total == 0 {
            return None;
        }
        Self::pick(config, rng.random_range(0..total))
    }

    /// Map a draw in `[0, total_weight)` to a host.
    ///
    /// Walks the list in order; the first host whose upper boundary lies
    /// above the draw wins. Out-of-range draws return `None`.
    pub fn pick(config: &BackendConfig, draw: u64) -> Option<&Host> {
        let mut remaining = draw;
        for host in config.hosts() {
            if remaining < host.weight {
                return Some(host);
            }
            remaining -= host.weight;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use rstest::rstest;

    use super::*;

    fn make_config(weights: &[i64]) -> BackendConfig {
        let hosts = weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let port = 9000 + i as u16;
                Host::new(
                    format!("127.0.0.1:{port}"),
                    *w,
                    SocketAddr::from(([127, 0, 0, 1], port)),
                )
            })
            .collect();
        BackendConfig::from_hosts(hosts, None).unwrap()
    }

    #[rstest]
    #[case::first_slot(0, "127.0.0.1:9000")]
    #[case::second_slot_start(1, "127.0.0.1:9001")]
    #[case::second_slot_end(3, "127.0.0.1:9001")]
    fn test_pick_boundaries(#[case] draw: u64, #[case] expected: &str) {
        let config = make_config(&[1, 3]);
        let host = HostSelector::pick(&config, draw).unwrap();
        assert_eq!(host.addr, expected);
    }

    #[test]
    fn test_pick_skips_zero_weight() {
        let config = make_config(&[0, 2, 0, 1]);
        assert_eq!(HostSelector::pick(&config, 0).unwrap().addr, "127.0.0.1:9001");
        assert_eq!(HostSelector::pick(&config, 1).unwrap().addr, "127.0.0.1:9001");
        assert_eq!(HostSelector::pick(&config, 2).unwrap().addr, "127.0.0.1:9003");
        assert!(HostSelector::pick(&config, 3).is_none());
    }

    #[test]
    fn test_zero_total_weight_returns_none() {
        let mut rng = StdRng::seed_from_u64(7);
        for weights in [&[][..], &[0][..], &[0, -1, 0][..]] {
            let config = make_config(weights);
            for _ in 0..100 {
                assert!(HostSelector::choose_with(&config, &mut rng).is_none());
            }
            assert!(HostSelector::choose(&config).is_none());
        }
    }

    #[test]
    fn test_distribution_follows_weights() {
        let config = make_config(&[1, 3, 0, 6]);
        let mut rng = StdRng::seed_from_u64(42);
        let mut counts = [0u32; 4];
        let trials = 100_000;

        for _ in 0..trials {
            let host = HostSelector::choose_with(&config, &mut rng).unwrap();
            let idx = (host.resolved.port() - 9000) as usize;
            counts[idx] += 1;
        }

        assert_eq!(counts[2], 0, "zero-weight host must never be chosen");
        for (idx, weight) in [(0usize, 1.0f64), (1, 3.0), (3, 6.0)] {
            let observed = counts[idx] as f64 / trials as f64;
            let expected = weight / 10.0;
            assert!(
                (observed - expected).abs() < 0.01,
                "host {idx}: observed {observed}, expected {expected}"
            );
        }
    }

    proptest! {
        #[test]
        fn prop_every_draw_maps_to_eligible_host(
            weights in proptest::collection::vec(0i64..20, 1..12),
            seed in any::<u64>(),
        ) {
            let config = make_config(&weights);
            let total = config.total_weight();
            prop_assume!(total > 0);

            let draw = seed % total;
            let host = HostSelector::pick(&config, draw).unwrap();
            prop_assert!(host.is_eligible());
        }

        #[test]
        fn prop_slice_width_equals_weight(
            weights in proptest::collection::vec(0i64..10, 1..8),
        ) {
            let config = make_config(&weights);
            let mut hits = vec![0u64; weights.len()];
            for draw in 0..config.total_weight() {
                let host = HostSelector::pick(&config, draw).unwrap();
                hits[(host.resolved.port() - 9000) as usize] += 1;
            }
            for (host, hit) in config.hosts().iter().zip(hits) {
                prop_assert_eq!(host.weight, hit);
            }
        }
    }
}
