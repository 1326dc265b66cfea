//! Backend host and configuration snapshot types.

use std::net::SocketAddr;

use crate::error::LoadError;

/// A single weighted backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    /// Address as written in the configuration (`host:port`).
    pub addr: String,
    /// Selection weight. Zero means the host is never selected.
    pub weight: u64,
    /// Endpoint the address resolved to at load time.
    pub resolved: SocketAddr,
}

impl Host {
    /// Create a host from a configured weight.
    ///
    /// Negative weights are clamped to zero: the host is kept in the list
    /// but can never be chosen.
    pub fn new(addr: impl Into<String>, weight: i64, resolved: SocketAddr) -> Self {
        Self {
            addr: addr.into(),
            weight: weight.max(0) as u64,
            resolved,
        }
    }

    /// Whether this host can ever be selected.
    pub fn is_eligible(&self) -> bool {
        self.weight > 0
    }
}

/// Immutable snapshot of the weighted host list.
///
/// `total_weight` always equals the sum of the host weights; the fields are
/// private so a snapshot cannot drift from that once built.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackendConfig {
    hosts: Vec<Host>,
    total_weight: u64,
    stats_url: Option<String>,
}

impl BackendConfig {
    /// Build a snapshot from already-resolved hosts.
    ///
    /// An empty stats URL is treated as unset. Fails if the weights do not
    /// fit in a `u64` sum.
    pub fn from_hosts(hosts: Vec<Host>, stats_url: Option<String>) -> Result<Self, LoadError> {
        let total_weight = hosts.iter().try_fold(0u64, |total, host| {
            total
                .checked_add(host.weight)
                .ok_or_else(|| LoadError::WeightOverflow {
                    addr: host.addr.clone(),
                })
        })?;
        let stats_url = stats_url.filter(|url| !url.trim().is_empty());

        Ok(Self {
            hosts,
            total_weight,
            stats_url,
        })
    }

    /// Hosts in configuration order.
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// Sum of all host weights.
    pub fn total_weight(&self) -> u64 {
        self.total_weight
    }

    /// Collector endpoint for traffic stats, if reporting is enabled.
    pub fn stats_url(&self) -> Option<&str> {
        self.stats_url.as_deref()
    }

    /// Number of hosts with a positive weight.
    pub fn eligible_count(&self) -> usize {
        self.hosts.iter().filter(|h| h.is_eligible()).count()
    }
}
