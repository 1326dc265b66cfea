//! Configuration loading.
//!
//! Reads the JSON host list, resolves every address and builds a
//! [`BackendConfig`]. A single bad entry fails the whole load.

use std::fmt;
use std::fs;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{BackendConfig, Host};
use crate::error::LoadError;

/// On-disk document shape.
#[derive(Debug, Deserialize)]
struct ConfigDocument {
    #[serde(rename = "TrafficUrl", alias = "traffic_url", default)]
    traffic_url: Option<String>,
    #[serde(rename = "Hosts", alias = "hosts", default)]
    hosts: Vec<HostEntry>,
}

#[derive(Debug, Deserialize)]
struct HostEntry {
    #[serde(rename = "Addr", alias = "addr")]
    addr: String,
    #[serde(rename = "Weight", alias = "weight", default)]
    weight: i64,
}

/// Where a configuration is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A JSON file on disk, re-read on every load.
    File(PathBuf),
    /// An inline JSON document.
    Json(String),
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Json(_) => f.write_str("<inline json>"),
        }
    }
}

impl From<PathBuf> for ConfigSource {
    fn from(path: PathBuf) -> Self {
        ConfigSource::File(path)
    }
}

impl From<&Path> for ConfigSource {
    fn from(path: &Path) -> Self {
        ConfigSource::File(path.to_path_buf())
    }
}

/// Loads [`BackendConfig`] snapshots from a fixed source.
///
/// The loader keeps no state between calls, so it is safe to call
/// [`ConfigLoader::load`] repeatedly (startup, then every reload).
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    source: ConfigSource,
}

impl ConfigLoader {
    /// Create a loader bound to a source.
    pub fn new(source: impl Into<ConfigSource>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// The source this loader reads from.
    pub fn source(&self) -> &ConfigSource {
        &self.source
    }

    /// Read, parse and resolve the configuration.
    ///
    /// Address resolution may block on DNS; async callers should run this on
    /// a blocking thread.
    pub fn load(&self) -> Result<BackendConfig, LoadError> {
        let config = match &self.source {
            ConfigSource::File(path) => {
                let raw = fs::read_to_string(path).map_err(|source| LoadError::Read {
                    path: path.clone(),
                    source,
                })?;
                Self::parse(&raw)?
            }
            ConfigSource::Json(raw) => Self::parse(raw)?,
        };

        info!(
            source = %self.source,
            host_count = config.hosts().len(),
            eligible_hosts = config.eligible_count(),
            total_weight = config.total_weight(),
            stats_enabled = config.stats_url().is_some(),
            "Backend config loaded"
        );
        if config.eligible_count() == 0 {
            warn!(source = %self.source, "No host has a positive weight, connections will be closed");
        }

        Ok(config)
    }

    /// Parse a JSON document and resolve its hosts.
    pub fn parse(raw: &str) -> Result<BackendConfig, LoadError> {
        let doc: ConfigDocument = serde_json::from_str(raw)?;

        let hosts = doc
            .hosts
            .into_iter()
            .map(|entry| {
                let resolved = resolve_addr(&entry.addr)?;
                debug!(addr = %entry.addr, resolved = %resolved, weight = entry.weight, "Resolved host");
                Ok(Host::new(entry.addr, entry.weight, resolved))
            })
            .collect::<Result<Vec<_>, LoadError>>()?;

        BackendConfig::from_hosts(hosts, doc.traffic_url)
    }
}

/// Resolve `host:port` to the first socket address it maps to.
///
/// An empty host part (`:8080`) means the local machine.
fn resolve_addr(addr: &str) -> Result<SocketAddr, LoadError> {
    let invalid = |reason: &str| LoadError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    let port: u16 = port.parse().map_err(|_| invalid("port is not a number in 0..=65535"))?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    let host = if host.is_empty() { "127.0.0.1" } else { host };

    let mut addrs = (host, port)
        .to_socket_addrs()
        .map_err(|source| LoadError::Resolve {
            addr: addr.to_string(),
            source,
        })?;

    addrs.next().ok_or_else(|| LoadError::Resolve {
        addr: addr.to_string(),
        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses returned"),
    })
}
