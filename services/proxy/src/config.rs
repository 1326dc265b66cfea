//! Process configuration (flags with environment fallbacks).

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::buffer::{DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE};
use crate::server::ProxySettings;
use crate::stats::{StatsConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_FLUSH_THRESHOLD};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Weighted TCP forwarding proxy.
#[derive(Debug, Clone, Parser)]
#[command(name = "tcpfan", version, about)]
pub struct Args {
    /// Local listen address (`:1248` listens on all interfaces).
    #[arg(long, env = "TCPFAN_LISTEN", default_value = ":1248")]
    pub listen: String,

    /// Access point name reported with traffic stats (defaults to the listen port).
    #[arg(long, env = "TCPFAN_NAME")]
    pub name: Option<String>,

    /// Backend configuration file (JSON).
    #[arg(value_name = "CONFIG")]
    pub config: PathBuf,

    /// Flush a traffic span once it exceeds this many bytes.
    #[arg(long, env = "TCPFAN_STATS_THRESHOLD", default_value_t = DEFAULT_FLUSH_THRESHOLD)]
    pub stats_threshold: u64,

    /// Flush non-zero traffic spans at this interval.
    #[arg(long, env = "TCPFAN_STATS_INTERVAL_SECS", default_value_t = 60)]
    pub stats_interval_secs: u64,

    /// Capacity of the traffic sample channel.
    #[arg(long, env = "TCPFAN_STATS_CAPACITY", default_value_t = DEFAULT_CHANNEL_CAPACITY)]
    pub stats_capacity: usize,

    /// Backend connect timeout in milliseconds.
    #[arg(long, env = "TCPFAN_CONNECT_TIMEOUT_MS", default_value_t = 5000)]
    pub connect_timeout_ms: u64,

    /// TCP keep-alive period in seconds.
    #[arg(long, env = "TCPFAN_KEEPALIVE_SECS", default_value_t = 60)]
    pub keepalive_secs: u64,

    /// Copy buffer size in bytes.
    #[arg(long, env = "TCPFAN_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Idle copy buffers kept for reuse.
    #[arg(long, env = "TCPFAN_BUFFER_POOL_IDLE", default_value_t = DEFAULT_MAX_IDLE)]
    pub buffer_pool_idle: usize,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "TCPFAN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "TCPFAN_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

impl Args {
    /// Address to bind. A bare `:port` binds every IPv4 interface.
    pub fn listen_addr(&self) -> String {
        if self.listen.starts_with(':') {
            format!("0.0.0.0{}", self.listen)
        } else {
            self.listen.clone()
        }
    }

    /// Instance name: the explicit name, or the text after the last `:` of
    /// the listen address.
    pub fn instance_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self
                .listen
                .rsplit_once(':')
                .map(|(_, port)| port)
                .unwrap_or(&self.listen)
                .to_string(),
        }
    }

    pub fn proxy_settings(&self) -> ProxySettings {
        ProxySettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms.max(1)),
            keepalive: Duration::from_secs(self.keepalive_secs.max(1)),
            buffer_size: self.buffer_size.max(1),
            max_idle_buffers: self.buffer_pool_idle,
        }
    }

    pub fn stats_config(&self) -> StatsConfig {
        StatsConfig {
            flush_threshold: self.stats_threshold,
            flush_interval: Duration::from_secs(self.stats_interval_secs.max(1)),
            channel_capacity: self.stats_capacity.max(1),
        }
    }
}
