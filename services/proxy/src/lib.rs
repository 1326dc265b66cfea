//! # tcpfan-proxy
//!
//! Transparent TCP forwarding across a weighted backend pool.
//!
//! ```text
//! Client -> ProxyServer -> HostSelector -> ConnectionForwarder -> Backend
//!                |                               |
//!          ControlPlane                    StatsAggregator -> collector (HTTP)
//!       (reload/status/term)
//! ```
//!
//! - [`server`]: listener, accept loop, per-connection lifecycle, drain
//! - [`forward`]: two-task bidirectional copy with half-close
//! - [`buffer`]: lock-free pool of copy buffers
//! - [`stats`]: span counters with count and time flush triggers
//! - [`control`]: serialized reload/status/terminate handling
//! - [`state`]: atomically swappable config and connection tracking

pub mod buffer;
pub mod config;
pub mod control;
pub mod forward;
pub mod server;
pub mod state;
pub mod stats;

pub use buffer::{BufferPool, PooledBuffer};
pub use control::{ControlEvent, ControlOutcome, ControlPlane, StatusSnapshot};
pub use forward::{ConnectionForwarder, ForwardOutcome};
pub use server::{ConnectionOutcome, ProxyServer, ProxySettings, ServerContext};
pub use state::{ActiveConfig, ConnectionTracker};
pub use stats::{
    Direction, HttpStatsSink, StatsAggregator, StatsConfig, StatsHandle, StatsSink, StatsWorker,
    TrafficReport,
};
