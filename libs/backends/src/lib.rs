//! # tcpfan-backends
//!
//! Weighted backend configuration for the tcpfan forwarding proxy.
//!
//! ## Design Principles
//!
//! - A [`BackendConfig`] is an immutable snapshot; reloads build a new one
//! - Addresses are resolved once, at load time, and never again
//! - Selection never fails loudly: an empty or zero-weight pool yields `None`
//!
//! ## Config Format
//!
//! ```json
//! {
//!   "TrafficUrl": "http://collector.internal/traffic",
//!   "Hosts": [
//!     { "Addr": "10.0.0.1:8080", "Weight": 1 },
//!     { "Addr": "10.0.0.2:8080", "Weight": 3 }
//!   ]
//! }
//! ```

mod config;
mod error;
mod loader;
mod selector;

pub use config::{BackendConfig, Host};
pub use error::LoadError;
pub use loader::{ConfigLoader, ConfigSource};
pub use selector::HostSelector;
