//! Control plane: serialized handling of reload, status and terminate.
//!
//! Events arrive on a channel and are handled one at a time by a single
//! task, so reloads never overlap. The unix signal adapter maps process
//! signals onto that channel:
//!
//! | signal     | event       |
//! |------------|-------------|
//! | 34         | `Reload`    |
//! | 35         | `Status`    |
//! | SIGTERM    | `Terminate` |
//! | SIGHUP     | `Hangup`    |

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tcpfan_backends::{BackendConfig, ConfigLoader};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::server::ServerContext;

/// Signal number that requests a config reload.
pub const SIG_RELOAD: i32 = 34;

/// Signal number that requests a status dump.
pub const SIG_STATUS: i32 = 35;

/// A control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Re-read the configuration source and swap it in.
    Reload,
    /// Emit a diagnostic snapshot.
    Status,
    /// Platform terminate request; acknowledged only.
    Terminate,
    /// Hang-up; treated like `Terminate`.
    Hangup,
}

impl fmt::Display for ControlEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlEvent::Reload => "reload",
            ControlEvent::Status => "status",
            ControlEvent::Terminate => "terminate",
            ControlEvent::Hangup => "hangup",
        };
        f.write_str(name)
    }
}

/// Diagnostic snapshot emitted for [`ControlEvent::Status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub active_connections: usize,
    pub accepted_connections: u64,
    /// Tasks alive on the runtime (connection, forwarding and service tasks).
    pub alive_tasks: usize,
    pub upload_total: u64,
    pub download_total: u64,
    pub dropped_samples: u64,
    pub host_count: usize,
    pub total_weight: u64,
    /// Copy buffers allocated because the pool was empty.
    pub buffers_allocated: u64,
    /// Copy buffers served from the idle set.
    pub buffers_reused: u64,
    pub buffers_idle: usize,
}

/// Result of handling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Reloaded { host_count: usize, total_weight: u64 },
    ReloadFailed { error: String },
    Status(StatusSnapshot),
    Acknowledged(ControlEvent),
}

/// Handles control events against a running server.
pub struct ControlPlane {
    ctx: Arc<ServerContext>,
    loader: ConfigLoader,
}

impl ControlPlane {
    pub fn new(ctx: Arc<ServerContext>, loader: ConfigLoader) -> Self {
        Self { ctx, loader }
    }

    /// Process events until every sender is dropped.
    pub async fn run(self, mut events: mpsc::Receiver<ControlEvent>) {
        info!(source = %self.loader.source(), "Control plane started");

        while let Some(event) = events.recv().await {
            self.handle(event).await;
        }

        info!("Control plane stopped");
    }

    /// Handle a single event.
    pub async fn handle(&self, event: ControlEvent) -> ControlOutcome {
        match event {
            ControlEvent::Reload => match self.reload().await {
                Ok(config) => {
                    info!(
                        host_count = config.hosts().len(),
                        eligible_hosts = config.eligible_count(),
                        total_weight = config.total_weight(),
                        "Reload succeeded"
                    );
                    ControlOutcome::Reloaded {
                        host_count: config.hosts().len(),
                        total_weight: config.total_weight(),
                    }
                }
                Err(e) => {
                    let message = format!("{e:#}");
                    error!(error = %message, "Reload failed, keeping previous config");
                    ControlOutcome::ReloadFailed { error: message }
                }
            },
            ControlEvent::Status => {
                let status = self.status();
                info!(
                    active_connections = status.active_connections,
                    accepted_connections = status.accepted_connections,
                    alive_tasks = status.alive_tasks,
                    upload_total = status.upload_total,
                    download_total = status.download_total,
                    dropped_samples = status.dropped_samples,
                    host_count = status.host_count,
                    total_weight = status.total_weight,
                    buffers_allocated = status.buffers_allocated,
                    buffers_reused = status.buffers_reused,
                    buffers_idle = status.buffers_idle,
                    "Status"
                );
                ControlOutcome::Status(status)
            }
            ControlEvent::Terminate | ControlEvent::Hangup => {
                info!(event = %event, "Caught signal, ignored");
                ControlOutcome::Acknowledged(event)
            }
        }
    }

    /// Load the configuration source and publish it. On failure the active
    /// configuration is left untouched.
    pub async fn reload(&self) -> Result<Arc<BackendConfig>> {
        let loader = self.loader.clone();
        let config = tokio::task::spawn_blocking(move || loader.load())
            .await
            .context("Reload task panicked")?
            .with_context(|| format!("Failed to load {}", self.loader.source()))?;

        self.ctx.config().replace(config);
        Ok(self.ctx.config().load())
    }

    /// Current diagnostics.
    pub fn status(&self) -> StatusSnapshot {
        let totals = self.ctx.stats().totals();
        let config = self.ctx.config().load();
        let buffers = self.ctx.buffer_pool().stats();
        let alive_tasks = tokio::runtime::Handle::try_current()
            .map(|handle| handle.metrics().num_alive_tasks())
            .unwrap_or(0);

        StatusSnapshot {
            active_connections: self.ctx.connections().active(),
            accepted_connections: self.ctx.connections().accepted(),
            alive_tasks,
            upload_total: totals.upload,
            download_total: totals.download,
            dropped_samples: totals.dropped_samples,
            host_count: config.hosts().len(),
            total_weight: config.total_weight(),
            buffers_allocated: buffers.allocated,
            buffers_reused: buffers.reused,
            buffers_idle: buffers.idle,
        }
    }
}

/// Forward process signals to the control channel.
///
/// Returns once all handlers are registered; the forwarding runs in a
/// background task until the channel closes.
#[cfg(unix)]
pub fn spawn_signal_listener(
    events: mpsc::Sender<ControlEvent>,
) -> Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut reload = signal(SignalKind::from_raw(SIG_RELOAD))
        .context("Failed to create reload signal handler")?;
    let mut status = signal(SignalKind::from_raw(SIG_STATUS))
        .context("Failed to create status signal handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to create SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to create SIGHUP handler")?;

    Ok(tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = reload.recv() => ControlEvent::Reload,
                _ = status.recv() => ControlEvent::Status,
                _ = sigterm.recv() => ControlEvent::Terminate,
                _ = sighup.recv() => ControlEvent::Hangup,
            };

            if events.send(event).await.is_err() {
                break;
            }
        }
    }))
}
