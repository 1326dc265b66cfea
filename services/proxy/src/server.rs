//! Listener, accept loop and per-connection lifecycle.
//!
//! Connection states:
//!
//! ```text
//! Accepted -> HostSelected -> Connected -> Forwarding -> Closed
//!      |            |
//!      v            v
//! SelectionFailed  DialFailed
//! ```
//!
//! Every failure is isolated to its connection. A fatal accept error stops
//! new connections but lets in-flight ones finish before `run` returns.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tcpfan_backends::HostSelector;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, error, info, warn, Instrument};

use crate::buffer::{BufferPool, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_IDLE};
use crate::forward::{tune_socket, ConnectionForwarder, ForwardOutcome};
use crate::state::{ActiveConfig, ConnectionTracker};
use crate::stats::StatsHandle;

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default TCP keep-alive period for proxied sockets.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(60);

/// Pause after a transient accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Runtime tunables for the data path.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Backend dial timeout.
    pub connect_timeout: Duration,
    /// TCP keep-alive period applied to client and backend sockets.
    pub keepalive: Duration,
    /// Size of each copy buffer.
    pub buffer_size: usize,
    /// Idle buffers retained by the pool.
    pub max_idle_buffers: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive: DEFAULT_KEEPALIVE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_idle_buffers: DEFAULT_MAX_IDLE,
        }
    }
}

/// How a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// No host with positive weight; the client was closed without dialing.
    SelectionFailed,
    /// The chosen backend could not be reached; the client was closed.
    DialFailed,
    /// Both directions finished.
    Closed(ForwardOutcome),
}

/// Everything a connection task needs, passed explicitly.
#[derive(Debug)]
pub struct ServerContext {
    config: ActiveConfig,
    connections: Arc<ConnectionTracker>,
    stats: StatsHandle,
    forwarder: ConnectionForwarder,
    settings: ProxySettings,
}

impl ServerContext {
    pub fn new(config: ActiveConfig, stats: StatsHandle, settings: ProxySettings) -> Self {
        let pool = BufferPool::with_capacity(settings.buffer_size, settings.max_idle_buffers);
        Self {
            config,
            connections: Arc::new(ConnectionTracker::new()),
            forwarder: ConnectionForwarder::new(pool, stats.clone()),
            stats,
            settings,
        }
    }

    pub fn config(&self) -> &ActiveConfig {
        &self.config
    }

    pub fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }

    pub fn stats(&self) -> &StatsHandle {
        &self.stats
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        self.forwarder.pool()
    }

    /// Drive one accepted connection to completion.
    pub async fn handle_connection(&self, client: TcpStream) -> ConnectionOutcome {
        let snapshot = self.config.load();

        let host = match HostSelector::choose(&snapshot) {
            Some(host) => host.clone(),
            None => {
                warn!(
                    host_count = snapshot.hosts().len(),
                    "Choose host failed: no eligible backend"
                );
                return ConnectionOutcome::SelectionFailed;
            }
        };
        drop(snapshot);

        debug!(backend = %host.addr, resolved = %host.resolved, "Host selected");

        let backend = match timeout(
            self.settings.connect_timeout,
            TcpStream::connect(host.resolved),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(backend = %host.addr, error = %e, "Connect to backend failed");
                return ConnectionOutcome::DialFailed;
            }
            Err(_) => {
                warn!(backend = %host.addr, "Connect to backend timed out");
                return ConnectionOutcome::DialFailed;
            }
        };

        for stream in [&client, &backend] {
            if let Err(e) = tune_socket(stream, self.settings.keepalive) {
                debug!(error = %e, "Failed to set socket options");
            }
        }

        let outcome = self.forwarder.forward(client, backend).await;
        debug!(
            backend = %host.addr,
            upload = outcome.upload,
            download = outcome.download,
            "Connection closed"
        );

        ConnectionOutcome::Closed(outcome)
    }
}

/// Source of inbound connections for the accept loop.
#[async_trait]
trait Acceptor: Send {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// The proxy's listening side.
pub struct ProxyServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
}

impl ProxyServer {
    /// Bind a new listener.
    pub async fn bind(addr: impl ToSocketAddrs, ctx: Arc<ServerContext>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self::from_listener(listener, ctx))
    }

    /// Wrap an already-bound listener.
    pub fn from_listener(listener: TcpListener, ctx: Arc<ServerContext>) -> Self {
        Self { listener, ctx }
    }

    /// Get the local address this server is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` completes or the listener fails,
    /// then wait for in-flight connections to drain.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        let Self { mut listener, ctx } = self;
        let result = accept_loop(&mut listener, &ctx, shutdown).await;
        drop(listener);

        drain(&ctx).await;
        result
    }
}

async fn accept_loop<A, F>(acceptor: &mut A, ctx: &Arc<ServerContext>, shutdown: F) -> io::Result<()>
where
    A: Acceptor,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);

    loop {
        let accepted = tokio::select! {
            accepted = acceptor.accept() => accepted,
            _ = &mut shutdown => {
                info!("Shutdown requested, no longer accepting");
                return Ok(());
            }
        };

        match accepted {
            Ok((stream, peer_addr)) => spawn_connection(ctx, stream, peer_addr),
            Err(e) if is_transient_accept_error(&e) => {
                warn!(error = %e, "Accept failed, retrying");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
            Err(e) => {
                error!(error = %e, "Accept failed, listener unusable");
                return Err(e);
            }
        }
    }
}

async fn drain(ctx: &ServerContext) {
    let in_flight = ctx.connections().active();
    if in_flight > 0 {
        info!(in_flight, "Draining connections");
    }
    ctx.connections().wait_idle().await;
    info!("All connections drained");
}

fn spawn_connection(ctx: &Arc<ServerContext>, stream: TcpStream, peer_addr: SocketAddr) {
    let guard = ctx.connections().track();
    let ctx = Arc::clone(ctx);

    tokio::spawn(
        async move {
            let outcome = ctx.handle_connection(stream).await;
            debug!(outcome = ?outcome, "Connection finished");
            drop(guard);
        }
        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
    );
}

/// Resource-pressure errnos that may clear: EMFILE, ENFILE, ENOBUFS, ENOMEM.
#[cfg(target_os = "linux")]
const RESOURCE_ERRNOS: &[i32] = &[24, 23, 105, 12];

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
const RESOURCE_ERRNOS: &[i32] = &[24, 23, 55, 12];

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
const RESOURCE_ERRNOS: &[i32] = &[];

/// Accept errors that do not mean the listener itself is broken.
pub fn is_transient_accept_error(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => e
            .raw_os_error()
            .is_some_and(|code| RESOURCE_ERRNOS.contains(&code)),
    }
}
