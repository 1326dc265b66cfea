//! Bidirectional byte pumping between a client and its backend.
//!
//! Each direction runs in its own task with its own pooled buffer. When a
//! direction sees EOF or an I/O error it half-closes: writes are shut down on
//! the destination and reads on the source. The peer then observes EOF and
//! the opposite direction winds down on its own. Sockets close when both
//! tasks have finished and dropped their halves.

use std::io;
use std::net::Shutdown;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::buffer::BufferPool;
use crate::stats::{Direction, StatsHandle};

/// Unreported bytes that trigger an intermediate stats report.
pub const REPORT_CHUNK: u64 = 1024 * 1024;

/// Bytes moved over one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardOutcome {
    /// Client to backend.
    pub upload: u64,
    /// Backend to client.
    pub download: u64,
}

/// Apply keep-alive, no-delay and no-linger options to a proxied socket.
pub fn tune_socket(stream: &TcpStream, keepalive: Duration) -> io::Result<()> {
    stream.set_nodelay(true)?;

    let sock = SockRef::from(stream);
    sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(keepalive))?;
    sock.set_linger(None)?;
    Ok(())
}

/// Moves bytes between client and backend and reports them to stats.
#[derive(Debug, Clone)]
pub struct ConnectionForwarder {
    pool: BufferPool,
    stats: StatsHandle,
}

impl ConnectionForwarder {
    pub fn new(pool: BufferPool, stats: StatsHandle) -> Self {
        Self { pool, stats }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Forward until both directions have ended.
    pub async fn forward(&self, client: TcpStream, backend: TcpStream) -> ForwardOutcome {
        let (client_read, client_write) = client.into_split();
        let (backend_read, backend_write) = backend.into_split();

        let upload = tokio::spawn(pump(
            client_read,
            backend_write,
            self.pool.clone(),
            self.stats.clone(),
            Direction::Upload,
        ));
        let download = tokio::spawn(pump(
            backend_read,
            client_write,
            self.pool.clone(),
            self.stats.clone(),
            Direction::Download,
        ));

        let (upload, download) = tokio::join!(upload, download);

        ForwardOutcome {
            upload: upload.unwrap_or_else(|e| {
                warn!(error = %e, "Upload task failed");
                0
            }),
            download: download.unwrap_or_else(|e| {
                warn!(error = %e, "Download task failed");
                0
            }),
        }
    }
}

/// Copy one direction until EOF or error, then half-close both ends.
async fn pump(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    pool: BufferPool,
    stats: StatsHandle,
    direction: Direction,
) -> u64 {
    let mut buf = pool.acquire();
    let mut total = 0u64;
    let mut unreported = 0u64;

    loop {
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(direction = %direction, error = %e, "Read failed");
                break;
            }
        };

        if let Err(e) = dst.write_all(&buf[..n]).await {
            debug!(direction = %direction, error = %e, "Write failed");
            break;
        }

        total += n as u64;
        unreported += n as u64;
        if unreported >= REPORT_CHUNK {
            stats.record(direction, unreported);
            unreported = 0;
        }
    }

    // Errors here mean the peer is already gone.
    let _ = dst.shutdown().await;
    let source: &TcpStream = src.as_ref();
    let _ = SockRef::from(source).shutdown(Shutdown::Read);

    stats.record(direction, unreported);
    total
}
