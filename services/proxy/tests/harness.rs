//! Test harness for proxy integration tests.
//!
//! Provides echo and tagging backends, a proxy spawned on an ephemeral
//! port, and helpers to build backend configurations.

#![allow(dead_code)]

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tcpfan_backends::{BackendConfig, Host};
use tcpfan_proxy::stats::TrafficSample;
use tcpfan_proxy::{ActiveConfig, Direction, ProxyServer, ProxySettings, ServerContext, StatsHandle};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Backend that echoes everything until the client half-closes.
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub closed: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let closed = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let closed_clone = Arc::clone(&closed);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::SeqCst);
                                let closed = Arc::clone(&closed_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                    let _ = stream.shutdown().await;
                                    closed.fetch_add(1, Ordering::SeqCst);
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            closed,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Backend that writes a single tag byte and closes.
pub struct TaggedBackend {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TaggedBackend {
    pub async fn spawn(tag: u8) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                tokio::spawn(async move {
                                    let _ = stream.write_all(&[tag]).await;
                                    let _ = stream.shutdown().await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

impl Drop for TaggedBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A proxy running on an ephemeral loopback port.
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub ctx: Arc<ServerContext>,
    pub samples: mpsc::Receiver<TrafficSample>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<io::Result<()>>>,
}

impl ProxyHandle {
    pub async fn spawn(config: BackendConfig) -> io::Result<Self> {
        Self::spawn_with_active(ActiveConfig::new(config)).await
    }

    pub async fn spawn_with_active(active: ActiveConfig) -> io::Result<Self> {
        let (stats, samples) = StatsHandle::channel(4096);
        let ctx = Arc::new(ServerContext::new(active, stats, ProxySettings::default()));

        let server = ProxyServer::bind("127.0.0.1:0", Arc::clone(&ctx)).await?;
        let listen_addr = server.local_addr()?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run(async move {
            let _ = shutdown_rx.await;
        }));

        Ok(Self {
            listen_addr,
            ctx,
            samples,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    /// Stop accepting; the returned task completes once connections drain.
    pub fn shutdown(&mut self) -> JoinHandle<io::Result<()>> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.task.take().expect("proxy already shut down")
    }

    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(5), self.ctx.connections().wait_idle())
            .await
            .expect("connections should drain");
    }

    /// Sum the samples reported so far as (upload, download).
    pub fn drain_samples(&mut self) -> (u64, u64) {
        let mut upload = 0;
        let mut download = 0;
        while let Ok(sample) = self.samples.try_recv() {
            match sample.direction {
                Direction::Upload => upload += sample.bytes,
                Direction::Download => download += sample.bytes,
            }
        }
        (upload, download)
    }
}

pub fn make_host(addr: SocketAddr, weight: i64) -> Host {
    Host::new(addr.to_string(), weight, addr)
}

pub fn make_config(hosts: Vec<Host>) -> BackendConfig {
    BackendConfig::from_hosts(hosts, None).unwrap()
}

pub fn config_json(hosts: &[(SocketAddr, i64)]) -> String {
    let entries: Vec<String> = hosts
        .iter()
        .map(|(addr, weight)| format!(r#"{{"Addr": "{addr}", "Weight": {weight}}}"#))
        .collect();
    format!(r#"{{"Hosts": [{}]}}"#, entries.join(", "))
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

/// Send a payload, half-close, and read the full reply.
pub async fn roundtrip(addr: SocketAddr, payload: &[u8]) -> io::Result<Vec<u8>> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(payload).await?;
        stream.shutdown().await?;
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await?;
        Ok(reply)
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "roundtrip timed out"))?
}
