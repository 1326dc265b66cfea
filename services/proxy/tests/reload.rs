mod harness;

use std::time::Duration;

use harness::{config_json, roundtrip, ProxyHandle, TcpEchoBackend};
use tcpfan_backends::ConfigLoader;
use tcpfan_proxy::{ActiveConfig, ControlEvent, ControlOutcome, ControlPlane};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

async fn spawn_from_file(path: &std::path::Path) -> (ProxyHandle, ControlPlane) {
    let loader = ConfigLoader::new(path);
    let active = ActiveConfig::new(loader.load().unwrap());
    let proxy = ProxyHandle::spawn_with_active(active).await.unwrap();
    let plane = ControlPlane::new(proxy.ctx.clone(), loader);
    (proxy, plane)
}

#[tokio::test]
async fn reload_switches_new_connections_and_keeps_old_ones() {
    let old_backend = TcpEchoBackend::spawn().await.unwrap();
    let new_backend = TcpEchoBackend::spawn().await.unwrap();

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), config_json(&[(old_backend.addr, 1)])).unwrap();
    let (proxy, plane) = spawn_from_file(file.path()).await;

    // Open a long-lived connection against the old backend.
    let mut long_lived = TcpStream::connect(proxy.listen_addr).await.unwrap();
    long_lived.write_all(b"before").await.unwrap();
    let mut buf = [0u8; 6];
    long_lived.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"before");

    std::fs::write(file.path(), config_json(&[(new_backend.addr, 1)])).unwrap();
    let outcome = plane.handle(ControlEvent::Reload).await;
    assert_eq!(
        outcome,
        ControlOutcome::Reloaded {
            host_count: 1,
            total_weight: 1
        }
    );

    // Still forwarding to the old backend.
    long_lived.write_all(b"after!").await.unwrap();
    long_lived.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"after!");

    // New connections only reach the new backend.
    for _ in 0..20 {
        assert_eq!(roundtrip(proxy.listen_addr, b"x").await.unwrap(), b"x");
    }
    assert_eq!(old_backend.connection_count(), 1);
    assert_eq!(new_backend.connection_count(), 20);

    drop(long_lived);
    proxy.wait_idle().await;
}

#[tokio::test]
async fn invalid_reload_keeps_previous_backends() {
    let backend = TcpEchoBackend::spawn().await.unwrap();

    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), config_json(&[(backend.addr, 1)])).unwrap();
    let (proxy, plane) = spawn_from_file(file.path()).await;

    std::fs::write(file.path(), r#"{"Hosts": [{"Addr": "missing-port", "Weight": 1}]}"#).unwrap();
    assert!(matches!(
        plane.handle(ControlEvent::Reload).await,
        ControlOutcome::ReloadFailed { .. }
    ));

    let max = i64::MAX;
    std::fs::write(
        file.path(),
        config_json(&[(backend.addr, max), (backend.addr, max), (backend.addr, max)]),
    )
    .unwrap();
    match plane.handle(ControlEvent::Reload).await {
        ControlOutcome::ReloadFailed { error } => {
            assert!(error.contains("total weight overflows"), "{error}")
        }
        other => panic!("Expected ReloadFailed, got {:?}", other),
    }

    std::fs::write(file.path(), "{ not json").unwrap();
    assert!(matches!(
        plane.handle(ControlEvent::Reload).await,
        ControlOutcome::ReloadFailed { .. }
    ));

    std::fs::remove_file(file.path()).unwrap();
    assert!(matches!(
        plane.handle(ControlEvent::Reload).await,
        ControlOutcome::ReloadFailed { .. }
    ));

    for _ in 0..5 {
        assert_eq!(roundtrip(proxy.listen_addr, b"ok").await.unwrap(), b"ok");
    }
    assert_eq!(backend.connection_count(), 5);
}

#[tokio::test]
async fn status_counts_active_connections() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), config_json(&[(backend.addr, 1)])).unwrap();
    let (proxy, plane) = spawn_from_file(file.path()).await;

    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    client.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    client.read_exact(&mut buf).await.unwrap();

    match plane.handle(ControlEvent::Status).await {
        ControlOutcome::Status(status) => {
            assert_eq!(status.active_connections, 1);
            assert_eq!(status.accepted_connections, 1);
            assert_eq!(status.host_count, 1);
            assert!(status.alive_tasks >= 1);
            // One buffer per forwarding direction, both still checked out.
            assert_eq!(status.buffers_allocated, 2);
            assert_eq!(status.buffers_reused, 0);
            assert_eq!(status.buffers_idle, 0);
        }
        other => panic!("Expected Status, got {:?}", other),
    }

    drop(client);
    tokio::time::timeout(Duration::from_secs(5), proxy.wait_idle())
        .await
        .unwrap();
}
