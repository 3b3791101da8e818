#[path = "common/mod.rs"]
mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use common::{ledger_of_len, ledger_with, wait_for_len, MemoryHost, MemoryRegistry};
use peerchain::{
    listen, open_stream, resolve, DialError, Error, Extension, Host, PeerDirectory, PeerIdentity,
    SharedLedger, SharedSource, SyncConfig, SyncHandler, SyncSession, TcpHost, LEDGER_PROTOCOL,
    PERMANENT_ADDR_TTL,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

const OTHER_PROTOCOL: &str = "/other/1.0.0";

fn fast_config() -> SyncConfig {
    SyncConfig {
        broadcast_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

async fn tcp_host(protocols: &[&str]) -> Arc<TcpHost> {
    let host = TcpHost::bind(
        "127.0.0.1:0".parse().unwrap(),
        PeerIdentity::generate(),
        PeerDirectory::new(),
        protocols,
    )
    .await
    .expect("bind loopback");
    Arc::new(host)
}

fn dial_reason(result: Result<peerchain::PeerStream, Error>) -> DialError {
    match result {
        Err(Error::DialFailed { reason, .. }) => reason,
        Err(other) => panic!("expected DialFailed, got {other:?}"),
        Ok(_) => panic!("dial unexpectedly succeeded"),
    }
}

#[tokio::test]
async fn tcp_peers_converge_on_longest_ledger() {
    let listener = tcp_host(&[LEDGER_PROTOCOL]).await;
    let dialer = tcp_host(&[LEDGER_PROTOCOL]).await;
    let shutdown = CancellationToken::new();

    let listener_ledger = SharedLedger::new(ledger_of_len(3));
    let handler = SyncHandler::new(listener_ledger.clone(), fast_config(), shutdown.clone());
    tokio::spawn(listen(
        listener.clone(),
        LEDGER_PROTOCOL,
        Arc::new(handler),
        shutdown.clone(),
    ));

    let (peer, addr) = resolve(&listener.full_addr().to_string()).unwrap();
    assert_eq!(peer, listener.local_peer());
    dialer.directory().remember(peer, addr, PERMANENT_ADDR_TTL).await;

    let stream = open_stream(dialer.as_ref(), &peer, LEDGER_PROTOCOL)
        .await
        .expect("dial listener");
    assert_eq!(stream.peer(), &listener.local_peer());
    assert_eq!(stream.protocol(), LEDGER_PROTOCOL);

    let dialer_ledger = SharedLedger::new(ledger_with("dialer", 5));
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(
        SyncSession::new(stream, dialer_ledger.clone(), fast_config())
            .with_source(SharedSource::new(rx))
            .run(shutdown.clone()),
    );

    assert!(wait_for_len(&listener_ledger, 5).await);
    assert_eq!(
        listener_ledger.snapshot().await,
        dialer_ledger.snapshot().await
    );

    tx.send(Extension::on_tip("from dialer")).await.unwrap();
    assert!(wait_for_len(&listener_ledger, 6).await);
    assert_eq!(
        listener_ledger.snapshot().await.tip().unwrap().data,
        "from dialer"
    );

    shutdown.cancel();
}

#[tokio::test]
async fn tcp_dial_rejects_unsupported_protocol() {
    let listener = tcp_host(&[OTHER_PROTOCOL]).await;
    let dialer = tcp_host(&[LEDGER_PROTOCOL]).await;

    let (peer, addr) = resolve(&listener.full_addr().to_string()).unwrap();
    dialer.directory().remember(peer, addr, PERMANENT_ADDR_TTL).await;

    let reason = dial_reason(open_stream(dialer.as_ref(), &peer, LEDGER_PROTOCOL).await);
    assert!(matches!(reason, DialError::ProtocolRejected(p) if p == LEDGER_PROTOCOL));
}

#[tokio::test]
async fn tcp_dial_detects_wrong_identity() {
    let listener = tcp_host(&[LEDGER_PROTOCOL]).await;
    let dialer = tcp_host(&[LEDGER_PROTOCOL]).await;

    let impostor = PeerIdentity::generate();
    let (_, addr) = resolve(&listener.full_addr().to_string()).unwrap();
    dialer
        .directory()
        .remember(impostor, addr, PERMANENT_ADDR_TTL)
        .await;

    let reason = dial_reason(open_stream(dialer.as_ref(), &impostor, LEDGER_PROTOCOL).await);
    match reason {
        DialError::IdentityMismatch { actual } => assert_eq!(actual, listener.local_peer()),
        other => panic!("expected IdentityMismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn tcp_dial_reports_unreachable_peer() {
    let closed: SocketAddr = {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap()
    };
    let dialer = tcp_host(&[LEDGER_PROTOCOL]).await;
    let peer = PeerIdentity::generate();
    let target = format!("/ip4/127.0.0.1/tcp/{}/p2p/{peer}", closed.port());

    let (peer, addr) = resolve(&target).unwrap();
    dialer.directory().remember(peer, addr, PERMANENT_ADDR_TTL).await;

    let reason = dial_reason(open_stream(dialer.as_ref(), &peer, LEDGER_PROTOCOL).await);
    assert!(matches!(reason, DialError::Unreachable(_)));
}

#[tokio::test]
async fn memory_peers_sync_through_listen() {
    let registry = Arc::new(MemoryRegistry::default());
    let alpha = MemoryHost::new(registry.clone(), 1, &[LEDGER_PROTOCOL]).await;
    let beta = MemoryHost::new(registry.clone(), 2, &[LEDGER_PROTOCOL]).await;
    let shutdown = CancellationToken::new();

    let alpha_ledger = SharedLedger::new(ledger_with("alpha", 7));
    tokio::spawn(listen(
        alpha.clone(),
        LEDGER_PROTOCOL,
        Arc::new(SyncHandler::new(
            alpha_ledger.clone(),
            fast_config(),
            shutdown.clone(),
        )),
        shutdown.clone(),
    ));

    let (peer, addr) = resolve(&alpha.full_addr().to_string()).unwrap();
    assert_eq!(addr.to_string(), "/memory/1");
    beta.directory().remember(peer, addr, PERMANENT_ADDR_TTL).await;

    let beta_ledger = SharedLedger::new(ledger_of_len(2));
    let stream = open_stream(beta.as_ref(), &peer, LEDGER_PROTOCOL)
        .await
        .expect("dial alpha");
    tokio::spawn(SyncSession::new(stream, beta_ledger.clone(), fast_config()).run(shutdown.clone()));

    assert!(wait_for_len(&beta_ledger, 7).await);
    assert_eq!(beta_ledger.snapshot().await, alpha_ledger.snapshot().await);
    assert_eq!(
        beta.dial_calls().await,
        vec![(alpha.local_peer(), LEDGER_PROTOCOL.to_string())]
    );

    shutdown.cancel();
}

#[tokio::test]
async fn dial_without_directory_entry_never_reaches_host() {
    let registry = Arc::new(MemoryRegistry::default());
    let alpha = MemoryHost::new(registry.clone(), 1, &[LEDGER_PROTOCOL]).await;
    let beta = MemoryHost::new(registry.clone(), 2, &[LEDGER_PROTOCOL]).await;

    let reason = dial_reason(open_stream(beta.as_ref(), &alpha.local_peer(), LEDGER_PROTOCOL).await);
    assert!(matches!(reason, DialError::NoKnownAddress));
    assert!(beta.dial_calls().await.is_empty());
}

#[tokio::test]
async fn dial_to_vanished_peer_is_unreachable() {
    let registry = Arc::new(MemoryRegistry::default());
    let alpha = MemoryHost::new(registry.clone(), 1, &[LEDGER_PROTOCOL]).await;
    let beta = MemoryHost::new(registry.clone(), 2, &[LEDGER_PROTOCOL]).await;

    let (peer, addr) = resolve(&alpha.full_addr().to_string()).unwrap();
    beta.directory().remember(peer, addr, PERMANENT_ADDR_TTL).await;
    registry.unregister(&peer).await;

    let reason = dial_reason(open_stream(beta.as_ref(), &peer, LEDGER_PROTOCOL).await);
    assert!(matches!(reason, DialError::Unreachable(_)));
}

#[tokio::test]
async fn listen_drops_streams_for_other_protocols() {
    let registry = Arc::new(MemoryRegistry::default());
    let alpha = MemoryHost::new(registry.clone(), 1, &[LEDGER_PROTOCOL, OTHER_PROTOCOL]).await;
    let beta = MemoryHost::new(registry.clone(), 2, &[LEDGER_PROTOCOL]).await;
    let shutdown = CancellationToken::new();

    let alpha_ledger = SharedLedger::new(ledger_of_len(1));
    tokio::spawn(listen(
        alpha.clone(),
        LEDGER_PROTOCOL,
        Arc::new(SyncHandler::new(alpha_ledger, fast_config(), shutdown.clone())),
        shutdown.clone(),
    ));

    let (peer, addr) = resolve(&alpha.full_addr().to_string()).unwrap();
    beta.directory().remember(peer, addr, PERMANENT_ADDR_TTL).await;
    let stream = open_stream(beta.as_ref(), &peer, OTHER_PROTOCOL)
        .await
        .expect("alpha advertises the protocol");

    let (mut reader, _writer) = stream.into_parts();
    let mut buf = Vec::new();
    let read = timeout(Duration::from_secs(5), reader.read_to_end(&mut buf))
        .await
        .expect("stream closed promptly")
        .unwrap();
    assert_eq!(read, 0);

    shutdown.cancel();
}

#[tokio::test]
async fn listen_returns_on_shutdown() {
    let registry = Arc::new(MemoryRegistry::default());
    let alpha = MemoryHost::new(registry, 1, &[LEDGER_PROTOCOL]).await;
    let shutdown = CancellationToken::new();
    let handler = SyncHandler::new(
        SharedLedger::new(ledger_of_len(1)),
        fast_config(),
        shutdown.clone(),
    );

    let task = tokio::spawn(listen(alpha, LEDGER_PROTOCOL, Arc::new(handler), shutdown.clone()));
    shutdown.cancel();
    let result = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(result.is_ok());
}
