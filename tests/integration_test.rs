//! Integration tests for the full session flow over the loopback radio.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::timeout;

use spp_bridge::bluetooth::{LoopbackPlatform, SPP_UUID};
use spp_bridge::{Config, DisconnectReason, ErrorKind, Session, SessionEvent, SessionRole};

const PEER: &str = "AA:BB:CC:DD:EE:01";
const WAIT: Duration = Duration::from_secs(2);

type Events = mpsc::UnboundedReceiver<SessionEvent>;

fn session_with_events(platform: &LoopbackPlatform) -> (Session, Events) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = Session::new(Arc::new(platform.clone()), Arc::new(tx), Config::default());
    (session, rx)
}

async fn next_event(events: &mut Events) -> SessionEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event sink closed")
}

async fn assert_no_event(events: &mut Events) {
    if let Ok(Some(event)) = timeout(Duration::from_millis(100), events.recv()).await {
        panic!("unexpected event: {:?}", event);
    }
}

/// Link whose reads fail at once.
struct ResetOnRead;

impl AsyncRead for ResetOnRead {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "link reset")))
    }
}

impl AsyncWrite for ResetOnRead {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Link that stays readable but rejects every write.
struct BrokenPipeOnWrite;

impl AsyncRead for BrokenPipeOnWrite {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Pending
    }
}

impl AsyncWrite for BrokenPipeOnWrite {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "pipe broken")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

async fn wait_idle(session: &Session) {
    let mut roles = session.subscribe_role();
    let role = roles
        .wait_for_timeout(WAIT, |role| role == SessionRole::Idle)
        .await;
    assert_eq!(role, Some(SessionRole::Idle));
}

#[tokio::test]
async fn test_server_receives_single_chunk() {
    let platform = LoopbackPlatform::new();
    let (session, mut events) = session_with_events(&platform);

    let completion = session.start_listening().await.unwrap();
    assert_eq!(session.role(), SessionRole::Listening);

    let mut peer = platform.peer_dial(PEER, SPP_UUID).unwrap();
    completion.await.unwrap();
    assert_eq!(session.role(), SessionRole::ServerConnected);
    assert_eq!(session.peer().as_deref(), Some(PEER));
    // The listener goes away once a peer is accepted.
    assert!(!platform.is_bound(SPP_UUID));

    match next_event(&mut events).await {
        SessionEvent::Connected { role, peer } => {
            assert_eq!(role, SessionRole::ServerConnected);
            assert_eq!(peer, PEER);
        }
        other => panic!("expected Connected, got {:?}", other),
    }

    peer.write_all(b"PING").await.unwrap();
    match next_event(&mut events).await {
        SessionEvent::DataReceived(chunk) => {
            assert_eq!(chunk.text(), "PING");
            assert_eq!(chunk.seq(), 0);
        }
        other => panic!("expected DataReceived, got {:?}", other),
    }
    assert_no_event(&mut events).await;

    session.send(b"PONG").await.unwrap();
    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"PONG");
}

#[tokio::test]
async fn test_client_connects_to_peer() {
    let platform = LoopbackPlatform::new();
    let mut remote = platform.add_peer(PEER, Some("GPS"), SPP_UUID);
    let (session, mut events) = session_with_events(&platform);

    session.connect(PEER).await.unwrap().await.unwrap();
    let mut peer = remote.accept().await.unwrap();
    assert_eq!(session.role(), SessionRole::ClientConnected);
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected {
            role: SessionRole::ClientConnected,
            ..
        }
    ));

    peer.write_all(b"$GPGGA").await.unwrap();
    match next_event(&mut events).await {
        SessionEvent::DataReceived(chunk) => assert_eq!(chunk.bytes(), b"$GPGGA"),
        other => panic!("expected DataReceived, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_address_never_dials() {
    let platform = LoopbackPlatform::new();
    let (session, _events) = session_with_events(&platform);

    let err = session.connect("").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(platform.dial_attempts(), 0);
    assert_eq!(platform.live_transports(), 0);
}

#[tokio::test]
async fn test_double_disconnect_closes_once() {
    let platform = LoopbackPlatform::new();
    let mut remote = platform.add_peer(PEER, None, SPP_UUID);
    let (session, mut events) = session_with_events(&platform);

    session.connect(PEER).await.unwrap().await.unwrap();
    let mut peer = remote.accept().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { .. }
    ));

    session.disconnect().await;
    session.disconnect().await;
    assert_eq!(session.role(), SessionRole::Idle);
    assert_eq!(platform.live_transports(), 0);

    match next_event(&mut events).await {
        SessionEvent::Disconnected { reason } => assert_eq!(reason, DisconnectReason::Requested),
        other => panic!("expected Disconnected, got {:?}", other),
    }
    assert_no_event(&mut events).await;

    let mut buf = [0u8; 1];
    assert_eq!(peer.read(&mut buf).await.unwrap(), 0);

    let err = session.send(b"late").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
}

#[tokio::test]
async fn test_already_active_leaves_transport_untouched() {
    let platform = LoopbackPlatform::new();
    let mut remote = platform.add_peer(PEER, None, SPP_UUID);
    let (session, _events) = session_with_events(&platform);

    session.connect(PEER).await.unwrap().await.unwrap();
    let mut peer = remote.accept().await.unwrap();

    assert_eq!(
        session.connect(PEER).await.unwrap_err().kind(),
        ErrorKind::AlreadyActive
    );
    assert_eq!(
        session.start_listening().await.unwrap_err().kind(),
        ErrorKind::AlreadyActive
    );
    assert_eq!(platform.dial_attempts(), 1);
    assert_eq!(platform.live_transports(), 1);
    assert_eq!(session.role(), SessionRole::ClientConnected);

    session.send(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still here");
}

#[tokio::test]
async fn test_end_of_stream_returns_to_idle() {
    let platform = LoopbackPlatform::new();
    let mut remote = platform.add_peer(PEER, None, SPP_UUID);
    let (session, mut events) = session_with_events(&platform);

    session.connect(PEER).await.unwrap().await.unwrap();
    let peer = remote.accept().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { .. }
    ));

    drop(peer);
    wait_idle(&session).await;
    match next_event(&mut events).await {
        SessionEvent::Disconnected { reason } => assert_eq!(reason, DisconnectReason::EndOfStream),
        other => panic!("expected Disconnected, got {:?}", other),
    }
    assert_eq!(platform.live_transports(), 0);

    // No explicit disconnect needed before the next connection.
    session.connect(PEER).await.unwrap().await.unwrap();
    let _peer = remote.accept().await.unwrap();
    assert_eq!(session.role(), SessionRole::ClientConnected);
    assert_eq!(platform.live_transports(), 1);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_dial() {
    let platform = LoopbackPlatform::new();
    let _remote = platform.add_peer(PEER, None, SPP_UUID);
    platform.set_stalled(PEER, true);
    let (session, mut events) = session_with_events(&platform);

    let completion = session.connect(PEER).await.unwrap();
    assert_eq!(session.role(), SessionRole::Connecting);

    session.disconnect().await;
    let err = timeout(WAIT, completion).await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(session.role(), SessionRole::Idle);
    assert_eq!(platform.live_transports(), 0);
    // Nothing was connected, so nothing is reported as disconnected.
    assert_no_event(&mut events).await;
}

#[tokio::test]
async fn test_stop_listening_keeps_connection() {
    let platform = LoopbackPlatform::new();
    let (session, _events) = session_with_events(&platform);

    let completion = session.start_listening().await.unwrap();
    let mut peer = platform.peer_dial(PEER, SPP_UUID).unwrap();
    completion.await.unwrap();

    session.stop_listening().await;
    assert_eq!(session.role(), SessionRole::ServerConnected);

    session.send(b"ok").await.unwrap();
    let mut buf = [0u8; 2];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ok");
}

#[tokio::test]
async fn test_second_peer_is_not_accepted() {
    let platform = LoopbackPlatform::new();
    let (session, _events) = session_with_events(&platform);

    let completion = session.start_listening().await.unwrap();
    let _first = platform.peer_dial(PEER, SPP_UUID).unwrap();
    completion.await.unwrap();

    assert!(platform
        .peer_dial("AA:BB:CC:DD:EE:02", SPP_UUID)
        .is_err());
    assert_eq!(platform.live_transports(), 1);
}

#[tokio::test]
async fn test_disconnect_racing_accept_leaves_one_transport_at_most() {
    let platform = LoopbackPlatform::new();
    let (session, _events) = session_with_events(&platform);

    for _ in 0..20 {
        let completion = session.start_listening().await.unwrap();
        let _peer = platform.peer_dial(PEER, SPP_UUID).unwrap();

        let (result, ()) = tokio::join!(completion, session.disconnect());
        if let Err(e) = result {
            assert_eq!(e.kind(), ErrorKind::Cancelled);
        }
        assert!(platform.live_transports() <= 1);

        session.disconnect().await;
        assert_eq!(session.role(), SessionRole::Idle);
        assert_eq!(platform.live_transports(), 0);
    }
}

#[tokio::test]
async fn test_repeated_connect_disconnect() {
    let platform = LoopbackPlatform::new();
    let mut remote = platform.add_peer(PEER, None, SPP_UUID);
    let (session, _events) = session_with_events(&platform);

    for _ in 0..10 {
        session.connect(PEER).await.unwrap().await.unwrap();
        let _peer = remote.accept().await.unwrap();
        assert_eq!(platform.live_transports(), 1);
        session.disconnect().await;
        assert_eq!(platform.live_transports(), 0);
    }
}

#[tokio::test]
async fn test_unawaited_failure_is_reported_to_sink() {
    let platform = LoopbackPlatform::new();
    let (session, mut events) = session_with_events(&platform);

    drop(session.connect("00:11:22:33:44:55").await.unwrap());

    match next_event(&mut events).await {
        SessionEvent::Error(message) => assert!(message.contains("not found")),
        other => panic!("expected Error, got {:?}", other),
    }
    wait_idle(&session).await;
}

#[tokio::test]
async fn test_shutdown_disconnects_and_refuses_new_work() {
    let platform = LoopbackPlatform::new();
    let mut remote = platform.add_peer(PEER, None, SPP_UUID);
    let (session, mut events) = session_with_events(&platform);

    session.connect(PEER).await.unwrap().await.unwrap();
    let _peer = remote.accept().await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { .. }
    ));

    session.shutdown().await;
    assert_eq!(session.role(), SessionRole::Idle);
    assert_eq!(platform.live_transports(), 0);
    match next_event(&mut events).await {
        SessionEvent::Disconnected { reason } => assert_eq!(reason, DisconnectReason::Shutdown),
        other => panic!("expected Disconnected, got {:?}", other),
    }

    assert_eq!(
        session.connect(PEER).await.unwrap_err().kind(),
        ErrorKind::Cancelled
    );
}

#[tokio::test]
async fn test_disconnect_interrupts_send_to_stalled_peer() {
    let platform = LoopbackPlatform::new();
    let mut remote = platform.add_peer(PEER, None, SPP_UUID);
    let (session, _events) = session_with_events(&platform);
    let session = Arc::new(session);

    session.connect(PEER).await.unwrap().await.unwrap();
    // Kept open but never read, so the link buffer fills up.
    let _peer = remote.accept().await.unwrap();

    let sender = Arc::clone(&session);
    let send = tokio::spawn(async move { sender.send(&vec![0u8; 256 * 1024]).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!send.is_finished());

    timeout(WAIT, session.disconnect())
        .await
        .expect("disconnect must not wait for a blocked send");
    assert_eq!(session.role(), SessionRole::Idle);
    assert_eq!(platform.live_transports(), 0);

    let err = timeout(WAIT, send).await.unwrap().unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteFailed);

    // The session is usable again.
    session.connect(PEER).await.unwrap().await.unwrap();
    let _next = remote.accept().await.unwrap();
    assert_eq!(session.role(), SessionRole::ClientConnected);
}

#[tokio::test]
async fn test_read_error_reports_and_returns_to_idle() {
    let platform = LoopbackPlatform::new();
    let (session, mut events) = session_with_events(&platform);

    let completion = session.start_listening().await.unwrap();
    platform.peer_connect(PEER, SPP_UUID, ResetOnRead).unwrap();
    completion.await.unwrap();

    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected {
            role: SessionRole::ServerConnected,
            ..
        }
    ));
    match next_event(&mut events).await {
        SessionEvent::Error(message) => assert!(message.starts_with("read failed"), "{}", message),
        other => panic!("expected Error, got {:?}", other),
    }
    match next_event(&mut events).await {
        SessionEvent::Disconnected { reason } => {
            assert!(matches!(reason, DisconnectReason::ReadFailed(_)))
        }
        other => panic!("expected Disconnected, got {:?}", other),
    }
    wait_idle(&session).await;
    assert_eq!(platform.live_transports(), 0);

    let completion = session.start_listening().await.unwrap();
    let _peer = platform.peer_dial(PEER, SPP_UUID).unwrap();
    completion.await.unwrap();
    assert_eq!(session.role(), SessionRole::ServerConnected);
}

#[tokio::test]
async fn test_write_error_keeps_connection() {
    let platform = LoopbackPlatform::new();
    let (session, mut events) = session_with_events(&platform);

    let completion = session.start_listening().await.unwrap();
    platform.peer_connect(PEER, SPP_UUID, BrokenPipeOnWrite).unwrap();
    completion.await.unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Connected { .. }
    ));

    let err = session.send(b"hello").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WriteFailed);
    assert_eq!(session.role(), SessionRole::ServerConnected);
    assert_eq!(session.peer().as_deref(), Some(PEER));
    assert_eq!(platform.live_transports(), 1);
    assert_no_event(&mut events).await;

    // Retrying fails the same way without tearing anything down.
    assert_eq!(
        session.send(b"again").await.unwrap_err().kind(),
        ErrorKind::WriteFailed
    );
    assert_eq!(session.role(), SessionRole::ServerConnected);

    session.disconnect().await;
    assert_eq!(platform.live_transports(), 0);
    match next_event(&mut events).await {
        SessionEvent::Disconnected { reason } => assert_eq!(reason, DisconnectReason::Requested),
        other => panic!("expected Disconnected, got {:?}", other),
    }
}
