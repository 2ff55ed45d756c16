//! Channel lifecycle tests against an in-memory scripted server
//!
//! Covers:
//! - the auth rendezvous in `init` (success, failure, timeout)
//! - auth joining on the first batch after connect
//! - heartbeat gating on active sessions
//! - reconnects with a fresh IV, including after protocol violations
//! - the direct-io request path

mod common;

use bytes::{Bytes, BytesMut};
use common::{channel, codec, eventually, Misbehavior, MockTransport};
use evtunnel::channel::{AuthState, ChannelError, ChannelFlags, ChannelOptions};
use evtunnel::event::{Event, EventKind, AUTH_FAILED, AUTH_SUCCESS};
use evtunnel::session::SessionRegistry;
use std::sync::Arc;
use std::time::Duration;

fn options(flags: ChannelFlags) -> ChannelOptions {
    ChannelOptions {
        user: "alice".to_string(),
        flags,
        heartbeat_interval: Duration::from_millis(50),
        ..ChannelOptions::new("mock:1", 0)
    }
}

fn open_join() -> ChannelFlags {
    ChannelFlags {
        open_join_auth: true,
        ..ChannelFlags::default()
    }
}

#[tokio::test]
async fn test_init_success_keeps_notify_private() {
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_SUCCESS)));
    let (channel, mut events) = channel(options(open_join()), transport.clone(), SessionRegistry::new());

    channel.init().await.unwrap();

    assert!(channel.is_running());
    assert_eq!(channel.auth_state(), AuthState::Success);
    assert_eq!(transport.opens(), 1);
    assert_eq!(channel.iv(), transport.iv());

    // The auth notification is consumed by the channel, never dispatched.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err());

    channel.stop().await;
}

#[tokio::test]
async fn test_init_twice_is_error() {
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_SUCCESS)));
    let (channel, _events) = channel(options(open_join()), transport, SessionRegistry::new());

    channel.init().await.unwrap();
    assert!(matches!(channel.init().await, Err(ChannelError::AlreadyInitialized)));
    channel.stop().await;
}

#[tokio::test]
async fn test_init_times_out_without_verdict() {
    let transport = Arc::new(MockTransport::new(codec(), None).with_read_timeout(Duration::from_millis(200)));
    let (channel, _events) = channel(options(open_join()), transport.clone(), SessionRegistry::new());

    let started = std::time::Instant::now();
    let res = channel.init().await;

    assert!(matches!(res, Err(ChannelError::AuthTimeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(!channel.is_running());
    assert!(transport.closes() >= 1);
}

#[tokio::test]
async fn test_init_auth_failed_stops_channel() {
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_FAILED)));
    let (channel, _events) = channel(options(open_join()), transport.clone(), SessionRegistry::new());

    let res = channel.init().await;

    assert!(matches!(res, Err(ChannelError::AuthFailed { .. })));
    assert_eq!(channel.auth_state(), AuthState::Failed);
    assert!(!channel.is_running());
    assert!(matches!(
        channel.write(Event::heartbeat()).await,
        Err(ChannelError::NotRunning)
    ));
}

#[tokio::test]
async fn test_init_unexpected_code() {
    let transport = Arc::new(MockTransport::new(codec(), Some(7)));
    let (channel, _events) = channel(options(open_join()), transport, SessionRegistry::new());

    let res = channel.init().await;
    assert!(matches!(res, Err(ChannelError::UnexpectedAuthCode { code: 7, .. })));
    assert!(!channel.is_running());
}

#[tokio::test]
async fn test_first_batch_joins_auth_and_payload() {
    // A slow connect lets the payload queue up before the first batch.
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_SUCCESS)).with_open_delay(Duration::from_millis(100)));
    let (channel, mut events) = channel(options(open_join()), transport.clone(), SessionRegistry::new());

    let init = tokio::spawn({
        let channel = channel.clone();
        async move { channel.init().await }
    });
    assert!(eventually(Duration::from_secs(1), || channel.is_running()).await);

    let payload = Event::data(11, Bytes::from_static(b"first"));
    channel.write(payload.clone()).await.unwrap();

    init.await.unwrap().unwrap();

    let iv = channel.iv();
    assert_eq!(iv, transport.iv());
    let batches = transport.batches();
    assert_eq!(batches[0], vec![Event::auth(0, iv, "alice"), payload.clone()]);

    // The echo arrives after the auth verdict and is dispatched.
    let echoed = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);

    channel.stop().await;
}

#[tokio::test]
async fn test_write_join_auth_prefixes_every_batch() {
    let flags = ChannelFlags {
        write_join_auth: true,
        ..ChannelFlags::default()
    };
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_SUCCESS)));
    let sessions = SessionRegistry::new();
    let (channel, mut events) = channel(options(flags), transport.clone(), sessions.clone());

    // Without open_join_auth nothing is written until the first event.
    let init = tokio::spawn({
        let channel = channel.clone();
        async move { channel.init().await }
    });
    assert!(eventually(Duration::from_secs(1), || transport.opens() == 1).await);
    channel.write_wake().await.unwrap();
    init.await.unwrap().unwrap();

    let _session = sessions.open_random().unwrap();
    for n in 0..2u8 {
        channel.write(Event::data(5, Bytes::from(vec![n]))).await.unwrap();
        events.recv().await.unwrap();
    }

    let batches = transport.batches();
    assert!(batches.len() >= 3);
    for batch in &batches {
        assert!(batch[0].is_auth());
    }

    channel.stop().await;
}

#[tokio::test]
async fn test_stale_embedded_auth_is_normalized() {
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_SUCCESS)));
    let (channel, _events) = channel(options(open_join()), transport.clone(), SessionRegistry::new());
    channel.init().await.unwrap();

    channel.write(Event::auth(0, 12345, "alice")).await.unwrap();
    assert!(eventually(Duration::from_secs(1), || transport.batches().len() >= 2).await);

    let iv = channel.iv();
    let embedded = transport.batches().concat().into_iter().skip(1).find(Event::is_auth).unwrap();
    assert_eq!(embedded, Event::auth(0, iv, "alice"));

    channel.stop().await;
}

#[tokio::test]
async fn test_write_raw_bypasses_queue() {
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_SUCCESS)));
    let (channel, _events) = channel(options(open_join()), transport.clone(), SessionRegistry::new());
    channel.init().await.unwrap();

    let mut raw = BytesMut::new();
    codec().encrypt(&Event::heartbeat(), channel.iv(), &mut raw).unwrap();
    assert_eq!(channel.write_raw(&raw).await.unwrap(), raw.len());
    assert_eq!(transport.batches().last().unwrap(), &vec![Event::heartbeat()]);

    channel.stop().await;
}

#[tokio::test]
async fn test_heartbeat_only_with_sessions() {
    let flags = ChannelFlags {
        open_join_auth: true,
        heartbeat: true,
        ..ChannelFlags::default()
    };
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_SUCCESS)));
    let sessions = SessionRegistry::new();
    let (channel, _events) = channel(options(flags), transport.clone(), sessions.clone());
    channel.init().await.unwrap();

    // Let anything sent during the handshake settle.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let idle = transport.heartbeats();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(transport.heartbeats(), idle);

    let session = sessions.open_random().unwrap();
    assert!(eventually(Duration::from_secs(1), || transport.heartbeats() > idle).await);

    drop(session);
    channel.stop().await;
}

#[tokio::test]
async fn test_reconnect_uses_fresh_iv() {
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_SUCCESS)));
    let sessions = SessionRegistry::new();
    let (channel, mut events) = channel(options(open_join()), transport.clone(), sessions.clone());
    channel.init().await.unwrap();
    let first_iv = channel.iv();

    let session = sessions.open_random().unwrap();
    transport.drop_connection();
    assert!(eventually(Duration::from_secs(3), || transport.opens() == 2).await);
    assert!(eventually(Duration::from_secs(3), || transport.batches().len() >= 2).await);

    let second_iv = channel.iv();
    assert_ne!(first_iv, second_iv);
    assert_eq!(transport.batches()[1][0], Event::auth(0, second_iv, "alice"));

    // The new connection instance authenticates again before carrying data.
    let payload = Event::data(session.id(), Bytes::from_static(b"again"));
    channel.write(payload.clone()).await.unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, payload);

    channel.stop().await;
}

async fn assert_recovers_from(misbehave: Misbehavior) {
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_SUCCESS)).with_misbehavior(misbehave));
    let (channel, mut events) = channel(options(open_join()), transport.clone(), SessionRegistry::new());

    // The first instance is dropped and the handshake completes on the next.
    channel.init().await.unwrap();
    assert_eq!(channel.auth_state(), AuthState::Success);
    assert_eq!(transport.opens(), 2);
    assert!(transport.closes() >= 1);

    let ivs = transport.auth_ivs();
    assert_eq!(ivs.len(), 2);
    assert_ne!(ivs[0], ivs[1]);
    assert_eq!(channel.iv(), ivs[1]);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(events.try_recv().is_err());

    channel.stop().await;
}

#[tokio::test]
async fn test_event_before_auth_notify_forces_reconnect() {
    assert_recovers_from(Misbehavior::DataBeforeAuth).await;
}

#[tokio::test]
async fn test_malformed_frame_forces_reconnect() {
    assert_recovers_from(Misbehavior::Garbage).await;
}

#[tokio::test]
async fn test_request_unexpected_code_is_error() {
    let flags = ChannelFlags {
        direct_io: true,
        ..ChannelFlags::default()
    };
    let transport = Arc::new(MockTransport::new(codec(), Some(7)));
    let (channel, _events) = channel(options(flags), transport, SessionRegistry::new());

    let res = channel.request(Event::data(3, Bytes::from_static(b"rpc"))).await;
    assert!(matches!(res, Err(ChannelError::UnexpectedAuthCode { code: 7, .. })));
}

#[tokio::test]
async fn test_idle_channel_does_not_reconnect() {
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_SUCCESS)));
    let (channel, _events) = channel(options(open_join()), transport.clone(), SessionRegistry::new());
    channel.init().await.unwrap();

    transport.drop_connection();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(transport.opens(), 1);

    channel.stop().await;
}

#[tokio::test]
async fn test_direct_io_request() {
    let flags = ChannelFlags {
        direct_io: true,
        ..ChannelFlags::default()
    };
    let transport = Arc::new(MockTransport::new(codec(), Some(AUTH_SUCCESS)));
    let (channel, _events) = channel(options(flags), transport.clone(), SessionRegistry::new());

    channel.init().await.unwrap();
    assert_eq!(channel.auth_state(), AuthState::Success);
    assert_eq!(transport.opens(), 0);

    let request = Event::data(3, Bytes::from_static(b"rpc"));
    let response = channel.request(request.clone()).await.unwrap();
    assert_eq!(response, request);

    // Every request carries its own auth frame under a fresh IV.
    let batches = transport.batches();
    let (EventKind::Auth(first), EventKind::Auth(second)) = (&batches[0][0].kind, &batches[1][0].kind) else {
        panic!("requests must start with an auth frame");
    };
    assert_ne!(first.iv, second.iv);

    assert!(channel.write(Event::heartbeat()).await.is_err());
}
