//! Shared helpers for integration tests
//!
//! `MockTransport` plays a scripted server in memory: it decodes every batch
//! the channel writes, answers the first auth frame of each connection
//! instance with a configurable notify code and echoes data events. It can
//! also be told to misbehave on its first connection instance.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use evtunnel::channel::{ChannelOptions, RemoteChannel};
use evtunnel::event::{Event, EventCodec, EventKind};
use evtunnel::session::SessionRegistry;
use evtunnel::transport::{RemoteTransport, TransportError};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub const SECRET: &[u8] = b"integration-secret";

pub fn codec() -> Arc<EventCodec> {
    Arc::new(EventCodec::new(SECRET).unwrap())
}

/// How the first connection instance answers its auth frame
#[derive(Debug, Clone, Copy)]
pub enum Misbehavior {
    /// A data event instead of the auth notification
    DataBeforeAuth,
    /// Bytes that do not open as a frame
    Garbage,
}

pub struct MockTransport {
    codec: Arc<EventCodec>,
    /// Notify code answering auth frames; `None` never answers
    auth_reply: Option<i32>,
    open_delay: Duration,
    read_timeout: Duration,
    misbehave: Option<Misbehavior>,

    iv: AtomicU64,
    authed: AtomicBool,
    closed: AtomicBool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    batches: Mutex<Vec<Vec<Event>>>,

    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    shutdown: Notify,
}

impl MockTransport {
    pub fn new(codec: Arc<EventCodec>, auth_reply: Option<i32>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            codec,
            auth_reply,
            open_delay: Duration::ZERO,
            read_timeout: Duration::from_secs(5),
            misbehave: None,
            iv: AtomicU64::new(0),
            authed: AtomicBool::new(false),
            closed: AtomicBool::new(true),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            batches: Mutex::new(Vec::new()),
            tx,
            rx: tokio::sync::Mutex::new(rx),
            shutdown: Notify::new(),
        }
    }

    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_misbehavior(mut self, misbehave: Misbehavior) -> Self {
        self.misbehave = Some(misbehave);
        self
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// IV of the latest connection instance
    pub fn iv(&self) -> u64 {
        self.iv.load(Ordering::SeqCst)
    }

    /// Every decoded batch written so far
    pub fn batches(&self) -> Vec<Vec<Event>> {
        self.batches.lock().unwrap().clone()
    }

    /// Number of heartbeat events received so far
    pub fn heartbeats(&self) -> usize {
        self.batches()
            .iter()
            .flatten()
            .filter(|e| matches!(e.kind, EventKind::Heartbeat))
            .count()
    }

    /// Simulate the server dropping the connection
    pub fn drop_connection(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    /// Answers the scripted server gives to `events`
    fn answer(&self, events: &[Event], authed: &AtomicBool) -> Vec<Event> {
        let mut replies = Vec::new();
        for event in events {
            match &event.kind {
                EventKind::Auth(_) => {
                    if let Some(code) = self.auth_reply {
                        if !authed.swap(true, Ordering::SeqCst) {
                            replies.push(Event::notify(code));
                        }
                    }
                }
                EventKind::Data(_) => replies.push(event.clone()),
                _ => {}
            }
        }
        replies
    }

    /// IVs carried by the auth frames written so far, in order
    pub fn auth_ivs(&self) -> Vec<u64> {
        self.batches()
            .iter()
            .flatten()
            .filter_map(|e| match &e.kind {
                EventKind::Auth(auth) => Some(auth.iv),
                _ => None,
            })
            .collect()
    }

    fn seal(&self, events: &[Event], iv: u64) -> Bytes {
        let mut out = BytesMut::new();
        self.codec.encrypt_all(events, iv, &mut out).unwrap();
        out.freeze()
    }
}

#[async_trait]
impl RemoteTransport for MockTransport {
    async fn open(&self, iv: u64) -> Result<(), TransportError> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }

        // Bytes meant for the previous connection instance are lost with it.
        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_ok() {}
        drop(rx);

        self.iv.store(iv, Ordering::SeqCst);
        self.authed.store(false, Ordering::SeqCst);
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let shutdown = self.shutdown.notified();

        let mut rx = self.rx.lock().await;
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let chunk = tokio::select! {
            res = tokio::time::timeout(self.read_timeout, rx.recv()) => {
                res.map_err(|_| TransportError::Timeout)?.ok_or(TransportError::Closed)?
            }
            _ = shutdown => return Err(TransportError::Closed),
        };

        // Chunks are small in tests; anything beyond `buf` is a test bug.
        assert!(chunk.len() <= buf.len(), "mock chunk exceeds read buffer");
        buf[..chunk.len()].copy_from_slice(&chunk);
        Ok(chunk.len())
    }

    async fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let iv = self.iv();
        let mut buf = BytesMut::from(data);
        let events = self
            .codec
            .decrypt_all(&mut buf, iv)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        assert!(buf.is_empty(), "channel wrote a partial frame");

        let replies = self.answer(&events, &self.authed);
        self.batches.lock().unwrap().push(events);
        if replies.is_empty() {
            return Ok(data.len());
        }

        let reply = match self.misbehave.filter(|_| self.opens() == 1) {
            Some(Misbehavior::DataBeforeAuth) => self.seal(&[Event::data(9, Bytes::from_static(b"early"))], iv),
            Some(Misbehavior::Garbage) => {
                let mut junk = vec![0u8, 0, 0, 40, 1];
                junk.extend_from_slice(&[0xAB; 40]);
                Bytes::from(junk)
            }
            None => self.seal(&replies, iv),
        };
        let _ = self.tx.send(reply);
        Ok(data.len())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    async fn request(&self, data: &[u8]) -> Result<Bytes, TransportError> {
        let mut buf = BytesMut::from(data);
        let auth = self
            .codec
            .decrypt(&mut buf, 0)
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let iv = match &auth.kind {
            EventKind::Auth(auth) => auth.iv,
            _ => return Err(TransportError::ConnectionFailed("request without auth".to_string())),
        };
        let mut events = vec![auth];
        events.extend(
            self.codec
                .decrypt_all(&mut buf, iv)
                .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?,
        );

        let replies = self.answer(&events, &AtomicBool::new(false));
        self.batches.lock().unwrap().push(events);
        Ok(self.seal(&replies, iv))
    }

    fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

/// Channel over `transport` whose dispatched events land in the returned receiver
pub fn channel(
    opts: ChannelOptions,
    transport: Arc<MockTransport>,
    sessions: Arc<SessionRegistry>,
) -> (RemoteChannel, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let channel = RemoteChannel::new(opts, transport, codec(), sessions, Arc::new(tx));
    (channel, rx)
}

/// Poll `cond` until it holds or `within` elapses
pub async fn eventually(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cond()
}
