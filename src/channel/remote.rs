//! A single remote channel
//!
//! Owns one physical connection and runs three tasks over it:
//! - the write loop drains the outbound queue in batches, joins auth frames
//!   and seals everything under the connection IV
//! - the read loop (re)connects with a fresh IV, decodes inbound frames and
//!   gates dispatch on the auth notification of the connection instance
//! - the optional heartbeat task keeps the connection alive while sessions
//!   exist
//!
//! Field ownership between the tasks:
//! - `iv`: written by the read loop on connect, read by everyone else
//! - `sent_events`: reset by the read loop on connect, advanced by the write loop
//! - `auth`: published by the read loop, awaited by `init`
//! - `running`: published by `init` and `stop`, observed by all loops

use super::{AuthState, ChannelError, ChannelOptions, EventHandler};
use crate::crypto::random_iv;
use crate::event::{CodecError, Event, EventCodec, EventKind};
use crate::protocol::{CLOSED_WRITE_RETRY, IDLE_BACKOFF, READ_BUFFER_SIZE, RECONNECT_BACKOFF};
use crate::session::SessionRegistry;
use crate::transport::{RemoteTransport, TransportError};
use bytes::BytesMut;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

/// Item of the outbound queue; `None` only wakes the writer
type WriteItem = Option<Event>;

/// Handle to a remote channel; clones share the same connection
#[derive(Clone)]
pub struct RemoteChannel {
    inner: Arc<Inner>,
}

struct Inner {
    opts: ChannelOptions,
    transport: Arc<dyn RemoteTransport>,
    codec: Arc<EventCodec>,
    sessions: Arc<SessionRegistry>,
    handler: Arc<dyn EventHandler>,

    running: watch::Sender<bool>,
    auth: watch::Sender<AuthState>,
    iv: AtomicU64,
    sent_events: AtomicU32,

    write_tx: mpsc::Sender<WriteItem>,
    /// Taken by the write loop when `init` starts it
    write_rx: Mutex<Option<mpsc::Receiver<WriteItem>>>,
}

/// What the read loop does after handling one event
enum Flow {
    Continue,
    Close,
}

impl RemoteChannel {
    /// Create a channel; nothing runs until `init`
    pub fn new(
        opts: ChannelOptions,
        transport: Arc<dyn RemoteTransport>,
        codec: Arc<EventCodec>,
        sessions: Arc<SessionRegistry>,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel(opts.write_queue_capacity.max(1));
        let (running, _) = watch::channel(false);
        let (auth, _) = watch::channel(AuthState::Pending);

        Self {
            inner: Arc::new(Inner {
                opts,
                transport,
                codec,
                sessions,
                handler,
                running,
                auth,
                iv: AtomicU64::new(0),
                sent_events: AtomicU32::new(0),
                write_tx,
                write_rx: Mutex::new(Some(write_rx)),
            }),
        }
    }

    pub fn index(&self) -> i64 {
        self.inner.opts.index
    }

    pub fn addr(&self) -> &str {
        &self.inner.opts.addr
    }

    /// IV of the current connection instance (0 before the first connect)
    pub fn iv(&self) -> u64 {
        self.inner.iv.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn auth_state(&self) -> AuthState {
        *self.inner.auth.borrow()
    }

    /// Events written since the current connection was opened
    pub fn sent_events(&self) -> u32 {
        self.inner.sent_events.load(Ordering::Acquire)
    }

    /// Start the channel and wait for the server's auth verdict
    ///
    /// Fails with `AuthTimeout` if no verdict arrives within the transport's
    /// read timeout. Every failure leaves the channel stopped.
    pub async fn init(&self) -> Result<(), ChannelError> {
        let inner = &self.inner;
        if inner.is_running() {
            return Err(ChannelError::AlreadyInitialized);
        }

        if inner.opts.flags.direct_io {
            inner.running.send_replace(true);
            inner.auth.send_replace(AuthState::Pending);
            return self.init_direct().await;
        }

        // The read loop only connects while sessions exist.
        let _handshake_session = inner.sessions.open_random()?;

        let write_rx = inner
            .write_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ChannelError::AlreadyInitialized)?;

        inner.running.send_replace(true);
        inner.auth.send_replace(AuthState::Pending);
        let mut auth_rx = inner.auth.subscribe();

        tokio::spawn(Arc::clone(inner).write_loop(write_rx));
        tokio::spawn(Arc::clone(inner).read_loop());
        if inner.opts.flags.heartbeat {
            tokio::spawn(Arc::clone(inner).heartbeat_loop());
        }

        let start = Instant::now();
        let auth_timeout = inner.transport.read_timeout();
        let verdict = tokio::time::timeout(auth_timeout, auth_rx.wait_for(|s| !s.is_pending()))
            .await
            .map(|res| res.map(|state| *state));

        match verdict {
            Ok(Ok(state)) => self.settle(state, start.elapsed()).await,
            Ok(Err(_)) => Err(ChannelError::NotRunning),
            Err(_) => {
                self.stop().await;
                Err(ChannelError::AuthTimeout {
                    addr: inner.opts.addr.clone(),
                    elapsed: start.elapsed(),
                })
            }
        }
    }

    /// Handshake for direct-IO channels: one auth request, one notification back
    async fn init_direct(&self) -> Result<(), ChannelError> {
        let inner = &self.inner;
        let start = Instant::now();

        let iv = random_iv()?;
        inner.iv.store(iv, Ordering::Release);

        let mut buf = BytesMut::new();
        inner.codec.encrypt(&inner.auth_event(iv), 0, &mut buf)?;

        let response = match inner.transport.request(&buf).await {
            Ok(response) => response,
            Err(e) => {
                self.stop().await;
                return Err(e.into());
            }
        };
        let mut response = BytesMut::from(&response[..]);
        let verdict = inner.codec.decrypt(&mut response, iv).and_then(|ev| {
            ev.notify_code().map(AuthState::from_code).ok_or_else(|| {
                CodecError::Malformed(format!("expected auth notification, got {:?}", ev.event_type()))
            })
        });

        match verdict {
            Ok(state) => {
                inner.auth.send_replace(state);
                self.settle(state, start.elapsed()).await
            }
            Err(e) => {
                self.stop().await;
                Err(e.into())
            }
        }
    }

    async fn settle(&self, state: AuthState, elapsed: Duration) -> Result<(), ChannelError> {
        let addr = self.inner.opts.addr.clone();
        match state {
            AuthState::Success => {
                info!(index = self.index(), %addr, ?elapsed, "server authed success");
                Ok(())
            }
            AuthState::Failed => {
                self.stop().await;
                Err(ChannelError::AuthFailed { addr })
            }
            AuthState::Unexpected(code) => {
                self.stop().await;
                Err(ChannelError::UnexpectedAuthCode { addr, code })
            }
            AuthState::Pending => Err(ChannelError::AuthTimeout { addr, elapsed }),
        }
    }

    /// Queue an event for the write loop
    ///
    /// Waits while the queue is full.
    pub async fn write(&self, event: Event) -> Result<(), ChannelError> {
        self.inner.enqueue(Some(event)).await
    }

    /// Wake the write loop without payload, flushing a pending auth frame
    pub async fn write_wake(&self) -> Result<(), ChannelError> {
        self.inner.enqueue(None).await
    }

    /// Write bytes straight to the transport, bypassing the queue
    pub async fn write_raw(&self, data: &[u8]) -> Result<usize, ChannelError> {
        Ok(self.inner.transport.write(data).await?)
    }

    /// Synchronous round trip through the transport's request primitive
    ///
    /// Each request is sealed under its own fresh IV, independent of the
    /// streaming connection.
    pub async fn request(&self, event: Event) -> Result<Event, ChannelError> {
        let inner = &self.inner;
        let iv = random_iv()?;

        let mut buf = BytesMut::new();
        inner.codec.encrypt(&inner.auth_event(iv), 0, &mut buf)?;
        inner.codec.encrypt(&event, iv, &mut buf)?;

        let response = inner.transport.request(&buf).await?;
        let mut response = BytesMut::from(&response[..]);
        if response.is_empty() {
            return Err(ChannelError::EmptyResponse);
        }

        let first = inner.codec.decrypt(&mut response, iv)?;
        let addr = inner.opts.addr.clone();
        match first.notify_code().map(AuthState::from_code) {
            Some(AuthState::Failed) => Err(ChannelError::AuthFailed { addr }),
            Some(AuthState::Unexpected(code)) => Err(ChannelError::UnexpectedAuthCode { addr, code }),
            Some(AuthState::Pending) => Err(ChannelError::UnexpectedAuthCode { addr, code: 0 }),
            Some(AuthState::Success) if !response.is_empty() => {
                Ok(inner.codec.decrypt(&mut response, iv)?)
            }
            _ => Ok(first),
        }
    }

    /// Stop all loops and close the connection
    pub async fn stop(&self) {
        let was_running = self.inner.running.send_replace(false);
        self.inner.transport.close().await;
        if was_running {
            info!(index = self.index(), addr = %self.addr(), "channel stopped");
        }
    }
}

impl Inner {
    fn is_running(&self) -> bool {
        *self.running.borrow()
    }

    fn auth_event(&self, iv: u64) -> Event {
        Event::auth(self.opts.index, iv, self.opts.user.clone())
    }

    async fn enqueue(&self, item: WriteItem) -> Result<(), ChannelError> {
        if self.opts.flags.direct_io {
            return Err(TransportError::Unsupported("queued writes on a direct-io channel").into());
        }
        if !self.is_running() {
            return Err(ChannelError::NotRunning);
        }
        self.write_tx
            .send(item)
            .await
            .map_err(|_| ChannelError::NotRunning)
    }

    /// Sleep for `duration`, returning early once the channel stops
    async fn pause(&self, duration: Duration) {
        let mut running = self.running.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = running.wait_for(|r| !*r) => {}
        }
    }

    async fn write_loop(self: Arc<Self>, mut rx: mpsc::Receiver<WriteItem>) {
        let mut running = self.running.subscribe();
        let mut batch: Vec<Event> = Vec::new();

        loop {
            if batch.is_empty() {
                let first = tokio::select! {
                    item = rx.recv() => item,
                    _ = running.wait_for(|r| !*r) => None,
                };
                match first {
                    Some(Some(event)) => batch.push(event),
                    Some(None) => {}
                    None => break,
                }
                while let Ok(item) = rx.try_recv() {
                    batch.extend(item);
                }
            }

            if !self.is_running() {
                break;
            }
            if self.transport.is_closed() {
                self.pause(CLOSED_WRITE_RETRY).await;
                continue;
            }

            self.flush(&mut batch).await;
            batch.clear();
        }

        debug!(index = self.opts.index, dropped = batch.len(), "write loop stopped");
    }

    /// Seal and write one batch; a failed write closes the connection and drops the batch
    async fn flush(&self, batch: &mut [Event]) {
        let flags = self.opts.flags;
        let iv = self.iv.load(Ordering::Acquire);
        let mut buf = BytesMut::new();
        let mut sealed = 0u32;

        if flags.write_join_auth
            || (flags.open_join_auth && self.sent_events.load(Ordering::Acquire) == 0)
        {
            match self.codec.encrypt(&self.auth_event(iv), 0, &mut buf) {
                Ok(()) => sealed += 1,
                Err(e) => error!(index = self.opts.index, "failed to seal auth frame: {}", e),
            }
        }

        for event in batch.iter_mut() {
            // Auth frames always travel under the universal key.
            let key = match &mut event.kind {
                EventKind::Auth(auth) => {
                    if auth.iv != iv {
                        warn!(
                            index = self.opts.index,
                            stale = auth.iv,
                            current = iv,
                            "auth event carried a stale IV"
                        );
                        auth.iv = iv;
                    }
                    0
                }
                _ => iv,
            };
            match self.codec.encrypt(event, key, &mut buf) {
                Ok(()) => sealed += 1,
                Err(e) => error!(index = self.opts.index, "failed to seal event: {}", e),
            }
        }
        self.sent_events.fetch_add(sealed, Ordering::AcqRel);

        if buf.is_empty() {
            return;
        }

        let start = Instant::now();
        match self.transport.write(&buf).await {
            Ok(_) => debug!(
                index = self.opts.index,
                addr = %self.opts.addr,
                elapsed = ?start.elapsed(),
                events = sealed,
                "batch written"
            ),
            Err(e) => {
                warn!(index = self.opts.index, addr = %self.opts.addr, "failed to write batch: {}", e);
                self.transport.close().await;
            }
        }
    }

    async fn read_loop(self: Arc<Self>) {
        let mut chunk = vec![0u8; READ_BUFFER_SIZE];

        while self.is_running() {
            if self.transport.is_closed() {
                if self.sessions.is_empty() {
                    self.pause(IDLE_BACKOFF).await;
                    continue;
                }

                let iv = match random_iv() {
                    Ok(iv) => iv,
                    Err(e) => {
                        error!("failed to generate IV: {}", e);
                        self.pause(RECONNECT_BACKOFF).await;
                        continue;
                    }
                };
                self.iv.store(iv, Ordering::Release);
                self.sent_events.store(0, Ordering::Release);

                if let Err(e) = self.transport.open(iv).await {
                    warn!(index = self.opts.index, addr = %self.opts.addr, "connect failed: {}", e);
                    self.pause(RECONNECT_BACKOFF).await;
                    continue;
                }
                info!(index = self.opts.index, addr = %self.opts.addr, "connected");

                if self.opts.flags.open_join_auth && self.enqueue(None).await.is_err() {
                    break;
                }
            }

            self.read_connection(&mut chunk).await;
        }

        debug!(index = self.opts.index, "read loop stopped");
    }

    /// Read and dispatch until the current connection instance fails
    async fn read_connection(&self, chunk: &mut [u8]) {
        let iv = self.iv.load(Ordering::Acquire);
        let mut authed = false;
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        loop {
            let n = match self.transport.read(chunk).await {
                Ok(n) => n,
                Err(e) => {
                    match e {
                        TransportError::Closed | TransportError::Timeout => {
                            debug!(index = self.opts.index, "connection ended: {}", e)
                        }
                        _ => warn!(index = self.opts.index, "failed to read channel: {}", e),
                    }
                    self.transport.close().await;
                    return;
                }
            };
            buf.extend_from_slice(&chunk[..n]);

            while !buf.is_empty() {
                match self.codec.decrypt(&mut buf, iv) {
                    Ok(event) => {
                        if let Flow::Close = self.on_event(event, &mut authed).await {
                            self.transport.close().await;
                            return;
                        }
                    }
                    Err(e) if e.is_need_more() => break,
                    Err(e) => {
                        warn!(index = self.opts.index, "failed to decode event: {}", e);
                        self.transport.close().await;
                        return;
                    }
                }
            }
        }
    }

    async fn on_event(&self, event: Event, authed: &mut bool) -> Flow {
        if *authed {
            trace!(index = self.opts.index, kind = ?event.event_type(), "dispatching event");
            self.handler.handle_event(event);
            return Flow::Continue;
        }

        let Some(code) = event.notify_code() else {
            warn!(
                index = self.opts.index,
                "expected auth result before {:?} event",
                event.event_type()
            );
            return Flow::Close;
        };

        let state = AuthState::from_code(code);
        match state {
            AuthState::Pending => Flow::Continue,
            AuthState::Success => {
                *authed = true;
                self.auth.send_replace(state);
                Flow::Continue
            }
            AuthState::Failed | AuthState::Unexpected(_) => {
                error!(index = self.opts.index, addr = %self.opts.addr, ?state, "auth rejected");
                self.auth.send_replace(state);
                self.running.send_replace(false);
                Flow::Close
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.opts.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        let mut running = self.running.subscribe();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = running.wait_for(|r| !*r) => break,
            }
            if self.transport.is_closed() || self.sessions.is_empty() {
                continue;
            }
            if self.enqueue(Some(Event::heartbeat())).await.is_err() {
                break;
            }
        }

        debug!(index = self.opts.index, "heartbeat stopped");
    }
}
