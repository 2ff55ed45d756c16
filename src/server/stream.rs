//! TCP server for persistent client channels
//!
//! Each accepted connection gets a reader that feeds the request processor
//! and, once authenticated, a pusher task draining the connection's event
//! queue. Auth notifications bypass the queue so they always precede queued
//! events sealed under the same IV. Queues left behind by clients that never
//! come back are swept once they sit idle for a pull window.

use super::{
    write_events, ConnContext, ConnId, EventQueueTable, PullOptions, QueueError, RequestHandler, RequestProcessor,
    ServerError, SessionTable,
};
use crate::config::ServerConfig;
use crate::event::{Event, EventCodec};
use crate::protocol::{PUBLISH_TIMEOUT, READ_BUFFER_SIZE};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// Server state shared across connections
pub struct Server {
    processor: Arc<RequestProcessor>,
    queues: Arc<EventQueueTable>,
    /// Connection semaphore for limiting concurrent connections
    conn_limit: Arc<Semaphore>,
    pull: PullOptions,
}

impl Server {
    pub fn new(
        processor: Arc<RequestProcessor>,
        queues: Arc<EventQueueTable>,
        max_connections: usize,
        pull: PullOptions,
    ) -> Self {
        Self {
            processor,
            queues,
            conn_limit: Arc::new(Semaphore::new(max_connections.max(1))),
            pull,
        }
    }

    /// Build a server from its configuration section
    pub fn from_config(config: &ServerConfig, handler: Arc<dyn RequestHandler>) -> crate::Result<Self> {
        let codec = Arc::new(EventCodec::new(&config.secret_bytes()?)?);
        let processor = Arc::new(RequestProcessor::new(
            codec,
            handler,
            config.allowed_users.iter().cloned(),
        ));
        let queues = EventQueueTable::new(config.queue_capacity);

        Ok(Self::new(processor, queues, config.max_connections, config.pull_options()))
    }

    pub fn processor(&self) -> &Arc<RequestProcessor> {
        &self.processor
    }

    pub fn queues(&self) -> &Arc<EventQueueTable> {
        &self.queues
    }

    pub fn sessions(&self) -> &SessionTable {
        self.processor.sessions()
    }

    /// Request/response entry point sharing this server's processor and queues
    pub fn invoker(&self, pull: PullOptions) -> super::Invoker {
        super::Invoker::new(Arc::clone(&self.processor), Arc::clone(&self.queues), pull)
    }

    /// Accept connections until the listener fails
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("Listening on {}", listener.local_addr()?);
        tokio::spawn(sweep_idle_queues(Arc::downgrade(&self.queues), self.pull.window));

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };

            let permit = match Arc::clone(&self.conn_limit).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("Connection limit reached, dropping {}", peer);
                    continue;
                }
            };

            debug!("New connection from {}", peer);
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream, peer).await {
                    debug!("Connection error from {}: {}", peer, e);
                }
                drop(permit);
            });
        }
    }

    /// Serve one client channel until it disconnects or misbehaves
    pub async fn serve_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
        stream.set_nodelay(true).ok();
        let (mut reader, writer) = stream.into_split();
        let writer: SharedWriter = Arc::new(Mutex::new(writer));

        let mut ctx = ConnContext::default();
        let mut pusher: Option<Pusher> = None;
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        let result = loop {
            match reader.read_buf(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(_) => {}
                Err(e) => break Err(e.into()),
            }

            let prev = ctx.clone();
            let responses = match self.processor.process(&mut buf, &mut ctx) {
                Ok(responses) => responses,
                Err(e) => break Err(e),
            };

            if ctx.rejected {
                let codec = self.processor.codec();
                let mut w = writer.lock().await;
                if let Err(e) = write_events(&mut *w, codec, ctx.iv, &responses).await {
                    debug!(%peer, "failed to deliver auth rejection: {}", e);
                }
                break Ok(());
            }

            if let Err(e) = self.dispatch(responses, &ctx, &prev, &writer, &mut pusher).await {
                break Err(e);
            }
        };

        // A clean EOF lets the pusher flush what the last request queued.
        if let Some(pusher) = pusher.take() {
            if result.is_ok() {
                pusher.finish().await;
            } else {
                pusher.abort();
            }
        }
        if let Some(owner) = owner(&ctx) {
            let closed = self.sessions().close_by_iv(&owner, ctx.iv);
            trace!(%peer, closed, "sessions closed with connection");
        }
        writer.lock().await.shutdown().await.ok();

        match &ctx.conn_id() {
            Some(id) => info!(conn = %id, %peer, "connection ended"),
            None => debug!(%peer, "connection ended before auth"),
        }
        result
    }

    /// Deliver the responses of one processed read
    async fn dispatch(
        &self,
        responses: Vec<Event>,
        ctx: &ConnContext,
        prev: &ConnContext,
        writer: &SharedWriter,
        pusher: &mut Option<Pusher>,
    ) -> Result<(), ServerError> {
        let codec = self.processor.codec();
        let (notifies, events): (Vec<Event>, Vec<Event>) =
            responses.into_iter().partition(|e| e.notify_code().is_some());

        if !notifies.is_empty() {
            let mut w = writer.lock().await;
            write_events(&mut *w, codec, ctx.iv, &notifies).await?;
        }

        let Some(id) = ctx.conn_id() else {
            return Ok(());
        };

        // A new IV is a new connection instance; its pusher seals under the new IV.
        if ctx.iv != prev.iv || pusher.is_none() {
            if let Some(old) = pusher.take() {
                old.abort();
            }
            if let Some(previous) = owner(prev).filter(|_| prev.iv != ctx.iv) {
                self.sessions().close_by_iv(&previous, prev.iv);
            }
            *pusher = Pusher::spawn(
                &self.queues,
                &id,
                Arc::clone(codec),
                ctx.iv,
                Arc::clone(writer),
                self.pull,
            );
        }

        for event in events {
            if let Err(e) = self.queues.publish(&id, event, PUBLISH_TIMEOUT).await {
                warn!(conn = %id, "dropping response: {}", e);
            }
        }
        Ok(())
    }
}

/// Identity the sessions of `ctx` were opened under, even after a later refusal
fn owner(ctx: &ConnContext) -> Option<ConnId> {
    (ctx.iv != 0).then(|| ConnId {
        user: ctx.user.clone(),
        index: ctx.index,
    })
}

async fn sweep_idle_queues(queues: Weak<EventQueueTable>, idle: Duration) {
    let mut ticker = tokio::time::interval(idle.max(Duration::from_millis(10)));
    loop {
        ticker.tick().await;
        let Some(queues) = queues.upgrade() else {
            return;
        };
        let swept = queues.sweep(idle);
        if swept > 0 {
            debug!(swept, "idle event queues dropped");
        }
    }
}

/// Task draining one connection's queue to its socket
struct Pusher {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Pusher {
    fn spawn(
        queues: &Arc<EventQueueTable>,
        id: &ConnId,
        codec: Arc<EventCodec>,
        iv: u64,
        writer: SharedWriter,
        opts: PullOptions,
    ) -> Option<Self> {
        let queue = queues.acquire(id, true)?;
        let (stop, stop_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            push_loop(&queue, &codec, iv, &writer, stop_rx, &opts).await;
            trace!(conn = %queue.id(), "pusher stopped");
        });
        Some(Self { stop, task })
    }

    /// Drain what is already queued, then stop
    async fn finish(self) {
        self.stop.send_replace(true);
        self.task.await.ok();
    }

    fn abort(self) {
        self.task.abort();
    }
}

async fn push_loop(
    queue: &super::EventQueue,
    codec: &EventCodec,
    iv: u64,
    writer: &SharedWriter,
    mut stop: watch::Receiver<bool>,
    opts: &PullOptions,
) {
    loop {
        let stopping = *stop.borrow_and_update();
        let wait = if stopping {
            Duration::ZERO
        } else {
            opts.peek_timeout
        };

        let peeked = tokio::select! {
            res = queue.peek_multi(opts.batch, wait) => res,
            changed = stop.changed(), if !stopping => {
                if changed.is_err() {
                    return;
                }
                continue;
            }
        };

        match peeked {
            Ok(events) => {
                let mut w = writer.lock().await;
                if let Err(e) = write_events(&mut *w, codec, iv, &events).await {
                    warn!("push write error: {}", e);
                    return;
                }
                drop(w);
                queue.discard_peeks();
            }
            Err(QueueError::Closed) => return,
            Err(_) if stopping => return,
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, AUTH_FAILED, AUTH_SUCCESS};
    use bytes::Bytes;

    struct Echo;

    impl RequestHandler for Echo {
        fn handle(&self, _ctx: &ConnContext, event: Event) -> Vec<Event> {
            match event.kind {
                EventKind::Data(_) => vec![event],
                _ => Vec::new(),
            }
        }
    }

    async fn start(allowed: &[&str]) -> (Arc<Server>, SocketAddr, Arc<EventCodec>) {
        start_with(allowed, PullOptions::default()).await
    }

    async fn start_with(allowed: &[&str], pull: PullOptions) -> (Arc<Server>, SocketAddr, Arc<EventCodec>) {
        let codec = Arc::new(EventCodec::new(b"stream-secret").unwrap());
        let processor = Arc::new(RequestProcessor::new(
            codec.clone(),
            Arc::new(Echo),
            allowed.iter().map(|u| u.to_string()),
        ));
        let server = Arc::new(Server::new(processor, EventQueueTable::new(16), 8, pull));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::clone(&server).run(listener));
        (server, addr, codec)
    }

    async fn round_trip(addr: SocketAddr, body: &[u8]) -> BytesMut {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(body).await.unwrap();
        stream.shutdown().await.unwrap();

        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        BytesMut::from(&out[..])
    }

    #[tokio::test]
    async fn test_notify_precedes_queued_echo() {
        let (server, addr, codec) = start(&[]).await;

        let mut body = BytesMut::new();
        codec.encrypt(&Event::auth(3, 99, "alice"), 0, &mut body).unwrap();
        codec
            .encrypt(&Event::data(5, Bytes::from_static(b"hello")), 99, &mut body)
            .unwrap();

        let mut out = round_trip(addr, &body).await;
        let events = codec.decrypt_all(&mut out, 99).unwrap();
        assert_eq!(
            events,
            vec![
                Event::notify(AUTH_SUCCESS),
                Event::data(5, Bytes::from_static(b"hello"))
            ]
        );

        // Sessions of the connection are gone once it ends.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let alice = ConnId {
            user: "alice".to_string(),
            index: 3,
        };
        assert!(!server.sessions().contains(&alice, 5));
    }

    #[tokio::test]
    async fn test_orphaned_queue_is_swept() {
        let pull = PullOptions {
            window: Duration::from_millis(50),
            ..PullOptions::default()
        };
        let (server, _addr, _codec) = start_with(&[], pull).await;

        for index in 0..10 {
            let id = ConnId {
                user: "gone".to_string(),
                index,
            };
            server
                .queues()
                .publish(&id, Event::data(1, Bytes::from_static(b"late")), Duration::from_millis(10))
                .await
                .unwrap();
        }
        assert_eq!(server.queues().len(), 10);

        let mut drained = false;
        for _ in 0..100 {
            if server.queues().is_empty() {
                drained = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(drained);
    }

    #[tokio::test]
    async fn test_rejected_user_gets_failure_notify() {
        let (_server, addr, codec) = start(&["bob"]).await;

        let mut body = BytesMut::new();
        codec.encrypt(&Event::auth(0, 99, "mallory"), 0, &mut body).unwrap();

        let mut out = round_trip(addr, &body).await;
        let events = codec.decrypt_all(&mut out, 99).unwrap();
        assert_eq!(events, vec![Event::notify(AUTH_FAILED)]);
    }

    #[tokio::test]
    async fn test_data_before_auth_closes_connection() {
        let (_server, addr, codec) = start(&[]).await;

        let mut body = BytesMut::new();
        codec
            .encrypt(&Event::data(1, Bytes::from_static(b"x")), 0, &mut body)
            .unwrap();

        let out = round_trip(addr, &body).await;
        assert!(out.is_empty());
    }
}
