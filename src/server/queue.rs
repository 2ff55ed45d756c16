//! Per-connection outbound event queues
//!
//! Delivery is acknowledged in two steps: `peek_multi` hands out copies of
//! the oldest events without removing them, `discard_peeks` removes what the
//! last peek returned. A peek that is never discarded is repeated by the next
//! one, so a failed write never loses events.

use super::ConnId;
use crate::event::Event;
use std::collections::{HashMap, VecDeque};
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Queue errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("No event within timeout")]
    Timeout,

    #[error("Queue full")]
    Full,

    #[error("Queue closed")]
    Closed,
}

struct QueueState {
    events: VecDeque<Event>,
    /// Number of front events handed out by the last peek
    peeked: usize,
    closed: bool,
}

/// Bounded FIFO of events waiting for delivery to one connection
pub struct EventQueue {
    state: Mutex<QueueState>,
    readable: Notify,
    writable: Notify,
    capacity: usize,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                events: VecDeque::new(),
                peeked: 0,
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append without waiting
    pub fn try_publish(&self, event: Event) -> Result<(), QueueError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            if state.events.len() >= self.capacity {
                return Err(QueueError::Full);
            }
            state.events.push_back(event);
        }
        self.readable.notify_waiters();
        Ok(())
    }

    /// Append, waiting up to `timeout` for room
    pub async fn publish(&self, event: Event, timeout: Duration) -> Result<(), QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if state.events.len() < self.capacity {
                    state.events.push_back(event);
                    drop(state);
                    self.readable.notify_waiters();
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::Full);
            }
        }
    }

    /// Copy up to `max` of the oldest events, waiting up to `timeout` for one
    ///
    /// The events stay queued until `discard_peeks`.
    pub async fn peek_multi(&self, max: usize, timeout: Duration) -> Result<Vec<Event>, QueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if !state.events.is_empty() {
                    let n = max.max(1).min(state.events.len());
                    state.peeked = n;
                    return Ok(state.events.iter().take(n).cloned().collect());
                }
                if state.closed {
                    return Err(QueueError::Closed);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(QueueError::Timeout);
            }
        }
    }

    /// Remove the events returned by the last peek
    pub fn discard_peeks(&self) -> usize {
        let discarded = {
            let mut state = self.lock();
            let n = state.peeked.min(state.events.len());
            state.events.drain(..n);
            state.peeked = 0;
            n
        };
        if discarded > 0 {
            self.writable.notify_waiters();
        }
        discarded
    }

    /// Refuse further publishes; pending events can still be drained
    pub fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().events.is_empty()
    }
}

struct Entry {
    queue: Arc<EventQueue>,
    refs: usize,
    /// Last time a handle was taken or released
    touched: Instant,
}

/// Event queues keyed by connection id
///
/// Queues are handed out as reference-counted `QueueHandle`s. An entry is
/// dropped once no handle refers to it and it holds no events. Entries left
/// holding events with no handle are reclaimed by `sweep`.
pub struct EventQueueTable {
    queues: Mutex<HashMap<ConnId, Entry>>,
    capacity: usize,
}

impl EventQueueTable {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queues: Mutex::new(HashMap::new()),
            capacity,
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnId, Entry>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up the queue of `id`, creating it if `create` is set
    pub fn acquire(self: &Arc<Self>, id: &ConnId, create: bool) -> Option<QueueHandle> {
        let mut queues = self.lock();
        if !create && !queues.contains_key(id) {
            return None;
        }
        let entry = queues.entry(id.clone()).or_insert_with(|| Entry {
            queue: Arc::new(EventQueue::new(self.capacity)),
            refs: 0,
            touched: Instant::now(),
        });
        entry.refs += 1;
        entry.touched = Instant::now();

        Some(QueueHandle {
            table: Arc::clone(self),
            id: id.clone(),
            queue: Arc::clone(&entry.queue),
        })
    }

    /// Queue `event` for `id`, creating the queue on demand
    pub async fn publish(self: &Arc<Self>, id: &ConnId, event: Event, timeout: Duration) -> Result<(), QueueError> {
        match self.acquire(id, true) {
            Some(queue) => queue.publish(event, timeout).await,
            None => Err(QueueError::Closed),
        }
    }

    /// Drop the queue of `id` regardless of pending events
    pub fn remove(&self, id: &ConnId) -> bool {
        match self.lock().remove(id) {
            Some(entry) => {
                entry.queue.close();
                true
            }
            None => false,
        }
    }

    /// Drop every queue nobody has held for at least `idle`
    ///
    /// Pending events of a dropped queue are lost with it.
    pub fn sweep(&self, idle: Duration) -> usize {
        let mut queues = self.lock();
        let before = queues.len();
        queues.retain(|id, entry| {
            if entry.refs > 0 || entry.touched.elapsed() < idle {
                return true;
            }
            debug!(conn = %id, pending = entry.queue.len(), "idle event queue dropped");
            entry.queue.close();
            false
        });
        before - queues.len()
    }

    pub fn contains(&self, id: &ConnId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn release(&self, id: &ConnId, queue: &Arc<EventQueue>) {
        let mut queues = self.lock();
        let Some(entry) = queues.get_mut(id) else {
            return;
        };
        // The entry may have been removed and recreated since this handle was taken.
        if !Arc::ptr_eq(&entry.queue, queue) {
            return;
        }
        entry.refs = entry.refs.saturating_sub(1);
        entry.touched = Instant::now();
        if entry.refs == 0 && entry.queue.is_empty() {
            queues.remove(id);
            debug!(conn = %id, "event queue released");
        }
    }
}

/// Counted reference to a connection's queue, released on drop
pub struct QueueHandle {
    table: Arc<EventQueueTable>,
    id: ConnId,
    queue: Arc<EventQueue>,
}

impl QueueHandle {
    pub fn id(&self) -> &ConnId {
        &self.id
    }
}

impl Deref for QueueHandle {
    type Target = EventQueue;

    fn deref(&self) -> &EventQueue {
        &self.queue
    }
}

impl Drop for QueueHandle {
    fn drop(&mut self) {
        self.table.release(&self.id, &self.queue);
    }
}
