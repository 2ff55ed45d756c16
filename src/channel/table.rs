//! Round-robin pool of channels

use super::{ChannelError, RemoteChannel};
use crate::event::Event;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Slots {
    channels: Vec<Option<RemoteChannel>>,
    cursor: usize,
}

/// Pool of channels to one server
///
/// The lock guards only slot and cursor manipulation; stopping and writing
/// happen after it is released.
#[derive(Default)]
pub struct ChannelTable {
    slots: Mutex<Slots>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, channel: RemoteChannel) {
        self.lock().channels.push(Some(channel));
    }

    /// Empty the slot holding the channel with `index`, returning it
    pub fn remove(&self, index: i64) -> Option<RemoteChannel> {
        let mut slots = self.lock();
        slots
            .channels
            .iter_mut()
            .find(|slot| slot.as_ref().is_some_and(|c| c.index() == index))
            .and_then(Option::take)
    }

    /// Stop every channel and clear the table
    pub async fn stop_all(&self) {
        let channels = {
            let mut slots = self.lock();
            slots.cursor = 0;
            std::mem::take(&mut slots.channels)
        };
        for channel in channels.into_iter().flatten() {
            channel.stop().await;
        }
    }

    /// Next channel in round-robin order, skipping empty slots
    pub fn select(&self) -> Option<RemoteChannel> {
        let mut slots = self.lock();
        let len = slots.channels.len();

        for _ in 0..len {
            if slots.cursor >= len {
                slots.cursor = 0;
            }
            let pos = slots.cursor;
            slots.cursor += 1;
            if let Some(channel) = &slots.channels[pos] {
                return Some(channel.clone());
            }
        }
        None
    }

    /// Queue `event` on the next channel
    pub async fn write(&self, event: Event) -> Result<(), ChannelError> {
        let channel = self.select().ok_or(ChannelError::NotRunning)?;
        channel.write(event).await
    }

    /// Number of occupied slots
    pub fn len(&self) -> usize {
        self.lock().channels.iter().filter(|c| c.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
