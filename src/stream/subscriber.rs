use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::stream::chunk::StreamChunk;

/// Delivery-queue capacity clamp.
pub const MIN_SUBSCRIBER_BUFFER: usize = 10;
pub const MAX_SUBSCRIBER_BUFFER: usize = 1000;

/// Default queue capacity when a client doesn't ask for one.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct SubscribeOptions {
    pub replay_from_start: bool,
    pub buffer_size: usize,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            replay_from_start: false,
            buffer_size: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

pub fn clamp_buffer(size: usize) -> usize {
    size.clamp(MIN_SUBSCRIBER_BUFFER, MAX_SUBSCRIBER_BUFFER)
}

/// The engine's side of one subscriber: its queue sender and lifetime.
pub(crate) struct SubscriberSlot {
    pub id: u64,
    pub joined_at: Instant,
    pub tx: mpsc::Sender<Arc<StreamChunk>>,
    pub cancel: CancellationToken,
}

/// The consumer's side of one subscriber. Dropping the subscription cancels
/// its lifetime; the engine skips cancelled subscribers and the session
/// keeps reading regardless.
pub struct Subscription {
    pub id: u64,
    rx: mpsc::Receiver<Arc<StreamChunk>>,
    cancel: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        rx: mpsc::Receiver<Arc<StreamChunk>>,
        cancel: CancellationToken,
    ) -> Self {
        Self { id, rx, cancel }
    }

    /// Next chunk, or None once the session closed this queue and it drained.
    pub async fn next(&mut self) -> Option<Arc<StreamChunk>> {
        self.rx.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
