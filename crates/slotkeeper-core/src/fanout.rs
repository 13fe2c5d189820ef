//! Live command fanout
//!
//! An in-memory registry of per-slot subscribers. Publishing delivers to
//! whoever is listening at that moment; there is no history and no queue,
//! and a command published with no listeners is dropped. The mailbox is
//! what makes that acceptable.
//!
//! The registry is owned by the service's composition root and handed to
//! the engine, so its lifetime is the process lifetime.

use futures_core::Stream;
use slotkeeper_api::HardwareCommand;
use slotkeeper_util::SlotId;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

type Subscribers = HashMap<SlotId, HashMap<u64, mpsc::UnboundedSender<HardwareCommand>>>;

#[derive(Default)]
struct FanoutInner {
    subscribers: Mutex<Subscribers>,
    next_id: AtomicU64,
}

impl FanoutInner {
    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, slot_id: &SlotId, id: u64) -> bool {
        let mut subscribers = self.lock();
        let Some(slot) = subscribers.get_mut(slot_id) else {
            return false;
        };
        let removed = slot.remove(&id).is_some();
        if slot.is_empty() {
            subscribers.remove(slot_id);
        }
        removed
    }
}

/// Process-wide registry of live command subscribers. Cheap to clone.
#[derive(Clone, Default)]
pub struct CommandFanout {
    inner: Arc<FanoutInner>,
}

impl CommandFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start receiving commands published for `slot_id` from now on
    pub fn subscribe(&self, slot_id: &SlotId) -> CommandSubscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner
            .lock()
            .entry(slot_id.clone())
            .or_default()
            .insert(id, tx);

        debug!(slot_id = %slot_id, subscription = id, "Command subscriber added");

        CommandSubscription {
            slot_id: slot_id.clone(),
            id,
            rx,
            registry: Some(Arc::clone(&self.inner)),
        }
    }

    /// Deliver `command` to every current subscriber of `slot_id`.
    /// Returns how many received it.
    pub fn publish(&self, slot_id: &SlotId, command: HardwareCommand) -> usize {
        let mut subscribers = self.inner.lock();
        let Some(slot) = subscribers.get_mut(slot_id) else {
            debug!(slot_id = %slot_id, command = %command, "No live subscribers");
            return 0;
        };

        // A failed send means the receiver is gone without unsubscribing
        slot.retain(|_, tx| tx.send(command).is_ok());
        let delivered = slot.len();
        if slot.is_empty() {
            subscribers.remove(slot_id);
        }

        debug!(slot_id = %slot_id, command = %command, listeners = delivered, "Command published");
        delivered
    }

    /// Live subscriptions across all slots
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().values().map(HashMap::len).sum()
    }

    /// Live subscriptions for one slot
    pub fn slot_subscriber_count(&self, slot_id: &SlotId) -> usize {
        self.inner.lock().get(slot_id).map_or(0, HashMap::len)
    }
}

/// A live feed of commands for one slot.
///
/// Unsubscribes when dropped, so every exit path of a consumer (normal
/// return, error, cancellation) releases its registry entry.
pub struct CommandSubscription {
    slot_id: SlotId,
    id: u64,
    rx: mpsc::UnboundedReceiver<HardwareCommand>,
    registry: Option<Arc<FanoutInner>>,
}

impl CommandSubscription {
    pub fn slot_id(&self) -> &SlotId {
        &self.slot_id
    }

    /// Wait for the next command. `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<HardwareCommand> {
        self.rx.recv().await
    }

    /// Next already-delivered command, without waiting
    pub fn try_recv(&mut self) -> Option<HardwareCommand> {
        self.rx.try_recv().ok()
    }

    /// Leave the registry. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(registry) = self.registry.take() {
            if registry.remove(&self.slot_id, self.id) {
                debug!(slot_id = %self.slot_id, subscription = self.id, "Command subscriber removed");
            }
            self.rx.close();
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.registry.is_some()
    }
}

impl Drop for CommandSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Stream for CommandSubscription {
    type Item = HardwareCommand;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
