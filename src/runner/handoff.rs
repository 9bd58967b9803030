//! Zero-capacity, multi-producer/multi-consumer handoff channel.
//!
//! A receiver parks a one-shot slot in the channel and a sender hands its item
//! straight into the oldest open slot. Nothing is ever buffered, so a send only
//! completes once some receiver has taken the item, and a sender can never
//! outrun the receivers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

pub struct Handoff<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    slots: Mutex<VecDeque<oneshot::Sender<T>>>,
    slot_ready: Notify,
}

impl<T> Clone for Handoff<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Handoff<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(VecDeque::new()),
                slot_ready: Notify::new(),
            }),
        }
    }

    /// Hands `item` to a waiting receiver, waiting for one if necessary.
    ///
    /// Returns the item back if `cancel` fires before any receiver took it.
    pub async fn send(&self, mut item: T, cancel: &CancellationToken) -> Result<(), T> {
        loop {
            let notified = self.inner.slot_ready.notified();
            tokio::pin!(notified);
            // Register before looking at the slots so a receiver arriving in
            // between still wakes us.
            notified.as_mut().enable();

            while let Some(slot) = self.take_slot() {
                match slot.send(item) {
                    Ok(()) => return Ok(()),
                    // receiver gave up after we picked its slot
                    Err(back) => item = back,
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return Err(item),
            }
        }
    }

    /// Parks a slot for the next item.
    ///
    /// Closing the returned receiver withdraws the slot; an item that was
    /// handed over before the close can still be taken with `try_recv`.
    pub fn register(&self) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slots = self.lock_slots();
            slots.retain(|slot| !slot.is_closed());
            slots.push_back(tx);
        }
        self.inner.slot_ready.notify_one();
        rx
    }

    /// Waits for the next item. `None` only if the channel was torn down.
    pub async fn recv(&self) -> Option<T> {
        self.register().await.ok()
    }

    #[cfg(test)]
    fn waiting_receivers(&self) -> usize {
        self.lock_slots()
            .iter()
            .filter(|slot| !slot.is_closed())
            .count()
    }

    fn take_slot(&self) -> Option<oneshot::Sender<T>> {
        let mut slots = self.lock_slots();
        while let Some(slot) = slots.pop_front() {
            if !slot.is_closed() {
                return Some(slot);
            }
        }
        None
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, VecDeque<oneshot::Sender<T>>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Withdraws a parked slot, returning an item that slipped in before the close.
pub fn withdraw<T>(mut slot: oneshot::Receiver<T>) -> Option<T> {
    slot.close();
    slot.try_recv().ok()
}
