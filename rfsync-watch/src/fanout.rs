//! Bounded multi-subscriber fan-out.
//!
//! Every subscriber owns a bounded queue. [`FanOut::publish`] clones the item
//! into each queue in registration order and awaits room in each one, so a
//! full queue applies back-pressure to the publisher instead of dropping the
//! item. A pathologically slow subscriber therefore stalls delivery to every
//! subscriber behind it; nothing is ever silently lost for a live one.
//!
//! Queues whose receiver has been dropped are pruned on the next publish.
//! [`FanOut::close`] drops the senders: receivers drain what is already
//! buffered and then observe end-of-stream.

use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;

pub struct FanOut<T> {
    capacity: usize,
    subscribers: Mutex<Vec<mpsc::Sender<T>>>,
}

impl<T: Clone + Send> FanOut<T> {
    /// `capacity` is the depth of each subscriber queue (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber queue.
    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.lock().push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Deliver one copy of `item` to every live subscriber; returns how many
    /// received it.
    pub async fn publish(&self, item: T) -> usize {
        let senders: Vec<mpsc::Sender<T>> = self.lock().clone();
        let mut delivered = 0;
        let mut saw_closed = false;

        for sender in &senders {
            if sender.send(item.clone()).await.is_ok() {
                delivered += 1;
            } else {
                saw_closed = true;
            }
        }

        if saw_closed {
            self.lock().retain(|sender| !sender.is_closed());
        }
        delivered
    }

    /// Close every queue. Buffered items are still delivered to receivers.
    pub fn close(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::Sender<T>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
