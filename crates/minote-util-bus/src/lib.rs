//! Fan-out multi-channel
//!
//! This channel is designed for broadcasting events to potentially many
//! independent subscribers, where every subscriber must observe every
//! item, in publication order, without the publisher ever blocking.
//!
//! To use, first a [`Sender`] is created. Then [`Receiver`]s can be
//! created by calling [`Sender::subscribe`]. Each subscription creates a
//! separate, unbounded queue; a slow subscriber delays nobody and drops
//! nothing.
//!
//! A subscriber's queue is destroyed when its [`Receiver`] is dropped;
//! [`Receiver::recv`] returns an error once the last [`Sender`] clone is
//! gone and the queue has been drained.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use snafu::Snafu;
use tokio::sync::watch;

#[derive(Snafu, Debug, PartialEq, Eq)]
pub enum RecvError {
    Closed,
}

/// An inner part of one subscriber's queue, shared with its [`Receiver`].
struct ChannelInner<T> {
    queue: VecDeque<T>,
}

/// One subscriber's queue.
struct Channel<T> {
    inner: Arc<Mutex<ChannelInner<T>>>,
    tx: watch::Sender<usize>,
}

struct Shared<T> {
    channels: BTreeMap<usize, Channel<T>>,
}

/// The publishing end.
///
/// Cloning shares the subscriber set; an item sent through any clone
/// reaches every subscriber.
pub struct Sender<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Sender<T>
where
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                channels: BTreeMap::new(),
            })),
        }
    }

    /// Queue a copy of the value for every current subscriber.
    ///
    /// Never blocks; returns the number of subscribers the value was
    /// delivered to.
    pub fn send(&self, v: T) -> usize {
        let mut shared = self.shared.lock().expect("Locking failed");

        let mut to_delete = vec![];
        let mut sent_count = 0;

        for (k, channel) in &shared.channels {
            let mut inner = channel.inner.lock().expect("Locking failed");
            inner.queue.push_back(v.clone());
            let len = inner.queue.len();
            drop(inner);

            if channel.tx.send(len).is_err() {
                to_delete.push(*k);
            } else {
                sent_count += 1;
            }
        }

        for k in to_delete {
            shared.channels.remove(&k).expect("Must be some");
        }

        sent_count
    }

    /// Subscribe to the `Sender`
    ///
    /// From now on, a copy of every sent item will be queued to be
    /// delivered to the returned `Receiver`.
    pub fn subscribe(&self) -> Receiver<T> {
        let mut shared = self.shared.lock().expect("Locking failed");

        let (sending_tx, sending_rx) = watch::channel(0);
        let inner = Arc::new(Mutex::new(ChannelInner {
            queue: VecDeque::new(),
        }));

        let key = shared
            .channels
            .last_key_value()
            .map(|(k, _)| *k + 1)
            .unwrap_or_default();
        assert!(
            shared
                .channels
                .insert(
                    key,
                    Channel {
                        inner: inner.clone(),
                        tx: sending_tx,
                    },
                )
                .is_none()
        );

        Receiver {
            inner,
            rx: sending_rx,
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.shared.lock().expect("Locking failed").channels.len()
    }
}

impl<T> Default for Sender<T>
where
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A receiving end of one subscription.
pub struct Receiver<T> {
    inner: Arc<Mutex<ChannelInner<T>>>,
    rx: watch::Receiver<usize>,
}

impl<T> Receiver<T> {
    /// Receive the next item, in publication order.
    ///
    /// Returns [`RecvError::Closed`] once every `Sender` clone is gone
    /// and the queue is drained.
    pub async fn recv(&mut self) -> std::result::Result<T, RecvError> {
        loop {
            {
                let mut lock = self.inner.lock().expect("Locking failed");
                if let Some(v) = lock.queue.pop_front() {
                    return Ok(v);
                }
            }

            if self.rx.changed().await.is_err() {
                // Sender gone; drain whatever was queued before it went.
                let mut lock = self.inner.lock().expect("Locking failed");
                return lock.queue.pop_front().ok_or(RecvError::Closed);
            }
        }
    }

    /// Pop the next item if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.inner
            .lock()
            .expect("Locking failed")
            .queue
            .pop_front()
    }
}

#[cfg(test)]
mod tests;
