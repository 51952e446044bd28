//! Synchronous (zero-buffer) handoff queues.
//!
//! [`Sender::send`] completes only once a receiver has taken the value, so
//! the producer can never run ahead of its consumer. The dispatcher uses one
//! handoff queue for jobs and one per job for that job's values: a reducer
//! that is still draining key K cannot be offered anything for K+1 until the
//! dispatcher has handed over every value of K.
//!
//! Closing a queue is dropping its [`Sender`]. The receiver side may be
//! cloned to let a pool of workers take turns.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

type Slot<T> = (T, oneshot::Sender<()>);

/// The queue was closed from the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

/// Create a new handoff queue.
pub fn channel<T>() -> (Sender<T>, Receiver<T>) {
    // One slot is the minimum tokio allows; the ack makes the send synchronous.
    let (tx, rx) = mpsc::channel(1);
    (
        Sender { tx },
        Receiver {
            rx: Arc::new(Mutex::new(rx)),
        },
    )
}

/// Producer half. There is exactly one per queue.
#[derive(Debug)]
pub struct Sender<T> {
    tx: mpsc::Sender<Slot<T>>,
}

impl<T> Sender<T> {
    /// Hand `value` over, waiting until a receiver has taken it.
    ///
    /// Fails if every receiver is gone, including the case where the last
    /// receiver dropped without taking the value.
    pub async fn send(&self, value: T) -> Result<(), Closed> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx.send((value, ack_tx)).await.map_err(|_| Closed)?;
        ack_rx.await.map_err(|_| Closed)
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct Receiver<T> {
    rx: Arc<Mutex<mpsc::Receiver<Slot<T>>>>,
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
        }
    }
}

impl<T> Receiver<T> {
    /// Take the next value. `None` once the sender is dropped.
    pub async fn recv(&self) -> Option<T> {
        let slot = self.rx.lock().await.recv().await;
        slot.map(ack)
    }

    /// Blocking variant of [`Receiver::recv`] for use off the async runtime.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn blocking_recv(&self) -> Option<T> {
        let slot = self.rx.blocking_lock().blocking_recv();
        slot.map(ack)
    }
}

fn ack<T>((value, ack): Slot<T>) -> T {
    // the sender may have been cancelled while waiting; the value is ours anyway
    let _ = ack.send(());
    value
}
