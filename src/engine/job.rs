use bytes::Bytes;

use crate::handoff;
use crate::Value;

/// All values sharing one key, handed to exactly one reduce invocation.
#[derive(Debug)]
pub struct ReduceJob {
    pub key: Bytes,
    pub values: Values,
}

impl ReduceJob {
    pub(crate) fn new(key: Bytes, values: handoff::Receiver<Value>) -> Self {
        Self {
            key,
            values: Values { rx: values },
        }
    }

    /// The key as text, replacing invalid UTF-8.
    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

/// The lazy, non-restartable sequence of one job's values.
///
/// Each call to `next` waits for the dispatcher to hand over the next value,
/// so it blocks the calling thread. Reduce functions run on the blocking
/// pool, where that is fine.
#[derive(Debug)]
pub struct Values {
    rx: handoff::Receiver<Value>,
}

impl Values {
    /// Another handle on the same queue.
    pub(crate) fn receiver(&self) -> handoff::Receiver<Value> {
        self.rx.clone()
    }

    /// Async variant of `next`, for use on the runtime.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }
}

/// An already closed sequence, for taking a job's values by
/// [`std::mem::take`].
impl Default for Values {
    fn default() -> Self {
        let (_closed, rx) = handoff::channel();
        Self { rx }
    }
}

impl Iterator for Values {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        self.rx.blocking_recv()
    }
}
