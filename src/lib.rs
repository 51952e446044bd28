//! A concurrent MapReduce (lite) execution engine.
//!
//! Users specify map and reduce functions, and a [`driver::Driver`] that
//! produces the input records. The local [`engine`] runs them through a
//! bounded mapper pool, an in-memory stable sort, and a bounded reducer pool
//! that sees one key's values at a time. The [`streaming`] adapter runs the
//! same grouping logic over the `key TAB value` line protocol, so a workload
//! can also run as an externally scheduled batch step.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

pub mod cmd;
pub mod config;
pub mod counters;
pub mod driver;
pub mod engine;
pub mod error;
pub mod handoff;
pub mod logging;
pub mod retry;
pub mod sink;
pub mod store;
pub mod streaming;
pub mod workload;

pub use counters::{Count, CounterSender, CounterTotals};
pub use engine::{Engine, ReduceJob, Run, RunSummary, Values};
pub use error::{Error, Result};

/////////////////////////////////////////////////////////////////////////////
// MapReduce application types
/////////////////////////////////////////////////////////////////////////////

/// Records emitted by a map or reduce function.
pub type Emitted = Box<dyn Iterator<Item = anyhow::Result<KeyValue>> + Send>;

/// The output of an application map or reduce function.
///
/// There are 2 layers of [`anyhow::Result`]s here. The outer layer
/// accounts for errors that arise while creating the iterator.
/// The inner layer accounts for errors that occur during iteration.
///
/// This accomodates both batch (all keys emitted at once) and lazy
/// (keys only emitted when the iterator is consumed) operations.
pub type MapOutput = anyhow::Result<Emitted>;

/// A map function takes a key-value pair and the task context.
///
/// It returns an iterator that yields intermediate key-value pairs.
pub type MapFn = Arc<dyn Fn(KeyValue, &TaskContext) -> MapOutput + Send + Sync>;

/// A reduce function takes one key's job and the task context.
///
/// It is expected to drain `job.values`; anything left over is drained
/// by the engine once the function returns.
pub type ReduceFn = Arc<dyn Fn(&mut ReduceJob, &TaskContext) -> MapOutput + Send + Sync>;

/// Orders values that share a key. Only used by the local sort.
pub type ValueOrder = Arc<dyn Fn(&Value, &Value) -> Ordering + Send + Sync>;

/// A map reduce application.
#[derive(Clone)]
pub struct Workload {
    pub map_fn: MapFn,
    pub reduce_fn: ReduceFn,
    pub value_order: Option<ValueOrder>,
}

impl Workload {
    pub fn new<M, R>(map_fn: M, reduce_fn: R) -> Self
    where
        M: Fn(KeyValue, &TaskContext) -> MapOutput + Send + Sync + 'static,
        R: Fn(&mut ReduceJob, &TaskContext) -> MapOutput + Send + Sync + 'static,
    {
        Self {
            map_fn: Arc::new(map_fn),
            reduce_fn: Arc::new(reduce_fn),
            value_order: None,
        }
    }

    /// Break ties between values of the same key with `order` when sorting.
    pub fn with_value_order<F>(mut self, order: F) -> Self
    where
        F: Fn(&Value, &Value) -> Ordering + Send + Sync + 'static,
    {
        self.value_order = Some(Arc::new(order));
        self
    }
}

/// Per-worker context handed to map and reduce functions.
#[derive(Clone)]
pub struct TaskContext {
    worker: usize,
    aux: Bytes,
    counters: CounterSender,
}

impl TaskContext {
    pub fn new(worker: usize, aux: Bytes, counters: CounterSender) -> Self {
        Self {
            worker,
            aux,
            counters,
        }
    }

    /// Index of the worker within its pool.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Auxiliary arguments, a JSON array of strings.
    pub fn aux(&self) -> Bytes {
        self.aux.clone()
    }

    /// Add `amount` to a counter. Never blocks.
    pub fn count(&self, group: &str, counter: &str, amount: i64) {
        self.counters.add(group, counter, amount);
    }

    pub fn counters(&self) -> &CounterSender {
        &self.counters
    }
}

/// Wrap already computed records as a [`MapOutput`].
pub fn emit<I>(records: I) -> MapOutput
where
    I: IntoIterator<Item = KeyValue>,
    I::IntoIter: Send + 'static,
{
    Ok(Box::new(records.into_iter().map(Ok)))
}

/// A [`MapOutput`] with no records.
pub fn emit_none() -> MapOutput {
    Ok(Box::new(std::iter::empty()))
}

/////////////////////////////////////////////////////////////////////////////
// Values
/////////////////////////////////////////////////////////////////////////////

/// Name of the field holding a file or object body.
pub const CONTENT_FIELD: &str = "content";

/// The payload of a record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    Text(String),
    Bytes(Bytes),
    Fields(BTreeMap<String, Bytes>),
}

impl Value {
    /// A value holding a single `content` field.
    pub fn content(body: Bytes) -> Self {
        Value::Fields(BTreeMap::from([(CONTENT_FIELD.to_string(), body)]))
    }

    /// Decode raw protocol bytes, keeping them as text when they are UTF-8.
    pub fn from_raw(raw: &[u8]) -> Self {
        match std::str::from_utf8(raw) {
            Ok(s) => Value::Text(s.to_string()),
            Err(_) => Value::Bytes(Bytes::copy_from_slice(raw)),
        }
    }

    /// The primary payload: the text, the blob, or the `content` field.
    pub fn payload(&self) -> Option<&[u8]> {
        match self {
            Value::Text(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            Value::Fields(fields) => fields.get(CONTENT_FIELD).map(|b| b.as_ref()),
        }
    }

    pub fn field(&self, name: &str) -> Option<&Bytes> {
        match self {
            Value::Fields(fields) => fields.get(name),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Bytes(b) => std::str::from_utf8(b).ok(),
            Value::Fields(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Value::Text(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Fields(fields) => fields.is_empty(),
        }
    }

    /// The wire form of this value.
    ///
    /// Fields are encoded as a JSON object of (lossy) UTF-8 strings.
    pub fn encode(&self) -> Bytes {
        match self {
            Value::Text(s) => Bytes::from(s.clone()),
            Value::Bytes(b) => b.clone(),
            Value::Fields(fields) => {
                let object: BTreeMap<&str, String> = fields
                    .iter()
                    .map(|(k, v)| (k.as_str(), String::from_utf8_lossy(v).into_owned()))
                    .collect();
                // a map of strings always serializes
                Bytes::from(serde_json::to_vec(&object).unwrap_or_default())
            }
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Text(String::new())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(Bytes::from(b))
    }
}

/////////////////////////////////////////////////////////////////////////////
// Key-value pairs
/////////////////////////////////////////////////////////////////////////////

/// A single key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key. Compared byte-wise.
    pub key: Bytes,
    /// The value.
    pub value: Value,
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// The key as text, replacing invalid UTF-8.
    pub fn key_lossy(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_reads_content_field() {
        let value = Value::content(Bytes::from_static(b"hello"));
        assert_eq!(value.payload(), Some(&b"hello"[..]));
        assert_eq!(Value::from("x").payload(), Some(&b"x"[..]));
    }

    #[test]
    fn raw_bytes_stay_binary_when_not_utf8() {
        assert_eq!(Value::from_raw(b"abc"), Value::Text("abc".into()));
        assert_eq!(
            Value::from_raw(&[0xff, 0x00]),
            Value::Bytes(Bytes::from_static(&[0xff, 0x00]))
        );
    }

    #[test]
    fn fields_encode_as_json() {
        let value = Value::Fields(BTreeMap::from([
            ("line".to_string(), Bytes::from_static(b"3")),
            ("text".to_string(), Bytes::from_static(b"hi")),
        ]));
        assert_eq!(value.encode(), Bytes::from_static(br#"{"line":"3","text":"hi"}"#));
    }
}
