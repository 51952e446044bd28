//! The in-memory shuffle of the local engine.
//!
//! Every intermediate record is buffered before reducing starts, so memory
//! grows with the total number of records. There is no spill to disk.

use std::cmp::Ordering;

use tokio::sync::mpsc;
use tracing::debug;

use crate::{KeyValue, ValueOrder};

/// Drain `collected` and sort the result.
pub(crate) async fn collect_sorted(
    mut collected: mpsc::Receiver<KeyValue>,
    order: Option<&ValueOrder>,
) -> Vec<KeyValue> {
    let mut records = Vec::new();
    while let Some(kv) = collected.recv().await {
        records.push(kv);
    }
    debug!(records = records.len(), "shuffle buffered");
    sort_records(&mut records, order);
    records
}

/// Stable sort by key bytes, then by `order` when given. Without an order,
/// values of one key keep their arrival order.
pub fn sort_records(records: &mut [KeyValue], order: Option<&ValueOrder>) {
    records.sort_by(|a, b| {
        a.key.cmp(&b.key).then_with(|| match order {
            Some(order) => order(&a.value, &b.value),
            None => Ordering::Equal,
        })
    });
}
