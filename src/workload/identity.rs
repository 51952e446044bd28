//! Pass records through unchanged.

use crate::*;

pub fn map(kv: KeyValue, _ctx: &TaskContext) -> MapOutput {
    emit([kv])
}

/// Emits every value under its key, taking them lazily.
pub fn reduce(job: &mut ReduceJob, _ctx: &TaskContext) -> MapOutput {
    let key = job.key.clone();
    let values = std::mem::take(&mut job.values);
    Ok(Box::new(
        values.map(move |value| Ok(KeyValue::new(key.clone(), value))),
    ))
}
