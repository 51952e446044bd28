//! Count values per key.

use crate::*;

pub fn reduce(job: &mut ReduceJob, _ctx: &TaskContext) -> MapOutput {
    let n = job.values.by_ref().count();
    emit([KeyValue::new(job.key.clone(), n.to_string())])
}
