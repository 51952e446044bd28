//! Sum integer values per key.

use crate::*;

/// Values that are not integers are counted under `sum/bad values` and
/// left out of the total.
pub fn reduce(job: &mut ReduceJob, ctx: &TaskContext) -> MapOutput {
    let mut total: i64 = 0;
    for value in job.values.by_ref() {
        match value.as_text().map(str::trim).map(str::parse::<i64>) {
            Some(Ok(n)) => total = total.saturating_add(n),
            _ => ctx.count("sum", "bad values", 1),
        }
    }
    emit([KeyValue::new(job.key.clone(), total.to_string())])
}
