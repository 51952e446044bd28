//! A MapReduce-compatible implementation of word count.
//!
//! Counts travel as decimal text, so the reducer also accepts its own
//! output and partial counts from a previous step.

use crate::*;
use anyhow::{Context, Result};

pub fn map(kv: KeyValue, _ctx: &TaskContext) -> MapOutput {
    let payload = kv
        .value
        .payload()
        .with_context(|| format!("{} has no content", kv.key_lossy()))?;
    let s = std::str::from_utf8(payload)?;
    let words = s
        .split(|c: char| !c.is_alphabetic())
        .filter(|s| !s.is_empty())
        .map(|word| word.to_lowercase())
        .collect::<Vec<_>>();

    let iter = words
        .into_iter()
        .map(|word| Ok(KeyValue::new(word, "1")));
    Ok(Box::new(iter))
}

pub fn reduce(job: &mut ReduceJob, _ctx: &TaskContext) -> MapOutput {
    let count = job
        .values
        .by_ref()
        .map(|value| parse_count(&value))
        .sum::<Result<u64>>()?;
    emit([KeyValue::new(job.key.clone(), count.to_string())])
}

fn parse_count(value: &Value) -> Result<u64> {
    let text = value.as_text().context("count is not text")?;
    text.trim()
        .parse()
        .with_context(|| format!("bad count `{text}`"))
}
