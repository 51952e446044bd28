//! A MapReduce-compatible implementation of `grep`.
//!
//! Each hit is a `line`/`text` value keyed by the file it came from. The
//! local engine sorts hits by line number; on the streaming path the
//! external sort decides.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::*;
use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug, Serialize, Deserialize)]
#[clap(no_binary_name = true)]
struct Args {
    #[clap(short, long, value_parser)]
    term: String,
}

const LINE: &str = "line";
const TEXT: &str = "text";

pub fn map(kv: KeyValue, ctx: &TaskContext) -> MapOutput {
    let args = Args::try_parse_from(serde_json::from_slice::<Vec<String>>(&ctx.aux())?)?;
    let term = args.term;

    let payload = kv
        .value
        .payload()
        .with_context(|| format!("{} has no content", kv.key_lossy()))?;
    let s = std::str::from_utf8(payload)?;
    let hits = s
        .lines()
        .enumerate()
        .filter(|(_, s)| s.contains(&term))
        .map(|(i, s)| KeyValue::new(kv.key.clone(), hit(i as u64 + 1, s)))
        .collect::<Vec<_>>();
    ctx.count("grep", "hits", hits.len() as i64);
    emit(hits)
}

/// Emits `line: text` for every hit, in the order delivered.
pub fn reduce(job: &mut ReduceJob, _ctx: &TaskContext) -> MapOutput {
    let key = job.key.clone();
    let values = std::mem::take(&mut job.values);
    let iter = values.map(move |value| -> Result<KeyValue> {
        let (line, text) = parse_hit(&value)?;
        Ok(KeyValue::new(key.clone(), format!("{line}: {text}")))
    });
    Ok(Box::new(iter))
}

/// Orders hits by line number; values that are not hits sort last.
pub fn by_line_number(a: &Value, b: &Value) -> Ordering {
    let line = |v: &Value| parse_hit(v).map(|(line, _)| line).ok();
    match (line(a), line(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn hit(line: u64, text: &str) -> Value {
    Value::Fields(BTreeMap::from([
        (LINE.to_string(), Bytes::from(line.to_string())),
        (TEXT.to_string(), Bytes::copy_from_slice(text.as_bytes())),
    ]))
}

/// A hit arrives as fields locally, or as their JSON encoding on the
/// streaming path.
fn parse_hit(value: &Value) -> Result<(u64, String)> {
    let fields: BTreeMap<String, String> = match value {
        Value::Fields(fields) => fields
            .iter()
            .map(|(k, v)| (k.clone(), String::from_utf8_lossy(v).into_owned()))
            .collect(),
        other => serde_json::from_slice(other.payload().unwrap_or_default())?,
    };
    let line = fields
        .get(LINE)
        .context("hit has no line number")?
        .parse()?;
    let text = fields.get(TEXT).cloned().unwrap_or_default();
    Ok((line, text))
}
