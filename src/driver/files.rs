use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use glob::glob;
use tracing::debug;

use super::{send, Driver, RecordSender};
use crate::error::Result;
use crate::{sink, KeyValue, Value};

/// One record per file matched by a glob pattern.
///
/// The key is the file path and the value holds the file body in its
/// `content` field.
#[derive(Debug, Clone)]
pub struct GlobDriver {
    pattern: String,
}

impl GlobDriver {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }

    /// Every file directly inside `dir`.
    pub fn dir(dir: impl AsRef<Path>) -> Self {
        let pattern = dir.as_ref().join("*");
        Self::new(pattern.to_string_lossy())
    }
}

#[async_trait]
impl Driver for GlobDriver {
    async fn drive(self: Box<Self>, output: RecordSender) -> Result<()> {
        // Iterator going through all files matching the pattern, e.g. input/*
        let mut paths = Vec::new();
        for path in glob(&self.pattern)? {
            let path = path?;
            if path.is_file() {
                paths.push(path);
            }
        }
        debug!(pattern = %self.pattern, files = paths.len(), "globbed input");

        for path in paths {
            let body = tokio::fs::read(&path).await?;
            let key = path.to_string_lossy().into_owned();
            send(&output, KeyValue::new(key, Value::content(Bytes::from(body)))).await?;
        }
        Ok(())
    }
}

/// Key/value records stored in a parquet file with binary key and value
/// columns, as written by [`sink::write_parquet`].
#[derive(Debug, Clone)]
pub struct ParquetDriver {
    path: PathBuf,
}

impl ParquetDriver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Driver for ParquetDriver {
    async fn drive(self: Box<Self>, output: RecordSender) -> Result<()> {
        let path = self.path;
        let records = tokio::task::spawn_blocking(move || sink::read_parquet(&path)).await??;
        for kv in records {
            send(&output, kv).await?;
        }
        Ok(())
    }
}
