//! Run configuration for the local engine and the streaming adapter.
//!
//! Both configs deserialize from JSON with every field optional; binaries
//! load a file (if given) and then apply their command-line flags on top.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

/// Queue capacity used when none is configured.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Heartbeat period used when none is configured.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(3600 / 4);

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn one() -> usize {
    1
}

fn default_heartbeat() -> Duration {
    DEFAULT_HEARTBEAT
}

/// Configuration of a local engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Size of the mapper pool.
    #[serde(default = "default_parallelism")]
    pub mappers: usize,
    /// Size of the reducer pool.
    #[serde(default = "default_parallelism")]
    pub reducers: usize,
    /// Capacity of each bounded record queue.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Auxiliary arguments passed to the workload.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mappers: default_parallelism(),
            reducers: default_parallelism(),
            capacity: DEFAULT_CAPACITY,
            args: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn new(mappers: usize, reducers: usize) -> Self {
        Self {
            mappers,
            reducers,
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        validate_pools(self.mappers, self.reducers, self.capacity)
    }

    /// The arguments as the auxiliary bytes handed to map and reduce.
    pub fn aux(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.args)?))
    }
}

/// Configuration of a streaming map or reduce step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "one")]
    pub mappers: usize,
    #[serde(default = "one")]
    pub reducers: usize,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Period of the keep-alive counter.
    #[serde(default = "default_heartbeat", with = "humantime_serde")]
    pub heartbeat: Duration,
    /// Retry policy for opening sources named in indirect mode.
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            mappers: 1,
            reducers: 1,
            capacity: DEFAULT_CAPACITY,
            heartbeat: DEFAULT_HEARTBEAT,
            retry: RetryPolicy::default(),
            args: Vec::new(),
        }
    }
}

impl StreamingConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat.is_zero() {
            return Err(Error::Config("heartbeat period must be positive".into()));
        }
        validate_pools(self.mappers, self.reducers, self.capacity)
    }

    pub fn aux(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&self.args)?))
    }
}

fn validate_pools(mappers: usize, reducers: usize, capacity: usize) -> Result<()> {
    if mappers == 0 {
        return Err(Error::Config("need at least one mapper".into()));
    }
    if reducers == 0 {
        return Err(Error::Config("need at least one reducer".into()));
    }
    if capacity == 0 {
        return Err(Error::Config("queue capacity must be positive".into()));
    }
    Ok(())
}
