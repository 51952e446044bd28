//! Drivers produce the initial, unordered record stream of a run.
//!
//! A driver pushes records onto its output queue and returns. Returning
//! drops the sender, which closes the queue exactly once whether the driver
//! succeeded or failed.

use async_trait::async_trait;
use futures::future::try_join_all;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::KeyValue;

mod bucket;
mod files;

pub use bucket::BucketDriver;
pub use files::{GlobDriver, ParquetDriver};

/// The queue a driver writes into.
pub type RecordSender = mpsc::Sender<KeyValue>;

#[async_trait]
pub trait Driver: Send {
    async fn drive(self: Box<Self>, output: RecordSender) -> Result<()>;
}

#[async_trait]
impl Driver for Box<dyn Driver> {
    async fn drive(self: Box<Self>, output: RecordSender) -> Result<()> {
        <dyn Driver as Driver>::drive(*self, output).await
    }
}

/// Send one record, failing once the consumer has gone away.
pub async fn send(output: &RecordSender, kv: KeyValue) -> Result<()> {
    output.send(kv).await.map_err(|_| Error::Closed)
}

/// Drives records already in memory.
#[derive(Debug, Clone, Default)]
pub struct VecDriver {
    records: Vec<KeyValue>,
}

impl VecDriver {
    pub fn new(records: Vec<KeyValue>) -> Self {
        Self { records }
    }
}

impl FromIterator<KeyValue> for VecDriver {
    fn from_iter<T: IntoIterator<Item = KeyValue>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[async_trait]
impl Driver for VecDriver {
    async fn drive(self: Box<Self>, output: RecordSender) -> Result<()> {
        for kv in self.records {
            send(&output, kv).await?;
        }
        Ok(())
    }
}

/// Drives one queue from another.
#[derive(Debug)]
pub struct ChannelDriver {
    input: mpsc::Receiver<KeyValue>,
}

impl ChannelDriver {
    pub fn new(input: mpsc::Receiver<KeyValue>) -> Self {
        Self { input }
    }
}

#[async_trait]
impl Driver for ChannelDriver {
    async fn drive(mut self: Box<Self>, output: RecordSender) -> Result<()> {
        while let Some(kv) = self.input.recv().await {
            send(&output, kv).await?;
        }
        Ok(())
    }
}

/// Runs one driver at a time, concatenating their records.
#[derive(Default)]
pub struct ChainedDriver {
    drivers: Vec<Box<dyn Driver>>,
}

impl ChainedDriver {
    pub fn new(drivers: Vec<Box<dyn Driver>>) -> Self {
        Self { drivers }
    }

    pub fn push(&mut self, driver: impl Driver + 'static) {
        self.drivers.push(Box::new(driver));
    }
}

#[async_trait]
impl Driver for ChainedDriver {
    async fn drive(self: Box<Self>, output: RecordSender) -> Result<()> {
        for driver in self.drivers {
            driver.drive(output.clone()).await?;
        }
        Ok(())
    }
}

/// Runs all drivers concurrently, merging their records in no particular
/// order. The first failure stops the others.
#[derive(Default)]
pub struct MultiDriver {
    drivers: Vec<Box<dyn Driver>>,
}

impl MultiDriver {
    pub fn new(drivers: Vec<Box<dyn Driver>>) -> Self {
        Self { drivers }
    }

    pub fn push(&mut self, driver: impl Driver + 'static) {
        self.drivers.push(Box::new(driver));
    }
}

#[async_trait]
impl Driver for MultiDriver {
    async fn drive(self: Box<Self>, output: RecordSender) -> Result<()> {
        try_join_all(
            self.drivers
                .into_iter()
                .map(|driver| driver.drive(output.clone())),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;

    async fn drain(driver: impl Driver + 'static) -> (Result<()>, Vec<KeyValue>) {
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(Box::new(driver).drive(tx));
        let mut out = Vec::new();
        while let Some(kv) = rx.recv().await {
            out.push(kv);
        }
        (task.await.unwrap(), out)
    }

    fn records(prefix: &str, n: usize) -> VecDriver {
        (0..n)
            .map(|i| KeyValue::new(format!("{prefix}{i}"), "v"))
            .collect()
    }

    struct Failing;

    #[async_trait]
    impl Driver for Failing {
        async fn drive(self: Box<Self>, _output: RecordSender) -> Result<()> {
            Err(Error::Store("listing failed".into()))
        }
    }

    #[tokio::test]
    async fn chained_concatenates_in_order() {
        let mut chain = ChainedDriver::default();
        chain.push(records("a", 3));
        chain.push(records("b", 2));
        let (result, out) = drain(chain).await;
        result.unwrap();
        let keys = out.iter().map(KeyValue::key_lossy).collect_vec();
        assert_eq!(keys, vec!["a0", "a1", "a2", "b0", "b1"]);
    }

    #[tokio::test]
    async fn multi_merges_everything() {
        let mut multi = MultiDriver::default();
        for prefix in ["x", "y", "z"] {
            multi.push(records(prefix, 10));
        }
        let (result, out) = drain(multi).await;
        result.unwrap();
        assert_eq!(out.len(), 30);
        assert_eq!(out.iter().map(KeyValue::key_lossy).unique().count(), 30);
    }

    #[tokio::test]
    async fn failure_closes_output_and_propagates() {
        let mut multi = MultiDriver::default();
        multi.push(records("x", 2));
        multi.push(Failing);
        let (result, _) = drain(multi).await;
        assert!(matches!(result, Err(Error::Store(_))));
    }

    #[tokio::test]
    async fn channel_driver_forwards() {
        let (tx, rx) = mpsc::channel(8);
        for i in 0..3 {
            tx.send(KeyValue::new(format!("k{i}"), "v")).await.unwrap();
        }
        drop(tx);
        let (result, out) = drain(ChannelDriver::new(rx)).await;
        result.unwrap();
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn send_fails_once_consumer_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let result = Box::new(records("a", 1)).drive(tx).await;
        assert!(matches!(result, Err(Error::Closed)));
    }
}
