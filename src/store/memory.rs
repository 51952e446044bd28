//! In-memory [`ObjectStore`] for local runs and tests.

use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::{ListPage, ObjectEntry, ObjectReader, ObjectStore, LIST_PAGE_SIZE};
use crate::error::{Error, Result};

#[derive(Debug)]
pub struct MemoryStore {
    objects: DashMap<(String, String), Bytes>,
    page_size: usize,
    failing_gets: AtomicU32,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(LIST_PAGE_SIZE as usize)
    }

    /// A store whose listings return at most `page_size` entries per page.
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: DashMap::new(),
            page_size: page_size.max(1),
            failing_gets: AtomicU32::new(0),
        }
    }

    pub fn insert(&self, bucket: &str, key: &str, body: impl Into<Bytes>) {
        self.objects
            .insert((bucket.to_string(), key.to_string()), body.into());
    }

    /// Make the next `n` `get` calls fail, to simulate a flaky backend.
    pub fn fail_next_gets(&self, n: u32) {
        self.failing_gets.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn take_failure(&self) -> bool {
        self.failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, bucket: &str, prefix: &str, marker: Option<&str>) -> Result<ListPage> {
        let mut keys: Vec<ObjectEntry> = self
            .objects
            .iter()
            .filter(|entry| {
                let (b, k) = entry.key();
                b == bucket && k.starts_with(prefix) && marker.map_or(true, |m| k.as_str() > m)
            })
            .map(|entry| ObjectEntry {
                key: entry.key().1.clone(),
                size: entry.value().len() as u64,
            })
            .collect();
        keys.sort_by(|a, b| a.key.cmp(&b.key));

        let truncated = keys.len() > self.page_size;
        keys.truncate(self.page_size);
        let next_marker = if truncated {
            keys.last().map(|e| e.key.clone())
        } else {
            None
        };
        Ok(ListPage {
            entries: keys,
            next_marker,
            truncated,
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<ObjectReader> {
        if self.take_failure() {
            return Err(Error::Store(format!("get {bucket}/{key}: injected failure")));
        }
        let body = self
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Store(format!("get {bucket}/{key}: no such key")))?;
        Ok(Box::pin(Cursor::new(body)))
    }

    async fn put(&self, bucket: &str, key: &str, body: Bytes) -> Result<()> {
        self.insert(bucket, key, body);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.objects.remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }
}
