use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{error::Result, log_entry::LogEntry};

use super::{normalize_positions, LogCache};

/// In-process log cache. The `BTreeMap` keys double as the sorted index, so index and lists
/// can't drift apart.
#[derive(Default)]
pub struct MemoryLogCache {
    blocks: RwLock<BTreeMap<u64, Vec<LogEntry>>>,
}

impl MemoryLogCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blocks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blocks.read().await.is_empty()
    }

    async fn keys_at_positions(&self, start: i64, stop: i64) -> Vec<u64> {
        let blocks = self.blocks.read().await;
        match normalize_positions(start, stop, blocks.len()) {
            Some((start, stop)) => blocks
                .keys()
                .skip(start)
                .take(stop - start + 1)
                .copied()
                .collect(),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl LogCache for MemoryLogCache {
    async fn push(&self, block_key: u64, logs: Vec<LogEntry>) -> Result<usize> {
        let mut blocks = self.blocks.write().await;
        let list = blocks.entry(block_key).or_default();
        list.extend(logs);
        Ok(list.len())
    }

    async fn list_keys_range_by_position(&self, start: i64, stop: i64) -> Result<Vec<u64>> {
        Ok(self.keys_at_positions(start, stop).await)
    }

    async fn list_keys_range_by_score(&self, from: u64, to: u64) -> Result<Vec<u64>> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .blocks
            .read()
            .await
            .range(from..=to)
            .map(|(key, _)| *key)
            .collect())
    }

    async fn merged_lists_range_by_score(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self
            .blocks
            .read()
            .await
            .range(from..=to)
            .flat_map(|(_, logs)| logs.iter().cloned())
            .collect())
    }

    async fn remove_lists_range_by_position(&self, start: i64, stop: i64) -> Result<usize> {
        let keys = self.keys_at_positions(start, stop).await;
        let mut blocks = self.blocks.write().await;
        Ok(keys
            .into_iter()
            .filter(|key| blocks.remove(key).is_some())
            .count())
    }

    async fn remove_lists_range_by_score(&self, from: u64, to: u64) -> Result<usize> {
        let keys = self.list_keys_range_by_score(from, to).await?;
        let mut blocks = self.blocks.write().await;
        Ok(keys
            .into_iter()
            .filter(|key| blocks.remove(key).is_some())
            .count())
    }
}
