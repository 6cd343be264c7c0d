use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    blocks_range::{BlocksRange, ResolvedRange},
    cache::LogCache,
    chain::ChainClient,
    error::Result,
    log_entry::{filter_by_addresses, LogEntry},
};

// blocks requested to the node with a single eth_getLogs call
pub const DEFAULT_STEP_SIZE: u64 = 2_000;

/// What a worker gets back when asking for the logs of a blocks range.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsBatch {
    pub events: Vec<LogEntry>,
    /// Highest block covered by `events`. When the request failed this is the block
    /// right before the requested range, nothing in the range has been seen.
    pub last_block_number: u64,
    pub error: Option<String>,
}

impl EventsBatch {
    pub fn failed(blocks_range: &BlocksRange, error: String) -> Self {
        Self {
            events: Vec::new(),
            last_block_number: blocks_range.from.saturating_sub(1),
            error: Some(error),
        }
    }
}

/// Source of logs for a worker, either the node itself or the router in front of it.
#[async_trait]
pub trait EventsProvider: Send + Sync {
    async fn get_events(&self, blocks_range: BlocksRange) -> EventsBatch;
}

/// Serves `eth_getLogs` style requests out of a [`LogCache`], going to the node only for
/// the blocks that aren't cached yet and caching them on the way back.
///
/// The cache is kept contiguous: whenever a request starts after the last cached block,
/// the blocks in between are fetched as well.
pub struct BlockchainRepository {
    client: Arc<dyn ChainClient>,
    cache: Arc<dyn LogCache>,
    step_size: u64,
    allowed_addresses: Option<Vec<Address>>,
    // one backfill at a time, each one reads the index it is about to extend
    backfill_lock: Mutex<()>,
}

impl BlockchainRepository {
    pub fn new(client: Arc<dyn ChainClient>, cache: Arc<dyn LogCache>, step_size: u64) -> Self {
        Self {
            client,
            cache,
            step_size: step_size.max(1),
            allowed_addresses: None,
            backfill_lock: Mutex::new(()),
        }
    }

    /// Repository that only ever fetches, caches and returns logs emitted by `addresses`.
    /// Meant for workers interested in a handful of contracts on a busy chain.
    pub fn with_addresses(
        client: Arc<dyn ChainClient>,
        cache: Arc<dyn LogCache>,
        step_size: u64,
        addresses: Vec<Address>,
    ) -> Self {
        Self {
            client,
            cache,
            step_size: step_size.max(1),
            allowed_addresses: Some(addresses),
            backfill_lock: Mutex::new(()),
        }
    }

    pub fn allowed_addresses(&self) -> Option<&[Address]> {
        self.allowed_addresses.as_deref()
    }

    pub async fn get_block_number(&self) -> Result<u64> {
        self.client.get_block_number().await
    }

    pub async fn get_past_logs(
        &self,
        addresses: &[Address],
        from_block_number: u64,
        to_block_number: u64,
    ) -> Result<Vec<LogEntry>> {
        let range = ResolvedRange::new(from_block_number, to_block_number)?;

        if self.is_cached(&range).await? {
            let logs = self
                .cache
                .merged_lists_range_by_score(range.from(), range.to())
                .await?;
            tracing::debug!("{} - served {} logs from cache", range, logs.len());
            return Ok(filter_by_addresses(logs, addresses));
        }

        let logs = self.fetch_from_node(range).await?;
        tracing::debug!("{} - fetched {} logs from node", range, logs.len());
        {
            let _backfill = self.backfill_lock.lock().await;
            self.backfill_cache(range, &logs).await?;
        }

        Ok(filter_by_addresses(logs, addresses))
    }

    /// A range is cached when every single block in it is in the index.
    async fn is_cached(&self, range: &ResolvedRange) -> Result<bool> {
        let (first, last) = match (self.cache.first_key().await?, self.cache.last_key().await?) {
            (Some(first), Some(last)) => (first, last),
            _ => return Ok(false),
        };
        if first > range.from() || last < range.to() {
            return Ok(false);
        }
        let keys = self
            .cache
            .list_keys_range_by_score(range.from(), range.to())
            .await?;
        Ok(keys.len() as u64 == range.len())
    }

    async fn backfill_cache(&self, range: ResolvedRange, fetched: &[LogEntry]) -> Result<()> {
        let first_cached = self.cache.first_key().await?;
        let last_cached = self.cache.last_key().await?;

        let mut buckets: BTreeMap<u64, Vec<LogEntry>> = BTreeMap::new();
        let mut start = range.from();
        match (first_cached, last_cached) {
            (Some(first), _) if first > 0 && range.to() < first - 1 => {
                // caching this range would leave a hole right below the cached window
                tracing::debug!(
                    "{} - range is below cached window starting at {}, not caching",
                    range,
                    first
                );
                return Ok(());
            }
            (_, Some(last)) if range.from() > last + 1 => {
                let gap = ResolvedRange::new(last + 1, range.from() - 1)?;
                tracing::info!("{} - filling cache gap {}", range, gap);
                for log in self.fetch_from_node(gap).await?.into_iter() {
                    buckets.entry(log.block_number).or_default().push(log);
                }
                start = gap.from();
            }
            _ => {}
        }

        for log in fetched.iter().filter(|log| range.contains(log.block_number)) {
            buckets
                .entry(log.block_number)
                .or_default()
                .push(log.clone());
        }

        // blocks already indexed are left alone, pushing them again would duplicate their logs
        let already_cached: HashSet<u64> = self
            .cache
            .list_keys_range_by_score(start, range.to())
            .await?
            .into_iter()
            .collect();

        let mut pushed = 0u64;
        for block_number in start..=range.to() {
            if already_cached.contains(&block_number) {
                continue;
            }
            let logs = buckets.remove(&block_number).unwrap_or_default();
            self.cache.push(block_number, logs).await?;
            pushed += 1;
        }
        tracing::debug!("{} - cached {} blocks starting from {}", range, pushed, start);
        Ok(())
    }

    /// Fetches `range` from the node in windows of at most `step_size` blocks, one call at a time.
    async fn fetch_from_node(&self, range: ResolvedRange) -> Result<Vec<LogEntry>> {
        let addresses = self.allowed_addresses.as_deref().unwrap_or(&[]);
        let mut logs = Vec::new();
        for window in range.steps(self.step_size) {
            let batch = self.client.get_past_logs(addresses, window).await?;
            logs.extend(batch);
        }
        // some providers ignore the address filter, so the allow list is enforced here too
        Ok(match &self.allowed_addresses {
            Some(allowed) => filter_by_addresses(logs, allowed),
            None => logs,
        })
    }
}

#[async_trait]
impl EventsProvider for BlockchainRepository {
    async fn get_events(&self, blocks_range: BlocksRange) -> EventsBatch {
        let head = if blocks_range.needs_head() {
            match self.get_block_number().await {
                Ok(head) => head,
                Err(error) => return EventsBatch::failed(&blocks_range, error.to_string()),
            }
        } else {
            0
        };
        let range = match blocks_range.resolve(head) {
            Ok(range) => range,
            Err(error) => return EventsBatch::failed(&blocks_range, error.to_string()),
        };

        let addresses = self.allowed_addresses.as_deref().unwrap_or(&[]);
        match self.get_past_logs(addresses, range.from(), range.to()).await {
            Ok(events) => {
                tracing::info!("{} - got {} events", range, events.len());
                EventsBatch {
                    events,
                    last_block_number: range.to(),
                    error: None,
                }
            }
            Err(error) => {
                tracing::error!("{} - could not get events - {}", range, error);
                EventsBatch::failed(&blocks_range, error.to_string())
            }
        }
    }
}
