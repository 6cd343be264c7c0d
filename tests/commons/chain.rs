use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use logs_router::{
    blocks_range::ResolvedRange,
    cache::{LogCache, MemoryLogCache},
    chain::ChainClient,
    error::{Result, RouterError},
    log_entry::LogEntry,
    repository::BlockchainRepository,
};

pub fn log_at(address: Address, block_number: u64, log_index: u64) -> LogEntry {
    LogEntry {
        address,
        block_number,
        transaction_hash: H256::from_low_u64_be(block_number),
        log_index,
        topics: vec![H256::from_low_u64_be(log_index)],
        data: Bytes::from(vec![0xca, 0xfe]),
    }
}

/// Node serving a fixed table of logs, recording every call it gets.
pub struct FakeChainClient {
    head: AtomicU64,
    logs: Vec<LogEntry>,
    calls: Mutex<Vec<(u64, u64)>>,
    block_number_calls: AtomicUsize,
    // 1-based index of the get logs call that fails
    fail_on_call: Option<usize>,
    latency: Option<Duration>,
}

impl FakeChainClient {
    pub fn new(head: u64, logs: Vec<LogEntry>) -> Self {
        Self {
            head: AtomicU64::new(head),
            logs,
            calls: Mutex::new(Vec::new()),
            block_number_calls: AtomicUsize::new(0),
            fail_on_call: None,
            latency: None,
        }
    }

    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn set_head(&self, head: u64) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn block_number_calls(&self) -> usize {
        self.block_number_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainClient for FakeChainClient {
    async fn get_block_number(&self) -> Result<u64> {
        self.block_number_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_past_logs(
        &self,
        addresses: &[Address],
        range: ResolvedRange,
    ) -> Result<Vec<LogEntry>> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((range.from(), range.to()));
            calls.len()
        };
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.fail_on_call == Some(call) {
            return Err(RouterError::node_fetch(
                range.from(),
                range.to(),
                "header not found",
            ));
        }
        Ok(self
            .logs
            .iter()
            .filter(|log| range.contains(log.block_number))
            .filter(|log| addresses.is_empty() || addresses.contains(&log.address))
            .cloned()
            .collect())
    }
}

pub struct TestContext {
    pub client: Arc<FakeChainClient>,
    pub cache: Arc<MemoryLogCache>,
    pub repository: Arc<BlockchainRepository>,
}

impl TestContext {
    pub fn new(client: FakeChainClient, step_size: u64) -> Self {
        let client = Arc::new(client);
        let cache = Arc::new(MemoryLogCache::new());
        let repository = Arc::new(BlockchainRepository::new(
            client.clone() as Arc<dyn ChainClient>,
            cache.clone() as Arc<dyn LogCache>,
            step_size,
        ));
        Self {
            client,
            cache,
            repository,
        }
    }

    pub fn with_addresses(client: FakeChainClient, step_size: u64, addresses: Vec<Address>) -> Self {
        let client = Arc::new(client);
        let cache = Arc::new(MemoryLogCache::new());
        let repository = Arc::new(BlockchainRepository::with_addresses(
            client.clone() as Arc<dyn ChainClient>,
            cache.clone() as Arc<dyn LogCache>,
            step_size,
            addresses,
        ));
        Self {
            client,
            cache,
            repository,
        }
    }
}
