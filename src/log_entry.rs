use std::collections::HashSet;

use anyhow::anyhow;
use ethers::types::{Address, Bytes, Log, H256};
use serde::{Deserialize, Serialize};

/// A chain log as observed on the node. Never mutated once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub address: Address,
    pub block_number: u64,
    pub transaction_hash: H256,
    pub log_index: u64,
    pub topics: Vec<H256>,
    pub data: Bytes,
}

impl TryFrom<Log> for LogEntry {
    type Error = anyhow::Error;

    // pending logs carry no position in the chain, they can't be indexed by block
    fn try_from(log: Log) -> Result<Self, Self::Error> {
        let block_number = log
            .block_number
            .ok_or_else(|| anyhow!("log has no block number"))?
            .as_u64();
        let transaction_hash = log
            .transaction_hash
            .ok_or_else(|| anyhow!("log at block {} has no transaction hash", block_number))?;
        let log_index = log
            .log_index
            .ok_or_else(|| anyhow!("log at block {} has no log index", block_number))?
            .as_u64();
        Ok(LogEntry {
            address: log.address,
            block_number,
            transaction_hash,
            log_index,
            topics: log.topics,
            data: log.data,
        })
    }
}

/// Keeps only the logs emitted by one of `addresses`. An empty slice filters nothing out.
pub fn filter_by_addresses(logs: Vec<LogEntry>, addresses: &[Address]) -> Vec<LogEntry> {
    if addresses.is_empty() {
        return logs;
    }
    let addresses: HashSet<&Address> = addresses.iter().collect();
    logs.into_iter()
        .filter(|log| addresses.contains(&log.address))
        .collect()
}
