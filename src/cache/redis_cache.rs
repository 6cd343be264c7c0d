use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoffBuilder};
use redis::{aio::MultiplexedConnection, AsyncCommands};

use crate::{error::Result, log_entry::LogEntry};

use super::LogCache;

const CONNECTION_RETRY_MAX_ELAPSED_TIME: Duration = Duration::from_secs(120);

/// Log cache stored in Redis: a sorted set `<prefix>:index` whose members are block numbers
/// (score = block number) plus one list `<prefix>:block:<number>` of JSON encoded logs per block.
pub struct RedisLogCache {
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisLogCache {
    pub async fn connect(redis_url: &str, prefix: String) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)
            .context(format!("could not parse redis url {}", redis_url))?;
        let connect = || async {
            client
                .get_multiplexed_async_connection()
                .await
                .map_err(|err| {
                    tracing::warn!("could not connect to redis, retrying - {}", err);
                    backoff::Error::transient(err)
                })
        };
        let connection = retry(
            ExponentialBackoffBuilder::new()
                .with_max_elapsed_time(Some(CONNECTION_RETRY_MAX_ELAPSED_TIME))
                .build(),
            connect,
        )
        .await
        .context("could not connect to redis")?;

        tracing::info!("connected to redis log cache with prefix {}", prefix);
        Ok(Self { connection, prefix })
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.prefix)
    }

    fn block_key(&self, block_number: u64) -> String {
        format!("{}:block:{}", self.prefix, block_number)
    }

    async fn remove_keys(&self, keys: Vec<u64>) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in keys.iter() {
            pipe.del(self.block_key(*key)).ignore();
        }
        pipe.zrem(self.index_key(), keys);
        let (removed,): (usize,) = pipe.query_async(&mut self.connection.clone()).await?;
        Ok(removed)
    }
}

#[async_trait]
impl LogCache for RedisLogCache {
    async fn push(&self, block_key: u64, logs: Vec<LogEntry>) -> Result<usize> {
        let list_key = self.block_key(block_key);
        let encoded = logs
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<String>, _>>()?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if !encoded.is_empty() {
            pipe.rpush(&list_key, encoded).ignore();
        }
        pipe.zadd(self.index_key(), block_key, block_key).ignore();
        pipe.llen(&list_key);
        let (count,): (usize,) = pipe.query_async(&mut self.connection.clone()).await?;
        Ok(count)
    }

    async fn list_keys_range_by_position(&self, start: i64, stop: i64) -> Result<Vec<u64>> {
        let keys: Vec<u64> = self
            .connection
            .clone()
            .zrange(self.index_key(), start as isize, stop as isize)
            .await?;
        Ok(keys)
    }

    async fn list_keys_range_by_score(&self, from: u64, to: u64) -> Result<Vec<u64>> {
        if from > to {
            return Ok(Vec::new());
        }
        let keys: Vec<u64> = self
            .connection
            .clone()
            .zrangebyscore(self.index_key(), from, to)
            .await?;
        Ok(keys)
    }

    async fn merged_lists_range_by_score(&self, from: u64, to: u64) -> Result<Vec<LogEntry>> {
        let keys = self.list_keys_range_by_score(from, to).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in keys.iter() {
            pipe.lrange(self.block_key(*key), 0, -1);
        }
        let lists: Vec<Vec<String>> = pipe.query_async(&mut self.connection.clone()).await?;

        let mut logs = Vec::new();
        for raw in lists.into_iter().flatten() {
            logs.push(serde_json::from_str::<LogEntry>(&raw)?);
        }
        Ok(logs)
    }

    async fn remove_lists_range_by_position(&self, start: i64, stop: i64) -> Result<usize> {
        let keys = self.list_keys_range_by_position(start, stop).await?;
        self.remove_keys(keys).await
    }

    async fn remove_lists_range_by_score(&self, from: u64, to: u64) -> Result<usize> {
        let keys = self.list_keys_range_by_score(from, to).await?;
        self.remove_keys(keys).await
    }
}
