use std::{num::NonZeroU32, time::Duration};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoffBuilder};
use ethers::{
    providers::{Middleware, Provider, Ws},
    types::{Address, Filter},
};
use governor::{
    clock::{QuantaClock, QuantaInstant},
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

use crate::{
    blocks_range::ResolvedRange,
    error::{Result, RouterError},
    log_entry::LogEntry,
};

const CONNECTION_RETRY_MAX_ELAPSED_TIME: Duration = Duration::from_secs(300);

/// The subset of a JSON-RPC node used by the pipeline.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_block_number(&self) -> Result<u64>;

    /// One `eth_getLogs` call over `range`. Providers usually cap the range size or the
    /// result size of a single call, so callers are expected to keep `range` bounded.
    async fn get_past_logs(
        &self,
        addresses: &[Address],
        range: ResolvedRange,
    ) -> Result<Vec<LogEntry>>;
}

pub struct EthersChainClient {
    provider: Provider<Ws>,
    rate_limiter: RateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware<QuantaInstant>>,
}

impl EthersChainClient {
    pub async fn connect(
        ws_rpc_endpoint: &str,
        expected_chain_id: u64,
        max_calls_per_second: u32,
    ) -> anyhow::Result<Self> {
        let connect = || async {
            Provider::<Ws>::connect_with_reconnects(ws_rpc_endpoint, usize::MAX)
                .await
                .map_err(|err| {
                    tracing::warn!(
                        "could not connect to ws provider for chain {}, retrying - {}",
                        expected_chain_id,
                        err
                    );
                    backoff::Error::transient(err)
                })
        };
        let provider = retry(
            ExponentialBackoffBuilder::new()
                .with_max_elapsed_time(Some(CONNECTION_RETRY_MAX_ELAPSED_TIME))
                .build(),
            connect,
        )
        .await
        .context(format!(
            "could not get ws provider for chain {expected_chain_id}"
        ))?;

        let chain_id_from_provider = provider.get_chainid().await.context(format!(
            "could not get chain id from provider for chain {expected_chain_id}"
        ))?;
        if chain_id_from_provider.as_u64() != expected_chain_id {
            return Err(anyhow!("chain id mismatch, provider gave {chain_id_from_provider} while {expected_chain_id} was expected"));
        }

        let quota = NonZeroU32::new(max_calls_per_second)
            .ok_or_else(|| anyhow!("max rpc calls per second must be greater than zero"))?;

        Ok(Self {
            provider,
            rate_limiter: RateLimiter::direct(Quota::per_second(quota)),
        })
    }
}

#[async_trait]
impl ChainClient for EthersChainClient {
    async fn get_block_number(&self) -> Result<u64> {
        self.rate_limiter.until_ready().await;
        self.provider
            .get_block_number()
            .await
            .map(|number| number.as_u64())
            .map_err(|err| RouterError::BlockNumber(err.to_string()))
    }

    async fn get_past_logs(
        &self,
        addresses: &[Address],
        range: ResolvedRange,
    ) -> Result<Vec<LogEntry>> {
        let mut filter = Filter::new().from_block(range.from()).to_block(range.to());
        if !addresses.is_empty() {
            filter = filter.address(addresses.to_vec());
        }

        self.rate_limiter.until_ready().await;
        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|err| RouterError::node_fetch(range.from(), range.to(), err))?;

        let mut entries = Vec::with_capacity(logs.len());
        for log in logs.into_iter() {
            match LogEntry::try_from(log) {
                Ok(entry) => entries.push(entry),
                Err(error) => tracing::warn!("skipping log in range {} - {:#}", range, error),
            }
        }
        Ok(entries)
    }
}
