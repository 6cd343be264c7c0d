use std::{sync::Arc, time::Duration};

use tokio::time::MissedTickBehavior;

use crate::repository::BlockchainRepository;

use super::{broker::Broker, server::broadcast_new_logs};

/// Follows the chain head and broadcasts the logs of every new block to all the clients of
/// a network. Logs go through the repository, so they end up cached as well.
pub struct NewLogsWatcher {
    network: String,
    repository: Arc<BlockchainRepository>,
    broker: Arc<dyn Broker>,
    poll_interval: Duration,
    last_block_number: Option<u64>,
}

impl NewLogsWatcher {
    pub fn new(
        network: String,
        repository: Arc<BlockchainRepository>,
        broker: Arc<dyn Broker>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            network,
            repository,
            broker,
            poll_interval,
            last_block_number: None,
        }
    }

    /// Starts following from `block_number` (excluded) instead of the head at first poll.
    pub fn starting_after(mut self, block_number: u64) -> Self {
        self.last_block_number = Some(block_number);
        self
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(
            "watching new blocks every {}ms",
            self.poll_interval.as_millis()
        );
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.poll().await?;
        }
    }

    /// Node errors are logged and retried on the next poll, broker errors are returned.
    pub async fn poll(&mut self) -> anyhow::Result<()> {
        let head = match self.repository.get_block_number().await {
            Ok(head) => head,
            Err(error) => {
                tracing::error!("could not get head block number - {}", error);
                return Ok(());
            }
        };
        let last_block_number = match self.last_block_number {
            Some(last_block_number) => last_block_number,
            None => {
                tracing::info!("starting from block {}", head);
                self.last_block_number = Some(head);
                return Ok(());
            }
        };
        if head <= last_block_number {
            return Ok(());
        }

        let from = last_block_number + 1;
        let logs = match self.repository.get_past_logs(&[], from, head).await {
            Ok(logs) => logs,
            Err(error) if error.is_transient() => {
                tracing::warn!(
                    "could not get logs for blocks {} -> {}, retrying on next poll - {}",
                    from,
                    head,
                    error
                );
                return Ok(());
            }
            Err(error) => {
                tracing::error!("could not get logs for blocks {} -> {} - {}", from, head, error);
                return Ok(());
            }
        };
        self.last_block_number = Some(head);

        if logs.is_empty() {
            return Ok(());
        }
        tracing::info!("{} -> {} - {} new logs", from, head, logs.len());
        broadcast_new_logs(self.broker.as_ref(), &self.network, logs).await
    }
}
