use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::task::JoinSet;
use tracing_futures::Instrument;

use crate::{
    cache::{LogCache, MemoryLogCache, RedisLogCache},
    chain::{ChainClient, EthersChainClient},
    commons::NetworkExecutionContext,
    executor::TasksExecutor,
    repository::BlockchainRepository,
    router::{NewLogsWatcher, RouterServer},
    task::TaskFactory,
};

/// Runs the router server of one network along with the watcher broadcasting its new logs.
pub async fn serve(context: Arc<NetworkExecutionContext>) -> anyhow::Result<()> {
    let network_config = &context.network_config;

    tracing::info!(
        "connecting to chain {} at {}",
        network_config.chain_id,
        network_config.ws_rpc_endpoint
    );
    let client: Arc<dyn ChainClient> = Arc::new(
        EthersChainClient::connect(
            &network_config.ws_rpc_endpoint,
            network_config.chain_id,
            network_config.max_rpc_calls_per_second,
        )
        .await?,
    );

    let cache: Arc<dyn LogCache> = match &network_config.redis_url {
        Some(redis_url) => Arc::new(
            RedisLogCache::connect(redis_url, format!("logs-router:{}", context.network))
                .await
                .context("could not set up redis log cache")?,
        ),
        None => {
            tracing::info!("no redis url given, caching logs in memory");
            Arc::new(MemoryLogCache::new())
        }
    };

    let repository = Arc::new(match &network_config.addresses {
        Some(addresses) => {
            tracing::info!("restricting logs to {} address(es)", addresses.len());
            BlockchainRepository::with_addresses(
                client,
                cache,
                network_config.logs_step_size,
                addresses.clone(),
            )
        }
        None => BlockchainRepository::new(client, cache, network_config.logs_step_size),
    });

    let factory = TaskFactory::new(repository.clone(), context.task_options);
    let (executor, completed_tasks) = TasksExecutor::new(context.executor_options).start_execute();
    let server = RouterServer::new(
        context.network.clone(),
        context.broker.clone(),
        factory,
        executor,
        context.server_options,
    );
    let watcher = NewLogsWatcher::new(
        context.network.clone(),
        repository,
        context.broker.clone(),
        Duration::from_millis(network_config.new_logs_poll_interval_ms),
    );

    let mut join_set = JoinSet::new();
    join_set.spawn(
        server
            .run(completed_tasks)
            .instrument(tracing::info_span!("server")),
    );
    join_set.spawn(watcher.run().instrument(tracing::info_span!("new-logs")));

    // wait forever unless some task stops with an error
    while let Some(join_result) = join_set.join_next().await {
        let task_result = join_result.context("error while joining tasks")?;
        task_result.context("task unexpectedly stopped")?;
    }

    Ok(())
}
