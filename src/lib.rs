pub mod blocks_range;
pub mod cache;
pub mod chain;
pub mod commons;
pub mod error;
pub mod executor;
pub mod log_entry;
pub mod network;
pub mod repository;
pub mod router;
pub mod task;
pub mod telemetry;

use std::{env, process::exit, sync::Arc};

use anyhow::Context;
use tokio::task::JoinSet;
use tracing::info_span;
use tracing_futures::Instrument;

use crate::{
    commons::NetworkExecutionContext,
    router::{Broker, InMemoryBroker, RedisBroker},
};

pub async fn main() {
    if let Err(error) = telemetry::init().context("could not initialize logging system") {
        tracing::error!("{:#}", error);
        exit(1);
    }

    let alt_config_path = env::var("CONFIG_PATH").ok();
    let config = match commons::get_config(alt_config_path).context("could not read config") {
        Ok(config) => config,
        Err(error) => {
            tracing::error!("{:#}", error);
            exit(1);
        }
    };

    if config.networks.is_empty() {
        tracing::error!("no networks configured, nothing to do");
        exit(1);
    }

    let executor_options = config.executor.options();
    let task_options = config.task_options();
    let server_options = config.router.server_options();
    if server_options.forward_errors {
        tracing::info!("failed tasks will be reported to clients");
    }

    let broker: Arc<dyn Broker> = match &config.router.broker_redis_url {
        Some(redis_url) => {
            match RedisBroker::connect(redis_url, "logs-router".to_owned())
                .await
                .context("could not set up redis broker")
            {
                Ok(broker) => Arc::new(broker),
                Err(error) => {
                    tracing::error!("{:#}", error);
                    exit(1);
                }
            }
        }
        None => {
            tracing::warn!("no broker redis url given, only in-process clients can be served");
            Arc::new(InMemoryBroker::new())
        }
    };

    let mut join_set = JoinSet::new();
    for (network, network_config) in config.networks.into_iter() {
        tracing::info!(
            "setting up router for network {} with ws rpc endpoint: {}",
            network,
            network_config.ws_rpc_endpoint
        );

        let span = info_span!("network", network = %network);
        let context = Arc::new(NetworkExecutionContext {
            network,
            network_config,
            executor_options,
            task_options,
            server_options,
            broker: broker.clone(),
        });

        join_set.spawn(network::serve(context).instrument(span));
    }

    // wait forever unless some task stops with an error
    while let Some(join_result) = join_set.join_next().await {
        match join_result {
            Ok(result) => {
                if let Err(error) = result {
                    tracing::error!("a task unexpectedly stopped with an error:\n\n{:#}", error);
                    exit(1);
                }
            }
            Err(error) => {
                tracing::error!("an error happened while joining a task:\n\n{:#}", error);
                exit(1);
            }
        }
    }
}
