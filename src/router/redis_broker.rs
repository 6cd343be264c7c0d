use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoffBuilder};
use futures::StreamExt;
use redis::{aio::MultiplexedConnection, AsyncCommands};
use tokio::sync::mpsc;
use tracing_futures::Instrument;

use super::broker::{Broker, Deliveries};

const CONNECTION_RETRY_MAX_ELAPSED_TIME: Duration = Duration::from_secs(120);
// BLPOP timeout, bounds how long a consumer takes to notice its receiver is gone
const POP_TIMEOUT_SECONDS: usize = 1;
const POP_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Broker shared by processes through Redis. Queues are lists (`RPUSH` to publish, `BLPOP`
/// to consume) so they outlive their consumers, exchanges are pub/sub channels.
pub struct RedisBroker {
    client: redis::Client,
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str, prefix: String) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)
            .context(format!("could not parse redis url {}", redis_url))?;
        let connection = connect_with_retry(&client)
            .await
            .context("could not connect to redis broker")?;
        tracing::info!("connected to redis broker with prefix {}", prefix);
        Ok(Self {
            client,
            connection,
            prefix,
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }
}

async fn connect_with_retry(client: &redis::Client) -> redis::RedisResult<MultiplexedConnection> {
    let connect = || async {
        client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| {
                tracing::warn!("could not connect to redis, retrying - {}", err);
                backoff::Error::transient(err)
            })
    };
    retry(
        ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(CONNECTION_RETRY_MAX_ELAPSED_TIME))
            .build(),
        connect,
    )
    .await
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let _: usize = self
            .connection
            .clone()
            .rpush(self.key(queue), payload)
            .await
            .context(format!("could not push to queue {}", queue))?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> anyhow::Result<Deliveries> {
        // BLPOP holds its connection until it returns, so every consumer gets its own
        let connection = connect_with_retry(&self.client)
            .await
            .context(format!("could not open consumer connection for {}", queue))?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let key = self.key(queue);
        tokio::spawn(
            pop_loop(connection, key, sender)
                .instrument(tracing::info_span!("redis-consumer", queue = %queue)),
        );
        Ok(receiver)
    }

    async fn broadcast(&self, exchange: &str, payload: Vec<u8>) -> anyhow::Result<()> {
        let _: usize = self
            .connection
            .clone()
            .publish(self.key(exchange), payload)
            .await
            .context(format!("could not publish on exchange {}", exchange))?;
        Ok(())
    }

    async fn subscribe(&self, exchange: &str) -> anyhow::Result<Deliveries> {
        let mut pubsub = self
            .client
            .get_async_connection()
            .await
            .context("could not open subscriber connection")?
            .into_pubsub();
        pubsub
            .subscribe(self.key(exchange))
            .await
            .context(format!("could not subscribe to exchange {}", exchange))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(
            async move {
                let mut messages = pubsub.on_message();
                while let Some(message) = messages.next().await {
                    let payload: Vec<u8> = match message.get_payload() {
                        Ok(payload) => payload,
                        Err(error) => {
                            tracing::warn!("dropping unreadable broadcast - {}", error);
                            continue;
                        }
                    };
                    if sender.send(payload).is_err() {
                        return;
                    }
                }
                tracing::error!("subscriber connection closed");
            }
            .instrument(tracing::info_span!("redis-subscriber", exchange = %exchange)),
        );
        Ok(receiver)
    }
}

async fn pop_loop(
    mut connection: MultiplexedConnection,
    key: String,
    sender: mpsc::UnboundedSender<Vec<u8>>,
) {
    while !sender.is_closed() {
        let popped: redis::RedisResult<Option<(String, Vec<u8>)>> = redis::cmd("BLPOP")
            .arg(&key)
            .arg(POP_TIMEOUT_SECONDS)
            .query_async(&mut connection)
            .await;
        match popped {
            Ok(Some((_, payload))) => {
                if let Err(mpsc::error::SendError(payload)) = sender.send(payload) {
                    // consumer went away in between, the message goes back in front
                    let pushed_back: redis::RedisResult<usize> =
                        connection.lpush(&key, payload).await;
                    if let Err(error) = pushed_back {
                        tracing::error!("lost message popped from {} - {}", key, error);
                    }
                    return;
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!("could not pop from {}, retrying - {}", key, error);
                tokio::time::sleep(POP_ERROR_DELAY).await;
            }
        }
    }
}
