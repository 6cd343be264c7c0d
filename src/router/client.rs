use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ethers::types::Address;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing_futures::Instrument;

use crate::{
    blocks_range::BlocksRange,
    executor::{Priority, NORMAL_PRIORITY},
    log_entry::{filter_by_addresses, LogEntry},
    repository::{EventsBatch, EventsProvider},
    task::{GetLogsPayload, GetLogsResult, TaskPayload, TaskResult},
};

use super::{
    broadcast_exchange,
    broker::{Broker, Deliveries},
    messages::{decode, encode, RouterBroadcast, TaskRouterRequest, TaskRouterResponse},
    requests_queue, responses_queue,
};

type TaskOutcome = Result<GetLogsResult, String>;

#[derive(Clone, Debug, PartialEq)]
pub enum RouterClientEvent {
    /// Outcome of a task sent by this client. A server restart resolves every outstanding
    /// task with an empty result ending right before the requested range.
    TaskResponse { key: String, outcome: TaskOutcome },
    /// Logs of new blocks, restricted to the addresses the client follows.
    NewLogs(Vec<LogEntry>),
    ServerStarted { server_id: String },
    /// The connection to the broker is gone, the client won't receive anything else.
    Error(String),
}

struct PendingTask {
    from: u64,
    waiter: Option<oneshot::Sender<TaskOutcome>>,
}

type PendingTasks = Arc<Mutex<HashMap<String, PendingTask>>>;

/// Worker side of the router: sends get logs tasks to the server of its network and
/// surfaces their outcomes and the new logs broadcast as [`RouterClientEvent`]s.
pub struct RouterClient {
    network: String,
    client_name: String,
    broker: Arc<dyn Broker>,
    addresses: Vec<Address>,
    pending: PendingTasks,
}

impl RouterClient {
    /// Starts listening for responses and broadcasts. `addresses` are the contracts the
    /// client cares about, an empty list means every contract.
    pub async fn connect(
        network: String,
        client_name: String,
        broker: Arc<dyn Broker>,
        addresses: Vec<Address>,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<RouterClientEvent>)> {
        let queue = responses_queue(&network, &client_name);
        let responses = broker
            .consume(&queue)
            .await
            .context(format!("could not consume {}", queue))?;
        let broadcasts = broker
            .subscribe(&broadcast_exchange(&network))
            .await
            .context(format!("could not subscribe to {} broadcasts", network))?;

        let pending: PendingTasks = Arc::new(Mutex::new(HashMap::new()));
        let (events_sender, events_receiver) = mpsc::unbounded_channel();
        let listener = Listener {
            pending: pending.clone(),
            addresses: addresses.clone(),
            events: events_sender,
        };
        tokio::spawn(
            listener
                .run(responses, broadcasts)
                .instrument(tracing::info_span!("router-client", client_name = %client_name)),
        );

        Ok((
            Self {
                network,
                client_name,
                broker,
                addresses,
                pending,
            },
            events_receiver,
        ))
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Publishes a get logs task and returns its key right away. The outcome comes back as
    /// a [`RouterClientEvent::TaskResponse`] with the same key.
    pub async fn send_task_get_logs(
        &self,
        blocks_range: BlocksRange,
        addresses: Vec<Address>,
        priority: Priority,
    ) -> anyhow::Result<String> {
        self.send(blocks_range, addresses, priority, None).await
    }

    /// Like [`RouterClient::send_task_get_logs`], waiting for the outcome.
    pub async fn get_logs(
        &self,
        blocks_range: BlocksRange,
        addresses: Vec<Address>,
        priority: Priority,
    ) -> anyhow::Result<GetLogsResult> {
        let (sender, receiver) = oneshot::channel();
        let key = self
            .send(blocks_range, addresses, priority, Some(sender))
            .await?;
        receiver
            .await
            .map_err(|_| anyhow!("client stopped before task {} got an answer", key))?
            .map_err(|error| anyhow!("task {} failed - {}", key, error))
    }

    async fn send(
        &self,
        blocks_range: BlocksRange,
        addresses: Vec<Address>,
        priority: Priority,
        waiter: Option<oneshot::Sender<TaskOutcome>>,
    ) -> anyhow::Result<String> {
        let key = uuid::Uuid::new_v4().to_string();
        let request = TaskRouterRequest {
            key: key.clone(),
            client_name: self.client_name.clone(),
            priority,
            task: TaskPayload::GetLogs(GetLogsPayload {
                blocks_range,
                addresses,
            }),
        };
        let raw = encode(&request)?;

        // registered before publishing, the response may come back before `publish` returns
        self.pending.lock().await.insert(
            key.clone(),
            PendingTask {
                from: blocks_range.from,
                waiter,
            },
        );
        if let Err(error) = self.broker.publish(&requests_queue(&self.network), raw).await {
            self.pending.lock().await.remove(&key);
            return Err(error.context(format!("could not send task {}", key)));
        }
        tracing::debug!("sent task {} for blocks {}", key, blocks_range);
        Ok(key)
    }
}

#[async_trait]
impl EventsProvider for RouterClient {
    async fn get_events(&self, blocks_range: BlocksRange) -> EventsBatch {
        match self
            .get_logs(blocks_range, self.addresses.clone(), NORMAL_PRIORITY)
            .await
        {
            Ok(result) => EventsBatch {
                events: result.logs,
                last_block_number: result.max_block_height_viewed,
                error: None,
            },
            Err(error) => {
                tracing::error!("could not get events for blocks {} - {:#}", blocks_range, error);
                EventsBatch::failed(&blocks_range, format!("{:#}", error))
            }
        }
    }
}

struct Listener {
    pending: PendingTasks,
    addresses: Vec<Address>,
    events: mpsc::UnboundedSender<RouterClientEvent>,
}

impl Listener {
    async fn run(self, mut responses: Deliveries, mut broadcasts: Deliveries) {
        loop {
            let closed = tokio::select! {
                response = responses.recv() => match response {
                    Some(raw) => {
                        self.on_response(&raw).await;
                        false
                    }
                    None => true,
                },
                broadcast = broadcasts.recv() => match broadcast {
                    Some(raw) => {
                        self.on_broadcast(&raw).await;
                        false
                    }
                    None => true,
                },
            };
            if closed {
                tracing::error!("connection to the router closed");
                self.events
                    .send(RouterClientEvent::Error(
                        "connection to the router closed".to_owned(),
                    ))
                    .ok();
                return;
            }
        }
    }

    async fn on_response(&self, raw: &[u8]) {
        let response = match decode::<TaskRouterResponse>(raw) {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!("dropping task response - {:#}", error);
                return;
            }
        };
        let key = response.key().to_owned();
        let outcome = match response {
            TaskRouterResponse::Completed {
                result: TaskResult::GetLogs(result),
                ..
            } => Ok(result),
            TaskRouterResponse::Failed { error, .. } => Err(error),
        };
        self.resolve(&key, outcome).await;
    }

    async fn on_broadcast(&self, raw: &[u8]) {
        let message = match decode::<RouterBroadcast>(raw) {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!("dropping broadcast - {:#}", error);
                return;
            }
        };
        match message {
            RouterBroadcast::NewLogs { logs } => {
                let logs = filter_by_addresses(logs, &self.addresses);
                if !logs.is_empty() {
                    self.events.send(RouterClientEvent::NewLogs(logs)).ok();
                }
            }
            RouterBroadcast::TaskExecutorServerStarted { server_id } => {
                self.on_server_started(server_id).await;
            }
        }
    }

    // the new server doesn't know about our outstanding tasks, nobody must wait for them forever
    async fn on_server_started(&self, server_id: String) {
        let orphaned: Vec<(String, PendingTask)> = self.pending.lock().await.drain().collect();
        if !orphaned.is_empty() {
            tracing::warn!(
                "server {} started, releasing {} outstanding task(s)",
                server_id,
                orphaned.len()
            );
        }
        for (key, pending) in orphaned.into_iter() {
            let outcome = Ok(GetLogsResult {
                logs: Vec::new(),
                max_block_height_viewed: pending.from.saturating_sub(1),
            });
            self.deliver(key, pending, outcome);
        }
        self.events
            .send(RouterClientEvent::ServerStarted { server_id })
            .ok();
    }

    async fn resolve(&self, key: &str, outcome: TaskOutcome) {
        let pending = self.pending.lock().await.remove(key);
        match pending {
            Some(pending) => self.deliver(key.to_owned(), pending, outcome),
            None => tracing::debug!("ignoring response for unknown task {}", key),
        }
    }

    fn deliver(&self, key: String, pending: PendingTask, outcome: TaskOutcome) {
        if let Some(waiter) = pending.waiter {
            // the caller may have given up waiting already
            waiter.send(outcome.clone()).ok();
        }
        self.events
            .send(RouterClientEvent::TaskResponse { key, outcome })
            .ok();
    }
}
