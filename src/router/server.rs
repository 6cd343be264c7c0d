use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Context};
use tokio::sync::mpsc;

use crate::{
    executor::{CompletedTasks, TasksExecutorHandle},
    log_entry::LogEntry,
    task::{Task, TaskFactory, TaskKind, TaskStatus},
};

use super::{
    broadcast_exchange,
    broker::Broker,
    messages::{decode, encode, RouterBroadcast, TaskRouterRequest, TaskRouterResponse},
    requests_queue, responses_queue,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RouterServerOptions {
    /// Tell clients about failed tasks instead of only logging them. Clients that don't
    /// get an answer have to rely on a server restart to stop waiting.
    pub forward_errors: bool,
}

struct RunningTask {
    client_name: String,
    kind: TaskKind,
}

/// Owns the tasks executor of one network and routes every task outcome back to the
/// client that asked for it.
pub struct RouterServer {
    network: String,
    server_id: String,
    broker: Arc<dyn Broker>,
    factory: TaskFactory,
    executor: TasksExecutorHandle,
    running_tasks: HashMap<String, RunningTask>,
    options: RouterServerOptions,
}

impl RouterServer {
    pub fn new(
        network: String,
        broker: Arc<dyn Broker>,
        factory: TaskFactory,
        executor: TasksExecutorHandle,
        options: RouterServerOptions,
    ) -> Self {
        Self {
            network,
            server_id: uuid::Uuid::new_v4().to_string(),
            broker,
            factory,
            executor,
            running_tasks: HashMap::new(),
            options,
        }
    }

    pub fn running_tasks_len(&self) -> usize {
        self.running_tasks.len()
    }

    /// Serves requests until the broker or the executor go away, which is always an error.
    pub async fn run(
        mut self,
        mut completed_tasks: mpsc::UnboundedReceiver<CompletedTasks>,
    ) -> anyhow::Result<()> {
        let queue = requests_queue(&self.network);
        let mut requests = self
            .broker
            .consume(&queue)
            .await
            .context(format!("could not consume {}", queue))?;

        self.announce_start().await?;
        tracing::info!("serving task requests on {}", queue);

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(raw) => self.on_task_request(&raw)?,
                    None => return Err(anyhow!("requests queue {} closed", queue)),
                },
                batch = completed_tasks.recv() => match batch {
                    Some(batch) => self.on_completed_tasks(batch).await?,
                    None => return Err(anyhow!("tasks executor stopped")),
                },
            }
        }
    }

    /// Lets clients know that whatever they were waiting for from a previous run is gone.
    pub async fn announce_start(&self) -> anyhow::Result<()> {
        let message = RouterBroadcast::TaskExecutorServerStarted {
            server_id: self.server_id.clone(),
        };
        self.broker
            .broadcast(&broadcast_exchange(&self.network), encode(&message)?)
            .await
            .context("could not announce server start")
    }

    /// Queues the requested task. Malformed or duplicated requests are logged and dropped.
    pub fn on_task_request(&mut self, raw: &[u8]) -> anyhow::Result<()> {
        let request = match decode::<TaskRouterRequest>(raw) {
            Ok(request) => request,
            Err(error) => {
                tracing::warn!("dropping task request - {:#}", error);
                return Ok(());
            }
        };
        if self.running_tasks.contains_key(&request.key) {
            tracing::warn!(
                "task {} from {} is already running, dropping duplicate request",
                request.key,
                request.client_name
            );
            return Ok(());
        }

        let kind = request.task.kind();
        tracing::debug!(
            "task {} ({:?}) requested by {} with priority {}",
            request.key,
            kind,
            request.client_name,
            request.priority
        );
        let task = self.factory.create(request.key.clone(), request.task);
        self.running_tasks.insert(
            request.key,
            RunningTask {
                client_name: request.client_name,
                kind,
            },
        );
        self.executor.add_task(task, request.priority)
    }

    pub async fn on_completed_tasks(&mut self, batch: CompletedTasks) -> anyhow::Result<()> {
        for mut task in batch.into_iter() {
            match task.status() {
                TaskStatus::InProgress => {
                    tracing::warn!("task {} reported while still in progress", task.key());
                }
                TaskStatus::Error => self.on_failed_task(task.as_ref()).await?,
                TaskStatus::Completed => {
                    let running_task = match self.running_tasks.remove(task.key()) {
                        Some(running_task) => running_task,
                        None => {
                            tracing::warn!("completed task {} is not a known task", task.key());
                            continue;
                        }
                    };
                    let response = TaskRouterResponse::Completed {
                        key: task.key().to_owned(),
                        result: task.take_result(),
                    };
                    self.respond(&running_task.client_name, &response).await?;
                    tracing::debug!(
                        "task {} ({:?}) delivered to {}",
                        task.key(),
                        running_task.kind,
                        running_task.client_name
                    );
                }
            }
        }
        Ok(())
    }

    async fn on_failed_task(&mut self, task: &dyn Task) -> anyhow::Result<()> {
        let error = task.error().unwrap_or("unknown error").to_owned();
        let running_task = match self.running_tasks.remove(task.key()) {
            Some(running_task) => running_task,
            None => {
                tracing::warn!("failed task {} is not a known task", task.key());
                return Ok(());
            }
        };
        if !self.options.forward_errors {
            tracing::error!(
                "task {} of {} failed, not answering - {}",
                task.key(),
                running_task.client_name,
                error
            );
            return Ok(());
        }
        tracing::warn!(
            "task {} of {} failed, forwarding error - {}",
            task.key(),
            running_task.client_name,
            error
        );
        let response = TaskRouterResponse::Failed {
            key: task.key().to_owned(),
            kind: running_task.kind,
            error,
        };
        self.respond(&running_task.client_name, &response).await
    }

    async fn respond(&self, client_name: &str, response: &TaskRouterResponse) -> anyhow::Result<()> {
        let queue = responses_queue(&self.network, client_name);
        self.broker
            .publish(&queue, encode(response)?)
            .await
            .context(format!("could not publish response on {}", queue))
    }
}

/// Sends `logs` to every client of `network`.
pub(crate) async fn broadcast_new_logs(
    broker: &dyn Broker,
    network: &str,
    logs: Vec<LogEntry>,
) -> anyhow::Result<()> {
    let count = logs.len();
    let message = RouterBroadcast::NewLogs { logs };
    broker
        .broadcast(&broadcast_exchange(network), encode(&message)?)
        .await
        .context("could not broadcast new logs")?;
    tracing::debug!("broadcast {} new logs", count);
    Ok(())
}
