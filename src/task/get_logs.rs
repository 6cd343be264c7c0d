use std::sync::Arc;

use async_trait::async_trait;
use ethers::types::Address;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    blocks_range::{BlocksRange, ResolvedRange},
    error::{Result, RouterError},
    repository::BlockchainRepository,
};

use super::{GetLogsResult, Task, TaskKind, TaskResult, TaskStatus};

/// Walks a blocks range against the repository, `steps_range` blocks per `execute` call.
///
/// When any step fails the whole accumulated result is dropped: the task reports `Error`
/// with no logs and `max_block_height_viewed` back at the start of the range.
pub struct GetLogsTask {
    key: String,
    repository: Arc<BlockchainRepository>,
    blocks_range: BlocksRange,
    addresses: Vec<Address>,
    steps_range: u64,
    range: Option<ResolvedRange>,
    execution_step: Option<ResolvedRange>,
    status: TaskStatus,
    result: GetLogsResult,
    error: Option<String>,
    deadline: Option<Instant>,
    cancellation_token: CancellationToken,
}

impl GetLogsTask {
    pub fn new(
        key: String,
        repository: Arc<BlockchainRepository>,
        blocks_range: BlocksRange,
        addresses: Vec<Address>,
        steps_range: u64,
    ) -> Self {
        Self {
            key,
            repository,
            blocks_range,
            addresses,
            steps_range: steps_range.max(1),
            range: None,
            execution_step: None,
            status: TaskStatus::InProgress,
            result: GetLogsResult {
                logs: Vec::new(),
                max_block_height_viewed: blocks_range.from,
            },
            error: None,
            deadline: None,
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn blocks_range(&self) -> &BlocksRange {
        &self.blocks_range
    }

    /// The window the next `execute` call will fetch, once the range has been resolved.
    pub fn execution_step(&self) -> Option<&ResolvedRange> {
        self.execution_step.as_ref()
    }

    pub fn result(&self) -> &GetLogsResult {
        &self.result
    }

    // `latest` is resolved a single time, every following step works against the same head
    async fn resolve_range(&mut self) -> Result<ResolvedRange> {
        if let Some(range) = self.range {
            return Ok(range);
        }
        let head = if self.blocks_range.needs_head() {
            self.repository.get_block_number().await?
        } else {
            0
        };
        let range = self.blocks_range.resolve(head)?;
        self.range = Some(range);
        self.execution_step = Some(range.first_step(self.steps_range));
        tracing::debug!(
            "task {} - resolved range {}, {} blocks per step",
            self.key,
            range,
            self.steps_range
        );
        Ok(range)
    }

    async fn run_step(&mut self) -> Result<TaskStatus> {
        if self.cancellation_token.is_cancelled() {
            return Err(RouterError::Cancelled(self.key.clone()));
        }
        if self.deadline.map_or(false, |deadline| Instant::now() >= deadline) {
            return Err(RouterError::DeadlineExceeded(self.key.clone()));
        }

        let range = self.resolve_range().await?;
        let step = match self.execution_step {
            Some(step) => step,
            None => range.first_step(self.steps_range),
        };

        let logs = tokio::select! {
            _ = self.cancellation_token.cancelled() => {
                return Err(RouterError::Cancelled(self.key.clone()));
            }
            _ = sleep_until(self.deadline) => {
                return Err(RouterError::DeadlineExceeded(self.key.clone()));
            }
            logs = self.repository.get_past_logs(&self.addresses, step.from(), step.to()) => logs?,
        };

        tracing::debug!(
            "task {} - step {} returned {} logs",
            self.key,
            step,
            logs.len()
        );
        self.result.logs.extend(logs);
        self.result.max_block_height_viewed = step.to();

        match range.next_step(&step, self.steps_range) {
            Some(next) => {
                self.execution_step = Some(next);
                Ok(TaskStatus::InProgress)
            }
            None => Ok(TaskStatus::Completed),
        }
    }

    fn fail(&mut self, error: RouterError) {
        if error.is_transient() {
            tracing::warn!(
                "task {} - node failed on range {}, dropping partial result - {}",
                self.key,
                self.blocks_range,
                error
            );
        } else {
            tracing::error!(
                "task {} - failed on range {}, dropping partial result - {}",
                self.key,
                self.blocks_range,
                error
            );
        }
        self.status = TaskStatus::Error;
        self.result = GetLogsResult {
            logs: Vec::new(),
            max_block_height_viewed: self.blocks_range.from,
        };
        self.error = Some(error.to_string());
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => futures::future::pending::<()>().await,
    }
}

#[async_trait]
impl Task for GetLogsTask {
    fn key(&self) -> &str {
        &self.key
    }

    fn kind(&self) -> TaskKind {
        TaskKind::GetLogs
    }

    fn status(&self) -> TaskStatus {
        self.status
    }

    async fn execute(&mut self) -> TaskStatus {
        if self.status.is_terminal() {
            return self.status;
        }
        match self.run_step().await {
            Ok(status) => {
                self.status = status;
                if status == TaskStatus::Completed {
                    tracing::debug!(
                        "task {} - completed with {} logs up to block {}",
                        self.key,
                        self.result.logs.len(),
                        self.result.max_block_height_viewed
                    );
                }
            }
            Err(error) => self.fail(error),
        }
        self.status
    }

    fn take_result(&mut self) -> TaskResult {
        TaskResult::GetLogs(std::mem::take(&mut self.result))
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }
}
