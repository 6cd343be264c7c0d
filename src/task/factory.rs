use std::{sync::Arc, time::Duration};

use tokio::time::Instant;

use crate::repository::{BlockchainRepository, DEFAULT_STEP_SIZE};

use super::{GetLogsTask, Task, TaskPayload};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskOptions {
    /// Blocks fetched by a get logs task on each step.
    pub steps_range: u64,
    /// Time a task is given, counted from its creation, before it gets failed.
    pub timeout: Option<Duration>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            steps_range: DEFAULT_STEP_SIZE,
            timeout: None,
        }
    }
}

pub struct TaskFactory {
    repository: Arc<BlockchainRepository>,
    options: TaskOptions,
}

impl TaskFactory {
    pub fn new(repository: Arc<BlockchainRepository>, options: TaskOptions) -> Self {
        Self {
            repository,
            options,
        }
    }

    pub fn create(&self, key: String, payload: TaskPayload) -> Box<dyn Task> {
        match payload {
            TaskPayload::GetLogs(payload) => {
                let task = GetLogsTask::new(
                    key,
                    self.repository.clone(),
                    payload.blocks_range,
                    payload.addresses,
                    self.options.steps_range,
                );
                match self.options.timeout {
                    Some(timeout) => Box::new(task.with_deadline(Instant::now() + timeout)),
                    None => Box::new(task),
                }
            }
        }
    }
}
