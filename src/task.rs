mod factory;
mod get_logs;

pub use self::factory::{TaskFactory, TaskOptions};
pub use self::get_logs::GetLogsTask;

use async_trait::async_trait;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{blocks_range::BlocksRange, log_entry::LogEntry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    InProgress,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::InProgress)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskKind {
    GetLogs,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLogsPayload {
    pub blocks_range: BlocksRange,
    #[serde(default)]
    pub addresses: Vec<Address>,
}

/// What a task has to do, as requested by a client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", content = "payload")]
#[serde(rename_all = "camelCase")]
pub enum TaskPayload {
    GetLogs(GetLogsPayload),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::GetLogs(_) => TaskKind::GetLogs,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetLogsResult {
    pub logs: Vec<LogEntry>,
    pub max_block_height_viewed: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", content = "data")]
#[serde(rename_all = "camelCase")]
pub enum TaskResult {
    GetLogs(GetLogsResult),
}

/// A resumable unit of work. Every call to [`Task::execute`] advances the task by one step.
///
/// Failures never escape `execute`: they turn the task into [`TaskStatus::Error`], which
/// is sticky like [`TaskStatus::Completed`]. A task whose cancellation token fired must
/// fail on its next `execute`.
#[async_trait]
pub trait Task: Send + Sync {
    fn key(&self) -> &str;

    fn kind(&self) -> TaskKind;

    fn status(&self) -> TaskStatus;

    /// Runs the next step, or does nothing and returns the current status if the task is
    /// already terminal.
    async fn execute(&mut self) -> TaskStatus;

    /// Moves the accumulated result out of the task.
    fn take_result(&mut self) -> TaskResult;

    /// Why the task ended up in [`TaskStatus::Error`].
    fn error(&self) -> Option<&str>;

    fn cancellation_token(&self) -> &CancellationToken;
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("key", &self.key())
            .field("kind", &self.kind())
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::{GetLogsPayload, TaskPayload, TaskStatus};
    use crate::blocks_range::BlocksRange;

    #[test]
    fn serialize_get_logs_payload() {
        let payload = TaskPayload::GetLogs(GetLogsPayload {
            blocks_range: BlocksRange::to_latest(5),
            addresses: vec![],
        });
        assert_eq!(
            serde_json::to_string(&payload).unwrap(),
            r#"{"task":"getLogs","payload":{"blocksRange":{"from":5,"to":"latest"},"addresses":[]}}"#
        );
    }

    #[test]
    fn terminal_statuses() {
        assert!(!TaskStatus::InProgress.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Error.is_terminal());
    }
}
