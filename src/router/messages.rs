use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    error::{Result, RouterError},
    executor::Priority,
    log_entry::LogEntry,
    task::{TaskKind, TaskPayload, TaskResult},
};

/// Published by clients on the requests queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRouterRequest {
    pub key: String,
    pub client_name: String,
    pub priority: Priority,
    pub task: TaskPayload,
}

/// Published by the server on the responses queue of the client that asked for the task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum TaskRouterResponse {
    #[serde(rename_all = "camelCase")]
    Completed { key: String, result: TaskResult },
    #[serde(rename_all = "camelCase")]
    Failed {
        key: String,
        kind: TaskKind,
        error: String,
    },
}

impl TaskRouterResponse {
    pub fn key(&self) -> &str {
        match self {
            TaskRouterResponse::Completed { key, .. } => key,
            TaskRouterResponse::Failed { key, .. } => key,
        }
    }
}

/// Messages going through the fanout exchange.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subscription", content = "data", rename_all = "camelCase")]
pub enum RouterBroadcast {
    #[serde(rename_all = "camelCase")]
    NewLogs { logs: Vec<LogEntry> },
    /// A (re)started server knows nothing about requests received by its previous run.
    #[serde(rename_all = "camelCase")]
    TaskExecutorServerStarted { server_id: String },
}

pub(crate) fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message)
        .map_err(|err| RouterError::Protocol(format!("could not encode router message - {}", err)))
}

pub(crate) fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|err| {
        RouterError::Protocol(format!(
            "could not decode router message {} - {}",
            String::from_utf8_lossy(raw),
            err
        ))
    })
}

#[cfg(test)]
mod test {
    use super::{decode, encode, RouterBroadcast, TaskRouterRequest, TaskRouterResponse};
    use crate::{
        error::RouterError,
        blocks_range::BlocksRange,
        task::{GetLogsPayload, GetLogsResult, TaskPayload, TaskResult},
    };

    #[test]
    fn request_wire_format() {
        let request = TaskRouterRequest {
            key: "k".to_owned(),
            client_name: "bridge-worker".to_owned(),
            priority: 3,
            task: TaskPayload::GetLogs(GetLogsPayload {
                blocks_range: BlocksRange::new(1, 2),
                addresses: vec![],
            }),
        };
        let raw = String::from_utf8(encode(&request).unwrap()).unwrap();
        assert_eq!(
            raw,
            r#"{"key":"k","clientName":"bridge-worker","priority":3,"task":{"task":"getLogs","payload":{"blocksRange":{"from":1,"to":2},"addresses":[]}}}"#
        );
        assert_eq!(decode::<TaskRouterRequest>(raw.as_bytes()).unwrap(), request);
    }

    #[test]
    fn response_wire_format() {
        let response = TaskRouterResponse::Completed {
            key: "k".to_owned(),
            result: TaskResult::GetLogs(GetLogsResult {
                logs: vec![],
                max_block_height_viewed: 10,
            }),
        };
        let raw = String::from_utf8(encode(&response).unwrap()).unwrap();
        assert_eq!(
            raw,
            r#"{"status":"completed","key":"k","result":{"task":"getLogs","data":{"logs":[],"maxBlockHeightViewed":10}}}"#
        );
        assert_eq!(response.key(), "k");
    }

    #[test]
    fn broadcast_wire_format() {
        let message = RouterBroadcast::TaskExecutorServerStarted {
            server_id: "s".to_owned(),
        };
        let raw = String::from_utf8(encode(&message).unwrap()).unwrap();
        assert_eq!(
            raw,
            r#"{"subscription":"taskExecutorServerStarted","data":{"serverId":"s"}}"#
        );
    }

    #[test]
    fn reject_garbage() {
        assert!(matches!(
            decode::<RouterBroadcast>(b"not json"),
            Err(RouterError::Protocol(_))
        ));
        assert!(decode::<TaskRouterRequest>(br#"{"key":"k"}"#).is_err());
    }
}
