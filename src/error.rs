use thiserror::Error;

pub type Result<T> = std::result::Result<T, RouterError>;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid blocks range: from block {from} is greater than to block {to}")]
    InvalidRange { from: u64, to: u64 },

    #[error("could not fetch logs from node for blocks {from} -> {to}: {reason}")]
    NodeFetch { from: u64, to: u64, reason: String },

    #[error("could not get current block number from node: {0}")]
    BlockNumber(String),

    #[error("log cache error: {0}")]
    Cache(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("task {0} was cancelled")]
    Cancelled(String),

    #[error("task {0} exceeded its deadline")]
    DeadlineExceeded(String),
}

impl RouterError {
    pub fn node_fetch<E: std::fmt::Display>(from: u64, to: u64, error: E) -> Self {
        RouterError::NodeFetch {
            from,
            to,
            reason: format!("{:#}", error),
        }
    }

    /// Errors coming from the node are transient from the point of view of the caller,
    /// everything else is not worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RouterError::NodeFetch { .. } | RouterError::BlockNumber(_)
        )
    }
}

impl From<redis::RedisError> for RouterError {
    fn from(error: redis::RedisError) -> Self {
        RouterError::Cache(error.to_string())
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(error: serde_json::Error) -> Self {
        RouterError::Cache(format!("could not (de)serialize cached log - {}", error))
    }
}

#[cfg(test)]
mod test {
    use super::RouterError;

    #[test]
    fn only_node_errors_are_transient() {
        assert!(RouterError::node_fetch(1, 2, "timeout").is_transient());
        assert!(RouterError::BlockNumber("timeout".to_owned()).is_transient());
        assert!(!RouterError::InvalidRange { from: 2, to: 1 }.is_transient());
        assert!(!RouterError::Cache("connection refused".to_owned()).is_transient());
        assert!(!RouterError::Protocol("bad payload".to_owned()).is_transient());
        assert!(!RouterError::Cancelled("k".to_owned()).is_transient());
    }

    #[test]
    fn node_fetch_keeps_reason() {
        let error = RouterError::node_fetch(10, 20, "header not found");
        assert_eq!(
            error.to_string(),
            "could not fetch logs from node for blocks 10 -> 20: header not found"
        );
    }
}
