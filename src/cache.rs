mod memory;
mod redis_cache;

pub use self::memory::MemoryLogCache;
pub use self::redis_cache::RedisLogCache;

use async_trait::async_trait;

use crate::{error::Result, log_entry::LogEntry};

/// Block-indexed log store.
///
/// Every pushed block key is recorded in a sorted index (score = block number) next to the
/// list of logs emitted in that block. Blocks without logs are recorded too, with an empty
/// list, so that the index alone tells which blocks have been fetched already.
///
/// Positions follow the usual sorted set conventions: they are zero based, both ends are
/// inclusive and negative values count from the end (`-1` is the highest indexed block).
#[async_trait]
pub trait LogCache: Send + Sync {
    /// Appends `logs` to the list of `block_key` and records the key in the index.
    /// Returns the amount of logs stored for the block after the push. Pushing the same
    /// block twice appends twice, deduplication is up to the caller.
    async fn push(&self, block_key: u64, logs: Vec<LogEntry>) -> Result<usize>;

    async fn list_keys_range_by_position(&self, start: i64, stop: i64) -> Result<Vec<u64>>;

    async fn list_keys_range_by_score(&self, from: u64, to: u64) -> Result<Vec<u64>>;

    /// Concatenation of the lists of every block in `[from, to]`, in ascending block order.
    async fn merged_lists_range_by_score(&self, from: u64, to: u64) -> Result<Vec<LogEntry>>;

    /// Drops the blocks at the given positions. Returns the amount of removed blocks.
    async fn remove_lists_range_by_position(&self, start: i64, stop: i64) -> Result<usize>;

    async fn remove_lists_range_by_score(&self, from: u64, to: u64) -> Result<usize>;

    async fn first_key(&self) -> Result<Option<u64>> {
        Ok(self.list_keys_range_by_position(0, 0).await?.into_iter().next())
    }

    async fn last_key(&self) -> Result<Option<u64>> {
        Ok(self.list_keys_range_by_position(-1, -1).await?.into_iter().next())
    }
}

/// Maps sorted set style positions onto `[start, stop]` indexes of a collection of length `len`.
pub(crate) fn normalize_positions(start: i64, stop: i64, len: usize) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if stop < 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[cfg(test)]
mod test {
    use super::normalize_positions;

    #[test]
    fn positions() {
        assert_eq!(normalize_positions(0, -1, 5), Some((0, 4)));
        assert_eq!(normalize_positions(-1, -1, 5), Some((4, 4)));
        assert_eq!(normalize_positions(0, 0, 5), Some((0, 0)));
        assert_eq!(normalize_positions(2, 100, 5), Some((2, 4)));
        assert_eq!(normalize_positions(-10, 1, 5), Some((0, 1)));
        assert_eq!(normalize_positions(3, 1, 5), None);
        assert_eq!(normalize_positions(5, 6, 5), None);
        assert_eq!(normalize_positions(0, -6, 5), None);
        assert_eq!(normalize_positions(0, -1, 0), None);
    }
}
