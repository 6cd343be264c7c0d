use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RouterError};

/// Upper bound of a requested range, either a concrete block or whatever the chain head is
/// when the range gets evaluated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockTag {
    Latest,
    #[serde(untagged)]
    Number(u64),
}

impl From<u64> for BlockTag {
    fn from(value: u64) -> Self {
        BlockTag::Number(value)
    }
}

impl fmt::Display for BlockTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockTag::Latest => write!(f, "latest"),
            BlockTag::Number(number) => write!(f, "{}", number),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlocksRange {
    pub from: u64,
    pub to: BlockTag,
}

impl BlocksRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self {
            from,
            to: BlockTag::Number(to),
        }
    }

    pub fn to_latest(from: u64) -> Self {
        Self {
            from,
            to: BlockTag::Latest,
        }
    }

    pub fn needs_head(&self) -> bool {
        self.to == BlockTag::Latest
    }

    /// Pins the upper bound. The head must be read once per operation by the caller and
    /// passed in here so that every step of that operation sees the same value.
    pub fn resolve(&self, head: u64) -> Result<ResolvedRange> {
        let to = match self.to {
            BlockTag::Latest => head,
            BlockTag::Number(to) => to,
        };
        ResolvedRange::new(self.from, to)
    }
}

impl fmt::Display for BlocksRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// A closed, non-empty `[from, to]` interval of blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRange {
    from: u64,
    to: u64,
}

impl ResolvedRange {
    pub fn new(from: u64, to: u64) -> Result<Self> {
        if from > to {
            return Err(RouterError::InvalidRange { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn from(&self) -> u64 {
        self.from
    }

    pub fn to(&self) -> u64 {
        self.to
    }

    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    pub fn contains(&self, block_number: u64) -> bool {
        self.from <= block_number && block_number <= self.to
    }

    /// Walks the range in windows of `step` blocks: the first window is
    /// `[from, from + step]`, every following one starts right after the previous
    /// window and spans `step` blocks, the last one is capped at `to`.
    pub fn steps(&self, step: u64) -> Steps {
        Steps {
            range: *self,
            step: step.max(1),
            current: None,
            done: false,
        }
    }

    pub fn first_step(&self, step: u64) -> ResolvedRange {
        let to = self.from.saturating_add(step).min(self.to);
        ResolvedRange {
            from: self.from,
            to,
        }
    }

    /// The window following `current`, or `None` once `current` reached the end of the range.
    pub fn next_step(&self, current: &ResolvedRange, step: u64) -> Option<ResolvedRange> {
        if current.to >= self.to {
            return None;
        }
        Some(ResolvedRange {
            from: current.to + 1,
            to: current.to.saturating_add(step.max(1)).min(self.to),
        })
    }
}

impl fmt::Display for ResolvedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

pub struct Steps {
    range: ResolvedRange,
    step: u64,
    current: Option<ResolvedRange>,
    done: bool,
}

impl Iterator for Steps {
    type Item = ResolvedRange;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = match &self.current {
            None => Some(self.range.first_step(self.step)),
            Some(current) => self.range.next_step(current, self.step),
        };
        match next {
            Some(next) => {
                self.current = Some(next);
                Some(next)
            }
            None => {
                self.done = true;
                None
            }
        }
    }
}
