//! Sequence rows.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};

/// Well-known sequence names.
pub mod sequences {
    /// Outgoing batch ids.
    pub const OUTGOING_BATCH: &str = "outgoing_batch";
    /// Extract request ids.
    pub const EXTRACT_REQUEST: &str = "extract_request";
}

/// A named counter advanced by compare-and-swap on `current_value`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sequence {
    /// Name.
    pub name: String,
    /// Last value handed out.
    pub current_value: i64,
    /// Step between values; never zero.
    pub increment_by: i64,
    /// Lowest value.
    pub min_value: i64,
    /// Highest value.
    pub max_value: i64,
    /// Whether to wrap around at the bounds.
    pub cycle: bool,
    /// Creation time.
    pub create_time: Option<Timestamp>,
    /// Last update time.
    pub last_update_time: Option<Timestamp>,
}

impl Sequence {
    /// Creates an ascending, non-cycling sequence starting after `start`.
    pub fn new(name: impl Into<String>, start: i64) -> Self {
        Self {
            name: name.into(),
            current_value: start,
            increment_by: 1,
            min_value: 1,
            max_value: i64::MAX,
            cycle: false,
            create_time: None,
            last_update_time: None,
        }
    }

    /// Sets the increment.
    pub fn with_increment(mut self, increment_by: i64) -> Self {
        self.increment_by = increment_by;
        self
    }

    /// Sets the bounds.
    pub fn with_bounds(mut self, min_value: i64, max_value: i64) -> Self {
        self.min_value = min_value;
        self.max_value = max_value;
        self
    }

    /// Enables wrap-around.
    pub fn with_cycle(mut self, cycle: bool) -> Self {
        self.cycle = cycle;
        self
    }

    /// Returns the value after `current`, or `None` when exhausted.
    pub fn next_value(&self, current: i64) -> Option<i64> {
        match current.checked_add(self.increment_by) {
            Some(candidate) if candidate >= self.min_value && candidate <= self.max_value => {
                Some(candidate)
            }
            _ if self.cycle => Some(if self.increment_by > 0 {
                self.min_value
            } else {
                self.max_value
            }),
            _ => None,
        }
    }

    /// Returns the first and last of `count` values after `current`, or `None`
    /// if the block does not fit before the bound.
    pub fn next_block(&self, current: i64, count: u64) -> Option<(i64, i64)> {
        if count == 0 {
            return None;
        }
        let first = current.checked_add(self.increment_by)?;
        let span = self.increment_by.checked_mul(i64::try_from(count).ok()?)?;
        let last = current.checked_add(span)?;
        let (low, high) = if first <= last { (first, last) } else { (last, first) };
        if low < self.min_value || high > self.max_value {
            return None;
        }
        Some((first, last))
    }
}
