//! Sequence generator over conditional updates.

use crate::config::SequenceConfig;
use crate::error::{CoreError, CoreResult};
use crate::retry::RetryDecision;
use nodesync_protocol::{sequences, Clock, Sequence};
use nodesync_store::SequenceStore;
use std::sync::Arc;
use std::thread;

/// Hands out sequence values with optimistic concurrency.
///
/// Every call reads the row, computes the next value and writes it with a
/// conditional update on the value just read. Losing the race means another
/// caller advanced the row first; the call re-reads and tries again until the
/// retry policy gives up.
pub struct SequenceService {
    store: Arc<dyn SequenceStore>,
    clock: Arc<dyn Clock>,
    config: SequenceConfig,
}

impl SequenceService {
    /// Creates a sequence service.
    pub fn new(store: Arc<dyn SequenceStore>, clock: Arc<dyn Clock>, config: SequenceConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Creates the well-known sequences if they are missing.
    pub fn init(&self) -> CoreResult<()> {
        for name in [sequences::OUTGOING_BATCH, sequences::EXTRACT_REQUEST] {
            self.create(Sequence::new(name, 0).with_bounds(0, i64::MAX))?;
        }
        Ok(())
    }

    /// Creates a sequence; returns false if it already exists.
    pub fn create(&self, mut sequence: Sequence) -> CoreResult<bool> {
        if sequence.increment_by == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "sequence {} has a zero increment",
                sequence.name
            )));
        }
        if sequence.min_value > sequence.max_value {
            return Err(CoreError::InvalidArgument(format!(
                "sequence {} has min {} above max {}",
                sequence.name, sequence.min_value, sequence.max_value
            )));
        }
        let now = self.clock.now();
        sequence.create_time = Some(now);
        sequence.last_update_time = Some(now);
        let name = sequence.name.clone();
        let created = self.store.insert_sequence(sequence)?;
        if created {
            tracing::debug!(sequence = %name, "created sequence");
        }
        Ok(created)
    }

    /// Returns the last value handed out.
    pub fn curr_val(&self, name: &str) -> CoreResult<i64> {
        Ok(self.find(name)?.current_value)
    }

    /// Returns the next value of a sequence.
    pub fn next_val(&self, name: &str) -> CoreResult<i64> {
        self.advance(name, |sequence| {
            sequence
                .next_value(sequence.current_value)
                .map(|next| (next, next))
                .ok_or_else(|| CoreError::SequenceExhausted(sequence.name.clone()))
        })
    }

    /// Reserves `count` consecutive values and returns the first and last.
    ///
    /// Cycling sequences cannot hand out blocks.
    pub fn next_range(&self, name: &str, count: u64) -> CoreResult<(i64, i64)> {
        if count == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "empty range requested from sequence {name}"
            )));
        }
        self.advance(name, |sequence| {
            if sequence.cycle {
                return Err(CoreError::InvalidArgument(format!(
                    "sequence {} cycles and cannot reserve a range",
                    sequence.name
                )));
            }
            sequence
                .next_block(sequence.current_value, count)
                .map(|(first, last)| (last, (first, last)))
                .ok_or_else(|| CoreError::SequenceExhausted(sequence.name.clone()))
        })
    }

    fn find(&self, name: &str) -> CoreResult<Sequence> {
        self.store
            .find_sequence(name)?
            .ok_or_else(|| CoreError::SequenceNotFound(name.to_string()))
    }

    /// Runs the read, compute, conditional-write loop. `step` returns the new
    /// current value and the result handed back to the caller.
    fn advance<T, F>(&self, name: &str, step: F) -> CoreResult<T>
    where
        F: Fn(&Sequence) -> CoreResult<(i64, T)>,
    {
        let started = self.clock.now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let sequence = self.find(name)?;
            let (new_value, result) = step(&sequence)?;
            let now = self.clock.now();
            if self.store.compare_and_set_sequence(
                name,
                sequence.current_value,
                new_value,
                now,
            )? {
                if attempt > 1 {
                    tracing::trace!(sequence = %name, attempt, "sequence advanced after contention");
                }
                return Ok(result);
            }

            let elapsed = self.clock.now().since(started);
            match self.config.retry.decide(elapsed, attempt) {
                RetryDecision::Retry(delay) => {
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                RetryDecision::GiveUp => {
                    tracing::warn!(sequence = %name, attempt, "gave up advancing sequence");
                    return Err(CoreError::SequenceTimeout {
                        name: name.to_string(),
                        elapsed_ms: elapsed.as_millis() as u64,
                    });
                }
            }
        }
    }
}
