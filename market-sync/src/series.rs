use crate::{config::DEFAULT_MERGE_EXHAUSTED_THRESHOLD, error::SyncError, types::Candle};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// Result of prepending an older history batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeOutcome {
    /// Candles that were not already present
    pub added: usize,
    /// Series length after the merge
    pub total: usize,
    /// Fewer than the threshold were added; the provider has no older data
    pub exhausted: bool,
}

/// How a live candle was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveUpdate {
    /// Newer than the last candle, appended
    Appended,
    /// Same bucket as the last candle, replaced in place
    Refined,
    /// Older than the last candle, dropped
    Stale,
}

/// Ordered candle series for the active chart symbol.
///
/// Candle times are strictly increasing at every observable point. Each
/// mutator validates its candidate result before committing it; a candidate
/// that breaks ordering leaves the store untouched and is reported as
/// [`SyncError::InvariantViolation`].
#[derive(Debug, Clone)]
pub struct SeriesStore {
    candles: Vec<Candle>,
    exhausted_threshold: usize,
    revision: u64,
}

impl Default for SeriesStore {
    fn default() -> Self {
        Self::new(DEFAULT_MERGE_EXHAUSTED_THRESHOLD)
    }
}

impl SeriesStore {
    pub fn new(exhausted_threshold: usize) -> Self {
        Self {
            candles: Vec::new(),
            exhausted_threshold,
            revision: 0,
        }
    }

    /// Replace the series with a fresh batch.
    ///
    /// Duplicate timestamps keep the later occurrence in input order.
    pub fn initialize_with(&mut self, candles: Vec<Candle>) -> Result<usize, SyncError> {
        let candidate = dedup_later_wins(candles);
        self.commit("initialize_with", candidate)?;
        Ok(self.candles.len())
    }

    /// Prepend an older batch, skipping any timestamp already present.
    ///
    /// Merging the same batch twice adds nothing the second time.
    pub fn merge_older(&mut self, candles: Vec<Candle>) -> Result<MergeOutcome, SyncError> {
        let existing: HashSet<i64> = self.candles.iter().map(|candle| candle.time).collect();

        let fresh = dedup_later_wins(
            candles
                .into_iter()
                .filter(|candle| !existing.contains(&candle.time))
                .collect(),
        );
        let added = fresh.len();

        let mut candidate = fresh;
        candidate.extend_from_slice(&self.candles);
        candidate.sort_by_key(|candle| candle.time);

        self.commit("merge_older", candidate)?;

        let outcome = MergeOutcome {
            added,
            total: self.candles.len(),
            exhausted: added < self.exhausted_threshold,
        };
        debug!(?outcome, "merged older candles");
        Ok(outcome)
    }

    /// Apply a live kline update against the most recent candle.
    pub fn apply_live_update(&mut self, candle: Candle) -> Result<LiveUpdate, SyncError> {
        const OPERATION: &str = "apply_live_update";

        let update = match self.candles.last() {
            Some(last) if candle.time < last.time => return Ok(LiveUpdate::Stale),
            Some(last) if candle.time == last.time => LiveUpdate::Refined,
            _ => LiveUpdate::Appended,
        };

        let previous = match update {
            LiveUpdate::Refined => {
                let last = self.candles.len() - 1;
                Some(std::mem::replace(&mut self.candles[last], candle))
            }
            _ => {
                self.candles.push(candle);
                None
            }
        };

        if !self.validate() {
            // Undo our own effect only, whatever was there before stays
            match previous {
                Some(previous) => {
                    let last = self.candles.len() - 1;
                    self.candles[last] = previous;
                }
                None => {
                    self.candles.pop();
                }
            }
            warn!(time = candle.time, "live update rejected, series out of order");
            return Err(SyncError::InvariantViolation {
                operation: OPERATION,
            });
        }

        self.revision += 1;
        Ok(update)
    }

    /// Pure check that candle times strictly increase.
    pub fn validate(&self) -> bool {
        is_strictly_increasing(&self.candles)
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn earliest_time(&self) -> Option<i64> {
        self.candles.first().map(|candle| candle.time)
    }

    pub fn latest(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Monotonic counter bumped on every committed change.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn clear(&mut self) {
        if !self.candles.is_empty() {
            self.candles.clear();
            self.revision += 1;
        }
    }

    fn commit(&mut self, operation: &'static str, candidate: Vec<Candle>) -> Result<(), SyncError> {
        if !is_strictly_increasing(&candidate) {
            warn!(operation, "candidate series out of order, store left untouched");
            return Err(SyncError::InvariantViolation { operation });
        }

        self.candles = candidate;
        self.revision += 1;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn from_unchecked(candles: Vec<Candle>) -> Self {
        Self {
            candles,
            ..Self::default()
        }
    }
}

/// Sort ascending by time, a repeated timestamp keeps its last occurrence.
fn dedup_later_wins(candles: Vec<Candle>) -> Vec<Candle> {
    let by_time: BTreeMap<i64, Candle> = candles
        .into_iter()
        .map(|candle| (candle.time, candle))
        .collect();

    by_time.into_values().collect()
}

pub fn is_strictly_increasing(candles: &[Candle]) -> bool {
    candles.windows(2).all(|pair| pair[0].time < pair[1].time)
}
