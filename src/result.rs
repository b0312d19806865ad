//! Per-intent outcomes and the aggregated result of one reconciliation run.
//!
//! A `SyncResult` is built by folding: each step returns a new value with
//! one more outcome recorded. Its status is never stored, it is derived from
//! the outcomes and the captured error every time it is read.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Final counters of a finished batch job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: u64,
    pub finished: u64,
    pub errored: u64,
}

impl BatchCounts {
    pub fn new(total: u64, finished: u64, errored: u64) -> Self {
        Self {
            total,
            finished,
            errored,
        }
    }

    /// Counters of `n` operations that all went through.
    pub fn complete(n: u64) -> Self {
        Self::new(n, n, 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeState {
    Success,
    Partial,
    Failed,
}

/// Result of one intent. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    state: OutcomeState,
    #[serde(flatten)]
    counts: BatchCounts,
}

impl Outcome {
    pub fn from_counts(counts: BatchCounts) -> Self {
        let state = if counts.finished == 0 {
            OutcomeState::Failed
        } else if counts.finished < counts.total || counts.errored > 0 {
            OutcomeState::Partial
        } else {
            OutcomeState::Success
        };
        Self { state, counts }
    }

    pub fn state(&self) -> OutcomeState {
        self.state
    }

    pub fn counts(&self) -> BatchCounts {
        self.counts
    }

    /// Operations that finished without error.
    pub fn success_count(&self) -> u64 {
        self.counts.finished.saturating_sub(self.counts.errored)
    }

    /// Operations the job never finished. The three tallies add up to `total`.
    pub fn partial_count(&self) -> u64 {
        self.counts.total.saturating_sub(self.counts.finished)
    }

    pub fn failed_count(&self) -> u64 {
        self.counts.errored.min(self.counts.finished)
    }
}

/// Category of remote mutation, used as key in the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    MergeFields,
    Segments,
    Subscribed,
    Deleted,
    Tags,
    Updates,
    DeletedSegments,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::MergeFields => "merge_fields",
            IntentKind::Segments => "segments",
            IntentKind::Subscribed => "subscribed",
            IntentKind::Deleted => "deleted",
            IntentKind::Tags => "tags",
            IntentKind::Updates => "updates",
            IntentKind::DeletedSegments => "deleted_segments",
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Unchanged,
    Success,
    Partial,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Unchanged => "unchanged",
            SyncStatus::Success => "success",
            SyncStatus::Partial => "partial",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn badge(&self) -> Badge {
        match self {
            SyncStatus::Unchanged | SyncStatus::Success => Badge::Success,
            SyncStatus::Partial => Badge::Info,
            SyncStatus::Failed => Badge::Warning,
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display class for a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Badge {
    Success,
    Info,
    Warning,
}

impl Badge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Badge::Success => "success",
            Badge::Info => "info",
            Badge::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    #[serde(default)]
    outcomes: BTreeMap<IntentKind, Outcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exception: Option<String>,
}

impl SyncResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an intent's outcome. An absent outcome (empty intent) leaves
    /// the result untouched.
    pub fn record(mut self, kind: IntentKind, outcome: Option<Outcome>) -> Self {
        if let Some(outcome) = outcome {
            self.outcomes.insert(kind, outcome);
        }
        self
    }

    pub fn with_exception(mut self, error: impl fmt::Display) -> Self {
        self.exception = Some(error.to_string());
        self
    }

    pub fn outcome(&self, kind: IntentKind) -> Option<&Outcome> {
        self.outcomes.get(&kind)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = (IntentKind, &Outcome)> {
        self.outcomes.iter().map(|(kind, outcome)| (*kind, outcome))
    }

    pub fn exception(&self) -> Option<&str> {
        self.exception.as_deref()
    }

    pub fn status(&self) -> SyncStatus {
        let all = |state| self.outcomes.values().all(|o| o.state() == state);
        let any = |state| self.outcomes.values().any(|o| o.state() == state);

        if self.exception.is_some() {
            SyncStatus::Failed
        } else if self.outcomes.is_empty() {
            SyncStatus::Unchanged
        } else if all(OutcomeState::Failed) {
            SyncStatus::Failed
        } else if any(OutcomeState::Partial) {
            SyncStatus::Partial
        } else if all(OutcomeState::Success) {
            SyncStatus::Success
        } else {
            // some intents succeeded, others failed outright
            SyncStatus::Partial
        }
    }

    pub fn badge(&self) -> Badge {
        self.status().badge()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}
