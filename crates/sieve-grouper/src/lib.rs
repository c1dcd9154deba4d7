//! Checkpointed batch passes that fold raw log records into error groups.

use std::path::PathBuf;

use serde::Serialize;
use sieve_classifier::ClassifierError;
use sieve_normalizer::RuleLibraryIssue;
use sieve_store::StoreError;
use sieve_types::{Checkpoint, ClassificationLevel};
use thiserror::Error;

mod aggregate;
mod config;
mod pass;
mod pass_lock;
mod retry;

pub use aggregate::{page_id, PageAggregate};
pub use config::{GrouperConfig, NormalizerConfig, RetryConfig};
pub use pass::Grouper;
pub use pass_lock::PassLock;
pub use retry::{compute_retry_delay, with_retry};

/// Result type for grouping passes.
pub type GrouperResult<T> = Result<T, GrouperError>;

#[derive(Debug, Error)]
pub enum GrouperError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("invalid grouper configuration: {0}")]
    Config(String),
    #[error(
        "another grouping pass holds {}; remove it if no pass is running",
        path.display()
    )]
    PassInProgress { path: PathBuf },
    #[error("failed to create pass lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Records classified per waterfall level during one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub rule_failure: u64,
    pub logger_pattern: u64,
    pub custom: u64,
    pub unclassified: u64,
}

impl LevelCounts {
    pub fn increment(&mut self, level: ClassificationLevel) {
        let slot = match level {
            ClassificationLevel::RuleFailure => &mut self.rule_failure,
            ClassificationLevel::LoggerPattern => &mut self.logger_pattern,
            ClassificationLevel::Custom => &mut self.custom,
            ClassificationLevel::Unclassified => &mut self.unclassified,
        };
        *slot = slot.saturating_add(1);
    }

    pub fn total(&self) -> u64 {
        self.rule_failure + self.logger_pattern + self.custom + self.unclassified
    }
}

/// Summary of one grouping pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub records_scanned: usize,
    pub pages_flushed: usize,
    pub pages_already_applied: usize,
    pub groups_created: usize,
    pub groups_updated: usize,
    pub levels: LevelCounts,
    pub rule_issues: Vec<RuleLibraryIssue>,
    /// Checkpoint in effect when the pass ended.
    pub checkpoint: Checkpoint,
    /// True when the pass started by moving a lagging checkpoint up to the
    /// last applied page.
    pub checkpoint_caught_up: bool,
    /// True when `max_records_per_pass` stopped the pass before the source was exhausted.
    pub truncated: bool,
}

impl PassReport {
    fn new(checkpoint: Checkpoint, rule_issues: Vec<RuleLibraryIssue>) -> Self {
        Self {
            records_scanned: 0,
            pages_flushed: 0,
            pages_already_applied: 0,
            groups_created: 0,
            groups_updated: 0,
            levels: LevelCounts::default(),
            rule_issues,
            checkpoint,
            checkpoint_caught_up: false,
            truncated: false,
        }
    }
}
