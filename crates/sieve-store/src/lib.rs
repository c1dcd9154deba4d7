//! Storage contracts for grouping passes and their in-memory, SQLite and
//! file backends.

use async_trait::async_trait;
use rusqlite::ErrorCode;
use thiserror::Error;

mod atomic_io;
mod checkpoint_file;
mod memory;
mod sqlite;

pub use atomic_io::write_text_atomic;
pub use checkpoint_file::FileCheckpointStore;
pub use memory::InMemorySieveStore;
pub use sieve_types::{
    Checkpoint, CursorPosition, DiagnosisReport, DiagnosisStatus, ErrorGroup, GroupQuery,
    LogRecord, PageFlush, SourceFilter, StatusActor, StatusTransitionError,
};
pub use sqlite::{SqliteSieveStore, CHECKPOINT_NAME};

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("error group '{0}' not found")]
    GroupNotFound(String),
    #[error(transparent)]
    InvalidStatusTransition(#[from] StatusTransitionError),
    #[error("checkpoint cannot move backwards from {stored} to {requested}")]
    CheckpointRegression {
        stored: CursorPosition,
        requested: CursorPosition,
    },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Returns true for failures worth retrying: I/O, a busy or locked
    /// database, or an unavailable backend.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Unavailable(_) => true,
            Self::Sqlite(error) => matches!(
                error.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
            ),
            _ => false,
        }
    }
}

/// Outcome of applying one page's deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Applied { created: usize, updated: usize },
    /// The page id was already in the ledger; nothing was written.
    AlreadyApplied,
}

/// Read-only access to raw log records.
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Returns up to `limit` records strictly after `after`, ordered by
    /// `(timestamp, id)`.
    async fn fetch_page(
        &self,
        after: Option<&CursorPosition>,
        limit: usize,
        filter: &SourceFilter,
    ) -> StoreResult<Vec<LogRecord>>;
}

/// Error group persistence.
///
/// Each write method owns a disjoint set of fields: `apply_page` the
/// ingestion aggregates, `record_diagnosis` the diagnosis report, and the
/// remaining methods the operator fields plus the audit trail.
#[async_trait]
pub trait GroupStore: Send + Sync {
    /// Applies every delta of a page and records its id in one transaction.
    async fn apply_page(&self, flush: PageFlush) -> StoreResult<FlushOutcome>;
    /// Last position of the newest applied page. Stored in the same
    /// transaction as the page's deltas; pages ending at or before it are
    /// reported as `AlreadyApplied`.
    async fn applied_through(&self) -> StoreResult<Option<CursorPosition>>;
    /// Drops ledger entries whose last position is at or before `position`.
    async fn prune_pages_through(&self, position: &CursorPosition) -> StoreResult<usize>;
    async fn get_group(&self, fingerprint: &str) -> StoreResult<Option<ErrorGroup>>;
    /// Matching groups ordered by count, highest first.
    async fn query_groups(&self, query: GroupQuery) -> StoreResult<Vec<ErrorGroup>>;
    async fn transition_status(
        &self,
        fingerprint: &str,
        actor: StatusActor,
        actor_name: &str,
        next: DiagnosisStatus,
    ) -> StoreResult<ErrorGroup>;
    async fn record_diagnosis(
        &self,
        fingerprint: &str,
        report: DiagnosisReport,
    ) -> StoreResult<ErrorGroup>;
    async fn update_comments(
        &self,
        fingerprint: &str,
        actor_name: &str,
        comments: &str,
    ) -> StoreResult<ErrorGroup>;
    async fn assign_user(
        &self,
        fingerprint: &str,
        actor_name: &str,
        user: Option<&str>,
    ) -> StoreResult<ErrorGroup>;
}

/// Persistence of the pass high-water mark.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Returns the beginning-of-time sentinel when nothing was stored yet.
    async fn load(&self) -> StoreResult<Checkpoint>;
    /// Stores `position`; a position before the stored one is rejected.
    async fn advance(&self, position: CursorPosition) -> StoreResult<Checkpoint>;
}

pub(crate) fn ensure_forward(
    stored: &Checkpoint,
    requested: &CursorPosition,
) -> StoreResult<()> {
    match &stored.position {
        Some(current) if requested < current => Err(StoreError::CheckpointRegression {
            stored: current.clone(),
            requested: requested.clone(),
        }),
        _ => Ok(()),
    }
}

/// True when a page ending at `last` is already covered by the applied high-water mark.
pub(crate) fn covers(applied_through: Option<&CursorPosition>, last: &CursorPosition) -> bool {
    applied_through.is_some_and(|applied| last <= applied)
}

pub(crate) fn slice_groups(mut groups: Vec<ErrorGroup>, query: &GroupQuery) -> Vec<ErrorGroup> {
    let start = query.offset.min(groups.len());
    let mut sliced = groups.split_off(start);
    if let Some(limit) = query.limit {
        sliced.truncate(limit);
    }
    sliced
}

#[cfg(test)]
mod tests {
    use super::StoreError;

    #[test]
    fn transient_errors_are_classified() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert!(StoreError::Sqlite(busy).is_transient());
        assert!(StoreError::Unavailable("down".to_string()).is_transient());
        assert!(StoreError::Io(std::io::Error::other("disk")).is_transient());
        assert!(!StoreError::GroupNotFound("fp".to_string()).is_transient());
        assert!(!StoreError::InvalidPersistedValue {
            field: "level",
            value: "LOUD".to_string(),
        }
        .is_transient());
    }
}
