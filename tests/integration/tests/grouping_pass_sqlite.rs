use std::path::Path;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sieve_classifier::Classifier;
use sieve_grouper::{Grouper, GrouperConfig, GrouperError, RetryConfig};
use sieve_store::{
    Checkpoint, CheckpointStore, CursorPosition, DiagnosisReport, DiagnosisStatus, ErrorGroup,
    FlushOutcome, GroupQuery, GroupStore, PageFlush, SqliteSieveStore, StatusActor, StoreError,
    StoreResult,
};
use sieve_types::{ClassificationLevel, LogLevel, LogRecord};
use tempfile::tempdir;

fn at(second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0)
        .single()
        .expect("base timestamp")
        + chrono::Duration::seconds(i64::from(second))
}

/// Mixed workload: rule failures, logger patterns, unclassified noise and
/// non-error records that the default level filter skips.
fn workload() -> Vec<LogRecord> {
    let mut records = Vec::new();
    for index in 0..30u32 {
        let id = format!("rec-{index:03}");
        let record = match index % 5 {
            0 => LogRecord::new(&id, at(index), LogLevel::Error)
                .with_exception("NullPointerException")
                .with_rule("CalculateTax", "Activity")
                .with_message(format!("NPE in case CO-{}", 1000 + index)),
            1 => LogRecord::new(&id, at(index), LogLevel::Error)
                .with_logger("com.pega.DB")
                .with_message(format!("Lock failure on DB for 10.0.0.{index}")),
            2 => LogRecord::new(&id, at(index), LogLevel::Fatal)
                .with_message(format!("unexpected token at 0x{:X}", 0xA000 + index)),
            3 => LogRecord::new(&id, at(index), LogLevel::Error)
                .with_message(format!("order {} rejected", 4_000_000 + index)),
            _ => LogRecord::new(&id, at(index), LogLevel::Info).with_message("heartbeat"),
        };
        records.push(record);
    }
    records
}

fn config(batch_size: usize) -> GrouperConfig {
    GrouperConfig {
        batch_size,
        sample_cap: 3,
        retry: RetryConfig {
            max_attempts: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 1,
        },
        ..GrouperConfig::default()
    }
}

fn seeded_store(path: &Path) -> Arc<SqliteSieveStore> {
    let store = SqliteSieveStore::new(path).expect("open store");
    store.insert_records(&workload()).expect("insert workload");
    Arc::new(store)
}

fn grouper(store: &Arc<SqliteSieveStore>, batch_size: usize) -> Grouper {
    Grouper::new(store.clone(), store.clone(), store.clone(), config(batch_size)).expect("grouper")
}

async fn all_groups(store: &dyn GroupStore) -> Vec<ErrorGroup> {
    let mut groups = store
        .query_groups(GroupQuery::default())
        .await
        .expect("query groups");
    groups.sort_by(|left, right| left.fingerprint.cmp(&right.fingerprint));
    groups
}

async fn uninterrupted_groups(path: &Path, batch_size: usize) -> Vec<ErrorGroup> {
    let store = seeded_store(path);
    grouper(&store, batch_size)
        .run_pass()
        .await
        .expect("reference pass");
    all_groups(store.as_ref()).await
}

#[derive(Clone, Copy)]
enum FailurePoint {
    BeforeCommit,
    AfterCommit,
}

/// Group store that fails the `fail_on`-th page flush.
struct CrashingGroups {
    inner: Arc<SqliteSieveStore>,
    calls: AtomicUsize,
    fail_on: usize,
    point: FailurePoint,
}

impl CrashingGroups {
    fn new(inner: Arc<SqliteSieveStore>, fail_on: usize, point: FailurePoint) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            fail_on,
            point,
        }
    }
}

#[async_trait]
impl GroupStore for CrashingGroups {
    async fn apply_page(&self, flush: PageFlush) -> StoreResult<FlushOutcome> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call != self.fail_on {
            return self.inner.apply_page(flush).await;
        }
        match self.point {
            FailurePoint::BeforeCommit => {}
            FailurePoint::AfterCommit => {
                self.inner.apply_page(flush).await?;
            }
        }
        Err(StoreError::Unavailable("process killed".to_string()))
    }

    async fn applied_through(&self) -> StoreResult<Option<CursorPosition>> {
        self.inner.applied_through().await
    }

    async fn prune_pages_through(&self, position: &CursorPosition) -> StoreResult<usize> {
        self.inner.prune_pages_through(position).await
    }

    async fn get_group(&self, fingerprint: &str) -> StoreResult<Option<ErrorGroup>> {
        self.inner.get_group(fingerprint).await
    }

    async fn query_groups(&self, query: GroupQuery) -> StoreResult<Vec<ErrorGroup>> {
        self.inner.query_groups(query).await
    }

    async fn transition_status(
        &self,
        fingerprint: &str,
        actor: StatusActor,
        actor_name: &str,
        next: DiagnosisStatus,
    ) -> StoreResult<ErrorGroup> {
        self.inner
            .transition_status(fingerprint, actor, actor_name, next)
            .await
    }

    async fn record_diagnosis(
        &self,
        fingerprint: &str,
        report: DiagnosisReport,
    ) -> StoreResult<ErrorGroup> {
        self.inner.record_diagnosis(fingerprint, report).await
    }

    async fn update_comments(
        &self,
        fingerprint: &str,
        actor_name: &str,
        comments: &str,
    ) -> StoreResult<ErrorGroup> {
        self.inner
            .update_comments(fingerprint, actor_name, comments)
            .await
    }

    async fn assign_user(
        &self,
        fingerprint: &str,
        actor_name: &str,
        user: Option<&str>,
    ) -> StoreResult<ErrorGroup> {
        self.inner.assign_user(fingerprint, actor_name, user).await
    }
}

/// Checkpoint store whose `fail_on`-th advance is lost.
struct LossyCheckpoints {
    inner: Arc<SqliteSieveStore>,
    calls: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl CheckpointStore for LossyCheckpoints {
    async fn load(&self) -> StoreResult<Checkpoint> {
        self.inner.load().await
    }

    async fn advance(&self, position: CursorPosition) -> StoreResult<Checkpoint> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on {
            return Err(StoreError::Io(std::io::Error::other("disk full")));
        }
        self.inner.advance(position).await
    }
}

#[test]
fn normalization_masks_case_ids_and_dates() {
    assert_eq!(
        sieve_normalizer::normalize("Error processing case CO-12345 at 2025-01-01"),
        "Error processing case [CASE_ID] at [DATE]"
    );
}

#[tokio::test]
async fn full_pass_classifies_every_waterfall_level() {
    let temp = tempdir().expect("tempdir");
    let store = seeded_store(&temp.path().join("sieve.sqlite"));

    let report = grouper(&store, 7).run_pass().await.expect("pass");
    assert_eq!(report.records_scanned, 24);
    assert_eq!(report.levels.rule_failure, 6);
    assert_eq!(report.levels.logger_pattern, 6);
    assert_eq!(report.levels.unclassified, 12);
    assert_eq!(report.levels.total(), 24);
    assert_eq!(store.applied_page_count().expect("ledger"), 0);

    let groups = all_groups(store.as_ref()).await;
    let rule_failure = groups
        .iter()
        .find(|group| group.group_type == ClassificationLevel::RuleFailure)
        .expect("rule failure group");
    assert_eq!(
        rule_failure.group_signature,
        "NullPointerException | CalculateTax | Activity"
    );
    assert_eq!(rule_failure.count, 6);
    assert_eq!(rule_failure.example_logs, vec!["rec-000", "rec-005", "rec-010"]);
    assert_eq!(rule_failure.first_seen, at(0));
    assert_eq!(rule_failure.last_seen, at(25));

    let logger = groups
        .iter()
        .find(|group| group.group_type == ClassificationLevel::LoggerPattern)
        .expect("logger group");
    assert_eq!(logger.group_signature, "Lock failure on DB for [IP] | com.pega.DB");
    assert_eq!(logger.count, 6);

    let signatures: Vec<_> = groups
        .iter()
        .filter(|group| group.group_type == ClassificationLevel::Unclassified)
        .map(|group| (group.group_signature.as_str(), group.count))
        .collect();
    assert_eq!(signatures.len(), 2);
    assert!(signatures.contains(&("unexpected token at [HEX]", 6)));
    assert!(signatures.contains(&("order [ID] rejected", 6)));
    assert!(groups
        .iter()
        .all(|group| group.diagnosis.status == DiagnosisStatus::Pending));
}

#[tokio::test]
async fn records_differing_only_by_timestamp_and_id_share_a_group() {
    let temp = tempdir().expect("tempdir");
    let store = SqliteSieveStore::new(temp.path().join("sieve.sqlite")).expect("store");
    store
        .insert_records(&[
            LogRecord::new("a", at(1), LogLevel::Error)
                .with_message("payment 1234567 failed at 2025-03-01T12:00:01Z"),
            LogRecord::new("b", at(2), LogLevel::Error)
                .with_message("payment 7654321 failed at 2025-03-01T12:00:02Z"),
        ])
        .expect("insert");
    let store = Arc::new(store);

    grouper(&store, 10).run_pass().await.expect("pass");
    let groups = all_groups(store.as_ref()).await;
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].count, 2);
    assert_eq!(groups[0].example_logs, vec!["a", "b"]);

    let classifier = Classifier::with_defaults().expect("classifier");
    let first = LogRecord::new("x", at(9), LogLevel::Error)
        .with_message("payment 1234567 failed at 2025-03-01T12:00:01Z");
    assert_eq!(
        classifier.classify(&first).fingerprint(),
        groups[0].fingerprint
    );
}

#[tokio::test]
async fn crash_before_flush_commit_then_rerun_matches_uninterrupted_pass() {
    let temp = tempdir().expect("tempdir");
    let expected = uninterrupted_groups(&temp.path().join("reference.sqlite"), 5).await;

    let store = seeded_store(&temp.path().join("sieve.sqlite"));
    let crashing = Arc::new(CrashingGroups::new(
        store.clone(),
        3,
        FailurePoint::BeforeCommit,
    ));
    let mut interrupted =
        Grouper::new(store.clone(), crashing, store.clone(), config(5)).expect("grouper");
    let error = interrupted.run_pass().await.expect_err("crash");
    assert!(matches!(error, GrouperError::Store(StoreError::Unavailable(_))));

    let checkpoint = store.load().await.expect("checkpoint");
    assert_eq!(
        checkpoint
            .position
            .as_ref()
            .map(|position| position.record_id.as_str()),
        Some("rec-011")
    );

    let rerun = grouper(&store, 5).run_pass().await.expect("rerun");
    assert_eq!(rerun.pages_already_applied, 0);
    assert_eq!(all_groups(store.as_ref()).await, expected);
}

#[tokio::test]
async fn flush_committed_without_checkpoint_is_not_double_counted() {
    let temp = tempdir().expect("tempdir");
    let expected = uninterrupted_groups(&temp.path().join("reference.sqlite"), 5).await;

    let store = seeded_store(&temp.path().join("sieve.sqlite"));
    let crashing = Arc::new(CrashingGroups::new(
        store.clone(),
        2,
        FailurePoint::AfterCommit,
    ));
    let mut interrupted =
        Grouper::new(store.clone(), crashing, store.clone(), config(5)).expect("grouper");
    interrupted.run_pass().await.expect_err("crash after commit");
    assert_eq!(store.applied_page_count().expect("ledger"), 1);

    let rerun = grouper(&store, 5).run_pass().await.expect("rerun");
    assert!(rerun.checkpoint_caught_up);
    assert_eq!(rerun.pages_already_applied, 0);
    assert_eq!(all_groups(store.as_ref()).await, expected);
    assert_eq!(store.applied_page_count().expect("ledger"), 0);
}

#[tokio::test]
async fn lost_checkpoint_write_catches_up_to_applied_page() {
    let temp = tempdir().expect("tempdir");
    let expected = uninterrupted_groups(&temp.path().join("reference.sqlite"), 4).await;

    let store = seeded_store(&temp.path().join("sieve.sqlite"));
    let checkpoints = Arc::new(LossyCheckpoints {
        inner: store.clone(),
        calls: AtomicUsize::new(0),
        fail_on: 2,
    });
    let mut interrupted =
        Grouper::new(store.clone(), store.clone(), checkpoints, config(4)).expect("grouper");
    let error = interrupted.run_pass().await.expect_err("checkpoint failure");
    assert!(matches!(error, GrouperError::Store(StoreError::Io(_))));

    let rerun = grouper(&store, 4).run_pass().await.expect("rerun");
    assert!(rerun.checkpoint_caught_up);
    assert_eq!(rerun.pages_already_applied, 0);
    assert_eq!(all_groups(store.as_ref()).await, expected);
}

fn late_record() -> LogRecord {
    LogRecord::new("rec-030", at(30), LogLevel::Error)
        .with_logger("com.pega.DB")
        .with_message("Lock failure on DB for 10.0.0.30")
}

async fn total_count(store: &dyn GroupStore) -> u64 {
    all_groups(store).await.iter().map(|group| group.count).sum()
}

#[tokio::test]
async fn late_record_after_lost_checkpoint_on_partial_page_is_counted_once() {
    let temp = tempdir().expect("tempdir");
    let reference = seeded_store(&temp.path().join("reference.sqlite"));
    reference
        .insert_records(&[late_record()])
        .expect("insert late record");
    grouper(&reference, 50)
        .run_pass()
        .await
        .expect("reference pass");
    let expected = all_groups(reference.as_ref()).await;

    let store = seeded_store(&temp.path().join("sieve.sqlite"));
    let checkpoints = Arc::new(LossyCheckpoints {
        inner: store.clone(),
        calls: AtomicUsize::new(0),
        fail_on: 1,
    });
    let mut interrupted =
        Grouper::new(store.clone(), store.clone(), checkpoints, config(50)).expect("grouper");
    interrupted
        .run_pass()
        .await
        .expect_err("checkpoint failure");
    assert!(store.load().await.expect("checkpoint").is_beginning());
    assert_eq!(total_count(store.as_ref()).await, 24);

    store
        .insert_records(&[late_record()])
        .expect("insert late record");
    let rerun = grouper(&store, 50).run_pass().await.expect("rerun");
    assert!(rerun.checkpoint_caught_up);
    assert_eq!(rerun.records_scanned, 1);
    assert_eq!(rerun.pages_flushed, 1);
    assert_eq!(total_count(store.as_ref()).await, 25);
    assert_eq!(all_groups(store.as_ref()).await, expected);
}

#[tokio::test]
async fn rerun_with_a_different_page_size_does_not_double_count() {
    let temp = tempdir().expect("tempdir");
    let expected = uninterrupted_groups(&temp.path().join("reference.sqlite"), 10).await;

    let store = seeded_store(&temp.path().join("sieve.sqlite"));
    let checkpoints = Arc::new(LossyCheckpoints {
        inner: store.clone(),
        calls: AtomicUsize::new(0),
        fail_on: 1,
    });
    let mut limited = config(10);
    limited.max_records_per_pass = Some(3);
    let mut interrupted =
        Grouper::new(store.clone(), store.clone(), checkpoints, limited).expect("grouper");
    interrupted
        .run_pass()
        .await
        .expect_err("checkpoint failure");
    assert_eq!(total_count(store.as_ref()).await, 3);

    let rerun = grouper(&store, 10).run_pass().await.expect("rerun");
    assert!(rerun.checkpoint_caught_up);
    assert_eq!(rerun.records_scanned, 21);
    assert_eq!(rerun.pages_already_applied, 0);
    assert_eq!(total_count(store.as_ref()).await, 24);
    assert_eq!(all_groups(store.as_ref()).await, expected);
}

#[tokio::test]
async fn collaborator_fields_survive_later_passes() {
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("sieve.sqlite");
    let store = seeded_store(&path);
    let mut grouper = grouper(&store, 10);
    grouper.run_pass().await.expect("first pass");

    let fingerprint = all_groups(store.as_ref())
        .await
        .into_iter()
        .find(|group| group.group_type == ClassificationLevel::LoggerPattern)
        .expect("logger group")
        .fingerprint;

    store
        .transition_status(
            &fingerprint,
            StatusActor::Diagnoser,
            "diagnoser",
            DiagnosisStatus::InProcess,
        )
        .await
        .expect("diagnoser picks up group");
    store
        .record_diagnosis(
            &fingerprint,
            DiagnosisReport {
                report: "row lock contention".to_string(),
                root_cause: Some("long-running batch job".to_string()),
                recommendation: None,
            },
        )
        .await
        .expect("diagnosis");
    store
        .assign_user(&fingerprint, "lead", Some("sam"))
        .await
        .expect("assign");
    store
        .update_comments(&fingerprint, "sam", "tracking in ops queue")
        .await
        .expect("comment");
    let denied = store
        .transition_status(
            &fingerprint,
            StatusActor::Diagnoser,
            "diagnoser",
            DiagnosisStatus::Resolved,
        )
        .await;
    assert!(matches!(
        denied,
        Err(StoreError::InvalidStatusTransition(_))
    ));

    store
        .insert_records(&[LogRecord::new("late", at(90), LogLevel::Error)
            .with_logger("com.pega.DB")
            .with_message("Lock failure on DB for 10.9.9.9")])
        .expect("late record");
    let report = grouper.run_pass().await.expect("second pass");
    assert_eq!(report.records_scanned, 1);
    assert_eq!(report.groups_updated, 1);

    let group = store
        .get_group(&fingerprint)
        .await
        .expect("get")
        .expect("group");
    assert_eq!(group.count, 7);
    assert_eq!(group.last_seen, at(90));
    assert_eq!(group.diagnosis.status, DiagnosisStatus::DiagnosisCompleted);
    assert_eq!(group.diagnosis.report.as_deref(), Some("row lock contention"));
    assert!(group.diagnosis.completed_at.is_some());
    assert_eq!(group.assigned_user.as_deref(), Some("sam"));
    assert_eq!(group.comments, "tracking in ops queue");
    assert_eq!(group.audit_history.len(), 3);

    let pending = store
        .query_groups(GroupQuery {
            statuses: Some(vec![DiagnosisStatus::Pending]),
            ..GroupQuery::default()
        })
        .await
        .expect("pending groups");
    assert!(pending.iter().all(|group| group.fingerprint != fingerprint));
}
