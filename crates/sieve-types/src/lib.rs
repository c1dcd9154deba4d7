//! Shared data types for Sieve error grouping passes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when a status transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid {kind} transition: {from:?} -> {to:?}")]
    Invalid {
        kind: &'static str,
        from: String,
        to: String,
    },
    #[error("{actor:?} may not move diagnosis status {from:?} -> {to:?}")]
    NotPermitted {
        actor: StatusActor,
        from: DiagnosisStatus,
        to: DiagnosisStatus,
    },
}

/// Severity carried by a source log record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    #[default]
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }

    /// Parses a level name case-insensitively. `WARNING` is accepted for `WARN`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "TRACE" => Some(Self::Trace),
            "DEBUG" => Some(Self::Debug),
            "INFO" => Some(Self::Info),
            "WARN" | "WARNING" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            "FATAL" => Some(Self::Fatal),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule that was executing when a record was emitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleRef {
    pub name: String,
    pub rule_type: String,
}

/// Raw application log record as read from the source store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub logger_name: Option<String>,
    #[serde(default)]
    pub exception_class: Option<String>,
    #[serde(default)]
    pub rule: Option<RuleRef>,
}

impl LogRecord {
    /// Creates a record with no classification fields.
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>, level: LogLevel) -> Self {
        Self {
            id: id.into(),
            timestamp,
            level,
            message: None,
            logger_name: None,
            exception_class: None,
            rule: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_logger(mut self, logger_name: impl Into<String>) -> Self {
        self.logger_name = Some(logger_name.into());
        self
    }

    pub fn with_exception(mut self, exception_class: impl Into<String>) -> Self {
        self.exception_class = Some(exception_class.into());
        self
    }

    pub fn with_rule(mut self, name: impl Into<String>, rule_type: impl Into<String>) -> Self {
        self.rule = Some(RuleRef {
            name: name.into(),
            rule_type: rule_type.into(),
        });
        self
    }

    /// Position of this record in the source ordering.
    pub fn position(&self) -> CursorPosition {
        CursorPosition {
            timestamp: self.timestamp,
            record_id: self.id.clone(),
        }
    }
}

/// Point in the `(timestamp, record_id)` source ordering.
///
/// Field order matters: the derived `Ord` compares timestamps first and uses the
/// record id as a tie-breaker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CursorPosition {
    pub timestamp: DateTime<Utc>,
    pub record_id: String,
}

impl fmt::Display for CursorPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.timestamp.to_rfc3339(), self.record_id)
    }
}

/// Persisted high-water mark of the last fully flushed page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// `None` is the beginning-of-time sentinel.
    pub position: Option<CursorPosition>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn beginning() -> Self {
        Self::default()
    }

    pub fn at(position: CursorPosition) -> Self {
        Self {
            position: Some(position),
            updated_at: Some(Utc::now()),
        }
    }

    pub fn is_beginning(&self) -> bool {
        self.position.is_none()
    }

    pub fn last_processed_timestamp(&self) -> Option<DateTime<Utc>> {
        self.position.as_ref().map(|position| position.timestamp)
    }
}

/// Waterfall level a record was classified at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClassificationLevel {
    RuleFailure,
    LoggerPattern,
    Custom,
    Unclassified,
}

impl ClassificationLevel {
    pub const ALL: [Self; 4] = [
        Self::RuleFailure,
        Self::LoggerPattern,
        Self::Custom,
        Self::Unclassified,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RuleFailure => "RuleFailure",
            Self::LoggerPattern => "LoggerPattern",
            Self::Custom => "Custom",
            Self::Unclassified => "Unclassified",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == value.trim())
    }
}

impl fmt::Display for ClassificationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a group's root-cause diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosisStatus {
    #[default]
    Pending,
    #[serde(alias = "IN PROCESS")]
    InProcess,
    Resolved,
    Ignore,
    #[serde(alias = "DIAGNOSIS COMPLETED", alias = "COMPLETED")]
    DiagnosisCompleted,
    #[serde(alias = "FALSE POSITIVE")]
    FalsePositive,
}

impl DiagnosisStatus {
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::InProcess,
        Self::Resolved,
        Self::Ignore,
        Self::DiagnosisCompleted,
        Self::FalsePositive,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProcess => "IN_PROCESS",
            Self::Resolved => "RESOLVED",
            Self::Ignore => "IGNORE",
            Self::DiagnosisCompleted => "DIAGNOSIS_COMPLETED",
            Self::FalsePositive => "FALSE_POSITIVE",
        }
    }

    /// Parses canonical names and the space-separated spellings operators type.
    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_uppercase().replace(' ', "_");
        match normalized.as_str() {
            "COMPLETED" => Some(Self::DiagnosisCompleted),
            other => Self::ALL.into_iter().find(|status| status.as_str() == other),
        }
    }

    /// Returns true when this status can transition to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (Self::Pending, Self::InProcess)
                | (Self::Pending, Self::DiagnosisCompleted)
                | (Self::Pending, Self::Resolved)
                | (Self::Pending, Self::Ignore)
                | (Self::Pending, Self::FalsePositive)
                | (Self::InProcess, Self::Pending)
                | (Self::InProcess, Self::DiagnosisCompleted)
                | (Self::InProcess, Self::Resolved)
                | (Self::InProcess, Self::Ignore)
                | (Self::InProcess, Self::FalsePositive)
                | (Self::DiagnosisCompleted, Self::Resolved)
                | (Self::DiagnosisCompleted, Self::Ignore)
                | (Self::DiagnosisCompleted, Self::FalsePositive)
                | (Self::Resolved, Self::Pending)
                | (Self::Ignore, Self::Pending)
                | (Self::FalsePositive, Self::Pending)
        )
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }

        Err(StatusTransitionError::Invalid {
            kind: "diagnosis_status",
            from: format!("{self:?}"),
            to: format!("{next:?}"),
        })
    }

    /// Checks both the transition table and what `actor` is allowed to write.
    pub fn ensure_transition_by(
        self,
        actor: StatusActor,
        next: Self,
    ) -> Result<(), StatusTransitionError> {
        self.ensure_transition(next)?;
        if actor.permits(self, next) {
            return Ok(());
        }

        Err(StatusTransitionError::NotPermitted {
            actor,
            from: self,
            to: next,
        })
    }

    /// Returns true when an operator has taken the group out of the triage queue.
    pub fn is_retired(self) -> bool {
        matches!(self, Self::Resolved | Self::Ignore | Self::FalsePositive)
    }

    /// Returns true once the diagnosis collaborator has written a report.
    pub fn is_diagnosed(self) -> bool {
        self == Self::DiagnosisCompleted
    }
}

impl fmt::Display for DiagnosisStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Party writing to a group's diagnosis status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusActor {
    /// The grouping pass. Assigns `PENDING` on creation and never transitions.
    Ingestion,
    /// The external root-cause diagnosis collaborator.
    Diagnoser,
    /// A human working the triage queue.
    Operator,
}

impl StatusActor {
    pub fn permits(self, from: DiagnosisStatus, to: DiagnosisStatus) -> bool {
        if from == to {
            return true;
        }
        match self {
            Self::Ingestion => false,
            Self::Diagnoser => matches!(
                (from, to),
                (
                    DiagnosisStatus::Pending | DiagnosisStatus::InProcess,
                    DiagnosisStatus::InProcess | DiagnosisStatus::DiagnosisCompleted
                )
            ),
            Self::Operator => true,
        }
    }
}

/// Diagnosis sub-record of an error group.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Diagnosis {
    pub status: DiagnosisStatus,
    #[serde(default)]
    pub report: Option<String>,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Report fields written back by the diagnosis collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub report: String,
    #[serde(default)]
    pub root_cause: Option<String>,
    #[serde(default)]
    pub recommendation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    StatusChange,
    CommentUpdate,
    Assignment,
}

/// One collaborator write recorded on a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    pub details: String,
}

impl AuditEntry {
    pub fn now(actor: impl Into<String>, action: AuditAction, details: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            actor: actor.into(),
            action,
            details: details.into(),
        }
    }
}

/// Aggregate of every record sharing a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorGroup {
    #[serde(rename = "_id")]
    pub fingerprint: String,
    pub group_type: ClassificationLevel,
    pub group_signature: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub example_logs: Vec<String>,
    #[serde(default)]
    pub diagnosis: Diagnosis,
    #[serde(default)]
    pub comments: String,
    #[serde(default)]
    pub assigned_user: Option<String>,
    #[serde(default)]
    pub audit_history: Vec<AuditEntry>,
}

impl ErrorGroup {
    /// Creates a group from the first page that matched its fingerprint.
    pub fn from_delta(delta: &GroupDelta, sample_cap: usize) -> Self {
        let mut example_logs = Vec::new();
        merge_samples(&mut example_logs, &delta.sample_refs, sample_cap);
        Self {
            fingerprint: delta.fingerprint.clone(),
            group_type: delta.level,
            group_signature: delta.signature.clone(),
            count: delta.count,
            first_seen: delta.first_seen,
            last_seen: delta.last_seen,
            example_logs,
            diagnosis: Diagnosis::default(),
            comments: String::new(),
            assigned_user: None,
            audit_history: Vec::new(),
        }
    }

    /// Applies a page delta to the ingestion-owned fields only.
    pub fn absorb(&mut self, delta: &GroupDelta, sample_cap: usize) {
        self.count = self.count.saturating_add(delta.count);
        if delta.last_seen > self.last_seen {
            self.last_seen = delta.last_seen;
        }
        merge_samples(&mut self.example_logs, &delta.sample_refs, sample_cap);
    }

    /// Moves the diagnosis status on behalf of `actor`. Returns false for a
    /// no-op self-transition, which is not audited.
    pub fn transition(
        &mut self,
        actor: StatusActor,
        actor_name: &str,
        next: DiagnosisStatus,
    ) -> Result<bool, StatusTransitionError> {
        let from = self.diagnosis.status;
        from.ensure_transition_by(actor, next)?;
        if from == next {
            return Ok(false);
        }
        self.diagnosis.status = next;
        self.audit_history.push(AuditEntry::now(
            actor_name,
            AuditAction::StatusChange,
            format!("{from} -> {next}"),
        ));
        Ok(true)
    }

    /// Stores a diagnosis report and marks the group `DIAGNOSIS_COMPLETED`.
    pub fn complete_diagnosis(
        &mut self,
        report: DiagnosisReport,
    ) -> Result<(), StatusTransitionError> {
        self.diagnosis.status.ensure_transition_by(
            StatusActor::Diagnoser,
            DiagnosisStatus::DiagnosisCompleted,
        )?;
        self.diagnosis = Diagnosis {
            status: DiagnosisStatus::DiagnosisCompleted,
            report: Some(report.report),
            root_cause: report.root_cause,
            recommendation: report.recommendation,
            completed_at: Some(Utc::now()),
        };
        Ok(())
    }

    /// Replaces operator comments. Returns false when nothing changed.
    pub fn set_comments(&mut self, actor_name: &str, comments: &str) -> bool {
        if self.comments == comments {
            return false;
        }
        self.comments = comments.to_string();
        self.audit_history.push(AuditEntry::now(
            actor_name,
            AuditAction::CommentUpdate,
            "comments updated",
        ));
        true
    }

    /// Assigns or clears the owning user. Returns false when nothing changed.
    pub fn assign(&mut self, actor_name: &str, user: Option<&str>) -> bool {
        if self.assigned_user.as_deref() == user {
            return false;
        }
        let details = match user {
            Some(user) => format!("assigned to {user}"),
            None => "unassigned".to_string(),
        };
        self.assigned_user = user.map(str::to_string);
        self.audit_history
            .push(AuditEntry::now(actor_name, AuditAction::Assignment, details));
        true
    }
}

/// Per-fingerprint accumulator for one page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDelta {
    pub fingerprint: String,
    pub level: ClassificationLevel,
    pub signature: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub sample_refs: Vec<String>,
}

impl GroupDelta {
    pub fn new(
        fingerprint: impl Into<String>,
        level: ClassificationLevel,
        signature: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            level,
            signature: signature.into(),
            count: 0,
            first_seen: timestamp,
            last_seen: timestamp,
            sample_refs: Vec::new(),
        }
    }

    /// Counts one record towards this delta.
    pub fn record(&mut self, record_id: &str, timestamp: DateTime<Utc>, sample_cap: usize) {
        self.count = self.count.saturating_add(1);
        if timestamp < self.first_seen {
            self.first_seen = timestamp;
        }
        if timestamp > self.last_seen {
            self.last_seen = timestamp;
        }
        merge_samples(
            &mut self.sample_refs,
            std::slice::from_ref(&record_id.to_string()),
            sample_cap,
        );
    }

    /// Folds another accumulator for the same fingerprint into this one.
    pub fn merge(&mut self, other: GroupDelta, sample_cap: usize) {
        self.count = self.count.saturating_add(other.count);
        self.first_seen = self.first_seen.min(other.first_seen);
        self.last_seen = self.last_seen.max(other.last_seen);
        merge_samples(&mut self.sample_refs, &other.sample_refs, sample_cap);
    }
}

/// Appends ids in order until `cap` is reached; duplicates are ignored and
/// nothing already retained is ever evicted.
pub fn merge_samples(target: &mut Vec<String>, incoming: &[String], cap: usize) {
    for id in incoming {
        if target.len() >= cap {
            break;
        }
        if !target.contains(id) {
            target.push(id.clone());
        }
    }
}

/// One page's aggregated write, applied atomically by the group store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageFlush {
    /// Deterministic id of the page contents; repeats are not re-applied.
    pub page_id: String,
    pub last_position: CursorPosition,
    pub deltas: Vec<GroupDelta>,
    pub sample_cap: usize,
}

/// Filter pushed down to the source store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFilter {
    pub levels: Option<Vec<LogLevel>>,
}

impl SourceFilter {
    pub fn matches(&self, record: &LogRecord) -> bool {
        self.levels
            .as_ref()
            .is_none_or(|levels| levels.contains(&record.level))
    }
}

/// Filter used when listing groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupQuery {
    pub statuses: Option<Vec<DiagnosisStatus>>,
    pub level: Option<ClassificationLevel>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl GroupQuery {
    pub fn matches(&self, group: &ErrorGroup) -> bool {
        self.statuses
            .as_ref()
            .is_none_or(|statuses| statuses.contains(&group.diagnosis.status))
            && self.level.is_none_or(|level| group.group_type == level)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ClassificationLevel, DiagnosisStatus, ErrorGroup, GroupDelta, LogLevel, StatusActor,
        StatusTransitionError,
    };
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn diagnosis_transitions_follow_lifecycle_table() {
        assert!(DiagnosisStatus::Pending.can_transition_to(DiagnosisStatus::InProcess));
        assert!(DiagnosisStatus::Pending.can_transition_to(DiagnosisStatus::DiagnosisCompleted));
        assert!(DiagnosisStatus::DiagnosisCompleted.can_transition_to(DiagnosisStatus::Resolved));
        assert!(DiagnosisStatus::Resolved.can_transition_to(DiagnosisStatus::Pending));
        assert!(!DiagnosisStatus::DiagnosisCompleted.can_transition_to(DiagnosisStatus::Pending));
        assert!(!DiagnosisStatus::Ignore.can_transition_to(DiagnosisStatus::Resolved));
        assert!(DiagnosisStatus::Ignore.can_transition_to(DiagnosisStatus::Ignore));
    }

    #[test]
    fn actors_are_restricted_to_their_transitions() {
        let pending = DiagnosisStatus::Pending;
        assert!(pending
            .ensure_transition_by(StatusActor::Diagnoser, DiagnosisStatus::DiagnosisCompleted)
            .is_ok());
        assert!(matches!(
            pending.ensure_transition_by(StatusActor::Diagnoser, DiagnosisStatus::Resolved),
            Err(StatusTransitionError::NotPermitted { .. })
        ));
        assert!(matches!(
            pending.ensure_transition_by(StatusActor::Ingestion, DiagnosisStatus::InProcess),
            Err(StatusTransitionError::NotPermitted { .. })
        ));
        assert!(matches!(
            DiagnosisStatus::DiagnosisCompleted
                .ensure_transition_by(StatusActor::Operator, DiagnosisStatus::InProcess),
            Err(StatusTransitionError::Invalid { .. })
        ));
    }

    #[test]
    fn status_parse_accepts_operator_spellings() {
        assert_eq!(
            DiagnosisStatus::parse("in process"),
            Some(DiagnosisStatus::InProcess)
        );
        assert_eq!(
            DiagnosisStatus::parse("COMPLETED"),
            Some(DiagnosisStatus::DiagnosisCompleted)
        );
        assert_eq!(DiagnosisStatus::parse("unknown"), None);
        assert_eq!(LogLevel::parse("warning"), Some(LogLevel::Warn));
    }

    #[test]
    fn error_group_serializes_to_document_shape() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().expect("timestamp");
        let mut delta = GroupDelta::new("abc", ClassificationLevel::LoggerPattern, "sig", at);
        delta.record("log-1", at, 5);
        let group = ErrorGroup::from_delta(&delta, 5);

        let value = serde_json::to_value(&group).expect("serialize");
        assert_eq!(value["_id"], json!("abc"));
        assert_eq!(value["group_type"], json!("LoggerPattern"));
        assert_eq!(value["count"], json!(1));
        assert_eq!(value["example_logs"], json!(["log-1"]));
        assert_eq!(value["diagnosis"]["status"], json!("PENDING"));
        assert_eq!(value["diagnosis"]["report"], json!(null));
        assert_eq!(value["assigned_user"], json!(null));

        let legacy = json!({"status": "DIAGNOSIS COMPLETED"});
        let diagnosis: super::Diagnosis = serde_json::from_value(legacy).expect("legacy status");
        assert_eq!(diagnosis.status, DiagnosisStatus::DiagnosisCompleted);
    }

    #[test]
    fn collaborator_writes_are_audited() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().expect("timestamp");
        let mut delta = GroupDelta::new("fp", ClassificationLevel::Unclassified, "sig", at);
        delta.record("log-1", at, 5);
        let mut group = ErrorGroup::from_delta(&delta, 5);

        assert!(group
            .transition(StatusActor::Operator, "ana", DiagnosisStatus::InProcess)
            .expect("to in process"));
        assert!(!group
            .transition(StatusActor::Operator, "ana", DiagnosisStatus::InProcess)
            .expect("self transition"));
        group
            .complete_diagnosis(super::DiagnosisReport {
                report: "connection pool exhausted".to_string(),
                root_cause: Some("pool size".to_string()),
                recommendation: None,
            })
            .expect("diagnosis");
        assert_eq!(group.diagnosis.status, DiagnosisStatus::DiagnosisCompleted);
        assert!(group.diagnosis.completed_at.is_some());
        assert!(group.set_comments("ana", "looking"));
        assert!(!group.set_comments("ana", "looking"));
        assert!(group.assign("ana", Some("bo")));
        assert!(group.assign("ana", None));

        let actions: Vec<_> = group.audit_history.iter().map(|entry| entry.action).collect();
        assert_eq!(
            actions,
            vec![
                super::AuditAction::StatusChange,
                super::AuditAction::CommentUpdate,
                super::AuditAction::Assignment,
                super::AuditAction::Assignment,
            ]
        );
        assert!(matches!(
            group.transition(StatusActor::Operator, "ana", DiagnosisStatus::Pending),
            Err(StatusTransitionError::Invalid { .. })
        ));
    }

    #[test]
    fn absorb_keeps_first_seen_and_caps_samples() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).single().expect("t0");
        let t1 = Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).single().expect("t1");

        let mut first = GroupDelta::new("fp", ClassificationLevel::Unclassified, "sig", t1);
        first.record("a", t1, 2);
        let mut group = ErrorGroup::from_delta(&first, 2);

        let mut second = GroupDelta::new("fp", ClassificationLevel::Unclassified, "sig", t0);
        second.record("b", t0, 2);
        second.record("c", t0, 2);
        second.record("a", t1, 2);
        assert_eq!(second.count, 3);
        assert_eq!(second.sample_refs, vec!["b", "c"]);

        group.absorb(&second, 2);
        assert_eq!(group.count, 4);
        assert_eq!(group.first_seen, t1);
        assert_eq!(group.last_seen, t1);
        assert_eq!(group.example_logs, vec!["a", "b"]);
    }
}
