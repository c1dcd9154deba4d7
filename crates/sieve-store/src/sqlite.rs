//! SQLite-backed store implementation with durable persistence.

use crate::{
    covers, ensure_forward, Checkpoint, CheckpointStore, CursorPosition, DiagnosisReport,
    DiagnosisStatus, ErrorGroup, FlushOutcome, GroupQuery, GroupStore, LogRecord, PageFlush,
    SourceFilter, SourceStore, StatusActor, StoreError, StoreResult,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sieve_types::{ClassificationLevel, Diagnosis, LogLevel, RuleRef};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the checkpoint row owned by the grouping pass.
pub const CHECKPOINT_NAME: &str = "grouper_checkpoint";

const GROUP_COLUMNS: &str = r#"
    fingerprint, group_type, group_signature, count, first_seen, last_seen,
    example_logs_json, status, report, root_cause, recommendation, completed_at,
    comments, assigned_user, audit_history_json
"#;

/// Persistent SQLite backend holding source records, groups, the page ledger
/// and the checkpoint in one database file.
#[derive(Debug)]
pub struct SqliteSieveStore {
    db_path: PathBuf,
}

impl SqliteSieveStore {
    /// Opens (or creates) the database at `path`, creating schema if needed.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_connection(&self) -> StoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        Ok(connection)
    }

    /// Loads source records; ids already present are ignored. Returns the
    /// number of rows inserted.
    pub fn insert_records(&self, records: &[LogRecord]) -> StoreResult<usize> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction()?;
        let mut inserted = 0;
        {
            let mut statement = transaction.prepare(
                r#"
                INSERT OR IGNORE INTO log_records (
                    id, timestamp, level, message, logger_name, exception_class,
                    rule_name, rule_type
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )?;
            for record in records {
                inserted += statement.execute(params![
                    record.id,
                    timestamp_to_db(record.timestamp),
                    record.level.as_str(),
                    record.message,
                    record.logger_name,
                    record.exception_class,
                    record.rule.as_ref().map(|rule| rule.name.as_str()),
                    record.rule.as_ref().map(|rule| rule.rule_type.as_str()),
                ])?;
            }
        }
        transaction.commit()?;
        Ok(inserted)
    }

    /// Number of page ids currently held in the ledger.
    pub fn applied_page_count(&self) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        let count: i64 =
            connection.query_row("SELECT COUNT(*) FROM applied_pages", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn update_group<F>(&self, fingerprint: &str, update: F) -> StoreResult<ErrorGroup>
    where
        F: FnOnce(&Connection, &mut ErrorGroup) -> StoreResult<()>,
    {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut group = load_group(&transaction, fingerprint)?
            .ok_or_else(|| StoreError::GroupNotFound(fingerprint.to_string()))?;
        update(&transaction, &mut group)?;
        transaction.commit()?;
        Ok(group)
    }
}

fn initialize_schema(connection: &Connection) -> StoreResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS log_records (
            id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            level TEXT NOT NULL,
            message TEXT NULL,
            logger_name TEXT NULL,
            exception_class TEXT NULL,
            rule_name TEXT NULL,
            rule_type TEXT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_log_records_cursor ON log_records (timestamp, id);

        CREATE TABLE IF NOT EXISTS error_groups (
            fingerprint TEXT PRIMARY KEY,
            group_type TEXT NOT NULL,
            group_signature TEXT NOT NULL,
            count INTEGER NOT NULL,
            first_seen TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            example_logs_json TEXT NOT NULL,
            status TEXT NOT NULL,
            report TEXT NULL,
            root_cause TEXT NULL,
            recommendation TEXT NULL,
            completed_at TEXT NULL,
            comments TEXT NOT NULL DEFAULT '',
            assigned_user TEXT NULL,
            audit_history_json TEXT NOT NULL DEFAULT '[]'
        );

        CREATE INDEX IF NOT EXISTS idx_error_groups_status ON error_groups (status, count);

        CREATE TABLE IF NOT EXISTS applied_pages (
            page_id TEXT PRIMARY KEY,
            last_timestamp TEXT NOT NULL,
            last_record_id TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS applied_through (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_timestamp TEXT NOT NULL,
            last_record_id TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS checkpoints (
            name TEXT PRIMARY KEY,
            last_timestamp TEXT NOT NULL,
            last_record_id TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[async_trait]
impl SourceStore for SqliteSieveStore {
    async fn fetch_page(
        &self,
        after: Option<&CursorPosition>,
        limit: usize,
        filter: &SourceFilter,
    ) -> StoreResult<Vec<LogRecord>> {
        if limit == 0 || filter.levels.as_ref().is_some_and(Vec::is_empty) {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            r#"
            SELECT id, timestamp, level, message, logger_name, exception_class, rule_name, rule_type
            FROM log_records
            WHERE 1 = 1
            "#,
        );
        let mut values = Vec::new();
        if let Some(after) = after {
            sql.push_str(" AND (timestamp, id) > (?, ?)");
            values.push(SqlValue::Text(timestamp_to_db(after.timestamp)));
            values.push(SqlValue::Text(after.record_id.clone()));
        }
        if let Some(levels) = &filter.levels {
            let placeholders = vec!["?"; levels.len()].join(", ");
            sql.push_str(&format!(" AND level IN ({placeholders})"));
            values.extend(
                levels
                    .iter()
                    .map(|level| SqlValue::Text(level.as_str().to_string())),
            );
        }
        sql.push_str(" ORDER BY timestamp ASC, id ASC LIMIT ?");
        values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&sql)?;
        let mut rows = statement.query(params_from_iter(values.iter()))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(record_from_row(row)?);
        }
        Ok(records)
    }
}

#[async_trait]
impl GroupStore for SqliteSieveStore {
    async fn apply_page(&self, flush: PageFlush) -> StoreResult<FlushOutcome> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let applied = transaction
            .query_row(
                "SELECT 1 FROM applied_pages WHERE page_id = ?1",
                params![flush.page_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        if applied.is_some()
            || covers(
                load_applied_through(&transaction)?.as_ref(),
                &flush.last_position,
            )
        {
            transaction.commit()?;
            debug!(page_id = %flush.page_id, "page already applied");
            return Ok(FlushOutcome::AlreadyApplied);
        }

        let mut created = 0;
        let mut updated = 0;
        for delta in &flush.deltas {
            match load_group(&transaction, &delta.fingerprint)? {
                Some(mut group) => {
                    group.absorb(delta, flush.sample_cap);
                    transaction.execute(
                        r#"
                        UPDATE error_groups
                        SET count = ?2, last_seen = ?3, example_logs_json = ?4
                        WHERE fingerprint = ?1
                        "#,
                        params![
                            group.fingerprint,
                            u64_to_i64(group.count),
                            timestamp_to_db(group.last_seen),
                            serialize_json(&group.example_logs)?,
                        ],
                    )?;
                    updated += 1;
                }
                None => {
                    insert_group(
                        &transaction,
                        &ErrorGroup::from_delta(delta, flush.sample_cap),
                    )?;
                    created += 1;
                }
            }
        }

        transaction.execute(
            r#"
            INSERT INTO applied_pages (page_id, last_timestamp, last_record_id, applied_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                flush.page_id,
                timestamp_to_db(flush.last_position.timestamp),
                flush.last_position.record_id,
                timestamp_to_db(Utc::now()),
            ],
        )?;
        transaction.execute(
            r#"
            INSERT INTO applied_through (id, last_timestamp, last_record_id, updated_at)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                last_timestamp = excluded.last_timestamp,
                last_record_id = excluded.last_record_id,
                updated_at = excluded.updated_at
            "#,
            params![
                timestamp_to_db(flush.last_position.timestamp),
                flush.last_position.record_id,
                timestamp_to_db(Utc::now()),
            ],
        )?;
        transaction.commit()?;
        Ok(FlushOutcome::Applied { created, updated })
    }

    async fn prune_pages_through(&self, position: &CursorPosition) -> StoreResult<usize> {
        let connection = self.open_connection()?;
        let removed = connection.execute(
            "DELETE FROM applied_pages WHERE (last_timestamp, last_record_id) <= (?1, ?2)",
            params![timestamp_to_db(position.timestamp), position.record_id],
        )?;
        Ok(removed)
    }

    async fn applied_through(&self) -> StoreResult<Option<CursorPosition>> {
        let connection = self.open_connection()?;
        load_applied_through(&connection)
    }

    async fn get_group(&self, fingerprint: &str) -> StoreResult<Option<ErrorGroup>> {
        let connection = self.open_connection()?;
        load_group(&connection, fingerprint)
    }

    async fn query_groups(&self, query: GroupQuery) -> StoreResult<Vec<ErrorGroup>> {
        if query.statuses.as_ref().is_some_and(Vec::is_empty) || query.limit == Some(0) {
            return Ok(Vec::new());
        }

        let mut sql = format!("SELECT {GROUP_COLUMNS} FROM error_groups WHERE 1 = 1");
        let mut values = Vec::new();
        if let Some(statuses) = &query.statuses {
            let placeholders = vec!["?"; statuses.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({placeholders})"));
            values.extend(
                statuses
                    .iter()
                    .map(|status| SqlValue::Text(status.as_str().to_string())),
            );
        }
        if let Some(level) = query.level {
            sql.push_str(" AND group_type = ?");
            values.push(SqlValue::Text(level.as_str().to_string()));
        }
        // SQLite only accepts OFFSET after LIMIT; -1 means no limit.
        sql.push_str(" ORDER BY count DESC, fingerprint ASC LIMIT ? OFFSET ?");
        values.push(SqlValue::Integer(
            query
                .limit
                .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX)),
        ));
        values.push(SqlValue::Integer(
            i64::try_from(query.offset).unwrap_or(i64::MAX),
        ));

        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&sql)?;
        let mut rows = statement.query(params_from_iter(values.iter()))?;
        let mut groups = Vec::new();
        while let Some(row) = rows.next()? {
            groups.push(group_from_row(row)?);
        }
        Ok(groups)
    }

    async fn transition_status(
        &self,
        fingerprint: &str,
        actor: StatusActor,
        actor_name: &str,
        next: DiagnosisStatus,
    ) -> StoreResult<ErrorGroup> {
        self.update_group(fingerprint, |connection, group| {
            if group.transition(actor, actor_name, next)? {
                connection.execute(
                    r#"
                    UPDATE error_groups SET status = ?2, audit_history_json = ?3
                    WHERE fingerprint = ?1
                    "#,
                    params![
                        group.fingerprint,
                        group.diagnosis.status.as_str(),
                        serialize_json(&group.audit_history)?,
                    ],
                )?;
            }
            Ok(())
        })
    }

    async fn record_diagnosis(
        &self,
        fingerprint: &str,
        report: DiagnosisReport,
    ) -> StoreResult<ErrorGroup> {
        self.update_group(fingerprint, |connection, group| {
            group.complete_diagnosis(report)?;
            let diagnosis = &group.diagnosis;
            connection.execute(
                r#"
                UPDATE error_groups
                SET status = ?2, report = ?3, root_cause = ?4, recommendation = ?5,
                    completed_at = ?6
                WHERE fingerprint = ?1
                "#,
                params![
                    group.fingerprint,
                    diagnosis.status.as_str(),
                    diagnosis.report,
                    diagnosis.root_cause,
                    diagnosis.recommendation,
                    diagnosis.completed_at.map(timestamp_to_db),
                ],
            )?;
            Ok(())
        })
    }

    async fn update_comments(
        &self,
        fingerprint: &str,
        actor_name: &str,
        comments: &str,
    ) -> StoreResult<ErrorGroup> {
        self.update_group(fingerprint, |connection, group| {
            if group.set_comments(actor_name, comments) {
                connection.execute(
                    r#"
                    UPDATE error_groups SET comments = ?2, audit_history_json = ?3
                    WHERE fingerprint = ?1
                    "#,
                    params![
                        group.fingerprint,
                        group.comments,
                        serialize_json(&group.audit_history)?,
                    ],
                )?;
            }
            Ok(())
        })
    }

    async fn assign_user(
        &self,
        fingerprint: &str,
        actor_name: &str,
        user: Option<&str>,
    ) -> StoreResult<ErrorGroup> {
        self.update_group(fingerprint, |connection, group| {
            if group.assign(actor_name, user) {
                connection.execute(
                    r#"
                    UPDATE error_groups SET assigned_user = ?2, audit_history_json = ?3
                    WHERE fingerprint = ?1
                    "#,
                    params![
                        group.fingerprint,
                        group.assigned_user,
                        serialize_json(&group.audit_history)?,
                    ],
                )?;
            }
            Ok(())
        })
    }
}

#[async_trait]
impl CheckpointStore for SqliteSieveStore {
    async fn load(&self) -> StoreResult<Checkpoint> {
        let connection = self.open_connection()?;
        load_checkpoint(&connection)
    }

    async fn advance(&self, position: CursorPosition) -> StoreResult<Checkpoint> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored = load_checkpoint(&transaction)?;
        ensure_forward(&stored, &position)?;

        let checkpoint = Checkpoint::at(position);
        let updated_at = checkpoint.updated_at.unwrap_or_else(Utc::now);
        if let Some(position) = &checkpoint.position {
            transaction.execute(
                r#"
                INSERT INTO checkpoints (name, last_timestamp, last_record_id, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(name) DO UPDATE SET
                    last_timestamp = excluded.last_timestamp,
                    last_record_id = excluded.last_record_id,
                    updated_at = excluded.updated_at
                "#,
                params![
                    CHECKPOINT_NAME,
                    timestamp_to_db(position.timestamp),
                    position.record_id,
                    timestamp_to_db(updated_at),
                ],
            )?;
        }
        transaction.commit()?;
        Ok(checkpoint)
    }
}

fn load_checkpoint(connection: &Connection) -> StoreResult<Checkpoint> {
    let row: Option<(String, String, String)> = connection
        .query_row(
            "SELECT last_timestamp, last_record_id, updated_at FROM checkpoints WHERE name = ?1",
            params![CHECKPOINT_NAME],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let Some((last_timestamp, record_id, updated_at)) = row else {
        return Ok(Checkpoint::beginning());
    };
    Ok(Checkpoint {
        position: Some(CursorPosition {
            timestamp: timestamp_from_db(&last_timestamp)?,
            record_id,
        }),
        updated_at: Some(timestamp_from_db(&updated_at)?),
    })
}

fn load_applied_through(connection: &Connection) -> StoreResult<Option<CursorPosition>> {
    let row: Option<(String, String)> = connection
        .query_row(
            "SELECT last_timestamp, last_record_id FROM applied_through WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(last_timestamp, record_id)| {
        Ok(CursorPosition {
            timestamp: timestamp_from_db(&last_timestamp)?,
            record_id,
        })
    })
    .transpose()
}

fn load_group(connection: &Connection, fingerprint: &str) -> StoreResult<Option<ErrorGroup>> {
    let mut statement = connection.prepare(&format!(
        "SELECT {GROUP_COLUMNS} FROM error_groups WHERE fingerprint = ?1"
    ))?;
    let mut rows = statement.query(params![fingerprint])?;
    match rows.next()? {
        Some(row) => Ok(Some(group_from_row(row)?)),
        None => Ok(None),
    }
}

fn insert_group(connection: &Connection, group: &ErrorGroup) -> StoreResult<()> {
    connection.execute(
        &format!(
            "INSERT INTO error_groups ({GROUP_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
        ),
        params![
            group.fingerprint,
            group.group_type.as_str(),
            group.group_signature,
            u64_to_i64(group.count),
            timestamp_to_db(group.first_seen),
            timestamp_to_db(group.last_seen),
            serialize_json(&group.example_logs)?,
            group.diagnosis.status.as_str(),
            group.diagnosis.report,
            group.diagnosis.root_cause,
            group.diagnosis.recommendation,
            group.diagnosis.completed_at.map(timestamp_to_db),
            group.comments,
            group.assigned_user,
            serialize_json(&group.audit_history)?,
        ],
    )?;
    Ok(())
}

fn group_from_row(row: &Row<'_>) -> StoreResult<ErrorGroup> {
    Ok(ErrorGroup {
        fingerprint: row.get(0)?,
        group_type: classification_level_from_db(&row.get::<_, String>(1)?)?,
        group_signature: row.get(2)?,
        count: i64_to_u64("count", row.get(3)?)?,
        first_seen: timestamp_from_db(&row.get::<_, String>(4)?)?,
        last_seen: timestamp_from_db(&row.get::<_, String>(5)?)?,
        example_logs: deserialize_json(&row.get::<_, String>(6)?)?,
        diagnosis: Diagnosis {
            status: diagnosis_status_from_db(&row.get::<_, String>(7)?)?,
            report: row.get(8)?,
            root_cause: row.get(9)?,
            recommendation: row.get(10)?,
            completed_at: option_timestamp_from_db(row.get(11)?)?,
        },
        comments: row.get(12)?,
        assigned_user: row.get(13)?,
        audit_history: deserialize_json(&row.get::<_, String>(14)?)?,
    })
}

fn record_from_row(row: &Row<'_>) -> StoreResult<LogRecord> {
    let rule_name: Option<String> = row.get(6)?;
    let rule_type: Option<String> = row.get(7)?;
    let rule = match (rule_name, rule_type) {
        (Some(name), Some(rule_type)) => Some(RuleRef { name, rule_type }),
        _ => None,
    };
    Ok(LogRecord {
        id: row.get(0)?,
        timestamp: timestamp_from_db(&row.get::<_, String>(1)?)?,
        level: log_level_from_db(&row.get::<_, String>(2)?)?,
        message: row.get(3)?,
        logger_name: row.get(4)?,
        exception_class: row.get(5)?,
        rule,
    })
}

fn serialize_json<T: Serialize>(value: &T) -> StoreResult<String> {
    serde_json::to_string(value).map_err(StoreError::from)
}

fn deserialize_json<T: DeserializeOwned>(value: &str) -> StoreResult<T> {
    serde_json::from_str(value).map_err(StoreError::from)
}

/// Fixed-width UTC text so lexical order in SQL matches chronological order.
fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn option_timestamp_from_db(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(timestamp_from_db).transpose()
}

fn log_level_from_db(value: &str) -> StoreResult<LogLevel> {
    LogLevel::parse(value).ok_or_else(|| StoreError::InvalidPersistedValue {
        field: "level",
        value: value.to_string(),
    })
}

fn classification_level_from_db(value: &str) -> StoreResult<ClassificationLevel> {
    ClassificationLevel::parse(value).ok_or_else(|| StoreError::InvalidPersistedValue {
        field: "group_type",
        value: value.to_string(),
    })
}

fn diagnosis_status_from_db(value: &str) -> StoreResult<DiagnosisStatus> {
    DiagnosisStatus::parse(value).ok_or_else(|| StoreError::InvalidPersistedValue {
        field: "status",
        value: value.to_string(),
    })
}

fn i64_to_u64(field: &'static str, value: i64) -> StoreResult<u64> {
    u64::try_from(value).map_err(|_| StoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
