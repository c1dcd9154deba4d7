use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use sieve_classifier::Classifier;
use sieve_normalizer::RuleLibraryIssue;
use sieve_store::{CheckpointStore, FlushOutcome, GroupStore, SourceStore};
use tracing::{debug, info, instrument, warn};

use crate::aggregate::PageAggregate;
use crate::config::GrouperConfig;
use crate::pass_lock::PassLock;
use crate::retry::with_retry;
use crate::{GrouperError, GrouperResult, PassReport};

/// Runs grouping passes: scan after the checkpoint, classify, flush one page
/// at a time, then advance the checkpoint past the flushed page.
pub struct Grouper {
    source: Arc<dyn SourceStore>,
    groups: Arc<dyn GroupStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    classifier: Classifier,
    rule_issues: Vec<RuleLibraryIssue>,
    config: GrouperConfig,
    lock_path: Option<PathBuf>,
}

impl Grouper {
    pub fn new(
        source: Arc<dyn SourceStore>,
        groups: Arc<dyn GroupStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: GrouperConfig,
    ) -> GrouperResult<Self> {
        config
            .validate()
            .map_err(|error| GrouperError::Config(format!("{error:#}")))?;
        let (classifier, rule_issues) = config.build_classifier()?;
        for issue in &rule_issues {
            warn!(
                source = ?issue.source,
                rule = %issue.rule,
                reason = %issue.reason,
                "rule skipped for this pass"
            );
        }
        Ok(Self {
            source,
            groups,
            checkpoints,
            classifier,
            rule_issues,
            config,
            lock_path: None,
        })
    }

    /// Holds an exclusive lock file at `path` while a pass runs.
    pub fn with_pass_lock(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &GrouperConfig {
        &self.config
    }

    pub fn rule_issues(&self) -> &[RuleLibraryIssue] {
        &self.rule_issues
    }

    /// Processes every record after the checkpoint (up to
    /// `max_records_per_pass`). A failed flush leaves the checkpoint at the
    /// last successful page. A checkpoint that lags the group store's
    /// applied high-water mark is moved up to it before reading.
    #[instrument(
        skip(self),
        fields(
            batch_size = self.config.batch_size,
            max_records = ?self.config.max_records_per_pass
        )
    )]
    pub async fn run_pass(&mut self) -> GrouperResult<PassReport> {
        let _lock = self.lock_path.as_ref().map(PassLock::acquire).transpose()?;
        let started = Instant::now();
        let retry = &self.config.retry;
        let filter = self.config.source_filter();
        let batch_size = self.config.batch_size;
        let max_records = self.config.max_records_per_pass;

        let mut checkpoint =
            with_retry(retry, "load_checkpoint", || self.checkpoints.load()).await?;
        let applied_through =
            with_retry(retry, "applied_through", || self.groups.applied_through()).await?;
        let mut caught_up = false;
        if let Some(applied) = applied_through.filter(|applied| {
            checkpoint
                .position
                .as_ref()
                .is_none_or(|position| applied > position)
        }) {
            warn!(
                checkpoint = ?checkpoint.position,
                applied_through = %applied,
                "checkpoint is behind applied pages; moving it forward"
            );
            checkpoint = with_retry(retry, "advance_checkpoint", || {
                self.checkpoints.advance(applied.clone())
            })
            .await?;
            if let Err(error) = self.groups.prune_pages_through(&applied).await {
                warn!(%error, "failed to prune page ledger");
            }
            caught_up = true;
        }
        let mut cursor = checkpoint.position.clone();
        let mut report = PassReport::new(checkpoint, self.rule_issues.clone());
        report.checkpoint_caught_up = caught_up;
        info!(
            resume_from = %cursor
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "beginning".to_string()),
            "grouping pass started"
        );

        loop {
            let remaining = max_records.map(|max| max.saturating_sub(report.records_scanned));
            if remaining == Some(0) {
                report.truncated = true;
                break;
            }
            let limit = remaining.map_or(batch_size, |remaining| remaining.min(batch_size));

            let page = with_retry(retry, "fetch_page", || {
                self.source.fetch_page(cursor.as_ref(), limit, &filter)
            })
            .await?;
            let page_len = page.len();

            let mut aggregate = PageAggregate::new(self.config.sample_cap);
            for record in &page {
                let classification = self.classifier.classify(record);
                report.levels.increment(classification.level);
                aggregate.add(record, &classification);
            }
            let group_count = aggregate.group_count();
            let Some(flush) = aggregate.into_flush() else {
                break;
            };
            let last_position = flush.last_position.clone();
            let page_id = flush.page_id.clone();

            let outcome = with_retry(retry, "apply_page", || {
                self.groups.apply_page(flush.clone())
            })
            .await?;
            match outcome {
                FlushOutcome::Applied { created, updated } => {
                    report.pages_flushed += 1;
                    report.groups_created += created;
                    report.groups_updated += updated;
                }
                FlushOutcome::AlreadyApplied => {
                    report.pages_already_applied += 1;
                    info!(%page_id, "page already applied; advancing checkpoint only");
                }
            }

            report.checkpoint = with_retry(retry, "advance_checkpoint", || {
                self.checkpoints.advance(last_position.clone())
            })
            .await?;
            if let Err(error) = self.groups.prune_pages_through(&last_position).await {
                warn!(%error, "failed to prune page ledger");
            }

            report.records_scanned += page_len;
            debug!(
                %page_id,
                records = page_len,
                groups = group_count,
                checkpoint = %last_position,
                "page flushed"
            );
            cursor = Some(last_position);

            if page_len < limit {
                break;
            }
        }

        info!(
            records = report.records_scanned,
            pages = report.pages_flushed,
            pages_already_applied = report.pages_already_applied,
            groups_created = report.groups_created,
            groups_updated = report.groups_updated,
            checkpoint_caught_up = report.checkpoint_caught_up,
            truncated = report.truncated,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "grouping pass finished"
        );
        Ok(report)
    }
}
