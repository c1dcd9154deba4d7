use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{
    covers, ensure_forward, slice_groups, Checkpoint, CheckpointStore, CursorPosition, DiagnosisReport,
    DiagnosisStatus, ErrorGroup, FlushOutcome, GroupQuery, GroupStore, LogRecord, PageFlush,
    SourceFilter, SourceStore, StatusActor, StoreError, StoreResult,
};

/// In-memory implementation of every store contract, for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemorySieveStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    records: BTreeMap<CursorPosition, LogRecord>,
    record_ids: HashSet<String>,
    groups: HashMap<String, ErrorGroup>,
    applied_pages: HashMap<String, CursorPosition>,
    applied_through: Option<CursorPosition>,
    checkpoint: Checkpoint,
}

impl InMemorySieveStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds records, ignoring ids that are already present. Returns the number inserted.
    pub async fn insert_records(&self, records: impl IntoIterator<Item = LogRecord>) -> usize {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for record in records {
            if !inner.record_ids.insert(record.id.clone()) {
                continue;
            }
            inner.records.insert(record.position(), record);
            inserted += 1;
        }
        inserted
    }

    pub async fn applied_page_count(&self) -> usize {
        self.inner.read().await.applied_pages.len()
    }

    async fn update_group<F>(&self, fingerprint: &str, update: F) -> StoreResult<ErrorGroup>
    where
        F: FnOnce(&mut ErrorGroup) -> StoreResult<()> + Send,
    {
        let mut inner = self.inner.write().await;
        let group = inner
            .groups
            .get_mut(fingerprint)
            .ok_or_else(|| StoreError::GroupNotFound(fingerprint.to_string()))?;
        let mut candidate = group.clone();
        update(&mut candidate)?;
        *group = candidate.clone();
        Ok(candidate)
    }
}

#[async_trait]
impl SourceStore for InMemorySieveStore {
    async fn fetch_page(
        &self,
        after: Option<&CursorPosition>,
        limit: usize,
        filter: &SourceFilter,
    ) -> StoreResult<Vec<LogRecord>> {
        let inner = self.inner.read().await;
        let lower = match after {
            Some(position) => Bound::Excluded(position.clone()),
            None => Bound::Unbounded,
        };
        Ok(inner
            .records
            .range((lower, Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|record| filter.matches(record))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl GroupStore for InMemorySieveStore {
    async fn apply_page(&self, flush: PageFlush) -> StoreResult<FlushOutcome> {
        let mut inner = self.inner.write().await;
        if inner.applied_pages.contains_key(&flush.page_id)
            || covers(inner.applied_through.as_ref(), &flush.last_position)
        {
            return Ok(FlushOutcome::AlreadyApplied);
        }

        let mut created = 0;
        let mut updated = 0;
        for delta in &flush.deltas {
            match inner.groups.entry(delta.fingerprint.clone()) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().absorb(delta, flush.sample_cap);
                    updated += 1;
                }
                Entry::Vacant(entry) => {
                    entry.insert(ErrorGroup::from_delta(delta, flush.sample_cap));
                    created += 1;
                }
            }
        }
        inner.applied_through = Some(flush.last_position.clone());
        inner
            .applied_pages
            .insert(flush.page_id, flush.last_position);
        Ok(FlushOutcome::Applied { created, updated })
    }

    async fn prune_pages_through(&self, position: &CursorPosition) -> StoreResult<usize> {
        let mut inner = self.inner.write().await;
        let before = inner.applied_pages.len();
        inner.applied_pages.retain(|_, last| *last > *position);
        Ok(before - inner.applied_pages.len())
    }

    async fn applied_through(&self) -> StoreResult<Option<CursorPosition>> {
        Ok(self.inner.read().await.applied_through.clone())
    }

    async fn get_group(&self, fingerprint: &str) -> StoreResult<Option<ErrorGroup>> {
        Ok(self.inner.read().await.groups.get(fingerprint).cloned())
    }

    async fn query_groups(&self, query: GroupQuery) -> StoreResult<Vec<ErrorGroup>> {
        let inner = self.inner.read().await;
        let mut groups: Vec<ErrorGroup> = inner
            .groups
            .values()
            .filter(|group| query.matches(group))
            .cloned()
            .collect();
        groups.sort_by(|left, right| {
            right
                .count
                .cmp(&left.count)
                .then_with(|| left.fingerprint.cmp(&right.fingerprint))
        });
        Ok(slice_groups(groups, &query))
    }

    async fn transition_status(
        &self,
        fingerprint: &str,
        actor: StatusActor,
        actor_name: &str,
        next: DiagnosisStatus,
    ) -> StoreResult<ErrorGroup> {
        self.update_group(fingerprint, |group| {
            group.transition(actor, actor_name, next)?;
            Ok(())
        })
        .await
    }

    async fn record_diagnosis(
        &self,
        fingerprint: &str,
        report: DiagnosisReport,
    ) -> StoreResult<ErrorGroup> {
        self.update_group(fingerprint, |group| {
            group.complete_diagnosis(report)?;
            Ok(())
        })
        .await
    }

    async fn update_comments(
        &self,
        fingerprint: &str,
        actor_name: &str,
        comments: &str,
    ) -> StoreResult<ErrorGroup> {
        self.update_group(fingerprint, |group| {
            group.set_comments(actor_name, comments);
            Ok(())
        })
        .await
    }

    async fn assign_user(
        &self,
        fingerprint: &str,
        actor_name: &str,
        user: Option<&str>,
    ) -> StoreResult<ErrorGroup> {
        self.update_group(fingerprint, |group| {
            group.assign(actor_name, user);
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl CheckpointStore for InMemorySieveStore {
    async fn load(&self) -> StoreResult<Checkpoint> {
        Ok(self.inner.read().await.checkpoint.clone())
    }

    async fn advance(&self, position: CursorPosition) -> StoreResult<Checkpoint> {
        let mut inner = self.inner.write().await;
        ensure_forward(&inner.checkpoint, &position)?;
        inner.checkpoint = Checkpoint::at(position);
        Ok(inner.checkpoint.clone())
    }
}
