use std::collections::HashMap;

use sha2::{Digest, Sha256};
use sieve_classifier::Classification;
use sieve_types::{CursorPosition, GroupDelta, LogRecord, PageFlush};

/// Deterministic id of a page: hash of its first and last cursor and record count.
pub fn page_id(first: &CursorPosition, last: &CursorPosition, record_count: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(first.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(last.to_string().as_bytes());
    hasher.update([0x1f]);
    hasher.update(record_count.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Per-fingerprint accumulation of one page. Aggregates built over disjoint
/// slices of a page can be merged before the flush.
#[derive(Debug, Clone)]
pub struct PageAggregate {
    sample_cap: usize,
    deltas: HashMap<String, GroupDelta>,
    record_count: usize,
    first: Option<CursorPosition>,
    last: Option<CursorPosition>,
}

impl PageAggregate {
    pub fn new(sample_cap: usize) -> Self {
        Self {
            sample_cap,
            deltas: HashMap::new(),
            record_count: 0,
            first: None,
            last: None,
        }
    }

    pub fn record_count(&self) -> usize {
        self.record_count
    }

    pub fn group_count(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    pub fn add(&mut self, record: &LogRecord, classification: &Classification) {
        let fingerprint = classification.fingerprint();
        self.deltas
            .entry(fingerprint.clone())
            .or_insert_with(|| {
                GroupDelta::new(
                    fingerprint,
                    classification.level,
                    classification.signature.clone(),
                    record.timestamp,
                )
            })
            .record(&record.id, record.timestamp, self.sample_cap);
        self.record_count += 1;
        self.widen(record.position());
    }

    pub fn merge(&mut self, other: PageAggregate) {
        for (fingerprint, delta) in other.deltas {
            match self.deltas.get_mut(&fingerprint) {
                Some(existing) => existing.merge(delta, self.sample_cap),
                None => {
                    self.deltas.insert(fingerprint, delta);
                }
            }
        }
        self.record_count += other.record_count;
        if let Some(first) = other.first {
            self.widen(first);
        }
        if let Some(last) = other.last {
            self.widen(last);
        }
    }

    fn widen(&mut self, position: CursorPosition) {
        if self.first.as_ref().is_none_or(|first| position < *first) {
            self.first = Some(position.clone());
        }
        if self.last.as_ref().is_none_or(|last| position > *last) {
            self.last = Some(position);
        }
    }

    /// Builds the page write, or `None` for an empty page. Deltas are ordered
    /// by fingerprint.
    pub fn into_flush(self) -> Option<PageFlush> {
        let (Some(first), Some(last)) = (self.first, self.last) else {
            return None;
        };
        let mut deltas: Vec<GroupDelta> = self.deltas.into_values().collect();
        deltas.sort_by(|left, right| left.fingerprint.cmp(&right.fingerprint));
        Some(PageFlush {
            page_id: page_id(&first, &last, self.record_count),
            last_position: last,
            deltas,
            sample_cap: self.sample_cap,
        })
    }
}
