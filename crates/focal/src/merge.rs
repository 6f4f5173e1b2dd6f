//! Merge/deduplication stage.
//!
//! The single writer of provenance flags. Every collector funnels its raw
//! records through [`MergeStage::merge`], which resolves identity against the
//! store and either inserts a new row, replaces a partial observation with a
//! fuller one, unions new flags into an existing row, or does nothing.
//!
//! Updates are serialised per tweet id through a fixed set of striped locks,
//! so two collectors that observe the same tweet at the same time cannot
//! interleave their read-modify-write cycles.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{StoreError, StoreResult};
use crate::records::{RawRecord, SourceMethod};
use crate::store::Store;

const LOCK_STRIPES: usize = 64;

/// What a merge did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// New row.
    Inserted,
    /// Content replaced by a fuller observation; flags unioned.
    Updated,
    /// Only new flags added.
    Flagged,
    /// Already known with these flags.
    Unchanged,
}

/// Per-source tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SourceCounts {
    pub received: u64,
    pub inserted: u64,
    pub updated: u64,
    pub flagged: u64,
    pub unchanged: u64,
}

impl SourceCounts {
    fn record(&mut self, outcome: MergeOutcome) {
        self.received += 1;
        match outcome {
            MergeOutcome::Inserted => self.inserted += 1,
            MergeOutcome::Updated => self.updated += 1,
            MergeOutcome::Flagged => self.flagged += 1,
            MergeOutcome::Unchanged => self.unchanged += 1,
        }
    }

    /// Add another tally into this one.
    pub fn add(&mut self, other: &SourceCounts) {
        self.received += other.received;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.flagged += other.flagged;
        self.unchanged += other.unchanged;
    }
}

/// Deduplicating writer for one event.
pub struct MergeStage {
    store: Arc<dyn Store>,
    event: String,
    stripes: Vec<Mutex<()>>,
    counts: Mutex<BTreeMap<SourceMethod, SourceCounts>>,
}

impl MergeStage {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, event: impl Into<String>) -> Self {
        Self {
            store,
            event: event.into(),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            counts: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    fn stripe(&self, id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let index = usize::try_from(hasher.finish() % LOCK_STRIPES as u64).unwrap_or(0);
        &self.stripes[index]
    }

    /// Merge one observation.
    pub async fn merge(&self, raw: RawRecord) -> StoreResult<MergeOutcome> {
        if raw.flags.is_empty() {
            return Err(StoreError::Corrupt(format!(
                "tweet {} arrived without provenance",
                raw.record.id
            )));
        }

        let outcome = {
            let _guard = self.stripe(&raw.record.id).lock().await;
            self.apply(&raw).await?
        };

        trace!(id = %raw.record.id, ?outcome, "Merged");
        let mut counts = self.counts.lock().await;
        for source in raw.flags.sources() {
            counts.entry(source).or_default().record(outcome);
        }
        Ok(outcome)
    }

    async fn apply(&self, raw: &RawRecord) -> StoreResult<MergeOutcome> {
        let event = self.event.as_str();
        let Some(existing) = self.store.get(event, &raw.record.id).await? else {
            self.store.upsert(event, &raw.record, raw.flags).await?;
            return Ok(MergeOutcome::Inserted);
        };

        if raw.record.is_fuller_than(&existing.record) {
            self.store.upsert(event, &raw.record, raw.flags).await?;
            Ok(MergeOutcome::Updated)
        } else if !existing.flags.contains(raw.flags) {
            self.store.add_provenance(event, &raw.record.id, raw.flags).await?;
            Ok(MergeOutcome::Flagged)
        } else {
            Ok(MergeOutcome::Unchanged)
        }
    }

    /// Merge a batch in order, returning how many rows were inserted.
    pub async fn merge_all(&self, records: Vec<RawRecord>) -> StoreResult<u64> {
        let mut inserted = 0;
        for raw in records {
            if self.merge(raw).await? == MergeOutcome::Inserted {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Tallies so far, keyed by source.
    pub async fn counts(&self) -> BTreeMap<SourceMethod, SourceCounts> {
        self.counts.lock().await.clone()
    }
}
