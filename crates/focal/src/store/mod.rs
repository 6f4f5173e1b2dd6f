//! Persistence for collected tweets, their provenance and backfill progress.
//!
//! Everything is keyed by event: events share no collection state.

mod file;
mod memory;

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::records::{ProvenanceFlags, SourceMethod, TweetRecord};
use crate::window::{EventSpan, TimeWindow};

pub use file::JsonFileStore;
pub use memory::MemoryStore;

/// A persisted tweet row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTweet {
    pub record: TweetRecord,
    pub flags: ProvenanceFlags,
}

/// Whether a backfill window has been fully searched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    Pending,
    Complete,
}

/// A recorded backfill sub-range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackfillWindow {
    pub window: TimeWindow,
    pub status: WindowStatus,
}

/// Upsert-capable tweet store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Tweet by id.
    async fn get(&self, event: &str, id: &str) -> StoreResult<Option<StoredTweet>>;

    /// Insert `record` with exactly `delta`, or replace the stored content
    /// with `record` and union `delta` into the stored flags.
    async fn upsert(
        &self,
        event: &str,
        record: &TweetRecord,
        delta: ProvenanceFlags,
    ) -> StoreResult<StoredTweet>;

    /// Union `delta` into an existing row without touching its content.
    async fn add_provenance(
        &self,
        event: &str,
        id: &str,
        delta: ProvenanceFlags,
    ) -> StoreResult<Option<StoredTweet>>;

    /// All tweets of an event, ordered by id.
    async fn list(&self, event: &str) -> StoreResult<Vec<StoredTweet>>;

    /// Recorded backfill windows, oldest first.
    async fn get_windows(&self, event: &str) -> StoreResult<Vec<BackfillWindow>>;

    /// Record that `window` is being searched.
    async fn mark_window_pending(&self, event: &str, window: TimeWindow) -> StoreResult<()>;

    /// Record that `window` was searched to completion.
    async fn mark_window_complete(&self, event: &str, window: TimeWindow) -> StoreResult<()>;

    /// Make everything written so far durable.
    async fn flush(&self) -> StoreResult<()>;

    /// Earliest and latest creation time of tweets that were primary results
    /// of any of `sources`.
    async fn span(&self, event: &str, sources: &[SourceMethod]) -> StoreResult<Option<EventSpan>> {
        let tweets = self.list(event).await?;
        Ok(span_of(
            tweets
                .iter()
                .filter(|t| sources.iter().any(|s| t.flags.has_direct(*s))),
        ))
    }
}

/// Span of creation times over `tweets`.
pub fn span_of<'a>(tweets: impl IntoIterator<Item = &'a StoredTweet>) -> Option<EventSpan> {
    tweets
        .into_iter()
        .filter_map(|t| t.record.created_at)
        .fold(None, |span, at| match span {
            None => Some(EventSpan { first: at, last: at }),
            Some(EventSpan { first, last }) => Some(EventSpan {
                first: first.min(at),
                last: last.max(at),
            }),
        })
}

/// Per-event state shared by the store implementations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct EventData {
    #[serde(default)]
    tweets: BTreeMap<String, StoredTweet>,
    #[serde(default)]
    windows: Vec<BackfillWindow>,
}

/// Whole-store state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct StoreData {
    #[serde(default)]
    events: HashMap<String, EventData>,
}

impl StoreData {
    fn event(&self, event: &str) -> Option<&EventData> {
        self.events.get(event)
    }

    fn event_mut(&mut self, event: &str) -> &mut EventData {
        self.events.entry(event.to_string()).or_default()
    }

    pub(crate) fn get(&self, event: &str, id: &str) -> Option<StoredTweet> {
        self.event(event).and_then(|e| e.tweets.get(id)).cloned()
    }

    pub(crate) fn upsert(
        &mut self,
        event: &str,
        record: &TweetRecord,
        delta: ProvenanceFlags,
    ) -> StoredTweet {
        let row = self
            .event_mut(event)
            .tweets
            .entry(record.id.clone())
            .and_modify(|row| {
                row.record = record.clone();
                row.flags.absorb(delta);
            })
            .or_insert_with(|| StoredTweet {
                record: record.clone(),
                flags: delta,
            });
        row.clone()
    }

    pub(crate) fn add_provenance(
        &mut self,
        event: &str,
        id: &str,
        delta: ProvenanceFlags,
    ) -> Option<StoredTweet> {
        let row = self.events.get_mut(event)?.tweets.get_mut(id)?;
        row.flags.absorb(delta);
        Some(row.clone())
    }

    /// Fold `row` into whatever another writer left behind. Content is
    /// replaced unless the stored record is fuller; flags are unioned.
    pub(crate) fn merge_row(&mut self, event: &str, row: StoredTweet) {
        match self.event_mut(event).tweets.entry(row.record.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(row);
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                if !current.record.is_fuller_than(&row.record) {
                    current.record = row.record;
                }
                current.flags.absorb(row.flags);
            }
        }
    }

    pub(crate) fn list(&self, event: &str) -> Vec<StoredTweet> {
        self.event(event)
            .map(|e| e.tweets.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn windows(&self, event: &str) -> Vec<BackfillWindow> {
        let mut windows = self.event(event).map(|e| e.windows.clone()).unwrap_or_default();
        windows.sort_by_key(|w| w.window.start);
        windows
    }

    /// Pending windows never overlap each other: older pending pieces that
    /// overlap the new one are cut back.
    pub(crate) fn mark_pending(&mut self, event: &str, window: TimeWindow) {
        let data = self.event_mut(event);
        data.windows = cut_pending(std::mem::take(&mut data.windows), window);
        data.windows.push(BackfillWindow {
            window,
            status: WindowStatus::Pending,
        });
    }

    /// Complete windows are coalesced so they never overlap.
    pub(crate) fn mark_complete(&mut self, event: &str, window: TimeWindow) {
        let data = self.event_mut(event);
        let windows = cut_pending(std::mem::take(&mut data.windows), window);

        let (mut complete, pending): (Vec<_>, Vec<_>) = windows
            .into_iter()
            .partition(|w| w.status == WindowStatus::Complete);
        complete.push(BackfillWindow {
            window,
            status: WindowStatus::Complete,
        });
        complete.sort_by_key(|w| w.window.start);

        let mut merged: Vec<BackfillWindow> = Vec::with_capacity(complete.len());
        for w in complete {
            match merged.last_mut() {
                Some(last) if w.window.start <= last.window.end => {
                    last.window.end = last.window.end.max(w.window.end);
                }
                _ => merged.push(w),
            }
        }

        merged.extend(pending);
        data.windows = merged;
    }

    /// Reject snapshots whose complete windows overlap.
    pub(crate) fn check(&self) -> StoreResult<()> {
        for (name, data) in &self.events {
            let mut complete: Vec<TimeWindow> = data
                .windows
                .iter()
                .filter(|w| w.status == WindowStatus::Complete)
                .map(|w| w.window)
                .collect();
            complete.sort();
            if let Some(pair) = complete.windows(2).find(|p| p[0].overlaps(&p[1])) {
                return Err(StoreError::Corrupt(format!(
                    "event '{name}' has overlapping complete windows {} and {}",
                    pair[0], pair[1]
                )));
            }
            if let Some((id, _)) = data.tweets.iter().find(|(_, t)| t.flags.is_empty()) {
                return Err(StoreError::Corrupt(format!(
                    "event '{name}' tweet {id} has no provenance"
                )));
            }
        }
        Ok(())
    }
}

fn cut_pending(windows: Vec<BackfillWindow>, cut: TimeWindow) -> Vec<BackfillWindow> {
    windows
        .into_iter()
        .flat_map(|w| match w.status {
            WindowStatus::Complete => vec![w],
            WindowStatus::Pending => w
                .window
                .subtract(&[cut])
                .into_iter()
                .map(|window| BackfillWindow {
                    window,
                    status: WindowStatus::Pending,
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RecordShape;
    use chrono::{TimeZone, Utc};

    fn day(d: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2021, 8, d, 0, 0, 0).unwrap()
    }

    fn window(a: u32, b: u32) -> TimeWindow {
        TimeWindow::new(day(a), day(b)).unwrap()
    }

    #[test]
    fn test_upsert_unions_flags() {
        let mut data = StoreData::default();
        let record = TweetRecord::new("1", RecordShape::Complete);
        data.upsert("e", &record, ProvenanceFlags::tagged(SourceMethod::Search, true));
        let row = data.upsert("e", &record, ProvenanceFlags::tagged(SourceMethod::Stream, false));

        assert!(row.flags.directly_from_search && row.flags.from_stream);
        assert_eq!(data.list("e").len(), 1);
        assert!(data.list("other").is_empty());
    }

    #[test]
    fn test_complete_windows_coalesce_and_replace_pending() {
        let mut data = StoreData::default();
        data.mark_pending("e", window(1, 2));
        data.mark_pending("e", window(2, 3));
        data.mark_complete("e", window(1, 2));
        data.mark_complete("e", window(2, 3));

        let windows = data.windows("e");
        assert_eq!(
            windows,
            vec![BackfillWindow {
                window: window(1, 3),
                status: WindowStatus::Complete
            }]
        );
        data.check().unwrap();
    }

    #[test]
    fn test_pending_window_survives_sibling_completion() {
        let mut data = StoreData::default();
        data.mark_pending("e", window(1, 2));
        data.mark_pending("e", window(2, 3));
        data.mark_complete("e", window(2, 3));

        let windows = data.windows("e");
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].status, WindowStatus::Pending);
        assert_eq!(windows[0].window, window(1, 2));
        assert_eq!(windows[1].status, WindowStatus::Complete);
    }

    #[test]
    fn test_merge_row_keeps_fuller_content() {
        let mut data = StoreData::default();
        let mut complete = TweetRecord::new("1", RecordShape::Complete);
        complete.text = "full".into();
        data.upsert("e", &complete, ProvenanceFlags::tagged(SourceMethod::Search, true));

        data.merge_row(
            "e",
            StoredTweet {
                record: TweetRecord::new("1", RecordShape::Partial),
                flags: ProvenanceFlags::tagged(SourceMethod::Stream, false),
            },
        );

        let row = data.get("e", "1").unwrap();
        assert_eq!(row.record.text, "full");
        assert!(row.flags.directly_from_search && row.flags.from_stream);
    }

    #[test]
    fn test_span_of() {
        let mut a = TweetRecord::new("1", RecordShape::Complete);
        a.created_at = Some(day(3));
        let mut b = TweetRecord::new("2", RecordShape::Complete);
        b.created_at = Some(day(1));
        let rows = [
            StoredTweet {
                record: a,
                flags: ProvenanceFlags::default(),
            },
            StoredTweet {
                record: b,
                flags: ProvenanceFlags::default(),
            },
        ];
        let span = span_of(&rows).unwrap();
        assert_eq!(span.first, day(1));
        assert_eq!(span.last, day(3));
        assert!(span_of(&Vec::<StoredTweet>::new()).is_none());
    }
}
