//! In-process store, used by tests and dry runs.

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreResult;
use crate::records::{ProvenanceFlags, TweetRecord};
use crate::window::TimeWindow;

use super::{BackfillWindow, Store, StoreData, StoredTweet};

/// Store that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: Mutex<StoreData>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, event: &str, id: &str) -> StoreResult<Option<StoredTweet>> {
        Ok(self.data.lock().await.get(event, id))
    }

    async fn upsert(
        &self,
        event: &str,
        record: &TweetRecord,
        delta: ProvenanceFlags,
    ) -> StoreResult<StoredTweet> {
        Ok(self.data.lock().await.upsert(event, record, delta))
    }

    async fn add_provenance(
        &self,
        event: &str,
        id: &str,
        delta: ProvenanceFlags,
    ) -> StoreResult<Option<StoredTweet>> {
        Ok(self.data.lock().await.add_provenance(event, id, delta))
    }

    async fn list(&self, event: &str) -> StoreResult<Vec<StoredTweet>> {
        Ok(self.data.lock().await.list(event))
    }

    async fn get_windows(&self, event: &str) -> StoreResult<Vec<BackfillWindow>> {
        Ok(self.data.lock().await.windows(event))
    }

    async fn mark_window_pending(&self, event: &str, window: TimeWindow) -> StoreResult<()> {
        self.data.lock().await.mark_pending(event, window);
        Ok(())
    }

    async fn mark_window_complete(&self, event: &str, window: TimeWindow) -> StoreResult<()> {
        self.data.lock().await.mark_complete(event, window);
        Ok(())
    }

    async fn flush(&self) -> StoreResult<()> {
        Ok(())
    }
}
