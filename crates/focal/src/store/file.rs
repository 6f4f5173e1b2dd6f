//! JSON snapshot store.
//!
//! The whole dataset lives in memory and is written out as one pretty-printed
//! JSON file. Writes go to a sibling temp file that is renamed into place, so
//! an interrupted flush never leaves a truncated snapshot behind.
//!
//! Several collectors may hold the same file open. Every flush takes an
//! exclusive lock on `<file>.lock`, re-reads the snapshot and folds this
//! process's changes into it, so rows written by other processes survive.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::records::{ProvenanceFlags, TweetRecord};
use crate::window::TimeWindow;

use super::{BackfillWindow, Store, StoreData, StoredTweet};

#[derive(Debug, Clone, Copy)]
enum WindowMark {
    Pending(TimeWindow),
    Complete(TimeWindow),
}

/// Changes made since the last flush.
#[derive(Debug, Default)]
struct Changes {
    rows: BTreeSet<(String, String)>,
    windows: Vec<(String, WindowMark)>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.rows.is_empty() && self.windows.is_empty()
    }
}

#[derive(Debug)]
struct State {
    data: StoreData,
    changes: Changes,
}

/// Store persisted to a JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    state: Mutex<State>,
}

impl JsonFileStore {
    /// Open the snapshot at `path`, starting empty if it does not exist.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let data = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            let data: StoreData = serde_json::from_str(&content)?;
            data.check()?;
            data
        } else {
            StoreData::default()
        };
        debug!(path = %path.display(), "Opened store");
        Ok(Self {
            path,
            state: Mutex::new(State {
                data,
                changes: Changes::default(),
            }),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn save(path: &Path, state: &mut State) -> StoreResult<()> {
        if state.changes.is_empty() {
            return Ok(());
        }
        let rows: Vec<(String, StoredTweet)> = state
            .changes
            .rows
            .iter()
            .filter_map(|(event, id)| state.data.get(event, id).map(|row| (event.clone(), row)))
            .collect();
        let windows = state.changes.windows.clone();
        let target = path.to_path_buf();

        let merged = tokio::task::spawn_blocking(move || write_merged(&target, rows, &windows))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        state.data = merged;
        state.changes = Changes::default();
        debug!(path = %path.display(), "Flushed store");
        Ok(())
    }
}

/// Fold local changes into the on-disk snapshot under an exclusive lock and
/// write the result back.
fn write_merged(
    path: &Path,
    rows: Vec<(String, StoredTweet)>,
    windows: &[(String, WindowMark)],
) -> StoreResult<StoreData> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path.with_extension("json.lock"))?;
    let mut lock = fd_lock::RwLock::new(lock_file);
    let _guard = lock.write()?;

    let mut data = match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str::<StoreData>(&content)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreData::default(),
        Err(e) => return Err(e.into()),
    };
    for (event, row) in rows {
        data.merge_row(&event, row);
    }
    for (event, mark) in windows {
        match *mark {
            WindowMark::Pending(window) => data.mark_pending(event, window),
            WindowMark::Complete(window) => data.mark_complete(event, window),
        }
    }
    data.check()?;

    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(&data)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(data)
}

#[async_trait]
impl Store for JsonFileStore {
    async fn get(&self, event: &str, id: &str) -> StoreResult<Option<StoredTweet>> {
        Ok(self.state.lock().await.data.get(event, id))
    }

    async fn upsert(
        &self,
        event: &str,
        record: &TweetRecord,
        delta: ProvenanceFlags,
    ) -> StoreResult<StoredTweet> {
        let mut state = self.state.lock().await;
        state
            .changes
            .rows
            .insert((event.to_string(), record.id.clone()));
        Ok(state.data.upsert(event, record, delta))
    }

    async fn add_provenance(
        &self,
        event: &str,
        id: &str,
        delta: ProvenanceFlags,
    ) -> StoreResult<Option<StoredTweet>> {
        let mut state = self.state.lock().await;
        let row = state.data.add_provenance(event, id, delta);
        if row.is_some() {
            state.changes.rows.insert((event.to_string(), id.to_string()));
        }
        Ok(row)
    }

    async fn list(&self, event: &str) -> StoreResult<Vec<StoredTweet>> {
        Ok(self.state.lock().await.data.list(event))
    }

    async fn get_windows(&self, event: &str) -> StoreResult<Vec<BackfillWindow>> {
        Ok(self.state.lock().await.data.windows(event))
    }

    async fn mark_window_pending(&self, event: &str, window: TimeWindow) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.data.mark_pending(event, window);
        state
            .changes
            .windows
            .push((event.to_string(), WindowMark::Pending(window)));
        Self::save(&self.path, &mut state).await
    }

    /// Tweets collected for the window are flushed together with the marker.
    async fn mark_window_complete(&self, event: &str, window: TimeWindow) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.data.mark_complete(event, window);
        state
            .changes
            .windows
            .push((event.to_string(), WindowMark::Complete(window)));
        Self::save(&self.path, &mut state).await
    }

    async fn flush(&self) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        Self::save(&self.path, &mut state).await
    }
}
