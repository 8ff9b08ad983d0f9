//! The metadata-store client (C9): the async key-value interface the
//! control-plane's database sits behind. The database itself, and
//! whatever ingests records into it, are external collaborators outside
//! this system's scope — this is only the contract the streaming path
//! calls through.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::upstream::{FileType, RemoteFileHandle};

/// A resolved metadata record for one `db_id`.
#[derive(Debug, Clone)]
pub struct StoredFile {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
    pub file_unique_id: String,
    /// Where the original message lives: the channel the file was first
    /// ingested into, and its message id there. Any client can resolve a
    /// handle for itself straight from this reference via `get_messages`,
    /// independent of whether another client has already done so.
    pub channel_id: i64,
    pub msg_id: i64,
    /// Per-upstream-client cached handle. Append-only once populated: a
    /// handle for a given client never changes once minted.
    pub file_ids: HashMap<u32, RemoteFileHandle>,
    /// The message's thumbnail handle, if it has one. Any client can
    /// resolve it directly via `stream_media`, so unlike `file_ids` this
    /// isn't per-client.
    pub thumb: Option<RemoteFileHandle>,
}

impl StoredFile {
    /// Handle for `client_id`, if this record already has one cached.
    pub fn handle_for(&self, client_id: u32) -> Option<&RemoteFileHandle> {
        self.file_ids.get(&client_id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetaStoreError {
    #[error("no record for file id")]
    NotFound,
    #[error("store error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn get_file(&self, db_id: &str) -> Result<StoredFile, MetaStoreError>;

    /// Persist a freshly-minted per-client handle so later requests for
    /// the same `db_id` don't need another upstream round trip for that
    /// client.
    async fn update_file_ids(
        &self,
        db_id: &str,
        client_id: u32,
        handle: RemoteFileHandle,
    ) -> Result<(), MetaStoreError>;
}

/// In-memory `MetaStore` for tests and local development.
#[derive(Default)]
pub struct InMemoryMetaStore {
    files: Mutex<HashMap<String, StoredFile>>,
}

impl InMemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, as the ingestion control-plane would have
    /// done out-of-band.
    pub fn seed(&self, db_id: impl Into<String>, file: StoredFile) {
        self.files.lock().insert(db_id.into(), file);
    }
}

#[async_trait]
impl MetaStore for InMemoryMetaStore {
    async fn get_file(&self, db_id: &str) -> Result<StoredFile, MetaStoreError> {
        self.files
            .lock()
            .get(db_id)
            .cloned()
            .ok_or(MetaStoreError::NotFound)
    }

    async fn update_file_ids(
        &self,
        db_id: &str,
        client_id: u32,
        handle: RemoteFileHandle,
    ) -> Result<(), MetaStoreError> {
        let mut files = self.files.lock();
        let file = files.get_mut(db_id).ok_or(MetaStoreError::NotFound)?;
        file.file_ids.insert(client_id, handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_handle() -> RemoteFileHandle {
        RemoteFileHandle {
            dc_id: 2,
            media_id: 9,
            access_hash: 0,
            file_reference: vec![],
            file_type: FileType::Document,
        }
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let store = InMemoryMetaStore::new();
        assert!(matches!(
            store.get_file("missing").await,
            Err(MetaStoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn update_file_ids_is_visible_on_next_get() {
        let store = InMemoryMetaStore::new();
        store.seed(
            "abc",
            StoredFile {
                file_name: "clip.mp4".into(),
                file_size: 100,
                mime_type: Some("video/mp4".into()),
                file_unique_id: "u1".into(),
                channel_id: -100123,
                msg_id: 55,
                file_ids: HashMap::new(),
                thumb: None,
            },
        );

        store.update_file_ids("abc", 1, sample_handle()).await.unwrap();
        let file = store.get_file("abc").await.unwrap();
        assert!(file.handle_for(1).is_some());
        assert!(file.handle_for(2).is_none());
    }
}
