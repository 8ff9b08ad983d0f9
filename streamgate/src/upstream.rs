//! The upstream RPC surface (C10): everything the gateway needs from the
//! message-platform client library, expressed as a black-box trait.
//!
//! The real client (session management, MTProto framing, flood-wait
//! handling at the transport level) is an external collaborator outside
//! this system's scope; this module only states the contract the rest of
//! the gateway calls through, plus an in-memory double for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

/// Which kind of remote location a file handle resolves to. Determines
/// how the `GetFile` location is constructed (§"Upstream location
/// construction").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Photo,
    Document,
    ChatPhoto,
}

/// The DC-bound, per-client-opaque handle to a remote file. `file_ids`
/// caches the handle as seen by each upstream client, since a handle
/// minted against client A is not directly usable by client B.
#[derive(Debug, Clone)]
pub struct RemoteFileHandle {
    pub dc_id: u32,
    pub media_id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
    pub file_type: FileType,
}

/// A location ready to hand to `GetFile`. Constructed from a
/// `RemoteFileHandle` per `FileType` (photo/document/chat-photo take
/// different raw location shapes upstream).
#[derive(Debug, Clone)]
pub struct FileLocation {
    pub dc_id: u32,
    pub media_id: i64,
    pub access_hash: i64,
    pub file_reference: Vec<u8>,
}

impl FileLocation {
    pub fn from_handle(handle: &RemoteFileHandle) -> Self {
        Self {
            dc_id: handle.dc_id,
            media_id: handle.media_id,
            access_hash: handle.access_hash,
            file_reference: handle.file_reference.clone(),
        }
    }
}

/// Exported authorization bytes for importing a session into another DC.
#[derive(Debug, Clone)]
pub struct ExportedAuthorization {
    pub id: i64,
    pub bytes: Vec<u8>,
}

/// Result of a `GetFile` call: either a chunk of bytes, or end-of-file.
#[derive(Debug, Clone)]
pub enum FileChunk {
    Bytes(bytes::Bytes),
    Eof,
}

/// Transient errors from an upstream RPC call.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("flood wait: retry after {0:?}")]
    FloodWait(Duration),
    #[error("authorization bytes invalid")]
    AuthBytesInvalid,
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream timed out")]
    Timeout,
}

impl UpstreamError {
    /// Whether this is the class of error the byte streamer retries
    /// locally (timeout, reset, OS error) rather than one that needs
    /// different handling (flood-wait, auth failure).
    pub fn is_transient_network(&self) -> bool {
        matches!(self, UpstreamError::Network(_) | UpstreamError::Timeout)
    }
}

/// Black-box RPC surface against the message platform.
#[async_trait]
pub trait UpstreamRpc: Send + Sync {
    /// This client's home DC, i.e. the DC its primary auth key belongs to.
    fn home_dc(&self) -> u32;

    /// The client's numeric id, used for routing/logging/load tracking.
    fn client_id(&self) -> u32;

    /// The bot account's `@username`, surfaced on `/status`.
    fn bot_username(&self) -> &str;

    /// Export an authorization usable to import a session on another DC.
    async fn export_authorization(&self, dc_id: u32) -> Result<ExportedAuthorization, UpstreamError>;

    /// Import a previously-exported authorization into a session bound to
    /// `dc_id`. May fail with `AuthBytesInvalid`, in which case the caller
    /// retries with a freshly exported authorization.
    async fn import_authorization(
        &self,
        dc_id: u32,
        auth: &ExportedAuthorization,
    ) -> Result<(), UpstreamError>;

    /// Fetch one chunk at `offset` of size `limit` from `location`. The
    /// byte streamer always calls this with `offset % limit == 0`.
    async fn get_file(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: u64,
    ) -> Result<FileChunk, UpstreamError>;

    /// Resolve a message's file handle, used when a `db_id`'s handle
    /// hasn't been seen by this client yet.
    async fn get_messages(&self, channel_id: i64, msg_id: i64) -> Result<RemoteFileHandle, UpstreamError>;

    /// Publish a cache-sharing message so other clients can mint their own
    /// handle for the same underlying file.
    async fn send_cached_media(&self, chat_id: i64, handle: &RemoteFileHandle) -> Result<RemoteFileHandle, UpstreamError>;

    /// Fetch a small media item (thumbnail) in full, with no chunking or
    /// range support — used only by `/thumb`.
    async fn stream_media(&self, handle: &RemoteFileHandle) -> Result<bytes::Bytes, UpstreamError>;
}

/// In-memory `UpstreamRpc` used by tests and local development: serves a
/// fixed table of handles and fabricated bytes, no network involved.
pub struct SimulatedUpstream {
    client_id: u32,
    home_dc: u32,
    username: String,
    file_bytes: Mutex<HashMap<i64, bytes::Bytes>>,
    calls: AtomicU64,
}

impl SimulatedUpstream {
    pub fn new(client_id: u32, home_dc: u32) -> Self {
        Self {
            client_id,
            home_dc,
            username: format!("sim_client_{client_id}"),
            file_bytes: Mutex::new(HashMap::new()),
            calls: AtomicU64::new(0),
        }
    }

    pub fn seed_file(&self, media_id: i64, data: bytes::Bytes) {
        self.file_bytes.lock().insert(media_id, data);
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl UpstreamRpc for SimulatedUpstream {
    fn home_dc(&self) -> u32 {
        self.home_dc
    }

    fn client_id(&self) -> u32 {
        self.client_id
    }

    fn bot_username(&self) -> &str {
        &self.username
    }

    async fn export_authorization(&self, _dc_id: u32) -> Result<ExportedAuthorization, UpstreamError> {
        Ok(ExportedAuthorization {
            id: 1,
            bytes: vec![0u8; 16],
        })
    }

    async fn import_authorization(
        &self,
        _dc_id: u32,
        _auth: &ExportedAuthorization,
    ) -> Result<(), UpstreamError> {
        Ok(())
    }

    async fn get_file(
        &self,
        location: &FileLocation,
        offset: u64,
        limit: u64,
    ) -> Result<FileChunk, UpstreamError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let data = self.file_bytes.lock().get(&location.media_id).cloned();
        let Some(data) = data else {
            return Ok(FileChunk::Eof);
        };
        let start = offset as usize;
        if start >= data.len() {
            return Ok(FileChunk::Eof);
        }
        let end = (start + limit as usize).min(data.len());
        Ok(FileChunk::Bytes(data.slice(start..end)))
    }

    async fn get_messages(&self, _channel_id: i64, msg_id: i64) -> Result<RemoteFileHandle, UpstreamError> {
        Ok(RemoteFileHandle {
            dc_id: self.home_dc,
            media_id: msg_id,
            access_hash: 0,
            file_reference: vec![],
            file_type: FileType::Document,
        })
    }

    async fn send_cached_media(&self, _chat_id: i64, handle: &RemoteFileHandle) -> Result<RemoteFileHandle, UpstreamError> {
        Ok(handle.clone())
    }

    async fn stream_media(&self, handle: &RemoteFileHandle) -> Result<bytes::Bytes, UpstreamError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.file_bytes
            .lock()
            .get(&handle.media_id)
            .cloned()
            .ok_or(UpstreamError::Network("thumbnail not found".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simulated_upstream_serves_seeded_bytes_chunk_aligned() {
        let upstream = SimulatedUpstream::new(1, 2);
        upstream.seed_file(42, bytes::Bytes::from_static(b"0123456789"));
        let location = FileLocation {
            dc_id: 2,
            media_id: 42,
            access_hash: 0,
            file_reference: vec![],
        };

        let chunk = upstream.get_file(&location, 0, 4).await.unwrap();
        match chunk {
            FileChunk::Bytes(b) => assert_eq!(&b[..], b"0123"),
            FileChunk::Eof => panic!("expected bytes"),
        }
        assert_eq!(upstream.call_count(), 1);
    }

    #[tokio::test]
    async fn get_file_past_end_returns_eof() {
        let upstream = SimulatedUpstream::new(1, 2);
        upstream.seed_file(42, bytes::Bytes::from_static(b"abc"));
        let location = FileLocation {
            dc_id: 2,
            media_id: 42,
            access_hash: 0,
            file_reference: vec![],
        };
        let chunk = upstream.get_file(&location, 10, 4).await.unwrap();
        assert!(matches!(chunk, FileChunk::Eof));
    }
}
