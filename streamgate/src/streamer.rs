//! The byte streamer (C4): range arithmetic, metadata resolution, and
//! chunk-aligned fetching from an upstream session.
//!
//! This is the busiest module in the gateway — everything upstream of it
//! (handlers) and downstream of it (session pool, upstream RPC) exists to
//! support this one lazy, cancellable sequence of byte chunks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::time::sleep;

use streamgate_cache::TtlLruCache;
use streamgate_core::{ByteStreamSender, GatewayError};

use crate::balancer::LoadBalancer;
use crate::metastore::{MetaStore, MetaStoreError, StoredFile};
use crate::session_pool::SessionPool;
use crate::upstream::{FileLocation, FileType, RemoteFileHandle, UpstreamError, UpstreamRpc};

const FAILURE_COOLDOWN: Duration = Duration::from_secs(300);
const METADATA_RESOLVE_ATTEMPTS: u32 = 3;
const CHUNK_FETCH_TIMEOUT: Duration = Duration::from_secs(20);
const CHUNK_FETCH_ATTEMPTS: u32 = 3;

/// A resolved file together with the requesting client's handle to it —
/// everything `stream` needs once range arithmetic has been done.
#[derive(Clone)]
pub struct ResolvedFile {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
    pub handle: RemoteFileHandle,
}

impl ResolvedFile {
    pub fn disposition(&self) -> &'static str {
        match &self.mime_type {
            Some(m) if m.starts_with("video/") || m.starts_with("audio/") => "inline",
            _ => "attachment",
        }
    }

    pub fn resolved_mime_type(&self) -> String {
        self.mime_type.clone().unwrap_or_else(|| {
            mime_guess_from_name(&self.file_name).unwrap_or_else(|| "application/octet-stream".to_string())
        })
    }
}

fn mime_guess_from_name(name: &str) -> Option<String> {
    let ext = name.rsplit('.').next()?.to_lowercase();
    let guessed = match ext.as_str() {
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "webm" => "video/webm",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "pdf" => "application/pdf",
        _ => return None,
    };
    Some(guessed.to_string())
}

enum ResolveAttemptError {
    FloodWait(Duration),
    Transient(GatewayError),
    Terminal(GatewayError),
}

fn map_upstream_err(err: UpstreamError) -> ResolveAttemptError {
    match err {
        UpstreamError::FloodWait(d) => ResolveAttemptError::FloodWait(d),
        UpstreamError::AuthBytesInvalid => ResolveAttemptError::Terminal(GatewayError::AuthExchangeFailed),
        other if other.is_transient_network() => ResolveAttemptError::Transient(GatewayError::unexpected(other)),
        other => ResolveAttemptError::Terminal(GatewayError::unexpected(other)),
    }
}

/// Coordinates metadata resolution and chunked fetches across the load
/// balancer, session pool, and metadata store.
pub struct Streamer {
    metastore: Arc<dyn MetaStore>,
    session_pool: Arc<SessionPool>,
    balancer: Arc<LoadBalancer>,
    metadata_cache: Arc<TtlLruCache<String, Arc<StoredFile>>>,
    failure_cooldown: DashMap<String, Instant>,
    pub chunk_size: u64,
}

/// Decrements `WorkLoad[client_id]` on drop, so every return path out of
/// `stream` — success, error, or early return — balances its increment.
struct WorkloadGuard<'a> {
    balancer: &'a LoadBalancer,
    client_id: u32,
}

impl Drop for WorkloadGuard<'_> {
    fn drop(&mut self) {
        self.balancer.decrement_load(self.client_id);
    }
}

impl Streamer {
    pub fn new(
        metastore: Arc<dyn MetaStore>,
        session_pool: Arc<SessionPool>,
        balancer: Arc<LoadBalancer>,
        metadata_cache: Arc<TtlLruCache<String, Arc<StoredFile>>>,
        chunk_size: u64,
    ) -> Self {
        Self {
            metastore,
            session_pool,
            balancer,
            metadata_cache,
            failure_cooldown: DashMap::new(),
            chunk_size,
        }
    }

    /// Resolve `db_id` to a client-specific handle, honoring the
    /// failure-cooldown table and retrying transient errors.
    pub async fn resolve(
        &self,
        client: &(dyn UpstreamRpc + Send + Sync),
        db_id: &str,
    ) -> Result<ResolvedFile, GatewayError> {
        if let Some(until) = self.failure_cooldown.get(db_id) {
            if Instant::now() < *until {
                return Err(GatewayError::Unavailable);
            }
        }

        let client_id = client.client_id();
        if let Some(cached) = self.metadata_cache.get(&db_id.to_string()) {
            if let Some(handle) = cached.handle_for(client_id) {
                return Ok(self.to_resolved(&cached, handle.clone()));
            }
        }

        let mut last_err = None;
        for attempt in 0..METADATA_RESOLVE_ATTEMPTS {
            match self.resolve_once(client, db_id).await {
                Ok(stored) => {
                    let handle = stored.handle_for(client_id).cloned().expect("just minted");
                    let resolved = self.to_resolved(&stored, handle);
                    self.metadata_cache.put(db_id.to_string(), Arc::new(stored));
                    self.failure_cooldown.remove(db_id);
                    return Ok(resolved);
                }
                Err(ResolveAttemptError::FloodWait(d)) => {
                    if attempt + 1 < METADATA_RESOLVE_ATTEMPTS {
                        tracing::warn!(db_id, wait = ?d, "flood wait during metadata resolution");
                        sleep(d).await;
                    }
                }
                Err(ResolveAttemptError::Transient(e)) => {
                    last_err = Some(e);
                    if attempt + 1 < METADATA_RESOLVE_ATTEMPTS {
                        sleep(Duration::from_secs(1)).await;
                    }
                }
                Err(ResolveAttemptError::Terminal(e)) => {
                    last_err = Some(e);
                    break;
                }
            }
        }

        let err = last_err.unwrap_or(GatewayError::Unavailable);
        if !matches!(err, GatewayError::FileNotFound) {
            self.failure_cooldown
                .insert(db_id.to_string(), Instant::now() + FAILURE_COOLDOWN);
        }
        Err(err)
    }

    /// Raw metadata lookup, bypassing per-client handle resolution. Used by
    /// `/thumb`, which only needs the thumbnail handle and never touches
    /// the chunked-fetch path.
    pub async fn metastore_lookup(&self, db_id: &str) -> Result<StoredFile, MetaStoreError> {
        self.metastore.get_file(db_id).await
    }

    fn to_resolved(&self, stored: &StoredFile, handle: RemoteFileHandle) -> ResolvedFile {
        ResolvedFile {
            file_name: stored.file_name.clone(),
            file_size: stored.file_size,
            mime_type: stored.mime_type.clone(),
            handle,
        }
    }

    async fn resolve_once(
        &self,
        client: &(dyn UpstreamRpc + Send + Sync),
        db_id: &str,
    ) -> Result<StoredFile, ResolveAttemptError> {
        let mut stored = self.metastore.get_file(db_id).await.map_err(|e| match e {
            MetaStoreError::NotFound => ResolveAttemptError::Terminal(GatewayError::FileNotFound),
            MetaStoreError::Backend(msg) => ResolveAttemptError::Transient(GatewayError::unexpected(
                std::io::Error::other(msg),
            )),
        })?;

        let client_id = client.client_id();
        if !stored.file_ids.contains_key(&client_id) {
            let handle = match stored.file_ids.values().next().cloned() {
                // Another client already has a usable handle: mint this
                // client's own by re-publishing it as a cache-sharing
                // message, rather than re-resolving the original.
                Some(existing) => client
                    .send_cached_media(0, &existing)
                    .await
                    .map_err(map_upstream_err)?,
                // First resolution by any client: look the handle up
                // straight from the message it was ingested from.
                None => client
                    .get_messages(stored.channel_id, stored.msg_id)
                    .await
                    .map_err(map_upstream_err)?,
            };
            let _ = self.metastore.update_file_ids(db_id, client_id, handle.clone()).await;
            stored.file_ids.insert(client_id, handle);
        }
        Ok(stored)
    }

    /// Construct the upstream `GetFile` location for a handle, branching
    /// on file type the way the real client library's location builder
    /// does.
    pub fn location_for(handle: &RemoteFileHandle) -> FileLocation {
        match handle.file_type {
            FileType::Photo | FileType::Document | FileType::ChatPhoto => {
                FileLocation::from_handle(handle)
            }
        }
    }

    /// Stream `[first_cut, ..part_count chunks.., last_cut]` from
    /// `location` on `dc_id`, writing each slice to `sender`. Returns once
    /// the whole range has been sent, the client disconnected, or an
    /// unrecoverable error occurred on the first chunk.
    #[allow(clippy::too_many_arguments)]
    pub async fn stream(
        &self,
        client: Arc<dyn UpstreamRpc + Send + Sync>,
        location: FileLocation,
        mut offset: u64,
        first_cut: u64,
        last_cut: u64,
        part_count: u32,
        chunk_size: u64,
        sender: ByteStreamSender,
    ) -> Result<(), GatewayError> {
        let client_id = client.client_id();
        self.balancer.increment_load(client_id);
        let _workload_guard = WorkloadGuard {
            balancer: &self.balancer,
            client_id,
        };

        let session = self.session_pool.acquire(client.as_ref(), location.dc_id).await?;

        let result = self
            .stream_parts(&client, &location, &session, &mut offset, first_cut, last_cut, part_count, chunk_size, &sender)
            .await;

        self.session_pool.release(&session);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_parts(
        &self,
        client: &Arc<dyn UpstreamRpc + Send + Sync>,
        location: &FileLocation,
        session: &Arc<crate::session_pool::Session>,
        offset: &mut u64,
        first_cut: u64,
        last_cut: u64,
        part_count: u32,
        chunk_size: u64,
        sender: &ByteStreamSender,
    ) -> Result<(), GatewayError> {
        for current_part in 1..=part_count {
            let chunk = match self.fetch_chunk_with_retry(client, location, session, *offset).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => break, // clean EOF
                Err(e) if current_part == 1 => return Err(e),
                Err(_) => {
                    tracing::warn!(part = current_part, "truncating stream after exhausting chunk retries");
                    return Ok(());
                }
            };

            let slice = slice_for_part(&chunk, current_part, part_count, first_cut, last_cut);
            if !sender.send(slice).await {
                tracing::debug!("stream cancelled: receiver dropped");
                return Ok(());
            }

            *offset += chunk_size;
        }
        Ok(())
    }

    async fn fetch_chunk_with_retry(
        &self,
        client: &Arc<dyn UpstreamRpc + Send + Sync>,
        location: &FileLocation,
        session: &Arc<crate::session_pool::Session>,
        offset: u64,
    ) -> Result<Option<Bytes>, GatewayError> {
        debug_assert_eq!(offset % self.chunk_size, 0);

        for attempt in 0..CHUNK_FETCH_ATTEMPTS {
            let call = tokio::time::timeout(
                CHUNK_FETCH_TIMEOUT,
                client.get_file(location, offset, self.chunk_size),
            )
            .await;

            match call {
                Ok(Ok(crate::upstream::FileChunk::Bytes(bytes))) => return Ok(Some(bytes)),
                Ok(Ok(crate::upstream::FileChunk::Eof)) => return Ok(None),
                Ok(Err(e)) if e.is_transient_network() && attempt + 1 < CHUNK_FETCH_ATTEMPTS => {
                    session.record_retry();
                    self.session_pool.handle_socket_error(session, client.as_ref()).await;
                    sleep(Duration::from_secs(1)).await;
                }
                Err(_elapsed) if attempt + 1 < CHUNK_FETCH_ATTEMPTS => {
                    session.record_retry();
                    self.session_pool.handle_socket_error(session, client.as_ref()).await;
                    sleep(Duration::from_secs(1)).await;
                }
                Ok(Err(e)) => return Err(GatewayError::unexpected(e)),
                Err(_elapsed) => return Err(GatewayError::RequestTimeout),
            }
        }
        unreachable!("loop always returns within its attempt budget")
    }

    /// Periodically drop stale failure-cooldown entries, mirroring the
    /// 30-minute cache-clear task.
    pub fn spawn_cooldown_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let streamer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(30 * 60)).await;
                let now = Instant::now();
                streamer.failure_cooldown.retain(|_, until| *until > now);
            }
        })
    }
}

fn slice_for_part(chunk: &Bytes, current_part: u32, part_count: u32, first_cut: u64, last_cut: u64) -> Bytes {
    let first_cut = first_cut as usize;
    let last_cut = (last_cut as usize).min(chunk.len());
    if part_count == 1 {
        chunk.slice(first_cut.min(chunk.len())..last_cut.max(first_cut.min(chunk.len())))
    } else if current_part == 1 {
        chunk.slice(first_cut.min(chunk.len())..)
    } else if current_part == part_count {
        chunk.slice(0..last_cut)
    } else {
        chunk.clone()
    }
}

/// Range arithmetic performed before `stream` is called: translates an
/// inclusive HTTP byte range into chunk-aligned fetch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangePlan {
    pub offset: u64,
    pub first_cut: u64,
    pub last_cut: u64,
    pub part_count: u32,
    pub req_length: u64,
}

impl RangePlan {
    pub fn compute(from: u64, until: u64, chunk_size: u64) -> Self {
        let offset = (from / chunk_size) * chunk_size;
        let first_cut = from - offset;
        let last_cut = until % chunk_size + 1;
        let part_count = (until / chunk_size + 1 - offset / chunk_size) as u32;
        let req_length = until - from + 1;
        Self {
            offset,
            first_cut,
            last_cut,
            part_count,
            req_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_plan_full_file_two_chunks() {
        let plan = RangePlan::compute(0, 1_048_575, 524_288);
        assert_eq!(plan.offset, 0);
        assert_eq!(plan.first_cut, 0);
        assert_eq!(plan.part_count, 2);
        assert_eq!(plan.req_length, 1_048_576);
    }

    #[test]
    fn range_plan_mid_file_single_chunk() {
        // bytes=600000-700000 of a 1,048,576-byte file, chunk_size 524288
        let plan = RangePlan::compute(600_000, 700_000, 524_288);
        assert_eq!(plan.offset, 524_288);
        assert_eq!(plan.first_cut, 600_000 - 524_288);
        assert_eq!(plan.last_cut, 700_000 % 524_288 + 1);
        assert_eq!(plan.part_count, 1);
        assert_eq!(plan.req_length, 100_001);
    }

    #[test]
    fn slice_for_single_part_applies_both_cuts() {
        let chunk = Bytes::from_static(b"0123456789");
        let slice = slice_for_part(&chunk, 1, 1, 2, 5);
        assert_eq!(&slice[..], b"234");
    }

    #[test]
    fn slice_for_first_of_many_applies_only_first_cut() {
        let chunk = Bytes::from_static(b"0123456789");
        let slice = slice_for_part(&chunk, 1, 3, 2, 5);
        assert_eq!(&slice[..], b"23456789");
    }

    #[test]
    fn slice_for_interior_part_is_unmodified() {
        let chunk = Bytes::from_static(b"0123456789");
        let slice = slice_for_part(&chunk, 2, 3, 2, 5);
        assert_eq!(&slice[..], b"0123456789");
    }

    #[test]
    fn slice_for_last_of_many_applies_only_last_cut() {
        let chunk = Bytes::from_static(b"0123456789");
        let slice = slice_for_part(&chunk, 3, 3, 2, 5);
        assert_eq!(&slice[..], b"01234");
    }
}
