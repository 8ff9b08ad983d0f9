//! HTTP route handlers (C5): `/status`, `/watch/{id}`, `/dl/{id}`,
//! `/thumb/{id}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use http::{Method, Response, StatusCode};
use streamgate_cache::TtlLruCache;
use streamgate_core::{empty_body, full_body, streaming_body, GatewayError, GatewayRequest, GatewayResponse};

use crate::balancer::LoadBalancer;
use crate::config::Config;
use crate::session_pool::{self, SessionPool};
use crate::streamer::{RangePlan, ResolvedFile, Streamer};
use crate::upstream::UpstreamRpc;

/// A cached response artifact, keyed by route-specific cache keys.
#[derive(Clone)]
enum CachedResponse {
    /// Headers-only snapshot of a `bytes=0-…` `/dl` response (§9: a
    /// deliberately weak optimization preserved from the source design).
    InitialRange(InitialRangeHeaders),
    /// A fully-rendered `/watch` page.
    Watch(Arc<String>),
    /// A fetched thumbnail, only cached when the fetch succeeded.
    Thumb(bytes::Bytes),
}

#[derive(Clone)]
struct InitialRangeHeaders {
    status: u16,
    content_type: String,
    content_range: Option<String>,
    content_length: u64,
    disposition: String,
}

/// Shared state every handler closes over.
pub struct AppState {
    pub config: Arc<Config>,
    pub clients: HashMap<u32, Arc<dyn UpstreamRpc + Send + Sync>>,
    pub balancer: Arc<LoadBalancer>,
    pub session_pool: Arc<SessionPool>,
    pub streamer: Arc<Streamer>,
    response_cache: Arc<TtlLruCache<String, CachedResponse>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        clients: HashMap<u32, Arc<dyn UpstreamRpc + Send + Sync>>,
        balancer: Arc<LoadBalancer>,
        session_pool: Arc<SessionPool>,
        streamer: Arc<Streamer>,
    ) -> Self {
        let cache_size = config.server.cache_size;
        let cache_ttl = config.server.cache_ttl;
        Self {
            config,
            clients,
            balancer,
            session_pool,
            streamer,
            response_cache: Arc::new(TtlLruCache::new(cache_size, cache_ttl)),
            started_at: Instant::now(),
        }
    }

    fn pick_client(&self, exclude: Option<u32>) -> Option<(u32, Arc<dyn UpstreamRpc + Send + Sync>)> {
        let id = self.balancer.select();
        if Some(id) != exclude {
            return self.clients.get(&id).cloned().map(|c| (id, c));
        }
        self.clients
            .iter()
            .find(|(&cid, _)| Some(cid) != exclude)
            .map(|(&cid, c)| (cid, c.clone()))
            .or_else(|| self.clients.get(&id).cloned().map(|c| (id, c)))
    }
}

/// Dispatch an inbound request to the matching route handler.
pub async fn route(state: Arc<AppState>, req: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method.clone(), segments.as_slice()) {
        (Method::GET | Method::HEAD, ["status"]) => status_handler(&state).await,
        (Method::GET | Method::HEAD, ["watch", id]) => watch_handler(&state, id).await,
        (Method::GET | Method::HEAD, ["dl", id]) => dl_handler(&state, &req, id, method == Method::HEAD).await,
        (Method::GET, ["thumb", id]) => thumb_handler(&state, id).await,
        _ => Err(GatewayError::FileNotFound),
    }
}

async fn status_handler(state: &AppState) -> Result<GatewayResponse, GatewayError> {
    let mut clients = state.balancer.status();
    clients.sort_by(|a, b| b.work_load.cmp(&a.work_load));

    let bot_username = state
        .clients
        .values()
        .next()
        .map(|c| c.bot_username().to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let dc_ids: Vec<u32> = state.clients.values().map(|c| c.home_dc()).collect();
    let sessions = session_pool::summarize(&state.session_pool, &dc_ids);

    let body = serde_json::json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "bot_username": bot_username,
        "connected_clients": state.clients.len(),
        "clients": clients,
        "sessions_per_dc": sessions,
        "version": env!("CARGO_PKG_VERSION"),
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .expect("well-formed status response"))
}

async fn watch_handler(state: &AppState, id: &str) -> Result<GatewayResponse, GatewayError> {
    let cache_key = format!("watch_{id}");
    if let Some(CachedResponse::Watch(html)) = state.response_cache.get(&cache_key) {
        return Ok(html_response(&html));
    }

    let (client_id, client) = state.pick_client(None).ok_or(GatewayError::Unavailable)?;
    let resolved = match state.streamer.resolve(client.as_ref(), id).await {
        Ok(r) => r,
        Err(e) => {
            state.balancer.mark_unhealthy(client_id);
            return Err(e);
        }
    };

    let html = render_watch_page(state, id, &resolved);
    let html = Arc::new(html);
    state
        .response_cache
        .put(cache_key, CachedResponse::Watch(html.clone()));
    Ok(html_response(&html))
}

fn html_response(html: &str) -> GatewayResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(html.to_string()))
        .expect("well-formed watch response")
}

fn render_watch_page(state: &AppState, id: &str, resolved: &ResolvedFile) -> String {
    let download_url = format!("{}dl/{}", state.config.server.public_url(), id);
    format!(
        "<!DOCTYPE html><html><head><title>{name}</title></head><body>\
         <h1>{name}</h1><p>{size} bytes</p>\
         <video controls src=\"{url}\" style=\"max-width:100%\"></video>\
         <p><a href=\"{url}\">Download</a></p></body></html>",
        name = html_escape(&resolved.file_name),
        size = resolved.file_size,
        url = download_url,
    )
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn json_message(message: &str) -> GatewayResponse {
    let body = serde_json::json!({ "message": message });
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .expect("well-formed thumb notice")
}

async fn thumb_handler(state: &AppState, id: &str) -> Result<GatewayResponse, GatewayError> {
    if !state.config.telegram.enable_thumbnails {
        return Ok(json_message("Thumbnails are disabled on this server for performance reasons"));
    }

    let cache_key = format!("thumb_{id}");
    if let Some(CachedResponse::Thumb(bytes)) = state.response_cache.get(&cache_key) {
        return Ok(thumb_response(bytes));
    }

    let (_client_id, client) = state.pick_client(None).ok_or(GatewayError::Unavailable)?;
    let file = match state.streamer.metastore_lookup(id).await {
        Ok(file) => file,
        Err(_) => return Ok(json_message("Thumbnail Not found")),
    };
    let Some(thumb) = file.thumb else {
        return Ok(json_message("Thumbnail Not found"));
    };

    let bytes = match client.stream_media(&thumb).await {
        Ok(bytes) => bytes,
        Err(_) => return Ok(json_message("Thumbnail Not found")),
    };

    state.response_cache.put(cache_key, CachedResponse::Thumb(bytes.clone()));
    Ok(thumb_response(bytes))
}

fn thumb_response(bytes: bytes::Bytes) -> GatewayResponse {
    Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "image/jpeg")
        .header(http::header::CACHE_CONTROL, "public, max-age=31536000")
        .body(full_body(bytes))
        .expect("well-formed thumb response")
}

fn parse_range(header: Option<&str>, size: u64) -> Result<Option<(u64, u64)>, GatewayError> {
    let Some(header) = header else { return Ok(None) };
    let Some(spec) = header.strip_prefix("bytes=") else {
        return Ok(None);
    };
    let mut parts = spec.splitn(2, '-');
    let from_str = parts.next().unwrap_or("");
    let until_str = parts.next().unwrap_or("");

    let from: u64 = from_str.parse().map_err(|_| GatewayError::RangeNotSatisfiable { size })?;
    let until: u64 = if until_str.is_empty() {
        size.saturating_sub(1)
    } else {
        until_str.parse().map_err(|_| GatewayError::RangeNotSatisfiable { size })?
    };

    if size == 0 || from > until || until >= size {
        return Err(GatewayError::RangeNotSatisfiable { size });
    }
    Ok(Some((from, until)))
}

async fn dl_handler(
    state: &AppState,
    req: &GatewayRequest,
    id: &str,
    is_head: bool,
) -> Result<GatewayResponse, GatewayError> {
    let range_header = req
        .headers()
        .get(http::header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let is_initial_range = range_header.as_deref().map(|r| r.starts_with("bytes=0-")).unwrap_or(false);
    let init_cache_key = format!("dl_{id}_init");
    if is_initial_range {
        if let Some(CachedResponse::InitialRange(cached)) = state.response_cache.get(&init_cache_key) {
            return Ok(initial_range_response(&cached));
        }
    }

    let (mut client_id, mut client) = state.pick_client(None).ok_or(GatewayError::Unavailable)?;
    let resolved = match state.streamer.resolve(client.as_ref(), id).await {
        Ok(r) => r,
        Err(_first_err) => {
            state.balancer.mark_unhealthy(client_id);
            let (alt_id, alt_client) = state.pick_client(Some(client_id)).ok_or(GatewayError::Unavailable)?;
            client_id = alt_id;
            client = alt_client;
            state.streamer.resolve(client.as_ref(), id).await?
        }
    };

    let size = resolved.file_size;
    let range = parse_range(range_header.as_deref(), size)?;
    let (from, until) = range.unwrap_or((0, size.saturating_sub(1)));
    let status = if range.is_some() { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK };

    let chunk_size = state.config.telegram.chunk_size;
    let plan = RangePlan::compute(from, until, chunk_size);

    let content_type = resolved.resolved_mime_type();
    let disposition = format!(
        "{}; filename=\"{}\"",
        resolved.disposition(),
        resolved.file_name.replace('"', "")
    );
    let content_range = range.map(|_| format!("bytes {from}-{until}/{size}"));

    let mut builder = Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, content_type.clone())
        .header(http::header::CONTENT_LENGTH, plan.req_length)
        .header(http::header::CONTENT_DISPOSITION, disposition.clone())
        .header(http::header::ACCEPT_RANGES, "bytes")
        .header(http::header::CACHE_CONTROL, "public, max-age=3600");
    if let Some(range_value) = &content_range {
        builder = builder.header(http::header::CONTENT_RANGE, range_value.clone());
    }

    if is_initial_range && plan.req_length < 1_048_576 {
        state.response_cache.put(
            init_cache_key,
            CachedResponse::InitialRange(InitialRangeHeaders {
                status: status.as_u16(),
                content_type: content_type.clone(),
                content_range: content_range.clone(),
                content_length: plan.req_length,
                disposition: disposition.clone(),
            }),
        );
    }

    if is_head {
        return Ok(builder.body(empty_body()).expect("well-formed head response"));
    }

    let (body, sender) = streaming_body();
    let location = Streamer::location_for(&resolved.handle);
    let streamer = Arc::clone(&state.streamer);
    let balancer = Arc::clone(&state.balancer);
    let request_timeout = state.config.server.request_timeout;
    let client_for_task = client.clone();

    tokio::spawn(async move {
        let started = Instant::now();
        let outcome = tokio::time::timeout(
            request_timeout,
            streamer.stream(
                client_for_task,
                location,
                plan.offset,
                plan.first_cut,
                plan.last_cut,
                plan.part_count,
                chunk_size,
                sender,
            ),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {
                balancer.record_response_time(client_id, started.elapsed().as_secs_f64());
                balancer.mark_healthy(client_id);
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, client_id, "stream ended with an error");
            }
            Err(_elapsed) => {
                tracing::warn!(client_id, "stream exceeded whole-request timeout, truncating");
            }
        }
    });

    Ok(builder.body(body).expect("well-formed streaming response"))
}

fn initial_range_response(cached: &InitialRangeHeaders) -> GatewayResponse {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK))
        .header(http::header::CONTENT_TYPE, cached.content_type.clone())
        .header(http::header::CONTENT_LENGTH, cached.content_length)
        .header(http::header::CONTENT_DISPOSITION, cached.disposition.clone())
        .header(http::header::ACCEPT_RANGES, "bytes")
        .header(http::header::CACHE_CONTROL, "public, max-age=3600");
    if let Some(range) = &cached.content_range {
        builder = builder.header(http::header::CONTENT_RANGE, range.clone());
    }
    builder.body(empty_body()).expect("well-formed cached-init response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range_defaults_until_to_size_minus_one() {
        let (from, until) = parse_range(Some("bytes=600000-"), 1_048_576).unwrap().unwrap();
        assert_eq!(from, 600_000);
        assert_eq!(until, 1_048_575);
    }

    #[test]
    fn parse_range_rejects_out_of_bounds() {
        let err = parse_range(Some("bytes=2000000-"), 1_048_576).unwrap_err();
        assert!(matches!(err, GatewayError::RangeNotSatisfiable { size: 1_048_576 }));
    }

    #[test]
    fn parse_range_absent_header_is_none() {
        assert!(parse_range(None, 1_048_576).unwrap().is_none());
    }

    #[test]
    fn parse_range_mid_file() {
        let (from, until) = parse_range(Some("bytes=600000-700000"), 1_048_576).unwrap().unwrap();
        assert_eq!(from, 600_000);
        assert_eq!(until, 700_000);
    }
}
