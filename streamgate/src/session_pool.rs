//! Per-DC pool of authenticated upstream sessions (C3).
//!
//! A session is a long-lived RPC channel bound to one DC. Opening one
//! against a DC other than the client's home DC requires an
//! export/import-authorization round trip; everything else about the
//! underlying channel is the upstream client library's concern, so a
//! `Session` here is just the bookkeeping record plus an id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::sleep;
use uuid::Uuid;

use crate::upstream::{UpstreamError, UpstreamRpc};
use streamgate_core::GatewayError;

const MAX_SESSIONS_PER_DC: usize = 5;
const MAX_SESSION_RETRIES: u32 = 3;
const SOCKET_ERROR_THRESHOLD: u32 = 5;
const SOCKET_ERROR_COOLDOWN: Duration = Duration::from_secs(300);
const ACQUIRE_POLL_ATTEMPTS: u32 = 10;
const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_AUTH_IMPORT_ATTEMPTS: u32 = 6;

/// One pooled, authenticated RPC channel.
pub struct Session {
    pub id: Uuid,
    pub dc_id: u32,
    in_use: AtomicBool,
    retry_count: AtomicU32,
    socket_errors: AtomicU32,
    cooldown_until: Mutex<Option<Instant>>,
}

impl Session {
    fn fresh(dc_id: u32) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            dc_id,
            in_use: AtomicBool::new(false),
            retry_count: AtomicU32::new(0),
            socket_errors: AtomicU32::new(0),
            cooldown_until: Mutex::new(None),
        })
    }

    fn is_available(&self, now: Instant) -> bool {
        if self.in_use.load(Ordering::Acquire) {
            return false;
        }
        if self.retry_count.load(Ordering::Relaxed) >= MAX_SESSION_RETRIES {
            return false;
        }
        match *self.cooldown_until.lock() {
            Some(until) => now >= until,
            None => true,
        }
    }

    fn in_cooldown(&self) -> bool {
        self.cooldown_until.lock().is_some()
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Relaxed)
    }

    pub fn record_retry(&self) {
        self.retry_count.fetch_add(1, Ordering::Relaxed);
    }
}

/// Per-DC pools plus the background maintenance tasks described in the
/// session lifecycle (cleanup every 5 min, health check every 10 min).
pub struct SessionPool {
    pools: DashMap<u32, Arc<Mutex<Vec<Arc<Session>>>>>,
}

impl Default for SessionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionPool {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    fn pool_for(&self, dc_id: u32) -> Arc<Mutex<Vec<Arc<Session>>>> {
        self.pools
            .entry(dc_id)
            .or_insert_with(|| Arc::new(Mutex::new(Vec::new())))
            .clone()
    }

    /// Acquire a session bound to `dc_id`, creating or waiting for one as
    /// needed. Mirrors the exact fallback ladder: reuse available, else
    /// grow the pool under cap, else poll up to 10s, else force-reuse.
    pub async fn acquire(
        &self,
        client: &(dyn UpstreamRpc + Send + Sync),
        dc_id: u32,
    ) -> Result<Arc<Session>, GatewayError> {
        let pool = self.pool_for(dc_id);

        let needs_new = {
            let mut sessions = pool.lock();
            let now = Instant::now();
            for s in sessions.iter() {
                if let Some(until) = *s.cooldown_until.lock() {
                    if now >= until {
                        *s.cooldown_until.lock() = None;
                    }
                }
            }
            if let Some(session) = sessions.iter().find(|s| s.is_available(now)) {
                session.in_use.store(true, Ordering::Release);
                return Ok(session.clone());
            }
            sessions.len() < MAX_SESSIONS_PER_DC
        };

        if needs_new {
            let session = self.generate(client, dc_id).await?;
            session.in_use.store(true, Ordering::Release);
            pool.lock().push(session.clone());
            return Ok(session);
        }

        for _ in 0..ACQUIRE_POLL_ATTEMPTS {
            sleep(ACQUIRE_POLL_INTERVAL).await;
            let sessions = pool.lock();
            let now = Instant::now();
            if let Some(session) = sessions.iter().find(|s| s.is_available(now)) {
                session.in_use.store(true, Ordering::Release);
                return Ok(session.clone());
            }
        }

        let sessions = pool.lock();
        tracing::warn!(dc_id, "forced reuse of busy session, no available slot after polling");
        let session = sessions
            .iter()
            .find(|s| !s.in_cooldown())
            .or_else(|| sessions.first())
            .cloned()
            .expect("pool is non-empty: it was just grown or polled");
        session.in_use.store(true, Ordering::Release);
        Ok(session)
    }

    pub fn release(&self, session: &Arc<Session>) {
        session.in_use.store(false, Ordering::Release);
    }

    /// Open a fresh session against `dc_id`. If that's the client's home
    /// DC the existing auth key is reused directly; otherwise export an
    /// authorization from the home DC and import it, retrying up to 6
    /// times on an invalid-bytes signal.
    async fn generate(
        &self,
        client: &(dyn UpstreamRpc + Send + Sync),
        dc_id: u32,
    ) -> Result<Arc<Session>, GatewayError> {
        if dc_id == client.home_dc() {
            return Ok(Session::fresh(dc_id));
        }

        for _ in 0..MAX_AUTH_IMPORT_ATTEMPTS {
            let exported = client
                .export_authorization(dc_id)
                .await
                .map_err(|e| GatewayError::unexpected(e))?;
            match client.import_authorization(dc_id, &exported).await {
                Ok(()) => return Ok(Session::fresh(dc_id)),
                Err(UpstreamError::AuthBytesInvalid) => continue,
                Err(other) => return Err(GatewayError::unexpected(other)),
            }
        }

        Err(GatewayError::AuthExchangeFailed)
    }

    /// Increment the session's socket-error counter; past the threshold,
    /// cool it down for 5 minutes, reset the counter, and proactively
    /// spawn a replacement so the pool doesn't shrink under load.
    pub async fn handle_socket_error(
        &self,
        session: &Arc<Session>,
        client: &(dyn UpstreamRpc + Send + Sync),
    ) {
        let errors = session.socket_errors.fetch_add(1, Ordering::Relaxed) + 1;
        if errors >= SOCKET_ERROR_THRESHOLD {
            tracing::warn!(dc_id = session.dc_id, session = %session.id, "socket error threshold reached, entering cooldown");
            *session.cooldown_until.lock() = Some(Instant::now() + SOCKET_ERROR_COOLDOWN);
            session.socket_errors.store(0, Ordering::Relaxed);

            match self.generate(client, session.dc_id).await {
                Ok(replacement) => {
                    self.pool_for(session.dc_id).lock().push(replacement);
                }
                Err(err) => {
                    tracing::error!(error = %err, "failed to create replacement session");
                }
            }
        }
    }

    /// Close idle sessions past their retry/error thresholds. Keeps at
    /// least one session per DC regardless of its state.
    pub fn clean_sessions(&self) {
        for mut pool in self.pools.iter_mut() {
            let mut sessions = pool.lock();
            if sessions.len() <= 1 {
                continue;
            }
            let before = sessions.len();
            sessions.retain(|s| {
                let problematic = s.retry_count.load(Ordering::Relaxed) >= MAX_SESSION_RETRIES
                    || s.socket_errors.load(Ordering::Relaxed) >= SOCKET_ERROR_THRESHOLD;
                !(problematic && !s.in_use.load(Ordering::Acquire))
            });
            if sessions.len() != before {
                tracing::info!(removed = before - sessions.len(), "closed problematic sessions");
            }
        }
    }

    /// Lift expired cooldowns and decay sub-threshold error counts by one,
    /// giving flaky-but-recovering sessions a path back to full health.
    pub fn health_check(&self) {
        let now = Instant::now();
        for pool in self.pools.iter() {
            for session in pool.lock().iter() {
                let mut cooldown = session.cooldown_until.lock();
                if let Some(until) = *cooldown {
                    if now >= until {
                        *cooldown = None;
                    }
                }
                drop(cooldown);
                let errors = session.socket_errors.load(Ordering::Relaxed);
                if errors > 0 && errors < SOCKET_ERROR_THRESHOLD {
                    session.socket_errors.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Spawn the two periodic maintenance tasks. Returns their handles so
    /// callers can abort them on shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>) -> (tokio::task::JoinHandle<()>, tokio::task::JoinHandle<()>) {
        let clean = {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    sleep(Duration::from_secs(300)).await;
                    pool.clean_sessions();
                }
            })
        };
        let health = {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    sleep(Duration::from_secs(600)).await;
                    pool.health_check();
                }
            })
        };
        (clean, health)
    }

    pub fn session_count(&self, dc_id: u32) -> usize {
        self.pools.get(&dc_id).map(|p| p.lock().len()).unwrap_or(0)
    }
}

/// Per-DC session counts, surfaced on `/status`.
pub fn summarize(pool: &SessionPool, dc_ids: &[u32]) -> HashMap<u32, usize> {
    dc_ids.iter().map(|&dc| (dc, pool.session_count(dc))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::SimulatedUpstream;

    #[tokio::test]
    async fn acquire_reuses_released_session() {
        let pool = SessionPool::new();
        let client = SimulatedUpstream::new(1, 2);
        let session = pool.acquire(&client, 2).await.unwrap();
        let id = session.id;
        pool.release(&session);
        drop(session);

        let second = pool.acquire(&client, 2).await.unwrap();
        assert_eq!(second.id, id);
        assert_eq!(pool.session_count(2), 1);
    }

    #[tokio::test]
    async fn acquire_grows_pool_up_to_cap() {
        let pool = SessionPool::new();
        let client = SimulatedUpstream::new(1, 2);
        let mut held = Vec::new();
        for _ in 0..MAX_SESSIONS_PER_DC {
            held.push(pool.acquire(&client, 2).await.unwrap());
        }
        assert_eq!(pool.session_count(2), MAX_SESSIONS_PER_DC);
    }

    #[tokio::test]
    async fn generate_for_home_dc_needs_no_auth_exchange() {
        let pool = SessionPool::new();
        let client = SimulatedUpstream::new(1, 2);
        let session = pool.acquire(&client, 2).await.unwrap();
        assert_eq!(session.dc_id, 2);
    }

    #[tokio::test]
    async fn socket_error_threshold_triggers_cooldown_and_replacement() {
        let pool = SessionPool::new();
        let client = SimulatedUpstream::new(1, 2);
        let session = pool.acquire(&client, 2).await.unwrap();

        for _ in 0..SOCKET_ERROR_THRESHOLD {
            pool.handle_socket_error(&session, &client).await;
        }

        assert!(session.in_cooldown());
        // A replacement session should have been spawned into the pool.
        assert_eq!(pool.session_count(2), 2);
    }
}
