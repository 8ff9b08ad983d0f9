//! Multi-client load balancer (C2).
//!
//! Picks which upstream client handles a request using a hybrid of
//! least-connections and weighted randomness: an idle, recently-unused
//! client wins outright; otherwise a weighted draw favors low load, low
//! latency, and clients that haven't been picked in a while.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;

const COOLDOWN: Duration = Duration::from_millis(1000);
const LATENCY_WINDOW_CAP: usize = 10;

struct ClientState {
    work_load: AtomicU64,
    healthy: AtomicBool,
    last_used: Mutex<Instant>,
    response_times: Mutex<VecDeque<f64>>,
}

impl ClientState {
    fn new(now: Instant) -> Self {
        Self {
            work_load: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
            last_used: Mutex::new(now - COOLDOWN - Duration::from_secs(1)),
            response_times: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW_CAP)),
        }
    }

    fn avg_response_time(&self) -> Option<f64> {
        let window = self.response_times.lock();
        if window.is_empty() {
            None
        } else {
            Some(window.iter().sum::<f64>() / window.len() as f64)
        }
    }
}

/// Per-client snapshot for `/status` and diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientStatus {
    pub client_id: u32,
    pub work_load: u64,
    pub healthy: bool,
    pub avg_response_time: f64,
    pub time_since_last_use_secs: f64,
}

/// Selects an upstream client per request, tracking load, latency, and
/// health across calls. One instance is shared (behind an `Arc`) by every
/// handler.
pub struct LoadBalancer {
    clients: Vec<u32>,
    state: DashMap<u32, ClientState>,
}

impl LoadBalancer {
    pub fn new(client_ids: impl IntoIterator<Item = u32>) -> Self {
        let clients: Vec<u32> = client_ids.into_iter().collect();
        let now = Instant::now();
        let state = DashMap::new();
        for &id in &clients {
            state.insert(id, ClientState::new(now));
        }
        tracing::info!(clients = ?clients, "load balancer initialized");
        Self { clients, state }
    }

    fn ensure_tracked(&self, id: u32) {
        self.state.entry(id).or_insert_with(|| ClientState::new(Instant::now()));
    }

    /// Current workload for a client, for callers that need to record
    /// increments/decrements directly around a stream (see the streamer).
    pub fn work_load_handle(&self, id: u32) -> u64 {
        self.ensure_tracked(id);
        self.state.get(&id).map(|s| s.work_load.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn increment_load(&self, id: u32) {
        self.ensure_tracked(id);
        if let Some(s) = self.state.get(&id) {
            s.work_load.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn decrement_load(&self, id: u32) {
        if let Some(s) = self.state.get(&id) {
            s.work_load.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |w| {
                Some(w.saturating_sub(1))
            }).ok();
        }
    }

    /// Select a client, preferring an idle one past its cooldown, else a
    /// weighted draw. Returns some client even if every one is unhealthy
    /// (degraded mode) — the system can't serve nothing.
    pub fn select(&self) -> u32 {
        for &id in &self.clients {
            self.ensure_tracked(id);
        }

        let now = Instant::now();
        let available: Vec<u32> = self
            .clients
            .iter()
            .copied()
            .filter(|id| self.state.get(id).map(|s| s.healthy.load(Ordering::Relaxed)).unwrap_or(true))
            .collect();

        if available.is_empty() {
            tracing::warn!("all clients are unhealthy, using first client as fallback");
            return self.clients[0];
        }

        let zero_load: Vec<u32> = available
            .iter()
            .copied()
            .filter(|id| {
                self.state
                    .get(id)
                    .map(|s| {
                        s.work_load.load(Ordering::Relaxed) == 0
                            && now.duration_since(*s.last_used.lock()) > COOLDOWN
                    })
                    .unwrap_or(false)
            })
            .collect();

        let selected = if !zero_load.is_empty() {
            *zero_load.choose(&mut rand::thread_rng()).unwrap()
        } else {
            self.weighted_select(&available, now)
        };

        if let Some(s) = self.state.get(&selected) {
            *s.last_used.lock() = now;
        }
        selected
    }

    fn weighted_select(&self, available: &[u32], now: Instant) -> u32 {
        let scores: Vec<f64> = available
            .iter()
            .map(|id| {
                let entry = self.state.get(id).unwrap();
                let work_load = entry.work_load.load(Ordering::Relaxed).max(1) as f64;
                let work_load_factor = 1.0 / work_load;

                let response_time_factor = match entry.avg_response_time() {
                    Some(avg) => 1.0 / avg.max(0.1),
                    None => 1.0,
                };

                let since_last_use = now.duration_since(*entry.last_used.lock()).as_secs_f64();
                let time_factor = (since_last_use / COOLDOWN.as_secs_f64()).min(5.0);

                (work_load_factor * 0.6 + response_time_factor * 0.2 + time_factor * 0.2).max(0.1)
            })
            .collect();

        let dist = WeightedIndex::new(&scores).expect("scores are all > 0");
        available[dist.sample(&mut rand::thread_rng())]
    }

    pub fn record_response_time(&self, id: u32, secs: f64) {
        self.ensure_tracked(id);
        if let Some(s) = self.state.get(&id) {
            let mut window = s.response_times.lock();
            if window.len() == LATENCY_WINDOW_CAP {
                window.pop_front();
            }
            window.push_back(secs);
        }
    }

    pub fn mark_unhealthy(&self, id: u32) {
        self.ensure_tracked(id);
        if let Some(s) = self.state.get(&id) {
            s.healthy.store(false, Ordering::Relaxed);
        }
        tracing::warn!(client_id = id, "client marked unhealthy");
    }

    pub fn mark_healthy(&self, id: u32) {
        self.ensure_tracked(id);
        if let Some(s) = self.state.get(&id) {
            s.healthy.store(true, Ordering::Relaxed);
        }
    }

    /// Snapshot of every tracked client, for `/status`.
    pub fn status(&self) -> Vec<ClientStatus> {
        let now = Instant::now();
        self.clients
            .iter()
            .filter_map(|&id| {
                self.state.get(&id).map(|s| ClientStatus {
                    client_id: id,
                    work_load: s.work_load.load(Ordering::Relaxed),
                    healthy: s.healthy.load(Ordering::Relaxed),
                    avg_response_time: s.avg_response_time().unwrap_or(0.0),
                    time_since_last_use_secs: now.duration_since(*s.last_used.lock()).as_secs_f64(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_load_client_past_cooldown_is_preferred() {
        let balancer = LoadBalancer::new([1, 2, 3]);
        balancer.increment_load(2);
        balancer.increment_load(3);
        std::thread::sleep(Duration::from_millis(1100));
        for _ in 0..20 {
            assert_eq!(balancer.select(), 1);
        }
    }

    #[test]
    fn unhealthy_client_is_excluded_until_marked_healthy_again() {
        let balancer = LoadBalancer::new([1, 2]);
        balancer.mark_unhealthy(1);
        std::thread::sleep(Duration::from_millis(1100));
        for _ in 0..20 {
            assert_eq!(balancer.select(), 2);
        }
        balancer.mark_healthy(1);
        // Now both are eligible again; just assert no panic and a valid id.
        let picked = balancer.select();
        assert!(picked == 1 || picked == 2);
    }

    #[test]
    fn all_unhealthy_still_returns_a_client() {
        let balancer = LoadBalancer::new([1, 2]);
        balancer.mark_unhealthy(1);
        balancer.mark_unhealthy(2);
        let picked = balancer.select();
        assert!(picked == 1 || picked == 2);
    }

    #[test]
    fn load_increments_and_decrements_are_tracked() {
        let balancer = LoadBalancer::new([1]);
        balancer.increment_load(1);
        balancer.increment_load(1);
        assert_eq!(balancer.work_load_handle(1), 2);
        balancer.decrement_load(1);
        assert_eq!(balancer.work_load_handle(1), 1);
    }

    #[test]
    fn status_reports_every_tracked_client() {
        let balancer = LoadBalancer::new([1, 2]);
        balancer.record_response_time(1, 0.25);
        let status = balancer.status();
        assert_eq!(status.len(), 2);
        let s1 = status.iter().find(|s| s.client_id == 1).unwrap();
        assert_eq!(s1.avg_response_time, 0.25);
    }
}
