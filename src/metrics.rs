//! Process-wide relay counters.
//!
//! Cheap atomics bumped from the queue, the connection manager and the relay
//! paths; `snapshot()` is what the status output and tests read.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

static JOBS_QUEUED: AtomicU64 = AtomicU64::new(0);
static JOBS_REJECTED: AtomicU64 = AtomicU64::new(0);
static JOBS_SENT: AtomicU64 = AtomicU64::new(0);
static JOBS_FAILED: AtomicU64 = AtomicU64::new(0);
static JOBS_ABANDONED: AtomicU64 = AtomicU64::new(0);
static RECONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static HEALTH_CHECK_FAILURES: AtomicU64 = AtomicU64::new(0);
static LOOPS_SUPPRESSED: AtomicU64 = AtomicU64::new(0);

static ROOM_COUNTERS: OnceLock<Mutex<HashMap<String, RoomCounter>>> = OnceLock::new();

pub fn inc_jobs_queued() {
    JOBS_QUEUED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_jobs_rejected() {
    JOBS_REJECTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_jobs_sent() {
    JOBS_SENT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_jobs_failed() {
    JOBS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn add_jobs_abandoned(n: u64) {
    JOBS_ABANDONED.fetch_add(n, Ordering::Relaxed);
}
pub fn inc_reconnect_attempts() {
    RECONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_health_check_failures() {
    HEALTH_CHECK_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_loops_suppressed() {
    LOOPS_SUPPRESSED.fetch_add(1, Ordering::Relaxed);
}

/// Per-room relay traffic in both directions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoomCounter {
    pub to_chat: u64,
    pub to_radio: u64,
}

fn room_counter_lock() -> &'static Mutex<HashMap<String, RoomCounter>> {
    ROOM_COUNTERS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub fn record_relay_to_chat(room_id: &str) -> RoomCounter {
    let mut guard = match room_counter_lock().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let counter = guard.entry(room_id.to_string()).or_default();
    counter.to_chat = counter.to_chat.saturating_add(1);
    *counter
}

pub fn record_relay_to_radio(room_id: &str) -> RoomCounter {
    let mut guard = match room_counter_lock().lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let counter = guard.entry(room_id.to_string()).or_default();
    counter.to_radio = counter.to_radio.saturating_add(1);
    *counter
}

pub fn room_counters_snapshot() -> HashMap<String, RoomCounter> {
    match room_counter_lock().lock() {
        Ok(g) => g.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    pub jobs_queued: u64,
    pub jobs_rejected: u64,
    pub jobs_sent: u64,
    pub jobs_failed: u64,
    pub jobs_abandoned: u64,
    pub reconnect_attempts: u64,
    pub health_check_failures: u64,
    pub loops_suppressed: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        jobs_queued: JOBS_QUEUED.load(Ordering::Relaxed),
        jobs_rejected: JOBS_REJECTED.load(Ordering::Relaxed),
        jobs_sent: JOBS_SENT.load(Ordering::Relaxed),
        jobs_failed: JOBS_FAILED.load(Ordering::Relaxed),
        jobs_abandoned: JOBS_ABANDONED.load(Ordering::Relaxed),
        reconnect_attempts: RECONNECT_ATTEMPTS.load(Ordering::Relaxed),
        health_check_failures: HEALTH_CHECK_FAILURES.load(Ordering::Relaxed),
        loops_suppressed: LOOPS_SUPPRESSED.load(Ordering::Relaxed),
    }
}
