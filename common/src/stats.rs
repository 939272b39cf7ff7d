use std::{
    sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering},
    time::Duration,
};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct LoopStats {
    cycles: AtomicU64,
    skipped: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU32,
    session_active: AtomicBool,
    last_success_epoch: AtomicI64,
    last_lock_hold_ms: AtomicU64,
    max_lock_hold_ms: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopStatsSnapshot {
    pub cycles: u64,
    pub skipped: u64,
    pub successes: u64,
    pub failures: u64,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
    #[serde(rename = "sessionActive")]
    pub session_active: bool,
    #[serde(rename = "lastSuccessEpoch")]
    pub last_success_epoch: Option<i64>,
    #[serde(rename = "lastLockHoldMs")]
    pub last_lock_hold_ms: u64,
    #[serde(rename = "maxLockHoldMs")]
    pub max_lock_hold_ms: u64,
}

impl LoopStats {
    pub fn record_skip(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.last_success_epoch
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn record_failure(&self, consecutive: u32) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures
            .store(consecutive, Ordering::Relaxed);
    }

    pub fn set_session_active(&self, active: bool) {
        self.session_active.store(active, Ordering::Relaxed);
    }

    pub fn record_watermark(&self, held: Duration) -> u64 {
        let held_ms = u64::try_from(held.as_millis()).unwrap_or(u64::MAX);
        self.last_lock_hold_ms.store(held_ms, Ordering::Relaxed);
        self.max_lock_hold_ms.fetch_max(held_ms, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn snapshot(&self) -> LoopStatsSnapshot {
        let last_success = self.last_success_epoch.load(Ordering::Relaxed);
        LoopStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
            session_active: self.session_active.load(Ordering::Relaxed),
            last_success_epoch: (last_success != 0).then_some(last_success),
            last_lock_hold_ms: self.last_lock_hold_ms.load(Ordering::Relaxed),
            max_lock_hold_ms: self.max_lock_hold_ms.load(Ordering::Relaxed),
        }
    }
}
