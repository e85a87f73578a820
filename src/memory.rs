//! Memory Manager: tracks approximate memory usage per page so allocation
//! can be refused before the process is put under real pressure.
//!
//! Not given its own component section in spec.md (only its config keys and
//! concurrency model are named), so this module's shape is grounded on the
//! teacher's counter/snapshot style (`performance_monitor.rs`): atomic
//! counters for the hot path, a mutex-guarded map for per-page bookkeeping.
//! This is the "minimal form" spec.md §9 declares sufficient — no pressure
//! callbacks, no leak heuristics. The background sweeper (below) follows the
//! same `std::thread`/`mpsc` shutdown shape as the Registry's own sweeper.

use crate::config::MemoryManagerConfig;
use crate::error::ResourceError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

/// Read-only view of current memory pressure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub used: u64,
    pub limit: u64,
    pub warning: bool,
    pub critical: bool,
}

pub struct MemoryManager {
    used: Arc<AtomicU64>,
    limit: u64,
    per_page: Arc<Mutex<HashMap<String, u64>>>,
    config: MemoryManagerConfig,
    shutdown: mpsc::Sender<()>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryManager {
    pub fn new(config: MemoryManagerConfig) -> Self {
        let limit = config.max_memory_mb * 1024 * 1024;
        let used = Arc::new(AtomicU64::new(0));
        let per_page = Arc::new(Mutex::new(HashMap::new()));
        let (shutdown_tx, shutdown_rx) = mpsc::channel();

        let sweep_used = Arc::clone(&used);
        let sweep_per_page = Arc::clone(&per_page);
        let cleanup_interval = config.cleanup_interval;
        let critical_at = limit * config.critical_threshold_pct as u64 / 100;
        let sweeper = std::thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(cleanup_interval) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    sweep_inner(&sweep_used, &sweep_per_page, limit, critical_at);
                }
            }
        });

        Self {
            used,
            limit,
            per_page,
            config,
            shutdown: shutdown_tx,
            sweeper: Mutex::new(Some(sweeper)),
            closed: AtomicBool::new(false),
        }
    }

    /// Stop the background sweeper. Idempotent; also run on `Drop`. Takes
    /// `&self` (sweeper handle guarded by its own lock) so callers holding
    /// this manager behind an `Arc` — as `Application` and `PageRegistry`
    /// both do — can still shut it down explicitly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());
        if let Some(handle) = self.sweeper.lock().take() {
            let _ = handle.join();
        }
    }

    /// Pre-check then reserve `bytes` against `page_id`'s budget. Denial
    /// leaves all state untouched (spec.md §5: "pre-check followed by a
    /// compare-and-add; denial is graceful").
    pub fn try_reserve(&self, page_id: &str, bytes: u64) -> Result<(), ResourceError> {
        loop {
            let current = self.used.load(Ordering::Acquire);
            let next = current.saturating_add(bytes);
            if next > self.limit {
                return Err(ResourceError::MemoryLimit);
            }
            if self
                .used
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        let mut per_page = self.per_page.lock();
        *per_page.entry(page_id.to_string()).or_insert(0) += bytes;
        if self.usage().critical {
            tracing::warn!(page_id, used = self.used.load(Ordering::Relaxed), limit = self.limit, "memory usage above critical threshold");
        }
        Ok(())
    }

    /// Release `bytes` previously reserved for `page_id`. Saturates at zero;
    /// never panics on a double-release.
    pub fn release(&self, page_id: &str, bytes: u64) {
        self.used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(bytes))).ok();
        let mut per_page = self.per_page.lock();
        if let Some(entry) = per_page.get_mut(page_id) {
            *entry = entry.saturating_sub(bytes);
            if *entry == 0 {
                per_page.remove(page_id);
            }
        }
    }

    /// Release everything reserved for `page_id`. Used by `Page::close` and
    /// registry eviction.
    pub fn release_all(&self, page_id: &str) {
        let mut per_page = self.per_page.lock();
        if let Some(bytes) = per_page.remove(page_id) {
            self.used.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(bytes))).ok();
        }
    }

    pub fn usage(&self) -> MemorySnapshot {
        let used = self.used.load(Ordering::Relaxed);
        let warning_at = self.limit * self.config.warning_threshold_pct as u64 / 100;
        let critical_at = self.limit * self.config.critical_threshold_pct as u64 / 100;
        MemorySnapshot {
            used,
            limit: self.limit,
            warning: used >= warning_at,
            critical: used >= critical_at,
        }
    }

    pub fn config(&self) -> &MemoryManagerConfig {
        &self.config
    }

    /// Recompute `used` from the per-page map, correcting for any drift
    /// between the atomic counter and per-page bookkeeping. Also run every
    /// `cleanup_interval` by the background sweeper spawned in `new`, and
    /// callable directly for deterministic tests or external callers that
    /// want an immediate recheck (spec.md §5: "Background sweepers are
    /// stopped by closing a shutdown channel during `Close`").
    pub fn sweep(&self) {
        let critical_at = self.limit * self.config.critical_threshold_pct as u64 / 100;
        sweep_inner(&self.used, &self.per_page, self.limit, critical_at);
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn sweep_inner(used: &AtomicU64, per_page: &Mutex<HashMap<String, u64>>, limit: u64, critical_at: u64) {
    let guard = per_page.lock();
    let total: u64 = guard.values().sum();
    used.store(total, Ordering::Release);
    drop(guard);
    if total >= critical_at {
        tracing::warn!(used = total, limit, "memory usage above critical threshold after sweep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(max_mb: u64) -> MemoryManager {
        MemoryManager::new(MemoryManagerConfig::default().with_max_memory_mb(max_mb))
    }

    #[test]
    fn reserve_and_release_round_trip() {
        let mgr = manager(1);
        mgr.try_reserve("p1", 1024).unwrap();
        assert_eq!(mgr.usage().used, 1024);
        mgr.release("p1", 1024);
        assert_eq!(mgr.usage().used, 0);
    }

    #[test]
    fn denies_over_limit_without_mutating_state() {
        let mgr = manager(1);
        let limit = mgr.usage().limit;
        mgr.try_reserve("p1", limit / 2).unwrap();
        let used_before = mgr.usage().used;
        let err = mgr.try_reserve("p2", limit).unwrap_err();
        assert!(matches!(err, ResourceError::MemoryLimit));
        assert_eq!(mgr.usage().used, used_before);
    }

    #[test]
    fn double_release_saturates_at_zero() {
        let mgr = manager(1);
        mgr.try_reserve("p1", 100).unwrap();
        mgr.release("p1", 100);
        mgr.release("p1", 100);
        assert_eq!(mgr.usage().used, 0);
    }

    #[test]
    fn release_all_clears_page_entry() {
        let mgr = manager(1);
        mgr.try_reserve("p1", 500).unwrap();
        mgr.try_reserve("p2", 500).unwrap();
        mgr.release_all("p1");
        assert_eq!(mgr.usage().used, 500);
    }

    #[test]
    fn sweep_corrects_drift() {
        let mgr = manager(1);
        mgr.try_reserve("p1", 1000).unwrap();
        mgr.used.store(999_999, Ordering::Relaxed);
        mgr.sweep();
        assert_eq!(mgr.usage().used, 1000);
    }

    #[test]
    fn critical_threshold_flag() {
        let mgr = manager(1);
        let limit = mgr.usage().limit;
        mgr.try_reserve("p1", limit * 95 / 100).unwrap();
        assert!(mgr.usage().critical);
    }

    #[test]
    fn background_sweeper_corrects_drift_without_explicit_sweep() {
        let mgr = MemoryManager::new(
            MemoryManagerConfig::default()
                .with_max_memory_mb(1)
                .with_cleanup_interval(std::time::Duration::from_millis(5)),
        );
        mgr.try_reserve("p1", 1000).unwrap();
        mgr.used.store(999_999, Ordering::Relaxed);
        std::thread::sleep(std::time::Duration::from_millis(40));
        assert_eq!(mgr.usage().used, 1000);
    }

    #[test]
    fn close_is_idempotent() {
        let mgr = manager(1);
        mgr.close();
        mgr.close();
    }
}
