//! Page Registry: concurrent page storage, capacity enforcement, and a
//! background sweeper that evicts pages idle past their TTL (spec.md §4.5).
//!
//! Grounded on the teacher's `EnhancedCache` (`enhanced_watcher.rs`) for the
//! concurrent-map-plus-capacity shape, and its `thread::spawn` sweeper style
//! (`benchmarks.rs`) for the background cleanup loop — std threads, not
//! tokio, since nothing else in this crate needs an async runtime.

use crate::config::RegistryConfig;
use crate::error::{LifecycleError, ResourceError};
use crate::memory::MemoryManager;
use crate::page::Page;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct PageRegistry {
    pages: Arc<DashMap<String, Arc<Page>>>,
    /// Secondary index, `pagesByApp` in spec.md §4.5: every page id
    /// registered under a given application, so `get_by_application` and
    /// application-scoped `get` don't have to scan the whole registry.
    by_app: Arc<DashMap<String, DashSet<String>>>,
    config: RegistryConfig,
    memory: Arc<MemoryManager>,
    shutdown: mpsc::Sender<()>,
    sweeper: Option<JoinHandle<()>>,
    closed: AtomicBool,
}

impl PageRegistry {
    pub fn new(config: RegistryConfig, memory: Arc<MemoryManager>) -> Self {
        let pages: Arc<DashMap<String, Arc<Page>>> = Arc::new(DashMap::new());
        let by_app: Arc<DashMap<String, DashSet<String>>> = Arc::new(DashMap::new());
        let (shutdown_tx, shutdown_rx) = mpsc::channel();

        let sweep_pages = Arc::clone(&pages);
        let sweep_by_app = Arc::clone(&by_app);
        let sweep_memory = Arc::clone(&memory);
        let cleanup_interval = config.cleanup_interval;
        let default_ttl = config.default_ttl;
        let sweeper = std::thread::spawn(move || {
            loop {
                match shutdown_rx.recv_timeout(cleanup_interval) {
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        sweep_once(&sweep_pages, &sweep_by_app, &sweep_memory, default_ttl);
                    }
                }
            }
        });

        Self {
            pages,
            by_app,
            config,
            memory,
            shutdown: shutdown_tx,
            sweeper: Some(sweeper),
            closed: AtomicBool::new(false),
        }
    }

    /// Register `page`, rejecting it if the registry is at capacity
    /// (spec.md §4.5: "Store rejects beyond max_pages").
    pub fn store(&self, page: Page) -> Result<Arc<Page>, ResourceError> {
        if self.pages.len() >= self.config.max_pages {
            return Err(ResourceError::AtCapacity);
        }
        let page = Arc::new(page);
        self.by_app
            .entry(page.application_id.clone())
            .or_insert_with(DashSet::new)
            .insert(page.id.clone());
        self.pages.insert(page.id.clone(), Arc::clone(&page));
        Ok(page)
    }

    /// Fetch `page_id`, scoped to `app_id`. A page registered under a
    /// different application is rejected exactly like a missing page
    /// (spec.md §4.5's `pagesByApp` dual-index model) — isolation is
    /// enforced here, not bolted onto the caller.
    pub fn get(&self, app_id: &str, page_id: &str) -> Result<Arc<Page>, LifecycleError> {
        let entry = self.pages.get(page_id).ok_or(LifecycleError::NotFound)?;
        if entry.value().application_id != app_id {
            return Err(LifecycleError::NotFound);
        }
        Ok(Arc::clone(entry.value()))
    }

    /// Snapshot copy of every currently-registered page for `app_id`
    /// (spec.md §4.5's `GetByApplication`). Empty if the application has no
    /// pages (or none have ever been registered).
    pub fn get_by_application(&self, app_id: &str) -> Vec<Arc<Page>> {
        let Some(ids) = self.by_app.get(app_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.pages.get(&*id).map(|entry| Arc::clone(entry.value())))
            .collect()
    }

    /// Remove and close the page, releasing its memory reservation.
    pub fn remove(&self, page_id: &str) -> Result<(), LifecycleError> {
        match self.pages.remove(page_id) {
            Some((_, page)) => {
                if let Some(set) = self.by_app.get(&page.application_id) {
                    set.remove(page_id);
                }
                page.close();
                self.memory.release_all(page_id);
                Ok(())
            }
            None => Err(LifecycleError::NotFound),
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Run one sweep pass immediately, outside the background schedule.
    /// Exposed for tests and for callers that want deterministic eviction.
    pub fn sweep_now(&self) {
        sweep_once(&self.pages, &self.by_app, &self.memory, self.config.default_ttl);
    }

    /// Stop the background sweeper and close every registered page. Idempotent.
    pub fn close(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());
        if let Some(handle) = self.sweeper.take() {
            let _ = handle.join();
        }
        for entry in self.pages.iter() {
            entry.value().close();
            self.memory.release_all(entry.key());
        }
        self.pages.clear();
        self.by_app.clear();
    }
}

impl Drop for PageRegistry {
    fn drop(&mut self) {
        self.close();
    }
}

fn sweep_once(
    pages: &DashMap<String, Arc<Page>>,
    by_app: &DashMap<String, DashSet<String>>,
    memory: &MemoryManager,
    default_ttl: Duration,
) {
    let now = crate::page::now_millis();
    let ttl_millis = default_ttl.as_millis() as u64;
    let expired: Vec<(String, String)> = pages
        .iter()
        .filter(|entry| now.saturating_sub(entry.value().last_accessed_millis()) > ttl_millis)
        .map(|entry| (entry.key().clone(), entry.value().application_id.clone()))
        .collect();
    for (id, app_id) in expired {
        if let Some((_, page)) = pages.remove(&id) {
            if let Some(set) = by_app.get(&app_id) {
                set.remove(&id);
            }
            page.close();
            memory.release_all(&id);
        }
    }
    memory.sweep();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryManagerConfig, PageConfig};
    use serde_json::json;
    use std::time::Duration;

    fn registry(max_pages: usize, ttl: Duration) -> PageRegistry {
        let memory = Arc::new(MemoryManager::new(MemoryManagerConfig::default()));
        PageRegistry::new(
            RegistryConfig::default()
                .with_max_pages(max_pages)
                .with_default_ttl(ttl)
                .with_cleanup_interval(Duration::from_secs(3600)),
            memory,
        )
    }

    fn page() -> Page {
        Page::new("app1", "<div>{{.N}}</div>", json!({"N": 1}), PageConfig::default()).unwrap()
    }

    #[test]
    fn store_and_get_round_trip() {
        let reg = registry(10, Duration::from_secs(3600));
        let stored = reg.store(page()).unwrap();
        let fetched = reg.get("app1", &stored.id).unwrap();
        assert_eq!(fetched.id, stored.id);
    }

    #[test]
    fn store_rejects_beyond_capacity() {
        let reg = registry(1, Duration::from_secs(3600));
        reg.store(page()).unwrap();
        assert!(matches!(reg.store(page()), Err(ResourceError::AtCapacity)));
    }

    #[test]
    fn get_missing_page_is_not_found() {
        let reg = registry(10, Duration::from_secs(3600));
        assert!(matches!(reg.get("app1", "nope"), Err(LifecycleError::NotFound)));
    }

    #[test]
    fn get_scoped_to_wrong_application_is_not_found() {
        let reg = registry(10, Duration::from_secs(3600));
        let stored = reg.store(page()).unwrap();
        assert!(matches!(
            reg.get("app-other", &stored.id),
            Err(LifecycleError::NotFound)
        ));
    }

    #[test]
    fn get_by_application_returns_only_that_applications_pages() {
        let reg = registry(10, Duration::from_secs(3600));
        let a1 = reg.store(page()).unwrap();
        let a2 = reg.store(Page::new("app1", "<div>{{.N}}</div>", json!({"N": 1}), PageConfig::default()).unwrap()).unwrap();
        let b1 = reg
            .store(Page::new("app2", "<div>{{.N}}</div>", json!({"N": 1}), PageConfig::default()).unwrap())
            .unwrap();

        let mut app1_ids: Vec<String> = reg.get_by_application("app1").into_iter().map(|p| p.id.clone()).collect();
        app1_ids.sort();
        let mut expected = vec![a1.id.clone(), a2.id.clone()];
        expected.sort();
        assert_eq!(app1_ids, expected);

        let app2_ids: Vec<String> = reg.get_by_application("app2").into_iter().map(|p| p.id.clone()).collect();
        assert_eq!(app2_ids, vec![b1.id.clone()]);

        assert!(reg.get_by_application("app-nobody").is_empty());
    }

    #[test]
    fn remove_closes_and_drops_page() {
        let reg = registry(10, Duration::from_secs(3600));
        let stored = reg.store(page()).unwrap();
        reg.remove(&stored.id).unwrap();
        assert!(stored.is_closed());
        assert!(matches!(reg.get("app1", &stored.id), Err(LifecycleError::NotFound)));
        assert!(reg.get_by_application("app1").is_empty());
    }

    #[test]
    fn sweep_evicts_pages_past_ttl() {
        let reg = registry(10, Duration::from_millis(0));
        let stored = reg.store(page()).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        reg.sweep_now();
        assert!(reg.is_empty());
        assert!(stored.is_closed());
    }
}
