//! Page: one rendered template session (spec.md §4.4). Holds the template
//! source (original and region-injected), the current data snapshot, and an
//! owned Tree Generator. A Page is the unit `RenderFragments` operates on;
//! `Application`/`PageRegistry` are the layers above it.

use crate::config::PageConfig;
use crate::error::{FragmentError, LifecycleError, LiveTemplateError, TreeError};
use crate::region::{self, TemplateRegion};
use crate::tree::{TreeData, TreeGenerator};
use parking_lot::RwLock;
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Cooperative cancellation signal for an in-flight `render_fragments` call
/// (spec.md §4.4's `ctx` argument, §5's cooperative-cancellation model).
/// Checked once per region; a cancelled call returns
/// `LifecycleError::Cancelled` without advancing the page's stored data, so
/// a cancelled render leaves every region's diff baseline untouched.
#[derive(Debug, Default)]
pub struct CancelToken(AtomicBool);

impl CancelToken {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Reserved fragment id for whole-document `Render` calls, distinct from
/// any region id (region ids are always lowercase-letter-prefixed, e.g.
/// `a1`; this can never collide).
const WHOLE_PAGE_FRAGMENT_ID: &str = "__page__";

pub(crate) fn random_hex128() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct FragmentMetadata {
    pub generation_time_ns: u128,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FragmentData {
    Tree(TreeData),
    Html(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Fragment {
    pub id: String,
    pub data: FragmentData,
    pub metadata: FragmentMetadata,
}

/// Result of a `render_fragments` call: the fragments that were produced,
/// plus an aggregate error naming any region that failed outright (its
/// sibling regions still render; spec.md §7).
#[derive(Debug, Clone, Default)]
pub struct FragmentOutcome {
    pub fragments: Vec<Fragment>,
    pub error: Option<FragmentError>,
}

struct PageInner {
    data: Value,
    tree_generator: TreeGenerator,
    closed: bool,
}

pub struct Page {
    pub id: String,
    pub application_id: String,
    pub template_hash: String,
    /// The source as originally supplied, before region injection.
    pub template_source: String,
    /// The source actually executed: `template_source` with `data-lvt-id`
    /// attributes injected (spec.md §4.3). Identical to `template_source`
    /// when the source has no HTML elements to promote.
    rewritten_source: String,
    regions: Vec<TemplateRegion>,
    /// Union of every region's `attribute_field_paths`, used for the
    /// whole-document `render()` call, which isn't scoped to one region.
    all_attribute_field_paths: HashSet<String>,
    config: PageConfig,
    created_at: Instant,
    last_accessed: AtomicU64,
    inner: RwLock<PageInner>,
}

impl Page {
    pub fn new(
        application_id: impl Into<String>,
        template_source: impl Into<String>,
        initial_data: Value,
        config: PageConfig,
    ) -> Result<Self, LiveTemplateError> {
        let template_source = template_source.into();
        let (rewritten_source, regions) = region::detect_regions(&template_source)?;
        let template_hash = blake3::hash(template_source.as_bytes()).to_hex().to_string();
        let all_attribute_field_paths = regions
            .iter()
            .flat_map(|r| r.attribute_field_paths.iter().cloned())
            .collect();

        Ok(Self {
            id: random_hex128(),
            application_id: application_id.into(),
            template_hash,
            template_source,
            rewritten_source,
            regions,
            all_attribute_field_paths,
            config,
            created_at: Instant::now(),
            last_accessed: AtomicU64::new(now_millis()),
            inner: RwLock::new(PageInner {
                data: initial_data,
                tree_generator: TreeGenerator::new(),
                closed: false,
            }),
        })
    }

    pub fn regions(&self) -> &[TemplateRegion] {
        &self.regions
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_accessed_millis(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_accessed.store(now_millis(), Ordering::Relaxed);
    }

    /// Execute the (region-injected) template against current data and
    /// return the resulting HTML (spec.md §4.4). Deterministic: two calls
    /// with unchanged data produce byte-identical output, including
    /// `data-lvt-id` values (spec.md §8 property 4), since region injection
    /// happened once at construction and never changes.
    pub fn render(&self) -> Result<String, LiveTemplateError> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(LifecycleError::Closed.into());
        }
        let html = inner
            .tree_generator
            .render_full(
                WHOLE_PAGE_FRAGMENT_ID,
                &self.rewritten_source,
                &inner.data,
                &self.all_attribute_field_paths,
            )
            .map_err(LiveTemplateError::from)?;
        drop(inner);
        self.touch();
        Ok(html)
    }

    /// Replace the current data without emitting fragments (spec.md §4.4).
    pub fn set_data(&self, data: Value) -> Result<(), LiveTemplateError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(LifecycleError::Closed.into());
        }
        inner.data = data;
        drop(inner);
        self.touch();
        Ok(())
    }

    /// Render one Fragment per region against `new_data`, replacing the
    /// stored data with `new_data` atomically on return (spec.md §4.4, §5).
    /// A region whose Tree Generator call fails with `ErrUnsupportedConstruct`
    /// falls back to a full template execution for that region alone
    /// (spec.md §7); any other per-region failure is isolated into
    /// `FragmentOutcome::error` without aborting sibling regions.
    ///
    /// `cancel` is checked once per region; if set, the call returns
    /// `LifecycleError::Cancelled` immediately, leaving the stored data
    /// untouched (no region diffs against a baseline it never actually saw).
    /// Every region is always diffed against `previous`, even past
    /// `max_fragments` — the cap only truncates the returned fragment list,
    /// so a capped region's diff baseline still advances correctly and isn't
    /// silently skipped on the next call.
    pub fn render_fragments(&self, new_data: Value, cancel: &CancelToken) -> Result<FragmentOutcome, LiveTemplateError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(LifecycleError::Closed.into());
        }
        let previous = inner.data.clone();

        let mut fragments = Vec::new();
        let mut failed = Vec::new();

        for region in &self.regions {
            if cancel.is_cancelled() {
                return Err(LifecycleError::Cancelled.into());
            }
            let started = Instant::now();
            match inner.tree_generator.generate(
                &region.id,
                &region.template_source,
                &previous,
                &new_data,
                &region.attribute_field_paths,
            ) {
                Ok(td) if td.is_empty_update() => {}
                Ok(td) => fragments.push(Fragment {
                    id: region.id.clone(),
                    data: FragmentData::Tree(td),
                    metadata: FragmentMetadata {
                        generation_time_ns: started.elapsed().as_nanos(),
                        fallback_used: false,
                    },
                }),
                Err(TreeError::Unsupported(_)) => {
                    match inner.tree_generator.render_full(
                        &region.id,
                        &region.template_source,
                        &new_data,
                        &region.attribute_field_paths,
                    ) {
                        Ok(html) => fragments.push(Fragment {
                            id: region.id.clone(),
                            data: FragmentData::Html(html),
                            metadata: FragmentMetadata {
                                generation_time_ns: started.elapsed().as_nanos(),
                                fallback_used: true,
                            },
                        }),
                        Err(e) => failed.push((region.id.clone(), LiveTemplateError::from(e))),
                    }
                }
                Err(e) => failed.push((region.id.clone(), LiveTemplateError::from(e))),
            }
        }

        fragments.truncate(self.config.max_fragments);

        inner.data = new_data;
        drop(inner);
        self.touch();

        Ok(FragmentOutcome {
            fragments,
            error: if failed.is_empty() {
                None
            } else {
                Some(FragmentError { failed })
            },
        })
    }

    /// Idempotent: repeated calls after the first are no-ops (spec.md §9's
    /// Open Question resolution in favor of idempotent `Close`).
    pub fn close(&self) {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        inner.tree_generator.clear();
        inner.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_produces_injected_attribute() {
        let page = Page::new("app1", "<div id=\"counter\">Count: {{.N}}</div>", json!({"N": 5}), PageConfig::default()).unwrap();
        let html = page.render().unwrap();
        assert_eq!(html, r#"<div id="counter" data-lvt-id="a1">Count: 5</div>"#);
    }

    #[test]
    fn render_is_deterministic() {
        let page = Page::new("app1", "<div>{{.N}}</div>", json!({"N": 1}), PageConfig::default()).unwrap();
        assert_eq!(page.render().unwrap(), page.render().unwrap());
    }

    #[test]
    fn render_fragments_emits_one_fragment_for_one_region() {
        let page = Page::new("app1", "<div id=\"c\">Count: {{.N}}</div>", json!({"N": 5}), PageConfig::default()).unwrap();
        page.render().unwrap();
        let outcome = page.render_fragments(json!({"N": 6}), &CancelToken::new()).unwrap();
        assert_eq!(outcome.fragments.len(), 1);
        assert_eq!(outcome.fragments[0].id, "a1");
        assert!(outcome.error.is_none());
    }

    #[test]
    fn render_fragments_with_unchanged_data_emits_nothing() {
        let page = Page::new("app1", "<div>{{.N}}</div>", json!({"N": 5}), PageConfig::default()).unwrap();
        page.render().unwrap();
        // First call always renders the region's fragment in full (cold cache).
        page.render_fragments(json!({"N": 5}), &CancelToken::new()).unwrap();
        let outcome = page.render_fragments(json!({"N": 5}), &CancelToken::new()).unwrap();
        assert!(outcome.fragments.is_empty());
    }

    #[test]
    fn closed_page_rejects_operations() {
        let page = Page::new("app1", "<div>{{.N}}</div>", json!({"N": 5}), PageConfig::default()).unwrap();
        page.close();
        assert!(page.is_closed());
        assert!(matches!(page.render(), Err(LiveTemplateError::Lifecycle(LifecycleError::Closed))));
        page.close(); // idempotent
    }

    #[test]
    fn pipeline_region_falls_back_to_html() {
        let page = Page::new("app1", "<div>{{.Name | upper}}</div>", json!({"Name": "a"}), PageConfig::default()).unwrap();
        page.render().unwrap();
        let outcome = page.render_fragments(json!({"Name": "b"}), &CancelToken::new()).unwrap();
        assert_eq!(outcome.fragments.len(), 1);
        assert!(outcome.fragments[0].metadata.fallback_used);
        assert!(matches!(outcome.fragments[0].data, FragmentData::Html(_)));
    }

    #[test]
    fn cancelled_render_fragments_leaves_data_untouched() {
        let page = Page::new(
            "app1",
            "<div id=\"a\">{{.A}}</div><div id=\"b\">{{.B}}</div>",
            json!({"A": 1, "B": 1}),
            PageConfig::default(),
        )
        .unwrap();
        page.render().unwrap();
        page.render_fragments(json!({"A": 1, "B": 1}), &CancelToken::new()).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = page.render_fragments(json!({"A": 2, "B": 2}), &cancel).unwrap_err();
        assert!(matches!(err, LiveTemplateError::Lifecycle(LifecycleError::Cancelled)));

        // Data was never advanced, so the next (uncancelled) call still sees
        // both fields as changed relative to the pre-cancellation snapshot.
        let outcome = page.render_fragments(json!({"A": 2, "B": 2}), &CancelToken::new()).unwrap();
        assert_eq!(outcome.fragments.len(), 2);
    }

    #[test]
    fn max_fragments_cap_does_not_corrupt_later_regions_diff_baseline() {
        let config = PageConfig::default().with_max_fragments(1);
        let page = Page::new(
            "app1",
            "<div id=\"a\">{{.A}}</div><div id=\"b\">{{.B}}</div>",
            json!({"A": 1, "B": 1}),
            config,
        )
        .unwrap();
        page.render().unwrap();
        // Warm-up: cold cache forces both regions full on the first call,
        // capped to 1 returned fragment by `max_fragments`.
        let warmup = page.render_fragments(json!({"A": 1, "B": 1}), &CancelToken::new()).unwrap();
        assert_eq!(warmup.fragments.len(), 1);

        // Both regions actually advanced past this data even though only one
        // fragment was returned, so only `B`'s change shows up here.
        let outcome = page.render_fragments(json!({"A": 1, "B": 2}), &CancelToken::new()).unwrap();
        assert_eq!(outcome.fragments.len(), 1);
        assert_eq!(outcome.fragments[0].id, "a2");
    }
}
