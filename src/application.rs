//! Application: the multi-tenant isolation boundary (spec.md §4.1, §4.7).
//!
//! One `Application` owns one `PageRegistry`, one `TokenService`, and one
//! `MemoryManager`. Nothing here is shared across applications — creating a
//! second `Application` with the same `id` does not merge state with the
//! first; callers that want a process-wide directory of applications hold
//! their own `HashMap<String, Application>` (or similar), same as the
//! teacher's `TemplateCache::new()` builds one instance per caller rather
//! than reaching for a process-wide singleton.

use crate::config::ApplicationConfig;
use crate::error::{AuthError, LifecycleError, LiveTemplateError};
use crate::memory::MemoryManager;
use crate::page::Page;
use crate::registry::PageRegistry;
use crate::token::TokenService;
use serde_json::Value;
use std::sync::Arc;

pub struct Application {
    pub id: String,
    config: ApplicationConfig,
    registry: PageRegistry,
    tokens: TokenService,
    memory: Arc<MemoryManager>,
}

impl Application {
    pub fn new(id: impl Into<String>, config: ApplicationConfig) -> Self {
        let memory = Arc::new(MemoryManager::new(config.memory.clone()));
        let registry = PageRegistry::new(config.registry.clone(), Arc::clone(&memory));
        let tokens = TokenService::new(config.token.clone());
        Self {
            id: id.into(),
            config,
            registry,
            tokens,
            memory,
        }
    }

    /// Create a new Page scoped to this application, reserve its initial
    /// memory estimate, and register it. Returns the page alongside a signed
    /// token binding it to this application (spec.md §4.6).
    pub fn create_page(
        &self,
        template_source: impl Into<String>,
        initial_data: Value,
    ) -> Result<(Arc<Page>, String), LiveTemplateError> {
        let page = Page::new(self.id.clone(), template_source, initial_data, self.config.page.clone())?;
        let page_id = page.id.clone();
        let estimate = page.template_source.len() as u64;
        self.memory
            .try_reserve(&page_id, estimate)
            .map_err(LiveTemplateError::from)?;
        let token = self.tokens.generate_token(&self.id, &page_id);
        match self.registry.store(page) {
            Ok(page) => Ok((page, token)),
            Err(e) => {
                self.memory.release_all(&page_id);
                Err(LiveTemplateError::from(e))
            }
        }
    }

    /// Verify `token`, confirm it was issued for this application, and
    /// return the page it names. Cross-application use of a validly signed
    /// token is rejected even though the signature checks out (spec.md §4.7).
    pub fn page_for_token(&self, token: &str) -> Result<Arc<Page>, LiveTemplateError> {
        let claims = self.tokens.verify_token(token).map_err(LiveTemplateError::from)?;
        if claims.aud != self.id {
            return Err(LiveTemplateError::from(AuthError::CrossApplicationAccess));
        }
        self.registry
            .get(&self.id, &claims.sub)
            .map_err(LiveTemplateError::from)
    }

    /// Every page currently registered to this application (spec.md §4.5's
    /// `GetByApplication`).
    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.registry.get_by_application(&self.id)
    }

    pub fn close_page(&self, page_id: &str) -> Result<(), LifecycleError> {
        self.registry.remove(page_id)
    }

    pub fn page_count(&self) -> usize {
        self.registry.len()
    }

    pub fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub fn rotate_token_key(&self) {
        self.tokens.rotate_key();
    }

    /// Tear the application down: close every registered page (releasing
    /// their memory reservations), stop the memory manager's background
    /// sweeper, and rotate the signing key so any token issued before this
    /// call stops verifying. Idempotent — closing an already-closed
    /// application just closes an already-empty, already-stopped registry.
    pub fn close(&mut self) {
        self.registry.close();
        self.memory.close();
        self.tokens.rotate_key();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn app() -> Application {
        Application::new("app1", ApplicationConfig::default())
    }

    #[test]
    fn create_and_fetch_page_by_token() {
        let app = app();
        let (page, token) = app.create_page("<div>{{.N}}</div>", json!({"N": 1})).unwrap();
        let fetched = app.page_for_token(&token).unwrap();
        assert_eq!(fetched.id, page.id);
    }

    #[test]
    fn token_from_another_application_is_rejected() {
        let app_a = Application::new("app-a", ApplicationConfig::default());
        let app_b = Application::new("app-b", ApplicationConfig::default());
        let (_page, token) = app_a.create_page("<div>{{.N}}</div>", json!({"N": 1})).unwrap();
        assert!(matches!(
            app_b.page_for_token(&token),
            Err(LiveTemplateError::Auth(AuthError::CrossApplicationAccess))
        ));
    }

    #[test]
    fn close_page_removes_it_from_registry() {
        let app = app();
        let (page, _token) = app.create_page("<div>{{.N}}</div>", json!({"N": 1})).unwrap();
        app.close_page(&page.id).unwrap();
        assert_eq!(app.page_count(), 0);
    }

    #[test]
    fn key_rotation_invalidates_existing_page_tokens() {
        let app = app();
        let (_page, token) = app.create_page("<div>{{.N}}</div>", json!({"N": 1})).unwrap();
        app.rotate_token_key();
        assert!(matches!(
            app.page_for_token(&token),
            Err(LiveTemplateError::Auth(AuthError::BadSignature))
        ));
    }

    #[test]
    fn pages_lists_only_this_applications_pages() {
        let app_a = Application::new("app-a", ApplicationConfig::default());
        let app_b = Application::new("app-b", ApplicationConfig::default());
        let (page_a, _) = app_a.create_page("<div>{{.N}}</div>", json!({"N": 1})).unwrap();
        app_b.create_page("<div>{{.N}}</div>", json!({"N": 1})).unwrap();

        let listed = app_a.pages();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, page_a.id);
    }

    #[test]
    fn close_tears_down_registry_and_tokens() {
        let mut app = app();
        let (page, token) = app.create_page("<div>{{.N}}</div>", json!({"N": 1})).unwrap();
        app.close();
        assert_eq!(app.page_count(), 0);
        assert!(matches!(
            app.page_for_token(&token),
            Err(LiveTemplateError::Auth(AuthError::BadSignature))
        ));
        assert!(page.is_closed());
    }
}
