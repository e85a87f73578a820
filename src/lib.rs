//! Server-driven HTML update engine.
//!
//! A template is registered once per [`Page`]; each subsequent call to
//! [`Page::render_fragments`] diffs the new data snapshot against the last one
//! and returns only the pieces of the template whose output actually changed,
//! as a tree of static/dynamic slots (`TreeData`) rather than a full-page
//! re-render. [`Application`] is the multi-tenant boundary: it owns a
//! [`PageRegistry`], a [`TokenService`], and a [`MemoryManager`], and is the
//! intended entry point for embedding this crate in a server.
//!
//! ```
//! use livetemplate::{Application, ApplicationConfig, CancelToken};
//! use serde_json::json;
//!
//! let app = Application::new("demo", ApplicationConfig::default());
//! let (page, _token) = app
//!     .create_page("<div id=\"c\">Count: {{.N}}</div>", json!({"N": 0}))
//!     .unwrap();
//! let full_html = page.render().unwrap();
//! let outcome = page.render_fragments(json!({"N": 1}), &CancelToken::new()).unwrap();
//! assert_eq!(outcome.fragments.len(), 1);
//! # let _ = full_html;
//! ```

pub mod application;
pub mod config;
pub mod error;
pub mod eval;
pub mod html;
pub mod memory;
pub mod page;
pub mod parser;
pub mod region;
pub mod registry;
pub mod token;
pub mod tree;

pub use application::Application;
pub use config::{
    ApplicationConfig, MemoryManagerConfig, PageConfig, RegistryConfig, TokenServiceConfig,
};
pub use error::{
    AuthError, EvalError, FragmentError, InternalError, LifecycleError, LiveTemplateError,
    ParseError, ResourceError, Result, TreeError, UnsupportedConstruct,
};
pub use memory::{MemoryManager, MemorySnapshot};
pub use page::{CancelToken, Fragment, FragmentData, FragmentMetadata, FragmentOutcome, Page};
pub use region::TemplateRegion;
pub use registry::PageRegistry;
pub use token::{Claims, TokenService};
pub use tree::{DynamicValue, TreeData, TreeGenerator};
