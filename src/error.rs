//! Crate-wide error taxonomy.
//!
//! Grouped the way the spec groups them: input errors recoverable by falling
//! back to full template execution, authorization errors that are never
//! recovered, resource errors, and lifecycle errors. See `ErrInternal`'s
//! `diagnostic()` for the redaction rule.

use thiserror::Error;

/// Errors raised while parsing template source into boundaries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected `{{{{end}}}}` at byte {position} with no open block")]
    UnmatchedEnd { position: usize },

    #[error("unclosed block `{kind}` opened at byte {opened_at}")]
    UnclosedBlock { kind: &'static str, opened_at: usize },

    #[error("malformed action at byte {position}: {message}")]
    MalformedAction { position: usize, message: String },

    #[error("unterminated action starting at byte {position}")]
    UnterminatedAction { position: usize },

    #[error("mismatched HTML tags: opened `<{open}>`, closed `</{close}>` at byte {position}")]
    MismatchedTag {
        open: String,
        close: String,
        position: usize,
    },

    #[error("unclosed HTML tag `<{tag}>` opened at byte {opened_at}")]
    UnclosedTag { tag: String, opened_at: usize },
}

/// Errors raised while resolving a field path or evaluating an expression.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("missing field `{path}`")]
    MissingField { path: String },

    #[error("nil dereference on `{path}`")]
    NilDeref { path: String },

    #[error("`{path}` is not iterable")]
    NotIterable { path: String },

    #[error("unknown function `{name}`")]
    UnknownFunction { name: String },

    #[error("wrong number of arguments for `{name}`")]
    ArityMismatch { name: String },

    #[error("malformed expression: {0}")]
    MalformedExpression(String),
}

/// A dynamic construct the Tree Generator does not evaluate incrementally.
///
/// Variable (`$x := ...`) and Pipeline (`... | f`) are flagged unsupported by
/// the tree path; callers fall back to full template execution for the
/// affected region (spec.md §7).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedConstruct {
    #[error("variable declarations are not supported by the tree generator")]
    Variable,
    #[error("pipelines are not supported by the tree generator")]
    Pipeline,
}

/// Errors raised by the Tree Generator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TreeError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedConstruct),
}

/// Authorization errors. Never recovered locally; always surfaced.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("token signature verification failed")]
    BadSignature,
    #[error("token declares an unsupported algorithm")]
    BadAlgorithm,
    #[error("token has expired")]
    Expired,
    #[error("token is not yet valid")]
    NotYetValid,
    #[error("token nonce has already been used")]
    Replay,
    #[error("page does not belong to the verifying application")]
    CrossApplicationAccess,
    #[error("token is malformed")]
    Malformed,
}

/// Resource exhaustion errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ResourceError {
    #[error("registry is at capacity")]
    AtCapacity,
    #[error("memory limit exceeded")]
    MemoryLimit,
}

/// Lifecycle errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("not found")]
    NotFound,
    #[error("already closed")]
    Closed,
    #[error("operation was cancelled")]
    Cancelled,
}

/// An internal invariant violation.
///
/// `Display` never prints the inner diagnostic; call [`InternalError::diagnostic`]
/// from trusted, internal-only call sites (logging) to read it. This is the
/// implementation of spec.md §7's "never exposed to untrusted callers verbatim".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalError {
    message: String,
}

impl InternalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The full diagnostic message. Only call this from trusted logging code.
    pub fn diagnostic(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for InternalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("internal error")
    }
}

impl std::error::Error for InternalError {}

/// Top-level crate error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LiveTemplateError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Unsupported(#[from] UnsupportedConstruct),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error(transparent)]
    Internal(#[from] InternalError),
}

impl From<TreeError> for LiveTemplateError {
    fn from(e: TreeError) -> Self {
        match e {
            TreeError::Parse(e) => Self::Parse(e),
            TreeError::Eval(e) => Self::Eval(e),
            TreeError::Unsupported(e) => Self::Unsupported(e),
        }
    }
}

pub type Result<T, E = LiveTemplateError> = std::result::Result<T, E>;

/// Aggregate error from `Page::render_fragments`: the regions that failed,
/// alongside the successfully produced fragments (returned separately by the
/// caller). Per-region failures never abort sibling regions (spec.md §4.4/§7).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{} region(s) failed to render: {}", failed.len(), failed.iter().map(|(id, _)| id.as_str()).collect::<Vec<_>>().join(", "))]
pub struct FragmentError {
    pub failed: Vec<(String, LiveTemplateError)>,
}
