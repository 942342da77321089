//! Error types and error handling strategy for cordon.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Errors are cheap to clone, so a harvested background fault can be
//!   re-raised at every point that asks for it
//! - Aggregates flatten to their first real cause before being re-raised
//! - Programmer misuse is its own kind and is never folded into a
//!   timeout/cancel/fault classification
//!
//! # Error Categories
//!
//! - **Cancellation**: an upstream signal fired
//! - **Timeout**: a wait exceeded its deadline
//! - **Task**: an awaited unit of background work failed or panicked
//! - **Lifecycle**: an operation reached a disposed or over-capacity object
//! - **Misuse**: the caller broke an API contract
//! - **Internal**: a cordon bug
//! - **User**: errors produced by user callbacks and providers

use core::fmt;
use std::sync::Arc;

use crate::types::CancelReason;

pub mod queue;

pub use queue::{ErrorQueue, ErrorQueueConfig};

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Cancellation ===
    /// Operation was cancelled.
    Cancelled,

    // === Timeout ===
    /// A wait exceeded its deadline.
    Timeout,

    // === Tasks ===
    /// A background task returned an error.
    TaskFaulted,
    /// A background task panicked.
    TaskPanicked,
    /// Several errors collected into one.
    Aggregate,

    // === Lifecycle ===
    /// The target object was already disposed.
    Disposed,
    /// A bounded collection rejected an item.
    CapacityExceeded,

    // === Misuse ===
    /// The caller broke an API contract.
    Misuse,

    // === Collaborators ===
    /// A state provider failed to produce a value.
    Provider,
    /// Configuration could not be parsed.
    Config,

    // === Internal ===
    /// Internal error (bug).
    Internal,

    // === User ===
    /// User-provided error.
    User,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::Timeout => ErrorCategory::Timeout,
            Self::TaskFaulted | Self::TaskPanicked | Self::Aggregate => ErrorCategory::Task,
            Self::Disposed | Self::CapacityExceeded => ErrorCategory::Lifecycle,
            Self::Misuse | Self::Config => ErrorCategory::Misuse,
            Self::Internal => ErrorCategory::Internal,
            Self::Provider | Self::User => ErrorCategory::User,
        }
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Cancellation-related failures.
    Cancellation,
    /// Deadline failures.
    Timeout,
    /// Background task failures.
    Task,
    /// Disposed or exhausted objects.
    Lifecycle,
    /// API contract violations.
    Misuse,
    /// Internal errors.
    Internal,
    /// User-originated errors.
    User,
}

/// The main error type for cordon operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    children: Vec<Error>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
            children: Vec::new(),
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Returns true if this error reports caller misuse.
    #[must_use]
    pub const fn is_misuse(&self) -> bool {
        matches!(self.kind, ErrorKind::Misuse)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Creates a cancellation error from a structured reason.
    #[must_use]
    pub fn cancelled(reason: &CancelReason) -> Self {
        Self::new(ErrorKind::Cancelled).with_message(reason.to_string())
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(after_ms: i64) -> Self {
        Self::new(ErrorKind::Timeout).with_message(format!("timed out after {after_ms}ms"))
    }

    /// Creates a misuse error.
    #[must_use]
    pub fn misuse(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Misuse).with_message(detail)
    }

    /// Creates an error for an operation on a disposed object.
    #[must_use]
    pub fn disposed(what: &str) -> Self {
        Self::new(ErrorKind::Disposed).with_message(format!("{what} is disposed"))
    }

    /// Creates an internal error (cordon bug).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }

    /// Creates a user error with a message.
    #[must_use]
    pub fn user(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_message(detail)
    }

    /// Creates a panic error from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let detail = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::new(ErrorKind::TaskPanicked).with_message(detail)
    }

    /// Bundles several errors into one aggregate.
    ///
    /// A single error is returned unchanged rather than wrapped.
    #[must_use]
    pub fn aggregate(mut errors: Vec<Self>) -> Self {
        if errors.len() == 1 {
            return errors.remove(0);
        }
        let count = errors.len();
        Self {
            kind: ErrorKind::Aggregate,
            message: Some(format!("{count} errors occurred")),
            source: None,
            children: errors,
        }
    }

    /// Returns the direct children of an aggregate.
    #[must_use]
    pub fn children(&self) -> &[Self] {
        &self.children
    }

    /// Flattens nested aggregates into their leaf causes, depth first.
    #[must_use]
    pub fn flatten(&self) -> Vec<Self> {
        let mut leaves = Vec::new();
        self.collect_leaves(&mut leaves);
        leaves
    }

    fn collect_leaves(&self, out: &mut Vec<Self>) {
        if self.kind == ErrorKind::Aggregate {
            for child in &self.children {
                child.collect_leaves(out);
            }
        } else {
            out.push(self.clone());
        }
    }

    /// Returns the first real cause: the first leaf of an aggregate, or `self`.
    #[must_use]
    pub fn first_cause(&self) -> Self {
        self.flatten().into_iter().next().unwrap_or_else(|| self.clone())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(e: crate::config::ConfigError) -> Self {
        Self::new(ErrorKind::Config).with_message(e.to_string())
    }
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Attach a context message on error.
    fn context(self, msg: impl Into<String>) -> Result<T>;
    /// Attach a context message computed lazily on error.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for core::result::Result<T, E> {
    fn context(self, msg: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_message(msg))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().with_message(f()))
    }
}

/// A specialized Result type for cordon operations.
pub type Result<T> = core::result::Result<T, Error>;
