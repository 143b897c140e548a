// src/error.rs
//! Error handling for the entire crate.
//!
//! - **Performance**: Enum discriminant (cheap match), allocations *only* on error paths.
//! - **Features**: Context chaining, custom messages, transparent std errors, `Result` alias.
//! - Works with `?` everywhere; the demo binary folds everything into `anyhow` at the edge.

use std::fmt;
use thiserror::Error;

/// Main error type — lightweight, Send + Sync + 'static.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// BVH construction was handed an empty object range.
    #[error("BVH build requires at least one object")]
    EmptyBvhInput,

    /// The live instance count exceeds a configured buffer capacity.
    #[error("capacity exceeded: {what} needs {needed} elements but holds {capacity}")]
    CapacityExceeded {
        what: &'static str,
        needed: usize,
        capacity: usize,
    },

    /// The orchestrator was initialized twice.
    #[error("occlusion culler is already initialized")]
    AlreadyInitialized,

    /// A per-frame entry point ran before `initialize`.
    #[error("occlusion culler is not initialized")]
    NotInitialized,

    /// A frame-graph pass reads a resource no earlier pass writes.
    #[error("pass `{pass}` reads resource {resource} which has no producer")]
    UnwrittenResource { pass: &'static str, resource: u16 },

    /// Simple custom message (allocation only when the error happens).
    #[error("{0}")]
    Custom(String),

    /// Rich context chaining.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a custom error message.
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Create a formatted custom error (like `format!` but returns `Error`).
    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    /// Add context to any error (chainable).
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Quick static message.
    #[inline]
    pub fn msg(msg: &'static str) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn is_capacity(&self) -> bool {
        matches!(self, Error::CapacityExceeded { .. })
    }

    #[inline]
    pub fn is_custom(&self) -> bool {
        matches!(self, Error::Custom(_))
    }
}

/// Convenient `Result` alias — use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;
