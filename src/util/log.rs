//! Logger handle passed explicitly to every component.
//!
//! Components never reach for a process-wide logger. Each one receives a
//! `Logger` at construction; the handle wraps a `tracing` span naming the
//! component, so every event it emits carries that context.

use std::fmt::Display;

use tracing::Span;

/// A clonable logging handle bound to a component span.
#[derive(Debug, Clone)]
pub struct Logger {
    span: Span,
}

impl Logger {
    /// Create a root logger for a component.
    pub fn new(component: &str) -> Self {
        Logger {
            span: tracing::info_span!("munge", component = component),
        }
    }

    /// Create a child logger whose span is nested under this one.
    pub fn child(&self, name: &str) -> Self {
        Logger {
            span: tracing::info_span!(parent: &self.span, "scope", scope = name),
        }
    }

    pub fn debug(&self, message: impl Display) {
        self.span.in_scope(|| tracing::debug!("{}", message));
    }

    pub fn info(&self, message: impl Display) {
        self.span.in_scope(|| tracing::info!("{}", message));
    }

    pub fn warn(&self, message: impl Display) {
        self.span.in_scope(|| tracing::warn!("{}", message));
    }

    /// Log a recoverable failure.
    ///
    /// The message and the error's own description go out at `error`; the
    /// full cause chain follows at `debug` for diagnosis.
    pub fn failure(&self, message: impl Display, err: &anyhow::Error) {
        self.span.in_scope(|| {
            tracing::error!("{} ({})", message, err);
            tracing::debug!("{:?}", err);
        });
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new("munge")
    }
}
