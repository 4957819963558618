//! Error reporting hooks.
//!
//! The streaming core reports recoverable failures here and carries on; a
//! reporter can never influence the outcome of a transfer.

use std::error::Error;

/// Fire-and-forget sink for failure events.
pub trait Reporter: Send + Sync {
    fn report_exception(&self, error: &(dyn Error + 'static));

    fn report_message(&self, message: &str);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report_exception(&self, _error: &(dyn Error + 'static)) {}

    fn report_message(&self, _message: &str) {}
}

/// Emits events as `tracing` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report_exception(&self, error: &(dyn Error + 'static)) {
        let mut chain = error.to_string();
        let mut source = error.source();
        while let Some(cause) = source {
            chain.push_str(": ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        tracing::error!(error = %chain, "reported exception");
    }

    fn report_message(&self, message: &str) {
        tracing::warn!(message, "reported message");
    }
}
