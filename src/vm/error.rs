//! Script-level error values.
//!
//! Errors raised inside a script thread travel as plain strings, the same
//! way the embedded VM reports them to its host. A trace is attached once,
//! at the innermost call boundary that observes the failure, and is kept
//! separate from the message so callers can decide whether to display it.

use std::fmt;

/// An error raised by (or injected into) a script thread.
#[derive(Debug, Clone)]
pub struct VmError {
    message: String,
    trace: Option<String>,
}

impl VmError {
    /// An error with no source position, e.g. raised from a host function.
    pub fn plain(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            trace: None,
        }
    }

    /// An error injected into a thread as a failure resume.
    pub fn script(message: impl Into<String>) -> Self {
        Self::plain(message)
    }

    /// The error message as a script would observe it.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The captured call trace, if one was attached.
    pub fn trace(&self) -> Option<&str> {
        self.trace.as_deref()
    }

    /// Attach a trace unless one is already present.
    pub fn ensure_trace(
        &mut self,
        render: impl FnOnce() -> String,
    ) {
        if self.trace.is_none() {
            self.trace = Some(render());
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for VmError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_is_attached_once() {
        let mut err = VmError::plain("boom");
        err.ensure_trace(|| "first".to_string());
        err.ensure_trace(|| "second".to_string());
        assert_eq!(err.trace(), Some("first"));
        assert_eq!(err.to_string(), "boom");
    }
}
