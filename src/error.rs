//! Host-side error taxonomy.
//!
//! Script-visible failures travel as strings (see `vm::error`); these enums
//! classify the host's own failure modes before they are rendered for a
//! script or for stderr.

use thiserror::Error;

/// Failures of module specifier resolution.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("module '{0}' not found")]
    NotFound(String),
    #[error("module '{0}' is ambiguous: multiple candidate files exist")]
    Ambiguous(String),
    #[error("require is not allowed in this context")]
    Disallowed,
    #[error("failed to read module '{name}': {message}")]
    Io { name: String, message: String },
}

/// Failures of module loading and execution.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("{0}")]
    Compile(String),
    #[error("module must return a value")]
    NoReturnValue,
    #[error("module must return a table or function")]
    BadReturnValue,
    #[error("module can not yield")]
    UnexpectedYield,
    #[error("unknown error while running module")]
    Unknown,
    /// The module body raised; the payload is the script error verbatim.
    #[error("{0}")]
    Runtime(String),
}

/// Violations of runtime-internal invariants. These indicate host
/// programming errors, not script faults.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Top level yield cannot return any results")]
    TopLevelYieldReturnedValues,
    #[error("Cannot resume a non-thread reference")]
    NonThreadRef,
    #[error("reference used with a VM other than the one it was created in")]
    WrongVm,
    #[error("reference slot has already been released")]
    ReleasedRef,
}

/// Failures of cross-runtime marshalling and invocation.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("cannot marshal a {0} value across runtimes")]
    UnmarshalableValue(&'static str),
    #[error("cannot marshal a cyclic table across runtimes")]
    UnmarshalableCycle,
    #[error("child runtime call failed: {0}")]
    ChildFaulted(String),
}
