//! Weft — a multi-VM scripting runtime host.
//!
//! Embedded scripts run inside isolated VMs; the host coordinates their
//! cooperative execution, module resolution, asynchronous I/O, and
//! cross-VM function calls. Each runtime owns one VM and drives it on a
//! single thread; blocking work runs on a process-wide worker pool and is
//! routed back through per-runtime continuation queues.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use weft::Runtime;
//!
//! let runtime = Runtime::new();
//! let ok = runtime.run_file(Path::new("main.weft"), &[]);
//! std::process::exit(if ok { 0 } else { 1 });
//! ```

#![warn(rust_2018_idioms)]

pub mod error;
pub mod modules;
pub mod require;
pub mod runtime;
pub mod util;
pub mod vm;

use std::path::PathBuf;

// Re-exports
pub use error::{BridgeError, ModuleError, ResolveError, RuntimeError};
pub use runtime::{Ref, ResumeToken, Runtime, RuntimeHandle, ThreadToContinue};
pub use util::config::RuntimeConfig;
pub use vm::{Value, Vm, VmError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Runtime name
pub const NAME: &str = "weft";

/// Run every file on one shared runtime, passing `args` to each script as
/// its program arguments. Returns `true` only if every file ran to
/// completion.
pub fn run_files(
    files: &[PathBuf],
    args: &[String],
    config: RuntimeConfig,
) -> bool {
    if let Some(threads) = config.worker_threads {
        runtime::worker::configure(threads);
    }
    let runtime = Runtime::with_config(config);
    let mut ok = true;
    for file in files {
        ok &= runtime.run_file(file, args);
    }
    ok
}
