//! Host modules exposed to scripts.
//!
//! Each module contributes a table of host functions; each function decides
//! for itself whether it returns synchronously or suspends the calling
//! thread through the async work bridge.

pub mod base;
pub mod fs;
pub mod net;

use std::rc::Rc;

use crate::runtime::Runtime;
use crate::vm::{CallCx, NativeFn, Table, Value, VmError};

/// A host module: a named table of native functions.
pub trait HostModule {
    fn name(&self) -> &'static str;
    fn exports(&self) -> Vec<NativeFn>;
}

/// Register every host module and global into the runtime's VM.
pub fn install(rt: &Rc<Runtime>) {
    let vm = rt.vm();
    base::install_globals(vm);
    let modules: [&dyn HostModule; 2] = [&net::NetModule, &fs::FsModule];
    for module in modules {
        let table = Table::new();
        for export in module.exports() {
            let name = export.name.clone();
            table.set(Value::from(name), Value::from_native(export));
        }
        vm.globals()
            .set(Value::from(module.name()), Value::Table(table));
    }
    vm.globals().set(
        Value::from("require"),
        Value::from_native(crate::require::require_native()),
    );
    vm.globals().set(
        Value::from("spawn"),
        Value::from_native(crate::runtime::bridge::spawn_native()),
    );
}

/// Argument checking shared by the host functions.
pub(crate) fn check_string(
    fname: &str,
    args: &[Value],
    index: usize,
) -> Result<String, VmError> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.to_string()),
        other => Err(bad_argument(fname, index, "string", other)),
    }
}

pub(crate) fn bad_argument(
    fname: &str,
    index: usize,
    expected: &str,
    got: Option<&Value>,
) -> VmError {
    VmError::plain(format!(
        "bad argument #{} to '{}' ({} expected, got {})",
        index + 1,
        fname,
        expected,
        got.map(|v| v.type_name()).unwrap_or("no value")
    ))
}

/// Shorthand used by async host functions to reach their runtime handle.
pub(crate) fn runtime_of(cx: &CallCx) -> Result<Rc<Runtime>, VmError> {
    cx.runtime()
}
