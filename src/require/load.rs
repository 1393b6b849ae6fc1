//! Module loading and execution.
//!
//! A resolved module runs on a fresh thread created off the main coroutine
//! so it does not inherit the caller's sandbox; the new thread is itself
//! sandboxed. The module's top-level code runs at most once per runtime:
//! both successful values and load failures are cached under the absolute
//! path, and a cached failure re-raises on every later require.

use tracing::debug;

use crate::error::ModuleError;
use crate::runtime::Runtime;
use crate::vm::{NativeFn, Resume, ResumeMsg, Value, Vm, VmError};

use super::resolver::{RequireResolver, ResolvedRequire};
use super::{CacheManager, ErrorHandler, ModuleStatus, RequireContext};

/// Name of the VM registry table that holds the module cache.
pub const MODULES_TABLE: &str = "_MODULES";

/// The runtime's require context. `source` is the caller's chunk
/// descriptor: `@` prefixes file paths, `=` prefixes synthetic origins
/// such as `=stdin`.
struct RuntimeRequireContext {
    source: String,
}

impl RequireContext for RuntimeRequireContext {
    fn path(&self) -> String {
        self.source.get(1..).unwrap_or_default().to_string()
    }

    fn is_require_allowed(&self) -> bool {
        true
    }

    fn is_stdin(&self) -> bool {
        self.source == "=stdin"
    }

    fn create_identifier(
        &self,
        path: &str,
    ) -> String {
        format!("@{}", path)
    }
}

/// Cache probe backed by the `_MODULES` registry table.
struct RuntimeCacheManager<'a> {
    vm: &'a Vm,
}

impl CacheManager for RuntimeCacheManager<'_> {
    fn is_cached(
        &mut self,
        path: &str,
    ) -> bool {
        let cached = self.vm.registry_table(MODULES_TABLE).get(&Value::from(path));
        !matches!(cached, Value::Nil)
    }
}

/// Collects the resolver's failure report so the host can raise it on the
/// calling thread.
#[derive(Default)]
struct RuntimeErrorHandler {
    message: Option<String>,
}

impl ErrorHandler for RuntimeErrorHandler {
    fn report(
        &mut self,
        message: String,
    ) {
        self.message = Some(message);
    }
}

/// Resolve and load a module in the context of `caller_chunk`, returning
/// the module's value. Used by the `require` global and by `spawn`.
pub fn require_value(
    rt: &Runtime,
    name: &str,
    caller_chunk: &str,
) -> Result<Value, VmError> {
    let vm = rt.vm();
    let context = RuntimeRequireContext {
        source: caller_chunk.to_string(),
    };
    let mut cache = RuntimeCacheManager { vm: vm.as_ref() };
    let mut errors = RuntimeErrorHandler::default();

    let mut cached_value: Option<Value> = None;
    let resolver = RequireResolver::new(
        name,
        &context,
        &mut cache,
        &mut errors,
        rt.config().module_extension.as_str(),
    );
    let resolved = resolver.resolve_require(|status, absolute| {
        if status == ModuleStatus::Cached {
            cached_value = Some(vm.registry_table(MODULES_TABLE).get(&Value::from(absolute)));
        }
    });

    match resolved.status {
        ModuleStatus::Cached => finish_require(cached_value.unwrap_or(Value::Nil)),
        ModuleStatus::FileRead => {
            let outcome = run_module(rt, &resolved);
            let cache_key = Value::from(resolved.absolute_path.as_str());
            match outcome {
                Ok(value) => {
                    vm.registry_table(MODULES_TABLE).set(cache_key, value.clone());
                    finish_require(value)
                }
                Err(err) => {
                    // failures are cached too: the module ran once, and
                    // later requires re-raise the same error
                    vm.registry_table(MODULES_TABLE)
                        .set(cache_key, Value::from(err.message()));
                    Err(err)
                }
            }
        }
        ModuleStatus::NotFound | ModuleStatus::ErrorReported => {
            let message = errors
                .message
                .take()
                .expect("resolver reports before returning NotFound or ErrorReported");
            Err(VmError::plain(message))
        }
    }
}

/// A cached module value that is a string is a recorded load failure.
fn finish_require(value: Value) -> Result<Value, VmError> {
    match value {
        Value::String(message) => Err(VmError::script(message.to_string())),
        other => Ok(other),
    }
}

/// Compile and run a module chunk on a fresh sandboxed thread, then
/// validate what it produced.
fn run_module(
    rt: &Runtime,
    resolved: &ResolvedRequire,
) -> Result<Value, VmError> {
    debug!("loading module {}", resolved.identifier);
    let chunk = Vm::compile(&resolved.source_code, &resolved.identifier)
        .map_err(|err| VmError::plain(ModuleError::Compile(err.to_string()).to_string()))?;
    let co = rt.vm().create_chunk_thread(chunk);
    match co.resume(ResumeMsg::Values(Vec::new())) {
        Resume::Done(values) => match values.into_iter().last() {
            None => Err(VmError::plain(ModuleError::NoReturnValue.to_string())),
            Some(value @ (Value::Table(_) | Value::Function(_))) => Ok(value),
            Some(_) => Err(VmError::plain(ModuleError::BadReturnValue.to_string())),
        },
        Resume::Yield { .. } => Err(VmError::plain(ModuleError::UnexpectedYield.to_string())),
        Resume::Error(err) => {
            if err.message().is_empty() {
                return Err(VmError::plain(ModuleError::Unknown.to_string()));
            }
            let mut wrapped =
                VmError::script(ModuleError::Runtime(err.message().to_string()).to_string());
            if let Some(trace) = err.trace() {
                let trace = trace.to_string();
                wrapped.ensure_trace(|| trace);
            }
            Err(wrapped)
        }
    }
}

/// The `require` global: resolves relative to the calling chunk.
pub fn require_native() -> NativeFn {
    NativeFn::sync("require", |cx, args| {
        let name = crate::modules::check_string("require", &args, 0)?;
        let caller = cx.thread.current_chunk().to_string();
        let rt = cx.runtime()?;
        let value = require_value(&rt, &name, &caller)
            .map_err(|err| VmError::script(err.message().to_string()))?;
        Ok(vec![value])
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use tempfile::TempDir;

    use crate::runtime::Runtime;
    use crate::vm::Value;

    use super::*;

    fn write(
        dir: &Path,
        name: &str,
        source: &str,
    ) {
        fs::write(dir.join(name), source).expect("write module");
    }

    fn caller(dir: &Path) -> String {
        format!("@{}/main.weft", dir.display())
    }

    #[test]
    fn modules_load_and_cache_identically() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "a.weft", "return {x = 1}");
        let rt = Runtime::new();
        let first = require_value(&rt, "./a", &caller(dir.path())).expect("first require");
        let second = require_value(&rt, "./a", &caller(dir.path())).expect("second require");
        // identical cached value, not a re-run
        assert!(first.raw_eq(&second));
        let Value::Table(table) = first else {
            panic!("expected table");
        };
        assert_eq!(table.get(&Value::from("x")), Value::from(1.0));
    }

    #[test]
    fn module_top_level_runs_once() {
        let dir = TempDir::new().expect("tempdir");
        // the module mutates its own table on each top-level run
        write(
            dir.path(),
            "counted.weft",
            "local t = {runs = 0}\nt.runs = t.runs + 1\nreturn t",
        );
        let rt = Runtime::new();
        let caller = caller(dir.path());
        let first = require_value(&rt, "./counted", &caller).expect("require");
        let _ = require_value(&rt, "./counted", &caller).expect("require");
        let Value::Table(table) = first else {
            panic!("expected table");
        };
        assert_eq!(table.get(&Value::from("runs")), Value::from(1.0));
    }

    #[test]
    fn module_returning_nothing_fails() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "empty.weft", "local x = 1");
        let rt = Runtime::new();
        let err = require_value(&rt, "./empty", &caller(dir.path())).expect_err("should fail");
        assert_eq!(err.message(), "module must return a value");
    }

    #[test]
    fn module_returning_a_number_fails() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "bad.weft", "return 42");
        let rt = Runtime::new();
        let err = require_value(&rt, "./bad", &caller(dir.path())).expect_err("should fail");
        assert_eq!(err.message(), "module must return a table or function");
    }

    #[test]
    fn module_yielding_fails() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "yields.weft", "coroutine.yield()\nreturn {}");
        let rt = Runtime::new();
        let err = require_value(&rt, "./yields", &caller(dir.path())).expect_err("should fail");
        assert_eq!(err.message(), "module can not yield");
    }

    #[test]
    fn load_failures_are_cached_and_re_raised() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "bad.weft", "return 42");
        let rt = Runtime::new();
        let caller = caller(dir.path());
        let first = require_value(&rt, "./bad", &caller).expect_err("should fail");
        // replacing the file does not matter: the failure is cached
        write(dir.path(), "bad.weft", "return {}");
        let second = require_value(&rt, "./bad", &caller).expect_err("still failing");
        assert_eq!(first.message(), second.message());
    }

    #[test]
    fn missing_module_reports_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let rt = Runtime::new();
        let err = require_value(&rt, "./absent", &caller(dir.path())).expect_err("should fail");
        assert!(err.message().contains("not found"));
    }

    #[test]
    fn nested_requires_resolve_against_the_module() {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir(dir.path().join("lib")).expect("mkdir");
        write(dir.path(), "lib/inner.weft", "return {v = 7}");
        write(
            dir.path(),
            "lib/outer.weft",
            "local inner = require(\"./inner\")\nreturn {v = inner.v}",
        );
        let rt = Runtime::new();
        let value =
            require_value(&rt, "./lib/outer", &caller(dir.path())).expect("require outer");
        let Value::Table(table) = value else {
            panic!("expected table");
        };
        assert_eq!(table.get(&Value::from("v")), Value::from(7.0));
    }
}
