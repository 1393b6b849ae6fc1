//! Cross-runtime function calls.
//!
//! `spawn(module_spec)` loads a module into a child runtime whose VM is
//! independent of the caller's. The child is driven by a dedicated thread
//! in `run_continuously` mode; the parent only ever holds its `Send`
//! handle. Exported functions come back as bridge functions that marshal
//! arguments into the child, run the target there, and marshal results
//! back, parking the calling thread in between so the parent scheduler can
//! progress other threads.

use std::rc::Rc;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use tracing::debug;

use crate::error::BridgeError;
use crate::require;
use crate::util::config::RuntimeConfig;
use crate::vm::{interp, CallCx, Function, NativeFn, Table, Value, VmError};

use super::{Ref, ResumeToken, Runtime, RuntimeHandle, ThreadToContinue};

/// A value in transit between two VMs. Only primitives and trees of
/// primitives can cross the boundary; everything is copied by value.
#[derive(Debug, Clone)]
pub enum Marshal {
    Nil,
    Boolean(bool),
    Number(f64),
    String(String),
    Table(Vec<(Marshal, Marshal)>),
}

/// Copy `value` out of its VM. Functions, threads, and cyclic tables are
/// rejected deterministically.
pub fn marshal_value(value: &Value) -> Result<Marshal, BridgeError> {
    let mut path = Vec::new();
    marshal_inner(value, &mut path)
}

fn marshal_inner(
    value: &Value,
    path: &mut Vec<usize>,
) -> Result<Marshal, BridgeError> {
    match value {
        Value::Nil => Ok(Marshal::Nil),
        Value::Boolean(b) => Ok(Marshal::Boolean(*b)),
        Value::Number(n) => Ok(Marshal::Number(*n)),
        Value::String(s) => Ok(Marshal::String(s.to_string())),
        Value::Table(table) => {
            let id = table.ptr_id();
            if path.contains(&id) {
                return Err(BridgeError::UnmarshalableCycle);
            }
            path.push(id);
            let mut entries = Vec::new();
            for (key, val) in table.entries() {
                entries.push((marshal_inner(&key, path)?, marshal_inner(&val, path)?));
            }
            path.pop();
            Ok(Marshal::Table(entries))
        }
        Value::Function(_) => Err(BridgeError::UnmarshalableValue("function")),
        Value::Thread(_) => Err(BridgeError::UnmarshalableValue("thread")),
    }
}

/// Rebuild a marshalled value inside the receiving VM.
pub fn unmarshal_value(marshal: &Marshal) -> Value {
    match marshal {
        Marshal::Nil => Value::Nil,
        Marshal::Boolean(b) => Value::Boolean(*b),
        Marshal::Number(n) => Value::Number(*n),
        Marshal::String(s) => Value::from(s.as_str()),
        Marshal::Table(entries) => {
            let table = Table::new();
            for (key, val) in entries {
                table.set(unmarshal_value(key), unmarshal_value(val));
            }
            Value::Table(table)
        }
    }
}

/// Parent-side ownership of a child runtime: its handle plus the driver
/// thread, which is stopped and joined when the last owner drops.
pub struct ChildRuntime {
    handle: RuntimeHandle,
    driver: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ChildRuntime {
    /// Start a child runtime on a dedicated driver thread and wait for its
    /// handle. The runtime object itself never leaves that thread.
    pub fn launch(config: RuntimeConfig) -> Result<Arc<ChildRuntime>, VmError> {
        let (tx, rx) = mpsc::channel();
        let driver = thread::Builder::new()
            .name("weft-child".to_string())
            .spawn(move || {
                let runtime = Runtime::with_config(config);
                if tx.send(runtime.handle()).is_err() {
                    return;
                }
                runtime.run_continuously();
            })
            .map_err(|err| VmError::plain(format!("failed to launch child runtime: {}", err)))?;
        let handle = rx
            .recv()
            .map_err(|_| VmError::plain("child runtime failed to start"))?;
        Ok(Arc::new(ChildRuntime {
            handle,
            driver: Mutex::new(Some(driver)),
        }))
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }
}

impl Drop for ChildRuntime {
    fn drop(&mut self) {
        self.handle.stop();
        if let Some(driver) = self.driver.lock().unwrap().take() {
            // joining from the child's own driver thread would deadlock;
            // that can only happen during abnormal teardown, so detach
            if driver.thread().id() == thread::current().id() {
                return;
            }
            let _ = driver.join();
        }
    }
}

/// The `spawn` global.
pub fn spawn_native() -> NativeFn {
    NativeFn::new("spawn", |cx, args| Box::pin(spawn_impl(cx, args)))
}

async fn spawn_impl(
    cx: CallCx,
    args: Vec<Value>,
) -> Result<Vec<Value>, VmError> {
    let spec = crate::modules::check_string("spawn", &args, 0)?;
    let caller = cx.thread.current_chunk().to_string();
    let config = cx.runtime()?.config().clone();
    debug!("spawning child runtime for module '{}'", spec);

    let child = ChildRuntime::launch(config)?;
    let token = ResumeToken::acquire(&cx)?;
    let child_for_builder = child.clone();
    let spec_for_child = spec.clone();
    child.handle().schedule(move |child_rt: &Runtime| {
        match load_bridge_module(child_rt, &spec_for_child, &caller) {
            Ok(exports) => token.complete(move |parent_rt| {
                vec![build_bridge_table(parent_rt, child_for_builder, exports)]
            }),
            Err(message) => token.fail(message),
        }
    });
    // keep our own strong reference to the child until the call resolves,
    // so the last drop can never happen on the child's driver thread
    let result = cx.suspend().await;
    drop(child);
    result
}

/// Runs on the child driver: require the module there and collect its
/// exported functions as child-VM refs.
fn load_bridge_module(
    rt: &Runtime,
    spec: &str,
    caller_chunk: &str,
) -> Result<Vec<(String, Ref)>, String> {
    let value = require::require_value(rt, spec, caller_chunk).map_err(|err| {
        let mut message = err.message().to_string();
        if let Some(trace) = err.trace() {
            message.push_str("\nstacktrace:\n");
            message.push_str(trace);
        }
        format!("Failed to spawn, target module error: {}", message)
    })?;
    let Value::Table(table) = value else {
        return Err(format!("Module {} did not return a table", spec));
    };
    let mut exports = Vec::new();
    for (key, val) in table.entries() {
        let (Value::String(name), Value::Function(_)) = (&key, &val) else {
            continue;
        };
        let anchored = Ref::capture(rt.vm(), val.clone()).map_err(|e| e.to_string())?;
        exports.push((name.to_string(), anchored));
    }
    Ok(exports)
}

/// Runs on the parent driver: build the table of bridge functions.
fn build_bridge_table(
    rt: &Runtime,
    child: Arc<ChildRuntime>,
    exports: Vec<(String, Ref)>,
) -> Value {
    let table = Table::new();
    for (name, func) in exports {
        let child = child.clone();
        let native = NativeFn::new(format!("bridge '{}'", name), move |cx, args| {
            let child = child.clone();
            let func = func.clone();
            Box::pin(async move { bridge_call(cx, child, func, args).await })
        });
        table.set(Value::from(name), Value::from_native(native));
    }
    rt.adopt_child(child);
    Value::Table(table)
}

/// A single bridge invocation, running on the parent's calling thread.
async fn bridge_call(
    cx: CallCx,
    child: Arc<ChildRuntime>,
    func: Ref,
    args: Vec<Value>,
) -> Result<Vec<Value>, VmError> {
    let mut marshalled = Vec::with_capacity(args.len());
    for value in &args {
        marshalled.push(marshal_value(value).map_err(|e| VmError::plain(e.to_string()))?);
    }
    let token = ResumeToken::acquire(&cx)?;
    child.handle().schedule(move |child_rt: &Runtime| {
        run_child_call(child_rt, func, marshalled, token);
    });
    let result = cx.suspend().await;
    drop(child);
    result
}

/// Runs on the child driver: queue a coroutine that invokes the target
/// function and routes its outcome back to the parent.
fn run_child_call(
    rt: &Runtime,
    func: Ref,
    args: Vec<Marshal>,
    token: ResumeToken,
) {
    let resolved = match func.value(rt.vm()) {
        Ok(value) => value,
        Err(err) => {
            token.fail(BridgeError::ChildFaulted(err.to_string()).to_string());
            return;
        }
    };
    let Value::Function(target) = resolved else {
        token.fail(BridgeError::ChildFaulted("target is not a function".to_string()).to_string());
        return;
    };
    let vm = rt.vm().clone();
    let co = vm.create_thread(Rc::from("=bridge"), move |call_cx, _args| async move {
        let argv: Vec<Value> = args.iter().map(unmarshal_value).collect();
        match interp::call_function(&call_cx, target, argv).await {
            Ok(values) => {
                let mut out = Vec::with_capacity(values.len());
                let mut failure = None;
                for value in &values {
                    match marshal_value(value) {
                        Ok(m) => out.push(m),
                        Err(err) => {
                            failure = Some(err);
                            break;
                        }
                    }
                }
                match failure {
                    None => token.complete(move |_parent| {
                        out.iter().map(unmarshal_value).collect()
                    }),
                    Some(err) => token.fail(err.to_string()),
                }
            }
            Err(err) => {
                token.fail(BridgeError::ChildFaulted(err.message().to_string()).to_string())
            }
        }
        Ok(Vec::new())
    });
    match Ref::capture(&vm, Value::Thread(co)) {
        Ok(target) => rt.push_thread(ThreadToContinue {
            success: true,
            target,
            values: Vec::new(),
        }),
        Err(_) => {
            // the coroutine is dropped unpolled; its abandoned token
            // resumes the parent with an error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_of(entries: &[(Value, Value)]) -> Value {
        let table = Table::new();
        for (k, v) in entries {
            table.set(k.clone(), v.clone());
        }
        Value::Table(table)
    }

    fn structural_eq(
        a: &Value,
        b: &Value,
    ) -> bool {
        match (a, b) {
            (Value::Table(x), Value::Table(y)) => {
                let xs = x.entries();
                let ys = y.entries();
                xs.len() == ys.len()
                    && xs.iter().zip(ys.iter()).all(|((ka, va), (kb, vb))| {
                        structural_eq(ka, kb) && structural_eq(va, vb)
                    })
            }
            _ => a.raw_eq(b),
        }
    }

    #[test]
    fn primitives_round_trip() {
        for value in [
            Value::Nil,
            Value::from(true),
            Value::from(3.25),
            Value::from("hello"),
        ] {
            let shipped = marshal_value(&value).expect("marshal");
            assert!(structural_eq(&unmarshal_value(&shipped), &value));
        }
    }

    #[test]
    fn tables_round_trip_structurally() {
        let inner = table_of(&[(Value::from(1.0), Value::from("one"))]);
        let outer = table_of(&[
            (Value::from("inner"), inner),
            (Value::from("flag"), Value::from(false)),
        ]);
        let shipped = marshal_value(&outer).expect("marshal");
        let back = unmarshal_value(&shipped);
        assert!(structural_eq(&back, &outer));
        // a copy, not the same table
        assert!(!back.raw_eq(&outer));
    }

    #[test]
    fn functions_do_not_cross() {
        let value = Value::from_native(NativeFn::sync("f", |_, _| Ok(Vec::new())));
        assert!(matches!(
            marshal_value(&value),
            Err(BridgeError::UnmarshalableValue("function"))
        ));
        let table = table_of(&[(Value::from("f"), value)]);
        assert!(matches!(
            marshal_value(&table),
            Err(BridgeError::UnmarshalableValue("function"))
        ));
    }

    #[test]
    fn cycles_are_rejected() {
        let table = Table::new();
        table.set(Value::from("self"), Value::Table(table.clone()));
        assert!(matches!(
            marshal_value(&Value::Table(table)),
            Err(BridgeError::UnmarshalableCycle)
        ));
    }

    #[test]
    fn shared_subtrees_are_not_cycles() {
        let shared = Table::new();
        shared.set(Value::from("x"), Value::from(1.0));
        let outer = Table::new();
        outer.set(Value::from("a"), Value::Table(shared.clone()));
        outer.set(Value::from("b"), Value::Table(shared));
        assert!(marshal_value(&Value::Table(outer)).is_ok());
    }
}
