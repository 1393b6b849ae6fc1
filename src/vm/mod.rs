//! The embedded script VM.
//!
//! This module is the host's collaborator boundary: values, a registry for
//! host-held anchors, coroutine threads, and a small evaluator. One VM is
//! owned by exactly one runtime, and all VM state is touched only on that
//! runtime's driver thread.

pub mod ast;
pub mod error;
pub mod interp;
pub mod lexer;
pub mod parser;
pub mod thread;
pub mod value;

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

pub use error::VmError;
pub use thread::{Coroutine, Resume, ResumeMsg, ThreadState, ThreadStatus};
pub use value::{Function, NativeFn, Table, Value};

use crate::runtime::{Runtime, RuntimeHandle};

/// A non-`Send` boxed future, the shape of every suspendable computation
/// inside a VM.
pub type LocalBoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// The future type of thread bodies and host functions.
pub type NativeFuture = LocalBoxFuture<'static, Result<Vec<Value>, VmError>>;

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// One virtual machine: globals, registry, and coroutine factory.
pub struct Vm {
    id: u64,
    globals: Table,
    slots: RefCell<Vec<Option<Value>>>,
    free_slots: RefCell<Vec<usize>>,
    named_tables: RefCell<HashMap<String, Table>>,
    runtime: RefCell<Weak<Runtime>>,
    next_thread_id: Cell<u64>,
}

impl Vm {
    pub fn new() -> Rc<Vm> {
        Rc::new(Vm {
            id: NEXT_VM_ID.fetch_add(1, Ordering::Relaxed),
            globals: Table::new(),
            slots: RefCell::new(Vec::new()),
            free_slots: RefCell::new(Vec::new()),
            named_tables: RefCell::new(HashMap::new()),
            runtime: RefCell::new(Weak::new()),
            next_thread_id: Cell::new(1),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The shared global table visible to every thread of this VM.
    pub fn globals(&self) -> &Table {
        &self.globals
    }

    /// A named registry table, created on first use. The module cache lives
    /// in the table named `_MODULES`.
    pub fn registry_table(
        &self,
        name: &str,
    ) -> Table {
        let mut tables = self.named_tables.borrow_mut();
        tables
            .entry(name.to_string())
            .or_insert_with(Table::new)
            .clone()
    }

    /// Establish the back-pointer to the owning runtime. Called exactly once
    /// at runtime construction.
    pub(crate) fn bind_runtime(
        &self,
        runtime: &Rc<Runtime>,
    ) {
        *self.runtime.borrow_mut() = Rc::downgrade(runtime);
    }

    /// Recover the owning runtime; `None` once teardown has begun.
    pub fn runtime(&self) -> Option<Rc<Runtime>> {
        self.runtime.borrow().upgrade()
    }

    /// The owning runtime's shared handle, usable from any thread.
    pub fn runtime_handle(&self) -> Option<RuntimeHandle> {
        self.runtime().map(|rt| rt.handle())
    }

    /// Anchor `value` in the registry; returns the slot index.
    pub fn anchor(
        &self,
        value: Value,
    ) -> usize {
        if let Some(slot) = self.free_slots.borrow_mut().pop() {
            self.slots.borrow_mut()[slot] = Some(value);
            return slot;
        }
        let mut slots = self.slots.borrow_mut();
        slots.push(Some(value));
        slots.len() - 1
    }

    /// The value anchored at `slot`, if the slot is live.
    pub fn anchored(
        &self,
        slot: usize,
    ) -> Option<Value> {
        self.slots.borrow().get(slot).and_then(|v| v.clone())
    }

    /// Release a registry slot.
    pub fn release(
        &self,
        slot: usize,
    ) {
        let mut slots = self.slots.borrow_mut();
        if let Some(entry) = slots.get_mut(slot) {
            if entry.take().is_some() {
                self.free_slots.borrow_mut().push(slot);
            }
        }
    }

    /// Drop every anchored value. Used at runtime teardown to break the
    /// cycle between suspended thread futures and the registry.
    pub(crate) fn clear_registry(&self) {
        self.slots.borrow_mut().clear();
        self.free_slots.borrow_mut().clear();
        self.named_tables.borrow_mut().clear();
    }

    /// Compile source text into an executable chunk.
    pub fn compile(
        source: &str,
        chunk_name: &str,
    ) -> Result<Rc<ast::Chunk>, VmError> {
        parser::parse(source, chunk_name)
            .map(Rc::new)
            .map_err(|e| VmError::plain(format!("{}:{}", chunk_name, e)))
    }

    /// Create a suspended thread whose body is a host closure. The closure
    /// receives the payload of the first resume as its arguments.
    pub fn create_thread<F, Fut>(
        self: &Rc<Self>,
        chunk_name: Rc<str>,
        body: F,
    ) -> Rc<Coroutine>
    where
        F: FnOnce(CallCx, Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = Result<Vec<Value>, VmError>> + 'static,
    {
        let id = self.next_thread_id.get();
        self.next_thread_id.set(id + 1);
        let state = Rc::new(ThreadState::new(self.id, chunk_name));
        let co = Rc::new(Coroutine::bare(id, state.clone()));
        *state.self_co.borrow_mut() = Rc::downgrade(&co);
        let cx = CallCx {
            vm: self.clone(),
            thread: state.clone(),
        };
        let startup = state.clone();
        let future: NativeFuture = Box::pin(async move {
            let first = thread::await_first_resume(&startup).await?;
            body(cx, first).await
        });
        co.install(future);
        co
    }

    /// Create a suspended, sandboxed thread that runs a compiled chunk.
    /// The first resume's payload becomes the chunk's varargs.
    pub fn create_chunk_thread(
        self: &Rc<Self>,
        chunk: Rc<ast::Chunk>,
    ) -> Rc<Coroutine> {
        let name = chunk.name.clone();
        self.create_thread(name, move |cx, args| async move {
            let interp = interp::Interp::new(cx);
            interp.run_chunk(&chunk, args).await
        })
    }
}

/// Per-call context handed to host functions: the VM and the thread that is
/// executing the call.
#[derive(Clone)]
pub struct CallCx {
    pub vm: Rc<Vm>,
    pub thread: Rc<ThreadState>,
}

impl CallCx {
    /// The coroutine executing this call.
    pub fn coroutine(&self) -> Rc<Coroutine> {
        self.thread
            .self_co
            .borrow()
            .upgrade()
            .expect("executing thread is always anchored")
    }

    /// The owning runtime. Fails once teardown has begun.
    pub fn runtime(&self) -> Result<Rc<Runtime>, VmError> {
        self.vm
            .runtime()
            .ok_or_else(|| VmError::plain("runtime has shut down"))
    }

    /// Park the thread until a queued completion resumes it. A failure
    /// resume surfaces here as an `Err`, which the script observes as an
    /// ordinary raised error.
    pub async fn suspend(&self) -> Result<Vec<Value>, VmError> {
        thread::yield_values(&self.thread, Vec::new(), true).await
    }

    /// Cooperatively yield the given values to the driver. The driver
    /// requeues the thread, so execution continues on a later iteration.
    pub async fn yield_now(
        &self,
        values: Vec<Value>,
    ) -> Result<Vec<Value>, VmError> {
        thread::yield_values(&self.thread, values, false).await
    }
}
