//! The runtime coordinator.
//!
//! A `Runtime` owns exactly one VM and drives its cooperative threads. The
//! driver interleaves two queues: `running_threads`, a driver-local deque of
//! threads ready to resume, and a mutex-protected continuation queue that
//! any thread (worker pool, other runtimes) may push to. Continuations are
//! always drained before the next thread resume, so host-posted results are
//! visible to the thread that suspended waiting for them.

pub mod bridge;
pub mod vm_ref;
pub mod worker;

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::Path;
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::error::RuntimeError;
use crate::util::config::RuntimeConfig;
use crate::vm::{CallCx, Resume, ResumeMsg, Value, Vm, VmError};

use bridge::ChildRuntime;
pub use vm_ref::Ref;

/// A thread ready to be resumed, together with its resume payload. The
/// payload length is the resume argument count; on a failure resume the
/// first value is the error message.
pub struct ThreadToContinue {
    pub success: bool,
    pub target: Ref,
    pub values: Vec<Value>,
}

/// A closure queued for execution on the runtime's driver thread, where it
/// may freely touch the VM.
type Continuation = Box<dyn FnOnce(&Runtime) + Send>;

struct SharedState {
    queue: Vec<Continuation>,
    pending_tokens: usize,
    stopped: bool,
}

/// The half of a runtime that may be shared across threads.
struct RuntimeShared {
    state: Mutex<SharedState>,
    wakeup: Condvar,
}

/// A cloneable, `Send` handle to a runtime's continuation queue.
#[derive(Clone)]
pub struct RuntimeHandle {
    shared: Arc<RuntimeShared>,
}

impl RuntimeHandle {
    /// Enqueue a continuation. Dropped silently once the runtime has been
    /// torn down, so late completions never touch a destroyed VM.
    pub fn schedule(
        &self,
        f: impl FnOnce(&Runtime) + Send + 'static,
    ) {
        let mut state = self.shared.state.lock().unwrap();
        if state.stopped {
            return;
        }
        state.queue.push(Box::new(f));
        self.shared.wakeup.notify_all();
    }

    /// Enqueue a continuation that resumes `target` with `message` as a
    /// failure, which the thread observes as a raised error.
    pub fn schedule_error(
        &self,
        target: Ref,
        message: String,
    ) {
        self.schedule(move |rt| {
            rt.push_thread(ThreadToContinue {
                success: false,
                target,
                values: vec![Value::from(message)],
            });
        });
    }

    /// Enqueue a continuation that calls `builder` on the driver thread to
    /// produce the resume payload, then queues a success resume.
    pub fn schedule_resume(
        &self,
        target: Ref,
        builder: impl FnOnce(&Runtime) -> Vec<Value> + Send + 'static,
    ) {
        self.schedule(move |rt| {
            let values = builder(rt);
            rt.push_thread(ThreadToContinue {
                success: true,
                target,
                values,
            });
        });
    }

    /// Record an outstanding off-thread activity. The driver loop will not
    /// declare completion while tokens are held.
    pub fn add_pending_token(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.pending_tokens += 1;
    }

    pub fn release_pending_token(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.pending_tokens = state.pending_tokens.saturating_sub(1);
        self.shared.wakeup.notify_all();
    }

    /// Request shutdown of a continuously-running driver.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.stopped = true;
        self.shared.wakeup.notify_all();
    }
}

/// RAII pending token; releasing after drop guarantees the token outlives
/// the enqueue of its continuation.
pub struct PendingToken {
    handle: RuntimeHandle,
}

impl PendingToken {
    pub fn new(handle: &RuntimeHandle) -> PendingToken {
        handle.add_pending_token();
        PendingToken {
            handle: handle.clone(),
        }
    }
}

impl Drop for PendingToken {
    fn drop(&mut self) {
        self.handle.release_pending_token();
    }
}

/// Everything an async host function needs to resume its calling thread
/// later: the thread's `Ref`, the owning runtime's handle, and a pending
/// token that keeps the driver loop alive. If the token is dropped without
/// being consumed, the thread is resumed with an error instead of hanging.
pub struct ResumeToken {
    target: Ref,
    handle: RuntimeHandle,
    pending: Option<PendingToken>,
    armed: bool,
}

impl ResumeToken {
    /// Capture the calling thread of `cx`. Must be followed by a yield.
    pub fn acquire(cx: &CallCx) -> Result<ResumeToken, VmError> {
        let handle = cx
            .vm
            .runtime_handle()
            .ok_or_else(|| VmError::plain("runtime has shut down"))?;
        let target = Ref::capture(&cx.vm, Value::Thread(cx.coroutine()))?;
        Ok(ResumeToken {
            target,
            pending: Some(PendingToken::new(&handle)),
            handle,
            armed: true,
        })
    }

    /// Resume the captured thread with the values produced by `builder`.
    pub fn complete(
        mut self,
        builder: impl FnOnce(&Runtime) -> Vec<Value> + Send + 'static,
    ) {
        self.armed = false;
        self.handle.schedule_resume(self.target.clone(), builder);
        // the pending token drops here, after the continuation is enqueued
    }

    /// Resume the captured thread with a failure.
    pub fn fail(
        mut self,
        message: String,
    ) {
        self.armed = false;
        self.handle.schedule_error(self.target.clone(), message);
    }
}

impl Drop for ResumeToken {
    fn drop(&mut self) {
        if self.armed {
            self.handle
                .schedule_error(self.target.clone(), "async operation was abandoned".to_string());
        }
        let _ = self.pending.take();
    }
}

/// A fatal driver failure, already formatted for stderr.
pub(crate) struct DriverFault {
    message: String,
}

impl DriverFault {
    fn new(message: impl Into<String>) -> DriverFault {
        DriverFault {
            message: message.into(),
        }
    }
}

impl fmt::Display for DriverFault {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// The host-side owner of one VM and its scheduling state.
pub struct Runtime {
    vm: Rc<Vm>,
    running_threads: RefCell<VecDeque<ThreadToContinue>>,
    shared: Arc<RuntimeShared>,
    children: RefCell<Vec<Arc<ChildRuntime>>>,
    config: RuntimeConfig,
}

impl Runtime {
    /// A fresh runtime with host modules registered.
    pub fn new() -> Rc<Runtime> {
        Runtime::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Rc<Runtime> {
        let vm = Vm::new();
        let runtime = Rc::new(Runtime {
            vm: vm.clone(),
            running_threads: RefCell::new(VecDeque::new()),
            shared: Arc::new(RuntimeShared {
                state: Mutex::new(SharedState {
                    queue: Vec::new(),
                    pending_tokens: 0,
                    stopped: false,
                }),
                wakeup: Condvar::new(),
            }),
            children: RefCell::new(Vec::new()),
            config,
        });
        vm.bind_runtime(&runtime);
        crate::modules::install(&runtime);
        runtime
    }

    pub fn vm(&self) -> &Rc<Vm> {
        &self.vm
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            shared: self.shared.clone(),
        }
    }

    /// Queue a thread for resumption. A no-op once teardown has begun.
    pub fn push_thread(
        &self,
        thread: ThreadToContinue,
    ) {
        if self.is_stopped() {
            return;
        }
        self.running_threads.borrow_mut().push_back(thread);
    }

    /// Number of threads currently queued for resumption.
    pub fn queued_thread_count(&self) -> usize {
        self.running_threads.borrow().len()
    }

    /// Take strong ownership of a child runtime.
    pub(crate) fn adopt_child(
        &self,
        child: Arc<ChildRuntime>,
    ) {
        self.children.borrow_mut().push(child);
    }

    pub fn schedule(
        &self,
        f: impl FnOnce(&Runtime) + Send + 'static,
    ) {
        self.handle().schedule(f);
    }

    pub fn schedule_error(
        &self,
        target: Ref,
        message: String,
    ) {
        self.handle().schedule_error(target, message);
    }

    pub fn schedule_resume(
        &self,
        target: Ref,
        builder: impl FnOnce(&Runtime) -> Vec<Value> + Send + 'static,
    ) {
        self.handle().schedule_resume(target, builder);
    }

    /// Submit blocking work to the process-wide worker pool.
    pub fn run_in_work_queue(
        &self,
        f: impl FnOnce() + Send + 'static,
    ) {
        worker::submit(f);
    }

    /// Load `path`, queue it as a sandboxed top-level thread with `args` as
    /// its program arguments, and drive the runtime until idle. Returns
    /// `false` on any failure.
    pub fn run_file(
        &self,
        path: &Path,
        args: &[String],
    ) -> bool {
        let source = match fs::read_to_string(path) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("Error opening {}: {}", path.display(), err);
                return false;
            }
        };
        let absolute = path.canonicalize().unwrap_or_else(|_| {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        });
        let chunk_name = format!("@{}", absolute.display());
        debug!("running {}", chunk_name);
        let chunk = match Vm::compile(&source, &chunk_name) {
            Ok(chunk) => chunk,
            Err(err) => {
                eprintln!("{}", err);
                return false;
            }
        };
        let co = self.vm.create_chunk_thread(chunk);
        let target = match Ref::capture(&self.vm, Value::Thread(co)) {
            Ok(target) => target,
            Err(err) => {
                eprintln!("{}", err);
                return false;
            }
        };
        let values = args.iter().map(|a| Value::from(a.as_str())).collect();
        self.push_thread(ThreadToContinue {
            success: true,
            target,
            values,
        });
        self.run_to_completion()
    }

    /// Drive the cooperative loop until both queues are empty and no
    /// pending tokens remain. Returns `false` on a fatal script failure.
    /// Calling this on a drained runtime is a no-op returning `true`.
    pub fn run_to_completion(&self) -> bool {
        match self.drive(false) {
            Ok(()) => true,
            Err(fault) => {
                eprintln!("{}", fault);
                false
            }
        }
    }

    /// Driver mode for child runtimes: block waiting for work until the
    /// shared stop flag is set. Thread failures are reported but do not end
    /// the loop.
    pub fn run_continuously(&self) {
        if let Err(fault) = self.drive(true) {
            eprintln!("{}", fault);
        }
    }

    fn is_stopped(&self) -> bool {
        self.shared.state.lock().unwrap().stopped
    }

    fn take_continuations(&self) -> Vec<Continuation> {
        let mut state = self.shared.state.lock().unwrap();
        std::mem::take(&mut state.queue)
    }

    fn drive(
        &self,
        continuous: bool,
    ) -> Result<(), DriverFault> {
        loop {
            // Continuations drain strictly before the next thread resume.
            for continuation in self.take_continuations() {
                continuation(self);
            }

            if continuous && self.is_stopped() {
                return Ok(());
            }

            let next = self.running_threads.borrow_mut().pop_front();
            let Some(next) = next else {
                let state = self.shared.state.lock().unwrap();
                if !state.queue.is_empty() {
                    continue;
                }
                if continuous {
                    if state.stopped {
                        return Ok(());
                    }
                } else if state.pending_tokens == 0 {
                    return Ok(());
                }
                let _woken = self.shared.wakeup.wait(state).unwrap();
                continue;
            };

            match self.resume_next(next) {
                Ok(()) => {}
                Err(fault) if continuous => eprintln!("{}", fault),
                Err(fault) => return Err(fault),
            }
        }
    }

    fn resume_next(
        &self,
        next: ThreadToContinue,
    ) -> Result<(), DriverFault> {
        let resolved = match next.target.value(&self.vm) {
            Ok(value) => value,
            Err(_) => {
                return Err(DriverFault::new(RuntimeError::NonThreadRef.to_string()))
            }
        };
        let Value::Thread(co) = resolved else {
            return Err(DriverFault::new(RuntimeError::NonThreadRef.to_string()));
        };
        let msg = if next.success {
            ResumeMsg::Values(next.values)
        } else {
            let text = next
                .values
                .first()
                .map(|v| v.to_string())
                .unwrap_or_default();
            ResumeMsg::Error(text)
        };
        match co.resume(msg) {
            Resume::Yield { values, parked } => {
                if !values.is_empty() {
                    let mut message = RuntimeError::TopLevelYieldReturnedValues.to_string();
                    message.push_str("\nstacktrace:\n");
                    message.push_str(&co.state.traceback());
                    return Err(DriverFault::new(message));
                }
                if !parked {
                    // a bare cooperative yield: the thread stays runnable
                    self.push_thread(ThreadToContinue {
                        success: true,
                        target: next.target,
                        values: Vec::new(),
                    });
                }
                // parked threads are absent from the running queue until a
                // completion requeues them
            }
            Resume::Done(_) => {
                // results of a finished top-level thread are ignored
            }
            Resume::Error(err) => {
                let mut message = err.message().to_string();
                message.push_str("\nstacktrace:\n");
                match err.trace() {
                    Some(trace) => message.push_str(trace),
                    None => message.push_str(&co.state.traceback()),
                }
                return Err(DriverFault::new(message));
            }
        }
        Ok(())
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.stopped = true;
            self.shared.wakeup.notify_all();
            // wait for outstanding worker tasks to settle their tokens
            while state.pending_tokens > 0 {
                state = self.shared.wakeup.wait(state).unwrap();
            }
        }
        // drain what was enqueued before the stop; resumes are no-ops now
        for continuation in self.take_continuations() {
            continuation(self);
        }
        self.running_threads.borrow_mut().clear();
        // break the registry/thread-future cycle before the VM goes away
        self.vm.clear_registry();
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;
    use std::sync::{Arc, Mutex};

    use super::*;

    fn spawn_parked_thread(
        rt: &Rc<Runtime>,
        name: &'static str,
        tokens: Arc<Mutex<Vec<(String, ResumeToken)>>>,
        order: Arc<Mutex<Vec<String>>>,
    ) {
        let co = rt.vm().create_thread(Rc::from("=test"), move |cx, _args| async move {
            let token = ResumeToken::acquire(&cx)?;
            tokens.lock().unwrap().push((name.to_string(), token));
            cx.suspend().await?;
            order.lock().unwrap().push(name.to_string());
            Ok(Vec::new())
        });
        let target = Ref::capture(rt.vm(), Value::Thread(co)).expect("capture");
        rt.push_thread(ThreadToContinue {
            success: true,
            target,
            values: Vec::new(),
        });
    }

    /// Re-arm until both threads have parked, then complete B before A.
    fn complete_in_reverse_once_parked(
        handle: RuntimeHandle,
        tokens: Arc<Mutex<Vec<(String, ResumeToken)>>>,
    ) {
        let rearm_handle = handle.clone();
        handle.schedule(move |_rt| {
            let mut guard = tokens.lock().unwrap();
            if guard.len() < 2 {
                drop(guard);
                complete_in_reverse_once_parked(rearm_handle, tokens);
                return;
            }
            let mut parked: Vec<_> = guard.drain(..).collect();
            drop(guard);
            parked.sort_by(|a, b| b.0.cmp(&a.0));
            for (_, token) in parked {
                token.complete(|_| Vec::new());
            }
        });
    }

    #[test]
    fn resumes_follow_continuation_enqueue_order() {
        let rt = Runtime::new();
        let order: Arc<Mutex<Vec<String>>> = Arc::default();
        let tokens: Arc<Mutex<Vec<(String, ResumeToken)>>> = Arc::default();
        spawn_parked_thread(&rt, "A", tokens.clone(), order.clone());
        spawn_parked_thread(&rt, "B", tokens.clone(), order.clone());
        complete_in_reverse_once_parked(rt.handle(), tokens.clone());
        assert!(rt.run_to_completion());
        assert_eq!(*order.lock().unwrap(), vec!["B".to_string(), "A".to_string()]);
    }

    #[test]
    fn parked_threads_are_absent_from_the_running_queue() {
        let rt = Runtime::new();
        let observed: Arc<Mutex<Vec<usize>>> = Arc::default();
        let observed_in_body = observed.clone();
        let co = rt.vm().create_thread(Rc::from("=test"), move |cx, _args| async move {
            let token = ResumeToken::acquire(&cx)?;
            let handle = cx.runtime()?.handle();
            let observed = observed_in_body;
            handle.schedule(move |rt| {
                observed.lock().unwrap().push(rt.queued_thread_count());
                token.complete(|_| Vec::new());
            });
            cx.suspend().await?;
            Ok(Vec::new())
        });
        let target = Ref::capture(rt.vm(), Value::Thread(co)).expect("capture");
        rt.push_thread(ThreadToContinue {
            success: true,
            target,
            values: Vec::new(),
        });
        assert!(rt.run_to_completion());
        // the checker ran while the thread was parked: not queued anywhere
        assert_eq!(*observed.lock().unwrap(), vec![0]);
    }

    #[test]
    fn drained_runtime_completion_is_idempotent() {
        let rt = Runtime::new();
        assert!(rt.run_to_completion());
        assert!(rt.run_to_completion());
    }

    #[test]
    fn top_level_yield_with_values_is_fatal() {
        let rt = Runtime::new();
        let chunk = Vm::compile("coroutine.yield(1)", "@yield_top").expect("compile");
        let co = rt.vm().create_chunk_thread(chunk);
        let target = Ref::capture(rt.vm(), Value::Thread(co)).expect("capture");
        rt.push_thread(ThreadToContinue {
            success: true,
            target,
            values: Vec::new(),
        });
        let fault = rt.drive(false).expect_err("driver should fail");
        assert!(
            fault.to_string().contains("Top level yield cannot return any results"),
            "unexpected fault: {}",
            fault
        );
        assert!(fault.to_string().contains("stacktrace:"));
    }

    #[test]
    fn bare_yield_requeues_the_thread() {
        let rt = Runtime::new();
        let finished: Arc<Mutex<bool>> = Arc::default();
        let flag = finished.clone();
        let co = rt.vm().create_thread(Rc::from("=test"), move |cx, _args| async move {
            cx.yield_now(Vec::new()).await?;
            *flag.lock().unwrap() = true;
            Ok(Vec::new())
        });
        let target = Ref::capture(rt.vm(), Value::Thread(co)).expect("capture");
        rt.push_thread(ThreadToContinue {
            success: true,
            target,
            values: Vec::new(),
        });
        assert!(rt.run_to_completion());
        assert!(*finished.lock().unwrap());
    }

    #[test]
    fn non_thread_refs_cannot_be_resumed() {
        let rt = Runtime::new();
        let target = Ref::capture(rt.vm(), Value::from(1.0)).expect("capture");
        rt.push_thread(ThreadToContinue {
            success: true,
            target,
            values: Vec::new(),
        });
        let fault = rt.drive(false).expect_err("driver should fail");
        assert!(fault.to_string().contains("Cannot resume a non-thread reference"));
    }

    #[test]
    fn failure_resume_surfaces_as_script_error() {
        let rt = Runtime::new();
        let seen: Arc<Mutex<Vec<String>>> = Arc::default();
        let seen_in_body = seen.clone();
        let co = rt.vm().create_thread(Rc::from("=test"), move |cx, _args| async move {
            let token = ResumeToken::acquire(&cx)?;
            let handle = cx.runtime()?.handle();
            handle.schedule(move |_rt| token.fail("boom".to_string()));
            let err = cx.suspend().await.expect_err("expected failure resume");
            seen_in_body.lock().unwrap().push(err.to_string());
            Ok(Vec::new())
        });
        let target = Ref::capture(rt.vm(), Value::Thread(co)).expect("capture");
        rt.push_thread(ThreadToContinue {
            success: true,
            target,
            values: Vec::new(),
        });
        assert!(rt.run_to_completion());
        assert_eq!(*seen.lock().unwrap(), vec!["boom".to_string()]);
    }
}
