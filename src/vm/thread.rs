//! Cooperative script threads.
//!
//! A thread is a future that is polled by its owning runtime. Scripts can
//! suspend only inside host functions that explicitly yield, so a single
//! poll either runs the thread to completion or parks it at the next yield
//! point. Resume payloads travel through a one-slot mailbox that the driver
//! fills immediately before polling.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};
use std::task::{Context, Poll, Waker};

use super::error::VmError;
use super::value::Value;
use super::NativeFuture;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Suspended,
    Running,
    Dead,
}

/// The payload handed to a thread when it is resumed.
pub enum ResumeMsg {
    /// Normal resume; the values become the result of the yield.
    Values(Vec<Value>),
    /// Failure resume; the message is raised inside the thread as an error.
    Error(String),
}

/// Outcome of one resume.
pub enum Resume {
    /// The thread suspended. `parked` is set when the suspension came from
    /// an async host call that will be continued by a queued completion;
    /// such threads must not be requeued by the driver.
    Yield { values: Vec<Value>, parked: bool },
    /// The thread ran to completion with these results.
    Done(Vec<Value>),
    /// The thread failed.
    Error(VmError),
}

/// One entry of the script call stack, kept for traces.
pub struct FrameInfo {
    pub name: String,
    pub chunk: Rc<str>,
    pub line: u32,
}

/// Shared, driver-thread-only state of one script thread.
pub struct ThreadState {
    vm_id: u64,
    pub(crate) mailbox: RefCell<Option<ResumeMsg>>,
    pub(crate) yielded: RefCell<Vec<Value>>,
    pub(crate) parked: Cell<bool>,
    pub(crate) status: Cell<ThreadStatus>,
    pub(crate) frames: RefCell<Vec<FrameInfo>>,
    pub(crate) current_line: Cell<u32>,
    pub(crate) chunk: RefCell<Rc<str>>,
    pub(crate) self_co: RefCell<Weak<Coroutine>>,
}

impl ThreadState {
    pub(crate) fn new(
        vm_id: u64,
        chunk: Rc<str>,
    ) -> Self {
        Self {
            vm_id,
            mailbox: RefCell::new(None),
            yielded: RefCell::new(Vec::new()),
            parked: Cell::new(false),
            status: Cell::new(ThreadStatus::Suspended),
            frames: RefCell::new(Vec::new()),
            current_line: Cell::new(0),
            chunk: RefCell::new(chunk),
            self_co: RefCell::new(Weak::new()),
        }
    }

    pub fn vm_id(&self) -> u64 {
        self.vm_id
    }

    pub fn status(&self) -> ThreadStatus {
        self.status.get()
    }

    /// The chunk the thread is currently executing in.
    pub fn current_chunk(&self) -> Rc<str> {
        self.chunk.borrow().clone()
    }

    /// Render the live call stack, innermost frame first.
    pub fn traceback(&self) -> String {
        let mut out = String::new();
        let frames = self.frames.borrow();
        for frame in frames.iter().rev() {
            out.push_str(&format!(
                "function {} ({}:{})\n",
                frame.name, frame.chunk, frame.line
            ));
        }
        out.push_str(&format!(
            "chunk {}:{}",
            self.chunk.borrow(),
            self.current_line.get()
        ));
        out
    }
}

/// A script coroutine: shared state plus the suspended body future.
pub struct Coroutine {
    id: u64,
    pub state: Rc<ThreadState>,
    future: RefCell<Option<NativeFuture>>,
}

impl Coroutine {
    pub(crate) fn bare(
        id: u64,
        state: Rc<ThreadState>,
    ) -> Self {
        Self {
            id,
            state,
            future: RefCell::new(None),
        }
    }

    pub(crate) fn install(
        &self,
        future: NativeFuture,
    ) {
        *self.future.borrow_mut() = Some(future);
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> ThreadStatus {
        self.state.status.get()
    }

    /// Resume the thread with `msg`. Must only be called on the thread's
    /// owning driver thread.
    pub(crate) fn resume(
        &self,
        msg: ResumeMsg,
    ) -> Resume {
        match self.state.status.get() {
            ThreadStatus::Dead => {
                return Resume::Error(VmError::plain("cannot resume dead coroutine"))
            }
            ThreadStatus::Running => {
                return Resume::Error(VmError::plain("cannot resume running coroutine"))
            }
            ThreadStatus::Suspended => {}
        }
        let taken = self.future.borrow_mut().take();
        let Some(mut future) = taken else {
            return Resume::Error(VmError::plain("thread has no body"));
        };
        *self.state.mailbox.borrow_mut() = Some(msg);
        self.state.status.set(ThreadStatus::Running);
        let mut cx = Context::from_waker(Waker::noop());
        match future.as_mut().poll(&mut cx) {
            Poll::Pending => {
                *self.future.borrow_mut() = Some(future);
                self.state.status.set(ThreadStatus::Suspended);
                let values = std::mem::take(&mut *self.state.yielded.borrow_mut());
                Resume::Yield {
                    values,
                    parked: self.state.parked.get(),
                }
            }
            Poll::Ready(Ok(values)) => {
                self.state.status.set(ThreadStatus::Dead);
                Resume::Done(values)
            }
            Poll::Ready(Err(err)) => {
                self.state.status.set(ThreadStatus::Dead);
                Resume::Error(err)
            }
        }
    }
}

/// Future that consumes the next resume payload without yielding first.
/// Used at thread start-up: the initial resume places the arguments in the
/// mailbox before the body runs.
pub(crate) struct RecvResume {
    state: Rc<ThreadState>,
}

impl Future for RecvResume {
    type Output = Result<Vec<Value>, VmError>;

    fn poll(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        match self.state.mailbox.borrow_mut().take() {
            Some(ResumeMsg::Values(values)) => Poll::Ready(Ok(values)),
            Some(ResumeMsg::Error(message)) => Poll::Ready(Err(VmError::script(message))),
            None => Poll::Pending,
        }
    }
}

pub(crate) fn await_first_resume(state: &Rc<ThreadState>) -> RecvResume {
    RecvResume {
        state: state.clone(),
    }
}

/// Future that yields the given values out of the thread and resolves with
/// the payload of the next resume.
pub(crate) struct YieldNow {
    state: Rc<ThreadState>,
    outgoing: Option<(Vec<Value>, bool)>,
}

impl Future for YieldNow {
    type Output = Result<Vec<Value>, VmError>;

    fn poll(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some((values, parked)) = this.outgoing.take() {
            *this.state.yielded.borrow_mut() = values;
            this.state.parked.set(parked);
            return Poll::Pending;
        }
        match this.state.mailbox.borrow_mut().take() {
            Some(ResumeMsg::Values(values)) => Poll::Ready(Ok(values)),
            Some(ResumeMsg::Error(message)) => Poll::Ready(Err(VmError::script(message))),
            None => Poll::Pending,
        }
    }
}

pub(crate) fn yield_values(
    state: &Rc<ThreadState>,
    values: Vec<Value>,
    parked: bool,
) -> YieldNow {
    YieldNow {
        state: state.clone(),
        outgoing: Some((values, parked)),
    }
}
