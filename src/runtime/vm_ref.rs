//! Registry-anchored references to VM values.
//!
//! A `Ref` is the only way host code may hold a VM value across a
//! suspension or hand it to another thread. The value stays anchored in the
//! owning VM's registry, so the VM cannot reclaim it while the host holds
//! the `Ref`. Dropping the last clone releases the slot through a
//! continuation posted to the owning runtime, because drops can happen on
//! worker threads where the VM must not be touched.

use std::rc::Rc;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::vm::{Value, Vm, VmError};

use super::RuntimeHandle;

/// A stable, cloneable, `Send` handle to a value owned by one VM.
#[derive(Clone)]
pub struct Ref {
    inner: Arc<RefInner>,
}

struct RefInner {
    vm_id: u64,
    slot: usize,
    owner: RuntimeHandle,
}

impl Ref {
    /// Anchor `value` in `vm`'s registry. Fails once the owning runtime has
    /// begun teardown.
    pub fn capture(
        vm: &Rc<Vm>,
        value: Value,
    ) -> Result<Ref, VmError> {
        let owner = vm
            .runtime_handle()
            .ok_or_else(|| VmError::plain("runtime has shut down"))?;
        let slot = vm.anchor(value);
        Ok(Ref {
            inner: Arc::new(RefInner {
                vm_id: vm.id(),
                slot,
                owner,
            }),
        })
    }

    /// The anchored value. Deterministically fails when dereferenced on a
    /// VM other than the capturing one.
    pub fn value(
        &self,
        vm: &Vm,
    ) -> Result<Value, RuntimeError> {
        if vm.id() != self.inner.vm_id {
            return Err(RuntimeError::WrongVm);
        }
        vm.anchored(self.inner.slot)
            .ok_or(RuntimeError::ReleasedRef)
    }

    pub fn vm_id(&self) -> u64 {
        self.inner.vm_id
    }

    pub fn slot(&self) -> usize {
        self.inner.slot
    }
}

impl Drop for RefInner {
    fn drop(&mut self) {
        // Never release directly: this drop may run on a worker thread.
        let slot = self.slot;
        self.owner.schedule(move |rt| rt.vm().release(slot));
    }
}
