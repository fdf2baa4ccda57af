//! Scoped GC-root acquisition for native code
//!
//! Native functions often build heap values in several steps; any
//! allocation in between can trigger a collection, and a value held only
//! in a native local would be swept. A [`ManagedContext`] registers every
//! value it creates (or is asked to keep) as a temporary root and removes
//! exactly one registration per value when it is dropped.

use crate::vm::machine::Vm;
use sable_core::gc::CPointerDestructor;
use sable_core::Value;

/// Scoped temporary-root holder
///
/// ```no_run
/// # use sable_engine::{ManagedContext, Vm};
/// # fn build(vm: &mut Vm) {
/// let mut ctx = ManagedContext::new(vm);
/// let name = ctx.create_string("sable");
/// let entry = ctx.create_object(2);
/// // both survive any collection triggered by later allocations
/// # }
/// ```
pub struct ManagedContext<'a> {
    vm: &'a mut Vm,
    registered: Vec<Value>,
}

impl<'a> ManagedContext<'a> {
    pub fn new(vm: &'a mut Vm) -> Self {
        Self {
            vm,
            registered: Vec::new(),
        }
    }

    /// Access the underlying machine
    pub fn vm(&mut self) -> &mut Vm {
        self.vm
    }

    /// Root an externally produced value for the scope of this context
    pub fn keep(&mut self, value: Value) -> Value {
        self.vm.heap_mut().register_temporary(value);
        self.registered.push(value);
        value
    }

    pub fn create_string(&mut self, value: &str) -> Value {
        let created = self.vm.create_string(value);
        self.keep(created)
    }

    pub fn create_float(&mut self, value: f64) -> Value {
        let created = self.vm.create_float(value);
        self.keep(created)
    }

    pub fn create_integer(&mut self, value: i64) -> Value {
        let created = self.vm.create_integer(value);
        self.keep(created)
    }

    pub fn create_array(&mut self, values: Vec<Value>) -> Value {
        let created = self.vm.create_array(values);
        self.keep(created)
    }

    pub fn create_object(&mut self, capacity: usize) -> Value {
        let created = self.vm.create_object(Value::null(), capacity);
        self.keep(created)
    }

    pub fn create_cpointer(
        &mut self,
        data: *mut (),
        destructor: Option<CPointerDestructor>,
    ) -> Value {
        let created = self.vm.create_cpointer(data, destructor);
        self.keep(created)
    }
}

impl Drop for ManagedContext<'_> {
    fn drop(&mut self) {
        for value in self.registered.drain(..) {
            self.vm.heap_mut().unregister_temporary(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::context::{RunFlags, VmContext};
    use crate::vm::machine::cell_ref;
    use sable_core::CompilerArtifacts;
    use std::sync::Arc;

    fn test_vm() -> Vm {
        let artifacts = Arc::new(CompilerArtifacts::new());
        let flags = RunFlags {
            single_worker: true,
            ..RunFlags::default()
        };
        Vm::new(VmContext::new(artifacts, flags))
    }

    #[test]
    fn test_values_survive_collection_inside_scope() {
        let mut vm = test_vm();
        let value = {
            let mut ctx = ManagedContext::new(&mut vm);
            let s = ctx.create_string("survivor");
            ctx.vm().collect();
            s
        };
        // After the scope ends the value is unprotected, but the previous
        // collection must not have touched it
        let cell = unsafe { cell_ref(value) };
        assert_eq!(cell.as_string().unwrap().as_str(), "survivor");
    }

    #[test]
    fn test_values_collectable_after_scope() {
        let mut vm = test_vm();
        {
            let mut ctx = ManagedContext::new(&mut vm);
            ctx.create_string("gone");
        }
        let live_before = vm.heap().live_count();
        vm.collect();
        assert!(vm.heap().live_count() < live_before);
    }

    #[test]
    fn test_keep_is_multiset() {
        let mut vm = test_vm();
        let value = vm.create_string("shared");
        vm.heap_mut().register_temporary(value);
        {
            let mut ctx = ManagedContext::new(&mut vm);
            ctx.keep(value);
        }
        // The outer registration still protects the value
        vm.collect();
        let cell = unsafe { cell_ref(value) };
        assert_eq!(cell.as_string().unwrap().as_str(), "shared");
        vm.heap_mut().unregister_temporary(value);
    }
}
