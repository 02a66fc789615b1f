//! Mark-and-sweep garbage collection.
//!
//! Non-moving, non-generational, stop-the-world. A cycle runs four
//! phases: mark the roots (every stack slot, every live frame's function,
//! every defined global), trace the gray worklist to fixpoint, purge
//! unmarked entries from the weak string intern table, then sweep the
//! intrusive live-object list and free everything unmarked.
//!
//! Collections happen only at explicit GC points - allocation never
//! triggers one inline - so callers root transient values on the VM stack
//! with [`Vm::push`] / [`Vm::pop`] across allocating operations.

use crate::object::{ObjKind, ObjRef};
use crate::value::Value;
use crate::vm::Vm;

/// Floor for the post-collection threshold.
const MIN_GC_THRESHOLD: usize = 1024;

impl Vm {
    /// Runs a full collection cycle.
    pub fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated();

        self.mark_roots();
        self.trace_references();
        self.strings.remove_white(&self.heap);
        let freed = self.sweep();

        let after = self.heap.bytes_allocated();
        self.next_gc = (after * 2).max(MIN_GC_THRESHOLD);
        log::debug!(
            "gc: {} -> {} bytes ({} objects freed), next collection at {}",
            before,
            after,
            freed,
            self.next_gc
        );
    }

    fn mark_roots(&mut self) {
        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.mark_value(value);
        }
        for i in 0..self.frames.len() {
            let function = self.frames[i].function;
            self.mark_object(function);
        }
        for slot in 0..self.globals.len() {
            if self.global_defined[slot] {
                let value = self.globals[slot];
                self.mark_value(value);
            }
        }
        log::trace!("gc: {} gray roots", self.gray.len());
    }

    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(r) = value {
            self.mark_object(r);
        }
    }

    /// Sets the mark bit and queues the object for tracing.
    fn mark_object(&mut self, r: ObjRef) {
        let obj = self.heap.get_mut(r);
        if obj.marked {
            return;
        }
        obj.marked = true;
        self.gray.push(r);
    }

    /// Drains the gray worklist, blackening one object at a time. The
    /// worklist may grow while it drains.
    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            self.blacken_object(r);
        }
    }

    /// Marks everything the object refers to.
    fn blacken_object(&mut self, r: ObjRef) {
        let mut children: Vec<Value> = Vec::new();
        match &self.heap.get(r).kind {
            ObjKind::Str(_) => {}
            ObjKind::Function(function) => {
                if let Some(name) = function.name {
                    children.push(Value::Obj(name));
                }
                children.extend_from_slice(&function.chunk.constants);
            }
            ObjKind::Array(array) => children.extend_from_slice(&array.elements),
            ObjKind::Class(class) => {
                children.push(Value::Obj(class.name));
                for method in &class.methods {
                    children.push(Value::Obj(method.name));
                    children.push(method.value);
                }
            }
            ObjKind::Instance(instance) => {
                children.push(Value::Obj(instance.class));
                for field in &instance.fields {
                    children.push(Value::Obj(field.name));
                    children.push(field.value);
                }
            }
            ObjKind::BoundMethod(bound) => {
                children.push(bound.receiver);
                children.push(Value::Obj(bound.method));
            }
        }
        for child in children {
            self.mark_value(child);
        }
    }

    /// Walks the live list: unmarked objects are unlinked and freed,
    /// marked objects survive with their mark bit cleared. Returns the
    /// number of objects freed.
    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        let mut previous: Option<ObjRef> = None;
        let mut current = self.heap.head();
        while let Some(r) = current {
            let (marked, next) = {
                let obj = self.heap.get(r);
                (obj.marked, obj.next)
            };
            if marked {
                self.heap.get_mut(r).marked = false;
                previous = Some(r);
            } else {
                match previous {
                    Some(p) => self.heap.get_mut(p).next = next,
                    None => self.heap.set_head(next),
                }
                self.heap.release(r);
                freed += 1;
            }
            current = next;
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collect_on_empty_vm_is_a_noop() {
        let mut vm = Vm::new();
        vm.collect_garbage();
        assert_eq!(vm.heap().bytes_allocated(), 0);
        assert_eq!(vm.heap().object_count(), 0);
    }

    #[test]
    fn rooted_string_survives_ephemeral_string_is_reaped() {
        let mut vm = Vm::new();

        let rooted = vm.intern("rooted");
        vm.push(Value::Obj(rooted));
        let baseline = vm.heap().bytes_allocated();

        let ephemeral = vm.intern("ephemeral");
        assert!(vm.find_interned("ephemeral").is_some());
        assert!(vm.heap().bytes_allocated() > baseline);
        let _ = ephemeral;

        vm.collect_garbage();

        // The weak table forgot the ephemeral string and the accountant
        // got its bytes back; the rooted string is untouched.
        assert!(vm.find_interned("ephemeral").is_none());
        assert_eq!(vm.find_interned("rooted"), Some(rooted));
        assert_eq!(vm.heap().bytes_allocated(), baseline);
        assert_eq!(vm.interned_count(), 1);
    }

    #[test]
    fn collection_is_idempotent_without_new_allocations() {
        let mut vm = Vm::new();
        let keep = vm.intern("keep");
        vm.push(Value::Obj(keep));

        vm.collect_garbage();
        let after_first = vm.heap().bytes_allocated();
        vm.collect_garbage();
        assert_eq!(vm.heap().bytes_allocated(), after_first);
        assert_eq!(vm.heap().object_count(), 1);
    }

    #[test]
    fn objects_reachable_through_containers_survive() {
        let mut vm = Vm::new();
        let element = vm.intern("element");
        let array = vm.new_array();
        vm.heap_mut().array_push(array, Value::Obj(element));
        vm.push(Value::Obj(array));

        vm.collect_garbage();

        // The string is reachable only through the array.
        assert_eq!(vm.find_interned("element"), Some(element));
        assert_eq!(vm.heap().object_count(), 2);

        vm.pop();
        vm.collect_garbage();
        assert_eq!(vm.heap().object_count(), 0);
        assert_eq!(vm.heap().bytes_allocated(), 0);
    }

    #[test]
    fn defined_globals_are_roots() {
        let mut vm = Vm::new();
        let kept = vm.intern("kept-global");
        vm.globals.push(Value::Obj(kept));
        vm.global_defined.push(true);

        vm.collect_garbage();
        assert_eq!(vm.find_interned("kept-global"), Some(kept));
    }

    #[test]
    fn cyclic_class_structures_collect_cleanly() {
        let mut vm = Vm::new();
        let name = vm.intern("Cycle");
        let class = vm.new_class(name);
        vm.push(Value::Obj(class));
        let instance = vm.new_instance(class);
        // The instance refers to itself through one of its fields.
        let field = vm.intern("self");
        vm.heap_mut()
            .instance_set_field(instance, field, Value::Obj(instance));
        vm.push(Value::Obj(instance));

        vm.collect_garbage();
        assert!(vm.heap().object_count() >= 4);

        vm.pop();
        vm.pop();
        vm.collect_garbage();
        assert_eq!(vm.heap().object_count(), 0);
        assert_eq!(vm.heap().bytes_allocated(), 0);
    }

    #[test]
    fn threshold_doubles_live_bytes_with_floor() {
        let mut vm = Vm::new();
        vm.collect_garbage();
        assert_eq!(vm.next_gc(), 1024);

        let keep = vm.intern(&"x".repeat(4096));
        vm.push(Value::Obj(keep));
        vm.collect_garbage();
        assert_eq!(vm.next_gc(), vm.heap().bytes_allocated() * 2);
    }
}
