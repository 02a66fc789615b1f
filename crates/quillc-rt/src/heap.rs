//! The object heap.
//!
//! A slot arena with a free list. Allocation is non-moving: an [`ObjRef`]
//! stays valid until the sweep phase frees the object. Every allocation is
//! chained into the intrusive live-object list the collector sweeps, and
//! its size - header plus auxiliary buffers (string bytes, array storage,
//! property tables) - is added to the byte accountant.
//!
//! Growth of the auxiliary buffers goes through the helpers here so the
//! accountant always sees the real capacity deltas; freeing subtracts the
//! same capacities, which keeps repeated collections byte-exact.

use std::mem;

use crate::object::{
    ArrayObj, BoundMethodObj, ClassObj, FunctionObj, InstanceObj, Obj, ObjKind, ObjRef, Property,
    StringObj,
};
use crate::value::Value;

/// Initial capacity for arrays and property tables; doubles on demand.
const INITIAL_ELEMENT_CAPACITY: usize = 8;

#[derive(Debug, Default)]
pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<u32>,

    /// Head of the intrusive list threading every live object.
    head: Option<ObjRef>,

    bytes_allocated: usize,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total accounted bytes of every live object and its buffers.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects on the sweep list.
    pub fn object_count(&self) -> usize {
        let mut count = 0;
        let mut current = self.head;
        while let Some(r) = current {
            count += 1;
            current = self.get(r).next;
        }
        count
    }

    pub(crate) fn head(&self) -> Option<ObjRef> {
        self.head
    }

    pub(crate) fn set_head(&mut self, head: Option<ObjRef>) {
        self.head = head;
    }

    /// Allocates an object, chaining it into the live list and charging
    /// the accountant for the header and any auxiliary buffers.
    pub(crate) fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        let mut obj = Obj::new(kind);
        obj.next = self.head;

        let bytes = mem::size_of::<Obj>() + aux_bytes(&obj.kind);
        self.bytes_allocated += bytes;

        let r = match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(obj);
                ObjRef(index)
            }
            None => {
                self.slots.push(Some(obj));
                ObjRef((self.slots.len() - 1) as u32)
            }
        };
        self.head = Some(r);
        log::trace!("heap: allocated {:?}, {} bytes live", r, self.bytes_allocated);
        r
    }

    /// Releases an object's slot. Only the sweep phase calls this; the
    /// caller has already unlinked the object from the live list.
    pub(crate) fn release(&mut self, r: ObjRef) {
        let obj = self.slots[r.0 as usize]
            .take()
            .expect("released object must be live");
        let bytes = mem::size_of::<Obj>() + aux_bytes(&obj.kind);
        self.bytes_allocated -= bytes;
        self.free.push(r.0);
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slots[r.0 as usize]
            .as_ref()
            .expect("object reference must be live")
    }

    pub(crate) fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.0 as usize]
            .as_mut()
            .expect("object reference must be live")
    }

    pub(crate) fn is_marked(&self, r: ObjRef) -> bool {
        self.get(r).marked
    }

    // ------------------------------------------------------------------
    // Typed accessors. These panic on a kind mismatch: the VM verifies
    // kinds before downcasting, so a mismatch is an emitter bug.
    // ------------------------------------------------------------------

    pub fn string(&self, r: ObjRef) -> &StringObj {
        match &self.get(r).kind {
            ObjKind::Str(s) => s,
            other => panic!("expected string object, found {other:?}"),
        }
    }

    pub fn function(&self, r: ObjRef) -> &FunctionObj {
        match &self.get(r).kind {
            ObjKind::Function(f) => f,
            other => panic!("expected function object, found {other:?}"),
        }
    }

    pub fn function_mut(&mut self, r: ObjRef) -> &mut FunctionObj {
        match &mut self.get_mut(r).kind {
            ObjKind::Function(f) => f,
            other => panic!("expected function object, found {other:?}"),
        }
    }

    pub fn array(&self, r: ObjRef) -> &ArrayObj {
        match &self.get(r).kind {
            ObjKind::Array(a) => a,
            other => panic!("expected array object, found {other:?}"),
        }
    }

    pub fn class(&self, r: ObjRef) -> &ClassObj {
        match &self.get(r).kind {
            ObjKind::Class(c) => c,
            other => panic!("expected class object, found {other:?}"),
        }
    }

    pub fn instance(&self, r: ObjRef) -> &InstanceObj {
        match &self.get(r).kind {
            ObjKind::Instance(i) => i,
            other => panic!("expected instance object, found {other:?}"),
        }
    }

    pub fn bound_method(&self, r: ObjRef) -> &BoundMethodObj {
        match &self.get(r).kind {
            ObjKind::BoundMethod(b) => b,
            other => panic!("expected bound method object, found {other:?}"),
        }
    }

    // ------------------------------------------------------------------
    // Value downcasts.
    // ------------------------------------------------------------------

    pub fn as_string(&self, value: Value) -> Option<ObjRef> {
        self.as_kind(value, |kind| matches!(kind, ObjKind::Str(_)))
    }

    pub fn as_function(&self, value: Value) -> Option<ObjRef> {
        self.as_kind(value, |kind| matches!(kind, ObjKind::Function(_)))
    }

    pub fn as_array(&self, value: Value) -> Option<ObjRef> {
        self.as_kind(value, |kind| matches!(kind, ObjKind::Array(_)))
    }

    pub fn as_class(&self, value: Value) -> Option<ObjRef> {
        self.as_kind(value, |kind| matches!(kind, ObjKind::Class(_)))
    }

    pub fn as_instance(&self, value: Value) -> Option<ObjRef> {
        self.as_kind(value, |kind| matches!(kind, ObjKind::Instance(_)))
    }

    pub fn as_bound_method(&self, value: Value) -> Option<ObjRef> {
        self.as_kind(value, |kind| matches!(kind, ObjKind::BoundMethod(_)))
    }

    fn as_kind(&self, value: Value, pred: fn(&ObjKind) -> bool) -> Option<ObjRef> {
        match value {
            Value::Obj(r) if pred(&self.get(r).kind) => Some(r),
            _ => None,
        }
    }

    /// Structural equality: scalars by value, strings by byte content,
    /// every other object by identity.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => {
                if let (ObjKind::Str(sx), ObjKind::Str(sy)) = (&self.get(x).kind, &self.get(y).kind)
                {
                    x == y || sx.chars == sy.chars
                } else {
                    x == y
                }
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Accounted mutation of auxiliary buffers.
    // ------------------------------------------------------------------

    /// Appends to an array, doubling capacity on demand from an initial 8.
    pub(crate) fn array_push(&mut self, r: ObjRef, value: Value) {
        let delta;
        {
            let array = match &mut self.get_mut(r).kind {
                ObjKind::Array(a) => a,
                other => panic!("expected array object, found {other:?}"),
            };
            let before = array.elements.capacity();
            reserve_doubling(&mut array.elements, 1);
            array.elements.push(value);
            delta = (array.elements.capacity() - before) * mem::size_of::<Value>();
        }
        self.bytes_allocated += delta;
    }

    /// Appends a run of values to an array.
    pub(crate) fn array_extend(&mut self, r: ObjRef, values: &[Value]) {
        let delta;
        {
            let array = match &mut self.get_mut(r).kind {
                ObjKind::Array(a) => a,
                other => panic!("expected array object, found {other:?}"),
            };
            let before = array.elements.capacity();
            reserve_doubling(&mut array.elements, values.len());
            array.elements.extend_from_slice(values);
            delta = (array.elements.capacity() - before) * mem::size_of::<Value>();
        }
        self.bytes_allocated += delta;
    }

    /// Installs a method on a class. Duplicates are appended; lookup takes
    /// the first match.
    pub(crate) fn class_define_method(&mut self, class: ObjRef, name: ObjRef, value: Value) {
        let delta;
        {
            let class = match &mut self.get_mut(class).kind {
                ObjKind::Class(c) => c,
                other => panic!("expected class object, found {other:?}"),
            };
            let before = class.methods.capacity();
            reserve_doubling(&mut class.methods, 1);
            class.methods.push(Property { name, value });
            delta = (class.methods.capacity() - before) * mem::size_of::<Property>();
        }
        self.bytes_allocated += delta;
    }

    /// Linear method lookup by name identity; first match wins.
    pub fn class_find_method(&self, class: ObjRef, name: ObjRef) -> Option<Value> {
        self.class(class)
            .methods
            .iter()
            .find(|m| m.name == name)
            .map(|m| m.value)
    }

    /// Reads an instance field by name identity.
    pub fn instance_field(&self, instance: ObjRef, name: ObjRef) -> Option<Value> {
        self.instance(instance)
            .fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value)
    }

    /// Writes an instance field, updating in place or appending.
    pub(crate) fn instance_set_field(&mut self, instance: ObjRef, name: ObjRef, value: Value) {
        let delta;
        {
            let instance = match &mut self.get_mut(instance).kind {
                ObjKind::Instance(i) => i,
                other => panic!("expected instance object, found {other:?}"),
            };
            if let Some(field) = instance.fields.iter_mut().find(|f| f.name == name) {
                field.value = value;
                return;
            }
            let before = instance.fields.capacity();
            reserve_doubling(&mut instance.fields, 1);
            instance.fields.push(Property { name, value });
            delta = (instance.fields.capacity() - before) * mem::size_of::<Property>();
        }
        self.bytes_allocated += delta;
    }
}

/// Accounted size of an object's auxiliary buffers.
fn aux_bytes(kind: &ObjKind) -> usize {
    match kind {
        ObjKind::Str(s) => s.chars.capacity() + 1,
        ObjKind::Array(a) => a.elements.capacity() * mem::size_of::<Value>(),
        ObjKind::Class(c) => c.methods.capacity() * mem::size_of::<Property>(),
        ObjKind::Instance(i) => i.fields.capacity() * mem::size_of::<Property>(),
        ObjKind::Function(_) | ObjKind::BoundMethod(_) => 0,
    }
}

/// Grows a vector to hold `additional` more items, doubling from an
/// initial capacity of 8.
fn reserve_doubling<T>(vec: &mut Vec<T>, additional: usize) {
    let required = vec.len() + additional;
    if required <= vec.capacity() {
        return;
    }
    let mut new_capacity = vec.capacity().max(INITIAL_ELEMENT_CAPACITY);
    while new_capacity < required {
        new_capacity *= 2;
    }
    vec.reserve_exact(new_capacity - vec.len());
}
