//! The virtual machine.
//!
//! One contiguous value stack is carved into per-frame register windows:
//! pushing a frame reserves `register_count` slots at the top of the
//! stack, and every register operand indexes into the current frame's
//! window. The same stack doubles as the GC root set, which is why
//! transient objects are parked on it with [`Vm::push`] / [`Vm::pop`]
//! around operations that allocate.
//!
//! Runtime errors print a message and a frame-by-frame backtrace to
//! stderr, reset the stack, and leave the VM re-runnable.

use crate::chunk::{Chunk, OpCode};
use crate::error::{RuntimeError, TraceFrame};
use crate::heap::Heap;
use crate::object::{
    ArrayObj, BoundMethodObj, ClassObj, FunctionObj, InstanceObj, ObjKind, ObjRef, StringObj,
};
use crate::strings::{hash_bytes, StringTable};
use crate::value::Value;

const INITIAL_STACK_CAPACITY: usize = 256;
const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

/// Per-call record: the callee, its instruction pointer, its register
/// window base, and where the result goes in the caller's window.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CallFrame {
    pub(crate) function: ObjRef,
    ip: usize,
    base: usize,
    caller_base: Option<usize>,
    return_reg: u8,
}

/// A Quill virtual machine instance.
///
/// Owns its heap, stack, frames, globals, and string intern table
/// exclusively. The VM survives runtime errors and can execute further
/// functions afterwards.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,

    /// Global storage: parallel value / defined-bit arrays indexed by slot.
    pub(crate) globals: Vec<Value>,
    pub(crate) global_defined: Vec<bool>,

    pub(crate) strings: StringTable,

    /// Worklist of marked objects whose children are untraced.
    pub(crate) gray: Vec<ObjRef>,

    pub(crate) next_gc: usize,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self {
            heap: Heap::new(),
            stack: Vec::with_capacity(INITIAL_STACK_CAPACITY),
            frames: Vec::new(),
            globals: Vec::new(),
            global_defined: Vec::new(),
            strings: StringTable::new(),
            gray: Vec::new(),
            next_gc: INITIAL_GC_THRESHOLD,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable heap access, used by the compiler to emit into a function's
    /// chunk and to record its register requirements.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Collection threshold set after the last collection.
    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    // ------------------------------------------------------------------
    // Rooting.
    // ------------------------------------------------------------------

    /// Parks a value on the stack so the collector sees it as a root.
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Removes the most recently parked value.
    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("value stack underflow")
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
    }

    // ------------------------------------------------------------------
    // Object constructors. All allocation funnels through the heap so
    // every object lands on the sweep list and in the byte accountant.
    // ------------------------------------------------------------------

    /// Interns a string by content, copying it on first sight.
    pub fn intern(&mut self, text: &str) -> ObjRef {
        let hash = hash_bytes(text.as_bytes());
        if let Some(existing) = self.strings.find(&self.heap, text, hash) {
            return existing;
        }
        self.install_string(text.to_string(), hash)
    }

    /// Interns an already-built string buffer, dropping it when the
    /// content is already present.
    pub fn take_string(&mut self, chars: String) -> ObjRef {
        let hash = hash_bytes(chars.as_bytes());
        if let Some(existing) = self.strings.find(&self.heap, &chars, hash) {
            return existing;
        }
        self.install_string(chars, hash)
    }

    fn install_string(&mut self, chars: String, hash: u32) -> ObjRef {
        let string = self.heap.allocate(ObjKind::Str(StringObj { chars, hash }));
        // Keep the fresh string rooted while the table records it.
        self.push(Value::Obj(string));
        self.strings.define(string);
        self.pop();
        string
    }

    pub fn new_function(&mut self, name: Option<&str>, arity: u8) -> ObjRef {
        let name = name.map(|n| self.intern(n));
        self.heap.allocate(ObjKind::Function(FunctionObj {
            arity,
            register_count: 0,
            chunk: Chunk::new(),
            name,
        }))
    }

    pub fn new_array(&mut self) -> ObjRef {
        self.heap.allocate(ObjKind::Array(ArrayObj {
            elements: Vec::new(),
        }))
    }

    /// Builds an array owning a copy of `elements`.
    pub fn new_array_from(&mut self, elements: Vec<Value>) -> ObjRef {
        self.heap.allocate(ObjKind::Array(ArrayObj { elements }))
    }

    pub fn new_class(&mut self, name: ObjRef) -> ObjRef {
        self.heap.allocate(ObjKind::Class(ClassObj {
            name,
            methods: Vec::new(),
        }))
    }

    pub fn new_instance(&mut self, class: ObjRef) -> ObjRef {
        self.heap.allocate(ObjKind::Instance(InstanceObj {
            class,
            fields: Vec::new(),
        }))
    }

    pub fn new_bound_method(&mut self, receiver: Value, method: ObjRef) -> ObjRef {
        self.heap
            .allocate(ObjKind::BoundMethod(BoundMethodObj { receiver, method }))
    }

    // ------------------------------------------------------------------
    // Value inspection facade for the driver.
    // ------------------------------------------------------------------

    pub fn string_chars(&self, value: Value) -> Option<&str> {
        let r = self.heap.as_string(value)?;
        Some(&self.heap.string(r).chars)
    }

    pub fn is_function(&self, value: Value) -> bool {
        self.heap.as_function(value).is_some()
    }

    pub fn function_name(&self, value: Value) -> Option<&str> {
        let function = self.heap.as_function(value)?;
        let name = self.heap.function(function).name?;
        Some(&self.heap.string(name).chars)
    }

    /// Looks up an interned string by content without creating it.
    pub fn find_interned(&self, text: &str) -> Option<ObjRef> {
        self.strings.find(&self.heap, text, hash_bytes(text.as_bytes()))
    }

    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    // ------------------------------------------------------------------
    // Execution.
    // ------------------------------------------------------------------

    /// Executes a zero-arity function and returns its result.
    pub fn interpret(&mut self, function: ObjRef) -> Result<Value, RuntimeError> {
        let arity = match &self.heap.get(function).kind {
            ObjKind::Function(f) => f.arity,
            _ => return Err(self.runtime_error("Can only interpret function objects.")),
        };
        if arity != 0 {
            return Err(self.runtime_error("Can only directly interpret zero-arity functions."));
        }
        self.reset_stack();
        // The slot below the root frame's window roots the function itself.
        self.push(Value::Obj(function));
        self.call_function(None, function, 0, 0, &[])?;
        self.run()
    }

    fn frame(&self) -> &CallFrame {
        &self.frames[self.frames.len() - 1]
    }

    fn read_byte(&mut self) -> u8 {
        let index = self.frames.len() - 1;
        let frame = self.frames[index];
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        self.frames[index].ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let high = u16::from(self.read_byte());
        let low = u16::from(self.read_byte());
        (high << 8) | low
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_short();
        self.heap
            .function(self.frame().function)
            .chunk
            .constant(index)
    }

    fn reg(&self, register: u8) -> Value {
        self.stack[self.frame().base + register as usize]
    }

    fn set_reg(&mut self, register: u8, value: Value) {
        let base = self.frame().base;
        self.stack[base + register as usize] = value;
    }

    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.function(frame.function);
            let index = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(index).copied().unwrap_or(0);
            let name = match function.name {
                Some(name) => self.heap.string(name).chars.clone(),
                None => "<script>".to_string(),
            };
            trace.push(TraceFrame {
                function: name,
                line,
            });
        }
        let error = RuntimeError { message, trace };
        eprintln!("{}", error.render());
        self.reset_stack();
        error
    }

    /// Pushes a frame for `function`, copying argument values from the
    /// caller's window into the callee's registers 0..N-1 and
    /// null-initializing the rest.
    fn call_function(
        &mut self,
        caller_base: Option<usize>,
        function: ObjRef,
        dest: u8,
        arg_count: u8,
        arg_registers: &[u8],
    ) -> Result<(), RuntimeError> {
        let (arity, register_count) = {
            let f = self.heap.function(function);
            (f.arity, f.register_count)
        };
        if arity != arg_count {
            return Err(self.runtime_error("Incorrect number of arguments."));
        }
        if (register_count as usize) < arity as usize {
            return Err(self.runtime_error(
                "Function does not provide enough registers for its parameters.",
            ));
        }

        let base = self.stack.len();
        self.stack.resize(base + register_count as usize, Value::Null);
        if let Some(caller) = caller_base {
            for i in 0..arg_count as usize {
                self.stack[base + i] = self.stack[caller + arg_registers[i] as usize];
            }
        }

        self.frames.push(CallFrame {
            function,
            ip: 0,
            base,
            caller_base,
            return_reg: dest,
        });
        Ok(())
    }

    /// Dispatches a call on `callee`: plain function, bound method
    /// (receiver prepended), or class (instance constructed, constructor
    /// invoked when present).
    fn call_value(
        &mut self,
        caller_base: usize,
        dest: u8,
        callee: Value,
        arg_count: u8,
        arg_registers: &[u8],
    ) -> Result<(), RuntimeError> {
        if let Some(bound) = self.heap.as_bound_method(callee) {
            let (receiver, method) = {
                let b = self.heap.bound_method(bound);
                (b.receiver, b.method)
            };
            let arity = self.heap.function(method).arity;
            if u16::from(arg_count) + 1 != u16::from(arity) {
                return Err(self.runtime_error("Incorrect number of arguments."));
            }
            // The receiver travels through the caller's return register,
            // which becomes the callee's slot 0.
            let mut extended = [0u8; 256];
            extended[0] = dest;
            extended[1..=arg_count as usize].copy_from_slice(&arg_registers[..arg_count as usize]);
            self.stack[caller_base + dest as usize] = receiver;
            return self.call_function(
                Some(caller_base),
                method,
                dest,
                arg_count + 1,
                &extended[..arg_count as usize + 1],
            );
        }

        if let Some(class) = self.heap.as_class(callee) {
            let instance = self.new_instance(class);
            self.stack[caller_base + dest as usize] = Value::Obj(instance);

            let ctor_name = self.intern("constructor");
            if let Some(method_value) = self.heap.class_find_method(class, ctor_name) {
                let Some(method) = self.heap.as_function(method_value) else {
                    return Err(self.runtime_error("Constructor is not callable."));
                };
                let arity = self.heap.function(method).arity;
                if u16::from(arg_count) + 1 != u16::from(arity) {
                    return Err(self.runtime_error("Incorrect number of arguments."));
                }
                let mut extended = [0u8; 256];
                extended[0] = dest;
                extended[1..=arg_count as usize]
                    .copy_from_slice(&arg_registers[..arg_count as usize]);
                return self.call_function(
                    Some(caller_base),
                    method,
                    dest,
                    arg_count + 1,
                    &extended[..arg_count as usize + 1],
                );
            }
            if arg_count > 0 {
                return Err(self.runtime_error("Constructor not defined."));
            }
            return Ok(());
        }

        if let Some(function) = self.heap.as_function(callee) {
            return self.call_function(Some(caller_base), function, dest, arg_count, arg_registers);
        }

        Err(self.runtime_error("Attempted to call a non-function value."))
    }

    fn concatenate(&mut self, a: ObjRef, b: ObjRef) -> Value {
        let mut chars = String::with_capacity(
            self.heap.string(a).chars.len() + self.heap.string(b).chars.len(),
        );
        chars.push_str(&self.heap.string(a).chars);
        chars.push_str(&self.heap.string(b).chars);
        Value::Obj(self.take_string(chars))
    }

    fn number_operands(&mut self, a: Value, b: Value) -> Result<(f64, f64), RuntimeError> {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => Ok((x, y)),
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn run(&mut self) -> Result<Value, RuntimeError> {
        let mut arg_registers = [0u8; 256];
        loop {
            let instruction = self.read_byte();
            let Some(op) = OpCode::from_byte(instruction) else {
                return Err(self.runtime_error("Unknown opcode."));
            };
            match op {
                OpCode::LoadConst => {
                    let dest = self.read_byte();
                    let value = self.read_constant();
                    self.set_reg(dest, value);
                }
                OpCode::LoadNull => {
                    let dest = self.read_byte();
                    self.set_reg(dest, Value::Null);
                }
                OpCode::LoadTrue => {
                    let dest = self.read_byte();
                    self.set_reg(dest, Value::Bool(true));
                }
                OpCode::LoadFalse => {
                    let dest = self.read_byte();
                    self.set_reg(dest, Value::Bool(false));
                }
                OpCode::Move => {
                    let dest = self.read_byte();
                    let src = self.read_byte();
                    let value = self.reg(src);
                    self.set_reg(dest, value);
                }
                OpCode::Add => {
                    let dest = self.read_byte();
                    let left = self.read_byte();
                    let right = self.read_byte();
                    let a = self.reg(left);
                    let b = self.reg(right);

                    if let Some(array) = self.heap.as_array(a) {
                        // `+` on arrays is non-mutating: copy the left
                        // operand, then append or extend.
                        let elements = self.heap.array(array).elements.clone();
                        let result = self.new_array_from(elements);
                        let result_value = Value::Obj(result);
                        self.push(result_value);
                        if let Some(rhs) = self.heap.as_array(b) {
                            let rhs_elements = self.heap.array(rhs).elements.clone();
                            self.heap.array_extend(result, &rhs_elements);
                        } else {
                            self.heap.array_push(result, b);
                        }
                        self.set_reg(dest, result_value);
                        self.pop();
                    } else if self.heap.as_array(b).is_some() {
                        return Err(self.runtime_error(
                            "Left operand must be an array for array addition.",
                        ));
                    } else if let (Some(sa), Some(sb)) =
                        (self.heap.as_string(a), self.heap.as_string(b))
                    {
                        let value = self.concatenate(sa, sb);
                        self.set_reg(dest, value);
                    } else if let (Value::Number(x), Value::Number(y)) = (a, b) {
                        self.set_reg(dest, Value::Number(x + y));
                    } else {
                        return Err(self.runtime_error("Operands must be numbers or strings."));
                    }
                }
                OpCode::Subtract => {
                    let dest = self.read_byte();
                    let left = self.read_byte();
                    let right = self.read_byte();
                    let (a, b) = (self.reg(left), self.reg(right));
                    let (x, y) = self.number_operands(a, b)?;
                    self.set_reg(dest, Value::Number(x - y));
                }
                OpCode::Multiply => {
                    let dest = self.read_byte();
                    let left = self.read_byte();
                    let right = self.read_byte();
                    let (a, b) = (self.reg(left), self.reg(right));
                    let (x, y) = self.number_operands(a, b)?;
                    self.set_reg(dest, Value::Number(x * y));
                }
                OpCode::Divide => {
                    let dest = self.read_byte();
                    let left = self.read_byte();
                    let right = self.read_byte();
                    let (a, b) = (self.reg(left), self.reg(right));
                    let (x, y) = self.number_operands(a, b)?;
                    self.set_reg(dest, Value::Number(x / y));
                }
                OpCode::Negate => {
                    let dest = self.read_byte();
                    let src = self.read_byte();
                    let Value::Number(n) = self.reg(src) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.set_reg(dest, Value::Number(-n));
                }
                OpCode::Not => {
                    let dest = self.read_byte();
                    let src = self.read_byte();
                    let value = self.reg(src);
                    self.set_reg(dest, Value::Bool(!value.is_truthy()));
                }
                OpCode::Equal => {
                    let dest = self.read_byte();
                    let left = self.read_byte();
                    let right = self.read_byte();
                    let equal = self.heap.values_equal(self.reg(left), self.reg(right));
                    self.set_reg(dest, Value::Bool(equal));
                }
                OpCode::Greater => {
                    let dest = self.read_byte();
                    let left = self.read_byte();
                    let right = self.read_byte();
                    let (a, b) = (self.reg(left), self.reg(right));
                    let (x, y) = self.number_operands(a, b)?;
                    self.set_reg(dest, Value::Bool(x > y));
                }
                OpCode::Less => {
                    let dest = self.read_byte();
                    let left = self.read_byte();
                    let right = self.read_byte();
                    let (a, b) = (self.reg(left), self.reg(right));
                    let (x, y) = self.number_operands(a, b)?;
                    self.set_reg(dest, Value::Bool(x < y));
                }
                OpCode::Jump => {
                    let offset = self.read_short();
                    let index = self.frames.len() - 1;
                    self.frames[index].ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let condition = self.read_byte();
                    let offset = self.read_short();
                    if !self.reg(condition).is_truthy() {
                        let index = self.frames.len() - 1;
                        self.frames[index].ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    let index = self.frames.len() - 1;
                    self.frames[index].ip -= offset as usize;
                }
                OpCode::Call => {
                    let dest = self.read_byte();
                    let callee_reg = self.read_byte();
                    let arg_count = self.read_byte();
                    for i in 0..arg_count as usize {
                        arg_registers[i] = self.read_byte();
                    }
                    let callee = self.reg(callee_reg);
                    let caller_base = self.frame().base;
                    self.call_value(
                        caller_base,
                        dest,
                        callee,
                        arg_count,
                        &arg_registers[..arg_count as usize],
                    )?;
                }
                OpCode::Return => {
                    let src = self.read_byte();
                    let result = self.reg(src);
                    let finished = self
                        .frames
                        .pop()
                        .expect("return requires an active frame");
                    self.stack.truncate(finished.base);

                    if self.frames.is_empty() {
                        self.reset_stack();
                        return Ok(result);
                    }

                    if let Some(caller_base) = finished.caller_base {
                        self.stack[caller_base + finished.return_reg as usize] = result;
                    }
                    let caller = *self.frame();
                    let caller_registers =
                        self.heap.function(caller.function).register_count as usize;
                    self.stack.truncate(caller.base + caller_registers);
                }
                OpCode::GetGlobal => {
                    let dest = self.read_byte();
                    let slot = self.read_short() as usize;
                    if slot >= self.globals.len() || !self.global_defined[slot] {
                        return Err(self.runtime_error("Undefined global variable."));
                    }
                    let value = self.globals[slot];
                    self.set_reg(dest, value);
                }
                OpCode::DefineGlobal => {
                    let src = self.read_byte();
                    let slot = self.read_short() as usize;
                    if slot >= self.globals.len() {
                        self.globals.resize(slot + 1, Value::Null);
                        self.global_defined.resize(slot + 1, false);
                    }
                    self.globals[slot] = self.reg(src);
                    self.global_defined[slot] = true;
                }
                OpCode::SetGlobal => {
                    let src = self.read_byte();
                    let slot = self.read_short() as usize;
                    if slot >= self.globals.len() || !self.global_defined[slot] {
                        return Err(self.runtime_error("Undefined global variable."));
                    }
                    self.globals[slot] = self.reg(src);
                }
                OpCode::BuildArray => {
                    let dest = self.read_byte();
                    let element_count = self.read_byte();
                    let array = self.new_array();
                    let array_value = Value::Obj(array);
                    self.push(array_value);
                    for _ in 0..element_count {
                        let src = self.read_byte();
                        let value = self.reg(src);
                        self.heap.array_push(array, value);
                    }
                    self.set_reg(dest, array_value);
                    self.pop();
                }
                OpCode::ArrayGet => {
                    let dest = self.read_byte();
                    let array_reg = self.read_byte();
                    let index_reg = self.read_byte();
                    let array_value = self.reg(array_reg);
                    let index_value = self.reg(index_reg);
                    let Some(array) = self.heap.as_array(array_value) else {
                        return Err(self.runtime_error("Operand is not an array."));
                    };
                    let Value::Number(index) = index_value else {
                        return Err(self.runtime_error("Array index must be a number."));
                    };
                    if index < 0.0 || index > usize::MAX as f64 {
                        return Err(self.runtime_error("Array index out of bounds."));
                    }
                    if index.fract() != 0.0 {
                        return Err(self.runtime_error("Array index must be an integer."));
                    }
                    let index = index as usize;
                    let elements = &self.heap.array(array).elements;
                    if index >= elements.len() {
                        return Err(self.runtime_error("Array index out of range."));
                    }
                    let value = elements[index];
                    self.set_reg(dest, value);
                }
                OpCode::Class => {
                    let dest = self.read_byte();
                    let name_value = self.read_constant();
                    let Some(name) = self.heap.as_string(name_value) else {
                        return Err(self.runtime_error("Class name must be a string."));
                    };
                    let class = self.new_class(name);
                    self.set_reg(dest, Value::Obj(class));
                }
                OpCode::Method => {
                    let class_reg = self.read_byte();
                    let name_value = self.read_constant();
                    let method_reg = self.read_byte();
                    let class_value = self.reg(class_reg);
                    let Some(class) = self.heap.as_class(class_value) else {
                        return Err(self.runtime_error("Method target is not a class."));
                    };
                    let Some(name) = self.heap.as_string(name_value) else {
                        return Err(self.runtime_error("Method name must be a string."));
                    };
                    let method = self.reg(method_reg);
                    self.heap.class_define_method(class, name, method);
                }
                OpCode::GetProperty => {
                    let dest = self.read_byte();
                    let object_reg = self.read_byte();
                    let name_value = self.read_constant();
                    let object = self.reg(object_reg);
                    let Some(name) = self.heap.as_string(name_value) else {
                        return Err(self.runtime_error("Property name must be a string constant."));
                    };

                    if let Some(instance) = self.heap.as_instance(object) {
                        if let Some(field) = self.heap.instance_field(instance, name) {
                            self.set_reg(dest, field);
                        } else {
                            let class = self.heap.instance(instance).class;
                            let Some(method_value) = self.heap.class_find_method(class, name)
                            else {
                                return Err(
                                    self.runtime_error("Undefined property on instance.")
                                );
                            };
                            let Some(method) = self.heap.as_function(method_value) else {
                                return Err(self.runtime_error("Method value is not callable."));
                            };
                            let bound = self.new_bound_method(object, method);
                            self.set_reg(dest, Value::Obj(bound));
                        }
                    } else if let Some(class) = self.heap.as_class(object) {
                        // Class properties resolve to the raw method value;
                        // its arity still counts the implicit receiver.
                        let Some(method_value) = self.heap.class_find_method(class, name) else {
                            return Err(self.runtime_error("Undefined property on class."));
                        };
                        self.set_reg(dest, method_value);
                    } else {
                        return Err(
                            self.runtime_error("Only instances and classes have properties.")
                        );
                    }
                }
                OpCode::SetProperty => {
                    let object_reg = self.read_byte();
                    let name_value = self.read_constant();
                    let value_reg = self.read_byte();
                    let object = self.reg(object_reg);
                    let Some(name) = self.heap.as_string(name_value) else {
                        return Err(self.runtime_error("Property name must be a string constant."));
                    };
                    let Some(instance) = self.heap.as_instance(object) else {
                        return Err(self.runtime_error("Only instances have fields."));
                    };
                    let value = self.reg(value_reg);
                    self.heap.instance_set_field(instance, name, value);
                }
                OpCode::Invoke => {
                    let dest = self.read_byte();
                    let object_reg = self.read_byte();
                    let name_value = self.read_constant();
                    let arg_count = self.read_byte();
                    for i in 0..arg_count as usize {
                        arg_registers[i] = self.read_byte();
                    }
                    let receiver = self.reg(object_reg);
                    let Some(name) = self.heap.as_string(name_value) else {
                        return Err(self.runtime_error("Method name must be a string."));
                    };

                    let callee = if let Some(instance) = self.heap.as_instance(receiver) {
                        if let Some(field) = self.heap.instance_field(instance, name) {
                            field
                        } else {
                            let class = self.heap.instance(instance).class;
                            let Some(method_value) = self.heap.class_find_method(class, name)
                            else {
                                return Err(self.runtime_error("Undefined method on instance."));
                            };
                            let Some(method) = self.heap.as_function(method_value) else {
                                return Err(self.runtime_error("Method value is not callable."));
                            };
                            let bound = self.new_bound_method(receiver, method);
                            // Rooted through the destination register until
                            // the call overwrites it with the receiver.
                            let bound_value = Value::Obj(bound);
                            self.set_reg(dest, bound_value);
                            bound_value
                        }
                    } else if let Some(class) = self.heap.as_class(receiver) {
                        let Some(method_value) = self.heap.class_find_method(class, name) else {
                            return Err(self.runtime_error("Undefined method on class."));
                        };
                        method_value
                    } else {
                        return Err(self.runtime_error("Only instances and classes have methods."));
                    };

                    let caller_base = self.frame().base;
                    self.call_value(
                        caller_base,
                        dest,
                        callee,
                        arg_count,
                        &arg_registers[..arg_count as usize],
                    )?;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Chunk-assembly helpers shared by the VM tests.

    fn function(vm: &mut Vm, name: &str, arity: u8, register_count: u16) -> ObjRef {
        let f = vm.new_function(Some(name), arity);
        vm.heap_mut().function_mut(f).register_count = register_count;
        f
    }

    fn chunk(vm: &mut Vm, f: ObjRef) -> &mut Chunk {
        &mut vm.heap_mut().function_mut(f).chunk
    }

    fn load_const(vm: &mut Vm, f: ObjRef, dest: u8, value: Value) {
        let c = chunk(vm, f);
        let index = c.add_constant(value).expect("constant pool full");
        c.write_op(OpCode::LoadConst, 1);
        c.write(dest, 1);
        c.write((index >> 8) as u8, 1);
        c.write(index as u8, 1);
    }

    fn binary(vm: &mut Vm, f: ObjRef, op: OpCode, dest: u8, left: u8, right: u8) {
        let c = chunk(vm, f);
        c.write_op(op, 1);
        c.write(dest, 1);
        c.write(left, 1);
        c.write(right, 1);
    }

    fn ret(vm: &mut Vm, f: ObjRef, src: u8) {
        let c = chunk(vm, f);
        c.write_op(OpCode::Return, 1);
        c.write(src, 1);
    }

    fn string_value(vm: &mut Vm, text: &str) -> Value {
        Value::Obj(vm.intern(text))
    }

    #[test]
    fn arithmetic() {
        let cases: [(OpCode, f64); 4] = [
            (OpCode::Add, 3.0),
            (OpCode::Subtract, -1.0),
            (OpCode::Multiply, 2.0),
            (OpCode::Divide, 0.5),
        ];
        for (op, expected) in cases {
            let mut vm = Vm::new();
            let f = function(&mut vm, "main", 0, 2);
            load_const(&mut vm, f, 0, Value::Number(1.0));
            load_const(&mut vm, f, 1, Value::Number(2.0));
            binary(&mut vm, f, op, 0, 0, 1);
            ret(&mut vm, f, 0);
            assert_eq!(vm.interpret(f).unwrap(), Value::Number(expected));
        }
    }

    #[test]
    fn comparisons() {
        let mut vm = Vm::new();
        let f = function(&mut vm, "main", 0, 2);
        load_const(&mut vm, f, 0, Value::Number(5.0));
        load_const(&mut vm, f, 1, Value::Number(3.0));
        binary(&mut vm, f, OpCode::Greater, 0, 0, 1);
        ret(&mut vm, f, 0);
        assert_eq!(vm.interpret(f).unwrap(), Value::Bool(true));
    }

    #[test]
    fn equality_on_strings_uses_content() {
        let mut vm = Vm::new();
        let a = string_value(&mut vm, "abc");
        let b = string_value(&mut vm, "abc");
        let f = function(&mut vm, "main", 0, 2);
        load_const(&mut vm, f, 0, a);
        load_const(&mut vm, f, 1, b);
        binary(&mut vm, f, OpCode::Equal, 0, 0, 1);
        ret(&mut vm, f, 0);
        assert_eq!(vm.interpret(f).unwrap(), Value::Bool(true));
    }

    #[test]
    fn string_concatenation_interns_result() {
        let mut vm = Vm::new();
        let a = string_value(&mut vm, "foo");
        let b = string_value(&mut vm, "bar");
        let f = function(&mut vm, "main", 0, 2);
        load_const(&mut vm, f, 0, a);
        load_const(&mut vm, f, 1, b);
        binary(&mut vm, f, OpCode::Add, 0, 0, 1);
        ret(&mut vm, f, 0);
        let result = vm.interpret(f).unwrap();
        assert_eq!(vm.string_chars(result), Some("foobar"));
        assert_eq!(result.as_obj(), vm.find_interned("foobar"));
    }

    #[test]
    fn jump_if_false_skips() {
        let mut vm = Vm::new();
        let f = function(&mut vm, "main", 0, 2);
        load_const(&mut vm, f, 0, Value::Number(1.0));
        {
            let c = chunk(&mut vm, f);
            c.write_op(OpCode::LoadFalse, 1);
            c.write(1, 1);
            c.write_op(OpCode::JumpIfFalse, 1);
            c.write(1, 1);
            // Skip the 4-byte LoadConst that would overwrite register 0.
            c.write(0, 1);
            c.write(4, 1);
        }
        load_const(&mut vm, f, 0, Value::Number(99.0));
        ret(&mut vm, f, 0);
        assert_eq!(vm.interpret(f).unwrap(), Value::Number(1.0));
    }

    #[test]
    fn loop_counts_down() {
        // r0 = 3; while (r0 > 0) r0 = r0 - 1; return r0
        let mut vm = Vm::new();
        let f = function(&mut vm, "main", 0, 4);
        load_const(&mut vm, f, 0, Value::Number(3.0));
        load_const(&mut vm, f, 1, Value::Number(0.0));
        load_const(&mut vm, f, 2, Value::Number(1.0));
        let loop_start = chunk(&mut vm, f).len();
        binary(&mut vm, f, OpCode::Greater, 3, 0, 1);
        let exit_jump;
        {
            let c = chunk(&mut vm, f);
            c.write_op(OpCode::JumpIfFalse, 1);
            c.write(3, 1);
            c.write(0xFF, 1);
            c.write(0xFF, 1);
            exit_jump = c.len() - 2;
        }
        binary(&mut vm, f, OpCode::Subtract, 0, 0, 2);
        {
            let c = chunk(&mut vm, f);
            c.write_op(OpCode::Loop, 1);
            let offset = c.len() + 2 - loop_start;
            c.write((offset >> 8) as u8, 1);
            c.write(offset as u8, 1);
            let patched = c.len() - exit_jump - 2;
            c.code[exit_jump] = (patched >> 8) as u8;
            c.code[exit_jump + 1] = patched as u8;
        }
        ret(&mut vm, f, 0);
        assert_eq!(vm.interpret(f).unwrap(), Value::Number(0.0));
    }

    #[test]
    fn call_and_return() {
        let mut vm = Vm::new();

        // add(a, b) { return a + b; }
        let add = function(&mut vm, "add", 2, 3);
        binary(&mut vm, add, OpCode::Add, 2, 0, 1);
        ret(&mut vm, add, 2);

        let main = function(&mut vm, "main", 0, 3);
        load_const(&mut vm, main, 0, Value::Obj(add));
        load_const(&mut vm, main, 1, Value::Number(3.0));
        load_const(&mut vm, main, 2, Value::Number(4.0));
        {
            let c = chunk(&mut vm, main);
            c.write_op(OpCode::Call, 1);
            c.write(0, 1); // dest
            c.write(0, 1); // callee
            c.write(2, 1); // argc
            c.write(1, 1);
            c.write(2, 1);
        }
        ret(&mut vm, main, 0);
        assert_eq!(vm.interpret(main).unwrap(), Value::Number(7.0));
    }

    #[test]
    fn call_arity_mismatch_is_runtime_error() {
        let mut vm = Vm::new();
        let callee = function(&mut vm, "f", 2, 2);
        ret(&mut vm, callee, 0);

        let main = function(&mut vm, "main", 0, 1);
        load_const(&mut vm, main, 0, Value::Obj(callee));
        {
            let c = chunk(&mut vm, main);
            c.write_op(OpCode::Call, 1);
            c.write(0, 1);
            c.write(0, 1);
            c.write(0, 1);
        }
        ret(&mut vm, main, 0);
        let error = vm.interpret(main).unwrap_err();
        assert_eq!(error.message, "Incorrect number of arguments.");
    }

    #[test]
    fn call_of_non_callable_reports_backtrace() {
        let mut vm = Vm::new();
        let main = function(&mut vm, "main", 0, 1);
        load_const(&mut vm, main, 0, Value::Number(1.0));
        {
            let c = chunk(&mut vm, main);
            c.write_op(OpCode::Call, 1);
            c.write(0, 1);
            c.write(0, 1);
            c.write(0, 1);
        }
        ret(&mut vm, main, 0);
        let error = vm.interpret(main).unwrap_err();
        assert_eq!(error.message, "Attempted to call a non-function value.");
        assert_eq!(error.trace.len(), 1);
        assert_eq!(error.trace[0].function, "main");
    }

    #[test]
    fn vm_is_reusable_after_runtime_error() {
        let mut vm = Vm::new();
        let bad = function(&mut vm, "bad", 0, 2);
        load_const(&mut vm, bad, 0, Value::Null);
        load_const(&mut vm, bad, 1, Value::Number(1.0));
        binary(&mut vm, bad, OpCode::Subtract, 0, 0, 1);
        ret(&mut vm, bad, 0);
        assert!(vm.interpret(bad).is_err());

        let good = function(&mut vm, "good", 0, 1);
        load_const(&mut vm, good, 0, Value::Number(5.0));
        ret(&mut vm, good, 0);
        assert_eq!(vm.interpret(good).unwrap(), Value::Number(5.0));
    }

    #[test]
    fn globals_define_get_set() {
        let mut vm = Vm::new();
        let f = function(&mut vm, "main", 0, 2);
        load_const(&mut vm, f, 0, Value::Number(10.0));
        {
            let c = chunk(&mut vm, f);
            c.write_op(OpCode::DefineGlobal, 1);
            c.write(0, 1);
            c.write(0, 1);
            c.write(3, 1); // slot 3, leaving holes
            c.write_op(OpCode::GetGlobal, 1);
            c.write(1, 1);
            c.write(0, 1);
            c.write(3, 1);
        }
        ret(&mut vm, f, 1);
        assert_eq!(vm.interpret(f).unwrap(), Value::Number(10.0));
    }

    #[test]
    fn undefined_global_is_runtime_error() {
        let mut vm = Vm::new();
        let f = function(&mut vm, "main", 0, 1);
        {
            let c = chunk(&mut vm, f);
            c.write_op(OpCode::GetGlobal, 1);
            c.write(0, 1);
            c.write(0, 1);
            c.write(7, 1);
        }
        ret(&mut vm, f, 0);
        let error = vm.interpret(f).unwrap_err();
        assert_eq!(error.message, "Undefined global variable.");
    }

    #[test]
    fn build_array_and_index() {
        let mut vm = Vm::new();
        let f = function(&mut vm, "main", 0, 4);
        load_const(&mut vm, f, 0, Value::Number(7.0));
        load_const(&mut vm, f, 1, Value::Number(8.0));
        {
            let c = chunk(&mut vm, f);
            c.write_op(OpCode::BuildArray, 1);
            c.write(2, 1);
            c.write(2, 1);
            c.write(0, 1);
            c.write(1, 1);
        }
        load_const(&mut vm, f, 3, Value::Number(1.0));
        binary(&mut vm, f, OpCode::ArrayGet, 0, 2, 3);
        ret(&mut vm, f, 0);
        assert_eq!(vm.interpret(f).unwrap(), Value::Number(8.0));
    }

    #[test]
    fn array_index_errors() {
        let cases = [
            (Value::Number(5.0), "Array index out of range."),
            (Value::Number(0.5), "Array index must be an integer."),
            (Value::Number(-1.0), "Array index out of bounds."),
            (Value::Bool(true), "Array index must be a number."),
        ];
        for (index, message) in cases {
            let mut vm = Vm::new();
            let f = function(&mut vm, "main", 0, 3);
            load_const(&mut vm, f, 0, Value::Number(1.0));
            {
                let c = chunk(&mut vm, f);
                c.write_op(OpCode::BuildArray, 1);
                c.write(1, 1);
                c.write(1, 1);
                c.write(0, 1);
            }
            load_const(&mut vm, f, 2, index);
            binary(&mut vm, f, OpCode::ArrayGet, 0, 1, 2);
            ret(&mut vm, f, 0);
            assert_eq!(vm.interpret(f).unwrap_err().message, message);
        }
    }

    #[test]
    fn array_add_appends_and_concatenates() {
        // [1] + 2 appends; [1] + [2] concatenates; the left operand is
        // copied, never mutated.
        let mut vm = Vm::new();
        let f = function(&mut vm, "main", 0, 6);
        load_const(&mut vm, f, 0, Value::Number(1.0));
        {
            let c = chunk(&mut vm, f);
            c.write_op(OpCode::BuildArray, 1);
            c.write(1, 1);
            c.write(1, 1);
            c.write(0, 1);
        }
        load_const(&mut vm, f, 2, Value::Number(2.0));
        binary(&mut vm, f, OpCode::Add, 3, 1, 2); // [1, 2]
        binary(&mut vm, f, OpCode::Add, 4, 3, 1); // [1, 2] ++ [1]
        load_const(&mut vm, f, 5, Value::Number(2.0));
        binary(&mut vm, f, OpCode::ArrayGet, 0, 4, 5);
        ret(&mut vm, f, 0);
        assert_eq!(vm.interpret(f).unwrap(), Value::Number(1.0));
    }

    #[test]
    fn array_add_null_appends_element() {
        let mut vm = Vm::new();
        let f = function(&mut vm, "main", 0, 4);
        load_const(&mut vm, f, 0, Value::Number(1.0));
        {
            let c = chunk(&mut vm, f);
            c.write_op(OpCode::BuildArray, 1);
            c.write(1, 1);
            c.write(1, 1);
            c.write(0, 1);
        }
        load_const(&mut vm, f, 2, Value::Null);
        binary(&mut vm, f, OpCode::Add, 1, 1, 2);
        load_const(&mut vm, f, 3, Value::Number(1.0));
        binary(&mut vm, f, OpCode::ArrayGet, 0, 1, 3);
        ret(&mut vm, f, 0);
        assert_eq!(vm.interpret(f).unwrap(), Value::Null);
    }

    #[test]
    fn array_on_right_of_scalar_is_error() {
        let mut vm = Vm::new();
        let f = function(&mut vm, "main", 0, 3);
        load_const(&mut vm, f, 0, Value::Number(1.0));
        {
            let c = chunk(&mut vm, f);
            c.write_op(OpCode::BuildArray, 1);
            c.write(1, 1);
            c.write(0, 1);
        }
        binary(&mut vm, f, OpCode::Add, 2, 0, 1);
        ret(&mut vm, f, 2);
        assert_eq!(
            vm.interpret(f).unwrap_err().message,
            "Left operand must be an array for array addition."
        );
    }

    #[test]
    fn class_instance_fields_and_methods() {
        let mut vm = Vm::new();

        // get() { return this.x; }  (arity 1: receiver in slot 0)
        let get = function(&mut vm, "get", 1, 2);
        {
            let name = string_value(&mut vm, "x");
            let c = chunk(&mut vm, get);
            let index = c.add_constant(name).unwrap();
            c.write_op(OpCode::GetProperty, 1);
            c.write(1, 1);
            c.write(0, 1);
            c.write((index >> 8) as u8, 1);
            c.write(index as u8, 1);
        }
        ret(&mut vm, get, 1);

        let class_name = string_value(&mut vm, "Point");
        let get_name = string_value(&mut vm, "get");
        let x_name = string_value(&mut vm, "x");

        let main = function(&mut vm, "main", 0, 4);
        {
            let c = chunk(&mut vm, main);
            let class_k = c.add_constant(class_name).unwrap();
            c.write_op(OpCode::Class, 1);
            c.write(0, 1);
            c.write((class_k >> 8) as u8, 1);
            c.write(class_k as u8, 1);
        }
        load_const(&mut vm, main, 1, Value::Obj(get));
        {
            let c = chunk(&mut vm, main);
            let get_k = c.add_constant(get_name).unwrap();
            c.write_op(OpCode::Method, 1);
            c.write(0, 1);
            c.write((get_k >> 8) as u8, 1);
            c.write(get_k as u8, 1);
            c.write(1, 1);
            // p = Point()
            c.write_op(OpCode::Call, 1);
            c.write(2, 1);
            c.write(0, 1);
            c.write(0, 1);
        }
        load_const(&mut vm, main, 3, Value::Number(7.0));
        {
            let c = chunk(&mut vm, main);
            let x_k = c.add_constant(x_name).unwrap();
            // p.x = 7
            c.write_op(OpCode::SetProperty, 1);
            c.write(2, 1);
            c.write((x_k >> 8) as u8, 1);
            c.write(x_k as u8, 1);
            c.write(3, 1);
            // p.get()
            let invoke_k = c.add_constant(get_name).unwrap();
            c.write_op(OpCode::Invoke, 1);
            c.write(3, 1); // dest
            c.write(2, 1); // receiver
            c.write((invoke_k >> 8) as u8, 1);
            c.write(invoke_k as u8, 1);
            c.write(0, 1); // argc
        }
        ret(&mut vm, main, 3);
        assert_eq!(vm.interpret(main).unwrap(), Value::Number(7.0));
    }

    #[test]
    fn bound_method_carries_receiver() {
        let mut vm = Vm::new();

        // get() { return this.x; }
        let get = function(&mut vm, "get", 1, 2);
        {
            let name = string_value(&mut vm, "x");
            let c = chunk(&mut vm, get);
            let index = c.add_constant(name).unwrap();
            c.write_op(OpCode::GetProperty, 1);
            c.write(1, 1);
            c.write(0, 1);
            c.write((index >> 8) as u8, 1);
            c.write(index as u8, 1);
        }
        ret(&mut vm, get, 1);

        let class_name = string_value(&mut vm, "Point");
        let get_name = string_value(&mut vm, "get");
        let x_name = string_value(&mut vm, "x");

        let main = function(&mut vm, "main", 0, 4);
        {
            let c = chunk(&mut vm, main);
            let class_k = c.add_constant(class_name).unwrap();
            c.write_op(OpCode::Class, 1);
            c.write(0, 1);
            c.write((class_k >> 8) as u8, 1);
            c.write(class_k as u8, 1);
        }
        load_const(&mut vm, main, 1, Value::Obj(get));
        {
            let c = chunk(&mut vm, main);
            let get_k = c.add_constant(get_name).unwrap();
            c.write_op(OpCode::Method, 1);
            c.write(0, 1);
            c.write((get_k >> 8) as u8, 1);
            c.write(get_k as u8, 1);
            c.write(1, 1);
            c.write_op(OpCode::Call, 1);
            c.write(2, 1);
            c.write(0, 1);
            c.write(0, 1);
        }
        load_const(&mut vm, main, 3, Value::Number(42.0));
        {
            let c = chunk(&mut vm, main);
            let x_k = c.add_constant(x_name).unwrap();
            c.write_op(OpCode::SetProperty, 1);
            c.write(2, 1);
            c.write((x_k >> 8) as u8, 1);
            c.write(x_k as u8, 1);
            c.write(3, 1);
        }
        {
            let c = chunk(&mut vm, main);
            let get_k = c.add_constant(get_name).unwrap();
            // m = p.get  (a bound method), then m()
            c.write_op(OpCode::GetProperty, 1);
            c.write(1, 1);
            c.write(2, 1);
            c.write((get_k >> 8) as u8, 1);
            c.write(get_k as u8, 1);
            c.write_op(OpCode::Call, 1);
            c.write(3, 1);
            c.write(1, 1);
            c.write(0, 1);
        }
        ret(&mut vm, main, 3);
        assert_eq!(vm.interpret(main).unwrap(), Value::Number(42.0));
    }

    #[test]
    fn interpret_rejects_nonzero_arity() {
        let mut vm = Vm::new();
        let f = function(&mut vm, "f", 1, 1);
        ret(&mut vm, f, 0);
        let error = vm.interpret(f).unwrap_err();
        assert_eq!(
            error.message,
            "Can only directly interpret zero-arity functions."
        );
    }

    #[test]
    fn unknown_opcode_is_runtime_error() {
        let mut vm = Vm::new();
        let f = function(&mut vm, "main", 0, 1);
        chunk(&mut vm, f).write(0xEE, 1);
        let error = vm.interpret(f).unwrap_err();
        assert_eq!(error.message, "Unknown opcode.");
    }
}
