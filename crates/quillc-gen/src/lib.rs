//! quillc-gen - Single-pass bytecode compiler for the Quill language.
//!
//! Walks the AST once, emitting register bytecode into an `ObjFunction`
//! owned by the VM. There is no intermediate representation: names resolve
//! to registers (locals) or ordered global slots, control flow lowers to
//! conditional and unconditional jumps with back-patching, and nested
//! functions, methods, and constructors become their own function objects
//! embedded as constants.
//!
//! # Example
//!
//! ```
//! use quillc_rt::{Value, Vm};
//!
//! let mut vm = Vm::new();
//! let result = quillc_gen::run_source(&mut vm, "let x = 41; let y = 1; x + y;").unwrap();
//! assert_eq!(result, Value::Number(42.0));
//! ```

pub mod error;

mod compiler;
mod emit;
mod expr;
mod scope;


use thiserror::Error;

use quillc_par::ast::Program;
use quillc_par::ParseError;
use quillc_rt::{ObjRef, RuntimeError, Value, Vm};

pub use error::CompileError;

use compiler::Compiler;

/// Any failure of the parse + compile + execute pipeline.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("Runtime error during execution.")]
    Runtime(#[from] RuntimeError),
}

/// Compiles a program into a zero-arity "script" function owned by `vm`.
///
/// The returned function is unrooted: callers that allocate before
/// executing it must park it on the VM stack with [`Vm::push`].
pub fn compile(vm: &mut Vm, program: &Program) -> Result<ObjRef, CompileError> {
    Compiler::new(vm).compile_program(program)
}

/// Compiles and immediately executes a program.
pub fn run_program(vm: &mut Vm, program: &Program) -> Result<Value, ScriptError> {
    let function = compile(vm, program)?;
    let value = vm.interpret(function)?;
    Ok(value)
}

/// Parses, compiles, and executes a source string; the result is the value
/// of the trailing top-level expression, or null if there is none.
pub fn run_source(vm: &mut Vm, source: &str) -> Result<Value, ScriptError> {
    let program = quillc_par::parse(source)?;
    run_program(vm, &program)
}
