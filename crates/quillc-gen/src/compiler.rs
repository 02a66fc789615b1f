//! The single-pass compiler core: per-function state, register
//! allocation, scopes, and statement lowering.
//!
//! Each function owns a register file of up to 256 slots. Registers
//! `0..locals` hold live locals (`this` occupies slot 0 in methods and
//! constructors); temporaries are allocated contiguously above the local
//! watermark by bumping `stack_depth`. `register_count` tracks the
//! high-water mark and becomes the function's frame size.

use quillc_par::ast::{ClassDecl, FunctionDecl, Program, Stmt, StmtKind};
use quillc_rt::{ObjRef, Value, Vm};

use crate::error::CompileError;
use crate::scope::{GlobalTable, Local};

const MAX_LOCALS: usize = 255;
const MAX_REGISTERS: u16 = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

/// Compilation state for one function body.
pub(crate) struct FunctionCtx {
    pub function: ObjRef,
    pub kind: FunctionKind,
    pub locals: Vec<Local>,
    pub scope_depth: i32,

    /// Temporaries currently live above the locals.
    pub stack_depth: u16,

    /// High-water register mark; written back to the function at the end.
    pub register_count: u16,

    /// Top-level pending expression value (the script result convention).
    pub has_pending: bool,
    pub pending_reg: u8,

    /// Source line currently being lowered; tags every emitted byte.
    pub line: u32,
}

impl FunctionCtx {
    pub(crate) fn new(function: ObjRef, kind: FunctionKind) -> Self {
        Self {
            function,
            kind,
            locals: Vec::new(),
            scope_depth: 0,
            stack_depth: 0,
            register_count: 0,
            has_pending: false,
            pending_reg: 0,
            line: 0,
        }
    }
}

/// Shared state of one compilation: the VM that owns the emitted objects
/// and the global slot table.
pub(crate) struct Compiler<'vm> {
    pub(crate) vm: &'vm mut Vm,
    pub(crate) globals: GlobalTable,
}

impl<'vm> Compiler<'vm> {
    pub(crate) fn new(vm: &'vm mut Vm) -> Self {
        Self {
            vm,
            globals: GlobalTable::new(),
        }
    }

    /// Compiles a whole program into the root "script" function. The
    /// function is rooted on the VM stack for the duration.
    pub(crate) fn compile_program(&mut self, program: &Program) -> Result<ObjRef, CompileError> {
        let function = self.vm.new_function(Some("script"), 0);
        self.vm.push(Value::Obj(function));

        let mut ctx = FunctionCtx::new(function, FunctionKind::Script);
        let result = self.script_body(&mut ctx, program);

        match result {
            Ok(()) => {
                self.vm.heap_mut().function_mut(function).register_count = ctx.register_count;
                self.vm.pop();
                log::debug!(
                    "compiled script: {} bytes, {} registers, {} globals",
                    self.vm.heap().function(function).chunk.len(),
                    ctx.register_count,
                    self.globals.len()
                );
                Ok(function)
            }
            Err(error) => {
                self.vm.pop();
                Err(error)
            }
        }
    }

    fn script_body(&mut self, ctx: &mut FunctionCtx, program: &Program) -> Result<(), CompileError> {
        for stmt in &program.statements {
            self.statement(ctx, stmt)?;
        }
        self.emit_return(ctx)
    }

    // ------------------------------------------------------------------
    // Registers and scopes.
    // ------------------------------------------------------------------

    fn update_register_usage(&self, ctx: &mut FunctionCtx) -> Result<(), CompileError> {
        let total = ctx.locals.len() as u16 + ctx.stack_depth;
        if total > ctx.register_count {
            ctx.register_count = total;
        }
        if ctx.register_count > MAX_REGISTERS {
            return Err(CompileError::RegisterOverflow);
        }
        Ok(())
    }

    /// Allocates the next scratch register above the live locals.
    pub(crate) fn push_slot(&self, ctx: &mut FunctionCtx) -> Result<u8, CompileError> {
        let dest = ctx.locals.len() as u16 + ctx.stack_depth;
        ctx.stack_depth += 1;
        self.update_register_usage(ctx)?;
        Ok(dest as u8)
    }

    pub(crate) fn pop_slots(&self, ctx: &mut FunctionCtx, count: u16) {
        ctx.stack_depth = ctx.stack_depth.saturating_sub(count);
    }

    /// Register of the temporary `distance` slots below the top.
    pub(crate) fn stack_top_register(&self, ctx: &FunctionCtx, distance: usize) -> u8 {
        (ctx.locals.len() + ctx.stack_depth as usize - 1 - distance) as u8
    }

    pub(crate) fn add_local(
        &self,
        ctx: &mut FunctionCtx,
        name: &str,
    ) -> Result<usize, CompileError> {
        if ctx.locals.len() >= MAX_LOCALS {
            return Err(CompileError::TooManyLocals);
        }
        let register = ctx.locals.len() as u8;
        ctx.locals.push(Local {
            name: name.to_string(),
            depth: -1,
            initialized: false,
            register,
        });
        if ctx.locals.len() as u16 > ctx.register_count {
            ctx.register_count = ctx.locals.len() as u16;
        }
        if ctx.register_count > MAX_REGISTERS {
            return Err(CompileError::RegisterOverflow);
        }
        Ok(ctx.locals.len() - 1)
    }

    /// Walks the locals from the top; a hit on an uninitialized local is
    /// an error unless this is the write side of an assignment.
    pub(crate) fn resolve_local(
        &self,
        ctx: &FunctionCtx,
        name: &str,
        for_assignment: bool,
    ) -> Result<Option<usize>, CompileError> {
        for index in (0..ctx.locals.len()).rev() {
            let local = &ctx.locals[index];
            if local.name == name {
                if !local.initialized && !for_assignment {
                    return Err(CompileError::ReadBeforeInit(name.to_string()));
                }
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn begin_scope(&self, ctx: &mut FunctionCtx) {
        ctx.scope_depth += 1;
    }

    fn end_scope(&self, ctx: &mut FunctionCtx) {
        ctx.scope_depth -= 1;
        while ctx
            .locals
            .last()
            .is_some_and(|local| local.depth > ctx.scope_depth)
        {
            ctx.locals.pop();
        }
    }

    // ------------------------------------------------------------------
    // Statements.
    // ------------------------------------------------------------------

    pub(crate) fn statement(
        &mut self,
        ctx: &mut FunctionCtx,
        stmt: &Stmt,
    ) -> Result<(), CompileError> {
        ctx.line = stmt.line;
        if !matches!(stmt.kind, StmtKind::Expression(_)) {
            self.discard_pending(ctx);
        }
        match &stmt.kind {
            StmtKind::Let { name, initializer } => {
                self.let_statement(ctx, name, initializer.as_ref())
            }
            StmtKind::Expression(expr) => self.expression_statement(ctx, expr),
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.if_statement(ctx, condition, then_branch, else_branch.as_deref()),
            StmtKind::While { condition, body } => self.while_statement(ctx, condition, body),
            StmtKind::Block(statements) => {
                self.begin_scope(ctx);
                for stmt in statements {
                    self.statement(ctx, stmt)?;
                }
                self.end_scope(ctx);
                Ok(())
            }
            StmtKind::Function(decl) => self.function_statement(ctx, decl),
            StmtKind::Return(value) => self.return_statement(ctx, value.as_ref()),
            StmtKind::Class(decl) => self.class_statement(ctx, decl),
        }
    }

    /// Drops the retained top-level expression value, if any. Called when
    /// a statement other than an expression statement begins.
    fn discard_pending(&self, ctx: &mut FunctionCtx) {
        if ctx.kind == FunctionKind::Script && ctx.scope_depth == 0 && ctx.has_pending {
            self.pop_slots(ctx, 1);
            ctx.has_pending = false;
        }
    }

    /// At the top level the expression result stays on the register stack
    /// as the pending script value; everywhere else it is discarded.
    fn expression_statement(
        &mut self,
        ctx: &mut FunctionCtx,
        expr: &quillc_par::ast::Expr,
    ) -> Result<(), CompileError> {
        if ctx.kind == FunctionKind::Script && ctx.scope_depth == 0 {
            if ctx.has_pending {
                self.pop_slots(ctx, 1);
                ctx.has_pending = false;
            }
            self.expression(ctx, expr)?;
            ctx.has_pending = true;
            ctx.pending_reg = self.stack_top_register(ctx, 0);
            return Ok(());
        }
        self.expression(ctx, expr)?;
        self.pop_slots(ctx, 1);
        Ok(())
    }

    fn let_statement(
        &mut self,
        ctx: &mut FunctionCtx,
        name: &str,
        initializer: Option<&quillc_par::ast::Expr>,
    ) -> Result<(), CompileError> {
        if ctx.scope_depth > 0 {
            // Same-scope redeclaration is an error; shadowing an outer
            // scope is fine.
            for local in ctx.locals.iter().rev() {
                if local.depth != -1 && local.depth < ctx.scope_depth {
                    break;
                }
                if local.name == name {
                    return Err(CompileError::AlreadyDeclared(name.to_string()));
                }
            }
            let slot = self.add_local(ctx, name)?;
            if let Some(initializer) = initializer {
                self.expression(ctx, initializer)?;
                let value_reg = self.stack_top_register(ctx, 0);
                let register = ctx.locals[slot].register;
                self.emit_move(ctx, register, value_reg);
                self.pop_slots(ctx, 1);
            } else {
                let register = ctx.locals[slot].register;
                self.emit_load_null(ctx, register);
            }
            ctx.locals[slot].depth = ctx.scope_depth;
            ctx.locals[slot].initialized = true;
            return Ok(());
        }

        let slot = self.globals.add(name)?;
        if let Some(initializer) = initializer {
            self.expression(ctx, initializer)?;
            let value_reg = self.stack_top_register(ctx, 0);
            self.emit_define_global(ctx, value_reg, slot);
            self.pop_slots(ctx, 1);
        } else {
            let dest = self.push_slot(ctx)?;
            self.emit_load_null(ctx, dest);
            self.emit_define_global(ctx, dest, slot);
            self.pop_slots(ctx, 1);
        }
        Ok(())
    }

    fn if_statement(
        &mut self,
        ctx: &mut FunctionCtx,
        condition: &quillc_par::ast::Expr,
        then_branch: &Stmt,
        else_branch: Option<&Stmt>,
    ) -> Result<(), CompileError> {
        self.expression(ctx, condition)?;
        let condition_reg = self.stack_top_register(ctx, 0);
        let then_jump = self.emit_jump_if_false(ctx, condition_reg);
        self.pop_slots(ctx, 1);

        self.statement(ctx, then_branch)?;

        let else_jump = self.emit_jump(ctx);
        self.patch_jump(ctx, then_jump)?;

        if let Some(else_branch) = else_branch {
            self.statement(ctx, else_branch)?;
        }
        self.patch_jump(ctx, else_jump)
    }

    fn while_statement(
        &mut self,
        ctx: &mut FunctionCtx,
        condition: &quillc_par::ast::Expr,
        body: &Stmt,
    ) -> Result<(), CompileError> {
        let loop_start = self.chunk_len(ctx);
        self.expression(ctx, condition)?;
        let condition_reg = self.stack_top_register(ctx, 0);
        let exit_jump = self.emit_jump_if_false(ctx, condition_reg);
        self.pop_slots(ctx, 1);

        self.statement(ctx, body)?;
        self.emit_loop(ctx, loop_start)?;
        self.patch_jump(ctx, exit_jump)
    }

    fn return_statement(
        &mut self,
        ctx: &mut FunctionCtx,
        value: Option<&quillc_par::ast::Expr>,
    ) -> Result<(), CompileError> {
        self.discard_pending(ctx);
        match value {
            Some(expr) => {
                if ctx.kind == FunctionKind::Initializer {
                    return Err(CompileError::ReturnFromConstructor);
                }
                self.expression(ctx, expr)?;
                let value_reg = self.stack_top_register(ctx, 0);
                self.emit_return_value(ctx, value_reg);
                self.pop_slots(ctx, 1);
            }
            None => self.emit_return(ctx)?,
        }
        ctx.has_pending = false;
        Ok(())
    }

    /// The implicit return path. The script returns its pending value if
    /// one is live; a constructor returns the receiver in slot 0;
    /// everything else returns null.
    pub(crate) fn emit_return(&mut self, ctx: &mut FunctionCtx) -> Result<(), CompileError> {
        if ctx.kind == FunctionKind::Script && ctx.has_pending {
            let pending = ctx.pending_reg;
            self.emit_return_value(ctx, pending);
            ctx.has_pending = false;
            ctx.stack_depth = 0;
            return Ok(());
        }
        if ctx.kind == FunctionKind::Initializer {
            self.emit_return_value(ctx, 0);
            return Ok(());
        }
        let dest = self.push_slot(ctx)?;
        self.emit_load_null(ctx, dest);
        self.emit_return_value(ctx, dest);
        self.pop_slots(ctx, 1);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Functions, methods, classes.
    // ------------------------------------------------------------------

    fn function_statement(
        &mut self,
        ctx: &mut FunctionCtx,
        decl: &FunctionDecl,
    ) -> Result<(), CompileError> {
        if decl.parameters.len() > u8::MAX as usize {
            return Err(CompileError::TooManyParameters(decl.name.clone()));
        }
        let arity = decl.parameters.len() as u8;

        let is_global = ctx.kind == FunctionKind::Script && ctx.scope_depth == 0;
        let mut global_slot = None;
        let mut local_register = None;
        if is_global {
            global_slot = Some(self.globals.add(&decl.name)?);
        } else {
            let slot = self.add_local(ctx, &decl.name)?;
            ctx.locals[slot].depth = ctx.scope_depth;
            ctx.locals[slot].initialized = true;
            local_register = Some(ctx.locals[slot].register);
        }

        // The fresh function stays rooted on the VM stack until it lands
        // in the enclosing chunk's constant pool.
        let function = self.compile_function(
            &decl.name,
            arity,
            &decl.parameters,
            &decl.body,
            FunctionKind::Function,
            ctx.line,
        )?;

        let dest = match self.push_slot(ctx) {
            Ok(dest) => dest,
            Err(error) => {
                self.vm.pop();
                return Err(error);
            }
        };
        if let Err(error) = self.emit_load_const(ctx, dest, Value::Obj(function)) {
            self.vm.pop();
            return Err(error);
        }
        self.vm.pop();

        match (global_slot, local_register) {
            (Some(slot), _) => self.emit_define_global(ctx, dest, slot),
            (None, Some(register)) => self.emit_move(ctx, register, dest),
            (None, None) => unreachable!("function binds either a global or a local"),
        }
        self.pop_slots(ctx, 1);
        Ok(())
    }

    fn class_statement(
        &mut self,
        ctx: &mut FunctionCtx,
        decl: &ClassDecl,
    ) -> Result<(), CompileError> {
        let is_global = ctx.kind == FunctionKind::Script && ctx.scope_depth == 0;
        let mut global_slot = None;
        let mut local_register = None;
        if is_global {
            global_slot = Some(self.globals.add(&decl.name)?);
        } else {
            let slot = self.add_local(ctx, &decl.name)?;
            ctx.locals[slot].depth = ctx.scope_depth;
            ctx.locals[slot].initialized = true;
            local_register = Some(ctx.locals[slot].register);
        }

        let class_name = self.vm.intern(&decl.name);
        let class_reg = self.push_slot(ctx)?;
        self.emit_class(ctx, class_reg, Value::Obj(class_name))?;

        for method in &decl.methods {
            ctx.line = method.line;
            // A method's arity counts the implicit receiver.
            if method.parameters.len() + 1 > u8::MAX as usize {
                return Err(CompileError::TooManyParameters(method.name.clone()));
            }
            let arity = method.parameters.len() as u8 + 1;
            let kind = if method.is_constructor {
                FunctionKind::Initializer
            } else {
                FunctionKind::Method
            };

            let function = self.compile_function(
                &method.name,
                arity,
                &method.parameters,
                &method.body,
                kind,
                method.line,
            )?;

            let method_reg = match self.push_slot(ctx) {
                Ok(register) => register,
                Err(error) => {
                    self.vm.pop();
                    return Err(error);
                }
            };
            if let Err(error) = self.emit_load_const(ctx, method_reg, Value::Obj(function)) {
                self.vm.pop();
                return Err(error);
            }
            self.vm.pop();

            let method_name = self.vm.intern(&method.name);
            self.emit_method(ctx, class_reg, Value::Obj(method_name), method_reg)?;
            self.pop_slots(ctx, 1);
        }

        match (global_slot, local_register) {
            (Some(slot), _) => self.emit_define_global(ctx, class_reg, slot),
            (None, Some(register)) => self.emit_move(ctx, register, class_reg),
            (None, None) => unreachable!("class binds either a global or a local"),
        }
        self.pop_slots(ctx, 1);
        Ok(())
    }

    /// Compiles one function body into its own `ObjFunction`. On success
    /// the function is left rooted on the VM stack; the caller pops it
    /// after installing it in a constant pool. On failure it is unrooted
    /// here.
    fn compile_function(
        &mut self,
        name: &str,
        arity: u8,
        parameters: &[String],
        body: &[Stmt],
        kind: FunctionKind,
        line: u32,
    ) -> Result<ObjRef, CompileError> {
        let function = self.vm.new_function(Some(name), arity);
        self.vm.push(Value::Obj(function));

        let mut child = FunctionCtx::new(function, kind);
        child.line = line;
        let result = self.function_body(&mut child, parameters, body);

        match result {
            Ok(()) => {
                self.vm.heap_mut().function_mut(function).register_count = child.register_count;
                log::debug!(
                    "compiled function '{}': arity {}, {} registers",
                    name,
                    arity,
                    child.register_count
                );
                Ok(function)
            }
            Err(error) => {
                self.vm.pop();
                Err(error)
            }
        }
    }

    fn function_body(
        &mut self,
        ctx: &mut FunctionCtx,
        parameters: &[String],
        body: &[Stmt],
    ) -> Result<(), CompileError> {
        if matches!(ctx.kind, FunctionKind::Method | FunctionKind::Initializer) {
            let slot = self.add_local(ctx, "this")?;
            ctx.locals[slot].depth = 0;
            ctx.locals[slot].initialized = true;
        }
        for parameter in parameters {
            let slot = self.add_local(ctx, parameter)?;
            ctx.locals[slot].depth = 0;
            ctx.locals[slot].initialized = true;
        }

        self.begin_scope(ctx);
        for stmt in body {
            self.statement(ctx, stmt)?;
        }
        self.end_scope(ctx);
        self.emit_return(ctx)
    }
}
