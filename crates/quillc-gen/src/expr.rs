//! Expression lowering.
//!
//! Every expression compiles to code that leaves its value in one fresh
//! temporary at the top of the register stack. Binary operators reuse the
//! left operand's register as the destination and release one slot; the
//! short comparison forms (`>=`, `<=`, `!=`) are synthesized from the
//! base comparison plus a logical not.

use quillc_par::ast::{BinaryOp, Expr, ExprKind, UnaryOp};
use quillc_rt::{OpCode, Value};

use crate::compiler::{Compiler, FunctionCtx};
use crate::error::CompileError;

impl<'vm> Compiler<'vm> {
    pub(crate) fn expression(
        &mut self,
        ctx: &mut FunctionCtx,
        expr: &Expr,
    ) -> Result<(), CompileError> {
        ctx.line = expr.line;
        match &expr.kind {
            ExprKind::Number(value) => {
                let dest = self.push_slot(ctx)?;
                self.emit_load_const(ctx, dest, Value::Number(*value))
            }
            ExprKind::Str(text) => {
                let string = self.vm.intern(text);
                let dest = self.push_slot(ctx)?;
                self.emit_load_const(ctx, dest, Value::Obj(string))
            }
            ExprKind::Bool(value) => {
                let dest = self.push_slot(ctx)?;
                self.emit_load_bool(ctx, dest, *value);
                Ok(())
            }
            ExprKind::Null => {
                let dest = self.push_slot(ctx)?;
                self.emit_load_null(ctx, dest);
                Ok(())
            }
            ExprKind::Identifier(name) => self.identifier(ctx, name),
            ExprKind::This => self.this_expression(ctx),
            ExprKind::Unary { op, right } => {
                self.expression(ctx, right)?;
                let register = self.stack_top_register(ctx, 0);
                let opcode = match op {
                    UnaryOp::Negate => OpCode::Negate,
                    UnaryOp::Not => OpCode::Not,
                };
                self.emit_unary(ctx, opcode, register, register);
                Ok(())
            }
            ExprKind::Binary { left, op, right } => self.binary(ctx, left, *op, right),
            ExprKind::Assign { name, value } => self.assignment(ctx, name, value),
            ExprKind::Call { callee, arguments } => self.call(ctx, callee, arguments),
            ExprKind::Array(elements) => self.array_literal(ctx, elements),
            ExprKind::Index { array, index } => {
                self.expression(ctx, array)?;
                self.expression(ctx, index)?;
                let index_reg = self.stack_top_register(ctx, 0);
                let array_reg = self.stack_top_register(ctx, 1);
                self.emit_binary(ctx, OpCode::ArrayGet, array_reg, array_reg, index_reg);
                self.pop_slots(ctx, 1);
                Ok(())
            }
            ExprKind::GetProperty { object, name } => {
                self.expression(ctx, object)?;
                let object_reg = self.stack_top_register(ctx, 0);
                let name = self.vm.intern(name);
                self.emit_get_property(ctx, object_reg, object_reg, Value::Obj(name))
            }
            ExprKind::SetProperty {
                object,
                name,
                value,
            } => {
                self.expression(ctx, object)?;
                self.expression(ctx, value)?;
                let value_reg = self.stack_top_register(ctx, 0);
                let object_reg = self.stack_top_register(ctx, 1);
                let name = self.vm.intern(name);
                self.emit_set_property(ctx, object_reg, Value::Obj(name), value_reg)?;
                // The assignment expression evaluates to the stored value.
                self.emit_move(ctx, object_reg, value_reg);
                self.pop_slots(ctx, 1);
                Ok(())
            }
            ExprKind::Invoke {
                object,
                name,
                arguments,
            } => self.invoke(ctx, object, name, arguments),
        }
    }

    fn identifier(&mut self, ctx: &mut FunctionCtx, name: &str) -> Result<(), CompileError> {
        let local = self.resolve_local(ctx, name, false)?;
        let dest = self.push_slot(ctx)?;
        if let Some(index) = local {
            let register = ctx.locals[index].register;
            self.emit_move(ctx, dest, register);
            return Ok(());
        }
        match self.globals.find(name) {
            Some(slot) => {
                self.emit_get_global(ctx, dest, slot);
                Ok(())
            }
            None => {
                // Release the scratch slot before reporting.
                self.pop_slots(ctx, 1);
                Err(CompileError::UndefinedVariable(name.to_string()))
            }
        }
    }

    fn this_expression(&mut self, ctx: &mut FunctionCtx) -> Result<(), CompileError> {
        let Some(index) = self.resolve_local(ctx, "this", false)? else {
            return Err(CompileError::ThisOutsideMethod);
        };
        let register = ctx.locals[index].register;
        let dest = self.push_slot(ctx)?;
        self.emit_move(ctx, dest, register);
        Ok(())
    }

    fn binary(
        &mut self,
        ctx: &mut FunctionCtx,
        left: &Expr,
        op: BinaryOp,
        right: &Expr,
    ) -> Result<(), CompileError> {
        self.expression(ctx, left)?;
        self.expression(ctx, right)?;
        let right_reg = self.stack_top_register(ctx, 0);
        let left_reg = self.stack_top_register(ctx, 1);
        let dest = left_reg;

        let (opcode, negate) = match op {
            BinaryOp::Add => (OpCode::Add, false),
            BinaryOp::Subtract => (OpCode::Subtract, false),
            BinaryOp::Multiply => (OpCode::Multiply, false),
            BinaryOp::Divide => (OpCode::Divide, false),
            BinaryOp::Equal => (OpCode::Equal, false),
            BinaryOp::NotEqual => (OpCode::Equal, true),
            BinaryOp::Less => (OpCode::Less, false),
            BinaryOp::Greater => (OpCode::Greater, false),
            // a >= b  is  !(a < b);  a <= b  is  !(a > b)
            BinaryOp::GreaterEqual => (OpCode::Less, true),
            BinaryOp::LessEqual => (OpCode::Greater, true),
        };

        self.emit_binary(ctx, opcode, dest, left_reg, right_reg);
        self.pop_slots(ctx, 1);
        if negate {
            self.emit_unary(ctx, OpCode::Not, dest, dest);
        }
        Ok(())
    }

    fn assignment(
        &mut self,
        ctx: &mut FunctionCtx,
        name: &str,
        value: &Expr,
    ) -> Result<(), CompileError> {
        self.expression(ctx, value)?;
        if let Some(index) = self.resolve_local(ctx, name, true)? {
            let value_reg = self.stack_top_register(ctx, 0);
            let register = ctx.locals[index].register;
            self.emit_move(ctx, register, value_reg);
            return Ok(());
        }
        match self.globals.find(name) {
            Some(slot) => {
                let value_reg = self.stack_top_register(ctx, 0);
                self.emit_set_global(ctx, value_reg, slot);
                Ok(())
            }
            None => Err(CompileError::UndefinedVariable(name.to_string())),
        }
    }

    fn call(
        &mut self,
        ctx: &mut FunctionCtx,
        callee: &Expr,
        arguments: &[Expr],
    ) -> Result<(), CompileError> {
        self.expression(ctx, callee)?;
        if arguments.len() > u8::MAX as usize {
            return Err(CompileError::TooManyArguments);
        }
        for argument in arguments {
            self.expression(ctx, argument)?;
        }

        let arg_count = arguments.len();
        let callee_reg = self.stack_top_register(ctx, arg_count);
        let arg_registers: Vec<u8> = (0..arg_count)
            .map(|i| self.stack_top_register(ctx, arg_count - 1 - i))
            .collect();

        // The result overwrites the callee's slot.
        self.emit_call(ctx, callee_reg, callee_reg, &arg_registers);
        self.pop_slots(ctx, arg_count as u16);
        Ok(())
    }

    fn invoke(
        &mut self,
        ctx: &mut FunctionCtx,
        object: &Expr,
        name: &str,
        arguments: &[Expr],
    ) -> Result<(), CompileError> {
        self.expression(ctx, object)?;
        if arguments.len() > u8::MAX as usize {
            return Err(CompileError::TooManyArguments);
        }
        for argument in arguments {
            self.expression(ctx, argument)?;
        }

        let arg_count = arguments.len();
        let object_reg = self.stack_top_register(ctx, arg_count);
        let arg_registers: Vec<u8> = (0..arg_count)
            .map(|i| self.stack_top_register(ctx, arg_count - 1 - i))
            .collect();

        let name = self.vm.intern(name);
        self.emit_invoke(ctx, object_reg, object_reg, Value::Obj(name), &arg_registers)?;
        self.pop_slots(ctx, arg_count as u16);
        Ok(())
    }

    fn array_literal(
        &mut self,
        ctx: &mut FunctionCtx,
        elements: &[Expr],
    ) -> Result<(), CompileError> {
        if elements.len() > u8::MAX as usize {
            return Err(CompileError::TooManyArrayElements);
        }
        if elements.is_empty() {
            let dest = self.push_slot(ctx)?;
            self.emit_build_array(ctx, dest, &[]);
            return Ok(());
        }

        for element in elements {
            self.expression(ctx, element)?;
        }
        let count = elements.len();
        let dest = self.stack_top_register(ctx, count - 1);
        let element_registers: Vec<u8> = (0..count)
            .map(|i| self.stack_top_register(ctx, count - 1 - i))
            .collect();

        self.emit_build_array(ctx, dest, &element_registers);
        self.pop_slots(ctx, count as u16 - 1);
        Ok(())
    }
}
