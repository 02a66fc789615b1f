//! Bytecode emission helpers.
//!
//! Every helper writes through the current function's chunk, tagging each
//! byte with the line the compiler is currently lowering. Jump helpers
//! return the offset of their 16-bit placeholder for later patching.

use quillc_rt::{OpCode, Value};

use crate::compiler::{Compiler, FunctionCtx};
use crate::error::CompileError;

impl<'vm> Compiler<'vm> {
    pub(crate) fn chunk_len(&self, ctx: &FunctionCtx) -> usize {
        self.vm.heap().function(ctx.function).chunk.len()
    }

    pub(crate) fn emit_byte(&mut self, ctx: &FunctionCtx, byte: u8) {
        let line = ctx.line;
        self.vm
            .heap_mut()
            .function_mut(ctx.function)
            .chunk
            .write(byte, line);
    }

    pub(crate) fn emit_op(&mut self, ctx: &FunctionCtx, op: OpCode) {
        self.emit_byte(ctx, op as u8);
    }

    fn emit_short(&mut self, ctx: &FunctionCtx, value: u16) {
        self.emit_byte(ctx, (value >> 8) as u8);
        self.emit_byte(ctx, value as u8);
    }

    /// Adds `value` to the constant pool and returns its index.
    fn add_constant(&mut self, ctx: &FunctionCtx, value: Value) -> Result<u16, CompileError> {
        self.vm
            .heap_mut()
            .function_mut(ctx.function)
            .chunk
            .add_constant(value)
            .ok_or(CompileError::TooManyConstants)
    }

    pub(crate) fn emit_load_const(
        &mut self,
        ctx: &FunctionCtx,
        dest: u8,
        value: Value,
    ) -> Result<(), CompileError> {
        let index = self.add_constant(ctx, value)?;
        self.emit_op(ctx, OpCode::LoadConst);
        self.emit_byte(ctx, dest);
        self.emit_short(ctx, index);
        Ok(())
    }

    pub(crate) fn emit_load_null(&mut self, ctx: &FunctionCtx, dest: u8) {
        self.emit_op(ctx, OpCode::LoadNull);
        self.emit_byte(ctx, dest);
    }

    pub(crate) fn emit_load_bool(&mut self, ctx: &FunctionCtx, dest: u8, value: bool) {
        self.emit_op(
            ctx,
            if value {
                OpCode::LoadTrue
            } else {
                OpCode::LoadFalse
            },
        );
        self.emit_byte(ctx, dest);
    }

    pub(crate) fn emit_move(&mut self, ctx: &FunctionCtx, dest: u8, src: u8) {
        self.emit_op(ctx, OpCode::Move);
        self.emit_byte(ctx, dest);
        self.emit_byte(ctx, src);
    }

    pub(crate) fn emit_unary(&mut self, ctx: &FunctionCtx, op: OpCode, dest: u8, operand: u8) {
        self.emit_op(ctx, op);
        self.emit_byte(ctx, dest);
        self.emit_byte(ctx, operand);
    }

    pub(crate) fn emit_binary(
        &mut self,
        ctx: &FunctionCtx,
        op: OpCode,
        dest: u8,
        left: u8,
        right: u8,
    ) {
        self.emit_op(ctx, op);
        self.emit_byte(ctx, dest);
        self.emit_byte(ctx, left);
        self.emit_byte(ctx, right);
    }

    pub(crate) fn emit_get_global(&mut self, ctx: &FunctionCtx, dest: u8, slot: u16) {
        self.emit_op(ctx, OpCode::GetGlobal);
        self.emit_byte(ctx, dest);
        self.emit_short(ctx, slot);
    }

    pub(crate) fn emit_set_global(&mut self, ctx: &FunctionCtx, src: u8, slot: u16) {
        self.emit_op(ctx, OpCode::SetGlobal);
        self.emit_byte(ctx, src);
        self.emit_short(ctx, slot);
    }

    pub(crate) fn emit_define_global(&mut self, ctx: &FunctionCtx, src: u8, slot: u16) {
        self.emit_op(ctx, OpCode::DefineGlobal);
        self.emit_byte(ctx, src);
        self.emit_short(ctx, slot);
    }

    pub(crate) fn emit_call(
        &mut self,
        ctx: &FunctionCtx,
        dest: u8,
        callee: u8,
        arg_registers: &[u8],
    ) {
        self.emit_op(ctx, OpCode::Call);
        self.emit_byte(ctx, dest);
        self.emit_byte(ctx, callee);
        self.emit_byte(ctx, arg_registers.len() as u8);
        for &register in arg_registers {
            self.emit_byte(ctx, register);
        }
    }

    pub(crate) fn emit_build_array(
        &mut self,
        ctx: &FunctionCtx,
        dest: u8,
        element_registers: &[u8],
    ) {
        self.emit_op(ctx, OpCode::BuildArray);
        self.emit_byte(ctx, dest);
        self.emit_byte(ctx, element_registers.len() as u8);
        for &register in element_registers {
            self.emit_byte(ctx, register);
        }
    }

    pub(crate) fn emit_class(
        &mut self,
        ctx: &FunctionCtx,
        dest: u8,
        name: Value,
    ) -> Result<(), CompileError> {
        let index = self.add_constant(ctx, name)?;
        self.emit_op(ctx, OpCode::Class);
        self.emit_byte(ctx, dest);
        self.emit_short(ctx, index);
        Ok(())
    }

    pub(crate) fn emit_method(
        &mut self,
        ctx: &FunctionCtx,
        class: u8,
        name: Value,
        function: u8,
    ) -> Result<(), CompileError> {
        let index = self.add_constant(ctx, name)?;
        self.emit_op(ctx, OpCode::Method);
        self.emit_byte(ctx, class);
        self.emit_short(ctx, index);
        self.emit_byte(ctx, function);
        Ok(())
    }

    pub(crate) fn emit_get_property(
        &mut self,
        ctx: &FunctionCtx,
        dest: u8,
        object: u8,
        name: Value,
    ) -> Result<(), CompileError> {
        let index = self.add_constant(ctx, name)?;
        self.emit_op(ctx, OpCode::GetProperty);
        self.emit_byte(ctx, dest);
        self.emit_byte(ctx, object);
        self.emit_short(ctx, index);
        Ok(())
    }

    pub(crate) fn emit_set_property(
        &mut self,
        ctx: &FunctionCtx,
        object: u8,
        name: Value,
        value: u8,
    ) -> Result<(), CompileError> {
        let index = self.add_constant(ctx, name)?;
        self.emit_op(ctx, OpCode::SetProperty);
        self.emit_byte(ctx, object);
        self.emit_short(ctx, index);
        self.emit_byte(ctx, value);
        Ok(())
    }

    pub(crate) fn emit_invoke(
        &mut self,
        ctx: &FunctionCtx,
        dest: u8,
        object: u8,
        name: Value,
        arg_registers: &[u8],
    ) -> Result<(), CompileError> {
        let index = self.add_constant(ctx, name)?;
        self.emit_op(ctx, OpCode::Invoke);
        self.emit_byte(ctx, dest);
        self.emit_byte(ctx, object);
        self.emit_short(ctx, index);
        self.emit_byte(ctx, arg_registers.len() as u8);
        for &register in arg_registers {
            self.emit_byte(ctx, register);
        }
        Ok(())
    }

    pub(crate) fn emit_return_value(&mut self, ctx: &FunctionCtx, src: u8) {
        self.emit_op(ctx, OpCode::Return);
        self.emit_byte(ctx, src);
    }

    /// Emits a forward jump with a placeholder offset; returns the
    /// placeholder's position for [`Compiler::patch_jump`].
    pub(crate) fn emit_jump(&mut self, ctx: &FunctionCtx) -> usize {
        self.emit_op(ctx, OpCode::Jump);
        self.emit_byte(ctx, 0xFF);
        self.emit_byte(ctx, 0xFF);
        self.chunk_len(ctx) - 2
    }

    pub(crate) fn emit_jump_if_false(&mut self, ctx: &FunctionCtx, condition: u8) -> usize {
        self.emit_op(ctx, OpCode::JumpIfFalse);
        self.emit_byte(ctx, condition);
        self.emit_byte(ctx, 0xFF);
        self.emit_byte(ctx, 0xFF);
        self.chunk_len(ctx) - 2
    }

    /// Fills a forward-jump placeholder with the distance from just past
    /// the placeholder to the current end of code.
    pub(crate) fn patch_jump(
        &mut self,
        ctx: &FunctionCtx,
        offset: usize,
    ) -> Result<(), CompileError> {
        let jump = self.chunk_len(ctx) - offset - 2;
        if jump > u16::MAX as usize {
            return Err(CompileError::JumpTooFar);
        }
        let chunk = &mut self.vm.heap_mut().function_mut(ctx.function).chunk;
        chunk.code[offset] = (jump >> 8) as u8;
        chunk.code[offset + 1] = jump as u8;
        Ok(())
    }

    /// Emits a backward jump to `loop_start`; the VM subtracts the offset.
    pub(crate) fn emit_loop(
        &mut self,
        ctx: &FunctionCtx,
        loop_start: usize,
    ) -> Result<(), CompileError> {
        self.emit_op(ctx, OpCode::Loop);
        self.emit_byte(ctx, 0);
        self.emit_byte(ctx, 0);
        let end = self.chunk_len(ctx);
        let offset = end - loop_start;
        if offset > u16::MAX as usize {
            return Err(CompileError::LoopTooLarge);
        }
        let chunk = &mut self.vm.heap_mut().function_mut(ctx.function).chunk;
        chunk.code[end - 2] = (offset >> 8) as u8;
        chunk.code[end - 1] = offset as u8;
        Ok(())
    }
}
