//! The op iterator: a stack-based validator layered on the decoder.
//!
//! `OpIter` owns the WebAssembly abstract value stack and control stack.
//! Every `read_*` method consumes the operator's immediates from the
//! decoder, pops its operands (type-checked) and returns them; the caller
//! produces the SSA result and installs it with [`OpIter::set_result`].
//!
//! The iterator is parameterised by a [`OpIterPolicy`] naming the front-end's
//! "value" (what rides the stack next to the type) and "control item" (what a
//! front-end pins to a control-stack entry), so the validation logic is
//! independent of any particular graph representation.

use crate::decode::{BlockTypeImm, Decoder, MemArg, Opcode};
use crate::env::{FuncType, ModuleEnv};
use crate::mir::ValType;
use anyhow::{anyhow, bail, Result};
use std::fmt;

pub trait OpIterPolicy {
    /// Rides the value stack; `Default` is the dead-code placeholder.
    type Value: Copy + Default + fmt::Debug;
    /// Front-end state attached to each control-stack entry.
    type ControlItem: Default + fmt::Debug;
}

/// Validation-time type of a stack slot: a concrete value type, or the
/// bottom type produced while validating unreachable code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackType {
    Bottom,
    T(ValType),
}

impl StackType {
    fn matches(self, want: ValType) -> bool {
        match self {
            StackType::Bottom => true,
            StackType::T(t) => match (t, want) {
                // Any concrete reference satisfies a plain reference want.
                (a, b) if a == b => true,
                (t, ValType::AnyRef) => t.is_ref(),
                _ => false,
            },
        }
    }

    pub fn as_val_type(self) -> Option<ValType> {
        match self {
            StackType::Bottom => None,
            StackType::T(t) => Some(t),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelKind {
    Body,
    Block,
    Loop,
    Then,
    Else,
}

pub struct ControlFrame<P: OpIterPolicy> {
    pub kind: LabelKind,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    /// Value-stack height at entry (after the label's params were popped).
    height: usize,
    pub unreachable: bool,
    pub item: P::ControlItem,
    /// Saved at `if` so the implicit else of a then-only arm can forward
    /// the if's parameters.
    pub param_values: Vec<P::Value>,
}

impl<P: OpIterPolicy> ControlFrame<P> {
    /// The types a branch to this label must supply: loop labels take the
    /// params, all others the results.
    pub fn branch_arg_types(&self) -> &[ValType] {
        if self.kind == LabelKind::Loop {
            &self.params
        } else {
            &self.results
        }
    }
}

/// Everything `read_end` reports about the label being closed.
#[derive(Debug)]
pub struct EndInfo<P: OpIterPolicy> {
    pub kind: LabelKind,
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
    /// The label's result values as found on the stack (dead placeholders
    /// in unreachable code).
    pub result_values: Vec<P::Value>,
    pub param_values: Vec<P::Value>,
    pub item: P::ControlItem,
}

pub struct OpIter<'a, P: OpIterPolicy> {
    d: Decoder<'a>,
    env: &'a ModuleEnv,
    locals: Vec<ValType>,
    stack: Vec<(StackType, P::Value)>,
    controls: Vec<ControlFrame<P>>,
}

impl<'a, P: OpIterPolicy> OpIter<'a, P> {
    pub fn new(
        d: Decoder<'a>,
        env: &'a ModuleEnv,
        locals: Vec<ValType>,
        body_results: Vec<ValType>,
    ) -> Self {
        let body = ControlFrame {
            kind: LabelKind::Body,
            params: Vec::new(),
            results: body_results,
            height: 0,
            unreachable: false,
            item: P::ControlItem::default(),
            param_values: Vec::new(),
        };
        Self {
            d,
            env,
            locals,
            stack: Vec::new(),
            controls: vec![body],
        }
    }

    pub fn env(&self) -> &ModuleEnv {
        self.env
    }

    /// True once the outermost `end` has been consumed.
    pub fn done(&self) -> bool {
        self.controls.is_empty()
    }

    /// Byte offset of the operator currently being processed.
    pub fn bytecode_offset(&self) -> u32 {
        self.d.last_opcode_offset()
    }

    pub fn in_unreachable_code(&self) -> bool {
        self.controls.last().map(|f| f.unreachable).unwrap_or(false)
    }

    fn fail(&self, msg: impl fmt::Display) -> anyhow::Error {
        anyhow!("{} at offset {}", msg, self.bytecode_offset())
    }

    pub fn unrecognized_opcode(&self, op: Opcode) -> anyhow::Error {
        match op.sub {
            Some(sub) => self.fail(format_args!(
                "unknown opcode 0x{:02x} 0x{:02x}",
                op.primary, sub
            )),
            None => self.fail(format_args!("unknown opcode 0x{:02x}", op.primary)),
        }
    }

    // ---- value-stack primitives ----

    fn push(&mut self, ty: ValType) {
        self.stack.push((StackType::T(ty), P::Value::default()));
    }

    /// Install the SSA value for the operator's (single) result.
    pub fn set_result(&mut self, v: P::Value) {
        if let Some(top) = self.stack.last_mut() {
            top.1 = v;
        }
    }

    pub fn push_operands(&mut self, types: &[ValType], values: &[P::Value]) {
        debug_assert_eq!(types.len(), values.len());
        for (t, v) in types.iter().zip(values) {
            self.stack.push((StackType::T(*t), *v));
        }
    }

    fn pop_any(&mut self) -> Result<(StackType, P::Value)> {
        let frame = self.controls.last().ok_or_else(|| self.fail("no frame"))?;
        if self.stack.len() == frame.height {
            if frame.unreachable {
                return Ok((StackType::Bottom, P::Value::default()));
            }
            bail!(self.fail("stack underflow"));
        }
        Ok(self.stack.pop().ok_or_else(|| self.fail("stack underflow"))?)
    }

    fn pop_val(&mut self, want: ValType) -> Result<P::Value> {
        let (ty, v) = self.pop_any()?;
        if !ty.matches(want) {
            bail!(self.fail(format_args!(
                "type mismatch: expected {}, found {}",
                want,
                match ty {
                    StackType::Bottom => "bottom".to_string(),
                    StackType::T(t) => t.to_string(),
                }
            )));
        }
        Ok(v)
    }

    /// Pop `types` in reverse; return values in declaration order.
    fn pop_values(&mut self, types: &[ValType]) -> Result<Vec<P::Value>> {
        let mut values = Vec::with_capacity(types.len());
        for t in types.iter().rev() {
            values.push(self.pop_val(*t)?);
        }
        values.reverse();
        Ok(values)
    }

    fn set_unreachable(&mut self) {
        if let Some(frame) = self.controls.last_mut() {
            self.stack.truncate(frame.height);
            frame.unreachable = true;
        }
    }

    // ---- control-stack access ----

    pub fn control_depth(&self) -> usize {
        self.controls.len()
    }

    fn frame_at(&self, relative: u32) -> Result<&ControlFrame<P>> {
        let idx = self
            .controls
            .len()
            .checked_sub(relative as usize + 1)
            .ok_or_else(|| self.fail(format_args!("unknown label depth {}", relative)))?;
        Ok(&self.controls[idx])
    }

    /// Borrow the front-end item stored at a control-stack entry.
    pub fn control_item(&mut self, relative: u32) -> Result<&mut P::ControlItem> {
        let len = self.controls.len();
        let idx = len
            .checked_sub(relative as usize + 1)
            .ok_or_else(|| anyhow!("unknown label depth {}", relative))?;
        Ok(&mut self.controls[idx].item)
    }

    fn push_frame(&mut self, kind: LabelKind, sig: FuncType, param_values: Vec<P::Value>) {
        self.controls.push(ControlFrame {
            kind,
            params: sig.params,
            results: sig.results,
            height: self.stack.len(),
            unreachable: false,
            item: P::ControlItem::default(),
            param_values,
        });
    }

    fn resolve_block_type(&self, imm: BlockTypeImm) -> Result<FuncType> {
        match imm {
            BlockTypeImm::Empty => Ok(FuncType::new(Vec::new(), Vec::new())),
            BlockTypeImm::Value(t) => Ok(FuncType::new(Vec::new(), vec![t])),
            BlockTypeImm::TypeIndex(i) => Ok(self.env.ty(i)?.clone()),
        }
    }

    // ---- operator reads ----

    pub fn read_opcode(&mut self) -> Result<Opcode> {
        self.d.read_opcode()
    }

    /// After the outermost `end`: the body must have consumed every byte.
    pub fn check_exhausted(&mut self) -> Result<()> {
        if !self.d.done() {
            bail!(
                "trailing bytes after function end at offset {}",
                self.d.current_offset()
            );
        }
        Ok(())
    }

    pub fn read_nop(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn read_unreachable(&mut self) -> Result<()> {
        self.set_unreachable();
        Ok(())
    }

    pub fn read_drop(&mut self) -> Result<P::Value> {
        Ok(self.pop_any()?.1)
    }

    pub fn read_i32_const(&mut self) -> Result<i32> {
        let v = self.d.read_var_i32()?;
        self.push(ValType::I32);
        Ok(v)
    }

    pub fn read_i64_const(&mut self) -> Result<i64> {
        let v = self.d.read_var_i64()?;
        self.push(ValType::I64);
        Ok(v)
    }

    pub fn read_f32_const(&mut self) -> Result<u32> {
        let v = self.d.read_f32_bits()?;
        self.push(ValType::F32);
        Ok(v)
    }

    pub fn read_f64_const(&mut self) -> Result<u64> {
        let v = self.d.read_f64_bits()?;
        self.push(ValType::F64);
        Ok(v)
    }

    pub fn read_ref_null(&mut self) -> Result<ValType> {
        let ty = self.d.read_heap_type()?;
        self.push(ty);
        Ok(ty)
    }

    pub fn read_ref_is_null(&mut self) -> Result<P::Value> {
        let (ty, v) = self.pop_any()?;
        if let StackType::T(t) = ty {
            if !t.is_ref() {
                bail!(self.fail(format_args!("type mismatch: expected a reference, found {}", t)));
            }
        }
        self.push(ValType::I32);
        Ok(v)
    }

    pub fn read_ref_func(&mut self) -> Result<u32> {
        let index = self.d.read_var_u32()?;
        self.env.func(index)?;
        self.push(ValType::FuncRef);
        Ok(index)
    }

    pub fn read_unary(&mut self, ty: ValType) -> Result<P::Value> {
        let v = self.pop_val(ty)?;
        self.push(ty);
        Ok(v)
    }

    pub fn read_conversion(&mut self, from: ValType, to: ValType) -> Result<P::Value> {
        let v = self.pop_val(from)?;
        self.push(to);
        Ok(v)
    }

    pub fn read_binary(&mut self, ty: ValType) -> Result<(P::Value, P::Value)> {
        let rhs = self.pop_val(ty)?;
        let lhs = self.pop_val(ty)?;
        self.push(ty);
        Ok((lhs, rhs))
    }

    pub fn read_compare(&mut self, ty: ValType) -> Result<(P::Value, P::Value)> {
        let rhs = self.pop_val(ty)?;
        let lhs = self.pop_val(ty)?;
        self.push(ValType::I32);
        Ok((lhs, rhs))
    }

    /// `select` / `select (result t)`. Returns `(cond, on_true, on_false,
    /// type)`; the type is `Bottom` only in unreachable code.
    pub fn read_select(&mut self, typed: bool) -> Result<(P::Value, P::Value, P::Value, StackType)> {
        let annot = if typed {
            let count = self.d.read_var_u32()?;
            if count != 1 {
                bail!(self.fail("select must have exactly one result type"));
            }
            Some(self.d.read_val_type()?)
        } else {
            None
        };
        let cond = self.pop_val(ValType::I32)?;
        let (ty2, v2) = self.pop_any()?;
        let (ty1, v1) = self.pop_any()?;
        let result = match annot {
            Some(t) => {
                if !ty1.matches(t) || !ty2.matches(t) {
                    bail!(self.fail("type mismatch in select arms"));
                }
                StackType::T(t)
            }
            None => {
                // The untyped form excludes references.
                for ty in [ty1, ty2] {
                    if let StackType::T(t) = ty {
                        if t.is_ref() {
                            bail!(self.fail("untyped select on reference type"));
                        }
                    }
                }
                match (ty1, ty2) {
                    (StackType::T(a), StackType::T(b)) if a != b => {
                        bail!(self.fail("type mismatch in select arms"))
                    }
                    (StackType::T(a), _) => StackType::T(a),
                    (_, StackType::T(b)) => StackType::T(b),
                    _ => StackType::Bottom,
                }
            }
        };
        match result {
            StackType::T(t) => self.push(t),
            StackType::Bottom => self.stack.push((StackType::Bottom, P::Value::default())),
        }
        Ok((cond, v1, v2, result))
    }

    // ---- locals and globals ----

    fn local_type(&self, index: u32) -> Result<ValType> {
        self.locals
            .get(index as usize)
            .copied()
            .ok_or_else(|| self.fail(format_args!("unknown local index {}", index)))
    }

    pub fn read_local_get(&mut self) -> Result<(u32, ValType)> {
        let index = self.d.read_var_u32()?;
        let ty = self.local_type(index)?;
        self.push(ty);
        Ok((index, ty))
    }

    pub fn read_local_set(&mut self) -> Result<(u32, P::Value)> {
        let index = self.d.read_var_u32()?;
        let ty = self.local_type(index)?;
        let v = self.pop_val(ty)?;
        Ok((index, v))
    }

    pub fn read_local_tee(&mut self) -> Result<(u32, P::Value)> {
        let index = self.d.read_var_u32()?;
        let ty = self.local_type(index)?;
        let v = self.pop_val(ty)?;
        self.stack.push((StackType::T(ty), v));
        Ok((index, v))
    }

    pub fn read_global_get(&mut self) -> Result<u32> {
        let index = self.d.read_var_u32()?;
        let ty = self.env.global(index)?.ty;
        self.push(ty);
        Ok(index)
    }

    pub fn read_global_set(&mut self) -> Result<(u32, P::Value)> {
        let index = self.d.read_var_u32()?;
        let g = self.env.global(index)?;
        if !g.mutable {
            bail!(self.fail(format_args!("global {} is immutable", index)));
        }
        let ty = g.ty;
        let v = self.pop_val(ty)?;
        Ok((index, v))
    }

    // ---- memory ----

    fn read_mem_arg_checked(&mut self, byte_size: u32, exact: bool) -> Result<MemArg> {
        let arg = self.d.read_mem_arg()?;
        let natural = byte_size.trailing_zeros();
        if arg.align > natural || (exact && arg.align != natural) {
            bail!(self.fail(format_args!(
                "invalid alignment 2^{} for {}-byte access",
                arg.align, byte_size
            )));
        }
        Ok(arg)
    }

    fn check_memory(&self) -> Result<()> {
        self.env.memory().map(|_| ()).map_err(|e| self.fail(e))
    }

    pub fn read_load(&mut self, result: ValType, byte_size: u32) -> Result<(MemArg, P::Value)> {
        self.check_memory()?;
        let arg = self.read_mem_arg_checked(byte_size, false)?;
        let addr = self.pop_val(ValType::I32)?;
        self.push(result);
        Ok((arg, addr))
    }

    pub fn read_store(
        &mut self,
        value_ty: ValType,
        byte_size: u32,
    ) -> Result<(MemArg, P::Value, P::Value)> {
        self.check_memory()?;
        let arg = self.read_mem_arg_checked(byte_size, false)?;
        let value = self.pop_val(value_ty)?;
        let addr = self.pop_val(ValType::I32)?;
        Ok((arg, addr, value))
    }

    fn read_memory_index(&mut self) -> Result<()> {
        let index = self.d.read_var_u32()?;
        if index != 0 {
            bail!(self.fail("multi-memory is not supported"));
        }
        Ok(())
    }

    pub fn read_memory_size(&mut self) -> Result<()> {
        self.check_memory()?;
        self.read_memory_index()?;
        self.push(ValType::I32);
        Ok(())
    }

    pub fn read_memory_grow(&mut self) -> Result<P::Value> {
        self.check_memory()?;
        self.read_memory_index()?;
        let delta = self.pop_val(ValType::I32)?;
        self.push(ValType::I32);
        Ok(delta)
    }

    // ---- atomics ----

    pub fn read_atomic_load(&mut self, result: ValType, byte_size: u32) -> Result<(MemArg, P::Value)> {
        self.check_memory()?;
        let arg = self.read_mem_arg_checked(byte_size, true)?;
        let addr = self.pop_val(ValType::I32)?;
        self.push(result);
        Ok((arg, addr))
    }

    pub fn read_atomic_store(
        &mut self,
        value_ty: ValType,
        byte_size: u32,
    ) -> Result<(MemArg, P::Value, P::Value)> {
        self.check_memory()?;
        let arg = self.read_mem_arg_checked(byte_size, true)?;
        let value = self.pop_val(value_ty)?;
        let addr = self.pop_val(ValType::I32)?;
        Ok((arg, addr, value))
    }

    pub fn read_atomic_rmw(
        &mut self,
        ty: ValType,
        byte_size: u32,
    ) -> Result<(MemArg, P::Value, P::Value)> {
        self.check_memory()?;
        let arg = self.read_mem_arg_checked(byte_size, true)?;
        let value = self.pop_val(ty)?;
        let addr = self.pop_val(ValType::I32)?;
        self.push(ty);
        Ok((arg, addr, value))
    }

    pub fn read_atomic_cmpxchg(
        &mut self,
        ty: ValType,
        byte_size: u32,
    ) -> Result<(MemArg, P::Value, P::Value, P::Value)> {
        self.check_memory()?;
        let arg = self.read_mem_arg_checked(byte_size, true)?;
        let replacement = self.pop_val(ty)?;
        let expected = self.pop_val(ty)?;
        let addr = self.pop_val(ValType::I32)?;
        self.push(ty);
        Ok((arg, addr, expected, replacement))
    }

    pub fn read_wait(
        &mut self,
        ty: ValType,
        byte_size: u32,
    ) -> Result<(MemArg, P::Value, P::Value, P::Value)> {
        self.check_memory()?;
        let arg = self.read_mem_arg_checked(byte_size, true)?;
        let timeout = self.pop_val(ValType::I64)?;
        let expected = self.pop_val(ty)?;
        let addr = self.pop_val(ValType::I32)?;
        self.push(ValType::I32);
        Ok((arg, addr, expected, timeout))
    }

    pub fn read_notify(&mut self) -> Result<(MemArg, P::Value, P::Value)> {
        self.check_memory()?;
        let arg = self.read_mem_arg_checked(4, true)?;
        let count = self.pop_val(ValType::I32)?;
        let addr = self.pop_val(ValType::I32)?;
        self.push(ValType::I32);
        Ok((arg, addr, count))
    }

    pub fn read_fence(&mut self) -> Result<()> {
        let flags = self.d.read_u8()?;
        if flags != 0 {
            bail!(self.fail("non-zero fence flags"));
        }
        Ok(())
    }

    // ---- bulk memory and tables ----

    fn check_data_segment(&self, index: u32) -> Result<()> {
        if let Some(count) = self.env.num_data_segments {
            if index >= count {
                bail!(self.fail(format_args!("unknown data segment {}", index)));
            }
        }
        Ok(())
    }

    fn check_elem_segment(&self, index: u32) -> Result<()> {
        if index >= self.env.num_elem_segments {
            bail!(self.fail(format_args!("unknown element segment {}", index)));
        }
        Ok(())
    }

    pub fn read_memory_copy(&mut self) -> Result<(P::Value, P::Value, P::Value)> {
        self.check_memory()?;
        self.read_memory_index()?;
        self.read_memory_index()?;
        let len = self.pop_val(ValType::I32)?;
        let src = self.pop_val(ValType::I32)?;
        let dst = self.pop_val(ValType::I32)?;
        Ok((dst, src, len))
    }

    pub fn read_memory_fill(&mut self) -> Result<(P::Value, P::Value, P::Value)> {
        self.check_memory()?;
        self.read_memory_index()?;
        let len = self.pop_val(ValType::I32)?;
        let value = self.pop_val(ValType::I32)?;
        let start = self.pop_val(ValType::I32)?;
        Ok((start, value, len))
    }

    pub fn read_memory_init(&mut self) -> Result<(u32, P::Value, P::Value, P::Value)> {
        let seg = self.d.read_var_u32()?;
        self.check_memory()?;
        self.read_memory_index()?;
        self.check_data_segment(seg)?;
        let len = self.pop_val(ValType::I32)?;
        let src = self.pop_val(ValType::I32)?;
        let dst = self.pop_val(ValType::I32)?;
        Ok((seg, dst, src, len))
    }

    pub fn read_data_drop(&mut self) -> Result<u32> {
        let seg = self.d.read_var_u32()?;
        self.check_data_segment(seg)?;
        Ok(seg)
    }

    pub fn read_table_copy(&mut self) -> Result<(u32, u32, P::Value, P::Value, P::Value)> {
        let dst_table = self.d.read_var_u32()?;
        let src_table = self.d.read_var_u32()?;
        self.env.table(dst_table)?;
        self.env.table(src_table)?;
        let len = self.pop_val(ValType::I32)?;
        let src = self.pop_val(ValType::I32)?;
        let dst = self.pop_val(ValType::I32)?;
        Ok((dst_table, src_table, dst, src, len))
    }

    pub fn read_table_init(&mut self) -> Result<(u32, u32, P::Value, P::Value, P::Value)> {
        let seg = self.d.read_var_u32()?;
        let table = self.d.read_var_u32()?;
        self.env.table(table)?;
        self.check_elem_segment(seg)?;
        let len = self.pop_val(ValType::I32)?;
        let src = self.pop_val(ValType::I32)?;
        let dst = self.pop_val(ValType::I32)?;
        Ok((seg, table, dst, src, len))
    }

    pub fn read_elem_drop(&mut self) -> Result<u32> {
        let seg = self.d.read_var_u32()?;
        self.check_elem_segment(seg)?;
        Ok(seg)
    }

    pub fn read_table_fill(&mut self) -> Result<(u32, P::Value, P::Value, P::Value)> {
        let table = self.d.read_var_u32()?;
        let elem_ty = self.env.table(table)?.elem_ty;
        let len = self.pop_val(ValType::I32)?;
        let value = self.pop_val(elem_ty)?;
        let start = self.pop_val(ValType::I32)?;
        Ok((table, start, value, len))
    }

    pub fn read_table_get(&mut self) -> Result<(u32, P::Value)> {
        let table = self.d.read_var_u32()?;
        let elem_ty = self.env.table(table)?.elem_ty;
        let index = self.pop_val(ValType::I32)?;
        self.push(elem_ty);
        Ok((table, index))
    }

    pub fn read_table_set(&mut self) -> Result<(u32, P::Value, P::Value)> {
        let table = self.d.read_var_u32()?;
        let elem_ty = self.env.table(table)?.elem_ty;
        let value = self.pop_val(elem_ty)?;
        let index = self.pop_val(ValType::I32)?;
        Ok((table, index, value))
    }

    pub fn read_table_grow(&mut self) -> Result<(u32, P::Value, P::Value)> {
        let table = self.d.read_var_u32()?;
        let elem_ty = self.env.table(table)?.elem_ty;
        let delta = self.pop_val(ValType::I32)?;
        let init = self.pop_val(elem_ty)?;
        self.push(ValType::I32);
        Ok((table, init, delta))
    }

    pub fn read_table_size(&mut self) -> Result<u32> {
        let table = self.d.read_var_u32()?;
        self.env.table(table)?;
        self.push(ValType::I32);
        Ok(table)
    }

    // ---- calls ----

    pub fn read_call(&mut self) -> Result<(u32, Vec<P::Value>)> {
        let index = self.d.read_var_u32()?;
        let sig = self.env.func_type(index).map_err(|e| self.fail(e))?.clone();
        let args = self.pop_values(&sig.params)?;
        if let Some(r) = sig.result() {
            self.push(r);
        }
        Ok((index, args))
    }

    pub fn read_call_indirect(&mut self) -> Result<(u32, u32, P::Value, Vec<P::Value>)> {
        let type_index = self.d.read_var_u32()?;
        let table_index = self.d.read_var_u32()?;
        let table = self.env.table(table_index).map_err(|e| self.fail(e))?;
        if !table.elem_ty.is_ref() {
            bail!(self.fail("call_indirect through a non-reference table"));
        }
        let sig = self.env.ty(type_index).map_err(|e| self.fail(e))?.clone();
        let index = self.pop_val(ValType::I32)?;
        let args = self.pop_values(&sig.params)?;
        if let Some(r) = sig.result() {
            self.push(r);
        }
        Ok((type_index, table_index, index, args))
    }

    // ---- structured control ----

    pub fn read_block(&mut self) -> Result<(FuncType, Vec<P::Value>)> {
        let bt = self.d.read_block_type()?;
        let sig = self.resolve_block_type(bt)?;
        let values = self.pop_values(&sig.params)?;
        self.push_frame(LabelKind::Block, sig.clone(), Vec::new());
        Ok((sig, values))
    }

    pub fn read_loop(&mut self) -> Result<(FuncType, Vec<P::Value>)> {
        let bt = self.d.read_block_type()?;
        let sig = self.resolve_block_type(bt)?;
        let values = self.pop_values(&sig.params)?;
        self.push_frame(LabelKind::Loop, sig.clone(), Vec::new());
        Ok((sig, values))
    }

    pub fn read_if(&mut self) -> Result<(FuncType, Vec<P::Value>, P::Value)> {
        let bt = self.d.read_block_type()?;
        let sig = self.resolve_block_type(bt)?;
        let cond = self.pop_val(ValType::I32)?;
        let values = self.pop_values(&sig.params)?;
        self.push_frame(LabelKind::Then, sig.clone(), values.clone());
        Ok((sig, values, cond))
    }

    /// Close the then-arm. Returns the then-arm's result values and the
    /// saved if-parameter values to seed the else-arm with.
    pub fn read_else(&mut self) -> Result<(FuncType, Vec<P::Value>, Vec<P::Value>)> {
        let kind = self.controls.last().map(|f| f.kind);
        if kind != Some(LabelKind::Then) {
            bail!(self.fail("else outside of if"));
        }
        let results: Vec<ValType> = self.controls.last().map(|f| f.results.clone()).unwrap_or_default();
        let result_values = self.pop_values(&results)?;
        let frame = self.controls.last_mut().ok_or_else(|| anyhow!("no frame"))?;
        if self.stack.len() != frame.height {
            bail!(
                "values remaining on stack at else at offset {}",
                self.d.last_opcode_offset()
            );
        }
        frame.kind = LabelKind::Else;
        frame.unreachable = false;
        let sig = FuncType::new(frame.params.clone(), frame.results.clone());
        let param_values = frame.param_values.clone();
        Ok((sig, result_values, param_values))
    }

    pub fn read_end(&mut self) -> Result<EndInfo<P>> {
        if self.controls.is_empty() {
            bail!(self.fail("end with no open label"));
        }
        if let Some(frame) = self.controls.last() {
            // An if without an else must be able to forward its params.
            if frame.kind == LabelKind::Then && frame.params != frame.results {
                bail!(self.fail("if without else requires matching params and results"));
            }
        }
        let results: Vec<ValType> = self.controls.last().map(|f| f.results.clone()).unwrap_or_default();
        let result_values = self.pop_values(&results)?;
        let frame = self.controls.pop().ok_or_else(|| anyhow!("no frame"))?;
        if self.stack.len() != frame.height {
            bail!(
                "values remaining on stack at end at offset {}",
                self.d.last_opcode_offset()
            );
        }
        Ok(EndInfo {
            kind: frame.kind,
            params: frame.params,
            results,
            result_values,
            param_values: frame.param_values,
            item: frame.item,
        })
    }

    // ---- branches ----

    pub fn read_br(&mut self) -> Result<(u32, Vec<ValType>, Vec<P::Value>)> {
        let depth = self.d.read_var_u32()?;
        let types = self.frame_at(depth)?.branch_arg_types().to_vec();
        let values = self.pop_values(&types)?;
        self.set_unreachable();
        Ok((depth, types, values))
    }

    pub fn read_br_if(&mut self) -> Result<(u32, Vec<ValType>, Vec<P::Value>, P::Value)> {
        let depth = self.d.read_var_u32()?;
        let cond = self.pop_val(ValType::I32)?;
        let types = self.frame_at(depth)?.branch_arg_types().to_vec();
        let values = self.pop_values(&types)?;
        // The branch arguments also flow into the fall-through path.
        self.push_operands(&types, &values);
        Ok((depth, types, values, cond))
    }

    pub fn read_br_table(&mut self) -> Result<(Vec<u32>, u32, Vec<ValType>, Vec<P::Value>, P::Value)> {
        let count = self.d.read_var_u32()?;
        let mut depths = Vec::with_capacity(count as usize);
        for _ in 0..count {
            depths.push(self.d.read_var_u32()?);
        }
        let default = self.d.read_var_u32()?;
        let types = self.frame_at(default)?.branch_arg_types().to_vec();
        for d in &depths {
            let other = self.frame_at(*d)?.branch_arg_types();
            if other != types.as_slice() {
                bail!(self.fail("br_table labels disagree on argument types"));
            }
        }
        let index = self.pop_val(ValType::I32)?;
        let values = self.pop_values(&types)?;
        self.set_unreachable();
        Ok((depths, default, types, values, index))
    }

    pub fn read_return(&mut self) -> Result<Vec<P::Value>> {
        let types = self.controls[0].results.clone();
        let values = self.pop_values(&types)?;
        self.set_unreachable();
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Decoder;
    use crate::env::{Features, ModuleEnv, Target};

    #[derive(Debug)]
    struct TestPolicy;

    impl OpIterPolicy for TestPolicy {
        type Value = Option<u32>;
        type ControlItem = Option<u32>;
    }

    fn iter<'a>(env: &'a ModuleEnv, bytes: &'a [u8]) -> OpIter<'a, TestPolicy> {
        OpIter::new(Decoder::new(bytes), env, vec![ValType::I32], Vec::new())
    }

    fn env() -> ModuleEnv {
        ModuleEnv::new(Features::default(), Target::default())
    }

    #[test]
    fn binary_pops_two_pushes_one() {
        let env = env();
        // i32.const 1; i32.const 2; i32.add
        let bytes = [0x41, 0x01, 0x41, 0x02, 0x6A];
        let mut it = iter(&env, &bytes);
        it.read_opcode().unwrap();
        assert_eq!(it.read_i32_const().unwrap(), 1);
        it.set_result(Some(10));
        it.read_opcode().unwrap();
        assert_eq!(it.read_i32_const().unwrap(), 2);
        it.set_result(Some(11));
        it.read_opcode().unwrap();
        let (lhs, rhs) = it.read_binary(ValType::I32).unwrap();
        assert_eq!(lhs, Some(10));
        assert_eq!(rhs, Some(11));
    }

    #[test]
    fn binary_underflow_is_an_error() {
        let env = env();
        let bytes = [0x41, 0x01, 0x6A];
        let mut it = iter(&env, &bytes);
        it.read_opcode().unwrap();
        it.read_i32_const().unwrap();
        it.read_opcode().unwrap();
        let err = it.read_binary(ValType::I32).unwrap_err();
        assert!(err.to_string().contains("underflow"), "{}", err);
    }

    #[test]
    fn type_mismatch_reports_offset() {
        let env = env();
        // i64.const 1; then try to read it as the operand of an i32 unary.
        let bytes = [0x42, 0x01, 0x45];
        let mut it = iter(&env, &bytes);
        it.read_opcode().unwrap();
        it.read_i64_const().unwrap();
        it.read_opcode().unwrap();
        let err = it.read_compare_zero_stub();
        let err = err.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("type mismatch"), "{}", msg);
        assert!(msg.contains("offset 2"), "{}", msg);
    }

    impl<'a> OpIter<'a, TestPolicy> {
        fn read_compare_zero_stub(&mut self) -> Result<Option<u32>> {
            let v = self.pop_val(ValType::I32)?;
            self.push(ValType::I32);
            Ok(v)
        }
    }

    #[test]
    fn unreachable_code_pops_bottom() {
        let env = env();
        let bytes = [0x00, 0x6A];
        let mut it = iter(&env, &bytes);
        it.read_opcode().unwrap();
        it.read_unreachable().unwrap();
        assert!(it.in_unreachable_code());
        // Polymorphic stack: an add validates even with nothing pushed.
        it.read_opcode().unwrap();
        let (lhs, rhs) = it.read_binary(ValType::I32).unwrap();
        assert_eq!(lhs, None);
        assert_eq!(rhs, None);
    }

    #[test]
    fn unknown_label_depth_is_an_error() {
        let env = env();
        // br 5 with only the body frame open.
        let bytes = [0x0C, 0x05];
        let mut it = iter(&env, &bytes);
        it.read_opcode().unwrap();
        let err = it.read_br().unwrap_err();
        assert!(err.to_string().contains("unknown label depth"), "{}", err);
    }

    #[test]
    fn br_if_keeps_branch_args_for_fallthrough() {
        let env = env();
        // block (result i32) is frame-managed by the caller; emulate with
        // the body frame taking no results and a depth-0 br_if with none.
        let bytes = [0x41, 0x07, 0x0D, 0x00];
        let mut it = iter(&env, &bytes);
        it.read_opcode().unwrap();
        it.read_i32_const().unwrap();
        it.set_result(Some(7));
        it.read_opcode().unwrap();
        // Condition is the constant; body label has no branch args.
        let (_, types, values, cond) = it.read_br_if().unwrap();
        assert!(types.is_empty());
        assert!(values.is_empty());
        assert_eq!(cond, Some(7));
    }

    #[test]
    fn block_end_round_trip() {
        let env = env();
        // block (empty) end
        let bytes = [0x02, 0x40, 0x0B];
        let mut it = iter(&env, &bytes);
        it.read_opcode().unwrap();
        let (sig, values) = it.read_block().unwrap();
        assert!(sig.params.is_empty());
        assert!(values.is_empty());
        assert_eq!(it.control_depth(), 2);
        it.read_opcode().unwrap();
        let end = it.read_end().unwrap();
        assert_eq!(end.kind, LabelKind::Block);
        assert_eq!(it.control_depth(), 1);
    }

    #[test]
    fn end_rejects_leftover_values() {
        let env = env();
        // block (empty) with a stray constant before end.
        let bytes = [0x02, 0x40, 0x41, 0x01, 0x0B];
        let mut it = iter(&env, &bytes);
        it.read_opcode().unwrap();
        it.read_block().unwrap();
        it.read_opcode().unwrap();
        it.read_i32_const().unwrap();
        it.read_opcode().unwrap();
        let err = it.read_end().unwrap_err();
        assert!(err.to_string().contains("values remaining"), "{}", err);
    }

    #[test]
    fn atomic_alignment_must_be_exact() {
        let mut env = env();
        env.memory = Some(crate::env::MemoryDesc {
            initial_pages: 1,
            maximum_pages: None,
            shared: true,
        });
        // addr const, then atomic load with align exponent 1 (should be 2).
        let bytes = [0x41, 0x00, 0x01, 0x00];
        let mut it = iter(&env, &bytes);
        it.read_opcode().unwrap();
        it.read_i32_const().unwrap();
        let err = it.read_atomic_load(ValType::I32, 4).unwrap_err();
        assert!(err.to_string().contains("alignment"), "{}", err);
    }

    #[test]
    fn load_alignment_may_be_smaller_not_larger() {
        let mut env = env();
        env.memory = Some(crate::env::MemoryDesc {
            initial_pages: 1,
            maximum_pages: None,
            shared: false,
        });
        let bytes = [0x41, 0x00, 0x01, 0x00, 0x41, 0x00, 0x03, 0x00];
        let mut it = iter(&env, &bytes);
        it.read_opcode().unwrap();
        it.read_i32_const().unwrap();
        assert!(it.read_load(ValType::I32, 4).is_ok());
        it.read_opcode().unwrap();
        it.read_i32_const().unwrap();
        let err = it.read_load(ValType::I32, 4).unwrap_err();
        assert!(err.to_string().contains("alignment"), "{}", err);
    }

    #[test]
    fn global_set_requires_mutability() {
        let mut env = env();
        env.globals.push(crate::env::GlobalDesc {
            ty: ValType::I32,
            mutable: false,
            indirect: false,
            tls_offset: 16,
        });
        let bytes = [0x41, 0x01, 0x24, 0x00];
        let mut it = iter(&env, &bytes);
        it.read_opcode().unwrap();
        it.read_i32_const().unwrap();
        it.read_opcode().unwrap();
        let err = it.read_global_set().unwrap_err();
        assert!(err.to_string().contains("immutable"), "{}", err);
    }
}
