//! Lowering of linear-memory and table operators.
//!
//! Every plain access funnels through [`FunctionCompiler::prepare_access`],
//! which establishes the layered address discipline:
//!
//! 1. a constant base folds into the access offset while the sum stays
//!    under the offset-guard limit;
//! 2. atomic accesses fold the offset into the pointer and get a dynamic
//!    alignment check over the whole address;
//! 3. an offset at or past the guard limit becomes an explicit checked
//!    `AddOffset`;
//! 4. the index is bounds-checked against the TLS limit unless huge memory
//!    makes the guard pages absorb every 32-bit index, and under Spectre
//!    masking the checked index replaces the original;
//! 5. the heap base pointer is loaded from TLS and attached to the access.
//!
//! Short `memory.copy` / `memory.fill` with a constant length expand to
//! straight-line loads and stores instead of a builtin call: widest chunks
//! first in ascending offset order for the loads, the stores then issued
//! in reverse. Everything else goes to the matching builtin instance call.

use super::FunctionCompiler;
use crate::env::Builtin;
use crate::mir::{
    Atomicity, BinOp, ConstVal, InsId, InsKind, MemoryAccessDesc, MirType, RmwOp, Scalar,
    ValType,
};
use anyhow::Result;

/// Longest `memory.copy` expanded inline, in bytes.
pub const MAX_INLINE_MEMORY_COPY_LENGTH: u32 = 64;
/// Longest `memory.fill` expanded inline, in bytes.
pub const MAX_INLINE_MEMORY_FILL_LENGTH: u32 = 32;

/// Split `len` bytes into naturally-aligned power-of-two chunks, widest
/// first, ascending offsets.
fn chunk_sizes(len: u32, widest: u32) -> Vec<(u32, u32)> {
    let mut out = Vec::new();
    let mut off = 0;
    while off < len {
        let remaining = len - off;
        let mut size = widest;
        while size > remaining {
            size /= 2;
        }
        out.push((off, size));
        off += size;
    }
    out
}

fn copy_scalar(size: u32) -> Scalar {
    match size {
        1 => Scalar::U8,
        2 => Scalar::U16,
        4 => Scalar::I32,
        _ => Scalar::I64,
    }
}

fn copy_mir(size: u32) -> MirType {
    if size == 8 {
        MirType::Int64
    } else {
        MirType::Int32
    }
}

impl<'a> FunctionCompiler<'a> {
    fn const_u32(&self, v: InsId) -> Option<u32> {
        match self.graph.ins(v).kind {
            InsKind::Const(ConstVal::I32(c)) => Some(c as u32),
            _ => None,
        }
    }

    fn load_tls_field(&mut self, offset: u32, ty: MirType) -> Result<InsId> {
        let r = self.add(InsKind::LoadTls { offset }, Some(ty));
        self.expect_val(r)
    }

    /// The layered address pipeline; see the module comment.
    fn prepare_access(
        &mut self,
        access: &mut MemoryAccessDesc,
        mut base: InsId,
    ) -> Result<(InsId, Option<InsId>)> {
        let guard = self.env.offset_guard_limit();

        if let InsKind::Const(ConstVal::I32(c)) = self.graph.ins(base).kind {
            let c = c as u32 as u64;
            if access.offset + c < guard {
                access.offset += c;
                let zero = self.constant(ConstVal::I32(0));
                base = self.expect_val(zero)?;
            }
        }

        if access.is_atomic() && access.offset > 0 {
            let r = self.add(
                InsKind::AddOffset {
                    base,
                    offset: access.offset,
                    bytecode_offset: access.bytecode_offset,
                },
                Some(MirType::Int32),
            );
            base = self.expect_val(r)?;
            access.offset = 0;
        }
        if access.is_atomic() && access.byte_size() > 1 {
            self.add(
                InsKind::AlignmentCheck {
                    addr: base,
                    byte_size: access.byte_size(),
                    bytecode_offset: access.bytecode_offset,
                },
                None,
            );
        }

        if access.offset >= guard {
            let r = self.add(
                InsKind::AddOffset {
                    base,
                    offset: access.offset,
                    bytecode_offset: access.bytecode_offset,
                },
                Some(MirType::Int32),
            );
            base = self.expect_val(r)?;
            access.offset = 0;
        }

        if !self.env.features.huge_memory {
            let limit = self.load_tls_field(self.env.tls.bounds_check_limit, MirType::Int32)?;
            let check = self.add(
                InsKind::BoundsCheck {
                    index: base,
                    limit,
                    bytecode_offset: access.bytecode_offset,
                },
                Some(MirType::Int32),
            );
            let check = self.expect_val(check)?;
            if self.env.features.spectre_index_masking {
                base = check;
            }
        }

        let memory_base = self.load_tls_field(self.env.tls.memory_base, MirType::Pointer)?;
        Ok((base, Some(memory_base)))
    }

    // ---- plain loads and stores ----

    pub(super) fn emit_load(&mut self, scalar: Scalar, result: ValType) -> Result<()> {
        let off = self.bytecode_offset();
        let (arg, addr) = self.iter.read_load(result, scalar.byte_size())?;
        if self.in_dead_code() {
            return Ok(());
        }
        let addr = self.expect_val(addr)?;
        let mut access = MemoryAccessDesc::new(scalar, arg.align, arg.offset, off);
        let (base, memory_base) = self.prepare_access(&mut access, addr)?;
        let r = self.add(
            InsKind::Load {
                access,
                base,
                memory_base,
            },
            Some(result.to_mir()),
        );
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_store(&mut self, scalar: Scalar, value_ty: ValType) -> Result<()> {
        let off = self.bytecode_offset();
        let (arg, addr, value) = self.iter.read_store(value_ty, scalar.byte_size())?;
        if self.in_dead_code() {
            return Ok(());
        }
        let addr = self.expect_val(addr)?;
        let value = self.expect_val(value)?;
        let mut access = MemoryAccessDesc::new(scalar, arg.align, arg.offset, off);
        let (base, memory_base) = self.prepare_access(&mut access, addr)?;
        self.add(
            InsKind::Store {
                access,
                base,
                value,
                memory_base,
            },
            None,
        );
        Ok(())
    }

    pub(super) fn emit_memory_size(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        self.iter.read_memory_size()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let r = self.builtin_instance_call(Builtin::MemorySize, &[], off)?;
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_memory_grow(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let delta = self.iter.read_memory_grow()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let delta = self.expect_val(delta)?;
        let r = self.builtin_instance_call(Builtin::MemoryGrow, &[delta], off)?;
        self.iter.set_result(r);
        Ok(())
    }

    // ---- atomics ----

    /// Narrow atomics on i64 operate on the low 32 bits.
    fn wrap_narrow_i64(&mut self, ty: ValType, scalar: Scalar, v: InsId) -> Result<InsId> {
        if ty == ValType::I64 && scalar.byte_size() < 8 {
            let r = self.add(InsKind::WrapI64 { val: v }, Some(MirType::Int32));
            return self.expect_val(r);
        }
        Ok(v)
    }

    fn extend_narrow_i64(
        &mut self,
        ty: ValType,
        scalar: Scalar,
        v: Option<InsId>,
    ) -> Result<Option<InsId>> {
        if ty == ValType::I64 && scalar.byte_size() < 8 {
            let v = self.expect_val(v)?;
            return Ok(self.add(
                InsKind::ExtendI32 {
                    val: v,
                    unsigned: true,
                },
                Some(MirType::Int64),
            ));
        }
        Ok(v)
    }

    pub(super) fn emit_atomic_load(&mut self, scalar: Scalar, result: ValType) -> Result<()> {
        let off = self.bytecode_offset();
        let (arg, addr) = self.iter.read_atomic_load(result, scalar.byte_size())?;
        if self.in_dead_code() {
            return Ok(());
        }
        let addr = self.expect_val(addr)?;
        let mut access =
            MemoryAccessDesc::atomic(scalar, arg.align, arg.offset, off, Atomicity::Load);
        let (base, memory_base) = self.prepare_access(&mut access, addr)?;
        let r = self.add(
            InsKind::Load {
                access,
                base,
                memory_base,
            },
            Some(result.to_mir()),
        );
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_atomic_store(&mut self, scalar: Scalar, value_ty: ValType) -> Result<()> {
        let off = self.bytecode_offset();
        let (arg, addr, value) = self.iter.read_atomic_store(value_ty, scalar.byte_size())?;
        if self.in_dead_code() {
            return Ok(());
        }
        let addr = self.expect_val(addr)?;
        let value = self.expect_val(value)?;
        let value = self.wrap_narrow_i64(value_ty, scalar, value)?;
        let mut access =
            MemoryAccessDesc::atomic(scalar, arg.align, arg.offset, off, Atomicity::Store);
        let (base, memory_base) = self.prepare_access(&mut access, addr)?;
        self.add(
            InsKind::Store {
                access,
                base,
                value,
                memory_base,
            },
            None,
        );
        Ok(())
    }

    pub(super) fn emit_atomic_rmw(
        &mut self,
        ty: ValType,
        scalar: Scalar,
        op: RmwOp,
    ) -> Result<()> {
        let off = self.bytecode_offset();
        let (arg, addr, value) = self.iter.read_atomic_rmw(ty, scalar.byte_size())?;
        if self.in_dead_code() {
            return Ok(());
        }
        let addr = self.expect_val(addr)?;
        let value = self.expect_val(value)?;
        let value = self.wrap_narrow_i64(ty, scalar, value)?;
        let mut access =
            MemoryAccessDesc::atomic(scalar, arg.align, arg.offset, off, Atomicity::Full);
        let (base, memory_base) = self.prepare_access(&mut access, addr)?;
        let narrow = ty == ValType::I64 && scalar.byte_size() < 8;
        let result_ty = if narrow { MirType::Int32 } else { ty.to_mir() };
        let r = self.add(
            InsKind::AtomicRmw {
                access,
                op,
                base,
                value,
                memory_base,
            },
            Some(result_ty),
        );
        let r = self.extend_narrow_i64(ty, scalar, r)?;
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_atomic_cmpxchg(&mut self, ty: ValType, scalar: Scalar) -> Result<()> {
        let off = self.bytecode_offset();
        let (arg, addr, expected, replacement) =
            self.iter.read_atomic_cmpxchg(ty, scalar.byte_size())?;
        if self.in_dead_code() {
            return Ok(());
        }
        let addr = self.expect_val(addr)?;
        let expected = self.expect_val(expected)?;
        let replacement = self.expect_val(replacement)?;
        let expected = self.wrap_narrow_i64(ty, scalar, expected)?;
        let replacement = self.wrap_narrow_i64(ty, scalar, replacement)?;
        let mut access =
            MemoryAccessDesc::atomic(scalar, arg.align, arg.offset, off, Atomicity::Full);
        let (base, memory_base) = self.prepare_access(&mut access, addr)?;
        let narrow = ty == ValType::I64 && scalar.byte_size() < 8;
        let result_ty = if narrow { MirType::Int32 } else { ty.to_mir() };
        let r = self.add(
            InsKind::AtomicCmpXchg {
                access,
                base,
                expected,
                replacement,
                memory_base,
            },
            Some(result_ty),
        );
        let r = self.extend_narrow_i64(ty, scalar, r)?;
        self.iter.set_result(r);
        Ok(())
    }

    /// Effective byte address for the wait/notify builtins: explicit offset
    /// add plus a dynamic alignment check; the builtin bounds-checks.
    fn wait_address(&mut self, addr: InsId, offset: u64, byte_size: u32, off: u32) -> Result<InsId> {
        let mut addr = addr;
        if offset > 0 {
            let r = self.add(
                InsKind::AddOffset {
                    base: addr,
                    offset,
                    bytecode_offset: off,
                },
                Some(MirType::Int32),
            );
            addr = self.expect_val(r)?;
        }
        self.add(
            InsKind::AlignmentCheck {
                addr,
                byte_size,
                bytecode_offset: off,
            },
            None,
        );
        Ok(addr)
    }

    pub(super) fn emit_wait(&mut self, ty: ValType) -> Result<()> {
        let off = self.bytecode_offset();
        let byte_size = if ty == ValType::I32 { 4 } else { 8 };
        let (arg, addr, expected, timeout) = self.iter.read_wait(ty, byte_size)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let addr = self.expect_val(addr)?;
        let expected = self.expect_val(expected)?;
        let timeout = self.expect_val(timeout)?;
        let addr = self.wait_address(addr, arg.offset, byte_size, off)?;
        let builtin = if ty == ValType::I32 {
            Builtin::WaitI32
        } else {
            Builtin::WaitI64
        };
        let r = self.builtin_instance_call(builtin, &[addr, expected, timeout], off)?;
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_notify(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (arg, addr, count) = self.iter.read_notify()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let addr = self.expect_val(addr)?;
        let count = self.expect_val(count)?;
        let addr = self.wait_address(addr, arg.offset, 4, off)?;
        let r = self.builtin_instance_call(Builtin::Wake, &[addr, count], off)?;
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_fence(&mut self) -> Result<()> {
        self.iter.read_fence()?;
        if self.in_dead_code() {
            return Ok(());
        }
        self.add(InsKind::Fence, None);
        Ok(())
    }

    // ---- bulk memory ----

    pub(super) fn emit_memory_copy(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (dst, src, len) = self.iter.read_memory_copy()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let dst = self.expect_val(dst)?;
        let src = self.expect_val(src)?;
        let len = self.expect_val(len)?;
        if let Some(n) = self.const_u32(len) {
            if n > 0
                && n <= MAX_INLINE_MEMORY_COPY_LENGTH
                && self.env.target.fast_unaligned_access
            {
                return self.inline_memcpy(dst, src, n, off);
            }
        }
        let builtin = if self.env.uses_shared_memory() {
            Builtin::MemCopyShared
        } else {
            Builtin::MemCopy
        };
        let membase = self.load_tls_field(self.env.tls.memory_base, MirType::Pointer)?;
        self.builtin_instance_call(builtin, &[dst, src, len, membase], off)?;
        Ok(())
    }

    /// Straight-line copy: all loads issued first (ascending offsets), then
    /// the stores in reverse, so overlapping ranges behave like memmove.
    fn inline_memcpy(&mut self, dst: InsId, src: InsId, len: u32, off: u32) -> Result<()> {
        let widest = if self.env.target.pointer_64 { 8 } else { 4 };
        let chunks = chunk_sizes(len, widest);

        let mut loaded = Vec::with_capacity(chunks.len());
        for &(delta, size) in &chunks {
            let scalar = copy_scalar(size);
            let mut access =
                MemoryAccessDesc::new(scalar, size.trailing_zeros(), delta as u64, off);
            let (base, memory_base) = self.prepare_access(&mut access, src)?;
            let l = self.add(
                InsKind::Load {
                    access,
                    base,
                    memory_base,
                },
                Some(copy_mir(size)),
            );
            loaded.push((delta, size, self.expect_val(l)?));
        }
        for &(delta, size, value) in loaded.iter().rev() {
            let scalar = copy_scalar(size);
            let mut access =
                MemoryAccessDesc::new(scalar, size.trailing_zeros(), delta as u64, off);
            let (base, memory_base) = self.prepare_access(&mut access, dst)?;
            self.add(
                InsKind::Store {
                    access,
                    base,
                    value,
                    memory_base,
                },
                None,
            );
        }
        Ok(())
    }

    pub(super) fn emit_memory_fill(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (start, value, len) = self.iter.read_memory_fill()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let start = self.expect_val(start)?;
        let value = self.expect_val(value)?;
        let len = self.expect_val(len)?;
        if let Some(n) = self.const_u32(len) {
            if n > 0
                && n <= MAX_INLINE_MEMORY_FILL_LENGTH
                && self.env.target.fast_unaligned_access
            {
                return self.inline_memfill(start, value, n, off);
            }
        }
        let builtin = if self.env.uses_shared_memory() {
            Builtin::MemFillShared
        } else {
            Builtin::MemFill
        };
        let membase = self.load_tls_field(self.env.tls.memory_base, MirType::Pointer)?;
        self.builtin_instance_call(builtin, &[start, value, len, membase], off)?;
        Ok(())
    }

    /// Straight-line fill: the byte value is splatted to each chunk width
    /// by multiplication, stores issued widest-last (descending offsets).
    fn inline_memfill(&mut self, start: InsId, value: InsId, len: u32, off: u32) -> Result<()> {
        let widest = if self.env.target.pointer_64 { 8 } else { 4 };
        let chunks = chunk_sizes(len, widest);

        let mask = self.constant(ConstVal::I32(0xFF));
        let mask = self.expect_val(mask)?;
        let byte = self.add(
            InsKind::Binary {
                op: BinOp::And,
                lhs: value,
                rhs: mask,
                preserve_nan: false,
            },
            Some(MirType::Int32),
        );
        let byte = self.expect_val(byte)?;

        // One splat per chunk width, built on demand.
        let mut splats: [Option<InsId>; 4] = [None; 4];
        for &(_, size) in &chunks {
            let slot = size.trailing_zeros() as usize;
            if splats[slot].is_some() {
                continue;
            }
            let splat = match size {
                1 => byte,
                2 => self.splat_mul(byte, ConstVal::I32(0x0101), MirType::Int32)?,
                4 => self.splat_mul(byte, ConstVal::I32(0x0101_0101), MirType::Int32)?,
                _ => {
                    let wide = self.add(
                        InsKind::ExtendI32 {
                            val: byte,
                            unsigned: true,
                        },
                        Some(MirType::Int64),
                    );
                    let wide = self.expect_val(wide)?;
                    self.splat_mul(wide, ConstVal::I64(0x0101_0101_0101_0101), MirType::Int64)?
                }
            };
            splats[slot] = Some(splat);
        }

        for &(delta, size) in chunks.iter().rev() {
            let scalar = copy_scalar(size);
            let mut access =
                MemoryAccessDesc::new(scalar, size.trailing_zeros(), delta as u64, off);
            let (base, memory_base) = self.prepare_access(&mut access, start)?;
            let value = splats[size.trailing_zeros() as usize]
                .ok_or_else(|| anyhow::anyhow!("internal: missing fill splat"))?;
            self.add(
                InsKind::Store {
                    access,
                    base,
                    value,
                    memory_base,
                },
                None,
            );
        }
        Ok(())
    }

    fn splat_mul(&mut self, v: InsId, factor: ConstVal, ty: MirType) -> Result<InsId> {
        let factor = self.constant(factor);
        let factor = self.expect_val(factor)?;
        let r = self.add(
            InsKind::Binary {
                op: BinOp::Mul,
                lhs: v,
                rhs: factor,
                preserve_nan: false,
            },
            Some(ty),
        );
        self.expect_val(r)
    }

    pub(super) fn emit_memory_init(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (seg, dst, src, len) = self.iter.read_memory_init()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let dst = self.expect_val(dst)?;
        let src = self.expect_val(src)?;
        let len = self.expect_val(len)?;
        let seg = self.constant(ConstVal::I32(seg as i32));
        let seg = self.expect_val(seg)?;
        self.builtin_instance_call(Builtin::MemInit, &[dst, src, len, seg], off)?;
        Ok(())
    }

    pub(super) fn emit_data_drop(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let seg = self.iter.read_data_drop()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let seg = self.constant(ConstVal::I32(seg as i32));
        let seg = self.expect_val(seg)?;
        self.builtin_instance_call(Builtin::DataDrop, &[seg], off)?;
        Ok(())
    }

    // ---- tables ----

    fn table_const(&mut self, index: u32) -> Result<InsId> {
        let c = self.constant(ConstVal::I32(index as i32));
        self.expect_val(c)
    }

    pub(super) fn emit_table_get(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (table, index) = self.iter.read_table_get()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let index = self.expect_val(index)?;
        let table = self.table_const(table)?;
        let r = self.builtin_instance_call(Builtin::TableGet, &[table, index], off)?;
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_table_set(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (table, index, value) = self.iter.read_table_set()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let index = self.expect_val(index)?;
        let value = self.expect_val(value)?;
        let table = self.table_const(table)?;
        self.builtin_instance_call(Builtin::TableSet, &[table, value, index], off)?;
        Ok(())
    }

    pub(super) fn emit_table_grow(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (table, init, delta) = self.iter.read_table_grow()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let init = self.expect_val(init)?;
        let delta = self.expect_val(delta)?;
        let table = self.table_const(table)?;
        let r = self.builtin_instance_call(Builtin::TableGrow, &[init, delta, table], off)?;
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_table_size(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let table = self.iter.read_table_size()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let table = self.table_const(table)?;
        let r = self.builtin_instance_call(Builtin::TableSize, &[table], off)?;
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_table_fill(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (table, start, value, len) = self.iter.read_table_fill()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let start = self.expect_val(start)?;
        let value = self.expect_val(value)?;
        let len = self.expect_val(len)?;
        let table = self.table_const(table)?;
        self.builtin_instance_call(Builtin::TableFill, &[start, value, len, table], off)?;
        Ok(())
    }

    pub(super) fn emit_table_copy(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (dst_table, src_table, dst, src, len) = self.iter.read_table_copy()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let dst = self.expect_val(dst)?;
        let src = self.expect_val(src)?;
        let len = self.expect_val(len)?;
        let dst_table = self.table_const(dst_table)?;
        let src_table = self.table_const(src_table)?;
        self.builtin_instance_call(
            Builtin::TableCopy,
            &[dst, src, len, dst_table, src_table],
            off,
        )?;
        Ok(())
    }

    pub(super) fn emit_table_init(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (seg, table, dst, src, len) = self.iter.read_table_init()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let dst = self.expect_val(dst)?;
        let src = self.expect_val(src)?;
        let len = self.expect_val(len)?;
        let seg = self.table_const(seg)?;
        let table = self.table_const(table)?;
        self.builtin_instance_call(Builtin::TableInit, &[dst, src, len, seg, table], off)?;
        Ok(())
    }

    pub(super) fn emit_elem_drop(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let seg = self.iter.read_elem_drop()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let seg = self.table_const(seg)?;
        self.builtin_instance_call(Builtin::ElemDrop, &[seg], off)?;
        Ok(())
    }
}
