//! # Function compiler
//!
//! Translates one validated WebAssembly function body into a [`MirGraph`].
//!
//! ## Pipeline overview
//!
//! ```text
//! body bytes
//!      │
//!      ▼
//!  Decoder ──► OpIter (validates, pops typed operands)
//!                 │
//!                 ▼
//!          FunctionCompiler
//!            ├── numeric: constants, arithmetic, conversions, compares
//!            ├── memory:  loads/stores, atomics, bulk memory
//!            ├── calls:   direct/import/indirect/builtin calls, ABI
//!            └── control: blocks, loops, if/else, branches, patch table
//!                 │
//!                 ▼
//!             MirGraph ──► backend (external)
//! ```
//!
//! The compiler walks the byte stream strictly forward. Dead code (after a
//! branch, return, or trap) is modelled by clearing the current block:
//! every emission helper then becomes a nop returning no SSA identity while
//! the op iterator keeps validating with its polymorphic stack.

mod calls;
mod control;
mod memory;
mod numeric;

use crate::abi::AbiArgGenerator;
use crate::decode::{ops, Decoder, Opcode};
use crate::env::{FuncCompileInput, FuncType, ModuleEnv};
use crate::mir::{
    BinOp, BlockId, CmpOp, CompareType, ConstVal, InsId, InsKind, MirGraph, MirType, RmwOp, Scalar,
    Terminator, UnOp, ValType,
};
use crate::validate::{OpIter, OpIterPolicy};
use anyhow::{anyhow, bail, Context, Result};
use control::ControlFlowPatch;
use log::{debug, trace};

/// Policy binding the op iterator to this front-end: stack values carry the
/// SSA identity (`None` in dead code), control entries carry a [`Control`].
pub struct CompilerPolicy;

impl OpIterPolicy for CompilerPolicy {
    type Value = Option<InsId>;
    type ControlItem = Control;
}

/// Per-label front-end state: the loop header for loops, the pending else
/// block for ifs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Control {
    pub block: Option<BlockId>,
}

/// Compile one function body against a module environment.
pub fn compile_function<'a>(env: &'a ModuleEnv, input: FuncCompileInput<'a>) -> Result<MirGraph> {
    let mut d = Decoder::new(input.body);
    let decls = d.read_local_decls().context("reading local declarations")?;
    let sig = env.func_type(input.index)?.clone();
    let mut locals = sig.params.clone();
    locals.extend(decls);

    debug!(
        "compiling function {}: {} bytes, {} locals",
        input.index,
        input.body.len(),
        locals.len()
    );

    let iter = OpIter::new(d, env, locals.clone(), sig.results.clone());
    let mut f = FunctionCompiler::new(env, iter, locals, input.index);
    f.init(&sig)?;
    f.run()?;
    let graph = f.finish()?;

    debug!(
        "function {}: {} blocks, {} instructions, {} stack-arg bytes",
        input.index,
        graph.num_blocks(),
        graph.num_ins(),
        graph.max_stack_arg_bytes
    );
    Ok(graph)
}

pub struct FunctionCompiler<'a> {
    env: &'a ModuleEnv,
    iter: OpIter<'a, CompilerPolicy>,
    graph: MirGraph,
    locals: Vec<ValType>,
    /// `None` while compiling dead code.
    curr: Option<BlockId>,
    /// Pending-branch patch table, one level per open label.
    block_patches: Vec<Vec<ControlFlowPatch>>,
    loop_depth: u32,
    tls_pointer: InsId,
}

impl<'a> FunctionCompiler<'a> {
    fn new(
        env: &'a ModuleEnv,
        iter: OpIter<'a, CompilerPolicy>,
        locals: Vec<ValType>,
        func_index: u32,
    ) -> Self {
        Self {
            env,
            iter,
            graph: MirGraph::new(func_index),
            locals,
            curr: None,
            block_patches: Vec::new(),
            loop_depth: 0,
            tls_pointer: InsId(0),
        }
    }

    /// Build the entry block: parameter nodes with their ABI placements, the
    /// TLS-pointer parameter, zero/null initialisers for declared locals,
    /// and the entry interrupt check.
    fn init(&mut self, sig: &FuncType) -> Result<()> {
        let entry = self.graph.new_block(0, Vec::new());
        self.graph.entry = entry;
        self.curr = Some(entry);

        let mut abi = AbiArgGenerator::new(self.env.target);
        let mut slots = Vec::with_capacity(self.locals.len());
        for (i, ty) in sig.params.iter().enumerate() {
            let mir = ty.to_mir();
            let placement = abi.next(mir);
            let id = self.graph.alloc(
                InsKind::Param {
                    index: i as u32,
                    abi: placement,
                },
                Some(mir),
            );
            self.graph.block_mut(entry).instructions.push(id);
            slots.push(id);
        }

        let tls = self.graph.alloc(InsKind::TlsPointer, Some(MirType::Pointer));
        self.graph.block_mut(entry).instructions.push(tls);
        self.tls_pointer = tls;

        for i in sig.params.len()..self.locals.len() {
            // Reference-typed locals (typed null references included) start
            // as the ordinary null-ref constant.
            let c = match self.locals[i] {
                ValType::I32 => ConstVal::I32(0),
                ValType::I64 => ConstVal::I64(0),
                ValType::F32 => ConstVal::F32(0),
                ValType::F64 => ConstVal::F64(0),
                ValType::FuncRef | ValType::AnyRef | ValType::TypedRef(_) => ConstVal::NullRef,
            };
            let id = self.graph.alloc(InsKind::Const(c), Some(c.ty()));
            self.graph.block_mut(entry).instructions.push(id);
            slots.push(id);
        }
        self.graph.block_mut(entry).slots = slots;

        self.add(InsKind::InterruptCheck { bytecode_offset: 0 }, None);

        // Patch level for the function-body label.
        self.block_patches.push(Vec::new());
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        while !self.iter.done() {
            let op = self.iter.read_opcode()?;
            trace!(
                "op 0x{:02x}{} at offset {}",
                op.primary,
                op.sub.map(|s| format!(" 0x{:02x}", s)).unwrap_or_default(),
                self.iter.bytecode_offset()
            );
            self.emit_op(op)?;
        }
        self.iter.check_exhausted()
    }

    fn finish(self) -> Result<MirGraph> {
        for (depth, patches) in self.block_patches.iter().enumerate() {
            if !patches.is_empty() {
                bail!("internal: unbound branches left at label depth {}", depth);
            }
        }
        if self.curr.is_some() {
            bail!("internal: function body fell off the end without a terminator");
        }
        Ok(self.graph)
    }

    // ---- core emission ----

    fn in_dead_code(&self) -> bool {
        self.curr.is_none()
    }

    /// Append one instruction to the current block; nop in dead code.
    fn add(&mut self, kind: InsKind, ty: Option<MirType>) -> Option<InsId> {
        let b = self.curr?;
        debug_assert!(!self.graph.block(b).is_terminated());
        let id = self.graph.alloc(kind, ty);
        self.graph.block_mut(b).instructions.push(id);
        Some(id)
    }

    fn constant(&mut self, c: ConstVal) -> Option<InsId> {
        self.add(InsKind::Const(c), Some(c.ty()))
    }

    /// In live code every stack value carries an SSA identity.
    fn expect_val(&self, v: Option<InsId>) -> Result<InsId> {
        v.ok_or_else(|| anyhow!("internal: missing SSA value in live code"))
    }

    fn set_terminator(&mut self, t: Terminator) {
        if let Some(b) = self.curr {
            debug_assert!(!self.graph.block(b).is_terminated());
            self.graph.block_mut(b).terminator = Some(t);
        }
    }

    fn bytecode_offset(&self) -> u32 {
        self.iter.bytecode_offset()
    }

    // ---- locals and globals ----

    fn emit_local_get(&mut self) -> Result<()> {
        let (index, _) = self.iter.read_local_get()?;
        if let Some(b) = self.curr {
            let v = self.graph.block(b).slots[index as usize];
            self.iter.set_result(Some(v));
        }
        Ok(())
    }

    fn emit_local_set(&mut self) -> Result<()> {
        let (index, v) = self.iter.read_local_set()?;
        if let Some(b) = self.curr {
            let v = self.expect_val(v)?;
            self.graph.block_mut(b).slots[index as usize] = v;
        }
        Ok(())
    }

    fn emit_local_tee(&mut self) -> Result<()> {
        let (index, v) = self.iter.read_local_tee()?;
        if let Some(b) = self.curr {
            let v = self.expect_val(v)?;
            self.graph.block_mut(b).slots[index as usize] = v;
        }
        Ok(())
    }

    fn emit_global_get(&mut self) -> Result<()> {
        let index = self.iter.read_global_get()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let g = self.env.global(index)?.clone();
        let mir = g.ty.to_mir();
        let result = if g.indirect {
            // Imported-mutable globals live behind a pointer cell.
            let cell = self.add(
                InsKind::LoadTls {
                    offset: g.tls_offset,
                },
                Some(MirType::Pointer),
            );
            let cell = self.expect_val(cell)?;
            self.add(InsKind::LoadCell { ptr: cell }, Some(mir))
        } else {
            self.add(
                InsKind::LoadTls {
                    offset: g.tls_offset,
                },
                Some(mir),
            )
        };
        self.iter.set_result(result);
        Ok(())
    }

    fn emit_global_set(&mut self) -> Result<()> {
        let (index, v) = self.iter.read_global_set()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let v = self.expect_val(v)?;
        let g = self.env.global(index)?.clone();
        if g.ty.is_ref() {
            // Reference stores go through the cell pointer and are followed
            // by the runtime write barrier.
            let cell = if g.indirect {
                self.add(
                    InsKind::LoadTls {
                        offset: g.tls_offset,
                    },
                    Some(MirType::Pointer),
                )
            } else {
                self.add(
                    InsKind::DerivedPointer {
                        base: self.tls_pointer,
                        offset: g.tls_offset,
                    },
                    Some(MirType::Pointer),
                )
            };
            let cell = self.expect_val(cell)?;
            self.add(InsKind::StoreCell { ptr: cell, value: v }, None);
            self.post_barrier(cell)?;
        } else if g.indirect {
            let cell = self.add(
                InsKind::LoadTls {
                    offset: g.tls_offset,
                },
                Some(MirType::Pointer),
            );
            let cell = self.expect_val(cell)?;
            self.add(InsKind::StoreCell { ptr: cell, value: v }, None);
        } else {
            self.add(
                InsKind::StoreTls {
                    offset: g.tls_offset,
                    value: v,
                },
                None,
            );
        }
        Ok(())
    }

    // ---- dispatch ----

    fn emit_op(&mut self, op: Opcode) -> Result<()> {
        use CompareType as CT;
        use ValType::{F32, F64, I32, I64};

        match op.primary {
            ops::UNREACHABLE => self.emit_unreachable(),
            ops::NOP => self.iter.read_nop(),
            ops::BLOCK => self.emit_block(),
            ops::LOOP => self.emit_loop(),
            ops::IF => self.emit_if(),
            ops::ELSE => self.emit_else(),
            ops::END => self.emit_end(),
            ops::BR => self.emit_br(),
            ops::BR_IF => self.emit_br_if(),
            ops::BR_TABLE => self.emit_br_table(),
            ops::RETURN => self.emit_return(),
            ops::CALL => self.emit_call(),
            ops::CALL_INDIRECT => self.emit_call_indirect(),

            ops::DROP => self.emit_drop(),
            ops::SELECT => self.emit_select(false),
            ops::SELECT_T => {
                if !self.env.features.ref_types {
                    return Err(self.iter.unrecognized_opcode(op));
                }
                self.emit_select(true)
            }

            ops::LOCAL_GET => self.emit_local_get(),
            ops::LOCAL_SET => self.emit_local_set(),
            ops::LOCAL_TEE => self.emit_local_tee(),
            ops::GLOBAL_GET => self.emit_global_get(),
            ops::GLOBAL_SET => self.emit_global_set(),
            ops::TABLE_GET | ops::TABLE_SET => {
                if !self.env.features.ref_types {
                    return Err(self.iter.unrecognized_opcode(op));
                }
                if op.primary == ops::TABLE_GET {
                    self.emit_table_get()
                } else {
                    self.emit_table_set()
                }
            }

            ops::I32_LOAD => self.emit_load(Scalar::I32, I32),
            ops::I64_LOAD => self.emit_load(Scalar::I64, I64),
            ops::F32_LOAD => self.emit_load(Scalar::F32, F32),
            ops::F64_LOAD => self.emit_load(Scalar::F64, F64),
            ops::I32_LOAD8_S => self.emit_load(Scalar::I8, I32),
            ops::I32_LOAD8_U => self.emit_load(Scalar::U8, I32),
            ops::I32_LOAD16_S => self.emit_load(Scalar::I16, I32),
            ops::I32_LOAD16_U => self.emit_load(Scalar::U16, I32),
            ops::I64_LOAD8_S => self.emit_load(Scalar::I8, I64),
            ops::I64_LOAD8_U => self.emit_load(Scalar::U8, I64),
            ops::I64_LOAD16_S => self.emit_load(Scalar::I16, I64),
            ops::I64_LOAD16_U => self.emit_load(Scalar::U16, I64),
            ops::I64_LOAD32_S => self.emit_load(Scalar::I32, I64),
            ops::I64_LOAD32_U => self.emit_load(Scalar::U32, I64),
            ops::I32_STORE => self.emit_store(Scalar::I32, I32),
            ops::I64_STORE => self.emit_store(Scalar::I64, I64),
            ops::F32_STORE => self.emit_store(Scalar::F32, F32),
            ops::F64_STORE => self.emit_store(Scalar::F64, F64),
            ops::I32_STORE8 => self.emit_store(Scalar::U8, I32),
            ops::I32_STORE16 => self.emit_store(Scalar::U16, I32),
            ops::I64_STORE8 => self.emit_store(Scalar::U8, I64),
            ops::I64_STORE16 => self.emit_store(Scalar::U16, I64),
            ops::I64_STORE32 => self.emit_store(Scalar::U32, I64),
            ops::MEMORY_SIZE => self.emit_memory_size(),
            ops::MEMORY_GROW => self.emit_memory_grow(),

            ops::I32_CONST => self.emit_i32_const(),
            ops::I64_CONST => self.emit_i64_const(),
            ops::F32_CONST => self.emit_f32_const(),
            ops::F64_CONST => self.emit_f64_const(),

            ops::I32_EQZ => self.emit_eqz(I32),
            ops::I32_EQ => self.emit_compare(I32, CmpOp::Eq, CT::Int32),
            ops::I32_NE => self.emit_compare(I32, CmpOp::Ne, CT::Int32),
            ops::I32_LT_S => self.emit_compare(I32, CmpOp::Lt, CT::Int32),
            ops::I32_LT_U => self.emit_compare(I32, CmpOp::Lt, CT::UInt32),
            ops::I32_GT_S => self.emit_compare(I32, CmpOp::Gt, CT::Int32),
            ops::I32_GT_U => self.emit_compare(I32, CmpOp::Gt, CT::UInt32),
            ops::I32_LE_S => self.emit_compare(I32, CmpOp::Le, CT::Int32),
            ops::I32_LE_U => self.emit_compare(I32, CmpOp::Le, CT::UInt32),
            ops::I32_GE_S => self.emit_compare(I32, CmpOp::Ge, CT::Int32),
            ops::I32_GE_U => self.emit_compare(I32, CmpOp::Ge, CT::UInt32),

            ops::I64_EQZ => self.emit_eqz(I64),
            ops::I64_EQ => self.emit_compare(I64, CmpOp::Eq, CT::Int64),
            ops::I64_NE => self.emit_compare(I64, CmpOp::Ne, CT::Int64),
            ops::I64_LT_S => self.emit_compare(I64, CmpOp::Lt, CT::Int64),
            ops::I64_LT_U => self.emit_compare(I64, CmpOp::Lt, CT::UInt64),
            ops::I64_GT_S => self.emit_compare(I64, CmpOp::Gt, CT::Int64),
            ops::I64_GT_U => self.emit_compare(I64, CmpOp::Gt, CT::UInt64),
            ops::I64_LE_S => self.emit_compare(I64, CmpOp::Le, CT::Int64),
            ops::I64_LE_U => self.emit_compare(I64, CmpOp::Le, CT::UInt64),
            ops::I64_GE_S => self.emit_compare(I64, CmpOp::Ge, CT::Int64),
            ops::I64_GE_U => self.emit_compare(I64, CmpOp::Ge, CT::UInt64),

            ops::F32_EQ => self.emit_compare(F32, CmpOp::Eq, CT::Float32),
            ops::F32_NE => self.emit_compare(F32, CmpOp::Ne, CT::Float32),
            ops::F32_LT => self.emit_compare(F32, CmpOp::Lt, CT::Float32),
            ops::F32_GT => self.emit_compare(F32, CmpOp::Gt, CT::Float32),
            ops::F32_LE => self.emit_compare(F32, CmpOp::Le, CT::Float32),
            ops::F32_GE => self.emit_compare(F32, CmpOp::Ge, CT::Float32),
            ops::F64_EQ => self.emit_compare(F64, CmpOp::Eq, CT::Double),
            ops::F64_NE => self.emit_compare(F64, CmpOp::Ne, CT::Double),
            ops::F64_LT => self.emit_compare(F64, CmpOp::Lt, CT::Double),
            ops::F64_GT => self.emit_compare(F64, CmpOp::Gt, CT::Double),
            ops::F64_LE => self.emit_compare(F64, CmpOp::Le, CT::Double),
            ops::F64_GE => self.emit_compare(F64, CmpOp::Ge, CT::Double),

            ops::I32_CLZ => self.emit_unary(I32, UnOp::Clz),
            ops::I32_CTZ => self.emit_unary(I32, UnOp::Ctz),
            ops::I32_POPCNT => self.emit_unary(I32, UnOp::Popcnt),
            ops::I32_ADD => self.emit_binary(I32, BinOp::Add),
            ops::I32_SUB => self.emit_binary(I32, BinOp::Sub),
            ops::I32_MUL => self.emit_binary(I32, BinOp::Mul),
            ops::I32_DIV_S => self.emit_div(I32, false),
            ops::I32_DIV_U => self.emit_div(I32, true),
            ops::I32_REM_S => self.emit_rem(I32, false),
            ops::I32_REM_U => self.emit_rem(I32, true),
            ops::I32_AND => self.emit_binary(I32, BinOp::And),
            ops::I32_OR => self.emit_binary(I32, BinOp::Or),
            ops::I32_XOR => self.emit_binary(I32, BinOp::Xor),
            ops::I32_SHL => self.emit_binary(I32, BinOp::Shl),
            ops::I32_SHR_S => self.emit_binary(I32, BinOp::ShrS),
            ops::I32_SHR_U => self.emit_binary(I32, BinOp::ShrU),
            ops::I32_ROTL => self.emit_binary(I32, BinOp::Rotl),
            ops::I32_ROTR => self.emit_binary(I32, BinOp::Rotr),

            ops::I64_CLZ => self.emit_unary(I64, UnOp::Clz),
            ops::I64_CTZ => self.emit_unary(I64, UnOp::Ctz),
            ops::I64_POPCNT => self.emit_unary(I64, UnOp::Popcnt),
            ops::I64_ADD => self.emit_binary(I64, BinOp::Add),
            ops::I64_SUB => self.emit_binary(I64, BinOp::Sub),
            ops::I64_MUL => self.emit_binary(I64, BinOp::Mul),
            ops::I64_DIV_S => self.emit_div(I64, false),
            ops::I64_DIV_U => self.emit_div(I64, true),
            ops::I64_REM_S => self.emit_rem(I64, false),
            ops::I64_REM_U => self.emit_rem(I64, true),
            ops::I64_AND => self.emit_binary(I64, BinOp::And),
            ops::I64_OR => self.emit_binary(I64, BinOp::Or),
            ops::I64_XOR => self.emit_binary(I64, BinOp::Xor),
            ops::I64_SHL => self.emit_binary(I64, BinOp::Shl),
            ops::I64_SHR_S => self.emit_binary(I64, BinOp::ShrS),
            ops::I64_SHR_U => self.emit_binary(I64, BinOp::ShrU),
            ops::I64_ROTL => self.emit_binary(I64, BinOp::Rotl),
            ops::I64_ROTR => self.emit_binary(I64, BinOp::Rotr),

            ops::F32_ABS => self.emit_unary(F32, UnOp::Abs),
            ops::F32_NEG => self.emit_unary(F32, UnOp::Neg),
            ops::F32_CEIL => self.emit_float_round(F32, UnOp::Ceil),
            ops::F32_FLOOR => self.emit_float_round(F32, UnOp::Floor),
            ops::F32_TRUNC => self.emit_float_round(F32, UnOp::Trunc),
            ops::F32_NEAREST => self.emit_float_round(F32, UnOp::Nearest),
            ops::F32_SQRT => self.emit_unary(F32, UnOp::Sqrt),
            ops::F32_ADD => self.emit_binary(F32, BinOp::Add),
            ops::F32_SUB => self.emit_binary(F32, BinOp::Sub),
            ops::F32_MUL => self.emit_binary(F32, BinOp::Mul),
            ops::F32_DIV => self.emit_binary(F32, BinOp::Div),
            ops::F32_MIN => self.emit_min_max(F32, false),
            ops::F32_MAX => self.emit_min_max(F32, true),
            ops::F32_COPYSIGN => self.emit_binary(F32, BinOp::CopySign),

            ops::F64_ABS => self.emit_unary(F64, UnOp::Abs),
            ops::F64_NEG => self.emit_unary(F64, UnOp::Neg),
            ops::F64_CEIL => self.emit_float_round(F64, UnOp::Ceil),
            ops::F64_FLOOR => self.emit_float_round(F64, UnOp::Floor),
            ops::F64_TRUNC => self.emit_float_round(F64, UnOp::Trunc),
            ops::F64_NEAREST => self.emit_float_round(F64, UnOp::Nearest),
            ops::F64_SQRT => self.emit_unary(F64, UnOp::Sqrt),
            ops::F64_ADD => self.emit_binary(F64, BinOp::Add),
            ops::F64_SUB => self.emit_binary(F64, BinOp::Sub),
            ops::F64_MUL => self.emit_binary(F64, BinOp::Mul),
            ops::F64_DIV => self.emit_binary(F64, BinOp::Div),
            ops::F64_MIN => self.emit_min_max(F64, false),
            ops::F64_MAX => self.emit_min_max(F64, true),
            ops::F64_COPYSIGN => self.emit_binary(F64, BinOp::CopySign),

            ops::I32_WRAP_I64 => self.emit_wrap_i64(),
            ops::I32_TRUNC_F32_S => self.emit_trunc_to_int(F32, I32, false, false),
            ops::I32_TRUNC_F32_U => self.emit_trunc_to_int(F32, I32, true, false),
            ops::I32_TRUNC_F64_S => self.emit_trunc_to_int(F64, I32, false, false),
            ops::I32_TRUNC_F64_U => self.emit_trunc_to_int(F64, I32, true, false),
            ops::I64_EXTEND_I32_S => self.emit_extend_i32(false),
            ops::I64_EXTEND_I32_U => self.emit_extend_i32(true),
            ops::I64_TRUNC_F32_S => self.emit_trunc_to_int(F32, I64, false, false),
            ops::I64_TRUNC_F32_U => self.emit_trunc_to_int(F32, I64, true, false),
            ops::I64_TRUNC_F64_S => self.emit_trunc_to_int(F64, I64, false, false),
            ops::I64_TRUNC_F64_U => self.emit_trunc_to_int(F64, I64, true, false),
            ops::F32_CONVERT_I32_S => self.emit_convert_from_int(I32, F32, false),
            ops::F32_CONVERT_I32_U => self.emit_convert_from_int(I32, F32, true),
            ops::F32_CONVERT_I64_S => self.emit_convert_from_int(I64, F32, false),
            ops::F32_CONVERT_I64_U => self.emit_convert_from_int(I64, F32, true),
            ops::F32_DEMOTE_F64 => self.emit_float_to_float(F64, F32),
            ops::F64_CONVERT_I32_S => self.emit_convert_from_int(I32, F64, false),
            ops::F64_CONVERT_I32_U => self.emit_convert_from_int(I32, F64, true),
            ops::F64_CONVERT_I64_S => self.emit_convert_from_int(I64, F64, false),
            ops::F64_CONVERT_I64_U => self.emit_convert_from_int(I64, F64, true),
            ops::F64_PROMOTE_F32 => self.emit_float_to_float(F32, F64),
            ops::I32_REINTERPRET_F32 => self.emit_reinterpret(F32, I32),
            ops::I64_REINTERPRET_F64 => self.emit_reinterpret(F64, I64),
            ops::F32_REINTERPRET_I32 => self.emit_reinterpret(I32, F32),
            ops::F64_REINTERPRET_I64 => self.emit_reinterpret(I64, F64),

            ops::I32_EXTEND8_S => self.emit_sign_extend(I32, 8),
            ops::I32_EXTEND16_S => self.emit_sign_extend(I32, 16),
            ops::I64_EXTEND8_S => self.emit_sign_extend(I64, 8),
            ops::I64_EXTEND16_S => self.emit_sign_extend(I64, 16),
            ops::I64_EXTEND32_S => self.emit_sign_extend(I64, 32),

            ops::REF_NULL | ops::REF_IS_NULL | ops::REF_FUNC => {
                if !self.env.features.ref_types {
                    return Err(self.iter.unrecognized_opcode(op));
                }
                match op.primary {
                    ops::REF_NULL => self.emit_ref_null(),
                    ops::REF_IS_NULL => self.emit_ref_is_null(),
                    _ => self.emit_ref_func(),
                }
            }

            ops::MISC_PREFIX => self.emit_misc_op(op),
            ops::THREAD_PREFIX => self.emit_thread_op(op),
            ops::MOZ_PREFIX => self.emit_moz_op(op),
            ops::GC_PREFIX | ops::SIMD_PREFIX => Err(self.iter.unrecognized_opcode(op)),

            _ => Err(self.iter.unrecognized_opcode(op)),
        }
    }

    fn emit_misc_op(&mut self, op: Opcode) -> Result<()> {
        use ValType::{F32, F64, I32, I64};
        let sub = op.sub.unwrap_or(u32::MAX);
        match sub {
            ops::I32_TRUNC_SAT_F32_S => self.emit_trunc_to_int(F32, I32, false, true),
            ops::I32_TRUNC_SAT_F32_U => self.emit_trunc_to_int(F32, I32, true, true),
            ops::I32_TRUNC_SAT_F64_S => self.emit_trunc_to_int(F64, I32, false, true),
            ops::I32_TRUNC_SAT_F64_U => self.emit_trunc_to_int(F64, I32, true, true),
            ops::I64_TRUNC_SAT_F32_S => self.emit_trunc_to_int(F32, I64, false, true),
            ops::I64_TRUNC_SAT_F32_U => self.emit_trunc_to_int(F32, I64, true, true),
            ops::I64_TRUNC_SAT_F64_S => self.emit_trunc_to_int(F64, I64, false, true),
            ops::I64_TRUNC_SAT_F64_U => self.emit_trunc_to_int(F64, I64, true, true),
            ops::MEMORY_INIT
            | ops::DATA_DROP
            | ops::MEMORY_COPY
            | ops::MEMORY_FILL
            | ops::TABLE_INIT
            | ops::ELEM_DROP
            | ops::TABLE_COPY => {
                if !self.env.bulk_memory_enabled() {
                    return Err(self.iter.unrecognized_opcode(op));
                }
                match sub {
                    ops::MEMORY_INIT => self.emit_memory_init(),
                    ops::DATA_DROP => self.emit_data_drop(),
                    ops::MEMORY_COPY => self.emit_memory_copy(),
                    ops::MEMORY_FILL => self.emit_memory_fill(),
                    ops::TABLE_INIT => self.emit_table_init(),
                    ops::ELEM_DROP => self.emit_elem_drop(),
                    _ => self.emit_table_copy(),
                }
            }
            ops::TABLE_GROW | ops::TABLE_SIZE | ops::TABLE_FILL => {
                if !self.env.features.ref_types {
                    return Err(self.iter.unrecognized_opcode(op));
                }
                match sub {
                    ops::TABLE_GROW => self.emit_table_grow(),
                    ops::TABLE_SIZE => self.emit_table_size(),
                    _ => self.emit_table_fill(),
                }
            }
            _ => Err(self.iter.unrecognized_opcode(op)),
        }
    }

    fn emit_thread_op(&mut self, op: Opcode) -> Result<()> {
        use ValType::{I32, I64};
        if !self.env.features.threads {
            return Err(self.iter.unrecognized_opcode(op));
        }
        let sub = op.sub.unwrap_or(u32::MAX);
        match sub {
            ops::MEMORY_ATOMIC_NOTIFY => self.emit_notify(),
            ops::MEMORY_ATOMIC_WAIT32 => self.emit_wait(I32),
            ops::MEMORY_ATOMIC_WAIT64 => self.emit_wait(I64),
            ops::ATOMIC_FENCE => self.emit_fence(),

            ops::I32_ATOMIC_LOAD => self.emit_atomic_load(Scalar::I32, I32),
            ops::I64_ATOMIC_LOAD => self.emit_atomic_load(Scalar::I64, I64),
            ops::I32_ATOMIC_LOAD8_U => self.emit_atomic_load(Scalar::U8, I32),
            ops::I32_ATOMIC_LOAD16_U => self.emit_atomic_load(Scalar::U16, I32),
            ops::I64_ATOMIC_LOAD8_U => self.emit_atomic_load(Scalar::U8, I64),
            ops::I64_ATOMIC_LOAD16_U => self.emit_atomic_load(Scalar::U16, I64),
            ops::I64_ATOMIC_LOAD32_U => self.emit_atomic_load(Scalar::U32, I64),
            ops::I32_ATOMIC_STORE => self.emit_atomic_store(Scalar::I32, I32),
            ops::I64_ATOMIC_STORE => self.emit_atomic_store(Scalar::I64, I64),
            ops::I32_ATOMIC_STORE8 => self.emit_atomic_store(Scalar::U8, I32),
            ops::I32_ATOMIC_STORE16 => self.emit_atomic_store(Scalar::U16, I32),
            ops::I64_ATOMIC_STORE8 => self.emit_atomic_store(Scalar::U8, I64),
            ops::I64_ATOMIC_STORE16 => self.emit_atomic_store(Scalar::U16, I64),
            ops::I64_ATOMIC_STORE32 => self.emit_atomic_store(Scalar::U32, I64),

            s if (ops::ATOMIC_RMW_FIRST..ops::ATOMIC_CMPXCHG_FIRST).contains(&s) => {
                let rel = s - ops::ATOMIC_RMW_FIRST;
                let rmw_op = match rel / 7 {
                    0 => RmwOp::Add,
                    1 => RmwOp::Sub,
                    2 => RmwOp::And,
                    3 => RmwOp::Or,
                    4 => RmwOp::Xor,
                    _ => RmwOp::Xchg,
                };
                let (ty, scalar) = thread_op_width(rel % 7);
                self.emit_atomic_rmw(ty, scalar, rmw_op)
            }
            s if (ops::ATOMIC_CMPXCHG_FIRST..=ops::ATOMIC_CMPXCHG_LAST).contains(&s) => {
                let (ty, scalar) = thread_op_width(s - ops::ATOMIC_CMPXCHG_FIRST);
                self.emit_atomic_cmpxchg(ty, scalar)
            }
            _ => Err(self.iter.unrecognized_opcode(op)),
        }
    }

    fn emit_moz_op(&mut self, op: Opcode) -> Result<()> {
        use ValType::I32;
        if !self.env.features.asm_js {
            return Err(self.iter.unrecognized_opcode(op));
        }
        match op.sub.unwrap_or(u32::MAX) {
            ops::MOZ_I32_MIN => self.emit_min_max(I32, false),
            ops::MOZ_I32_MAX => self.emit_min_max(I32, true),
            ops::MOZ_I32_NEG => self.emit_unary(I32, UnOp::Neg),
            ops::MOZ_I32_BITNOT => self.emit_unary(I32, UnOp::BitNot),
            ops::MOZ_I32_ABS => self.emit_unary(I32, UnOp::Abs),
            _ => Err(self.iter.unrecognized_opcode(op)),
        }
    }
}

/// Member layout shared by the atomic RMW and cmpxchg groups:
/// i32, i64, i32 narrow (8/16), i64 narrow (8/16/32).
fn thread_op_width(member: u32) -> (ValType, Scalar) {
    match member {
        0 => (ValType::I32, Scalar::I32),
        1 => (ValType::I64, Scalar::I64),
        2 => (ValType::I32, Scalar::U8),
        3 => (ValType::I32, Scalar::U16),
        4 => (ValType::I64, Scalar::U8),
        5 => (ValType::I64, Scalar::U16),
        _ => (ValType::I64, Scalar::U32),
    }
}
