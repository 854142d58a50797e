//! MIR: the typed SSA graph produced from WebAssembly function bodies.
//!
//! Instructions live in a per-function arena (`MirGraph`) and refer to each
//! other by index (`InsId`), never by pointer, so the cycles that phis form
//! with their own block's predecessors arise naturally through indices.
//! A basic block is an ordered list of phis, then ordinary instructions,
//! then exactly one terminator. Blocks are append-only while pending;
//! once a terminator is set, no further instructions may be added.

use crate::abi::AbiArg;
use crate::env::Builtin;
use std::fmt;

/// WebAssembly value types as seen by the validator and builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    FuncRef,
    AnyRef,
    /// Reference to a declared structural type (by type-table index).
    TypedRef(u32),
}

impl ValType {
    /// Total mapping into the MIR type lattice, fixed at system-init time.
    pub fn to_mir(self) -> MirType {
        match self {
            ValType::I32 => MirType::Int32,
            ValType::I64 => MirType::Int64,
            ValType::F32 => MirType::Float32,
            ValType::F64 => MirType::Double,
            ValType::FuncRef | ValType::AnyRef | ValType::TypedRef(_) => MirType::RefOrNull,
        }
    }

    pub fn is_ref(self) -> bool {
        matches!(self, ValType::FuncRef | ValType::AnyRef | ValType::TypedRef(_))
    }
}

impl fmt::Display for ValType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValType::I32 => write!(f, "i32"),
            ValType::I64 => write!(f, "i64"),
            ValType::F32 => write!(f, "f32"),
            ValType::F64 => write!(f, "f64"),
            ValType::FuncRef => write!(f, "funcref"),
            ValType::AnyRef => write!(f, "anyref"),
            ValType::TypedRef(i) => write!(f, "(ref {})", i),
        }
    }
}

/// The MIR type lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirType {
    Int32,
    Int64,
    Float32,
    Double,
    /// Native-pointer width integer.
    Pointer,
    RefOrNull,
}

impl fmt::Display for MirType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirType::Int32 => write!(f, "i32"),
            MirType::Int64 => write!(f, "i64"),
            MirType::Float32 => write!(f, "f32"),
            MirType::Double => write!(f, "f64"),
            MirType::Pointer => write!(f, "ptr"),
            MirType::RefOrNull => write!(f, "ref"),
        }
    }
}

/// Arena index of an instruction. Never reused within one compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InsId(pub u32);

impl fmt::Display for InsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Arena index of a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Constant payloads. Floats are stored as bit patterns so that constants
/// compare exactly (NaN payloads included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstVal {
    I32(i32),
    I64(i64),
    F32(u32),
    F64(u64),
    NullRef,
}

impl ConstVal {
    pub fn ty(self) -> MirType {
        match self {
            ConstVal::I32(_) => MirType::Int32,
            ConstVal::I64(_) => MirType::Int64,
            ConstVal::F32(_) => MirType::Float32,
            ConstVal::F64(_) => MirType::Double,
            ConstVal::NullRef => MirType::RefOrNull,
        }
    }
}

/// Two-operand arithmetic and bitwise operations. Integer division and
/// remainder are separate node kinds because they carry trap semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    /// Float division only; integer division is `DivInt`.
    Div,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
    CopySign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Clz,
    Ctz,
    Popcnt,
    Neg,
    Abs,
    Sqrt,
    BitNot,
    Ceil,
    Floor,
    Trunc,
    Nearest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// The compare-type tag carried by compare nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareType {
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float32,
    Double,
    RefOrNull,
}

/// Read-modify-write flavours for atomic accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmwOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Xchg,
}

/// Memory-ordering discipline attached to an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Atomicity {
    None,
    Load,
    Store,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    Unreachable,
}

/// Scalar storage types for linear-memory accesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scalar {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    F32,
    F64,
}

impl Scalar {
    pub fn byte_size(self) -> u32 {
        match self {
            Scalar::I8 | Scalar::U8 => 1,
            Scalar::I16 | Scalar::U16 => 2,
            Scalar::I32 | Scalar::U32 | Scalar::F32 => 4,
            Scalar::I64 | Scalar::F64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(self, Scalar::F32 | Scalar::F64)
    }
}

/// Everything the lowering needs to know about one linear-memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryAccessDesc {
    pub ty: Scalar,
    /// Alignment hint as a power-of-two exponent.
    pub align: u32,
    pub offset: u64,
    /// Bytecode offset of the operator, for trap attribution.
    pub bytecode_offset: u32,
    pub atomicity: Atomicity,
}

impl MemoryAccessDesc {
    pub fn new(ty: Scalar, align: u32, offset: u64, bytecode_offset: u32) -> Self {
        Self {
            ty,
            align,
            offset,
            bytecode_offset,
            atomicity: Atomicity::None,
        }
    }

    pub fn atomic(ty: Scalar, align: u32, offset: u64, bytecode_offset: u32, order: Atomicity) -> Self {
        Self {
            ty,
            align,
            offset,
            bytecode_offset,
            atomicity: order,
        }
    }

    pub fn byte_size(&self) -> u32 {
        self.ty.byte_size()
    }

    pub fn is_atomic(&self) -> bool {
        self.atomicity != Atomicity::None
    }
}

/// Alias-set bits used by load/store nodes so later phases know which
/// memory operations may interfere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasSet(pub u32);

impl AliasSet {
    pub const NONE: AliasSet = AliasSet(0);
    pub const HEAP: AliasSet = AliasSet(1 << 0);
    pub const TLS: AliasSet = AliasSet(1 << 1);
    pub const GLOBAL_CELL: AliasSet = AliasSet(1 << 2);
    pub const STACK_ARG: AliasSet = AliasSet(1 << 3);
    pub const ANY: AliasSet = AliasSet(!0);

    pub fn intersects(self, other: AliasSet) -> bool {
        self.0 & other.0 != 0
    }
}

/// Call targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callee {
    /// Module-defined function, by index.
    Func(u32),
    /// Imported function; the code pointer lives in a TLS slot.
    Import { tls_slot: u32 },
    /// Indirect call through a table, with a dynamic index operand.
    Indirect {
        type_index: u32,
        table_index: u32,
        index: InsId,
    },
    /// Builtin instance method; receives the instance pointer first.
    Builtin(Builtin),
}

/// A call node: argument placements as computed by the ABI helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallIns {
    pub callee: Callee,
    pub reg_args: Vec<(crate::abi::Reg, InsId)>,
    /// `StackArg` nodes, low offset first.
    pub stack_args: Vec<InsId>,
    /// The trailing TLS-pointer register argument.
    pub tls: Option<InsId>,
    pub stack_bytes: u32,
    pub bytecode_offset: u32,
}

/// The closed set of SSA node kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum InsKind {
    /// Incoming function argument with its ABI placement.
    Param { index: u32, abi: AbiArg },
    /// The implicit thread-local-state pointer argument.
    TlsPointer,
    Const(ConstVal),

    Binary {
        op: BinOp,
        lhs: InsId,
        rhs: InsId,
        /// Forbids the backend from folding `x - 0.0` / `x * 1.0`; those
        /// identities would drop the quieting of signalling NaNs.
        preserve_nan: bool,
    },
    DivInt {
        lhs: InsId,
        rhs: InsId,
        unsigned: bool,
        /// Trap on divide-by-zero and INT_MIN / -1; false in the asm.js dialect.
        trap_on_error: bool,
    },
    RemInt {
        lhs: InsId,
        rhs: InsId,
        unsigned: bool,
        trap_on_error: bool,
    },
    MinMax {
        lhs: InsId,
        rhs: InsId,
        is_max: bool,
    },
    Unary {
        op: UnOp,
        val: InsId,
    },
    Compare {
        op: CmpOp,
        cmp_ty: CompareType,
        lhs: InsId,
        rhs: InsId,
    },
    Select {
        cond: InsId,
        on_true: InsId,
        on_false: InsId,
    },

    /// i64.extend_i32_s / _u.
    ExtendI32 { val: InsId, unsigned: bool },
    /// i32.wrap_i64; distinct from bit-reinterpretation.
    WrapI64 { val: InsId },
    /// extend8_s / extend16_s / extend32_s.
    SignExtend { val: InsId, from_bits: u8 },
    /// Reinterpret an Int32-typed value as signed; inserted under signed
    /// 32-bit div/rem operands so prior unsigned-shift results read as signed.
    TruncateToInt32 { val: InsId },
    /// Float to integer; non-saturating forms trap on NaN and out-of-range.
    TruncToInt {
        val: InsId,
        unsigned: bool,
        saturating: bool,
        bytecode_offset: u32,
    },
    ConvertFromInt { val: InsId, unsigned: bool },
    /// promote_f32 / demote_f64; the result type names the target.
    FloatToFloat { val: InsId },
    Reinterpret { val: InsId },

    /// One input per predecessor, in predecessor order.
    Phi { inputs: Vec<InsId> },

    Load {
        access: MemoryAccessDesc,
        base: InsId,
        memory_base: Option<InsId>,
    },
    Store {
        access: MemoryAccessDesc,
        base: InsId,
        value: InsId,
        memory_base: Option<InsId>,
    },
    AtomicRmw {
        access: MemoryAccessDesc,
        op: RmwOp,
        base: InsId,
        value: InsId,
        memory_base: Option<InsId>,
    },
    AtomicCmpXchg {
        access: MemoryAccessDesc,
        base: InsId,
        expected: InsId,
        replacement: InsId,
        memory_base: Option<InsId>,
    },
    Fence,
    /// Traps when `index >= limit`; the result is the (possibly masked) index.
    BoundsCheck {
        index: InsId,
        limit: InsId,
        bytecode_offset: u32,
    },
    /// Traps when the dynamic address is not a multiple of `byte_size`.
    AlignmentCheck {
        addr: InsId,
        byte_size: u32,
        bytecode_offset: u32,
    },
    /// `base + offset` with overflow trap.
    AddOffset {
        base: InsId,
        offset: u64,
        bytecode_offset: u32,
    },
    /// Interior pointer at a fixed byte offset from a base pointer; used to
    /// name global cells for write barriers.
    DerivedPointer { base: InsId, offset: u32 },
    /// Load a field of the thread-local state at a fixed byte offset.
    LoadTls { offset: u32 },
    StoreTls { offset: u32, value: InsId },
    /// Read / write through an indirect-global cell pointer.
    LoadCell { ptr: InsId },
    StoreCell { ptr: InsId, value: InsId },
    /// Outbound call argument placed in the stack-arg area.
    StackArg { offset: u32, value: InsId },
    Call(Box<CallIns>),
    /// Consults the thread-local interrupt flag.
    InterruptCheck { bytecode_offset: u32 },
}

/// One arena-allocated instruction: kind tag plus result MIR type
/// (`None` for pure effects).
#[derive(Debug, Clone, PartialEq)]
pub struct Ins {
    pub kind: InsKind,
    pub ty: Option<MirType>,
}

impl Ins {
    pub fn result_type(&self) -> Option<MirType> {
        self.ty
    }

    /// Alias-set classification for memory-touching nodes.
    pub fn alias_set(&self) -> AliasSet {
        match &self.kind {
            InsKind::Load { .. }
            | InsKind::Store { .. }
            | InsKind::AtomicRmw { .. }
            | InsKind::AtomicCmpXchg { .. } => AliasSet::HEAP,
            InsKind::LoadTls { .. } | InsKind::StoreTls { .. } => AliasSet::TLS,
            InsKind::LoadCell { .. } | InsKind::StoreCell { .. } => AliasSet::GLOBAL_CELL,
            InsKind::StackArg { .. } => AliasSet::STACK_ARG,
            InsKind::Call(_) | InsKind::Fence => AliasSet::ANY,
            _ => AliasSet::NONE,
        }
    }
}

/// Block terminators. Successor slots hold `None` while a forward branch
/// waits in the patch table; binding a label fills them in.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Goto {
        target: Option<BlockId>,
    },
    Test {
        cond: InsId,
        if_true: Option<BlockId>,
        if_false: Option<BlockId>,
    },
    TableSwitch {
        index: InsId,
        default: Option<BlockId>,
        cases: Vec<Option<BlockId>>,
    },
    Return {
        values: Vec<InsId>,
    },
    Trap {
        kind: TrapKind,
        bytecode_offset: u32,
    },
}

impl Terminator {
    /// Successor-slot numbering: `Goto` has slot 0; `Test` has 0 (true) and
    /// 1 (false); `TableSwitch` has 0 (default) and 1 + case index.
    pub fn successor_mut(&mut self, slot: usize) -> Option<&mut Option<BlockId>> {
        match self {
            Terminator::Goto { target } if slot == 0 => Some(target),
            Terminator::Test { if_true, .. } if slot == 0 => Some(if_true),
            Terminator::Test { if_false, .. } if slot == 1 => Some(if_false),
            Terminator::TableSwitch { default, .. } if slot == 0 => Some(default),
            Terminator::TableSwitch { cases, .. } => cases.get_mut(slot - 1),
            _ => None,
        }
    }

    pub fn successors(&self) -> Vec<Option<BlockId>> {
        match self {
            Terminator::Goto { target } => vec![*target],
            Terminator::Test { if_true, if_false, .. } => vec![*if_true, *if_false],
            Terminator::TableSwitch { default, cases, .. } => {
                let mut v = vec![*default];
                v.extend(cases.iter().copied());
                v
            }
            Terminator::Return { .. } | Terminator::Trap { .. } => Vec::new(),
        }
    }
}

/// A basic block.
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    /// Phi region; phis precede all ordinary instructions.
    pub phis: Vec<InsId>,
    pub instructions: Vec<InsId>,
    /// `None` while the block is pending.
    pub terminator: Option<Terminator>,
    /// Predecessor edges, in the order phis index their inputs.
    pub preds: Vec<BlockId>,
    pub loop_depth: u32,
    /// Scratch flag for CFG algorithms (predecessor dedup).
    pub marked: bool,
    /// Reaching SSA definition per local slot.
    pub slots: Vec<InsId>,
    /// Operands parked by forward branches, awaiting phi construction.
    pub stack: Vec<InsId>,
}

impl Block {
    pub fn is_terminated(&self) -> bool {
        self.terminator.is_some()
    }
}

/// The per-function SSA graph arena.
#[derive(Debug, Clone)]
pub struct MirGraph {
    ins: Vec<Ins>,
    blocks: Vec<Block>,
    pub entry: BlockId,
    pub func_index: u32,
    /// Running maximum of outbound call-argument bytes.
    pub max_stack_arg_bytes: u32,
}

impl MirGraph {
    pub fn new(func_index: u32) -> Self {
        Self {
            ins: Vec::new(),
            blocks: Vec::new(),
            entry: BlockId(0),
            func_index,
            max_stack_arg_bytes: 0,
        }
    }

    pub fn alloc(&mut self, kind: InsKind, ty: Option<MirType>) -> InsId {
        let id = InsId(self.ins.len() as u32);
        self.ins.push(Ins { kind, ty });
        id
    }

    pub fn ins(&self, id: InsId) -> &Ins {
        &self.ins[id.0 as usize]
    }

    pub fn ins_mut(&mut self, id: InsId) -> &mut Ins {
        &mut self.ins[id.0 as usize]
    }

    pub fn num_ins(&self) -> usize {
        self.ins.len()
    }

    pub fn new_block(&mut self, loop_depth: u32, slots: Vec<InsId>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            phis: Vec::new(),
            instructions: Vec::new(),
            terminator: None,
            preds: Vec::new(),
            loop_depth,
            marked: false,
            slots,
            stack: Vec::new(),
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn phi_inputs(&self, id: InsId) -> &[InsId] {
        match &self.ins(id).kind {
            InsKind::Phi { inputs } => inputs,
            _ => &[],
        }
    }

    pub fn phi_inputs_mut(&mut self, id: InsId) -> Option<&mut Vec<InsId>> {
        match &mut self.ins_mut(id).kind {
            InsKind::Phi { inputs } => Some(inputs),
            _ => None,
        }
    }

    /// Rewrite every use of `old` to `new` in blocks whose loop depth is at
    /// least `min_loop_depth` (0 rewrites the whole graph). Covers operand
    /// lists, terminators, local slots, and parked stack values.
    pub fn replace_uses(&mut self, old: InsId, new: InsId, min_loop_depth: u32) {
        let block_ids: Vec<BlockId> = self
            .blocks
            .iter()
            .filter(|b| b.loop_depth >= min_loop_depth)
            .map(|b| b.id)
            .collect();
        let rewrite = |id: &mut InsId| {
            if *id == old {
                *id = new;
            }
        };
        for bid in block_ids {
            let members: Vec<InsId> = {
                let b = self.block(bid);
                b.phis.iter().chain(b.instructions.iter()).copied().collect()
            };
            for m in members {
                for_each_operand_mut(&mut self.ins_mut(m).kind, rewrite);
            }
            let b = self.block_mut(bid);
            if let Some(term) = &mut b.terminator {
                match term {
                    Terminator::Test { cond, .. } => rewrite(cond),
                    Terminator::TableSwitch { index, .. } => rewrite(index),
                    Terminator::Return { values } => values.iter_mut().for_each(rewrite),
                    Terminator::Goto { .. } | Terminator::Trap { .. } => {}
                }
            }
            b.slots.iter_mut().for_each(rewrite);
            b.stack.iter_mut().for_each(rewrite);
        }
    }
}

/// Apply `f` to every instruction-operand slot of `kind`.
pub fn for_each_operand_mut(kind: &mut InsKind, mut f: impl FnMut(&mut InsId)) {
    match kind {
        InsKind::Param { .. }
        | InsKind::TlsPointer
        | InsKind::Const(_)
        | InsKind::Fence
        | InsKind::LoadTls { .. }
        | InsKind::InterruptCheck { .. } => {}
        InsKind::Binary { lhs, rhs, .. }
        | InsKind::DivInt { lhs, rhs, .. }
        | InsKind::RemInt { lhs, rhs, .. }
        | InsKind::MinMax { lhs, rhs, .. }
        | InsKind::Compare { lhs, rhs, .. } => {
            f(lhs);
            f(rhs);
        }
        InsKind::Unary { val, .. }
        | InsKind::ExtendI32 { val, .. }
        | InsKind::WrapI64 { val }
        | InsKind::SignExtend { val, .. }
        | InsKind::TruncateToInt32 { val }
        | InsKind::TruncToInt { val, .. }
        | InsKind::ConvertFromInt { val, .. }
        | InsKind::FloatToFloat { val }
        | InsKind::Reinterpret { val } => f(val),
        InsKind::Select { cond, on_true, on_false } => {
            f(cond);
            f(on_true);
            f(on_false);
        }
        InsKind::Phi { inputs } => inputs.iter_mut().for_each(f),
        InsKind::Load { base, memory_base, .. } => {
            f(base);
            if let Some(m) = memory_base {
                f(m);
            }
        }
        InsKind::Store { base, value, memory_base, .. } => {
            f(base);
            f(value);
            if let Some(m) = memory_base {
                f(m);
            }
        }
        InsKind::AtomicRmw { base, value, memory_base, .. } => {
            f(base);
            f(value);
            if let Some(m) = memory_base {
                f(m);
            }
        }
        InsKind::AtomicCmpXchg {
            base,
            expected,
            replacement,
            memory_base,
            ..
        } => {
            f(base);
            f(expected);
            f(replacement);
            if let Some(m) = memory_base {
                f(m);
            }
        }
        InsKind::BoundsCheck { index, limit, .. } => {
            f(index);
            f(limit);
        }
        InsKind::AlignmentCheck { addr, .. } => f(addr),
        InsKind::AddOffset { base, .. } | InsKind::DerivedPointer { base, .. } => f(base),
        InsKind::StoreTls { value, .. } => f(value),
        InsKind::LoadCell { ptr } => f(ptr),
        InsKind::StoreCell { ptr, value } => {
            f(ptr);
            f(value);
        }
        InsKind::StackArg { value, .. } => f(value),
        InsKind::Call(call) => {
            if let Callee::Indirect { index, .. } = &mut call.callee {
                f(index);
            }
            for (_, v) in call.reg_args.iter_mut() {
                f(v);
            }
            call.stack_args.iter_mut().for_each(&mut f);
            if let Some(tls) = &mut call.tls {
                f(tls);
            }
        }
    }
}

impl fmt::Display for MirGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "fn {} (entry {}, stack_args {}):",
            self.func_index, self.entry, self.max_stack_arg_bytes
        )?;
        for block in &self.blocks {
            write!(f, "{}: preds=[", block.id)?;
            for (i, p) in block.preds.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", p)?;
            }
            writeln!(f, "] loop_depth={}", block.loop_depth)?;
            for id in block.phis.iter().chain(block.instructions.iter()) {
                let ins = self.ins(*id);
                write!(f, "  {}", id)?;
                if let Some(ty) = ins.ty {
                    write!(f, ": {}", ty)?;
                }
                writeln!(f, " = {:?}", ins.kind)?;
            }
            match &block.terminator {
                Some(t) => writeln!(f, "  {:?}", t)?,
                None => writeln!(f, "  <pending>")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_with_block() -> (MirGraph, BlockId) {
        let mut g = MirGraph::new(0);
        let b = g.new_block(0, Vec::new());
        (g, b)
    }

    #[test]
    fn val_type_to_mir_is_total() {
        assert_eq!(ValType::I32.to_mir(), MirType::Int32);
        assert_eq!(ValType::I64.to_mir(), MirType::Int64);
        assert_eq!(ValType::F32.to_mir(), MirType::Float32);
        assert_eq!(ValType::F64.to_mir(), MirType::Double);
        assert_eq!(ValType::FuncRef.to_mir(), MirType::RefOrNull);
        assert_eq!(ValType::AnyRef.to_mir(), MirType::RefOrNull);
        assert_eq!(ValType::TypedRef(3).to_mir(), MirType::RefOrNull);
    }

    #[test]
    fn arena_ids_are_sequential() {
        let (mut g, _) = graph_with_block();
        let a = g.alloc(InsKind::Const(ConstVal::I32(1)), Some(MirType::Int32));
        let b = g.alloc(InsKind::Const(ConstVal::I32(2)), Some(MirType::Int32));
        assert_eq!(a, InsId(0));
        assert_eq!(b, InsId(1));
        assert_eq!(g.num_ins(), 2);
    }

    #[test]
    fn terminator_successor_slots() {
        let mut t = Terminator::Test {
            cond: InsId(0),
            if_true: None,
            if_false: None,
        };
        *t.successor_mut(0).unwrap() = Some(BlockId(1));
        *t.successor_mut(1).unwrap() = Some(BlockId(2));
        assert_eq!(t.successors(), vec![Some(BlockId(1)), Some(BlockId(2))]);
        assert!(t.successor_mut(2).is_none());

        let mut sw = Terminator::TableSwitch {
            index: InsId(0),
            default: None,
            cases: vec![None, None],
        };
        *sw.successor_mut(2).unwrap() = Some(BlockId(7));
        assert_eq!(sw.successors()[2], Some(BlockId(7)));
    }

    #[test]
    fn replace_uses_rewrites_operands_slots_and_stack() {
        let (mut g, b) = graph_with_block();
        let old = g.alloc(InsKind::Const(ConstVal::I32(1)), Some(MirType::Int32));
        let new = g.alloc(InsKind::Const(ConstVal::I32(2)), Some(MirType::Int32));
        let add = g.alloc(
            InsKind::Binary {
                op: BinOp::Add,
                lhs: old,
                rhs: old,
                preserve_nan: false,
            },
            Some(MirType::Int32),
        );
        {
            let blk = g.block_mut(b);
            blk.instructions.extend([old, new, add]);
            blk.slots.push(old);
            blk.stack.push(old);
            blk.terminator = Some(Terminator::Return { values: vec![old] });
        }
        g.replace_uses(old, new, 0);
        match &g.ins(add).kind {
            InsKind::Binary { lhs, rhs, .. } => {
                assert_eq!(*lhs, new);
                assert_eq!(*rhs, new);
            }
            other => panic!("unexpected kind {:?}", other),
        }
        assert_eq!(g.block(b).slots[0], new);
        assert_eq!(g.block(b).stack[0], new);
        assert_eq!(
            g.block(b).terminator,
            Some(Terminator::Return { values: vec![new] })
        );
    }

    #[test]
    fn replace_uses_respects_loop_depth_floor() {
        let mut g = MirGraph::new(0);
        let outer = g.new_block(0, Vec::new());
        let inner = g.new_block(1, Vec::new());
        let old = g.alloc(InsKind::Const(ConstVal::I32(1)), Some(MirType::Int32));
        let new = g.alloc(InsKind::Const(ConstVal::I32(2)), Some(MirType::Int32));
        g.block_mut(outer).stack.push(old);
        g.block_mut(inner).stack.push(old);
        g.replace_uses(old, new, 1);
        assert_eq!(g.block(outer).stack[0], old);
        assert_eq!(g.block(inner).stack[0], new);
    }

    #[test]
    fn alias_sets_classify_memory_nodes() {
        let access = MemoryAccessDesc::new(Scalar::I32, 2, 0, 0);
        let load = Ins {
            kind: InsKind::Load {
                access,
                base: InsId(0),
                memory_base: None,
            },
            ty: Some(MirType::Int32),
        };
        assert!(load.alias_set().intersects(AliasSet::HEAP));
        assert!(!load.alias_set().intersects(AliasSet::TLS));

        let tls = Ins {
            kind: InsKind::LoadTls { offset: 16 },
            ty: Some(MirType::Pointer),
        };
        assert!(tls.alias_set().intersects(AliasSet::TLS));

        let konst = Ins {
            kind: InsKind::Const(ConstVal::I32(0)),
            ty: Some(MirType::Int32),
        };
        assert_eq!(konst.alias_set(), AliasSet::NONE);
    }

    #[test]
    fn display_smoke() {
        let (mut g, b) = graph_with_block();
        let c = g.alloc(InsKind::Const(ConstVal::I32(7)), Some(MirType::Int32));
        let blk = g.block_mut(b);
        blk.instructions.push(c);
        blk.terminator = Some(Terminator::Return { values: vec![c] });
        let text = g.to_string();
        assert!(text.contains("b0"));
        assert!(text.contains("v0"));
    }
}
