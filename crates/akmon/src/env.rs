//! The read-only module environment threaded into every function compilation.
//!
//! Nothing here is mutated during compilation; one `ModuleEnv` may be shared
//! by any number of per-function workers.

use crate::mir::{MirType, ValType};
use anyhow::{bail, Result};

/// Offset-guard region for ordinary memories: constant offsets below this
/// bound cannot escape the guard pages.
pub const OFFSET_GUARD_LIMIT: u64 = 0x1_0000;
/// Offset-guard region when huge memory is enabled.
pub const HUGE_OFFSET_GUARD_LIMIT: u64 = 0x8000_0000;

/// Feature flags. Immutable for the lifetime of a compilation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
    /// Legacy asm.js dialect: no div/rem traps, float identity folding
    /// allowed, power-of-two tables with masked indirect calls.
    pub asm_js: bool,
    pub ref_types: bool,
    pub gc: bool,
    pub bulk_memory: bool,
    pub shared_memory: bool,
    pub threads: bool,
    pub huge_memory: bool,
    pub spectre_index_masking: bool,
}

/// Target description consumed by the ABI generator and the lowering.
#[derive(Debug, Clone, Copy)]
pub struct Target {
    pub pointer_64: bool,
    /// Permits the inline bulk-memory expansion.
    pub fast_unaligned_access: bool,
    /// Whether ceil/floor/trunc/nearest have native nodes; otherwise they
    /// lower to builtin calls.
    pub native_float_rounding: bool,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            pointer_64: true,
            fast_unaligned_access: true,
            native_float_rounding: true,
        }
    }
}

/// A function signature. The type section is restricted to at most one
/// result; multi-result signatures are rejected while building the
/// environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncType {
    pub params: Vec<ValType>,
    pub results: Vec<ValType>,
}

impl FuncType {
    pub fn new(params: Vec<ValType>, results: Vec<ValType>) -> Self {
        Self { params, results }
    }

    pub fn result(&self) -> Option<ValType> {
        self.results.first().copied()
    }
}

/// One function in the index space.
#[derive(Debug, Clone)]
pub struct FuncDesc {
    pub type_index: u32,
    /// For imported functions, the TLS slot holding the code pointer.
    pub import_tls_slot: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct GlobalDesc {
    pub ty: ValType,
    pub mutable: bool,
    /// Imported-mutable globals live behind a pointer cell in TLS.
    pub indirect: bool,
    pub tls_offset: u32,
}

#[derive(Debug, Clone)]
pub struct TableDesc {
    pub elem_ty: ValType,
    pub initial: u32,
    pub maximum: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct MemoryDesc {
    pub initial_pages: u64,
    pub maximum_pages: Option<u64>,
    pub shared: bool,
}

/// Fixed byte offsets of the thread-local-state fields the lowering reads.
#[derive(Debug, Clone, Copy)]
pub struct TlsLayout {
    pub memory_base: u32,
    pub bounds_check_limit: u32,
}

impl Default for TlsLayout {
    fn default() -> Self {
        Self {
            memory_base: 0,
            bounds_check_limit: 8,
        }
    }
}

/// Builtin instance methods callable from lowered code. Each carries a
/// constant signature descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    PostBarrierFiltering,
    MemoryGrow,
    MemorySize,
    WaitI32,
    WaitI64,
    Wake,
    MemCopy,
    MemCopyShared,
    MemFill,
    MemFillShared,
    MemInit,
    DataDrop,
    TableCopy,
    ElemDrop,
    TableInit,
    TableFill,
    TableGet,
    TableGrow,
    TableSet,
    TableSize,
    FuncRef,
    CeilF,
    CeilD,
    FloorF,
    FloorD,
    TruncF,
    TruncD,
    NearbyIntF,
    NearbyIntD,
    SinD,
    CosD,
    TanD,
    ASinD,
    ACosD,
    ATanD,
    ExpD,
    LogD,
    PowD,
    ATan2D,
}

/// Signature of a builtin: explicit parameters (the instance pointer is
/// implied by `takes_instance`), and at most one result.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinSig {
    pub params: &'static [MirType],
    pub ret: Option<MirType>,
    pub takes_instance: bool,
}

use MirType::{Double, Float32, Int32, Int64, Pointer, RefOrNull};

impl Builtin {
    pub fn sig(self) -> BuiltinSig {
        macro_rules! sig {
            ([$($p:expr),*], $ret:expr, $inst:expr) => {
                BuiltinSig { params: &[$($p),*], ret: $ret, takes_instance: $inst }
            };
        }
        match self {
            Builtin::PostBarrierFiltering => sig!([Pointer], None, true),
            Builtin::MemoryGrow => sig!([Int32], Some(Int32), true),
            Builtin::MemorySize => sig!([], Some(Int32), true),
            Builtin::WaitI32 => sig!([Int32, Int32, Int64], Some(Int32), true),
            Builtin::WaitI64 => sig!([Int32, Int64, Int64], Some(Int32), true),
            Builtin::Wake => sig!([Int32, Int32], Some(Int32), true),
            Builtin::MemCopy | Builtin::MemCopyShared => {
                sig!([Int32, Int32, Int32, Pointer], None, true)
            }
            Builtin::MemFill | Builtin::MemFillShared => {
                sig!([Int32, Int32, Int32, Pointer], None, true)
            }
            Builtin::MemInit => sig!([Int32, Int32, Int32, Int32], None, true),
            Builtin::DataDrop => sig!([Int32], None, true),
            Builtin::TableCopy => sig!([Int32, Int32, Int32, Int32, Int32], None, true),
            Builtin::ElemDrop => sig!([Int32], None, true),
            Builtin::TableInit => sig!([Int32, Int32, Int32, Int32, Int32], None, true),
            Builtin::TableFill => sig!([Int32, RefOrNull, Int32, Int32], None, true),
            Builtin::TableGet => sig!([Int32, Int32], Some(RefOrNull), true),
            Builtin::TableGrow => sig!([RefOrNull, Int32, Int32], Some(Int32), true),
            Builtin::TableSet => sig!([Int32, RefOrNull, Int32], None, true),
            Builtin::TableSize => sig!([Int32], Some(Int32), true),
            Builtin::FuncRef => sig!([Int32], Some(RefOrNull), true),
            Builtin::CeilF | Builtin::FloorF | Builtin::TruncF | Builtin::NearbyIntF => {
                sig!([Float32], Some(Float32), false)
            }
            Builtin::CeilD | Builtin::FloorD | Builtin::TruncD | Builtin::NearbyIntD
            | Builtin::SinD | Builtin::CosD | Builtin::TanD | Builtin::ASinD
            | Builtin::ACosD | Builtin::ATanD | Builtin::ExpD | Builtin::LogD => {
                sig!([Double], Some(Double), false)
            }
            Builtin::PowD | Builtin::ATan2D => sig!([Double, Double], Some(Double), false),
        }
    }
}

/// The module environment: everything about the module a function-body
/// compilation needs, assumed already validated at the section level.
#[derive(Debug, Clone, Default)]
pub struct ModuleEnv {
    pub types: Vec<FuncType>,
    pub funcs: Vec<FuncDesc>,
    pub globals: Vec<GlobalDesc>,
    pub tables: Vec<TableDesc>,
    pub memory: Option<MemoryDesc>,
    /// From the data-count section, when present.
    pub num_data_segments: Option<u32>,
    pub num_elem_segments: u32,
    pub features: Features,
    pub target: Target,
    pub tls: TlsLayout,
}

impl ModuleEnv {
    pub fn new(features: Features, target: Target) -> Self {
        Self {
            features,
            target,
            ..Default::default()
        }
    }

    pub fn ty(&self, index: u32) -> Result<&FuncType> {
        match self.types.get(index as usize) {
            Some(t) => Ok(t),
            None => bail!("unknown type index {}", index),
        }
    }

    pub fn func(&self, index: u32) -> Result<&FuncDesc> {
        match self.funcs.get(index as usize) {
            Some(f) => Ok(f),
            None => bail!("unknown function index {}", index),
        }
    }

    pub fn func_type(&self, index: u32) -> Result<&FuncType> {
        self.ty(self.func(index)?.type_index)
    }

    pub fn global(&self, index: u32) -> Result<&GlobalDesc> {
        match self.globals.get(index as usize) {
            Some(g) => Ok(g),
            None => bail!("unknown global index {}", index),
        }
    }

    pub fn table(&self, index: u32) -> Result<&TableDesc> {
        match self.tables.get(index as usize) {
            Some(t) => Ok(t),
            None => bail!("unknown table index {}", index),
        }
    }

    pub fn memory(&self) -> Result<&MemoryDesc> {
        match &self.memory {
            Some(m) => Ok(m),
            None => bail!("module has no memory"),
        }
    }

    /// The combined bulk-memory predicate: unconditionally available under
    /// shared memory, otherwise behind its own flag.
    pub fn bulk_memory_enabled(&self) -> bool {
        self.features.shared_memory || self.features.bulk_memory
    }

    pub fn offset_guard_limit(&self) -> u64 {
        if self.features.huge_memory {
            HUGE_OFFSET_GUARD_LIMIT
        } else {
            OFFSET_GUARD_LIMIT
        }
    }

    pub fn uses_shared_memory(&self) -> bool {
        self.memory.as_ref().map(|m| m.shared).unwrap_or(false)
    }
}

/// One function body handed to the compile entry point.
#[derive(Debug, Clone, Copy)]
pub struct FuncCompileInput<'a> {
    pub index: u32,
    pub body: &'a [u8],
    /// Offset of the body within the module, for error attribution.
    pub module_offset: u32,
}
