//! Platform ABI placement for call arguments.
//!
//! `AbiArgGenerator` is a stateful cursor over argument MIR types; each
//! `next` call yields a register, a register pair (64-bit values on 32-bit
//! targets), or a stack slot at a fixed offset in the outbound-argument
//! area.

use crate::env::Target;
use crate::mir::MirType;

/// Integer argument registers available to the generator.
const GPR_ARG_COUNT_64: u8 = 6;
const GPR_ARG_COUNT_32: u8 = 4;
/// Floating-point argument registers.
const FPU_ARG_COUNT: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Gpr(u8),
    Fpu(u8),
}

/// One argument placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiArg {
    Reg(Reg),
    /// 64-bit value split across two GPRs: (low, high).
    RegPair(Reg, Reg),
    Stack { offset: u32 },
}

pub struct AbiArgGenerator {
    target: Target,
    next_gpr: u8,
    next_fpu: u8,
    stack_offset: u32,
}

impl AbiArgGenerator {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            next_gpr: 0,
            next_fpu: 0,
            stack_offset: 0,
        }
    }

    fn gpr_limit(&self) -> u8 {
        if self.target.pointer_64 {
            GPR_ARG_COUNT_64
        } else {
            GPR_ARG_COUNT_32
        }
    }

    fn take_gpr(&mut self) -> Option<Reg> {
        if self.next_gpr < self.gpr_limit() {
            let r = Reg::Gpr(self.next_gpr);
            self.next_gpr += 1;
            Some(r)
        } else {
            None
        }
    }

    fn take_fpu(&mut self) -> Option<Reg> {
        if self.next_fpu < FPU_ARG_COUNT {
            let r = Reg::Fpu(self.next_fpu);
            self.next_fpu += 1;
            Some(r)
        } else {
            None
        }
    }

    fn stack_slot(&mut self, size: u32) -> AbiArg {
        // Natural alignment for the slot.
        self.stack_offset = (self.stack_offset + size - 1) & !(size - 1);
        let arg = AbiArg::Stack {
            offset: self.stack_offset,
        };
        self.stack_offset += size;
        arg
    }

    pub fn next(&mut self, ty: MirType) -> AbiArg {
        match ty {
            MirType::Int32 => match self.take_gpr() {
                Some(r) => AbiArg::Reg(r),
                None => self.stack_slot(4),
            },
            MirType::Pointer | MirType::RefOrNull => match self.take_gpr() {
                Some(r) => AbiArg::Reg(r),
                None => self.stack_slot(self.pointer_size()),
            },
            MirType::Int64 => {
                if self.target.pointer_64 {
                    match self.take_gpr() {
                        Some(r) => AbiArg::Reg(r),
                        None => self.stack_slot(8),
                    }
                } else if self.next_gpr + 1 < self.gpr_limit() {
                    let low = Reg::Gpr(self.next_gpr);
                    let high = Reg::Gpr(self.next_gpr + 1);
                    self.next_gpr += 2;
                    AbiArg::RegPair(low, high)
                } else {
                    // Skip any straggler register so pairs never straddle
                    // the register/stack boundary.
                    self.next_gpr = self.gpr_limit();
                    self.stack_slot(8)
                }
            }
            MirType::Float32 => match self.take_fpu() {
                Some(r) => AbiArg::Reg(r),
                None => self.stack_slot(4),
            },
            MirType::Double => match self.take_fpu() {
                Some(r) => AbiArg::Reg(r),
                None => self.stack_slot(8),
            },
        }
    }

    fn pointer_size(&self) -> u32 {
        if self.target.pointer_64 {
            8
        } else {
            4
        }
    }

    /// Total bytes of stack-passed arguments assigned so far.
    pub fn stack_bytes_consumed(&self) -> u32 {
        self.stack_offset
    }
}

/// Per-call accumulation of argument placements. Populated by the function
/// compiler's `pass_arg` / `finish_call`; the finished state is frozen into
/// a call node.
pub struct CallCompileState {
    pub abi: AbiArgGenerator,
    pub reg_args: Vec<(Reg, crate::mir::InsId)>,
    pub stack_args: Vec<crate::mir::InsId>,
}

impl CallCompileState {
    pub fn new(target: Target) -> Self {
        Self {
            abi: AbiArgGenerator::new(target),
            reg_args: Vec::new(),
            stack_args: Vec::new(),
        }
    }
}
