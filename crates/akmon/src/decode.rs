//! Byte-stream decoder for WebAssembly function bodies.
//!
//! A `Decoder` is a bounded cursor over one function body. It never reads
//! past the end of its slice; truncation and malformed LEB128 encodings are
//! reported with the byte offset at which they were detected.

use crate::mir::ValType;
use anyhow::{bail, Result};

/// One- and two-level opcode bytes.
pub mod ops {
    // Control.
    pub const UNREACHABLE: u8 = 0x00;
    pub const NOP: u8 = 0x01;
    pub const BLOCK: u8 = 0x02;
    pub const LOOP: u8 = 0x03;
    pub const IF: u8 = 0x04;
    pub const ELSE: u8 = 0x05;
    pub const END: u8 = 0x0B;
    pub const BR: u8 = 0x0C;
    pub const BR_IF: u8 = 0x0D;
    pub const BR_TABLE: u8 = 0x0E;
    pub const RETURN: u8 = 0x0F;
    pub const CALL: u8 = 0x10;
    pub const CALL_INDIRECT: u8 = 0x11;

    // Parametric.
    pub const DROP: u8 = 0x1A;
    pub const SELECT: u8 = 0x1B;
    pub const SELECT_T: u8 = 0x1C;

    // Variables.
    pub const LOCAL_GET: u8 = 0x20;
    pub const LOCAL_SET: u8 = 0x21;
    pub const LOCAL_TEE: u8 = 0x22;
    pub const GLOBAL_GET: u8 = 0x23;
    pub const GLOBAL_SET: u8 = 0x24;
    pub const TABLE_GET: u8 = 0x25;
    pub const TABLE_SET: u8 = 0x26;

    // Memory.
    pub const I32_LOAD: u8 = 0x28;
    pub const I64_LOAD: u8 = 0x29;
    pub const F32_LOAD: u8 = 0x2A;
    pub const F64_LOAD: u8 = 0x2B;
    pub const I32_LOAD8_S: u8 = 0x2C;
    pub const I32_LOAD8_U: u8 = 0x2D;
    pub const I32_LOAD16_S: u8 = 0x2E;
    pub const I32_LOAD16_U: u8 = 0x2F;
    pub const I64_LOAD8_S: u8 = 0x30;
    pub const I64_LOAD8_U: u8 = 0x31;
    pub const I64_LOAD16_S: u8 = 0x32;
    pub const I64_LOAD16_U: u8 = 0x33;
    pub const I64_LOAD32_S: u8 = 0x34;
    pub const I64_LOAD32_U: u8 = 0x35;
    pub const I32_STORE: u8 = 0x36;
    pub const I64_STORE: u8 = 0x37;
    pub const F32_STORE: u8 = 0x38;
    pub const F64_STORE: u8 = 0x39;
    pub const I32_STORE8: u8 = 0x3A;
    pub const I32_STORE16: u8 = 0x3B;
    pub const I64_STORE8: u8 = 0x3C;
    pub const I64_STORE16: u8 = 0x3D;
    pub const I64_STORE32: u8 = 0x3E;
    pub const MEMORY_SIZE: u8 = 0x3F;
    pub const MEMORY_GROW: u8 = 0x40;

    // Constants.
    pub const I32_CONST: u8 = 0x41;
    pub const I64_CONST: u8 = 0x42;
    pub const F32_CONST: u8 = 0x43;
    pub const F64_CONST: u8 = 0x44;

    // i32 comparisons.
    pub const I32_EQZ: u8 = 0x45;
    pub const I32_EQ: u8 = 0x46;
    pub const I32_NE: u8 = 0x47;
    pub const I32_LT_S: u8 = 0x48;
    pub const I32_LT_U: u8 = 0x49;
    pub const I32_GT_S: u8 = 0x4A;
    pub const I32_GT_U: u8 = 0x4B;
    pub const I32_LE_S: u8 = 0x4C;
    pub const I32_LE_U: u8 = 0x4D;
    pub const I32_GE_S: u8 = 0x4E;
    pub const I32_GE_U: u8 = 0x4F;

    // i64 comparisons.
    pub const I64_EQZ: u8 = 0x50;
    pub const I64_EQ: u8 = 0x51;
    pub const I64_NE: u8 = 0x52;
    pub const I64_LT_S: u8 = 0x53;
    pub const I64_LT_U: u8 = 0x54;
    pub const I64_GT_S: u8 = 0x55;
    pub const I64_GT_U: u8 = 0x56;
    pub const I64_LE_S: u8 = 0x57;
    pub const I64_LE_U: u8 = 0x58;
    pub const I64_GE_S: u8 = 0x59;
    pub const I64_GE_U: u8 = 0x5A;

    // f32 comparisons.
    pub const F32_EQ: u8 = 0x5B;
    pub const F32_NE: u8 = 0x5C;
    pub const F32_LT: u8 = 0x5D;
    pub const F32_GT: u8 = 0x5E;
    pub const F32_LE: u8 = 0x5F;
    pub const F32_GE: u8 = 0x60;

    // f64 comparisons.
    pub const F64_EQ: u8 = 0x61;
    pub const F64_NE: u8 = 0x62;
    pub const F64_LT: u8 = 0x63;
    pub const F64_GT: u8 = 0x64;
    pub const F64_LE: u8 = 0x65;
    pub const F64_GE: u8 = 0x66;

    // i32 arithmetic.
    pub const I32_CLZ: u8 = 0x67;
    pub const I32_CTZ: u8 = 0x68;
    pub const I32_POPCNT: u8 = 0x69;
    pub const I32_ADD: u8 = 0x6A;
    pub const I32_SUB: u8 = 0x6B;
    pub const I32_MUL: u8 = 0x6C;
    pub const I32_DIV_S: u8 = 0x6D;
    pub const I32_DIV_U: u8 = 0x6E;
    pub const I32_REM_S: u8 = 0x6F;
    pub const I32_REM_U: u8 = 0x70;
    pub const I32_AND: u8 = 0x71;
    pub const I32_OR: u8 = 0x72;
    pub const I32_XOR: u8 = 0x73;
    pub const I32_SHL: u8 = 0x74;
    pub const I32_SHR_S: u8 = 0x75;
    pub const I32_SHR_U: u8 = 0x76;
    pub const I32_ROTL: u8 = 0x77;
    pub const I32_ROTR: u8 = 0x78;

    // i64 arithmetic.
    pub const I64_CLZ: u8 = 0x79;
    pub const I64_CTZ: u8 = 0x7A;
    pub const I64_POPCNT: u8 = 0x7B;
    pub const I64_ADD: u8 = 0x7C;
    pub const I64_SUB: u8 = 0x7D;
    pub const I64_MUL: u8 = 0x7E;
    pub const I64_DIV_S: u8 = 0x7F;
    pub const I64_DIV_U: u8 = 0x80;
    pub const I64_REM_S: u8 = 0x81;
    pub const I64_REM_U: u8 = 0x82;
    pub const I64_AND: u8 = 0x83;
    pub const I64_OR: u8 = 0x84;
    pub const I64_XOR: u8 = 0x85;
    pub const I64_SHL: u8 = 0x86;
    pub const I64_SHR_S: u8 = 0x87;
    pub const I64_SHR_U: u8 = 0x88;
    pub const I64_ROTL: u8 = 0x89;
    pub const I64_ROTR: u8 = 0x8A;

    // f32 arithmetic.
    pub const F32_ABS: u8 = 0x8B;
    pub const F32_NEG: u8 = 0x8C;
    pub const F32_CEIL: u8 = 0x8D;
    pub const F32_FLOOR: u8 = 0x8E;
    pub const F32_TRUNC: u8 = 0x8F;
    pub const F32_NEAREST: u8 = 0x90;
    pub const F32_SQRT: u8 = 0x91;
    pub const F32_ADD: u8 = 0x92;
    pub const F32_SUB: u8 = 0x93;
    pub const F32_MUL: u8 = 0x94;
    pub const F32_DIV: u8 = 0x95;
    pub const F32_MIN: u8 = 0x96;
    pub const F32_MAX: u8 = 0x97;
    pub const F32_COPYSIGN: u8 = 0x98;

    // f64 arithmetic.
    pub const F64_ABS: u8 = 0x99;
    pub const F64_NEG: u8 = 0x9A;
    pub const F64_CEIL: u8 = 0x9B;
    pub const F64_FLOOR: u8 = 0x9C;
    pub const F64_TRUNC: u8 = 0x9D;
    pub const F64_NEAREST: u8 = 0x9E;
    pub const F64_SQRT: u8 = 0x9F;
    pub const F64_ADD: u8 = 0xA0;
    pub const F64_SUB: u8 = 0xA1;
    pub const F64_MUL: u8 = 0xA2;
    pub const F64_DIV: u8 = 0xA3;
    pub const F64_MIN: u8 = 0xA4;
    pub const F64_MAX: u8 = 0xA5;
    pub const F64_COPYSIGN: u8 = 0xA6;

    // Conversions.
    pub const I32_WRAP_I64: u8 = 0xA7;
    pub const I32_TRUNC_F32_S: u8 = 0xA8;
    pub const I32_TRUNC_F32_U: u8 = 0xA9;
    pub const I32_TRUNC_F64_S: u8 = 0xAA;
    pub const I32_TRUNC_F64_U: u8 = 0xAB;
    pub const I64_EXTEND_I32_S: u8 = 0xAC;
    pub const I64_EXTEND_I32_U: u8 = 0xAD;
    pub const I64_TRUNC_F32_S: u8 = 0xAE;
    pub const I64_TRUNC_F32_U: u8 = 0xAF;
    pub const I64_TRUNC_F64_S: u8 = 0xB0;
    pub const I64_TRUNC_F64_U: u8 = 0xB1;
    pub const F32_CONVERT_I32_S: u8 = 0xB2;
    pub const F32_CONVERT_I32_U: u8 = 0xB3;
    pub const F32_CONVERT_I64_S: u8 = 0xB4;
    pub const F32_CONVERT_I64_U: u8 = 0xB5;
    pub const F32_DEMOTE_F64: u8 = 0xB6;
    pub const F64_CONVERT_I32_S: u8 = 0xB7;
    pub const F64_CONVERT_I32_U: u8 = 0xB8;
    pub const F64_CONVERT_I64_S: u8 = 0xB9;
    pub const F64_CONVERT_I64_U: u8 = 0xBA;
    pub const F64_PROMOTE_F32: u8 = 0xBB;
    pub const I32_REINTERPRET_F32: u8 = 0xBC;
    pub const I64_REINTERPRET_F64: u8 = 0xBD;
    pub const F32_REINTERPRET_I32: u8 = 0xBE;
    pub const F64_REINTERPRET_I64: u8 = 0xBF;

    // Sign extension.
    pub const I32_EXTEND8_S: u8 = 0xC0;
    pub const I32_EXTEND16_S: u8 = 0xC1;
    pub const I64_EXTEND8_S: u8 = 0xC2;
    pub const I64_EXTEND16_S: u8 = 0xC3;
    pub const I64_EXTEND32_S: u8 = 0xC4;

    // Reference types.
    pub const REF_NULL: u8 = 0xD0;
    pub const REF_IS_NULL: u8 = 0xD1;
    pub const REF_FUNC: u8 = 0xD2;

    // Prefix bytes; a var-u32 sub-opcode follows.
    pub const GC_PREFIX: u8 = 0xFB;
    pub const MISC_PREFIX: u8 = 0xFC;
    pub const SIMD_PREFIX: u8 = 0xFD;
    pub const THREAD_PREFIX: u8 = 0xFE;
    /// Embedder-private prefix carrying the asm.js dialect operators.
    pub const MOZ_PREFIX: u8 = 0xFF;

    // MISC_PREFIX sub-opcodes.
    pub const I32_TRUNC_SAT_F32_S: u32 = 0x00;
    pub const I32_TRUNC_SAT_F32_U: u32 = 0x01;
    pub const I32_TRUNC_SAT_F64_S: u32 = 0x02;
    pub const I32_TRUNC_SAT_F64_U: u32 = 0x03;
    pub const I64_TRUNC_SAT_F32_S: u32 = 0x04;
    pub const I64_TRUNC_SAT_F32_U: u32 = 0x05;
    pub const I64_TRUNC_SAT_F64_S: u32 = 0x06;
    pub const I64_TRUNC_SAT_F64_U: u32 = 0x07;
    pub const MEMORY_INIT: u32 = 0x08;
    pub const DATA_DROP: u32 = 0x09;
    pub const MEMORY_COPY: u32 = 0x0A;
    pub const MEMORY_FILL: u32 = 0x0B;
    pub const TABLE_INIT: u32 = 0x0C;
    pub const ELEM_DROP: u32 = 0x0D;
    pub const TABLE_COPY: u32 = 0x0E;
    pub const TABLE_GROW: u32 = 0x0F;
    pub const TABLE_SIZE: u32 = 0x10;
    pub const TABLE_FILL: u32 = 0x11;

    // THREAD_PREFIX sub-opcodes.
    pub const MEMORY_ATOMIC_NOTIFY: u32 = 0x00;
    pub const MEMORY_ATOMIC_WAIT32: u32 = 0x01;
    pub const MEMORY_ATOMIC_WAIT64: u32 = 0x02;
    pub const ATOMIC_FENCE: u32 = 0x03;
    pub const I32_ATOMIC_LOAD: u32 = 0x10;
    pub const I64_ATOMIC_LOAD: u32 = 0x11;
    pub const I32_ATOMIC_LOAD8_U: u32 = 0x12;
    pub const I32_ATOMIC_LOAD16_U: u32 = 0x13;
    pub const I64_ATOMIC_LOAD8_U: u32 = 0x14;
    pub const I64_ATOMIC_LOAD16_U: u32 = 0x15;
    pub const I64_ATOMIC_LOAD32_U: u32 = 0x16;
    pub const I32_ATOMIC_STORE: u32 = 0x17;
    pub const I64_ATOMIC_STORE: u32 = 0x18;
    pub const I32_ATOMIC_STORE8: u32 = 0x19;
    pub const I32_ATOMIC_STORE16: u32 = 0x1A;
    pub const I64_ATOMIC_STORE8: u32 = 0x1B;
    pub const I64_ATOMIC_STORE16: u32 = 0x1C;
    pub const I64_ATOMIC_STORE32: u32 = 0x1D;
    pub const ATOMIC_RMW_FIRST: u32 = 0x1E;
    pub const ATOMIC_CMPXCHG_FIRST: u32 = 0x48;
    pub const ATOMIC_CMPXCHG_LAST: u32 = 0x4E;

    // MOZ_PREFIX sub-opcodes (asm.js dialect).
    pub const MOZ_I32_MIN: u32 = 0x00;
    pub const MOZ_I32_MAX: u32 = 0x01;
    pub const MOZ_I32_NEG: u32 = 0x02;
    pub const MOZ_I32_BITNOT: u32 = 0x03;
    pub const MOZ_I32_ABS: u32 = 0x04;
}

/// A decoded operator opcode: one primary byte, plus a sub-opcode for the
/// prefixed groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub primary: u8,
    pub sub: Option<u32>,
}

impl Opcode {
    pub fn single(primary: u8) -> Self {
        Self { primary, sub: None }
    }
}

/// Block-type immediate as encoded: a value-type byte, the void marker, or
/// a signed LEB index into the module type table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTypeImm {
    Empty,
    Value(ValType),
    TypeIndex(u32),
}

/// Memory-operator immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemArg {
    /// Alignment as a power-of-two exponent.
    pub align: u32,
    pub offset: u64,
}

pub struct Decoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Byte offset of the most recently read opcode.
    last_op_offset: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            last_op_offset: 0,
        }
    }

    pub fn done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Byte offset of the next unread byte.
    pub fn current_offset(&self) -> usize {
        self.pos
    }

    /// Byte offset of the last opcode, used for trap attribution.
    pub fn last_opcode_offset(&self) -> u32 {
        self.last_op_offset as u32
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        match self.bytes.get(self.pos) {
            Some(b) => {
                self.pos += 1;
                Ok(*b)
            }
            None => bail!("truncated body at offset {}", self.pos),
        }
    }

    pub fn read_var_u32(&mut self) -> Result<u32> {
        let start = self.pos;
        let mut result: u32 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift == 28 && byte & 0xF0 != 0 {
                bail!("overlong LEB128 u32 at offset {}", start);
            }
            result |= u32::from(byte & 0x7F) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift >= 35 {
                bail!("overlong LEB128 u32 at offset {}", start);
            }
        }
    }

    pub fn read_var_i32(&mut self) -> Result<i32> {
        let v = self.read_var_signed(32)?;
        Ok(v as i32)
    }

    pub fn read_var_i64(&mut self) -> Result<i64> {
        self.read_var_signed(64)
    }

    /// 33-bit signed LEB used by block-type immediates.
    fn read_var_i33(&mut self) -> Result<i64> {
        self.read_var_signed(33)
    }

    fn read_var_signed(&mut self, bits: u32) -> Result<i64> {
        let start = self.pos;
        let mut result: i64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= i64::from(byte & 0x7F) << shift;
            shift += 7;
            if byte & 0x80 == 0 {
                // Sign-extend from the final group.
                if shift < 64 {
                    result = (result << (64 - shift)) >> (64 - shift);
                }
                if shift > bits {
                    // The unused bits of the last byte must all match the sign.
                    let check = result >> (bits - 1);
                    if check != 0 && check != -1 {
                        bail!("overlong LEB128 s{} at offset {}", bits, start);
                    }
                }
                return Ok(result);
            }
            if shift >= bits + 7 {
                bail!("overlong LEB128 s{} at offset {}", bits, start);
            }
        }
    }

    pub fn read_f32_bits(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_f64_bits(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let end = self.pos + buf.len();
        match self.bytes.get(self.pos..end) {
            Some(src) => {
                buf.copy_from_slice(src);
                self.pos = end;
                Ok(())
            }
            None => bail!("truncated body at offset {}", self.pos),
        }
    }

    /// Read one opcode: a primary byte, then a var-u32 sub-opcode for the
    /// prefixed groups.
    pub fn read_opcode(&mut self) -> Result<Opcode> {
        self.last_op_offset = self.pos;
        let primary = self.read_u8()?;
        let sub = match primary {
            ops::GC_PREFIX | ops::MISC_PREFIX | ops::SIMD_PREFIX | ops::THREAD_PREFIX
            | ops::MOZ_PREFIX => Some(self.read_var_u32()?),
            _ => None,
        };
        Ok(Opcode { primary, sub })
    }

    pub fn read_val_type(&mut self) -> Result<ValType> {
        let offset = self.pos;
        let byte = self.read_u8()?;
        self.val_type_from_byte(byte, offset)
    }

    fn val_type_from_byte(&mut self, byte: u8, offset: usize) -> Result<ValType> {
        match byte {
            0x7F => Ok(ValType::I32),
            0x7E => Ok(ValType::I64),
            0x7D => Ok(ValType::F32),
            0x7C => Ok(ValType::F64),
            0x70 => Ok(ValType::FuncRef),
            0x6F => Ok(ValType::AnyRef),
            // (ref null ht) / (ref ht): a heap type follows.
            0x63 | 0x64 => {
                let ht = self.read_var_i33()?;
                if ht >= 0 {
                    Ok(ValType::TypedRef(ht as u32))
                } else {
                    match ht {
                        -16 => Ok(ValType::FuncRef),
                        -17 => Ok(ValType::AnyRef),
                        _ => bail!("unknown heap type {} at offset {}", ht, offset),
                    }
                }
            }
            _ => bail!("unknown value type 0x{:02x} at offset {}", byte, offset),
        }
    }

    /// Heap-type immediate of `ref.null`: an abstract heap type or a
    /// type-table index.
    pub fn read_heap_type(&mut self) -> Result<ValType> {
        let offset = self.pos;
        let ht = self.read_var_i33()?;
        if ht >= 0 {
            return Ok(ValType::TypedRef(ht as u32));
        }
        // Negative values are the abstract heap types, encoded as the
        // sign-extended value-type byte.
        match (ht & 0x7F) as u8 {
            0x70 => Ok(ValType::FuncRef),
            0x6F => Ok(ValType::AnyRef),
            _ => bail!("unknown heap type at offset {}", offset),
        }
    }

    pub fn read_block_type(&mut self) -> Result<BlockTypeImm> {
        let offset = self.pos;
        let byte = self.read_u8()?;
        match byte {
            0x40 => Ok(BlockTypeImm::Empty),
            0x7F | 0x7E | 0x7D | 0x7C | 0x70 | 0x6F | 0x63 | 0x64 => {
                Ok(BlockTypeImm::Value(self.val_type_from_byte(byte, offset)?))
            }
            _ => {
                // A signed LEB type-table index; re-decode from the start.
                self.pos = offset;
                let index = self.read_var_i33()?;
                if index < 0 {
                    bail!("negative block type index at offset {}", offset);
                }
                Ok(BlockTypeImm::TypeIndex(index as u32))
            }
        }
    }

    pub fn read_mem_arg(&mut self) -> Result<MemArg> {
        let align = self.read_var_u32()?;
        let offset = u64::from(self.read_var_u32()?);
        Ok(MemArg { align, offset })
    }

    /// The local-declaration prefix: `count` runs of `(run-length, type)`.
    pub fn read_local_decls(&mut self) -> Result<Vec<ValType>> {
        let count = self.read_var_u32()?;
        let mut locals = Vec::new();
        for _ in 0..count {
            let run = self.read_var_u32()?;
            let ty = self.read_val_type()?;
            if locals.len() + run as usize > 50_000 {
                bail!("too many locals at offset {}", self.pos);
            }
            locals.extend(std::iter::repeat(ty).take(run as usize));
        }
        Ok(locals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_u32_single_and_multi_byte() {
        let mut d = Decoder::new(&[0x03, 0xE5, 0x8E, 0x26]);
        assert_eq!(d.read_var_u32().unwrap(), 3);
        assert_eq!(d.read_var_u32().unwrap(), 624485);
        assert!(d.done());
    }

    #[test]
    fn var_u32_rejects_overlong() {
        // Five bytes with payload bits beyond 32.
        let mut d = Decoder::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]);
        assert!(d.read_var_u32().is_err());
        // Canonical five-byte u32::MAX is fine.
        let mut d = Decoder::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]);
        assert_eq!(d.read_var_u32().unwrap(), u32::MAX);
    }

    #[test]
    fn var_u32_rejects_truncation() {
        let mut d = Decoder::new(&[0x80]);
        let err = d.read_var_u32().unwrap_err();
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn var_i32_signed_values() {
        let mut d = Decoder::new(&[0x7F]);
        assert_eq!(d.read_var_i32().unwrap(), -1);
        let mut d = Decoder::new(&[0xC0, 0xBB, 0x78]);
        assert_eq!(d.read_var_i32().unwrap(), -123456);
        let mut d = Decoder::new(&[0x80, 0x80, 0x80, 0x80, 0x78]);
        assert_eq!(d.read_var_i32().unwrap(), i32::MIN);
    }

    #[test]
    fn var_i32_rejects_bad_sign_bits() {
        // -1 encoded with spurious high bits in the fifth byte.
        let mut d = Decoder::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0x3F]);
        assert!(d.read_var_i32().is_err());
    }

    #[test]
    fn var_i64_extremes() {
        let mut d = Decoder::new(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
        assert_eq!(d.read_var_i64().unwrap(), i64::MAX);
        let mut d = Decoder::new(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7F]);
        assert_eq!(d.read_var_i64().unwrap(), i64::MIN);
    }

    #[test]
    fn float_bit_patterns_little_endian() {
        let mut d = Decoder::new(&[0x00, 0x00, 0xC0, 0x7F]);
        assert_eq!(d.read_f32_bits().unwrap(), 0x7FC0_0000);
        let bytes = 1.5f64.to_le_bytes();
        let mut d = Decoder::new(&bytes);
        assert_eq!(d.read_f64_bits().unwrap(), 1.5f64.to_bits());
    }

    #[test]
    fn opcode_prefix_reads_sub() {
        let mut d = Decoder::new(&[ops::I32_ADD, ops::MISC_PREFIX, 0x0A]);
        assert_eq!(d.read_opcode().unwrap(), Opcode::single(ops::I32_ADD));
        let op = d.read_opcode().unwrap();
        assert_eq!(op.primary, ops::MISC_PREFIX);
        assert_eq!(op.sub, Some(ops::MEMORY_COPY));
        assert_eq!(d.last_opcode_offset(), 1);
    }

    #[test]
    fn block_type_forms() {
        let mut d = Decoder::new(&[0x40]);
        assert_eq!(d.read_block_type().unwrap(), BlockTypeImm::Empty);
        let mut d = Decoder::new(&[0x7F]);
        assert_eq!(d.read_block_type().unwrap(), BlockTypeImm::Value(ValType::I32));
        let mut d = Decoder::new(&[0x05]);
        assert_eq!(d.read_block_type().unwrap(), BlockTypeImm::TypeIndex(5));
    }

    #[test]
    fn mem_arg_align_and_offset() {
        let mut d = Decoder::new(&[0x02, 0x90, 0x01]);
        let arg = d.read_mem_arg().unwrap();
        assert_eq!(arg.align, 2);
        assert_eq!(arg.offset, 144);
    }

    #[test]
    fn local_decls_expand_runs() {
        // 2 runs: 3 x i32, 1 x f64.
        let mut d = Decoder::new(&[0x02, 0x03, 0x7F, 0x01, 0x7C]);
        let locals = d.read_local_decls().unwrap();
        assert_eq!(
            locals,
            vec![ValType::I32, ValType::I32, ValType::I32, ValType::F64]
        );
    }
}
