//! Lowering of the numeric operators: constants, arithmetic, comparisons,
//! conversions, and reference primitives.
//!
//! Most operators are a straight read-operands / add-node / set-result
//! sequence. The exceptions all encode semantic contracts the backend
//! relies on:
//!
//! - float `sub`/`mul` set `preserve_nan` so identity folding cannot skip
//!   the quieting of signalling NaN payloads;
//! - float `min`/`max` quiet both operands up front by subtracting a typed
//!   zero, again with `preserve_nan`;
//! - signed 32-bit division reinterprets both operands as signed via
//!   `TruncateToInt32`, so earlier unsigned-shift results divide correctly;
//! - the non-saturating float-to-int truncations carry their bytecode
//!   offset for trap attribution.

use super::FunctionCompiler;
use crate::env::Builtin;
use crate::mir::{
    BinOp, CmpOp, CompareType, ConstVal, InsKind, MirType, UnOp, ValType,
};
use anyhow::{anyhow, Result};

impl<'a> FunctionCompiler<'a> {
    pub(super) fn emit_drop(&mut self) -> Result<()> {
        self.iter.read_drop()?;
        Ok(())
    }

    pub(super) fn emit_select(&mut self, typed: bool) -> Result<()> {
        let (cond, on_true, on_false, ty) = self.iter.read_select(typed)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let cond = self.expect_val(cond)?;
        let on_true = self.expect_val(on_true)?;
        let on_false = self.expect_val(on_false)?;
        let ty = ty
            .as_val_type()
            .ok_or_else(|| anyhow!("internal: select type unresolved in live code"))?;
        let r = self.add(
            InsKind::Select {
                cond,
                on_true,
                on_false,
            },
            Some(ty.to_mir()),
        );
        self.iter.set_result(r);
        Ok(())
    }

    // ---- constants ----

    pub(super) fn emit_i32_const(&mut self) -> Result<()> {
        let v = self.iter.read_i32_const()?;
        let r = self.constant(ConstVal::I32(v));
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_i64_const(&mut self) -> Result<()> {
        let v = self.iter.read_i64_const()?;
        let r = self.constant(ConstVal::I64(v));
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_f32_const(&mut self) -> Result<()> {
        let bits = self.iter.read_f32_const()?;
        let r = self.constant(ConstVal::F32(bits));
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_f64_const(&mut self) -> Result<()> {
        let bits = self.iter.read_f64_const()?;
        let r = self.constant(ConstVal::F64(bits));
        self.iter.set_result(r);
        Ok(())
    }

    // ---- comparisons ----

    pub(super) fn emit_eqz(&mut self, ty: ValType) -> Result<()> {
        let v = self.iter.read_conversion(ty, ValType::I32)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let v = self.expect_val(v)?;
        let (zero, cmp_ty) = match ty {
            ValType::I64 => (ConstVal::I64(0), CompareType::Int64),
            _ => (ConstVal::I32(0), CompareType::Int32),
        };
        let zero = self.constant(zero);
        let zero = self.expect_val(zero)?;
        let r = self.add(
            InsKind::Compare {
                op: CmpOp::Eq,
                cmp_ty,
                lhs: v,
                rhs: zero,
            },
            Some(MirType::Int32),
        );
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_compare(
        &mut self,
        ty: ValType,
        op: CmpOp,
        cmp_ty: CompareType,
    ) -> Result<()> {
        let (lhs, rhs) = self.iter.read_compare(ty)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let lhs = self.expect_val(lhs)?;
        let rhs = self.expect_val(rhs)?;
        let r = self.add(
            InsKind::Compare {
                op,
                cmp_ty,
                lhs,
                rhs,
            },
            Some(MirType::Int32),
        );
        self.iter.set_result(r);
        Ok(())
    }

    // ---- arithmetic ----

    pub(super) fn emit_unary(&mut self, ty: ValType, op: UnOp) -> Result<()> {
        let v = self.iter.read_unary(ty)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let val = self.expect_val(v)?;
        let r = self.add(InsKind::Unary { op, val }, Some(ty.to_mir()));
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_binary(&mut self, ty: ValType, op: BinOp) -> Result<()> {
        let (lhs, rhs) = self.iter.read_binary(ty)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let lhs = self.expect_val(lhs)?;
        let rhs = self.expect_val(rhs)?;
        let is_float = matches!(ty, ValType::F32 | ValType::F64);
        let preserve_nan = is_float
            && matches!(op, BinOp::Sub | BinOp::Mul)
            && !self.env.features.asm_js;
        let r = self.add(
            InsKind::Binary {
                op,
                lhs,
                rhs,
                preserve_nan,
            },
            Some(ty.to_mir()),
        );
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_div(&mut self, ty: ValType, unsigned: bool) -> Result<()> {
        let (lhs, rhs) = self.iter.read_binary(ty)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let mut lhs = self.expect_val(lhs)?;
        let mut rhs = self.expect_val(rhs)?;
        if ty == ValType::I32 && !unsigned {
            lhs = self.reinterpret_signed(lhs)?;
            rhs = self.reinterpret_signed(rhs)?;
        }
        let r = self.add(
            InsKind::DivInt {
                lhs,
                rhs,
                unsigned,
                trap_on_error: !self.env.features.asm_js,
            },
            Some(ty.to_mir()),
        );
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_rem(&mut self, ty: ValType, unsigned: bool) -> Result<()> {
        let (lhs, rhs) = self.iter.read_binary(ty)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let mut lhs = self.expect_val(lhs)?;
        let mut rhs = self.expect_val(rhs)?;
        if ty == ValType::I32 && !unsigned {
            lhs = self.reinterpret_signed(lhs)?;
            rhs = self.reinterpret_signed(rhs)?;
        }
        let r = self.add(
            InsKind::RemInt {
                lhs,
                rhs,
                unsigned,
                trap_on_error: !self.env.features.asm_js,
            },
            Some(ty.to_mir()),
        );
        self.iter.set_result(r);
        Ok(())
    }

    fn reinterpret_signed(&mut self, val: crate::mir::InsId) -> Result<crate::mir::InsId> {
        let r = self.add(InsKind::TruncateToInt32 { val }, Some(MirType::Int32));
        self.expect_val(r)
    }

    pub(super) fn emit_min_max(&mut self, ty: ValType, is_max: bool) -> Result<()> {
        let (lhs, rhs) = self.iter.read_binary(ty)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let mut lhs = self.expect_val(lhs)?;
        let mut rhs = self.expect_val(rhs)?;
        let is_float = matches!(ty, ValType::F32 | ValType::F64);
        if is_float && !self.env.features.asm_js {
            // Quiet signalling NaN operands before the backend's min/max,
            // which assumes quiet inputs. Subtracting a positive zero is a
            // value-preserving quieting; preserve_nan keeps it unfolded.
            let zero = match ty {
                ValType::F32 => ConstVal::F32(0),
                _ => ConstVal::F64(0),
            };
            let zero = self.constant(zero);
            let zero = self.expect_val(zero)?;
            lhs = self.quiet_nan(lhs, zero, ty)?;
            rhs = self.quiet_nan(rhs, zero, ty)?;
        }
        let r = self.add(InsKind::MinMax { lhs, rhs, is_max }, Some(ty.to_mir()));
        self.iter.set_result(r);
        Ok(())
    }

    fn quiet_nan(
        &mut self,
        val: crate::mir::InsId,
        zero: crate::mir::InsId,
        ty: ValType,
    ) -> Result<crate::mir::InsId> {
        let r = self.add(
            InsKind::Binary {
                op: BinOp::Sub,
                lhs: val,
                rhs: zero,
                preserve_nan: true,
            },
            Some(ty.to_mir()),
        );
        self.expect_val(r)
    }

    pub(super) fn emit_float_round(&mut self, ty: ValType, op: UnOp) -> Result<()> {
        let off = self.bytecode_offset();
        let v = self.iter.read_unary(ty)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let val = self.expect_val(v)?;
        if self.env.target.native_float_rounding {
            let r = self.add(InsKind::Unary { op, val }, Some(ty.to_mir()));
            self.iter.set_result(r);
            return Ok(());
        }
        let builtin = match (op, ty) {
            (UnOp::Ceil, ValType::F32) => Builtin::CeilF,
            (UnOp::Ceil, _) => Builtin::CeilD,
            (UnOp::Floor, ValType::F32) => Builtin::FloorF,
            (UnOp::Floor, _) => Builtin::FloorD,
            (UnOp::Trunc, ValType::F32) => Builtin::TruncF,
            (UnOp::Trunc, _) => Builtin::TruncD,
            (UnOp::Nearest, ValType::F32) => Builtin::NearbyIntF,
            _ => Builtin::NearbyIntD,
        };
        let r = self.builtin_call(builtin, &[val], off)?;
        self.iter.set_result(r);
        Ok(())
    }

    // ---- conversions ----

    pub(super) fn emit_wrap_i64(&mut self) -> Result<()> {
        let v = self.iter.read_conversion(ValType::I64, ValType::I32)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let val = self.expect_val(v)?;
        let r = self.add(InsKind::WrapI64 { val }, Some(MirType::Int32));
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_extend_i32(&mut self, unsigned: bool) -> Result<()> {
        let v = self.iter.read_conversion(ValType::I32, ValType::I64)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let val = self.expect_val(v)?;
        let r = self.add(InsKind::ExtendI32 { val, unsigned }, Some(MirType::Int64));
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_sign_extend(&mut self, ty: ValType, from_bits: u8) -> Result<()> {
        let v = self.iter.read_unary(ty)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let val = self.expect_val(v)?;
        let r = self.add(InsKind::SignExtend { val, from_bits }, Some(ty.to_mir()));
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_trunc_to_int(
        &mut self,
        from: ValType,
        to: ValType,
        unsigned: bool,
        saturating: bool,
    ) -> Result<()> {
        let off = self.bytecode_offset();
        let v = self.iter.read_conversion(from, to)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let val = self.expect_val(v)?;
        let r = self.add(
            InsKind::TruncToInt {
                val,
                unsigned,
                saturating,
                bytecode_offset: off,
            },
            Some(to.to_mir()),
        );
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_convert_from_int(
        &mut self,
        from: ValType,
        to: ValType,
        unsigned: bool,
    ) -> Result<()> {
        let v = self.iter.read_conversion(from, to)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let val = self.expect_val(v)?;
        let r = self.add(InsKind::ConvertFromInt { val, unsigned }, Some(to.to_mir()));
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_float_to_float(&mut self, from: ValType, to: ValType) -> Result<()> {
        let v = self.iter.read_conversion(from, to)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let val = self.expect_val(v)?;
        let r = self.add(InsKind::FloatToFloat { val }, Some(to.to_mir()));
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_reinterpret(&mut self, from: ValType, to: ValType) -> Result<()> {
        let v = self.iter.read_conversion(from, to)?;
        if self.in_dead_code() {
            return Ok(());
        }
        let val = self.expect_val(v)?;
        let r = self.add(InsKind::Reinterpret { val }, Some(to.to_mir()));
        self.iter.set_result(r);
        Ok(())
    }

    // ---- references ----

    pub(super) fn emit_ref_null(&mut self) -> Result<()> {
        self.iter.read_ref_null()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let r = self.constant(ConstVal::NullRef);
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_ref_is_null(&mut self) -> Result<()> {
        let v = self.iter.read_ref_is_null()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let v = self.expect_val(v)?;
        let null = self.constant(ConstVal::NullRef);
        let null = self.expect_val(null)?;
        let r = self.add(
            InsKind::Compare {
                op: CmpOp::Eq,
                cmp_ty: CompareType::RefOrNull,
                lhs: v,
                rhs: null,
            },
            Some(MirType::Int32),
        );
        self.iter.set_result(r);
        Ok(())
    }

    pub(super) fn emit_ref_func(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let index = self.iter.read_ref_func()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let idx = self.constant(ConstVal::I32(index as i32));
        let idx = self.expect_val(idx)?;
        let r = self.builtin_instance_call(Builtin::FuncRef, &[idx], off)?;
        self.iter.set_result(r);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::compile::compile_function;
    use crate::env::{Features, FuncCompileInput, FuncDesc, FuncType, ModuleEnv, Target};
    use crate::mir::{BinOp, InsKind, MirGraph, ValType};

    fn env(params: Vec<ValType>, results: Vec<ValType>) -> ModuleEnv {
        let mut env = ModuleEnv::new(Features::default(), Target::default());
        env.types.push(FuncType::new(params, results));
        env.funcs.push(FuncDesc {
            type_index: 0,
            import_tls_slot: None,
        });
        env
    }

    fn compile(env: &ModuleEnv, body: &[u8]) -> MirGraph {
        compile_function(
            env,
            FuncCompileInput {
                index: 0,
                body,
                module_offset: 0,
            },
        )
        .unwrap()
    }

    fn find_kind<'g>(
        g: &'g MirGraph,
        pred: impl Fn(&InsKind) -> bool,
    ) -> Option<&'g InsKind> {
        (0..g.num_ins())
            .map(|i| &g.ins(crate::mir::InsId(i as u32)).kind)
            .find(|k| pred(k))
    }

    #[test]
    fn float_sub_preserves_nan_payloads() {
        let env = env(vec![ValType::F64, ValType::F64], vec![ValType::F64]);
        // local.get 0; local.get 1; f64.sub
        let g = compile(&env, &[0x00, 0x20, 0x00, 0x20, 0x01, 0xA1, 0x0B]);
        match find_kind(&g, |k| matches!(k, InsKind::Binary { op: BinOp::Sub, .. })).unwrap() {
            InsKind::Binary { preserve_nan, .. } => assert!(preserve_nan),
            _ => unreachable!(),
        }
    }

    #[test]
    fn int_sub_does_not_set_preserve_nan() {
        let env = env(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
        let g = compile(&env, &[0x00, 0x20, 0x00, 0x20, 0x01, 0x6B, 0x0B]);
        match find_kind(&g, |k| matches!(k, InsKind::Binary { op: BinOp::Sub, .. })).unwrap() {
            InsKind::Binary { preserve_nan, .. } => assert!(!preserve_nan),
            _ => unreachable!(),
        }
    }

    #[test]
    fn asm_js_allows_float_identity_folding() {
        let mut env = env(vec![ValType::F64, ValType::F64], vec![ValType::F64]);
        env.features.asm_js = true;
        let g = compile(&env, &[0x00, 0x20, 0x00, 0x20, 0x01, 0xA1, 0x0B]);
        match find_kind(&g, |k| matches!(k, InsKind::Binary { op: BinOp::Sub, .. })).unwrap() {
            InsKind::Binary { preserve_nan, .. } => assert!(!preserve_nan),
            _ => unreachable!(),
        }
    }

    #[test]
    fn signed_i32_div_reinterprets_both_operands() {
        let env = env(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
        // local.get 0; local.get 1; i32.div_s
        let g = compile(&env, &[0x00, 0x20, 0x00, 0x20, 0x01, 0x6D, 0x0B]);
        match find_kind(&g, |k| matches!(k, InsKind::DivInt { .. })).unwrap() {
            InsKind::DivInt {
                lhs,
                rhs,
                unsigned,
                trap_on_error,
            } => {
                assert!(!unsigned);
                assert!(trap_on_error);
                assert!(matches!(g.ins(*lhs).kind, InsKind::TruncateToInt32 { .. }));
                assert!(matches!(g.ins(*rhs).kind, InsKind::TruncateToInt32 { .. }));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn asm_js_division_does_not_trap() {
        let mut env = env(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
        env.features.asm_js = true;
        let g = compile(&env, &[0x00, 0x20, 0x00, 0x20, 0x01, 0x6D, 0x0B]);
        match find_kind(&g, |k| matches!(k, InsKind::DivInt { .. })).unwrap() {
            InsKind::DivInt { trap_on_error, .. } => assert!(!trap_on_error),
            _ => unreachable!(),
        }
    }

    #[test]
    fn float_min_quiets_its_operands() {
        let env = env(vec![ValType::F32, ValType::F32], vec![ValType::F32]);
        // local.get 0; local.get 1; f32.min
        let g = compile(&env, &[0x00, 0x20, 0x00, 0x20, 0x01, 0x96, 0x0B]);
        match find_kind(&g, |k| matches!(k, InsKind::MinMax { .. })).unwrap() {
            InsKind::MinMax { lhs, rhs, is_max } => {
                assert!(!is_max);
                for operand in [lhs, rhs] {
                    match &g.ins(*operand).kind {
                        InsKind::Binary {
                            op: BinOp::Sub,
                            preserve_nan,
                            ..
                        } => assert!(preserve_nan),
                        other => panic!("operand not quieted: {:?}", other),
                    }
                }
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn saturating_truncation_sets_the_flag() {
        let env = env(vec![ValType::F64], vec![ValType::I32]);
        // local.get 0; i32.trunc_sat_f64_s (0xFC 0x02)
        let g = compile(&env, &[0x00, 0x20, 0x00, 0xFC, 0x02, 0x0B]);
        match find_kind(&g, |k| matches!(k, InsKind::TruncToInt { .. })).unwrap() {
            InsKind::TruncToInt {
                unsigned,
                saturating,
                ..
            } => {
                assert!(!unsigned);
                assert!(saturating);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn trapping_truncation_records_its_offset() {
        let env = env(vec![ValType::F64], vec![ValType::I32]);
        // local.get 0; i32.trunc_f64_s at offset 3
        let g = compile(&env, &[0x00, 0x20, 0x00, 0xAA, 0x0B]);
        match find_kind(&g, |k| matches!(k, InsKind::TruncToInt { .. })).unwrap() {
            InsKind::TruncToInt {
                saturating,
                bytecode_offset,
                ..
            } => {
                assert!(!saturating);
                assert_eq!(*bytecode_offset, 3);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn eqz_compares_against_a_typed_zero() {
        let env = env(vec![ValType::I64], vec![ValType::I32]);
        // local.get 0; i64.eqz
        let g = compile(&env, &[0x00, 0x20, 0x00, 0x50, 0x0B]);
        match find_kind(&g, |k| matches!(k, InsKind::Compare { .. })).unwrap() {
            InsKind::Compare { cmp_ty, rhs, .. } => {
                assert_eq!(*cmp_ty, crate::mir::CompareType::Int64);
                assert!(matches!(
                    g.ins(*rhs).kind,
                    InsKind::Const(crate::mir::ConstVal::I64(0))
                ));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn asm_js_integer_min_is_not_quieted() {
        let mut env = env(vec![ValType::I32, ValType::I32], vec![ValType::I32]);
        env.features.asm_js = true;
        // local.get 0; local.get 1; moz i32.min (0xFF 0x00)
        let g = compile(&env, &[0x00, 0x20, 0x00, 0x20, 0x01, 0xFF, 0x00, 0x0B]);
        match find_kind(&g, |k| matches!(k, InsKind::MinMax { .. })).unwrap() {
            InsKind::MinMax { lhs, rhs, .. } => {
                for operand in [lhs, rhs] {
                    assert!(matches!(g.ins(*operand).kind, InsKind::Param { .. }));
                }
            }
            _ => unreachable!(),
        }
    }
}
