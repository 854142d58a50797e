//! Call lowering and the outbound argument ABI.
//!
//! A call starts a fresh [`CallCompileState`]; each argument runs through
//! the ABI generator and lands in a register list, a split register pair
//! (64-bit values on 32-bit targets), or a `StackArg` node. `finish_call`
//! freezes the state into a single `Call` instruction and bumps the
//! graph-wide high-water mark for stack-passed argument bytes.
//!
//! Builtin calls reuse the same machinery; instance builtins receive the
//! TLS pointer as a leading hidden argument.

use super::FunctionCompiler;
use crate::abi::{AbiArg, CallCompileState};
use crate::env::Builtin;
use crate::mir::{BinOp, Callee, CallIns, ConstVal, InsId, InsKind, MirType};
use anyhow::Result;

impl<'a> FunctionCompiler<'a> {
    fn start_call(&self) -> CallCompileState {
        CallCompileState::new(self.env.target)
    }

    fn pass_arg(&mut self, state: &mut CallCompileState, ty: MirType, value: InsId) -> Result<()> {
        match state.abi.next(ty) {
            AbiArg::Reg(r) => state.reg_args.push((r, value)),
            AbiArg::RegPair(lo, hi) => {
                let low = self.add(InsKind::WrapI64 { val: value }, Some(MirType::Int32));
                let low = self.expect_val(low)?;
                let shift = self.constant(ConstVal::I64(32));
                let shift = self.expect_val(shift)?;
                let shifted = self.add(
                    InsKind::Binary {
                        op: BinOp::ShrU,
                        lhs: value,
                        rhs: shift,
                        preserve_nan: false,
                    },
                    Some(MirType::Int64),
                );
                let shifted = self.expect_val(shifted)?;
                let high = self.add(InsKind::WrapI64 { val: shifted }, Some(MirType::Int32));
                let high = self.expect_val(high)?;
                state.reg_args.push((lo, low));
                state.reg_args.push((hi, high));
            }
            AbiArg::Stack { offset } => {
                let slot = self.add(InsKind::StackArg { offset, value }, None);
                // StackArg is an effect; record its id for the call node.
                if let Some(slot) = slot {
                    state.stack_args.push(slot);
                }
            }
        }
        Ok(())
    }

    fn finish_call(
        &mut self,
        state: CallCompileState,
        callee: Callee,
        ret: Option<MirType>,
        with_tls: bool,
        bytecode_offset: u32,
    ) -> Result<Option<InsId>> {
        let stack_bytes = state.abi.stack_bytes_consumed();
        if stack_bytes > self.graph.max_stack_arg_bytes {
            self.graph.max_stack_arg_bytes = stack_bytes;
        }
        let tls = if with_tls {
            Some(self.tls_pointer)
        } else {
            None
        };
        Ok(self.add(
            InsKind::Call(Box::new(CallIns {
                callee,
                reg_args: state.reg_args,
                stack_args: state.stack_args,
                tls,
                stack_bytes,
                bytecode_offset,
            })),
            ret,
        ))
    }

    /// Call a builtin that runs against the instance; the TLS pointer is
    /// passed first, before the builtin's declared parameters.
    pub(super) fn builtin_instance_call(
        &mut self,
        builtin: Builtin,
        args: &[InsId],
        bytecode_offset: u32,
    ) -> Result<Option<InsId>> {
        let sig = builtin.sig();
        let mut state = self.start_call();
        if sig.takes_instance {
            let tls = self.tls_pointer;
            self.pass_arg(&mut state, MirType::Pointer, tls)?;
        }
        for (&ty, &v) in sig.params.iter().zip(args) {
            self.pass_arg(&mut state, ty, v)?;
        }
        self.finish_call(
            state,
            Callee::Builtin(builtin),
            sig.ret,
            sig.takes_instance,
            bytecode_offset,
        )
    }

    /// Call a pure builtin (the libm-style helpers); no instance pointer.
    pub(super) fn builtin_call(
        &mut self,
        builtin: Builtin,
        args: &[InsId],
        bytecode_offset: u32,
    ) -> Result<Option<InsId>> {
        self.builtin_instance_call(builtin, args, bytecode_offset)
    }

    /// Generational write barrier for a just-written reference cell.
    pub(super) fn post_barrier(&mut self, cell: InsId) -> Result<()> {
        let off = self.bytecode_offset();
        self.builtin_instance_call(Builtin::PostBarrierFiltering, &[cell], off)?;
        Ok(())
    }

    pub(super) fn emit_call(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (index, args) = self.iter.read_call()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let sig = self.env.func_type(index)?.clone();
        let mut state = self.start_call();
        for (ty, v) in sig.params.iter().zip(args) {
            let v = self.expect_val(v)?;
            self.pass_arg(&mut state, ty.to_mir(), v)?;
        }
        let callee = match self.env.func(index)?.import_tls_slot {
            Some(tls_slot) => Callee::Import { tls_slot },
            None => Callee::Func(index),
        };
        let ret = sig.result().map(|t| t.to_mir());
        let r = self.finish_call(state, callee, ret, true, off)?;
        if sig.result().is_some() {
            self.iter.set_result(r);
        }
        Ok(())
    }

    pub(super) fn emit_call_indirect(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        let (type_index, table_index, index, args) = self.iter.read_call_indirect()?;
        if self.in_dead_code() {
            return Ok(());
        }
        let sig = self.env.ty(type_index)?.clone();
        let mut index = self.expect_val(index)?;
        if self.env.features.asm_js {
            // asm.js tables are power-of-two sized; the index is masked
            // instead of bounds-checked.
            let initial = self.env.table(table_index)?.initial;
            let mask = self.constant(ConstVal::I32(initial.wrapping_sub(1) as i32));
            let mask = self.expect_val(mask)?;
            let masked = self.add(
                InsKind::Binary {
                    op: BinOp::And,
                    lhs: index,
                    rhs: mask,
                    preserve_nan: false,
                },
                Some(MirType::Int32),
            );
            index = self.expect_val(masked)?;
        }
        let mut state = self.start_call();
        for (ty, v) in sig.params.iter().zip(args) {
            let v = self.expect_val(v)?;
            self.pass_arg(&mut state, ty.to_mir(), v)?;
        }
        let callee = Callee::Indirect {
            type_index,
            table_index,
            index,
        };
        let ret = sig.result().map(|t| t.to_mir());
        let r = self.finish_call(state, callee, ret, true, off)?;
        if sig.result().is_some() {
            self.iter.set_result(r);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::abi::Reg;
    use crate::compile::compile_function;
    use crate::env::{
        Features, FuncCompileInput, FuncDesc, FuncType, ModuleEnv, TableDesc, Target,
    };
    use crate::mir::{Callee, CallIns, InsId, InsKind, MirGraph, ValType};

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

    fn only_call(g: &MirGraph) -> Box<CallIns> {
        let mut calls: Vec<Box<CallIns>> = (0..g.num_ins())
            .filter_map(|i| match &g.ins(InsId(i as u32)).kind {
                InsKind::Call(c) => Some(c.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 1);
        calls.pop().unwrap()
    }

    #[test]
    fn arguments_spill_to_the_stack_after_the_registers() {
        let mut env = ModuleEnv::new(Features::default(), Target::default());
        // Caller type, then a callee taking eight i32s.
        env.types.push(FuncType::new(vec![], vec![]));
        env.types
            .push(FuncType::new(vec![ValType::I32; 8], vec![ValType::I32]));
        env.funcs.push(FuncDesc {
            type_index: 0,
            import_tls_slot: None,
        });
        env.funcs.push(FuncDesc {
            type_index: 1,
            import_tls_slot: None,
        });
        // Eight i32.const 0, call 1, drop.
        let mut body = vec![0x00];
        for _ in 0..8 {
            body.extend_from_slice(&[0x41, 0x00]);
        }
        body.extend_from_slice(&[0x10, 0x01, 0x1A, 0x0B]);
        let g = compile(&env, &body);
        let call = only_call(&g);
        assert_eq!(call.callee, Callee::Func(1));
        assert_eq!(call.reg_args.len(), 6);
        assert_eq!(call.stack_args.len(), 2);
        assert_eq!(call.stack_bytes, 8);
        assert_eq!(g.max_stack_arg_bytes, 8);
        assert!(call.tls.is_some());
        for id in &call.stack_args {
            assert!(matches!(g.ins(*id).kind, InsKind::StackArg { .. }));
        }
    }

    #[test]
    fn i64_argument_splits_into_a_register_pair_on_32bit() {
        let mut env = ModuleEnv::new(
            Features::default(),
            Target {
                pointer_64: false,
                ..Target::default()
            },
        );
        env.types.push(FuncType::new(vec![], vec![]));
        env.types.push(FuncType::new(vec![ValType::I64], vec![]));
        env.funcs.push(FuncDesc {
            type_index: 0,
            import_tls_slot: None,
        });
        env.funcs.push(FuncDesc {
            type_index: 1,
            import_tls_slot: None,
        });
        // i64.const 0, call 1.
        let g = compile(&env, &[0x00, 0x42, 0x00, 0x10, 0x01, 0x0B]);
        let call = only_call(&g);
        assert_eq!(call.reg_args.len(), 2);
        assert_eq!(call.reg_args[0].0, Reg::Gpr(0));
        assert_eq!(call.reg_args[1].0, Reg::Gpr(1));
        // Low half is a plain wrap, high half wraps a 32-bit right shift.
        assert!(matches!(
            g.ins(call.reg_args[0].1).kind,
            InsKind::WrapI64 { .. }
        ));
        match g.ins(call.reg_args[1].1).kind {
            InsKind::WrapI64 { val } => assert!(matches!(
                g.ins(val).kind,
                InsKind::Binary {
                    op: crate::mir::BinOp::ShrU,
                    ..
                }
            )),
            _ => unreachable!(),
        }
    }

    #[test]
    fn imported_callee_goes_through_its_tls_slot() {
        let mut env = ModuleEnv::new(Features::default(), Target::default());
        env.types.push(FuncType::new(vec![], vec![]));
        env.funcs.push(FuncDesc {
            type_index: 0,
            import_tls_slot: None,
        });
        env.funcs.push(FuncDesc {
            type_index: 0,
            import_tls_slot: Some(3),
        });
        let g = compile(&env, &[0x00, 0x10, 0x01, 0x0B]);
        assert_eq!(only_call(&g).callee, Callee::Import { tls_slot: 3 });
    }

    #[test]
    fn asm_js_indirect_call_masks_the_index() {
        let mut env = ModuleEnv::new(
            Features {
                asm_js: true,
                ..Features::default()
            },
            Target::default(),
        );
        env.types.push(FuncType::new(vec![ValType::I32], vec![]));
        env.funcs.push(FuncDesc {
            type_index: 0,
            import_tls_slot: None,
        });
        env.tables.push(TableDesc {
            elem_ty: ValType::FuncRef,
            initial: 8,
            maximum: Some(8),
        });
        // local.get 0 (argument), local.get 0 (index), call_indirect.
        let g = compile(&env, &[0x00, 0x20, 0x00, 0x20, 0x00, 0x11, 0x00, 0x00, 0x0B]);
        let call = only_call(&g);
        let index = match call.callee {
            Callee::Indirect { index, .. } => index,
            _ => unreachable!(),
        };
        match g.ins(index).kind {
            InsKind::Binary {
                op: crate::mir::BinOp::And,
                rhs,
                ..
            } => assert!(matches!(
                g.ins(rhs).kind,
                InsKind::Const(crate::mir::ConstVal::I32(7))
            )),
            _ => unreachable!(),
        }
    }

    #[test]
    fn plain_indirect_call_keeps_the_raw_index() {
        let mut env = ModuleEnv::new(Features::default(), Target::default());
        env.types.push(FuncType::new(vec![], vec![ValType::I32]));
        env.funcs.push(FuncDesc {
            type_index: 0,
            import_tls_slot: None,
        });
        env.tables.push(TableDesc {
            elem_ty: ValType::FuncRef,
            initial: 16,
            maximum: None,
        });
        // i32.const 2, call_indirect (type 0) (table 0).
        let g = compile(&env, &[0x00, 0x41, 0x02, 0x11, 0x00, 0x00, 0x0B]);
        let call = only_call(&g);
        match call.callee {
            Callee::Indirect {
                type_index,
                table_index,
                index,
            } => {
                assert_eq!(type_index, 0);
                assert_eq!(table_index, 0);
                assert!(matches!(
                    g.ins(index).kind,
                    InsKind::Const(crate::mir::ConstVal::I32(2))
                ));
            }
            _ => unreachable!(),
        }
    }
}
