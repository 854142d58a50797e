//! End-to-end compilation over wat fixtures.

use akmon::env::Features;
use akmon::mir::{InsId, InsKind, MirGraph, Terminator};
use akmon::{compile_module, CompileOptions};

fn compile_wat_with(wat_text: &str, options: &CompileOptions) -> Vec<MirGraph> {
    let wasm = wat::parse_str(wat_text).unwrap();
    compile_module(&wasm, options).unwrap().graphs
}

fn compile_wat(wat_text: &str) -> MirGraph {
    let mut graphs = compile_wat_with(wat_text, &CompileOptions::default());
    assert_eq!(graphs.len(), 1);
    graphs.pop().unwrap()
}

fn kinds(g: &MirGraph) -> Vec<&InsKind> {
    (0..g.num_ins())
        .map(|i| &g.ins(InsId(i as u32)).kind)
        .collect()
}

#[test]
fn straight_line_add() {
    let g = compile_wat(
        r#"(module
            (func (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
    );
    assert_eq!(g.num_blocks(), 1);
    assert!(kinds(&g).iter().any(|k| matches!(
        k,
        InsKind::Binary {
            op: akmon::mir::BinOp::Add,
            ..
        }
    )));
    match g.block(g.entry).terminator.as_ref().unwrap() {
        Terminator::Return { values } => assert_eq!(values.len(), 1),
        other => panic!("unexpected terminator {:?}", other),
    }
}

#[test]
fn float_sub_keeps_nan_payloads() {
    // The backend must not fold `x - 0.0` to `x`.
    let g = compile_wat(
        r#"(module
            (func (result f32)
                f32.const nan:0x400001
                f32.const 0
                f32.sub))"#,
    );
    match kinds(&g)
        .iter()
        .find(|k| matches!(k, InsKind::Binary { .. }))
        .unwrap()
    {
        InsKind::Binary { preserve_nan, .. } => assert!(preserve_nan),
        _ => unreachable!(),
    }
}

#[test]
fn block_result_lands_in_a_single_input_phi() {
    let g = compile_wat(
        r#"(module
            (func (result i32)
                (block (result i32)
                    i32.const 7)))"#,
    );
    let join = g.blocks().find(|b| !b.phis.is_empty()).unwrap();
    assert_eq!(join.preds.len(), 1);
    assert_eq!(join.phis.len(), 1);
    match &g.ins(join.phis[0]).kind {
        InsKind::Phi { inputs } => {
            assert_eq!(inputs.len(), 1);
            assert!(matches!(
                g.ins(inputs[0]).kind,
                InsKind::Const(akmon::mir::ConstVal::I32(7))
            ));
        }
        other => panic!("unexpected kind {:?}", other),
    }
    // The function returns the phi.
    let ret = g
        .blocks()
        .find_map(|b| match &b.terminator {
            Some(Terminator::Return { values }) => Some(values.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(ret, vec![join.phis[0]]);
}

#[test]
fn code_after_br_is_dead() {
    let g = compile_wat(
        r#"(module
            (func (result i32)
                (block (result i32)
                    i32.const 1
                    br 0
                    i32.const 2)))"#,
    );
    // Only constant 1 reaches the graph; the join's phi has one input.
    let consts: Vec<i32> = (0..g.num_ins())
        .filter_map(|i| match g.ins(InsId(i as u32)).kind {
            InsKind::Const(akmon::mir::ConstVal::I32(c)) => Some(c),
            _ => None,
        })
        .collect();
    assert_eq!(consts, vec![1]);
    let join = g.blocks().find(|b| !b.phis.is_empty()).unwrap();
    assert_eq!(join.preds.len(), 1);
    assert_eq!(join.phis.len(), 1);
}

#[test]
fn counted_loop_builds_one_phi_and_a_back_edge() {
    let g = compile_wat(
        r#"(module
            (func (param i32)
                (loop $l
                    local.get 0
                    i32.const 1
                    i32.sub
                    local.set 0
                    local.get 0
                    br_if $l)))"#,
    );
    let header = g.blocks().find(|b| b.preds.len() == 2).unwrap();
    assert_eq!(header.loop_depth, 1);
    assert_eq!(header.phis.len(), 1);
    match &g.ins(header.phis[0]).kind {
        InsKind::Phi { inputs } => {
            assert_eq!(inputs.len(), 2);
            assert_ne!(inputs[0], inputs[1]);
        }
        other => panic!("unexpected kind {:?}", other),
    }
    // Loops re-check the interrupt flag in the header.
    let checks = kinds(&g)
        .iter()
        .filter(|k| matches!(k, InsKind::InterruptCheck { .. }))
        .count();
    assert_eq!(checks, 2);
}

#[test]
fn trivial_loop_phi_is_erased() {
    let g = compile_wat(
        r#"(module
            (func (param i32)
                (loop $l
                    local.get 0
                    br_if $l)))"#,
    );
    assert!(g.blocks().all(|b| b.phis.is_empty()));
    assert!(g.blocks().any(|b| b.preds.len() == 2));
}

#[test]
fn memory_load_is_bounds_checked() {
    let g = compile_wat(
        r#"(module
            (memory 1)
            (func (param i32) (result i32)
                local.get 0
                i32.load))"#,
    );
    let ks = kinds(&g);
    assert!(ks.iter().any(|k| matches!(k, InsKind::BoundsCheck { .. })));
    assert!(ks.iter().any(|k| matches!(k, InsKind::Load { .. })));
}

#[test]
fn constant_length_copy_is_inlined() {
    let mut options = CompileOptions::default();
    options.features.bulk_memory = true;
    let graphs = compile_wat_with(
        r#"(module
            (memory 1)
            (func
                i32.const 0
                i32.const 64
                i32.const 8
                memory.copy))"#,
        &options,
    );
    let g = &graphs[0];
    // Length 8 on a 64-bit target: exactly one load and one store, 8 bytes.
    let loads: Vec<u32> = (0..g.num_ins())
        .filter_map(|i| match &g.ins(InsId(i as u32)).kind {
            InsKind::Load { access, .. } => Some(access.byte_size()),
            _ => None,
        })
        .collect();
    let stores: Vec<u32> = (0..g.num_ins())
        .filter_map(|i| match &g.ins(InsId(i as u32)).kind {
            InsKind::Store { access, .. } => Some(access.byte_size()),
            _ => None,
        })
        .collect();
    assert_eq!(loads, vec![8]);
    assert_eq!(stores, vec![8]);
    assert!(!kinds(g).iter().any(|k| matches!(k, InsKind::Call(_))));
}

#[test]
fn direct_call_carries_the_instance_pointer() {
    let graphs = compile_wat_with(
        r#"(module
            (func $callee (param i32) (result i32)
                local.get 0)
            (func (result i32)
                i32.const 5
                call $callee))"#,
        &CompileOptions::default(),
    );
    let g = &graphs[1];
    let call = (0..g.num_ins())
        .find_map(|i| match &g.ins(InsId(i as u32)).kind {
            InsKind::Call(c) => Some(c.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(call.callee, akmon::mir::Callee::Func(0));
    assert!(call.tls.is_some());
    assert_eq!(call.reg_args.len(), 1);
}

#[test]
fn every_function_of_a_mixed_module_compiles() {
    let graphs = compile_wat_with(
        r#"(module
            (memory 1)
            (global $g (mut i32) (i32.const 0))
            (func (param i32) (result i32)
                local.get 0
                (if (result i32)
                    (then i32.const 1)
                    (else i32.const 2)))
            (func (param i32)
                local.get 0
                global.set $g)
            (func (result i32)
                global.get $g))"#,
        &CompileOptions::default(),
    );
    assert_eq!(graphs.len(), 3);
    for g in &graphs {
        assert!(g.num_blocks() >= 1);
        // Every block that terminates the function has a terminator.
        for b in g.blocks() {
            assert!(b.terminator.is_some());
        }
    }
}

// ---- failure paths ----

mod failures {
    use akmon::compile::compile_function;
    use akmon::env::{
        Features, FuncCompileInput, FuncDesc, FuncType, MemoryDesc, ModuleEnv, Target,
    };
    use akmon::mir::ValType;

    fn env(params: Vec<ValType>, results: Vec<ValType>) -> ModuleEnv {
        let mut env = ModuleEnv::new(Features::default(), Target::default());
        env.types.push(FuncType::new(params, results));
        env.funcs.push(FuncDesc {
            type_index: 0,
            import_tls_slot: None,
        });
        env
    }

    fn compile_err(env: &ModuleEnv, body: &[u8]) -> String {
        compile_function(
            env,
            FuncCompileInput {
                index: 0,
                body,
                module_offset: 0,
            },
        )
        .unwrap_err()
        .to_string()
    }

    #[test]
    fn truncated_body_is_rejected() {
        let env = env(vec![], vec![]);
        // i32.const with its immediate missing.
        let msg = compile_err(&env, &[0x00, 0x41]);
        assert!(!msg.is_empty());
    }

    #[test]
    fn operand_type_mismatch_is_rejected() {
        let env = env(vec![], vec![ValType::I32]);
        // f32.const 0; i32.const 1; i32.add
        let body = [0x00, 0x43, 0x00, 0x00, 0x00, 0x00, 0x41, 0x01, 0x6A, 0x0B];
        let msg = compile_err(&env, &body);
        assert!(msg.contains("type") || msg.contains("expected"), "{}", msg);
    }

    #[test]
    fn branch_depth_out_of_range_is_rejected() {
        let env = env(vec![], vec![]);
        // br 5 with no labels open beyond the body.
        let msg = compile_err(&env, &[0x00, 0x0C, 0x05, 0x0B]);
        assert!(!msg.is_empty());
    }

    #[test]
    fn overaligned_atomic_is_rejected() {
        let mut env = env(vec![ValType::I32], vec![ValType::I32]);
        env.features.threads = true;
        env.memory = Some(MemoryDesc {
            initial_pages: 1,
            maximum_pages: None,
            shared: false,
        });
        // i32.atomic.load with align=3 (natural is 2).
        let body = [0x00, 0x20, 0x00, 0xFE, 0x10, 0x03, 0x00, 0x0B];
        let msg = compile_err(&env, &body);
        assert!(!msg.is_empty());
    }

    #[test]
    fn gated_opcode_without_its_feature_is_rejected() {
        let env = env(vec![], vec![]);
        // ref.null func without reference types enabled.
        let msg = compile_err(&env, &[0x00, 0xD0, 0x70, 0x1A, 0x0B]);
        assert!(msg.contains("unknown opcode"), "{}", msg);
    }

    #[test]
    fn value_left_on_stack_is_rejected() {
        let env = env(vec![], vec![]);
        // i32.const 1 with a void result type.
        let msg = compile_err(&env, &[0x00, 0x41, 0x01, 0x0B]);
        assert!(!msg.is_empty());
    }
}

#[test]
fn shared_memory_copy_uses_the_shared_builtin() {
    let mut options = CompileOptions::default();
    options.features = Features {
        threads: true,
        shared_memory: true,
        ..Features::default()
    };
    let graphs = compile_wat_with(
        r#"(module
            (memory 1 1 shared)
            (func (param i32)
                i32.const 0
                i32.const 64
                local.get 0
                memory.copy))"#,
        &options,
    );
    let g = &graphs[0];
    let call = (0..g.num_ins())
        .find_map(|i| match &g.ins(InsId(i as u32)).kind {
            InsKind::Call(c) => Some(c.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        call.callee,
        akmon::mir::Callee::Builtin(akmon::env::Builtin::MemCopyShared)
    );
}
