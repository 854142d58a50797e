//! Structured control flow: blocks, loops, if/else, branches.
//!
//! Forward branches cannot know their target block while it does not exist
//! yet, so every branch terminates its block with an unset successor slot
//! and records a `ControlFlowPatch` in the patch table, one level per open
//! label. Closing a label collects its level, creates the join block,
//! repoints every recorded slot at it, and merges the predecessors' local
//! slots and parked branch operands with phis.
//!
//! Loops are the one backward case: the header exists up front, so `br` to
//! a loop label still goes through the patch table but the level is bound
//! to a single synthetic back-edge block when the loop closes, and the
//! header phis (created pessimistically for every local slot and loop
//! parameter) receive their second input then. Phis that turn out
//! redundant are erased again.

use super::{Control, FunctionCompiler};
use crate::mir::{BlockId, InsId, InsKind, Terminator, TrapKind, ValType};
use crate::validate::{EndInfo, LabelKind};
use anyhow::{anyhow, bail, Result};

/// One unset terminator successor slot waiting for its label's join block.
#[derive(Debug, Clone, Copy)]
pub(super) struct ControlFlowPatch {
    pub block: BlockId,
    pub slot: usize,
}

impl<'a> FunctionCompiler<'a> {
    fn expect_vals(&self, values: &[Option<InsId>]) -> Result<Vec<InsId>> {
        values.iter().map(|v| self.expect_val(*v)).collect()
    }

    /// Park branch operands on the departing block for later phi merging.
    fn park(&mut self, block: BlockId, values: &[Option<InsId>]) -> Result<()> {
        let vals = self.expect_vals(values)?;
        self.graph.block_mut(block).stack = vals;
        Ok(())
    }

    fn record_patch(&mut self, relative: u32, block: BlockId, slot: usize) -> Result<()> {
        let idx = self
            .block_patches
            .len()
            .checked_sub(relative as usize + 1)
            .ok_or_else(|| anyhow!("internal: branch depth out of patch-table range"))?;
        self.block_patches[idx].push(ControlFlowPatch { block, slot });
        Ok(())
    }

    // ---- joins ----

    /// Add one predecessor edge to a join under construction, merging its
    /// local slots and parked operands into the join's. Repeated edges from
    /// the same block (a `br_table` with duplicate depths) collapse to one.
    ///
    /// With `result_phis`, the label's results always live in join-owned
    /// phis, even with a single predecessor; without it (loop back edges)
    /// the first predecessor's operands flow through unwrapped so header
    /// phis can see the raw identities.
    fn add_predecessor(&mut self, join: BlockId, pred: BlockId, result_phis: bool) -> Result<()> {
        if self.graph.block(pred).marked {
            return Ok(());
        }
        self.graph.block_mut(pred).marked = true;

        if self.graph.block(join).preds.is_empty() {
            let (slots, stack) = {
                let p = self.graph.block(pred);
                (p.slots.clone(), p.stack.clone())
            };
            let stack = if result_phis {
                let mut phis = Vec::with_capacity(stack.len());
                for v in stack {
                    let ty = self.graph.ins(v).ty;
                    let phi = self.graph.alloc(InsKind::Phi { inputs: vec![v] }, ty);
                    self.graph.block_mut(join).phis.push(phi);
                    phis.push(phi);
                }
                phis
            } else {
                stack
            };
            let j = self.graph.block_mut(join);
            j.slots = slots;
            j.stack = stack;
            j.preds.push(pred);
            return Ok(());
        }

        let n_existing = self.graph.block(join).preds.len();
        for i in 0..self.graph.block(join).slots.len() {
            let cur = self.graph.block(join).slots[i];
            let incoming = self.graph.block(pred).slots[i];
            self.merge_into_slot(join, cur, incoming, n_existing, |g, phi| {
                g.block_mut(join).slots[i] = phi;
            });
        }
        for i in 0..self.graph.block(join).stack.len() {
            let cur = self.graph.block(join).stack[i];
            let incoming = self.graph.block(pred).stack[i];
            self.merge_into_slot(join, cur, incoming, n_existing, |g, phi| {
                g.block_mut(join).stack[i] = phi;
            });
        }
        self.graph.block_mut(join).preds.push(pred);
        Ok(())
    }

    /// Merge one incoming value into a join position: extend the join's own
    /// phi, or create one when the values first disagree.
    fn merge_into_slot(
        &mut self,
        join: BlockId,
        cur: InsId,
        incoming: InsId,
        n_existing: usize,
        install: impl FnOnce(&mut crate::mir::MirGraph, InsId),
    ) {
        if self.graph.block(join).phis.contains(&cur) {
            if let Some(inputs) = self.graph.phi_inputs_mut(cur) {
                inputs.push(incoming);
            }
        } else if cur != incoming {
            let ty = self.graph.ins(incoming).ty;
            let mut inputs = vec![cur; n_existing];
            inputs.push(incoming);
            let phi = self.graph.alloc(InsKind::Phi { inputs }, ty);
            self.graph.block_mut(join).phis.push(phi);
            install(&mut self.graph, phi);
        }
    }

    /// Bind a patch level: create the join block, repoint every recorded
    /// successor slot at it, and merge the predecessors. `None` when the
    /// level is empty (nothing reaches the label).
    fn join_patches(
        &mut self,
        patches: Vec<ControlFlowPatch>,
        loop_depth: u32,
        result_phis: bool,
    ) -> Result<Option<BlockId>> {
        if patches.is_empty() {
            return Ok(None);
        }
        let join = self.graph.new_block(loop_depth, Vec::new());
        for p in &patches {
            let blk = self.graph.block_mut(p.block);
            let term = blk
                .terminator
                .as_mut()
                .ok_or_else(|| anyhow!("internal: branch source lacks a terminator"))?;
            match term.successor_mut(p.slot) {
                Some(slot) => *slot = Some(join),
                None => bail!("internal: branch successor slot {} out of range", p.slot),
            }
            self.add_predecessor(join, p.block, result_phis)?;
        }
        let preds = self.graph.block(join).preds.clone();
        for p in preds {
            self.graph.block_mut(p).marked = false;
        }
        Ok(Some(join))
    }

    /// Close a forward label: bind its patches, continue in the join (or go
    /// dead), and push the label's results for the enclosing frame.
    fn finish_label(&mut self, patches: Vec<ControlFlowPatch>, results: &[ValType]) -> Result<()> {
        match self.join_patches(patches, self.loop_depth, true)? {
            Some(join) => {
                let values = std::mem::take(&mut self.graph.block_mut(join).stack);
                self.curr = Some(join);
                let opts: Vec<Option<InsId>> = values.into_iter().map(Some).collect();
                self.iter.push_operands(results, &opts);
            }
            None => {
                self.curr = None;
                self.iter.push_operands(results, &vec![None; results.len()]);
            }
        }
        Ok(())
    }

    // ---- loops ----

    /// Bind a loop's back edges and settle the header phis. Returns the
    /// substitutions performed while erasing redundant phis, so the caller
    /// can rewrite any result values it captured before the close.
    fn close_loop(
        &mut self,
        patches: Vec<ControlFlowPatch>,
        info: &EndInfo<super::CompilerPolicy>,
    ) -> Result<Vec<(InsId, InsId)>> {
        let header = match info.item.block {
            Some(h) => h,
            None => {
                if !patches.is_empty() {
                    bail!("internal: back edges recorded for a dead loop");
                }
                return Ok(Vec::new());
            }
        };
        let hdr_depth = self.graph.block(header).loop_depth;
        let phis = self.graph.block(header).phis.clone();
        let n_params = info.params.len();
        let n_locals = phis.len() - n_params;

        if let Some(backedge) = self.join_patches(patches, hdr_depth, false)? {
            let stack_vals = std::mem::take(&mut self.graph.block_mut(backedge).stack);
            self.graph.block_mut(backedge).terminator = Some(Terminator::Goto {
                target: Some(header),
            });
            self.graph.block_mut(header).preds.push(backedge);
            for (i, phi) in phis.iter().enumerate() {
                let incoming = if i < n_locals {
                    self.graph.block(backedge).slots[i]
                } else {
                    stack_vals[i - n_locals]
                };
                if let Some(inputs) = self.graph.phi_inputs_mut(*phi) {
                    inputs.push(incoming);
                }
            }
        }

        // Erase phis whose inputs agree; iterate to a fixpoint because one
        // erasure can make another phi's inputs collapse.
        let mut subst = Vec::new();
        loop {
            let mut changed = false;
            for phi in self.graph.block(header).phis.clone() {
                let inputs = self.graph.phi_inputs(phi).to_vec();
                let replacement = match inputs.as_slice() {
                    [single] => Some(*single),
                    [first, second] if *second == phi || second == first => Some(*first),
                    _ => None,
                };
                if let Some(rep) = replacement {
                    self.graph.replace_uses(phi, rep, hdr_depth);
                    self.graph.block_mut(header).phis.retain(|p| *p != phi);
                    subst.push((phi, rep));
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        Ok(subst)
    }

    // ---- label operators ----

    pub(super) fn emit_block(&mut self) -> Result<()> {
        let (sig, values) = self.iter.read_block()?;
        self.block_patches.push(Vec::new());
        self.iter.push_operands(&sig.params, &values);
        Ok(())
    }

    pub(super) fn emit_loop(&mut self) -> Result<()> {
        let (sig, values) = self.iter.read_loop()?;
        self.block_patches.push(Vec::new());
        let pred = match self.curr {
            Some(b) => b,
            None => {
                self.iter
                    .push_operands(&sig.params, &vec![None; sig.params.len()]);
                return Ok(());
            }
        };

        let depth = self.loop_depth + 1;
        let header = self.graph.new_block(depth, Vec::new());
        self.set_terminator(Terminator::Goto {
            target: Some(header),
        });
        self.graph.block_mut(header).preds.push(pred);

        // Pessimistic phis for every local slot; the back edge appends the
        // second input, erasure removes the ones that never needed it.
        let pred_slots = self.graph.block(pred).slots.clone();
        let mut slots = Vec::with_capacity(pred_slots.len());
        for v in pred_slots {
            let ty = self.graph.ins(v).ty;
            let phi = self.graph.alloc(InsKind::Phi { inputs: vec![v] }, ty);
            self.graph.block_mut(header).phis.push(phi);
            slots.push(phi);
        }
        self.graph.block_mut(header).slots = slots;

        // Loop parameters ride the value stack as phis too.
        let mut param_values = Vec::with_capacity(sig.params.len());
        for v in &values {
            let v = self.expect_val(*v)?;
            let ty = self.graph.ins(v).ty;
            let phi = self.graph.alloc(InsKind::Phi { inputs: vec![v] }, ty);
            self.graph.block_mut(header).phis.push(phi);
            param_values.push(Some(phi));
        }

        self.loop_depth = depth;
        self.curr = Some(header);
        self.iter.control_item(0)?.block = Some(header);
        let off = self.bytecode_offset();
        self.add(InsKind::InterruptCheck { bytecode_offset: off }, None);
        self.iter.push_operands(&sig.params, &param_values);
        Ok(())
    }

    pub(super) fn emit_if(&mut self) -> Result<()> {
        let (sig, values, cond) = self.iter.read_if()?;
        self.block_patches.push(Vec::new());
        let pred = match self.curr {
            Some(b) => b,
            None => {
                self.iter.push_operands(&sig.params, &values);
                return Ok(());
            }
        };
        let cond = self.expect_val(cond)?;
        let slots = self.graph.block(pred).slots.clone();
        let then_b = self.graph.new_block(self.loop_depth, slots.clone());
        let else_b = self.graph.new_block(self.loop_depth, slots);
        self.graph.block_mut(then_b).preds.push(pred);
        self.graph.block_mut(else_b).preds.push(pred);
        self.set_terminator(Terminator::Test {
            cond,
            if_true: Some(then_b),
            if_false: Some(else_b),
        });
        self.iter.control_item(0)?.block = Some(else_b);
        self.curr = Some(then_b);
        self.iter.push_operands(&sig.params, &values);
        Ok(())
    }

    pub(super) fn emit_else(&mut self) -> Result<()> {
        let (sig, then_results, param_values) = self.iter.read_else()?;
        if let Some(b) = self.curr {
            self.park(b, &then_results)?;
            self.set_terminator(Terminator::Goto { target: None });
            self.record_patch(0, b, 0)?;
            self.curr = None;
        }
        let item: Control = *self.iter.control_item(0)?;
        // The else block is consumed here; end must not forward it again.
        self.iter.control_item(0)?.block = None;
        match item.block {
            Some(else_b) => {
                self.curr = Some(else_b);
                self.iter.push_operands(&sig.params, &param_values);
            }
            None => {
                self.iter
                    .push_operands(&sig.params, &vec![None; sig.params.len()]);
            }
        }
        Ok(())
    }

    pub(super) fn emit_end(&mut self) -> Result<()> {
        let info = self.iter.read_end()?;
        let mut patches = self
            .block_patches
            .pop()
            .ok_or_else(|| anyhow!("internal: patch table out of sync with labels"))?;

        match info.kind {
            LabelKind::Body => {
                // A branch-free fallthrough returns straight from the
                // current block; otherwise everything merges in a join.
                if patches.is_empty() {
                    if self.curr.is_some() {
                        let values = self.expect_vals(&info.result_values)?;
                        self.set_terminator(Terminator::Return { values });
                        self.curr = None;
                    }
                } else {
                    if let Some(b) = self.curr {
                        self.park(b, &info.result_values)?;
                        self.set_terminator(Terminator::Goto { target: None });
                        patches.push(ControlFlowPatch { block: b, slot: 0 });
                        self.curr = None;
                    }
                    if let Some(join) = self.join_patches(patches, self.loop_depth, true)? {
                        let values = std::mem::take(&mut self.graph.block_mut(join).stack);
                        self.graph.block_mut(join).terminator =
                            Some(Terminator::Return { values });
                    }
                }
            }
            LabelKind::Loop => {
                let live = info.item.block.is_some();
                let subst = self.close_loop(patches, &info)?;
                if live {
                    self.loop_depth -= 1;
                }
                let mut results = info.result_values.clone();
                for v in results.iter_mut() {
                    if let Some(id) = v {
                        let mut cur = *id;
                        let mut moved = true;
                        while moved {
                            moved = false;
                            for (old, new) in &subst {
                                if cur == *old {
                                    cur = *new;
                                    moved = true;
                                }
                            }
                        }
                        *v = Some(cur);
                    }
                }
                self.iter.push_operands(&info.results, &results);
            }
            LabelKind::Block | LabelKind::Then | LabelKind::Else => {
                if let Some(b) = self.curr {
                    self.park(b, &info.result_values)?;
                    self.set_terminator(Terminator::Goto { target: None });
                    patches.push(ControlFlowPatch { block: b, slot: 0 });
                }
                if info.kind == LabelKind::Then {
                    // If without else: the hidden arm forwards the params
                    // (which type-checking made equal to the results).
                    if let Some(else_b) = info.item.block {
                        self.park(else_b, &info.param_values)?;
                        self.graph.block_mut(else_b).terminator =
                            Some(Terminator::Goto { target: None });
                        patches.push(ControlFlowPatch {
                            block: else_b,
                            slot: 0,
                        });
                    }
                }
                self.finish_label(patches, &info.results)?;
            }
        }
        Ok(())
    }

    // ---- branch operators ----

    pub(super) fn emit_br(&mut self) -> Result<()> {
        let (depth, _types, values) = self.iter.read_br()?;
        if let Some(b) = self.curr {
            self.park(b, &values)?;
            self.set_terminator(Terminator::Goto { target: None });
            self.record_patch(depth, b, 0)?;
            self.curr = None;
        }
        Ok(())
    }

    pub(super) fn emit_br_if(&mut self) -> Result<()> {
        let (depth, _types, values, cond) = self.iter.read_br_if()?;
        let b = match self.curr {
            Some(b) => b,
            None => return Ok(()),
        };
        let cond = self.expect_val(cond)?;
        self.park(b, &values)?;
        let slots = self.graph.block(b).slots.clone();
        let fall = self.graph.new_block(self.loop_depth, slots);
        self.graph.block_mut(fall).preds.push(b);
        self.set_terminator(Terminator::Test {
            cond,
            if_true: None,
            if_false: Some(fall),
        });
        self.record_patch(depth, b, 0)?;
        self.curr = Some(fall);
        Ok(())
    }

    pub(super) fn emit_br_table(&mut self) -> Result<()> {
        let (depths, default, _types, values, index) = self.iter.read_br_table()?;
        let b = match self.curr {
            Some(b) => b,
            None => return Ok(()),
        };
        let index = self.expect_val(index)?;
        self.park(b, &values)?;
        self.set_terminator(Terminator::TableSwitch {
            index,
            default: None,
            cases: vec![None; depths.len()],
        });
        self.record_patch(default, b, 0)?;
        for (i, d) in depths.iter().enumerate() {
            self.record_patch(*d, b, 1 + i)?;
        }
        self.curr = None;
        Ok(())
    }

    pub(super) fn emit_return(&mut self) -> Result<()> {
        let values = self.iter.read_return()?;
        if self.curr.is_some() {
            let vals = self.expect_vals(&values)?;
            self.set_terminator(Terminator::Return { values: vals });
            self.curr = None;
        }
        Ok(())
    }

    pub(super) fn emit_unreachable(&mut self) -> Result<()> {
        let off = self.bytecode_offset();
        self.iter.read_unreachable()?;
        if self.curr.is_some() {
            self.set_terminator(Terminator::Trap {
                kind: TrapKind::Unreachable,
                bytecode_offset: off,
            });
            self.curr = None;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::compile::compile_function;
    use crate::env::{Features, FuncCompileInput, FuncDesc, FuncType, ModuleEnv, Target};
    use crate::mir::{InsKind, MirGraph, Terminator, ValType};

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

    fn phi_count(g: &MirGraph) -> usize {
        g.blocks().map(|b| b.phis.len()).sum()
    }

    #[test]
    fn constant_return_is_one_block() {
        let env = env(vec![], vec![ValType::I32]);
        // (locals: none) i32.const 42; end
        let g = compile(&env, &[0x00, 0x41, 0x2A, 0x0B]);
        assert_eq!(g.num_blocks(), 1);
        let entry = g.block(g.entry);
        match entry.terminator.as_ref().unwrap() {
            Terminator::Return { values } => assert_eq!(values.len(), 1),
            other => panic!("unexpected terminator {:?}", other),
        }
    }

    #[test]
    fn if_else_results_merge_with_a_phi() {
        let env = env(vec![ValType::I32], vec![ValType::I32]);
        // local.get 0; if (result i32); i32.const 1; else; i32.const 2; end; end
        let body = [
            0x00, 0x20, 0x00, 0x04, 0x7F, 0x41, 0x01, 0x05, 0x41, 0x02, 0x0B, 0x0B,
        ];
        let g = compile(&env, &body);
        assert_eq!(phi_count(&g), 1);
        let phi = g
            .blocks()
            .flat_map(|b| b.phis.iter())
            .next()
            .copied()
            .unwrap();
        match &g.ins(phi).kind {
            InsKind::Phi { inputs } => assert_eq!(inputs.len(), 2),
            other => panic!("unexpected kind {:?}", other),
        }
        // The body's return consumes the merged value.
        let ret = g
            .blocks()
            .filter_map(|b| match &b.terminator {
                Some(Terminator::Return { values }) => Some(values.clone()),
                _ => None,
            })
            .next()
            .unwrap();
        assert_eq!(ret, vec![phi]);
    }

    #[test]
    fn unmutated_local_needs_no_loop_phi() {
        let env = env(vec![ValType::I32], vec![]);
        // loop; local.get 0; br_if 0; end; end
        let body = [0x00, 0x03, 0x40, 0x20, 0x00, 0x0D, 0x00, 0x0B, 0x0B];
        let g = compile(&env, &body);
        assert_eq!(phi_count(&g), 0);
        // The header still has its back edge.
        assert!(g.blocks().any(|b| b.preds.len() == 2));
    }

    #[test]
    fn mutated_local_keeps_its_loop_phi() {
        let env = env(vec![ValType::I32], vec![]);
        // loop; local.get 0; i32.const 1; i32.sub; local.set 0;
        //       local.get 0; br_if 0; end; end
        let body = [
            0x00, 0x03, 0x40, 0x20, 0x00, 0x41, 0x01, 0x6B, 0x21, 0x00, 0x20, 0x00, 0x0D,
            0x00, 0x0B, 0x0B,
        ];
        let g = compile(&env, &body);
        assert_eq!(phi_count(&g), 1);
        let phi = g
            .blocks()
            .flat_map(|b| b.phis.iter())
            .next()
            .copied()
            .unwrap();
        match &g.ins(phi).kind {
            InsKind::Phi { inputs } => {
                assert_eq!(inputs.len(), 2);
                assert_ne!(inputs[0], inputs[1]);
            }
            other => panic!("unexpected kind {:?}", other),
        }
    }

    #[test]
    fn code_after_return_emits_nothing() {
        let env = env(vec![], vec![]);
        // return; i32.const 1; drop; end
        let g = compile(&env, &[0x00, 0x0F, 0x41, 0x01, 0x1A, 0x0B]);
        assert_eq!(g.num_blocks(), 1);
        // Only the TLS pointer and the entry interrupt check were emitted.
        assert_eq!(g.num_ins(), 2);
    }

    #[test]
    fn branch_to_block_label_builds_a_join() {
        let env = env(vec![], vec![]);
        // block; br 0; end; end
        let g = compile(&env, &[0x00, 0x02, 0x40, 0x0C, 0x00, 0x0B, 0x0B]);
        assert_eq!(g.num_blocks(), 2);
        let entry = g.block(g.entry);
        match entry.terminator.as_ref().unwrap() {
            Terminator::Goto { target } => assert!(target.is_some()),
            other => panic!("unexpected terminator {:?}", other),
        }
    }

    #[test]
    fn br_table_duplicate_depths_share_one_edge() {
        let env = env(vec![ValType::I32], vec![]);
        // block; local.get 0; br_table [0 0] default 0; end; end
        let body = [
            0x00, 0x02, 0x40, 0x20, 0x00, 0x0E, 0x02, 0x00, 0x00, 0x00, 0x0B, 0x0B,
        ];
        let g = compile(&env, &body);
        // Join after the block has exactly one predecessor edge.
        let join = g.blocks().find(|b| !b.preds.is_empty()).unwrap();
        assert_eq!(join.preds.len(), 1);
    }

    #[test]
    fn if_without_else_forwards_the_fallthrough() {
        let env = env(vec![ValType::I32], vec![]);
        // local.get 0; if; nop; end; end
        let body = [0x00, 0x20, 0x00, 0x04, 0x40, 0x01, 0x0B, 0x0B];
        let g = compile(&env, &body);
        // Then arm, hidden else arm, and their join all exist.
        assert!(g.num_blocks() >= 4);
        let join = g.blocks().find(|b| b.preds.len() == 2).unwrap();
        assert!(join.phis.is_empty());
    }
}
