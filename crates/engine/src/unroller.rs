//! Static loop unrolling for speculative loop tests.
//!
//! A tested loop is unrolled `factor` times inside a clone of its function.
//! Every iteration copy starts with an iteration marker, every exit with a
//! termination marker. The last latch leads to an overflow block, so reaching
//! that block means the loop ran longer than the unrolled copies.
use std::time::Instant;

use debloat_ir::{
    BlockId, Function, InstData, InstId, Loop, MarkerKind, ValueId,
};
use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::{
    analysis::FuncAnalyses,
    clone::{copy_blocks, CloneMap},
    config::EngineConfig,
};

/// Bookkeeping of one running loop test.
#[derive(Debug, Clone)]
pub struct LoopTest {
    pub id: u32,
    pub started: Instant,
    pub iterations: u32,
    /// An exit of the loop was reached.
    pub settled: bool,
    /// The loop outlived every unrolled copy.
    pub overflow: bool,
}

impl LoopTest {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            started: Instant::now(),
            iterations: 0,
            settled: false,
            overflow: false,
        }
    }
}

/// A loop in the shape the unroller handles.
#[derive(Debug, Clone)]
pub struct LoopShape {
    pub lp: Loop,
    pub header: BlockId,
    pub latch: BlockId,
    pub preheader: BlockId,
    /// Loop blocks, header first.
    pub blocks: IndexSet<BlockId>,
    pub exits: IndexSet<BlockId>,
}

impl LoopShape {
    /// Returns the shape of the loop headed by `header` if it can be unrolled.
    ///
    /// The loop has to be outermost with a single latch, a preheader and
    /// exits entered from inside the loop only. Values defined in the loop
    /// may only escape through phis of its exits.
    pub fn analyze(
        func: &Function,
        an: &FuncAnalyses,
        header: BlockId,
        config: &EngineConfig,
    ) -> Option<Self> {
        let loops = &an.loops;
        let lp = loops.loop_headed_by(header)?;
        if loops.parent_loop(lp).is_some() {
            return None;
        }

        let latches = loops.latches(&an.cfg, lp);
        let [latch] = latches.as_slice() else {
            return None;
        };
        let preheader = loops.preheader(&an.cfg, lp)?;

        let blocks = loops.blocks(&an.cfg, lp);
        let exits = loops.exit_blocks(&an.cfg, lp);
        let dedicated = exits.iter().all(|&exit| {
            an.cfg
                .preds_of(exit)
                .all(|&pred| loops.is_in_loop(pred, lp))
        });
        if !dedicated {
            return None;
        }

        for &block in &blocks {
            for inst in func.layout.iter_inst(block) {
                if matches!(func.dfg.inst(inst), InstData::Marker { .. }) {
                    return None;
                }
                let Some(result) = func.dfg.inst_result(inst) else {
                    continue;
                };
                for &user in func.dfg.users(result) {
                    if !func.layout.is_inst_inserted(user) {
                        continue;
                    }
                    let user_block = func.layout.inst_block(user);
                    if loops.is_in_loop(user_block, lp) {
                        continue;
                    }
                    if !(func.dfg.is_phi(user) && exits.contains(&user_block)) {
                        return None;
                    }
                }
            }
        }

        let size: usize = blocks
            .iter()
            .map(|&block| func.layout.iter_inst(block).count())
            .sum();
        let hinted = func.meta.unroll_hints.contains(&header);
        if !hinted && size.saturating_mul(config.unroll_factor as usize) > config.max_unrolled_insts
        {
            return None;
        }

        Some(Self {
            lp,
            header,
            latch: *latch,
            preheader,
            blocks,
            exits,
        })
    }
}

/// Unrolls the loop `factor` times in place and instruments it for `test`.
pub fn unroll(func: &mut Function, shape: &LoopShape, factor: u32, test: u32) {
    let blocks: Vec<_> = shape.blocks.iter().copied().collect();
    let header_phis = leading_phis(func, shape.header);

    let latch_values: Vec<(InstId, ValueId)> = header_phis
        .iter()
        .filter_map(|&phi| {
            let InstData::Phi { values, blocks, .. } = func.dfg.inst(phi) else {
                return None;
            };
            let idx = blocks.iter().position(|&block| block == shape.latch)?;
            Some((phi, values[idx]))
        })
        .collect();

    let exit_incoming: Vec<(InstId, SmallVec<[(ValueId, BlockId); 2]>)> = shape
        .exits
        .iter()
        .flat_map(|&exit| leading_phis(func, exit))
        .map(|phi| {
            let incoming = match func.dfg.inst(phi) {
                InstData::Phi { values, blocks, .. } => values
                    .iter()
                    .zip(blocks.iter())
                    .filter(|(_, block)| shape.blocks.contains(*block))
                    .map(|(value, block)| (*value, *block))
                    .collect(),
                _ => SmallVec::new(),
            };
            (phi, incoming)
        })
        .collect();

    let mut cursor = func
        .layout
        .iter_block()
        .filter(|block| shape.blocks.contains(block))
        .last()
        .unwrap_or(shape.header);

    let mut copies = vec![CloneMap::default()];
    for _ in 1..factor.max(1) {
        let map = copy_blocks(func, &blocks, cursor);
        cursor = map.block(*blocks.last().unwrap_or(&shape.header));
        copies.push(map);
    }

    for &(phi, _) in &latch_values {
        func.dfg.remove_phi_arg(phi, shape.latch);
    }
    for c in 1..copies.len() {
        let (prev, cur) = (&copies[c - 1], &copies[c]);
        for &(phi, latch_value) in &latch_values {
            let Some(copy) = cur.inst(phi) else {
                continue;
            };
            let ty = match func.dfg.inst(copy) {
                InstData::Phi { ty, .. } => ty.clone(),
                _ => continue,
            };
            let mut data = InstData::phi(ty);
            data.append_phi_arg(prev.value(latch_value), prev.block(shape.latch));
            func.dfg.replace_inst(copy, data);
        }
    }

    for c in 0..copies.len() {
        let latch = copies[c].block(shape.latch);
        let header = copies[c].block(shape.header);
        let Some(term) = func.layout.last_inst_of(latch) else {
            continue;
        };
        let next = match copies.get(c + 1) {
            Some(next) => next.block(shape.header),
            None => {
                let overflow = func.dfg.make_block();
                func.layout.insert_block_after(overflow, cursor);
                append(func, overflow, InstData::Marker {
                    kind: MarkerKind::Overflow,
                    test,
                });
                append(func, overflow, InstData::Unreachable);
                overflow
            }
        };
        func.dfg.rewrite_branch_dest(term, header, next);
    }

    for (phi, incoming) in &exit_incoming {
        for copy in &copies[1..] {
            for &(value, block) in incoming {
                func.dfg
                    .append_phi_arg(*phi, copy.value(value), copy.block(block));
            }
        }
    }

    for copy in &copies {
        let header = copy.block(shape.header);
        insert_after_phis(func, header, MarkerKind::Iteration, test);
    }
    for &exit in &shape.exits {
        insert_after_phis(func, exit, MarkerKind::Termination, test);
    }

    for copy in &copies[1..] {
        for &block in &blocks {
            if func.meta.unroll_hints.contains(&block) {
                func.meta.unroll_hints.insert(copy.block(block));
            }
        }
    }
    func.meta.unroll_hints.remove(&shape.header);
}

fn leading_phis(func: &Function, block: BlockId) -> Vec<InstId> {
    func.layout
        .iter_inst(block)
        .take_while(|&inst| func.dfg.is_phi(inst))
        .collect()
}

fn append(func: &mut Function, block: BlockId, data: InstData) -> InstId {
    let inst = func.dfg.make_inst(data);
    func.layout.append_inst(inst, block);
    inst
}

fn insert_after_phis(func: &mut Function, block: BlockId, kind: MarkerKind, test: u32) {
    let inst = func.dfg.make_inst(InstData::Marker { kind, test });
    match leading_phis(func, block).last() {
        Some(&last) => func.layout.insert_inst_after(inst, last),
        None => func.layout.prepend_inst(inst, block),
    }
}

#[cfg(test)]
mod tests {
    use debloat_ir::{builder::test_util::*, FuncRef, Module, Type};

    use super::*;

    /// `for (i = 0; i < n; i++) {}` returning `i`.
    fn counted_loop(hint: bool) -> (Module, FuncRef, [BlockId; 3]) {
        let mut mb = TestModuleBuilder::new();
        let mut builder = mb.func_builder(&[Type::I32], &Type::I32);
        let entry = builder.append_block();
        let header = builder.append_block();
        let exit = builder.append_block();
        let n = builder.args()[0];

        builder.switch_to_block(entry);
        let zero = builder.make_imm_value(0i32);
        builder.jump(header);

        builder.switch_to_block(header);
        let i = builder.phi(Type::I32, &[(zero, entry)]);
        let one = builder.make_imm_value(1i32);
        let next = builder.add(i, one);
        let cond = builder.slt(next, n);
        builder.br(cond, header, exit);
        builder.append_phi_arg(i, next, header);

        builder.switch_to_block(exit);
        let out = builder.phi(Type::I32, &[(next, header)]);
        builder.ret(Some(out));
        if hint {
            builder.hint_unroll(header);
        }
        let func = builder.finish();
        (mb.build(), func, [entry, header, exit])
    }

    #[test]
    fn shape_requirements() {
        let (module, func, [entry, header, exit]) = counted_loop(false);
        let body = &module.funcs[func];
        let an = FuncAnalyses::compute(body);
        let config = EngineConfig::default();

        let shape = LoopShape::analyze(body, &an, header, &config).unwrap();
        assert_eq!(shape.latch, header);
        assert_eq!(shape.preheader, entry);
        assert_eq!(shape.exits.iter().copied().collect::<Vec<_>>(), vec![exit]);
        assert!(LoopShape::analyze(body, &an, entry, &config).is_none());

        let small = EngineConfig {
            max_unrolled_insts: 8,
            ..EngineConfig::default()
        };
        assert!(LoopShape::analyze(body, &an, header, &small).is_none());

        let (module, func, [_, header, _]) = counted_loop(true);
        let body = &module.funcs[func];
        let an = FuncAnalyses::compute(body);
        assert!(LoopShape::analyze(body, &an, header, &small).is_some());
    }

    #[test]
    fn unroll_three_times() {
        let (mut module, func, [_, header, _]) = counted_loop(false);
        let an = FuncAnalyses::compute(&module.funcs[func]);
        let shape =
            LoopShape::analyze(&module.funcs[func], &an, header, &EngineConfig::default()).unwrap();
        unroll(&mut module.funcs[func], &shape, 3, 7);

        insta::assert_snapshot!(dump_func(&module, func), @r"
        func public %test_func(v0.i32) -> i32 {
            block0:
                jump block1;

            block1:
                v2.i32 = phi (0.i32 block0);
                marker iteration 7;
                v4.i32 = add v2 1.i32;
                v5.i1 = slt v4 v0;
                br v5 block3 block2;

            block3:
                v7.i32 = phi (v4 block1);
                marker iteration 7;
                v8.i32 = add v7 1.i32;
                v9.i1 = slt v8 v0;
                br v9 block4 block2;

            block4:
                v10.i32 = phi (v8 block3);
                marker iteration 7;
                v11.i32 = add v10 1.i32;
                v12.i1 = slt v11 v0;
                br v12 block5 block2;

            block5:
                marker overflow 7;
                unreachable;

            block2:
                v6.i32 = phi (v4 block1) (v8 block3) (v11 block4);
                marker termination 7;
                return v6;
        }
        ");

        let an = FuncAnalyses::compute(&module.funcs[func]);
        assert_eq!(an.loops.loop_num(), 0);
    }
}
