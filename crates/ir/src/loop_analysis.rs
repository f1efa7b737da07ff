//! Natural loop detection.
use cranelift_entity::{entity_impl, packed_option::PackedOption, PrimaryMap, SecondaryMap};
use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{cfg::ControlFlowGraph, domtree::DomTree, BlockId};

#[derive(Debug, Default, Clone)]
pub struct LoopTree {
    /// Stores loops.
    /// The index of an outer loops is guaranteed to be lower than its inner loops because loops
    /// are found in RPO.
    loops: PrimaryMap<Loop, LoopData>,

    /// Maps blocks to its contained loop.
    /// If the block is contained by multiple nested loops, then the block is mapped to the innermost loop.
    block_to_loop: SecondaryMap<BlockId, PackedOption<Loop>>,
}

impl LoopTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute the `LoopTree` of the function.
    pub fn compute(&mut self, cfg: &ControlFlowGraph, domtree: &DomTree) {
        self.clear();

        // Headers are found in RPO, so outer loops are inserted before inner ones.
        for &block in domtree.rpo() {
            if cfg
                .preds_of(block)
                .any(|&pred| domtree.dominates(block, pred))
            {
                self.loops.push(LoopData {
                    header: block,
                    parent: None.into(),
                    children: SmallVec::new(),
                });
            }
        }

        self.analyze_loops(cfg, domtree);
    }

    /// Returns all loops, outer loops before their inner loops.
    pub fn loops(&self) -> impl DoubleEndedIterator<Item = Loop> {
        self.loops.keys()
    }

    /// Returns all blocks of `lp` in post order, the header comes last.
    pub fn iter_blocks_post_order<'a, 'b>(
        &'a self,
        cfg: &'b ControlFlowGraph,
        lp: Loop,
    ) -> BlocksInLoopPostOrder<'a, 'b> {
        BlocksInLoopPostOrder::new(self, cfg, lp)
    }

    /// Returns all blocks of `lp`, the header first.
    pub fn blocks(&self, cfg: &ControlFlowGraph, lp: Loop) -> IndexSet<BlockId> {
        let mut blocks: Vec<_> = self.iter_blocks_post_order(cfg, lp).collect();
        blocks.reverse();
        blocks.into_iter().collect()
    }

    /// Returns `true` if the `block` is in the `lp`.
    pub fn is_in_loop(&self, block: BlockId, lp: Loop) -> bool {
        let mut loop_of_block = self.loop_of_block(block);
        while let Some(cur_lp) = loop_of_block {
            if lp == cur_lp {
                return true;
            }
            loop_of_block = self.parent_loop(cur_lp);
        }
        false
    }

    /// Returns `true` if `block` belongs to any loop.
    pub fn is_in_any_loop(&self, block: BlockId) -> bool {
        self.block_to_loop[block].is_some()
    }

    /// Returns the loop headed by `block`.
    pub fn loop_headed_by(&self, block: BlockId) -> Option<Loop> {
        self.loop_of_block(block)
            .filter(|&lp| self.loop_header(lp) == block)
    }

    /// Returns the in-loop predecessors of the header.
    pub fn latches(&self, cfg: &ControlFlowGraph, lp: Loop) -> SmallVec<[BlockId; 4]> {
        let header = self.loop_header(lp);
        cfg.preds_of(header)
            .copied()
            .filter(|&pred| self.is_in_loop(pred, lp))
            .collect()
    }

    /// Returns `true` if `from -> to` is a back edge of some loop.
    pub fn is_back_edge(&self, cfg: &ControlFlowGraph, from: BlockId, to: BlockId) -> bool {
        self.loop_headed_by(to)
            .is_some_and(|lp| cfg.is_pred_of(from, to) && self.is_in_loop(from, lp))
    }

    /// Returns the blocks outside of `lp` that are reached from inside it.
    pub fn exit_blocks(&self, cfg: &ControlFlowGraph, lp: Loop) -> IndexSet<BlockId> {
        let mut exits = IndexSet::new();
        for block in self.blocks(cfg, lp) {
            for &succ in cfg.succs_of(block) {
                if !self.is_in_loop(succ, lp) {
                    exits.insert(succ);
                }
            }
        }
        exits
    }

    /// Returns the only out-of-loop predecessor of the header if that block
    /// jumps nowhere else.
    pub fn preheader(&self, cfg: &ControlFlowGraph, lp: Loop) -> Option<BlockId> {
        let header = self.loop_header(lp);
        let mut outside = cfg
            .preds_of(header)
            .copied()
            .filter(|&pred| !self.is_in_loop(pred, lp));
        let pred = outside.next()?;
        (outside.next().is_none() && cfg.succ_num_of(pred) == 1).then_some(pred)
    }

    /// Returns number of loops found.
    pub fn loop_num(&self) -> usize {
        self.loops.len()
    }

    /// Map `block` to `lp`.
    pub fn map_block(&mut self, block: BlockId, lp: Loop) {
        self.block_to_loop[block] = lp.into();
    }

    /// Clear the internal state of `LoopTree`.
    pub fn clear(&mut self) {
        self.loops.clear();
        self.block_to_loop.clear();
    }

    /// Returns header block of the `lp`.
    pub fn loop_header(&self, lp: Loop) -> BlockId {
        self.loops[lp].header
    }

    /// Get parent loop of the `lp` if exists.
    pub fn parent_loop(&self, lp: Loop) -> Option<Loop> {
        self.loops[lp].parent.expand()
    }

    pub fn children_of(&self, lp: Loop) -> &[Loop] {
        &self.loops[lp].children
    }

    /// Returns the loop that the `block` belongs to.
    /// If the `block` belongs to multiple loops, then returns the innermost loop.
    pub fn loop_of_block(&self, block: BlockId) -> Option<Loop> {
        self.block_to_loop[block].expand()
    }

    /// Maps each block to its innermost loop and links loops to their parents.
    fn analyze_loops(&mut self, cfg: &ControlFlowGraph, domtree: &DomTree) {
        let mut worklist = vec![];

        // Inner loops first.
        for cur_lp in self.loops.keys().rev() {
            let cur_lp_header = self.loop_header(cur_lp);

            for &block in cfg.preds_of(cur_lp_header) {
                if domtree.dominates(cur_lp_header, block) {
                    worklist.push(block);
                }
            }

            while let Some(block) = worklist.pop() {
                match self.block_to_loop[block].expand() {
                    Some(lp_of_block) => {
                        let outermost_parent = self.outermost_parent(lp_of_block);
                        if outermost_parent == cur_lp {
                            continue;
                        }

                        self.loops[cur_lp].children.push(outermost_parent);
                        self.loops[outermost_parent].parent = cur_lp.into();

                        let lp_header_of_block = self.loop_header(lp_of_block);
                        worklist.extend(cfg.preds_of(lp_header_of_block));
                    }

                    None => {
                        self.map_block(block, cur_lp);
                        if block != cur_lp_header {
                            worklist.extend(cfg.preds_of(block));
                        }
                    }
                }
            }
        }
    }

    fn outermost_parent(&self, mut lp: Loop) -> Loop {
        while let Some(parent) = self.parent_loop(lp) {
            lp = parent;
        }
        lp
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Loop(u32);
entity_impl!(Loop, "loop");

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoopData {
    header: BlockId,
    parent: PackedOption<Loop>,
    children: SmallVec<[Loop; 4]>,
}

pub struct BlocksInLoopPostOrder<'a, 'b> {
    lpt: &'a LoopTree,
    cfg: &'b ControlFlowGraph,
    lp: Loop,
    stack: Vec<BlockId>,
    block_state: FxHashMap<BlockId, BlockState>,
}

impl<'a, 'b> BlocksInLoopPostOrder<'a, 'b> {
    fn new(lpt: &'a LoopTree, cfg: &'b ControlFlowGraph, lp: Loop) -> Self {
        Self {
            lpt,
            cfg,
            lp,
            stack: vec![lpt.loop_header(lp)],
            block_state: FxHashMap::default(),
        }
    }
}

impl Iterator for BlocksInLoopPostOrder<'_, '_> {
    type Item = BlockId;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(&block) = self.stack.last() {
            match self.block_state.get(&block) {
                Some(BlockState::Visited) => {
                    self.stack.pop();
                    self.block_state.insert(block, BlockState::Finished);
                    return Some(block);
                }

                Some(BlockState::Finished) => {
                    self.stack.pop();
                }

                None => {
                    self.block_state.insert(block, BlockState::Visited);
                    for &succ in self.cfg.succs_of(block) {
                        if !self.block_state.contains_key(&succ)
                            && self.lpt.is_in_loop(succ, self.lp)
                        {
                            self.stack.push(succ);
                        }
                    }
                }
            }
        }

        None
    }
}

enum BlockState {
    Visited,
    Finished,
}
