use std::collections::BTreeSet;

use cranelift_entity::{packed_option::PackedOption, SecondaryMap};
use smallvec::SmallVec;

use crate::{BlockId, Function, InstId};

/// Predecessor and successor sets of every block in a function.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct ControlFlowGraph {
    entry: PackedOption<BlockId>,
    blocks: SecondaryMap<BlockId, BlockNode>,
    /// Blocks ending with `return` or `unreachable`.
    pub exits: SmallVec<[BlockId; 8]>,
}

impl ControlFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_function(func: &Function) -> Self {
        let mut cfg = Self::new();
        cfg.compute(func);
        cfg
    }

    pub fn compute(&mut self, func: &Function) {
        self.clear();

        self.entry = func.layout.entry_block().into();

        for block in func.layout.iter_block() {
            if let Some(last_inst) = func.layout.last_inst_of(block) {
                self.analyze_terminator(func, block, last_inst);
            }
        }
    }

    pub fn preds_of(&self, block: BlockId) -> impl Iterator<Item = &BlockId> {
        self.blocks[block].preds.iter()
    }

    pub fn succs_of(&self, block: BlockId) -> impl Iterator<Item = &BlockId> {
        self.blocks[block].succs.iter()
    }

    pub fn pred_num_of(&self, block: BlockId) -> usize {
        self.blocks[block].preds.len()
    }

    pub fn succ_num_of(&self, block: BlockId) -> usize {
        self.blocks[block].succs.len()
    }

    pub fn is_pred_of(&self, pred: BlockId, block: BlockId) -> bool {
        self.blocks[block].preds.contains(&pred)
    }

    pub fn entry(&self) -> Option<BlockId> {
        self.entry.expand()
    }

    pub fn post_order(&self) -> CfgPostOrder<'_> {
        CfgPostOrder::new(self)
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[to].preds.insert(from);
        self.blocks[from].succs.insert(to);
    }

    pub fn remove_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[to].preds.remove(&from);
        self.blocks[from].succs.remove(&to);
    }

    pub fn clear(&mut self) {
        self.entry = None.into();
        self.blocks.clear();
        self.exits.clear();
    }

    fn analyze_terminator(&mut self, func: &Function, block: BlockId, inst: InstId) {
        if func.dfg.is_exit(inst) {
            self.exits.push(block);
        }

        for dest in func.dfg.branch_info(inst).iter_dests() {
            self.add_edge(block, dest);
        }
    }
}

#[derive(Default, Clone, Debug, PartialEq, Eq)]
struct BlockNode {
    preds: BTreeSet<BlockId>,
    succs: BTreeSet<BlockId>,
}

/// Depth first post order walk from the entry block.
pub struct CfgPostOrder<'a> {
    cfg: &'a ControlFlowGraph,
    node_state: SecondaryMap<BlockId, NodeState>,
    stack: Vec<BlockId>,
}

impl<'a> CfgPostOrder<'a> {
    fn new(cfg: &'a ControlFlowGraph) -> Self {
        Self {
            cfg,
            node_state: SecondaryMap::default(),
            stack: cfg.entry().into_iter().collect(),
        }
    }
}

impl Iterator for CfgPostOrder<'_> {
    type Item = BlockId;

    fn next(&mut self) -> Option<BlockId> {
        while let Some(&block) = self.stack.last() {
            match self.node_state[block] {
                NodeState::Unvisited => {
                    self.node_state[block] = NodeState::Visited;
                    for &succ in self.cfg.succs_of(block) {
                        if self.node_state[succ] == NodeState::Unvisited {
                            self.stack.push(succ);
                        }
                    }
                }
                NodeState::Visited => {
                    self.stack.pop();
                    self.node_state[block] = NodeState::Finished;
                    return Some(block);
                }
                NodeState::Finished => {
                    self.stack.pop();
                }
            }
        }

        None
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    #[default]
    Unvisited,
    Visited,
    Finished,
}
