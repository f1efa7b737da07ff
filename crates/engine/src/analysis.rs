use debloat_ir::{
    cfg::ControlFlowGraph, domtree::DominatorTreeTraversable, BlockId, DomTree, Function, Loop,
    LoopTree,
};

/// Structural analyses of one function, computed once per activation.
#[derive(Debug, Clone, Default)]
pub struct FuncAnalyses {
    pub cfg: ControlFlowGraph,
    pub domtree: DomTree,
    pub dom: DominatorTreeTraversable,
    pub loops: LoopTree,
}

impl FuncAnalyses {
    pub fn compute(func: &Function) -> Self {
        let cfg = ControlFlowGraph::with_function(func);
        let domtree = DomTree::with_cfg(&cfg);
        let mut dom = DominatorTreeTraversable::default();
        dom.compute(&domtree);
        let mut loops = LoopTree::new();
        loops.compute(&cfg, &domtree);

        Self {
            cfg,
            domtree,
            dom,
            loops,
        }
    }

    pub fn is_back_edge(&self, from: BlockId, to: BlockId) -> bool {
        self.loops.is_back_edge(&self.cfg, from, to)
    }

    /// Predecessors of `block` reached through forward edges only.
    pub fn forward_preds(&self, block: BlockId) -> impl Iterator<Item = BlockId> + '_ {
        self.cfg
            .preds_of(block)
            .copied()
            .filter(move |&pred| !self.is_back_edge(pred, block))
    }

    pub fn loop_headed_by(&self, block: BlockId) -> Option<Loop> {
        self.loops.loop_headed_by(block)
    }
}
