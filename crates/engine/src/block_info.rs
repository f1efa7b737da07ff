use debloat_ir::BlockId;
use smallvec::SmallVec;

/// Evaluation state of one block within one activation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockInfo {
    /// The block received a context and was queued for evaluation.
    pub visited: bool,
    pub unreachable: bool,

    /// Number of forward predecessors classified reachable.
    pub r_from: usize,
    /// Number of forward predecessors classified unreachable.
    pub ur_from: usize,
    /// Number of forward predecessors. Back edges never count.
    pub num_preds: usize,

    /// The only successor left after folding the terminator.
    pub single_succ: Option<BlockId>,

    pub part_of_loop: bool,
    pub is_header: bool,
    /// Back edges entering the block if it is a loop header.
    pub latches: SmallVec<[BlockId; 2]>,

    /// Blocks leading here through a chain of single live edges, nearest last.
    pub ancestors: Vec<BlockId>,
}

impl BlockInfo {
    /// Returns `true` once every forward predecessor is classified and at
    /// least one of them is reachable.
    pub fn is_ready(&self) -> bool {
        !self.visited
            && !self.unreachable
            && self.r_from > 0
            && self.r_from + self.ur_from == self.num_preds
    }

    /// Returns `true` once every forward predecessor is known unreachable.
    pub fn is_dead(&self) -> bool {
        self.num_preds > 0 && self.ur_from == self.num_preds
    }

    /// Returns `true` if the edge from `pred` is a back edge into this header.
    pub fn is_latch_of_self(&self, pred: BlockId) -> bool {
        self.latches.contains(&pred)
    }
}
