//! Dominator tree.
//!
//! The algorithm is based on Keith D. Cooper., Timothy J. Harvey., and Ken Kennedy.: A Simple, Fast Dominance Algorithm:
//! <https://www.cs.rice.edu/~keith/EMBED/dom.pdf>

use cranelift_entity::{packed_option::PackedOption, SecondaryMap};

use crate::{cfg::ControlFlowGraph, BlockId};

#[derive(Default, Debug, Clone)]
pub struct DomTree {
    doms: SecondaryMap<BlockId, PackedOption<BlockId>>,
    rpo: Vec<BlockId>,
}

impl DomTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cfg(cfg: &ControlFlowGraph) -> Self {
        let mut domtree = Self::new();
        domtree.compute(cfg);
        domtree
    }

    pub fn clear(&mut self) {
        self.doms.clear();
        self.rpo.clear();
    }

    fn entry(&self) -> Option<BlockId> {
        self.rpo.first().copied()
    }

    /// Returns the immediate dominator of the `block`.
    /// Returns None if the `block` is unreachable from the entry block, or the `block` is the entry block itself.
    pub fn idom_of(&self, block: BlockId) -> Option<BlockId> {
        if self.entry() == Some(block) {
            return None;
        }
        self.doms[block].expand()
    }

    /// Returns `true` if block1 strictly dominates block2.
    pub fn strictly_dominates(&self, block1: BlockId, block2: BlockId) -> bool {
        let mut current_block = block2;
        while let Some(block) = self.idom_of(current_block) {
            if block == block1 {
                return true;
            }
            current_block = block;
        }

        false
    }

    /// Returns `true` if block1 dominates block2.
    pub fn dominates(&self, block1: BlockId, block2: BlockId) -> bool {
        block1 == block2 || self.strictly_dominates(block1, block2)
    }

    pub fn compute(&mut self, cfg: &ControlFlowGraph) {
        self.clear();

        self.rpo = cfg.post_order().collect();
        self.rpo.reverse();

        let block_num = self.rpo.len();
        let mut rpo_nums = SecondaryMap::with_capacity(block_num);
        for (i, &block) in self.rpo.iter().enumerate() {
            rpo_nums[block] = (block_num - i) as u32;
        }

        match self.entry() {
            Some(entry) => self.doms[entry] = entry.into(),
            None => return,
        }

        let mut changed = true;
        while changed {
            changed = false;
            for &block in self.rpo.iter().skip(1) {
                let Some(&processed_pred) =
                    cfg.preds_of(block).find(|&&pred| self.doms[pred].is_some())
                else {
                    continue;
                };

                let mut new_dom = processed_pred;
                for &pred in cfg.preds_of(block) {
                    if pred != processed_pred && self.doms[pred].is_some() {
                        new_dom = self.intersect(new_dom, pred, &rpo_nums);
                    }
                }

                if Some(new_dom) != self.doms[block].expand() {
                    changed = true;
                    self.doms[block] = new_dom.into();
                }
            }
        }
    }

    /// Returns `true` if block is reachable from the entry block.
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.doms[block].is_some()
    }

    /// Returns blocks in RPO.
    pub fn rpo(&self) -> &[BlockId] {
        &self.rpo
    }

    fn intersect(
        &self,
        mut b1: BlockId,
        mut b2: BlockId,
        rpo_nums: &SecondaryMap<BlockId, u32>,
    ) -> BlockId {
        while b1 != b2 {
            while rpo_nums[b1] < rpo_nums[b2] {
                match self.doms[b1].expand() {
                    Some(dom) => b1 = dom,
                    None => return b2,
                }
            }
            while rpo_nums[b2] < rpo_nums[b1] {
                match self.doms[b2].expand() {
                    Some(dom) => b2 = dom,
                    None => return b1,
                }
            }
        }

        b1
    }
}

/// Children lists of the dominator tree.
#[derive(Default, Debug, Clone)]
pub struct DominatorTreeTraversable {
    children: SecondaryMap<BlockId, Vec<BlockId>>,
}

impl DominatorTreeTraversable {
    pub fn compute(&mut self, domtree: &DomTree) {
        self.clear();
        for &block in domtree.rpo() {
            if let Some(idom) = domtree.idom_of(block) {
                self.children[idom].push(block)
            }
        }
    }

    pub fn children_of(&self, block: BlockId) -> &[BlockId] {
        &self.children[block]
    }

    /// Returns `block` and every block it dominates, in preorder.
    pub fn subtree_of(&self, block: BlockId) -> Vec<BlockId> {
        let mut subtree = vec![];
        let mut stack = vec![block];
        while let Some(block) = stack.pop() {
            subtree.push(block);
            stack.extend(self.children_of(block).iter().rev());
        }
        subtree
    }

    pub fn clear(&mut self) {
        self.children.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{builder::test_util::*, Type};

    fn calc_dom(mb: TestModuleBuilder) -> DomTree {
        let module = mb.build();
        let func = module.entry.unwrap();
        let cfg = ControlFlowGraph::with_function(&module.funcs[func]);
        DomTree::with_cfg(&cfg)
    }

    #[test]
    fn dom_tree_if_else() {
        let mut test_module_builder = TestModuleBuilder::new();
        let mut builder = test_module_builder.func_builder(&[], &Type::Void);

        let entry_block = builder.append_block();
        let then_block = builder.append_block();
        let else_block = builder.append_block();
        let merge_block = builder.append_block();

        builder.switch_to_block(entry_block);
        let v0 = builder.make_imm_value(true);
        builder.br(v0, else_block, then_block);

        builder.switch_to_block(then_block);
        builder.jump(merge_block);

        builder.switch_to_block(else_block);
        builder.jump(merge_block);

        builder.switch_to_block(merge_block);
        builder.ret(None);
        builder.finish();

        let dom_tree = calc_dom(test_module_builder);
        assert_eq!(dom_tree.idom_of(entry_block), None);
        assert!(dom_tree.is_reachable(entry_block));
        assert_eq!(dom_tree.idom_of(then_block), Some(entry_block));
        assert_eq!(dom_tree.idom_of(else_block), Some(entry_block));
        assert_eq!(dom_tree.idom_of(merge_block), Some(entry_block));
        assert!(!dom_tree.dominates(then_block, merge_block));
    }

    #[test]
    fn unreachable_edge() {
        let mut test_module_builder = TestModuleBuilder::new();
        let mut builder = test_module_builder.func_builder(&[], &Type::Void);

        let a = builder.append_block();
        let b = builder.append_block();
        let c = builder.append_block();
        let d = builder.append_block();
        let e = builder.append_block();

        builder.switch_to_block(a);
        let v0 = builder.make_imm_value(true);
        builder.br(v0, b, c);

        builder.switch_to_block(b);
        builder.jump(e);

        builder.switch_to_block(c);
        builder.jump(e);

        builder.switch_to_block(d);
        builder.jump(e);

        builder.switch_to_block(e);
        builder.ret(None);
        builder.finish();

        let dom_tree = calc_dom(test_module_builder);
        assert_eq!(dom_tree.idom_of(b), Some(a));
        assert_eq!(dom_tree.idom_of(c), Some(a));
        assert_eq!(dom_tree.idom_of(d), None);
        assert!(!dom_tree.is_reachable(d));
        assert_eq!(dom_tree.idom_of(e), Some(a));
    }

    #[test]
    fn loop_with_early_exit() {
        let mut mb = TestModuleBuilder::new();
        let mut builder = mb.func_builder(&[Type::I1], &Type::Void);
        let cond = builder.args()[0];

        let entry = builder.append_block();
        let header = builder.append_block();
        let body = builder.append_block();
        let latch = builder.append_block();
        let early = builder.append_block();
        let exit = builder.append_block();

        builder.switch_to_block(entry);
        builder.jump(header);

        builder.switch_to_block(header);
        builder.br(cond, body, exit);

        builder.switch_to_block(body);
        builder.br(cond, latch, early);

        builder.switch_to_block(latch);
        builder.jump(header);

        builder.switch_to_block(early);
        builder.jump(exit);

        builder.switch_to_block(exit);
        builder.ret(None);
        builder.finish();

        let dom_tree = calc_dom(mb);
        assert_eq!(dom_tree.idom_of(header), Some(entry));
        assert_eq!(dom_tree.idom_of(latch), Some(body));
        assert_eq!(dom_tree.idom_of(early), Some(body));
        assert_eq!(dom_tree.idom_of(exit), Some(header));
        assert!(dom_tree.dominates(header, latch));
        assert!(!dom_tree.dominates(body, exit));

        let mut children = DominatorTreeTraversable::default();
        children.compute(&dom_tree);
        let mut sub = children.subtree_of(body);
        sub.sort();
        assert_eq!(sub, vec![body, latch, early]);
        assert_eq!(children.subtree_of(exit), vec![exit]);
    }
}
