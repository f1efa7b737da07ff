//! This module contains function layout information including block order and
//! instruction order.
use cranelift_entity::SecondaryMap;

use super::{BlockId, InstId};

#[derive(Debug, Clone, Default)]
pub struct Layout {
    blocks: SecondaryMap<BlockId, BlockNode>,
    insts: SecondaryMap<InstId, InstNode>,
    entry_block: Option<BlockId>,
    last_block: Option<BlockId>,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_block(&self) -> Option<BlockId> {
        self.entry_block
    }

    pub fn last_block(&self) -> Option<BlockId> {
        self.last_block
    }

    pub fn prev_block_of(&self, block: BlockId) -> Option<BlockId> {
        debug_assert!(self.is_block_inserted(block));
        self.blocks[block].prev
    }

    pub fn next_block_of(&self, block: BlockId) -> Option<BlockId> {
        debug_assert!(self.is_block_inserted(block));
        self.blocks[block].next
    }

    pub fn is_block_inserted(&self, block: BlockId) -> bool {
        Some(block) == self.entry_block || self.blocks[block] != BlockNode::default()
    }

    pub fn first_inst_of(&self, block: BlockId) -> Option<InstId> {
        debug_assert!(self.is_block_inserted(block));
        self.blocks[block].first_inst
    }

    pub fn last_inst_of(&self, block: BlockId) -> Option<InstId> {
        debug_assert!(self.is_block_inserted(block));
        self.blocks[block].last_inst
    }

    pub fn prev_inst_of(&self, inst: InstId) -> Option<InstId> {
        debug_assert!(self.is_inst_inserted(inst));
        self.insts[inst].prev
    }

    pub fn next_inst_of(&self, inst: InstId) -> Option<InstId> {
        debug_assert!(self.is_inst_inserted(inst));
        self.insts[inst].next
    }

    /// Returns the block containing `inst`.
    ///
    /// # Panics
    /// Panics if `inst` is not inserted.
    pub fn inst_block(&self, inst: InstId) -> BlockId {
        self.insts[inst]
            .block
            .expect("instruction is not inserted in the layout")
    }

    pub fn is_inst_inserted(&self, inst: InstId) -> bool {
        self.insts[inst].block.is_some()
    }

    pub fn iter_block(&self) -> impl Iterator<Item = BlockId> + '_ {
        BlockIter {
            next: self.entry_block,
            blocks: &self.blocks,
        }
    }

    pub fn iter_inst(&self, block: BlockId) -> impl Iterator<Item = InstId> + '_ {
        debug_assert!(self.is_block_inserted(block));
        InstIter {
            next: self.blocks[block].first_inst,
            insts: &self.insts,
        }
    }

    pub fn block_num(&self) -> usize {
        self.iter_block().count()
    }

    pub fn append_block(&mut self, block: BlockId) {
        debug_assert!(!self.is_block_inserted(block));

        let mut node = BlockNode::default();
        match self.last_block {
            Some(last) => {
                self.blocks[last].next = Some(block);
                node.prev = Some(last);
            }
            None => self.entry_block = Some(block),
        }

        self.blocks[block] = node;
        self.last_block = Some(block);
    }

    pub fn insert_block_after(&mut self, block: BlockId, after: BlockId) {
        debug_assert!(self.is_block_inserted(after));
        debug_assert!(!self.is_block_inserted(block));

        let mut node = BlockNode {
            prev: Some(after),
            ..Default::default()
        };
        match self.blocks[after].next {
            Some(next) => {
                node.next = Some(next);
                self.blocks[next].prev = Some(block);
            }
            None => self.last_block = Some(block),
        }
        self.blocks[after].next = Some(block);
        self.blocks[block] = node;
    }

    /// Unlinks `block` together with all of its instructions.
    pub fn remove_block(&mut self, block: BlockId) {
        debug_assert!(self.is_block_inserted(block));

        let mut next_inst = self.blocks[block].first_inst;
        while let Some(inst) = next_inst {
            next_inst = self.insts[inst].next;
            self.insts[inst] = InstNode::default();
        }

        let BlockNode { prev, next, .. } = self.blocks[block];
        match prev {
            Some(prev) => self.blocks[prev].next = next,
            None => self.entry_block = next,
        }
        match next {
            Some(next) => self.blocks[next].prev = prev,
            None => self.last_block = prev,
        }

        self.blocks[block] = BlockNode::default();
    }

    pub fn append_inst(&mut self, inst: InstId, block: BlockId) {
        debug_assert!(self.is_block_inserted(block));
        debug_assert!(!self.is_inst_inserted(inst));

        let mut node = InstNode::with_block(block);
        match self.blocks[block].last_inst {
            Some(last) => {
                node.prev = Some(last);
                self.insts[last].next = Some(inst);
            }
            None => self.blocks[block].first_inst = Some(inst),
        }

        self.blocks[block].last_inst = Some(inst);
        self.insts[inst] = node;
    }

    pub fn prepend_inst(&mut self, inst: InstId, block: BlockId) {
        debug_assert!(self.is_block_inserted(block));
        debug_assert!(!self.is_inst_inserted(inst));

        let mut node = InstNode::with_block(block);
        match self.blocks[block].first_inst {
            Some(first) => {
                node.next = Some(first);
                self.insts[first].prev = Some(inst);
            }
            None => self.blocks[block].last_inst = Some(inst),
        }

        self.blocks[block].first_inst = Some(inst);
        self.insts[inst] = node;
    }

    pub fn insert_inst_before(&mut self, inst: InstId, before: InstId) {
        debug_assert!(self.is_inst_inserted(before));
        debug_assert!(!self.is_inst_inserted(inst));

        let block = self.inst_block(before);
        let mut node = InstNode::with_block(block);
        match self.insts[before].prev {
            Some(prev) => {
                node.prev = Some(prev);
                self.insts[prev].next = Some(inst);
            }
            None => self.blocks[block].first_inst = Some(inst),
        }
        node.next = Some(before);
        self.insts[before].prev = Some(inst);
        self.insts[inst] = node;
    }

    pub fn insert_inst_after(&mut self, inst: InstId, after: InstId) {
        debug_assert!(self.is_inst_inserted(after));
        debug_assert!(!self.is_inst_inserted(inst));

        let block = self.inst_block(after);
        let mut node = InstNode::with_block(block);
        match self.insts[after].next {
            Some(next) => {
                node.next = Some(next);
                self.insts[next].prev = Some(inst);
            }
            None => self.blocks[block].last_inst = Some(inst),
        }
        node.prev = Some(after);
        self.insts[after].next = Some(inst);
        self.insts[inst] = node;
    }

    /// Remove instruction from the layout.
    pub fn remove_inst(&mut self, inst: InstId) {
        debug_assert!(self.is_inst_inserted(inst));

        let block = self.inst_block(inst);
        let InstNode { prev, next, .. } = self.insts[inst];
        match prev {
            Some(prev) => self.insts[prev].next = next,
            None => self.blocks[block].first_inst = next,
        }
        match next {
            Some(next) => self.insts[next].prev = prev,
            None => self.blocks[block].last_inst = prev,
        }

        self.insts[inst] = InstNode::default();
    }
}

struct BlockIter<'a> {
    next: Option<BlockId>,
    blocks: &'a SecondaryMap<BlockId, BlockNode>,
}

impl Iterator for BlockIter<'_> {
    type Item = BlockId;

    fn next(&mut self) -> Option<BlockId> {
        let next = self.next?;
        self.next = self.blocks[next].next;
        Some(next)
    }
}

struct InstIter<'a> {
    next: Option<InstId>,
    insts: &'a SecondaryMap<InstId, InstNode>,
}

impl Iterator for InstIter<'_> {
    type Item = InstId;

    fn next(&mut self) -> Option<InstId> {
        let next = self.next?;
        self.next = self.insts[next].next;
        Some(next)
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
struct BlockNode {
    prev: Option<BlockId>,
    next: Option<BlockId>,
    first_inst: Option<InstId>,
    last_inst: Option<InstId>,
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
struct InstNode {
    /// An block in which the inst exists.
    block: Option<BlockId>,
    prev: Option<InstId>,
    next: Option<InstId>,
}

impl InstNode {
    fn with_block(block: BlockId) -> Self {
        Self {
            block: Some(block),
            prev: None,
            next: None,
        }
    }
}
