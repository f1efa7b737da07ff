//! Per-block contexts and reachability bookkeeping.
//!
//! Every visited block owns a context. A context either owns a [`Memory`] or
//! is an image of another context, sharing its memory by reference. Images
//! always point at an owning context, never at another image.
//!
//! A block becomes ready once all of its forward predecessors are classified
//! as reachable or unreachable. Back edges never count, so loop headers do not
//! wait on their own latches.
use cranelift_entity::{entity_impl, PrimaryMap};
use debloat_ir::{BlockId, FuncRef, Function, ValueId};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::{
    analysis::FuncAnalyses,
    block_info::BlockInfo,
    memory::Memory,
    trace::{trace_at, TraceCategories, TraceCategory},
};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u32);
entity_impl!(ContextId, "ctx");

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextData {
    Owned {
        memory: Memory,
        /// Number of live images of this context.
        images: u32,
        /// The block owning the context no longer needs it.
        released: bool,
    },
    ImageOf(ContextId),
    Freed,
}

type BlockKey = (FuncRef, BlockId);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContextManager {
    contexts: PrimaryMap<ContextId, ContextData>,
    block_ctx: FxHashMap<BlockKey, ContextId>,
    infos: FxHashMap<BlockKey, BlockInfo>,
    trace: TraceCategories,
}

impl ContextManager {
    pub fn new(trace: TraceCategories) -> Self {
        Self {
            trace,
            ..Self::default()
        }
    }

    /// Creates the block infos of a fresh activation of `func`.
    pub fn init_info(&mut self, func: FuncRef, body: &Function, an: &FuncAnalyses) {
        for block in body.layout.iter_block() {
            self.infos.insert((func, block), BlockInfo::default());
        }
        self.reshape(func, body, an);
    }

    /// Recomputes the structural fields of every block info of `func` while
    /// keeping the evaluation progress. Used after the body changed shape.
    pub fn reshape(&mut self, func: FuncRef, body: &Function, an: &FuncAnalyses) {
        for block in body.layout.iter_block() {
            let lp = an.loop_headed_by(block);
            let info = self.infos.entry((func, block)).or_default();
            info.num_preds = an.forward_preds(block).count();
            info.part_of_loop = an.loops.is_in_any_loop(block);
            info.is_header = lp.is_some();
            info.latches = lp
                .map(|lp| an.loops.latches(&an.cfg, lp).into_iter().collect())
                .unwrap_or_default();
        }
    }

    pub fn info(&self, func: FuncRef, block: BlockId) -> Option<&BlockInfo> {
        self.infos.get(&(func, block))
    }

    fn info_mut(&mut self, func: FuncRef, block: BlockId) -> &mut BlockInfo {
        self.infos.entry((func, block)).or_default()
    }

    pub fn is_visited(&self, func: FuncRef, block: BlockId) -> bool {
        self.info(func, block).is_some_and(|info| info.visited)
    }

    pub fn is_unreachable(&self, func: FuncRef, block: BlockId) -> bool {
        self.info(func, block).is_some_and(|info| info.unreachable)
    }

    pub fn mark_visited(&mut self, func: FuncRef, block: BlockId) {
        self.info_mut(func, block).visited = true;
    }

    pub fn context_of(&self, func: FuncRef, block: BlockId) -> Option<ContextId> {
        self.block_ctx.get(&(func, block)).copied()
    }

    /// Returns the owning context behind `ctx`.
    pub fn root(&self, mut ctx: ContextId) -> ContextId {
        while let ContextData::ImageOf(source) = self.contexts[ctx] {
            ctx = source;
        }
        ctx
    }

    pub fn data(&self, ctx: ContextId) -> &ContextData {
        &self.contexts[ctx]
    }

    pub fn memory(&self, func: FuncRef, block: BlockId) -> Option<&Memory> {
        let ctx = self.root(self.context_of(func, block)?);
        match &self.contexts[ctx] {
            ContextData::Owned { memory, .. } => Some(memory),
            _ => None,
        }
    }

    pub fn memory_mut(&mut self, func: FuncRef, block: BlockId) -> Option<&mut Memory> {
        let ctx = self.root(self.context_of(func, block)?);
        match &mut self.contexts[ctx] {
            ContextData::Owned { memory, .. } => Some(memory),
            _ => None,
        }
    }

    /// Number of contexts still holding memory.
    pub fn live_memories(&self) -> usize {
        self.contexts
            .values()
            .filter(|data| matches!(data, ContextData::Owned { .. }))
            .count()
    }

    fn push_owned(&mut self, func: FuncRef, block: BlockId, memory: Memory) -> ContextId {
        let ctx = self.contexts.push(ContextData::Owned {
            memory,
            images: 0,
            released: false,
        });
        if let Some(old) = self.block_ctx.insert((func, block), ctx) {
            self.release(old);
        }
        ctx
    }

    /// Gives `block` a context with empty memory. Only the program entry
    /// starts this way.
    pub fn create_new_context(&mut self, func: FuncRef, block: BlockId) -> ContextId {
        trace_at!(self.trace, TraceCategory::Ctx, "new context for {func}:{block}");
        self.push_owned(func, block, Memory::new())
    }

    pub fn duplicate_from_memory(
        &mut self,
        func: FuncRef,
        block: BlockId,
        memory: Memory,
    ) -> ContextId {
        self.push_owned(func, block, memory)
    }

    /// Gives `to` a deep copy of the memory of `from`.
    pub fn duplicate_context(&mut self, func: FuncRef, to: BlockId, from: BlockId) -> ContextId {
        trace_at!(self.trace, TraceCategory::Ctx, "{func}: duplicate {from} into {to}");
        let memory = self.memory(func, from).cloned().unwrap_or_default();
        self.push_owned(func, to, memory)
    }

    /// Makes `to` share the memory of `from`.
    pub fn image_context(&mut self, func: FuncRef, to: BlockId, from: BlockId) -> ContextId {
        trace_at!(self.trace, TraceCategory::Ctx, "{func}: {to} images {from}");
        let Some(source) = self.context_of(func, from) else {
            return self.push_owned(func, to, Memory::new());
        };
        let root = self.root(source);
        if let ContextData::Owned { images, .. } = &mut self.contexts[root] {
            *images += 1;
        }
        let ctx = self.contexts.push(ContextData::ImageOf(root));
        if let Some(old) = self.block_ctx.insert((func, to), ctx) {
            self.release(old);
        }
        ctx
    }

    /// Unifies the memory of `from` into the memory of `block`.
    pub fn merge_context(&mut self, func: FuncRef, block: BlockId, from: BlockId) {
        let (Some(target), Some(source)) = (self.context_of(func, block), self.context_of(func, from))
        else {
            return;
        };
        let (target, source) = (self.root(target), self.root(source));
        if target == source {
            return;
        }

        let mut merged = match &mut self.contexts[target] {
            ContextData::Owned { memory, .. } => std::mem::take(memory),
            _ => return,
        };
        if let ContextData::Owned { memory, .. } = &self.contexts[source] {
            merged.compare_with(memory);
        }
        if let ContextData::Owned { memory, .. } = &mut self.contexts[target] {
            *memory = merged;
        }
        trace_at!(self.trace, TraceCategory::Ctx, "{func}: merged {from} into {block}");
    }

    fn release(&mut self, ctx: ContextId) {
        let root = match &mut self.contexts[ctx] {
            ContextData::ImageOf(root) => *root,
            ContextData::Owned {
                images, released, ..
            } => {
                if *images == 0 {
                    self.contexts[ctx] = ContextData::Freed;
                } else {
                    *released = true;
                }
                return;
            }
            ContextData::Freed => return,
        };

        self.contexts[ctx] = ContextData::Freed;
        if let ContextData::Owned {
            images, released, ..
        } = &mut self.contexts[root]
        {
            *images -= 1;
            if *released && *images == 0 {
                self.contexts[root] = ContextData::Freed;
            }
        }
    }

    /// Drops the context of `block`. Its memory survives while images of it
    /// are alive.
    pub fn free_block(&mut self, func: FuncRef, block: BlockId) {
        if let Some(ctx) = self.block_ctx.remove(&(func, block)) {
            trace_at!(self.trace, TraceCategory::Ctx, "{func}: free {block}");
            self.release(ctx);
        }
    }

    /// Frees `block` if every successor still reachable from it already has
    /// its own context.
    pub fn try_free(&mut self, func: FuncRef, block: BlockId, an: &FuncAnalyses) {
        let consumed = self
            .live_succs(func, block, an)
            .iter()
            .all(|&succ| self.is_visited(func, succ) || self.is_unreachable(func, succ));
        if consumed {
            self.free_block(func, block);
        }
    }

    pub fn free_predecessors(&mut self, func: FuncRef, block: BlockId, an: &FuncAnalyses) {
        for pred in self.live_preds(func, block, an) {
            self.try_free(func, pred, an);
        }
    }

    /// Successors `block` may still transfer control to.
    pub fn live_succs(
        &self,
        func: FuncRef,
        block: BlockId,
        an: &FuncAnalyses,
    ) -> SmallVec<[BlockId; 4]> {
        if let Some(succ) = self.info(func, block).and_then(|info| info.single_succ) {
            return [succ].into_iter().collect();
        }
        an.cfg
            .succs_of(block)
            .copied()
            .filter(|&succ| !self.is_unreachable(func, succ))
            .collect()
    }

    /// Visited forward predecessors whose edge into `block` is live.
    pub fn live_preds(
        &self,
        func: FuncRef,
        block: BlockId,
        an: &FuncAnalyses,
    ) -> SmallVec<[BlockId; 4]> {
        an.forward_preds(block)
            .filter(|&pred| self.is_live_edge(func, pred, block))
            .collect()
    }

    fn is_live_edge(&self, func: FuncRef, pred: BlockId, block: BlockId) -> bool {
        self.info(func, pred).is_some_and(|info| {
            info.visited
                && !info.unreachable
                && info.single_succ.map_or(true, |succ| succ == block)
        })
    }

    /// Returns `false` if `block` may share the memory of its predecessors.
    /// That requires all of them to share one memory and to lead nowhere else.
    pub fn need_to_duplicate(
        &self,
        func: FuncRef,
        block: BlockId,
        preds: &[BlockId],
        an: &FuncAnalyses,
    ) -> bool {
        let Some(root) = preds
            .first()
            .and_then(|&pred| self.context_of(func, pred))
            .map(|ctx| self.root(ctx))
        else {
            return true;
        };

        !preds.iter().all(|&pred| {
            self.context_of(func, pred).map(|ctx| self.root(ctx)) == Some(root)
                && self.live_succs(func, pred, an).as_slice() == [block]
        })
    }

    /// Gives a ready `block` its context from its live predecessors and frees
    /// the predecessors that are no longer needed.
    pub fn enter_block(&mut self, func: FuncRef, block: BlockId, an: &FuncAnalyses) -> bool {
        let preds = self.live_preds(func, block, an);
        let Some(&first) = preds.first() else {
            return false;
        };

        if self.need_to_duplicate(func, block, &preds, an) {
            self.duplicate_context(func, block, first);
            for &pred in &preds[1..] {
                self.merge_context(func, block, pred);
            }
        } else {
            self.image_context(func, block, first);
        }

        self.add_ancestor(func, block, &preds, an);
        self.mark_visited(func, block);
        self.free_predecessors(func, block, an);
        true
    }

    /// Records the straight path leading to `block`.
    pub fn add_ancestor(
        &mut self,
        func: FuncRef,
        block: BlockId,
        preds: &[BlockId],
        an: &FuncAnalyses,
    ) {
        let ancestors = match preds {
            [pred] if self.live_succs(func, *pred, an).len() == 1 => {
                let mut chain = self
                    .info(func, *pred)
                    .map(|info| info.ancestors.clone())
                    .unwrap_or_default();
                chain.push(*pred);
                chain
            }
            _ => Vec::new(),
        };
        self.info_mut(func, block).ancestors = ancestors;
    }

    /// Returns `true` if `to` is reached from `from` through single live edges
    /// only.
    pub fn straight_path(&self, func: FuncRef, from: BlockId, to: BlockId) -> bool {
        self.info(func, to)
            .is_some_and(|info| info.ancestors.contains(&from))
    }

    fn is_back_edge(&self, func: FuncRef, from: BlockId, to: BlockId) -> bool {
        self.info(func, to)
            .is_some_and(|info| info.is_latch_of_self(from))
    }

    /// Classifies the edge `from -> to` as reachable. Returns `true` if `to`
    /// became ready.
    pub fn visit_block(&mut self, func: FuncRef, from: BlockId, to: BlockId) -> bool {
        if self.is_back_edge(func, from, to) {
            return false;
        }
        let info = self.info_mut(func, to);
        if info.visited || info.unreachable {
            return false;
        }
        info.r_from += 1;
        debug_assert!(info.r_from + info.ur_from <= info.num_preds);
        info.is_ready()
    }

    /// Classifies the edge `from -> to` as unreachable.
    pub fn mark_edge_ur(
        &mut self,
        func: FuncRef,
        from: BlockId,
        to: BlockId,
        an: &FuncAnalyses,
        ready: &mut Vec<BlockId>,
    ) {
        if self.is_back_edge(func, from, to) {
            return;
        }
        let info = self.info_mut(func, to);
        if info.visited || info.unreachable {
            return;
        }
        info.ur_from += 1;
        debug_assert!(info.r_from + info.ur_from <= info.num_preds);

        if info.is_dead() {
            self.propagate_ur(func, to, an, ready);
        } else if info.is_ready() {
            ready.push(to);
        }
    }

    /// Marks `block` and every block it dominates unreachable.
    pub fn propagate_ur(
        &mut self,
        func: FuncRef,
        block: BlockId,
        an: &FuncAnalyses,
        ready: &mut Vec<BlockId>,
    ) {
        let region: Vec<_> = an
            .dom
            .subtree_of(block)
            .into_iter()
            .filter(|&b| !self.is_unreachable(func, b) && !self.is_visited(func, b))
            .collect();
        for &b in &region {
            trace_at!(self.trace, TraceCategory::Ctx, "{func}: {b} is unreachable");
            self.info_mut(func, b).unreachable = true;
        }
        for &b in &region {
            self.mark_successors_as_ur(func, b, an, ready);
        }
    }

    pub fn mark_successors_as_ur(
        &mut self,
        func: FuncRef,
        block: BlockId,
        an: &FuncAnalyses,
        ready: &mut Vec<BlockId>,
    ) {
        let succs: SmallVec<[BlockId; 4]> = an.cfg.succs_of(block).copied().collect();
        for succ in succs {
            self.mark_edge_ur(func, block, succ, an, ready);
        }
    }

    /// Memoizes the successor a folded terminator always takes and classifies
    /// the other edges unreachable. Returns blocks that became ready.
    pub fn fold_to_single_succ(
        &mut self,
        func: FuncRef,
        block: BlockId,
        taken: Option<BlockId>,
        an: &FuncAnalyses,
    ) -> Vec<BlockId> {
        let succs: SmallVec<[BlockId; 4]> = an.cfg.succs_of(block).copied().collect();
        let single = match (taken, succs.as_slice()) {
            (Some(taken), _) => Some(taken),
            (None, [only]) => Some(*only),
            _ => None,
        };

        let mut ready = vec![];
        if let Some(single) = single {
            self.info_mut(func, block).single_succ = Some(single);
            for succ in succs.into_iter().filter(|&succ| succ != single) {
                self.mark_edge_ur(func, block, succ, an, &mut ready);
            }
        }
        ready
    }

    /// Returns the only value a phi can take on the live incoming edges.
    pub fn fold_phi(
        &self,
        func: FuncRef,
        block: BlockId,
        incoming: &[(ValueId, BlockId)],
    ) -> Option<ValueId> {
        let live: SmallVec<[(ValueId, BlockId); 4]> = incoming
            .iter()
            .copied()
            .filter(|&(_, pred)| self.is_live_edge(func, pred, block))
            .collect();

        let mut folded = None;
        for &(value, pred) in &live {
            let superseded = live
                .iter()
                .any(|&(_, other)| other != pred && self.straight_path(func, pred, other));
            if superseded {
                continue;
            }
            match folded {
                None => folded = Some(value),
                Some(prev) if prev == value => {}
                Some(_) => return None,
            }
        }
        folded
    }

    /// Copies the contexts and infos of `from` to `to`. Both functions share
    /// block ids. Images of `to` point at the copies of their sources.
    pub fn copy_function(&mut self, from: FuncRef, to: FuncRef) {
        let mut blocks: Vec<_> = self
            .block_ctx
            .iter()
            .filter(|((func, _), _)| *func == from)
            .map(|((_, block), ctx)| (*block, *ctx))
            .collect();
        blocks.sort_unstable();

        let mut roots: FxHashMap<ContextId, ContextId> = FxHashMap::default();
        for (block, ctx) in blocks {
            let root = self.root(ctx);
            let copy = match roots.get(&root) {
                Some(&copy) => copy,
                None => {
                    let memory = match &self.contexts[root] {
                        ContextData::Owned { memory, .. } => memory.clone(),
                        _ => Memory::new(),
                    };
                    let copy = self.contexts.push(ContextData::Owned {
                        memory,
                        images: 0,
                        released: true,
                    });
                    roots.insert(root, copy);
                    copy
                }
            };

            if ctx == root {
                if let ContextData::Owned { released, .. } = &mut self.contexts[copy] {
                    *released = false;
                }
                self.block_ctx.insert((to, block), copy);
            } else {
                if let ContextData::Owned { images, .. } = &mut self.contexts[copy] {
                    *images += 1;
                }
                let image = self.contexts.push(ContextData::ImageOf(copy));
                self.block_ctx.insert((to, block), image);
            }
        }

        let infos: Vec<_> = self
            .infos
            .iter()
            .filter(|((func, _), _)| *func == from)
            .map(|((_, block), info)| (*block, info.clone()))
            .collect();
        for (block, info) in infos {
            self.infos.insert((to, block), info);
        }
    }

    /// Drops every context and info of `func`.
    pub fn cleanup_function(&mut self, func: FuncRef) {
        let mut blocks: Vec<_> = self
            .block_ctx
            .keys()
            .filter(|(f, _)| *f == func)
            .map(|(_, block)| *block)
            .collect();
        blocks.sort_unstable();
        for block in blocks {
            self.free_block(func, block);
        }
        self.infos.retain(|(f, _), _| *f != func);
    }
}
