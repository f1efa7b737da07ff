//! The interprocedural evaluator.
//!
//! One activation of a function is evaluated by draining a worklist of ready
//! blocks. Instructions are folded against the memory of their block, calls
//! either descend into a fresh clone of the callee or are treated opaquely,
//! and loop headers may start a speculative unroll test.
mod call;
mod inst;
mod libcall;
mod term;

use debloat_ir::{
    BlockId, ControlFlowGraph, FuncRef, Function, GvInitializer, InstData, InstId, Module, Type,
    ValueId,
};
use rustc_hash::FxHashSet;

use crate::{
    analysis::FuncAnalyses,
    clone::clone_function,
    config::EngineConfig,
    context::ContextManager,
    error::{EngineError, OutOfBounds, Result},
    func_info::FuncInfoMap,
    memory::{func_addr, Memory},
    modref::ModRefSummary,
    register::{Register, RegisterFile},
    stats::Stats,
    trace::{trace_at, TraceCategory},
    track_info::TrackInfo,
    unroller::{unroll, LoopShape, LoopTest},
};

/// Outcome of evaluating one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcResult {
    /// The result was replaced by a literal or another value.
    Folded,
    /// The instruction stays. Its result may have a register.
    NotFolded,
    /// Operands were unknown, affected memory was invalidated.
    Undecided,
    /// The instruction belongs to a loop that is not unrolled.
    PartOfLoop,
}

/// Reason the evaluation stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Halt {
    /// A fork or thread primitive was reached.
    Abort,
    /// The loop test with this id failed.
    TestFailed(u32),
}

/// Everything a failed loop test rolls back.
#[derive(Debug, Clone)]
pub(crate) struct EngineState {
    pub module: Module,
    pub contexts: ContextManager,
    pub regs: RegisterFile,
    pub funcs: FuncInfoMap,
    pub track: TrackInfo,
    pub halt: Option<Halt>,
    pub tests: Vec<LoopTest>,
    pub depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CallSite {
    pub caller: FuncRef,
    pub block: BlockId,
}

/// One function activation.
#[derive(Debug, Clone)]
pub(crate) struct Frame {
    pub func: FuncRef,
    pub an: FuncAnalyses,
    pub worklist: Vec<BlockId>,
    pub call: Option<CallSite>,
}

/// Specializes a module for the facts known at its entry.
///
/// ```ignore
/// let mut engine = Engine::new(module, EngineConfig::from_env())?;
/// engine.run();
/// let (module, stats) = engine.finish();
/// ```
pub struct Engine {
    config: EngineConfig,
    state: EngineState,
    modref: ModRefSummary,
    read_only: FxHashSet<String>,
    /// Loop headers whose test failed. They are never tried again.
    no_unroll: FxHashSet<(FuncRef, BlockId)>,
    stats: Stats,
    next_test: u32,
}

impl Engine {
    pub fn new(module: Module, config: EngineConfig) -> Result<Self> {
        let entry = module.entry.ok_or(EngineError::MissingEntry)?;
        if module.funcs[entry].is_declaration() {
            return Err(EngineError::EntryIsDeclaration(
                module.funcs[entry].name().to_string(),
            ));
        }

        let read_only = config.load_read_only_list()?;
        let modref = ModRefSummary::compute(&module, config.trace);
        let state = EngineState {
            contexts: ContextManager::new(config.trace),
            regs: RegisterFile::default(),
            funcs: FuncInfoMap::init(&module),
            track: TrackInfo::new(&module),
            halt: None,
            tests: Vec::new(),
            depth: 0,
            module,
        };

        Ok(Self {
            config,
            state,
            modref,
            read_only,
            no_unroll: FxHashSet::default(),
            stats: Stats::default(),
            next_test: 0,
        })
    }

    /// Evaluates the entry function and everything it reaches, then drops
    /// what became dead.
    pub fn run(&mut self) {
        let Some(entry) = self.state.module.entry else {
            return;
        };
        let entry = self.run_function(entry, None);
        self.state.module.entry = Some(entry);
        if self.state.halt == Some(Halt::Abort) {
            log::warn!(target: "debloat", "specialization stopped at a fork or thread primitive");
        }

        self.prune_dead_insts();
        self.discard_unused_clones();
        log::info!(target: "debloat", "{}", self.stats);
    }

    pub fn module(&self) -> &Module {
        &self.state.module
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Returns `true` if the run stopped at a fork or thread primitive.
    pub fn is_aborted(&self) -> bool {
        self.state.halt == Some(Halt::Abort)
    }

    pub fn finish(self) -> (Module, Stats) {
        (self.state.module, self.stats)
    }

    /// Evaluates one activation of `func` and returns the function holding
    /// the result. That is `func` itself unless a loop test replaced it.
    fn run_function(&mut self, func: FuncRef, call: Option<CallSite>) -> FuncRef {
        let body = &self.state.module.funcs[func];
        let Some(entry) = body.layout.entry_block() else {
            return func;
        };
        let an = FuncAnalyses::compute(body);
        self.state.contexts.init_info(func, body, &an);

        match call {
            None => {
                self.state.contexts.create_new_context(func, entry);
                self.init_globals(func, entry);
            }
            Some(site) => {
                let memory = self
                    .memory(site.caller, site.block)
                    .cloned()
                    .unwrap_or_default();
                self.state.contexts.duplicate_from_memory(func, entry, memory);
            }
        }
        self.state.contexts.mark_visited(func, entry);

        trace_at!(
            self.config.trace,
            TraceCategory::Call,
            "enter {} at depth {}",
            self.body(func).name(),
            self.state.depth
        );
        let mut frame = Frame {
            func,
            an,
            worklist: vec![entry],
            call,
        };
        self.state.depth += 1;
        self.drain(&mut frame);
        self.state.depth -= 1;

        let func = frame.func;
        if self.state.halt.is_none() {
            self.commit(func);
        }
        self.state.contexts.cleanup_function(func);
        self.state.regs.cleanup_function(func);
        func
    }

    fn drain(&mut self, frame: &mut Frame) {
        while let Some(block) = frame.worklist.pop() {
            if self.state.halt.is_some() {
                return;
            }

            let is_header = self
                .state
                .contexts
                .info(frame.func, block)
                .is_some_and(|info| info.is_header);
            if is_header {
                self.stats.loops_seen += 1;
                if self.try_unroll(frame, block) {
                    return;
                }
                self.invalidate_loop_writes(frame.func, block, &frame.an);
            }
            self.eval_block(frame, block);
        }
    }

    fn eval_block(&mut self, frame: &mut Frame, block: BlockId) {
        let mut next = self.body(frame.func).layout.first_inst_of(block);
        while let Some(inst) = next {
            if self.body(frame.func).dfg.is_terminator(inst) {
                self.process_term(frame, block, inst);
                return;
            }

            let res = self.eval_inst(frame, block, inst);
            trace_at!(self.config.trace, TraceCategory::Eval, "{inst}: {res:?}");
            if res == ProcResult::Folded {
                self.stats.insts_folded += 1;
            }
            if self.state.halt.is_some() {
                return;
            }
            next = self.body(frame.func).layout.next_inst_of(inst);
        }
    }

    /// Runs a loop test for the loop headed by `header`. Returns `true` if the
    /// test finished the activation, `false` if the loop has to be evaluated
    /// without unrolling.
    fn try_unroll(&mut self, frame: &mut Frame, header: BlockId) -> bool {
        let func = frame.func;
        if !self.config.unroll_loops || self.no_unroll.contains(&(func, header)) {
            return false;
        }
        let Some(shape) = LoopShape::analyze(self.body(func), &frame.an, header, &self.config)
        else {
            return false;
        };

        let snapshot = (self.state.clone(), frame.clone());
        let test = self.next_test;
        self.next_test += 1;
        trace_at!(
            self.config.trace,
            TraceCategory::Loop,
            "test {test}: unroll {header} of {} {} times",
            self.body(func).name(),
            self.config.unroll_factor
        );

        let name = format!("{}.unrolled", self.body(func).name());
        let unrolled = clone_function(&mut self.state.module, func, name);
        self.state.funcs.register_clone(unrolled, func);
        unroll(
            &mut self.state.module.funcs[unrolled],
            &shape,
            self.config.unroll_factor,
            test,
        );

        self.state.contexts.copy_function(func, unrolled);
        self.state.regs.copy_function(func, unrolled);
        self.state.funcs.copy_activation(func, unrolled);
        self.state.contexts.cleanup_function(func);
        self.state.regs.cleanup_function(func);

        let an = FuncAnalyses::compute(self.body(unrolled));
        self.state
            .contexts
            .reshape(unrolled, &self.state.module.funcs[unrolled], &an);
        frame.func = unrolled;
        frame.an = an;
        frame.worklist.push(header);
        self.state.tests.push(LoopTest::new(test));
        self.stats.loops_unrolled += 1;

        self.drain(frame);

        match self.state.halt {
            None => {
                // Nested tests may have replaced the unrolled function again.
                let current = frame.func;
                self.state.tests.retain(|t| t.id != test);
                let original = &self.body(func).sig;
                let (name, linkage) = (original.name().to_string(), original.linkage());
                let sig = &mut self.state.module.funcs[current].sig;
                sig.set_name(name);
                sig.update_linkage(linkage);
                self.state.module.discard(func);
                if self.state.module.entry == Some(func) {
                    self.state.module.entry = Some(current);
                }
                self.stats.loops_passed += 1;
                trace_at!(self.config.trace, TraceCategory::Loop, "test {test} passed");
                true
            }

            Some(Halt::TestFailed(failed)) if failed == test => {
                let overflow = self
                    .state
                    .tests
                    .iter()
                    .any(|t| t.id == test && t.overflow);
                (self.state, *frame) = snapshot;
                self.no_unroll.insert((func, header));
                self.stats.loops_rolled_back += 1;
                if overflow {
                    self.stats.loops_failed += 1;
                }
                trace_at!(
                    self.config.trace,
                    TraceCategory::Loop,
                    "test {test} failed, rolled back"
                );
                false
            }

            Some(Halt::Abort) => {
                (self.state, *frame) = snapshot;
                self.state.halt = Some(Halt::Abort);
                self.stats.loops_rolled_back += 1;
                true
            }

            // An enclosing test failed and its owner rolls back.
            Some(Halt::TestFailed(_)) => true,
        }
    }

    /// Applies what a completed activation proved: unreachable blocks go,
    /// folded terminators become jumps and test markers are dropped.
    fn commit(&mut self, func: FuncRef) {
        let contexts = &self.state.contexts;
        let body = &mut self.state.module.funcs[func];

        let blocks: Vec<_> = body.layout.iter_block().collect();
        let mut dead = Vec::new();
        for &block in &blocks {
            let info = contexts.info(func, block);
            if !info.is_some_and(|info| info.visited && !info.unreachable) {
                dead.push(block);
                continue;
            }

            let single_succ = info.and_then(|info| info.single_succ);
            let term = body.layout.last_inst_of(block);
            if let (Some(succ), Some(term)) = (single_succ, term) {
                if matches!(
                    body.dfg.inst(term),
                    InstData::Branch { .. } | InstData::BrTable { .. }
                ) {
                    body.dfg.replace_inst(term, InstData::jump(succ));
                }
            }
        }

        for &block in &dead {
            let insts: Vec<_> = body.layout.iter_inst(block).collect();
            for inst in insts {
                body.dfg.untrack_inst(inst);
            }
            body.layout.remove_block(block);
        }
        self.stats.blocks_removed += dead.len();

        let cfg = ControlFlowGraph::with_function(body);
        for block in body.layout.iter_block().collect::<Vec<_>>() {
            for inst in body.layout.iter_inst(block).collect::<Vec<_>>() {
                match body.dfg.inst(inst) {
                    InstData::Phi { blocks, .. } => {
                        let stale: Vec<_> = blocks
                            .iter()
                            .copied()
                            .filter(|&pred| !cfg.is_pred_of(pred, block))
                            .collect();
                        for pred in stale {
                            body.dfg.remove_phi_arg(inst, pred);
                        }
                    }
                    InstData::Marker { .. } => {
                        body.dfg.untrack_inst(inst);
                        body.layout.remove_inst(inst);
                    }
                    _ => {}
                }
            }
        }
        trace_at!(
            self.config.trace,
            TraceCategory::Eval,
            "commit {}: removed {} blocks",
            body.name(),
            dead.len()
        );
    }

    /// Gives every global a heap slot and writes the initializers.
    fn init_globals(&mut self, func: FuncRef, entry: BlockId) {
        let EngineState {
            module,
            contexts,
            regs,
            ..
        } = &mut self.state;
        let Some(memory) = contexts.memory_mut(func, entry) else {
            return;
        };

        for (gv, data) in module.gv_store.iter() {
            match memory.allocate_heap(data.ty.size_of()) {
                Ok(addr) => regs.set_global_addr(gv, addr),
                Err(err) => {
                    trace_at!(self.config.trace, TraceCategory::Mem, "{}: {err}", data.symbol)
                }
            }
        }

        for (gv, data) in module.gv_store.iter() {
            let Some(addr) = regs.global_addr(gv) else {
                continue;
            };
            let written = match &data.data {
                Some(init) => write_initializer(memory, regs, &data.ty, init, addr),
                None => Ok(()),
            };
            let known = data.data.is_some() && written.is_ok();
            let constant = known && (data.is_const || self.config.trust_global_initializers);
            if let Err(err) = written.and(memory.set_constant(addr, data.ty.size_of(), constant)) {
                trace_at!(self.config.trace, TraceCategory::Mem, "{}: {err}", data.symbol);
            }
        }
    }

    /// Removes unused instructions without side effects until none is left.
    fn prune_dead_insts(&mut self) {
        let funcs: Vec<_> = self.state.module.iter_functions().collect();
        for func in funcs {
            let body = &mut self.state.module.funcs[func];
            loop {
                let mut changed = false;
                for block in body.layout.iter_block().collect::<Vec<_>>() {
                    for inst in body.layout.iter_inst(block).collect::<Vec<_>>() {
                        if body.dfg.inst(inst).has_side_effect() {
                            continue;
                        }
                        let unused = body
                            .dfg
                            .inst_result(inst)
                            .map_or(true, |result| body.dfg.users_num(result) == 0);
                        if unused {
                            body.dfg.untrack_inst(inst);
                            body.layout.remove_inst(inst);
                            changed = true;
                        }
                    }
                }
                if !changed {
                    break;
                }
            }
        }
    }

    /// Drops clones nothing refers to anymore.
    fn discard_unused_clones(&mut self) {
        loop {
            self.state.funcs.count_uses(&self.state.module);
            let unused: Vec<_> = self
                .state
                .module
                .iter_functions()
                .filter(|&func| {
                    let info = self.state.funcs.get(func);
                    self.state.funcs.is_clone(func)
                        && info.direct_calls == 0
                        && !info.addr_taken
                        && self.state.module.entry != Some(func)
                })
                .collect();
            if unused.is_empty() {
                break;
            }
            for func in unused {
                trace_at!(
                    self.config.trace,
                    TraceCategory::Call,
                    "discard unused {}",
                    self.body(func).name()
                );
                self.state.module.discard(func);
            }
        }
    }

    fn body(&self, func: FuncRef) -> &Function {
        &self.state.module.funcs[func]
    }

    /// Bits of `value` as seen from `func`, `None` if unknown.
    fn fact(&self, func: FuncRef, value: ValueId) -> Option<u64> {
        let dfg = &self.body(func).dfg;
        self.state.regs.fact(func, value, dfg.value(value))
    }

    fn memory(&self, func: FuncRef, block: BlockId) -> Option<&Memory> {
        self.state.contexts.memory(func, block)
    }

    fn memory_mut(&mut self, func: FuncRef, block: BlockId) -> Option<&mut Memory> {
        self.state.contexts.memory_mut(func, block)
    }

    /// Records a register for the result of `inst`. Pointers into a context
    /// object are tracked.
    fn set_register(&mut self, func: FuncRef, inst: InstId, bits: u64, tracked: bool) {
        let Some(result) = self.body(func).dfg.inst_result(inst) else {
            return;
        };
        let ty = self.body(func).dfg.value_ty(result).clone();
        let tracked =
            tracked || (ty.is_pointer() && self.state.track.context_object_at(bits).is_some());
        let bits = bits & ty.mask();
        self.state
            .regs
            .add(func, result, Register::new(bits, ty).tracked(tracked));
    }
}

/// Writes `init` as a value of `ty` at `addr`.
fn write_initializer(
    memory: &mut Memory,
    regs: &RegisterFile,
    ty: &Type,
    init: &GvInitializer,
    addr: u64,
) -> std::result::Result<(), OutOfBounds> {
    let mismatch = OutOfBounds {
        addr,
        size: ty.size_of(),
    };
    match init {
        GvInitializer::Immediate(imm) => memory.store(addr, ty.size_of().clamp(1, 8), imm.as_u64()),
        GvInitializer::Bytes(bytes) => {
            let len = bytes.len().min(ty.size_of() as usize);
            memory.write_bytes(addr, &bytes[..len])
        }
        GvInitializer::Zero => Ok(()),
        GvInitializer::Null => memory.store(addr, 8, 0),
        GvInitializer::GlobalAddr(gv) => {
            let target = regs.global_addr(*gv).ok_or(mismatch)?;
            memory.store(addr, 8, target)
        }
        GvInitializer::FuncAddr(func) => memory.store(addr, 8, func_addr(*func)),
        GvInitializer::Array(elems) => {
            let Type::Array { elem_ty, .. } = ty else {
                return Err(mismatch);
            };
            let elem_size = elem_ty.size_of();
            for (i, elem) in elems.iter().enumerate() {
                write_initializer(memory, regs, elem_ty, elem, addr + i as u64 * elem_size)?;
            }
            Ok(())
        }
        GvInitializer::Struct(fields) => {
            let Type::Struct(field_tys) = ty else {
                return Err(mismatch);
            };
            for (i, (field, field_ty)) in fields.iter().zip(field_tys).enumerate() {
                let offset = ty.field_offset(i).unwrap_or_default();
                write_initializer(memory, regs, field_ty, field, addr + offset)?;
            }
            Ok(())
        }
    }
}
