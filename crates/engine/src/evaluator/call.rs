//! Call sites: specialization policy, cloning and opaque invalidation.
use debloat_ir::{BlockId, CastOp, FuncRef, InstData, InstId, Type, Value, ValueId};
use smallvec::SmallVec;

use super::{inst::Clobber, CallSite, Engine, Halt, ProcResult};
use crate::{
    clone::clone_function,
    func_info::RetFact,
    memory::addr_func,
    register::Register,
    trace::{trace_at, TraceCategory},
    track_info::ContextObject,
};

type CallArgs = SmallVec<[ValueId; 8]>;

impl Engine {
    pub(super) fn process_call(&mut self, func: FuncRef, block: BlockId, inst: InstId) -> ProcResult {
        let Some(callee) = self.resolve_callee(func, inst) else {
            trace_at!(self.config.trace, TraceCategory::Call, "{inst}: unknown callee");
            self.invalidate_call(func, block, inst);
            return ProcResult::Undecided;
        };
        if self.check_fork(callee) {
            return ProcResult::Undecided;
        }

        if self.body(callee).is_declaration() {
            if let Some(res) = self.process_libcall(func, block, inst, callee) {
                return res;
            }
            self.invalidate_call(func, block, inst);
            return ProcResult::Undecided;
        }

        let args = self.call_args(func, inst);
        if !self.satisfy_conds(func, block, inst, callee, &args) {
            trace_at!(
                self.config.trace,
                TraceCategory::Call,
                "{inst}: {} stays opaque",
                self.body(callee).name()
            );
            self.invalidate_call(func, block, inst);
            self.stats.calls_skipped += 1;
            return ProcResult::Undecided;
        }

        self.specialize(func, block, inst, callee, &args)
    }

    /// Arguments of a call, the callee operand of indirect calls excluded.
    pub(super) fn call_args(&self, func: FuncRef, inst: InstId) -> CallArgs {
        match self.body(func).dfg.inst(inst) {
            InstData::Call { args, .. } => args.clone(),
            InstData::CallIndirect { args, .. } => args[1..].iter().copied().collect(),
            _ => CallArgs::new(),
        }
    }

    /// The live function a call site targets, if known.
    pub(super) fn direct_target(&self, func: FuncRef, inst: InstId) -> Option<FuncRef> {
        match self.body(func).dfg.inst(inst) {
            InstData::Call { func: callee, .. } => Some(*callee),
            InstData::CallIndirect { args, .. } => {
                let target = addr_func(self.fact(func, args[0])?)?;
                let module = &self.state.module;
                (module.funcs.get(target).is_some() && !module.is_removed(target)).then_some(target)
            }
            _ => None,
        }
    }

    /// Sets the abort flag if `callee` forks a process or starts a thread.
    pub(super) fn check_fork(&mut self, callee: FuncRef) -> bool {
        let body = self.body(callee);
        let forks = body.is_declaration()
            && matches!(body.name(), "fork" | "vfork" | "pthread_create");
        if !(forks && self.config.abort_on_fork) {
            return false;
        }

        trace_at!(self.config.trace, TraceCategory::Call, "abort at {}", body.name());
        self.state.halt = Some(Halt::Abort);
        true
    }

    /// Returns the target of a call, rewriting a resolvable indirect call
    /// into a direct one first.
    fn resolve_callee(&mut self, func: FuncRef, inst: InstId) -> Option<FuncRef> {
        let target = self.direct_target(func, inst)?;
        let indirect = matches!(self.body(func).dfg.inst(inst), InstData::CallIndirect { .. });
        if !indirect {
            return Some(target);
        }
        if !self.config.simplify_indirect_calls || !self.rewrite_indirect(func, inst, target) {
            return None;
        }
        trace_at!(
            self.config.trace,
            TraceCategory::Call,
            "{inst}: resolved to {}",
            self.body(target).name()
        );
        Some(target)
    }

    /// Turns `inst` into a direct call of `target`. Argument and result
    /// casts are inserted around the call where the types disagree.
    fn rewrite_indirect(&mut self, func: FuncRef, inst: InstId, target: FuncRef) -> bool {
        let InstData::CallIndirect { args, ret_ty } = self.body(func).dfg.inst(inst).clone() else {
            return false;
        };
        let sig = self.body(target).sig.clone();
        let actual = &args[1..];
        let arity_ok = if sig.is_variadic() {
            actual.len() >= sig.args().len()
        } else {
            actual.len() == sig.args().len()
        };
        if !arity_ok || ret_ty.is_void() != sig.ret_ty().is_void() {
            return false;
        }

        let mut arg_casts = SmallVec::<[(usize, CastOp); 4]>::new();
        for (i, param_ty) in sig.args().iter().enumerate() {
            match cast_between(self.body(func).dfg.value_ty(actual[i]), param_ty) {
                Some(Some(code)) => arg_casts.push((i, code)),
                Some(None) => {}
                None => return false,
            }
        }
        let ret_cast = if ret_ty.is_void() {
            None
        } else {
            match cast_between(sig.ret_ty(), &ret_ty) {
                Some(code) => code,
                None => return false,
            }
        };

        let mut new_args: CallArgs = actual.iter().copied().collect();
        for (i, code) in arg_casts {
            let ty = sig.args()[i].clone();
            let arg = new_args[i];
            let body = &mut self.state.module.funcs[func];
            let cast = body.dfg.make_inst(InstData::cast(code, arg, ty.clone()));
            if let Some(res) = body.dfg.make_result(cast) {
                body.dfg.attach_result(cast, res);
                new_args[i] = res;
            }
            body.layout.insert_inst_before(cast, inst);
            self.eval_cast(func, cast, code, arg, &ty);
        }

        let body = &mut self.state.module.funcs[func];
        body.dfg.replace_inst(
            inst,
            InstData::Call {
                func: target,
                args: new_args,
                ret_ty: sig.ret_ty().clone(),
            },
        );
        if let (Some(code), Some(old_res)) = (ret_cast, body.dfg.inst_result(inst)) {
            let new_res = body.dfg.make_value(Value::Inst {
                inst,
                ty: sig.ret_ty().clone(),
            });
            let cast = body.dfg.make_inst(InstData::cast(code, new_res, ret_ty));
            body.dfg.rebind_result(old_res, cast);
            body.dfg.attach_result(inst, new_res);
            body.layout.insert_inst_after(cast, inst);
        }
        true
    }

    /// Decides whether a call is worth a specialized clone of `callee`.
    fn satisfy_conds(
        &self,
        func: FuncRef,
        block: BlockId,
        inst: InstId,
        callee: FuncRef,
        args: &[ValueId],
    ) -> bool {
        let funcs = &self.state.funcs;
        let origin = funcs.origin(callee);
        if self
            .config
            .clone_limit
            .is_some_and(|limit| funcs.get(origin).clone_counter >= limit)
        {
            return false;
        }
        if self
            .state
            .module
            .entry
            .is_some_and(|entry| funcs.origin(entry) == origin)
        {
            return false;
        }
        if self.state.depth >= self.config.max_call_depth {
            return false;
        }

        let caller = self.body(func);
        if let Some(memory) = self.memory(func, block) {
            for effect in caller.meta.call_effects(inst) {
                if effect.is_malloc {
                    return true;
                }
                let touches = effect.is_read || effect.is_write;
                if touches && self.state.track.remain_constant(effect.ctx_id, memory) {
                    return true;
                }
            }
        }

        let bits: SmallVec<[bool; 8]> = args
            .iter()
            .map(|&arg| caller.dfg.value(arg).is_constant() || self.state.regs.is_tracked(func, arg))
            .collect();
        let sig = &self.body(callee).sig;
        let fixed = if sig.is_variadic() {
            sig.args().len()
        } else {
            args.len()
        };
        self.state.track.const_bits_changed(
            funcs.origin(func),
            caller.meta.origin_site(inst),
            &bits,
            fixed,
        )
    }

    /// Clones `callee`, binds the known arguments and evaluates the clone in
    /// the memory of the call site.
    fn specialize(
        &mut self,
        func: FuncRef,
        block: BlockId,
        inst: InstId,
        callee: FuncRef,
        args: &[ValueId],
    ) -> ProcResult {
        let origin = self.state.funcs.origin(callee);
        let num = self.state.funcs.get(origin).clone_counter;
        let name = format!("{}.clone{num}", self.body(origin).name());
        let clone = clone_function(&mut self.state.module, callee, name);
        self.state.funcs.register_clone(clone, callee);
        self.redirect_call(func, inst, clone);
        self.bind_params(func, clone, args);
        self.stats.functions_cloned += 1;

        let done = self.run_function(clone, Some(CallSite { caller: func, block }));
        if self.state.halt.is_some() {
            return ProcResult::Undecided;
        }
        if done != clone {
            self.redirect_call(func, inst, done);
        }

        let (memory, ret) = self.state.funcs.take_activation(done);
        match memory {
            Some(memory) => {
                if let Some(dst) = self.memory_mut(func, block) {
                    dst.copy_from(&memory);
                }
            }
            // The callee never returned, nothing it did is known.
            None => self.invalidate_call(func, block, inst),
        }

        let Some(result) = self.body(func).dfg.inst_result(inst) else {
            return ProcResult::NotFolded;
        };
        match ret {
            RetFact::Literal(imm) => {
                let dfg = &mut self.state.module.funcs[func].dfg;
                let literal = dfg.make_imm_value(imm);
                dfg.change_to_alias(result, literal);
                ProcResult::Folded
            }
            RetFact::Register(reg) => {
                self.state.regs.add(func, result, reg);
                ProcResult::NotFolded
            }
            RetFact::Unset | RetFact::Unknown => ProcResult::NotFolded,
        }
    }

    fn redirect_call(&mut self, func: FuncRef, inst: InstId, target: FuncRef) {
        let dfg = &mut self.state.module.funcs[func].dfg;
        if let InstData::Call { args, ret_ty, .. } = dfg.inst(inst).clone() {
            dfg.replace_inst(
                inst,
                InstData::Call {
                    func: target,
                    args,
                    ret_ty,
                },
            );
        }
    }

    /// Literal arguments become literals of the clone. Other known arguments
    /// become registers of its parameters.
    fn bind_params(&mut self, caller: FuncRef, clone: FuncRef, args: &[ValueId]) {
        let params = self.body(clone).arg_values.clone();
        for (&param, &arg) in params.iter().zip(args) {
            if let Some(imm) = self.literal(caller, arg) {
                let dfg = &mut self.state.module.funcs[clone].dfg;
                let literal = dfg.make_imm_value(imm);
                dfg.change_to_alias(param, literal);
            } else if let Some(bits) = self.fact(caller, arg) {
                let ty = self.body(clone).dfg.value_ty(param).clone();
                let tracked = self.state.regs.is_tracked(caller, arg);
                self.state
                    .regs
                    .add(clone, param, Register::new(bits, ty).tracked(tracked));
            }
        }
    }

    /// Invalidates what an opaque call may write: the memory behind its
    /// pointer arguments and the globals its callee may touch.
    pub(super) fn invalidate_call(&mut self, func: FuncRef, block: BlockId, inst: InstId) {
        let callee = self.direct_target(func, inst);
        let args = self.call_args(func, inst);
        let mut clobbers = self.arg_clobbers(func, inst, callee, &args);

        let gv_store = &self.state.module.gv_store;
        let globals: Vec<_> = match callee {
            Some(callee) => self
                .modref
                .summary_of(self.state.funcs.origin(callee))
                .collect(),
            None => gv_store.iter().map(|(gv, _)| gv).collect(),
        };
        for gv in globals.into_iter().filter(|&gv| !gv_store.is_const(gv)) {
            if let Some(addr) = self.state.regs.global_addr(gv) {
                clobbers.push(Clobber::Range {
                    addr,
                    len: gv_store.ty(gv).size_of(),
                });
            }
        }

        self.apply_clobbers(func, block, clobbers);
    }

    fn arg_clobbers(
        &self,
        func: FuncRef,
        inst: InstId,
        callee: Option<FuncRef>,
        args: &[ValueId],
    ) -> Vec<Clobber> {
        if callee.is_some_and(|callee| self.is_read_only(callee)) {
            return Vec::new();
        }

        let dfg = &self.body(func).dfg;
        let mut clobbers = Vec::new();
        for &arg in args {
            let Some(pointee) = dfg.value_ty(arg).pointee() else {
                continue;
            };
            match self.fact(func, arg) {
                None => clobbers.extend(self.root_clobber(func, arg)),
                Some(addr) => match self.state.track.context_object_at(addr) {
                    Some(obj) => clobbers.extend(self.footprint(func, inst, callee, obj, pointee)),
                    None => clobbers.push(Clobber::Pointee {
                        ty: pointee.clone(),
                        addr,
                    }),
                },
            }
        }
        clobbers
    }

    /// Bytes of a context object an opaque call may write.
    fn footprint(
        &self,
        func: FuncRef,
        inst: InstId,
        callee: Option<FuncRef>,
        obj: &ContextObject,
        pointee: &Type,
    ) -> Vec<Clobber> {
        let defined = callee.filter(|&callee| !self.body(callee).is_declaration());
        if defined.is_some() {
            let writes = self
                .body(func)
                .meta
                .call_effects(inst)
                .iter()
                .any(|effect| effect.ctx_id == obj.id && effect.is_write);
            if !writes {
                return Vec::new();
            }
        }

        let whole = vec![
            Clobber::Range {
                addr: obj.addr,
                len: obj.size,
            },
            Clobber::Pointee {
                ty: pointee.clone(),
                addr: obj.addr,
            },
        ];
        match defined.and_then(|callee| self.body(callee).meta.mod_range(obj.id)) {
            None => whole,
            Some(range) if range.is_untouched() => Vec::new(),
            Some(range) if range.is_unbounded() => whole,
            Some(range) => {
                let start = range.start.min(obj.size);
                let end = range.end.clamp(start, obj.size);
                vec![Clobber::Range {
                    addr: obj.addr + start,
                    len: end - start,
                }]
            }
        }
    }

    /// Callees that never write through their pointer arguments.
    fn is_read_only(&self, callee: FuncRef) -> bool {
        let sig = &self.body(callee).sig;
        let name = sig.name();
        if self.read_only.contains(name) || sig.is_read_only() {
            return true;
        }
        name.starts_with("llvm.")
            && !matches!(super::libcall::base_name(name), "memcpy" | "memmove" | "memset")
    }
}

/// The cast turning a `from` value into a `to` value. `Some(None)` means no
/// cast is needed, `None` that the types are incompatible.
fn cast_between(from: &Type, to: &Type) -> Option<Option<CastOp>> {
    if from == to {
        return Some(None);
    }
    match (from.is_pointer(), to.is_pointer()) {
        (true, true) => Some(Some(CastOp::Bitcast)),
        (true, false) if *to == Type::I64 => Some(Some(CastOp::PtrToInt)),
        (false, true) if *from == Type::I64 => Some(Some(CastOp::IntToPtr)),
        _ => None,
    }
}
