//! Folding of non-terminator instructions.
use debloat_ir::{
    BinaryOp, BlockId, CastOp, FuncRef, Immediate, InstData, InstId, MarkerKind, Type, UnaryOp,
    Value, ValueId,
};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use super::{Engine, Frame, Halt, ProcResult};
use crate::{
    analysis::FuncAnalyses,
    memory::{Memory, FUNC_BASE},
    trace::{trace_at, TraceCategory},
};

/// Memory that has to lose its constancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Clobber {
    /// Exactly these bytes.
    Range { addr: u64, len: u64 },
    /// A value of `ty` at `addr` and everything reachable through its
    /// pointers.
    Pointee { ty: Type, addr: u64 },
}

impl Engine {
    pub(super) fn eval_inst(
        &mut self,
        frame: &mut Frame,
        block: BlockId,
        inst: InstId,
    ) -> ProcResult {
        let func = frame.func;
        let data = self.body(func).dfg.inst(inst).clone();
        if let InstData::Marker { kind, test } = data {
            return self.process_marker(kind, test);
        }

        let in_loop = self
            .state
            .contexts
            .info(func, block)
            .is_some_and(|info| info.part_of_loop);
        if in_loop {
            return self.process_loop_inst(frame, block, inst, &data);
        }

        match data {
            InstData::Unary { code, args } => self.eval_unary(func, inst, code, args[0]),
            InstData::Binary { code, args } => self.eval_binary(func, inst, code, args),
            InstData::Cast { code, args, ty } => self.eval_cast(func, inst, code, args[0], &ty),
            InstData::Select { args } => self.eval_select(func, inst, args),
            InstData::Alloca { ty } => self.eval_alloca(func, block, inst, &ty),
            InstData::Load { args, ty } => self.eval_load(func, block, inst, args[0], &ty),
            InstData::Store { args } => self.eval_store(func, block, args[0], args[1]),
            InstData::Gep { args, ty } => self.eval_gep(func, inst, &args, &ty),
            InstData::Phi { values, blocks, .. } => {
                let incoming: SmallVec<[(ValueId, BlockId); 4]> =
                    values.into_iter().zip(blocks).collect();
                self.eval_phi(func, block, inst, &incoming, &frame.an)
            }
            InstData::Call { .. } | InstData::CallIndirect { .. } => {
                self.process_call(func, block, inst)
            }
            InstData::Marker { .. }
            | InstData::Jump { .. }
            | InstData::Branch { .. }
            | InstData::BrTable { .. }
            | InstData::Return { .. }
            | InstData::Unreachable => ProcResult::NotFolded,
        }
    }

    /// Replaces every use of the result of `inst` with the literal `bits`.
    /// Falls back to a register if the result type has no literals.
    pub(super) fn fold_to_literal(&mut self, func: FuncRef, inst: InstId, bits: u64) -> ProcResult {
        let body = &mut self.state.module.funcs[func];
        let Some(result) = body.dfg.inst_result(inst) else {
            return ProcResult::NotFolded;
        };
        let Some(imm) = Immediate::from_bits(bits, body.dfg.value_ty(result)) else {
            self.set_register(func, inst, bits, false);
            return ProcResult::NotFolded;
        };
        let literal = body.dfg.make_imm_value(imm);
        body.dfg.change_to_alias(result, literal);
        ProcResult::Folded
    }

    /// Returns the immediate behind `value` if it is a literal.
    pub(super) fn literal(&self, func: FuncRef, value: ValueId) -> Option<Immediate> {
        match self.body(func).dfg.value(value) {
            Value::Immediate { imm, .. } => Some(*imm),
            _ => None,
        }
    }

    fn eval_unary(&mut self, func: FuncRef, inst: InstId, code: UnaryOp, arg: ValueId) -> ProcResult {
        let ty = self.body(func).dfg.value_ty(arg).clone();
        let Some(bits) = self.fact(func, arg) else {
            return ProcResult::NotFolded;
        };
        let res = match code {
            UnaryOp::Not => !bits,
            UnaryOp::Neg => bits.wrapping_neg(),
        } & ty.mask();
        self.fold_or_register(func, inst, &[arg], res)
    }

    fn eval_binary(
        &mut self,
        func: FuncRef,
        inst: InstId,
        code: BinaryOp,
        args: [ValueId; 2],
    ) -> ProcResult {
        let ty = self.body(func).dfg.value_ty(args[0]).clone();
        let (lhs, rhs) = (self.fact(func, args[0]), self.fact(func, args[1]));

        if let Some(res) = absorbing(code, self.literal(func, args[0]), self.literal(func, args[1]))
        {
            return self.fold_to_literal(func, inst, res);
        }
        let (Some(lhs), Some(rhs)) = (lhs, rhs) else {
            return ProcResult::NotFolded;
        };

        if ty.is_pointer() {
            // Emulated addresses only compare for identity.
            return match code {
                BinaryOp::Eq => self.fold_to_literal(func, inst, u64::from(lhs == rhs)),
                BinaryOp::Ne => self.fold_to_literal(func, inst, u64::from(lhs != rhs)),
                _ => ProcResult::NotFolded,
            };
        }

        match binary_op(code, lhs, rhs, &ty) {
            Some(res) => self.fold_or_register(func, inst, &args, res),
            None => ProcResult::NotFolded,
        }
    }

    pub(super) fn eval_cast(
        &mut self,
        func: FuncRef,
        inst: InstId,
        code: CastOp,
        arg: ValueId,
        ty: &Type,
    ) -> ProcResult {
        let Some(bits) = self.fact(func, arg) else {
            return ProcResult::NotFolded;
        };
        let from = self.body(func).dfg.value_ty(arg).clone();
        let res = match code {
            CastOp::Sext => sext(bits, &from) as u64 & ty.mask(),
            CastOp::Zext | CastOp::Trunc => bits & from.mask() & ty.mask(),
            CastOp::Bitcast | CastOp::PtrToInt | CastOp::IntToPtr => bits & ty.mask(),
        };

        let tracked = self.state.regs.is_tracked(func, arg);
        let derived_from_addr = from.is_pointer() || ty.is_pointer();
        if derived_from_addr {
            self.set_register(func, inst, res, tracked);
            ProcResult::NotFolded
        } else {
            self.fold_or_register(func, inst, &[arg], res)
        }
    }

    fn eval_select(&mut self, func: FuncRef, inst: InstId, args: [ValueId; 3]) -> ProcResult {
        let Some(cond) = self.fact(func, args[0]) else {
            return ProcResult::NotFolded;
        };
        let chosen = if cond & 1 == 1 { args[1] } else { args[2] };
        let body = &mut self.state.module.funcs[func];
        let Some(result) = body.dfg.inst_result(inst) else {
            return ProcResult::NotFolded;
        };
        body.dfg.change_to_alias(result, chosen);
        if let Some(reg) = self.state.regs.get(func, chosen).cloned() {
            self.state.regs.add(func, result, reg);
        }
        ProcResult::Folded
    }

    fn eval_alloca(&mut self, func: FuncRef, block: BlockId, inst: InstId, ty: &Type) -> ProcResult {
        let Some(memory) = self.memory_mut(func, block) else {
            return ProcResult::Undecided;
        };
        match memory.allocate_stack(ty.size_of()) {
            Ok(addr) => self.set_register(func, inst, addr, false),
            Err(err) => trace_at!(self.config.trace, TraceCategory::Mem, "{inst}: {err}"),
        }
        ProcResult::NotFolded
    }

    fn eval_load(
        &mut self,
        func: FuncRef,
        block: BlockId,
        inst: InstId,
        addr: ValueId,
        ty: &Type,
    ) -> ProcResult {
        let Some(addr) = self.fact(func, addr) else {
            return ProcResult::NotFolded;
        };
        let size = ty.size_of();
        if !(ty.is_integral() || ty.is_pointer()) {
            return ProcResult::NotFolded;
        }
        let Some(memory) = self.memory(func, block) else {
            return ProcResult::NotFolded;
        };
        if !memory.check_constant(addr, size) {
            return ProcResult::NotFolded;
        }
        let Ok(bits) = memory.load(addr, size) else {
            return ProcResult::NotFolded;
        };

        if ty.is_pointer() {
            self.set_register(func, inst, bits, false);
            ProcResult::NotFolded
        } else {
            self.fold_to_literal(func, inst, bits)
        }
    }

    fn eval_store(&mut self, func: FuncRef, block: BlockId, addr: ValueId, value: ValueId) -> ProcResult {
        let ty = self.body(func).dfg.value_ty(value).clone();
        let size = ty.size_of();
        let bits = self.fact(func, value);

        let Some(addr_bits) = self.fact(func, addr) else {
            let clobber = self.root_clobber(func, addr);
            self.apply_clobbers(func, block, clobber);
            return ProcResult::Undecided;
        };

        let trace = self.config.trace;
        let Some(memory) = self.memory_mut(func, block) else {
            return ProcResult::Undecided;
        };
        let stored = match bits {
            Some(bits) if ty.is_integral() || ty.is_pointer() => memory
                .store(addr_bits, size, bits)
                .and_then(|()| memory.set_constant(addr_bits, size, true)),
            _ => {
                memory.clear_constant(addr_bits, size);
                return ProcResult::Undecided;
            }
        };
        if let Err(err) = stored {
            trace_at!(trace, TraceCategory::Mem, "store: {err}");
            memory.clear_constant(addr_bits, size);
            return ProcResult::Undecided;
        }
        ProcResult::NotFolded
    }

    pub(super) fn eval_gep(
        &mut self,
        func: FuncRef,
        inst: InstId,
        args: &[ValueId],
        ty: &Type,
    ) -> ProcResult {
        let Some(mut addr) = self.fact(func, args[0]) else {
            return ProcResult::NotFolded;
        };
        let tracked = self.state.regs.is_tracked(func, args[0]);

        let dfg = &self.body(func).dfg;
        let mut cur = ty;
        for (i, &idx) in args[1..].iter().enumerate() {
            let Some(bits) = self.fact(func, idx) else {
                return ProcResult::NotFolded;
            };
            let offset = sext(bits, dfg.value_ty(idx));
            if i == 0 {
                addr = addr.wrapping_add((offset as u64).wrapping_mul(cur.size_of()));
                continue;
            }
            match cur {
                Type::Array { elem_ty, .. } => {
                    addr = addr.wrapping_add((offset as u64).wrapping_mul(elem_ty.size_of()));
                    cur = &**elem_ty;
                }
                Type::Struct(fields) => {
                    let Some(field) = dfg.value_imm(idx).map(|imm| imm.as_u64() as usize) else {
                        return ProcResult::NotFolded;
                    };
                    let (Some(offset), Some(field_ty)) = (cur.field_offset(field), fields.get(field))
                    else {
                        return ProcResult::NotFolded;
                    };
                    addr = addr.wrapping_add(offset);
                    cur = field_ty;
                }
                _ => return ProcResult::NotFolded,
            }
        }

        self.set_register(func, inst, addr, tracked);
        ProcResult::NotFolded
    }

    fn eval_phi(
        &mut self,
        func: FuncRef,
        block: BlockId,
        inst: InstId,
        incoming: &[(ValueId, BlockId)],
        an: &FuncAnalyses,
    ) -> ProcResult {
        let Some(result) = self.body(func).dfg.inst_result(inst) else {
            return ProcResult::NotFolded;
        };

        if let Some(value) = self.state.contexts.fold_phi(func, block, incoming) {
            self.state.module.funcs[func]
                .dfg
                .change_to_alias(result, value);
            if let Some(reg) = self.state.regs.get(func, value).cloned() {
                self.state.regs.add(func, result, reg);
            }
            return ProcResult::Folded;
        }

        // Distinct values may still agree on their bits.
        let live = self.state.contexts.live_preds(func, block, an);
        let mut agreed = None;
        let mut tracked = false;
        for &(value, pred) in incoming.iter().filter(|(_, pred)| live.contains(pred)) {
            let bits = self.fact(func, value);
            if bits.is_none() || (agreed.is_some() && agreed != bits) {
                return ProcResult::NotFolded;
            }
            agreed = bits;
            tracked |= self.state.regs.is_tracked(func, value);
            trace_at!(self.config.trace, TraceCategory::Eval, "{inst}: {value} from {pred}");
        }
        if let Some(bits) = agreed {
            self.set_register(func, inst, bits, tracked);
        }
        ProcResult::NotFolded
    }

    fn process_marker(&mut self, kind: MarkerKind, test: u32) -> ProcResult {
        let budget = self.config.unroll_time_budget;
        let Some(state) = self.state.tests.iter_mut().find(|t| t.id == test) else {
            return ProcResult::NotFolded;
        };
        match kind {
            MarkerKind::Iteration => {
                state.iterations += 1;
                if !state.settled && state.started.elapsed() > budget {
                    trace_at!(
                        self.config.trace,
                        TraceCategory::Loop,
                        "test {test} out of time after {} iterations",
                        state.iterations
                    );
                    self.state.halt = Some(Halt::TestFailed(test));
                }
            }
            MarkerKind::Termination => {
                state.settled = true;
                trace_at!(
                    self.config.trace,
                    TraceCategory::Loop,
                    "test {test} left the loop after {} iterations",
                    state.iterations
                );
            }
            MarkerKind::Overflow => {
                state.overflow = true;
                self.state.halt = Some(Halt::TestFailed(test));
            }
        }
        ProcResult::NotFolded
    }

    /// Evaluates an instruction of a loop that runs without unrolling. Only
    /// facts valid in every iteration are produced.
    fn process_loop_inst(
        &mut self,
        frame: &mut Frame,
        block: BlockId,
        inst: InstId,
        data: &InstData,
    ) -> ProcResult {
        let func = frame.func;
        match data {
            InstData::Alloca { ty } => {
                self.eval_alloca(func, block, inst, ty);
            }
            InstData::Gep { args, ty } => {
                self.eval_gep(func, inst, args, ty);
            }
            InstData::Cast { code, args, ty } => {
                self.eval_cast(func, inst, *code, args[0], ty);
            }
            InstData::Store { args } => {
                let ty = self.body(func).dfg.value_ty(args[1]).clone();
                let clobber = self.store_clobber(func, args[0], &ty);
                self.apply_clobbers(func, block, clobber);
            }
            InstData::Call { .. } | InstData::CallIndirect { .. } => {
                if let Some(callee) = self.direct_target(func, inst) {
                    if self.check_fork(callee) {
                        return ProcResult::Undecided;
                    }
                }
                self.invalidate_call(func, block, inst);
            }
            _ => {}
        }
        ProcResult::PartOfLoop
    }

    /// Clears what the loop headed by `header` may write before its body is
    /// evaluated once.
    pub(super) fn invalidate_loop_writes(&mut self, func: FuncRef, header: BlockId, an: &FuncAnalyses) {
        let Some(lp) = an.loop_headed_by(header) else {
            return;
        };
        let blocks = an.loops.blocks(&an.cfg, lp);
        let mut stores = Vec::new();
        let mut calls = Vec::new();
        let body = self.body(func);
        for &block in &blocks {
            for inst in body.layout.iter_inst(block) {
                match body.dfg.inst(inst) {
                    InstData::Store { args } => {
                        stores.push((args[0], body.dfg.value_ty(args[1]).clone()));
                    }
                    data if data.is_call() => calls.push(inst),
                    _ => {}
                }
            }
        }

        trace_at!(
            self.config.trace,
            TraceCategory::Loop,
            "{header}: {} stores and {} calls invalidated",
            stores.len(),
            calls.len()
        );
        for (addr, ty) in stores {
            let clobber = self.store_clobber(func, addr, &ty);
            self.apply_clobbers(func, header, clobber);
        }
        for inst in calls {
            self.invalidate_call(func, header, inst);
        }
    }

    fn store_clobber(&self, func: FuncRef, addr: ValueId, ty: &Type) -> Vec<Clobber> {
        match self.fact(func, addr) {
            Some(addr) => vec![Clobber::Range {
                addr,
                len: ty.size_of(),
            }],
            None => self.root_clobber(func, addr),
        }
    }

    /// Walks address computations back to a pointer with a known value and
    /// clobbers everything reachable from it.
    pub(super) fn root_clobber(&self, func: FuncRef, mut ptr: ValueId) -> Vec<Clobber> {
        let dfg = &self.body(func).dfg;
        loop {
            if let Some(addr) = self.fact(func, ptr) {
                let ty = dfg
                    .value_ty(ptr)
                    .pointee()
                    .cloned()
                    .unwrap_or(Type::I8);
                return vec![Clobber::Pointee { ty, addr }];
            }
            let Some(inst) = dfg.value_inst(ptr) else {
                break;
            };
            match dfg.inst(inst) {
                InstData::Gep { args, .. } => ptr = args[0],
                InstData::Cast {
                    code: CastOp::Bitcast,
                    args,
                    ..
                } => ptr = args[0],
                _ => break,
            }
        }

        trace_at!(self.config.trace, TraceCategory::Mem, "no known root for {ptr}");
        Vec::new()
    }

    pub(super) fn apply_clobbers(&mut self, func: FuncRef, block: BlockId, clobbers: Vec<Clobber>) {
        let Some(memory) = self.memory_mut(func, block) else {
            return;
        };
        let mut visited = FxHashSet::default();
        for clobber in clobbers {
            match clobber {
                Clobber::Range { addr, len } => memory.clear_constant(addr, len),
                Clobber::Pointee { ty, addr } => mark_mem_non_const(memory, &ty, addr, &mut visited),
            }
        }
    }

    /// Folds `inst` to a literal if every operand is a literal, otherwise
    /// keeps the result as a register.
    fn fold_or_register(&mut self, func: FuncRef, inst: InstId, args: &[ValueId], res: u64) -> ProcResult {
        if args.iter().all(|&arg| self.literal(func, arg).is_some()) {
            self.fold_to_literal(func, inst, res)
        } else {
            let tracked = args.iter().any(|&arg| self.state.regs.is_tracked(func, arg));
            self.set_register(func, inst, res, tracked);
            ProcResult::NotFolded
        }
    }
}

/// Clears the constancy of a value of `ty` at `addr` and of everything its
/// constant pointers lead to.
pub(super) fn mark_mem_non_const(
    memory: &mut Memory,
    ty: &Type,
    addr: u64,
    visited: &mut FxHashSet<u64>,
) {
    if addr == 0 || addr >= FUNC_BASE || !memory.is_allocated(addr) || !visited.insert(addr) {
        return;
    }

    let mut targets = Vec::new();
    collect_pointers(memory, ty, addr, &mut targets);
    // A byte pointee stands for a buffer of unknown length.
    let len = match ty {
        Type::I8 => memory.size_contiguous(addr).max(1),
        _ => ty.size_of(),
    };
    memory.clear_constant(addr, len);

    for (pointee, target) in targets {
        mark_mem_non_const(memory, &pointee, target, visited);
    }
}

/// Collects the known targets of the pointers stored in a value of `ty`.
fn collect_pointers(memory: &Memory, ty: &Type, addr: u64, out: &mut Vec<(Type, u64)>) {
    match ty {
        Type::Ptr(pointee) => {
            if memory.check_constant(addr, 8) {
                if let Ok(target) = memory.load(addr, 8) {
                    out.push(((**pointee).clone(), target));
                }
            }
        }
        Type::Struct(fields) => {
            for (i, field) in fields.iter().enumerate() {
                let offset = ty.field_offset(i).unwrap_or_default();
                collect_pointers(memory, field, addr + offset, out);
            }
        }
        Type::Array { elem_ty, len } if has_pointer(elem_ty) => {
            let size = elem_ty.size_of();
            for i in 0..*len as u64 {
                collect_pointers(memory, elem_ty, addr + i * size, out);
            }
        }
        _ => {}
    }
}

fn has_pointer(ty: &Type) -> bool {
    match ty {
        Type::Ptr(..) => true,
        Type::Struct(fields) => fields.iter().any(has_pointer),
        Type::Array { elem_ty, .. } => has_pointer(elem_ty),
        _ => false,
    }
}

/// Sign-extends the significant bits of a scalar of `ty`.
fn sext(bits: u64, ty: &Type) -> i64 {
    match ty.bits() {
        Some(width) if width < 64 => {
            let shift = 64 - width;
            ((bits << shift) as i64) >> shift
        }
        _ => bits as i64,
    }
}

/// Results that one literal operand decides on its own.
fn absorbing(code: BinaryOp, lhs: Option<Immediate>, rhs: Option<Immediate>) -> Option<u64> {
    [lhs, rhs].into_iter().flatten().find_map(|imm| match code {
        BinaryOp::Mul | BinaryOp::And if imm.is_zero() => Some(0),
        BinaryOp::Or if imm.is_all_one() => Some(imm.as_u64()),
        _ => None,
    })
}

/// Evaluates a binary operation on scalars of `ty`. Returns `None` for
/// division by zero, signed overflow and oversized shifts.
fn binary_op(code: BinaryOp, lhs: u64, rhs: u64, ty: &Type) -> Option<u64> {
    let mask = ty.mask();
    let width = u64::from(ty.bits()?);
    let (lhs, rhs) = (lhs & mask, rhs & mask);
    let (slhs, srhs) = (sext(lhs, ty), sext(rhs, ty));
    let smin = sext(1 << (width - 1), ty);

    let res = match code {
        BinaryOp::Add => lhs.wrapping_add(rhs),
        BinaryOp::Sub => lhs.wrapping_sub(rhs),
        BinaryOp::Mul => lhs.wrapping_mul(rhs),
        BinaryOp::Udiv => lhs.checked_div(rhs)?,
        BinaryOp::Urem => lhs.checked_rem(rhs)?,
        BinaryOp::Sdiv | BinaryOp::Srem => {
            if srhs == 0 || (slhs == smin && srhs == -1) {
                return None;
            }
            if code == BinaryOp::Sdiv {
                (slhs / srhs) as u64
            } else {
                (slhs % srhs) as u64
            }
        }
        BinaryOp::Shl | BinaryOp::Lshr | BinaryOp::Ashr if rhs >= width => return None,
        BinaryOp::Shl => lhs << rhs,
        BinaryOp::Lshr => lhs >> rhs,
        BinaryOp::Ashr => (slhs >> rhs) as u64,
        BinaryOp::And => lhs & rhs,
        BinaryOp::Or => lhs | rhs,
        BinaryOp::Xor => lhs ^ rhs,
        BinaryOp::Eq => u64::from(lhs == rhs),
        BinaryOp::Ne => u64::from(lhs != rhs),
        BinaryOp::Lt => u64::from(lhs < rhs),
        BinaryOp::Gt => u64::from(lhs > rhs),
        BinaryOp::Le => u64::from(lhs <= rhs),
        BinaryOp::Ge => u64::from(lhs >= rhs),
        BinaryOp::Slt => u64::from(slhs < srhs),
        BinaryOp::Sgt => u64::from(slhs > srhs),
        BinaryOp::Sle => u64::from(slhs <= srhs),
        BinaryOp::Sge => u64::from(slhs >= srhs),
    };

    Some(if code.is_cmp() { res } else { res & mask })
}
