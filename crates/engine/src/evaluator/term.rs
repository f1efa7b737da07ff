//! Terminators: successor classification and activation results.
use debloat_ir::{BlockId, FuncRef, InstData, InstId, ValueId};

use super::{Engine, Frame};
use crate::{
    func_info::RetFact,
    register::Register,
    trace::{trace_at, TraceCategory},
};

impl Engine {
    /// Classifies the outgoing edges of `block` and queues the successors
    /// that became ready.
    pub(super) fn process_term(&mut self, frame: &mut Frame, block: BlockId, inst: InstId) {
        let func = frame.func;
        let data = self.body(func).dfg.inst(inst).clone();
        if let InstData::Return { args } = data {
            self.process_return(frame, block, args);
        }

        let in_loop = self
            .state
            .contexts
            .info(func, block)
            .is_some_and(|info| info.part_of_loop);
        let taken = if in_loop {
            None
        } else {
            self.taken_dest(func, &data)
        };
        if let Some(taken) = taken {
            trace_at!(self.config.trace, TraceCategory::Eval, "{block} always goes to {taken}");
        }

        let contexts = &mut self.state.contexts;
        let mut ready = contexts.fold_to_single_succ(func, block, taken, &frame.an);
        for succ in contexts.live_succs(func, block, &frame.an) {
            if contexts.visit_block(func, block, succ) {
                ready.push(succ);
            }
        }
        for succ in ready {
            if contexts.enter_block(func, succ, &frame.an) {
                frame.worklist.push(succ);
            }
        }
        contexts.try_free(func, block, &frame.an);
    }

    /// The only successor a terminator can transfer control to, if its
    /// operands decide it.
    fn taken_dest(&self, func: FuncRef, data: &InstData) -> Option<BlockId> {
        match data {
            InstData::Jump { dests } => Some(dests[0]),
            InstData::Branch { args, dests } => {
                let cond = self.fact(func, args[0])?;
                Some(if cond & 1 == 1 { dests[0] } else { dests[1] })
            }
            InstData::BrTable {
                args,
                default,
                table,
            } => {
                let scrutinee = self.fact(func, args[0])?;
                // Cases are tried in order, so an unknown case hides every
                // later one.
                for (&case, &dest) in args[1..].iter().zip(table) {
                    if self.fact(func, case)? == scrutinee {
                        return Some(dest);
                    }
                }
                *default
            }
            _ => None,
        }
    }

    /// Folds the memory and the returned value of one return into the result
    /// of the activation.
    fn process_return(&mut self, frame: &Frame, block: BlockId, value: Option<ValueId>) {
        if frame.call.is_none() {
            return;
        }
        let func = frame.func;

        let fact = match value {
            Some(value) => match (self.literal(func, value), self.fact(func, value)) {
                (Some(imm), _) => RetFact::Literal(imm),
                (None, Some(bits)) => {
                    let ty = self.body(func).dfg.value_ty(value).clone();
                    let tracked = self.state.regs.is_tracked(func, value);
                    RetFact::Register(Register::new(bits, ty).tracked(tracked))
                }
                (None, None) => RetFact::Unknown,
            },
            None => RetFact::Unknown,
        };
        trace_at!(
            self.config.trace,
            TraceCategory::Call,
            "{}: return from {block}: {fact:?}",
            self.body(func).name()
        );

        let memory = self.memory(func, block).cloned();
        let info = self.state.funcs.get_mut(func);
        if info.context.is_none() {
            info.context = memory;
        } else if let (Some(merged), Some(memory)) = (info.context.as_mut(), memory) {
            merged.compare_with(&memory);
        }
        info.ret_fact.merge(fact);
    }
}
