//! Globals each function may touch, directly or through its callees.
//!
//! Functions of one call graph cycle share a single summary.
use debloat_ir::{
    call_graph::CallGraphSccs, CallGraph, FuncRef, GlobalVariable, Module, SccBuilder, Value,
};
use indexmap::IndexSet;
use rustc_hash::FxHashMap;

use crate::trace::{trace_at, TraceCategories, TraceCategory};

#[derive(Debug, Clone, Default)]
pub struct ModRefSummary {
    summaries: Vec<IndexSet<GlobalVariable>>,
    summary_of: FxHashMap<FuncRef, usize>,
}

impl ModRefSummary {
    pub fn compute(module: &Module, trace: TraceCategories) -> Self {
        let cg = CallGraph::build_graph(module);
        let sccs = SccBuilder::new().compute_scc(&cg);
        let mut this = Self::default();

        for scc in sccs.post_order() {
            let info = sccs.scc_info(scc);
            let mut globals = IndexSet::new();
            let mut members: Vec<_> = info.components.iter().copied().collect();
            members.sort_unstable();

            for &func in &members {
                Self::direct_globals(module, func, &mut globals);
                for &callee in cg.callee_of(func) {
                    if let Some(summary) = this.callee_summary(&sccs, &members, callee) {
                        globals.extend(summary.iter().copied());
                    }
                }
            }

            let idx = this.summaries.len();
            for &func in &members {
                trace_at!(
                    trace,
                    TraceCategory::ModRef,
                    "{} touches {} globals",
                    module.funcs[func].name(),
                    globals.len()
                );
                this.summary_of.insert(func, idx);
            }
            this.summaries.push(globals);
        }

        this
    }

    fn callee_summary(
        &self,
        sccs: &CallGraphSccs,
        members: &[FuncRef],
        callee: FuncRef,
    ) -> Option<&IndexSet<GlobalVariable>> {
        if members.contains(&callee) {
            return None;
        }
        sccs.try_scc_ref(callee)?;
        self.summary_of
            .get(&callee)
            .map(|&idx| &self.summaries[idx])
    }

    fn direct_globals(module: &Module, func: FuncRef, globals: &mut IndexSet<GlobalVariable>) {
        let body = &module.funcs[func];
        for block in body.layout.iter_block() {
            for inst in body.layout.iter_inst(block) {
                for &arg in body.dfg.inst(inst).args() {
                    if let Value::Global { gv, .. } = body.dfg.value(arg) {
                        globals.insert(*gv);
                    }
                }
            }
        }
    }

    /// Globals `origin` may touch. Declarations and unknown functions touch
    /// none.
    pub fn summary_of(&self, origin: FuncRef) -> impl Iterator<Item = GlobalVariable> + '_ {
        self.summary_of
            .get(&origin)
            .into_iter()
            .flat_map(|&idx| self.summaries[idx].iter().copied())
    }

    /// Returns `true` if `a` and `b` share one summary.
    #[cfg(test)]
    fn is_shared(&self, a: FuncRef, b: FuncRef) -> bool {
        match (self.summary_of.get(&a), self.summary_of.get(&b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use debloat_ir::{
        builder::test_util::*, GlobalVariableData, Linkage, Signature, Type,
    };

    use super::*;

    #[test]
    fn cycles_share_summaries() {
        let mut mb = TestModuleBuilder::new();
        let gv_a = mb.module_builder().make_global(GlobalVariableData::new(
            "a".into(),
            Type::I32,
            Linkage::Private,
            false,
            None,
        ));
        let gv_b = mb.module_builder().make_global(GlobalVariableData::new(
            "b".into(),
            Type::I32,
            Linkage::Private,
            false,
            None,
        ));
        let even = mb.declare_function(Signature::new("even", Linkage::Private, &[], Type::Void));
        let odd = mb.declare_function(Signature::new("odd", Linkage::Private, &[], Type::Void));

        let mut builder = mb.func_builder(&[], &Type::Void);
        let b0 = builder.append_block();
        builder.switch_to_block(b0);
        builder.call(even, &[]);
        builder.ret(None);
        let main = builder.finish();

        for (func, gv, other) in [(even, gv_a, odd), (odd, gv_b, even)] {
            let mut builder = mb.module_builder().func_builder(func);
            let b0 = builder.append_block();
            builder.switch_to_block(b0);
            let addr = builder.global_value(gv);
            let one = builder.make_imm_value(1i32);
            builder.store(addr, one);
            builder.call(other, &[]);
            builder.ret(None);
            builder.finish();
        }
        let module = mb.build();

        let modref = ModRefSummary::compute(&module, TraceCategories::NONE);
        assert!(modref.is_shared(even, odd));
        assert!(!modref.is_shared(main, even));

        let mut touched: Vec<_> = modref.summary_of(main).collect();
        touched.sort();
        assert_eq!(touched, vec![gv_a, gv_b]);
        assert_eq!(modref.summary_of(odd).count(), 2);
    }
}
