//! Whole-program call graph and its strongly connected components.
use cranelift_entity::{entity_impl, PrimaryMap, SecondaryMap};
use indexmap::IndexSet;
use rustc_hash::FxHashSet;

use crate::{inst::InstData, module::FuncRef, Module};

#[derive(Debug, Clone, Default)]
pub struct CallGraph {
    funcs: Vec<FuncRef>,
    nodes: SecondaryMap<FuncRef, Node>,
}

impl CallGraph {
    /// Builds a call graph over the live functions of `module`. Only direct
    /// calls are edges.
    pub fn build_graph(module: &Module) -> Self {
        let mut nodes = SecondaryMap::new();
        let mut funcs = vec![];
        for func_ref in module.iter_functions() {
            let func = &module.funcs[func_ref];
            let mut callees = IndexSet::new();
            for block in func.layout.iter_block() {
                for inst in func.layout.iter_inst(block) {
                    if let InstData::Call { func: callee, .. } = func.dfg.inst(inst) {
                        callees.insert(*callee);
                    }
                }
            }

            nodes[func_ref] = Node { callees };
            funcs.push(func_ref);
        }

        Self { funcs, nodes }
    }

    pub fn funcs(&self) -> impl Iterator<Item = FuncRef> + '_ {
        self.funcs.iter().copied()
    }

    /// Get the callees of a function.
    pub fn callee_of(&self, func_ref: FuncRef) -> &IndexSet<FuncRef> {
        &self.nodes[func_ref].callees
    }
}

#[derive(Debug, Clone, Default)]
struct Node {
    callees: IndexSet<FuncRef>,
}

/// Represents the strongly connected components of a call graph in a module.
#[derive(Debug, Clone, Default)]
pub struct CallGraphSccs {
    scc_map: SecondaryMap<FuncRef, Option<SccRef>>,
    scc_store: PrimaryMap<SccRef, SccInfo>,
}

impl CallGraphSccs {
    /// # Panics
    /// Panics if `func_ref` was not part of the call graph.
    pub fn scc_of(&self, func_ref: FuncRef) -> &SccInfo {
        self.scc_info(self.scc_ref(func_ref))
    }

    pub fn scc_ref(&self, func_ref: FuncRef) -> SccRef {
        self.scc_map[func_ref].expect("function is not in the call graph")
    }

    pub fn try_scc_ref(&self, func_ref: FuncRef) -> Option<SccRef> {
        self.scc_map[func_ref]
    }

    pub fn scc_info(&self, scc_ref: SccRef) -> &SccInfo {
        &self.scc_store[scc_ref]
    }

    /// Returns SCCs with callees before callers.
    pub fn post_order(&self) -> impl Iterator<Item = SccRef> {
        self.scc_store.keys()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SccRef(u32);
entity_impl!(SccRef, "scc");

#[derive(Debug, Clone)]
pub struct SccInfo {
    /// `true` if the SCC holds more than one function, or a function calling
    /// itself.
    pub is_cycle: bool,

    pub components: FxHashSet<FuncRef>,
}

/// Tarjan's algorithm over a [`CallGraph`].
#[derive(Debug, Default)]
pub struct SccBuilder {
    scc_map: SecondaryMap<FuncRef, Option<SccRef>>,
    scc_store: PrimaryMap<SccRef, SccInfo>,
    stack: Vec<FuncRef>,
    nodes: SecondaryMap<FuncRef, NodeState>,
    next_index: usize,
}

impl SccBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute_scc(mut self, call_graph: &CallGraph) -> CallGraphSccs {
        for func_ref in call_graph.funcs() {
            if !self.nodes[func_ref].visited {
                self.strong_component(func_ref, call_graph);
            }
        }

        CallGraphSccs {
            scc_map: self.scc_map,
            scc_store: self.scc_store,
        }
    }

    fn strong_component(&mut self, func_ref: FuncRef, call_graph: &CallGraph) {
        let index = self.next_index;
        self.next_index += 1;
        self.nodes[func_ref] = NodeState {
            index,
            lowlink: index,
            on_stack: true,
            visited: true,
        };
        self.stack.push(func_ref);

        let mut is_trivial_cycle = false;

        for &callee in call_graph.callee_of(func_ref) {
            is_trivial_cycle |= callee == func_ref;

            if !self.nodes[callee].visited {
                self.strong_component(callee, call_graph);
                self.nodes[func_ref].lowlink =
                    self.nodes[func_ref].lowlink.min(self.nodes[callee].lowlink);
            } else if self.nodes[callee].on_stack {
                self.nodes[func_ref].lowlink =
                    self.nodes[func_ref].lowlink.min(self.nodes[callee].index);
            }
        }

        if self.nodes[func_ref].index != self.nodes[func_ref].lowlink {
            return;
        }

        let mut components = FxHashSet::default();
        while let Some(top) = self.stack.pop() {
            self.nodes[top].on_stack = false;
            components.insert(top);
            if top == func_ref {
                break;
            }
        }

        let is_cycle = components.len() > 1 || is_trivial_cycle;
        let scc_ref = self.scc_store.push(SccInfo {
            is_cycle,
            components: FxHashSet::default(),
        });
        for &member in &components {
            self.scc_map[member] = Some(scc_ref);
        }
        self.scc_store[scc_ref].components = components;
    }
}

#[derive(Default, Debug, Clone, Copy)]
struct NodeState {
    index: usize,
    lowlink: usize,
    on_stack: bool,
    visited: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{builder::ModuleBuilder, Linkage, Signature, Type};

    fn declare(mb: &mut ModuleBuilder, name: &str) -> FuncRef {
        mb.declare_function(Signature::new(name, Linkage::Private, &[], Type::Void))
    }

    fn define(mb: &mut ModuleBuilder, func: FuncRef, callees: &[FuncRef]) {
        let mut builder = mb.func_builder(func);
        let b0 = builder.append_block();
        builder.switch_to_block(b0);
        for &callee in callees {
            builder.call(callee, &[]);
        }
        builder.ret(None);
        builder.finish();
    }

    #[test]
    fn mutual_recursion_forms_one_scc() {
        let mut mb = ModuleBuilder::new();
        let main = declare(&mut mb, "main");
        let even = declare(&mut mb, "even");
        let odd = declare(&mut mb, "odd");
        let leaf = declare(&mut mb, "leaf");
        let selfrec = declare(&mut mb, "selfrec");

        define(&mut mb, main, &[even, selfrec]);
        define(&mut mb, even, &[odd, leaf]);
        define(&mut mb, odd, &[even]);
        define(&mut mb, leaf, &[]);
        define(&mut mb, selfrec, &[selfrec]);

        let module = mb.build();
        let cg = CallGraph::build_graph(&module);
        assert_eq!(
            cg.callee_of(even).iter().copied().collect::<Vec<_>>(),
            vec![odd, leaf]
        );

        let sccs = SccBuilder::new().compute_scc(&cg);
        assert_eq!(sccs.scc_ref(even), sccs.scc_ref(odd));
        assert!(sccs.scc_of(even).is_cycle);
        assert_eq!(sccs.scc_of(even).components.len(), 2);
        assert!(!sccs.scc_of(leaf).is_cycle);
        assert!(sccs.scc_of(selfrec).is_cycle);
        assert!(!sccs.scc_of(main).is_cycle);

        let order: Vec<_> = sccs.post_order().collect();
        let pos = |f| order.iter().position(|&s| s == sccs.scc_ref(f)).unwrap();
        assert!(pos(leaf) < pos(even));
        assert!(pos(even) < pos(main));
    }
}
