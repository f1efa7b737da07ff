use cranelift_entity::SecondaryMap;
use debloat_ir::{FuncRef, GvInitializer, Immediate, InstData, Module, Value};

use crate::{memory::Memory, register::Register};

/// What the returns of one activation agree on.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RetFact {
    /// No return was evaluated yet.
    #[default]
    Unset,
    Literal(Immediate),
    Register(Register),
    Unknown,
}

impl RetFact {
    pub fn merge(&mut self, other: RetFact) {
        *self = match (std::mem::take(self), other) {
            (RetFact::Unset, other) => other,
            (this, RetFact::Unset) => this,
            (RetFact::Literal(a), RetFact::Literal(b)) if a == b => RetFact::Literal(a),
            (RetFact::Register(a), RetFact::Register(b)) if a == b => RetFact::Register(a),
            _ => RetFact::Unknown,
        };
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FuncInfo {
    /// The function this one was cloned from, itself for originals.
    pub origin: Option<FuncRef>,
    pub clone_counter: u32,

    /// Memory merged over the returns of the latest activation.
    pub context: Option<Memory>,
    pub ret_fact: RetFact,

    pub addr_taken: bool,
    pub direct_calls: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FuncInfoMap {
    infos: SecondaryMap<FuncRef, FuncInfo>,
}

impl FuncInfoMap {
    pub fn init(module: &Module) -> Self {
        let mut map = Self::default();
        for func in module.funcs.keys() {
            map.infos[func].origin = Some(func);
        }
        map.count_uses(module);
        map
    }

    /// Recounts direct calls and address uses of every function.
    pub fn count_uses(&mut self, module: &Module) {
        for func in module.funcs.keys() {
            let info = &mut self.infos[func];
            info.addr_taken = false;
            info.direct_calls = 0;
        }

        for (_, gv) in module.gv_store.iter() {
            if let Some(init) = &gv.data {
                self.mark_initializer(init);
            }
        }

        for func in module.iter_functions() {
            let body = &module.funcs[func];
            for block in body.layout.iter_block() {
                for inst in body.layout.iter_inst(block) {
                    let data = body.dfg.inst(inst);
                    if let InstData::Call { func: callee, .. } = data {
                        self.infos[*callee].direct_calls += 1;
                    }
                    for &arg in data.args() {
                        if let Value::Func { func: target, .. } = body.dfg.value(arg) {
                            self.infos[*target].addr_taken = true;
                        }
                    }
                }
            }
        }
    }

    fn mark_initializer(&mut self, init: &GvInitializer) {
        match init {
            GvInitializer::FuncAddr(func) => self.infos[*func].addr_taken = true,
            GvInitializer::Array(elems) | GvInitializer::Struct(elems) => {
                for elem in elems {
                    self.mark_initializer(elem);
                }
            }
            _ => {}
        }
    }

    pub fn get(&self, func: FuncRef) -> &FuncInfo {
        &self.infos[func]
    }

    pub fn get_mut(&mut self, func: FuncRef) -> &mut FuncInfo {
        &mut self.infos[func]
    }

    pub fn origin(&self, func: FuncRef) -> FuncRef {
        self.infos[func].origin.unwrap_or(func)
    }

    pub fn is_clone(&self, func: FuncRef) -> bool {
        self.origin(func) != func
    }

    /// Registers `clone` as a copy of `of` and returns the clone's number.
    pub fn register_clone(&mut self, clone: FuncRef, of: FuncRef) -> u32 {
        let origin = self.origin(of);
        let num = self.infos[origin].clone_counter;
        self.infos[origin].clone_counter += 1;
        self.infos[clone] = FuncInfo {
            origin: Some(origin),
            ..FuncInfo::default()
        };
        num
    }

    /// Moves the return state collected so far from `from` to `to`.
    pub fn copy_activation(&mut self, from: FuncRef, to: FuncRef) {
        let context = self.infos[from].context.take();
        let ret_fact = std::mem::take(&mut self.infos[from].ret_fact);
        let info = &mut self.infos[to];
        info.context = context;
        info.ret_fact = ret_fact;
    }

    /// Takes the return state of the finished activation of `func`.
    pub fn take_activation(&mut self, func: FuncRef) -> (Option<Memory>, RetFact) {
        let info = &mut self.infos[func];
        (info.context.take(), std::mem::take(&mut info.ret_fact))
    }
}
