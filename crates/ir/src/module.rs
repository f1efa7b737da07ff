use cranelift_entity::{entity_impl, PrimaryMap};
use rustc_hash::FxHashSet;

use crate::{global_variable::GlobalVariableStore, Function};

use super::Linkage;

/// The program image: every function and global of the program.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// Holds all functions, discarded ones included.
    pub funcs: PrimaryMap<FuncRef, Function>,

    pub gv_store: GlobalVariableStore,

    /// The function the program starts at.
    pub entry: Option<FuncRef>,

    removed: FxHashSet<FuncRef>,
}

impl Module {
    #[doc(hidden)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_function(&mut self, func: Function) -> FuncRef {
        self.funcs.push(func)
    }

    /// Tombstones `func`. Its body is dropped, its id stays valid.
    pub fn discard(&mut self, func: FuncRef) {
        if self.removed.insert(func) {
            let sig = self.funcs[func].sig.clone();
            self.funcs[func] = Function::new(sig);
        }
    }

    pub fn is_removed(&self, func: FuncRef) -> bool {
        self.removed.contains(&func)
    }

    /// Returns live functions in the module.
    pub fn iter_functions(&self) -> impl Iterator<Item = FuncRef> + '_ {
        self.funcs.keys().filter(|func| !self.is_removed(*func))
    }

    pub fn func_by_name(&self, name: &str) -> Option<FuncRef> {
        self.iter_functions()
            .find(|&func| self.funcs[func].sig.name() == name)
    }

    /// Returns `true` if the function has external linkage.
    pub fn is_external(&self, func_ref: FuncRef) -> bool {
        self.funcs[func_ref].sig.linkage() == Linkage::External
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FuncRef(u32);
entity_impl!(FuncRef, "func");
