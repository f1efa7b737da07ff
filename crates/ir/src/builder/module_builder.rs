use rustc_hash::FxHashMap;

use super::FunctionBuilder;
use crate::{
    module::{FuncRef, Module},
    Function, GlobalVariable, GlobalVariableData, Signature,
};

#[derive(Debug, Default)]
pub struct ModuleBuilder {
    pub module: Module,

    /// Map function name -> FuncRef to avoid duplicated declaration.
    declared_funcs: FxHashMap<String, FuncRef>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new module builder from a module.
    pub fn from_module(module: Module) -> Self {
        let declared_funcs = module
            .iter_functions()
            .map(|func| (module.funcs[func].sig.name().to_string(), func))
            .collect();
        Self {
            module,
            declared_funcs,
        }
    }

    /// Declares a function. A second declaration with the same name returns the
    /// function declared first.
    pub fn declare_function(&mut self, sig: Signature) -> FuncRef {
        if let Some(&func_ref) = self.declared_funcs.get(sig.name()) {
            return func_ref;
        }

        let name = sig.name().to_string();
        let func_ref = self.module.add_function(Function::new(sig));
        self.declared_funcs.insert(name, func_ref);
        func_ref
    }

    pub fn lookup_func(&self, name: &str) -> Option<FuncRef> {
        self.declared_funcs.get(name).copied()
    }

    pub fn sig(&self, func_ref: FuncRef) -> &Signature {
        &self.module.funcs[func_ref].sig
    }

    pub fn make_global(&mut self, global: GlobalVariableData) -> GlobalVariable {
        match self.module.gv_store.make_gv(global) {
            Ok(gv) | Err(gv) => gv,
        }
    }

    pub fn lookup_global(&self, name: &str) -> Option<GlobalVariable> {
        self.module.gv_store.gv_by_symbol(name)
    }

    pub fn set_entry(&mut self, func: FuncRef) {
        self.module.entry = Some(func);
    }

    /// Returns a builder filling the body of `func`.
    pub fn func_builder(&mut self, func: FuncRef) -> FunctionBuilder<'_> {
        FunctionBuilder::new(self, func)
    }

    pub fn build(self) -> Module {
        self.module
    }
}
