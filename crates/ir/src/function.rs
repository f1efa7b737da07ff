use smallvec::SmallVec;

use super::{DataFlowGraph, Layout, Type, ValueId};
use crate::{metadata::FuncMeta, Linkage};

#[derive(Debug, Clone)]
pub struct Function {
    pub sig: Signature,
    pub arg_values: SmallVec<[ValueId; 8]>,
    pub dfg: DataFlowGraph,
    pub layout: Layout,
    /// Facts attached by upstream passes.
    pub meta: FuncMeta,
}

impl Function {
    pub fn new(sig: Signature) -> Self {
        let mut dfg = DataFlowGraph::new();
        let arg_values = sig
            .args()
            .iter()
            .enumerate()
            .map(|(idx, arg_ty)| dfg.make_arg_value(arg_ty.clone(), idx))
            .collect();

        Self {
            sig,
            arg_values,
            dfg,
            layout: Layout::default(),
            meta: FuncMeta::default(),
        }
    }

    /// Returns `true` if the function has no body.
    pub fn is_declaration(&self) -> bool {
        self.layout.entry_block().is_none()
    }

    pub fn name(&self) -> &str {
        self.sig.name()
    }

    /// Counts the instructions currently placed in the layout.
    pub fn inst_num(&self) -> usize {
        self.layout
            .iter_block()
            .map(|block| self.layout.iter_inst(block).count())
            .sum()
    }
}

/// Attributes of a function known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FuncAttrs {
    pub variadic: bool,
    /// The function never writes through its pointer arguments.
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Name of the function.
    name: String,

    /// Linkage of the function.
    linkage: Linkage,

    args: SmallVec<[Type; 8]>,
    ret_ty: Type,
    attrs: FuncAttrs,
}

impl Signature {
    pub fn new(name: &str, linkage: Linkage, args: &[Type], ret_ty: Type) -> Self {
        Self {
            name: name.to_string(),
            linkage,
            args: args.iter().cloned().collect(),
            ret_ty,
            attrs: FuncAttrs::default(),
        }
    }

    pub fn with_attrs(mut self, attrs: FuncAttrs) -> Self {
        self.attrs = attrs;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage
    }

    pub fn update_linkage(&mut self, linkage: Linkage) {
        self.linkage = linkage;
    }

    pub fn args(&self) -> &[Type] {
        &self.args
    }

    pub fn ret_ty(&self) -> &Type {
        &self.ret_ty
    }

    pub fn attrs(&self) -> FuncAttrs {
        self.attrs
    }

    pub fn is_variadic(&self) -> bool {
        self.attrs.variadic
    }

    pub fn is_read_only(&self) -> bool {
        self.attrs.read_only
    }
}
