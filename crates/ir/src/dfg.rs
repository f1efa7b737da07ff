//! This module contains debloat IR data flow graph.
use std::collections::BTreeSet;

use cranelift_entity::{entity_impl, packed_option::PackedOption, PrimaryMap, SecondaryMap};
use rustc_hash::FxHashMap;

use crate::{
    inst::{BranchInfo, InstData, InstId},
    module::FuncRef,
    GlobalVariable, Immediate, Type, Value, ValueId,
};

#[derive(Debug, Clone, Default)]
pub struct DataFlowGraph {
    #[doc(hidden)]
    pub blocks: PrimaryMap<BlockId, Block>,
    #[doc(hidden)]
    pub values: PrimaryMap<ValueId, Value>,
    insts: PrimaryMap<InstId, InstData>,
    inst_results: SecondaryMap<InstId, PackedOption<ValueId>>,
    immediates: FxHashMap<Immediate, ValueId>,
    users: SecondaryMap<ValueId, BTreeSet<InstId>>,
}

impl DataFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_block(&mut self) -> BlockId {
        self.blocks.push(Block::new())
    }

    pub fn make_value(&mut self, value: Value) -> ValueId {
        self.values.push(value)
    }

    pub fn make_inst(&mut self, data: InstData) -> InstId {
        let inst = self.insts.push(data);
        self.attach_user(inst);
        inst
    }

    pub fn make_imm_value<Imm>(&mut self, imm: Imm) -> ValueId
    where
        Imm: Into<Immediate>,
    {
        let imm: Immediate = imm.into();
        if let Some(&value) = self.immediates.get(&imm) {
            return value;
        }

        let ty = imm.ty();
        let value = self.make_value(Value::Immediate { imm, ty });
        self.immediates.insert(imm, value);
        value
    }

    pub fn make_global_value(&mut self, gv: GlobalVariable, gv_ty: Type) -> ValueId {
        let ty = Type::make_ptr(gv_ty);
        self.make_value(Value::Global { gv, ty })
    }

    pub fn make_func_value(&mut self, func: FuncRef) -> ValueId {
        let ty = Type::make_ptr(Type::Func);
        self.make_value(Value::Func { func, ty })
    }

    pub fn make_null_value(&mut self, ty: Type) -> ValueId {
        self.make_value(Value::Null { ty })
    }

    pub fn make_undef_value(&mut self, ty: Type) -> ValueId {
        self.make_value(Value::Undef { ty })
    }

    pub fn make_arg_value(&mut self, ty: Type, idx: usize) -> ValueId {
        self.make_value(Value::Arg { ty, idx })
    }

    /// Creates the result value of `inst` if the instruction produces one.
    pub fn make_result(&mut self, inst: InstId) -> Option<ValueId> {
        let ty = self.insts[inst].result_type(self)?;
        Some(self.make_value(Value::Inst { inst, ty }))
    }

    pub fn attach_result(&mut self, inst: InstId, value: ValueId) {
        debug_assert!(self.inst_results[inst].is_none());
        self.inst_results[inst] = value.into();
    }

    /// Moves the `value` so that it becomes the result of `inst`.
    /// The instruction that previously produced `value` loses its result.
    pub fn rebind_result(&mut self, value: ValueId, inst: InstId) {
        if let Value::Inst { inst: old, .. } = self.values[value] {
            self.inst_results[old] = None.into();
        }
        let ty = self.values[value].ty().clone();
        self.values[value] = Value::Inst { inst, ty };
        self.inst_results[inst] = value.into();
    }

    pub fn replace_inst(&mut self, inst: InstId, new: InstData) {
        self.untrack_inst(inst);
        self.insts[inst] = new;
        self.attach_user(inst);
    }

    pub fn inst(&self, inst: InstId) -> &InstData {
        &self.insts[inst]
    }

    pub fn value(&self, value: ValueId) -> &Value {
        &self.values[value]
    }

    pub fn value_ty(&self, value: ValueId) -> &Type {
        self.values[value].ty()
    }

    pub fn value_imm(&self, value: ValueId) -> Option<Immediate> {
        match self.values[value] {
            Value::Immediate { imm, .. } => Some(imm),
            _ => None,
        }
    }

    pub fn value_inst(&self, value: ValueId) -> Option<InstId> {
        match self.values[value] {
            Value::Inst { inst, .. } => Some(inst),
            _ => None,
        }
    }

    pub fn attach_user(&mut self, inst: InstId) {
        for &value in self.insts[inst].args() {
            self.users[value].insert(inst);
        }
    }

    pub fn untrack_inst(&mut self, inst: InstId) {
        for &value in self.insts[inst].args() {
            self.users[value].remove(&inst);
        }
    }

    /// Returns the all instructions that use the `value`.
    pub fn users(&self, value: ValueId) -> impl Iterator<Item = &InstId> {
        self.users[value].iter()
    }

    /// Returns the number of instructions that use the `value`.
    pub fn users_num(&self, value: ValueId) -> usize {
        self.users[value].len()
    }

    pub fn inst_result(&self, inst: InstId) -> Option<ValueId> {
        self.inst_results[inst].expand()
    }

    pub fn branch_info(&self, inst: InstId) -> BranchInfo {
        self.insts[inst].analyze_branch()
    }

    pub fn is_terminator(&self, inst: InstId) -> bool {
        self.insts[inst].is_terminator()
    }

    pub fn is_phi(&self, inst: InstId) -> bool {
        self.insts[inst].is_phi()
    }

    pub fn is_exit(&self, inst: InstId) -> bool {
        matches!(
            self.insts[inst],
            InstData::Return { .. } | InstData::Unreachable
        )
    }

    pub fn append_phi_arg(&mut self, inst: InstId, value: ValueId, block: BlockId) {
        self.insts[inst].append_phi_arg(value, block);
        self.users[value].insert(inst);
    }

    pub fn remove_phi_arg(&mut self, inst: InstId, block: BlockId) {
        self.untrack_inst(inst);
        self.insts[inst].remove_phi_arg(block);
        self.attach_user(inst);
    }

    pub fn rewrite_branch_dest(&mut self, inst: InstId, from: BlockId, to: BlockId) {
        self.insts[inst].rewrite_branch_dest(from, to);
    }

    /// Rewrites every use of `value` to `alias`.
    pub fn change_to_alias(&mut self, value: ValueId, alias: ValueId) {
        if value == alias {
            return;
        }
        let mut users = std::mem::take(&mut self.users[value]);
        for inst in &users {
            for arg in self.insts[*inst].args_mut() {
                if *arg == value {
                    *arg = alias;
                }
            }
        }
        self.users[alias].append(&mut users);
    }

    /// Returns the number of instructions ever created.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }
}

/// An opaque reference to [`Block`]
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);
entity_impl!(BlockId, "block");

/// A block data definition.
/// A Block data doesn't hold any information for layout of a program. It is managed by
/// [`super::layout::Layout`].
#[derive(Debug, Clone, Default)]
pub struct Block {}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::BinaryOp;

    #[test]
    fn alias_moves_users() {
        let mut dfg = DataFlowGraph::new();
        let arg = dfg.make_arg_value(Type::I32, 0);
        let one = dfg.make_imm_value(1i32);
        let add = dfg.make_inst(InstData::binary(BinaryOp::Add, arg, one));
        let res = dfg.make_result(add).unwrap();
        dfg.attach_result(add, res);
        assert_eq!(dfg.users_num(arg), 1);

        let seven = dfg.make_imm_value(7i32);
        dfg.change_to_alias(arg, seven);
        assert_eq!(dfg.users_num(arg), 0);
        assert_eq!(dfg.inst(add).args(), &[seven, one]);
        assert_eq!(dfg.users(seven).copied().collect::<Vec<_>>(), vec![add]);
    }

    #[test]
    fn immediates_are_interned() {
        let mut dfg = DataFlowGraph::new();
        let a = dfg.make_imm_value(3i64);
        let b = dfg.make_imm_value(3i64);
        let c = dfg.make_imm_value(3i32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
