//! This module contains debloat IR instructions definitions.
use std::fmt;

use cranelift_entity::entity_impl;

use smallvec::SmallVec;

use crate::{module::FuncRef, BlockId, DataFlowGraph, Type, ValueId};

/// An opaque reference to [`InstData`].
#[derive(Clone, PartialEq, Eq, Copy, Hash, PartialOrd, Ord)]
pub struct InstId(pub u32);
entity_impl!(InstId, "inst");

/// An instruction data definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstData {
    /// Unary instructions.
    Unary { code: UnaryOp, args: [ValueId; 1] },

    /// Binary instructions, comparisons included.
    Binary { code: BinaryOp, args: [ValueId; 2] },

    /// Cast operations.
    Cast {
        code: CastOp,
        args: [ValueId; 1],
        ty: Type,
    },

    /// `args = [cond, then, else]`.
    Select { args: [ValueId; 3] },

    /// Reserve a stack slot of `ty`.
    Alloca { ty: Type },

    /// Load a value from memory.
    Load { args: [ValueId; 1], ty: Type },

    /// Store a value to memory, `args = [addr, value]`.
    Store { args: [ValueId; 2] },

    /// Address computation. `args[0]` is the base pointer, `ty` its pointee type.
    /// The first index scales by `ty`, later ones step into aggregates.
    Gep {
        args: SmallVec<[ValueId; 4]>,
        ty: Type,
    },

    /// Direct call.
    Call {
        func: FuncRef,
        args: SmallVec<[ValueId; 8]>,
        ret_ty: Type,
    },

    /// Call through a function pointer, `args[0]` is the callee.
    CallIndirect {
        args: SmallVec<[ValueId; 8]>,
        ret_ty: Type,
    },

    /// Unconditional jump instruction.
    Jump { dests: [BlockId; 1] },

    /// Conditional jump instruction, `dests = [then, else]`.
    Branch {
        args: [ValueId; 1],
        dests: [BlockId; 2],
    },

    /// Multi-way branch. `args[0]` is the scrutinee, `args[i + 1]` selects `table[i]`.
    BrTable {
        args: SmallVec<[ValueId; 8]>,
        default: Option<BlockId>,
        table: SmallVec<[BlockId; 8]>,
    },

    /// Return.
    Return { args: Option<ValueId> },

    Unreachable,

    /// Phi funcion.
    Phi {
        values: SmallVec<[ValueId; 8]>,
        blocks: SmallVec<[BlockId; 8]>,
        ty: Type,
    },

    /// Loop test instrumentation. Never survives a finished run.
    Marker { kind: MarkerKind, test: u32 },
}

impl InstData {
    pub fn unary(code: UnaryOp, lhs: ValueId) -> Self {
        Self::Unary { code, args: [lhs] }
    }

    pub fn binary(code: BinaryOp, lhs: ValueId, rhs: ValueId) -> Self {
        Self::Binary {
            code,
            args: [lhs, rhs],
        }
    }

    pub fn cast(code: CastOp, arg: ValueId, ty: Type) -> Self {
        Self::Cast {
            code,
            args: [arg],
            ty,
        }
    }

    pub fn jump(dest: BlockId) -> Self {
        Self::Jump { dests: [dest] }
    }

    pub fn phi(ty: Type) -> Self {
        Self::Phi {
            values: SmallVec::new(),
            blocks: SmallVec::new(),
            ty,
        }
    }

    pub fn analyze_branch(&self) -> BranchInfo {
        match self {
            Self::Jump { dests } => BranchInfo::Jump { dest: dests[0] },

            Self::Branch { args, dests } => BranchInfo::Br {
                cond: args[0],
                dests,
            },

            Self::BrTable {
                args,
                default,
                table,
            } => BranchInfo::BrTable {
                args,
                default: *default,
                table,
            },

            _ => BranchInfo::NotBranch,
        }
    }

    pub fn rewrite_branch_dest(&mut self, from: BlockId, to: BlockId) {
        match self {
            Self::Jump { dests } => {
                if dests[0] == from {
                    dests[0] = to;
                }
            }

            Self::Branch { dests, .. } => {
                for block in dests.iter_mut() {
                    if *block == from {
                        *block = to;
                    }
                }
            }

            Self::BrTable { default, table, .. } => {
                if *default == Some(from) {
                    *default = Some(to);
                }
                for block in table.iter_mut() {
                    if *block == from {
                        *block = to;
                    }
                }
            }

            _ => {}
        }
    }

    pub fn args(&self) -> &[ValueId] {
        match self {
            Self::Binary { args, .. } | Self::Store { args } => args,
            Self::Unary { args, .. }
            | Self::Cast { args, .. }
            | Self::Load { args, .. }
            | Self::Branch { args, .. } => args,
            Self::Select { args } => args,
            Self::Gep { args, .. } => args,
            Self::Call { args, .. } | Self::CallIndirect { args, .. } => args,
            Self::Phi { values: args, .. } | Self::BrTable { args, .. } => args,
            Self::Return { args } => args.as_slice(),
            Self::Alloca { .. } | Self::Jump { .. } | Self::Unreachable | Self::Marker { .. } => &[],
        }
    }

    pub fn args_mut(&mut self) -> &mut [ValueId] {
        match self {
            Self::Binary { args, .. } | Self::Store { args } => args,
            Self::Unary { args, .. }
            | Self::Cast { args, .. }
            | Self::Load { args, .. }
            | Self::Branch { args, .. } => args,
            Self::Select { args } => args,
            Self::Gep { args, .. } => args,
            Self::Call { args, .. } | Self::CallIndirect { args, .. } => args,
            Self::Phi { values: args, .. } | Self::BrTable { args, .. } => args,
            Self::Return { args } => args.as_mut_slice(),
            Self::Alloca { .. } | Self::Jump { .. } | Self::Unreachable | Self::Marker { .. } => {
                &mut []
            }
        }
    }

    pub fn append_phi_arg(&mut self, value: ValueId, block: BlockId) {
        let Self::Phi { values, blocks, .. } = self else {
            debug_assert!(false, "phi argument appended to {self:?}");
            return;
        };
        values.push(value);
        blocks.push(block);
    }

    /// Removes every incoming pair of `block` from a phi.
    pub fn remove_phi_arg(&mut self, block: BlockId) {
        if let Self::Phi { values, blocks, .. } = self {
            let mut i = 0;
            while i < blocks.len() {
                if blocks[i] == block {
                    values.remove(i);
                    blocks.remove(i);
                } else {
                    i += 1;
                }
            }
        }
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Self::Phi { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. } | Self::CallIndirect { .. })
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Self::Jump { .. }
                | Self::Branch { .. }
                | Self::BrTable { .. }
                | Self::Return { .. }
                | Self::Unreachable
        )
    }

    pub fn may_write_memory(&self) -> bool {
        matches!(
            self,
            Self::Store { .. } | Self::Call { .. } | Self::CallIndirect { .. }
        )
    }

    /// Returns `true` if removing the instruction could change program behavior
    /// even when its result is unused.
    pub fn has_side_effect(&self) -> bool {
        self.may_write_memory() || self.is_terminator() || matches!(self, Self::Marker { .. })
    }

    /// Computes the type of the instruction result, `None` if it has no result.
    pub fn result_type(&self, dfg: &DataFlowGraph) -> Option<Type> {
        match self {
            Self::Unary { args, .. } => Some(dfg.value_ty(args[0]).clone()),
            Self::Binary { code, args } => {
                if code.is_cmp() {
                    Some(Type::I1)
                } else {
                    Some(dfg.value_ty(args[0]).clone())
                }
            }
            Self::Select { args } => Some(dfg.value_ty(args[1]).clone()),
            Self::Cast { ty, .. } | Self::Load { ty, .. } | Self::Phi { ty, .. } => {
                Some(ty.clone())
            }
            Self::Alloca { ty } => Some(Type::make_ptr(ty.clone())),
            Self::Gep { args, ty } => {
                let mut cur = ty;
                for &idx in args.iter().skip(2) {
                    let idx = dfg.value_imm(idx).map(|imm| imm.as_u64());
                    cur = cur.index_ty(idx)?;
                }
                Some(Type::make_ptr(cur.clone()))
            }
            Self::Call { ret_ty, .. } | Self::CallIndirect { ret_ty, .. } => {
                (!ret_ty.is_void()).then(|| ret_ty.clone())
            }
            _ => None,
        }
    }
}

/// Unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
}

impl UnaryOp {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::Not => "not",
            Self::Neg => "neg",
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Udiv,
    Sdiv,
    Urem,
    Srem,
    Shl,
    Lshr,
    Ashr,
    Lt,
    Gt,
    Slt,
    Sgt,
    Le,
    Ge,
    Sle,
    Sge,
    Eq,
    Ne,
    And,
    Or,
    Xor,
}

impl BinaryOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add | Self::Mul | Self::And | Self::Or | Self::Xor | Self::Eq | Self::Ne
        )
    }

    pub fn is_cmp(self) -> bool {
        matches!(
            self,
            Self::Eq
                | Self::Ne
                | Self::Lt
                | Self::Gt
                | Self::Slt
                | Self::Sgt
                | Self::Le
                | Self::Ge
                | Self::Sle
                | Self::Sge
        )
    }

    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Udiv => "udiv",
            Self::Sdiv => "sdiv",
            Self::Urem => "urem",
            Self::Srem => "srem",
            Self::Shl => "shl",
            Self::Lshr => "lshr",
            Self::Ashr => "ashr",
            Self::Lt => "lt",
            Self::Gt => "gt",
            Self::Slt => "slt",
            Self::Sgt => "sgt",
            Self::Le => "le",
            Self::Ge => "ge",
            Self::Sle => "sle",
            Self::Sge => "sge",
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CastOp {
    Sext,
    Zext,
    Trunc,
    Bitcast,
    PtrToInt,
    IntToPtr,
}

impl CastOp {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::Sext => "sext",
            Self::Zext => "zext",
            Self::Trunc => "trunc",
            Self::Bitcast => "bitcast",
            Self::PtrToInt => "ptrtoint",
            Self::IntToPtr => "inttoptr",
        }
    }
}

impl fmt::Display for CastOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    /// Placed at the head of every unrolled iteration.
    Iteration,
    /// Placed at every exit of an unrolled loop.
    Termination,
    /// Reached when the loop outlives all unrolled copies.
    Overflow,
}

impl MarkerKind {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::Iteration => "iteration",
            Self::Termination => "termination",
            Self::Overflow => "overflow",
        }
    }
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy)]
pub enum BranchInfo<'a> {
    NotBranch,

    /// Unconditional jump
    Jump { dest: BlockId },

    /// Conditional jump.
    Br { cond: ValueId, dests: &'a [BlockId] },

    /// Multi-way jump.
    BrTable {
        args: &'a [ValueId],
        default: Option<BlockId>,
        table: &'a [BlockId],
    },
}

impl<'a> BranchInfo<'a> {
    pub fn iter_dests(self) -> BranchDestIter<'a> {
        BranchDestIter {
            branch_info: self,
            idx: 0,
        }
    }

    pub fn dests_num(self) -> usize {
        match self {
            Self::NotBranch => 0,
            Self::Jump { .. } => 1,
            Self::Br { dests, .. } => dests.len(),
            Self::BrTable { default, table, .. } => table.len() + usize::from(default.is_some()),
        }
    }
}

#[derive(Clone, Copy)]
pub struct BranchDestIter<'a> {
    branch_info: BranchInfo<'a>,
    idx: usize,
}

impl Iterator for BranchDestIter<'_> {
    type Item = BlockId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.idx >= self.branch_info.dests_num() {
            return None;
        }

        let dest = match self.branch_info {
            BranchInfo::Jump { dest } => dest,
            BranchInfo::Br { dests, .. } => dests[self.idx],
            BranchInfo::BrTable { default, table, .. } => match default {
                Some(default) if self.idx == 0 => default,
                Some(_) => table[self.idx - 1],
                None => table[self.idx],
            },
            BranchInfo::NotBranch => return None,
        };
        self.idx += 1;
        Some(dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn br_table_dests() {
        let b = |n| BlockId(n);
        let data = InstData::BrTable {
            args: SmallVec::new(),
            default: Some(b(3)),
            table: [b(1), b(2)].into_iter().collect(),
        };
        let dests: Vec<_> = data.analyze_branch().iter_dests().collect();
        assert_eq!(dests, vec![b(3), b(1), b(2)]);
    }

    #[test]
    fn rewrite_and_remove_phi() {
        let b = |n| BlockId(n);
        let mut br = InstData::Branch {
            args: [ValueId(0)],
            dests: [b(1), b(2)],
        };
        br.rewrite_branch_dest(b(2), b(5));
        assert_eq!(
            br.analyze_branch().iter_dests().collect::<Vec<_>>(),
            vec![b(1), b(5)]
        );

        let mut jump = InstData::jump(b(2));
        jump.rewrite_branch_dest(b(2), b(4));
        jump.rewrite_branch_dest(b(1), b(6));
        assert_eq!(jump, InstData::jump(b(4)));

        let mut phi = InstData::phi(Type::I32);
        phi.append_phi_arg(ValueId(1), b(1));
        phi.append_phi_arg(ValueId(2), b(2));
        phi.append_phi_arg(ValueId(3), b(1));
        phi.remove_phi_arg(b(1));
        assert_eq!(phi.args(), &[ValueId(2)]);
    }

    #[test]
    fn ids_print_with_prefix() {
        assert_eq!(format!("{}", InstId(3)), "inst3");
        assert_eq!(format!("{:?}", BlockId(1)), "block1");
        assert_eq!(format!("{:?}", ValueId(7)), "v7");
    }
}
