use smallvec::SmallVec;

use super::ModuleBuilder;
use crate::{
    inst::{BinaryOp, CastOp, InstData, InstId, MarkerKind, UnaryOp},
    metadata::{CallSiteEffect, ModRange},
    module::FuncRef,
    BlockId, Function, GlobalVariable, Immediate, Type, ValueId,
};

macro_rules! impl_binary_insn {
    ($name:ident, $code:path) => {
        pub fn $name(&mut self, lhs: ValueId, rhs: ValueId) -> ValueId {
            self.insert_value_inst(InstData::binary($code, lhs, rhs))
        }
    };
}

macro_rules! impl_unary_insn {
    ($name:ident, $code:path) => {
        pub fn $name(&mut self, lhs: ValueId) -> ValueId {
            self.insert_value_inst(InstData::unary($code, lhs))
        }
    };
}

macro_rules! impl_cast_insn {
    ($name:ident, $code:path) => {
        pub fn $name(&mut self, lhs: ValueId, ty: Type) -> ValueId {
            self.insert_value_inst(InstData::cast($code, lhs, ty))
        }
    };
}

/// Fills the body of one function. Instructions are always appended to the
/// bottom of the current block.
pub struct FunctionBuilder<'a> {
    module_builder: &'a mut ModuleBuilder,
    pub func: Function,
    func_ref: FuncRef,
    cur_block: Option<BlockId>,
    last_inst: Option<InstId>,
}

impl<'a> FunctionBuilder<'a> {
    pub fn new(module_builder: &'a mut ModuleBuilder, func_ref: FuncRef) -> Self {
        let sig = module_builder.sig(func_ref).clone();
        Self {
            module_builder,
            func: Function::new(sig),
            func_ref,
            cur_block: None,
            last_inst: None,
        }
    }

    /// Stores the built body into the module.
    pub fn finish(self) -> FuncRef {
        let Self {
            module_builder,
            func,
            func_ref,
            ..
        } = self;
        module_builder.module.funcs[func_ref] = func;
        func_ref
    }

    pub fn func_ref(&self) -> FuncRef {
        self.func_ref
    }

    pub fn args(&self) -> &[ValueId] {
        &self.func.arg_values
    }

    pub fn append_block(&mut self) -> BlockId {
        let block = self.func.dfg.make_block();
        self.func.layout.append_block(block);
        block
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.cur_block = Some(block);
    }

    pub fn current_block(&self) -> Option<BlockId> {
        self.cur_block
    }

    /// Returns the most recently inserted instruction.
    pub fn last_inst(&self) -> Option<InstId> {
        self.last_inst
    }

    pub fn make_imm_value<Imm>(&mut self, imm: Imm) -> ValueId
    where
        Imm: Into<Immediate>,
    {
        self.func.dfg.make_imm_value(imm)
    }

    pub fn make_null(&mut self, ty: Type) -> ValueId {
        self.func.dfg.make_null_value(ty)
    }

    pub fn make_undef(&mut self, ty: Type) -> ValueId {
        self.func.dfg.make_undef_value(ty)
    }

    /// Returns a pointer to the global variable.
    pub fn global_value(&mut self, gv: GlobalVariable) -> ValueId {
        let ty = self.module_builder.module.gv_store.ty(gv).clone();
        self.func.dfg.make_global_value(gv, ty)
    }

    /// Returns the address of `func`.
    pub fn func_addr(&mut self, func: FuncRef) -> ValueId {
        self.func.dfg.make_func_value(func)
    }

    /// Appends `data` to the current block and returns its result if it has one.
    ///
    /// # Panics
    /// Panics if no block is selected.
    pub fn insert_inst(&mut self, data: InstData) -> Option<ValueId> {
        let block = self.cur_block.expect("no block is selected");
        let inst = self.func.dfg.make_inst(data);
        self.func.layout.append_inst(inst, block);
        self.last_inst = Some(inst);

        let result = self.func.dfg.make_result(inst)?;
        self.func.dfg.attach_result(inst, result);
        Some(result)
    }

    fn insert_value_inst(&mut self, data: InstData) -> ValueId {
        self.insert_inst(data)
            .expect("instruction doesn't produce a result")
    }

    impl_binary_insn!(add, BinaryOp::Add);
    impl_binary_insn!(sub, BinaryOp::Sub);
    impl_binary_insn!(mul, BinaryOp::Mul);
    impl_binary_insn!(udiv, BinaryOp::Udiv);
    impl_binary_insn!(sdiv, BinaryOp::Sdiv);
    impl_binary_insn!(urem, BinaryOp::Urem);
    impl_binary_insn!(srem, BinaryOp::Srem);
    impl_binary_insn!(shl, BinaryOp::Shl);
    impl_binary_insn!(lshr, BinaryOp::Lshr);
    impl_binary_insn!(ashr, BinaryOp::Ashr);
    impl_binary_insn!(and, BinaryOp::And);
    impl_binary_insn!(or, BinaryOp::Or);
    impl_binary_insn!(xor, BinaryOp::Xor);
    impl_binary_insn!(eq, BinaryOp::Eq);
    impl_binary_insn!(ne, BinaryOp::Ne);
    impl_binary_insn!(lt, BinaryOp::Lt);
    impl_binary_insn!(gt, BinaryOp::Gt);
    impl_binary_insn!(le, BinaryOp::Le);
    impl_binary_insn!(ge, BinaryOp::Ge);
    impl_binary_insn!(slt, BinaryOp::Slt);
    impl_binary_insn!(sgt, BinaryOp::Sgt);
    impl_binary_insn!(sle, BinaryOp::Sle);
    impl_binary_insn!(sge, BinaryOp::Sge);
    impl_unary_insn!(not, UnaryOp::Not);
    impl_unary_insn!(neg, UnaryOp::Neg);
    impl_cast_insn!(sext, CastOp::Sext);
    impl_cast_insn!(zext, CastOp::Zext);
    impl_cast_insn!(trunc, CastOp::Trunc);
    impl_cast_insn!(bitcast, CastOp::Bitcast);
    impl_cast_insn!(ptr_to_int, CastOp::PtrToInt);
    impl_cast_insn!(int_to_ptr, CastOp::IntToPtr);

    pub fn select(&mut self, cond: ValueId, then: ValueId, else_: ValueId) -> ValueId {
        self.insert_value_inst(InstData::Select {
            args: [cond, then, else_],
        })
    }

    pub fn alloca(&mut self, ty: Type) -> ValueId {
        self.insert_value_inst(InstData::Alloca { ty })
    }

    pub fn load(&mut self, addr: ValueId, ty: Type) -> ValueId {
        self.insert_value_inst(InstData::Load { args: [addr], ty })
    }

    pub fn store(&mut self, addr: ValueId, value: ValueId) {
        self.insert_inst(InstData::Store {
            args: [addr, value],
        });
    }

    /// `pointee` is the type `base` points to.
    pub fn gep(&mut self, base: ValueId, pointee: Type, indices: &[ValueId]) -> ValueId {
        let mut args: SmallVec<[ValueId; 4]> = SmallVec::new();
        args.push(base);
        args.extend_from_slice(indices);
        self.insert_value_inst(InstData::Gep { args, ty: pointee })
    }

    pub fn call(&mut self, func: FuncRef, args: &[ValueId]) -> Option<ValueId> {
        let ret_ty = self.module_builder.sig(func).ret_ty().clone();
        self.insert_inst(InstData::Call {
            func,
            args: args.into(),
            ret_ty,
        })
    }

    pub fn call_indirect(
        &mut self,
        callee: ValueId,
        args: &[ValueId],
        ret_ty: Type,
    ) -> Option<ValueId> {
        let mut all_args: SmallVec<[ValueId; 8]> = SmallVec::new();
        all_args.push(callee);
        all_args.extend_from_slice(args);
        self.insert_inst(InstData::CallIndirect {
            args: all_args,
            ret_ty,
        })
    }

    pub fn jump(&mut self, dest: BlockId) {
        self.insert_inst(InstData::jump(dest));
    }

    pub fn br(&mut self, cond: ValueId, then: BlockId, else_: BlockId) {
        self.insert_inst(InstData::Branch {
            args: [cond],
            dests: [then, else_],
        });
    }

    pub fn br_table(
        &mut self,
        scrutinee: ValueId,
        default: Option<BlockId>,
        table: &[(ValueId, BlockId)],
    ) {
        let mut args: SmallVec<[ValueId; 8]> = SmallVec::new();
        args.push(scrutinee);
        args.extend(table.iter().map(|(value, _)| *value));
        self.insert_inst(InstData::BrTable {
            args,
            default,
            table: table.iter().map(|(_, block)| *block).collect(),
        });
    }

    pub fn ret(&mut self, value: Option<ValueId>) {
        self.insert_inst(InstData::Return { args: value });
    }

    pub fn unreachable(&mut self) {
        self.insert_inst(InstData::Unreachable);
    }

    pub fn phi(&mut self, ty: Type, args: &[(ValueId, BlockId)]) -> ValueId {
        let mut data = InstData::phi(ty);
        for &(value, block) in args {
            data.append_phi_arg(value, block);
        }
        self.insert_value_inst(data)
    }

    /// # Panics
    /// Panics if `phi_res` is not a result of a phi.
    pub fn append_phi_arg(&mut self, phi_res: ValueId, value: ValueId, block: BlockId) {
        let phi_inst = self
            .func
            .dfg
            .value_inst(phi_res)
            .expect("`phi_res` should be a result of phi inst");
        self.func.dfg.append_phi_arg(phi_inst, value, block);
    }

    pub fn marker(&mut self, kind: MarkerKind, test: u32) {
        self.insert_inst(InstData::Marker { kind, test });
    }

    pub fn add_call_effect(&mut self, call: InstId, effect: CallSiteEffect) {
        self.func
            .meta
            .call_effects
            .entry(call)
            .or_default()
            .push(effect);
    }

    pub fn set_alloc_site(&mut self, call: InstId, ctx_id: u32) {
        self.func.meta.alloc_sites.insert(call, ctx_id);
    }

    pub fn add_mod_range(&mut self, range: ModRange) {
        self.func.meta.mod_ranges.push(range);
    }

    /// Flags the loop headed by `header` for forced unrolling.
    pub fn hint_unroll(&mut self, header: BlockId) {
        self.func.meta.unroll_hints.insert(header);
    }
}
