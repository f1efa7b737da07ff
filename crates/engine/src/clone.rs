//! Function cloning and in-place block copying.
//!
//! A cloned function keeps every entity id of its source, so per-block and
//! per-value engine state can move between the two without remapping. Block
//! copies inside one function return an explicit old-id to new-id map.
use debloat_ir::{
    BlockId, FuncRef, Function, InstData, InstId, Linkage, Module, Value, ValueId,
};
use rustc_hash::FxHashMap;

/// Adds a copy of `func` named `name` to the module.
pub fn clone_function(module: &mut Module, func: FuncRef, name: String) -> FuncRef {
    let mut body = module.funcs[func].clone();
    body.sig.set_name(name);
    body.sig.update_linkage(Linkage::Private);
    module.add_function(body)
}

#[derive(Debug, Clone, Default)]
pub struct CloneMap {
    pub blocks: FxHashMap<BlockId, BlockId>,
    pub insts: FxHashMap<InstId, InstId>,
    pub values: FxHashMap<ValueId, ValueId>,
}

impl CloneMap {
    /// Values defined outside the copied region map to themselves.
    pub fn value(&self, value: ValueId) -> ValueId {
        self.values.get(&value).copied().unwrap_or(value)
    }

    pub fn block(&self, block: BlockId) -> BlockId {
        self.blocks.get(&block).copied().unwrap_or(block)
    }

    pub fn inst(&self, inst: InstId) -> Option<InstId> {
        self.insts.get(&inst).copied()
    }
}

/// Copies `blocks` and places the copies after `after`, in the given order.
///
/// Operands, branch destinations and phi blocks that refer into the copied
/// region are redirected to the copies. Copied call sites inherit the
/// metadata of their source.
pub fn copy_blocks(func: &mut Function, blocks: &[BlockId], after: BlockId) -> CloneMap {
    let mut map = CloneMap::default();

    let mut cursor = after;
    for &block in blocks {
        let new_block = func.dfg.make_block();
        func.layout.insert_block_after(new_block, cursor);
        map.blocks.insert(block, new_block);
        cursor = new_block;
    }

    let mut copied = Vec::new();
    for &block in blocks {
        let new_block = map.blocks[&block];
        let insts: Vec<_> = func.layout.iter_inst(block).collect();
        for inst in insts {
            let new_inst = func.dfg.make_inst(func.dfg.inst(inst).clone());
            func.layout.append_inst(new_inst, new_block);
            if let Some(result) = func.dfg.inst_result(inst) {
                let ty = func.dfg.value_ty(result).clone();
                let new_result = func.dfg.make_value(Value::Inst { inst: new_inst, ty });
                func.dfg.attach_result(new_inst, new_result);
                map.values.insert(result, new_result);
            }
            if func.dfg.inst(inst).is_call() {
                func.meta.copy_site(inst, new_inst);
            }
            map.insts.insert(inst, new_inst);
            copied.push(new_inst);
        }
    }

    for inst in copied {
        let mut data = func.dfg.inst(inst).clone();
        remap_inst(&mut data, &map);
        func.dfg.replace_inst(inst, data);
    }

    map
}

fn remap_inst(data: &mut InstData, map: &CloneMap) {
    for arg in data.args_mut() {
        *arg = map.value(*arg);
    }
    for (&from, &to) in &map.blocks {
        data.rewrite_branch_dest(from, to);
    }
    if let InstData::Phi { blocks, .. } = data {
        for block in blocks.iter_mut() {
            *block = map.block(*block);
        }
    }
}

#[cfg(test)]
mod tests {
    use debloat_ir::{builder::test_util::*, CallSiteEffect, Signature, Type};

    use super::*;

    #[test]
    fn clone_keeps_ids() {
        let mut mb = TestModuleBuilder::new();
        let mut builder = mb.func_builder(&[Type::I32], &Type::I32);
        let b0 = builder.append_block();
        builder.switch_to_block(b0);
        let arg = builder.args()[0];
        let one = builder.make_imm_value(1i32);
        let sum = builder.add(arg, one);
        builder.ret(Some(sum));
        let func = builder.finish();
        let mut module = mb.build();

        let clone = clone_function(&mut module, func, "test_func.clone0".into());
        let body = &module.funcs[clone];
        assert_eq!(body.name(), "test_func.clone0");
        assert_eq!(body.sig.linkage(), Linkage::Private);
        assert_eq!(body.dfg.value_inst(sum), module.funcs[func].dfg.value_inst(sum));
        insta::assert_snapshot!(dump_func(&module, clone), @r"
        func private %test_func.clone0(v0.i32) -> i32 {
            block0:
                v2.i32 = add v0 1.i32;
                return v2;
        }
        ");
    }

    #[test]
    fn copied_loop_body_is_remapped() {
        let mut mb = TestModuleBuilder::new();
        let ext = mb.declare_function(Signature::new("ext", Linkage::External, &[], Type::Void));
        let mut builder = mb.func_builder(&[], &Type::Void);
        let entry = builder.append_block();
        let header = builder.append_block();
        let exit = builder.append_block();

        builder.switch_to_block(entry);
        let zero = builder.make_imm_value(0i32);
        builder.jump(header);

        builder.switch_to_block(header);
        let i = builder.phi(Type::I32, &[(zero, entry)]);
        let one = builder.make_imm_value(1i32);
        let next = builder.add(i, one);
        builder.call(ext, &[]);
        let call = builder.last_inst().unwrap();
        builder.add_call_effect(call, CallSiteEffect::read(1));
        let ten = builder.make_imm_value(10i32);
        let cond = builder.slt(next, ten);
        builder.br(cond, header, exit);
        builder.append_phi_arg(i, next, header);

        builder.switch_to_block(exit);
        builder.ret(None);
        let func = builder.finish();
        let mut module = mb.build();

        let body = &mut module.funcs[func];
        let map = copy_blocks(body, &[header], header);
        let copy = map.block(header);
        assert_eq!(body.layout.next_block_of(header), Some(copy));

        let new_call = map.inst(call).unwrap();
        assert_eq!(body.meta.call_effects(new_call), &[CallSiteEffect::read(1)]);
        assert_eq!(body.meta.origin_site(new_call), call);

        insta::assert_snapshot!(dump_func(&module, func), @r"
        func public %test_func() -> void {
            block0:
                jump block1;

            block1:
                v1.i32 = phi (0.i32 block0) (v3 block1);
                v3.i32 = add v1 1.i32;
                call %ext;
                v5.i1 = slt v3 10.i32;
                br v5 block1 block2;

            block3:
                v6.i32 = phi (0.i32 block0) (v7 block3);
                v7.i32 = add v6 1.i32;
                call %ext;
                v8.i1 = slt v7 10.i32;
                br v8 block3 block2;

            block2:
                return;
        }
        ");
    }
}
