use std::time::Duration;

use debloat_engine::{debloat, Engine, EngineConfig, Stats};
use debloat_ir::{
    builder::test_util::*, CallSiteEffect, FuncAttrs, GlobalVariableData, GvInitializer, Linkage,
    Module, ModRange, Signature, Type,
};
use test_log::test;

fn run(module: Module) -> (Module, Stats) {
    run_with(module, EngineConfig::default())
}

fn run_with(module: Module, config: EngineConfig) -> (Module, Stats) {
    debloat(module, config).unwrap()
}

fn dump_entry(module: &Module) -> String {
    dump_func(module, module.entry.unwrap())
}

fn external(name: &str, args: &[Type], ret_ty: Type) -> Signature {
    Signature::new(name, Linkage::External, args, ret_ty)
}

#[test]
fn stored_constant_reaches_load() {
    let mut mb = TestModuleBuilder::new();
    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    let b1 = builder.append_block();

    builder.switch_to_block(b0);
    let slot = builder.alloca(Type::I32);
    let five = builder.make_imm_value(5i32);
    builder.store(slot, five);
    builder.jump(b1);

    builder.switch_to_block(b1);
    let v = builder.load(slot, Type::I32);
    builder.ret(Some(v));
    builder.finish();

    let (module, stats) = run(mb.build());
    let dump = dump_entry(&module);
    assert!(dump.contains("return 5.i32;"), "{dump}");
    assert!(!dump.contains("load"), "{dump}");
    assert!(stats.insts_folded >= 1);
}

#[test]
fn constant_branch_drops_dead_successor() {
    let mut mb = TestModuleBuilder::new();
    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    let b1 = builder.append_block();
    let b2 = builder.append_block();

    builder.switch_to_block(b0);
    let cond = builder.make_imm_value(false);
    builder.br(cond, b1, b2);

    builder.switch_to_block(b1);
    let one = builder.make_imm_value(1i32);
    builder.ret(Some(one));

    builder.switch_to_block(b2);
    let two = builder.make_imm_value(2i32);
    builder.ret(Some(two));
    builder.finish();

    let (module, stats) = run(mb.build());
    insta::assert_snapshot!(dump_entry(&module), @r"
    func public %test_func() -> i32 {
        block0:
            jump block2;

        block2:
            return 2.i32;
    }
    ");
    assert!(stats.blocks_removed >= 1);
}

/// Two stores on the arms of an unknown branch meet at the join.
fn diamond_store(left: i32, right: i32) -> Module {
    let mut mb = TestModuleBuilder::new();
    let mut builder = mb.func_builder(&[Type::I1], &Type::I32);
    let b0 = builder.append_block();
    let b1 = builder.append_block();
    let b2 = builder.append_block();
    let b3 = builder.append_block();
    let cond = builder.args()[0];

    builder.switch_to_block(b0);
    let slot = builder.alloca(Type::I32);
    builder.br(cond, b1, b2);

    builder.switch_to_block(b1);
    let left = builder.make_imm_value(left);
    builder.store(slot, left);
    builder.jump(b3);

    builder.switch_to_block(b2);
    let right = builder.make_imm_value(right);
    builder.store(slot, right);
    builder.jump(b3);

    builder.switch_to_block(b3);
    let v = builder.load(slot, Type::I32);
    builder.ret(Some(v));
    builder.finish();
    mb.build()
}

#[test]
fn join_keeps_only_agreeing_bytes() {
    let (module, _) = run(diamond_store(3, 4));
    let dump = dump_entry(&module);
    assert!(dump.contains("load"), "{dump}");
    assert!(!dump.contains("return 3.i32"), "{dump}");

    let (module, _) = run(diamond_store(3, 3));
    let dump = dump_entry(&module);
    assert!(dump.contains("return 3.i32;"), "{dump}");
}

/// `main` passes `arg` to `inc`, which returns its argument plus one.
fn call_inc(folded_arg: bool) -> Module {
    let mut mb = TestModuleBuilder::new();
    let inc = mb.declare_function(Signature::new(
        "inc",
        Linkage::Private,
        &[Type::I32],
        Type::I32,
    ));

    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let arg = if folded_arg {
        let two = builder.make_imm_value(2i32);
        let three = builder.make_imm_value(3i32);
        builder.add(two, three)
    } else {
        builder.make_imm_value(5i32)
    };
    let res = builder.call(inc, &[arg]).unwrap();
    builder.ret(Some(res));
    builder.finish();

    let mut builder = mb.module_builder().func_builder(inc);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let x = builder.args()[0];
    let one = builder.make_imm_value(1i32);
    let y = builder.add(x, one);
    builder.ret(Some(y));
    builder.finish();

    mb.build()
}

#[test]
fn unchanged_call_is_left_alone() {
    let (module, stats) = run(call_inc(false));
    let dump = dump_entry(&module);
    assert_eq!(stats.functions_cloned, 0);
    assert!(dump.contains("call %inc 5.i32"), "{dump}");
    assert!(!dump.contains("return 6.i32"), "{dump}");
}

#[test]
fn new_constant_argument_specializes_callee() {
    let (module, stats) = run(call_inc(true));
    let dump = dump_entry(&module);
    assert_eq!(stats.functions_cloned, 1);
    assert!(dump.contains("call %inc.clone0 5.i32"), "{dump}");
    assert!(dump.contains("return 6.i32;"), "{dump}");

    let clone = module.func_by_name("inc.clone0").unwrap();
    assert!(dump_func(&module, clone).contains("return 6.i32;"));
}

#[test]
fn second_run_changes_nothing() {
    let (module, _) = run(call_inc(true));
    let first = dump_entry(&module);

    let (module, stats) = run(module);
    assert_eq!(dump_entry(&module), first);
    assert_eq!(stats.insts_folded, 0);
    assert_eq!(stats.functions_cloned, 0);
}

/// Counts from zero until `i + 1` reaches `n`, which is a literal when
/// `bound` is given and the entry argument otherwise.
fn counted_loop(bound: Option<i32>) -> Module {
    let mut mb = TestModuleBuilder::new();
    let args = match bound {
        Some(_) => vec![],
        None => vec![Type::I32],
    };
    let mut builder = mb.func_builder(&args, &Type::I32);
    let entry = builder.append_block();
    let header = builder.append_block();
    let exit = builder.append_block();

    builder.switch_to_block(entry);
    let n = match bound {
        Some(bound) => builder.make_imm_value(bound),
        None => builder.args()[0],
    };
    let zero = builder.make_imm_value(0i32);
    builder.jump(header);

    builder.switch_to_block(header);
    let i = builder.phi(Type::I32, &[(zero, entry)]);
    let one = builder.make_imm_value(1i32);
    let next = builder.add(i, one);
    let cond = builder.slt(next, n);
    builder.br(cond, header, exit);
    builder.append_phi_arg(i, next, header);

    builder.switch_to_block(exit);
    let out = builder.phi(Type::I32, &[(next, header)]);
    builder.ret(Some(out));
    builder.finish();
    mb.build()
}

#[test]
fn bounded_loop_is_unrolled() {
    let (module, stats) = run(counted_loop(Some(4)));
    let dump = dump_entry(&module);
    assert_eq!(stats.loops_passed, 1);
    assert_eq!(stats.loops_failed, 0);
    assert!(dump.contains("return 4.i32;"), "{dump}");
    assert!(!dump.contains("marker"), "{dump}");
}

#[test]
fn unbounded_loop_is_rolled_back() {
    let input = counted_loop(None);
    let funcs = input.funcs.len();

    let (module, stats) = run(input);
    let dump = dump_entry(&module);
    assert_eq!(stats.loops_passed, 0);
    assert_eq!(stats.loops_failed, 1);
    assert_eq!(stats.loops_rolled_back, 1);
    assert_eq!(module.funcs.len(), funcs);
    assert!(dump.contains("phi"), "{dump}");
    assert!(!dump.contains("marker"), "{dump}");
}

#[test]
fn unrolling_can_be_disabled() {
    let config = EngineConfig {
        unroll_loops: false,
        ..EngineConfig::default()
    };
    let (module, stats) = run_with(counted_loop(Some(4)), config);
    assert_eq!(stats.loops_unrolled, 0);
    assert!(dump_entry(&module).contains("phi"));
}

#[test]
fn fork_aborts_specialization() {
    let mut mb = TestModuleBuilder::new();
    let fork = mb.declare_function(external("fork", &[], Type::I32));
    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let pid = builder.call(fork, &[]).unwrap();
    builder.ret(Some(pid));
    builder.finish();

    let mut engine = Engine::new(mb.build(), EngineConfig::default()).unwrap();
    engine.run();
    assert!(engine.is_aborted());
}

#[test]
fn entry_must_have_a_body() {
    let mut mb = TestModuleBuilder::new();
    let main = mb.declare_function(external("main", &[], Type::I32));
    mb.module_builder().set_entry(main);
    assert!(Engine::new(mb.build(), EngineConfig::default()).is_err());
}

#[test]
fn indirect_call_becomes_direct() {
    let mut mb = TestModuleBuilder::new();
    let inc = mb.declare_function(Signature::new(
        "inc",
        Linkage::Private,
        &[Type::I32],
        Type::I32,
    ));

    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let callee = builder.func_addr(inc);
    let five = builder.make_imm_value(5i32);
    let res = builder.call_indirect(callee, &[five], Type::I32).unwrap();
    builder.ret(Some(res));
    builder.finish();

    let mut builder = mb.module_builder().func_builder(inc);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let x = builder.args()[0];
    builder.ret(Some(x));
    builder.finish();

    let (module, _) = run(mb.build());
    let dump = dump_entry(&module);
    assert!(dump.contains("call %inc 5.i32"), "{dump}");
    assert!(!dump.contains("call_indirect"), "{dump}");
}

#[test]
fn indirect_call_casts_pointer_arguments() {
    let mut mb = TestModuleBuilder::new();
    let sink = mb.declare_function(external(
        "sink",
        &[Type::make_ptr(Type::I8)],
        Type::Void,
    ));

    let mut builder = mb.func_builder(&[], &Type::Void);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let slot = builder.alloca(Type::I32);
    let callee = builder.func_addr(sink);
    builder.call_indirect(callee, &[slot], Type::Void);
    builder.ret(None);
    builder.finish();

    let (module, _) = run(mb.build());
    let dump = dump_entry(&module);
    assert!(dump.contains("bitcast"), "{dump}");
    assert!(dump.contains("call %sink"), "{dump}");
    assert!(!dump.contains("call_indirect"), "{dump}");
}

#[test]
fn heap_memory_is_emulated() {
    let mut mb = TestModuleBuilder::new();
    let malloc = mb.declare_function(external(
        "malloc",
        &[Type::I64],
        Type::make_ptr(Type::I8),
    ));
    let mut builder = mb.func_builder(&[], &Type::I64);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let size = builder.make_imm_value(8i64);
    let raw = builder.call(malloc, &[size]).unwrap();
    let p = builder.bitcast(raw, Type::make_ptr(Type::I64));
    let val = builder.make_imm_value(42i64);
    builder.store(p, val);
    let v = builder.load(p, Type::I64);
    builder.ret(Some(v));
    builder.finish();

    let (module, _) = run(mb.build());
    let dump = dump_entry(&module);
    assert!(dump.contains("return 42.i64;"), "{dump}");
}

#[test]
fn calloc_memory_reads_zero() {
    let mut mb = TestModuleBuilder::new();
    let calloc = mb.declare_function(external(
        "calloc",
        &[Type::I64, Type::I64],
        Type::make_ptr(Type::I8),
    ));
    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let num = builder.make_imm_value(4i64);
    let size = builder.make_imm_value(4i64);
    let raw = builder.call(calloc, &[num, size]).unwrap();
    let p = builder.bitcast(raw, Type::make_ptr(Type::I32));
    let v = builder.load(p, Type::I32);
    builder.ret(Some(v));
    builder.finish();

    let (module, _) = run(mb.build());
    assert!(dump_entry(&module).contains("return 0.i32;"));
}

#[test]
fn memcpy_moves_constant_bytes() {
    let mut mb = TestModuleBuilder::new();
    let i8_ptr = Type::make_ptr(Type::I8);
    let memcpy = mb.declare_function(external(
        "llvm.memcpy.p0.p0.i64",
        &[i8_ptr.clone(), i8_ptr.clone(), Type::I64, Type::I1],
        Type::Void,
    ));
    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let src = builder.alloca(Type::I32);
    let dst = builder.alloca(Type::I32);
    let seven = builder.make_imm_value(7i32);
    builder.store(src, seven);
    let src_raw = builder.bitcast(src, i8_ptr.clone());
    let dst_raw = builder.bitcast(dst, i8_ptr);
    let len = builder.make_imm_value(4i64);
    let volatile = builder.make_imm_value(false);
    builder.call(memcpy, &[dst_raw, src_raw, len, volatile]);
    let v = builder.load(dst, Type::I32);
    builder.ret(Some(v));
    builder.finish();

    let (module, _) = run(mb.build());
    assert!(dump_entry(&module).contains("return 7.i32;"));
}

/// Passes a constant slot to the declared `callee` and reloads it.
fn pass_slot(callee: Signature) -> Module {
    let mut mb = TestModuleBuilder::new();
    let callee = mb.declare_function(callee);
    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let slot = builder.alloca(Type::I32);
    let seven = builder.make_imm_value(7i32);
    builder.store(slot, seven);
    builder.call(callee, &[slot]);
    let v = builder.load(slot, Type::I32);
    builder.ret(Some(v));
    builder.finish();
    mb.build()
}

#[test]
fn opaque_call_clobbers_pointer_arguments() {
    let args = [Type::make_ptr(Type::I32)];
    let (module, _) = run(pass_slot(external("scribble", &args, Type::Void)));
    assert!(dump_entry(&module).contains("load"));

    let inspect = external("inspect", &args, Type::Void).with_attrs(FuncAttrs {
        read_only: true,
        ..FuncAttrs::default()
    });
    let (module, _) = run(pass_slot(inspect));
    assert!(dump_entry(&module).contains("return 7.i32;"));
}

#[test]
fn opaque_call_clobbers_globals_it_writes() {
    let mut mb = TestModuleBuilder::new();
    let touch = mb.declare_function(Signature::new("touch", Linkage::Private, &[], Type::Void));
    let globals = mb.module_builder();
    let state = globals.make_global(GlobalVariableData::new(
        "state".into(),
        Type::I32,
        Linkage::Private,
        false,
        Some(GvInitializer::make_imm(0i32)),
    ));
    let other = globals.make_global(GlobalVariableData::new(
        "other".into(),
        Type::I32,
        Linkage::Private,
        false,
        Some(GvInitializer::make_imm(0i32)),
    ));

    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let state_ptr = builder.global_value(state);
    let other_ptr = builder.global_value(other);
    let one = builder.make_imm_value(1i32);
    builder.store(state_ptr, one);
    builder.store(other_ptr, one);
    builder.call(touch, &[]);
    let s = builder.load(state_ptr, Type::I32);
    let o = builder.load(other_ptr, Type::I32);
    let sum = builder.add(s, o);
    builder.ret(Some(sum));
    builder.finish();

    let mut builder = mb.module_builder().func_builder(touch);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let state_ptr = builder.global_value(state);
    let two = builder.make_imm_value(2i32);
    builder.store(state_ptr, two);
    builder.ret(None);
    builder.finish();

    let (module, _) = run(mb.build());
    let dump = dump_entry(&module);
    assert!(dump.contains("load %state"), "{dump}");
    assert!(!dump.contains("load %other"), "{dump}");
}

#[test]
fn call_footprint_limits_invalidation() {
    let mut mb = TestModuleBuilder::new();
    let malloc = mb.declare_function(external(
        "malloc",
        &[Type::I64],
        Type::make_ptr(Type::I8),
    ));
    let update = mb.declare_function(Signature::new(
        "update",
        Linkage::Private,
        &[Type::make_ptr(Type::I8)],
        Type::Void,
    ));
    let report = mb.declare_function(external("report", &[Type::I32], Type::Void));

    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let size = builder.make_imm_value(8i64);
    let raw = builder.call(malloc, &[size]).unwrap();
    let site = builder.last_inst().unwrap();
    builder.set_alloc_site(site, 1);

    let lo = builder.bitcast(raw, Type::make_ptr(Type::I32));
    let idx = builder.make_imm_value(1i64);
    let hi = builder.gep(lo, Type::I32, &[idx]);
    let five = builder.make_imm_value(5i32);
    builder.store(lo, five);
    builder.store(hi, five);

    builder.call(update, &[raw]);
    let call = builder.last_inst().unwrap();
    builder.add_call_effect(call, CallSiteEffect::write(1));

    let lo_val = builder.load(lo, Type::I32);
    builder.call(report, &[lo_val]);
    let hi_val = builder.load(hi, Type::I32);
    builder.ret(Some(hi_val));
    builder.finish();

    let mut builder = mb.module_builder().func_builder(update);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    builder.ret(None);
    builder.add_mod_range(ModRange {
        ctx_id: 1,
        start: 0,
        end: 4,
    });
    builder.finish();

    let config = EngineConfig {
        clone_limit: Some(0),
        ..EngineConfig::default()
    };
    let (module, stats) = run_with(mb.build(), config);
    let dump = dump_entry(&module);
    assert_eq!(stats.functions_cloned, 0);
    assert!(!dump.contains("call %report 5.i32"), "{dump}");
    assert!(dump.contains("return 5.i32;"), "{dump}");
}

#[test]
fn huge_alloca_stays_in_the_program() {
    let mut mb = TestModuleBuilder::new();
    let mut builder = mb.func_builder(&[], &Type::I8);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let buf = builder.alloca(Type::make_array(Type::I8, 1 << 40));
    let p = builder.bitcast(buf, Type::make_ptr(Type::I8));
    let one = builder.make_imm_value(1i8);
    builder.store(p, one);
    let v = builder.load(p, Type::I8);
    builder.ret(Some(v));
    builder.finish();

    let (module, _) = run(mb.build());
    let dump = dump_entry(&module);
    assert!(dump.contains("alloca"), "{dump}");
    assert!(dump.contains("load"), "{dump}");
}

/// Dispatches on the literal 1 with an unknown case in front of the
/// matching one.
fn br_table_after_unknown_case(first_known: bool) -> Module {
    let mut mb = TestModuleBuilder::new();
    let mut builder = mb.func_builder(&[Type::I32], &Type::I32);
    let b0 = builder.append_block();
    let b1 = builder.append_block();
    let b2 = builder.append_block();
    let b3 = builder.append_block();

    builder.switch_to_block(b0);
    let scrutinee = builder.make_imm_value(1i32);
    let first = if first_known {
        builder.make_imm_value(0i32)
    } else {
        builder.args()[0]
    };
    let second = builder.make_imm_value(1i32);
    builder.br_table(scrutinee, Some(b3), &[(first, b1), (second, b2)]);

    for (block, ret) in [(b1, 10i32), (b2, 20), (b3, 30)] {
        builder.switch_to_block(block);
        let ret = builder.make_imm_value(ret);
        builder.ret(Some(ret));
    }
    builder.finish();
    mb.build()
}

#[test]
fn br_table_waits_for_earlier_cases() {
    let (module, _) = run(br_table_after_unknown_case(false));
    let dump = dump_entry(&module);
    assert!(dump.contains("br_table"), "{dump}");
    assert!(dump.contains("return 10.i32;"), "{dump}");
    assert!(dump.contains("return 20.i32;"), "{dump}");

    let (module, _) = run(br_table_after_unknown_case(true));
    let dump = dump_entry(&module);
    assert!(!dump.contains("br_table"), "{dump}");
    assert!(!dump.contains("return 10.i32;"), "{dump}");
    assert!(dump.contains("return 20.i32;"), "{dump}");
}

/// Allocates context object 1, fills it with a constant and calls the
/// defined `peek` with `effect` recorded on the call.
fn call_with_effect(effect: Option<CallSiteEffect>) -> Module {
    let mut mb = TestModuleBuilder::new();
    let malloc = mb.declare_function(external(
        "malloc",
        &[Type::I64],
        Type::make_ptr(Type::I8),
    ));
    let peek = mb.declare_function(Signature::new("peek", Linkage::Private, &[], Type::Void));

    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let size = builder.make_imm_value(4i64);
    let raw = builder.call(malloc, &[size]).unwrap();
    let site = builder.last_inst().unwrap();
    builder.set_alloc_site(site, 1);
    let p = builder.bitcast(raw, Type::make_ptr(Type::I32));
    let nine = builder.make_imm_value(9i32);
    builder.store(p, nine);
    builder.call(peek, &[]);
    if let Some(effect) = effect {
        let call = builder.last_inst().unwrap();
        builder.add_call_effect(call, effect);
    }
    let v = builder.load(p, Type::I32);
    builder.ret(Some(v));
    builder.finish();

    let mut builder = mb.module_builder().func_builder(peek);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    builder.ret(None);
    builder.finish();
    mb.build()
}

#[test]
fn call_without_new_facts_is_not_cloned() {
    let (_, stats) = run(call_with_effect(None));
    assert_eq!(stats.functions_cloned, 0);
    assert_eq!(stats.calls_skipped, 1);
}

#[test]
fn allocating_call_is_cloned() {
    let (module, stats) = run(call_with_effect(Some(CallSiteEffect::malloc(2))));
    assert_eq!(stats.functions_cloned, 1);
    assert!(dump_entry(&module).contains("call %peek.clone0"));
}

#[test]
fn call_reading_constant_object_is_cloned() {
    let (module, stats) = run(call_with_effect(Some(CallSiteEffect::read(1))));
    let dump = dump_entry(&module);
    assert_eq!(stats.functions_cloned, 1);
    assert!(dump.contains("call %peek.clone0"), "{dump}");
    assert!(dump.contains("return 9.i32;"), "{dump}");
}

#[test]
fn call_depth_limits_cloning() {
    let config = EngineConfig {
        max_call_depth: 1,
        ..EngineConfig::default()
    };
    let (module, stats) = run_with(call_inc(true), config);
    assert_eq!(stats.functions_cloned, 0);
    assert!(dump_entry(&module).contains("call %inc 5.i32"));
}

#[test]
fn exhausted_time_budget_rolls_back() {
    let config = EngineConfig {
        unroll_time_budget: Duration::ZERO,
        ..EngineConfig::default()
    };
    let (module, stats) = run_with(counted_loop(Some(4)), config);
    assert_eq!(stats.loops_passed, 0);
    assert_eq!(stats.loops_rolled_back, 1);
    assert!(dump_entry(&module).contains("phi"));
}

#[test]
fn realloc_keeps_constant_prefix() {
    let mut mb = TestModuleBuilder::new();
    let i8_ptr = Type::make_ptr(Type::I8);
    let malloc = mb.declare_function(external("malloc", &[Type::I64], i8_ptr.clone()));
    let realloc = mb.declare_function(external(
        "realloc",
        &[i8_ptr.clone(), Type::I64],
        i8_ptr,
    ));
    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let four = builder.make_imm_value(4i64);
    let old = builder.call(malloc, &[four]).unwrap();
    let old_p = builder.bitcast(old, Type::make_ptr(Type::I32));
    let seven = builder.make_imm_value(7i32);
    builder.store(old_p, seven);
    let eight = builder.make_imm_value(8i64);
    let new = builder.call(realloc, &[old, eight]).unwrap();
    let new_p = builder.bitcast(new, Type::make_ptr(Type::I32));
    let v = builder.load(new_p, Type::I32);
    builder.ret(Some(v));
    builder.finish();

    let (module, _) = run(mb.build());
    assert!(dump_entry(&module).contains("return 7.i32;"));
}

#[test]
fn memset_fills_constant_bytes() {
    let mut mb = TestModuleBuilder::new();
    let i8_ptr = Type::make_ptr(Type::I8);
    let memset = mb.declare_function(external(
        "llvm.memset.p0.i64",
        &[i8_ptr.clone(), Type::I8, Type::I64, Type::I1],
        Type::Void,
    ));
    let mut builder = mb.func_builder(&[], &Type::I32);
    let b0 = builder.append_block();
    builder.switch_to_block(b0);
    let slot = builder.alloca(Type::I32);
    let raw = builder.bitcast(slot, i8_ptr);
    let fill = builder.make_imm_value(0x11i8);
    let len = builder.make_imm_value(4i64);
    let volatile = builder.make_imm_value(false);
    builder.call(memset, &[raw, fill, len, volatile]);
    let v = builder.load(slot, Type::I32);
    builder.ret(Some(v));
    builder.finish();

    let (module, _) = run(mb.build());
    assert!(dump_entry(&module).contains("return 286331153.i32;"));
}
