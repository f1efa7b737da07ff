//! Textual dump of functions and modules, used for debugging and snapshot tests.
use std::fmt::{self, Write};

use crate::{
    inst::{InstData, InstId},
    module::FuncRef,
    BlockId, Function, Module, Value, ValueId,
};

pub struct ModuleWriter<'a> {
    module: &'a Module,
}

impl<'a> ModuleWriter<'a> {
    pub fn new(module: &'a Module) -> Self {
        Self { module }
    }

    pub fn write(&mut self, w: &mut impl Write) -> fmt::Result {
        let mut has_globals = false;
        for (_, gv) in self.module.gv_store.iter() {
            writeln!(w, "{gv};")?;
            has_globals = true;
        }
        if has_globals {
            writeln!(w)?;
        }

        let mut delim = "";
        for func_ref in self.module.iter_functions() {
            w.write_str(delim)?;
            FuncWriter::new(self.module, func_ref).write(w)?;
            delim = "\n";
        }

        Ok(())
    }

    pub fn dump_string(&mut self) -> String {
        let mut s = String::new();
        // Writing into a `String` can't fail.
        let _ = self.write(&mut s);
        s
    }
}

pub struct FuncWriter<'a> {
    module: &'a Module,
    func: &'a Function,
    level: u8,
}

impl<'a> FuncWriter<'a> {
    pub fn new(module: &'a Module, func_ref: FuncRef) -> Self {
        Self {
            module,
            func: &module.funcs[func_ref],
            level: 0,
        }
    }

    pub fn write(&mut self, w: &mut impl Write) -> fmt::Result {
        let sig = &self.func.sig;
        if self.func.is_declaration() {
            write!(w, "declare {} %{}(", sig.linkage(), sig.name())?;
            self.write_delimited(w, sig.args().iter(), ", ", |_, w, ty| write!(w, "{ty}"))?;
            return writeln!(w, ") -> {};", sig.ret_ty());
        }

        write!(w, "func {} %{}(", sig.linkage(), sig.name())?;
        self.write_delimited(w, self.func.arg_values.iter(), ", ", |this, w, &arg| {
            write!(w, "v{}.{}", arg.0, this.func.dfg.value_ty(arg))
        })?;
        writeln!(w, ") -> {} {{", sig.ret_ty())?;

        self.level += 1;
        let mut first = true;
        for block in self.func.layout.iter_block() {
            if !first {
                writeln!(w)?;
            }
            first = false;
            self.write_block_with_inst(block, w)?;
        }
        self.level -= 1;

        writeln!(w, "}}")
    }

    pub fn dump_string(&mut self) -> String {
        let mut s = String::new();
        let _ = self.write(&mut s);
        s
    }

    pub fn write_block_with_inst(&mut self, block: BlockId, w: &mut impl Write) -> fmt::Result {
        self.indent(w)?;
        writeln!(w, "{block}:")?;

        self.level += 1;
        for inst in self.func.layout.iter_inst(block) {
            self.indent(w)?;
            self.write_inst(inst, w)?;
            writeln!(w, ";")?;
        }
        self.level -= 1;

        Ok(())
    }

    pub fn write_inst(&self, inst: InstId, w: &mut impl Write) -> fmt::Result {
        if let Some(result) = self.func.dfg.inst_result(inst) {
            write!(w, "v{}.{} = ", result.0, self.func.dfg.value_ty(result))?;
        }

        match self.func.dfg.inst(inst) {
            InstData::Unary { code, args } => {
                write!(w, "{code} ")?;
                self.write_values(w, args)
            }
            InstData::Binary { code, args } => {
                write!(w, "{code} ")?;
                self.write_values(w, args)
            }
            InstData::Cast { code, args, .. } => {
                write!(w, "{code} ")?;
                self.write_values(w, args)
            }
            InstData::Select { args } => {
                w.write_str("select ")?;
                self.write_values(w, args)
            }
            InstData::Alloca { ty } => write!(w, "alloca {ty}"),
            InstData::Load { args, .. } => {
                w.write_str("load ")?;
                self.write_values(w, args)
            }
            InstData::Store { args } => {
                w.write_str("store ")?;
                self.write_values(w, args)
            }
            InstData::Gep { args, .. } => {
                w.write_str("gep ")?;
                self.write_values(w, args)
            }
            InstData::Call { func, args, .. } => {
                write!(w, "call %{}", self.module.funcs[*func].sig.name())?;
                for &arg in args {
                    w.write_char(' ')?;
                    self.write_value(w, arg)?;
                }
                Ok(())
            }
            InstData::CallIndirect { args, .. } => {
                w.write_str("call_indirect ")?;
                self.write_values(w, args)
            }
            InstData::Jump { dests } => write!(w, "jump {}", dests[0]),
            InstData::Branch { args, dests } => {
                w.write_str("br ")?;
                self.write_value(w, args[0])?;
                write!(w, " {} {}", dests[0], dests[1])
            }
            InstData::BrTable {
                args,
                default,
                table,
            } => {
                w.write_str("br_table ")?;
                self.write_value(w, args[0])?;
                for (&value, block) in args[1..].iter().zip(table.iter()) {
                    w.write_str(" (")?;
                    self.write_value(w, value)?;
                    write!(w, " {block})")?;
                }
                if let Some(default) = default {
                    write!(w, " default {default}")?;
                }
                Ok(())
            }
            InstData::Return { args } => {
                w.write_str("return")?;
                if let Some(arg) = args {
                    w.write_char(' ')?;
                    self.write_value(w, *arg)?;
                }
                Ok(())
            }
            InstData::Unreachable => w.write_str("unreachable"),
            InstData::Phi { values, blocks, .. } => {
                w.write_str("phi")?;
                for (&value, block) in values.iter().zip(blocks.iter()) {
                    w.write_str(" (")?;
                    self.write_value(w, value)?;
                    write!(w, " {block})")?;
                }
                Ok(())
            }
            InstData::Marker { kind, test } => write!(w, "marker {kind} {test}"),
        }
    }

    fn write_values(&self, w: &mut impl Write, values: &[ValueId]) -> fmt::Result {
        self.write_delimited(w, values.iter(), " ", |this, w, &value| {
            this.write_value(w, value)
        })
    }

    fn write_value(&self, w: &mut impl Write, value: ValueId) -> fmt::Result {
        match self.func.dfg.value(value) {
            Value::Immediate { imm, ty } => write!(w, "{imm}.{ty}"),
            Value::Global { gv, .. } => {
                write!(w, "%{}", self.module.gv_store.gv_data(*gv).symbol)
            }
            Value::Func { func, .. } => write!(w, "%{}", self.module.funcs[*func].sig.name()),
            Value::Null { .. } => w.write_str("null"),
            Value::Undef { .. } => w.write_str("undef"),
            Value::Inst { .. } | Value::Arg { .. } => write!(w, "v{}", value.0),
        }
    }

    fn write_delimited<T, W: Write>(
        &self,
        w: &mut W,
        iter: impl Iterator<Item = T>,
        delim: &str,
        mut f: impl FnMut(&Self, &mut W, T) -> fmt::Result,
    ) -> fmt::Result {
        let mut iter = iter.peekable();
        while let Some(item) = iter.next() {
            f(self, w, item)?;
            if iter.peek().is_some() {
                w.write_str(delim)?;
            }
        }
        Ok(())
    }

    fn indent(&self, w: &mut impl Write) -> fmt::Result {
        for _ in 0..self.level {
            w.write_str("    ")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        builder::test_util::*, global_variable::GvInitializer, ir_writer::ModuleWriter,
        GlobalVariableData, Linkage, Signature, Type,
    };

    #[test]
    fn branches_and_phis() {
        let mut mb = TestModuleBuilder::new();
        let mut builder = mb.func_builder(&[Type::I32], &Type::I32);
        let b0 = builder.append_block();
        let b1 = builder.append_block();
        let b2 = builder.append_block();
        let b3 = builder.append_block();
        let arg = builder.args()[0];

        builder.switch_to_block(b0);
        let one = builder.make_imm_value(1i32);
        let two = builder.make_imm_value(2i32);
        builder.br_table(arg, Some(b3), &[(one, b1), (two, b2)]);

        builder.switch_to_block(b1);
        builder.jump(b3);
        builder.switch_to_block(b2);
        builder.jump(b3);

        builder.switch_to_block(b3);
        let phi = builder.phi(Type::I32, &[(one, b1), (two, b2), (arg, b0)]);
        builder.ret(Some(phi));

        let func_ref = builder.finish();
        let module = mb.build();

        insta::assert_snapshot!(dump_func(&module, func_ref), @r"
        func public %test_func(v0.i32) -> i32 {
            block0:
                br_table v0 (1.i32 block1) (2.i32 block2) default block3;

            block1:
                jump block3;

            block2:
                jump block3;

            block3:
                v3.i32 = phi (1.i32 block1) (2.i32 block2) (v0 block0);
                return v3;
        }
        ");
    }

    #[test]
    fn module_with_globals() {
        let mut mb = TestModuleBuilder::new();
        let gv = mb.module_builder().make_global(GlobalVariableData::constant(
            "limit".into(),
            Type::I32,
            Linkage::Private,
            GvInitializer::make_imm(10i32),
        ));
        let puts = mb.declare_function(Signature::new(
            "puts",
            Linkage::External,
            &[Type::make_ptr(Type::I8)],
            Type::I32,
        ));

        let mut builder = mb.func_builder(&[], &Type::Void);
        let b0 = builder.append_block();
        builder.switch_to_block(b0);
        let addr = builder.global_value(gv);
        let v = builder.load(addr, Type::I32);
        let p = builder.int_to_ptr(v, Type::make_ptr(Type::I8));
        builder.call(puts, &[p]);
        builder.ret(None);
        builder.finish();

        let module = mb.build();
        insta::assert_snapshot!(ModuleWriter::new(&module).dump_string(), @r"
        global private const i32 %limit = 10;

        declare external %puts(*i8) -> i32;

        func public %test_func() -> void {
            block0:
                v1.i32 = load %limit;
                v2.*i8 = inttoptr v1;
                v3.i32 = call %puts v2;
                return;
        }
        ");
    }
}
