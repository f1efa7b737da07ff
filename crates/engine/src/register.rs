use debloat_ir::{FuncRef, GlobalVariable, Type, Value, ValueId};
use rustc_hash::FxHashMap;

use crate::memory::func_addr;

/// A definite fact about an SSA value: its concrete bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub value: u64,
    pub ty: Type,
    /// The value points into a context object or was derived from such a
    /// pointer.
    pub tracked: bool,
}

impl Register {
    pub fn new(value: u64, ty: Type) -> Self {
        Self {
            value,
            ty,
            tracked: false,
        }
    }

    pub fn tracked(mut self, tracked: bool) -> Self {
        self.tracked = tracked;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegisterFile {
    regs: FxHashMap<(FuncRef, ValueId), Register>,
    globals: FxHashMap<GlobalVariable, u64>,
}

impl RegisterFile {
    pub fn add(&mut self, func: FuncRef, value: ValueId, reg: Register) {
        self.regs.insert((func, value), reg);
    }

    pub fn get(&self, func: FuncRef, value: ValueId) -> Option<&Register> {
        self.regs.get(&(func, value))
    }

    pub fn set_global_addr(&mut self, gv: GlobalVariable, addr: u64) {
        self.globals.insert(gv, addr);
    }

    pub fn global_addr(&self, gv: GlobalVariable) -> Option<u64> {
        self.globals.get(&gv).copied()
    }

    pub fn globals(&self) -> impl Iterator<Item = (GlobalVariable, u64)> + '_ {
        self.globals.iter().map(|(gv, addr)| (*gv, *addr))
    }

    /// Resolves the bits of `value` seen from `func`, `None` if unknown.
    pub fn fact(&self, func: FuncRef, value: ValueId, data: &Value) -> Option<u64> {
        match data {
            Value::Immediate { imm, .. } => Some(imm.as_u64()),
            Value::Global { gv, .. } => self.global_addr(*gv),
            Value::Func { func, .. } => Some(func_addr(*func)),
            Value::Null { .. } => Some(0),
            Value::Undef { .. } => None,
            Value::Inst { .. } | Value::Arg { .. } => self.get(func, value).map(|reg| reg.value),
        }
    }

    pub fn is_tracked(&self, func: FuncRef, value: ValueId) -> bool {
        self.get(func, value).is_some_and(|reg| reg.tracked)
    }

    pub fn copy_function(&mut self, from: FuncRef, to: FuncRef) {
        let copies: Vec<_> = self
            .regs
            .iter()
            .filter(|((func, _), _)| *func == from)
            .map(|((_, value), reg)| ((to, *value), reg.clone()))
            .collect();
        self.regs.extend(copies);
    }

    pub fn cleanup_function(&mut self, func: FuncRef) {
        self.regs.retain(|(f, _), _| *f != func);
    }
}

#[cfg(test)]
mod tests {
    use cranelift_entity::EntityRef;
    use debloat_ir::Immediate;

    use super::*;

    #[test]
    fn facts() {
        let f = FuncRef::new(0);
        let g = FuncRef::new(1);
        let gv = GlobalVariable(0);
        let mut regs = RegisterFile::default();
        regs.set_global_addr(gv, 0x1_0000_0010);
        regs.add(f, ValueId(3), Register::new(42, Type::I32).tracked(true));

        let imm = Value::Immediate {
            imm: Immediate::I8(-1),
            ty: Type::I8,
        };
        assert_eq!(regs.fact(f, ValueId(0), &imm), Some(0xff));
        let global = Value::Global {
            gv,
            ty: Type::make_ptr(Type::I32),
        };
        assert_eq!(regs.fact(f, ValueId(1), &global), Some(0x1_0000_0010));
        let inst = Value::Arg {
            ty: Type::I32,
            idx: 0,
        };
        assert_eq!(regs.fact(f, ValueId(3), &inst), Some(42));
        assert_eq!(regs.fact(g, ValueId(3), &inst), None);
        assert!(regs.is_tracked(f, ValueId(3)));

        regs.copy_function(f, g);
        regs.cleanup_function(f);
        assert_eq!(regs.fact(g, ValueId(3), &inst), Some(42));
        assert!(regs.get(f, ValueId(3)).is_none());
        assert_eq!(regs.globals().count(), 1);
    }
}
