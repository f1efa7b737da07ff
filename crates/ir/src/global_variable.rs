use std::fmt;

use cranelift_entity::entity_impl;

use cranelift_entity::PrimaryMap;
use rustc_hash::FxHashMap;

use crate::{module::FuncRef, Immediate, Linkage, Type};

#[derive(Debug, Clone, Default)]
pub struct GlobalVariableStore {
    gv_data: PrimaryMap<GlobalVariable, GlobalVariableData>,
    symbols: FxHashMap<String, GlobalVariable>,
}

impl GlobalVariableStore {
    /// Registers a global. If the symbol is already taken, the existing global
    /// is returned as the error.
    pub fn make_gv(
        &mut self,
        gv_data: GlobalVariableData,
    ) -> Result<GlobalVariable, GlobalVariable> {
        if let Some(&gv) = self.symbols.get(&gv_data.symbol) {
            return Err(gv);
        }
        let symbol = gv_data.symbol.clone();
        let gv = self.gv_data.push(gv_data);
        self.symbols.insert(symbol, gv);
        Ok(gv)
    }

    pub fn gv_data(&self, gv: GlobalVariable) -> &GlobalVariableData {
        &self.gv_data[gv]
    }

    pub fn gv_by_symbol(&self, symbol: &str) -> Option<GlobalVariable> {
        self.symbols.get(symbol).copied()
    }

    pub fn init_data(&self, gv: GlobalVariable) -> Option<&GvInitializer> {
        self.gv_data[gv].data.as_ref()
    }

    pub fn is_const(&self, gv: GlobalVariable) -> bool {
        self.gv_data[gv].is_const
    }

    pub fn ty(&self, gv: GlobalVariable) -> &Type {
        &self.gv_data[gv].ty
    }

    pub fn iter(&self) -> impl Iterator<Item = (GlobalVariable, &GlobalVariableData)> {
        self.gv_data.iter()
    }

    pub fn len(&self) -> usize {
        self.gv_data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gv_data.is_empty()
    }
}

/// An opaque reference to [`GlobalVariableData`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Copy, Hash)]
pub struct GlobalVariable(pub u32);
entity_impl!(GlobalVariable, "gv");

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalVariableData {
    pub symbol: String,
    pub ty: Type,
    pub linkage: Linkage,
    pub is_const: bool,
    pub data: Option<GvInitializer>,
}

impl GlobalVariableData {
    pub fn new(
        symbol: String,
        ty: Type,
        linkage: Linkage,
        is_const: bool,
        data: Option<GvInitializer>,
    ) -> Self {
        Self {
            symbol,
            ty,
            linkage,
            is_const,
            data,
        }
    }

    pub fn constant(symbol: String, ty: Type, linkage: Linkage, data: GvInitializer) -> Self {
        Self::new(symbol, ty, linkage, true, Some(data))
    }
}

impl fmt::Display for GlobalVariableData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "global {} ", self.linkage)?;
        if self.is_const {
            f.write_str("const ")?;
        }
        write!(f, "{} %{}", self.ty, self.symbol)?;
        if let Some(data) = &self.data {
            write!(f, " = {data}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GvInitializer {
    Immediate(Immediate),
    Array(Vec<GvInitializer>),
    Struct(Vec<GvInitializer>),
    /// Raw bytes, used for string literals.
    Bytes(Vec<u8>),
    /// All bytes of the global are zero.
    Zero,
    Null,
    GlobalAddr(GlobalVariable),
    FuncAddr(FuncRef),
}

impl GvInitializer {
    pub fn make_imm(data: impl Into<Immediate>) -> Self {
        Self::Immediate(data.into())
    }

    pub fn make_array(data: Vec<GvInitializer>) -> Self {
        Self::Array(data)
    }

    pub fn make_struct(data: Vec<GvInitializer>) -> Self {
        Self::Struct(data)
    }

    /// A NUL terminated string.
    pub fn make_cstr(s: &str) -> Self {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        Self::Bytes(bytes)
    }
}

fn write_list(f: &mut fmt::Formatter, items: &[GvInitializer]) -> fmt::Result {
    for (i, v) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{v}")?;
    }
    Ok(())
}

impl fmt::Display for GvInitializer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Immediate(data) => write!(f, "{data}"),
            Self::Array(data) => {
                f.write_str("[")?;
                write_list(f, data)?;
                f.write_str("]")
            }
            Self::Struct(data) => {
                f.write_str("{")?;
                write_list(f, data)?;
                f.write_str("}")
            }
            Self::Bytes(bytes) => {
                f.write_str("b\"")?;
                for &b in bytes {
                    if b.is_ascii_graphic() || b == b' ' {
                        write!(f, "{}", b as char)?;
                    } else {
                        write!(f, "\\x{b:02x}")?;
                    }
                }
                f.write_str("\"")
            }
            Self::Zero => f.write_str("zeroinit"),
            Self::Null => f.write_str("null"),
            Self::GlobalAddr(gv) => write!(f, "&{gv}"),
            Self::FuncAddr(func) => write!(f, "&{func}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_gv() {
        let mut store = GlobalVariableStore::default();
        let gv = store
            .make_gv(GlobalVariableData::new(
                String::from("foo"),
                Type::I32,
                Linkage::Public,
                true,
                Some(GvInitializer::make_imm(1618i32)),
            ))
            .unwrap();

        assert_eq!(
            store.gv_data(gv).to_string(),
            "global public const i32 %foo = 1618"
        );
        assert_eq!(store.gv_by_symbol("foo"), Some(gv));
    }

    #[test]
    fn display_gv_array_and_bytes() {
        let mut store = GlobalVariableStore::default();
        let const_arr = GvInitializer::make_array(vec![
            GvInitializer::make_imm(8i32),
            GvInitializer::make_imm(4i32),
            GvInitializer::make_imm(2i32),
        ]);
        let arr = store
            .make_gv(GlobalVariableData::constant(
                String::from("arr"),
                Type::make_array(Type::I32, 3),
                Linkage::Private,
                const_arr,
            ))
            .unwrap();
        let msg = store
            .make_gv(GlobalVariableData::constant(
                String::from("msg"),
                Type::make_array(Type::I8, 3),
                Linkage::Private,
                GvInitializer::make_cstr("hi"),
            ))
            .unwrap();

        assert_eq!(
            store.gv_data(arr).to_string(),
            "global private const [i32; 3] %arr = [8, 4, 2]"
        );
        assert_eq!(
            store.gv_data(msg).to_string(),
            "global private const [i8; 3] %msg = b\"hi\\x00\""
        );
    }

    #[test]
    fn duplicate_symbol_is_rejected() {
        let mut store = GlobalVariableStore::default();
        let data = GlobalVariableData::new("g".into(), Type::I8, Linkage::Private, false, None);
        let gv = store.make_gv(data.clone()).unwrap();
        assert_eq!(store.make_gv(data), Err(gv));
        assert_eq!(store.len(), 1);
    }
}
