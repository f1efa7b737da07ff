//! This module contains debloat IR value definition.
use std::fmt;

use cranelift_entity::entity_impl;

use super::Type;
use crate::{inst::InstId, module::FuncRef, GlobalVariable};

/// An opaque reference to [`Value`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Copy, Hash)]
pub struct ValueId(pub u32);
entity_impl!(ValueId, "v");

/// An value data definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// The value is defined by an instruction.
    Inst { inst: InstId, ty: Type },

    /// The value is a function argument.
    Arg { ty: Type, idx: usize },

    /// The value is immediate value.
    Immediate { imm: Immediate, ty: Type },

    /// The value is the address of a global variable.
    Global { gv: GlobalVariable, ty: Type },

    /// The value is the address of a function.
    Func { func: FuncRef, ty: Type },

    /// The null pointer of `ty`.
    Null { ty: Type },

    Undef { ty: Type },
}

impl Value {
    pub fn ty(&self) -> &Type {
        match self {
            Self::Inst { ty, .. }
            | Self::Arg { ty, .. }
            | Self::Immediate { ty, .. }
            | Self::Global { ty, .. }
            | Self::Func { ty, .. }
            | Self::Null { ty }
            | Self::Undef { ty } => ty,
        }
    }

    /// Returns `true` if the value is a link-time constant.
    pub fn is_constant(&self) -> bool {
        matches!(
            self,
            Self::Immediate { .. } | Self::Global { .. } | Self::Func { .. } | Self::Null { .. }
        )
    }
}

/// Integer immediates. Every variant holds the value in its own width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Immediate {
    I1(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

impl Immediate {
    pub fn ty(&self) -> Type {
        match self {
            Self::I1(..) => Type::I1,
            Self::I8(..) => Type::I8,
            Self::I16(..) => Type::I16,
            Self::I32(..) => Type::I32,
            Self::I64(..) => Type::I64,
        }
    }

    /// Builds an immediate of `ty` from raw bits, truncating to the width of `ty`.
    /// Returns `None` for non-integral types.
    pub fn from_bits(bits: u64, ty: &Type) -> Option<Self> {
        let imm = match ty {
            Type::I1 => Self::I1(bits & 1 != 0),
            Type::I8 => Self::I8(bits as i8),
            Type::I16 => Self::I16(bits as i16),
            Type::I32 => Self::I32(bits as i32),
            Type::I64 => Self::I64(bits as i64),
            _ => return None,
        };
        Some(imm)
    }

    /// Returns the zero-extended bits of the immediate.
    pub fn as_u64(self) -> u64 {
        match self {
            Self::I1(v) => v as u64,
            Self::I8(v) => v as u8 as u64,
            Self::I16(v) => v as u16 as u64,
            Self::I32(v) => v as u32 as u64,
            Self::I64(v) => v as u64,
        }
    }

    /// Returns the sign-extended value of the immediate.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::I1(v) => -(v as i64),
            Self::I8(v) => v as i64,
            Self::I16(v) => v as i64,
            Self::I32(v) => v as i64,
            Self::I64(v) => v,
        }
    }

    pub fn is_zero(self) -> bool {
        self.as_u64() == 0
    }

    pub fn is_all_one(self) -> bool {
        self.as_u64() == self.ty().mask()
    }
}

impl fmt::Display for Immediate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::I1(v) => write!(f, "{}", *v as u8),
            Self::I8(v) => write!(f, "{}", v),
            Self::I16(v) => write!(f, "{}", v),
            Self::I32(v) => write!(f, "{}", v),
            Self::I64(v) => write!(f, "{}", v),
        }
    }
}

impl From<bool> for Immediate {
    fn from(imm: bool) -> Self {
        Self::I1(imm)
    }
}

macro_rules! impl_imm_from {
    ($arg_ty:ty, $imm_ty:ty, $variant:path) => {
        impl From<$arg_ty> for Immediate {
            fn from(imm: $arg_ty) -> Self {
                $variant(imm as $imm_ty)
            }
        }
    };
}

impl_imm_from!(i8, i8, Immediate::I8);
impl_imm_from!(u8, i8, Immediate::I8);
impl_imm_from!(i16, i16, Immediate::I16);
impl_imm_from!(u16, i16, Immediate::I16);
impl_imm_from!(i32, i32, Immediate::I32);
impl_imm_from!(u32, i32, Immediate::I32);
impl_imm_from!(i64, i64, Immediate::I64);
impl_imm_from!(u64, i64, Immediate::I64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_round_trip_truncates() {
        let imm = Immediate::from_bits(0x1ff, &Type::I8).unwrap();
        assert_eq!(imm, Immediate::I8(-1));
        assert_eq!(imm.as_u64(), 0xff);
        assert_eq!(imm.as_i64(), -1);
        assert!(imm.is_all_one());
        assert!(Immediate::from_bits(1, &Type::make_ptr(Type::I8)).is_none());
    }

    #[test]
    fn i1_extension() {
        assert_eq!(Immediate::I1(true).as_u64(), 1);
        assert_eq!(Immediate::I1(true).as_i64(), -1);
        assert_eq!(Immediate::I1(false).to_string(), "0");
    }
}
