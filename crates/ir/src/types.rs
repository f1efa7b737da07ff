//! This module contains debloat IR types definitions.

use std::fmt;

/// Debloat IR types definition.
///
/// Aggregates are laid out packed: a struct occupies exactly the sum of its
/// fields and an array `len` consecutive elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    I1,
    I8,
    I16,
    I32,
    I64,
    Ptr(Box<Type>),
    Array { elem_ty: Box<Type>, len: usize },
    Struct(Vec<Type>),
    /// Opaque function type, only used as a pointee.
    Func,
    Void,
}

impl Type {
    pub fn make_ptr(pointee: Type) -> Self {
        Self::Ptr(pointee.into())
    }

    pub fn make_array(elem_ty: Type, len: usize) -> Self {
        Self::Array {
            elem_ty: elem_ty.into(),
            len,
        }
    }

    pub fn make_struct(fields: &[Type]) -> Self {
        Self::Struct(fields.to_vec())
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, Self::I1 | Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    pub fn is_pointer(&self) -> bool {
        matches!(self, Self::Ptr(..))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, Self::Array { .. } | Self::Struct(..))
    }

    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    pub fn pointee(&self) -> Option<&Type> {
        match self {
            Self::Ptr(pointee) => Some(pointee),
            _ => None,
        }
    }

    /// Returns the bit width of a scalar type. Pointers are 64 bits wide.
    pub fn bits(&self) -> Option<u32> {
        match self {
            Self::I1 => Some(1),
            Self::I8 => Some(8),
            Self::I16 => Some(16),
            Self::I32 => Some(32),
            Self::I64 | Self::Ptr(..) => Some(64),
            _ => None,
        }
    }

    /// Returns the mask selecting the significant bits of a scalar.
    pub fn mask(&self) -> u64 {
        match self.bits() {
            Some(64) | None => u64::MAX,
            Some(bits) => (1u64 << bits) - 1,
        }
    }

    /// Returns the number of bytes the type occupies in memory.
    pub fn size_of(&self) -> u64 {
        match self {
            Self::I1 | Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
            Self::I64 | Self::Ptr(..) => 8,
            Self::Array { elem_ty, len } => elem_ty.size_of() * *len as u64,
            Self::Struct(fields) => fields.iter().map(Type::size_of).sum(),
            Self::Func | Self::Void => 0,
        }
    }

    /// Returns the byte offset of the `idx`-th field of a struct.
    pub fn field_offset(&self, idx: usize) -> Option<u64> {
        match self {
            Self::Struct(fields) if idx < fields.len() => {
                Some(fields[..idx].iter().map(Type::size_of).sum())
            }
            _ => None,
        }
    }

    /// Returns the type reached by indexing into an aggregate once.
    pub fn index_ty(&self, idx: Option<u64>) -> Option<&Type> {
        match self {
            Self::Array { elem_ty, .. } => Some(elem_ty),
            Self::Struct(fields) => fields.get(idx? as usize),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::I1 => f.write_str("i1"),
            Self::I8 => f.write_str("i8"),
            Self::I16 => f.write_str("i16"),
            Self::I32 => f.write_str("i32"),
            Self::I64 => f.write_str("i64"),
            Self::Ptr(pointee) => write!(f, "*{pointee}"),
            Self::Array { elem_ty, len } => write!(f, "[{elem_ty}; {len}]"),
            Self::Struct(fields) => {
                f.write_str("{")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{field}")?;
                }
                f.write_str("}")
            }
            Self::Func => f.write_str("func"),
            Self::Void => f.write_str("void"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_sizes() {
        let s = Type::make_struct(&[Type::I8, Type::I32, Type::make_ptr(Type::I8)]);
        assert_eq!(s.size_of(), 13);
        assert_eq!(s.field_offset(0), Some(0));
        assert_eq!(s.field_offset(1), Some(1));
        assert_eq!(s.field_offset(2), Some(5));
        assert_eq!(s.field_offset(3), None);

        let arr = Type::make_array(s, 3);
        assert_eq!(arr.size_of(), 39);
        assert_eq!(Type::Func.size_of(), 0);
    }

    #[test]
    fn display() {
        let ty = Type::make_ptr(Type::make_array(Type::make_struct(&[Type::I1, Type::I64]), 4));
        assert_eq!(ty.to_string(), "*[{i1, i64}; 4]");
    }

    #[test]
    fn masks() {
        assert_eq!(Type::I1.mask(), 1);
        assert_eq!(Type::I16.mask(), 0xffff);
        assert_eq!(Type::I64.mask(), u64::MAX);
    }
}
