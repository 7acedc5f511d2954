//! Types in the IR.
//!
//! The type system is small: scalars, fixed-length vectors of scalars,
//! typed pointers, and void for instructions that produce no value.
//! Tensors have no type of their own; a tensor is a vector value whose
//! shape/layout/padding live in the tensor analysis side tables.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Scalar element types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScalarTy {
    /// 1-bit integer (booleans, compare results).
    I1,
    /// 8-bit signed integer.
    I8,
    /// 16-bit signed integer.
    I16,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
    /// 16-bit IEEE float.
    F16,
    /// Brain float.
    BF16,
    /// 32-bit IEEE float.
    F32,
    /// 64-bit IEEE float.
    F64,
}

impl ScalarTy {
    /// Returns the width in bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::I1 => 1,
            Self::I8 => 8,
            Self::I16 | Self::F16 | Self::BF16 => 16,
            Self::I32 | Self::F32 => 32,
            Self::I64 | Self::F64 => 64,
        }
    }

    /// Returns the storage size in bytes.
    #[must_use]
    pub const fn bytes(self) -> u32 {
        match self {
            Self::I1 | Self::I8 => 1,
            Self::I16 | Self::F16 | Self::BF16 => 2,
            Self::I32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Returns true for floating-point types.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F16 | Self::BF16 | Self::F32 | Self::F64)
    }

    /// Returns true for integer types.
    #[must_use]
    pub const fn is_int(self) -> bool {
        !self.is_float()
    }
}

impl fmt::Display for ScalarTy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::I1 => "i1",
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F16 => "f16",
            Self::BF16 => "bf16",
            Self::F32 => "f32",
            Self::F64 => "f64",
        };
        f.write_str(s)
    }
}

/// A first-class IR type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ty {
    /// No value (stores, memcpy, tile stores).
    Void,
    /// A scalar.
    Scalar(ScalarTy),
    /// A fixed-length vector of scalars.
    Vector(ScalarTy, u32),
    /// A typed pointer.
    Ptr(Box<Ty>),
}

impl Ty {
    /// Shorthand for a pointer to `pointee`.
    #[must_use]
    pub fn ptr_to(pointee: Ty) -> Self {
        Self::Ptr(Box::new(pointee))
    }

    /// Returns true for void.
    #[must_use]
    pub fn is_void(&self) -> bool {
        matches!(self, Self::Void)
    }

    /// Returns true for vector types.
    #[must_use]
    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Vector(_, _))
    }

    /// Returns true for pointer types.
    #[must_use]
    pub fn is_ptr(&self) -> bool {
        matches!(self, Self::Ptr(_))
    }

    /// Returns the scalar element type of a scalar or vector.
    #[must_use]
    pub fn elem_ty(&self) -> Option<ScalarTy> {
        match self {
            Self::Scalar(s) | Self::Vector(s, _) => Some(*s),
            _ => None,
        }
    }

    /// Returns the lane count of a vector type.
    #[must_use]
    pub fn vec_len(&self) -> Option<u32> {
        match self {
            Self::Vector(_, n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the pointee of a pointer type.
    #[must_use]
    pub fn pointee(&self) -> Option<&Ty> {
        match self {
            Self::Ptr(inner) => Some(inner),
            _ => None,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Void => f.write_str("void"),
            Self::Scalar(s) => write!(f, "{s}"),
            Self::Vector(s, n) => write!(f, "<{n} x {s}>"),
            Self::Ptr(inner) => write!(f, "{inner}*"),
        }
    }
}
