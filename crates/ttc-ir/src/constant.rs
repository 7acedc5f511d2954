//! Immediate constants.

use crate::ty::{ScalarTy, Ty};
use serde::{Deserialize, Serialize};

/// A constant operand.
///
/// Constant vectors carry the shape/layout/padding literals consumed by
/// the `typeinfo` intrinsic, zero vectors seed tile accumulators, and
/// undef vectors seed the transpose output tiles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    /// An integer immediate.
    Int {
        /// The value, sign-extended.
        value: i64,
        /// The scalar type.
        ty: ScalarTy,
    },
    /// A floating-point immediate.
    Float {
        /// The value.
        value: f64,
        /// The scalar type.
        ty: ScalarTy,
    },
    /// A constant vector of integers.
    IntVector {
        /// The lane values.
        elems: Vec<i64>,
        /// The lane type.
        elem_ty: ScalarTy,
    },
    /// A constant vector of floats.
    FloatVector {
        /// The lane values.
        elems: Vec<f64>,
        /// The lane type.
        elem_ty: ScalarTy,
    },
    /// The all-zero value of a type (`zeroinitializer`).
    Zero(Ty),
    /// An undefined value.
    Undef(Ty),
}

impl Constant {
    /// An `i32` immediate.
    #[must_use]
    pub fn i32(value: i64) -> Self {
        Self::Int {
            value,
            ty: ScalarTy::I32,
        }
    }

    /// A constant `<n x i32>` vector.
    #[must_use]
    pub fn i32_vector(elems: impl IntoIterator<Item = u32>) -> Self {
        Self::IntVector {
            elems: elems.into_iter().map(i64::from).collect(),
            elem_ty: ScalarTy::I32,
        }
    }

    /// The zero scalar of `ty` (integer `0` or float `0.0`).
    #[must_use]
    pub fn zero_scalar(ty: ScalarTy) -> Self {
        if ty.is_float() {
            Self::Float { value: 0.0, ty }
        } else {
            Self::Int { value: 0, ty }
        }
    }

    /// Returns the type of this constant.
    #[must_use]
    pub fn ty(&self) -> Ty {
        match self {
            Self::Int { ty, .. } | Self::Float { ty, .. } => Ty::Scalar(*ty),
            Self::IntVector { elems, elem_ty } => Ty::Vector(*elem_ty, elems.len() as u32),
            Self::FloatVector { elems, elem_ty } => Ty::Vector(*elem_ty, elems.len() as u32),
            Self::Zero(ty) | Self::Undef(ty) => ty.clone(),
        }
    }

    /// Returns the lanes of a constant integer vector.
    ///
    /// `Zero` of vector type reads as all-zero lanes.
    #[must_use]
    pub fn as_int_lanes(&self) -> Option<Vec<i64>> {
        match self {
            Self::IntVector { elems, .. } => Some(elems.clone()),
            Self::Zero(Ty::Vector(s, n)) if s.is_int() => Some(vec![0; *n as usize]),
            _ => None,
        }
    }

    /// Returns the integer value of a scalar integer constant.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Returns true if this is the all-zero value of its type.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        match self {
            Self::Int { value, .. } => *value == 0,
            Self::Float { value, .. } => *value == 0.0,
            Self::IntVector { elems, .. } => elems.iter().all(|&v| v == 0),
            Self::FloatVector { elems, .. } => elems.iter().all(|&v| v == 0.0),
            Self::Zero(_) => true,
            Self::Undef(_) => false,
        }
    }
}
