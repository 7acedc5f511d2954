//! # TTC SSA IR
//!
//! This crate defines the SSA intermediate representation the tensor
//! analysis and lowering operate on. Tensor values are carried as
//! fixed-length vector values; tensor operations appear as opaque
//! intrinsic instructions until the lowering rewrites them into explicit
//! tiled loop nests of scalar/vector instructions.
//!
//! ## Pipeline Position
//!
//! ```text
//! Frontend (external)
//!     |
//!     v
//! [SSA IR + tensor intrinsics]  <- this crate
//!     |
//!     | ttc-tensor: property analysis, buffer allocation
//!     | ttc-lower:  tiled loop-nest construction
//!     v
//! [SSA IR, intrinsic-free]
//!     |
//!     v
//! Backend code generator (external)
//! ```
//!
//! ## Main Types
//!
//! - [`Module`], [`Function`], [`Block`]: the container hierarchy
//! - [`Inst`], [`Terminator`], [`Value`], [`Constant`]: instructions and
//!   operands
//! - [`TensorInst`], [`TileInst`]: the tensor intrinsic surface
//! - [`Builder`]: cursor-style instruction insertion
//! - [`DomTree`], [`LoopInfo`]: CFG analyses kept current across loop-nest
//!   surgery
//! - [`verify::verify_function`]: the SSA well-formedness checker
//!
//! All IR types derive serde so modules can be stored and reloaded as
//! JSON; interned names re-intern on load.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod constant;
pub mod dom;
pub mod function;
pub mod inst;
pub mod loops;
pub mod print;
pub mod ty;
pub mod verify;

pub use builder::{Builder, InsertPt};
pub use constant::Constant;
pub use dom::DomTree;
pub use function::{Block, Function, Module, Param, Terminator};
pub use inst::{
    BinOp, CastKind, CmpOp, ElemOp, Inst, InstData, MathFn, ReduceKind, TensorInst, TileInst,
    VecReduceOp,
};
pub use loops::{LoopInfo, LoopRecord};
pub use ty::{ScalarTy, Ty};
pub use verify::{verify_function, verify_module, VerifyError};

use serde::{Deserialize, Serialize};
use ttc_index::newtype_index;

newtype_index! {
    /// Identifies a function within a [`Module`].
    pub struct FuncId;
}

newtype_index! {
    /// Identifies a basic block within a [`Function`].
    pub struct BlockId;
}

newtype_index! {
    /// Identifies an instruction within a [`Function`].
    pub struct InstId;
}

/// An SSA operand: an instruction result, a function argument, or a
/// constant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// The result of an instruction.
    Inst(InstId),
    /// The n-th function parameter.
    Arg(u32),
    /// An immediate constant.
    Const(Constant),
}

impl Value {
    /// Returns the hashable identity of this value, if it has one.
    ///
    /// Constants are structural and have no identity.
    #[must_use]
    pub fn as_ref(&self) -> Option<ValueRef> {
        match self {
            Self::Inst(id) => Some(ValueRef::Inst(*id)),
            Self::Arg(n) => Some(ValueRef::Arg(*n)),
            Self::Const(_) => None,
        }
    }

    /// Returns the constant payload, if this is a constant.
    #[must_use]
    pub fn as_const(&self) -> Option<&Constant> {
        match self {
            Self::Const(c) => Some(c),
            _ => None,
        }
    }

    /// An `i32` immediate.
    #[must_use]
    pub fn const_i32(v: i64) -> Self {
        Self::Const(Constant::Int {
            value: v,
            ty: ScalarTy::I32,
        })
    }
}

impl From<InstId> for Value {
    fn from(id: InstId) -> Self {
        Self::Inst(id)
    }
}

impl From<ValueRef> for Value {
    fn from(r: ValueRef) -> Self {
        match r {
            ValueRef::Inst(id) => Self::Inst(id),
            ValueRef::Arg(n) => Self::Arg(n),
        }
    }
}

/// The identity of a non-constant SSA value, usable as a side-table key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValueRef {
    /// An instruction result.
    Inst(InstId),
    /// A function parameter.
    Arg(u32),
}

impl From<InstId> for ValueRef {
    fn from(id: InstId) -> Self {
        Self::Inst(id)
    }
}

/// Errors raised by IR construction helpers.
#[derive(Clone, Debug, thiserror::Error)]
pub enum IrError {
    /// An instruction was addressed that is not placed in any block.
    #[error("instruction {0:?} is not placed in a block")]
    Unplaced(InstId),

    /// A block was expected to end in an unconditional branch.
    #[error("block {0:?} does not end in an unconditional branch")]
    NotABranch(BlockId),
}
