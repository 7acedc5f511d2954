//! # TTC tensor intrinsic lowering
//!
//! This crate rewrites tensor intrinsics into explicit tiled loop nests
//! of scalar/vector instructions. Each intrinsic follows one template:
//!
//! 1. compute its tiling parameters (bounds, steps, start indices);
//! 2. split the block at the intrinsic and splice in a loop nest
//!    ([`nest`]);
//! 3. insert accumulator PHIs at the innermost header with
//!    neutral-element incomings;
//! 4. emit tile loads, the compute kernel, and tile stores at the
//!    pre-last latch;
//! 5. complete the PHIs, attach the requested unroll pragma, and replace
//!    the intrinsic's uses with one flat load of its output buffer.
//!
//! ## Module map
//!
//! - [`nest`]: the tiled loop-nest builder (headers, latches, induction
//!   PHIs)
//! - [`plan`]: per-intrinsic tiling records and the [`plan::TilePlan`]
//!   trait consumed by the generic tile movers
//! - [`tile`]: linearized index math, tile loads, tile stores
//! - [`matmul`], [`elementwise`], [`transpose`], [`reduce`]: the kernels
//! - [`tilereg`]: the optional 2-D tile-register matmul path
//! - [`knobs`]: per-instruction tuning parameters (JSON read/print)
//! - [`engine`]: intrinsic collection, dispatch, and cleanup

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod elementwise;
pub mod engine;
pub mod knobs;
pub mod matmul;
pub mod nest;
pub mod plan;
pub mod reduce;
pub mod tile;
pub mod tilereg;
pub mod transpose;

pub use engine::{lower_function, LowerConfig};
pub use knobs::{KnobError, KnobSet};
pub use nest::{LoopLevel, TiledLoopNest};

use ttc_tensor::TensorType;

/// Fatal lowering failures.
#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    /// A tensor value reached lowering without a resolved type.
    #[error("{inst}: tensor value has no resolved type")]
    MissingType {
        /// The offending instruction.
        inst: String,
    },

    /// A tensor value reached lowering without a backing buffer.
    #[error("{inst}: tensor value has no backing buffer")]
    MissingBuffer {
        /// The offending instruction.
        inst: String,
    },

    /// A transpose between layouts that is not a row/column swap.
    #[error("{inst}: unsupported transpose permutation ({input} -> {output})")]
    InvalidTranspose {
        /// The offending instruction.
        inst: String,
        /// Input type.
        input: TensorType,
        /// Output type.
        output: TensorType,
    },

    /// A bitwise reduction over floating-point elements.
    #[error("{inst}: bitwise reduction over floating-point elements")]
    BadReduceElem {
        /// The offending instruction.
        inst: String,
    },

    /// Matmul operands whose common dimension disagrees.
    #[error("{inst}: matmul common dimension mismatch ({left} vs {right})")]
    CommonDimMismatch {
        /// The offending instruction.
        inst: String,
        /// From the left operand.
        left: u32,
        /// From the right operand.
        right: u32,
    },

    /// Tile-register dims that do not divide the block dims.
    #[error(
        "{inst}: block {block_rows}x{block_cols} not divisible by tile registers {reg_rows}x{reg_cols}"
    )]
    TileRegMismatch {
        /// The offending instruction.
        inst: String,
        /// Block rows.
        block_rows: u32,
        /// Block columns.
        block_cols: u32,
        /// Register rows.
        reg_rows: u32,
        /// Register columns.
        reg_cols: u32,
    },

    /// A malformed tensor type surfaced during lowering.
    #[error("{inst}: {source}")]
    BadTensorType {
        /// The offending instruction.
        inst: String,
        /// The violation.
        source: ttc_tensor::TensorError,
    },

    /// IR surgery failed.
    #[error(transparent)]
    Ir(#[from] ttc_ir::IrError),
}
