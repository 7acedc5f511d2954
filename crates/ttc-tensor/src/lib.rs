//! # TTC tensor model
//!
//! Tensors in the IR are plain fixed-length vector values; what makes
//! them tensors is the metadata this crate tracks:
//!
//! - [`TensorType`]: the immutable (shape, layout, padding) triple bound
//!   to a tensor value, with the derived layout queries the lowering
//!   keys its kernels off;
//! - [`analysis::TensorAnalysis`]: the flow-sensitive fixed point that
//!   assigns every tensor-typed SSA value its `TensorType`, driven by
//!   `typeinfo` annotations and the well-typed semantics of the tensor
//!   intrinsics;
//! - [`alloc`]: the buffer allocator that backs every tensor value with
//!   a heap buffer and seeds it from its source where possible.
//!
//! ## Layout convention
//!
//! `shape[i]` is the extent of **physical** axis `i`; `layout[i]` names
//! the logical dimension carried by physical axis `i` and is a
//! permutation of `0..rank`. Row-major means the last two layout entries
//! are `d-2, d-1`; column-major means they are swapped. `padding[i]` is
//! trailing padding in elements along axis `i` (this rewriter only emits
//! zero padding but accepts arbitrary values on input).

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod alloc;
pub mod analysis;

pub use alloc::allocate_buffers;
pub use analysis::{tensor_operand, AnalysisError, TensorAnalysis};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// The per-axis metadata vector; tensors are rank 4 or less in practice.
pub type DimVec = SmallVec<[u32; 4]>;

/// Errors constructing or combining tensor types.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TensorError {
    /// Shape, layout, and padding must have equal rank.
    #[error("rank mismatch: shape rank {shape}, layout rank {layout}, padding rank {padding}")]
    RankMismatch {
        /// Shape rank.
        shape: usize,
        /// Layout rank.
        layout: usize,
        /// Padding rank.
        padding: usize,
    },

    /// The layout vector must be a permutation of `0..rank`.
    #[error("layout {0:?} is not a permutation")]
    NotAPermutation(Vec<u32>),

    /// Every extent must be positive.
    #[error("shape {0:?} has a zero extent")]
    ZeroExtent(Vec<u32>),

    /// The operation needs at least two dimensions.
    #[error("rank {0} tensor where rank >= 2 is required")]
    RankTooSmall(usize),
}

/// An immutable tensor type: shape, layout, and padding of equal rank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorType {
    shape: DimVec,
    layout: DimVec,
    padding: DimVec,
}

impl TensorType {
    /// Creates a tensor type, validating the invariants: equal ranks,
    /// positive extents, layout a permutation.
    ///
    /// # Errors
    ///
    /// Returns the violated invariant.
    pub fn new(
        shape: impl Into<DimVec>,
        layout: impl Into<DimVec>,
        padding: impl Into<DimVec>,
    ) -> Result<Self, TensorError> {
        let shape = shape.into();
        let layout = layout.into();
        let padding = padding.into();

        if shape.len() != layout.len() || shape.len() != padding.len() {
            return Err(TensorError::RankMismatch {
                shape: shape.len(),
                layout: layout.len(),
                padding: padding.len(),
            });
        }
        if shape.iter().any(|&d| d == 0) {
            return Err(TensorError::ZeroExtent(shape.to_vec()));
        }
        let mut seen = vec![false; layout.len()];
        for &l in &layout {
            if (l as usize) >= layout.len() || seen[l as usize] {
                return Err(TensorError::NotAPermutation(layout.to_vec()));
            }
            seen[l as usize] = true;
        }

        Ok(Self {
            shape,
            layout,
            padding,
        })
    }

    /// A row-major type with zero padding.
    ///
    /// # Errors
    ///
    /// Propagates the shape validation.
    pub fn row_major(shape: impl Into<DimVec>) -> Result<Self, TensorError> {
        let shape = shape.into();
        let rank = shape.len();
        let layout: DimVec = (0..rank as u32).collect();
        let padding: DimVec = smallvec::smallvec![0; rank];
        Self::new(shape, layout, padding)
    }

    /// The rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// The shape vector (physical extents).
    #[must_use]
    pub fn shape(&self) -> &[u32] {
        &self.shape
    }

    /// The layout permutation.
    #[must_use]
    pub fn layout(&self) -> &[u32] {
        &self.layout
    }

    /// The per-axis trailing padding.
    #[must_use]
    pub fn padding(&self) -> &[u32] {
        &self.padding
    }

    /// The extent of physical axis `i`.
    #[must_use]
    pub fn dim(&self, i: usize) -> u32 {
        self.shape[i]
    }

    /// The total element count (product of extents).
    #[must_use]
    pub fn num_elements(&self) -> u32 {
        self.shape.iter().product()
    }

    /// True if the last two physical axes carry logical dims `d-2, d-1`.
    #[must_use]
    pub fn is_row_major(&self) -> bool {
        let d = self.rank();
        d >= 2
            && self.layout[d - 1] == (d - 1) as u32
            && self.layout[d - 2] == (d - 2) as u32
    }

    /// True if the last two physical axes carry logical dims `d-1, d-2`.
    #[must_use]
    pub fn is_col_major(&self) -> bool {
        let d = self.rank();
        d >= 2
            && self.layout[d - 1] == (d - 2) as u32
            && self.layout[d - 2] == (d - 1) as u32
    }

    /// The second-to-last physical extent (matrix rows as stored).
    #[must_use]
    pub fn num_rows(&self) -> u32 {
        self.shape[self.rank() - 2]
    }

    /// The last physical extent (matrix columns as stored).
    #[must_use]
    pub fn num_cols(&self) -> u32 {
        self.shape[self.rank() - 1]
    }

    /// The distance in elements between consecutive stored rows.
    #[must_use]
    pub fn stride(&self) -> u32 {
        self.num_cols()
    }

    /// The type with the last two axes of shape, layout, and padding
    /// swapped.
    ///
    /// # Errors
    ///
    /// Fails for rank < 2.
    pub fn transposed(&self) -> Result<Self, TensorError> {
        let d = self.rank();
        if d < 2 {
            return Err(TensorError::RankTooSmall(d));
        }
        let mut shape = self.shape.clone();
        let mut layout = self.layout.clone();
        let mut padding = self.padding.clone();
        shape.swap(d - 2, d - 1);
        layout.swap(d - 2, d - 1);
        padding.swap(d - 2, d - 1);
        Ok(Self {
            shape,
            layout,
            padding,
        })
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "shape {:?} layout {:?} padding {:?}",
            &self.shape[..],
            &self.layout[..],
            &self.padding[..]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_major_queries() {
        let t = TensorType::row_major(smallvec::smallvec![1, 1, 2, 3]).unwrap();
        assert!(t.is_row_major());
        assert!(!t.is_col_major());
        assert_eq!(t.num_rows(), 2);
        assert_eq!(t.num_cols(), 3);
        assert_eq!(t.stride(), 3);
        assert_eq!(t.num_elements(), 6);
    }

    #[test]
    fn test_col_major_layout() {
        let t = TensorType::new([1, 1, 3, 2], [0, 1, 3, 2], [0, 0, 0, 0]).unwrap();
        assert!(t.is_col_major());
        assert!(!t.is_row_major());
    }

    #[test]
    fn test_transposed_swaps_last_two() {
        let t = TensorType::row_major(smallvec::smallvec![1, 1, 4, 8]).unwrap();
        let tt = t.transposed().unwrap();
        assert_eq!(tt.shape(), &[1, 1, 8, 4]);
        assert_eq!(tt.layout(), &[0, 1, 3, 2]);
        assert!(tt.is_col_major());
    }

    #[test]
    fn test_rejects_rank_mismatch() {
        assert!(matches!(
            TensorType::new(
                smallvec::smallvec![2, 2],
                smallvec::smallvec![0, 1, 2],
                smallvec::smallvec![0, 0]
            ),
            Err(TensorError::RankMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_permutation() {
        assert!(matches!(
            TensorType::new(
                smallvec::smallvec![2, 2],
                smallvec::smallvec![0, 0],
                smallvec::smallvec![0, 0]
            ),
            Err(TensorError::NotAPermutation(_))
        ));
        assert!(matches!(
            TensorType::new(
                smallvec::smallvec![2, 2],
                smallvec::smallvec![1, 2],
                smallvec::smallvec![0, 0]
            ),
            Err(TensorError::NotAPermutation(_))
        ));
    }

    #[test]
    fn test_rejects_zero_extent() {
        assert!(matches!(
            TensorType::new(
                smallvec::smallvec![2, 0],
                smallvec::smallvec![0, 1],
                smallvec::smallvec![0, 0]
            ),
            Err(TensorError::ZeroExtent(_))
        ));
    }

    #[test]
    fn test_structural_equality() {
        let a = TensorType::row_major(smallvec::smallvec![2, 2]).unwrap();
        let b = TensorType::new(
            smallvec::smallvec![2, 2],
            smallvec::smallvec![0, 1],
            smallvec::smallvec![0, 0]
        )
        .unwrap();
        assert_eq!(a, b);
    }
}
