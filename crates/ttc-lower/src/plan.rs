//! Per-intrinsic tiling plans.
//!
//! Each lowered intrinsic carries a plan: the operand/output tensor
//! types, the tile types, the loop-nest record, and the index vectors
//! used to address the tensors from the induction variables. The
//! [`TilePlan`] trait exposes the accessors the generic tile store in
//! [`crate::tile`] needs; everything else is per-variant data.

use crate::nest::TiledLoopNest;
use crate::LowerError;
use ttc_ir::{BlockId, Builder, Constant, Function, InstId, ScalarTy, Ty, Value};
use ttc_tensor::TensorType;

/// Accessors shared by the plans whose kernels write whole tiles.
pub trait TilePlan {
    /// The output tensor type.
    fn output_tensor(&self) -> &TensorType;
    /// The output tile type.
    fn output_tile(&self) -> &TensorType;
    /// The number of output tile row vectors.
    fn num_out_tiles(&self) -> usize;
    /// The `i`-th output tile row vector.
    fn out_tile_vector(&self, i: usize) -> Value;
    /// The induction-variable indices addressing the output tensor.
    fn out_indices(&self) -> &[Value];
}

/// A 2-D tile type: `rows x cols` with the given storage order.
fn tile_type(rows: u32, cols: u32, col_major: bool) -> TensorType {
    let layout = if col_major {
        smallvec::smallvec![1, 0]
    } else {
        smallvec::smallvec![0, 1]
    };
    TensorType::new(
        smallvec::smallvec![rows, cols],
        layout,
        smallvec::smallvec![0, 0],
    )
    .expect("2-D tile type is always valid")
}

/// The matmul plan.
///
/// `L: [batches..., m, k] x R: [batches..., k, n] -> O: [batches..., m, n]`,
/// with `k` on either axis depending on the operand layouts.
#[derive(Debug)]
pub struct MatmulPlan {
    /// Left operand type.
    pub l_tensor: TensorType,
    /// Right operand type.
    pub r_tensor: TensorType,
    /// Output type (physical shape ordered by the requested layout).
    pub out_tensor: TensorType,

    /// The M extent.
    pub l_dim: u32,
    /// The N extent.
    pub r_dim: u32,
    /// The K extent.
    pub common_dim: u32,

    /// M tile.
    pub l_tile_dim: u32,
    /// N tile.
    pub r_tile_dim: u32,
    /// K tile.
    pub tile_common_dim: u32,

    /// Left tile type.
    pub l_tile: TensorType,
    /// Right tile type.
    pub r_tile: TensorType,
    /// Output tile type.
    pub out_tile: TensorType,

    /// Indices addressing the left tensor.
    pub l_indices: Vec<Value>,
    /// Indices addressing the right tensor.
    pub r_indices: Vec<Value>,
    /// Indices addressing the output tensor.
    pub out_indices: Vec<Value>,

    /// Loaded left tile rows.
    pub l_tile_vec: Vec<Value>,
    /// Loaded right tile rows.
    pub r_tile_vec: Vec<Value>,
    /// Accumulated output tile rows (PHIs, then kernel updates).
    pub out_tile_vec: Vec<Value>,
    /// The accumulator PHIs behind `out_tile_vec`.
    pub tile_phis: Vec<InstId>,

    /// The loop nest (batches, M, N, K).
    pub nest: Option<TiledLoopNest>,
}

impl MatmulPlan {
    /// Derives the dimensions and output type from the operand types and
    /// the requested output layout.
    ///
    /// # Errors
    ///
    /// Fails when the operands disagree on the common dimension.
    pub fn new(
        inst: &str,
        l_tensor: TensorType,
        r_tensor: TensorType,
        out_layout: &[u32],
    ) -> Result<Self, LowerError> {
        let (l_dim, common_dim) = if l_tensor.is_col_major() {
            (l_tensor.num_cols(), l_tensor.num_rows())
        } else {
            (l_tensor.num_rows(), l_tensor.num_cols())
        };
        let (r_dim, r_common) = if r_tensor.is_col_major() {
            (r_tensor.num_rows(), r_tensor.num_cols())
        } else {
            (r_tensor.num_cols(), r_tensor.num_rows())
        };
        if common_dim != r_common {
            return Err(LowerError::CommonDimMismatch {
                inst: inst.to_owned(),
                left: common_dim,
                right: r_common,
            });
        }

        // Leading (batch) dims come from the left operand; the last two
        // physical extents follow the requested output layout.
        let d = out_layout.len();
        let out_col_major =
            d >= 2 && out_layout[d - 1] == (d - 2) as u32 && out_layout[d - 2] == (d - 1) as u32;
        let mut shape: Vec<u32> = l_tensor.shape()[..l_tensor.rank() - 2].to_vec();
        if out_col_major {
            shape.push(r_dim);
            shape.push(l_dim);
        } else {
            shape.push(l_dim);
            shape.push(r_dim);
        }
        let padding = vec![0; d];
        let out_tensor = TensorType::new(shape, out_layout.to_vec(), padding).map_err(|source| {
            LowerError::BadTensorType {
                inst: inst.to_owned(),
                source,
            }
        })?;

        Ok(Self {
            l_tensor,
            r_tensor,
            out_tensor,
            l_dim,
            r_dim,
            common_dim,
            l_tile_dim: 0,
            r_tile_dim: 0,
            tile_common_dim: 0,
            l_tile: tile_type(1, 1, false),
            r_tile: tile_type(1, 1, false),
            out_tile: tile_type(1, 1, false),
            l_indices: Vec::new(),
            r_indices: Vec::new(),
            out_indices: Vec::new(),
            l_tile_vec: Vec::new(),
            r_tile_vec: Vec::new(),
            out_tile_vec: Vec::new(),
            tile_phis: Vec::new(),
            nest: None,
        })
    }

    /// The loop spec: batch dims (step 1), then M, N, K with tile steps.
    #[must_use]
    pub fn loop_spec(&self, tm: u32, tn: u32, tk: u32) -> crate::nest::LoopSpec {
        let mut spec: crate::nest::LoopSpec = self.out_tensor.shape()
            [..self.out_tensor.rank() - 2]
            .iter()
            .map(|&d| (d, 1, 0))
            .collect();
        spec.push((self.l_dim, tm, 0));
        spec.push((self.r_dim, tn, 0));
        spec.push((self.common_dim, tk, 0));
        spec
    }

    /// Fixes the tile types once the tile sizes are known.
    pub fn set_tiles(&mut self, tm: u32, tn: u32, tk: u32) {
        self.l_tile_dim = tm;
        self.r_tile_dim = tn;
        self.tile_common_dim = tk;

        self.l_tile = if self.l_tensor.is_col_major() {
            tile_type(tk, tm, true)
        } else {
            tile_type(tm, tk, false)
        };
        self.r_tile = if self.r_tensor.is_col_major() {
            tile_type(tn, tk, true)
        } else {
            tile_type(tk, tn, false)
        };
        self.out_tile = if self.out_tensor.is_col_major() {
            tile_type(tn, tm, true)
        } else {
            tile_type(tm, tn, false)
        };
    }

    /// Wires the per-tensor index vectors from the nest's induction
    /// variables: `(m, k)` or `(k, m)` into L by layout, `(k, n)` or
    /// `(n, k)` into R, `(m, n)` into the output.
    pub fn set_indices(&mut self, nest: &TiledLoopNest) {
        let idx = nest.indices();
        let n = idx.len();
        let (m_iv, n_iv, k_iv) = (&idx[n - 3], &idx[n - 2], &idx[n - 1]);

        for iv in &idx[..n - 3] {
            self.l_indices.push(iv.clone());
            self.r_indices.push(iv.clone());
            self.out_indices.push(iv.clone());
        }

        if self.l_tensor.is_col_major() {
            self.l_indices.push(k_iv.clone());
            self.l_indices.push(m_iv.clone());
        } else {
            self.l_indices.push(m_iv.clone());
            self.l_indices.push(k_iv.clone());
        }

        if self.r_tensor.is_col_major() {
            self.r_indices.push(n_iv.clone());
            self.r_indices.push(k_iv.clone());
        } else {
            self.r_indices.push(k_iv.clone());
            self.r_indices.push(n_iv.clone());
        }

        self.out_indices.push(m_iv.clone());
        self.out_indices.push(n_iv.clone());
    }

    /// Inserts the tile-accumulator PHIs at the innermost (K) header,
    /// zero-seeded from the K preheader.
    pub fn insert_tile_phis(&mut self, func: &mut Function, elem: ScalarTy) {
        let nest = self.nest.as_ref().expect("nest created before PHIs");
        let (tile_rows, tile_cols) = if self.out_tensor.is_col_major() {
            (self.r_tile_dim, self.l_tile_dim)
        } else {
            (self.l_tile_dim, self.r_tile_dim)
        };
        let tile_ty = Ty::Vector(elem, tile_cols);
        let inner = nest.inner().clone();

        let mut b = Builder::at_end(func, inner.header);
        for i in 0..tile_rows {
            let phi = b.phi(
                tile_ty.clone(),
                vec![(
                    inner.preheader,
                    Value::Const(Constant::Zero(tile_ty.clone())),
                )],
                &format!("result.vec.{i}"),
            );
            self.out_tile_vec.push(Value::Inst(phi));
            self.tile_phis.push(phi);
        }
    }

    /// Adds the updated tile rows as the latch incomings of the PHIs.
    pub fn complete_tile_phis(&mut self, func: &mut Function) {
        let latch = self.nest.as_ref().expect("nest exists").inner().latch;
        for (i, &phi) in self.tile_phis.iter().enumerate() {
            func.add_phi_incoming(phi, latch, self.out_tile_vec[i].clone());
        }
    }

    /// The block where completed tiles are stored: the N-loop latch.
    #[must_use]
    pub fn store_block(&self) -> BlockId {
        self.nest.as_ref().expect("nest exists").store_block()
    }
}

impl TilePlan for MatmulPlan {
    fn output_tensor(&self) -> &TensorType {
        &self.out_tensor
    }

    fn output_tile(&self) -> &TensorType {
        &self.out_tile
    }

    fn num_out_tiles(&self) -> usize {
        self.out_tile_vec.len()
    }

    fn out_tile_vector(&self, i: usize) -> Value {
        self.out_tile_vec[i].clone()
    }

    fn out_indices(&self) -> &[Value] {
        &self.out_indices
    }
}

/// The elementwise plan: one collapsed loop over the whole
/// tensor, a PHI-threaded working vector.
#[derive(Debug)]
pub struct ElementwisePlan {
    /// The input/output tensor type.
    pub tensor: TensorType,
    /// Elements processed per iteration.
    pub tile_size: u32,
    /// The PHI threading the working vector through the loop.
    pub tensor_phi: Option<InstId>,
    /// The collapsed loop index.
    pub indices: Vec<Value>,
    /// The loop nest (one collapsed level).
    pub nest: Option<TiledLoopNest>,
}

impl ElementwisePlan {
    /// A plan over `tensor` with the given tile size.
    #[must_use]
    pub fn new(tensor: TensorType, tile_size: u32) -> Self {
        Self {
            tensor,
            tile_size,
            tensor_phi: None,
            indices: Vec::new(),
            nest: None,
        }
    }

    /// All dimensions collapse into one loop.
    #[must_use]
    pub fn num_collapsed(&self) -> usize {
        self.tensor.rank() - 1
    }

    /// The single-level loop spec over the flat element count.
    #[must_use]
    pub fn loop_spec(&self) -> crate::nest::LoopSpec {
        vec![(self.tensor.num_elements(), self.tile_size, 0)]
    }

    /// Inserts the working-vector PHI seeded with the input tensor.
    pub fn insert_tensor_phi(&mut self, func: &mut Function, input: Value) {
        let nest = self.nest.as_ref().expect("nest created before PHI");
        let level = &nest.levels[0];
        let ty = func.value_ty(&input);
        let (header, preheader) = (level.header, level.preheader);
        let mut b = Builder::at_end(func, header);
        let phi = b.phi(ty, vec![(preheader, input)], "work.vec");
        self.tensor_phi = Some(phi);
    }

    /// Adds the updated vector as the latch incoming of the PHI.
    pub fn complete_tensor_phi(&mut self, func: &mut Function, updated: Value) {
        let latch = self.nest.as_ref().expect("nest exists").inner().latch;
        let phi = self.tensor_phi.expect("phi inserted");
        func.add_phi_incoming(phi, latch, updated);
    }
}

/// The transpose plan.
#[derive(Debug)]
pub struct TransposePlan {
    /// Input tensor type.
    pub in_tensor: TensorType,
    /// Output tensor type.
    pub out_tensor: TensorType,
    /// Input tile type (`tm x tn`).
    pub in_tile: TensorType,
    /// Output tile type (`tn x tm`).
    pub out_tile: TensorType,
    /// Input row tile size.
    pub row_tile: u32,
    /// Input column tile size.
    pub col_tile: u32,
    /// Indices addressing the input tensor.
    pub in_indices: Vec<Value>,
    /// Indices addressing the output tensor (last two swapped).
    pub out_indices: Vec<Value>,
    /// Loaded input tile rows.
    pub in_tile_vec: Vec<Value>,
    /// Shuffled output tile rows (undef-seeded, no PHIs needed).
    pub out_tile_vec: Vec<Value>,
    /// The loop nest (batches, rows, cols).
    pub nest: Option<TiledLoopNest>,
}

impl TransposePlan {
    /// Validates the permutation pair: only row<->column swaps of the
    /// last two axes are supported.
    ///
    /// # Errors
    ///
    /// [`LowerError::InvalidTranspose`] otherwise.
    pub fn new(
        inst: &str,
        in_tensor: TensorType,
        out_tensor: TensorType,
    ) -> Result<Self, LowerError> {
        let valid = (in_tensor.is_row_major() && out_tensor.is_col_major())
            || (in_tensor.is_col_major() && out_tensor.is_row_major());
        if !valid {
            return Err(LowerError::InvalidTranspose {
                inst: inst.to_owned(),
                input: in_tensor,
                output: out_tensor,
            });
        }
        Ok(Self {
            in_tensor,
            out_tensor,
            in_tile: tile_type(1, 1, false),
            out_tile: tile_type(1, 1, false),
            row_tile: 0,
            col_tile: 0,
            in_indices: Vec::new(),
            out_indices: Vec::new(),
            in_tile_vec: Vec::new(),
            out_tile_vec: Vec::new(),
            nest: None,
        })
    }

    /// The loop spec: batch dims (step 1), then rows and columns with
    /// tile steps.
    #[must_use]
    pub fn loop_spec(&self, tm: u32, tn: u32) -> crate::nest::LoopSpec {
        let d = self.in_tensor.rank();
        let mut spec: crate::nest::LoopSpec = self.in_tensor.shape()[..d - 2]
            .iter()
            .map(|&dim| (dim, 1, 0))
            .collect();
        spec.push((self.in_tensor.dim(d - 2), tm, 0));
        spec.push((self.in_tensor.dim(d - 1), tn, 0));
        spec
    }

    /// Fixes the tile types once the tile sizes are known.
    pub fn set_tiles(&mut self, tm: u32, tn: u32) {
        self.row_tile = tm;
        self.col_tile = tn;
        self.in_tile = tile_type(tm, tn, self.in_tensor.is_col_major());
        self.out_tile = tile_type(tn, tm, self.out_tensor.is_col_major());
    }

    /// Input indices are the induction variables as-is; output indices
    /// swap the last two.
    pub fn set_indices(&mut self, nest: &TiledLoopNest) {
        let idx = nest.indices();
        let n = idx.len();
        self.in_indices = idx.clone();
        self.out_indices = idx[..n - 2].to_vec();
        self.out_indices.push(idx[n - 1].clone());
        self.out_indices.push(idx[n - 2].clone());
    }

    /// Seeds the output tile rows with undef; the kernel inserts every
    /// lane, so no PHIs are required.
    pub fn init_output_tiles(&mut self, elem: ScalarTy) {
        let ty = Ty::Vector(elem, self.row_tile);
        self.out_tile_vec = (0..self.col_tile)
            .map(|_| Value::Const(Constant::Undef(ty.clone())))
            .collect();
    }
}

impl TilePlan for TransposePlan {
    fn output_tensor(&self) -> &TensorType {
        &self.out_tensor
    }

    fn output_tile(&self) -> &TensorType {
        &self.out_tile
    }

    fn num_out_tiles(&self) -> usize {
        self.out_tile_vec.len()
    }

    fn out_tile_vector(&self, i: usize) -> Value {
        self.out_tile_vec[i].clone()
    }

    fn out_indices(&self) -> &[Value] {
        &self.out_indices
    }
}

/// The reduction plan.
#[derive(Debug)]
pub struct ReducePlan {
    /// Input tensor type.
    pub in_tensor: TensorType,
    /// Output tensor type.
    pub out_tensor: TensorType,
    /// Window extents (last two used).
    pub window: Vec<u32>,
    /// Window strides (last two used).
    pub strides: Vec<u32>,
    /// Window-row tile step.
    pub tile_rows: u32,
    /// Window-column tile step.
    pub tile_cols: u32,
    /// The loop nest (batches, out rows, out cols, window rows, window
    /// cols).
    pub nest: Option<TiledLoopNest>,
}

impl ReducePlan {
    /// A plan over `in_tensor` reducing to `out_tensor`.
    #[must_use]
    pub fn new(
        in_tensor: TensorType,
        out_tensor: TensorType,
        window: Vec<u32>,
        strides: Vec<u32>,
    ) -> Self {
        Self {
            in_tensor,
            out_tensor,
            window,
            strides,
            tile_rows: 0,
            tile_cols: 0,
            nest: None,
        }
    }

    /// The loop spec: batches (step 1), output rows and columns
    /// (step 1), window rows and columns with tile steps.
    #[must_use]
    pub fn loop_spec(&mut self, tm: u32, tn: u32) -> crate::nest::LoopSpec {
        let d = self.out_tensor.rank();
        let wd = self.window.len();
        let (win_r, win_c) = (self.window[wd - 2], self.window[wd - 1]);
        self.tile_rows = tm.min(win_r);
        self.tile_cols = tn.min(win_c);

        let mut spec: crate::nest::LoopSpec = self.out_tensor.shape()[..d - 2]
            .iter()
            .map(|&dim| (dim, 1, 0))
            .collect();
        spec.push((self.out_tensor.dim(d - 2), 1, 0));
        spec.push((self.out_tensor.dim(d - 1), 1, 0));
        spec.push((win_r, self.tile_rows, 0));
        spec.push((win_c, self.tile_cols, 0));
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rm(shape: &[u32]) -> TensorType {
        TensorType::row_major(shape.to_vec()).unwrap()
    }

    #[test]
    fn test_matmul_plan_dims_row_major() {
        let plan = MatmulPlan::new("mm", rm(&[1, 1, 4, 6]), rm(&[1, 1, 6, 8]), &[0, 1, 2, 3])
            .unwrap();
        assert_eq!(plan.l_dim, 4);
        assert_eq!(plan.common_dim, 6);
        assert_eq!(plan.r_dim, 8);
        assert_eq!(plan.out_tensor.shape(), &[1, 1, 4, 8]);
    }

    #[test]
    fn test_matmul_plan_col_major_lhs() {
        // L stored column-major as 6x4 carries a logical 4x6 matrix.
        let l = TensorType::new([1, 1, 6, 4], [0, 1, 3, 2], [0, 0, 0, 0]).unwrap();
        let plan = MatmulPlan::new("mm", l, rm(&[1, 1, 6, 8]), &[0, 1, 2, 3]).unwrap();
        assert_eq!(plan.l_dim, 4);
        assert_eq!(plan.common_dim, 6);
        assert_eq!(plan.out_tensor.shape(), &[1, 1, 4, 8]);
    }

    #[test]
    fn test_matmul_plan_rejects_common_mismatch() {
        let r = MatmulPlan::new("mm", rm(&[2, 3]), rm(&[4, 2]), &[0, 1]);
        assert!(matches!(r, Err(LowerError::CommonDimMismatch { .. })));
    }

    #[test]
    fn test_matmul_tiles_follow_layouts() {
        let mut plan =
            MatmulPlan::new("mm", rm(&[1, 1, 4, 6]), rm(&[1, 1, 6, 8]), &[0, 1, 2, 3]).unwrap();
        plan.set_tiles(2, 4, 3);
        assert_eq!(plan.l_tile.shape(), &[2, 3]);
        assert!(plan.l_tile.is_row_major());
        assert_eq!(plan.r_tile.shape(), &[3, 4]);
        assert_eq!(plan.out_tile.shape(), &[2, 4]);
    }

    #[test]
    fn test_matmul_loop_spec_orders_batches_first() {
        let plan =
            MatmulPlan::new("mm", rm(&[2, 3, 4, 6]), rm(&[2, 3, 6, 8]), &[0, 1, 2, 3]).unwrap();
        let spec = plan.loop_spec(2, 2, 2);
        assert_eq!(spec.len(), 5);
        assert_eq!(spec[0], (2, 1, 0));
        assert_eq!(spec[1], (3, 1, 0));
        assert_eq!(spec[2], (4, 2, 0));
        assert_eq!(spec[3], (8, 2, 0));
        assert_eq!(spec[4], (6, 2, 0));
    }

    #[test]
    fn test_transpose_plan_rejects_same_layout() {
        let r = TransposePlan::new("tr", rm(&[1, 1, 4, 8]), rm(&[1, 1, 8, 4]));
        assert!(matches!(r, Err(LowerError::InvalidTranspose { .. })));
    }

    #[test]
    fn test_transpose_plan_accepts_layout_swap() {
        let out = rm(&[1, 1, 4, 8]).transposed().unwrap();
        let plan = TransposePlan::new("tr", rm(&[1, 1, 4, 8]), out).unwrap();
        let spec = plan.loop_spec(2, 2);
        assert_eq!(spec.len(), 4);
        assert_eq!(spec[2], (4, 2, 0));
        assert_eq!(spec[3], (8, 2, 0));
    }

    #[test]
    fn test_reduce_loop_spec() {
        let mut plan = ReducePlan::new(
            rm(&[1, 1, 4, 4]),
            rm(&[1, 1, 2, 2]),
            vec![1, 1, 2, 2],
            vec![1, 1, 2, 2],
        );
        let spec = plan.loop_spec(4, 4);
        // batches, out rows/cols step 1, window loops tile-stepped
        // (clamped to the window).
        assert_eq!(spec.len(), 6);
        assert_eq!(spec[2], (2, 1, 0));
        assert_eq!(spec[3], (2, 1, 0));
        assert_eq!(spec[4], (2, 2, 0));
        assert_eq!(spec[5], (2, 2, 0));
    }
}
