//! Index math and tile movement.
//!
//! Tensors live in flat heap buffers; a tile is addressed by linearizing
//! the loop indices against the tensor's physical shape, then loading or
//! storing one row vector per physical tile row at the tensor's row
//! stride.

use crate::plan::TilePlan;
use ttc_ir::{BinOp, Builder, ScalarTy, Ty, Value};
use ttc_tensor::TensorType;

/// Linearizes `indices` (outermost dimension first) against `tensor`'s
/// physical shape. With `collapsed` trailing dimensions folded into the
/// last index, fewer indices than dimensions are expected; a single
/// index is returned as-is.
pub fn compute_index(
    b: &mut Builder<'_>,
    tensor: &TensorType,
    indices: &[Value],
    collapsed: usize,
) -> Value {
    let nd = tensor.rank();
    let n = indices.len();
    debug_assert_eq!(
        n,
        nd - collapsed,
        "index count must match uncollapsed dimensions"
    );
    if n == 1 {
        return indices[0].clone();
    }

    // Elements spanned by one step of the second-innermost index.
    let mut prod_dims = tensor.dim(nd - 1);
    for i in 0..collapsed {
        prod_dims *= tensor.dim(nd - i - 2);
    }

    let mut coeff = prod_dims;
    let prod = b.binary(
        BinOp::Mul,
        indices[n - 2].clone(),
        Value::const_i32(i64::from(coeff)),
        "input.stride",
    );
    let mut offset = b.binary(BinOp::Add, prod, indices[n - 1].clone(), "input.offset");

    for i in (0..n.saturating_sub(2)).rev() {
        coeff *= tensor.dim(i + 1);
        let prod = b.binary(
            BinOp::Mul,
            indices[i].clone(),
            Value::const_i32(i64::from(coeff)),
            "input.stride",
        );
        offset = b.binary(BinOp::Add, prod, offset, "input.offset");
    }
    offset
}

/// A pointer to row `vec_idx` of a tile at `base`, cast to a vector
/// pointer of `n_elems` lanes. Row 0 skips the GEP.
pub fn compute_vector_addr(
    b: &mut Builder<'_>,
    base: Value,
    vec_idx: u32,
    stride: u32,
    n_elems: u32,
    elem: ScalarTy,
) -> Value {
    let row_start = if vec_idx == 0 {
        base
    } else {
        let offset = Value::const_i32(i64::from(vec_idx) * i64::from(stride));
        b.gep(elem, base, offset, "vec.gep")
    };
    b.ptr_cast(row_start, Ty::ptr_to(Ty::Vector(elem, n_elems)), "vec.cast")
}

/// Loads the rows of an `in_tile`-shaped tile of `in_tensor` starting at
/// `indices`, one vector per physical tile row.
pub fn load_tile(
    b: &mut Builder<'_>,
    tensor_ptr: Value,
    in_tensor: &TensorType,
    in_tile: &TensorType,
    elem: ScalarTy,
    indices: &[Value],
) -> Vec<Value> {
    let offset = compute_index(b, in_tensor, indices, 0);
    let tile_start = b.gep(elem, tensor_ptr, offset, "tile.start");

    let stride = in_tensor.stride();
    let row_len = in_tile.stride();
    (0..in_tile.num_rows())
        .map(|i| {
            let addr = compute_vector_addr(b, tile_start.clone(), i, stride, row_len, elem);
            b.load(addr, "row.load")
        })
        .collect()
}

/// Stores a plan's completed output tile rows at the plan's output
/// indices.
pub fn store_tile<P: TilePlan>(b: &mut Builder<'_>, plan: &P, tensor_ptr: Value, elem: ScalarTy) {
    let offset = compute_index(b, plan.output_tensor(), plan.out_indices(), 0);
    let tile_start = b.gep(elem, tensor_ptr, offset, "tile.start");

    let stride = plan.output_tensor().stride();
    let row_len = plan.output_tile().stride();
    for i in 0..plan.num_out_tiles() {
        let addr = compute_vector_addr(b, tile_start.clone(), i as u32, stride, row_len, elem);
        b.store(plan.out_tile_vector(i), addr);
    }
}

/// `base + lane` as a constant-folded index chain; lane 0 returns the
/// base unchanged.
pub fn offset_by(b: &mut Builder<'_>, base: &Value, lane: u32) -> Value {
    if lane == 0 {
        base.clone()
    } else {
        b.binary(
            BinOp::Add,
            base.clone(),
            Value::const_i32(i64::from(lane)),
            "elem.offset",
        )
    }
}
