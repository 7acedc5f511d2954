//! The 2-D tile-register matmul path.
//!
//! Instead of row-vector loads and an unrolled scalar/vector kernel,
//! this mode emits explicit `tensor_load` / `tensor_mma` /
//! `tensor_store` intrinsics over fixed 2-D register tiles (default
//! 2x2). The block computed by one (M, N) iteration is covered by a grid
//! of register tiles; each grid cell accumulates through its own tile
//! PHI, and the K loop advances in register-width steps. Tile values are
//! registered in the tensor type map so the usual type-propagation
//! invariants hold for them as well.
//!
//! Only row-major operands and outputs take this path; the block dims
//! must divide into the register dims exactly.

use crate::plan::MatmulPlan;
use crate::tile::compute_index;
use crate::LowerError;
use ttc_ir::{
    BinOp, Builder, Constant, Function, InstId, ScalarTy, TileInst, Ty, Value, ValueRef,
};
use ttc_tensor::{TensorAnalysis, TensorType};

/// Emits the tile-register kernel for `plan`. The accumulator PHIs,
/// loads, MMAs, and stores replace the classic kernel entirely.
///
/// # Errors
///
/// [`LowerError::TileRegMismatch`] when the block dims are not covered
/// exactly by `reg_rows x reg_cols` registers.
#[allow(clippy::too_many_arguments)]
pub fn lower_matmul_tiles(
    func: &mut Function,
    analysis: &mut TensorAnalysis,
    plan: &mut MatmulPlan,
    label: &str,
    elem: ScalarTy,
    l_ptr: InstId,
    r_ptr: InstId,
    out_ptr: InstId,
    reg_rows: u32,
    reg_cols: u32,
) -> Result<(), LowerError> {
    let (bm, bn, bk) = (plan.l_tile_dim, plan.r_tile_dim, plan.tile_common_dim);
    let row_major = plan.l_tensor.is_row_major()
        && plan.r_tensor.is_row_major()
        && plan.out_tensor.is_row_major();
    if !row_major || bm % reg_rows != 0 || bn % reg_cols != 0 || bk % reg_cols != 0 {
        return Err(LowerError::TileRegMismatch {
            inst: label.to_owned(),
            block_rows: bm,
            block_cols: bn,
            reg_rows,
            reg_cols,
        });
    }

    let nest = plan.nest.as_ref().expect("nest created").clone();
    let inner = nest.inner().clone();
    let tile_ty = Ty::Vector(elem, reg_rows * reg_cols);
    let reg_tensor_ty =
        TensorType::row_major(smallvec::smallvec![reg_rows, reg_cols]).expect("register dims are positive");

    // One accumulator PHI per register tile of the (M, N) block.
    let grid_rows = bm / reg_rows;
    let grid_cols = bn / reg_cols;
    let mut acc_phis = Vec::with_capacity((grid_rows * grid_cols) as usize);
    {
        let mut b = Builder::at_end(func, inner.header);
        for gi in 0..grid_rows {
            for gj in 0..grid_cols {
                let phi = b.phi(
                    tile_ty.clone(),
                    vec![(
                        inner.preheader,
                        Value::Const(Constant::Zero(tile_ty.clone())),
                    )],
                    &format!("acc.tile.{gi}.{gj}"),
                );
                acc_phis.push(phi);
            }
        }
    }
    for &phi in &acc_phis {
        analysis.set_ty(ValueRef::Inst(phi), reg_tensor_ty.clone());
    }

    // Body: per register tile, walk K in register-width steps of
    // tensor_load / tensor_load / tensor_mma.
    let l_stride = plan.l_tensor.stride();
    let r_stride = plan.r_tensor.stride();
    let mut updated = Vec::with_capacity(acc_phis.len());
    {
        let mut b = Builder::at_end(func, nest.inner_body);
        let l_base = compute_index(&mut b, &plan.l_tensor, &plan.l_indices, 0);
        let r_base = compute_index(&mut b, &plan.r_tensor, &plan.r_indices, 0);

        for gi in 0..grid_rows {
            for gj in 0..grid_cols {
                let mut acc = Value::Inst(acc_phis[(gi * grid_cols + gj) as usize]);
                for kk in (0..bk).step_by(reg_cols as usize) {
                    let l_off = b.binary(
                        BinOp::Add,
                        l_base.clone(),
                        Value::const_i32(i64::from(gi * reg_rows * l_stride + kk)),
                        "ltile.off",
                    );
                    let l_addr = b.gep(elem, Value::Inst(l_ptr), l_off, "ltile.ptr");
                    let a = b.tile(
                        TileInst::Load {
                            ptr: l_addr,
                            rows: reg_rows,
                            cols: reg_cols,
                            stride: Value::const_i32(i64::from(l_stride)),
                        },
                        tile_ty.clone(),
                        "ltile",
                    );

                    let r_off = b.binary(
                        BinOp::Add,
                        r_base.clone(),
                        Value::const_i32(i64::from(kk * r_stride + gj * reg_cols)),
                        "rtile.off",
                    );
                    let r_addr = b.gep(elem, Value::Inst(r_ptr), r_off, "rtile.ptr");
                    let rt = b.tile(
                        TileInst::Load {
                            ptr: r_addr,
                            rows: reg_cols,
                            cols: reg_cols,
                            stride: Value::const_i32(i64::from(r_stride)),
                        },
                        tile_ty.clone(),
                        "rtile",
                    );

                    acc = b.tile(
                        TileInst::Mma {
                            a,
                            b: rt,
                            acc,
                        },
                        tile_ty.clone(),
                        "mma",
                    );
                    if let Value::Inst(id) = &acc {
                        analysis.set_ty(ValueRef::Inst(*id), reg_tensor_ty.clone());
                    }
                }
                updated.push(acc);
            }
        }
    }

    // Complete the PHIs and commit the register tiles at the N-loop
    // latch.
    for (phi, val) in acc_phis.iter().zip(updated.iter()) {
        func.add_phi_incoming(*phi, inner.latch, val.clone());
    }

    let out_stride = plan.out_tensor.stride();
    {
        let store_block = nest.store_block();
        let mut b = Builder::at_end(func, store_block);
        let out_base = compute_index(&mut b, &plan.out_tensor, &plan.out_indices, 0);
        for gi in 0..grid_rows {
            for gj in 0..grid_cols {
                let off = b.binary(
                    BinOp::Add,
                    out_base.clone(),
                    Value::const_i32(i64::from(gi * reg_rows * out_stride + gj * reg_cols)),
                    "otile.off",
                );
                let addr = b.gep(elem, Value::Inst(out_ptr), off, "otile.ptr");
                b.emit(
                    ttc_ir::Inst::Tile(TileInst::Store {
                        tile: updated[(gi * grid_cols + gj) as usize].clone(),
                        ptr: addr,
                        rows: reg_rows,
                        cols: reg_cols,
                        stride: Value::const_i32(i64::from(out_stride)),
                    }),
                    Ty::Void,
                    None,
                );
            }
        }
    }

    Ok(())
}
