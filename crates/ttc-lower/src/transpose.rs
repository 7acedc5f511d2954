//! Transpose lowering.
//!
//! A loop nest over batch dims (step 1) and the last two axes with
//! `TileSize_M x TileSize_N` steps. The body loads an `M x N` input
//! tile, redistributes its lanes into an `N x M` output tile
//! (undef-seeded, fully overwritten, so no PHIs), and stores it at the
//! transposed position. Only row<->column swaps of the last two axes are
//! supported; the plan constructor rejects anything else.

use crate::engine::{force_unroll, inst_label};
use crate::nest::create_tiled_loops;
use crate::plan::TransposePlan;
use crate::tile::{load_tile, store_tile};
use crate::LowerError;
use ttc_intern::Symbol;
use ttc_ir::{Builder, Function, Inst, InstId, TensorInst, Ty, Value};
use ttc_tensor::TensorAnalysis;

/// Resolved transpose knobs.
#[derive(Clone, Copy, Debug)]
pub struct TransposeKnobs {
    /// Row tile.
    pub tile_m: u32,
    /// Column tile.
    pub tile_n: u32,
    /// Innermost-loop unroll request (0 = none).
    pub unroll: u32,
}

/// Lowers one transpose intrinsic, returning the final flat load that
/// replaces its uses.
///
/// # Errors
///
/// Missing types/buffers or an unsupported permutation.
pub fn lower_transpose(
    func: &mut Function,
    analysis: &mut TensorAnalysis,
    inst: InstId,
    knobs: TransposeKnobs,
) -> Result<Value, LowerError> {
    let label = inst_label(func, inst);
    let Inst::Tensor(TensorInst::Transpose { input }) = func.insts[inst].kind.clone() else {
        unreachable!("lower_transpose on non-transpose");
    };
    let missing = || LowerError::MissingType {
        inst: label.clone(),
    };
    let in_key = crate::engine::operand_key(func, analysis, &input).ok_or_else(missing)?;
    let in_ty = analysis.ty_of(in_key).ok_or_else(missing)?.clone();
    let out_ty = analysis
        .ty_of(ttc_ir::ValueRef::Inst(inst))
        .ok_or_else(missing)?
        .clone();
    let elem = func.insts[inst]
        .ty
        .elem_ty()
        .expect("transpose produces a vector");

    let mut plan = TransposePlan::new(&label, in_ty, out_ty.clone())?;
    let d = plan.in_tensor.rank();
    let tm = crate::knobs::largest_divisor_le(plan.in_tensor.dim(d - 2), knobs.tile_m);
    let tn = crate::knobs::largest_divisor_le(plan.in_tensor.dim(d - 1), knobs.tile_n);
    plan.set_tiles(tm, tn);

    let start = func.insts[inst].block.expect("intrinsic is placed");
    let cont = func.split_block(inst, Symbol::intern("continue"))?;
    let nest = create_tiled_loops(func, start, cont, &plan.loop_spec(tm, tn))?;
    plan.set_indices(&nest);
    plan.nest = Some(nest);
    plan.init_output_tiles(elem);

    let buffer = |analysis: &TensorAnalysis, key: ttc_ir::ValueRef| {
        analysis
            .mem_ptr_of(key)
            .ok_or_else(|| LowerError::MissingBuffer {
                inst: label.clone(),
            })
    };
    let in_ptr = buffer(analysis, in_key)?;
    let out_ptr = buffer(analysis, ttc_ir::ValueRef::Inst(inst))?;

    // Load, shuffle lanes, and store all happen in the innermost body;
    // every output lane is written, so the tile needs no accumulators.
    let inner_body = plan.nest.as_ref().expect("nest set").inner_body;
    {
        let mut b = Builder::at_end(func, inner_body);
        plan.in_tile_vec = load_tile(
            &mut b,
            Value::Inst(in_ptr),
            &plan.in_tensor,
            &plan.in_tile,
            elem,
            &plan.in_indices,
        );
        generate_transpose_kernel(&mut b, &mut plan);
        store_tile(&mut b, &plan, Value::Inst(out_ptr), elem);
    }

    force_unroll(func, inner_body, knobs.unroll);

    let n = analysis
        .alloc_size_of(ttc_ir::ValueRef::Inst(inst))
        .unwrap_or_else(|| out_ty.num_elements());
    let mut b = Builder::before(func, inst);
    let cast = b.ptr_cast(
        Value::Inst(out_ptr),
        Ty::ptr_to(Ty::Vector(elem, n)),
        "malloc.cast",
    );
    Ok(b.load(cast, "final.load"))
}

/// Per-lane redistribution: input lane `(i, j)` moves to output lane
/// `(j, i)`.
fn generate_transpose_kernel(b: &mut Builder<'_>, plan: &mut TransposePlan) {
    let rows = plan.row_tile;
    let cols = plan.col_tile;
    let mut out = plan.out_tile_vec.clone();
    for i in 0..rows {
        for j in 0..cols {
            let v = b.extract_element(
                plan.in_tile_vec[i as usize].clone(),
                Value::const_i32(i64::from(j)),
                "transpose.extract",
            );
            out[j as usize] = b.insert_element(
                out[j as usize].clone(),
                v,
                Value::const_i32(i64::from(i)),
                "transpose.insert",
            );
        }
    }
    plan.out_tile_vec = out;
}
