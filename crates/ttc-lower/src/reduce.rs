//! Sliding-window reduction lowering.
//!
//! The loop nest runs batch dims (step 1), output rows and columns
//! (step 1), and the window rows and columns with tile steps. Two nested
//! scalar accumulator PHIs thread the partial result: the outer-window
//! PHI at the window-row header is seeded with the reduction identity;
//! the inner PHI at the window-column header consumes it. The body loads
//! a tile of the input window, collapses each row with the matching
//! `vector_reduce_*`, folds the row scalars into the accumulator, and
//! after both window loops exit the final value is stored to the output
//! cell (at the output-column latch).
//!
//! Identities: `add -> 0`, `mul -> 1`, `and -> all-ones`, `or -> 0`,
//! `xor -> 0`, `max -> MIN`, `min -> MAX`, with the floating variants
//! for float elements. A bitwise reduction over floats is rejected.

use crate::engine::inst_label;
use crate::nest::create_tiled_loops;
use crate::plan::ReducePlan;
use crate::tile::{compute_index, load_tile};
use crate::LowerError;
use ttc_intern::Symbol;
use ttc_ir::{
    BinOp, Builder, CmpOp, Constant, Function, Inst, InstId, ReduceKind, ScalarTy, TensorInst, Ty,
    Value, VecReduceOp,
};
use ttc_tensor::{TensorAnalysis, TensorType};

/// Resolved reduce knobs.
#[derive(Clone, Copy, Debug)]
pub struct ReduceKnobs {
    /// Window-row tile.
    pub tile_m: u32,
    /// Window-column tile.
    pub tile_n: u32,
}

/// Lowers one reduce intrinsic, returning the final flat load that
/// replaces its uses.
///
/// # Errors
///
/// Missing types/buffers or a bitwise reduction over floats.
pub fn lower_reduce(
    func: &mut Function,
    analysis: &mut TensorAnalysis,
    inst: InstId,
    knobs: ReduceKnobs,
) -> Result<Value, LowerError> {
    let label = inst_label(func, inst);
    let Inst::Tensor(TensorInst::Reduce {
        kind,
        window,
        strides,
        input,
    }) = func.insts[inst].kind.clone()
    else {
        unreachable!("lower_reduce on non-reduce");
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
        .expect("reduce produces a vector");
    if elem.is_float() && matches!(kind, ReduceKind::And | ReduceKind::Or | ReduceKind::Xor) {
        return Err(LowerError::BadReduceElem { inst: label });
    }

    let lanes = |v: &Value| -> Vec<u32> {
        v.as_const()
            .and_then(|c| c.as_int_lanes())
            .map(|l| l.into_iter().map(|x| x as u32).collect())
            .expect("analysis validated constant window/strides")
    };
    let win = lanes(&window);
    let str_ = lanes(&strides);
    let mut plan = ReducePlan::new(in_ty, out_ty.clone(), win, str_);

    let tm = crate::knobs::largest_divisor_le(plan.window[plan.window.len() - 2], knobs.tile_m);
    let tn = crate::knobs::largest_divisor_le(plan.window[plan.window.len() - 1], knobs.tile_n);
    let spec = plan.loop_spec(tm, tn);

    let start = func.insts[inst].block.expect("intrinsic is placed");
    let cont = func.split_block(inst, Symbol::intern("continue"))?;
    let nest = create_tiled_loops(func, start, cont, &spec)?;
    plan.nest = Some(nest);

    let buffer = |analysis: &TensorAnalysis, key: ttc_ir::ValueRef| {
        analysis
            .mem_ptr_of(key)
            .ok_or_else(|| LowerError::MissingBuffer {
                inst: label.clone(),
            })
    };
    let in_ptr = buffer(analysis, in_key)?;
    let out_ptr = buffer(analysis, ttc_ir::ValueRef::Inst(inst))?;

    let nest = plan.nest.as_ref().expect("nest set").clone();
    let n_levels = nest.levels.len();
    let win_col = &nest.levels[n_levels - 1];
    let win_row = &nest.levels[n_levels - 2];
    let out_col = &nest.levels[n_levels - 3];
    let out_row = &nest.levels[n_levels - 4];

    // Accumulators: identity -> outer PHI (window-row header) -> inner
    // PHI (window-column header) -> body update.
    let identity = identity_const(kind, elem);
    let outer_phi = {
        let mut b = Builder::at_end(func, win_row.header);
        b.phi(
            Ty::Scalar(elem),
            vec![(win_row.preheader, identity)],
            "acc.outer",
        )
    };
    let inner_phi = {
        let mut b = Builder::at_end(func, win_col.header);
        b.phi(
            Ty::Scalar(elem),
            vec![(win_col.preheader, Value::Inst(outer_phi))],
            "acc.inner",
        )
    };

    // Body: address the window tile at
    // (out_idx * stride + window_idx) and fold it into the accumulator.
    let updated = {
        let mut b = Builder::at_end(func, nest.inner_body);
        let d = plan.in_tensor.rank();
        let wd = plan.strides.len();
        let row = strided_index(
            &mut b,
            Value::Inst(out_row.iv),
            plan.strides[wd - 2],
            Value::Inst(win_row.iv),
        );
        let col = strided_index(
            &mut b,
            Value::Inst(out_col.iv),
            plan.strides[wd - 1],
            Value::Inst(win_col.iv),
        );
        let mut in_indices: Vec<Value> = nest.levels[..d - 2].iter().map(|l| Value::Inst(l.iv)).collect();
        in_indices.push(row);
        in_indices.push(col);

        let tile_ty = TensorType::row_major(smallvec::smallvec![plan.tile_rows, plan.tile_cols])
            .expect("tile dims are positive");
        let rows = load_tile(
            &mut b,
            Value::Inst(in_ptr),
            &plan.in_tensor,
            &tile_ty,
            elem,
            &in_indices,
        );

        let mut acc = Value::Inst(inner_phi);
        for row_vec in rows {
            let partial = b.vec_reduce(vec_reduce_op(kind, elem), row_vec, "window.reduce");
            acc = combine(&mut b, kind, elem, acc, partial);
        }
        acc
    };

    func.add_phi_incoming(inner_phi, win_col.latch, updated.clone());
    func.add_phi_incoming(outer_phi, win_row.latch, updated.clone());

    // Both window loops done: commit the cell at the output-column
    // latch.
    {
        let mut b = Builder::at_end(func, out_col.latch);
        let d = out_ty.rank();
        let mut out_indices: Vec<Value> =
            nest.levels[..d - 2].iter().map(|l| Value::Inst(l.iv)).collect();
        out_indices.push(Value::Inst(out_row.iv));
        out_indices.push(Value::Inst(out_col.iv));
        let offset = compute_index(&mut b, &out_ty, &out_indices, 0);
        let cell = b.gep(elem, Value::Inst(out_ptr), offset, "out.cell");
        b.store(updated, cell);
    }

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

/// `out_idx * stride + window_idx`, skipping the multiply for stride 1.
fn strided_index(b: &mut Builder<'_>, out_idx: Value, stride: u32, win_idx: Value) -> Value {
    let scaled = if stride == 1 {
        out_idx
    } else {
        b.binary(
            BinOp::Mul,
            out_idx,
            Value::const_i32(i64::from(stride)),
            "window.base",
        )
    };
    b.binary(BinOp::Add, scaled, win_idx, "window.idx")
}

/// The neutral element of `kind` over `elem`.
fn identity_const(kind: ReduceKind, elem: ScalarTy) -> Value {
    let int = |v: i64| {
        Value::Const(Constant::Int {
            value: v,
            ty: elem,
        })
    };
    let float = |v: f64| {
        Value::Const(Constant::Float {
            value: v,
            ty: elem,
        })
    };
    let is_fp = elem.is_float();
    match kind {
        ReduceKind::Add | ReduceKind::Or | ReduceKind::Xor => {
            if is_fp {
                float(0.0)
            } else {
                int(0)
            }
        }
        ReduceKind::Mul => {
            if is_fp {
                float(1.0)
            } else {
                int(1)
            }
        }
        ReduceKind::And => int(-1),
        ReduceKind::Max => {
            if is_fp {
                float(min_float(elem))
            } else {
                int(min_int(elem))
            }
        }
        ReduceKind::Min => {
            if is_fp {
                float(max_float(elem))
            } else {
                int(max_int(elem))
            }
        }
    }
}

fn min_int(elem: ScalarTy) -> i64 {
    match elem {
        ScalarTy::I8 => i64::from(i8::MIN),
        ScalarTy::I16 => i64::from(i16::MIN),
        ScalarTy::I32 => i64::from(i32::MIN),
        _ => i64::MIN,
    }
}

fn max_int(elem: ScalarTy) -> i64 {
    match elem {
        ScalarTy::I8 => i64::from(i8::MAX),
        ScalarTy::I16 => i64::from(i16::MAX),
        ScalarTy::I32 => i64::from(i32::MAX),
        _ => i64::MAX,
    }
}

fn min_float(elem: ScalarTy) -> f64 {
    match elem {
        ScalarTy::F64 => f64::MIN,
        _ => f64::from(f32::MIN),
    }
}

fn max_float(elem: ScalarTy) -> f64 {
    match elem {
        ScalarTy::F64 => f64::MAX,
        _ => f64::from(f32::MAX),
    }
}

/// The `vector_reduce_*` flavor for one tile row.
fn vec_reduce_op(kind: ReduceKind, elem: ScalarTy) -> VecReduceOp {
    let is_fp = elem.is_float();
    match kind {
        ReduceKind::Add => {
            if is_fp {
                VecReduceOp::FAdd
            } else {
                VecReduceOp::Add
            }
        }
        ReduceKind::Mul => {
            if is_fp {
                VecReduceOp::FMul
            } else {
                VecReduceOp::Mul
            }
        }
        ReduceKind::And => VecReduceOp::And,
        ReduceKind::Or => VecReduceOp::Or,
        ReduceKind::Xor => VecReduceOp::Xor,
        ReduceKind::Max => {
            if is_fp {
                VecReduceOp::FMax
            } else {
                VecReduceOp::SMax
            }
        }
        ReduceKind::Min => {
            if is_fp {
                VecReduceOp::FMin
            } else {
                VecReduceOp::SMin
            }
        }
    }
}

/// Scalar combine of the accumulator and one partial result.
fn combine(b: &mut Builder<'_>, kind: ReduceKind, elem: ScalarTy, acc: Value, x: Value) -> Value {
    match kind {
        ReduceKind::Add => b.binary(BinOp::add_for(elem), acc, x, "acc"),
        ReduceKind::Mul => b.binary(BinOp::mul_for(elem), acc, x, "acc"),
        ReduceKind::And => b.binary(BinOp::And, acc, x, "acc"),
        ReduceKind::Or => b.binary(BinOp::Or, acc, x, "acc"),
        ReduceKind::Xor => b.binary(BinOp::Xor, acc, x, "acc"),
        ReduceKind::Max => {
            let pred = if elem.is_float() { CmpOp::OGt } else { CmpOp::SGt };
            let cond = b.cmp(pred, acc.clone(), x.clone(), "acc.cmp");
            b.select(cond, acc, x, "acc")
        }
        ReduceKind::Min => {
            let pred = if elem.is_float() { CmpOp::OLt } else { CmpOp::SLt };
            let cond = b.cmp(pred, acc.clone(), x.clone(), "acc.cmp");
            b.select(cond, acc, x, "acc")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identities() {
        assert_eq!(
            identity_const(ReduceKind::Add, ScalarTy::I32),
            Value::Const(Constant::Int {
                value: 0,
                ty: ScalarTy::I32
            })
        );
        assert_eq!(
            identity_const(ReduceKind::Mul, ScalarTy::F32),
            Value::Const(Constant::Float {
                value: 1.0,
                ty: ScalarTy::F32
            })
        );
        assert_eq!(
            identity_const(ReduceKind::And, ScalarTy::I32),
            Value::Const(Constant::Int {
                value: -1,
                ty: ScalarTy::I32
            })
        );
        assert_eq!(
            identity_const(ReduceKind::Max, ScalarTy::F32),
            Value::Const(Constant::Float {
                value: f64::from(f32::MIN),
                ty: ScalarTy::F32
            })
        );
        assert_eq!(
            identity_const(ReduceKind::Min, ScalarTy::I32),
            Value::Const(Constant::Int {
                value: i64::from(i32::MAX),
                ty: ScalarTy::I32
            })
        );
    }

    #[test]
    fn test_float_reductions_pick_float_ops() {
        assert_eq!(
            vec_reduce_op(ReduceKind::Max, ScalarTy::F32),
            VecReduceOp::FMax
        );
        assert_eq!(
            vec_reduce_op(ReduceKind::Add, ScalarTy::I32),
            VecReduceOp::Add
        );
    }
}
