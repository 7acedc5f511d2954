//! Elementwise and broadcast lowering.
//!
//! Elementwise operations run a single collapsed loop of
//! `product(shape)` elements with a tile-sized step. The body extracts
//! `TileSize` elements from the input value, applies the scalar
//! operator, and inserts the results into a PHI-threaded working vector.
//! On exit the final working vector is stored to the output buffer and
//! one flat load replaces the intrinsic.
//!
//! Float-only operators (the `exp`/`log` family, `tanh`, `sigmoid`)
//! convert integer elements with `sitofp` before evaluating and convert
//! the result back. `relu` stays in the element domain via
//! compare-and-select (`icmp sge` for integers, `fcmp uge` for floats so
//! NaN passes through).
//!
//! Broadcast needs no loop at all: a constant scalar folds to a constant
//! splat vector; a non-constant scalar becomes an insert + splat
//! shuffle. Either way the result is stored to the output buffer so
//! downstream tile loads observe it.

use crate::engine::inst_label;
use crate::nest::create_tiled_loops;
use crate::plan::ElementwisePlan;
use crate::tile::offset_by;
use crate::LowerError;
use ttc_intern::Symbol;
use ttc_ir::{
    BinOp, Builder, CmpOp, Constant, ElemOp, Function, Inst, InstId, MathFn, ScalarTy, TensorInst,
    Ty, Value,
};
use ttc_tensor::{tensor_operand, TensorAnalysis};

/// Lowers one elementwise intrinsic, returning the final flat load that
/// replaces its uses.
///
/// # Errors
///
/// Missing types or buffers.
pub fn lower_elementwise(
    func: &mut Function,
    analysis: &mut TensorAnalysis,
    inst: InstId,
    op: ElemOp,
    tile_size: u32,
) -> Result<Value, LowerError> {
    let label = inst_label(func, inst);
    let Inst::Tensor(TensorInst::Elementwise { input, .. }) = func.insts[inst].kind.clone() else {
        unreachable!("lower_elementwise on non-elementwise");
    };
    let input = tensor_operand(func, &input);

    let tensor = analysis
        .ty_of(ttc_ir::ValueRef::Inst(inst))
        .ok_or_else(|| LowerError::MissingType {
            inst: label.clone(),
        })?
        .clone();
    let elem = func.insts[inst]
        .ty
        .elem_ty()
        .expect("elementwise produces a vector");
    let total = tensor.num_elements();
    let tile_size = crate::knobs::largest_divisor_le(total, tile_size);

    let mut plan = ElementwisePlan::new(tensor, tile_size);

    let start = func.insts[inst].block.expect("intrinsic is placed");
    let cont = func.split_block(inst, Symbol::intern("continue"))?;
    let nest = create_tiled_loops(func, start, cont, &plan.loop_spec())?;
    plan.indices = nest.indices();
    plan.nest = Some(nest);

    plan.insert_tensor_phi(func, input.clone());

    // The kernel: extract, transform, insert, tile_size times.
    let inner_body = plan.nest.as_ref().expect("nest set").inner_body;
    let updated = {
        let mut b = Builder::at_end(func, inner_body);
        let base = plan.indices[0].clone();
        let mut updated = Value::Inst(plan.tensor_phi.expect("phi inserted"));
        for i in 0..plan.tile_size {
            let offset = offset_by(&mut b, &base, i);
            let x = b.extract_element(input.clone(), offset.clone(), "extract.elem");
            let y = scalar_kernel(&mut b, op, x, elem);
            updated = b.insert_element(updated, y, offset, "insert.elem");
        }
        updated
    };
    plan.complete_tensor_phi(func, updated.clone());

    // On exit, commit the working vector and reload it flat.
    let out_ptr = analysis
        .mem_ptr_of(ttc_ir::ValueRef::Inst(inst))
        .ok_or_else(|| LowerError::MissingBuffer {
            inst: label.clone(),
        })?;
    let mut b = Builder::before(func, inst);
    let vec_ptr = b.ptr_cast(
        Value::Inst(out_ptr),
        Ty::ptr_to(Ty::Vector(elem, total)),
        "malloc.cast",
    );
    b.store(updated, vec_ptr.clone());
    Ok(b.load(vec_ptr, "final.load"))
}

/// One scalar application of `op` to `x`.
fn scalar_kernel(b: &mut Builder<'_>, op: ElemOp, x: Value, elem: ScalarTy) -> Value {
    match op {
        ElemOp::Relu => {
            let zero = Value::Const(Constant::zero_scalar(elem));
            let pred = if elem.is_float() {
                CmpOp::FUGe
            } else {
                CmpOp::SGe
            };
            let cond = b.cmp(pred, x.clone(), zero.clone(), "relu.cond");
            b.select(cond, x, zero, "new.elem")
        }
        ElemOp::Tanh => {
            let x = to_float(b, x, elem);
            let two = Value::Const(Constant::Float {
                value: 2.0,
                ty: float_of(elem),
            });
            let exponent = b.binary(BinOp::FMul, two, x, "exponent");
            let e2x = b.math(MathFn::Exp, exponent, "exp");
            let one = Value::Const(Constant::Float {
                value: 1.0,
                ty: float_of(elem),
            });
            let num = b.binary(BinOp::FSub, e2x.clone(), one.clone(), "");
            let den = b.binary(BinOp::FAdd, e2x, one, "");
            let t = b.binary(BinOp::FDiv, num, den, "tanh");
            from_float(b, t, elem)
        }
        ElemOp::Sigmoid => {
            let x = to_float(b, x, elem);
            let ex = b.math(MathFn::Exp, x, "exp");
            let one = Value::Const(Constant::Float {
                value: 1.0,
                ty: float_of(elem),
            });
            let den = b.binary(BinOp::FAdd, ex.clone(), one, "");
            let s = b.binary(BinOp::FDiv, ex, den, "sigmoid");
            from_float(b, s, elem)
        }
        ElemOp::Sin
        | ElemOp::Cos
        | ElemOp::Exp
        | ElemOp::Exp2
        | ElemOp::Log
        | ElemOp::Log2
        | ElemOp::Log10
        | ElemOp::Sqrt
        | ElemOp::Fabs
        | ElemOp::Floor
        | ElemOp::Ceil => {
            let fun = match op {
                ElemOp::Sin => MathFn::Sin,
                ElemOp::Cos => MathFn::Cos,
                ElemOp::Exp => MathFn::Exp,
                ElemOp::Exp2 => MathFn::Exp2,
                ElemOp::Log => MathFn::Log,
                ElemOp::Log2 => MathFn::Log2,
                ElemOp::Log10 => MathFn::Log10,
                ElemOp::Sqrt => MathFn::Sqrt,
                ElemOp::Fabs => MathFn::Fabs,
                ElemOp::Floor => MathFn::Floor,
                ElemOp::Ceil => MathFn::Ceil,
                _ => unreachable!(),
            };
            let x = to_float(b, x, elem);
            let y = b.math(fun, x, fun_name(fun));
            from_float(b, y, elem)
        }
    }
}

/// The float type an integer element evaluates in.
fn float_of(elem: ScalarTy) -> ScalarTy {
    if elem.is_float() {
        elem
    } else {
        ScalarTy::F32
    }
}

fn to_float(b: &mut Builder<'_>, x: Value, elem: ScalarTy) -> Value {
    if elem.is_float() {
        x
    } else {
        b.si_to_fp(x, ScalarTy::F32, "")
    }
}

fn from_float(b: &mut Builder<'_>, x: Value, elem: ScalarTy) -> Value {
    if elem.is_float() {
        x
    } else {
        b.fp_to_si(x, elem, "")
    }
}

fn fun_name(fun: MathFn) -> &'static str {
    match fun {
        MathFn::Exp => "exp",
        MathFn::Exp2 => "exp2",
        MathFn::Log => "log",
        MathFn::Log2 => "log2",
        MathFn::Log10 => "log10",
        MathFn::Sqrt => "sqrt",
        MathFn::Sin => "sin",
        MathFn::Cos => "cos",
        MathFn::Floor => "floor",
        MathFn::Ceil => "ceil",
        MathFn::Fabs => "fabs",
    }
}

/// Lowers one broadcast intrinsic. A constant scalar folds to a
/// constant splat; otherwise a splat shuffle is emitted. The result is
/// stored to the output buffer and returned as the replacement value.
///
/// # Errors
///
/// Missing types or buffers.
pub fn lower_broadcast(
    func: &mut Function,
    analysis: &mut TensorAnalysis,
    inst: InstId,
) -> Result<Value, LowerError> {
    let label = inst_label(func, inst);
    let Inst::Tensor(TensorInst::Broadcast { scalar, .. }) = func.insts[inst].kind.clone() else {
        unreachable!("lower_broadcast on non-broadcast");
    };

    let tensor = analysis
        .ty_of(ttc_ir::ValueRef::Inst(inst))
        .ok_or_else(|| LowerError::MissingType {
            inst: label.clone(),
        })?
        .clone();
    let elem = func.insts[inst]
        .ty
        .elem_ty()
        .expect("broadcast produces a vector");
    let n = tensor.num_elements();

    let mut b = Builder::before(func, inst);
    let splat = match scalar.as_const() {
        Some(Constant::Int { value, ty }) => Value::Const(Constant::IntVector {
            elems: vec![*value; n as usize],
            elem_ty: *ty,
        }),
        Some(Constant::Float { value, ty }) => Value::Const(Constant::FloatVector {
            elems: vec![*value; n as usize],
            elem_ty: *ty,
        }),
        _ => b.splat(scalar.clone(), n, "broadcast"),
    };

    let out_ptr = analysis
        .mem_ptr_of(ttc_ir::ValueRef::Inst(inst))
        .ok_or_else(|| LowerError::MissingBuffer {
            inst: label.clone(),
        })?;
    let vec_ptr = b.ptr_cast(
        Value::Inst(out_ptr),
        Ty::ptr_to(Ty::Vector(elem, n)),
        "malloc.cast",
    );
    b.store(splat.clone(), vec_ptr);
    Ok(splat)
}
