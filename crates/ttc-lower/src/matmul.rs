//! Matmul lowering.
//!
//! The loop nest runs batch dims (step 1), then M, N, K with tile steps.
//! The innermost body loads an M-tile of L and an N-tile of R, feeds a
//! layout-selected kernel, and accumulates into per-row tile PHIs that
//! are zero-seeded at the K-loop preheader. Completed tiles are stored
//! at the N-loop latch, after the K loop exits.
//!
//! Kernel selection is by the layouts of the two tile operands:
//!
//! | L      | R      | strategy                                       |
//! |--------|--------|------------------------------------------------|
//! | row    | column | vectorize K, horizontal-reduce each dot        |
//! | column | row    | broadcast L element, vectorize across N        |
//! | row    | row    | broadcast L element, vectorize across N        |
//! | column | column | broadcast R element, vectorize across M        |
//!
//! Floating-point elements use `fmul`/`fadd`, integers `mul`/`add`.

use crate::engine::{force_unroll, inst_label};
use crate::nest::create_tiled_loops;
use crate::plan::MatmulPlan;
use crate::tile::{load_tile, store_tile};
use crate::{tilereg, LowerError};
use tracing::debug;
use ttc_intern::Symbol;
use ttc_ir::{BinOp, Builder, Function, Inst, InstId, ScalarTy, TensorInst, Ty, Value, VecReduceOp};
use ttc_tensor::TensorAnalysis;

/// Resolved matmul knobs.
#[derive(Clone, Copy, Debug)]
pub struct MatmulKnobs {
    /// M tile.
    pub tile_m: u32,
    /// N tile.
    pub tile_n: u32,
    /// K tile.
    pub tile_k: u32,
    /// Innermost-loop unroll request (0 = none).
    pub unroll: u32,
}

/// Lowers one matmul intrinsic, returning the final flat load that
/// replaces its uses.
///
/// # Errors
///
/// Missing types/buffers, common-dimension mismatches, or invalid
/// tile-register configurations.
#[allow(clippy::too_many_lines)]
pub fn lower_matmul(
    func: &mut Function,
    analysis: &mut TensorAnalysis,
    inst: InstId,
    knobs: MatmulKnobs,
    register_bits: u32,
    tile_regs: Option<(u32, u32)>,
) -> Result<Value, LowerError> {
    let label = inst_label(func, inst);
    let Inst::Tensor(TensorInst::Matmul { lhs, rhs }) = func.insts[inst].kind.clone() else {
        unreachable!("lower_matmul on non-matmul");
    };

    let missing = || LowerError::MissingType {
        inst: label.clone(),
    };
    let l_key = crate::engine::operand_key(func, analysis, &lhs).ok_or_else(missing)?;
    let r_key = crate::engine::operand_key(func, analysis, &rhs).ok_or_else(missing)?;
    let l_ty = analysis.ty_of(l_key).ok_or_else(missing)?.clone();
    let r_ty = analysis.ty_of(r_key).ok_or_else(missing)?.clone();
    let out_annot = analysis
        .ty_of(ttc_ir::ValueRef::Inst(inst))
        .ok_or_else(missing)?
        .clone();
    let elem = func.insts[inst]
        .ty
        .elem_ty()
        .expect("matmul produces a vector");

    let mut plan = MatmulPlan::new(&label, l_ty, r_ty, out_annot.layout())?;
    let tm = crate::knobs::largest_divisor_le(plan.l_dim, knobs.tile_m);
    let tn = crate::knobs::largest_divisor_le(plan.r_dim, knobs.tile_n);
    let tk = crate::knobs::largest_divisor_le(plan.common_dim, knobs.tile_k);
    if (tm, tn, tk) != (knobs.tile_m, knobs.tile_n, knobs.tile_k) {
        debug!(
            %label,
            tm, tn, tk, "tile sizes legalized to divisors of the matmul dims"
        );
    }
    plan.set_tiles(tm, tn, tk);

    let start = func.insts[inst].block.expect("intrinsic is placed");
    let cont = func.split_block(inst, Symbol::intern("continue"))?;
    let nest = create_tiled_loops(func, start, cont, &plan.loop_spec(tm, tn, tk))?;
    plan.set_indices(&nest);
    plan.nest = Some(nest);

    let buffer = |analysis: &TensorAnalysis, key: ttc_ir::ValueRef| {
        analysis
            .mem_ptr_of(key)
            .ok_or_else(|| LowerError::MissingBuffer {
                inst: label.clone(),
            })
    };
    let l_ptr = buffer(analysis, l_key)?;
    let r_ptr = buffer(analysis, r_key)?;
    let out_ptr = buffer(analysis, ttc_ir::ValueRef::Inst(inst))?;

    let inner_body = plan.nest.as_ref().expect("nest set").inner_body;

    if let Some((reg_rows, reg_cols)) = tile_regs {
        // The 2-D tile-register path has its own accumulator scheme.
        tilereg::lower_matmul_tiles(
            func, analysis, &mut plan, &label, elem, l_ptr, r_ptr, out_ptr, reg_rows, reg_cols,
        )?;
    } else {
        plan.insert_tile_phis(func, elem);
        let vf = (register_bits / elem.bits()).max(1);
        {
            let mut b = Builder::at_end(func, inner_body);
            plan.l_tile_vec = load_tile(
                &mut b,
                Value::Inst(l_ptr),
                &plan.l_tensor,
                &plan.l_tile,
                elem,
                &plan.l_indices,
            );
            plan.r_tile_vec = load_tile(
                &mut b,
                Value::Inst(r_ptr),
                &plan.r_tensor,
                &plan.r_tile,
                elem,
                &plan.r_indices,
            );
            generate_kernel(&mut b, &mut plan, elem, vf);
        }
        {
            let store_block = plan.store_block();
            let mut b = Builder::at_end(func, store_block);
            store_tile(&mut b, &plan, Value::Inst(out_ptr), elem);
        }
        plan.complete_tile_phis(func);
    }

    force_unroll(func, inner_body, knobs.unroll);

    // One flat load of the output buffer replaces the intrinsic's uses.
    let n = analysis
        .alloc_size_of(ttc_ir::ValueRef::Inst(inst))
        .unwrap_or_else(|| out_annot.num_elements());
    let mut b = Builder::before(func, inst);
    let cast = b.ptr_cast(
        Value::Inst(out_ptr),
        Ty::ptr_to(Ty::Vector(elem, n)),
        "malloc.cast",
    );
    Ok(b.load(cast, "final.load"))
}

/// Emits the tile kernel for the four layout combinations, rewriting
/// `plan.out_tile_vec` from the accumulator PHIs to the updated rows.
pub fn generate_kernel(b: &mut Builder<'_>, plan: &mut MatmulPlan, elem: ScalarTy, vf: u32) {
    let l_row_major = plan.l_tile.is_row_major();
    let r_row_major = plan.r_tile.is_row_major();
    match (l_row_major, r_row_major) {
        (true, false) => kernel_row_col(b, plan, elem, vf),
        (false, true) | (true, true) => kernel_broadcast_l(b, plan, elem, vf, l_row_major),
        (false, false) => kernel_col_col(b, plan, elem, vf),
    }
}

/// L row-major x R column-major: both tiles expose K contiguously, so
/// each output element is a vectorized dot product over K.
fn kernel_row_col(b: &mut Builder<'_>, plan: &mut MatmulPlan, elem: ScalarTy, vf: u32) {
    let is_fp = elem.is_float();
    let (rows, cols, common) = (plan.l_tile_dim, plan.r_tile_dim, plan.tile_common_dim);
    let a = plan.l_tile_vec.clone();
    let bt = plan.r_tile_vec.clone();
    let out = OutMerge::new(plan);

    let mut acc = plan.out_tile_vec.clone();
    for i in 0..rows {
        let mut dots = Vec::with_capacity(cols as usize);
        for j in 0..cols {
            let mut sum: Option<Value> = None;
            let mut k = 0;
            while k < common {
                let bs = block_size(vf, common - k);
                let l = b.subvector(a[i as usize].clone(), k, bs, "block");
                let r = b.subvector(bt[j as usize].clone(), k, bs, "block");
                let prod = b.binary(BinOp::mul_for(elem), l, r, "");
                let part = b.vec_reduce(reduce_add_op(is_fp), prod, "dot.part");
                sum = Some(match sum {
                    None => part,
                    Some(prev) => b.binary(BinOp::add_for(elem), prev, part, ""),
                });
                k += bs;
            }
            dots.push(sum.expect("common dim is positive"));
        }
        out.merge_row_of_scalars(b, &mut acc, i, &dots, elem);
    }
    plan.out_tile_vec = acc;
}

/// Broadcast an L element and vectorize across N; used for both
/// column x row and row x row tiles (they differ only in how the L
/// element is addressed).
fn kernel_broadcast_l(
    b: &mut Builder<'_>,
    plan: &mut MatmulPlan,
    elem: ScalarTy,
    vf: u32,
    l_row_major: bool,
) {
    let is_fp = elem.is_float();
    let (rows, cols, common) = (plan.l_tile_dim, plan.r_tile_dim, plan.tile_common_dim);
    let a = plan.l_tile_vec.clone();
    let bt = plan.r_tile_vec.clone();
    let out = OutMerge::new(plan);

    let mut acc = plan.out_tile_vec.clone();
    for i in 0..rows {
        let mut j = 0;
        while j < cols {
            let bs = block_size(vf, cols - j);
            let mut sum: Option<Value> = None;
            for k in 0..common {
                let r_blk = b.subvector(bt[k as usize].clone(), j, bs, "block");
                let lh = if l_row_major {
                    b.extract_element(a[i as usize].clone(), Value::const_i32(i64::from(k)), "")
                } else {
                    b.extract_element(a[k as usize].clone(), Value::const_i32(i64::from(i)), "")
                };
                let splat = b.splat(lh, bs, "broadcast");
                sum = Some(mul_add(b, sum, splat, r_blk, is_fp));
            }
            let sum = sum.expect("common dim is positive");
            out.merge_block(b, &mut acc, i, j, sum, bs, true, elem);
            j += bs;
        }
    }
    plan.out_tile_vec = acc;
}

/// L column-major x R column-major: broadcast an R element and vectorize
/// across M (blocks of an L column).
fn kernel_col_col(b: &mut Builder<'_>, plan: &mut MatmulPlan, elem: ScalarTy, vf: u32) {
    let is_fp = elem.is_float();
    let (rows, cols, common) = (plan.l_tile_dim, plan.r_tile_dim, plan.tile_common_dim);
    let a = plan.l_tile_vec.clone();
    let bt = plan.r_tile_vec.clone();
    let out = OutMerge::new(plan);

    let mut acc = plan.out_tile_vec.clone();
    let mut i = 0;
    while i < rows {
        let bs = block_size(vf, rows - i);
        for j in 0..cols {
            let mut sum: Option<Value> = None;
            for k in 0..common {
                let l_blk = b.subvector(a[k as usize].clone(), i, bs, "block");
                let rh =
                    b.extract_element(bt[j as usize].clone(), Value::const_i32(i64::from(k)), "");
                let splat = b.splat(rh, bs, "broadcast");
                sum = Some(mul_add(b, sum, l_blk, splat, is_fp));
            }
            let sum = sum.expect("common dim is positive");
            out.merge_block(b, &mut acc, i, j, sum, bs, false, elem);
        }
        i += bs;
    }
    plan.out_tile_vec = acc;
}

/// `sum + x * y` with the arithmetic of the element type; the first term
/// of a chain is a bare multiply.
fn mul_add(b: &mut Builder<'_>, sum: Option<Value>, x: Value, y: Value, is_fp: bool) -> Value {
    let mul_op = if is_fp { BinOp::FMul } else { BinOp::Mul };
    let add_op = if is_fp { BinOp::FAdd } else { BinOp::Add };
    let prod = b.binary(mul_op, x, y, "");
    match sum {
        None => prod,
        Some(sum) => b.binary(add_op, sum, prod, ""),
    }
}

fn reduce_add_op(is_fp: bool) -> VecReduceOp {
    if is_fp {
        VecReduceOp::FAdd
    } else {
        VecReduceOp::Add
    }
}

/// The largest power-of-two block not exceeding `vf` that fits in
/// `remaining` lanes.
fn block_size(vf: u32, remaining: u32) -> u32 {
    let mut bs = vf.max(1);
    while bs > remaining {
        bs /= 2;
    }
    bs.max(1)
}

/// Maps logical `(m, n)` kernel coordinates onto the physical output
/// tile rows and merges partial results additively into the
/// accumulators.
struct OutMerge {
    out_col_major: bool,
    row_width: u32,
}

impl OutMerge {
    fn new(plan: &MatmulPlan) -> Self {
        Self {
            out_col_major: plan.out_tile.is_col_major(),
            row_width: plan.out_tile.stride(),
        }
    }

    /// Adds one scalar into accumulator position `(m, n)`.
    fn merge_scalar(
        &self,
        b: &mut Builder<'_>,
        acc: &mut [Value],
        m: u32,
        n: u32,
        value: Value,
        elem: ScalarTy,
    ) {
        let (row, lane) = if self.out_col_major { (n, m) } else { (m, n) };
        let idx = Value::const_i32(i64::from(lane));
        let old = b.extract_element(acc[row as usize].clone(), idx.clone(), "");
        let sum = b.binary(BinOp::add_for(elem), old, value, "");
        acc[row as usize] = b.insert_element(acc[row as usize].clone(), sum, idx, "acc.vector");
    }

    /// Adds a full row of per-column dot products into accumulator
    /// row `m`.
    fn merge_row_of_scalars(
        &self,
        b: &mut Builder<'_>,
        acc: &mut [Value],
        m: u32,
        dots: &[Value],
        elem: ScalarTy,
    ) {
        if self.out_col_major {
            for (n, dot) in dots.iter().enumerate() {
                self.merge_scalar(b, acc, m, n as u32, dot.clone(), elem);
            }
        } else {
            let row = assemble_vector(b, elem, dots);
            acc[m as usize] = b.binary(
                BinOp::add_for(elem),
                acc[m as usize].clone(),
                row,
                "acc.vector",
            );
        }
    }

    /// Adds a `bs`-lane partial block into the accumulators.
    ///
    /// `along_n` says which logical axis the block's lanes run along:
    /// true for lanes `n..n+bs` at row `m`, false for lanes `m..m+bs`
    /// at column `n`.
    #[allow(clippy::too_many_arguments)]
    fn merge_block(
        &self,
        b: &mut Builder<'_>,
        acc: &mut [Value],
        m: u32,
        n: u32,
        block: Value,
        bs: u32,
        along_n: bool,
        elem: ScalarTy,
    ) {
        // When the block runs along the physical row, merge vector-wise;
        // otherwise scatter the lanes.
        let row_wise = along_n != self.out_col_major;
        if row_wise {
            let (row, offset) = if self.out_col_major { (n, m) } else { (m, n) };
            acc[row as usize] = merge_block_into_row(
                b,
                acc[row as usize].clone(),
                offset,
                self.row_width,
                block,
                bs,
                elem,
            );
        } else {
            for lane in 0..bs {
                let v = b.extract_element(block.clone(), Value::const_i32(i64::from(lane)), "");
                let (bm, bn) = if along_n { (m, n + lane) } else { (m + lane, n) };
                self.merge_scalar(b, acc, bm, bn, v, elem);
            }
        }
    }
}

/// Builds a vector from scalars by chained inserts into undef.
fn assemble_vector(b: &mut Builder<'_>, elem: ScalarTy, elems: &[Value]) -> Value {
    let ty = Ty::Vector(elem, elems.len() as u32);
    let mut vec = Value::Const(ttc_ir::Constant::Undef(ty));
    for (i, e) in elems.iter().enumerate() {
        vec = b.insert_element(
            vec,
            e.clone(),
            Value::const_i32(i as i64),
            "assembled.vect",
        );
    }
    vec
}

/// Adds `block` into lanes `offset..offset+bs` of `row`.
fn merge_block_into_row(
    b: &mut Builder<'_>,
    row: Value,
    offset: u32,
    row_width: u32,
    block: Value,
    bs: u32,
    elem: ScalarTy,
) -> Value {
    if bs == row_width {
        return b.binary(BinOp::add_for(elem), row, block, "acc.vector");
    }
    let old = b.subvector(row.clone(), offset, bs, "block");
    let sum = b.binary(BinOp::add_for(elem), old, block, "");
    insert_block(b, row, offset, row_width, sum, bs)
}

/// Replaces lanes `offset..offset+bs` of `row` with `block` via two
/// shuffles.
fn insert_block(
    b: &mut Builder<'_>,
    row: Value,
    offset: u32,
    row_width: u32,
    block: Value,
    bs: u32,
) -> Value {
    // Widen the block to the row width; lanes past bs are never
    // selected below.
    let mut widen_mask: Vec<u32> = (0..bs).collect();
    widen_mask.resize(row_width as usize, 0);
    let undef = Value::Const(ttc_ir::Constant::Undef(
        b.func().value_ty(&block),
    ));
    let widened = b.shuffle(block, undef, widen_mask, "");

    let mut mask = Vec::with_capacity(row_width as usize);
    for i in 0..offset {
        mask.push(i);
    }
    for i in 0..bs {
        mask.push(row_width + i);
    }
    for i in offset + bs..row_width {
        mask.push(i);
    }
    b.shuffle(row, widened, mask, "tile.vect")
}
