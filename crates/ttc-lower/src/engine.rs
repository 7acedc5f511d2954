//! Intrinsic collection, dispatch, and cleanup.
//!
//! Tensor intrinsics are collected in reverse-post order and given
//! deterministic instance names (`<intrinsic>_<counter>`); the same
//! enumeration runs in knob-print and lowering modes so the knob-file
//! keys always agree. Each intrinsic is lowered in collection order, its
//! uses are replaced by the final flat load of its output buffer, and it
//! is queued for erasure together with every `typeinfo` annotation. The
//! analysis side tables are purged before the instructions are erased.

use crate::elementwise::{lower_broadcast, lower_elementwise};
use crate::knobs::{KnobSet, KnobSpace};
use crate::matmul::{lower_matmul, MatmulKnobs};
use crate::reduce::{lower_reduce, ReduceKnobs};
use crate::transpose::{lower_transpose, TransposeKnobs};
use crate::LowerError;
use rustc_hash::FxHashSet;
use tracing::debug;
use ttc_index::Idx;
use ttc_intern::Symbol;
use ttc_ir::{BlockId, DomTree, Function, Inst, InstId, LoopInfo, TensorInst, Value, ValueRef};
use ttc_tensor::{tensor_operand, TensorAnalysis};

/// Engine configuration, threaded in from the session options.
#[derive(Clone, Debug)]
pub struct LowerConfig {
    /// Default elementwise tile size.
    pub tile_size: u32,
    /// Default M tile.
    pub tile_size_m: u32,
    /// Default N tile.
    pub tile_size_n: u32,
    /// Default K tile.
    pub tile_size_k: u32,
    /// Default innermost unroll factor (0 = none).
    pub inner_loop_unroll_factor: u32,
    /// Modeled vector register width in bits.
    pub register_bits: u32,
    /// Lower matmul through 2-D tile registers.
    pub tile_registers: bool,
    /// Tile register rows.
    pub tile_reg_rows: u32,
    /// Tile register columns.
    pub tile_reg_cols: u32,
}

impl Default for LowerConfig {
    fn default() -> Self {
        Self {
            tile_size: 2,
            tile_size_m: 4,
            tile_size_n: 4,
            tile_size_k: 10,
            inner_loop_unroll_factor: 0,
            register_bits: 128,
            tile_registers: false,
            tile_reg_rows: 2,
            tile_reg_cols: 2,
        }
    }
}

/// The tensor intrinsics of a function, in reverse-post order.
#[derive(Debug, Default)]
pub struct CollectedIntrinsics {
    /// Intrinsics to lower, named `<intrinsic>_<counter>`.
    pub lowerable: Vec<InstId>,
    /// `typeinfo` annotations, erased after lowering.
    pub typeinfos: Vec<InstId>,
}

/// Collects tensor intrinsics in RPO and assigns instance names.
///
/// The reserved transpose-into-matmul fusion hook lives here: a matmul
/// operand produced by a transpose is a fusion candidate, but the
/// fusable set is never populated, so the decision is only logged.
pub fn collect_intrinsics(func: &mut Function) -> CollectedIntrinsics {
    let mut collected = CollectedIntrinsics::default();
    // Reserved fusion tracking; never populated (fusions stay disabled).
    let fusable: FxHashSet<InstId> = FxHashSet::default();

    let mut counter = 0usize;
    for block in func.rpo() {
        for inst in func.block_insts(block).collect::<Vec<_>>() {
            let Inst::Tensor(t) = func.insts[inst].kind.clone() else {
                continue;
            };
            match t {
                TensorInst::TypeInfo { .. } => collected.typeinfos.push(inst),
                TensorInst::Matmul { lhs, rhs } => {
                    for operand in [lhs, rhs] {
                        let through = tensor_operand(func, &operand);
                        if let Value::Inst(op) = through {
                            if matches!(
                                func.insts[op].kind,
                                Inst::Tensor(TensorInst::Transpose { .. })
                            ) && !fusable.contains(&op)
                            {
                                debug!(
                                    matmul = %inst_label(func, inst),
                                    "transpose operand not fused (fusion disabled)"
                                );
                            }
                        }
                    }
                    name_instance(func, inst, &mut counter);
                    collected.lowerable.push(inst);
                }
                _ => {
                    name_instance(func, inst, &mut counter);
                    collected.lowerable.push(inst);
                }
            }
        }
    }
    collected
}

fn name_instance(func: &mut Function, inst: InstId, counter: &mut usize) {
    let base = match &func.insts[inst].kind {
        Inst::Tensor(t) => t.name(),
        _ => unreachable!("instance names are for tensor intrinsics"),
    };
    func.insts[inst].name = Some(Symbol::intern(&format!("{base}_{counter}")));
    *counter += 1;
}

/// The per-instruction tunable spaces, for knob-print mode.
#[must_use]
pub fn knob_spaces(
    func: &Function,
    analysis: &TensorAnalysis,
    collected: &CollectedIntrinsics,
) -> Vec<(String, KnobSpace)> {
    let mut spaces = Vec::new();
    for &inst in &collected.lowerable {
        let name = func.insts[inst]
            .name
            .expect("collected intrinsics are named")
            .as_str()
            .to_owned();
        let space = match &func.insts[inst].kind {
            Inst::Tensor(TensorInst::Elementwise { .. }) => {
                let Some(ty) = analysis.ty_of(ValueRef::Inst(inst)) else {
                    continue;
                };
                KnobSpace::Elementwise {
                    last_dim: ty.dim(ty.rank() - 1),
                }
            }
            Inst::Tensor(TensorInst::Matmul { lhs, rhs }) => {
                let operand_ty = |v: &Value| {
                    tensor_operand(func, v)
                        .as_ref()
                        .and_then(|r| analysis.ty_of(r).cloned())
                };
                let (Some(l), Some(r)) = (operand_ty(lhs), operand_ty(rhs)) else {
                    continue;
                };
                KnobSpace::Matmul {
                    m: l.dim(l.rank() - 2),
                    k: l.dim(l.rank() - 1),
                    n: r.dim(r.rank() - 1),
                }
            }
            Inst::Tensor(TensorInst::Transpose { input }) => {
                let Some(ty) = tensor_operand(func, input)
                    .as_ref()
                    .and_then(|r| analysis.ty_of(r).cloned())
                else {
                    continue;
                };
                KnobSpace::Transpose {
                    rows: ty.dim(ty.rank() - 2),
                    cols: ty.dim(ty.rank() - 1),
                }
            }
            // Broadcast and reduce expose no printed knobs.
            _ => continue,
        };
        spaces.push((name, space));
    }
    spaces
}

/// Lowers every tensor intrinsic of `func` and erases the intrinsics
/// and annotations.
///
/// # Errors
///
/// Any fatal malformedness surfaced while lowering.
pub fn lower_function(
    func: &mut Function,
    analysis: &mut TensorAnalysis,
    config: &LowerConfig,
    knobs: &KnobSet,
) -> Result<(), LowerError> {
    let collected = collect_intrinsics(func);
    let fname = func.name.as_str().to_owned();
    let mut to_erase: Vec<InstId> = Vec::new();

    for inst in collected.lowerable {
        let name = func.insts[inst]
            .name
            .expect("collected intrinsics are named")
            .as_str()
            .to_owned();
        let knob = |key: &str, default: u32| knobs.get_or(&fname, &name, key, default);

        let output = match func.insts[inst].kind.clone() {
            Inst::Tensor(TensorInst::Elementwise { op, .. }) => lower_elementwise(
                func,
                analysis,
                inst,
                op,
                knob("TileSize", config.tile_size),
            )?,
            Inst::Tensor(TensorInst::Broadcast { .. }) => lower_broadcast(func, analysis, inst)?,
            Inst::Tensor(TensorInst::Matmul { .. }) => {
                let mm_knobs = MatmulKnobs {
                    tile_m: knob("TileSize_M", config.tile_size_m),
                    tile_n: knob("TileSize_N", config.tile_size_n),
                    tile_k: knob("TileSize_K", config.tile_size_k),
                    unroll: knob(
                        "InnerLoopUnrollFactor",
                        config.inner_loop_unroll_factor,
                    ),
                };
                let tile_regs = config
                    .tile_registers
                    .then_some((config.tile_reg_rows, config.tile_reg_cols));
                lower_matmul(func, analysis, inst, mm_knobs, config.register_bits, tile_regs)?
            }
            Inst::Tensor(TensorInst::Transpose { .. }) => {
                let tr_knobs = TransposeKnobs {
                    tile_m: knob("TileSize_M", config.tile_size_m),
                    tile_n: knob("TileSize_N", config.tile_size_n),
                    unroll: knob(
                        "InnerLoopUnrollFactor",
                        config.inner_loop_unroll_factor,
                    ),
                };
                lower_transpose(func, analysis, inst, tr_knobs)?
            }
            Inst::Tensor(TensorInst::Reduce { .. }) => {
                let red_knobs = ReduceKnobs {
                    tile_m: knob("TileSize_M", config.tile_size_m),
                    tile_n: knob("TileSize_N", config.tile_size_n),
                };
                lower_reduce(func, analysis, inst, red_knobs)?
            }
            _ => unreachable!("collected.lowerable holds lowerable intrinsics only"),
        };

        // The replacement value inherits the intrinsic's tensor
        // registrations so downstream intrinsics keep resolving.
        if let Some(out_ref) = output.as_ref() {
            if let Some(ty) = analysis.ty_of(ValueRef::Inst(inst)).cloned() {
                analysis.set_ty(out_ref, ty);
            }
            if let (Some(ptr), Some(size)) = (
                analysis.mem_ptr_of(ValueRef::Inst(inst)),
                analysis.alloc_size_of(ValueRef::Inst(inst)),
            ) {
                analysis.set_mem_ptr(out_ref, ptr, size);
            }
        }

        // Frontend stores of the raw intrinsic value die with it.
        for user in func.users_of(ValueRef::Inst(inst)) {
            if matches!(&func.insts[user].kind, Inst::Store { value, .. }
                if value.as_ref() == Some(ValueRef::Inst(inst)))
            {
                to_erase.push(user);
            }
        }

        func.replace_all_uses(ValueRef::Inst(inst), &output);
        to_erase.push(inst);
    }

    to_erase.extend(collected.typeinfos);

    // Side tables first, then the IR.
    for inst in to_erase {
        analysis.purge(ValueRef::Inst(inst));
        func.erase_inst(inst);
    }
    Ok(())
}

/// Records a force-unroll pragma against the innermost loop containing
/// `inner_body`.
pub(crate) fn force_unroll(func: &mut Function, inner_body: BlockId, factor: u32) {
    if factor == 0 {
        return;
    }
    let dom = DomTree::compute(func);
    let li = LoopInfo::compute(func, &dom);
    if let Some(lp) = li.loop_for(inner_body) {
        func.unroll_hints.insert(lp.header, factor);
    }
}

/// The side-table key for an intrinsic operand: the annotated value
/// behind its `typeinfo` when that value is registered, else the operand
/// itself. A constant operand (a folded broadcast) has no identity of
/// its own, but its annotation still carries the type and buffer.
pub(crate) fn operand_key(
    func: &Function,
    analysis: &TensorAnalysis,
    operand: &Value,
) -> Option<ValueRef> {
    if let Some(r) = tensor_operand(func, operand).as_ref() {
        if analysis.ty_of(r).is_some() {
            return Some(r);
        }
    }
    operand.as_ref()
}

/// `%<id> (<name-or-opcode>)`, for diagnostics.
pub(crate) fn inst_label(func: &Function, inst: InstId) -> String {
    match func.insts[inst].name {
        Some(name) => format!("%{} ({name})", inst.index()),
        None => format!("%{} ({})", inst.index(), func.insts[inst].kind.opcode()),
    }
}
