//! Buffer allocation.
//!
//! Every tensor SSA value gets one contiguous heap buffer sized to its
//! resolved shape's element count; the tile loads and stores of the
//! lowered kernels address these buffers. Where the tensor's current
//! contents exist as an SSA value, the buffer is seeded with them, using
//! one of two policies:
//!
//! - **memcpy mode**: when the source value is a load, copy bytes from
//!   the loaded-from pointer;
//! - **typed-store mode**: cast the allocation to a vector pointer and
//!   store the source SSA value once.
//!
//! Seeding is best-effort; a value that is neither a load nor otherwise
//! storable leaves its buffer uninitialized (the lowered kernel that
//! produces it writes it instead).

use crate::analysis::{stored_value_through, TensorAnalysis};
use tracing::debug;
use ttc_ir::{
    Builder, CastKind, Constant, Function, Inst, InstId, ScalarTy, TensorInst, Ty, Value, ValueRef,
};

/// Allocates (and best-effort seeds) the buffer behind every tensor
/// value discovered by `analysis`, registering the pointer and element
/// count back into the analysis maps.
pub fn allocate_buffers(func: &mut Function, analysis: &mut TensorAnalysis, use_memcpy: bool) {
    let values: Vec<ValueRef> = analysis.tensor_values().to_vec();
    for vref in values {
        if analysis.mem_ptr_of(vref).is_some() {
            // Already reconciled to an existing allocation (a typeinfo
            // registers its operand and the stored value with it).
            continue;
        }
        match vref {
            ValueRef::Inst(inst) => match func.insts[inst].kind.clone() {
                Inst::Phi { .. } => alloc_for_phi(func, analysis, inst),
                Inst::Tensor(TensorInst::TypeInfo { value, .. }) => {
                    alloc_for_typeinfo(func, analysis, inst, &value, use_memcpy);
                }
                _ => alloc_for_plain(func, analysis, vref, use_memcpy),
            },
            ValueRef::Arg(_) => alloc_for_plain(func, analysis, vref, use_memcpy),
        }
    }
}

/// Vector element type and lane count of a tensor value.
fn vector_shape(func: &Function, value: &Value) -> Option<(ScalarTy, u32)> {
    match func.value_ty(value) {
        Ty::Vector(elem, lanes) => Some((elem, lanes)),
        _ => None,
    }
}

/// A tensor PHI gets its buffer at the first non-phi position of its
/// block; the kernel that consumes it fills it.
fn alloc_for_phi(func: &mut Function, analysis: &mut TensorAnalysis, phi: InstId) {
    let Some((elem, lanes)) = vector_shape(func, &Value::Inst(phi)) else {
        return;
    };
    let block = func.insts[phi].block.expect("analyzed phi is placed");
    let at = func.first_non_phi_index(block);
    let malloc = match func.blocks[block].insts.get(at).copied() {
        Some(anchor) => {
            let mut b = Builder::before(func, anchor);
            b.heap_alloc(elem, lanes, "tensor.buf")
        }
        None => {
            let mut b = Builder::at_end(func, block);
            b.heap_alloc(elem, lanes, "tensor.buf")
        }
    };
    analysis.set_mem_ptr(ValueRef::Inst(phi), malloc, lanes);
}

/// The typeinfo path: allocate once, register the annotation, its
/// operand, and (through a pointer operand) the stored value against the
/// same buffer, then seed it.
fn alloc_for_typeinfo(
    func: &mut Function,
    analysis: &mut TensorAnalysis,
    typeinfo: InstId,
    annotated: &Value,
    use_memcpy: bool,
) {
    // An annotated value that already has its buffer (a tensor intrinsic
    // result allocated earlier in discovery order) shares it with the
    // annotation instead of allocating twice.
    if let Some(vr) = annotated.as_ref() {
        if let Some(existing) = analysis.mem_ptr_of(vr) {
            let elems = analysis.alloc_size_of(vr).unwrap_or(0);
            analysis.set_mem_ptr(ValueRef::Inst(typeinfo), existing, elems);
            return;
        }
    }

    // Element count: the annotated shape product, or the pointee lane
    // count when annotating through a pointer.
    let annotated_ty = func.value_ty(annotated);
    let (elem, elems) = if let Some(Ty::Vector(elem, lanes)) = annotated_ty.pointee().cloned() {
        (elem, lanes)
    } else if let Some((elem, _)) = vector_shape(func, annotated) {
        let elems = analysis
            .ty_of(ValueRef::Inst(typeinfo))
            .map_or(0, |t| t.num_elements());
        (elem, elems)
    } else {
        debug!("typeinfo operand is neither vector nor vector pointer; no buffer");
        return;
    };
    if elems == 0 {
        debug!("typeinfo with unresolved size; no buffer");
        return;
    }

    // The allocation goes in front of the annotated value's definition
    // (or of the typeinfo itself for arguments and pointers).
    let anchor = match annotated {
        Value::Inst(def) => *def,
        _ => typeinfo,
    };
    let mut b = Builder::before(func, anchor);
    let malloc = b.heap_alloc(elem, elems, "tensor.buf");

    analysis.set_mem_ptr(ValueRef::Inst(typeinfo), malloc, elems);
    if let Some(vr) = annotated.as_ref() {
        analysis.set_mem_ptr(vr, malloc, elems);
    }

    if annotated_ty.is_ptr() {
        // Seed from the value stored through the pointer.
        let Some(stored) = stored_value_through(func, annotated) else {
            debug!("no store through typeinfo pointer; buffer left uninitialized");
            return;
        };
        if let Some(sr) = stored.as_ref() {
            analysis.set_mem_ptr(sr, malloc, elems);
        }
        seed_buffer(func, typeinfo, malloc, &stored, elem, elems, use_memcpy);
    } else if matches!(annotated, Value::Arg(_)) {
        // Arguments carry their contents; a single typed store seeds the
        // buffer in either mode.
        typed_store(func, typeinfo, malloc, annotated, elem, elems);
    } else if !matches!(
        annotated,
        Value::Inst(def) if func.insts[*def].kind.is_tensor()
    ) {
        // A plain SSA vector (e.g. a load): seed after its definition.
        seed_buffer(func, typeinfo, malloc, annotated, elem, elems, use_memcpy);
    }
    // Tensor intrinsic results are written by their own lowered kernels.
}

/// Tensor values with no typeinfo of their own (intrinsic results the
/// analysis still tracks a buffer for, arguments, derived arithmetic).
fn alloc_for_plain(
    func: &mut Function,
    analysis: &mut TensorAnalysis,
    vref: ValueRef,
    use_memcpy: bool,
) {
    let value = Value::from(vref);
    let Some((elem, lanes)) = vector_shape(func, &value) else {
        return;
    };
    let elems = analysis.ty_of(vref).map_or(lanes, |t| t.num_elements());

    let malloc = match vref {
        ValueRef::Inst(def) => {
            let mut b = Builder::before(func, def);
            b.heap_alloc(elem, elems, "tensor.buf")
        }
        ValueRef::Arg(_) => {
            let entry = func.entry;
            let at = func.first_non_phi_index(entry);
            match func.blocks[entry].insts.get(at).copied() {
                Some(anchor) => {
                    let mut b = Builder::before(func, anchor);
                    b.heap_alloc(elem, elems, "tensor.buf")
                }
                None => {
                    let mut b = Builder::at_end(func, entry);
                    b.heap_alloc(elem, elems, "tensor.buf")
                }
            }
        }
    };
    analysis.set_mem_ptr(vref, malloc, elems);

    match vref {
        ValueRef::Arg(_) => {
            // Seed at the allocation site; the argument dominates it.
            typed_store_after(func, malloc, &value, elem, elems);
        }
        ValueRef::Inst(def) => {
            if func.insts[def].kind.is_tensor() {
                // Written by its own lowered kernel.
            } else if use_memcpy {
                if let Inst::Load { ptr } = func.insts[def].kind.clone() {
                    let bytes = elems * elem.bytes();
                    memcpy_after(func, def, malloc, &ptr, bytes);
                } else {
                    debug!("memcpy mode: source is not a load; buffer left uninitialized");
                }
            } else {
                typed_store_after(func, malloc, &value, elem, elems);
            }
        }
    }
}

/// Seeds `malloc` from `source` immediately before `at`.
fn seed_buffer(
    func: &mut Function,
    at: InstId,
    malloc: InstId,
    source: &Value,
    elem: ScalarTy,
    elems: u32,
    use_memcpy: bool,
) {
    if use_memcpy {
        if let Value::Inst(def) = source {
            if let Inst::Load { ptr } = func.insts[*def].kind.clone() {
                let bytes = elems * elem.bytes();
                let mut b = Builder::before(func, at);
                let src = b.ptr_cast(ptr, Ty::ptr_to(Ty::Scalar(ScalarTy::I8)), "load.cast");
                let dst = b.ptr_cast(
                    Value::Inst(malloc),
                    Ty::ptr_to(Ty::Scalar(ScalarTy::I8)),
                    "malloc.cast",
                );
                b.memcpy(dst, src, Value::const_i32(i64::from(bytes)));
                return;
            }
        }
        debug!("memcpy mode: source is not a load; buffer left uninitialized");
        return;
    }
    let mut b = Builder::before(func, at);
    let vec_ptr = b.ptr_cast(
        Value::Inst(malloc),
        Ty::ptr_to(Ty::Vector(elem, elems)),
        "malloc.cast",
    );
    b.store(source.clone(), vec_ptr);
}

/// A typed store of `source` into `malloc`, placed right before `at`.
fn typed_store(
    func: &mut Function,
    at: InstId,
    malloc: InstId,
    source: &Value,
    elem: ScalarTy,
    elems: u32,
) {
    let mut b = Builder::before(func, at);
    let vec_ptr = b.ptr_cast(
        Value::Inst(malloc),
        Ty::ptr_to(Ty::Vector(elem, elems)),
        "malloc.cast",
    );
    b.store(source.clone(), vec_ptr);
}

/// A typed store of `source` into `malloc`, placed right after the
/// allocation (used when the anchor instruction is the source's own
/// definition or an argument).
fn typed_store_after(func: &mut Function, malloc: InstId, source: &Value, elem: ScalarTy, elems: u32) {
    let cast = func.create_inst(
        Inst::Cast {
            kind: CastKind::PtrCast,
            value: Value::Inst(malloc),
        },
        Ty::ptr_to(Ty::Vector(elem, elems)),
        None,
    );
    func.insert_after(malloc, cast).expect("malloc is placed");
    let store = func.create_inst(
        Inst::Store {
            value: source.clone(),
            ptr: Value::Inst(cast),
        },
        Ty::Void,
        None,
    );
    func.insert_after(cast, store).expect("cast is placed");
}

/// A memcpy from `src_ptr` into `malloc`, placed right after `def`.
fn memcpy_after(func: &mut Function, def: InstId, malloc: InstId, src_ptr: &Value, bytes: u32) {
    let i8p = Ty::ptr_to(Ty::Scalar(ScalarTy::I8));
    let src_cast = func.create_inst(
        Inst::Cast {
            kind: CastKind::PtrCast,
            value: src_ptr.clone(),
        },
        i8p.clone(),
        None,
    );
    func.insert_after(def, src_cast).expect("load is placed");
    let dst_cast = func.create_inst(
        Inst::Cast {
            kind: CastKind::PtrCast,
            value: Value::Inst(malloc),
        },
        i8p,
        None,
    );
    func.insert_after(src_cast, dst_cast).expect("cast is placed");
    let cpy = func.create_inst(
        Inst::MemCpy {
            dst: Value::Inst(dst_cast),
            src: Value::Inst(src_cast),
            bytes: Value::Const(Constant::i32(i64::from(bytes))),
        },
        Ty::Void,
        None,
    );
    func.insert_after(dst_cast, cpy).expect("cast is placed");
}
