//! The tensor property analysis.
//!
//! A flow-sensitive fixed point that assigns every tensor-typed SSA value
//! a [`TensorType`]. Facts enter through `typeinfo` annotations and
//! propagate through the well-typed semantics of the tensor intrinsics
//! (elementwise and broadcast preserve the type, matmul derives it from
//! the operands, transpose swaps the last two axes, reduce applies the
//! window formula). PHIs resolve by forward reachability to a `typeinfo`
//! consumer, falling back to a resolved incoming.
//!
//! Resolution runs an RPO sweep and then drains a waitlist of
//! instructions whose operands were not yet typed. A drain round that
//! makes no progress means the function cannot be typed and is a fatal
//! error, as is any structural violation (non-constant properties, rank
//! or common-dimension mismatches, disagreeing PHI inputs).

use crate::{TensorError, TensorType};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace};
use ttc_index::Idx;
use ttc_ir::{Function, Inst, InstId, TensorInst, Value, ValueRef};

/// Fatal analysis failures: the input module is malformed.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AnalysisError {
    /// A `typeinfo` property operand is not a constant integer vector.
    #[error("{inst}: typeinfo shape/layout/padding must be constant integer vectors")]
    NonConstantProperty {
        /// The offending instruction.
        inst: String,
    },

    /// A structural tensor-type violation.
    #[error("{inst}: {source}")]
    BadTensorType {
        /// The offending instruction.
        inst: String,
        /// The violated invariant.
        source: TensorError,
    },

    /// Tensor arithmetic with disagreeing operand types.
    #[error("{inst}: tensor operand types disagree ({left} vs {right})")]
    OperandMismatch {
        /// The offending instruction.
        inst: String,
        /// First operand type.
        left: TensorType,
        /// Conflicting operand type.
        right: TensorType,
    },

    /// Matmul operands with no matching common dimension.
    #[error("{inst}: matmul common dimension mismatch ({left} vs {right})")]
    MatmulMismatch {
        /// The offending instruction.
        inst: String,
        /// Common dimension from the left operand.
        left: u32,
        /// Common dimension from the right operand.
        right: u32,
    },

    /// A reduce window that does not fit its input.
    #[error("{inst}: reduce window {window:?} with strides {strides:?} does not fit {input}")]
    ReduceMismatch {
        /// The offending instruction.
        inst: String,
        /// Window shape.
        window: Vec<u32>,
        /// Window strides.
        strides: Vec<u32>,
        /// Input type.
        input: TensorType,
    },

    /// Incoming edges of a PHI disagree on the tensor type.
    #[error("{inst}: tensor PHI incomings disagree ({left} vs {right})")]
    PhiDisagreement {
        /// The offending PHI.
        inst: String,
        /// One incoming type.
        left: TensorType,
        /// The disagreeing incoming type.
        right: TensorType,
    },

    /// The waitlist stopped making progress.
    #[error("cannot resolve tensor type of {value}; no typeinfo reachable")]
    Unresolvable {
        /// A stuck value.
        value: String,
    },
}

/// The per-function analysis result and side tables.
///
/// Also carries the buffer maps filled in by the buffer allocator:
/// `mem_ptr` (the backing allocation per tensor value) and `alloc_size`
/// (the allocated element count, which may differ from the shape product
/// when derived from a pointer operand).
#[derive(Debug, Default)]
pub struct TensorAnalysis {
    types: FxHashMap<ValueRef, TensorType>,
    /// Tensor values in discovery order (deterministic allocation order).
    order: Vec<ValueRef>,
    set: FxHashSet<ValueRef>,
    mem_ptrs: FxHashMap<ValueRef, InstId>,
    alloc_sizes: FxHashMap<ValueRef, u32>,
}

impl TensorAnalysis {
    /// Runs the analysis over `func`.
    ///
    /// # Errors
    ///
    /// Any structural malformedness; see [`AnalysisError`].
    pub fn analyze(func: &Function) -> Result<Self, AnalysisError> {
        let mut this = Self::default();
        let mut waitlist = Waitlist::default();

        for block in func.rpo() {
            for inst in func.block_insts(block).collect::<Vec<_>>() {
                if !this.is_tensor_inst(func, inst) {
                    continue;
                }
                trace!(inst = %inst_label(func, inst), "tensor instruction");
                this.try_resolve(func, inst, &mut waitlist)?;
                this.add_tensor_value(ValueRef::Inst(inst));

                // The annotated operand of a typeinfo is a tensor value
                // in its own right.
                if let Inst::Tensor(TensorInst::TypeInfo { value, .. }) = &func.insts[inst].kind {
                    if let Some(vref) = value.as_ref() {
                        this.add_tensor_value(vref);
                    }
                }
            }
        }

        // Drain the waitlist; a round that resolves nothing is fatal.
        while !waitlist.is_empty() {
            let resolved_before = this.types.len();
            for inst in waitlist.take() {
                this.try_resolve(func, inst, &mut waitlist)?;
            }
            if this.types.len() == resolved_before && !waitlist.is_empty() {
                let stuck = waitlist.peek().expect("non-empty waitlist");
                return Err(AnalysisError::Unresolvable {
                    value: inst_label(func, stuck),
                });
            }
        }

        debug!(
            tensors = this.order.len(),
            typed = this.types.len(),
            "tensor analysis complete"
        );
        Ok(this)
    }

    /// The resolved type of `value`, if it is a typed tensor value.
    #[must_use]
    pub fn ty_of(&self, value: ValueRef) -> Option<&TensorType> {
        self.types.get(&value)
    }

    /// True if `value` was classified as a tensor value.
    #[must_use]
    pub fn is_tensor_value(&self, value: ValueRef) -> bool {
        self.set.contains(&value)
    }

    /// The tensor values in discovery order.
    #[must_use]
    pub fn tensor_values(&self) -> &[ValueRef] {
        &self.order
    }

    /// The backing allocation of `value`, once buffers are allocated.
    #[must_use]
    pub fn mem_ptr_of(&self, value: ValueRef) -> Option<InstId> {
        self.mem_ptrs.get(&value).copied()
    }

    /// The allocated element count of `value`'s buffer.
    #[must_use]
    pub fn alloc_size_of(&self, value: ValueRef) -> Option<u32> {
        self.alloc_sizes.get(&value).copied()
    }

    /// Registers the backing allocation for `value`.
    pub fn set_mem_ptr(&mut self, value: ValueRef, ptr: InstId, elems: u32) {
        if self.mem_ptrs.insert(value, ptr).is_some() {
            debug!(?value, "re-registering buffer for tensor value");
        }
        self.alloc_sizes.insert(value, elems);
    }

    /// Registers a type directly (used for tile-register values created
    /// during lowering, which never pass through the analysis sweep).
    pub fn set_ty(&mut self, value: ValueRef, ty: TensorType) {
        self.types.insert(value, ty);
    }

    /// Drops every record of `value`; called before its erasure.
    pub fn purge(&mut self, value: ValueRef) {
        self.types.remove(&value);
        self.mem_ptrs.remove(&value);
        self.alloc_sizes.remove(&value);
        if self.set.remove(&value) {
            self.order.retain(|&v| v != value);
        }
    }

    fn add_tensor_value(&mut self, value: ValueRef) {
        if self.set.insert(value) {
            self.order.push(value);
        }
    }

    /// The classification: tensor intrinsics; arithmetic whose first
    /// operand is a tensor-valued vector instruction (transitively);
    /// vector PHIs whose incomings include at least one non-constant
    /// that is itself tensor-valued. Purely constant PHIs carry
    /// shape/layout/padding literals, and PHIs over already-lowered
    /// vector code carry no tensors, so neither classifies.
    pub(crate) fn is_tensor_inst(&self, func: &Function, inst: InstId) -> bool {
        let mut visited = FxHashSet::default();
        self.classify(func, inst, &mut visited)
    }

    fn classify(&self, func: &Function, inst: InstId, visited: &mut FxHashSet<InstId>) -> bool {
        if self.set.contains(&ValueRef::Inst(inst)) {
            return true;
        }
        if !visited.insert(inst) {
            return false;
        }
        match &func.insts[inst].kind {
            Inst::Tensor(_) => true,
            Inst::Binary { lhs, .. } | Inst::Cmp { lhs, .. } => {
                self.operand_classifies(func, lhs, visited)
            }
            Inst::Select { then_val, .. } => self.operand_classifies(func, then_val, visited),
            Inst::Phi { incomings } => {
                func.insts[inst].ty.is_vector()
                    && incomings.iter().any(|(_, v)| v.as_const().is_none())
                    && incomings
                        .iter()
                        .any(|(_, v)| self.operand_classifies(func, v, visited))
            }
            _ => false,
        }
    }

    fn operand_classifies(
        &self,
        func: &Function,
        operand: &Value,
        visited: &mut FxHashSet<InstId>,
    ) -> bool {
        match operand {
            Value::Inst(op) => {
                func.insts[*op].ty.is_vector() && self.classify(func, *op, visited)
            }
            _ => false,
        }
    }

    /// Attempts to resolve the type of `inst`, recursing into unresolved
    /// operands and waitlisting on failure. Returns whether `inst` is now
    /// resolved.
    fn try_resolve(
        &mut self,
        func: &Function,
        inst: InstId,
        waitlist: &mut Waitlist,
    ) -> Result<bool, AnalysisError> {
        if self.types.contains_key(&ValueRef::Inst(inst)) {
            waitlist.remove(inst);
            return Ok(true);
        }

        let kind = func.insts[inst].kind.clone();
        let resolved = match kind {
            Inst::Tensor(TensorInst::TypeInfo {
                value,
                shape,
                layout,
                padding,
            }) => {
                let ty = parse_properties(func, inst, &shape, &layout, &padding)?;
                self.types.insert(ValueRef::Inst(inst), ty.clone());
                if let Some(vref) = value.as_ref() {
                    self.types.insert(vref, ty.clone());
                }
                // A pointer operand also types the SSA value stored
                // through it.
                if func.value_ty(&value).is_ptr() {
                    if let Some(stored) = stored_value_through(func, &value) {
                        if let Some(sref) = stored.as_ref() {
                            trace!(inst = %inst_label(func, inst), "typeinfo maps stored value");
                            self.types.insert(sref, ty);
                        }
                    }
                }
                true
            }

            Inst::Tensor(TensorInst::Elementwise { input, .. })
            | Inst::Tensor(TensorInst::Broadcast { input, .. }) => {
                match self.operand_type(func, &input, waitlist)? {
                    Some(ty) => {
                        self.types.insert(ValueRef::Inst(inst), ty);
                        true
                    }
                    None => false,
                }
            }

            Inst::Tensor(TensorInst::Transpose { input }) => {
                match self.operand_type(func, &input, waitlist)? {
                    Some(ty) => {
                        let out = ty.transposed().map_err(|source| {
                            AnalysisError::BadTensorType {
                                inst: inst_label(func, inst),
                                source,
                            }
                        })?;
                        self.types.insert(ValueRef::Inst(inst), out);
                        true
                    }
                    None => false,
                }
            }

            Inst::Tensor(TensorInst::Matmul { lhs, rhs }) => {
                let lt = self.operand_type(func, &lhs, waitlist)?;
                let rt = self.operand_type(func, &rhs, waitlist)?;
                match (lt, rt) {
                    (Some(lt), Some(rt)) => {
                        let out = matmul_output_type(func, inst, &lt, &rt)?;
                        self.types.insert(ValueRef::Inst(inst), out);
                        true
                    }
                    _ => false,
                }
            }

            Inst::Tensor(TensorInst::Reduce {
                window,
                strides,
                input,
                ..
            }) => match self.operand_type(func, &input, waitlist)? {
                Some(ty) => {
                    let win = const_lanes(func, inst, &window)?;
                    let str_ = const_lanes(func, inst, &strides)?;
                    let out = reduce_output_type(func, inst, &ty, &win, &str_)?;
                    self.types.insert(ValueRef::Inst(inst), out);
                    true
                }
                None => false,
            },

            Inst::Phi { ref incomings } => self.resolve_phi(func, inst, incomings, waitlist)?,

            Inst::Binary { ref lhs, ref rhs, .. } | Inst::Cmp { ref lhs, ref rhs, .. } => {
                self.resolve_arith(func, inst, &[lhs.clone(), rhs.clone()], waitlist)?
            }
            Inst::Select {
                ref then_val,
                ref else_val,
                ..
            } => self.resolve_arith(
                func,
                inst,
                &[then_val.clone(), else_val.clone()],
                waitlist,
            )?,

            _ => false,
        };

        if resolved {
            waitlist.remove(inst);
        } else {
            waitlist.add(inst);
        }
        Ok(resolved)
    }

    /// The type of an intrinsic operand, recursing into it when it is an
    /// unresolved tensor instruction. `None` defers the user to the
    /// waitlist.
    fn operand_type(
        &mut self,
        func: &Function,
        operand: &Value,
        waitlist: &mut Waitlist,
    ) -> Result<Option<TensorType>, AnalysisError> {
        let Some(vref) = operand.as_ref() else {
            return Ok(None);
        };
        if let Some(ty) = self.types.get(&vref) {
            return Ok(Some(ty.clone()));
        }
        if let ValueRef::Inst(op) = vref {
            waitlist.add(op);
            if self.try_resolve(func, op, waitlist)? {
                return Ok(self.types.get(&vref).cloned());
            }
        }
        Ok(None)
    }

    /// Arithmetic over tensors: every typed operand must agree; the
    /// common type is the result type.
    fn resolve_arith(
        &mut self,
        func: &Function,
        inst: InstId,
        operands: &[Value],
        waitlist: &mut Waitlist,
    ) -> Result<bool, AnalysisError> {
        let mut found: Option<TensorType> = None;
        for op in operands {
            if op.as_const().is_some() {
                continue;
            }
            let Some(ty) = self.operand_type(func, op, waitlist)? else {
                // A tensor-instruction operand that cannot resolve yet
                // defers the whole instruction.
                if matches!(op, Value::Inst(i) if self.is_tensor_inst(func, *i)) {
                    return Ok(false);
                }
                continue;
            };
            match &found {
                None => found = Some(ty),
                Some(prev) if *prev == ty => {}
                Some(prev) => {
                    return Err(AnalysisError::OperandMismatch {
                        inst: inst_label(func, inst),
                        left: prev.clone(),
                        right: ty,
                    })
                }
            }
        }
        match found {
            Some(ty) => {
                self.types.insert(ValueRef::Inst(inst), ty);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// PHI resolution: forward reachability to a `typeinfo` consumer,
    /// falling back to a resolved incoming. Resolved incomings must
    /// agree with each other.
    fn resolve_phi(
        &mut self,
        func: &Function,
        phi: InstId,
        incomings: &[(ttc_ir::BlockId, Value)],
        _waitlist: &mut Waitlist,
    ) -> Result<bool, AnalysisError> {
        let mut incoming_ty: Option<TensorType> = None;
        for (_, v) in incomings {
            let Some(vref) = v.as_ref() else { continue };
            let Some(ty) = self.types.get(&vref) else {
                continue;
            };
            match &incoming_ty {
                None => incoming_ty = Some(ty.clone()),
                Some(prev) if prev == ty => {}
                Some(prev) => {
                    return Err(AnalysisError::PhiDisagreement {
                        inst: inst_label(func, phi),
                        left: prev.clone(),
                        right: ty.clone(),
                    })
                }
            }
        }

        let forward = self.forward_type_search(func, phi)?;
        let ty = match (forward, incoming_ty) {
            (Some(t), _) => t,
            (None, Some(t)) => t,
            (None, None) => return Ok(false),
        };
        self.types.insert(ValueRef::Inst(phi), ty);
        Ok(true)
    }

    /// Walks `users()` of `start` through type-preserving consumers
    /// until a `typeinfo` annotation is found.
    fn forward_type_search(
        &self,
        func: &Function,
        start: InstId,
    ) -> Result<Option<TensorType>, AnalysisError> {
        let mut visited: FxHashSet<InstId> = FxHashSet::default();
        let mut worklist = vec![start];
        while let Some(cur) = worklist.pop() {
            if !visited.insert(cur) {
                continue;
            }
            for user in func.users_of(ValueRef::Inst(cur)) {
                match &func.insts[user].kind {
                    Inst::Tensor(TensorInst::TypeInfo {
                        shape,
                        layout,
                        padding,
                        ..
                    }) => {
                        let ty = parse_properties(func, user, shape, layout, padding)?;
                        return Ok(Some(ty));
                    }
                    // Type-preserving consumers keep the search alive.
                    Inst::Tensor(TensorInst::Elementwise { .. })
                    | Inst::Tensor(TensorInst::Broadcast { .. })
                    | Inst::Phi { .. }
                    | Inst::Binary { .. }
                    | Inst::Cmp { .. }
                    | Inst::Select { .. } => worklist.push(user),
                    // Type-changing or unrelated consumers end the path.
                    _ => {}
                }
            }
        }
        Ok(None)
    }
}

/// Resolves an intrinsic operand through its `typeinfo`: the annotated
/// tensor SSA value behind the annotation, or the operand itself.
#[must_use]
pub fn tensor_operand(func: &Function, operand: &Value) -> Value {
    if let Value::Inst(id) = operand {
        if let Inst::Tensor(TensorInst::TypeInfo { value, .. }) = &func.insts[*id].kind {
            return value.clone();
        }
    }
    operand.clone()
}

/// The SSA value stored through `ptr`, found by scanning its users.
#[must_use]
pub fn stored_value_through(func: &Function, ptr: &Value) -> Option<Value> {
    let pref = ptr.as_ref()?;
    for user in func.users_of(pref) {
        if let Inst::Store { value, ptr: dest } = &func.insts[user].kind {
            if dest.as_ref() == Some(pref) {
                return Some(value.clone());
            }
        }
    }
    None
}

fn parse_properties(
    func: &Function,
    inst: InstId,
    shape: &Value,
    layout: &Value,
    padding: &Value,
) -> Result<TensorType, AnalysisError> {
    let lanes = |v: &Value| -> Option<Vec<u32>> {
        v.as_const()?
            .as_int_lanes()
            .map(|l| l.into_iter().map(|x| x as u32).collect())
    };
    let (Some(shape), Some(layout), Some(padding)) =
        (lanes(shape), lanes(layout), lanes(padding))
    else {
        return Err(AnalysisError::NonConstantProperty {
            inst: inst_label(func, inst),
        });
    };
    TensorType::new(shape, layout, padding).map_err(|source| AnalysisError::BadTensorType {
        inst: inst_label(func, inst),
        source,
    })
}

fn const_lanes(func: &Function, inst: InstId, v: &Value) -> Result<Vec<u32>, AnalysisError> {
    v.as_const()
        .and_then(|c| c.as_int_lanes())
        .map(|l| l.into_iter().map(|x| x as u32).collect())
        .ok_or_else(|| AnalysisError::NonConstantProperty {
            inst: inst_label(func, inst),
        })
}

/// Matmul output derivation: the common dimension is L's inner
/// axis and must equal R's; the output is `[batches..., M, N]` in
/// identity (row-major) layout with zero padding. An explicit `typeinfo`
/// on the matmul result overwrites this with the requested layout.
fn matmul_output_type(
    func: &Function,
    inst: InstId,
    lhs: &TensorType,
    rhs: &TensorType,
) -> Result<TensorType, AnalysisError> {
    if lhs.rank() < 2 || rhs.rank() < 2 {
        return Err(AnalysisError::BadTensorType {
            inst: inst_label(func, inst),
            source: TensorError::RankTooSmall(lhs.rank().min(rhs.rank())),
        });
    }

    let (m, common_l) = if lhs.is_col_major() {
        (lhs.num_cols(), lhs.num_rows())
    } else {
        (lhs.num_rows(), lhs.num_cols())
    };
    let (n, common_r) = if rhs.is_col_major() {
        (rhs.num_rows(), rhs.num_cols())
    } else {
        (rhs.num_cols(), rhs.num_rows())
    };
    if common_l != common_r {
        return Err(AnalysisError::MatmulMismatch {
            inst: inst_label(func, inst),
            left: common_l,
            right: common_r,
        });
    }

    // Leading (batch) dims come from the left operand.
    let mut shape: Vec<u32> = lhs.shape()[..lhs.rank() - 2].to_vec();
    shape.push(m);
    shape.push(n);
    TensorType::row_major(shape).map_err(|source| AnalysisError::BadTensorType {
        inst: inst_label(func, inst),
        source,
    })
}

/// Reduce output derivation: leading dims unchanged; the last two
/// become `(in - window) / stride + 1`; identity layout, zero padding.
fn reduce_output_type(
    func: &Function,
    inst: InstId,
    input: &TensorType,
    window: &[u32],
    strides: &[u32],
) -> Result<TensorType, AnalysisError> {
    let d = input.rank();
    let wd = window.len();
    let sd = strides.len();
    let fits = d >= 2
        && wd >= 2
        && sd >= 2
        && window[wd - 2] <= input.dim(d - 2)
        && window[wd - 1] <= input.dim(d - 1)
        && strides[sd - 2] > 0
        && strides[sd - 1] > 0;
    if !fits {
        return Err(AnalysisError::ReduceMismatch {
            inst: inst_label(func, inst),
            window: window.to_vec(),
            strides: strides.to_vec(),
            input: input.clone(),
        });
    }

    let mut shape: Vec<u32> = input.shape()[..d - 2].to_vec();
    shape.push((input.dim(d - 2) - window[wd - 2]) / strides[sd - 2] + 1);
    shape.push((input.dim(d - 1) - window[wd - 1]) / strides[sd - 1] + 1);
    TensorType::row_major(shape).map_err(|source| AnalysisError::BadTensorType {
        inst: inst_label(func, inst),
        source,
    })
}

fn inst_label(func: &Function, inst: InstId) -> String {
    match func.insts[inst].name {
        Some(name) => format!("%{} ({name})", inst.index()),
        None => format!("%{} ({})", inst.index(), func.insts[inst].kind.opcode()),
    }
}

/// Deduplicated FIFO of instructions awaiting resolution.
#[derive(Debug, Default)]
struct Waitlist {
    queue: Vec<InstId>,
    set: FxHashSet<InstId>,
}

impl Waitlist {
    fn add(&mut self, inst: InstId) {
        if self.set.insert(inst) {
            self.queue.push(inst);
        }
    }

    fn remove(&mut self, inst: InstId) {
        if self.set.remove(&inst) {
            self.queue.retain(|&i| i != inst);
        }
    }

    fn take(&mut self) -> Vec<InstId> {
        self.set.clear();
        std::mem::take(&mut self.queue)
    }

    fn peek(&self) -> Option<InstId> {
        self.queue.first().copied()
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
