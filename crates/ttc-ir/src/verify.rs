//! SSA well-formedness checking.
//!
//! The driver re-verifies every function after lowering: defs dominate
//! uses, phis agree with their predecessors, nothing references a
//! tombstone, and operand types line up for arithmetic. Any violation
//! here after a lowering pass means the pass emitted ill-formed SSA and
//! is a bug, so messages name the offending instruction.

use crate::dom::DomTree;
use crate::function::{Function, Module, Terminator};
use crate::inst::Inst;
use crate::ty::ScalarTy;
use crate::{BlockId, InstId, Value};
use rustc_hash::FxHashMap;
use ttc_index::Idx;

/// A verification failure.
#[derive(Clone, Debug, thiserror::Error)]
pub enum VerifyError {
    /// A terminator names a block that does not exist.
    #[error("{func}: terminator of {block:?} targets unknown block {target:?}")]
    BadBranchTarget {
        /// Function name.
        func: String,
        /// The branching block.
        block: BlockId,
        /// The missing target.
        target: BlockId,
    },

    /// A block still carries the under-construction placeholder.
    #[error("{func}: block {block:?} has no terminator")]
    MissingTerminator {
        /// Function name.
        func: String,
        /// The offending block.
        block: BlockId,
    },

    /// An operand references an erased instruction.
    #[error("{func}: {user:?} references erased instruction {def:?}")]
    UseOfErased {
        /// Function name.
        func: String,
        /// The using instruction.
        user: InstId,
        /// The erased definition.
        def: InstId,
    },

    /// An operand references an instruction that is not in any block.
    #[error("{func}: {user:?} references unplaced instruction {def:?}")]
    UseOfUnplaced {
        /// Function name.
        func: String,
        /// The using instruction.
        user: InstId,
        /// The unplaced definition.
        def: InstId,
    },

    /// An argument index is out of range.
    #[error("{func}: {user:?} references argument {arg} of a {nparams}-parameter function")]
    BadArgIndex {
        /// Function name.
        func: String,
        /// The using instruction.
        user: InstId,
        /// The argument index.
        arg: u32,
        /// The parameter count.
        nparams: usize,
    },

    /// A definition does not dominate one of its uses.
    #[error("{func}: definition {def:?} does not dominate its use in {user:?}")]
    DefDoesNotDominate {
        /// Function name.
        func: String,
        /// The definition.
        def: InstId,
        /// The use site.
        user: InstId,
    },

    /// A phi's incoming blocks disagree with the block's predecessors.
    #[error("{func}: phi {phi:?} incomings do not match predecessors of {block:?}")]
    PhiPredMismatch {
        /// Function name.
        func: String,
        /// The phi.
        phi: InstId,
        /// Its block.
        block: BlockId,
    },

    /// A phi appears after a non-phi instruction.
    #[error("{func}: phi {phi:?} is not at the start of {block:?}")]
    PhiNotAtFront {
        /// Function name.
        func: String,
        /// The phi.
        phi: InstId,
        /// Its block.
        block: BlockId,
    },

    /// Binary operands have different types.
    #[error("{func}: {inst:?} mixes operand types")]
    OperandTypeMismatch {
        /// Function name.
        func: String,
        /// The offending instruction.
        inst: InstId,
    },

    /// A select condition is not `i1`.
    #[error("{func}: {inst:?} select condition is not i1")]
    BadSelectCond {
        /// Function name.
        func: String,
        /// The offending instruction.
        inst: InstId,
    },

    /// A memory operand is not a pointer.
    #[error("{func}: {inst:?} memory operand is not a pointer")]
    NotAPointer {
        /// Function name.
        func: String,
        /// The offending instruction.
        inst: InstId,
    },
}

/// Verifies every function of `module`.
///
/// # Errors
///
/// Returns the first violation found.
pub fn verify_module(module: &Module) -> Result<(), VerifyError> {
    for func in module.funcs.iter() {
        verify_function(func)?;
    }
    Ok(())
}

/// Verifies one function.
///
/// # Errors
///
/// Returns the first violation found.
pub fn verify_function(func: &Function) -> Result<(), VerifyError> {
    let name = func.name.as_str().to_owned();
    let n_blocks = func.blocks.len();

    for (block, data) in func.blocks.iter_enumerated() {
        if matches!(data.term, Terminator::Unreachable) {
            return Err(VerifyError::MissingTerminator {
                func: name.clone(),
                block,
            });
        }
        for target in data.term.succs() {
            if target.index() >= n_blocks {
                return Err(VerifyError::BadBranchTarget {
                    func: name.clone(),
                    block,
                    target,
                });
            }
        }
    }

    let dom = DomTree::compute(func);
    let positions = inst_positions(func);

    for (block, data) in func.blocks.iter_enumerated() {
        let mut seen_non_phi = false;
        for &id in &data.insts {
            let inst = &func.insts[id];
            if inst.kind.is_phi() {
                if seen_non_phi {
                    return Err(VerifyError::PhiNotAtFront {
                        func: name.clone(),
                        phi: id,
                        block,
                    });
                }
                check_phi(func, &dom, &name, block, id)?;
            } else {
                seen_non_phi = true;
                let use_pos = positions.get(&id).copied().unwrap_or(usize::MAX);
                let mut result = Ok(());
                inst.kind.for_each_operand(|v| {
                    if result.is_ok() {
                        result =
                            check_value_reaches(func, &dom, &positions, &name, id, block, v, use_pos);
                    }
                });
                result?;
            }
            check_types(func, &name, id)?;
        }

        // Terminator operands must dominate the end of the block; model
        // them as a use at an infinite position anchored at the last
        // instruction (or the block itself when empty).
        let anchor = data.insts.last().copied().unwrap_or(InstId::new(0));
        let mut result = Ok(());
        data.term.for_each_value(|v| {
            if result.is_ok() {
                result =
                    check_value_reaches(func, &dom, &positions, &name, anchor, block, v, usize::MAX);
            }
        });
        result?;
    }

    Ok(())
}

fn inst_positions(func: &Function) -> FxHashMap<InstId, usize> {
    let mut positions = FxHashMap::default();
    for block in func.blocks.iter() {
        for (i, &id) in block.insts.iter().enumerate() {
            positions.insert(id, i);
        }
    }
    positions
}

#[allow(clippy::too_many_arguments)]
fn check_value_reaches(
    func: &Function,
    dom: &DomTree,
    positions: &FxHashMap<InstId, usize>,
    name: &str,
    user: InstId,
    use_block: BlockId,
    value: &Value,
    use_pos: usize,
) -> Result<(), VerifyError> {
    match value {
        Value::Const(_) => Ok(()),
        Value::Arg(n) => {
            if (*n as usize) < func.params.len() {
                Ok(())
            } else {
                Err(VerifyError::BadArgIndex {
                    func: name.to_owned(),
                    user,
                    arg: *n,
                    nparams: func.params.len(),
                })
            }
        }
        Value::Inst(def) => {
            let data = &func.insts[*def];
            if matches!(data.kind, Inst::Erased) {
                return Err(VerifyError::UseOfErased {
                    func: name.to_owned(),
                    user,
                    def: *def,
                });
            }
            let Some(def_block) = data.block else {
                return Err(VerifyError::UseOfUnplaced {
                    func: name.to_owned(),
                    user,
                    def: *def,
                });
            };
            let dominates = if def_block == use_block {
                positions.get(def).copied().unwrap_or(usize::MAX) < use_pos
            } else {
                dom.dominates(def_block, use_block)
            };
            if dominates {
                Ok(())
            } else {
                Err(VerifyError::DefDoesNotDominate {
                    func: name.to_owned(),
                    def: *def,
                    user,
                })
            }
        }
    }
}

fn check_phi(
    func: &Function,
    dom: &DomTree,
    name: &str,
    block: BlockId,
    phi: InstId,
) -> Result<(), VerifyError> {
    let Inst::Phi { incomings } = &func.insts[phi].kind else {
        unreachable!("check_phi on non-phi");
    };

    let mut preds = func.preds(block);
    preds.sort();
    let mut incoming_blocks: Vec<BlockId> = incomings.iter().map(|(b, _)| *b).collect();
    incoming_blocks.sort();
    if preds != incoming_blocks {
        return Err(VerifyError::PhiPredMismatch {
            func: name.to_owned(),
            phi,
            block,
        });
    }

    // Each incoming value must dominate the end of its incoming block.
    for (in_block, value) in incomings {
        match value {
            Value::Const(_) => {}
            Value::Arg(n) => {
                if (*n as usize) >= func.params.len() {
                    return Err(VerifyError::BadArgIndex {
                        func: name.to_owned(),
                        user: phi,
                        arg: *n,
                        nparams: func.params.len(),
                    });
                }
            }
            Value::Inst(def) => {
                let data = &func.insts[*def];
                if matches!(data.kind, Inst::Erased) {
                    return Err(VerifyError::UseOfErased {
                        func: name.to_owned(),
                        user: phi,
                        def: *def,
                    });
                }
                let Some(def_block) = data.block else {
                    return Err(VerifyError::UseOfUnplaced {
                        func: name.to_owned(),
                        user: phi,
                        def: *def,
                    });
                };
                if !dom.dominates(def_block, *in_block) {
                    return Err(VerifyError::DefDoesNotDominate {
                        func: name.to_owned(),
                        def: *def,
                        user: phi,
                    });
                }
            }
        }
    }
    Ok(())
}

fn check_types(func: &Function, name: &str, id: InstId) -> Result<(), VerifyError> {
    match &func.insts[id].kind {
        Inst::Binary { lhs, rhs, .. } | Inst::Cmp { lhs, rhs, .. } => {
            if func.value_ty(lhs) != func.value_ty(rhs) {
                return Err(VerifyError::OperandTypeMismatch {
                    func: name.to_owned(),
                    inst: id,
                });
            }
        }
        Inst::Select {
            cond,
            then_val,
            else_val,
        } => {
            if func.value_ty(cond) != crate::Ty::Scalar(ScalarTy::I1) {
                return Err(VerifyError::BadSelectCond {
                    func: name.to_owned(),
                    inst: id,
                });
            }
            if func.value_ty(then_val) != func.value_ty(else_val) {
                return Err(VerifyError::OperandTypeMismatch {
                    func: name.to_owned(),
                    inst: id,
                });
            }
        }
        Inst::Load { ptr } => {
            if !func.value_ty(ptr).is_ptr() {
                return Err(VerifyError::NotAPointer {
                    func: name.to_owned(),
                    inst: id,
                });
            }
        }
        Inst::Store { ptr, .. } => {
            if !func.value_ty(ptr).is_ptr() {
                return Err(VerifyError::NotAPointer {
                    func: name.to_owned(),
                    inst: id,
                });
            }
        }
        Inst::MemCpy { dst, src, .. } => {
            if !func.value_ty(dst).is_ptr() || !func.value_ty(src).is_ptr() {
                return Err(VerifyError::NotAPointer {
                    func: name.to_owned(),
                    inst: id,
                });
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::Param;
    use crate::inst::BinOp;
    use crate::ty::Ty;
    use ttc_intern::Symbol;

    fn func_with_param(ty: Ty) -> Function {
        Function::new(
            Symbol::intern("f"),
            vec![Param {
                name: Symbol::intern("x"),
                ty,
            }],
            Ty::Void,
        )
    }

    #[test]
    fn test_accepts_simple_function() {
        let mut f = func_with_param(Ty::Scalar(ScalarTy::I32));
        let add = f.create_inst(
            Inst::Binary {
                op: BinOp::Add,
                lhs: Value::Arg(0),
                rhs: Value::const_i32(1),
            },
            Ty::Scalar(ScalarTy::I32),
            None,
        );
        f.append_inst(f.entry, add);
        f.set_term(f.entry, Terminator::Ret(Some(Value::Inst(add))));
        assert!(verify_function(&f).is_ok());
    }

    #[test]
    fn test_rejects_missing_terminator() {
        let f = func_with_param(Ty::Scalar(ScalarTy::I32));
        assert!(matches!(
            verify_function(&f),
            Err(VerifyError::MissingTerminator { .. })
        ));
    }

    #[test]
    fn test_rejects_use_of_erased() {
        let mut f = func_with_param(Ty::Scalar(ScalarTy::I32));
        let a = f.create_inst(
            Inst::Binary {
                op: BinOp::Add,
                lhs: Value::Arg(0),
                rhs: Value::const_i32(1),
            },
            Ty::Scalar(ScalarTy::I32),
            None,
        );
        f.append_inst(f.entry, a);
        let b = f.create_inst(
            Inst::Binary {
                op: BinOp::Add,
                lhs: Value::Inst(a),
                rhs: Value::const_i32(2),
            },
            Ty::Scalar(ScalarTy::I32),
            None,
        );
        f.append_inst(f.entry, b);
        f.set_term(f.entry, Terminator::Ret(None));
        f.erase_inst(a);
        assert!(matches!(
            verify_function(&f),
            Err(VerifyError::UseOfErased { .. })
        ));
    }

    #[test]
    fn test_rejects_type_mismatch() {
        let mut f = func_with_param(Ty::Scalar(ScalarTy::I32));
        let bad = f.create_inst(
            Inst::Binary {
                op: BinOp::Add,
                lhs: Value::Arg(0),
                rhs: Value::Const(crate::Constant::Float {
                    value: 1.0,
                    ty: ScalarTy::F32,
                }),
            },
            Ty::Scalar(ScalarTy::I32),
            None,
        );
        f.append_inst(f.entry, bad);
        f.set_term(f.entry, Terminator::Ret(None));
        assert!(matches!(
            verify_function(&f),
            Err(VerifyError::OperandTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_phi_pred_mismatch() {
        let mut f = func_with_param(Ty::Scalar(ScalarTy::I32));
        let other = f.add_block(Symbol::intern("other"));
        let phi = f.create_inst(
            Inst::Phi {
                incomings: vec![(other, Value::const_i32(0))],
            },
            Ty::Scalar(ScalarTy::I32),
            None,
        );
        f.append_inst(f.entry, phi);
        f.set_term(f.entry, Terminator::Ret(None));
        f.set_term(other, Terminator::Ret(None));
        assert!(matches!(
            verify_function(&f),
            Err(VerifyError::PhiPredMismatch { .. })
        ));
    }
}
