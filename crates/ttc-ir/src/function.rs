//! Functions, basic blocks, and terminators.
//!
//! Blocks and instructions live in arena-style [`IndexVec`]s owned by the
//! function; blocks hold an ordered list of instruction ids plus a
//! terminator. All CFG surgery the lowering needs (block splitting,
//! branch retargeting, use replacement, tombstone erasure) lives here.

use crate::constant::Constant;
use crate::inst::{Inst, InstData};
use crate::ty::Ty;
use crate::{BlockId, FuncId, InstId, IrError, Value, ValueRef};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use ttc_index::{Idx, IndexVec};
use ttc_intern::Symbol;

/// A function parameter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name.
    pub name: Symbol,
    /// Parameter type.
    pub ty: Ty,
}

/// A block terminator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Terminator {
    /// Unconditional branch.
    Br(BlockId),
    /// Two-way conditional branch.
    CondBr {
        /// The `i1` condition.
        cond: Value,
        /// Destination if true.
        then_dest: BlockId,
        /// Destination if false.
        else_dest: BlockId,
    },
    /// Function return.
    Ret(Option<Value>),
    /// Placeholder for blocks under construction.
    Unreachable,
}

impl Terminator {
    /// Successor blocks, in branch order.
    #[must_use]
    pub fn succs(&self) -> SmallVec<[BlockId; 2]> {
        match self {
            Self::Br(b) => SmallVec::from_slice(&[*b]),
            Self::CondBr {
                then_dest,
                else_dest,
                ..
            } => SmallVec::from_slice(&[*then_dest, *else_dest]),
            Self::Ret(_) | Self::Unreachable => SmallVec::new(),
        }
    }

    /// Rewrites every successor equal to `from` into `to`.
    pub fn retarget(&mut self, from: BlockId, to: BlockId) {
        match self {
            Self::Br(b) => {
                if *b == from {
                    *b = to;
                }
            }
            Self::CondBr {
                then_dest,
                else_dest,
                ..
            } => {
                if *then_dest == from {
                    *then_dest = to;
                }
                if *else_dest == from {
                    *else_dest = to;
                }
            }
            Self::Ret(_) | Self::Unreachable => {}
        }
    }

    /// Visits the value operands of this terminator mutably.
    pub fn for_each_value_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Self::CondBr { cond, .. } => f(cond),
            Self::Ret(Some(v)) => f(v),
            _ => {}
        }
    }

    /// Visits the value operands of this terminator.
    pub fn for_each_value(&self, mut f: impl FnMut(&Value)) {
        match self {
            Self::CondBr { cond, .. } => f(cond),
            Self::Ret(Some(v)) => f(v),
            _ => {}
        }
    }
}

/// A basic block.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Block label.
    pub name: Symbol,
    /// Instructions in execution order (terminator excluded).
    pub insts: Vec<InstId>,
    /// The terminator.
    pub term: Terminator,
}

/// A function in SSA form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Function {
    /// Function name.
    pub name: Symbol,
    /// Parameters.
    pub params: Vec<Param>,
    /// Return type.
    pub ret_ty: Ty,
    /// The entry block.
    pub entry: BlockId,
    /// Block storage.
    pub blocks: IndexVec<BlockId, Block>,
    /// Instruction storage. Erased slots hold [`Inst::Erased`].
    pub insts: IndexVec<InstId, InstData>,
    /// Requested unroll counts, keyed by loop header block.
    pub unroll_hints: FxHashMap<BlockId, u32>,
}

impl Function {
    /// Creates a function with an empty entry block.
    #[must_use]
    pub fn new(name: Symbol, params: Vec<Param>, ret_ty: Ty) -> Self {
        let mut blocks = IndexVec::new();
        let entry = blocks.push(Block {
            name: Symbol::intern("entry"),
            insts: Vec::new(),
            term: Terminator::Unreachable,
        });
        Self {
            name,
            params,
            ret_ty,
            entry,
            blocks,
            insts: IndexVec::new(),
            unroll_hints: FxHashMap::default(),
        }
    }

    /// Appends a new block with an `Unreachable` placeholder terminator.
    pub fn add_block(&mut self, name: Symbol) -> BlockId {
        self.blocks.push(Block {
            name,
            insts: Vec::new(),
            term: Terminator::Unreachable,
        })
    }

    /// Sets the terminator of `block`.
    pub fn set_term(&mut self, block: BlockId, term: Terminator) {
        self.blocks[block].term = term;
    }

    /// Redirects the unconditional branch of `block` to `to`, returning
    /// the previous target.
    ///
    /// # Errors
    ///
    /// Fails if `block` does not end in an unconditional branch.
    pub fn redirect_branch(&mut self, block: BlockId, to: BlockId) -> Result<BlockId, IrError> {
        match &mut self.blocks[block].term {
            Terminator::Br(dest) => {
                let old = *dest;
                *dest = to;
                Ok(old)
            }
            _ => Err(IrError::NotABranch(block)),
        }
    }

    /// Allocates an instruction slot without placing it in a block.
    pub fn create_inst(&mut self, kind: Inst, ty: Ty, name: Option<Symbol>) -> InstId {
        self.insts.push(InstData {
            kind,
            ty,
            name,
            block: None,
        })
    }

    /// Appends `inst` at the end of `block` (before the terminator).
    pub fn append_inst(&mut self, block: BlockId, inst: InstId) {
        debug_assert!(self.insts[inst].block.is_none());
        self.insts[inst].block = Some(block);
        self.blocks[block].insts.push(inst);
    }

    /// Inserts `inst` immediately before `before` in its block.
    ///
    /// # Errors
    ///
    /// Fails if `before` is not placed.
    pub fn insert_before(&mut self, before: InstId, inst: InstId) -> Result<(), IrError> {
        let block = self.insts[before].block.ok_or(IrError::Unplaced(before))?;
        let pos = self.position_in_block(block, before);
        self.insts[inst].block = Some(block);
        self.blocks[block].insts.insert(pos, inst);
        Ok(())
    }

    /// Inserts `inst` immediately after `after` in its block.
    ///
    /// # Errors
    ///
    /// Fails if `after` is not placed.
    pub fn insert_after(&mut self, after: InstId, inst: InstId) -> Result<(), IrError> {
        let block = self.insts[after].block.ok_or(IrError::Unplaced(after))?;
        let pos = self.position_in_block(block, after);
        self.insts[inst].block = Some(block);
        self.blocks[block].insts.insert(pos + 1, inst);
        Ok(())
    }

    /// The index of `inst` within its block's instruction list.
    fn position_in_block(&self, block: BlockId, inst: InstId) -> usize {
        self.blocks[block]
            .insts
            .iter()
            .position(|&i| i == inst)
            .expect("instruction not in its recorded block")
    }

    /// The index of the first non-phi instruction of `block`.
    #[must_use]
    pub fn first_non_phi_index(&self, block: BlockId) -> usize {
        self.blocks[block]
            .insts
            .iter()
            .position(|&i| !self.insts[i].kind.is_phi())
            .unwrap_or(self.blocks[block].insts.len())
    }

    /// Splits `block` at `at`: `at` and everything after it (plus the old
    /// terminator) move to a new block; the old block branches to it.
    ///
    /// Phi incomings in the moved terminator's successors are remapped
    /// from the old block to the new one.
    ///
    /// # Errors
    ///
    /// Fails if `at` is not placed.
    pub fn split_block(&mut self, at: InstId, name: Symbol) -> Result<BlockId, IrError> {
        let old_bb = self.insts[at].block.ok_or(IrError::Unplaced(at))?;
        let pos = self.position_in_block(old_bb, at);

        let new_bb = self.add_block(name);
        let moved: Vec<InstId> = self.blocks[old_bb].insts.split_off(pos);
        let old_term = std::mem::replace(&mut self.blocks[old_bb].term, Terminator::Br(new_bb));

        for &i in &moved {
            self.insts[i].block = Some(new_bb);
        }
        let succs = old_term.succs();
        self.blocks[new_bb].insts = moved;
        self.blocks[new_bb].term = old_term;

        for succ in succs {
            self.remap_phi_inputs(succ, old_bb, new_bb);
        }
        Ok(new_bb)
    }

    /// Rewrites phi incoming blocks `from -> to` in `block`.
    pub fn remap_phi_inputs(&mut self, block: BlockId, from: BlockId, to: BlockId) {
        let phis: Vec<InstId> = self.blocks[block]
            .insts
            .iter()
            .copied()
            .filter(|&i| self.insts[i].kind.is_phi())
            .collect();
        for phi in phis {
            if let Inst::Phi { incomings } = &mut self.insts[phi].kind {
                for (bb, _) in incomings.iter_mut() {
                    if *bb == from {
                        *bb = to;
                    }
                }
            }
        }
    }

    /// Adds an incoming edge to a phi.
    pub fn add_phi_incoming(&mut self, phi: InstId, block: BlockId, value: Value) {
        match &mut self.insts[phi].kind {
            Inst::Phi { incomings } => incomings.push((block, value)),
            other => panic!("add_phi_incoming on non-phi {other:?}"),
        }
    }

    /// The type of a value.
    #[must_use]
    pub fn value_ty(&self, value: &Value) -> Ty {
        match value {
            Value::Inst(id) => self.insts[*id].ty.clone(),
            Value::Arg(n) => self.params[*n as usize].ty.clone(),
            Value::Const(c) => c.ty(),
        }
    }

    /// The constant payload of a value, if it is a constant.
    #[must_use]
    pub fn value_as_const<'a>(&self, value: &'a Value) -> Option<&'a Constant> {
        value.as_const()
    }

    /// Every placed instruction that uses `value` as an operand.
    #[must_use]
    pub fn users_of(&self, value: ValueRef) -> Vec<InstId> {
        let mut users = Vec::new();
        for block in self.blocks.iter() {
            for &i in &block.insts {
                let mut uses_it = false;
                self.insts[i].kind.for_each_operand(|v| {
                    if v.as_ref() == Some(value) {
                        uses_it = true;
                    }
                });
                if uses_it {
                    users.push(i);
                }
            }
        }
        users
    }

    /// Replaces every use of `old` (in instructions and terminators) with
    /// `new`.
    pub fn replace_all_uses(&mut self, old: ValueRef, new: &Value) {
        for data in self.insts.iter_mut() {
            if data.block.is_none() {
                continue;
            }
            data.kind.for_each_operand_mut(|v| {
                if v.as_ref() == Some(old) {
                    *v = new.clone();
                }
            });
        }
        for block in self.blocks.iter_mut() {
            block.term.for_each_value_mut(|v| {
                if v.as_ref() == Some(old) {
                    *v = new.clone();
                }
            });
        }
    }

    /// Erases `inst`: removes it from its block and tombstones the slot.
    ///
    /// The caller is responsible for having removed or replaced all uses;
    /// the verifier rejects references to tombstones.
    pub fn erase_inst(&mut self, inst: InstId) {
        if let Some(block) = self.insts[inst].block.take() {
            self.blocks[block].insts.retain(|&i| i != inst);
        }
        self.insts[inst].kind = Inst::Erased;
        self.insts[inst].ty = Ty::Void;
    }

    /// Predecessors of `block`.
    #[must_use]
    pub fn preds(&self, block: BlockId) -> Vec<BlockId> {
        self.blocks
            .iter_enumerated()
            .filter(|(_, b)| b.term.succs().contains(&block))
            .map(|(id, _)| id)
            .collect()
    }

    /// The single successor of `block`, if it has exactly one.
    #[must_use]
    pub fn single_succ(&self, block: BlockId) -> Option<BlockId> {
        let succs = self.blocks[block].term.succs();
        if succs.len() == 1 {
            Some(succs[0])
        } else {
            None
        }
    }

    /// Reverse-post-order traversal of the reachable blocks.
    #[must_use]
    pub fn rpo(&self) -> Vec<BlockId> {
        let mut postorder = Vec::with_capacity(self.blocks.len());
        let mut visited = vec![false; self.blocks.len()];
        // Iterative DFS; (block, next-successor-index) frames.
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited[self.entry.index()] = true;
        loop {
            let Some(&(block, next)) = stack.last() else {
                break;
            };
            let succs = self.blocks[block].term.succs();
            if next < succs.len() {
                stack.last_mut().expect("stack non-empty").1 += 1;
                let succ = succs[next];
                if !visited[succ.index()] {
                    visited[succ.index()] = true;
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(block);
                stack.pop();
            }
        }
        postorder.reverse();
        postorder
    }

    /// Iterates the placed instructions of `block`.
    pub fn block_insts(&self, block: BlockId) -> impl Iterator<Item = InstId> + '_ {
        self.blocks[block].insts.iter().copied()
    }
}

/// A module: a named collection of functions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Module {
    /// Module name.
    pub name: Symbol,
    /// The functions.
    pub funcs: IndexVec<FuncId, Function>,
}

impl Module {
    /// Creates an empty module.
    #[must_use]
    pub fn new(name: Symbol) -> Self {
        Self {
            name,
            funcs: IndexVec::new(),
        }
    }

    /// Adds a function, returning its id.
    pub fn add_func(&mut self, func: Function) -> FuncId {
        self.funcs.push(func)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inst::BinOp;
    use crate::ty::ScalarTy;

    fn sample_function() -> Function {
        let mut f = Function::new(
            Symbol::intern("f"),
            vec![Param {
                name: Symbol::intern("x"),
                ty: Ty::Scalar(ScalarTy::I32),
            }],
            Ty::Scalar(ScalarTy::I32),
        );
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
        f
    }

    #[test]
    fn test_split_block_moves_suffix() {
        let mut f = sample_function();
        let add = f.blocks[f.entry].insts[0];
        let cont = f.split_block(add, Symbol::intern("continue")).unwrap();

        assert!(f.blocks[f.entry].insts.is_empty());
        assert_eq!(f.blocks[f.entry].term, Terminator::Br(cont));
        assert_eq!(f.blocks[cont].insts, vec![add]);
        assert_eq!(f.insts[add].block, Some(cont));
        assert!(matches!(f.blocks[cont].term, Terminator::Ret(Some(_))));
    }

    #[test]
    fn test_replace_all_uses() {
        let mut f = sample_function();
        let add = f.blocks[f.entry].insts[0];
        f.replace_all_uses(ValueRef::Inst(add), &Value::const_i32(7));
        assert_eq!(f.blocks[f.entry].term, Terminator::Ret(Some(Value::const_i32(7))));
    }

    #[test]
    fn test_erase_inst_tombstones() {
        let mut f = sample_function();
        let add = f.blocks[f.entry].insts[0];
        f.replace_all_uses(ValueRef::Inst(add), &Value::const_i32(0));
        f.erase_inst(add);
        assert!(f.blocks[f.entry].insts.is_empty());
        assert!(matches!(f.insts[add].kind, Inst::Erased));
    }

    #[test]
    fn test_rpo_linear_chain() {
        let mut f = sample_function();
        let add = f.blocks[f.entry].insts[0];
        let cont = f.split_block(add, Symbol::intern("continue")).unwrap();
        let rpo = f.rpo();
        assert_eq!(rpo, vec![f.entry, cont]);
    }

    #[test]
    fn test_users_of() {
        let mut f = sample_function();
        let add = f.blocks[f.entry].insts[0];
        let mul = f.create_inst(
            Inst::Binary {
                op: BinOp::Mul,
                lhs: Value::Inst(add),
                rhs: Value::Inst(add),
            },
            Ty::Scalar(ScalarTy::I32),
            None,
        );
        f.append_inst(f.entry, mul);
        assert_eq!(f.users_of(ValueRef::Inst(add)), vec![mul]);
    }

    #[test]
    fn test_serde_round_trip() {
        let f = sample_function();
        let json = serde_json::to_string(&f).unwrap();
        let back: Function = serde_json::from_str(&json).unwrap();
        assert_eq!(f, back);
    }
}
