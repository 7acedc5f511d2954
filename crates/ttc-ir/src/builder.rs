//! Cursor-style instruction insertion.
//!
//! [`Builder`] wraps a function and an insertion point and offers one
//! emit method per instruction kind, deriving result types from the
//! operands. Terminators are set directly on the function.

use crate::constant::Constant;
use crate::function::Function;
use crate::inst::{BinOp, CastKind, CmpOp, Inst, MathFn, TensorInst, TileInst, VecReduceOp};
use crate::ty::{ScalarTy, Ty};
use crate::{BlockId, InstId, Value};
use ttc_intern::Symbol;

/// Where the next instruction is inserted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertPt {
    /// At the end of a block, before its terminator.
    End(BlockId),
    /// Immediately before an existing instruction.
    Before(InstId),
}

/// An instruction builder positioned inside a function.
pub struct Builder<'f> {
    func: &'f mut Function,
    pt: InsertPt,
}

impl<'f> Builder<'f> {
    /// Positions a builder at the end of `block`.
    pub fn at_end(func: &'f mut Function, block: BlockId) -> Self {
        Self {
            func,
            pt: InsertPt::End(block),
        }
    }

    /// Positions a builder before `inst`.
    pub fn before(func: &'f mut Function, inst: InstId) -> Self {
        Self {
            func,
            pt: InsertPt::Before(inst),
        }
    }

    /// Moves the insertion point.
    pub fn set_point(&mut self, pt: InsertPt) {
        self.pt = pt;
    }

    /// The function being built into.
    pub fn func(&mut self) -> &mut Function {
        self.func
    }

    /// Emits `kind` with result type `ty` at the insertion point.
    pub fn emit(&mut self, kind: Inst, ty: Ty, name: Option<Symbol>) -> InstId {
        let id = self.func.create_inst(kind, ty, name);
        match self.pt {
            InsertPt::End(block) => self.func.append_inst(block, id),
            InsertPt::Before(before) => self
                .func
                .insert_before(before, id)
                .expect("insertion anchor must be placed"),
        }
        id
    }

    fn emit_value(&mut self, kind: Inst, ty: Ty, name: &str) -> Value {
        let name = if name.is_empty() {
            None
        } else {
            Some(Symbol::intern(name))
        };
        Value::Inst(self.emit(kind, ty, name))
    }

    /// A binary operation; the result type is the left operand's type.
    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value, name: &str) -> Value {
        let ty = self.func.value_ty(&lhs);
        self.emit_value(Inst::Binary { op, lhs, rhs }, ty, name)
    }

    /// A compare; scalar operands yield `i1`, vectors a vector of `i1`.
    pub fn cmp(&mut self, op: CmpOp, lhs: Value, rhs: Value, name: &str) -> Value {
        let ty = match self.func.value_ty(&lhs) {
            Ty::Vector(_, n) => Ty::Vector(ScalarTy::I1, n),
            _ => Ty::Scalar(ScalarTy::I1),
        };
        self.emit_value(Inst::Cmp { op, lhs, rhs }, ty, name)
    }

    /// A select.
    pub fn select(&mut self, cond: Value, then_val: Value, else_val: Value, name: &str) -> Value {
        let ty = self.func.value_ty(&then_val);
        self.emit_value(
            Inst::Select {
                cond,
                then_val,
                else_val,
            },
            ty,
            name,
        )
    }

    /// Extracts a lane from a vector.
    pub fn extract_element(&mut self, vec: Value, index: Value, name: &str) -> Value {
        let elem = self
            .func
            .value_ty(&vec)
            .elem_ty()
            .expect("extractelement from non-vector");
        self.emit_value(Inst::ExtractElement { vec, index }, Ty::Scalar(elem), name)
    }

    /// Inserts a lane into a vector.
    pub fn insert_element(&mut self, vec: Value, elem: Value, index: Value, name: &str) -> Value {
        let ty = self.func.value_ty(&vec);
        self.emit_value(Inst::InsertElement { vec, elem, index }, ty, name)
    }

    /// A two-input lane shuffle; the result length is the mask length.
    pub fn shuffle(&mut self, a: Value, b: Value, mask: Vec<u32>, name: &str) -> Value {
        let elem = self
            .func
            .value_ty(&a)
            .elem_ty()
            .expect("shufflevector of non-vector");
        let ty = Ty::Vector(elem, mask.len() as u32);
        self.emit_value(Inst::ShuffleVector { a, b, mask }, ty, name)
    }

    /// Extracts `len` consecutive lanes of `vec` starting at `start`.
    pub fn subvector(&mut self, vec: Value, start: u32, len: u32, name: &str) -> Value {
        let undef = Value::Const(Constant::Undef(self.func.value_ty(&vec)));
        let mask = (start..start + len).collect();
        self.shuffle(vec, undef, mask, name)
    }

    /// Splats a scalar across `lanes` lanes (insert + zero-mask shuffle).
    pub fn splat(&mut self, scalar: Value, lanes: u32, name: &str) -> Value {
        let elem = match self.func.value_ty(&scalar) {
            Ty::Scalar(s) => s,
            other => panic!("splat of non-scalar {other:?}"),
        };
        let undef = Value::Const(Constant::Undef(Ty::Vector(elem, lanes)));
        let seeded = self.insert_element(
            undef.clone(),
            scalar,
            Value::const_i32(0),
            "broadcast.insert",
        );
        self.shuffle(seeded, undef, vec![0; lanes as usize], name)
    }

    /// Pointer arithmetic in units of `elem_ty`.
    pub fn gep(&mut self, elem_ty: ScalarTy, base: Value, index: Value, name: &str) -> Value {
        self.emit_value(
            Inst::Gep {
                elem_ty,
                base,
                index,
            },
            Ty::ptr_to(Ty::Scalar(elem_ty)),
            name,
        )
    }

    /// A load; the result type is the pointee of `ptr`.
    pub fn load(&mut self, ptr: Value, name: &str) -> Value {
        let ty = self
            .func
            .value_ty(&ptr)
            .pointee()
            .expect("load from non-pointer")
            .clone();
        self.emit_value(Inst::Load { ptr }, ty, name)
    }

    /// A store.
    pub fn store(&mut self, value: Value, ptr: Value) {
        self.emit(Inst::Store { value, ptr }, Ty::Void, None);
    }

    /// A pointer cast to `to` (which must be a pointer type).
    pub fn ptr_cast(&mut self, value: Value, to: Ty, name: &str) -> Value {
        debug_assert!(to.is_ptr());
        self.emit_value(
            Inst::Cast {
                kind: CastKind::PtrCast,
                value,
            },
            to,
            name,
        )
    }

    /// Signed integer to float conversion.
    pub fn si_to_fp(&mut self, value: Value, to: ScalarTy, name: &str) -> Value {
        debug_assert!(to.is_float());
        self.emit_value(
            Inst::Cast {
                kind: CastKind::SiToFp,
                value,
            },
            Ty::Scalar(to),
            name,
        )
    }

    /// Float to signed integer conversion.
    pub fn fp_to_si(&mut self, value: Value, to: ScalarTy, name: &str) -> Value {
        debug_assert!(to.is_int());
        self.emit_value(
            Inst::Cast {
                kind: CastKind::FpToSi,
                value,
            },
            Ty::Scalar(to),
            name,
        )
    }

    /// A heap allocation of `count` elements of `elem_ty`.
    pub fn heap_alloc(&mut self, elem_ty: ScalarTy, count: u32, name: &str) -> InstId {
        let name = if name.is_empty() {
            None
        } else {
            Some(Symbol::intern(name))
        };
        self.emit(
            Inst::HeapAlloc { elem_ty, count },
            Ty::ptr_to(Ty::Scalar(elem_ty)),
            name,
        )
    }

    /// A byte copy between buffers.
    pub fn memcpy(&mut self, dst: Value, src: Value, bytes: Value) {
        self.emit(Inst::MemCpy { dst, src, bytes }, Ty::Void, None);
    }

    /// A scalar math intrinsic call.
    pub fn math(&mut self, fun: MathFn, arg: Value, name: &str) -> Value {
        let ty = self.func.value_ty(&arg);
        self.emit_value(Inst::Math { fun, arg }, ty, name)
    }

    /// A horizontal vector reduction to scalar.
    pub fn vec_reduce(&mut self, op: VecReduceOp, vec: Value, name: &str) -> Value {
        let elem = self
            .func
            .value_ty(&vec)
            .elem_ty()
            .expect("vector.reduce of non-vector");
        self.emit_value(Inst::VecReduce { op, vec }, Ty::Scalar(elem), name)
    }

    /// A phi of type `ty` with the given incomings.
    pub fn phi(&mut self, ty: Ty, incomings: Vec<(BlockId, Value)>, name: &str) -> InstId {
        let name = if name.is_empty() {
            None
        } else {
            Some(Symbol::intern(name))
        };
        self.emit(Inst::Phi { incomings }, ty, name)
    }

    /// A tensor intrinsic with result type `ty`.
    pub fn tensor(&mut self, inst: TensorInst, ty: Ty, name: &str) -> InstId {
        let name = if name.is_empty() {
            None
        } else {
            Some(Symbol::intern(name))
        };
        self.emit(Inst::Tensor(inst), ty, name)
    }

    /// A 2-D tile intrinsic with result type `ty`.
    pub fn tile(&mut self, inst: TileInst, ty: Ty, name: &str) -> Value {
        self.emit_value(Inst::Tile(inst), ty, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{Param, Terminator};

    fn empty_func() -> Function {
        Function::new(
            Symbol::intern("t"),
            vec![Param {
                name: Symbol::intern("v"),
                ty: Ty::Vector(ScalarTy::I32, 4),
            }],
            Ty::Void,
        )
    }

    #[test]
    fn test_binary_type_propagation() {
        let mut f = empty_func();
        let entry = f.entry;
        let mut b = Builder::at_end(&mut f, entry);
        let v = b.binary(BinOp::Add, Value::Arg(0), Value::Arg(0), "sum");
        assert_eq!(f.value_ty(&v), Ty::Vector(ScalarTy::I32, 4));
    }

    #[test]
    fn test_subvector_mask() {
        let mut f = empty_func();
        let entry = f.entry;
        let mut b = Builder::at_end(&mut f, entry);
        let v = b.subvector(Value::Arg(0), 2, 2, "block");
        let Value::Inst(id) = v else { panic!() };
        match &f.insts[id].kind {
            Inst::ShuffleVector { mask, .. } => assert_eq!(mask, &vec![2, 3]),
            other => panic!("expected shuffle, got {other:?}"),
        }
        assert_eq!(f.value_ty(&v), Ty::Vector(ScalarTy::I32, 2));
    }

    #[test]
    fn test_splat_shape() {
        let mut f = empty_func();
        let entry = f.entry;
        let mut b = Builder::at_end(&mut f, entry);
        let s = b.splat(Value::const_i32(3), 8, "broadcast");
        assert_eq!(f.value_ty(&s), Ty::Vector(ScalarTy::I32, 8));
    }

    #[test]
    fn test_insert_before_anchor() {
        let mut f = empty_func();
        let entry = f.entry;
        let mut b = Builder::at_end(&mut f, entry);
        let first = b.binary(BinOp::Add, Value::Arg(0), Value::Arg(0), "");
        let Value::Inst(first_id) = first else {
            panic!()
        };
        let mut b = Builder::before(&mut f, first_id);
        b.binary(BinOp::Mul, Value::Arg(0), Value::Arg(0), "");
        assert_eq!(f.blocks[entry].insts.len(), 2);
        assert_eq!(f.blocks[entry].insts[1], first_id);
        f.set_term(entry, Terminator::Ret(None));
    }
}
