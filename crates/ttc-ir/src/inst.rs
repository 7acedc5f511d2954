//! Instructions.
//!
//! Instructions split into three families:
//!
//! 1. the plain scalar/vector/memory operations the lowering **emits**
//!    (arithmetic, compares, shuffles, GEP/load/store, casts, heap
//!    allocation, scalar math intrinsics, vector reductions, PHIs);
//! 2. the tensor intrinsics the lowering **consumes** and erases
//!    ([`TensorInst`]);
//! 3. the optional 2-D tile-register intrinsics ([`TileInst`]).

use crate::{BlockId, Value};
use crate::ty::{ScalarTy, Ty};
use serde::{Deserialize, Serialize};
use ttc_intern::Symbol;

/// Binary operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinOp {
    /// Integer addition.
    Add,
    /// Integer subtraction.
    Sub,
    /// Integer multiplication.
    Mul,
    /// Floating-point addition.
    FAdd,
    /// Floating-point subtraction.
    FSub,
    /// Floating-point multiplication.
    FMul,
    /// Floating-point division.
    FDiv,
    /// Bitwise AND.
    And,
    /// Bitwise OR.
    Or,
    /// Bitwise XOR.
    Xor,
}

impl BinOp {
    /// The add of the given element type.
    #[must_use]
    pub fn add_for(ty: ScalarTy) -> Self {
        if ty.is_float() {
            Self::FAdd
        } else {
            Self::Add
        }
    }

    /// The mul of the given element type.
    #[must_use]
    pub fn mul_for(ty: ScalarTy) -> Self {
        if ty.is_float() {
            Self::FMul
        } else {
            Self::Mul
        }
    }
}

/// Compare predicates (integer and ordered/unordered float).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    /// Integer equal.
    Eq,
    /// Integer not equal.
    Ne,
    /// Signed less than.
    SLt,
    /// Signed less than or equal.
    SLe,
    /// Signed greater than.
    SGt,
    /// Signed greater than or equal.
    SGe,
    /// Float ordered less than.
    OLt,
    /// Float ordered greater than.
    OGt,
    /// Float ordered greater than or equal.
    OGe,
    /// Float unordered greater than or equal (true on NaN).
    FUGe,
}

impl CmpOp {
    /// Returns true for the floating-point predicates.
    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::OLt | Self::OGt | Self::OGe | Self::FUGe)
    }
}

/// Cast kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CastKind {
    /// Pointer-to-pointer cast (retyping a buffer pointer).
    PtrCast,
    /// Signed integer to floating point.
    SiToFp,
    /// Floating point to signed integer.
    FpToSi,
}

/// Scalar math intrinsics the lowering emits for elementwise kernels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MathFn {
    /// e^x.
    Exp,
    /// 2^x.
    Exp2,
    /// Natural logarithm.
    Log,
    /// Base-2 logarithm.
    Log2,
    /// Base-10 logarithm.
    Log10,
    /// Square root.
    Sqrt,
    /// Sine.
    Sin,
    /// Cosine.
    Cos,
    /// Round towards negative infinity.
    Floor,
    /// Round towards positive infinity.
    Ceil,
    /// Absolute value.
    Fabs,
}

/// Horizontal vector reductions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VecReduceOp {
    /// Integer sum.
    Add,
    /// Integer product.
    Mul,
    /// Bitwise AND.
    And,
    /// Bitwise OR.
    Or,
    /// Bitwise XOR.
    Xor,
    /// Float sum.
    FAdd,
    /// Float product.
    FMul,
    /// Signed maximum.
    SMax,
    /// Signed minimum.
    SMin,
    /// Float maximum.
    FMax,
    /// Float minimum.
    FMin,
}

/// The elementwise tensor intrinsic family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElemOp {
    /// max(0, x).
    Relu,
    /// Hyperbolic tangent.
    Tanh,
    /// Logistic function.
    Sigmoid,
    /// Sine.
    Sin,
    /// Cosine.
    Cos,
    /// e^x.
    Exp,
    /// 2^x.
    Exp2,
    /// Natural logarithm.
    Log,
    /// Base-2 logarithm.
    Log2,
    /// Base-10 logarithm.
    Log10,
    /// Square root.
    Sqrt,
    /// Absolute value.
    Fabs,
    /// Round down.
    Floor,
    /// Round up.
    Ceil,
}

impl ElemOp {
    /// The intrinsic name, as spelled in knob files and dumps.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Relu => "tensor_relu",
            Self::Tanh => "tensor_tanh",
            Self::Sigmoid => "tensor_sigmoid",
            Self::Sin => "tensor_sin",
            Self::Cos => "tensor_cos",
            Self::Exp => "tensor_exp",
            Self::Exp2 => "tensor_exp2",
            Self::Log => "tensor_log",
            Self::Log2 => "tensor_log2",
            Self::Log10 => "tensor_log10",
            Self::Sqrt => "tensor_sqrt",
            Self::Fabs => "tensor_fabs",
            Self::Floor => "tensor_floor",
            Self::Ceil => "tensor_ceil",
        }
    }

    /// Returns true for operations defined on floats only; integer inputs
    /// are converted before evaluation.
    #[must_use]
    pub fn requires_float(self) -> bool {
        !matches!(self, Self::Relu)
    }
}

/// Sliding-window reduction operators.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    /// Maximum.
    Max,
    /// Minimum.
    Min,
    /// Bitwise AND.
    And,
    /// Bitwise OR.
    Or,
    /// Bitwise XOR.
    Xor,
    /// Sum.
    Add,
    /// Product.
    Mul,
}

impl ReduceKind {
    /// The intrinsic name, as spelled in knob files and dumps.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Max => "tensor_reduce_max",
            Self::Min => "tensor_reduce_min",
            Self::And => "tensor_reduce_and",
            Self::Or => "tensor_reduce_or",
            Self::Xor => "tensor_reduce_xor",
            Self::Add => "tensor_reduce_add",
            Self::Mul => "tensor_reduce_mul",
        }
    }
}

/// The consumed tensor intrinsics.
///
/// `typeinfo` binds shape/layout/padding constant vectors to a tensor
/// value; the rest are the opaque tensor operations lowered into loop
/// nests. All are erased by the time lowering completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TensorInst {
    /// Binds (shape, layout, padding) to `value`.
    TypeInfo {
        /// The annotated tensor value (or a pointer it was stored
        /// through).
        value: Value,
        /// Constant shape vector.
        shape: Value,
        /// Constant layout vector.
        layout: Value,
        /// Constant padding vector.
        padding: Value,
    },
    /// An elementwise map over the tensor.
    Elementwise {
        /// The scalar operator.
        op: ElemOp,
        /// The input tensor.
        input: Value,
    },
    /// Fills a tensor with a scalar.
    Broadcast {
        /// A tensor value fixing the output type.
        input: Value,
        /// The scalar to splat.
        scalar: Value,
    },
    /// 2-D or batched matrix product.
    Matmul {
        /// Left operand.
        lhs: Value,
        /// Right operand.
        rhs: Value,
    },
    /// Swaps the last two axes.
    Transpose {
        /// The input tensor.
        input: Value,
    },
    /// Sliding-window reduction.
    Reduce {
        /// The reduction operator.
        kind: ReduceKind,
        /// Constant window-shape vector.
        window: Value,
        /// Constant window-strides vector.
        strides: Value,
        /// The input tensor.
        input: Value,
    },
}

impl TensorInst {
    /// The intrinsic name, as spelled in knob files and dumps.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::TypeInfo { .. } => "tensor_typeinfo",
            Self::Elementwise { op, .. } => op.name(),
            Self::Broadcast { .. } => "tensor_broadcast",
            Self::Matmul { .. } => "tensor_matmul",
            Self::Transpose { .. } => "tensor_transpose",
            Self::Reduce { kind, .. } => kind.name(),
        }
    }
}

/// The optional 2-D tile-register intrinsics.
///
/// These operate on fixed 2-D register tiles carried as flat vectors;
/// the tensor analysis registers types for their outputs so the usual
/// type-propagation invariants hold.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TileInst {
    /// Loads a `rows x cols` tile from `ptr` with a row stride.
    Load {
        /// Base pointer of the tile's first element.
        ptr: Value,
        /// Tile rows.
        rows: u32,
        /// Tile columns.
        cols: u32,
        /// Distance in elements between consecutive tile rows.
        stride: Value,
    },
    /// Tile matrix-multiply-accumulate: `acc + a * b`.
    Mma {
        /// Left tile.
        a: Value,
        /// Right tile.
        b: Value,
        /// Accumulator tile.
        acc: Value,
    },
    /// Stores a `rows x cols` tile to `ptr` with a row stride.
    Store {
        /// The tile value.
        tile: Value,
        /// Destination pointer.
        ptr: Value,
        /// Tile rows.
        rows: u32,
        /// Tile columns.
        cols: u32,
        /// Distance in elements between consecutive tile rows.
        stride: Value,
    },
}

impl TileInst {
    /// The intrinsic name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Load { .. } => "tensor_load",
            Self::Mma { .. } => "tensor_mma",
            Self::Store { .. } => "tensor_store",
        }
    }
}

/// An instruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Inst {
    /// A binary operation.
    Binary {
        /// The operator.
        op: BinOp,
        /// Left operand.
        lhs: Value,
        /// Right operand.
        rhs: Value,
    },
    /// A compare, producing `i1` (or a vector of `i1`).
    Cmp {
        /// The predicate.
        op: CmpOp,
        /// Left operand.
        lhs: Value,
        /// Right operand.
        rhs: Value,
    },
    /// Conditional select.
    Select {
        /// The `i1` condition.
        cond: Value,
        /// Value if true.
        then_val: Value,
        /// Value if false.
        else_val: Value,
    },
    /// Extracts a lane from a vector.
    ExtractElement {
        /// The vector.
        vec: Value,
        /// The lane index.
        index: Value,
    },
    /// Inserts a lane into a vector.
    InsertElement {
        /// The vector.
        vec: Value,
        /// The new lane value.
        elem: Value,
        /// The lane index.
        index: Value,
    },
    /// Lane shuffle of two vectors by a constant mask.
    ShuffleVector {
        /// First input vector.
        a: Value,
        /// Second input vector (lanes indexed from `a.len()`).
        b: Value,
        /// The lane selection mask.
        mask: Vec<u32>,
    },
    /// Pointer arithmetic: `base + index` in units of `elem_ty`.
    Gep {
        /// Element type the index is scaled by.
        elem_ty: ScalarTy,
        /// Base pointer.
        base: Value,
        /// Element index.
        index: Value,
    },
    /// Loads a value from memory.
    Load {
        /// The pointer.
        ptr: Value,
    },
    /// Stores a value to memory.
    Store {
        /// The value to store.
        value: Value,
        /// The pointer.
        ptr: Value,
    },
    /// A cast.
    Cast {
        /// The cast kind.
        kind: CastKind,
        /// The operand.
        value: Value,
    },
    /// Heap allocation of `count` elements of `elem_ty`.
    HeapAlloc {
        /// The element type.
        elem_ty: ScalarTy,
        /// The element count.
        count: u32,
    },
    /// Byte copy between buffers.
    MemCpy {
        /// Destination pointer.
        dst: Value,
        /// Source pointer.
        src: Value,
        /// Byte count.
        bytes: Value,
    },
    /// A scalar math intrinsic call.
    Math {
        /// The function.
        fun: MathFn,
        /// The operand.
        arg: Value,
    },
    /// A horizontal vector reduction.
    VecReduce {
        /// The reduction operator.
        op: VecReduceOp,
        /// The vector operand.
        vec: Value,
    },
    /// An SSA phi.
    Phi {
        /// `(predecessor, value)` incomings.
        incomings: Vec<(BlockId, Value)>,
    },
    /// A tensor intrinsic (consumed by lowering).
    Tensor(TensorInst),
    /// A 2-D tile intrinsic.
    Tile(TileInst),
    /// A tombstone left by erasure. Referencing one is a verifier error.
    Erased,
}

impl Inst {
    /// Visits every value operand.
    pub fn for_each_operand(&self, mut f: impl FnMut(&Value)) {
        let mut this = self.clone();
        this.for_each_operand_mut(|v| f(v));
    }

    /// Visits every value operand mutably.
    pub fn for_each_operand_mut(&mut self, mut f: impl FnMut(&mut Value)) {
        match self {
            Inst::Binary { lhs, rhs, .. } | Inst::Cmp { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            Inst::Select {
                cond,
                then_val,
                else_val,
            } => {
                f(cond);
                f(then_val);
                f(else_val);
            }
            Inst::ExtractElement { vec, index } => {
                f(vec);
                f(index);
            }
            Inst::InsertElement { vec, elem, index } => {
                f(vec);
                f(elem);
                f(index);
            }
            Inst::ShuffleVector { a, b, .. } => {
                f(a);
                f(b);
            }
            Inst::Gep { base, index, .. } => {
                f(base);
                f(index);
            }
            Inst::Load { ptr } => f(ptr),
            Inst::Store { value, ptr } => {
                f(value);
                f(ptr);
            }
            Inst::Cast { value, .. } => f(value),
            Inst::HeapAlloc { .. } | Inst::Erased => {}
            Inst::MemCpy { dst, src, bytes } => {
                f(dst);
                f(src);
                f(bytes);
            }
            Inst::Math { arg, .. } => f(arg),
            Inst::VecReduce { vec, .. } => f(vec),
            Inst::Phi { incomings } => {
                for (_, v) in incomings.iter_mut() {
                    f(v);
                }
            }
            Inst::Tensor(t) => match t {
                TensorInst::TypeInfo {
                    value,
                    shape,
                    layout,
                    padding,
                } => {
                    f(value);
                    f(shape);
                    f(layout);
                    f(padding);
                }
                TensorInst::Elementwise { input, .. } | TensorInst::Transpose { input } => f(input),
                TensorInst::Broadcast { input, scalar } => {
                    f(input);
                    f(scalar);
                }
                TensorInst::Matmul { lhs, rhs } => {
                    f(lhs);
                    f(rhs);
                }
                TensorInst::Reduce {
                    window,
                    strides,
                    input,
                    ..
                } => {
                    f(window);
                    f(strides);
                    f(input);
                }
            },
            Inst::Tile(t) => match t {
                TileInst::Load { ptr, stride, .. } => {
                    f(ptr);
                    f(stride);
                }
                TileInst::Mma { a, b, acc } => {
                    f(a);
                    f(b);
                    f(acc);
                }
                TileInst::Store {
                    tile, ptr, stride, ..
                } => {
                    f(tile);
                    f(ptr);
                    f(stride);
                }
            },
        }
    }

    /// Returns true for phi instructions.
    #[must_use]
    pub fn is_phi(&self) -> bool {
        matches!(self, Inst::Phi { .. })
    }

    /// Returns true for tensor intrinsics.
    #[must_use]
    pub fn is_tensor(&self) -> bool {
        matches!(self, Inst::Tensor(_))
    }

    /// The opcode mnemonic used by the printer.
    #[must_use]
    pub fn opcode(&self) -> &'static str {
        match self {
            Inst::Binary { op, .. } => match op {
                BinOp::Add => "add",
                BinOp::Sub => "sub",
                BinOp::Mul => "mul",
                BinOp::FAdd => "fadd",
                BinOp::FSub => "fsub",
                BinOp::FMul => "fmul",
                BinOp::FDiv => "fdiv",
                BinOp::And => "and",
                BinOp::Or => "or",
                BinOp::Xor => "xor",
            },
            Inst::Cmp { op, .. } => {
                if op.is_float() {
                    "fcmp"
                } else {
                    "icmp"
                }
            }
            Inst::Select { .. } => "select",
            Inst::ExtractElement { .. } => "extractelement",
            Inst::InsertElement { .. } => "insertelement",
            Inst::ShuffleVector { .. } => "shufflevector",
            Inst::Gep { .. } => "getelementptr",
            Inst::Load { .. } => "load",
            Inst::Store { .. } => "store",
            Inst::Cast { kind, .. } => match kind {
                CastKind::PtrCast => "ptrcast",
                CastKind::SiToFp => "sitofp",
                CastKind::FpToSi => "fptosi",
            },
            Inst::HeapAlloc { .. } => "heap.alloc",
            Inst::MemCpy { .. } => "memcpy",
            Inst::Math { .. } => "call.math",
            Inst::VecReduce { .. } => "vector.reduce",
            Inst::Phi { .. } => "phi",
            Inst::Tensor(t) => t.name(),
            Inst::Tile(t) => t.name(),
            Inst::Erased => "<erased>",
        }
    }
}

/// An instruction slot: the operation, its result type, an optional name,
/// and the block it is placed in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstData {
    /// The operation.
    pub kind: Inst,
    /// The result type (`Void` for non-value instructions).
    pub ty: Ty,
    /// Optional name, used for knob instance naming and dumps.
    pub name: Option<Symbol>,
    /// The containing block, if placed.
    pub block: Option<BlockId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_walk_matches_mut_walk() {
        let inst = Inst::Select {
            cond: Value::const_i32(1),
            then_val: Value::Arg(0),
            else_val: Value::Arg(1),
        };
        let mut seen = 0;
        inst.for_each_operand(|_| seen += 1);
        assert_eq!(seen, 3);
    }

    #[test]
    fn test_tensor_names() {
        let mm = TensorInst::Matmul {
            lhs: Value::Arg(0),
            rhs: Value::Arg(1),
        };
        assert_eq!(mm.name(), "tensor_matmul");
        assert_eq!(ElemOp::Relu.name(), "tensor_relu");
        assert_eq!(ReduceKind::Max.name(), "tensor_reduce_max");
    }

    #[test]
    fn test_elem_op_float_requirement() {
        assert!(!ElemOp::Relu.requires_float());
        assert!(ElemOp::Tanh.requires_float());
        assert!(ElemOp::Exp.requires_float());
    }
}
