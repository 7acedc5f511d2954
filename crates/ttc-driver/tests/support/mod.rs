//! Test support: a reference evaluator for lowered IR, plus small
//! module-building helpers.
//!
//! The evaluator executes functions directly — branches, PHIs, heap
//! buffers, vector ops — so the integration tests check the lowered
//! loop nests by running them, not by inspecting shapes.

use rustc_hash::FxHashMap;
use ttc_intern::Symbol;
use ttc_ir::{
    BinOp, BlockId, Builder, CastKind, CmpOp, Constant, Function, Inst, InstId, MathFn, Param,
    ScalarTy, TensorInst, Terminator, TileInst, Ty, Value, VecReduceOp,
};

/// A runtime scalar.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Scalar {
    /// Integer lanes (also booleans).
    Int(i64),
    /// Float lanes.
    Float(f64),
}

impl Scalar {
    fn as_int(self) -> i64 {
        match self {
            Scalar::Int(v) => v,
            Scalar::Float(v) => v as i64,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Scalar::Int(v) => v as f64,
            Scalar::Float(v) => v,
        }
    }
}

/// A runtime value.
#[derive(Clone, Debug, PartialEq)]
pub enum RtVal {
    /// A scalar.
    Scalar(Scalar),
    /// A vector of lanes.
    Vector(Vec<Scalar>),
    /// A pointer into a heap buffer, in element units.
    Ptr {
        /// Buffer index.
        buf: usize,
        /// Element offset.
        off: usize,
    },
}

impl RtVal {
    fn scalar(&self) -> Scalar {
        match self {
            RtVal::Scalar(s) => *s,
            other => panic!("expected scalar, got {other:?}"),
        }
    }

    fn lanes(&self) -> &[Scalar] {
        match self {
            RtVal::Vector(v) => v,
            other => panic!("expected vector, got {other:?}"),
        }
    }

    fn ptr(&self) -> (usize, usize) {
        match self {
            RtVal::Ptr { buf, off } => (*buf, *off),
            other => panic!("expected pointer, got {other:?}"),
        }
    }
}

/// Builds an integer vector value.
pub fn ivec(vals: &[i64]) -> RtVal {
    RtVal::Vector(vals.iter().map(|&v| Scalar::Int(v)).collect())
}

/// Builds a float vector value.
pub fn fvec(vals: &[f64]) -> RtVal {
    RtVal::Vector(vals.iter().map(|&v| Scalar::Float(v)).collect())
}

/// Reads integer lanes out of a vector result.
pub fn as_ints(v: &RtVal) -> Vec<i64> {
    v.lanes().iter().map(|s| s.as_int()).collect()
}

/// Reads float lanes out of a vector result.
pub fn as_floats(v: &RtVal) -> Vec<f64> {
    v.lanes().iter().map(|s| s.as_f64()).collect()
}

struct HeapBuffer {
    elem_bytes: u32,
    data: Vec<Scalar>,
}

const STEP_LIMIT: usize = 10_000_000;

/// Executes `func` with the given argument values and returns the
/// `ret` value (unit functions return an empty vector).
pub fn eval_function(func: &Function, args: &[RtVal]) -> RtVal {
    let mut env: FxHashMap<InstId, RtVal> = FxHashMap::default();
    let mut heap: Vec<HeapBuffer> = Vec::new();

    let mut block = func.entry;
    let mut prev: Option<BlockId> = None;
    let mut steps = 0usize;

    loop {
        // PHIs read their incomings simultaneously on block entry.
        let phi_updates: Vec<(InstId, RtVal)> = func
            .block_insts(block)
            .filter_map(|id| match &func.insts[id].kind {
                Inst::Phi { incomings } => {
                    let from = prev.expect("phi in entry block");
                    let (_, value) = incomings
                        .iter()
                        .find(|(b, _)| *b == from)
                        .expect("phi has an incoming for the taken edge");
                    Some((id, eval(func, &env, args, value)))
                }
                _ => None,
            })
            .collect();
        for (id, v) in phi_updates {
            env.insert(id, v);
        }

        for id in func.block_insts(block).collect::<Vec<_>>() {
            steps += 1;
            assert!(steps < STEP_LIMIT, "evaluator step limit exceeded");
            if func.insts[id].kind.is_phi() {
                continue;
            }
            exec_inst(func, &mut env, &mut heap, args, id);
        }

        match &func.blocks[block].term {
            Terminator::Br(next) => {
                prev = Some(block);
                block = *next;
            }
            Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            } => {
                let taken = eval(func, &env, args, cond).scalar().as_int() != 0;
                prev = Some(block);
                block = if taken { *then_dest } else { *else_dest };
            }
            Terminator::Ret(v) => {
                return v
                    .as_ref()
                    .map_or(RtVal::Vector(Vec::new()), |v| eval(func, &env, args, v));
            }
            Terminator::Unreachable => panic!("executed unreachable terminator"),
        }
    }
}

#[allow(clippy::too_many_lines)]
fn exec_inst(
    func: &Function,
    env: &mut FxHashMap<InstId, RtVal>,
    heap: &mut Vec<HeapBuffer>,
    args: &[RtVal],
    id: InstId,
) {
    let ev =
        |env: &FxHashMap<InstId, RtVal>, _heap: &Vec<HeapBuffer>, v: &Value| eval(func, env, args, v);
    let kind = func.insts[id].kind.clone();
    let result: Option<RtVal> = match &kind {
        Inst::Binary { op, lhs, rhs } => {
            let l = ev(env, heap, lhs);
            let r = ev(env, heap, rhs);
            Some(zip(&l, &r, |a, b| binop(*op, a, b)))
        }
        Inst::Cmp { op, lhs, rhs } => {
            let l = ev(env, heap, lhs);
            let r = ev(env, heap, rhs);
            Some(zip(&l, &r, |a, b| Scalar::Int(i64::from(cmp(*op, a, b)))))
        }
        Inst::Select {
            cond,
            then_val,
            else_val,
        } => {
            let c = ev(env, heap, cond).scalar().as_int() != 0;
            Some(if c {
                ev(env, heap, then_val)
            } else {
                ev(env, heap, else_val)
            })
        }
        Inst::ExtractElement { vec, index } => {
            let v = ev(env, heap, vec);
            let i = ev(env, heap, index).scalar().as_int() as usize;
            Some(RtVal::Scalar(v.lanes()[i]))
        }
        Inst::InsertElement { vec, elem, index } => {
            let mut v = ev(env, heap, vec).lanes().to_vec();
            let e = ev(env, heap, elem).scalar();
            let i = ev(env, heap, index).scalar().as_int() as usize;
            v[i] = e;
            Some(RtVal::Vector(v))
        }
        Inst::ShuffleVector { a, b, mask } => {
            let av = ev(env, heap, a).lanes().to_vec();
            let bv = ev(env, heap, b).lanes().to_vec();
            let out = mask
                .iter()
                .map(|&m| {
                    let m = m as usize;
                    if m < av.len() {
                        av[m]
                    } else {
                        bv[m - av.len()]
                    }
                })
                .collect();
            Some(RtVal::Vector(out))
        }
        Inst::Gep { base, index, .. } => {
            let (buf, off) = ev(env, heap, base).ptr();
            let i = ev(env, heap, index).scalar().as_int();
            Some(RtVal::Ptr {
                buf,
                off: (off as i64 + i) as usize,
            })
        }
        Inst::Load { ptr } => {
            let (buf, off) = ev(env, heap, ptr).ptr();
            let data = &heap[buf].data;
            Some(match &func.insts[id].ty {
                Ty::Vector(_, n) => {
                    RtVal::Vector(data[off..off + *n as usize].to_vec())
                }
                _ => RtVal::Scalar(data[off]),
            })
        }
        Inst::Store { value, ptr } => {
            let v = ev(env, heap, value);
            let (buf, off) = ev(env, heap, ptr).ptr();
            match v {
                RtVal::Scalar(s) => heap[buf].data[off] = s,
                RtVal::Vector(lanes) => {
                    heap[buf].data[off..off + lanes.len()].copy_from_slice(&lanes);
                }
                RtVal::Ptr { .. } => panic!("storing a pointer"),
            }
            None
        }
        Inst::Cast { kind, value } => {
            let v = ev(env, heap, value);
            Some(match kind {
                CastKind::PtrCast => v,
                CastKind::SiToFp => map(&v, |s| Scalar::Float(s.as_int() as f64)),
                CastKind::FpToSi => map(&v, |s| Scalar::Int(s.as_f64() as i64)),
            })
        }
        Inst::HeapAlloc { elem_ty, count } => {
            let fill = if elem_ty.is_float() {
                Scalar::Float(0.0)
            } else {
                Scalar::Int(0)
            };
            heap.push(HeapBuffer {
                elem_bytes: elem_ty.bytes(),
                data: vec![fill; *count as usize],
            });
            Some(RtVal::Ptr {
                buf: heap.len() - 1,
                off: 0,
            })
        }
        Inst::MemCpy { dst, src, bytes } => {
            let (db, doff) = ev(env, heap, dst).ptr();
            let (sb, soff) = ev(env, heap, src).ptr();
            let nbytes = ev(env, heap, bytes).scalar().as_int() as u32;
            assert_eq!(
                heap[sb].elem_bytes, heap[db].elem_bytes,
                "memcpy between different element widths"
            );
            let elems = (nbytes / heap[sb].elem_bytes) as usize;
            let copied: Vec<Scalar> = heap[sb].data[soff..soff + elems].to_vec();
            heap[db].data[doff..doff + elems].copy_from_slice(&copied);
            None
        }
        Inst::Math { fun, arg } => {
            let v = ev(env, heap, arg);
            Some(map(&v, |s| Scalar::Float(mathfn(*fun, s.as_f64()))))
        }
        Inst::VecReduce { op, vec } => {
            let v = ev(env, heap, vec);
            Some(RtVal::Scalar(vec_reduce(*op, v.lanes())))
        }
        Inst::Tile(TileInst::Load { ptr, rows, cols, stride }) => {
            let (buf, off) = ev(env, heap, ptr).ptr();
            let stride = ev(env, heap, stride).scalar().as_int() as usize;
            let mut lanes = Vec::with_capacity((rows * cols) as usize);
            for r in 0..*rows as usize {
                for c in 0..*cols as usize {
                    lanes.push(heap[buf].data[off + r * stride + c]);
                }
            }
            Some(RtVal::Vector(lanes))
        }
        Inst::Tile(TileInst::Mma { a, b, acc }) => {
            let av = ev(env, heap, a).lanes().to_vec();
            let bv = ev(env, heap, b).lanes().to_vec();
            let accv = ev(env, heap, acc).lanes().to_vec();
            // Register tiles are square in this lowering.
            let n = (av.len() as f64).sqrt() as usize;
            assert_eq!(n * n, av.len(), "non-square register tile");
            let is_fp = matches!(av.first(), Some(Scalar::Float(_)));
            let mut out = accv;
            for i in 0..n {
                for j in 0..n {
                    for k in 0..n {
                        let prod_f = av[i * n + k].as_f64() * bv[k * n + j].as_f64();
                        out[i * n + j] = if is_fp {
                            Scalar::Float(out[i * n + j].as_f64() + prod_f)
                        } else {
                            Scalar::Int(
                                out[i * n + j].as_int()
                                    + av[i * n + k].as_int() * bv[k * n + j].as_int(),
                            )
                        };
                    }
                }
            }
            Some(RtVal::Vector(out))
        }
        Inst::Tile(TileInst::Store {
            tile,
            ptr,
            rows,
            cols,
            stride,
        }) => {
            let v = ev(env, heap, tile).lanes().to_vec();
            let (buf, off) = ev(env, heap, ptr).ptr();
            let stride = ev(env, heap, stride).scalar().as_int() as usize;
            for r in 0..*rows as usize {
                for c in 0..*cols as usize {
                    heap[buf].data[off + r * stride + c] = v[r * *cols as usize + c];
                }
            }
            None
        }
        Inst::Phi { .. } => unreachable!("phis handled on block entry"),
        Inst::Tensor(_) => panic!("tensor intrinsic reached the evaluator: {:?}", kind),
        Inst::Erased => unreachable!("erased instruction still placed"),
    };
    if let Some(v) = result {
        env.insert(id, v);
    }
}

fn eval(func: &Function, env: &FxHashMap<InstId, RtVal>, args: &[RtVal], value: &Value) -> RtVal {
    match value {
        Value::Inst(id) => env
            .get(id)
            .unwrap_or_else(|| {
                panic!(
                    "use of unevaluated {id:?} ({})",
                    func.insts[*id].kind.opcode()
                )
            })
            .clone(),
        Value::Arg(n) => args[*n as usize].clone(),
        Value::Const(c) => const_val(c),
    }
}

fn const_val(c: &Constant) -> RtVal {
    match c {
        Constant::Int { value, .. } => RtVal::Scalar(Scalar::Int(*value)),
        Constant::Float { value, .. } => RtVal::Scalar(Scalar::Float(*value)),
        Constant::IntVector { elems, .. } => {
            RtVal::Vector(elems.iter().map(|&v| Scalar::Int(v)).collect())
        }
        Constant::FloatVector { elems, .. } => {
            RtVal::Vector(elems.iter().map(|&v| Scalar::Float(v)).collect())
        }
        Constant::Zero(ty) | Constant::Undef(ty) => match ty {
            Ty::Vector(s, n) => {
                let fill = if s.is_float() {
                    Scalar::Float(0.0)
                } else {
                    Scalar::Int(0)
                };
                RtVal::Vector(vec![fill; *n as usize])
            }
            Ty::Scalar(s) => RtVal::Scalar(if s.is_float() {
                Scalar::Float(0.0)
            } else {
                Scalar::Int(0)
            }),
            _ => panic!("zero/undef of {ty:?}"),
        },
    }
}

fn zip(l: &RtVal, r: &RtVal, f: impl Fn(Scalar, Scalar) -> Scalar) -> RtVal {
    match (l, r) {
        (RtVal::Scalar(a), RtVal::Scalar(b)) => RtVal::Scalar(f(*a, *b)),
        (RtVal::Vector(a), RtVal::Vector(b)) => {
            assert_eq!(a.len(), b.len(), "vector width mismatch");
            RtVal::Vector(a.iter().zip(b).map(|(x, y)| f(*x, *y)).collect())
        }
        other => panic!("mixed scalar/vector operands: {other:?}"),
    }
}

fn map(v: &RtVal, f: impl Fn(Scalar) -> Scalar) -> RtVal {
    match v {
        RtVal::Scalar(s) => RtVal::Scalar(f(*s)),
        RtVal::Vector(l) => RtVal::Vector(l.iter().map(|s| f(*s)).collect()),
        RtVal::Ptr { .. } => panic!("mapping over a pointer"),
    }
}

fn binop(op: BinOp, a: Scalar, b: Scalar) -> Scalar {
    match op {
        BinOp::Add => Scalar::Int(a.as_int() + b.as_int()),
        BinOp::Sub => Scalar::Int(a.as_int() - b.as_int()),
        BinOp::Mul => Scalar::Int(a.as_int() * b.as_int()),
        BinOp::FAdd => Scalar::Float(a.as_f64() + b.as_f64()),
        BinOp::FSub => Scalar::Float(a.as_f64() - b.as_f64()),
        BinOp::FMul => Scalar::Float(a.as_f64() * b.as_f64()),
        BinOp::FDiv => Scalar::Float(a.as_f64() / b.as_f64()),
        BinOp::And => Scalar::Int(a.as_int() & b.as_int()),
        BinOp::Or => Scalar::Int(a.as_int() | b.as_int()),
        BinOp::Xor => Scalar::Int(a.as_int() ^ b.as_int()),
    }
}

fn cmp(op: CmpOp, a: Scalar, b: Scalar) -> bool {
    match op {
        CmpOp::Eq => a.as_int() == b.as_int(),
        CmpOp::Ne => a.as_int() != b.as_int(),
        CmpOp::SLt => a.as_int() < b.as_int(),
        CmpOp::SLe => a.as_int() <= b.as_int(),
        CmpOp::SGt => a.as_int() > b.as_int(),
        CmpOp::SGe => a.as_int() >= b.as_int(),
        CmpOp::OLt => a.as_f64() < b.as_f64(),
        CmpOp::OGt => a.as_f64() > b.as_f64(),
        CmpOp::OGe => a.as_f64() >= b.as_f64(),
        // Unordered: true when either side is NaN.
        CmpOp::FUGe => {
            let (x, y) = (a.as_f64(), b.as_f64());
            x.is_nan() || y.is_nan() || x >= y
        }
    }
}

fn mathfn(fun: MathFn, x: f64) -> f64 {
    match fun {
        MathFn::Exp => x.exp(),
        MathFn::Exp2 => x.exp2(),
        MathFn::Log => x.ln(),
        MathFn::Log2 => x.log2(),
        MathFn::Log10 => x.log10(),
        MathFn::Sqrt => x.sqrt(),
        MathFn::Sin => x.sin(),
        MathFn::Cos => x.cos(),
        MathFn::Floor => x.floor(),
        MathFn::Ceil => x.ceil(),
        MathFn::Fabs => x.abs(),
    }
}

fn vec_reduce(op: VecReduceOp, lanes: &[Scalar]) -> Scalar {
    match op {
        VecReduceOp::Add => Scalar::Int(lanes.iter().map(|s| s.as_int()).sum()),
        VecReduceOp::Mul => Scalar::Int(lanes.iter().map(|s| s.as_int()).product()),
        VecReduceOp::And => Scalar::Int(lanes.iter().fold(-1, |a, s| a & s.as_int())),
        VecReduceOp::Or => Scalar::Int(lanes.iter().fold(0, |a, s| a | s.as_int())),
        VecReduceOp::Xor => Scalar::Int(lanes.iter().fold(0, |a, s| a ^ s.as_int())),
        VecReduceOp::FAdd => Scalar::Float(lanes.iter().map(|s| s.as_f64()).sum()),
        VecReduceOp::FMul => Scalar::Float(lanes.iter().map(|s| s.as_f64()).product()),
        VecReduceOp::SMax => Scalar::Int(lanes.iter().map(|s| s.as_int()).max().unwrap()),
        VecReduceOp::SMin => Scalar::Int(lanes.iter().map(|s| s.as_int()).min().unwrap()),
        VecReduceOp::FMax => Scalar::Float(
            lanes
                .iter()
                .map(|s| s.as_f64())
                .fold(f64::NEG_INFINITY, f64::max),
        ),
        VecReduceOp::FMin => Scalar::Float(
            lanes
                .iter()
                .map(|s| s.as_f64())
                .fold(f64::INFINITY, f64::min),
        ),
    }
}

// ---------------------------------------------------------------------
// Module-building helpers
// ---------------------------------------------------------------------

/// A vector-typed parameter.
pub fn vec_param(name: &str, elem: ScalarTy, lanes: u32) -> Param {
    Param {
        name: Symbol::intern(name),
        ty: Ty::Vector(elem, lanes),
    }
}

/// A constant `<n x i32>` property vector.
pub fn props(vals: &[u32]) -> Value {
    Value::Const(Constant::i32_vector(vals.iter().copied()))
}

/// The identity (row-major) layout of the given rank.
pub fn rm_layout(rank: usize) -> Vec<u32> {
    (0..rank as u32).collect()
}

/// Emits a `typeinfo` annotation of `value` and returns its id.
pub fn annotate(
    b: &mut Builder<'_>,
    value: Value,
    shape: &[u32],
    layout: &[u32],
    elem: ScalarTy,
) -> InstId {
    let lanes: u32 = shape.iter().product();
    b.tensor(
        TensorInst::TypeInfo {
            value,
            shape: props(shape),
            layout: props(layout),
            padding: props(&vec![0; shape.len()]),
        },
        Ty::Vector(elem, lanes),
        "",
    )
}
