//! End-to-end lowering tests.
//!
//! Each test builds a small module with annotated tensor intrinsics,
//! runs the full pipeline, and executes the lowered IR with the
//! reference evaluator to check the numbers the loop nests produce.

mod support;

use support::{annotate, as_floats, as_ints, eval_function, fvec, ivec, rm_layout, vec_param};
use ttc_intern::Symbol;
use ttc_ir::{
    Builder, ElemOp, Function, Inst, Module, ReduceKind, ScalarTy, TensorInst, Terminator, Ty,
    Value,
};
use ttc_session::{KnobMode, Options};

fn module_of(func: Function) -> Module {
    let mut module = Module::new(Symbol::intern("test"));
    module.add_func(func);
    module
}

fn lowered(mut module: Module, options: &Options) -> Module {
    ttc_driver::run(&mut module, options).expect("pipeline succeeds");
    module
}

fn the_func(module: &Module) -> &Function {
    module.funcs.iter().next().expect("one function")
}

fn options_with_tiles(m: u32, n: u32, k: u32) -> Options {
    Options {
        tile_size_m: m,
        tile_size_n: n,
        tile_size_k: k,
        ..Options::default()
    }
}

/// `matmul([1,1,2,2] x [1,1,2,2])` of i32 row-major operands with tile
/// sizes {2,2,2}: `[5,7,8,9] x [1,2,3,4] = [26,38,35,52]`.
#[test]
fn test_matmul_2x2_i32() {
    let mut f = Function::new(
        Symbol::intern("mm"),
        vec![
            vec_param("a", ScalarTy::I32, 4),
            vec_param("b", ScalarTy::I32, 4),
        ],
        Ty::Vector(ScalarTy::I32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let t1 = annotate(&mut b, Value::Arg(1), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let module = lowered(module_of(f), &options_with_tiles(2, 2, 2));
    let out = eval_function(
        the_func(&module),
        &[ivec(&[5, 7, 8, 9]), ivec(&[1, 2, 3, 4])],
    );
    assert_eq!(as_ints(&out), vec![26, 38, 35, 52]);
}

/// Default tile sizes (4, 4, 10) legalize to divisors of a 2x2 problem
/// and still produce the right product.
#[test]
fn test_matmul_tile_legalization() {
    let mut f = Function::new(
        Symbol::intern("mm_small"),
        vec![
            vec_param("a", ScalarTy::I32, 4),
            vec_param("b", ScalarTy::I32, 4),
        ],
        Ty::Vector(ScalarTy::I32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let t1 = annotate(&mut b, Value::Arg(1), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let module = lowered(module_of(f), &Options::default());
    let out = eval_function(
        the_func(&module),
        &[ivec(&[5, 7, 8, 9]), ivec(&[1, 2, 3, 4])],
    );
    assert_eq!(as_ints(&out), vec![26, 38, 35, 52]);
}

/// A 4x6 x 6x8 i32 matmul with tiles {2, 4, 3}: tiled accumulation
/// across several K tiles must agree with a straightforward product.
#[test]
fn test_matmul_4x6_6x8_tiled() {
    let (m, k, n) = (4usize, 6usize, 8usize);
    let a: Vec<i64> = (0..m * k).map(|i| (i as i64 % 7) - 3).collect();
    let bvals: Vec<i64> = (0..k * n).map(|i| (i as i64 % 5) - 2).collect();
    let mut expect = vec![0i64; m * n];
    for i in 0..m {
        for j in 0..n {
            for kk in 0..k {
                expect[i * n + j] += a[i * k + kk] * bvals[kk * n + j];
            }
        }
    }

    let mut f = Function::new(
        Symbol::intern("mm_rect"),
        vec![
            vec_param("a", ScalarTy::I32, (m * k) as u32),
            vec_param("b", ScalarTy::I32, (k * n) as u32),
        ],
        Ty::Vector(ScalarTy::I32, (m * n) as u32),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(
        &mut b,
        Value::Arg(0),
        &[1, 1, m as u32, k as u32],
        &rm_layout(4),
        ScalarTy::I32,
    );
    let t1 = annotate(
        &mut b,
        Value::Arg(1),
        &[1, 1, k as u32, n as u32],
        &rm_layout(4),
        ScalarTy::I32,
    );
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, (m * n) as u32),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let module = lowered(module_of(f), &options_with_tiles(2, 4, 3));
    let out = eval_function(the_func(&module), &[ivec(&a), ivec(&bvals)]);
    assert_eq!(as_ints(&out), expect);
}

/// A column-major left operand: the 6x4 physical storage carries the
/// logical 4x6 matrix, and the kernel picks the column-major case.
#[test]
fn test_matmul_col_major_lhs() {
    let (m, k, n) = (4usize, 6usize, 8usize);
    let logical_a: Vec<i64> = (0..m * k).map(|i| (i as i64 % 7) - 3).collect();
    // Stored column-major: phys[kk][i] = logical[i][kk].
    let mut stored_a = vec![0i64; m * k];
    for i in 0..m {
        for kk in 0..k {
            stored_a[kk * m + i] = logical_a[i * k + kk];
        }
    }
    let bvals: Vec<i64> = (0..k * n).map(|i| (i as i64 % 5) - 2).collect();
    let mut expect = vec![0i64; m * n];
    for i in 0..m {
        for j in 0..n {
            for kk in 0..k {
                expect[i * n + j] += logical_a[i * k + kk] * bvals[kk * n + j];
            }
        }
    }

    let mut f = Function::new(
        Symbol::intern("mm_colmajor"),
        vec![
            vec_param("a", ScalarTy::I32, (m * k) as u32),
            vec_param("b", ScalarTy::I32, (k * n) as u32),
        ],
        Ty::Vector(ScalarTy::I32, (m * n) as u32),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    // Physical shape 1x1x6x4 with the last two layout entries swapped.
    let t0 = annotate(
        &mut b,
        Value::Arg(0),
        &[1, 1, k as u32, m as u32],
        &[0, 1, 3, 2],
        ScalarTy::I32,
    );
    let t1 = annotate(
        &mut b,
        Value::Arg(1),
        &[1, 1, k as u32, n as u32],
        &rm_layout(4),
        ScalarTy::I32,
    );
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, (m * n) as u32),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let module = lowered(module_of(f), &options_with_tiles(2, 4, 2));
    let out = eval_function(the_func(&module), &[ivec(&stored_a), ivec(&bvals)]);
    assert_eq!(as_ints(&out), expect);
}

/// A float matmul goes through `fmul`/`fadd`.
#[test]
fn test_matmul_f32() {
    let mut f = Function::new(
        Symbol::intern("mm_f32"),
        vec![
            vec_param("a", ScalarTy::F32, 4),
            vec_param("b", ScalarTy::F32, 4),
        ],
        Ty::Vector(ScalarTy::F32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::F32);
    let t1 = annotate(&mut b, Value::Arg(1), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::F32);
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::F32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let module = lowered(module_of(f), &options_with_tiles(2, 2, 2));
    let out = eval_function(
        the_func(&module),
        &[fvec(&[0.5, 1.5, 2.0, -1.0]), fvec(&[2.0, 0.0, 4.0, 1.0])],
    );
    assert_eq!(as_floats(&out), vec![7.0, 1.5, 0.0, -1.0]);
}

/// `relu` on `[-5, 7, -8, 9]` with tile size 2.
#[test]
fn test_relu_i32() {
    let mut f = Function::new(
        Symbol::intern("relu_fn"),
        vec![vec_param("t", ScalarTy::I32, 4)],
        Ty::Vector(ScalarTy::I32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let ti = annotate(&mut b, Value::Arg(0), &[1, 2, 1, 2], &rm_layout(4), ScalarTy::I32);
    let relu = b.tensor(
        TensorInst::Elementwise {
            op: ElemOp::Relu,
            input: Value::Inst(ti),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(relu))));

    let module = lowered(module_of(f), &Options::default());
    let out = eval_function(the_func(&module), &[ivec(&[-5, 7, -8, 9])]);
    assert_eq!(as_ints(&out), vec![0, 7, 0, 9]);
}

/// `tanh` at zero is zero; at +/-10 it saturates to +/-1.
#[test]
fn test_tanh_f32() {
    let mut f = Function::new(
        Symbol::intern("tanh_fn"),
        vec![vec_param("t", ScalarTy::F32, 4)],
        Ty::Vector(ScalarTy::F32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let ti = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::F32);
    let tanh = b.tensor(
        TensorInst::Elementwise {
            op: ElemOp::Tanh,
            input: Value::Inst(ti),
        },
        Ty::Vector(ScalarTy::F32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(tanh))));

    let module = lowered(module_of(f), &Options::default());

    let zeros = eval_function(the_func(&module), &[fvec(&[0.0; 4])]);
    assert_eq!(as_floats(&zeros), vec![0.0; 4]);

    let sat = eval_function(the_func(&module), &[fvec(&[10.0, -10.0, 0.5, -0.5])]);
    let got = as_floats(&sat);
    assert!((got[0] - 1.0).abs() < 1e-4);
    assert!((got[1] + 1.0).abs() < 1e-4);
    assert!((got[2] - 0.5f64.tanh()).abs() < 1e-4);
    assert!((got[3] + 0.5f64.tanh()).abs() < 1e-4);
}

/// `sigmoid(0) = 0.5` and saturates at the tails.
#[test]
fn test_sigmoid_f32() {
    let mut f = Function::new(
        Symbol::intern("sigmoid_fn"),
        vec![vec_param("t", ScalarTy::F32, 4)],
        Ty::Vector(ScalarTy::F32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let ti = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::F32);
    let sig = b.tensor(
        TensorInst::Elementwise {
            op: ElemOp::Sigmoid,
            input: Value::Inst(ti),
        },
        Ty::Vector(ScalarTy::F32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(sig))));

    let module = lowered(module_of(f), &Options::default());
    let out = eval_function(the_func(&module), &[fvec(&[0.0, 10.0, -10.0, 1.0])]);
    let got = as_floats(&out);
    assert!((got[0] - 0.5).abs() < 1e-6);
    assert!((got[1] - 1.0).abs() < 1e-4);
    assert!(got[2] < 1e-4);
    assert!((got[3] - 1.0 / (1.0 + (-1.0f64).exp())).abs() < 1e-5);
}

/// Transpose of a row-major 4x8: element `(r, c)` moves to `(c, r)`.
#[test]
fn test_transpose_4x8_i32() {
    let rows = 4usize;
    let cols = 8usize;
    let input: Vec<i64> = (0..(rows * cols) as i64).collect();

    let mut f = Function::new(
        Symbol::intern("tr"),
        vec![vec_param("t", ScalarTy::I32, 32)],
        Ty::Vector(ScalarTy::I32, 32),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let ti = annotate(
        &mut b,
        Value::Arg(0),
        &[1, 1, rows as u32, cols as u32],
        &rm_layout(4),
        ScalarTy::I32,
    );
    let tr = b.tensor(
        TensorInst::Transpose {
            input: Value::Inst(ti),
        },
        Ty::Vector(ScalarTy::I32, 32),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(tr))));

    let module = lowered(module_of(f), &options_with_tiles(2, 2, 2));
    let out = eval_function(the_func(&module), &[ivec(&input)]);
    let got = as_ints(&out);
    for r in 0..rows {
        for c in 0..cols {
            assert_eq!(
                got[c * rows + r],
                input[r * cols + c],
                "element ({r}, {c}) must move to ({c}, {r})"
            );
        }
    }
}

/// `reduce_max` over a 4x4 float tensor with a 2x2 window and 2x2
/// strides: per-block maxima.
#[test]
fn test_reduce_max_f32() {
    let input: Vec<f64> = (0..16).map(f64::from).collect();

    let mut f = Function::new(
        Symbol::intern("red"),
        vec![vec_param("t", ScalarTy::F32, 16)],
        Ty::Vector(ScalarTy::F32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let ti = annotate(&mut b, Value::Arg(0), &[1, 1, 4, 4], &rm_layout(4), ScalarTy::F32);
    let red = b.tensor(
        TensorInst::Reduce {
            kind: ReduceKind::Max,
            window: support::props(&[1, 1, 2, 2]),
            strides: support::props(&[1, 1, 2, 2]),
            input: Value::Inst(ti),
        },
        Ty::Vector(ScalarTy::F32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(red))));

    let module = lowered(module_of(f), &Options::default());
    let out = eval_function(the_func(&module), &[fvec(&input)]);
    assert_eq!(as_floats(&out), vec![5.0, 7.0, 13.0, 15.0]);
}

/// `reduce_add` sums each window.
#[test]
fn test_reduce_add_i32() {
    let input: Vec<i64> = (0..16).collect();

    let mut f = Function::new(
        Symbol::intern("red_add"),
        vec![vec_param("t", ScalarTy::I32, 16)],
        Ty::Vector(ScalarTy::I32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let ti = annotate(&mut b, Value::Arg(0), &[1, 1, 4, 4], &rm_layout(4), ScalarTy::I32);
    let red = b.tensor(
        TensorInst::Reduce {
            kind: ReduceKind::Add,
            window: support::props(&[1, 1, 2, 2]),
            strides: support::props(&[1, 1, 2, 2]),
            input: Value::Inst(ti),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(red))));

    let module = lowered(module_of(f), &Options::default());
    let out = eval_function(the_func(&module), &[ivec(&input)]);
    // Window sums: 0+1+4+5, 2+3+6+7, 8+9+12+13, 10+11+14+15.
    assert_eq!(as_ints(&out), vec![10, 18, 42, 50]);
}

/// Broadcast with a constant scalar folds to a constant splat; a
/// non-constant scalar splats at runtime. Both observe product(shape)
/// lanes.
#[test]
fn test_broadcast() {
    let mut f = Function::new(
        Symbol::intern("bc"),
        vec![vec_param("t", ScalarTy::I32, 4)],
        Ty::Vector(ScalarTy::I32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let ti = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let bc = b.tensor(
        TensorInst::Broadcast {
            input: Value::Inst(ti),
            scalar: Value::const_i32(9),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(bc))));

    let module = lowered(module_of(f), &Options::default());
    let func = the_func(&module);
    let out = eval_function(func, &[ivec(&[0, 0, 0, 0])]);
    assert_eq!(as_ints(&out), vec![9, 9, 9, 9]);

    // The constant case folded: no splat shuffle remains.
    let shuffles = func
        .insts
        .iter()
        .filter(|d| d.block.is_some() && matches!(d.kind, Inst::ShuffleVector { .. }))
        .count();
    assert_eq!(shuffles, 0);
}

/// A matmul feeding a relu through a typeinfo annotation: the chain
/// lowers end-to-end and the intermediate buffer carries the product.
#[test]
fn test_matmul_then_relu_chain() {
    let mut f = Function::new(
        Symbol::intern("chain"),
        vec![
            vec_param("a", ScalarTy::I32, 4),
            vec_param("b", ScalarTy::I32, 4),
        ],
        Ty::Vector(ScalarTy::I32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let t1 = annotate(&mut b, Value::Arg(1), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    let t2 = annotate(&mut b, Value::Inst(mm), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let relu = b.tensor(
        TensorInst::Elementwise {
            op: ElemOp::Relu,
            input: Value::Inst(t2),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(relu))));

    let module = lowered(module_of(f), &options_with_tiles(2, 2, 2));
    // [1, -1; 2, 0] x [3, 4; 5, 6] = [-2, -2; 6, 8]; relu clamps.
    let out = eval_function(
        the_func(&module),
        &[ivec(&[1, -1, 2, 0]), ivec(&[3, 4, 5, 6])],
    );
    assert_eq!(as_ints(&out), vec![0, 0, 6, 8]);
}

/// Typed-store buffer seeding behaves like memcpy seeding.
#[test]
fn test_typed_store_init_mode() {
    let mut f = Function::new(
        Symbol::intern("mm_store_init"),
        vec![
            vec_param("a", ScalarTy::I32, 4),
            vec_param("b", ScalarTy::I32, 4),
        ],
        Ty::Vector(ScalarTy::I32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let t1 = annotate(&mut b, Value::Arg(1), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let options = Options {
        init_with_memcpy: false,
        ..options_with_tiles(2, 2, 2)
    };
    let module = lowered(module_of(f), &options);
    let out = eval_function(
        the_func(&module),
        &[ivec(&[5, 7, 8, 9]), ivec(&[1, 2, 3, 4])],
    );
    assert_eq!(as_ints(&out), vec![26, 38, 35, 52]);
}

/// The 2-D tile-register mode produces the same product through
/// `tensor_load` / `tensor_mma` / `tensor_store`.
#[test]
fn test_matmul_tile_register_mode() {
    let (m, k, n) = (4usize, 4usize, 4usize);
    let a: Vec<i64> = (0..(m * k) as i64).collect();
    let bvals: Vec<i64> = (0..(k * n) as i64).map(|i| i % 3 - 1).collect();
    let mut expect = vec![0i64; m * n];
    for i in 0..m {
        for j in 0..n {
            for kk in 0..k {
                expect[i * n + j] += a[i * k + kk] * bvals[kk * n + j];
            }
        }
    }

    let mut f = Function::new(
        Symbol::intern("mm_tiles"),
        vec![
            vec_param("a", ScalarTy::I32, 16),
            vec_param("b", ScalarTy::I32, 16),
        ],
        Ty::Vector(ScalarTy::I32, 16),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(&mut b, Value::Arg(0), &[1, 1, 4, 4], &rm_layout(4), ScalarTy::I32);
    let t1 = annotate(&mut b, Value::Arg(1), &[1, 1, 4, 4], &rm_layout(4), ScalarTy::I32);
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, 16),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let options = Options {
        tile_registers: true,
        ..options_with_tiles(4, 4, 4)
    };
    let module = lowered(module_of(f), &options);

    // The tile intrinsics are present in the lowered code.
    let func = the_func(&module);
    let tile_insts = func
        .insts
        .iter()
        .filter(|d| d.block.is_some() && matches!(d.kind, Inst::Tile(_)))
        .count();
    assert!(tile_insts > 0, "tile mode must emit tile intrinsics");

    let out = eval_function(func, &[ivec(&a), ivec(&bvals)]);
    assert_eq!(as_ints(&out), expect);
}

/// A requested unroll factor lands as a pragma on the innermost loop
/// header.
#[test]
fn test_unroll_hint_recorded() {
    let mut f = Function::new(
        Symbol::intern("mm_unroll"),
        vec![
            vec_param("a", ScalarTy::I32, 4),
            vec_param("b", ScalarTy::I32, 4),
        ],
        Ty::Vector(ScalarTy::I32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let t1 = annotate(&mut b, Value::Arg(1), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let options = Options {
        inner_loop_unroll_factor: 4,
        ..options_with_tiles(2, 2, 2)
    };
    let module = lowered(module_of(f), &options);
    let func = the_func(&module);
    assert_eq!(func.unroll_hints.values().copied().collect::<Vec<_>>(), vec![4]);
}

/// Print-knobs mode on a 200x200 matmul: all divisors of 200 up to 128
/// for M, N, K, and `[0, 16]` for the unroll factor.
#[test]
fn test_print_knobs_200x200() {
    let lanes = 200 * 200u32;
    let mut f = Function::new(
        Symbol::intern("mm_200"),
        vec![
            vec_param("a", ScalarTy::I32, lanes),
            vec_param("b", ScalarTy::I32, lanes),
        ],
        Ty::Vector(ScalarTy::I32, lanes),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(
        &mut b,
        Value::Arg(0),
        &[1, 1, 200, 200],
        &rm_layout(4),
        ScalarTy::I32,
    );
    let t1 = annotate(
        &mut b,
        Value::Arg(1),
        &[1, 1, 200, 200],
        &rm_layout(4),
        ScalarTy::I32,
    );
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, lanes),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("knobs.json");
    let options = Options {
        knob_mode: KnobMode::Print(camino::Utf8PathBuf::from_path_buf(path.clone()).unwrap()),
        ..Options::default()
    };
    let mut module = module_of(f);
    ttc_driver::run(&mut module, &options).unwrap();

    let v: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let entry = &v["mm_200"]["tensor_matmul_0"];
    let expected = serde_json::json!([1, 2, 4, 5, 8, 10, 20, 25, 40, 50, 100]);
    assert_eq!(entry["TileSize_M"]["values"], expected);
    assert_eq!(entry["TileSize_N"]["values"], expected);
    assert_eq!(entry["TileSize_K"]["values"], expected);
    assert_eq!(
        entry["InnerLoopUnrollFactor"]["data_range"],
        serde_json::json!([0, 16])
    );
}

/// Knob values read from a file override the defaults.
#[test]
fn test_read_knobs_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("knobs.json");
    std::fs::write(
        &path,
        r#"{ "mm_knobbed": { "tensor_matmul_0": {
            "TileSize_M": 2, "TileSize_N": 2, "TileSize_K": 2,
            "InnerLoopUnrollFactor": 8 } } }"#,
    )
    .unwrap();

    let mut f = Function::new(
        Symbol::intern("mm_knobbed"),
        vec![
            vec_param("a", ScalarTy::I32, 4),
            vec_param("b", ScalarTy::I32, 4),
        ],
        Ty::Vector(ScalarTy::I32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let t1 = annotate(&mut b, Value::Arg(1), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let options = Options {
        knob_mode: KnobMode::Read(camino::Utf8PathBuf::from_path_buf(path).unwrap()),
        ..Options::default()
    };
    let module = lowered(module_of(f), &options);
    let func = the_func(&module);

    // The unroll knob from the file landed as a pragma.
    assert_eq!(func.unroll_hints.values().copied().collect::<Vec<_>>(), vec![8]);

    let out = eval_function(func, &[ivec(&[5, 7, 8, 9]), ivec(&[1, 2, 3, 4])]);
    assert_eq!(as_ints(&out), vec![26, 38, 35, 52]);
}

/// Re-running the whole pipeline on lowered IR changes nothing.
#[test]
fn test_pipeline_idempotence() {
    let mut f = Function::new(
        Symbol::intern("mm_idem"),
        vec![
            vec_param("a", ScalarTy::I32, 4),
            vec_param("b", ScalarTy::I32, 4),
        ],
        Ty::Vector(ScalarTy::I32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let t1 = annotate(&mut b, Value::Arg(1), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let options = options_with_tiles(2, 2, 2);
    let mut module = module_of(f);
    ttc_driver::run(&mut module, &options).unwrap();
    let snapshot = module.clone();
    ttc_driver::run(&mut module, &options).unwrap();
    assert_eq!(module, snapshot);
}

/// Every lowered function passes the verifier and leaves no tensor
/// intrinsics behind; the final loads carry the inferred output shape's
/// element count.
#[test]
fn test_lowering_invariants() {
    let mut f = Function::new(
        Symbol::intern("mm_inv"),
        vec![
            vec_param("a", ScalarTy::I32, 4),
            vec_param("b", ScalarTy::I32, 4),
        ],
        Ty::Vector(ScalarTy::I32, 4),
    );
    let entry = f.entry;
    let mut b = Builder::at_end(&mut f, entry);
    let t0 = annotate(&mut b, Value::Arg(0), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let t1 = annotate(&mut b, Value::Arg(1), &[1, 1, 2, 2], &rm_layout(4), ScalarTy::I32);
    let mm = b.tensor(
        TensorInst::Matmul {
            lhs: Value::Inst(t0),
            rhs: Value::Inst(t1),
        },
        Ty::Vector(ScalarTy::I32, 4),
        "",
    );
    f.set_term(entry, Terminator::Ret(Some(Value::Inst(mm))));

    let module = lowered(module_of(f), &options_with_tiles(2, 2, 2));
    let func = the_func(&module);
    ttc_ir::verify_function(func).unwrap();

    assert!(!func
        .insts
        .iter()
        .any(|d| d.block.is_some() && d.kind.is_tensor()));

    // The returned value is a flat load of 4 = product(1,1,2,2) lanes.
    let Terminator::Ret(Some(Value::Inst(ret))) =
        &func.blocks[ret_block(func)].term
    else {
        panic!("expected a value return");
    };
    assert!(matches!(func.insts[*ret].kind, Inst::Load { .. }));
    assert_eq!(func.insts[*ret].ty, Ty::Vector(ScalarTy::I32, 4));
}

fn ret_block(func: &Function) -> ttc_ir::BlockId {
    func.blocks
        .iter_enumerated()
        .find(|(_, b)| matches!(b.term, Terminator::Ret(_)))
        .map(|(id, _)| id)
        .expect("function has a return")
}
