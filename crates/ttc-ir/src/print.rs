//! Text dumps of the IR, LLVM-flavored.
//!
//! Used by `--dump-ir` and in test failure output. The format is for
//! humans; the serde form is the machine-readable one.

use crate::constant::Constant;
use crate::function::{Function, Module, Terminator};
use crate::inst::{Inst, TensorInst, TileInst};
use crate::{BlockId, InstId, Value};
use std::fmt;
use ttc_index::Idx;

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; module {}", self.name)?;
        for func in self.funcs.iter() {
            writeln!(f, "{func}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fn @{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "%arg{i}: {}", p.ty)?;
        }
        writeln!(f, ") -> {} {{", self.ret_ty)?;
        for block in self.rpo() {
            self.fmt_block(f, block)?;
        }
        writeln!(f, "}}")
    }
}

impl Function {
    fn fmt_block(&self, f: &mut fmt::Formatter<'_>, block: BlockId) -> fmt::Result {
        let data = &self.blocks[block];
        writeln!(f, "bb{}:\t\t\t\t; {}", block.index(), data.name)?;
        for &id in &data.insts {
            write!(f, "  ")?;
            self.fmt_inst(f, id)?;
            writeln!(f)?;
        }
        write!(f, "  ")?;
        self.fmt_term(f, &data.term)?;
        writeln!(f)
    }

    fn fmt_inst(&self, f: &mut fmt::Formatter<'_>, id: InstId) -> fmt::Result {
        let data = &self.insts[id];
        if !data.ty.is_void() {
            write!(f, "%{} = ", id.index())?;
        }
        write!(f, "{} ", data.kind.opcode())?;
        match &data.kind {
            Inst::Phi { incomings } => {
                write!(f, "{} ", data.ty)?;
                for (i, (bb, v)) in incomings.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[ bb{}: ", bb.index())?;
                    self.fmt_value(f, v)?;
                    write!(f, " ]")?;
                }
            }
            Inst::ShuffleVector { a, b, mask } => {
                self.fmt_value(f, a)?;
                write!(f, ", ")?;
                self.fmt_value(f, b)?;
                write!(f, ", mask {mask:?}")?;
            }
            Inst::HeapAlloc { elem_ty, count } => {
                write!(f, "{count} x {elem_ty}")?;
            }
            Inst::Load { ptr } => {
                write!(f, "{}, ", data.ty)?;
                self.fmt_value(f, ptr)?;
            }
            Inst::Tensor(TensorInst::Reduce { kind, .. }) => {
                write!(f, "({:?}) ", kind)?;
                self.fmt_operands(f, &data.kind)?;
            }
            Inst::Tile(TileInst::Load { rows, cols, .. })
            | Inst::Tile(TileInst::Store { rows, cols, .. }) => {
                write!(f, "[{rows} x {cols}] ")?;
                self.fmt_operands(f, &data.kind)?;
            }
            other => {
                self.fmt_operands(f, other)?;
            }
        }
        if let Some(name) = data.name {
            write!(f, "\t; {name}")?;
        }
        Ok(())
    }

    fn fmt_operands(&self, f: &mut fmt::Formatter<'_>, inst: &Inst) -> fmt::Result {
        let mut operands = Vec::new();
        inst.for_each_operand(|v| operands.push(v.clone()));
        for (i, v) in operands.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            self.fmt_value(f, v)?;
        }
        Ok(())
    }

    fn fmt_term(&self, f: &mut fmt::Formatter<'_>, term: &Terminator) -> fmt::Result {
        match term {
            Terminator::Br(b) => write!(f, "br bb{}", b.index()),
            Terminator::CondBr {
                cond,
                then_dest,
                else_dest,
            } => {
                write!(f, "br ")?;
                self.fmt_value(f, cond)?;
                write!(f, ", bb{}, bb{}", then_dest.index(), else_dest.index())
            }
            Terminator::Ret(None) => write!(f, "ret void"),
            Terminator::Ret(Some(v)) => {
                write!(f, "ret ")?;
                self.fmt_value(f, v)
            }
            Terminator::Unreachable => write!(f, "unreachable"),
        }
    }

    fn fmt_value(&self, f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
        match value {
            Value::Inst(id) => write!(f, "%{}", id.index()),
            Value::Arg(n) => write!(f, "%arg{n}"),
            Value::Const(c) => fmt_const(f, c),
        }
    }
}

fn fmt_const(f: &mut fmt::Formatter<'_>, c: &Constant) -> fmt::Result {
    match c {
        Constant::Int { value, ty } => write!(f, "{ty} {value}"),
        Constant::Float { value, ty } => write!(f, "{ty} {value}"),
        Constant::IntVector { elems, elem_ty } => {
            write!(f, "<{} x {elem_ty}> {elems:?}", elems.len())
        }
        Constant::FloatVector { elems, elem_ty } => {
            write!(f, "<{} x {elem_ty}> {elems:?}", elems.len())
        }
        Constant::Zero(ty) => write!(f, "{ty} zeroinitializer"),
        Constant::Undef(ty) => write!(f, "{ty} undef"),
    }
}
