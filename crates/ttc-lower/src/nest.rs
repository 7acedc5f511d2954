//! The tiled loop-nest builder.
//!
//! Builds the skeleton
//!
//! ```text
//! for m = 0; m != M; m += TileSize_M
//!   for n = 0; n != N; n += TileSize_N
//!     for k = 0; k != K; k += TileSize_K
//!       ...
//! ```
//!
//! as a chain of `header`/`body`/`latch` blocks spliced between a
//! preheader and an exit block. Each level carries a 32-bit induction
//! PHI with incomings `(start, preheader)` and `(iv + step, latch)`; the
//! latch compares `icmp ne inc, bound` and branches back to the header
//! or out to the enclosing level's latch. Only the innermost level is
//! forced to have a body block; outer levels degenerate to
//! header-straight-to-latch, with the inner loop chain spliced between
//! them.
//!
//! The dominator tree and loop info are recomputed from the rewritten
//! CFG (see `ttc_ir::DomTree`, `ttc_ir::LoopInfo`); the engine consults
//! them when attaching unroll pragmas.

use ttc_ir::{
    BinOp, Builder, CmpOp, Function, InstId, IrError, Terminator, Ty, Value,
};
use ttc_ir::{BlockId, ScalarTy};
use ttc_intern::Symbol;

/// One level of a tiled loop nest, outermost first.
#[derive(Clone, Debug)]
pub struct LoopLevel {
    /// Trip bound (exclusive, in induction units).
    pub bound: u32,
    /// Induction step.
    pub step: u32,
    /// Start index.
    pub start: u32,
    /// The header block, holding the induction PHI.
    pub header: BlockId,
    /// The latch block, holding the increment and back-branch.
    pub latch: BlockId,
    /// The block branching into the header from outside.
    pub preheader: BlockId,
    /// The induction PHI.
    pub iv: InstId,
}

/// A freshly built tiled loop nest.
#[derive(Clone, Debug)]
pub struct TiledLoopNest {
    /// The levels, outermost first.
    pub levels: Vec<LoopLevel>,
    /// The innermost body block.
    pub inner_body: BlockId,
}

impl TiledLoopNest {
    /// The induction variables, outermost first.
    #[must_use]
    pub fn indices(&self) -> Vec<Value> {
        self.levels.iter().map(|l| Value::Inst(l.iv)).collect()
    }

    /// The innermost level.
    #[must_use]
    pub fn inner(&self) -> &LoopLevel {
        self.levels.last().expect("nest has at least one level")
    }

    /// The latch of the second-innermost loop: where completed tiles are
    /// committed exactly once per output tile.
    #[must_use]
    pub fn store_block(&self) -> BlockId {
        let n = self.levels.len();
        self.levels[n - 2].latch
    }
}

/// A `(bound, step, start)` triple per level, outermost first.
pub type LoopSpec = Vec<(u32, u32, u32)>;

/// Creates one loop between `preheader` and `exit`.
///
/// Returns `(header, body, latch, iv)`; `body` is `None` for degenerate
/// (bodyless) levels. The preheader's unconditional branch is redirected
/// into the new header.
fn create_loop(
    func: &mut Function,
    preheader: BlockId,
    exit: BlockId,
    bound: u32,
    step: u32,
    start: u32,
    must_have_body: bool,
) -> Result<(BlockId, Option<BlockId>, BlockId, InstId), IrError> {
    let header = func.add_block(Symbol::intern("loop.header"));
    let body = must_have_body.then(|| func.add_block(Symbol::intern("loop.body")));
    let latch = func.add_block(Symbol::intern("loop.latch"));

    match body {
        Some(body) => {
            func.set_term(header, Terminator::Br(body));
            func.set_term(body, Terminator::Br(latch));
        }
        None => func.set_term(header, Terminator::Br(latch)),
    }

    let mut b = Builder::at_end(func, header);
    let iv = b.phi(
        Ty::Scalar(ScalarTy::I32),
        vec![(preheader, Value::const_i32(i64::from(start)))],
        "loop.iv",
    );

    let mut b = Builder::at_end(func, latch);
    let inc = b.binary(
        BinOp::Add,
        Value::Inst(iv),
        Value::const_i32(i64::from(step)),
        "loop.step",
    );
    let cond = b.cmp(
        CmpOp::Ne,
        inc.clone(),
        Value::const_i32(i64::from(bound)),
        "loop.cond",
    );
    func.set_term(
        latch,
        Terminator::CondBr {
            cond,
            then_dest: header,
            else_dest: exit,
        },
    );
    func.add_phi_incoming(iv, latch, inc);

    func.redirect_branch(preheader, header)?;
    Ok((header, body, latch, iv))
}

/// Builds a tiled loop nest between `start` and `end`.
///
/// `start` must end in an unconditional branch to `end`; afterwards the
/// nest sits between them, with each level's latch exiting into the
/// enclosing level's latch (the outermost into `end`).
///
/// # Errors
///
/// Fails if `start` does not end in an unconditional branch.
pub fn create_tiled_loops(
    func: &mut Function,
    start: BlockId,
    end: BlockId,
    spec: &LoopSpec,
) -> Result<TiledLoopNest, IrError> {
    debug_assert!(!spec.is_empty(), "a loop nest needs at least one level");
    let mut preheader = start;
    let mut exit = end;
    let mut levels = Vec::with_capacity(spec.len());
    let mut inner_body = start;

    for (i, &(bound, step, start_idx)) in spec.iter().enumerate() {
        let must_have_body = i == spec.len() - 1;
        let (header, body, latch, iv) =
            create_loop(func, preheader, exit, bound, step, start_idx, must_have_body)?;
        levels.push(LoopLevel {
            bound,
            step,
            start: start_idx,
            header,
            latch,
            preheader,
            iv,
        });
        // The next (inner) level nests between this level's body (or
        // header, when degenerate) and this level's latch.
        preheader = body.unwrap_or(header);
        exit = latch;
        inner_body = preheader;
    }

    Ok(TiledLoopNest { levels, inner_body })
}
