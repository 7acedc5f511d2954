//! Dominator tree.
//!
//! The Cooper-Harvey-Kennedy iterative scheme over a reverse-post-order
//! numbering. The tree is recomputed from scratch after CFG surgery; the
//! loop nests this compiler builds are small enough that incremental
//! update is not worth its bookkeeping.

use crate::function::Function;
use crate::BlockId;
use ttc_index::Idx;

/// A dominator tree for one function.
#[derive(Clone, Debug)]
pub struct DomTree {
    /// Immediate dominator per block; the entry maps to itself,
    /// unreachable blocks to `None`.
    idom: Vec<Option<BlockId>>,
    /// RPO number per block (`usize::MAX` for unreachable blocks).
    rpo_number: Vec<usize>,
}

impl DomTree {
    /// Computes the dominator tree of `func`.
    #[must_use]
    pub fn compute(func: &Function) -> Self {
        let rpo = func.rpo();
        let n_blocks = func.blocks.len();
        let mut rpo_number = vec![usize::MAX; n_blocks];
        for (i, &b) in rpo.iter().enumerate() {
            rpo_number[b.index()] = i;
        }

        let mut idom: Vec<Option<BlockId>> = vec![None; n_blocks];
        idom[func.entry.index()] = Some(func.entry);

        let preds: Vec<Vec<BlockId>> = (0..n_blocks)
            .map(|i| func.preds(BlockId::new(i)))
            .collect();

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &p in &preds[b.index()] {
                    if idom[p.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(cur) => Self::intersect(&idom, &rpo_number, p, cur),
                    });
                }
                if new_idom.is_some() && idom[b.index()] != new_idom {
                    idom[b.index()] = new_idom;
                    changed = true;
                }
            }
        }

        Self { idom, rpo_number }
    }

    fn intersect(
        idom: &[Option<BlockId>],
        rpo_number: &[usize],
        mut a: BlockId,
        mut b: BlockId,
    ) -> BlockId {
        while a != b {
            while rpo_number[a.index()] > rpo_number[b.index()] {
                a = idom[a.index()].expect("processed block has an idom");
            }
            while rpo_number[b.index()] > rpo_number[a.index()] {
                b = idom[b.index()].expect("processed block has an idom");
            }
        }
        a
    }

    /// The immediate dominator of `block` (the entry's is itself).
    #[must_use]
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom[block.index()]
    }

    /// Returns true if `a` dominates `b` (reflexive).
    #[must_use]
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom[cur.index()] {
                Some(parent) if parent != cur => cur = parent,
                _ => return false,
            }
        }
    }

    /// Returns true if `block` is reachable from the entry.
    #[must_use]
    pub fn is_reachable(&self, block: BlockId) -> bool {
        self.rpo_number[block.index()] != usize::MAX
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::function::{Function, Terminator};
    use crate::ty::Ty;
    use crate::Value;
    use ttc_intern::Symbol;

    /// entry -> header; header -> body | exit; body -> header.
    fn diamond_loop() -> (Function, BlockId, BlockId, BlockId) {
        let mut f = Function::new(Symbol::intern("f"), Vec::new(), Ty::Void);
        let header = f.add_block(Symbol::intern("header"));
        let body = f.add_block(Symbol::intern("body"));
        let exit = f.add_block(Symbol::intern("exit"));
        f.set_term(f.entry, Terminator::Br(header));
        f.set_term(
            header,
            Terminator::CondBr {
                cond: Value::const_i32(1),
                then_dest: body,
                else_dest: exit,
            },
        );
        f.set_term(body, Terminator::Br(header));
        f.set_term(exit, Terminator::Ret(None));
        (f, header, body, exit)
    }

    #[test]
    fn test_idoms_of_loop() {
        let (f, header, body, exit) = diamond_loop();
        let dt = DomTree::compute(&f);
        assert_eq!(dt.idom(header), Some(f.entry));
        assert_eq!(dt.idom(body), Some(header));
        assert_eq!(dt.idom(exit), Some(header));
    }

    #[test]
    fn test_dominates() {
        let (f, header, body, exit) = diamond_loop();
        let dt = DomTree::compute(&f);
        assert!(dt.dominates(f.entry, exit));
        assert!(dt.dominates(header, body));
        assert!(dt.dominates(body, body));
        assert!(!dt.dominates(body, exit));
    }

    #[test]
    fn test_unreachable_block() {
        let (mut f, _, _, _) = diamond_loop();
        let dead = f.add_block(Symbol::intern("dead"));
        f.set_term(dead, Terminator::Ret(None));
        let dt = DomTree::compute(&f);
        assert!(!dt.is_reachable(dead));
        assert_eq!(dt.idom(dead), None);
    }
}
