//! Natural loop discovery.
//!
//! Loops are found from back edges (an edge whose target dominates its
//! source); each loop is the natural loop of its header. Nesting is by
//! block-set containment. Like the dominator tree, loop info is
//! recomputed after the lowering splices a new nest into the CFG.

use crate::dom::DomTree;
use crate::function::Function;
use crate::BlockId;
use rustc_hash::{FxHashMap, FxHashSet};

/// One natural loop.
#[derive(Clone, Debug)]
pub struct LoopRecord {
    /// The loop header.
    pub header: BlockId,
    /// All blocks of the loop, header included.
    pub blocks: FxHashSet<BlockId>,
    /// The enclosing loop, if any.
    pub parent: Option<usize>,
    /// Nesting depth; top-level loops have depth 1.
    pub depth: u32,
}

/// Loop info for one function.
#[derive(Clone, Debug, Default)]
pub struct LoopInfo {
    loops: Vec<LoopRecord>,
    /// Innermost loop per block.
    innermost: FxHashMap<BlockId, usize>,
}

impl LoopInfo {
    /// Computes loop info for `func` given its dominator tree.
    #[must_use]
    pub fn compute(func: &Function, dom: &DomTree) -> Self {
        // Collect latches per header.
        let mut latches: FxHashMap<BlockId, Vec<BlockId>> = FxHashMap::default();
        for (block, data) in func.blocks.iter_enumerated() {
            if !dom.is_reachable(block) {
                continue;
            }
            for succ in data.term.succs() {
                if dom.dominates(succ, block) {
                    latches.entry(succ).or_default().push(block);
                }
            }
        }

        // Natural loop of each header: header plus everything that
        // reaches a latch without passing through the header.
        let mut loops: Vec<LoopRecord> = Vec::new();
        let mut headers: Vec<BlockId> = latches.keys().copied().collect();
        headers.sort();
        for header in headers {
            let mut blocks: FxHashSet<BlockId> = FxHashSet::default();
            blocks.insert(header);
            let mut stack = latches[&header].clone();
            while let Some(b) = stack.pop() {
                if blocks.insert(b) {
                    for pred in func.preds(b) {
                        if dom.is_reachable(pred) {
                            stack.push(pred);
                        }
                    }
                }
            }
            loops.push(LoopRecord {
                header,
                blocks,
                parent: None,
                depth: 1,
            });
        }

        // Nesting: the parent is the smallest strict superset.
        for i in 0..loops.len() {
            let mut parent: Option<usize> = None;
            for j in 0..loops.len() {
                if i == j || !loops[j].blocks.contains(&loops[i].header) {
                    continue;
                }
                if loops[j].blocks.len() <= loops[i].blocks.len() {
                    continue;
                }
                parent = match parent {
                    None => Some(j),
                    Some(p) if loops[j].blocks.len() < loops[p].blocks.len() => Some(j),
                    keep => keep,
                };
            }
            loops[i].parent = parent;
        }
        for i in 0..loops.len() {
            let mut depth = 1;
            let mut cur = loops[i].parent;
            while let Some(p) = cur {
                depth += 1;
                cur = loops[p].parent;
            }
            loops[i].depth = depth;
        }

        // Innermost loop per block = the containing loop of max depth.
        let mut innermost: FxHashMap<BlockId, usize> = FxHashMap::default();
        for (i, lp) in loops.iter().enumerate() {
            for &b in &lp.blocks {
                match innermost.get(&b) {
                    Some(&cur) if loops[cur].depth >= lp.depth => {}
                    _ => {
                        innermost.insert(b, i);
                    }
                }
            }
        }

        Self { loops, innermost }
    }

    /// All loops, in header order.
    #[must_use]
    pub fn loops(&self) -> &[LoopRecord] {
        &self.loops
    }

    /// The innermost loop containing `block`.
    #[must_use]
    pub fn loop_for(&self, block: BlockId) -> Option<&LoopRecord> {
        self.innermost.get(&block).map(|&i| &self.loops[i])
    }

    /// The nesting depth of `block` (0 outside any loop).
    #[must_use]
    pub fn depth_of(&self, block: BlockId) -> u32 {
        self.loop_for(block).map_or(0, |l| l.depth)
    }
}
