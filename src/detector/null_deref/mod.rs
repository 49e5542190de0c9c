//! Null-Dereference Detector
//! Rules:
//! 1. Loads, stores and indexed addresses whose pointer operand is Null or MaybeNull
//! 2. unless the access sits in a block only entered when a null check on
//!    that pointer (or on another load of the same slot) succeeded

use log::{debug, info};
use std::collections::{BTreeSet, HashSet};

use super::DetectorContext;
use crate::ir::{BlockId, CmpPred, InstId, InstKind, ValueId};

pub struct NullDerefDetector<'a, 'b> {
    cx: &'b DetectorContext<'a>,
    /// (block, pointer) known non-null inside the block
    guarded_values: HashSet<(BlockId, ValueId)>,
    /// (block, slot) whose loads are known non-null inside the block
    guarded_slots: HashSet<(BlockId, ValueId)>,
}

impl<'a, 'b> NullDerefDetector<'a, 'b> {
    pub fn new(cx: &'b DetectorContext<'a>) -> Self {
        let mut detector = Self {
            cx,
            guarded_values: HashSet::new(),
            guarded_slots: HashSet::new(),
        };
        detector.collect_guards();
        detector
    }

    pub fn analyze(&self) -> BTreeSet<InstId> {
        let func = self.cx.func;
        let mut flagged = BTreeSet::new();
        for inst in func.inst_ids() {
            let ptr = match &func.inst(inst).kind {
                InstKind::Load { ptr } | InstKind::Store { ptr, .. } => *ptr,
                InstKind::IndexedAddress { base, .. } => *base,
                _ => continue,
            };
            let nullness = self.cx.points_to.nullness(ptr);
            if !nullness.may_be_null() {
                continue;
            }
            if self.is_guarded(func.inst(inst).block, ptr) {
                debug!("{}: null check guards `{}`", func.name, func.render(inst));
                continue;
            }
            info!(
                "null dereference in {}: `{}` through {} ({})",
                func.name,
                func.render(inst),
                func.value_name(ptr),
                nullness
            );
            flagged.insert(inst);
        }
        flagged
    }

    /// `br (x ==/!= null)`: the non-null successor is guarded if the branch is its only way in.
    fn collect_guards(&mut self) {
        let func = self.cx.func;
        for bb in func.block_ids() {
            let term = match func.block(bb).insts.last() {
                Some(term) => *term,
                None => continue,
            };
            let (cond, targets) = match &func.inst(term).kind {
                InstKind::Branch {
                    cond: Some(cond),
                    targets,
                } if targets.len() == 2 => (*cond, targets),
                _ => continue,
            };
            let (pred, lhs, rhs) = match func.defining_kind(cond) {
                Some(InstKind::Compare { pred, lhs, rhs }) => (*pred, *lhs, *rhs),
                _ => continue,
            };
            let checked = if func.value(rhs).is_null() {
                lhs
            } else if func.value(lhs).is_null() {
                rhs
            } else {
                continue;
            };
            let non_null_target = match pred {
                CmpPred::Eq => targets[1],
                CmpPred::Ne => targets[0],
                _ => continue,
            };
            if self.cx.cfg.predecessors(non_null_target) != [bb] {
                continue;
            }
            self.guarded_values.insert((non_null_target, checked));
            if let Some(InstKind::Load { ptr }) = func.defining_kind(checked) {
                self.guarded_slots.insert((non_null_target, *ptr));
            }
        }
    }

    /// Casts and indexed addresses keep the guard of the pointer they derive from.
    fn is_guarded(&self, block: BlockId, ptr: ValueId) -> bool {
        let func = self.cx.func;
        let mut cur = ptr;
        for _ in 0..=self.cx.trace_depth {
            if self.guarded_values.contains(&(block, cur)) {
                return true;
            }
            match func.defining_kind(cur) {
                Some(InstKind::Load { ptr: slot }) => {
                    return self.guarded_slots.contains(&(block, *slot));
                }
                Some(InstKind::Cast { operand }) | Some(InstKind::IndexedAddress { base: operand, .. }) => {
                    cur = *operand;
                }
                _ => return false,
            }
        }
        false
    }
}
