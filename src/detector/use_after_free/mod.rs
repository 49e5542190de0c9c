//! Use-After-Free Detector
//! Rules:
//! 1. Loads and stores through a pointer that may be released
//! 2. or calls passing such a pointer, deallocators included
//! Direct accesses to a stack slot (`store %x, %slot`, `reset(%slot)`) read
//! or overwrite the slot itself, not the memory its contents point to, and
//! are not uses.

use log::info;
use std::collections::BTreeSet;

use super::DetectorContext;
use crate::ir::{InstId, InstKind, ValueId};

pub struct UseAfterFreeDetector<'a, 'b> {
    cx: &'b DetectorContext<'a>,
}

impl<'a, 'b> UseAfterFreeDetector<'a, 'b> {
    pub fn new(cx: &'b DetectorContext<'a>) -> Self {
        Self { cx }
    }

    pub fn analyze(&self) -> BTreeSet<InstId> {
        let func = self.cx.func;
        let mut flagged = BTreeSet::new();
        for inst in func.inst_ids() {
            if let Some(ptr) = self.dangling_use(inst) {
                info!(
                    "use after free in {}: `{}` uses {} ({})",
                    func.name,
                    func.render(inst),
                    func.value_name(ptr),
                    self.cx.state_before(inst, ptr)
                );
                flagged.insert(inst);
            }
        }
        flagged
    }

    /// First pointer operand of `inst` that may dangle.
    fn dangling_use(&self, inst: InstId) -> Option<ValueId> {
        let func = self.cx.func;
        match &func.inst(inst).kind {
            InstKind::Load { ptr } | InstKind::Store { ptr, .. } => {
                if self.is_stack_slot(*ptr) {
                    None
                } else {
                    Some(*ptr).filter(|p| self.cx.may_dangle(inst, *p))
                }
            }
            InstKind::Call { args, .. } => args
                .iter()
                .copied()
                .filter(|a| func.is_pointer(*a) && !self.is_stack_slot(*a))
                .find(|a| self.cx.may_dangle(inst, *a)),
            _ => None,
        }
    }

    fn is_stack_slot(&self, v: ValueId) -> bool {
        matches!(self.cx.func.defining_kind(v), Some(InstKind::Alloca))
    }
}
