//! Double-Free Detector
//! Rules:
//! 1. The instruction calls a deallocator
//! 2. Its argument is Freed or MaybeFreed right before the call
//! 3. and is not known to be NULL (free(NULL) is a no-op)

use log::info;
use std::collections::BTreeSet;

use super::DetectorContext;
use crate::ir::InstId;

pub struct DoubleFreeDetector<'a, 'b> {
    cx: &'b DetectorContext<'a>,
}

impl<'a, 'b> DoubleFreeDetector<'a, 'b> {
    pub fn new(cx: &'b DetectorContext<'a>) -> Self {
        Self { cx }
    }

    pub fn analyze(&self) -> BTreeSet<InstId> {
        let func = self.cx.func;
        let mut flagged = BTreeSet::new();
        for inst in func.inst_ids() {
            let arg = match self.cx.deallocated_arg(inst) {
                Some(arg) => arg,
                None => continue,
            };
            if self.cx.may_dangle(inst, arg) {
                info!(
                    "double free in {}: `{}` releases {} ({})",
                    func.name,
                    func.render(inst),
                    func.value_name(arg),
                    self.cx.state_before(inst, arg)
                );
                flagged.insert(inst);
            }
        }
        flagged
    }
}
