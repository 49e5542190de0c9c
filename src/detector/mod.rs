pub mod double_free;
pub mod null_deref;
pub mod use_after_free;

pub use double_free::DoubleFreeDetector;
pub use null_deref::NullDerefDetector;
pub use use_after_free::UseAfterFreeDetector;

use crate::cfg::Cfg;
use crate::config::{CallClassifier, HeapApi};
use crate::dataflow::Fixpoint;
use crate::domain::{Domain, Nullness};
use crate::ir::{Callee, Function, InstId, InstKind, ValueId};
use crate::pointer_analysis::PointsToInfo;
use crate::transfer;

/// Everything the checkers read. Nothing here is mutated once built.
pub struct DetectorContext<'a> {
    pub func: &'a Function,
    pub cfg: &'a Cfg,
    pub points_to: &'a PointsToInfo,
    pub states: &'a Fixpoint<Domain>,
    pub classifier: &'a CallClassifier,
    pub trace_depth: usize,
}

impl<'a> DetectorContext<'a> {
    /// Allocation state of `v` right before `inst` executes.
    pub fn state_before(&self, inst: InstId, v: ValueId) -> Domain {
        transfer::resolve(self.func, self.states.input(inst), v, self.trace_depth)
    }

    /// `v` may point to released memory before `inst`. A known NULL never does.
    pub fn may_dangle(&self, inst: InstId, v: ValueId) -> bool {
        let d = self.state_before(inst, v);
        d.state.may_be_freed() && d.null != Nullness::Null
    }

    /// Argument released by `inst` if it is a call to a deallocator.
    pub fn deallocated_arg(&self, inst: InstId) -> Option<ValueId> {
        match &self.func.inst(inst).kind {
            InstKind::Call {
                callee: Callee::Direct(name),
                args,
            } if self.classifier.classify(name) == Some(HeapApi::Dealloc) => args.first().copied(),
            _ => None,
        }
    }
}
