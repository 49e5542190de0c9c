//! Allocation-state transfer functions.
//!
//! Each instruction only reports what it writes; the engine overlays the
//! writes on the incoming state. Every write is a monotone function of the
//! incoming state: a larger In never produces a smaller write.
//!
//! Copies of pointers (casts, indexed addresses, phis) are resolved by
//! joining the copy's own state with the states along its copy chain, at
//! most `trace_depth` steps back.

use std::collections::HashSet;

use log::trace;

use crate::config::{CallClassifier, HeapApi};
use crate::dataflow::Transfer;
use crate::domain::{AllocState, Domain, Memory, Nullness};
use crate::ir::{Callee, Function, InstId, InstKind, ValueId};
use crate::pointer_analysis::AliasOracle;

/// Domain of `v` in `mem` joined with the domains of the values it was copied from.
pub fn resolve(func: &Function, mem: &Memory, v: ValueId, trace_depth: usize) -> Domain {
    if func.value(v).is_null() {
        return Domain::new(AllocState::Uninit, Nullness::Null);
    }
    let mut acc = Domain::UNINIT;
    let mut seen = HashSet::new();
    let mut worklist = vec![(v, 0usize)];
    while let Some((cur, depth)) = worklist.pop() {
        if !seen.insert(cur) {
            continue;
        }
        acc = acc.join(mem.get(cur));
        if depth >= trace_depth {
            continue;
        }
        match func.defining_kind(cur) {
            Some(InstKind::Cast { operand }) | Some(InstKind::IndexedAddress { base: operand, .. }) => {
                worklist.push((*operand, depth + 1));
            }
            Some(InstKind::Phi { incoming }) => {
                for (value, _) in incoming {
                    worklist.push((*value, depth + 1));
                }
            }
            _ => {}
        }
    }
    acc
}

/// Stack slot a freed pointer was loaded from, found by stripping casts and
/// indexed addresses: `free((char *)p)` frees the contents of `p`'s slot.
pub fn freed_slot(func: &Function, arg: ValueId, trace_depth: usize) -> Option<ValueId> {
    let mut cur = arg;
    for _ in 0..=trace_depth {
        match func.defining_kind(cur)? {
            InstKind::Cast { operand } | InstKind::IndexedAddress { base: operand, .. } => {
                cur = *operand;
            }
            InstKind::Load { ptr } => return Some(*ptr),
            _ => return None,
        }
    }
    None
}

pub struct AllocStateTransfer<'a, A: AliasOracle> {
    func: &'a Function,
    oracle: &'a A,
    classifier: &'a CallClassifier,
    pointers: Vec<ValueId>,
    trace_depth: usize,
}

impl<'a, A: AliasOracle> AllocStateTransfer<'a, A> {
    pub fn new(
        func: &'a Function,
        oracle: &'a A,
        classifier: &'a CallClassifier,
        trace_depth: usize,
    ) -> Self {
        Self {
            func,
            oracle,
            classifier,
            pointers: func.pointer_values(),
            trace_depth,
        }
    }

    pub fn resolve(&self, mem: &Memory, v: ValueId) -> Domain {
        resolve(self.func, mem, v, self.trace_depth)
    }

    fn pointer_result(&self, inst: InstId) -> Option<ValueId> {
        self.func.inst(inst).result.filter(|r| self.func.is_pointer(*r))
    }

    fn transfer_call(&self, inst: InstId, callee: &Callee, args: &[ValueId], input: &Memory, writes: &mut Memory) {
        let api = match callee {
            Callee::Direct(name) => self.classifier.classify(name),
            Callee::Indirect(_) => None,
        };
        match api {
            Some(HeapApi::Alloc) => {
                if let Some(r) = self.pointer_result(inst) {
                    writes.set(r, Domain::new(AllocState::Live, Nullness::NotNull));
                }
            }
            Some(HeapApi::Dealloc) => {
                if let Some(arg) = args.first().copied() {
                    self.transfer_free(arg, input, writes);
                }
            }
            None => {
                // unknown provenance
                if let Some(r) = self.pointer_result(inst) {
                    writes.set(r, Domain::UNINIT);
                }
            }
        }
    }

    fn transfer_free(&self, arg: ValueId, input: &Memory, writes: &mut Memory) {
        if self.func.value(arg).is_null() {
            return;
        }
        let freed = |v: ValueId| input.get(v).with_state(AllocState::Freed);
        writes.set(arg, freed(arg));
        if let Some(slot) = freed_slot(self.func, arg, self.trace_depth) {
            trace!("free({}) through slot {}", self.func.value_name(arg), self.func.value_name(slot));
            writes.set(slot, freed(slot));
        }
        for v in self.pointers.iter().copied() {
            if v != arg && self.oracle.alias(arg, v) {
                writes.set(v, freed(v));
            }
        }
    }
}

impl<'a, A: AliasOracle> Transfer for AllocStateTransfer<'a, A> {
    type Value = Domain;

    fn transfer(&self, inst: InstId, input: &Memory) -> Memory {
        let mut writes = Memory::new();
        let func = self.func;
        match &func.inst(inst).kind {
            InstKind::Call { callee, args } => {
                self.transfer_call(inst, callee, args, input, &mut writes);
            }
            InstKind::Load { ptr } => {
                if let Some(r) = self.pointer_result(inst) {
                    // an earlier free of an alias may already have marked r
                    let loaded = input.get(r).join(self.resolve(input, *ptr));
                    writes.set(r, loaded);
                }
            }
            InstKind::Store { value, ptr } => {
                if func.is_pointer(*value) {
                    let current = input.get(*ptr);
                    let stored = if func.value(*value).is_null() {
                        current.with_null(Nullness::Null)
                    } else {
                        current.join(self.resolve(input, *value))
                    };
                    writes.set(*ptr, stored);
                }
            }
            InstKind::Cast { operand } | InstKind::IndexedAddress { base: operand, .. } => {
                if let Some(r) = func.inst(inst).result {
                    if func.is_pointer(r) || func.is_pointer(*operand) {
                        writes.set(r, self.resolve(input, *operand));
                    }
                }
            }
            InstKind::Phi { incoming } => {
                if let Some(r) = self.pointer_result(inst) {
                    let joined = incoming
                        .iter()
                        .fold(Domain::UNINIT, |acc, (v, _)| acc.join(self.resolve(input, *v)));
                    writes.set(r, joined);
                }
            }
            InstKind::Alloca
            | InstKind::Branch { .. }
            | InstKind::Return { .. }
            | InstKind::Compare { .. }
            | InstKind::Binary { .. }
            | InstKind::Other { .. } => {}
        }
        writes
    }

    /// Parameters denote valid caller storage on entry.
    fn entry_state(&self) -> Memory {
        let mut mem = Memory::new();
        for param in self.func.params.iter() {
            mem.set(*param, Domain::of(AllocState::Live));
        }
        mem
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::cfg::Cfg;
    use crate::config::AnalysisConfig;
    use crate::dataflow::ChaoticIteration;
    use crate::ir::{FunctionBuilder, Type};
    use crate::pointer_analysis::PointerAnalysis;

    struct NoAlias;

    impl AliasOracle for NoAlias {
        fn alias(&self, _: ValueId, _: ValueId) -> bool {
            false
        }

        fn nullness(&self, _: ValueId) -> Nullness {
            Nullness::Unknown
        }
    }

    #[test]
    fn test_resolve_through_casts_is_bounded() {
        let mut fb = FunctionBuilder::new("chain");
        let entry = fb.block("entry");
        let m = fb.call_ptr(entry, "m", "malloc", &[]);
        let c1 = fb.cast(entry, "c1", Type::Pointer, m);
        let c2 = fb.cast(entry, "c2", Type::Pointer, c1);
        let c3 = fb.index(entry, "c3", c2, &[]);
        fb.ret(entry, None);
        let func = fb.finish().unwrap();

        let mut mem = Memory::new();
        mem.set(m, Domain::of(AllocState::Freed));
        assert_eq!(resolve(&func, &mem, c3, 4).state, AllocState::Freed);
        assert_eq!(resolve(&func, &mem, c3, 3).state, AllocState::Freed);
        assert_eq!(resolve(&func, &mem, c3, 2).state, AllocState::Uninit);
        let null = {
            let mut fb = FunctionBuilder::new("n");
            let entry = fb.block("entry");
            let null = fb.null();
            fb.ret(entry, None);
            (fb.finish().unwrap(), null)
        };
        assert_eq!(resolve(&null.0, &Memory::new(), null.1, 4).null, Nullness::Null);
    }

    #[test]
    fn test_writes_grow_with_input() {
        let mut fb = FunctionBuilder::new("grow");
        let entry = fb.block("entry");
        let p = fb.alloca(entry, "p");
        let m = fb.call_ptr(entry, "m", "malloc", &[]);
        let c = fb.cast(entry, "c", Type::Pointer, m);
        let l = fb.load(entry, "l", Type::Pointer, p);
        fb.ret(entry, None);
        let func = fb.finish().unwrap();
        let load = func.defining_inst(l).unwrap();

        let classifier = AnalysisConfig::default().classifier().unwrap();
        let transfer = AllocStateTransfer::new(&func, &NoAlias, &classifier, 4);

        let mut small = Memory::new();
        small.set(p, Domain::new(AllocState::MaybeFreed, Nullness::NotNull));
        small.set(m, Domain::of(AllocState::Freed));
        let mut large = small.clone();
        large.set(l, Domain::new(AllocState::Live, Nullness::Null));
        large.set(c, Domain::of(AllocState::Live));

        let before = transfer.transfer(load, &small).get(l);
        let after = transfer.transfer(load, &large).get(l);
        assert_eq!(before, Domain::new(AllocState::MaybeFreed, Nullness::NotNull));
        assert_eq!(after, Domain::new(AllocState::MaybeFreed, Nullness::MaybeNull));

        assert_eq!(resolve(&func, &small, c, 4).state, AllocState::Freed);
        assert_eq!(resolve(&func, &large, c, 4).state, AllocState::MaybeFreed);
    }

    #[test]
    fn test_freed_slot_strips_casts() {
        let mut fb = FunctionBuilder::new("slot");
        let entry = fb.block("entry");
        let p = fb.alloca(entry, "p");
        let l = fb.load(entry, "l", Type::Pointer, p);
        let c = fb.cast(entry, "c", Type::Pointer, l);
        let m = fb.call_ptr(entry, "m", "malloc", &[]);
        fb.ret(entry, None);
        let func = fb.finish().unwrap();

        assert_eq!(freed_slot(&func, c, 4), Some(p));
        assert_eq!(freed_slot(&func, l, 0), Some(p));
        assert_eq!(freed_slot(&func, c, 0), None);
        assert_eq!(freed_slot(&func, m, 4), None);
    }

    #[test]
    fn test_free_marks_argument_and_slot() {
        let mut fb = FunctionBuilder::new("free_twice");
        let entry = fb.block("entry");
        let p = fb.alloca(entry, "p");
        let m = fb.call_ptr(entry, "m", "malloc", &[]);
        fb.store(entry, m, p);
        let l1 = fb.load(entry, "l1", Type::Pointer, p);
        let first = fb.call(entry, "free", &[l1]);
        let l2 = fb.load(entry, "l2", Type::Pointer, p);
        let second = fb.call(entry, "free", &[l2]);
        fb.ret(entry, None);
        let func = fb.finish().unwrap();

        let classifier = AnalysisConfig::default().classifier().unwrap();
        let cfg = Cfg::new(&func);
        let transfer = AllocStateTransfer::new(&func, &NoAlias, &classifier, 4);
        let fixpoint = ChaoticIteration::new(&func, &cfg, transfer, 1000).run();

        let before_first = fixpoint.input(first);
        assert_eq!(before_first.get(m), Domain::new(AllocState::Live, Nullness::NotNull));
        assert_eq!(before_first.get(p).state, AllocState::Live);
        assert_eq!(before_first.get(l1).state, AllocState::Live);

        let before_second = fixpoint.input(second);
        assert_eq!(before_second.get(p).state, AllocState::Freed);
        assert_eq!(before_second.get(l2).state, AllocState::Freed);
        // no alias information: m itself is untouched
        assert_eq!(before_second.get(m).state, AllocState::Live);
    }

    #[test]
    fn test_free_propagates_to_aliases() {
        let mut fb = FunctionBuilder::new("aliases");
        let entry = fb.block("entry");
        let m = fb.call_ptr(entry, "m", "malloc", &[]);
        let c = fb.cast(entry, "c", Type::Pointer, m);
        let other = fb.call_ptr(entry, "other", "malloc", &[]);
        fb.call(entry, "free", &[c]);
        let ret = fb.ret(entry, None);
        let func = fb.finish().unwrap();

        let info = PointerAnalysis::new(&func, 100).analyze();
        let classifier = AnalysisConfig::default().classifier().unwrap();
        let cfg = Cfg::new(&func);
        let transfer = AllocStateTransfer::new(&func, &info, &classifier, 4);
        let fixpoint = ChaoticIteration::new(&func, &cfg, transfer, 1000).run();

        let at_ret = fixpoint.input(ret);
        assert_eq!(at_ret.get(c).state, AllocState::Freed);
        assert_eq!(at_ret.get(m), Domain::new(AllocState::Freed, Nullness::NotNull));
        assert_eq!(at_ret.get(other).state, AllocState::Live);
    }

    #[test]
    fn test_null_store_and_unknown_calls() {
        let mut fb = FunctionBuilder::new("reset");
        let a = fb.param("a", Type::Pointer);
        let entry = fb.block("entry");
        let p = fb.alloca(entry, "p");
        let m = fb.call_ptr(entry, "m", "malloc", &[]);
        fb.store(entry, m, p);
        let null = fb.null();
        fb.store(entry, null, p);
        let u = fb.call_ptr(entry, "u", "lookup", &[a]);
        let ret = fb.ret(entry, None);
        let func = fb.finish().unwrap();

        let classifier = AnalysisConfig::default().classifier().unwrap();
        let cfg = Cfg::new(&func);
        let transfer = AllocStateTransfer::new(&func, &NoAlias, &classifier, 4);
        let fixpoint = ChaoticIteration::new(&func, &cfg, transfer, 1000).run();

        let at_ret = fixpoint.input(ret);
        assert_eq!(at_ret.get(p), Domain::new(AllocState::Live, Nullness::Null));
        assert_eq!(at_ret.get(u), Domain::UNINIT);
        assert_eq!(at_ret.get(a).state, AllocState::Live);
    }
}
