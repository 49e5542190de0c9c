//! Dataflow analysis by chaotic iteration.
//!
//! Per instruction:
//! 1. flow_in: In = join of the Out of every predecessor instruction
//!    (instructions without predecessors also get the transfer's entry state)
//! 2. transfer: the instruction's local writes, computed from In
//! 3. flow_out: Out = In overlaid with the writes; if Out changed, the
//!    successors are queued again
//! Any monotone `Transfer` over a finite-height lattice reaches the same
//! fixpoint whatever order the worklist is drained in.

use log::{debug, trace, warn};
use std::collections::{HashSet, VecDeque};

use crate::cfg::Cfg;
use crate::domain::{Lattice, Memory};
use crate::ir::{Function, InstId};
use crate::util::ProgramPoint;

pub trait Transfer {
    type Value: Lattice;

    /// Writes performed by `inst` given its incoming state.
    fn transfer(&self, inst: InstId, input: &Memory<Self::Value>) -> Memory<Self::Value>;

    /// Facts holding on entry to instructions that have no predecessor.
    fn entry_state(&self) -> Memory<Self::Value> {
        Memory::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorklistOrder {
    Lifo,
    Fifo,
}

/// Converged per-instruction states, indexed by `InstId`.
#[derive(Debug, Clone)]
pub struct Fixpoint<D: Lattice> {
    pub in_map: Vec<Memory<D>>,
    pub out_map: Vec<Memory<D>>,
    pub iterations: usize,
    pub converged: bool,
}

impl<D: Lattice> Fixpoint<D> {
    pub fn input(&self, inst: InstId) -> &Memory<D> {
        &self.in_map[inst.index()]
    }

    pub fn output(&self, inst: InstId) -> &Memory<D> {
        &self.out_map[inst.index()]
    }
}

pub struct ChaoticIteration<'a, T: Transfer> {
    func: &'a Function,
    transfer: T,
    preds: Vec<Vec<InstId>>,
    succs: Vec<Vec<InstId>>,
    max_iterations: usize,
    order: WorklistOrder,
}

impl<'a, T: Transfer> ChaoticIteration<'a, T> {
    pub fn new(func: &'a Function, cfg: &Cfg, transfer: T, max_iterations: usize) -> Self {
        let mut preds = vec![Vec::new(); func.insts.len()];
        let mut succs = vec![Vec::new(); func.insts.len()];
        for inst in func.inst_ids() {
            if let Some(point) = ProgramPoint::new(func, cfg, inst) {
                preds[inst.index()] = point.predecessors();
                succs[inst.index()] = point.successors();
            }
        }
        Self {
            func,
            transfer,
            preds,
            succs,
            max_iterations,
            order: WorklistOrder::Lifo,
        }
    }

    pub fn with_order(mut self, order: WorklistOrder) -> Self {
        self.order = order;
        self
    }

    pub fn predecessors(&self, inst: InstId) -> &[InstId] {
        &self.preds[inst.index()]
    }

    pub fn successors(&self, inst: InstId) -> &[InstId] {
        &self.succs[inst.index()]
    }

    pub fn run(&self) -> Fixpoint<T::Value> {
        let n = self.func.insts.len();
        let mut fixpoint = Fixpoint {
            in_map: vec![Memory::new(); n],
            out_map: vec![Memory::new(); n],
            iterations: 0,
            converged: true,
        };
        let entry_state = self.transfer.entry_state();

        // program order; Lifo pops the last instruction first
        let mut worklist: VecDeque<InstId> = self.func.inst_ids().collect();
        let mut queued: HashSet<InstId> = worklist.iter().copied().collect();

        while let Some(inst) = self.pop(&mut worklist) {
            queued.remove(&inst);
            fixpoint.iterations += 1;
            if fixpoint.iterations > self.max_iterations {
                warn!(
                    "dataflow analysis of {} stopped after {} iterations",
                    self.func.name, self.max_iterations
                );
                fixpoint.converged = false;
                break;
            }

            let mut input = self.flow_in(inst, &fixpoint.out_map);
            if self.preds[inst.index()].is_empty() {
                input.overlay(&entry_state);
            }
            let writes = self.transfer.transfer(inst, &input);
            trace!(
                "{}: in {} -> writes {}",
                inst,
                input.len(),
                writes.len()
            );
            let changed = self.flow_out(inst, &input, &writes, &mut fixpoint.out_map);
            fixpoint.in_map[inst.index()] = input;
            if changed {
                for succ in self.succs[inst.index()].iter() {
                    if queued.insert(*succ) {
                        worklist.push_back(*succ);
                    }
                }
            }
        }
        debug!(
            "dataflow analysis of {} finished after {} iterations",
            self.func.name, fixpoint.iterations
        );
        fixpoint
    }

    /// Join of the Out states of every predecessor.
    pub fn flow_in(&self, inst: InstId, out_map: &[Memory<T::Value>]) -> Memory<T::Value> {
        let mut input = Memory::new();
        for pred in self.preds[inst.index()].iter() {
            input.join_assign(&out_map[pred.index()]);
        }
        input
    }

    /// Stores `pre` overlaid with `post` as the new Out of `inst`; true if it differs from the old one.
    pub fn flow_out(
        &self,
        inst: InstId,
        pre: &Memory<T::Value>,
        post: &Memory<T::Value>,
        out_map: &mut [Memory<T::Value>],
    ) -> bool {
        let mut out = pre.clone();
        out.overlay(post);
        let slot = &mut out_map[inst.index()];
        if *slot == out {
            false
        } else {
            *slot = out;
            true
        }
    }

    fn pop(&self, worklist: &mut VecDeque<InstId>) -> Option<InstId> {
        match self.order {
            WorklistOrder::Lifo => worklist.pop_back(),
            WorklistOrder::Fifo => worklist.pop_front(),
        }
    }
}
