//! Flow-insensitive points-to analysis.
//!
//! One global graph for the whole function:
//!   Var(v) -> Obj(l): variable v may hold the address of location l
//!   Obj(l) -> Obj(m): location l may store the address of location m
//! Locations are allocation sites (allocas and pointer-returning calls),
//! one per pointer parameter, and the NULL sentinel.
//! All instructions are re-applied in passes until no fact is added and
//! no nullness changes. The graph only grows and the location universe is
//! finite, so the loop terminates.
//!
//! The result is frozen into a `PointsToInfo`, read-only afterwards.

use log::{debug, trace, warn};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::domain::Nullness;
use crate::ir::{Function, InstId, InstKind, ValueId, ValueKind};
use crate::util::Graph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AbstractLocation {
    Null,
    /// Storage supplied by the caller through parameter #n.
    Param(usize),
    Site(InstId),
}

impl AbstractLocation {
    pub fn is_null(self) -> bool {
        self == AbstractLocation::Null
    }
}

impl fmt::Display for AbstractLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbstractLocation::Null => write!(f, "NULL"),
            AbstractLocation::Param(n) => write!(f, "@arg{}", n),
            AbstractLocation::Site(inst) => write!(f, "@{}", inst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemCell {
    Var(ValueId),
    Obj(AbstractLocation),
}

pub type PointsToSet = BTreeSet<AbstractLocation>;

/// Nullness of a points-to set.
pub fn nullness_of<'a, I>(locations: I) -> Nullness
where
    I: IntoIterator<Item = &'a AbstractLocation>,
{
    let mut has_null = false;
    let mut has_addr = false;
    for loc in locations {
        if loc.is_null() {
            has_null = true;
        } else {
            has_addr = true;
        }
    }
    match (has_null, has_addr) {
        (true, false) => Nullness::Null,
        (false, true) => Nullness::NotNull,
        (true, true) => Nullness::MaybeNull,
        (false, false) => Nullness::Unknown,
    }
}

/// Read-only alias queries consumed by the allocation-state transfer functions.
pub trait AliasOracle {
    fn alias(&self, a: ValueId, b: ValueId) -> bool;

    fn nullness(&self, v: ValueId) -> Nullness;
}

pub struct PointerAnalysis<'a> {
    func: &'a Function,
    pts: Graph<MemCell>,
    nullness: HashMap<MemCell, Nullness>,
    null_changed: bool,
    passes: usize,
    max_passes: usize,
}

impl<'a> PointerAnalysis<'a> {
    pub fn new(func: &'a Function, max_passes: usize) -> Self {
        let mut pts = Graph::new();
        // arg -> Obj(arg)
        for (idx, param) in func.params.iter().enumerate() {
            if func.is_pointer(*param) {
                pts.add_edge(MemCell::Var(*param), MemCell::Obj(AbstractLocation::Param(idx)));
            }
        }
        Self {
            func,
            pts,
            nullness: HashMap::new(),
            null_changed: false,
            passes: 0,
            max_passes,
        }
    }

    pub fn analyze(mut self) -> PointsToInfo {
        while self.step() {
            if self.passes >= self.max_passes {
                warn!(
                    "points-to analysis of {} stopped after {} passes",
                    self.func.name, self.passes
                );
                break;
            }
        }
        debug!(
            "points-to analysis of {} converged after {} passes with {} facts",
            self.func.name,
            self.passes,
            self.pts.edge_count()
        );
        let info = self.freeze();
        trace!("{}", info.render(self.func));
        info
    }

    /// One pass over every instruction. Returns true if anything changed.
    pub fn step(&mut self) -> bool {
        let old_facts = self.pts.edge_count();
        self.null_changed = false;
        let func = self.func;
        for inst in func.inst_ids() {
            self.transfer(inst);
        }
        self.passes += 1;
        self.pts.edge_count() > old_facts || self.null_changed
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    /// Current points-to set of `v`.
    pub fn points_to(&self, v: ValueId) -> PointsToSet {
        self.value_points_to(v).into_iter().collect()
    }

    fn transfer(&mut self, inst_id: InstId) {
        let func = self.func;
        let inst = func.inst(inst_id);
        let result = inst.result;
        let pointer_result = result.filter(|r| func.is_pointer(*r));
        match &inst.kind {
            InstKind::Alloca => {
                if let Some(r) = result {
                    self.add_var_facts(r, vec![AbstractLocation::Site(inst_id)]);
                }
            }
            InstKind::Store { value, ptr } => {
                if !func.is_pointer(*value) {
                    return;
                }
                let stored = self.value_points_to(*value);
                let targets = self.value_points_to(*ptr);
                for target in targets {
                    if target.is_null() {
                        continue;
                    }
                    let cell = MemCell::Obj(target);
                    if self
                        .pts
                        .add_edges(cell, stored.iter().map(|loc| MemCell::Obj(*loc)))
                    {
                        self.refresh_nullness(cell);
                    }
                }
            }
            InstKind::Load { ptr } => {
                if let Some(r) = pointer_result {
                    let cells = self
                        .value_points_to(*ptr)
                        .into_iter()
                        .filter(|loc| !loc.is_null())
                        .map(MemCell::Obj);
                    let loaded: Vec<AbstractLocation> = self
                        .pts
                        .batch_neighbors(cells)
                        .into_iter()
                        .filter_map(location)
                        .collect();
                    self.add_var_facts(r, loaded);
                }
            }
            InstKind::Call { .. } => {
                // unknown callees may return fresh or existing memory; one site either way
                if let Some(r) = pointer_result {
                    self.add_var_facts(r, vec![AbstractLocation::Site(inst_id)]);
                }
            }
            InstKind::Cast { operand: base } | InstKind::IndexedAddress { base, .. } => {
                if let Some(r) = pointer_result {
                    if func.is_pointer(*base) {
                        let locs: Vec<_> = self.value_points_to(*base).into_iter().collect();
                        self.add_var_facts(r, locs);
                    }
                }
            }
            InstKind::Phi { incoming } => {
                if let Some(r) = pointer_result {
                    let mut locs = Vec::new();
                    for (value, _) in incoming {
                        if func.is_pointer(*value) {
                            locs.extend(self.value_points_to(*value));
                        }
                    }
                    self.add_var_facts(r, locs);
                }
            }
            InstKind::Branch { .. }
            | InstKind::Return { .. }
            | InstKind::Compare { .. }
            | InstKind::Binary { .. }
            | InstKind::Other { .. } => {}
        }
    }

    fn add_var_facts(&mut self, var: ValueId, locs: Vec<AbstractLocation>) {
        let cell = MemCell::Var(var);
        self.pts.add_node(cell);
        if self
            .pts
            .add_edges(cell, locs.into_iter().map(MemCell::Obj))
        {
            self.refresh_nullness(cell);
        }
    }

    fn refresh_nullness(&mut self, cell: MemCell) {
        let new_state = self.cell_nullness(cell);
        let old_state = self.nullness.insert(cell, new_state);
        if old_state != Some(new_state) {
            self.null_changed = true;
        }
    }

    fn cell_nullness(&self, cell: MemCell) -> Nullness {
        match self.pts.neighbors(cell) {
            Some(tos) => {
                let locs: Vec<AbstractLocation> = tos.iter().copied().filter_map(location).collect();
                nullness_of(locs.iter())
            }
            None => Nullness::Unknown,
        }
    }

    /// A literal null denotes {NULL}; constants other than null denote nothing.
    fn value_points_to(&self, v: ValueId) -> HashSet<AbstractLocation> {
        match self.func.value(v).kind {
            ValueKind::NullPtr => {
                let mut set = HashSet::new();
                set.insert(AbstractLocation::Null);
                set
            }
            _ => self
                .pts
                .neighbors(MemCell::Var(v))
                .map(|tos| tos.iter().copied().filter_map(location).collect())
                .unwrap_or_default(),
        }
    }

    fn freeze(&self) -> PointsToInfo {
        let mut vars = HashMap::new();
        let mut contents = HashMap::new();
        for node in self.pts.nodes.iter() {
            let set: PointsToSet = self
                .pts
                .neighbors(*node)
                .map(|tos| tos.iter().copied().filter_map(location).collect())
                .unwrap_or_default();
            match node {
                MemCell::Var(v) => {
                    vars.insert(*v, set);
                }
                MemCell::Obj(loc) => {
                    if !set.is_empty() {
                        contents.insert(*loc, set);
                    }
                }
            }
        }
        // NULL literals are never graph nodes but still have a nullness
        for (idx, value) in self.func.values.iter().enumerate() {
            if value.is_null() {
                let mut set = PointsToSet::new();
                set.insert(AbstractLocation::Null);
                vars.insert(ValueId::from_index(idx), set);
            }
        }
        let nullness = vars
            .iter()
            .map(|(v, set)| (*v, nullness_of(set.iter())))
            .collect();
        PointsToInfo {
            vars,
            contents,
            nullness,
            passes: self.passes,
            facts: self.pts.edge_count(),
        }
    }
}

fn location(cell: MemCell) -> Option<AbstractLocation> {
    match cell {
        MemCell::Obj(loc) => Some(loc),
        MemCell::Var(_) => None,
    }
}

/// Converged points-to facts of one function.
#[derive(Debug, Clone, Default)]
pub struct PointsToInfo {
    vars: HashMap<ValueId, PointsToSet>,
    contents: HashMap<AbstractLocation, PointsToSet>,
    nullness: HashMap<ValueId, Nullness>,
    passes: usize,
    facts: usize,
}

impl PointsToInfo {
    pub fn points_to(&self, v: ValueId) -> Option<&PointsToSet> {
        self.vars.get(&v)
    }

    /// Locations whose addresses may be stored in `loc`.
    pub fn contents(&self, loc: AbstractLocation) -> Option<&PointsToSet> {
        self.contents.get(&loc)
    }

    /// True iff the two sets share a real location; NULL never aliases.
    pub fn alias(&self, a: ValueId, b: ValueId) -> bool {
        match (self.vars.get(&a), self.vars.get(&b)) {
            (Some(sa), Some(sb)) => sa.intersection(sb).any(|loc| !loc.is_null()),
            _ => false,
        }
    }

    pub fn nullness(&self, v: ValueId) -> Nullness {
        self.nullness.get(&v).copied().unwrap_or_default()
    }

    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn fact_count(&self) -> usize {
        self.facts
    }

    /// Variables with a points-to entry, sorted.
    pub fn variables(&self) -> Vec<ValueId> {
        let mut vars: Vec<ValueId> = self.vars.keys().copied().collect();
        vars.sort();
        vars
    }

    pub fn render(&self, func: &Function) -> String {
        let mut out = String::from("Pointer Analysis Results:\n");
        for var in self.variables() {
            let locs: Vec<String> = self.vars[&var].iter().map(|l| l.to_string()).collect();
            out.push_str(&format!(
                "  {}: {{ {} }} {}\n",
                func.value_name(var),
                locs.join("; "),
                self.nullness(var)
            ));
        }
        let mut locs: Vec<&AbstractLocation> = self.contents.keys().collect();
        locs.sort();
        for loc in locs {
            let stored: Vec<String> = self.contents[loc].iter().map(|l| l.to_string()).collect();
            out.push_str(&format!("  *{}: {{ {} }}\n", loc, stored.join("; ")));
        }
        out
    }
}

impl AliasOracle for PointsToInfo {
    fn alias(&self, a: ValueId, b: ValueId) -> bool {
        PointsToInfo::alias(self, a, b)
    }

    fn nullness(&self, v: ValueId) -> Nullness {
        PointsToInfo::nullness(self, v)
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::ir::{FunctionBuilder, Type};

    /// p = malloc; q = p; free(*q) with everything spilled to stack slots.
    fn copy_through_slots() -> (Function, Vec<ValueId>) {
        let mut fb = FunctionBuilder::new("copy");
        let entry = fb.block("entry");
        let p = fb.alloca(entry, "p");
        let q = fb.alloca(entry, "q");
        let m = fb.call_ptr(entry, "m", "malloc", &[]);
        fb.store(entry, m, p);
        let p1 = fb.load(entry, "p1", Type::Pointer, p);
        fb.store(entry, p1, q);
        let q1 = fb.load(entry, "q1", Type::Pointer, q);
        let c = fb.cast(entry, "c", Type::Pointer, q1);
        fb.call(entry, "free", &[c]);
        fb.ret(entry, None);
        (fb.finish().unwrap(), vec![p, q, m, p1, q1, c])
    }

    #[test]
    fn test_points_to_through_slots() {
        let (func, vs) = copy_through_slots();
        let (p, q, m, p1, q1, c) = (vs[0], vs[1], vs[2], vs[3], vs[4], vs[5]);
        let info = PointerAnalysis::new(&func, 100).analyze();

        let site_m = AbstractLocation::Site(func.defining_inst(m).unwrap());
        assert_eq!(info.points_to(m).unwrap().len(), 1);
        assert!(info.points_to(q1).unwrap().contains(&site_m));
        assert!(info.points_to(c).unwrap().contains(&site_m));

        assert!(info.alias(m, p1));
        assert!(info.alias(m, c));
        assert!(!info.alias(p, q));
        assert!(!info.alias(p, m));
        let slot_q = AbstractLocation::Site(func.defining_inst(q).unwrap());
        assert!(info.contents(slot_q).unwrap().contains(&site_m));
        assert!(info.fact_count() >= 8);
        assert_eq!(info.nullness(c), Nullness::NotNull);
    }

    #[test]
    fn test_alias_is_symmetric() {
        let (func, _) = copy_through_slots();
        let info = PointerAnalysis::new(&func, 100).analyze();
        let ptrs = func.pointer_values();
        for a in &ptrs {
            for b in &ptrs {
                assert_eq!(info.alias(*a, *b), info.alias(*b, *a));
            }
        }
    }

    #[test]
    fn test_null_store_gives_maybe_null() {
        let mut fb = FunctionBuilder::new("nulling");
        let entry = fb.block("entry");
        let p = fb.alloca(entry, "p");
        let m = fb.call_ptr(entry, "m", "malloc", &[]);
        fb.store(entry, m, p);
        let null = fb.null();
        fb.store(entry, null, p);
        let x = fb.load(entry, "x", Type::Pointer, p);
        fb.ret(entry, None);
        let func = fb.finish().unwrap();
        let info = PointerAnalysis::new(&func, 100).analyze();

        assert_eq!(info.nullness(x), Nullness::MaybeNull);
        assert_eq!(info.nullness(p), Nullness::NotNull);
        assert_eq!(info.nullness(null), Nullness::Null);
        // NULL is shared by x and the literal but is not a location
        assert!(!info.alias(x, null));
    }

    #[test]
    fn test_params_get_caller_storage() {
        let mut fb = FunctionBuilder::new("params");
        let a = fb.param("a", Type::Pointer);
        let n = fb.param("n", Type::Integer);
        let entry = fb.block("entry");
        let g = fb.index(entry, "g", a, &[n]);
        fb.ret(entry, None);
        let func = fb.finish().unwrap();
        let info = PointerAnalysis::new(&func, 100).analyze();

        let expected: PointsToSet = vec![AbstractLocation::Param(0)].into_iter().collect();
        assert_eq!(info.points_to(a), Some(&expected));
        assert_eq!(info.points_to(g), Some(&expected));
        assert!(info.points_to(n).is_none());
        assert!(info.alias(a, g));
    }

    #[test]
    fn test_phi_unions_incoming() {
        let mut fb = FunctionBuilder::new("phi");
        let entry = fb.block("entry");
        let left = fb.block("left");
        let right = fb.block("right");
        let join = fb.block("join");
        let zero = fb.const_int(0);
        let c = fb.compare(entry, "c", crate::ir::CmpPred::Eq, zero, zero);
        fb.cond_br(entry, c, left, right);
        let a = fb.call_ptr(left, "a", "malloc", &[]);
        fb.br(left, join);
        let b = fb.call_ptr(right, "b", "malloc", &[]);
        fb.br(right, join);
        let p = fb.phi(join, "p", Type::Pointer, &[(a, left), (b, right)]);
        fb.ret(join, None);
        let func = fb.finish().unwrap();
        let info = PointerAnalysis::new(&func, 100).analyze();

        assert_eq!(info.points_to(p).unwrap().len(), 2);
        assert!(info.alias(p, a));
        assert!(info.alias(p, b));
        assert!(!info.alias(a, b));
    }

    #[test]
    fn test_monotone_and_bounded() {
        // loads appear before the stores that feed them, so facts need several passes
        let mut fb = FunctionBuilder::new("backwards");
        let entry = fb.block("entry");
        let body = fb.block("body");
        let fill = fb.block("fill");
        fb.br(entry, fill);
        let p = fb.alloca(fill, "p");
        let q = fb.alloca(fill, "q");
        fb.br(fill, body);
        let q1 = fb.load(body, "q1", Type::Pointer, q);
        let p1 = fb.load(body, "p1", Type::Pointer, p);
        fb.store(body, p1, q);
        let m = fb.call_ptr(body, "m", "malloc", &[]);
        fb.store(body, m, p);
        fb.ret(body, None);
        let func = fb.finish().unwrap();

        let mut pa = PointerAnalysis::new(&func, 100);
        let ptrs = func.pointer_values();
        let mut previous: HashMap<ValueId, PointsToSet> = HashMap::new();
        while pa.step() {
            for v in &ptrs {
                let now = pa.points_to(*v);
                if let Some(before) = previous.get(v) {
                    assert!(before.is_subset(&now), "points-to set shrank");
                }
                previous.insert(*v, now);
            }
        }
        // four productive passes, then one that confirms the fixpoint
        assert_eq!(pa.passes(), 5);
        let locations = 3;
        assert!(pa.passes() <= (ptrs.len() + locations) * locations + 1);
        let site_m = AbstractLocation::Site(func.defining_inst(m).unwrap());
        assert!(pa.points_to(q1).contains(&site_m));
    }
}
