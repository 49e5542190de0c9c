//! # domain
//!
//! Abstract domain of the allocation-state analysis.
//! AllocState: Uninit (bottom) <= Live, Freed <= MaybeFreed (top).
//! Nullness:   Unknown (bottom) <= Null, NotNull <= MaybeNull (top).
//! Domain is their product, joined component-wise.
//! Memory maps program variables to lattice values; a missing key is bottom.

use std::collections::BTreeMap;
use std::fmt::{self, Debug};

use crate::ir::{Function, ValueId};

/// Join semi-lattice with a bottom element.
pub trait Lattice: Clone + PartialEq + Debug {
    fn bottom() -> Self;

    fn join(&self, other: &Self) -> Self;

    fn is_bottom(&self) -> bool {
        *self == Self::bottom()
    }

    /// `self ⊑ other`
    fn le(&self, other: &Self) -> bool {
        self.join(other) == *other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AllocState {
    #[default]
    Uninit,
    Live,
    Freed,
    MaybeFreed,
}

impl AllocState {
    pub fn join(self, other: Self) -> Self {
        use AllocState::*;
        match (self, other) {
            (Uninit, x) | (x, Uninit) => x,
            (MaybeFreed, _) | (_, MaybeFreed) => MaybeFreed,
            (a, b) if a == b => a,
            _ => MaybeFreed,
        }
    }

    /// Freed or MaybeFreed.
    pub fn may_be_freed(self) -> bool {
        matches!(self, AllocState::Freed | AllocState::MaybeFreed)
    }
}

impl fmt::Display for AllocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AllocState::Uninit => "Uninit",
            AllocState::Live => "Live",
            AllocState::Freed => "Freed",
            AllocState::MaybeFreed => "MaybeFreed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Nullness {
    #[default]
    Unknown,
    Null,
    NotNull,
    MaybeNull,
}

impl Nullness {
    pub fn join(self, other: Self) -> Self {
        use Nullness::*;
        match (self, other) {
            (Unknown, x) | (x, Unknown) => x,
            (MaybeNull, _) | (_, MaybeNull) => MaybeNull,
            (a, b) if a == b => a,
            _ => MaybeNull,
        }
    }

    /// Null or MaybeNull.
    pub fn may_be_null(self) -> bool {
        matches!(self, Nullness::Null | Nullness::MaybeNull)
    }
}

impl fmt::Display for Nullness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Nullness::Unknown => "Unknown",
            Nullness::Null => "Null",
            Nullness::NotNull => "NotNull",
            Nullness::MaybeNull => "MaybeNull",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Domain {
    pub state: AllocState,
    pub null: Nullness,
}

impl Domain {
    pub const UNINIT: Domain = Domain::new(AllocState::Uninit, Nullness::Unknown);

    pub const fn new(state: AllocState, null: Nullness) -> Self {
        Self { state, null }
    }

    pub const fn of(state: AllocState) -> Self {
        Self::new(state, Nullness::Unknown)
    }

    pub fn join(self, other: Self) -> Self {
        Self {
            state: self.state.join(other.state),
            null: self.null.join(other.null),
        }
    }

    pub fn equal(self, other: Self) -> bool {
        self == other
    }

    pub fn with_state(self, state: AllocState) -> Self {
        Self { state, ..self }
    }

    pub fn with_null(self, null: Nullness) -> Self {
        Self { null, ..self }
    }
}

impl Lattice for Domain {
    fn bottom() -> Self {
        Domain::UNINIT
    }

    fn join(&self, other: &Self) -> Self {
        Domain::join(*self, *other)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.null == Nullness::Unknown {
            write!(f, "{}", self.state)
        } else {
            write!(f, "{}/{}", self.state, self.null)
        }
    }
}

/// Abstract state at one program point.
#[derive(Debug, Clone, Default)]
pub struct Memory<D: Lattice = Domain> {
    map: BTreeMap<ValueId, D>,
}

impl<D: Lattice> Memory<D> {
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
        }
    }

    /// Lattice value of `var`; bottom when unmapped.
    pub fn get(&self, var: ValueId) -> D {
        self.map.get(&var).cloned().unwrap_or_else(D::bottom)
    }

    pub fn set(&mut self, var: ValueId, value: D) {
        self.map.insert(var, value);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Pointwise join; a key missing on one side counts as bottom there.
    pub fn join(&self, other: &Self) -> Self {
        let mut result = self.clone();
        result.join_assign(other);
        result
    }

    pub fn join_assign(&mut self, other: &Self) {
        for (var, value) in other.map.iter() {
            let joined = match self.map.get(var) {
                Some(mine) => mine.join(value),
                None => value.clone(),
            };
            self.map.insert(*var, joined);
        }
    }

    /// Copies every entry of `post` over `self`; entries of `post` win.
    pub fn overlay(&mut self, post: &Self) {
        for (var, value) in post.map.iter() {
            self.map.insert(*var, value.clone());
        }
    }
}

impl<D: Lattice + fmt::Display> Memory<D> {
    pub fn render(&self, func: &Function) -> String {
        let entries: Vec<String> = self
            .map
            .iter()
            .filter(|(_, d)| !d.is_bottom())
            .map(|(v, d)| format!("{}: {}", func.value_name(*v), d))
            .collect();
        format!("[{}]", entries.join(", "))
    }
}

/// Missing keys compare equal to bottom.
impl<D: Lattice> PartialEq for Memory<D> {
    fn eq(&self, other: &Self) -> bool {
        self.map
            .keys()
            .chain(other.map.keys())
            .all(|var| self.get(*var) == other.get(*var))
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    const STATES: [AllocState; 4] = [
        AllocState::Uninit,
        AllocState::Live,
        AllocState::Freed,
        AllocState::MaybeFreed,
    ];
    const NULLS: [Nullness; 4] = [
        Nullness::Unknown,
        Nullness::Null,
        Nullness::NotNull,
        Nullness::MaybeNull,
    ];

    fn all_domains() -> Vec<Domain> {
        STATES
            .iter()
            .flat_map(|s| NULLS.iter().map(move |n| Domain::new(*s, *n)))
            .collect()
    }

    #[test]
    fn test_alloc_state_join_table() {
        use AllocState::*;
        assert_eq!(Uninit.join(Live), Live);
        assert_eq!(Freed.join(Uninit), Freed);
        assert_eq!(Live.join(Live), Live);
        assert_eq!(Freed.join(Freed), Freed);
        assert_eq!(Live.join(Freed), MaybeFreed);
        assert_eq!(MaybeFreed.join(Live), MaybeFreed);
        assert_eq!(Uninit.join(Uninit), Uninit);
    }

    #[test]
    fn test_nullness_join_table() {
        use Nullness::*;
        assert_eq!(Unknown.join(Null), Null);
        assert_eq!(NotNull.join(NotNull), NotNull);
        assert_eq!(Null.join(NotNull), MaybeNull);
        assert_eq!(MaybeNull.join(Unknown), MaybeNull);
    }

    #[test]
    fn test_lattice_laws() {
        let samples = all_domains();
        let bottom = Domain::bottom();
        let top = Domain::new(AllocState::MaybeFreed, Nullness::MaybeNull);
        for a in &samples {
            assert_eq!(Domain::join(bottom, *a), *a);
            assert_eq!(Domain::join(*a, *a), *a, "idempotence");
            assert!(a.equal(*a));
            assert_eq!(Domain::join(*a, top), top);
            assert_eq!(
                a.state.join(AllocState::MaybeFreed),
                AllocState::MaybeFreed
            );
            assert!(bottom.le(a));
            for b in &samples {
                let ab = Domain::join(*a, *b);
                assert_eq!(ab, Domain::join(*b, *a), "commutativity");
                assert!(a.le(&ab) && b.le(&ab), "upper bound");
                for c in &samples {
                    assert_eq!(
                        Domain::join(*a, Domain::join(*b, *c)),
                        Domain::join(ab, *c),
                        "associativity"
                    );
                }
            }
        }
    }

    #[test]
    fn test_memory_missing_key_is_bottom() {
        let mut m1: Memory = Memory::new();
        let m2: Memory = Memory::new();
        m1.set(ValueId(3), Domain::UNINIT);
        assert_eq!(m1, m2);
        assert_eq!(m2.get(ValueId(3)), Domain::UNINIT);

        m1.set(ValueId(4), Domain::of(AllocState::Live));
        assert_ne!(m1, m2);
    }

    #[test]
    fn test_memory_join_and_overlay() {
        let mut m1: Memory = Memory::new();
        let mut m2: Memory = Memory::new();
        m1.set(ValueId(0), Domain::of(AllocState::Live));
        m1.set(ValueId(1), Domain::of(AllocState::Live));
        m2.set(ValueId(0), Domain::of(AllocState::Freed));
        m2.set(ValueId(2), Domain::of(AllocState::Freed));

        let joined = m1.join(&m2);
        assert_eq!(joined.get(ValueId(0)).state, AllocState::MaybeFreed);
        assert_eq!(joined.get(ValueId(1)).state, AllocState::Live);
        assert_eq!(joined.get(ValueId(2)).state, AllocState::Freed);

        m1.overlay(&m2);
        assert_eq!(m1.get(ValueId(0)).state, AllocState::Freed);
        assert_eq!(m1.len(), 3);
    }
}
