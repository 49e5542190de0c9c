use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

/// Grow-only directed set graph.
/// Every mutation reports whether a new edge appeared, so fixpoint loops can stop on `false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Graph<N: Hash + Eq + Copy + Debug> {
    pub nodes: HashSet<N>,
    pub edges: HashMap<N, HashSet<N>>,
}

impl<N: Hash + Eq + Copy + Debug> Default for Graph<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Hash + Eq + Copy + Debug> Graph<N> {
    pub fn new() -> Self {
        Self {
            nodes: HashSet::new(),
            edges: HashMap::new(),
        }
    }

    pub fn add_node(&mut self, node: N) -> bool {
        self.nodes.insert(node)
    }

    pub fn add_edge(&mut self, from: N, to: N) -> bool {
        self.nodes.insert(from);
        self.nodes.insert(to);
        self.edges.entry(from).or_default().insert(to)
    }

    pub fn add_edges<I>(&mut self, from: N, tos: I) -> bool
    where
        I: IntoIterator<Item = N>,
    {
        let mut changed = false;
        for to in tos {
            changed |= self.add_edge(from, to);
        }
        changed
    }

    pub fn neighbors(&self, node: N) -> Option<&HashSet<N>> {
        self.edges.get(&node)
    }

    /// Union of the neighbors of every node in `nodes`.
    pub fn batch_neighbors<I>(&self, nodes: I) -> HashSet<N>
    where
        I: IntoIterator<Item = N>,
    {
        let mut result = HashSet::new();
        for node in nodes {
            if let Some(tos) = self.edges.get(&node) {
                result.extend(tos.iter().copied());
            }
        }
        result
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|tos| tos.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::Graph;

    #[test]
    fn test_graph_basic() {
        let mut graph = Graph::new();
        assert!(graph.add_edge(1, 2));
        assert!(graph.add_edge(1, 3));
        assert!(!graph.add_edge(1, 2));
        assert!(graph.add_edge(2, 4));
        assert_eq!(graph.edge_count(), 3);
        assert_eq!(graph.nodes.len(), 4);
        assert_eq!(graph.batch_neighbors(vec![1, 2]).len(), 3);
        assert!(graph.neighbors(4).is_none());
    }
}
