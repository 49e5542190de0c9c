//! # cfg
//!
//! Block-level control-flow graph of one Function.
//! Node i of the petgraph graph is BlockId(i); edges come from the block terminators.
//! Built once per function and only read afterwards.

use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use crate::ir::{BlockId, Function};

pub struct Cfg {
    pub graph: DiGraph<BlockId, ()>,
}

impl Cfg {
    pub fn new(func: &Function) -> Self {
        let mut graph = DiGraph::with_capacity(func.blocks.len(), func.blocks.len() * 2);
        for bb in func.block_ids() {
            graph.add_node(bb);
        }
        for bb in func.block_ids() {
            for succ in func.block_successors(bb) {
                let (from, to) = (node(bb), node(succ));
                // br %c, %bb, %bb is a single edge
                if graph.find_edge(from, to).is_none() {
                    graph.add_edge(from, to, ());
                }
            }
        }
        Self { graph }
    }

    pub fn predecessors(&self, bb: BlockId) -> Vec<BlockId> {
        self.neighbors(bb, Direction::Incoming)
    }

    pub fn successors(&self, bb: BlockId) -> Vec<BlockId> {
        self.neighbors(bb, Direction::Outgoing)
    }

    fn neighbors(&self, bb: BlockId, dir: Direction) -> Vec<BlockId> {
        let mut blocks: Vec<BlockId> = self
            .graph
            .edges_directed(node(bb), dir)
            .map(|edge| match dir {
                Direction::Incoming => self.graph[edge.source()],
                Direction::Outgoing => self.graph[edge.target()],
            })
            .collect();
        blocks.sort();
        blocks
    }

    /// Graphviz rendering; node labels are block names.
    pub fn dot(&self, func: &Function) -> String {
        let named = self
            .graph
            .map(|_, bb| func.block(*bb).name.clone(), |_, _| "");
        format!("{}", Dot::with_config(&named, &[Config::EdgeNoLabel]))
    }
}

fn node(bb: BlockId) -> NodeIndex {
    NodeIndex::new(bb.index())
}
