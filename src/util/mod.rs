mod graph;
mod instruction;

pub use graph::Graph;
pub use instruction::ProgramPoint;
