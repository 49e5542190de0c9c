//! # ir
//!
//! Typed, SSA-form program representation consumed by the analyses.
//! A Function owns three arenas (values, instructions, blocks) and every
//! cross reference is an index into one of them.
//! Blocks[0] is the entry block. A function without blocks is a declaration.

mod builder;

pub use builder::FunctionBuilder;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{AnalysisError, Result};

macro_rules! arena_id {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            #[inline]
            pub fn index(self) -> usize {
                self.0 as usize
            }

            #[inline]
            pub fn from_index(index: usize) -> Self {
                $name(index as u32)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(ValueId, "v");
arena_id!(InstId, "i");
arena_id!(BlockId, "bb");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Type {
    Pointer,
    Integer,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueKind {
    Argument { index: usize },
    Instruction { inst: InstId },
    NullPtr,
    ConstInt { value: i64 },
    /// A named global symbol, opaque to the analyses.
    Global,
    Undef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    pub name: String,
    pub ty: Type,
    #[serde(flatten)]
    pub kind: ValueKind,
}

impl Value {
    pub fn is_pointer(&self) -> bool {
        self.ty == Type::Pointer
    }

    pub fn is_null(&self) -> bool {
        self.kind == ValueKind::NullPtr
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Callee {
    Direct(String),
    Indirect(ValueId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CmpPred {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum InstKind {
    /// Stack slot.
    Alloca,
    Load {
        ptr: ValueId,
    },
    Store {
        value: ValueId,
        ptr: ValueId,
    },
    Call {
        callee: Callee,
        #[serde(default)]
        args: Vec<ValueId>,
    },
    /// Any reinterpretation, pointer casts included.
    Cast {
        operand: ValueId,
    },
    /// Address of a field/element; never dereferences `base`.
    IndexedAddress {
        base: ValueId,
        #[serde(default)]
        indices: Vec<ValueId>,
    },
    Phi {
        incoming: Vec<(ValueId, BlockId)>,
    },
    /// With a condition, `targets[0]` is taken when it holds and `targets[1]` otherwise.
    Branch {
        #[serde(default)]
        cond: Option<ValueId>,
        targets: Vec<BlockId>,
    },
    Return {
        #[serde(default)]
        value: Option<ValueId>,
    },
    Compare {
        pred: CmpPred,
        lhs: ValueId,
        rhs: ValueId,
    },
    Binary {
        operator: String,
        lhs: ValueId,
        rhs: ValueId,
    },
    Other {
        #[serde(default)]
        operands: Vec<ValueId>,
    },
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(self, InstKind::Branch { .. } | InstKind::Return { .. })
    }

    /// Every value read by this instruction.
    pub fn operands(&self) -> Vec<ValueId> {
        match self {
            InstKind::Alloca => vec![],
            InstKind::Load { ptr } => vec![*ptr],
            InstKind::Store { value, ptr } => vec![*value, *ptr],
            InstKind::Call { callee, args } => {
                let mut ops = args.clone();
                if let Callee::Indirect(target) = callee {
                    ops.push(*target);
                }
                ops
            }
            InstKind::Cast { operand } => vec![*operand],
            InstKind::IndexedAddress { base, indices } => {
                let mut ops = vec![*base];
                ops.extend(indices.iter().copied());
                ops
            }
            InstKind::Phi { incoming } => incoming.iter().map(|(v, _)| *v).collect(),
            InstKind::Branch { cond, .. } => cond.iter().copied().collect(),
            InstKind::Return { value } => value.iter().copied().collect(),
            InstKind::Compare { lhs, rhs, .. } | InstKind::Binary { lhs, rhs, .. } => {
                vec![*lhs, *rhs]
            }
            InstKind::Other { operands } => operands.clone(),
        }
    }

    /// Every block named by this instruction.
    pub fn blocks(&self) -> Vec<BlockId> {
        match self {
            InstKind::Phi { incoming } => incoming.iter().map(|(_, b)| *b).collect(),
            InstKind::Branch { targets, .. } => targets.clone(),
            _ => vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    #[serde(flatten)]
    pub kind: InstKind,
    #[serde(default)]
    pub result: Option<ValueId>,
    pub block: BlockId,
    #[serde(default)]
    pub loc: Option<SourceLoc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    pub name: String,
    pub insts: Vec<InstId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    #[serde(default)]
    pub params: Vec<ValueId>,
    pub values: Vec<Value>,
    #[serde(default)]
    pub insts: Vec<Instruction>,
    #[serde(default)]
    pub blocks: Vec<BasicBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub functions: Vec<Function>,
}

impl Function {
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    pub fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.index()]
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn is_pointer(&self, id: ValueId) -> bool {
        self.value(id).is_pointer()
    }

    /// The instruction producing `id`, if it is an instruction result.
    pub fn defining_inst(&self, id: ValueId) -> Option<InstId> {
        match self.values.get(id.index())?.kind {
            ValueKind::Instruction { inst } => Some(inst),
            _ => None,
        }
    }

    pub fn defining_kind(&self, id: ValueId) -> Option<&InstKind> {
        self.defining_inst(id).map(|inst| &self.inst(inst).kind)
    }

    /// Instructions in block order, then program order within a block.
    pub fn inst_ids(&self) -> impl Iterator<Item = InstId> + '_ {
        self.blocks.iter().flat_map(|bb| bb.insts.iter().copied())
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len()).map(BlockId::from_index)
    }

    /// Successor blocks named by the terminator of `bb`.
    pub fn block_successors(&self, bb: BlockId) -> Vec<BlockId> {
        self.block(bb)
            .insts
            .last()
            .map(|last| match &self.inst(*last).kind {
                InstKind::Branch { targets, .. } => targets.clone(),
                _ => vec![],
            })
            .unwrap_or_default()
    }

    /// All pointer-typed program variables: pointer parameters and pointer-typed instruction results.
    pub fn pointer_values(&self) -> Vec<ValueId> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, value)| {
                value.is_pointer()
                    && matches!(
                        value.kind,
                        ValueKind::Argument { .. } | ValueKind::Instruction { .. }
                    )
            })
            .map(|(idx, _)| ValueId::from_index(idx))
            .collect()
    }

    /// Structural checks; anything failing here would make the fixpoints meaningless.
    pub fn validate(&self) -> Result<()> {
        let bad = |reason: String| Err(AnalysisError::malformed(self.name.clone(), reason));
        let nvalues = self.values.len();
        let ninsts = self.insts.len();
        let nblocks = self.blocks.len();

        for (idx, param) in self.params.iter().enumerate() {
            match self.values.get(param.index()).map(|v| &v.kind) {
                Some(ValueKind::Argument { index }) if *index == idx => {}
                Some(_) => return bad(format!("parameter {} is not argument #{}", param, idx)),
                None => return bad(format!("parameter {} does not exist", param)),
            }
        }

        for (idx, value) in self.values.iter().enumerate() {
            if let ValueKind::Instruction { inst } = value.kind {
                if inst.index() >= ninsts {
                    return bad(format!("value {} names missing instruction {}", idx, inst));
                }
                if self.inst(inst).result != Some(ValueId::from_index(idx)) {
                    return bad(format!("value {} is not the result of {}", idx, inst));
                }
            }
        }

        let mut placed = HashSet::new();
        for (bb_idx, bb) in self.blocks.iter().enumerate() {
            let bb_id = BlockId::from_index(bb_idx);
            if bb.insts.is_empty() {
                return bad(format!("block {} ({}) is empty", bb_id, bb.name));
            }
            for (pos, inst_id) in bb.insts.iter().enumerate() {
                if inst_id.index() >= ninsts {
                    return bad(format!("block {} names missing instruction {}", bb_id, inst_id));
                }
                if !placed.insert(*inst_id) {
                    return bad(format!("instruction {} is placed twice", inst_id));
                }
                let inst = self.inst(*inst_id);
                if inst.block != bb_id {
                    return bad(format!("instruction {} claims block {}", inst_id, inst.block));
                }
                if inst.kind.is_terminator() && pos + 1 != bb.insts.len() {
                    return bad(format!("terminator {} is not last in {}", inst_id, bb_id));
                }
            }
        }
        if placed.len() != ninsts {
            return bad(format!(
                "{} instructions are not placed in any block",
                ninsts - placed.len()
            ));
        }

        for (idx, inst) in self.insts.iter().enumerate() {
            let inst_id = InstId::from_index(idx);
            for operand in inst.kind.operands() {
                if operand.index() >= nvalues {
                    return bad(format!("{} reads missing value {}", inst_id, operand));
                }
            }
            for bb in inst.kind.blocks() {
                if bb.index() >= nblocks {
                    return bad(format!("{} references missing block {}", inst_id, bb));
                }
            }
            if let Some(result) = inst.result {
                match self.values.get(result.index()).map(|v| &v.kind) {
                    Some(ValueKind::Instruction { inst }) if *inst == inst_id => {}
                    _ => return bad(format!("{} has a foreign result {}", inst_id, result)),
                }
            }
            if let InstKind::Branch { cond, targets } = &inst.kind {
                let expected = if cond.is_some() { 2 } else { 1 };
                if targets.len() != expected {
                    return bad(format!("{} has {} targets", inst_id, targets.len()));
                }
                // parameters are seeded at the entry block only
                if targets.iter().any(|bb| bb.index() == 0) {
                    return bad(format!("{} branches back to the entry block", inst_id));
                }
            }
        }

        for (idx, inst) in self.insts.iter().enumerate() {
            if let InstKind::Phi { incoming } = &inst.kind {
                for (_, pred) in incoming {
                    if !self.block_successors(*pred).contains(&inst.block) {
                        return bad(format!(
                            "{} names {} which is not a predecessor of {}",
                            InstId::from_index(idx),
                            pred,
                            inst.block
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn value_name(&self, id: ValueId) -> String {
        let value = self.value(id);
        match value.kind {
            ValueKind::NullPtr => "null".to_string(),
            ValueKind::ConstInt { value } => value.to_string(),
            ValueKind::Global => format!("@{}", value.name),
            _ => format!("%{}", value.name),
        }
    }

    /// Human readable form of one instruction, e.g. `%1 = load %p`.
    pub fn render(&self, id: InstId) -> String {
        let inst = self.inst(id);
        let name = |v: &ValueId| self.value_name(*v);
        let list = |vs: &[ValueId]| vs.iter().map(name).collect::<Vec<_>>().join(", ");
        let body = match &inst.kind {
            InstKind::Alloca => "alloca".to_string(),
            InstKind::Load { ptr } => format!("load {}", name(ptr)),
            InstKind::Store { value, ptr } => format!("store {}, {}", name(value), name(ptr)),
            InstKind::Call { callee, args } => {
                let target = match callee {
                    Callee::Direct(f) => format!("@{}", f),
                    Callee::Indirect(v) => name(v),
                };
                format!("call {}({})", target, list(args))
            }
            InstKind::Cast { operand } => format!("cast {}", name(operand)),
            InstKind::IndexedAddress { base, indices } => {
                if indices.is_empty() {
                    format!("index {}", name(base))
                } else {
                    format!("index {}, {}", name(base), list(indices))
                }
            }
            InstKind::Phi { incoming } => {
                let pairs: Vec<String> = incoming
                    .iter()
                    .map(|(v, bb)| format!("[{}, {}]", name(v), self.block(*bb).name))
                    .collect();
                format!("phi {}", pairs.join(", "))
            }
            InstKind::Branch { cond, targets } => {
                let labels: Vec<&str> = targets
                    .iter()
                    .map(|bb| self.block(*bb).name.as_str())
                    .collect();
                match cond {
                    Some(c) => format!("br {}, {}", name(c), labels.join(", ")),
                    None => format!("br {}", labels.join(", ")),
                }
            }
            InstKind::Return { value } => match value {
                Some(v) => format!("ret {}", name(v)),
                None => "ret".to_string(),
            },
            InstKind::Compare { pred, lhs, rhs } => {
                let pred = format!("{:?}", pred).to_lowercase();
                format!("cmp {} {}, {}", pred, name(lhs), name(rhs))
            }
            InstKind::Binary { operator, lhs, rhs } => {
                format!("{} {}, {}", operator, name(lhs), name(rhs))
            }
            InstKind::Other { operands } => format!("other {}", list(operands)),
        };
        match inst.result {
            Some(r) => format!("{} = {}", name(&r), body),
            None => body,
        }
    }
}
