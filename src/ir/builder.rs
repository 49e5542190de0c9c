use super::{
    BasicBlock, BlockId, Callee, CmpPred, Function, InstId, InstKind, Instruction, SourceLoc,
    Type, Value, ValueId, ValueKind,
};
use crate::error::Result;

/// Incrementally assembles a [`Function`]; `finish` validates it.
pub struct FunctionBuilder {
    func: Function,
    loc: Option<SourceLoc>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            func: Function {
                name: name.into(),
                params: Vec::new(),
                values: Vec::new(),
                insts: Vec::new(),
                blocks: Vec::new(),
            },
            loc: None,
        }
    }

    /// Source line attached to the instructions created from now on.
    pub fn at(&mut self, line: u32) -> &mut Self {
        self.loc = Some(SourceLoc { line, column: 0 });
        self
    }

    pub fn param(&mut self, name: &str, ty: Type) -> ValueId {
        let index = self.func.params.len();
        let id = self.push_value(name, ty, ValueKind::Argument { index });
        self.func.params.push(id);
        id
    }

    pub fn block(&mut self, name: &str) -> BlockId {
        let id = BlockId::from_index(self.func.blocks.len());
        self.func.blocks.push(BasicBlock {
            name: name.to_string(),
            insts: Vec::new(),
        });
        id
    }

    pub fn null(&mut self) -> ValueId {
        self.push_value("null", Type::Pointer, ValueKind::NullPtr)
    }

    pub fn const_int(&mut self, value: i64) -> ValueId {
        self.push_value(&value.to_string(), Type::Integer, ValueKind::ConstInt { value })
    }

    pub fn global(&mut self, name: &str, ty: Type) -> ValueId {
        self.push_value(name, ty, ValueKind::Global)
    }

    pub fn alloca(&mut self, bb: BlockId, name: &str) -> ValueId {
        self.push_with_result(bb, name, Type::Pointer, InstKind::Alloca)
    }

    pub fn load(&mut self, bb: BlockId, name: &str, ty: Type, ptr: ValueId) -> ValueId {
        self.push_with_result(bb, name, ty, InstKind::Load { ptr })
    }

    pub fn store(&mut self, bb: BlockId, value: ValueId, ptr: ValueId) -> InstId {
        self.push_inst(bb, InstKind::Store { value, ptr })
    }

    /// Call without a result.
    pub fn call(&mut self, bb: BlockId, callee: &str, args: &[ValueId]) -> InstId {
        self.push_inst(
            bb,
            InstKind::Call {
                callee: Callee::Direct(callee.to_string()),
                args: args.to_vec(),
            },
        )
    }

    pub fn call_ptr(&mut self, bb: BlockId, name: &str, callee: &str, args: &[ValueId]) -> ValueId {
        self.call_typed(bb, name, Type::Pointer, callee, args)
    }

    pub fn call_typed(
        &mut self,
        bb: BlockId,
        name: &str,
        ty: Type,
        callee: &str,
        args: &[ValueId],
    ) -> ValueId {
        self.push_with_result(
            bb,
            name,
            ty,
            InstKind::Call {
                callee: Callee::Direct(callee.to_string()),
                args: args.to_vec(),
            },
        )
    }

    pub fn call_indirect(&mut self, bb: BlockId, target: ValueId, args: &[ValueId]) -> InstId {
        self.push_inst(
            bb,
            InstKind::Call {
                callee: Callee::Indirect(target),
                args: args.to_vec(),
            },
        )
    }

    pub fn cast(&mut self, bb: BlockId, name: &str, ty: Type, operand: ValueId) -> ValueId {
        self.push_with_result(bb, name, ty, InstKind::Cast { operand })
    }

    pub fn index(&mut self, bb: BlockId, name: &str, base: ValueId, indices: &[ValueId]) -> ValueId {
        self.push_with_result(
            bb,
            name,
            Type::Pointer,
            InstKind::IndexedAddress {
                base,
                indices: indices.to_vec(),
            },
        )
    }

    pub fn phi(&mut self, bb: BlockId, name: &str, ty: Type, incoming: &[(ValueId, BlockId)]) -> ValueId {
        self.push_with_result(
            bb,
            name,
            ty,
            InstKind::Phi {
                incoming: incoming.to_vec(),
            },
        )
    }

    /// Adds an incoming edge to a phi created earlier (loop back edges).
    pub fn add_incoming(&mut self, phi: ValueId, value: ValueId, from: BlockId) {
        if let Some(inst) = self.func.defining_inst(phi) {
            if let InstKind::Phi { incoming } = &mut self.func.insts[inst.index()].kind {
                incoming.push((value, from));
            }
        }
    }

    pub fn compare(&mut self, bb: BlockId, name: &str, pred: CmpPred, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push_with_result(bb, name, Type::Integer, InstKind::Compare { pred, lhs, rhs })
    }

    pub fn binary(&mut self, bb: BlockId, name: &str, operator: &str, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push_with_result(
            bb,
            name,
            Type::Integer,
            InstKind::Binary {
                operator: operator.to_string(),
                lhs,
                rhs,
            },
        )
    }

    pub fn br(&mut self, bb: BlockId, target: BlockId) -> InstId {
        self.push_inst(
            bb,
            InstKind::Branch {
                cond: None,
                targets: vec![target],
            },
        )
    }

    pub fn cond_br(&mut self, bb: BlockId, cond: ValueId, then_bb: BlockId, else_bb: BlockId) -> InstId {
        self.push_inst(
            bb,
            InstKind::Branch {
                cond: Some(cond),
                targets: vec![then_bb, else_bb],
            },
        )
    }

    pub fn ret(&mut self, bb: BlockId, value: Option<ValueId>) -> InstId {
        self.push_inst(bb, InstKind::Return { value })
    }

    pub fn other(&mut self, bb: BlockId, operands: &[ValueId]) -> InstId {
        self.push_inst(
            bb,
            InstKind::Other {
                operands: operands.to_vec(),
            },
        )
    }

    /// The instruction most recently appended to `bb`.
    pub fn last_inst(&self, bb: BlockId) -> Option<InstId> {
        self.func.blocks.get(bb.index())?.insts.last().copied()
    }

    pub fn finish(self) -> Result<Function> {
        self.func.validate()?;
        Ok(self.func)
    }

    fn push_value(&mut self, name: &str, ty: Type, kind: ValueKind) -> ValueId {
        let id = ValueId::from_index(self.func.values.len());
        self.func.values.push(Value {
            name: name.to_string(),
            ty,
            kind,
        });
        id
    }

    fn push_inst(&mut self, bb: BlockId, kind: InstKind) -> InstId {
        let id = InstId::from_index(self.func.insts.len());
        self.func.insts.push(Instruction {
            kind,
            result: None,
            block: bb,
            loc: self.loc,
        });
        if let Some(block) = self.func.blocks.get_mut(bb.index()) {
            block.insts.push(id);
        }
        id
    }

    fn push_with_result(&mut self, bb: BlockId, name: &str, ty: Type, kind: InstKind) -> ValueId {
        let inst = self.push_inst(bb, kind);
        let value = self.push_value(name, ty, ValueKind::Instruction { inst });
        self.func.insts[inst.index()].result = Some(value);
        value
    }
}
