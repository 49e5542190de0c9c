use crate::cfg::Cfg;
use crate::ir::{Function, InstId};

/// An instruction together with its position inside its block.
#[derive(Clone, Copy)]
pub struct ProgramPoint<'a> {
    pub func: &'a Function,
    pub cfg: &'a Cfg,
    pub inst: InstId,
    index: usize,
}

impl<'a> ProgramPoint<'a> {
    pub fn new(func: &'a Function, cfg: &'a Cfg, inst: InstId) -> Option<Self> {
        let block = func.blocks.get(func.insts.get(inst.index())?.block.index())?;
        let index = block.insts.iter().position(|i| *i == inst)?;
        Some(Self {
            func,
            cfg,
            inst,
            index,
        })
    }

    #[inline]
    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    #[inline]
    pub fn is_last(&self) -> bool {
        let block = self.func.inst(self.inst).block;
        self.index + 1 == self.func.block(block).insts.len()
    }

    /// Previous instruction in the block, or the last instruction of every predecessor block.
    pub fn predecessors(&self) -> Vec<InstId> {
        let block = self.func.inst(self.inst).block;
        let insts = &self.func.block(block).insts;
        if self.is_first() {
            self.cfg
                .predecessors(block)
                .into_iter()
                .filter_map(|pred| self.func.block(pred).insts.last().copied())
                .collect()
        } else {
            vec![insts[self.index - 1]]
        }
    }

    /// Next instruction in the block, or the first instruction of every successor block.
    pub fn successors(&self) -> Vec<InstId> {
        let block = self.func.inst(self.inst).block;
        let insts = &self.func.block(block).insts;
        if self.is_last() {
            self.cfg
                .successors(block)
                .into_iter()
                .filter_map(|succ| self.func.block(succ).insts.first().copied())
                .collect()
        } else {
            vec![insts[self.index + 1]]
        }
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;
    use crate::ir::FunctionBuilder;

    #[test]
    fn test_within_block_and_across_blocks() {
        let mut fb = FunctionBuilder::new("f");
        let entry = fb.block("entry");
        let body = fb.block("body");
        let exit = fb.block("exit");
        let p = fb.alloca(entry, "p");
        let _ = fb.load(entry, "x", crate::ir::Type::Pointer, p);
        fb.br(entry, body);
        fb.br(body, exit);
        let ret = fb.ret(exit, None);
        let func = fb.finish().unwrap();
        let cfg = Cfg::new(&func);

        let first = ProgramPoint::new(&func, &cfg, InstId(0)).unwrap();
        assert!(first.predecessors().is_empty());
        assert_eq!(first.successors(), vec![InstId(1)]);

        let br = ProgramPoint::new(&func, &cfg, InstId(2)).unwrap();
        assert_eq!(br.predecessors(), vec![InstId(1)]);
        assert_eq!(br.successors(), vec![InstId(3)]);

        let last = ProgramPoint::new(&func, &cfg, ret).unwrap();
        assert_eq!(last.predecessors(), vec![InstId(3)]);
        assert!(last.successors().is_empty());
    }
}
