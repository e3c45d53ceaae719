//! Emit the IL edits for individual fixes.
//!
//! Which primitives are emitted depends on the tool that produced the trace: traces from PMTest
//! are fixed with PMTest's instrumented wrappers, so that re-running the tool observes the fix.

use crate::il::{FencePrimitive, FlushPrimitive, InsnId, Instruction, Op, Program};
use crate::log::*;
use crate::trace::TraceSource;

pub enum FixGenerator<'a> {
    PmTest(&'a mut Program),
    Generic(&'a mut Program),
}

impl<'a> FixGenerator<'a> {
    pub fn for_source(source: TraceSource, program: &'a mut Program) -> Self {
        match source {
            TraceSource::PmTest => FixGenerator::PmTest(program),
            TraceSource::Generic => FixGenerator::Generic(program),
        }
    }

    fn program(&mut self) -> &mut Program {
        match self {
            FixGenerator::PmTest(p) | FixGenerator::Generic(p) => p,
        }
    }

    fn flush_primitive(&self) -> FlushPrimitive {
        match self {
            FixGenerator::PmTest(_) => FlushPrimitive::PmTestFlush,
            FixGenerator::Generic(_) => FlushPrimitive::Clwb,
        }
    }

    fn fence_primitive(&self) -> FencePrimitive {
        match self {
            FixGenerator::PmTest(_) => FencePrimitive::PmTestFence,
            FixGenerator::Generic(_) => FencePrimitive::Sfence,
        }
    }

    /// Insert a flush of the address `at` accesses, right after `at`.
    pub fn insert_flush(&mut self, at: InsnId) -> Result<InsnId, String> {
        let prim = self.flush_primitive();
        let program = self.program();
        let anchor = program.instruction(at);
        let ptr = match anchor.op {
            Op::Store | Op::Flush(_) => anchor
                .pointer_operand()
                .ok_or_else(|| format!("{:?} has no address operand", at))?,
            op => return Err(format!("Cannot derive a flush address from {:?}", op)),
        };
        let ins = Instruction {
            op: Op::Flush(prim),
            inputs: vec![ptr],
            loc: anchor.loc.clone(),
            block: None,
        };
        let new = program.insert_after(at, ins)?;
        debug!("Inserted flush"; "after" => ?at, "insn" => ?new, "primitive" => ?prim);
        Ok(new)
    }

    /// Insert a fence right after `at`.
    pub fn insert_fence(&mut self, at: InsnId) -> Result<InsnId, String> {
        let prim = self.fence_primitive();
        let program = self.program();
        let ins = Instruction {
            op: Op::Fence(prim),
            inputs: vec![],
            loc: program.instruction(at).loc.clone(),
            block: None,
        };
        let new = program.insert_after(at, ins)?;
        debug!("Inserted fence"; "after" => ?at, "insn" => ?new, "primitive" => ?prim);
        Ok(new)
    }

    /// Delete the flush `at`.
    pub fn remove_flush(&mut self, at: InsnId) -> Result<(), String> {
        let program = self.program();
        match program.instruction(at).op {
            Op::Flush(_) => {}
            op => return Err(format!("Expected a flush, got {:?}", op)),
        }
        program.detach(at)?;
        debug!("Removed flush"; "insn" => ?at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::Value;

    fn program() -> (Program, InsnId, InsnId, InsnId) {
        let mut p = Program::new();
        let g = p.add_global("pool");
        let main = p.reserve_function("main", 0);
        p.begin_function(main);
        let b = p.add_block();
        p.position_at_end(b);
        let st = p.add_instruction(
            Op::Store,
            vec![Value::Global(g), Value::Const(1)],
            Some(("a.c", 3)),
        );
        let fl = p.add_instruction(
            Op::Flush(FlushPrimitive::Clflush),
            vec![Value::Global(g)],
            Some(("a.c", 4)),
        );
        let ret = p.add_instruction(Op::Return, vec![], Some(("a.c", 5)));
        p.end_function();
        (p, st, fl, ret)
    }

    #[test]
    fn primitives_follow_trace_source() {
        let (mut p, st, _, _) = program();
        let mut fixer = FixGenerator::for_source(TraceSource::PmTest, &mut p);
        let f = fixer.insert_flush(st).unwrap();
        let n = fixer.insert_fence(f).unwrap();
        assert_eq!(p.instruction(f).op, Op::Flush(FlushPrimitive::PmTestFlush));
        assert_eq!(p.instruction(n).op, Op::Fence(FencePrimitive::PmTestFence));
        assert_eq!(p.next_in_block(st), Some(f));
        assert_eq!(p.next_in_block(f), Some(n));
        assert_eq!(p.instruction(f).loc, p.instruction(st).loc);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn capability_failures() {
        let (mut p, st, fl, ret) = program();
        let mut fixer = FixGenerator::for_source(TraceSource::Generic, &mut p);
        assert!(fixer.insert_fence(ret).is_err());
        assert!(fixer.insert_flush(ret).is_err());
        assert!(fixer.remove_flush(st).is_err());
        fixer.remove_flush(fl).unwrap();
        assert!(fixer.remove_flush(fl).is_err());
        assert_eq!(p.next_in_block(st), Some(ret));
        assert_eq!(p.block_of(fl), None);
    }
}
