//! Intermediate language over which durability bugs are localized and repaired.
//!
//! A small, LLVM-flavoured IL: functions hold basic blocks, basic blocks hold an
//! ordered list of instruction ids, and every instruction lives in a single program-wide arena so
//! that its id stays stable across fix insertion and removal.

use serde::{Deserialize, Serialize};

use crate::dynamic_variable::dynamic_variable;

dynamic_variable! {SHOW_DEBUG_LOCATIONS, with_SHOW_DEBUG_LOCATIONS_set, if_SHOW_DEBUG_LOCATIONS_is_set}

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub usize);
        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                std::fmt::Debug::fmt(self, f)
            }
        }
    };
}

id_type!(InsnId, "i");
id_type!(BlockId, "bb");
id_type!(FuncId, "fn");
id_type!(GlobalId, "g");

/// Tool-level cache line write-back primitives.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPrimitive {
    Clflush,
    Clflushopt,
    Clwb,
    /// The PMTest-instrumented write-back wrapper
    PmTestFlush,
}

/// Tool-level ordering primitives.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FencePrimitive {
    Sfence,
    Mfence,
    /// The PMTest-instrumented fence wrapper
    PmTestFence,
}

/// An IL operation that operates on [`Value`]s.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// A fresh stack slot; the result is its address
    Alloca,
    /// Load from the address `input0`
    Load,
    /// Store `input1` to the address `input0`
    Store,
    /// Write back the cache line holding the address `input0`
    Flush(FlushPrimitive),
    /// Order every earlier flush before any later memory operation
    Fence(FencePrimitive),
    /// Pointer arithmetic on `input0`; the result points into the same object
    PtrOffset,
    /// `result = input0`
    Copy,
    /// `result` is any one of the inputs, depending on the incoming edge
    Phi,
    /// Direct call; inputs are the arguments
    Call(FuncId),
    /// Any computation that neither touches memory nor transfers control
    Other,
    /// Return from the function, with the optional return value `input0`
    Return,
    /// Unconditional branch
    Branch(BlockId),
    /// Branch to the first block iff `input0` is non-zero, otherwise to the second
    CondBranch(BlockId, BlockId),
    /// Control never reaches past this point
    Unreachable,
}

impl Op {
    /// Whether the op must (and may only) end a basic block
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            Op::Return | Op::Branch(_) | Op::CondBranch(..) | Op::Unreachable
        )
    }
}

/// An operand.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// The result of an instruction
    Insn(InsnId),
    /// The `n`th argument of a function
    Arg(FuncId, usize),
    /// The address of a global
    Global(GlobalId),
    /// An immediate
    Const(u64),
}

/// Source position recorded in debug metadata.
#[derive(Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DebugLoc {
    pub file: String,
    pub line: i64,
}

/// An IL instruction.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub op: Op,
    #[serde(default)]
    pub inputs: Vec<Value>,
    #[serde(default)]
    pub loc: Option<DebugLoc>,
    /// The block that currently holds this instruction; `None` once detached.
    #[serde(default)]
    pub block: Option<BlockId>,
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?} {:?}", self.op, self.inputs)?;
        if_SHOW_DEBUG_LOCATIONS_is_set(
            || match &self.loc {
                Some(DebugLoc { file, line }) => write!(f, " !{}:{}", file, line),
                None => Ok(()),
            },
            || Ok(()),
        )
    }
}

impl Instruction {
    /// The address operand of a memory access, if this is one
    pub fn pointer_operand(&self) -> Option<Value> {
        match self.op {
            Op::Load | Op::Store | Op::Flush(_) => self.inputs.first().copied(),
            _ => None,
        }
    }

    /// Confirms the operand shape of the instruction.
    pub fn try_confirm_valid(&self) -> Result<(), String> {
        let n = self.inputs.len();
        let ok = match self.op {
            Op::Alloca | Op::Fence(_) | Op::Branch(_) | Op::Unreachable => n == 0,
            Op::Load | Op::Flush(_) | Op::PtrOffset | Op::Copy | Op::CondBranch(..) => n == 1,
            Op::Store => n == 2,
            Op::Phi => n >= 1,
            Op::Return => n <= 1,
            Op::Call(_) | Op::Other => true,
        };
        if !ok {
            return Err(format!(
                "Got {} inputs for operation {:?}: {:?}",
                n, self.op, self.inputs
            ));
        }
        if let Some(p) = self.pointer_operand() {
            if let Value::Const(_) = p {
                return Err(format!(
                    "Operation {:?} expects a pointer operand, got {:?}",
                    self.op, p
                ));
            }
        }
        Ok(())
    }
}

/// How a function body is available to the analysis.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    /// Has a body in this program
    Defined,
    /// External; only its signature is known
    Declaration,
    /// A compiler intrinsic
    Intrinsic,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Function {
    pub name: String,
    pub kind: FunctionKind,
    #[serde(default)]
    pub num_args: usize,
    /// Basic blocks of the function; the first one is the entry block.
    #[serde(default)]
    pub blocks: Vec<BlockId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BasicBlock {
    pub function: FuncId,
    /// Ordered instructions; the last is the (only) terminator.
    pub insns: Vec<InsnId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Global {
    pub name: String,
}

/// The actual program
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub globals: Vec<Global>,
    pub functions: Vec<Function>,
    pub basic_blocks: Vec<BasicBlock>,
    /// Arena of every instruction ever created, including detached ones.
    pub instructions: Vec<Instruction>,
    /// Builder cursor: function and block currently being filled.
    #[serde(skip)]
    cursor: Option<(FuncId, Option<BlockId>)>,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("functions", &self.functions.len())
            .field("basic_blocks", &self.basic_blocks.len())
            .field("instructions", &self.instructions.len())
            .finish_non_exhaustive()
    }
}

impl Program {
    /// Build a new empty program
    pub fn new() -> Self {
        Default::default()
    }

    /// Load a program from its JSON form, validating it
    pub fn from_json(s: &str) -> Result<Self, String> {
        let prog: Program = serde_json::from_str(s).map_err(|e| e.to_string())?;
        prog.validate()?;
        Ok(prog)
    }

    /// Dump the program in its JSON form
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("program serialization cannot fail")
    }

    pub fn add_global(&mut self, name: impl Into<String>) -> GlobalId {
        self.globals.push(Global { name: name.into() });
        GlobalId(self.globals.len() - 1)
    }

    /// Declare a function whose body is not part of the program
    pub fn declare_function(
        &mut self,
        name: impl Into<String>,
        kind: FunctionKind,
        num_args: usize,
    ) -> FuncId {
        assert_ne!(kind, FunctionKind::Defined, "Defined functions need a body");
        self.functions.push(Function {
            name: name.into(),
            kind,
            num_args,
            blocks: vec![],
        });
        FuncId(self.functions.len() - 1)
    }

    /// Reserve a defined function, so that calls to it can be emitted before its body is.
    pub fn reserve_function(&mut self, name: impl Into<String>, num_args: usize) -> FuncId {
        self.functions.push(Function {
            name: name.into(),
            kind: FunctionKind::Defined,
            num_args,
            blocks: vec![],
        });
        FuncId(self.functions.len() - 1)
    }

    /// Begin adding the body of the (reserved) function `f`. Expected to be matched by
    /// [`Self::end_function`].
    pub fn begin_function(&mut self, f: FuncId) {
        assert!(
            self.cursor.is_none(),
            "Should have called `end_function` before calling `begin_function` again"
        );
        assert_eq!(self.functions[f.0].kind, FunctionKind::Defined);
        assert!(self.functions[f.0].blocks.is_empty(), "Body already added");
        self.cursor = Some((f, None));
    }

    /// Add an empty block to the function being built. The first block added is its entry.
    pub fn add_block(&mut self) -> BlockId {
        let (f, _) = self.cursor.expect("No function being built");
        let b = BlockId(self.basic_blocks.len());
        self.basic_blocks.push(BasicBlock {
            function: f,
            insns: vec![],
        });
        self.functions[f.0].blocks.push(b);
        b
    }

    /// Subsequent [`Self::add_instruction`] calls append to `b`.
    pub fn position_at_end(&mut self, b: BlockId) {
        let (f, _) = self.cursor.expect("No function being built");
        assert_eq!(self.basic_blocks[b.0].function, f);
        self.cursor = Some((f, Some(b)));
    }

    /// Append an instruction at the builder position. Panics if the instruction is invalid.
    pub fn add_instruction(
        &mut self,
        op: Op,
        inputs: Vec<Value>,
        loc: Option<(&str, i64)>,
    ) -> InsnId {
        let (_, b) = self.cursor.expect("No function being built");
        let b = b.expect("No block selected");
        if let Some(&last) = self.basic_blocks[b.0].insns.last() {
            assert!(
                !self.instructions[last.0].op.is_terminator(),
                "Block {:?} is already terminated",
                b
            );
        }
        let ins = Instruction {
            op,
            inputs,
            loc: loc.map(|(file, line)| DebugLoc {
                file: file.to_owned(),
                line,
            }),
            block: Some(b),
        };
        ins.try_confirm_valid().unwrap();
        let id = InsnId(self.instructions.len());
        self.instructions.push(ins);
        self.basic_blocks[b.0].insns.push(id);
        id
    }

    /// End adding the body of the current function.
    pub fn end_function(&mut self) {
        let (f, _) = self.cursor.take().expect("No function being built");
        assert!(
            !self.functions[f.0].blocks.is_empty(),
            "Function {} has no blocks",
            self.functions[f.0].name
        );
        for &b in &self.functions[f.0].blocks {
            assert!(
                self.terminator(b).is_some(),
                "Block {:?} of {} does not end in a terminator",
                b,
                self.functions[f.0].name
            );
        }
    }

    /// Insert `ins` right after `at` in `at`'s block. `at` must not be a terminator.
    pub fn insert_after(&mut self, at: InsnId, ins: Instruction) -> Result<InsnId, String> {
        let b = self
            .block_of(at)
            .ok_or_else(|| format!("{:?} is not part of any block", at))?;
        if self.instructions[at.0].op.is_terminator() {
            return Err(format!("Cannot insert after terminator {:?}", at));
        }
        ins.try_confirm_valid()?;
        let pos = self.position_in_block(at).unwrap();
        let id = InsnId(self.instructions.len());
        self.instructions.push(Instruction {
            block: Some(b),
            ..ins
        });
        self.basic_blocks[b.0].insns.insert(pos + 1, id);
        Ok(id)
    }

    /// Detach `at` from its block. The id stays allocated but is no longer part of the code.
    pub fn detach(&mut self, at: InsnId) -> Result<(), String> {
        let b = self
            .block_of(at)
            .ok_or_else(|| format!("{:?} is not part of any block", at))?;
        if self.instructions[at.0].op.is_terminator() {
            return Err(format!("Cannot detach terminator {:?}", at));
        }
        let pos = self.position_in_block(at).unwrap();
        self.basic_blocks[b.0].insns.remove(pos);
        self.instructions[at.0].block = None;
        Ok(())
    }

    pub fn instruction(&self, i: InsnId) -> &Instruction {
        &self.instructions[i.0]
    }

    pub fn function(&self, f: FuncId) -> &Function {
        &self.functions[f.0]
    }

    pub fn function_by_name(&self, name: &str) -> Option<FuncId> {
        self.functions
            .iter()
            .position(|f| f.name == name)
            .map(FuncId)
    }

    pub fn block_of(&self, i: InsnId) -> Option<BlockId> {
        self.instructions[i.0].block
    }

    /// The enclosing function of an attached instruction
    pub fn function_of(&self, i: InsnId) -> Option<FuncId> {
        self.block_of(i).map(|b| self.basic_blocks[b.0].function)
    }

    fn position_in_block(&self, i: InsnId) -> Option<usize> {
        let b = self.block_of(i)?;
        self.basic_blocks[b.0].insns.iter().position(|&x| x == i)
    }

    /// The instruction right before `i` in its block
    pub fn prev_in_block(&self, i: InsnId) -> Option<InsnId> {
        let b = self.block_of(i)?;
        let pos = self.position_in_block(i)?;
        pos.checked_sub(1).map(|p| self.basic_blocks[b.0].insns[p])
    }

    /// The instruction right after `i` in its block
    pub fn next_in_block(&self, i: InsnId) -> Option<InsnId> {
        let b = self.block_of(i)?;
        let pos = self.position_in_block(i)?;
        self.basic_blocks[b.0].insns.get(pos + 1).copied()
    }

    pub fn first_in_block(&self, b: BlockId) -> Option<InsnId> {
        self.basic_blocks[b.0].insns.first().copied()
    }

    pub fn terminator(&self, b: BlockId) -> Option<InsnId> {
        self.basic_blocks[b.0]
            .insns
            .last()
            .copied()
            .filter(|&i| self.instructions[i.0].op.is_terminator())
    }

    /// CFG successors of `b`
    pub fn successors(&self, b: BlockId) -> Vec<BlockId> {
        match self.terminator(b).map(|t| self.instructions[t.0].op) {
            Some(Op::Branch(t)) => vec![t],
            Some(Op::CondBranch(t, e)) if t == e => vec![t],
            Some(Op::CondBranch(t, e)) => vec![t, e],
            _ => vec![],
        }
    }

    /// The first instruction executed when `f` is called
    pub fn entry_instruction(&self, f: FuncId) -> Option<InsnId> {
        self.functions[f.0]
            .blocks
            .first()
            .and_then(|&b| self.first_in_block(b))
    }

    /// Resolved target of a direct call
    pub fn called_function(&self, i: InsnId) -> Option<FuncId> {
        match self.instructions[i.0].op {
            Op::Call(f) => Some(f),
            _ => None,
        }
    }

    /// Whether `i` is a call into a function whose body is part of the program. Calls to
    /// intrinsics and declarations are not.
    pub fn is_defined_call(&self, i: InsnId) -> bool {
        self.called_function(i)
            .map(|f| self.functions[f.0].kind == FunctionKind::Defined)
            .unwrap_or(false)
    }

    /// Debug-derived `(function, file, line)` of an attached instruction
    pub fn debug_location(&self, i: InsnId) -> Option<(&str, &DebugLoc)> {
        let f = self.function_of(i)?;
        let loc = self.instructions[i.0].loc.as_ref()?;
        Some((self.functions[f.0].name.as_str(), loc))
    }

    /// All attached instructions, in function and block order
    pub fn attached_instructions(&self) -> impl Iterator<Item = InsnId> + '_ {
        self.functions.iter().flat_map(move |f| {
            f.blocks
                .iter()
                .flat_map(move |&b| self.basic_blocks[b.0].insns.iter().copied())
        })
    }

    /// The values returned by `f`
    pub fn returned_values(&self, f: FuncId) -> Vec<Value> {
        self.functions[f.0]
            .blocks
            .iter()
            .filter_map(|&b| self.terminator(b))
            .filter(|&t| self.instructions[t.0].op == Op::Return)
            .filter_map(|t| self.instructions[t.0].inputs.first().copied())
            .collect()
    }

    /// Check internal consistency of the program.
    pub fn validate(&self) -> Result<(), String> {
        let ni = self.instructions.len();
        let nb = self.basic_blocks.len();
        let nf = self.functions.len();
        let check_value = |v: &Value| -> Result<(), String> {
            match *v {
                Value::Insn(i) if i.0 >= ni => Err(format!("Dangling instruction {:?}", i)),
                Value::Arg(f, n) if f.0 >= nf || n >= self.functions[f.0].num_args => {
                    Err(format!("Dangling argument {:?}/{}", f, n))
                }
                Value::Global(g) if g.0 >= self.globals.len() => {
                    Err(format!("Dangling global {:?}", g))
                }
                _ => Ok(()),
            }
        };
        for (fi, f) in self.functions.iter().enumerate() {
            if (f.kind == FunctionKind::Defined) == f.blocks.is_empty() {
                return Err(format!("Function {} has a mismatched body", f.name));
            }
            for &b in &f.blocks {
                if b.0 >= nb || self.basic_blocks[b.0].function != FuncId(fi) {
                    return Err(format!("Block {:?} does not belong to {}", b, f.name));
                }
            }
        }
        for (bi, b) in self.basic_blocks.iter().enumerate() {
            let b_id = BlockId(bi);
            if self.terminator(b_id).is_none() {
                return Err(format!("Block {:?} does not end in a terminator", b_id));
            }
            for (pos, &i) in b.insns.iter().enumerate() {
                if i.0 >= ni {
                    return Err(format!("Block {:?} holds dangling {:?}", b_id, i));
                }
                let ins = &self.instructions[i.0];
                if ins.block != Some(b_id) {
                    return Err(format!("{:?} is not marked as part of {:?}", i, b_id));
                }
                if ins.op.is_terminator() && pos + 1 != b.insns.len() {
                    return Err(format!("Terminator {:?} in the middle of {:?}", i, b_id));
                }
                ins.try_confirm_valid()?;
                ins.inputs.iter().try_for_each(check_value)?;
                match ins.op {
                    Op::Call(f) if f.0 >= nf => {
                        return Err(format!("{:?} calls unknown function {:?}", i, f))
                    }
                    Op::Branch(t) | Op::CondBranch(t, _) | Op::CondBranch(_, t)
                        if t.0 >= nb || self.basic_blocks[t.0].function != b.function =>
                    {
                        return Err(format!("{:?} branches outside its function", i))
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// A debug view of the program, one instruction per line
    pub fn debug_program(&self) -> DebugProgram<'_> {
        DebugProgram { program: self }
    }
}

/// Human-readable listing of a [`Program`]. Debug locations are shown when requested via
/// [`with_SHOW_DEBUG_LOCATIONS_set`].
pub struct DebugProgram<'a> {
    program: &'a Program,
}

impl<'a> std::fmt::Debug for DebugProgram<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let p = self.program;
        for (fi, func) in p.functions.iter().enumerate() {
            match func.kind {
                FunctionKind::Defined => writeln!(f, "{:?} {}:", FuncId(fi), func.name)?,
                kind => {
                    writeln!(f, "{:?} {} ({:?})", FuncId(fi), func.name, kind)?;
                    continue;
                }
            }
            for &b in &func.blocks {
                writeln!(f, "  {:?}:", b)?;
                for &i in &p.basic_blocks[b.0].insns {
                    writeln!(f, "    {:?} = {:?}", i, p.instructions[i.0])?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program() -> (Program, InsnId, InsnId, InsnId) {
        let mut p = Program::new();
        let g = p.add_global("pool");
        let main = p.reserve_function("main", 1);
        p.begin_function(main);
        let entry = p.add_block();
        let exit = p.add_block();
        p.position_at_end(entry);
        let st = p.add_instruction(
            Op::Store,
            vec![Value::Global(g), Value::Arg(main, 0)],
            Some(("a.c", 1)),
        );
        let br = p.add_instruction(Op::Branch(exit), vec![], None);
        p.position_at_end(exit);
        let ret = p.add_instruction(Op::Return, vec![], Some(("a.c", 2)));
        p.end_function();
        (p, st, br, ret)
    }

    #[test]
    fn insertion_and_detachment_keep_ids_stable() {
        let (mut p, st, br, ret) = program();
        let fl = p
            .insert_after(
                st,
                Instruction {
                    op: Op::Flush(FlushPrimitive::Clwb),
                    inputs: vec![Value::Global(GlobalId(0))],
                    loc: None,
                    block: None,
                },
            )
            .unwrap();
        assert_eq!(p.next_in_block(st), Some(fl));
        assert_eq!(p.prev_in_block(br), Some(fl));
        assert!(p.insert_after(br, p.instruction(fl).clone()).is_err());
        assert!(p.detach(ret).is_err());

        p.detach(st).unwrap();
        assert_eq!(p.first_in_block(BlockId(0)), Some(fl));
        assert_eq!(p.instruction(st).op, Op::Store);
        assert_eq!(p.function_of(st), None);
        assert!(p.validate().is_ok());
        assert_eq!(p.successors(BlockId(0)), vec![BlockId(1)]);
    }

    #[test]
    fn json_form_is_validated() {
        let (p, st, _, _) = program();
        let reloaded = Program::from_json(&p.to_json()).unwrap();
        assert_eq!(reloaded.instruction(st), p.instruction(st));

        let mut broken = p;
        broken.instructions[st.0].inputs = vec![Value::Const(0), Value::Const(1)];
        assert!(Program::from_json(&broken.to_json()).is_err());
    }

    #[test]
    fn listing_shows_locations_on_request() {
        let (p, _, _, _) = program();
        let plain = format!("{:?}", p.debug_program());
        let located = with_SHOW_DEBUG_LOCATIONS_set(|| format!("{:?}", p.debug_program()));
        assert!(!plain.contains("a.c:1"));
        assert!(located.contains("!a.c:1"));
        assert!(located.contains("bb1:"));
    }
}
