//! Points-to information: which abstract storage locations an IL [`Value`] may reference.

use std::cell::RefCell;
use std::rc::Rc;

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::il::{FunctionKind, GlobalId, InsnId, Op, Program, Value};
use crate::log::*;

/// An abstract storage location, named by its allocation site.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum MemLoc {
    Global(GlobalId),
    /// Stack slot allocated by an `Alloca`
    Stack(InsnId),
    /// Memory handed out by an external (declared) function, e.g. `malloc` or a PM mapping call
    Heap(InsnId),
}

/// The structural alias oracle consumed by the analyses.
pub trait AliasOracle {
    /// The set of locations `v` may point to. Values the oracle knows nothing about (including
    /// constants) point nowhere.
    fn points_to(&self, v: &Value) -> UnorderedSet<MemLoc>;
}

#[derive(Debug)]
enum Constraint {
    /// `pts(v) ⊇ {loc}`
    AddrOf(Value, MemLoc),
    /// `pts(dst) ⊇ pts(src)`
    Copy { dst: Value, src: Value },
    /// `pts(dst) ⊇ contents(l)` for each `l ∈ pts(ptr)`
    Load { dst: Value, ptr: Value },
    /// `contents(l) ⊇ pts(src)` for each `l ∈ pts(ptr)`
    Store { ptr: Value, src: Value },
}

/// Flow- and context-insensitive, inclusion-based points-to analysis over a whole program.
pub struct Andersen {
    pts: UnorderedMap<Value, UnorderedSet<MemLoc>>,
    contents: UnorderedMap<MemLoc, UnorderedSet<MemLoc>>,
}

impl Andersen {
    /// Solve the points-to constraints of `program` to a fixpoint
    pub fn analyze(program: &Program) -> Self {
        let constraints = Self::collect_constraints(program);
        let mut r = Self {
            pts: Default::default(),
            contents: Default::default(),
        };

        let mut rounds = 0;
        let mut changed = true;
        while changed {
            changed = false;
            rounds += 1;
            for c in &constraints {
                changed |= r.apply(c);
            }
        }

        debug!(
            "Solved points-to constraints";
            "constraints" => constraints.len(),
            "rounds" => rounds,
            "values" => r.pts.len(),
        );
        r
    }

    fn collect_constraints(program: &Program) -> Vec<Constraint> {
        let mut cs = vec![];
        for (gi, _) in program.globals.iter().enumerate() {
            let g = GlobalId(gi);
            cs.push(Constraint::AddrOf(Value::Global(g), MemLoc::Global(g)));
        }
        for i in program.attached_instructions() {
            let ins = program.instruction(i);
            let out = Value::Insn(i);
            match ins.op {
                Op::Alloca => cs.push(Constraint::AddrOf(out, MemLoc::Stack(i))),
                Op::PtrOffset | Op::Copy | Op::Phi => {
                    for &src in &ins.inputs {
                        cs.push(Constraint::Copy { dst: out, src });
                    }
                }
                Op::Load => cs.push(Constraint::Load {
                    dst: out,
                    ptr: ins.inputs[0],
                }),
                Op::Store => cs.push(Constraint::Store {
                    ptr: ins.inputs[0],
                    src: ins.inputs[1],
                }),
                Op::Call(f) => match program.function(f).kind {
                    FunctionKind::Defined => {
                        for (n, &src) in ins.inputs.iter().enumerate() {
                            cs.push(Constraint::Copy {
                                dst: Value::Arg(f, n),
                                src,
                            });
                        }
                        for src in program.returned_values(f) {
                            cs.push(Constraint::Copy { dst: out, src });
                        }
                    }
                    FunctionKind::Declaration => cs.push(Constraint::AddrOf(out, MemLoc::Heap(i))),
                    FunctionKind::Intrinsic => {}
                },
                Op::Flush(_)
                | Op::Fence(_)
                | Op::Other
                | Op::Return
                | Op::Branch(_)
                | Op::CondBranch(..)
                | Op::Unreachable => {}
            }
        }
        cs.retain(|c| match c {
            Constraint::Copy { src, .. } | Constraint::Store { src, .. } => {
                !matches!(src, Value::Const(_))
            }
            _ => true,
        });
        cs
    }

    fn pts_of(&self, v: &Value) -> Vec<MemLoc> {
        self.pts
            .get(v)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    fn add_all(
        set: &mut UnorderedSet<MemLoc>,
        new: impl IntoIterator<Item = MemLoc>,
    ) -> bool {
        let mut changed = false;
        for l in new {
            changed |= set.insert(l);
        }
        changed
    }

    /// Apply a single constraint, returning whether anything grew
    fn apply(&mut self, c: &Constraint) -> bool {
        match c {
            Constraint::AddrOf(v, l) => self.pts.entry(*v).or_default().insert(*l),
            Constraint::Copy { dst, src } => {
                let new = self.pts_of(src);
                Self::add_all(self.pts.entry(*dst).or_default(), new)
            }
            Constraint::Load { dst, ptr } => {
                let new: Vec<MemLoc> = self
                    .pts_of(ptr)
                    .iter()
                    .filter_map(|l| self.contents.get(l))
                    .flat_map(|s| s.iter().copied())
                    .collect();
                Self::add_all(self.pts.entry(*dst).or_default(), new)
            }
            Constraint::Store { ptr, src } => {
                let new = self.pts_of(src);
                let mut changed = false;
                for l in self.pts_of(ptr) {
                    changed |= Self::add_all(self.contents.entry(l).or_default(), new.clone());
                }
                changed
            }
        }
    }
}

impl AliasOracle for Andersen {
    fn points_to(&self, v: &Value) -> UnorderedSet<MemLoc> {
        self.pts.get(v).cloned().unwrap_or_default()
    }
}

/// Memoizing front-end to an [`AliasOracle`]. Filled lazily and monotonically; shared by reference
/// across every per-bug analysis of a run.
pub struct PointsTo {
    oracle: Box<dyn AliasOracle>,
    cache: RefCell<UnorderedMap<Value, Rc<UnorderedSet<MemLoc>>>>,
}

impl PointsTo {
    pub fn new(oracle: impl AliasOracle + 'static) -> Self {
        Self {
            oracle: Box::new(oracle),
            cache: Default::default(),
        }
    }

    /// The (memoized) points-to set of `v`
    pub fn get(&self, v: &Value) -> Rc<UnorderedSet<MemLoc>> {
        if let Some(s) = self.cache.borrow().get(v) {
            return s.clone();
        }
        let s = Rc::new(self.oracle.points_to(v));
        self.cache.borrow_mut().insert(*v, s.clone());
        s
    }

    /// Whether `a` and `b` may reference a common location
    pub fn may_alias(&self, a: &Value, b: &Value) -> bool {
        let (pa, pb) = (self.get(a), self.get(b));
        pa.intersects(&pb)
    }

    /// Number of memoized values
    pub fn cached(&self) -> usize {
        self.cache.borrow().len()
    }
}
