//! Calling contexts and the persistent-memory facts known within them.
//!
//! A [`FnContext`] is one call-stack node. Contexts are interned in a [`ContextTable`] by the
//! sequence of call sites that produced them, so the same sequence of calls reached along
//! different graph paths yields the same context. Contexts are never removed, and the PM facts
//! they carry only ever grow.

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::FixError;
use crate::il::{FuncId, FunctionKind, InsnId, Op, Program, Value};
use crate::location_mapper::location_of;
use crate::log::*;
use crate::points_to::{MemLoc, PointsTo};

/// The abstract storage locations known to hold persistent data, split by whether the location is
/// a global or not.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct PmDesc {
    pm_locals: UnorderedSet<MemLoc>,
    pm_globals: UnorderedSet<MemLoc>,
}

impl std::fmt::Debug for PmDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "PmDesc(locals={:?}, globals={:?})",
            self.pm_locals, self.pm_globals
        )
    }
}

impl PmDesc {
    fn insert(&mut self, l: MemLoc) -> bool {
        match l {
            MemLoc::Global(_) => self.pm_globals.insert(l),
            MemLoc::Stack(_) | MemLoc::Heap(_) => self.pm_locals.insert(l),
        }
    }

    /// Record that whatever `v` points to is persistent. Returns whether anything new was learnt.
    pub fn add_known_pm_value(&mut self, v: &Value, pts: &PointsTo) -> bool {
        let mut grew = false;
        for &l in pts.get(v).iter() {
            grew |= self.insert(l);
        }
        grew
    }

    /// Whether `v` may point into known persistent storage
    pub fn points_to_pm(&self, v: &Value, pts: &PointsTo) -> bool {
        let s = pts.get(v);
        s.intersects(&self.pm_locals) || s.intersects(&self.pm_globals)
    }

    /// Merge in the facts of `other` (e.g. a callee's, on return). Returns whether anything grew.
    pub fn join_from(&mut self, other: &PmDesc) -> bool {
        let mut grew = false;
        for &l in other.pm_locals.iter().chain(other.pm_globals.iter()) {
            grew |= self.insert(l);
        }
        grew
    }

    pub fn is_subset_of(&self, other: &PmDesc) -> bool {
        self.pm_locals.is_subset(&other.pm_locals) && self.pm_globals.is_subset(&other.pm_globals)
    }

    pub fn is_empty(&self) -> bool {
        self.pm_locals.is_empty() && self.pm_globals.is_empty()
    }
}

/// Index of a context in its [`ContextTable`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtxId(usize);

impl std::fmt::Debug for CtxId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "ctx{}", self.0)
    }
}

/// A single call-stack node.
#[derive(Debug)]
pub struct FnContext {
    pub parent: Option<CtxId>,
    /// Call sites, outermost first. Empty for a root context.
    pub call_stack: Vec<InsnId>,
    /// The function executing in this context
    pub function: FuncId,
    pub pm: PmDesc,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
enum ContextKey {
    Root(FuncId),
    Call(CtxId, InsnId),
}

/// Owner of every context produced while building one context graph.
#[derive(Default)]
pub struct ContextTable {
    contexts: Vec<FnContext>,
    call_site_cache: UnorderedMap<ContextKey, CtxId>,
}

impl std::ops::Index<CtxId> for ContextTable {
    type Output = FnContext;
    fn index(&self, c: CtxId) -> &FnContext {
        &self.contexts[c.0]
    }
}

impl ContextTable {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn get_mut(&mut self, c: CtxId) -> &mut FnContext {
        &mut self.contexts[c.0]
    }

    fn intern(&mut self, key: ContextKey, make: impl FnOnce(&Self) -> FnContext) -> (CtxId, bool) {
        if let Some(&c) = self.call_site_cache.get(&key) {
            return (c, false);
        }
        let ctx = make(self);
        let c = CtxId(self.contexts.len());
        self.contexts.push(ctx);
        self.call_site_cache.insert(key, c);
        (c, true)
    }

    /// The outermost context executing `f`
    pub fn root(&mut self, f: FuncId) -> CtxId {
        self.intern(ContextKey::Root(f), |_| FnContext {
            parent: None,
            call_stack: vec![],
            function: f,
            pm: Default::default(),
        })
        .0
    }

    /// Functions active in `c`: its own and those of all its callers
    pub fn active_functions(&self, c: CtxId) -> impl Iterator<Item = FuncId> + '_ {
        std::iter::successors(Some(c), move |&c| self[c].parent).map(move |c| self[c].function)
    }

    /// Enter the callee of `call` from context `c`. The callee starts out knowing everything its
    /// caller knows about PM.
    pub fn do_call(
        &mut self,
        program: &Program,
        c: CtxId,
        call: InsnId,
    ) -> Result<CtxId, FixError> {
        let callee = match program.instruction(call).op {
            Op::Call(f) if program.function(f).kind == FunctionKind::Defined => f,
            _ => {
                return Err(FixError::NotACallSite {
                    loc: location_of(program, call),
                })
            }
        };
        if self.active_functions(c).any(|f| f == callee) {
            return Err(FixError::UnsupportedRecursion {
                function: program.function(callee).name.clone(),
                call,
            });
        }
        let (nc, is_new) = self.intern(ContextKey::Call(c, call), |table| {
            let parent = &table[c];
            let mut call_stack = parent.call_stack.clone();
            call_stack.push(call);
            FnContext {
                parent: Some(c),
                call_stack,
                function: callee,
                pm: parent.pm.clone(),
            }
        });
        if !is_new && !self[c].pm.is_subset_of(&self[nc].pm) {
            let caller_pm = self[c].pm.clone();
            self.get_mut(nc).pm.join_from(&caller_pm);
            trace!("Caller facts refined a cached context"; "ctx" => ?nc);
        }
        trace!(
            "Entered context";
            "ctx" => ?nc,
            "callee" => &program.function(callee).name,
            "depth" => self[nc].call_stack.len(),
            "new" => is_new,
        );
        Ok(nc)
    }

    /// Return from context `c` through the return instruction `ret`, yielding the caller's
    /// context, or `None` if `c` is a root. If the returned value may point to PM, the call's
    /// result becomes a known PM value in the caller; all the callee's PM facts flow up too.
    pub fn do_return(
        &mut self,
        program: &Program,
        pts: &PointsTo,
        c: CtxId,
        ret: InsnId,
    ) -> Option<CtxId> {
        let parent = self[c].parent?;
        let call = *self[c].call_stack.last()?;
        let returns_pm = program
            .instruction(ret)
            .inputs
            .first()
            .map(|v| self[c].pm.points_to_pm(v, pts))
            .unwrap_or(false);
        let callee_pm = self[c].pm.clone();
        let parent_pm = &mut self.get_mut(parent).pm;
        if returns_pm {
            parent_pm.add_known_pm_value(&Value::Insn(call), pts);
        }
        parent_pm.join_from(&callee_pm);
        Some(parent)
    }
}
