//! The interprocedural context graph spanning two trace events.
//!
//! Nodes are [`ContextBlock`]s: straight-line windows of instructions executing in a particular
//! calling context. A window ends at a call into a defined function, at a return, or at a block
//! terminator. The graph is discovered on demand by a breadth-first walk from the window of the
//! start event, and stops expanding at the window of the end event. Windows are memoized on
//! `(context, first instruction)`, so loops and re-converging paths revisit existing nodes.

use std::collections::VecDeque;

use crate::containers::unordered::{UnorderedMap, UnorderedSet};
use crate::error::FixError;
use crate::il::{with_SHOW_DEBUG_LOCATIONS_set, InsnId, Op, Program};
use crate::location_mapper::BugLocationMapper;
use crate::log::*;
use crate::pm_context::{ContextTable, CtxId};
use crate::points_to::PointsTo;
use crate::trace::TraceEvent;

/// A window of straight-line instructions in a calling context.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ContextBlock {
    pub ctx: CtxId,
    pub first: InsnId,
    /// Inclusive
    pub last: InsnId,
    /// The instruction the trace event that produced this window maps to. Windows reached by
    /// walking the graph have `trace_insn == first`.
    pub trace_insn: InsnId,
}

impl ContextBlock {
    fn ends_window(program: &Program, i: InsnId) -> bool {
        let op = program.instruction(i).op;
        op.is_terminator() || program.is_defined_call(i)
    }

    /// The window starting at `first`
    pub fn starting_at(program: &Program, ctx: CtxId, first: InsnId) -> Self {
        let mut last = first;
        while !Self::ends_window(program, last) {
            match program.next_in_block(last) {
                Some(n) => last = n,
                None => break,
            }
        }
        Self {
            ctx,
            first,
            last,
            trace_insn: first,
        }
    }

    /// The window containing `anchor`: scroll back to just after the previous call to a defined
    /// function (or the block start), then forward as in [`Self::starting_at`].
    pub fn around(program: &Program, ctx: CtxId, anchor: InsnId) -> Self {
        let mut first = anchor;
        while let Some(p) = program.prev_in_block(first) {
            if program.is_defined_call(p) {
                break;
            }
            first = p;
        }
        Self {
            trace_insn: anchor,
            ..Self::starting_at(program, ctx, first)
        }
    }

    /// Resolve `event` into the window it executed in. Caller frames are walked outermost first,
    /// pushing one context per call into a defined function; frames that cannot be resolved are
    /// skipped.
    pub fn from_trace_event(
        program: &Program,
        mapper: &BugLocationMapper,
        contexts: &mut ContextTable,
        event: &TraceEvent,
    ) -> Result<Self, FixError> {
        let mut ctx: Option<CtxId> = None;
        for caller in event.callstack.iter().skip(1).rev() {
            if !caller.valid() || !mapper.contains(caller) {
                trace!("Skipping unresolvable caller frame"; "frame" => %caller);
                continue;
            }
            let call = mapper
                .get_unique_where(caller, |i| program.is_defined_call(i))
                .map_err(|e| match e {
                    FixError::UnmappedLocation(loc) => FixError::NotACallSite { loc },
                    e => e,
                })?;
            let caller_ctx = match ctx {
                Some(c) => c,
                None => contexts.root(program.function_of(call).ok_or_else(|| {
                    FixError::InvalidProgram(format!("{:?} is detached", call))
                })?),
            };
            ctx = Some(contexts.do_call(program, caller_ctx, call)?);
        }

        let loc = event.anchor_location();
        let anchor = mapper.unique_instruction_for(program, event, loc)?;
        let anchor_fn = program
            .function_of(anchor)
            .ok_or_else(|| FixError::InvalidProgram(format!("{:?} is detached", anchor)))?;
        let ctx = match ctx {
            Some(c) if contexts[c].function == anchor_fn => c,
            Some(c) => {
                warn!(
                    "Call stack does not lead into the event's function; starting from a root context";
                    "event" => %event.location,
                    "stack_function" => &program.function(contexts[c].function).name,
                );
                contexts.root(anchor_fn)
            }
            None => contexts.root(anchor_fn),
        };
        Ok(Self::around(program, ctx, anchor))
    }

    /// Whether both describe the same window, regardless of the anchoring instruction
    pub fn same_window(&self, other: &ContextBlock) -> bool {
        self.ctx == other.ctx && self.first == other.first
    }

    /// Instructions of the window, in order
    pub fn instructions(&self, program: &Program) -> Vec<InsnId> {
        let mut r = vec![self.first];
        let mut cur = self.first;
        while cur != self.last {
            match program.next_in_block(cur) {
                Some(n) => {
                    r.push(n);
                    cur = n;
                }
                None => break,
            }
        }
        r
    }
}

pub type NodeId = usize;

/// A node of the [`ContextGraph`], along with the facts the flow analysis computes about it.
#[derive(Debug)]
pub struct GraphNode {
    pub block: ContextBlock,
    pub children: UnorderedSet<NodeId>,
    pub parents: UnorderedSet<NodeId>,
    /// Whether a PM store in the window is left unflushed at its end. `None` until interpreted.
    pub spoils: Option<bool>,
    /// Every path from a root reaches this node without passing a spoiling node
    pub redundant_in_parents: bool,
    /// Every path from this node to a leaf is free of spoiling nodes
    pub redundant_in_children: bool,
}

impl GraphNode {
    fn new(block: ContextBlock) -> Self {
        Self {
            block,
            children: Default::default(),
            parents: Default::default(),
            spoils: None,
            redundant_in_parents: false,
            redundant_in_children: false,
        }
    }
}

pub struct ContextGraph {
    pub nodes: Vec<GraphNode>,
    pub roots: Vec<NodeId>,
    pub leaves: Vec<NodeId>,
    /// Window of the start event
    pub start: ContextBlock,
    /// Window of the end event
    pub end: ContextBlock,
    pub end_node: Option<NodeId>,
    pub contexts: ContextTable,
    node_cache: UnorderedMap<(CtxId, InsnId), NodeId>,
}

impl std::ops::Index<NodeId> for ContextGraph {
    type Output = GraphNode;
    fn index(&self, n: NodeId) -> &GraphNode {
        &self.nodes[n]
    }
}

impl std::ops::IndexMut<NodeId> for ContextGraph {
    fn index_mut(&mut self, n: NodeId) -> &mut GraphNode {
        &mut self.nodes[n]
    }
}

impl ContextGraph {
    /// Build the graph of everything that may execute between `start` and `end`. The persistent
    /// location `start` operates on seeds the PM facts of its context.
    pub fn construct(
        program: &Program,
        mapper: &BugLocationMapper,
        pts: &PointsTo,
        start: &TraceEvent,
        end: &TraceEvent,
    ) -> Result<Self, FixError> {
        let mut contexts = ContextTable::new();
        let start_block = ContextBlock::from_trace_event(program, mapper, &mut contexts, start)?;
        let end_block = ContextBlock::from_trace_event(program, mapper, &mut contexts, end)?;
        if let Some(v) = program.instruction(start_block.trace_insn).pointer_operand() {
            contexts
                .get_mut(start_block.ctx)
                .pm
                .add_known_pm_value(&v, pts);
        }

        let mut g = Self {
            nodes: vec![],
            roots: vec![],
            leaves: vec![],
            start: start_block,
            end: end_block,
            end_node: None,
            contexts,
            node_cache: Default::default(),
        };

        let root = g.insert_node(start_block).0;
        g.roots.push(root);
        let mut frontier: VecDeque<NodeId> = std::iter::once(root).collect();
        while let Some(n) = frontier.pop_front() {
            if g.nodes[n].block.same_window(&end_block) {
                g.end_node = Some(n);
                g.leaves.push(n);
                continue;
            }
            let succs = g.successor_windows(program, pts, n)?;
            if succs.is_empty() {
                g.leaves.push(n);
                continue;
            }
            for (ctx, first) in succs {
                let (child, is_new) = g.node_at(program, ctx, first);
                g.nodes[n].children.insert(child);
                g.nodes[child].parents.insert(n);
                if is_new {
                    frontier.push_back(child);
                }
            }
        }

        debug!(
            "Constructed context graph";
            "nodes" => g.nodes.len(),
            "contexts" => g.contexts.len(),
            "leaves" => g.leaves.len(),
            "reached_end" => g.end_node.is_some(),
        );

        if g.leaves.is_empty() {
            return Err(FixError::NoLeaves {
                start: start.timestamp,
                end: end.timestamp,
            });
        }
        for &l in &g.leaves {
            if Some(l) != g.end_node && !g.is_terminal(program, l) {
                return Err(FixError::InvalidLeaf { node: l });
            }
        }
        Ok(g)
    }

    fn insert_node(&mut self, block: ContextBlock) -> (NodeId, bool) {
        let key = (block.ctx, block.first);
        if let Some(&n) = self.node_cache.get(&key) {
            return (n, false);
        }
        let n = self.nodes.len();
        self.nodes.push(GraphNode::new(block));
        self.node_cache.insert(key, n);
        (n, true)
    }

    fn node_at(&mut self, program: &Program, ctx: CtxId, first: InsnId) -> (NodeId, bool) {
        if let Some(&n) = self.node_cache.get(&(ctx, first)) {
            return (n, false);
        }
        self.insert_node(ContextBlock::starting_at(program, ctx, first))
    }

    /// The node for the window starting at `first` in `ctx`, if it has been discovered
    pub fn find_node(&self, ctx: CtxId, first: InsnId) -> Option<NodeId> {
        self.node_cache.get(&(ctx, first)).copied()
    }

    /// Windows that may execute right after node `n`
    fn successor_windows(
        &mut self,
        program: &Program,
        pts: &PointsTo,
        n: NodeId,
    ) -> Result<Vec<(CtxId, InsnId)>, FixError> {
        let ContextBlock { ctx, last, .. } = self.nodes[n].block;
        let ins = program.instruction(last);
        match ins.op {
            Op::Call(f) if program.is_defined_call(last) => {
                let callee_ctx = self.contexts.do_call(program, ctx, last)?;
                let entry = program.entry_instruction(f).ok_or_else(|| {
                    FixError::InvalidProgram(format!("{} has no body", program.function(f).name))
                })?;
                Ok(vec![(callee_ctx, entry)])
            }
            Op::Return => {
                let call = self.contexts[ctx].call_stack.last().copied();
                match (self.contexts.do_return(program, pts, ctx, last), call) {
                    (Some(parent), Some(call)) => Ok(program
                        .next_in_block(call)
                        .map(|next| (parent, next))
                        .into_iter()
                        .collect()),
                    _ => Ok(vec![]),
                }
            }
            _ => Ok(program
                .block_of(last)
                .map(|b| program.successors(b))
                .unwrap_or_default()
                .into_iter()
                .filter_map(|b| program.first_in_block(b))
                .map(|first| (ctx, first))
                .collect()),
        }
    }

    /// Whether execution cannot continue past node `n`
    pub fn is_terminal(&self, program: &Program, n: NodeId) -> bool {
        let b = &self.nodes[n].block;
        match program.instruction(b.last).op {
            Op::Unreachable => true,
            Op::Return => self.contexts[b.ctx].parent.is_none(),
            op if op.is_terminator() => program
                .block_of(b.last)
                .map(|blk| program.successors(blk).is_empty())
                .unwrap_or(true),
            _ => false,
        }
    }

    pub fn is_root(&self, n: NodeId) -> bool {
        self.roots.contains(&n)
    }

    pub fn is_end(&self, n: NodeId) -> bool {
        self.end_node == Some(n)
    }

    /// Render the graph as GraphViz source. Nodes in `highlight` are drawn as double octagons.
    pub fn generate_dot(&self, program: &Program, highlight: &[NodeId]) -> String {
        type Edge = (NodeId, NodeId);

        struct Graph<'a> {
            g: &'a ContextGraph,
            program: &'a Program,
            highlight: &'a [NodeId],
        }

        impl<'a> dot::Labeller<'a, NodeId, Edge> for Graph<'a> {
            fn graph_id(&'a self) -> dot::Id<'a> {
                dot::Id::new("ContextGraph").unwrap()
            }
            fn node_id(&'a self, n: &NodeId) -> dot::Id<'a> {
                dot::Id::new(format!("n{}", n)).unwrap()
            }
            fn node_label<'b>(&'b self, n: &NodeId) -> dot::LabelText<'b> {
                let node = &self.g.nodes[*n];
                let b = &node.block;
                let ctx = &self.g.contexts[b.ctx];
                let mut s = format!(
                    "{:?} {} [depth {}]\\l",
                    b.ctx,
                    self.program.function(ctx.function).name,
                    ctx.call_stack.len()
                );
                with_SHOW_DEBUG_LOCATIONS_set(|| {
                    for i in b.instructions(self.program) {
                        let marker = if i == b.trace_insn { "*" } else { " " };
                        s += &format!("{}{:?} = {:?}\\l", marker, i, self.program.instruction(i));
                    }
                });
                s += &format!(
                    "spoils={:?} rip={} ric={}\\l",
                    node.spoils, node.redundant_in_parents, node.redundant_in_children
                );
                dot::LabelText::escaped(s)
            }
            fn node_shape(&'a self, n: &NodeId) -> Option<dot::LabelText<'a>> {
                if self.highlight.contains(n) {
                    Some(dot::LabelText::label("doubleoctagon"))
                } else if self.g.is_root(*n) || self.g.is_end(*n) {
                    Some(dot::LabelText::label("note"))
                } else {
                    Some(dot::LabelText::label("box"))
                }
            }
        }

        impl<'a> dot::GraphWalk<'a, NodeId, Edge> for Graph<'a> {
            fn nodes(&self) -> dot::Nodes<'a, NodeId> {
                (0..self.g.nodes.len()).collect::<Vec<_>>().into()
            }
            fn edges(&'a self) -> dot::Edges<'a, Edge> {
                self.g
                    .nodes
                    .iter()
                    .enumerate()
                    .flat_map(|(n, node)| node.children.iter().map(move |&c| (n, c)))
                    .collect::<Vec<_>>()
                    .into()
            }
            fn source(&self, e: &Edge) -> NodeId {
                e.0
            }
            fn target(&self, e: &Edge) -> NodeId {
                e.1
            }
        }

        let mut s: Vec<u8> = vec![];
        dot::render(
            &Graph {
                g: self,
                program,
                highlight,
            },
            &mut s,
        )
        .unwrap();
        String::from_utf8(s).unwrap()
    }
}
