//! Decide whether a flush is redundant between two trace events, and if it is only redundant
//! along some paths, where those paths begin.

use crate::containers::unordered::UnorderedSet;
use crate::containers::InsertionOrderedSet;
use crate::context_graph::{ContextGraph, NodeId};
use crate::error::FixError;
use crate::il::{InsnId, Op, Program, Value};
use crate::location_mapper::BugLocationMapper;
use crate::log::*;
use crate::points_to::PointsTo;
use crate::trace::TraceEvent;

pub struct FlowAnalyzer<'a> {
    program: &'a Program,
    pts: &'a PointsTo,
    graph: ContextGraph,
    always_redundant: Option<bool>,
    boundaries: Vec<NodeId>,
}

impl<'a> FlowAnalyzer<'a> {
    /// Build the context graph between `start` (the original flush) and `end` (the flush that is
    /// suspected redundant).
    pub fn new(
        program: &'a Program,
        mapper: &BugLocationMapper,
        pts: &'a PointsTo,
        start: &TraceEvent,
        end: &TraceEvent,
    ) -> Result<Self, FixError> {
        Ok(Self {
            program,
            pts,
            graph: ContextGraph::construct(program, mapper, pts, start, end)?,
            always_redundant: None,
            boundaries: vec![],
        })
    }

    pub fn graph(&self) -> &ContextGraph {
        &self.graph
    }

    /// The part of node `n`'s window that lies between the two events: strictly after the start
    /// event's instruction in the root, strictly before the end event's instruction in the end
    /// node.
    fn effective_window(&self, n: NodeId) -> Vec<InsnId> {
        let insns = self.graph[n].block.instructions(self.program);
        let position = |i: InsnId| insns.iter().position(|&x| x == i);
        let lo = if self.graph.is_root(n) {
            position(self.graph.start.trace_insn).map_or(0, |p| p + 1)
        } else {
            0
        };
        let hi = if self.graph.is_end(n) {
            position(self.graph.end.trace_insn).unwrap_or(insns.len())
        } else {
            insns.len()
        };
        if lo <= hi {
            insns[lo..hi].to_vec()
        } else {
            // The end event precedes the start event in a shared window, so the path loops
            // around; the whole tail after the start is live.
            insns[lo..].to_vec()
        }
    }

    /// Whether node `n` leaves a store to PM unflushed. Memoized on the node.
    fn interpret(&mut self, n: NodeId) -> bool {
        if let Some(s) = self.graph[n].spoils {
            return s;
        }
        let pm = &self.graph.contexts[self.graph[n].block.ctx].pm;
        let mut pending: Vec<(InsnId, Value)> = vec![];
        for i in self.effective_window(n) {
            let ins = self.program.instruction(i);
            match ins.op {
                Op::Store => {
                    let p = ins.inputs[0];
                    if pm.points_to_pm(&p, self.pts) {
                        pending.push((i, p));
                    }
                }
                Op::Flush(_) => {
                    let q = ins.inputs[0];
                    pending.retain(|(_, p)| !self.pts.may_alias(p, &q));
                }
                _ => {}
            }
        }
        for (i, _) in &pending {
            trace!("Unflushed PM store"; "node" => n, "store" => ?i);
        }
        let spoils = !pending.is_empty();
        self.graph[n].spoils = Some(spoils);
        spoils
    }

    /// Whether no path from the start event to the end event modifies PM without flushing it. Only
    /// nodes with successors, and the end node, are considered.
    pub fn always_redundant(&mut self) -> bool {
        if let Some(r) = self.always_redundant {
            return r;
        }
        let mut r = true;
        for n in self.bfs_order() {
            let relevant = !self.graph[n].children.is_empty() || self.graph.is_end(n);
            if relevant && self.interpret(n) {
                debug!("Flush is needed on some path"; "node" => n);
                r = false;
                break;
            }
        }
        self.always_redundant = Some(r);
        r
    }

    fn bfs_order(&self) -> Vec<NodeId> {
        let mut visited: UnorderedSet<NodeId> = Default::default();
        let mut order = vec![];
        let mut queue: std::collections::VecDeque<NodeId> =
            self.graph.roots.iter().copied().collect();
        while let Some(n) = queue.pop_front() {
            if !visited.insert(n) {
                continue;
            }
            order.push(n);
            queue.extend(self.graph[n].children.iter().copied());
        }
        order
    }

    /// The earliest points after which the flush at the end event is redundant on every path
    /// onward. Empty if there is no such point.
    pub fn redundant_paths(&mut self) -> Vec<InsnId> {
        let order = self.bfs_order();
        for &n in &order {
            self.interpret(n);
        }
        let spoils = |g: &ContextGraph, n: NodeId| g[n].spoils == Some(true);

        // Greatest fixpoints: start from everything being redundant and only ever retract.
        for &n in &order {
            self.graph[n].redundant_in_parents = true;
            self.graph[n].redundant_in_children = true;
        }
        let mut changed = true;
        while changed {
            changed = false;
            for &n in &order {
                let g = &self.graph;
                let rip = g.is_root(n)
                    || g[n]
                        .parents
                        .iter()
                        .all(|&p| !spoils(g, p) && g[p].redundant_in_parents);
                if rip != g[n].redundant_in_parents {
                    self.graph[n].redundant_in_parents = rip;
                    changed = true;
                }
            }
        }
        changed = true;
        while changed {
            changed = false;
            for &n in order.iter().rev() {
                let g = &self.graph;
                let ric = g[n]
                    .children
                    .iter()
                    .all(|&c| !spoils(g, c) && g[c].redundant_in_children);
                if ric != g[n].redundant_in_children {
                    self.graph[n].redundant_in_children = ric;
                    changed = true;
                }
            }
        }

        let both = |g: &ContextGraph, n: NodeId| {
            g[n].redundant_in_parents && g[n].redundant_in_children
        };
        let mut candidates: InsertionOrderedSet<NodeId> = InsertionOrderedSet::new();
        let mut visited: UnorderedSet<NodeId> = Default::default();
        let mut queue: std::collections::VecDeque<NodeId> =
            self.graph.roots.iter().copied().collect();
        while let Some(n) = queue.pop_front() {
            if !visited.insert(n) {
                continue;
            }
            if both(&self.graph, n) {
                candidates.insert(n);
            } else {
                queue.extend(self.graph[n].children.iter().copied());
            }
        }

        let boundaries: Vec<NodeId> = candidates
            .into_vec()
            .into_iter()
            .filter(|&n| !self.has_redundant_ancestor(n, both))
            .collect();
        debug!(
            "Computed redundant path boundaries";
            "nodes" => self.graph.nodes.len(),
            "boundaries" => ?boundaries,
        );
        let r = boundaries
            .iter()
            .map(|&n| self.graph[n].block.trace_insn)
            .collect();
        self.boundaries = boundaries;
        r
    }

    /// Whether some other node on a path from a root to `n` satisfies `pred`. Such a node must be
    /// reachable from a root without passing through `n`, so nodes only reachable through `n`
    /// (e.g. the body of a loop headed by `n`) do not count.
    fn has_redundant_ancestor(
        &self,
        n: NodeId,
        pred: impl Fn(&ContextGraph, NodeId) -> bool,
    ) -> bool {
        if self.graph.is_root(n) {
            return false;
        }
        let mut before_n: UnorderedSet<NodeId> = Default::default();
        let mut stack: Vec<NodeId> = self.graph.roots.clone();
        while let Some(a) = stack.pop() {
            if a == n || !before_n.insert(a) {
                continue;
            }
            stack.extend(self.graph[a].children.iter().copied());
        }

        let mut visited: UnorderedSet<NodeId> = std::iter::once(n).collect();
        let mut stack: Vec<NodeId> = self.graph[n].parents.iter().copied().collect();
        while let Some(a) = stack.pop() {
            if !before_n.contains(&a) || !visited.insert(a) {
                continue;
            }
            if pred(&self.graph, a) {
                return true;
            }
            stack.extend(self.graph[a].parents.iter().copied());
        }
        false
    }

    /// Nodes found by the last [`Self::redundant_paths`]
    pub fn boundary_nodes(&self) -> &[NodeId] {
        &self.boundaries
    }

    pub fn generate_dot(&self) -> String {
        self.graph.generate_dot(self.program, &self.boundaries)
    }
}
