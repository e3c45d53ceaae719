use crate::il::{FencePrimitive, FlushPrimitive, InsnId, Op, Program, Value};
use crate::trace::{AddressInfo, EventType, LocationInfo, TraceEvent, TraceInfo, TraceSource};

#[cfg(test)]
use crate::bug_fixer::{compute_repair, do_repair};
#[cfg(test)]
use crate::error::FixError;
#[cfg(test)]
use crate::fix::{FixDesc, FixType};

pub const FILE: &str = "/src/pm/pool.c";
pub const STORE_ADDR: AddressInfo = AddressInfo {
    address: 0x1000,
    length: 8,
};
pub const LINE_ADDR: AddressInfo = AddressInfo {
    address: 0x1000,
    length: 64,
};

fn at(function: &str, line: i64) -> LocationInfo {
    LocationInfo::new(function, "pm/pool.c", line)
}

/// A trace event at `function:line`, called from `callers` (innermost first).
pub fn event(
    event_type: EventType,
    (function, line): (&str, i64),
    callers: &[(&str, i64)],
    addresses: Vec<AddressInfo>,
    is_bug: bool,
) -> TraceEvent {
    TraceEvent {
        event_type,
        type_string: format!("{:?}", event_type),
        timestamp: 0,
        location: at(function, line),
        addresses,
        callstack: std::iter::once((function, line))
            .chain(callers.iter().copied())
            .map(|(f, l)| at(f, l))
            .collect(),
        is_bug,
    }
}

pub fn trace_of(source: TraceSource, events: Vec<TraceEvent>) -> TraceInfo {
    let mut t = TraceInfo::new(source);
    for (n, mut e) in events.into_iter().enumerate() {
        e.timestamp = n as u64;
        t.add_event(e);
    }
    t
}

fn emit(p: &mut Program, op: Op, inputs: Vec<Value>, line: i64) -> InsnId {
    p.add_instruction(op, inputs, Some((FILE, line)))
}

fn store(p: &mut Program, g: Value, line: i64) -> InsnId {
    emit(p, Op::Store, vec![g, Value::Const(1)], line)
}

fn flush(p: &mut Program, g: Value, line: i64) -> InsnId {
    emit(p, Op::Flush(FlushPrimitive::Clwb), vec![g], line)
}

/// Instructions of [`straight_line_program`], by source line
pub struct StraightLine {
    pub store10: InsnId,
    pub flush11: InsnId,
    pub fence12: InsnId,
    pub store13: InsnId,
    pub flush14: InsnId,
    pub flush15: InsnId,
}

/// `main` stores to, flushes and fences a global pool in a single basic block.
pub fn straight_line_program() -> (Program, StraightLine) {
    let mut p = Program::new();
    let pool = Value::Global(p.add_global("pool"));
    let main = p.reserve_function("main", 0);
    p.begin_function(main);
    let b = p.add_block();
    p.position_at_end(b);
    let store10 = store(&mut p, pool, 10);
    let flush11 = flush(&mut p, pool, 11);
    let fence12 = emit(&mut p, Op::Fence(FencePrimitive::Sfence), vec![], 12);
    let store13 = store(&mut p, pool, 13);
    let flush14 = flush(&mut p, pool, 14);
    let flush15 = flush(&mut p, pool, 15);
    emit(&mut p, Op::Return, vec![], 16);
    p.end_function();
    (
        p,
        StraightLine {
            store10,
            flush11,
            fence12,
            store13,
            flush14,
            flush15,
        },
    )
}

/// `main` calls `write_and_flush` and then `flush_only`, optionally storing to the pool in between
/// (at line 21). Returns the program and `flush_only`'s flush (line 10).
pub fn interprocedural_program(store_between_calls: bool) -> (Program, InsnId) {
    let mut p = Program::new();
    let pool = Value::Global(p.add_global("pool"));
    let write_and_flush = p.reserve_function("write_and_flush", 0);
    let flush_only = p.reserve_function("flush_only", 0);
    let main = p.reserve_function("main", 0);

    p.begin_function(write_and_flush);
    let b = p.add_block();
    p.position_at_end(b);
    store(&mut p, pool, 5);
    flush(&mut p, pool, 6);
    emit(&mut p, Op::Return, vec![], 7);
    p.end_function();

    p.begin_function(flush_only);
    let b = p.add_block();
    p.position_at_end(b);
    let flush10 = flush(&mut p, pool, 10);
    emit(&mut p, Op::Return, vec![], 11);
    p.end_function();

    p.begin_function(main);
    let b = p.add_block();
    p.position_at_end(b);
    emit(&mut p, Op::Call(write_and_flush), vec![], 20);
    if store_between_calls {
        store(&mut p, pool, 21);
    }
    emit(&mut p, Op::Call(flush_only), vec![], 22);
    emit(&mut p, Op::Return, vec![], 23);
    p.end_function();

    (p, flush10)
}

/// Trace of [`interprocedural_program`]: the flush in `flush_only` is flagged as redundant.
pub fn interprocedural_trace(store_between_calls: bool) -> TraceInfo {
    let mut events = vec![
        event(
            EventType::Store,
            ("write_and_flush", 5),
            &[("main", 20)],
            vec![STORE_ADDR],
            false,
        ),
        event(
            EventType::Flush,
            ("write_and_flush", 6),
            &[("main", 20)],
            vec![LINE_ADDR],
            false,
        ),
    ];
    if store_between_calls {
        events.push(event(EventType::Store, ("main", 21), &[], vec![STORE_ADDR], false));
    }
    events.push(event(
        EventType::Flush,
        ("flush_only", 10),
        &[("main", 22)],
        vec![LINE_ADDR],
        false,
    ));
    events.push(event(
        EventType::RequiredFlush,
        ("flush_only", 10),
        &[("main", 22)],
        vec![LINE_ADDR],
        true,
    ));
    trace_of(TraceSource::Generic, events)
}

/// Instructions of [`branching_program`]
pub struct Branching {
    /// First instruction of the loop header, if looping
    pub header: Option<InsnId>,
    /// First instructions of the two arms
    pub arms: (InsnId, InsnId),
    pub flush16: InsnId,
}

/// `main(c)` stores and flushes the pool, then flushes it once more at line 16. In between it
/// either branches on `c` into two arms that re-join (the first arm storing to the pool again), or,
/// if `looping`, runs a loop whose body stores to the pool iff `store_in_loop`.
pub fn branching_program(looping: bool, store_in_loop: bool) -> (Program, Branching) {
    let mut p = Program::new();
    let pool = Value::Global(p.add_global("pool"));
    let main = p.reserve_function("main", 1);
    let c = Value::Arg(main, 0);
    p.begin_function(main);
    let entry = p.add_block();
    let b1 = p.add_block();
    let b2 = p.add_block();
    let exit = p.add_block();

    p.position_at_end(entry);
    store(&mut p, pool, 10);
    flush(&mut p, pool, 11);
    let mut header = None;
    let arms;
    if looping {
        emit(&mut p, Op::Branch(b1), vec![], 12);
        p.position_at_end(b1);
        let h = emit(&mut p, Op::Other, vec![c], 13);
        header = Some(h);
        emit(&mut p, Op::CondBranch(b2, exit), vec![c], 13);
        p.position_at_end(b2);
        let body = if store_in_loop {
            store(&mut p, pool, 14)
        } else {
            emit(&mut p, Op::Other, vec![c], 14)
        };
        emit(&mut p, Op::Branch(b1), vec![], 15);
        arms = (h, body);
    } else {
        emit(&mut p, Op::CondBranch(b1, b2), vec![c], 12);
        p.position_at_end(b1);
        let a = store(&mut p, pool, 13);
        emit(&mut p, Op::Branch(exit), vec![], 14);
        p.position_at_end(b2);
        let b = emit(&mut p, Op::Other, vec![c], 15);
        emit(&mut p, Op::Branch(exit), vec![], 15);
        arms = (a, b);
    }
    p.position_at_end(exit);
    let flush16 = flush(&mut p, pool, 16);
    emit(&mut p, Op::Return, vec![], 17);
    p.end_function();

    (
        p,
        Branching {
            header,
            arms,
            flush16,
        },
    )
}

/// Trace of [`branching_program`] that skips the first arm (or the loop), flagging the flush at
/// line 16 as redundant with the one at line 11.
pub fn branching_trace() -> TraceInfo {
    trace_of(
        TraceSource::Generic,
        vec![
            event(EventType::Store, ("main", 10), &[], vec![STORE_ADDR], false),
            event(EventType::Flush, ("main", 11), &[], vec![LINE_ADDR], false),
            event(EventType::Flush, ("main", 16), &[], vec![LINE_ADDR], false),
            event(EventType::RequiredFlush, ("main", 16), &[], vec![LINE_ADDR], true),
        ],
    )
}

/// Instructions of [`loop_beside_store_program`]
pub struct LoopBesideStore {
    pub store13: InsnId,
    /// First instruction of the loop header
    pub header: InsnId,
    pub flush16: InsnId,
}

/// `main(c)` stores and flushes the pool, then either stores to it again (line 13) or runs a loop
/// that never touches it (lines 14-15), before flushing it once more at line 16. Runs with
/// [`branching_trace`].
pub fn loop_beside_store_program() -> (Program, LoopBesideStore) {
    let mut p = Program::new();
    let pool = Value::Global(p.add_global("pool"));
    let main = p.reserve_function("main", 1);
    let c = Value::Arg(main, 0);
    p.begin_function(main);
    let entry = p.add_block();
    let store_arm = p.add_block();
    let header = p.add_block();
    let body = p.add_block();
    let exit = p.add_block();

    p.position_at_end(entry);
    store(&mut p, pool, 10);
    flush(&mut p, pool, 11);
    emit(&mut p, Op::CondBranch(store_arm, header), vec![c], 12);

    p.position_at_end(store_arm);
    let store13 = store(&mut p, pool, 13);
    emit(&mut p, Op::Branch(exit), vec![], 13);

    p.position_at_end(header);
    let h = emit(&mut p, Op::Other, vec![c], 14);
    emit(&mut p, Op::CondBranch(body, exit), vec![c], 14);

    p.position_at_end(body);
    emit(&mut p, Op::Other, vec![c], 15);
    emit(&mut p, Op::Branch(header), vec![], 15);

    p.position_at_end(exit);
    let flush16 = flush(&mut p, pool, 16);
    emit(&mut p, Op::Return, vec![], 17);
    p.end_function();

    (
        p,
        LoopBesideStore {
            store13,
            header: h,
            flush16,
        },
    )
}

/// `main` calls `rec`, which flushes the pool and calls itself.
pub fn recursive_program() -> Program {
    let mut p = Program::new();
    let pool = Value::Global(p.add_global("pool"));
    let rec = p.reserve_function("rec", 0);
    let main = p.reserve_function("main", 0);

    p.begin_function(rec);
    let b = p.add_block();
    p.position_at_end(b);
    flush(&mut p, pool, 30);
    emit(&mut p, Op::Call(rec), vec![], 31);
    emit(&mut p, Op::Return, vec![], 32);
    p.end_function();

    p.begin_function(main);
    let b = p.add_block();
    p.position_at_end(b);
    emit(&mut p, Op::Call(rec), vec![], 40);
    emit(&mut p, Op::Return, vec![], 41);
    p.end_function();
    p
}

#[cfg(test)]
fn persisted_trace(events: Vec<TraceEvent>) -> TraceInfo {
    let mut events = events;
    events.push(event(
        EventType::AssertPersisted,
        ("main", 16),
        &[],
        vec![STORE_ADDR],
        true,
    ));
    trace_of(TraceSource::Generic, events)
}

#[test]
fn missing_flush_and_fence() {
    let (mut p, l) = straight_line_program();
    let trace = persisted_trace(vec![event(
        EventType::Store,
        ("main", 13),
        &[],
        vec![STORE_ADDR],
        false,
    )]);
    let outcome = do_repair(&mut p, &trace).unwrap();
    assert_eq!(
        outcome.fix_map.get(l.store13),
        Some(&FixDesc::new(FixType::AddFlushAndFence))
    );
    assert_eq!(outcome.fix_map.len(), 1);
    assert_eq!(outcome.fixed_bugs, vec![1]);
    assert!(outcome.modified);

    let new_flush = p.next_in_block(l.store13).unwrap();
    let new_fence = p.next_in_block(new_flush).unwrap();
    assert_eq!(p.instruction(new_flush).op, Op::Flush(FlushPrimitive::Clwb));
    assert_eq!(p.instruction(new_flush).inputs, p.instruction(l.flush14).inputs);
    assert_eq!(p.instruction(new_fence).op, Op::Fence(FencePrimitive::Sfence));
    assert_eq!(p.next_in_block(new_fence), Some(l.flush14));
    assert!(p.validate().is_ok());
}

#[test]
fn missing_flush_before_observed_fence() {
    let (p, l) = straight_line_program();
    let trace = persisted_trace(vec![
        event(EventType::Store, ("main", 10), &[], vec![STORE_ADDR], false),
        event(EventType::Fence, ("main", 12), &[], vec![], false),
    ]);
    let outcome = compute_repair(&p, &trace).unwrap();
    assert_eq!(
        outcome.fix_map.get(l.store10),
        Some(&FixDesc::new(FixType::AddFlushOnly))
    );
    assert_eq!(outcome.fix_map.len(), 1);
}

#[test]
fn missing_fence_after_flush() {
    let (mut p, l) = straight_line_program();
    let trace = persisted_trace(vec![
        event(EventType::Store, ("main", 13), &[], vec![STORE_ADDR], false),
        event(EventType::Flush, ("main", 14), &[], vec![LINE_ADDR], false),
    ]);
    let outcome = do_repair(&mut p, &trace).unwrap();
    assert_eq!(
        outcome.fix_map.get(l.flush14),
        Some(&FixDesc::new(FixType::AddFenceOnly))
    );
    let fence = p.next_in_block(l.flush14).unwrap();
    assert_eq!(p.instruction(fence).op, Op::Fence(FencePrimitive::Sfence));
    assert_eq!(p.next_in_block(fence), Some(l.flush15));
}

#[test]
fn flushed_and_fenced_store_is_contradictory() {
    let (p, _) = straight_line_program();
    let trace = persisted_trace(vec![
        event(EventType::Store, ("main", 10), &[], vec![STORE_ADDR], false),
        event(EventType::Flush, ("main", 11), &[], vec![LINE_ADDR], false),
        event(EventType::Fence, ("main", 12), &[], vec![], false),
    ]);
    assert!(matches!(
        compute_repair(&p, &trace),
        Err(FixError::ContradictoryState {
            bug_index: 3,
            index: 1
        })
    ));
}

#[test]
fn unlocalizable_bugs_are_fatal() {
    let (p, _) = straight_line_program();
    let no_store = persisted_trace(vec![]);
    assert!(matches!(
        compute_repair(&p, &no_store),
        Err(FixError::AnchorNotFound { bug_index: 0, .. })
    ));

    let crossing = trace_of(
        TraceSource::Generic,
        vec![event(
            EventType::AssertPersisted,
            ("main", 16),
            &[],
            vec![AddressInfo::new(0x1020, 64)],
            true,
        )],
    );
    assert!(matches!(
        compute_repair(&p, &crossing),
        Err(FixError::CrossCacheLine { index: 0, .. })
    ));

    let two = trace_of(
        TraceSource::Generic,
        vec![event(
            EventType::AssertPersisted,
            ("main", 16),
            &[],
            vec![STORE_ADDR, LINE_ADDR],
            true,
        )],
    );
    assert!(matches!(
        compute_repair(&p, &two),
        Err(FixError::UnsupportedAddressCount { index: 0, count: 2 })
    ));
}

#[test]
fn ordering_bugs_are_left_alone() {
    let (mut p, _) = straight_line_program();
    let trace = trace_of(
        TraceSource::Generic,
        vec![event(
            EventType::AssertOrdered,
            ("main", 16),
            &[],
            vec![STORE_ADDR, AddressInfo::new(0x2000, 8)],
            true,
        )],
    );
    let outcome = do_repair(&mut p, &trace).unwrap();
    assert!(outcome.fix_map.is_empty());
    assert_eq!(outcome.unfixed_bugs, vec![0]);
    assert!(!outcome.modified);
}

#[test]
fn back_to_back_flush_is_removed() {
    let (mut p, l) = straight_line_program();
    let trace = trace_of(
        TraceSource::Generic,
        vec![
            event(EventType::Store, ("main", 13), &[], vec![STORE_ADDR], false),
            event(EventType::Flush, ("main", 14), &[], vec![LINE_ADDR], false),
            event(EventType::Flush, ("main", 15), &[], vec![LINE_ADDR], false),
            event(EventType::RequiredFlush, ("main", 15), &[], vec![LINE_ADDR], true),
        ],
    );
    let outcome = do_repair(&mut p, &trace).unwrap();
    assert_eq!(
        outcome.fix_map.get(l.flush15),
        Some(&FixDesc::new(FixType::RemoveFlushOnly))
    );
    assert_eq!(outcome.fix_map.len(), 1);
    assert_eq!(p.block_of(l.flush15), None);
    assert_eq!(p.instruction(p.next_in_block(l.flush14).unwrap()).op, Op::Return);
}

#[test]
fn partially_overlapping_flush_is_fatal() {
    let (p, _) = straight_line_program();
    let trace = trace_of(
        TraceSource::Generic,
        vec![
            event(EventType::Flush, ("main", 14), &[], vec![AddressInfo::new(0x1000, 8)], false),
            event(EventType::Flush, ("main", 15), &[], vec![LINE_ADDR], false),
            event(EventType::RequiredFlush, ("main", 15), &[], vec![LINE_ADDR], true),
        ],
    );
    assert!(matches!(
        compute_repair(&p, &trace),
        Err(FixError::PartialFlushOverlap {
            bug_index: 2,
            index: 0
        })
    ));
}

#[test]
fn redundant_flush_in_another_call() {
    let (mut p, flush10) = interprocedural_program(false);
    let trace = interprocedural_trace(false);

    {
        let mapper = crate::location_mapper::BugLocationMapper::build(&p);
        let pts = crate::points_to::PointsTo::new(crate::points_to::Andersen::analyze(&p));
        let mut analyzer =
            crate::flow_analyzer::FlowAnalyzer::new(&p, &mapper, &pts, &trace[1], &trace[2])
                .unwrap();
        let g = analyzer.graph();
        assert_eq!(g.nodes.len(), 3);
        assert_eq!(g.contexts.len(), 3);
        assert_eq!(g.leaves, vec![2]);
        assert_eq!(g.end_node, Some(2));
        assert!(analyzer.always_redundant());
        assert!(g_dot_mentions_all_nodes(&analyzer));
    }

    let outcome = do_repair(&mut p, &trace).unwrap();
    assert_eq!(
        outcome.fix_map.get(flush10),
        Some(&FixDesc::new(FixType::RemoveFlushOnly))
    );
    assert_eq!(p.block_of(flush10), None);
}

#[cfg(test)]
fn g_dot_mentions_all_nodes(analyzer: &crate::flow_analyzer::FlowAnalyzer) -> bool {
    let dot = analyzer.generate_dot();
    dot.starts_with("digraph ContextGraph")
        && (0..analyzer.graph().nodes.len()).all(|n| dot.contains(&format!("n{}", n)))
}

#[test]
fn store_between_calls_makes_removal_conditional() {
    let (mut p, flush10) = interprocedural_program(true);
    let trace = interprocedural_trace(true);
    let outcome = compute_repair(&p, &trace).unwrap();
    let store21 = p
        .attached_instructions()
        .find(|&i| p.instruction(i).op == Op::Store && p.debug_location(i).unwrap().1.line == 21)
        .unwrap();
    assert_eq!(
        outcome.fix_map.get(store21),
        Some(&FixDesc::depending_on(FixType::AddFlushCondition, flush10))
    );
    assert_eq!(
        outcome.fix_map.get(flush10),
        Some(&FixDesc::depending_on(FixType::RemoveFlushConditional, store21))
    );
    assert_eq!(outcome.fix_map.len(), 2);

    assert!(matches!(
        do_repair(&mut p, &trace),
        Err(FixError::UnsupportedFix(FixType::AddFlushCondition))
    ));
}

#[test]
fn conditional_chain_across_branches() {
    let (p, b) = branching_program(false, false);
    let outcome = compute_repair(&p, &branching_trace()).unwrap();
    let (a, c) = b.arms;
    assert_eq!(
        outcome.fix_map.get(a),
        Some(&FixDesc::depending_on(FixType::AddFlushCondition, b.flush16))
    );
    assert_eq!(
        outcome.fix_map.get(c),
        Some(&FixDesc::depending_on(FixType::AddFlushCondition, a))
    );
    assert_eq!(
        outcome.fix_map.get(b.flush16),
        Some(&FixDesc::depending_on(FixType::RemoveFlushConditional, c))
    );
    let order: Vec<InsnId> = outcome
        .fix_map
        .application_order()
        .into_iter()
        .map(|(i, _)| i)
        .collect();
    assert_eq!(order, vec![a, c, b.flush16]);
}

#[test]
fn loops_revisit_existing_nodes() {
    let (p, b) = branching_program(true, false);
    let trace = branching_trace();
    let mapper = crate::location_mapper::BugLocationMapper::build(&p);
    let pts = crate::points_to::PointsTo::new(crate::points_to::Andersen::analyze(&p));
    let mut analyzer =
        crate::flow_analyzer::FlowAnalyzer::new(&p, &mapper, &pts, &trace[1], &trace[2]).unwrap();
    let g = analyzer.graph();
    assert_eq!(g.nodes.len(), 4);
    let root_ctx = g.nodes[0].block.ctx;
    let header = g.find_node(root_ctx, b.header.unwrap()).unwrap();
    assert_eq!(g.nodes[header].parents.len(), 2);
    assert!(analyzer.always_redundant());

    let outcome = compute_repair(&p, &trace).unwrap();
    assert_eq!(
        outcome.fix_map.get(b.flush16),
        Some(&FixDesc::new(FixType::RemoveFlushOnly))
    );
}

#[test]
fn flush_needed_by_a_loop_is_kept() {
    let (p, b) = branching_program(true, true);
    let trace = branching_trace();
    let mapper = crate::location_mapper::BugLocationMapper::build(&p);
    let pts = crate::points_to::PointsTo::new(crate::points_to::Andersen::analyze(&p));
    let mut analyzer =
        crate::flow_analyzer::FlowAnalyzer::new(&p, &mapper, &pts, &trace[1], &trace[2]).unwrap();
    assert!(!analyzer.always_redundant());
    assert!(analyzer.redundant_paths().is_empty());
    assert!(analyzer.boundary_nodes().is_empty());

    let outcome = compute_repair(&p, &trace).unwrap();
    assert!(outcome.fix_map.get(b.flush16).is_none());
    assert_eq!(outcome.unfixed_bugs, vec![3]);
}

#[test]
fn loop_header_beside_a_store_is_a_boundary() {
    let (p, l) = loop_beside_store_program();
    let trace = branching_trace();
    let mapper = crate::location_mapper::BugLocationMapper::build(&p);
    let pts = crate::points_to::PointsTo::new(crate::points_to::Andersen::analyze(&p));
    let mut analyzer =
        crate::flow_analyzer::FlowAnalyzer::new(&p, &mapper, &pts, &trace[1], &trace[2]).unwrap();
    assert!(!analyzer.always_redundant());
    assert_eq!(analyzer.redundant_paths(), vec![l.store13, l.header]);

    let g = analyzer.graph();
    let header = analyzer.boundary_nodes()[1];
    assert_eq!(g[header].parents.len(), 2);
    assert_minimal_boundaries(&analyzer);

    let outcome = compute_repair(&p, &trace).unwrap();
    assert_eq!(
        outcome.fix_map.get(l.store13),
        Some(&FixDesc::depending_on(FixType::AddFlushCondition, l.flush16))
    );
    assert_eq!(
        outcome.fix_map.get(l.header),
        Some(&FixDesc::depending_on(FixType::AddFlushCondition, l.store13))
    );
    assert_eq!(
        outcome.fix_map.get(l.flush16),
        Some(&FixDesc::depending_on(FixType::RemoveFlushConditional, l.header))
    );
}

#[test]
fn boundaries_are_minimal() {
    let cases: Vec<(Program, TraceInfo)> = vec![
        (branching_program(false, false).0, branching_trace()),
        (branching_program(true, false).0, branching_trace()),
        (branching_program(true, true).0, branching_trace()),
        (loop_beside_store_program().0, branching_trace()),
        (interprocedural_program(true).0, interprocedural_trace(true)),
    ];
    for (p, trace) in cases {
        let flushes: Vec<usize> = (0..trace.len())
            .filter(|&i| trace[i].event_type == EventType::Flush)
            .collect();
        let (original, redundant) = (flushes[flushes.len() - 2], flushes[flushes.len() - 1]);
        let mapper = crate::location_mapper::BugLocationMapper::build(&p);
        let pts = crate::points_to::PointsTo::new(crate::points_to::Andersen::analyze(&p));
        let mut analyzer = crate::flow_analyzer::FlowAnalyzer::new(
            &p,
            &mapper,
            &pts,
            &trace[original],
            &trace[redundant],
        )
        .unwrap();
        let paths = analyzer.redundant_paths();
        assert_eq!(paths.len(), analyzer.boundary_nodes().len());
        assert_minimal_boundaries(&analyzer);
    }
}

/// Every boundary node has both redundancy flags, and no other node on a simple path from a root
/// to it does.
#[cfg(test)]
fn assert_minimal_boundaries(analyzer: &crate::flow_analyzer::FlowAnalyzer) {
    use crate::context_graph::{ContextGraph, NodeId};

    fn walk(g: &ContextGraph, path: &mut Vec<NodeId>, target: NodeId, out: &mut Vec<Vec<NodeId>>) {
        let n = path[path.len() - 1];
        if n == target {
            out.push(path.clone());
            return;
        }
        for &c in g[n].children.iter() {
            if !path.contains(&c) {
                path.push(c);
                walk(g, path, target, out);
                path.pop();
            }
        }
    }

    let g = analyzer.graph();
    let both = |n: NodeId| g[n].redundant_in_parents && g[n].redundant_in_children;
    for &b in analyzer.boundary_nodes() {
        assert!(both(b), "boundary {} lacks a redundancy flag", b);
        let mut paths = vec![];
        for &r in &g.roots {
            walk(g, &mut vec![r], b, &mut paths);
        }
        assert!(!paths.is_empty(), "boundary {} is unreachable", b);
        for path in paths {
            let (_, ancestors) = path.split_last().unwrap();
            assert!(
                ancestors.iter().all(|&a| !both(a)),
                "boundary {} is preceded by another redundant node on {:?}",
                b,
                path
            );
        }
    }
}

#[test]
fn caller_frames_must_be_calls() {
    let (p, _) = interprocedural_program(true);
    let trace = trace_of(
        TraceSource::Generic,
        vec![
            event(EventType::Flush, ("flush_only", 10), &[("main", 21)], vec![LINE_ADDR], false),
            event(EventType::Flush, ("flush_only", 10), &[("main", 22)], vec![LINE_ADDR], false),
            event(
                EventType::RequiredFlush,
                ("flush_only", 10),
                &[("main", 22)],
                vec![LINE_ADDR],
                true,
            ),
        ],
    );
    match compute_repair(&p, &trace) {
        Err(FixError::NotACallSite { loc }) => assert_eq!(loc.line, 21),
        r => panic!("expected NotACallSite, got {:?}", r),
    }
}

#[test]
fn recursion_is_fatal() {
    let p = recursive_program();
    let trace = trace_of(
        TraceSource::Generic,
        vec![
            event(EventType::Flush, ("rec", 30), &[("main", 40)], vec![LINE_ADDR], false),
            event(
                EventType::Flush,
                ("rec", 30),
                &[("rec", 31), ("main", 40)],
                vec![LINE_ADDR],
                false,
            ),
            event(
                EventType::RequiredFlush,
                ("rec", 30),
                &[("rec", 31), ("main", 40)],
                vec![LINE_ADDR],
                true,
            ),
        ],
    );
    assert!(matches!(
        compute_repair(&p, &trace),
        Err(FixError::UnsupportedRecursion { function, .. }) if function == "rec"
    ));
}

#[test]
fn pmtest_traces_get_pmtest_primitives() {
    let (mut p, l) = straight_line_program();
    let trace = trace_of(
        TraceSource::PmTest,
        vec![
            event(EventType::Store, ("main", 13), &[], vec![STORE_ADDR], false),
            event(EventType::AssertPersisted, ("main", 16), &[], vec![STORE_ADDR], true),
        ],
    );
    do_repair(&mut p, &trace).unwrap();
    let f = p.next_in_block(l.store13).unwrap();
    assert_eq!(p.instruction(f).op, Op::Flush(FlushPrimitive::PmTestFlush));
    let n = p.next_in_block(f).unwrap();
    assert_eq!(p.instruction(n).op, Op::Fence(FencePrimitive::PmTestFence));
}

#[test]
fn repaired_program_round_trips_through_json() {
    let (mut p, l) = straight_line_program();
    let trace = persisted_trace(vec![event(
        EventType::Store,
        ("main", 13),
        &[],
        vec![STORE_ADDR],
        false,
    )]);
    let outcome = do_repair(&mut p, &trace).unwrap();
    let report = serde_json::to_value(outcome.fix_map.report(&p)).unwrap();
    assert_eq!(report[0]["fix"], "ADD_FLUSH_AND_FENCE");
    assert_eq!(report[0]["instruction"], l.store13.0);
    assert_eq!(report[0]["line"], 13);

    let reloaded = Program::from_json(&p.to_json()).unwrap();
    assert_eq!(
        reloaded.attached_instructions().count(),
        p.attached_instructions().count()
    );
}
