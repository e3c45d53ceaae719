//! Turn the bugs of a trace into fixes, and apply them.
//!
//! Each bug is localized by scanning the trace backwards from it. Missing flushes and fences are
//! fixed directly at the store or flush found. Redundant flushes are checked with a
//! [`FlowAnalyzer`] over the code between the original and the redundant flush, and are removed
//! outright when redundant on every path, or conditionally when redundant on only some.

use itertools::Itertools;

use crate::error::FixError;
use crate::fix::{FixDesc, FixMap, FixType};
use crate::fix_generator::FixGenerator;
use crate::fixer_config::CONFIG;
use crate::flow_analyzer::FlowAnalyzer;
use crate::il::{InsnId, Program};
use crate::location_mapper::BugLocationMapper;
use crate::log::*;
use crate::points_to::{Andersen, PointsTo};
use crate::trace::{AddressInfo, EventType, TraceEvent, TraceInfo};

/// Computes the [`FixMap`] for every bug in a trace.
pub struct BugFixer<'a> {
    program: &'a Program,
    mapper: &'a BugLocationMapper,
    pts: &'a PointsTo,
    trace: &'a TraceInfo,
    fix_map: FixMap,
    fixed_bugs: Vec<usize>,
    unfixed_bugs: Vec<usize>,
    dot_files_written: usize,
}

impl<'a> BugFixer<'a> {
    pub fn new(
        program: &'a Program,
        mapper: &'a BugLocationMapper,
        pts: &'a PointsTo,
        trace: &'a TraceInfo,
    ) -> Self {
        Self {
            program,
            mapper,
            pts,
            trace,
            fix_map: FixMap::new(),
            fixed_bugs: vec![],
            unfixed_bugs: vec![],
            dot_files_written: 0,
        }
    }

    /// The single, single-cache-line address of the event at `index`
    fn checked_address(&self, index: usize) -> Result<AddressInfo, FixError> {
        let event = &self.trace[index];
        let a = *event
            .single_address()
            .ok_or(FixError::UnsupportedAddressCount {
                index,
                count: event.addresses.len(),
            })?;
        if !a.is_single_cache_line() {
            return Err(FixError::CrossCacheLine {
                index,
                address: a.address,
                length: a.length,
            });
        }
        Ok(a)
    }

    fn add_fix_at_event(&mut self, event: &TraceEvent, fix: FixDesc) -> Result<bool, FixError> {
        let mut added = false;
        for i in self
            .mapper
            .instructions_for(self.program, event, &event.location)?
        {
            added |= self.fix_map.add_fix(i, fix)?;
        }
        Ok(added)
    }

    /// Fix a store that was not durable by the time it was asserted to be.
    pub fn handle_assert_persisted(&mut self, bug_index: usize) -> Result<bool, FixError> {
        let target = self.checked_address(bug_index)?;
        let mut missing_flush = false;
        let mut missing_fence = true;
        let mut last_op = None;
        let trace = self.trace;

        for index in (0..bug_index).rev() {
            let event = &trace[index];
            if event.event_type == EventType::Fence {
                missing_fence = false;
                missing_flush = true;
                continue;
            }
            if !event.is_operation() {
                continue;
            }
            let addr = self.checked_address(index)?;
            match event.event_type {
                EventType::Store if addr == target => {
                    missing_flush = true;
                    last_op = Some(index);
                    break;
                }
                EventType::Flush if addr.overlaps(&target) => {
                    if !missing_fence {
                        return Err(FixError::ContradictoryState { bug_index, index });
                    }
                    last_op = Some(index);
                    break;
                }
                _ => {}
            }
        }

        let index = last_op.ok_or(FixError::AnchorNotFound {
            bug_index,
            what: "store or flush",
        })?;
        let fix_type = match (missing_flush, missing_fence) {
            (true, true) => FixType::AddFlushAndFence,
            (true, false) => FixType::AddFlushOnly,
            (false, _) => FixType::AddFenceOnly,
        };
        debug!(
            "Localized persistence bug";
            "bug" => bug_index,
            "anchor" => index,
            "fix" => ?fix_type,
        );
        self.add_fix_at_event(&trace[index], FixDesc::new(fix_type))
    }

    /// Ordering assertions are recognized, but not fixed.
    pub fn handle_assert_ordered(&mut self, bug_index: usize) -> Result<bool, FixError> {
        warn!("Fixing ordering bugs is not supported"; "bug" => bug_index);
        Ok(false)
    }

    /// Remove (or conditionally remove) a flush that was redundant when executed.
    pub fn handle_required_flush(&mut self, bug_index: usize) -> Result<bool, FixError> {
        let trace = self.trace;
        let target = self.checked_address(bug_index)?;
        let mut redundant = None;
        let mut original = None;

        for index in (0..bug_index).rev() {
            let event = &trace[index];
            if !event.is_operation() {
                continue;
            }
            let addr = self.checked_address(index)?;
            if event.event_type != EventType::Flush {
                continue;
            }
            if addr == target {
                if redundant.is_none() {
                    redundant = Some(index);
                } else {
                    original = Some(index);
                    break;
                }
            } else if addr.overlaps(&target) {
                return Err(FixError::PartialFlushOverlap { bug_index, index });
            }
        }

        let redundant = redundant.ok_or(FixError::AnchorNotFound {
            bug_index,
            what: "redundant flush",
        })?;
        let original = original.ok_or(FixError::AnchorNotFound {
            bug_index,
            what: "original flush",
        })?;
        let (orig, redt) = (&trace[original], &trace[redundant]);
        debug!(
            "Localized redundant flush";
            "bug" => bug_index,
            "original" => original,
            "redundant" => redundant,
            "same_call_stack" => TraceEvent::call_stacks_equal(orig, redt),
        );

        let mut analyzer = FlowAnalyzer::new(self.program, self.mapper, self.pts, orig, redt)?;
        let always = analyzer.always_redundant();
        let paths = if always {
            vec![]
        } else {
            analyzer.redundant_paths()
        };
        debug!(
            "Analyzed context graph";
            "bug" => bug_index,
            "nodes" => analyzer.graph().nodes.len(),
            "always_redundant" => always,
            OptionalKV("boundary_points", (!always).then(|| paths.len())),
        );
        if CONFIG.dump_context_graph_dot_files {
            self.dump_dot(&analyzer)?;
        }

        let targets = self
            .mapper
            .instructions_for(self.program, redt, &redt.location)?;
        let mut added = false;
        if always {
            for i in targets {
                added |= self.fix_map.add_fix(i, FixDesc::new(FixType::RemoveFlushOnly))?;
            }
        } else if paths.is_empty() {
            info!("Flush is not redundant on any path"; "bug" => bug_index);
        } else {
            debug!(
                "Flush is redundant on some paths";
                "bug" => bug_index,
                "points" => paths.iter().map(|p| format!("{:?}", p)).join(","),
            );
            for i in targets {
                let mut prev: InsnId = i;
                for &p in &paths {
                    added |= self
                        .fix_map
                        .add_fix(p, FixDesc::depending_on(FixType::AddFlushCondition, prev))?;
                    prev = p;
                }
                added |= self.fix_map.add_fix(
                    i,
                    FixDesc::depending_on(FixType::RemoveFlushConditional, prev),
                )?;
            }
        }
        Ok(added)
    }

    fn dump_dot(&mut self, analyzer: &FlowAnalyzer) -> Result<(), FixError> {
        let path = format!("context-graph-{}.dot", self.dot_files_written);
        std::fs::write(&path, analyzer.generate_dot())?;
        self.dot_files_written += 1;
        debug!("Dumped context graph"; "path" => path);
        Ok(())
    }

    /// Dispatch on the bug's event type. Returns whether the fix map changed.
    pub fn compute_and_add_fix(&mut self, bug_index: usize) -> Result<bool, FixError> {
        let trace = self.trace;
        let event = &trace[bug_index];
        assert!(event.is_bug, "Trace event {} is not a bug", bug_index);
        match event.event_type {
            EventType::AssertPersisted => self.handle_assert_persisted(bug_index),
            EventType::AssertOrdered => self.handle_assert_ordered(bug_index),
            EventType::RequiredFlush => self.handle_required_flush(bug_index),
            t => {
                warn!("Bugs of this kind are not yet supported"; "bug" => bug_index, "type" => ?t);
                Ok(false)
            }
        }
    }

    /// Whole-map optimization over the computed fixes. None is performed yet.
    pub fn run_fix_map_optimization(&mut self) -> bool {
        false
    }

    /// Compute fixes for every bug of the trace, in trace order.
    pub fn compute_fixes(&mut self) -> Result<(), FixError> {
        let bugs = self.trace.bugs();
        info!("Computing fixes"; "bugs" => bugs.len());
        for &b in bugs {
            if self.compute_and_add_fix(b)? {
                self.fixed_bugs.push(b);
            } else {
                self.unfixed_bugs.push(b);
            }
        }
        info!(
            "Computed fixes";
            "fixes" => self.fix_map.len(),
            "fixed" => self.fixed_bugs.iter().join(","),
            "unfixed" => self.unfixed_bugs.iter().join(","),
        );
        if !self.run_fix_map_optimization() {
            debug!("No fix map optimizations were performed");
        }
        if CONFIG.debug_print_fix_map {
            info!("Fix map"; "map" => ?self.fix_map);
        }
        Ok(())
    }

    pub fn into_outcome(self) -> RepairOutcome {
        RepairOutcome {
            fix_map: self.fix_map,
            fixed_bugs: self.fixed_bugs,
            unfixed_bugs: self.unfixed_bugs,
            modified: false,
        }
    }
}

/// The result of a repair run.
#[derive(Debug)]
pub struct RepairOutcome {
    pub fix_map: FixMap,
    /// Bugs (as trace indices) whose handling changed the fix map
    pub fixed_bugs: Vec<usize>,
    pub unfixed_bugs: Vec<usize>,
    /// Whether the program was edited
    pub modified: bool,
}

/// Apply a single fix.
pub fn fix_bug(fixer: &mut FixGenerator, i: InsnId, desc: FixDesc) -> Result<(), FixError> {
    let failed = |reason: String| FixError::CapabilityFailure {
        fix: desc.fix_type,
        insn: i,
        reason,
    };
    match desc.fix_type {
        FixType::AddFlushOnly => fixer.insert_flush(i).map(|_| ()).map_err(failed),
        FixType::AddFenceOnly => fixer.insert_fence(i).map(|_| ()).map_err(failed),
        FixType::AddFlushAndFence => {
            let flush = fixer.insert_flush(i).map_err(failed)?;
            fixer.insert_fence(flush).map(|_| ()).map_err(failed)
        }
        FixType::RemoveFlushOnly => fixer.remove_flush(i).map_err(failed),
        t @ (FixType::AddFlushCondition | FixType::RemoveFlushConditional) => {
            Err(FixError::UnsupportedFix(t))
        }
    }
}

/// Apply every fix of `fix_map` to the program held by `fixer`. Returns whether the program was
/// modified. Stops at the first failure.
pub fn apply_fixes(fixer: &mut FixGenerator, fix_map: &FixMap) -> Result<bool, FixError> {
    let mut modified = false;
    for (i, desc) in fix_map.application_order() {
        fix_bug(fixer, i, desc)?;
        modified = true;
    }
    Ok(modified)
}

/// Compute the fixes for `trace` without touching the program.
pub fn compute_repair(program: &Program, trace: &TraceInfo) -> Result<RepairOutcome, FixError> {
    let mapper = BugLocationMapper::build(program);
    let pts = PointsTo::new(Andersen::analyze(program));
    let mut fixer = BugFixer::new(program, &mapper, &pts, trace);
    fixer.compute_fixes()?;
    Ok(fixer.into_outcome())
}

/// Localize and fix every bug of `trace` in `program`.
pub fn do_repair(program: &mut Program, trace: &TraceInfo) -> Result<RepairOutcome, FixError> {
    let mut outcome = compute_repair(program, trace)?;
    let mut fixer = FixGenerator::for_source(trace.source(), program);
    outcome.modified = apply_fixes(&mut fixer, &outcome.fix_map)?;
    info!(
        "Repair finished";
        "modified" => outcome.modified,
        "fixes" => outcome.fix_map.len(),
    );
    Ok(outcome)
}
