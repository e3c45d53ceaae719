//! Map trace source locations to the IL instructions emitted for them.

use crate::containers::unordered::UnorderedMap;
use crate::error::FixError;
use crate::fixer_config::CONFIG;
use crate::il::{InsnId, Op, Program};
use crate::log::*;
use crate::trace::{EventType, LocationInfo, TraceEvent};

/// Index from `(function, line)` to the registered locations on that line. The file is compared
/// at lookup time, since [`LocationInfo`] equality on files is containment rather than identity.
pub struct BugLocationMapper {
    loc_map: UnorderedMap<(String, i64), Vec<(LocationInfo, InsnId)>>,
}

impl BugLocationMapper {
    /// Register every store, flush, fence and call instruction of `program` that carries debug
    /// information.
    pub fn build(program: &Program) -> Self {
        let mut r = Self {
            loc_map: Default::default(),
        };
        for i in program.attached_instructions() {
            match program.instruction(i).op {
                Op::Store | Op::Flush(_) | Op::Fence(_) | Op::Call(_) => {}
                _ => continue,
            }
            let loc = location_of(program, i);
            if loc.valid() {
                r.loc_map
                    .entry((loc.function.clone(), loc.line))
                    .or_insert_with(Vec::new)
                    .push((loc, i));
            }
        }
        if r.loc_map.is_empty() {
            warn!("No debug information found in program");
        }
        r
    }

    /// Whether anything is registered at `loc`
    pub fn contains(&self, loc: &LocationInfo) -> bool {
        self.lookup(loc).next().is_some()
    }

    fn lookup<'a>(&'a self, loc: &'a LocationInfo) -> impl Iterator<Item = InsnId> + 'a {
        self.loc_map
            .get(&(loc.function.clone(), loc.line))
            .into_iter()
            .flatten()
            .filter(move |(l, _)| l == loc)
            .map(|(_, i)| *i)
    }

    /// All instructions at `loc`, in program order. Fails if there are none.
    pub fn get(&self, loc: &LocationInfo) -> Result<Vec<InsnId>, FixError> {
        let mut r: Vec<InsnId> = self.lookup(loc).collect();
        r.sort();
        r.dedup();
        if r.is_empty() {
            return Err(FixError::UnmappedLocation(loc.clone()));
        }
        Ok(r)
    }

    /// The single instruction at `loc`.
    pub fn get_unique(&self, loc: &LocationInfo) -> Result<InsnId, FixError> {
        self.get_unique_where(loc, |_| true)
    }

    /// The single instruction at `loc` satisfying `keep`; fails unless there is exactly one.
    pub fn get_unique_where(
        &self,
        loc: &LocationInfo,
        keep: impl Fn(InsnId) -> bool,
    ) -> Result<InsnId, FixError> {
        let kept = self.get(loc)?.into_iter().filter(|&i| keep(i)).collect();
        exactly_one(loc, kept)
    }

    /// The instructions an event at `loc` refers to. When configured, narrows down to
    /// instructions whose operation matches the event type, if any do.
    pub fn instructions_for(
        &self,
        program: &Program,
        event: &TraceEvent,
        loc: &LocationInfo,
    ) -> Result<Vec<InsnId>, FixError> {
        let all = self.get(loc)?;
        if !CONFIG.filter_mapped_instructions_by_event_kind {
            return Ok(all);
        }
        let matching: Vec<InsnId> = all
            .iter()
            .copied()
            .filter(|&i| event_matches_op(event.event_type, program.instruction(i).op))
            .collect();
        if matching.is_empty() {
            Ok(all)
        } else {
            Ok(matching)
        }
    }

    /// The single instruction an event at `loc` refers to, narrowed as in
    /// [`Self::instructions_for`].
    pub fn unique_instruction_for(
        &self,
        program: &Program,
        event: &TraceEvent,
        loc: &LocationInfo,
    ) -> Result<InsnId, FixError> {
        exactly_one(loc, self.instructions_for(program, event, loc)?)
    }
}

fn exactly_one(loc: &LocationInfo, insns: Vec<InsnId>) -> Result<InsnId, FixError> {
    match insns.as_slice() {
        [i] => Ok(*i),
        [] => Err(FixError::UnmappedLocation(loc.clone())),
        _ => Err(FixError::AmbiguousLocation {
            loc: loc.clone(),
            count: insns.len(),
        }),
    }
}

/// The location `i` would be reported at by a trace. Instructions without debug information get a
/// location that is not [`LocationInfo::valid`].
pub fn location_of(program: &Program, i: InsnId) -> LocationInfo {
    match program.debug_location(i) {
        Some((function, loc)) => LocationInfo::new(function, loc.file.clone(), loc.line),
        None => LocationInfo::new(
            program
                .function_of(i)
                .map(|f| program.function(f).name.clone())
                .unwrap_or_default(),
            "",
            0,
        ),
    }
}

/// Whether instructions with `op` can produce trace events of type `t`
pub fn event_matches_op(t: EventType, op: Op) -> bool {
    match (t, op) {
        (EventType::Store, Op::Store) => true,
        (EventType::Flush | EventType::RequiredFlush, Op::Flush(_)) => true,
        (EventType::Fence, Op::Fence(_)) => true,
        _ => false,
    }
}
