//! Fix descriptions, and the per-instruction map of fixes a repair run accumulates.

use serde::Serialize;

use crate::containers::unordered::UnorderedMap;
use crate::error::FixError;
use crate::il::{InsnId, Program};
use crate::log::*;

/// The edits a fix can make at an instruction.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FixType {
    /// Flush the address of the store
    AddFlushOnly,
    /// Fence right after the flush
    AddFenceOnly,
    /// Flush the address of the store, then fence
    AddFlushAndFence,
    /// Delete the flush
    RemoveFlushOnly,
    /// Flush here, but only on the path where the dependent fix's flush is removed
    AddFlushCondition,
    /// Delete the flush, provided the chain of conditional flushes it depends on is in place
    RemoveFlushConditional,
}

impl FixType {
    pub fn is_conditional(self) -> bool {
        matches!(
            self,
            FixType::AddFlushCondition | FixType::RemoveFlushConditional
        )
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FixDesc {
    pub fix_type: FixType,
    /// The instruction whose fix this one is chained to, for conditional fixes
    pub dependent: Option<InsnId>,
}

impl FixDesc {
    pub fn new(fix_type: FixType) -> Self {
        Self {
            fix_type,
            dependent: None,
        }
    }

    pub fn depending_on(fix_type: FixType, dependent: InsnId) -> Self {
        Self {
            fix_type,
            dependent: Some(dependent),
        }
    }
}

/// At most one fix per instruction.
#[derive(Default, Debug)]
pub struct FixMap {
    fixes: UnorderedMap<InsnId, FixDesc>,
}

impl FixMap {
    pub fn new() -> Self {
        Default::default()
    }

    /// Record `incoming` at `i`, merging with whatever is already there. Returns whether the map
    /// changed.
    pub fn add_fix(&mut self, i: InsnId, incoming: FixDesc) -> Result<bool, FixError> {
        use FixType::*;
        let existing = match self.fixes.get(&i) {
            None => {
                trace!("Adding fix"; "insn" => ?i, "fix" => ?incoming);
                self.fixes.insert(i, incoming);
                return Ok(true);
            }
            Some(&e) => e,
        };
        if existing == incoming {
            return Ok(false);
        }
        match (existing.fix_type, incoming.fix_type) {
            (AddFlushOnly, AddFenceOnly) | (AddFenceOnly, AddFlushOnly) => {
                debug!("Merging flush and fence fixes"; "insn" => ?i);
                self.fixes.insert(i, FixDesc::new(AddFlushAndFence));
                Ok(true)
            }
            (AddFlushOnly | AddFlushAndFence, RemoveFlushOnly) => Err(FixError::ConflictingFixes {
                insn: i,
                existing,
                incoming,
            }),
            _ => Err(FixError::UnhandledFixCombination {
                insn: i,
                existing,
                incoming,
            }),
        }
    }

    pub fn get(&self, i: InsnId) -> Option<&FixDesc> {
        self.fixes.get(&i)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&InsnId, &FixDesc)> {
        self.fixes.iter()
    }

    pub fn len(&self) -> usize {
        self.fixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fixes.is_empty()
    }

    /// The order fixes should be applied in: unconditional fixes by instruction, then each
    /// conditional chain, with its conditional flushes before the removal guarded by them.
    pub fn application_order(&self) -> Vec<(InsnId, FixDesc)> {
        let mut sorted: Vec<(InsnId, FixDesc)> = self.fixes.iter().map(|(&i, &d)| (i, d)).collect();
        sorted.sort_by_key(|(i, _)| *i);

        let mut order: Vec<(InsnId, FixDesc)> = sorted
            .iter()
            .filter(|(_, d)| !d.fix_type.is_conditional())
            .copied()
            .collect();
        let mut placed: crate::containers::unordered::UnorderedSet<InsnId> =
            order.iter().map(|(i, _)| *i).collect();

        for &(i, d) in sorted
            .iter()
            .filter(|(_, d)| d.fix_type == FixType::RemoveFlushConditional)
        {
            let mut chain = vec![];
            let mut cur = d.dependent;
            while let Some(c) = cur {
                if c == i || placed.contains(&c) {
                    break;
                }
                match self.fixes.get(&c) {
                    Some(&cd) if cd.fix_type == FixType::AddFlushCondition => {
                        placed.insert(c);
                        chain.push((c, cd));
                        cur = cd.dependent;
                    }
                    _ => break,
                }
            }
            order.extend(chain.into_iter().rev());
            placed.insert(i);
            order.push((i, d));
        }

        // Conditional flushes that no removal depends on
        order.extend(sorted.into_iter().filter(|(i, _)| !placed.contains(i)));
        order
    }

    /// A serializable summary of every fix, in application order
    pub fn report(&self, program: &Program) -> Vec<FixReportEntry> {
        self.application_order()
            .into_iter()
            .map(|(i, d)| {
                let (function, file, line) = match program.debug_location(i) {
                    Some((f, loc)) => (Some(f.to_owned()), Some(loc.file.clone()), Some(loc.line)),
                    None => (
                        program
                            .function_of(i)
                            .map(|f| program.function(f).name.clone()),
                        None,
                        None,
                    ),
                };
                FixReportEntry {
                    instruction: i,
                    fix: d.fix_type,
                    dependent: d.dependent,
                    function,
                    file,
                    line,
                }
            })
            .collect()
    }
}

/// One line of the fix report.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct FixReportEntry {
    pub instruction: InsnId,
    pub fix: FixType,
    pub dependent: Option<InsnId>,
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<i64>,
}
