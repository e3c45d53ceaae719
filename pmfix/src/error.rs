//! Fatal conditions that abort a repair run.

use crate::fix::{FixDesc, FixType};
use crate::il::InsnId;
use crate::trace::LocationInfo;

/// Everything that can abort a run. None of these are recoverable: the run produces no output.
#[derive(Debug, thiserror::Error)]
pub enum FixError {
    #[error("could not parse trace: {0}")]
    TraceParse(String),
    #[error("unknown trace event type `{0}`")]
    UnknownEventType(String),
    #[error("trace event {index} (`{event}`) is missing field `{field}`")]
    MissingField {
        index: usize,
        event: String,
        field: &'static str,
    },
    #[error("could not load program: {0}")]
    InvalidProgram(String),
    #[error("trace event {index} carries {count} addresses, expected exactly one")]
    UnsupportedAddressCount { index: usize, count: usize },
    #[error("trace event {index} covers {address:#x}+{length}, which crosses a cache line")]
    CrossCacheLine {
        index: usize,
        address: u64,
        length: u64,
    },
    #[error("no {what} found before bug at trace index {bug_index}")]
    AnchorNotFound {
        bug_index: usize,
        what: &'static str,
    },
    #[error("flush at trace index {index} precedes bug {bug_index}, but a fence was also seen")]
    ContradictoryState { bug_index: usize, index: usize },
    #[error("flush at trace index {index} partially overlaps the address of bug {bug_index}")]
    PartialFlushOverlap { bug_index: usize, index: usize },
    #[error("conflicting fixes at {insn:?}: {existing:?} vs {incoming:?}")]
    ConflictingFixes {
        insn: InsnId,
        existing: FixDesc,
        incoming: FixDesc,
    },
    #[error("unhandled fix combination at {insn:?}: {existing:?} vs {incoming:?}")]
    UnhandledFixCombination {
        insn: InsnId,
        existing: FixDesc,
        incoming: FixDesc,
    },
    #[error("recursive call into `{function}` at {call:?} is not supported")]
    UnsupportedRecursion { function: String, call: InsnId },
    #[error("context graph leaf {node} is neither the end block nor a terminator")]
    InvalidLeaf { node: usize },
    #[error("context graph between trace events {start} and {end} has no leaves")]
    NoLeaves { start: u64, end: u64 },
    #[error("no instruction is mapped to {0}")]
    UnmappedLocation(LocationInfo),
    #[error("{loc} maps to {count} instructions, expected exactly one")]
    AmbiguousLocation { loc: LocationInfo, count: usize },
    #[error("{loc} is not a call into a defined function")]
    NotACallSite { loc: LocationInfo },
    #[error("could not apply {fix:?} at {insn:?}: {reason}")]
    CapabilityFailure {
        fix: FixType,
        insn: InsnId,
        reason: String,
    },
    #[error("applying {0:?} fixes is not supported")]
    UnsupportedFix(FixType),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
