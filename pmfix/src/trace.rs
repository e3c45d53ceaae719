//! The recorded execution trace: typed durability events, their addresses, source locations and
//! call stacks, and which of them were flagged as bugs.

use crate::fixer_config::CONFIG;

/// A contiguous byte range touched by an event.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressInfo {
    pub address: u64,
    pub length: u64,
}

impl std::fmt::Debug for AddressInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#x}+{}", self.address, self.length)
    }
}

impl AddressInfo {
    pub fn new(address: u64, length: u64) -> Self {
        Self { address, length }
    }

    pub fn start(&self) -> u64 {
        self.address
    }

    /// One past the last byte
    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.length)
    }

    /// Whether the two ranges share at least one byte. Symmetric.
    pub fn overlaps(&self, other: &AddressInfo) -> bool {
        self.start() < other.end() && other.start() < self.end()
    }

    /// Whether the first and last byte fall in the same configured cache line
    pub fn is_single_cache_line(&self) -> bool {
        self.is_single_line_of(CONFIG.cache_line_size)
    }

    pub(crate) fn is_single_line_of(&self, line_size: u64) -> bool {
        let last = self.end().saturating_sub(1).max(self.start());
        self.start() / line_size == last / line_size
    }
}

/// A source position as reported by the tracing tool.
#[derive(Clone, Debug, Default)]
pub struct LocationInfo {
    pub function: String,
    pub file: String,
    pub line: i64,
}

impl LocationInfo {
    pub fn new(function: impl Into<String>, file: impl Into<String>, line: i64) -> Self {
        Self {
            function: function.into(),
            file: file.into(),
            line,
        }
    }

    /// Frames without a function or a positive line cannot be resolved against the program
    pub fn valid(&self) -> bool {
        !self.function.is_empty() && self.line > 0
    }

    /// The last path component of `file`
    pub fn filename(&self) -> &str {
        self.file.rsplit('/').next().unwrap_or(&self.file)
    }
}

/// Function and line must match exactly. Files only need to be contained in one another, since
/// the trace and the debug info can disagree on directory prefixes. Note that this makes the
/// relation non-transitive.
impl PartialEq for LocationInfo {
    fn eq(&self, other: &Self) -> bool {
        if self.function != other.function || self.line != other.line {
            return false;
        }
        if self.file.len() < other.file.len() {
            other.file.contains(self.file.as_str())
        } else {
            self.file.contains(other.file.as_str())
        }
    }
}

impl std::fmt::Display for LocationInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "<{} @ {}:{}>", self.function, self.file, self.line)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum EventType {
    Store,
    Flush,
    Fence,
    AssertPersisted,
    AssertOrdered,
    RequiredFlush,
    Invalid,
}

impl EventType {
    /// Case-insensitive lookup; anything unrecognized is [`EventType::Invalid`]
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "store" => EventType::Store,
            "flush" => EventType::Flush,
            "fence" => EventType::Fence,
            "assert_persisted" => EventType::AssertPersisted,
            "assert_ordered" => EventType::AssertOrdered,
            "required_flush" => EventType::RequiredFlush,
            _ => EventType::Invalid,
        }
    }
}

/// The tool that produced the trace.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceSource {
    PmTest,
    Generic,
}

#[derive(Clone, Debug)]
pub struct TraceEvent {
    pub event_type: EventType,
    /// The event name as it appeared in the trace
    pub type_string: String,
    pub timestamp: u64,
    pub location: LocationInfo,
    pub addresses: Vec<AddressInfo>,
    /// Innermost frame first; `callstack[0]` is the event's own position.
    pub callstack: Vec<LocationInfo>,
    pub is_bug: bool,
}

impl TraceEvent {
    /// Stores and flushes are the operations relevant to backward scans
    pub fn is_operation(&self) -> bool {
        matches!(self.event_type, EventType::Store | EventType::Flush)
    }

    /// The single address of the event, if it has exactly one
    pub fn single_address(&self) -> Option<&AddressInfo> {
        match self.addresses.as_slice() {
            [a] => Some(a),
            _ => None,
        }
    }

    /// The location used to look up program instructions: the innermost stack frame, falling
    /// back to the event location for stack-less events.
    pub fn anchor_location(&self) -> &LocationInfo {
        self.callstack.first().unwrap_or(&self.location)
    }

    /// Whether both events execute under the same chain of callers. The innermost frame's line is
    /// irrelevant.
    pub fn call_stacks_equal(a: &TraceEvent, b: &TraceEvent) -> bool {
        a.callstack.len() == b.callstack.len()
            && a
                .callstack
                .iter()
                .zip(b.callstack.iter())
                .enumerate()
                .all(|(i, (la, lb))| {
                    la.function == lb.function && la.file == lb.file && (i == 0 || la.line == lb.line)
                })
    }
}

/// The immutable, time-ordered trace.
#[derive(Debug)]
pub struct TraceInfo {
    source: TraceSource,
    events: Vec<TraceEvent>,
    bugs: Vec<usize>,
}

impl TraceInfo {
    pub fn new(source: TraceSource) -> Self {
        Self {
            source,
            events: vec![],
            bugs: vec![],
        }
    }

    /// Append an event, recording its index if it is a bug. Only used while building.
    pub(crate) fn add_event(&mut self, event: TraceEvent) {
        if event.is_bug {
            self.bugs.push(self.events.len());
        }
        self.events.push(event);
    }

    pub fn source(&self) -> TraceSource {
        self.source
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    /// Indices of bug events, strictly increasing
    pub fn bugs(&self) -> &[usize] {
        &self.bugs
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl std::ops::Index<usize> for TraceInfo {
    type Output = TraceEvent;
    fn index(&self, i: usize) -> &TraceEvent {
        &self.events[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_symmetric_and_reflexive() {
        let ranges = [
            AddressInfo::new(0x1000, 8),
            AddressInfo::new(0x1004, 8),
            AddressInfo::new(0x1008, 8),
            AddressInfo::new(0x0, 0x2000),
            AddressInfo::new(0x3000, 64),
        ];
        for a in &ranges {
            assert!(a.overlaps(a));
            for b in &ranges {
                assert_eq!(a.overlaps(b), b.overlaps(a));
                if a == b {
                    assert!(a.overlaps(b));
                }
            }
        }
        assert!(!ranges[0].overlaps(&ranges[2]));
        assert!(ranges[0].overlaps(&ranges[1]));
    }

    #[test]
    fn address_equality_is_stronger_than_overlap() {
        let a = AddressInfo::new(0x1000, 8);
        let b = AddressInfo::new(0x1000, 4);
        assert!(a.overlaps(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn single_cache_line() {
        for &(addr, len) in &[(0u64, 1u64), (0, 64), (60, 4), (60, 5), (64, 64), (127, 2), (4096, 8)] {
            let a = AddressInfo::new(addr, len);
            assert_eq!(
                a.is_single_line_of(64),
                addr / 64 == (addr + len - 1) / 64,
                "{:?}",
                a
            );
        }
        assert!(AddressInfo::new(0x2000, 64).is_single_cache_line());
        assert!(!AddressInfo::new(0x2020, 64).is_single_cache_line());
    }

    #[test]
    fn location_file_containment() {
        let a = LocationInfo::new("f", "/home/user/src/foo.c", 10);
        let b = LocationInfo::new("f", "src/foo.c", 10);
        let c = LocationInfo::new("f", "src/foo.c", 11);
        let d = LocationInfo::new("g", "src/foo.c", 10);
        assert_eq!(a, b);
        assert_eq!(b, a);
        assert_ne!(b, c);
        assert_ne!(b, d);
        assert_eq!(a.filename(), "foo.c");
    }

    #[test]
    fn event_names_are_case_insensitive() {
        assert_eq!(EventType::from_name("STORE"), EventType::Store);
        assert_eq!(EventType::from_name("Assert_Persisted"), EventType::AssertPersisted);
        assert_eq!(EventType::from_name("required_flush"), EventType::RequiredFlush);
        assert_eq!(EventType::from_name("ntstore"), EventType::Invalid);
    }
}
