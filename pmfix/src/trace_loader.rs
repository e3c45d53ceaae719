//! A loader for traces exported by PM bug-finding tools.
//!
//! The trace is a YAML document with a `metadata` section and an ordered `trace` list. Each
//! record names its `event`, `timestamp`, source position, `is_bug` flag and `stack`, plus the
//! address fields required by its event type.

use serde::Deserialize;

use crate::error::FixError;
use crate::log::*;
use crate::trace::{AddressInfo, EventType, LocationInfo, TraceEvent, TraceInfo, TraceSource};

#[derive(Deserialize, Default)]
struct RawMetadata {
    #[serde(default)]
    source: Option<String>,
}

#[derive(Deserialize)]
struct RawFrame {
    function: String,
    file: String,
    line: i64,
}

#[derive(Deserialize)]
struct RawEvent {
    event: String,
    timestamp: u64,
    function: String,
    file: String,
    line: i64,
    is_bug: bool,
    stack: Vec<RawFrame>,
    address: Option<u64>,
    length: Option<u64>,
    address_a: Option<u64>,
    length_a: Option<u64>,
    address_b: Option<u64>,
    length_b: Option<u64>,
}

#[derive(Deserialize)]
struct RawTrace {
    #[serde(default)]
    metadata: Option<RawMetadata>,
    trace: Vec<RawEvent>,
}

fn parse_source(metadata: Option<RawMetadata>) -> Result<TraceSource, FixError> {
    match metadata.unwrap_or_default().source {
        None => Ok(TraceSource::Generic),
        Some(s) => match s.to_ascii_uppercase().as_str() {
            "PMTEST" => Ok(TraceSource::PmTest),
            "GENERIC" => Ok(TraceSource::Generic),
            _ => Err(FixError::TraceParse(format!("unknown trace source `{}`", s))),
        },
    }
}

fn convert_event(index: usize, raw: RawEvent) -> Result<TraceEvent, FixError> {
    let event_type = EventType::from_name(&raw.event);
    let require = |v: Option<u64>, field: &'static str| {
        v.ok_or_else(|| FixError::MissingField {
            index,
            event: raw.event.clone(),
            field,
        })
    };
    let addresses = match event_type {
        EventType::Invalid => return Err(FixError::UnknownEventType(raw.event)),
        EventType::Store
        | EventType::Flush
        | EventType::AssertPersisted
        | EventType::RequiredFlush => vec![AddressInfo::new(
            require(raw.address, "address")?,
            require(raw.length, "length")?,
        )],
        EventType::AssertOrdered => vec![
            AddressInfo::new(
                require(raw.address_a, "address_a")?,
                require(raw.length_a, "length_a")?,
            ),
            AddressInfo::new(
                require(raw.address_b, "address_b")?,
                require(raw.length_b, "length_b")?,
            ),
        ],
        EventType::Fence => vec![],
    };
    Ok(TraceEvent {
        event_type,
        type_string: raw.event,
        timestamp: raw.timestamp,
        location: LocationInfo::new(raw.function, raw.file, raw.line),
        addresses,
        callstack: raw
            .stack
            .into_iter()
            .map(|f| LocationInfo::new(f.function, f.file, f.line))
            .collect(),
        is_bug: raw.is_bug,
    })
}

/// Parse a trace document into a [`TraceInfo`].
pub fn load_from(trace_yaml: &str) -> Result<TraceInfo, FixError> {
    let raw: RawTrace =
        serde_yaml::from_str(trace_yaml).map_err(|e| FixError::TraceParse(e.to_string()))?;
    let mut trace = TraceInfo::new(parse_source(raw.metadata)?);
    for (index, raw_event) in raw.trace.into_iter().enumerate() {
        trace.add_event(convert_event(index, raw_event)?);
    }
    info!(
        "Loaded trace";
        "events" => trace.len(),
        "bugs" => trace.bugs().len(),
        "source" => ?trace.source(),
    );
    Ok(trace)
}
