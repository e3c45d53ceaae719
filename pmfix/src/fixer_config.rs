//! A global store of flags that impact bug localization and repair.
//!
//! WARNING: Currently only supports a single consistent configuration amongst threads (i.e., cannot
//! have different configurations for different repair runs in the same process).

/// The global configuration store. Its fields are expected to be accessed across the program via
/// the global [`CONFIG`](static@CONFIG).
pub struct FixerConfig {
    /// Size (in bytes) of a cache line; events are checked against this to make sure they fit in a
    /// single line.
    pub cache_line_size: u64,
    /// When a source location maps to several instructions, keep only those whose operation
    /// matches the trace event (e.g., stores for a `store` event). Falls back to all mapped
    /// instructions if none match.
    pub filter_mapped_instructions_by_event_kind: bool,
    /// Whether to dump `context-graph-*.dot` files for each analyzed redundant flush.
    pub dump_context_graph_dot_files: bool,
    /// Whether to log the full fix map before it is applied.
    pub debug_print_fix_map: bool,
}

impl FixerConfig {
    /// Internal method: sets up initialization
    #[allow(static_mut_refs)]
    fn from_initialized() -> Self {
        let init = unsafe {
            INTERNAL_CONFIG_INITIALIZER
                .take()
                .expect("Should be initialized only once")
        };
        init.unwrap_or_default()
    }

    /// Initialize with the given command line configuration. Should only be called once, and should
    /// only be called from `main`.
    #[allow(static_mut_refs)]
    pub fn initialize(command_line_config: Vec<CommandLineFixerConfig>, cache_line_size: u64) {
        assert!(
            cache_line_size.is_power_of_two(),
            "Cache line size must be a power of two"
        );
        let mut config: FixerConfig = command_line_config.into();
        config.cache_line_size = cache_line_size;
        let prev = unsafe { INTERNAL_CONFIG_INITIALIZER.replace(Some(config)) };
        assert!(prev.is_some(), "Performed double initialization");
        lazy_static::initialize(&CONFIG);
    }
}

/// Internal initialization detail.
static mut INTERNAL_CONFIG_INITIALIZER: Option<Option<FixerConfig>> = Some(None);

lazy_static::lazy_static! {
    /// The global configuration store
    pub static ref CONFIG: FixerConfig = FixerConfig::from_initialized();
}

#[derive(clap::ArgEnum, Clone, Debug)]
/// Repair configuration parameters
pub enum CommandLineFixerConfig {
    DisableMappedInstructionFilteringByEventKind,
    DumpContextGraphDotFiles,
    EnableDebugPrintFixMap,
}

impl Default for FixerConfig {
    fn default() -> Self {
        FixerConfig {
            cache_line_size: 64,
            filter_mapped_instructions_by_event_kind: true,
            dump_context_graph_dot_files: false,
            debug_print_fix_map: false,
        }
    }
}

impl From<Vec<CommandLineFixerConfig>> for FixerConfig {
    fn from(v: Vec<CommandLineFixerConfig>) -> Self {
        use CommandLineFixerConfig::*;
        let mut r = FixerConfig::default();
        for v in v {
            match v {
                DisableMappedInstructionFilteringByEventKind => {
                    r.filter_mapped_instructions_by_event_kind = false;
                }
                DumpContextGraphDotFiles => {
                    r.dump_context_graph_dot_files = true;
                }
                EnableDebugPrintFixMap => {
                    r.debug_print_fix_map = true;
                }
            }
        }
        r
    }
}
