pub mod bug_fixer;
pub mod containers;
pub mod context_graph;
pub mod dynamic_variable;
pub mod error;
pub mod fix;
pub mod fix_generator;
pub mod fixer_config;
pub mod flow_analyzer;
pub mod il;
pub mod location_mapper;
pub mod pm_context;
pub mod points_to;
pub mod trace;
pub mod trace_loader;
pub mod tests;

pub mod log {
    pub use slog_scope::{crit, debug, error, info, trace, warn};

    /// A key that is only logged when its value is present.
    pub struct OptionalKV<V: slog::Value>(pub &'static str, pub Option<V>);

    impl<V: slog::Value> slog::KV for OptionalKV<V> {
        fn serialize(
            &self,
            record: &slog::Record,
            serializer: &mut dyn slog::Serializer,
        ) -> slog::Result {
            match &self.1 {
                Some(v) => v.serialize(record, self.0, serializer),
                None => Ok(()),
            }
        }
    }

    fn severity(debug_level: usize) -> sloggers::types::Severity {
        use sloggers::types::Severity;
        match debug_level {
            0 => Severity::Warning,
            1 => Severity::Info,
            2 => Severity::Debug,
            _ => Severity::Trace,
        }
    }

    /// Sends records both to the terminal and, optionally, to a JSON log file. When a log file is
    /// in use, only errors go to the terminal.
    pub struct FileAndTermDrain {
        file_drain: Option<slog::Logger>,
        term_drain: slog::Logger,
    }

    impl FileAndTermDrain {
        pub fn new(
            debug_level: usize,
            disable_terminal_logging: bool,
            force_block: bool,
            path: Option<std::path::PathBuf>,
        ) -> Result<slog::Logger, sloggers::Error> {
            use sloggers::types::{Format, OverflowStrategy, Severity};
            use sloggers::Build;

            let level = severity(debug_level);
            let term_drain = if disable_terminal_logging {
                sloggers::null::NullLoggerBuilder.build()?
            } else {
                let (term_level, overflow) = match (&path, force_block) {
                    (None, _) => (level, OverflowStrategy::Block),
                    (Some(_), true) => (Severity::Error, OverflowStrategy::Block),
                    (Some(_), false) => (Severity::Error, OverflowStrategy::DropAndReport),
                };
                sloggers::terminal::TerminalLoggerBuilder::new()
                    .destination(sloggers::terminal::Destination::Stderr)
                    .level(term_level)
                    .overflow_strategy(overflow)
                    .format(Format::Compact)
                    .build()?
            };

            let file_drain = match path {
                Some(path) => Some(
                    sloggers::file::FileLoggerBuilder::new(path)
                        .truncate()
                        .level(level)
                        .overflow_strategy(OverflowStrategy::Block)
                        .format(Format::Json)
                        .build()?,
                ),
                None => None,
            };

            Ok(slog::Logger::root(
                Self {
                    file_drain,
                    term_drain,
                },
                slog::o!(),
            ))
        }
    }

    impl slog::Drain for FileAndTermDrain {
        type Ok = ();
        type Err = slog::Never;
        fn log(&self, r: &slog::Record<'_>, kv: &slog::OwnedKVList) -> Result<(), slog::Never> {
            if let Some(f) = &self.file_drain {
                slog::Drain::log(f, r, kv)?;
            }
            slog::Drain::log(&self.term_drain, r, kv)
        }
    }
}
