use pmfix::*;

use std::path::PathBuf;

use clap::Parser;

use error::FixError;

/// Localize and repair durability bugs in persistent-memory programs
#[derive(Parser, Debug)]
#[clap(about, version, author)]
enum Args {
    /// Repair the bugs of a trace in the program it was recorded from
    Repair {
        /// Path to the program, as exported IL in JSON form
        program: PathBuf,
        /// Path to the bug-finding tool's trace (YAML)
        trace: PathBuf,
        /// Path to write the repaired program to. Printed to stdout if not provided.
        #[clap(long)]
        output: Option<PathBuf>,
        /// Path to write the JSON fix report to
        #[clap(long)]
        report: Option<PathBuf>,
        /// Only compute the fixes; do not modify the program
        #[clap(long)]
        report_only: bool,
        /// Cache line size in bytes; must be a power of two
        #[clap(long, default_value = "64")]
        cache_line_size: u64,
        /// Disable terminal logging, even for high severity alerts. Strongly discouraged for normal
        /// use.
        #[clap(long)]
        debug_disable_terminal_logging: bool,
        /// Force blocking for terminal logging, instead of dropping messages when too many are sent
        #[clap(long)]
        debug_forced_blocking_terminal_logging: bool,
        /// Path to send log (as JSON) to
        ///
        /// Error or higher severity alerts will still continue being shown at stderr (in addition
        /// to being added to the log)
        #[clap(long = "--log")]
        log_file: Option<PathBuf>,
        /// Debug level (repeat for more: 0-warn, 1-info, 2-debug, 3-trace)
        #[clap(short, long, parse(from_occurrences))]
        debug: usize,
        /// Advanced configuration options to tweak localization and repair
        #[clap(short = 'Z', long, arg_enum)]
        advanced_config: Vec<fixer_config::CommandLineFixerConfig>,
    },
}

fn report_json(fix_map: &fix::FixMap, prog: &il::Program) -> Result<String, FixError> {
    Ok(serde_json::to_string_pretty(&fix_map.report(prog))?)
}

fn repair(
    program: PathBuf,
    trace: PathBuf,
    output: Option<PathBuf>,
    report: Option<PathBuf>,
    report_only: bool,
) -> Result<(), FixError> {
    let mut prog = il::Program::from_json(&std::fs::read_to_string(program)?)
        .map_err(FixError::InvalidProgram)?;
    let trace = trace_loader::load_from(&std::fs::read_to_string(trace)?)?;

    if report_only {
        let outcome = bug_fixer::compute_repair(&prog, &trace)?;
        let json = report_json(&outcome.fix_map, &prog)?;
        match report {
            Some(path) => std::fs::write(path, json)?,
            None => println!("{}", json),
        }
        return Ok(());
    }

    let outcome = bug_fixer::do_repair(&mut prog, &trace)?;
    if let Some(path) = report {
        std::fs::write(path, report_json(&outcome.fix_map, &prog)?)?;
    }
    match output {
        Some(path) => std::fs::write(path, prog.to_json())?,
        None => println!("{}", prog.to_json()),
    }
    if !outcome.modified {
        log::warn!("Program was not modified");
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    match args {
        Args::Repair {
            program,
            trace,
            output,
            report,
            report_only,
            cache_line_size,
            debug_disable_terminal_logging,
            debug_forced_blocking_terminal_logging,
            log_file,
            debug,
            advanced_config,
        } => {
            let logger = match crate::log::FileAndTermDrain::new(
                debug,
                debug_disable_terminal_logging,
                debug_forced_blocking_terminal_logging,
                log_file,
            ) {
                Ok(l) => l,
                Err(e) => {
                    eprintln!("Could not set up logging: {}", e);
                    std::process::exit(2);
                }
            };
            let _log_guard = slog_scope::set_global_logger(logger);

            fixer_config::FixerConfig::initialize(advanced_config, cache_line_size);

            if let Err(e) = repair(program, trace, output, report, report_only) {
                log::crit!("Repair failed"; "error" => %e);
                drop(_log_guard);
                eprintln!("error: {}", e);
                std::process::exit(1);
            }

            log::trace!("Done");
        }
    }
}
