//! Structured logging setup, built on `slog` and `sloggers`. The server logs to stderr by
//! default, or to a file when a destination path is supplied.

pub use slog::{debug, error, info, o, trace, warn, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Where the log stream is sent.
pub enum LogTarget {
    Stderr,
    File(std::path::PathBuf),
}

/// Builds the root logger for the process. `level` follows the usual severity names (`trace`,
/// `debug`, `info`, `warning`, `error`, `critical`); an unrecognized name falls back to `info`.
pub fn init(target: LogTarget, level: &str) -> Logger {
    let severity = match level {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "warning" | "warn" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    };

    match target {
        LogTarget::Stderr => {
            let mut builder = TerminalLoggerBuilder::new();
            builder.destination(Destination::Stderr);
            builder.level(severity);
            builder.build().expect("Error building terminal logger")
        }
        LogTarget::File(path) => {
            // sloggers' file builder insists on a fresh log file per run; the server has no use
            // for historical rotation, so the simplest correct thing is to truncate on startup.
            use sloggers::file::FileLoggerBuilder;

            let mut builder = FileLoggerBuilder::new(path);
            builder.level(severity);
            builder.build().expect("Error building file logger")
        }
    }
}
