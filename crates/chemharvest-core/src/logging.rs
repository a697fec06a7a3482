//! Logging through indicatif so log lines do not tear progress bars

use indicatif::MultiProgress;

/// ANSI color code and padded label for a log level.
fn level_style(level: log::Level, color: bool) -> (&'static str, &'static str, &'static str) {
    let label = match level {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN ",
        log::Level::Info => "INFO ",
        log::Level::Debug => "DEBUG",
        log::Level::Trace => "TRACE",
    };
    if !color {
        return ("", label, "");
    }
    let ansi = match level {
        log::Level::Error => "\x1b[31m",
        log::Level::Warn => "\x1b[33m",
        log::Level::Info => "\x1b[32m",
        log::Level::Debug => "\x1b[36m",
        log::Level::Trace => "\x1b[35m",
    };
    (ansi, label, "\x1b[0m")
}

/// One formatted log line. Debug and trace lines carry the module path,
/// which tells adapter and core messages apart.
fn format_line(record: &log::Record, color: bool) -> String {
    let (pre, label, post) = level_style(record.level(), color);
    match record.level() {
        log::Level::Debug | log::Level::Trace => format!(
            "[{pre}{label}{post}] {}: {}",
            record.target(),
            record.args()
        ),
        _ => format!("[{pre}{label}{post}] {}", record.args()),
    }
}

/// Filter used when `RUST_LOG` is unset.
fn default_filter(quiet: bool, debug: bool) -> &'static str {
    if debug {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    }
}

/// Logger that prints through indicatif MultiProgress to avoid mixing with progress bars.
pub struct IndicatifLogger {
    inner: env_logger::Logger,
    multi: MultiProgress,
}

impl IndicatifLogger {
    pub fn new(inner: env_logger::Logger, multi: MultiProgress) -> Self {
        Self { inner, multi }
    }
}

impl log::Log for IndicatifLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if self.inner.matches(record) {
            // Only installed in TTY mode, so always colored
            let line = format_line(record, true);
            self.multi.suspend(|| eprintln!("{line}"));
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Initialize logging; with `multi`, lines are routed above the progress bars.
///
/// Fails only if a logger was already installed.
pub fn init_logging(
    quiet: bool,
    debug: bool,
    multi: Option<&MultiProgress>,
) -> Result<(), log::SetLoggerError> {
    use std::io::Write;

    let env = env_logger::Env::default().default_filter_or(default_filter(quiet, debug));

    if let Some(multi) = multi {
        let logger = env_logger::Builder::from_env(env).build();
        let max_level = logger.filter();
        log::set_boxed_logger(Box::new(IndicatifLogger::new(logger, multi.clone())))?;
        log::set_max_level(max_level);
        Ok(())
    } else {
        // Non-TTY: no ANSI colors
        env_logger::Builder::from_env(env)
            .format(|buf, record| writeln!(buf, "{}", format_line(record, false)))
            .try_init()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_precedence() {
        assert_eq!(default_filter(false, false), "info");
        assert_eq!(default_filter(true, false), "warn");
        assert_eq!(default_filter(true, true), "debug");
    }

    #[test]
    fn plain_lines_have_no_escape_codes() {
        let line = format_line(
            &log::Record::builder()
                .level(log::Level::Warn)
                .args(format_args!("cooling down"))
                .build(),
            false,
        );
        assert_eq!(line, "[WARN ] cooling down");
    }

    #[test]
    fn debug_lines_carry_target() {
        let line = format_line(
            &log::Record::builder()
                .level(log::Level::Debug)
                .target("chemharvest_core::retry")
                .args(format_args!("fatal"))
                .build(),
            false,
        );
        assert_eq!(line, "[DEBUG] chemharvest_core::retry: fatal");
    }
}
