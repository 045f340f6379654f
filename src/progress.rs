use std::io::{self, Write};
use std::time::Instant;

use log::{Level, LevelFilter, Log, Metadata, Record};

/// Stderr logger prefixing every line with the time since start.
pub struct ConsoleLogger {
    level: LevelFilter,
    t0: Instant,
}

impl ConsoleLogger {
    pub fn new(level: LevelFilter) -> Self {
        Self {
            level,
            t0: Instant::now(),
        }
    }

    /// Installs the logger globally. `quiet` wins over `verbose`.
    pub fn install(quiet: bool, verbose: bool) -> Result<(), log::SetLoggerError> {
        let level = if quiet {
            LevelFilter::Off
        } else if verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        log::set_boxed_logger(Box::new(Self::new(level)))?;
        log::set_max_level(level);
        Ok(())
    }

    fn line(&self, record: &Record<'_>) -> String {
        let ts = fmt_elapsed(self.t0.elapsed().as_secs_f64());
        match record.level() {
            Level::Info => format!("[{ts}] {}", record.args()),
            level => format!("[{ts}] {}: {}", level.as_str().to_ascii_lowercase(), record.args()),
        }
    }
}

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut stderr = io::stderr().lock();
        let _ = writeln!(stderr, "{}", self.line(record));
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

fn fmt_elapsed(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    let h = seconds / 3600;
    let m = (seconds % 3600) / 60;
    let s = seconds % 60;
    if h > 0 {
        format!("{h:02}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}
