//! Kernel logging sink.
//!
//! Installs a global [`log::Log`] implementation that renders records to the
//! console via the kernel print macros, so every subsystem can use the
//! standard `log` macros with a subsystem target:
//!
//! ```ignore
//! klog::init(log::LevelFilter::Info);
//! log::info!(target: "sched", "scheduler online, {} cpus", ncpu);
//! ```
//!
//! The sink is line-oriented and lock-free above the console itself; a
//! record is formatted into a single `println!` call.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct KernelLog;

static KLOG: KernelLog = KernelLog;

impl Log for KernelLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => " WARN",
            Level::Info => " INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        println!("[{} {}] {}", tag, record.target(), record.args());
    }

    fn flush(&self) {}
}

/// Install the kernel logger. Idempotent: a second call only adjusts the
/// level filter.
pub fn init(max_level: LevelFilter) {
    // A second install attempt fails harmlessly; the level still applies.
    let _ = log::set_logger(&KLOG);
    log::set_max_level(max_level);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init(LevelFilter::Info);
        init(LevelFilter::Debug);
        assert_eq!(log::max_level(), LevelFilter::Debug);
        log::info!(target: "klog", "logger self-test");
        init(LevelFilter::Info);
    }
}
