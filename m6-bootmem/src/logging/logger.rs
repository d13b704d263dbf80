//! Boot logger implementation.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

use super::buffer::{self, LineBuffer, LogEntry, LOG_ENTRY_CONTENT_SIZE};

/// Raw output used while the early console is enabled
static EARLY_CONSOLE: spin::Once<fn(&str)> = spin::Once::new();

struct BootLogger;

impl Log for BootLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let seq = buffer::next_seq();

        let mut msg = LineBuffer::<LOG_ENTRY_CONTENT_SIZE>::new();
        let _ = write!(msg, "{}", record.args());

        buffer::push(LogEntry::new(seq, record.level(), record.target(), msg.as_str()));

        if !buffer::early_console_enabled() {
            return;
        }
        let Some(puts) = EARLY_CONSOLE.get() else {
            return;
        };
        let level_str = match record.level() {
            Level::Error => "\x1b[31mERROR\x1b[0m",
            Level::Warn => "\x1b[33m WARN\x1b[0m",
            Level::Info => "\x1b[32m INFO\x1b[0m",
            Level::Debug => "\x1b[34mDEBUG\x1b[0m",
            Level::Trace => "\x1b[35mTRACE\x1b[0m",
        };
        let mut line = LineBuffer::<{ LOG_ENTRY_CONTENT_SIZE + 48 }>::new();
        let _ = writeln!(
            line,
            "[{:>6}] {} {}: {}",
            seq,
            level_str,
            record.target(),
            msg.as_str()
        );
        puts(line.as_str());
    }

    fn flush(&self) {}
}

static LOGGER: BootLogger = BootLogger;

/// Install the boot logger. Calling it again is harmless.
pub fn init() {
    buffer::enable();

    log::set_logger(&LOGGER)
        .map(|()| log::set_max_level(LevelFilter::Debug))
        .ok();
}

/// Register the raw output function for early boot (typically a polled
/// UART write). Only the first registration takes effect.
pub fn set_early_console(puts: fn(&str)) {
    EARLY_CONSOLE.call_once(|| puts);
}

/// Stop writing to the early console; records only go to the ring.
pub fn disable_early_console() {
    buffer::disable_early_console();
}
