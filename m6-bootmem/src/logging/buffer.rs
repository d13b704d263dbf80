//! Boot Log Ring Buffer
//!
//! # Design
//!
//! - Lock-free MPMC queue using thingbuf
//! - 256 fixed-size slots, so logging never allocates and is safe before
//!   the heap and timers exist
//! - Entries carry a sequence number instead of a timestamp
//! - Overflow drops new messages

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use thingbuf::StaticThingBuf;

/// Maximum size of a single entry's content (target + message)
pub const LOG_ENTRY_CONTENT_SIZE: usize = 240;

/// Number of entry slots in the buffer
pub const LOG_BUFFER_SLOTS: usize = 256;

/// A single log entry with fixed-size storage.
#[derive(Clone)]
pub struct LogEntry {
    /// Position in the boot log, starting at 0
    pub seq: u64,
    /// 0=Error, 1=Warn, 2=Info, 3=Debug, 4=Trace
    pub level: u8,
    pub target_len: u8,
    pub message_len: u16,
    /// Layout: [target bytes][message bytes]
    pub content: [u8; LOG_ENTRY_CONTENT_SIZE],
}

impl Default for LogEntry {
    fn default() -> Self {
        Self {
            seq: 0,
            level: 0,
            target_len: 0,
            message_len: 0,
            content: [0u8; LOG_ENTRY_CONTENT_SIZE],
        }
    }
}

impl LogEntry {
    /// Build an entry, truncating target and message to fit.
    pub fn new(seq: u64, level: log::Level, target: &str, message: &str) -> Self {
        let mut entry = Self {
            seq,
            level: level as u8 - 1,
            ..Self::default()
        };

        let target_len = floor_char_boundary(target, target.len().min(u8::MAX as usize));
        entry.content[..target_len].copy_from_slice(&target.as_bytes()[..target_len]);
        entry.target_len = target_len as u8;

        let room = LOG_ENTRY_CONTENT_SIZE - target_len;
        let message_len = floor_char_boundary(message, message.len().min(room));
        entry.content[target_len..target_len + message_len]
            .copy_from_slice(&message.as_bytes()[..message_len]);
        entry.message_len = message_len as u16;

        entry
    }

    pub fn target(&self) -> &str {
        let len = self.target_len as usize;
        core::str::from_utf8(&self.content[..len]).unwrap_or("<invalid>")
    }

    pub fn message(&self) -> &str {
        let start = self.target_len as usize;
        let end = start + self.message_len as usize;
        core::str::from_utf8(&self.content[start..end]).unwrap_or("<invalid>")
    }

    pub fn level(&self) -> log::Level {
        match self.level {
            0 => log::Level::Error,
            1 => log::Level::Warn,
            2 => log::Level::Info,
            3 => log::Level::Debug,
            _ => log::Level::Trace,
        }
    }
}

/// Largest index `<= idx` that starts a UTF-8 sequence.
pub(crate) fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

static LOG_BUFFER: StaticThingBuf<LogEntry, LOG_BUFFER_SLOTS> = StaticThingBuf::new();

static SEQ: AtomicU64 = AtomicU64::new(0);
static EARLY_CONSOLE_ENABLED: AtomicBool = AtomicBool::new(true);
static BUFFER_ENABLED: AtomicBool = AtomicBool::new(false);

pub fn enable() {
    BUFFER_ENABLED.store(true, Ordering::Release);
}

pub fn disable_early_console() {
    EARLY_CONSOLE_ENABLED.store(false, Ordering::Release);
}

pub fn early_console_enabled() -> bool {
    EARLY_CONSOLE_ENABLED.load(Ordering::Acquire)
}

/// Take the next sequence number.
pub fn next_seq() -> u64 {
    SEQ.fetch_add(1, Ordering::Relaxed)
}

/// Queue an entry. Returns false if the buffer is disabled or full.
pub fn push(entry: LogEntry) -> bool {
    if !BUFFER_ENABLED.load(Ordering::Acquire) {
        return false;
    }
    LOG_BUFFER.push(entry).is_ok()
}

/// Take the oldest entry.
pub fn pop() -> Option<LogEntry> {
    if !BUFFER_ENABLED.load(Ordering::Acquire) {
        return None;
    }
    LOG_BUFFER.pop()
}

/// Number of entries waiting to be drained.
pub fn available() -> usize {
    if !BUFFER_ENABLED.load(Ordering::Acquire) {
        return 0;
    }
    LOG_BUFFER.len()
}

/// Drain entries into `out` as `"[seq] LEVEL target: message\n"` lines.
///
/// # Returns
///
/// The number of bytes written. Draining stops at the first entry that
/// does not fit; that entry is lost.
pub fn drain(out: &mut [u8]) -> usize {
    use core::fmt::Write;

    let mut written = 0;
    while let Some(entry) = pop() {
        let mut line = LineBuffer::<{ LOG_ENTRY_CONTENT_SIZE + 32 }>::new();
        let _ = writeln!(
            line,
            "[{:>6}] {:<5} {}: {}",
            entry.seq,
            entry.level(),
            entry.target(),
            entry.message()
        );
        let bytes = line.as_bytes();
        if written + bytes.len() > out.len() {
            // TODO: peek-then-pop once thingbuf exposes a peek
            break;
        }
        out[written..written + bytes.len()].copy_from_slice(bytes);
        written += bytes.len();
    }
    written
}

/// Fixed-capacity formatting buffer that truncates silently.
pub(crate) struct LineBuffer<const N: usize> {
    data: [u8; N],
    len: usize,
}

impl<const N: usize> LineBuffer<N> {
    pub(crate) const fn new() -> Self {
        Self {
            data: [0u8; N],
            len: 0,
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub(crate) fn as_str(&self) -> &str {
        core::str::from_utf8(self.as_bytes()).unwrap_or("<invalid>")
    }
}

impl<const N: usize> core::fmt::Write for LineBuffer<N> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let take = floor_char_boundary(s, s.len().min(N - self.len));
        self.data[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::fmt::Write;

    #[test]
    fn test_entry_truncates_message() {
        let long = "x".repeat(400);
        let entry = LogEntry::new(7, log::Level::Warn, "m6_bootmem::numa", &long);
        assert_eq!(entry.target(), "m6_bootmem::numa");
        assert_eq!(entry.message().len(), LOG_ENTRY_CONTENT_SIZE - entry.target().len());
        assert_eq!(entry.level(), log::Level::Warn);
        assert_eq!(entry.seq, 7);
    }

    #[test]
    fn test_entry_keeps_utf8_boundaries() {
        let msg = "é".repeat(200);
        let entry = LogEntry::new(0, log::Level::Info, "", &msg);
        assert!(entry.message().chars().all(|c| c == 'é'));
        assert_eq!(entry.message().len() % 2, 0);
    }

    #[test]
    fn test_line_buffer_truncates() {
        let mut buf = LineBuffer::<8>::new();
        let _ = write!(buf, "{}", "abcdefghijkl");
        assert_eq!(buf.as_str(), "abcdefgh");
    }
}
