//! Leveled kernel log.
//!
//! Every line goes to three places: the COM1 serial port, the framebuffer
//! console (once one exists) and a short in-memory history that can be
//! drained later. Host test builds only keep the history.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};
use core::sync::atomic::{AtomicU8, Ordering};
use lazy_static::lazy_static;
use spin::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Level {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl Level {
    pub fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    /// Parses a level name as written in the boot config.
    pub fn parse(name: &str) -> Option<Level> {
        const NAMES: [(&str, Level); 6] = [
            ("error", Level::Error),
            ("warn", Level::Warn),
            ("warning", Level::Warn),
            ("info", Level::Info),
            ("debug", Level::Debug),
            ("trace", Level::Trace),
        ];
        NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name.trim()))
            .map(|&(_, level)| level)
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

static THRESHOLD: AtomicU8 = AtomicU8::new(Level::Info as u8);

// Keep the last 64 lines around for whoever wants to replay them.
const HISTORY_LINES: usize = 64;

/// Bounded line buffer; the oldest line goes when a new one does not fit.
struct History {
    lines: VecDeque<String>,
    capacity: usize,
}

impl History {
    fn new(capacity: usize) -> Self {
        History { lines: VecDeque::with_capacity(capacity), capacity }
    }

    fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    fn drain(&mut self) -> Vec<String> {
        self.lines.drain(..).collect()
    }
}

lazy_static! {
    static ref HISTORY: Mutex<History> = Mutex::new(History::new(HISTORY_LINES));
}

pub fn set_level(level: Level) {
    THRESHOLD.store(level as u8, Ordering::Relaxed);
}

#[inline]
pub fn enabled(level: Level) -> bool {
    level as u8 <= THRESHOLD.load(Ordering::Relaxed)
}

/// Formats and emits one log line. Callers do not add a trailing newline.
pub fn log_args(level: Level, args: fmt::Arguments<'_>) {
    if !enabled(level) {
        return;
    }

    let mut line = String::new();
    let _ = write!(line, "[{}] {}", level.tag(), args);

    with_irqs_masked(|| {
        emit_hardware(level, &line);
        HISTORY.lock().push(line);
    });
}

/// Takes every buffered line, oldest first.
pub fn drain() -> Vec<String> {
    with_irqs_masked(|| HISTORY.lock().drain())
}

#[cfg(not(test))]
fn emit_hardware(level: Level, line: &str) {
    crate::serial::write_line(line);
    if level <= Level::Info {
        crate::writer::print(line);
        crate::writer::print("\n");
    }
}

#[cfg(test)]
fn emit_hardware(_level: Level, _line: &str) {}

#[cfg(not(test))]
fn with_irqs_masked<R>(f: impl FnOnce() -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(f)
}

#[cfg(test)]
fn with_irqs_masked<R>(f: impl FnOnce() -> R) -> R {
    f()
}

// ---------------------------------------------------------------------------
// Macros
// ---------------------------------------------------------------------------

#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::logger::log_args($level, ::core::format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::klog!($crate::logger::Level::Error, $($arg)*)
    };
}

#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::klog!($crate::logger::Level::Warn, $($arg)*)
    };
}

#[macro_export]
macro_rules! klog_info {
    ($($arg:tt)*) => {
        $crate::klog!($crate::logger::Level::Info, $($arg)*)
    };
}

#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::klog!($crate::logger::Level::Debug, $($arg)*)
    };
}

#[macro_export]
macro_rules! klog_trace {
    ($($arg:tt)*) => {
        $crate::klog!($crate::logger::Level::Trace, $($arg)*)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse_case_insensitively() {
        assert_eq!(Level::parse("DEBUG"), Some(Level::Debug));
        assert_eq!(Level::parse(" warning "), Some(Level::Warn));
        assert_eq!(Level::parse("trace"), Some(Level::Trace));
        assert_eq!(Level::parse("loud"), None);
    }

    #[test]
    fn levels_order_by_verbosity() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn history_keeps_newest_lines_in_order() {
        let mut history = History::new(HISTORY_LINES);
        for i in 0..HISTORY_LINES + 6 {
            history.push(alloc::format!("line {}", i));
        }

        let lines = history.drain();
        assert_eq!(lines.len(), HISTORY_LINES);
        assert_eq!(lines[0], "line 6");
        assert_eq!(lines[HISTORY_LINES - 1], alloc::format!("line {}", HISTORY_LINES + 5));
        assert!(history.drain().is_empty());
    }
}
