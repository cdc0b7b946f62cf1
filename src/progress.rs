//! Progress reporting for upload sessions

use log::info;

/// Line-oriented progress sink threaded through every engine
///
/// Engines report human-readable progress here and nowhere else; protocol
/// bytes never pass through this interface.
pub trait LogSink {
    /// Write a single progress line
    fn write_line(&mut self, line: &str);
}

/// Discards every line
#[derive(Debug, Default)]
pub struct NullSink;

impl LogSink for NullSink {
    fn write_line(&mut self, _line: &str) {}
}

/// Forwards every line to the `log` crate at info level
#[derive(Debug, Default)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn write_line(&mut self, line: &str) {
        info!("{line}");
    }
}

/// Collects lines in memory, mostly useful in tests
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Vec<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

impl LogSink for MemorySink {
    fn write_line(&mut self, line: &str) {
        self.lines.push(line.to_string());
    }
}
