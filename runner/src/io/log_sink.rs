//! Routing of script output into structured log lines.

use std::io::{self, Write};

use tracing::{info, warn};

/// Default prefix for lines produced by a script.
pub const DEFAULT_PREFIX: &str = "[script] ";

/// Logger handed to a script body.
#[derive(Debug, Clone)]
pub struct ScriptLogger {
    step_id: String,
    prefix: String,
}

impl ScriptLogger {
    pub fn new(step_id: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            prefix: prefix.into(),
        }
    }

    pub fn info(&self, message: &str) {
        info!(step = %self.step_id, "{}{}", self.prefix, message);
    }

    pub fn warn(&self, message: &str) {
        warn!(step = %self.step_id, "{}{}", self.prefix, message);
    }

    /// Line-buffered writer that emits one info event per line.
    pub fn writer(&self) -> LogSink {
        LogSink {
            logger: self.clone(),
            buf: Vec::new(),
        }
    }
}

/// `Write` adapter that turns each newline-terminated line into a log event.
///
/// Any trailing partial line is emitted when the sink is flushed or dropped.
#[derive(Debug)]
pub struct LogSink {
    logger: ScriptLogger,
    buf: Vec<u8>,
}

impl LogSink {
    fn emit_complete_lines(&mut self) {
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
    }

    fn emit(&self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        self.logger.info(text.trim_end_matches('\r'));
    }
}

impl Write for LogSink {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        self.emit_complete_lines();
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_complete_lines();
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.emit(&rest);
        }
        Ok(())
    }
}

impl Drop for LogSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_keeps_partial_line_until_newline() {
        let logger = ScriptLogger::new("step", DEFAULT_PREFIX);
        let mut sink = logger.writer();
        sink.write_all(b"hel").expect("write");
        assert_eq!(sink.buf, b"hel");
        sink.write_all(b"lo\nwor").expect("write");
        assert_eq!(sink.buf, b"wor");
        sink.flush().expect("flush");
        assert!(sink.buf.is_empty());
    }

    #[test]
    fn sink_handles_multiple_lines_per_write() {
        let logger = ScriptLogger::new("step", DEFAULT_PREFIX);
        let mut sink = logger.writer();
        sink.write_all(b"a\r\nb\nc\n").expect("write");
        assert!(sink.buf.is_empty());
    }
}
