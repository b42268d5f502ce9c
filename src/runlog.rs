use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Collects the messages a run emits so they can be echoed in the result
/// JSON under the `log` key, in addition to going through `tracing`.
/// If a log path is set, the accumulated lines are flushed there on
/// `write_log`; the CLI also appends the error chain of a failed run.
#[derive(Debug, Default)]
pub struct RunLog {
    messages: Vec<String>,
    path: Option<PathBuf>,
}

impl RunLog {
    pub fn new(path: Option<&Path>) -> Self {
        Self {
            messages: Vec::new(),
            path: path.map(|p| p.to_path_buf()),
        }
    }

    pub fn info(&mut self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::info!("{msg}");
        self.messages.push(format!("INFO: {msg}"));
    }

    pub fn warn(&mut self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::warn!("{msg}");
        self.messages.push(format!("WARN: {msg}"));
    }

    pub fn error(&mut self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        tracing::error!("{msg}");
        self.messages.push(format!("ERROR: {msg}"));
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Append the full error chain of a failed run, mirroring the
    /// traceback the CLI contract requires in the log file.
    pub fn record_failure(&mut self, err: &dyn std::error::Error) {
        let mut lines = vec![format!("ERROR: {err}")];
        let mut source = err.source();
        while let Some(cause) = source {
            lines.push(format!("  caused by: {cause}"));
            source = cause.source();
        }
        for line in &lines {
            tracing::error!("{line}");
        }
        self.messages.extend(lines);
    }

    pub fn write_log(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        for line in &self.messages {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_accumulate_with_levels() {
        let mut log = RunLog::new(None);
        log.info("starting");
        log.warn("odd input");
        log.error("bad input");
        assert_eq!(
            log.messages(),
            &[
                "INFO: starting".to_string(),
                "WARN: odd input".to_string(),
                "ERROR: bad input".to_string(),
            ]
        );
    }

    #[test]
    fn test_write_log_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let mut log = RunLog::new(Some(&path));
        log.info("first");
        log.write_log().unwrap();
        let mut log2 = RunLog::new(Some(&path));
        log2.info("second");
        log2.write_log().unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "INFO: first\nINFO: second\n");
    }
}
