use anyhow::Result;
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only event log under the data dir plus stderr helpers. Passed by
/// reference into the pipeline; there is no global logger.
pub struct Observer {
    log_path: PathBuf,
    verbose: bool,
}

impl Observer {
    pub fn new(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        Ok(Self {
            log_path: data_dir.join("observe.log"),
            verbose: false,
        })
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    /// Structured pipeline event: one `<rfc3339> EVENT <name> <json>` line.
    pub fn record_event(&self, name: &str, payload: &serde_json::Value) -> Result<()> {
        self.append_log_line(&format!(
            "{} EVENT {name} {}",
            Utc::now().to_rfc3339(),
            serde_json::to_string(payload)?
        ))
    }

    /// Stderr trace when verbose mode is on.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[spectral] {msg}");
        }
    }

    /// Warnings always reach both the log file and stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[spectral WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn events_are_appended_to_the_log() {
        let dir = TempDir::new().expect("tempdir");
        let observer = Observer::new(dir.path()).expect("observer");
        observer
            .record_event("plan_created", &serde_json::json!({"steps": 2}))
            .expect("record");
        observer
            .record_event("step_completed", &serde_json::json!({"step": 1}))
            .expect("record");

        let log = fs::read_to_string(dir.path().join("observe.log")).expect("log");
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("EVENT plan_created"));
        assert!(log.contains("\"steps\":2"));
    }
}
