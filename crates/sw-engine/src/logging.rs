//! Trial-scoped log file.

use chrono::Utc;
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use sw_types::{StepOutcome, TrialId};

const LOG_FILE: &str = "trial.log";

/// Appends one JSON line per step to `<trial dir>/trial.log`.
///
/// The file is opened by [`TrialLogging::setup`] and closed by
/// [`TrialLogging::teardown`], which also runs on drop.
pub struct TrialLogging {
    trial: TrialId,
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl TrialLogging {
    pub fn new(trial: TrialId, dir: &Path) -> Self {
        Self {
            trial,
            path: dir.join(LOG_FILE),
            file: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn setup(&mut self) -> io::Result<()> {
        if self.file.is_some() {
            return Ok(());
        }
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.file = Some(BufWriter::new(file));
        self.write_line(json!({
            "event": "setup",
            "trial": self.trial.as_str(),
            "at": Utc::now().to_rfc3339(),
        }))
    }

    /// Append and flush one step record.
    pub fn record_step(&mut self, step: usize, outcome: &StepOutcome) -> io::Result<()> {
        self.write_line(json!({
            "event": "step",
            "step": step,
            "continue": outcome.should_continue,
            "metric": outcome.metric,
            "at": Utc::now().to_rfc3339(),
        }))?;
        self.file.as_mut().map_or(Ok(()), |f| f.flush())
    }

    pub fn teardown(&mut self) {
        if self.file.is_none() {
            return;
        }
        let closing = json!({ "event": "teardown", "at": Utc::now().to_rfc3339() });
        let result = self
            .write_line(closing)
            .and_then(|_| self.file.as_mut().map_or(Ok(()), |f| f.flush()));
        if let Err(e) = result {
            warn!(trial = %self.trial, error = %e, "failed to close trial log");
        }
        self.file = None;
    }

    fn write_line(&mut self, line: serde_json::Value) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => writeln!(file, "{line}"),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
impl TrialLogging {
    /// Swap the open log for a handle that rejects writes.
    pub(crate) fn reopen_read_only(&mut self) -> io::Result<()> {
        self.file = Some(BufWriter::new(File::open(&self.path)?));
        Ok(())
    }
}

impl Drop for TrialLogging {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_events(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["event"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn records_setup_steps_and_teardown() {
        let dir = tempfile::tempdir().unwrap();
        let trial_dir = dir.path().join("grid_0000");
        let mut logging = TrialLogging::new(TrialId::new("grid_0000"), &trial_dir);
        logging.setup().unwrap();
        logging.record_step(1, &StepOutcome::new(true, Some(0.5))).unwrap();
        let path = logging.path().to_path_buf();
        drop(logging);

        assert_eq!(read_events(&path), vec!["setup", "step", "teardown"]);
    }

    #[test]
    fn teardown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut logging = TrialLogging::new(TrialId::new("t"), dir.path());
        logging.setup().unwrap();
        logging.teardown();
        assert!(!logging.is_open());
        logging.teardown();
        drop(logging);
        assert_eq!(read_events(&dir.path().join(LOG_FILE)), vec!["setup", "teardown"]);
    }

    #[test]
    fn never_set_up_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let logging = TrialLogging::new(TrialId::new("t"), dir.path());
        let path = logging.path().to_path_buf();
        drop(logging);
        assert!(!path.exists());
    }
}
