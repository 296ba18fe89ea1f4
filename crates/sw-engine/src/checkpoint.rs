//! Durable per-trial task state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use sw_types::CheckpointError;

const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Handle to a trial's checkpoint directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub path: PathBuf,
    pub host: String,
    pub user: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    saved_at: DateTime<Utc>,
    host: String,
    user: String,
    state: serde_json::Value,
}

impl Checkpoint {
    pub fn new(path: impl Into<PathBuf>, host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            host: host.into(),
            user: user.into(),
        }
    }

    pub fn file(&self) -> PathBuf {
        self.path.join(CHECKPOINT_FILE)
    }

    /// Persist `state`, replacing any previous snapshot.
    pub fn set(&self, state: &serde_json::Value) -> Result<(), CheckpointError> {
        std::fs::create_dir_all(&self.path)?;
        let envelope = Envelope {
            saved_at: Utc::now(),
            host: self.host.clone(),
            user: self.user.clone(),
            state: state.clone(),
        };
        let tmp = self.path.join(format!("{CHECKPOINT_FILE}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(&envelope)?)?;
        std::fs::rename(&tmp, self.file())?;
        Ok(())
    }

    /// Latest persisted state.
    pub fn get(&self) -> Result<serde_json::Value, CheckpointError> {
        let file = self.file();
        if !file.exists() {
            return Err(CheckpointError::Missing {
                path: file.display().to_string(),
            });
        }
        let envelope: Envelope = serde_json::from_slice(&std::fs::read(&file)?)?;
        Ok(envelope.state)
    }

    pub fn exists(&self) -> bool {
        self.file().exists()
    }
}

/// Login name of the current user, as reported by the environment.
pub fn current_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_then_get_returns_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path().join("trial_0000"), "10.0.0.1", "alice");
        assert!(!checkpoint.exists());

        checkpoint.set(&json!({"epoch": 1})).unwrap();
        checkpoint.set(&json!({"epoch": 2})).unwrap();

        assert!(checkpoint.exists());
        assert_eq!(checkpoint.get().unwrap(), json!({"epoch": 2}));
        assert!(!dir.path().join("trial_0000/checkpoint.json.tmp").exists());
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path().join("never"), "host", "user");
        assert!(matches!(checkpoint.get(), Err(CheckpointError::Missing { .. })));
    }

    #[test]
    fn envelope_records_identity() {
        let dir = tempfile::tempdir().unwrap();
        let checkpoint = Checkpoint::new(dir.path(), "head", "bob");
        checkpoint.set(&json!(null)).unwrap();
        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(checkpoint.file()).unwrap()).unwrap();
        assert_eq!(raw["host"], "head");
        assert_eq!(raw["user"], "bob");
    }
}
