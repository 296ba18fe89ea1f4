//! Run environment: debug flag, output root, and cluster coordinates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::errors::{SweepError, SweepResult};

pub const ENV_DEBUG: &str = "SWEEP_DEBUG";
pub const ENV_OUTPUT_PATH: &str = "SWEEP_OUTPUT_PATH";
pub const ENV_HEAD_NODE_IP: &str = "SWEEP_HEAD_NODE_IP";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    /// Run everything in-process and one trial at a time.
    #[serde(default)]
    pub debug: bool,
    pub output_path: PathBuf,
    #[serde(default = "default_head_node_ip")]
    pub head_node_ip: String,
    /// Free-form settings handed through to tasks unchanged.
    #[serde(default)]
    pub extensions: HashMap<String, String>,
}

fn default_head_node_ip() -> String {
    "127.0.0.1".to_string()
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            debug: false,
            output_path: PathBuf::from("sweep-output"),
            head_node_ip: default_head_node_ip(),
            extensions: HashMap::new(),
        }
    }
}

impl Environment {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            ..Default::default()
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_head_node_ip(mut self, ip: impl Into<String>) -> Self {
        self.head_node_ip = ip.into();
        self
    }

    /// Read `SWEEP_DEBUG`, `SWEEP_OUTPUT_PATH` and `SWEEP_HEAD_NODE_IP`,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> SweepResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> SweepResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = Self::default();
        if let Some(raw) = lookup(ENV_DEBUG) {
            env.debug = parse_flag(&raw).ok_or_else(|| {
                SweepError::Config(format!("{ENV_DEBUG} must be a boolean, got {raw:?}"))
            })?;
        }
        if let Some(path) = lookup(ENV_OUTPUT_PATH) {
            env.output_path = PathBuf::from(path);
        }
        if let Some(ip) = lookup(ENV_HEAD_NODE_IP) {
            env.head_node_ip = ip;
        }
        Ok(env)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> SweepResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Same cluster coordinates, different output directory.
    pub fn clone_with_output_path(&self, output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            ..self.clone()
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
