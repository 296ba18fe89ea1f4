//! Hyperparameter paths and concrete parameter values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Location of a hyperparameter inside a nested parameter tree.
///
/// Stored as an ordered list of segments rather than a joined string, so a
/// parameter whose own name contains a `.` is never split by accident.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamPath(Vec<String>);

impl ParamPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Split a dotted string into segments (`"model.lr"` -> `["model", "lr"]`).
    pub fn dotted(path: &str) -> Self {
        Self::new(path.split('.'))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// A new path with `segment` appended.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Split into (parent segments, leaf name). `None` for the empty path.
    pub fn split_last(&self) -> Option<(&[String], &str)> {
        self.0
            .split_last()
            .map(|(leaf, parents)| (parents, leaf.as_str()))
    }
}

impl fmt::Display for ParamPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("."))
    }
}

/// A single-segment path. Use [`ParamPath::dotted`] to split on dots.
impl From<&str> for ParamPath {
    fn from(name: &str) -> Self {
        Self(vec![name.to_string()])
    }
}

impl From<String> for ParamPath {
    fn from(name: String) -> Self {
        Self(vec![name])
    }
}

impl From<Vec<String>> for ParamPath {
    fn from(segments: Vec<String>) -> Self {
        Self(segments)
    }
}

impl<const N: usize> From<[&str; N]> for ParamPath {
    fn from(segments: [&str; N]) -> Self {
        Self::new(segments)
    }
}

/// A concrete parameter value produced by a search algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Int(i64),
    Float(f64),
    Json(serde_json::Value),
}

impl ParameterValue {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Json(v) => v.clone(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Json(v) => v.as_f64(),
        }
    }
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Float(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<serde_json::Value> for ParameterValue {
    fn from(value: serde_json::Value) -> Self {
        Self::Json(value)
    }
}

/// One full hyperparameter assignment for a trial.
pub type Assignment = BTreeMap<ParamPath, ParameterValue>;

/// Serde adapter writing an [`Assignment`] as a flat object keyed by dotted
/// path, for formats that only accept string keys.
///
/// When any segment itself contains a `.`, the dotted form would be ambiguous,
/// so the whole assignment is written as a list of `{"path": [..], "value": v}`
/// entries instead. Reading accepts either form.
pub mod dotted_keys {
    use super::{Assignment, ParamPath, ParameterValue};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    #[derive(Serialize, Deserialize)]
    struct Entry<P, V> {
        path: P,
        value: V,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Dotted(BTreeMap<String, ParameterValue>),
        Segments(Vec<Entry<ParamPath, ParameterValue>>),
    }

    fn is_ambiguous(path: &ParamPath) -> bool {
        path.segments().iter().any(|segment| segment.contains('.'))
    }

    pub fn serialize<S: Serializer>(assignment: &Assignment, serializer: S) -> Result<S::Ok, S::Error> {
        if assignment.keys().any(is_ambiguous) {
            serializer.collect_seq(assignment.iter().map(|(path, value)| Entry { path, value }))
        } else {
            serializer.collect_map(assignment.iter().map(|(path, value)| (path.to_string(), value)))
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Assignment, D::Error> {
        Ok(match Encoded::deserialize(deserializer)? {
            Encoded::Dotted(flat) => flat
                .into_iter()
                .map(|(key, value)| (ParamPath::dotted(&key), value))
                .collect(),
            Encoded::Segments(entries) => entries
                .into_iter()
                .map(|entry| (entry.path, entry.value))
                .collect(),
        })
    }
}
