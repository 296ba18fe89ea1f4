//! Deferred task descriptions.
//!
//! A [`Schema`] pairs a task factory with a tree of parameters. Leaves are
//! either concrete values or search distributions; binding a trial's
//! assignment replaces distributions with values, and [`Schema::build`]
//! hands the resolved tree to the factory.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sw_search::{Distribution, SearchSpace};
use sw_types::{Assignment, ParamPath, SchemaError, TaskError};

use crate::task::Task;

/// One node of a schema's parameter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamNode {
    Value(serde_json::Value),
    Search(Distribution),
    Group(BTreeMap<String, ParamNode>),
}

/// Builds a task from resolved parameters.
pub trait TaskFactory: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self, params: serde_json::Value) -> Result<Box<dyn Task>, TaskError>;
}

struct FnFactory<F> {
    name: String,
    build: F,
}

impl<F> TaskFactory for FnFactory<F>
where
    F: Fn(serde_json::Value) -> Result<Box<dyn Task>, TaskError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn build(&self, params: serde_json::Value) -> Result<Box<dyn Task>, TaskError> {
        (self.build)(params)
    }
}

#[derive(Clone)]
pub struct Schema {
    factory: Arc<dyn TaskFactory>,
    params: BTreeMap<String, ParamNode>,
}

impl Schema {
    pub fn new(factory: Arc<dyn TaskFactory>) -> Self {
        Self {
            factory,
            params: BTreeMap::new(),
        }
    }

    /// Schema around a closure factory.
    pub fn from_fn<F>(name: impl Into<String>, build: F) -> Self
    where
        F: Fn(serde_json::Value) -> Result<Box<dyn Task>, TaskError> + Send + Sync + 'static,
    {
        Self::new(Arc::new(FnFactory {
            name: name.into(),
            build,
        }))
    }

    pub fn task_name(&self) -> &str {
        self.factory.name()
    }

    pub fn params(&self) -> &BTreeMap<String, ParamNode> {
        &self.params
    }

    pub fn with_value(
        self,
        path: impl Into<ParamPath>,
        value: impl Into<serde_json::Value>,
    ) -> Result<Self, SchemaError> {
        self.with_node(path, ParamNode::Value(value.into()))
    }

    pub fn with_search(
        self,
        path: impl Into<ParamPath>,
        distribution: Distribution,
    ) -> Result<Self, SchemaError> {
        self.with_node(path, ParamNode::Search(distribution))
    }

    /// Place `node` at `path`, creating intermediate groups as needed.
    pub fn with_node(mut self, path: impl Into<ParamPath>, node: ParamNode) -> Result<Self, SchemaError> {
        let path = path.into();
        let (parents, leaf) = path.split_last().ok_or(SchemaError::EmptyPath)?;
        let mut level = &mut self.params;
        for segment in parents {
            let entry = level
                .entry(segment.clone())
                .or_insert_with(|| ParamNode::Group(BTreeMap::new()));
            level = match entry {
                ParamNode::Group(children) => children,
                _ => return Err(SchemaError::NotAGroup { path: path.clone() }),
            };
        }
        level.insert(leaf.to_string(), node);
        Ok(self)
    }

    /// Every distribution leaf, keyed by its path in the tree.
    pub fn extract_search_space(&self) -> SearchSpace {
        let mut space = SearchSpace::new();
        collect_search(&self.params, &ParamPath::new(Vec::<String>::new()), &mut space);
        space
    }

    /// Replace the leaves named by `assignment` with concrete values.
    pub fn set_from_search_space(&mut self, assignment: &Assignment) -> Result<(), SchemaError> {
        for (path, value) in assignment {
            let (parents, leaf) = path.split_last().ok_or(SchemaError::EmptyPath)?;
            let mut level = &mut self.params;
            for segment in parents {
                level = match level.get_mut(segment) {
                    Some(ParamNode::Group(children)) => children,
                    Some(_) => return Err(SchemaError::NotAGroup { path: path.clone() }),
                    None => return Err(SchemaError::UnknownPath { path: path.clone() }),
                };
            }
            match level.get_mut(leaf) {
                Some(node @ (ParamNode::Search(_) | ParamNode::Value(_))) => {
                    *node = ParamNode::Value(value.to_json());
                }
                Some(ParamNode::Group(_)) => {
                    return Err(SchemaError::UnknownPath { path: path.clone() })
                }
                None => return Err(SchemaError::UnknownPath { path: path.clone() }),
            }
        }
        Ok(())
    }

    /// A copy of this schema with `assignment` bound.
    pub fn bind(&self, assignment: &Assignment) -> Result<Schema, SchemaError> {
        let mut bound = self.clone();
        bound.set_from_search_space(assignment)?;
        Ok(bound)
    }

    /// The parameter tree as JSON. Fails if any distribution is still unbound.
    pub fn resolved_params(&self) -> Result<serde_json::Value, SchemaError> {
        resolve_group(&self.params, &ParamPath::new(Vec::<String>::new()))
    }

    pub fn build(&self) -> Result<Box<dyn Task>, TaskError> {
        let params = self
            .resolved_params()
            .map_err(|e| TaskError::build(e.to_string()))?;
        self.factory.build(params)
    }
}

fn collect_search(group: &BTreeMap<String, ParamNode>, prefix: &ParamPath, space: &mut SearchSpace) {
    for (name, node) in group {
        let path = prefix.child(name.clone());
        match node {
            ParamNode::Search(distribution) => space.insert(path, distribution.clone()),
            ParamNode::Group(children) => collect_search(children, &path, space),
            ParamNode::Value(_) => {}
        }
    }
}

fn resolve_group(
    group: &BTreeMap<String, ParamNode>,
    prefix: &ParamPath,
) -> Result<serde_json::Value, SchemaError> {
    let mut object = serde_json::Map::new();
    for (name, node) in group {
        let path = prefix.child(name.clone());
        let value = match node {
            ParamNode::Value(value) => value.clone(),
            ParamNode::Group(children) => resolve_group(children, &path)?,
            ParamNode::Search(_) => return Err(SchemaError::UnboundParameter { path }),
        };
        object.insert(name.clone(), value);
    }
    Ok(serde_json::Value::Object(object))
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("task", &self.factory.name())
            .field("params", &self.params)
            .finish()
    }
}

impl Serialize for Schema {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Schema", 2)?;
        state.serialize_field("task", self.factory.name())?;
        state.serialize_field("params", &self.params)?;
        state.end()
    }
}
