//! JSON graph definition files.
//!
//! ```json
//! {
//!   "a": ["add", 1, 2],
//!   "b": ["mul", {"ref": "a"}, 10],
//!   "c": ["sub", {"ref": "b"}, {"ref": "a"}]
//! }
//! ```
//!
//! Each entry is `[callable, arg...]`. An argument of the form
//! `{"ref": "key"}` references another task; anything else is a literal.
//! A key defined twice is a [`GraphError::DuplicateKey`].

use std::fmt;
use std::path::Path;

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use thiserror::Error;

use crate::error::GraphError;
use crate::graph::Graph;
use crate::task::{Arg, Key, Task};
use crate::value::Value;

#[derive(Error, Debug)]
pub enum DefinitionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("task '{key}': {reason}")]
    InvalidTask { key: String, reason: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Top-level entries in document order. Unlike a JSON map, repeated keys
/// are all kept.
struct Entries(Vec<(String, serde_json::Value)>);

impl<'de> Deserialize<'de> for Entries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = Entries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping keys to tasks")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Entries, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some(entry) = map.next_entry::<String, serde_json::Value>()? {
                    entries.push(entry);
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// Parse a definition document and build the graph.
pub fn parse(text: &str) -> Result<Graph, DefinitionError> {
    let Entries(entries) = serde_json::from_str(text)?;

    let mut tasks = Vec::with_capacity(entries.len());
    for (key, entry) in &entries {
        tasks.push((Key::from(key.as_str()), parse_task(key, entry)?));
    }
    Ok(Graph::build(tasks)?)
}

pub fn load(path: impl AsRef<Path>) -> Result<Graph, DefinitionError> {
    let text = std::fs::read_to_string(path.as_ref())?;
    parse(&text)
}

fn parse_task(key: &str, entry: &serde_json::Value) -> Result<Task, DefinitionError> {
    let invalid = |reason: &str| DefinitionError::InvalidTask { key: key.to_string(), reason: reason.to_string() };

    let items = entry.as_array().ok_or_else(|| invalid("expected [callable, args...]"))?;
    let (callable, args) = items.split_first().ok_or_else(|| invalid("empty task"))?;
    let callable = callable.as_str().ok_or_else(|| invalid("callable must be a string"))?;

    let args = args.iter().map(parse_arg).collect();
    Ok(Task::new(callable, args))
}

fn parse_arg(arg: &serde_json::Value) -> Arg {
    if let serde_json::Value::Object(obj) = arg {
        if obj.len() == 1 {
            if let Some(serde_json::Value::String(target)) = obj.get("ref") {
                return Arg::Ref(Key::from(target.as_str()));
            }
        }
    }
    Arg::Lit(Value::from_json(arg))
}

/// Render a graph back into definition JSON.
pub fn to_json(graph: &Graph) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    for (key, task) in graph.iter() {
        let mut items = vec![serde_json::Value::String(task.callable.clone())];
        for arg in &task.args {
            items.push(match arg {
                Arg::Lit(v) => v.to_json(),
                Arg::Ref(k) => serde_json::json!({ "ref": k.as_str() }),
            });
        }
        out.insert(key.to_string(), serde_json::Value::Array(items));
    }
    serde_json::Value::Object(out)
}
