use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Name of a task within a graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(String);

impl Key {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A task argument: either a literal or a reference to another task's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Arg {
    Lit(Value),
    Ref(Key),
}

impl Arg {
    pub fn lit(v: impl Into<Value>) -> Self {
        Arg::Lit(v.into())
    }

    pub fn reference(k: impl Into<Key>) -> Self {
        Arg::Ref(k.into())
    }
}

/// A unit of work: a callable name and its ordered arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub callable: String,
    pub args: Vec<Arg>,
}

impl Task {
    pub fn new(callable: impl Into<String>, args: Vec<Arg>) -> Self {
        Self { callable: callable.into(), args }
    }

    /// Distinct referenced keys, in argument order.
    pub fn dependencies(&self) -> Vec<Key> {
        let mut deps: Vec<Key> = Vec::new();
        for arg in &self.args {
            if let Arg::Ref(k) = arg {
                if !deps.contains(k) {
                    deps.push(k.clone());
                }
            }
        }
        deps
    }

    /// Replace every reference with its value, using `lookup`.
    ///
    /// Returns the first key `lookup` could not resolve as the error.
    pub fn resolve_args<'a, F>(&self, mut lookup: F) -> Result<Vec<Value>, Key>
    where
        F: FnMut(&Key) -> Option<&'a Value>,
    {
        self.args
            .iter()
            .map(|arg| match arg {
                Arg::Lit(v) => Ok(v.clone()),
                Arg::Ref(k) => lookup(k).cloned().ok_or_else(|| k.clone()),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn dependencies_are_distinct_and_ordered() {
        let task = Task::new(
            "sum",
            vec![
                Arg::reference("b"),
                Arg::lit(1),
                Arg::reference("a"),
                Arg::reference("b"),
            ],
        );
        assert_eq!(task.dependencies(), vec![Key::from("b"), Key::from("a")]);
    }

    #[test]
    fn resolve_args_substitutes_references() {
        let task = Task::new("add", vec![Arg::reference("x"), Arg::lit(2)]);
        let mut table = HashMap::new();
        table.insert(Key::from("x"), Value::Int(5));
        let args = task.resolve_args(|k| table.get(k)).unwrap();
        assert_eq!(args, vec![Value::Int(5), Value::Int(2)]);

        let missing = Task::new("add", vec![Arg::reference("y")]);
        assert_eq!(missing.resolve_args(|k| table.get(k)).unwrap_err(), Key::from("y"));
    }
}
