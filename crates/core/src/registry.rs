use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::builtins;
use crate::error::{CallError, TaskExecutionError};
use crate::task::{Key, Task};
use crate::value::Value;

/// A callable shared across threads.
pub type Callable = Arc<dyn Fn(&[Value]) -> Result<Value, CallError> + Send + Sync>;

/// Name → callable lookup table.
///
/// Tasks only carry callable names, so a graph can be shipped to another
/// process or host; the receiving side resolves the names against its own
/// registry.
#[derive(Clone, Default)]
pub struct Registry {
    callables: HashMap<String, Callable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the arithmetic, list and control builtins.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtins::register_all(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.callables.insert(name.into(), Arc::new(f));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, CallError> + Send + Sync + 'static,
    {
        self.register(name, f);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Callable> {
        self.callables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.callables.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.callables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, CallError> {
        let f = self
            .callables
            .get(name)
            .ok_or_else(|| CallError::UnknownCallable(name.to_string()))?;
        f(args)
    }

    /// Run one task with already resolved arguments.
    pub fn run_task(&self, key: &Key, task: &Task, args: &[Value]) -> Result<Value, TaskExecutionError> {
        self.call(&task.callable, args)
            .map_err(|e| TaskExecutionError::new(key.clone(), e.to_string()))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("callables", &self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_callables_can_be_registered() {
        let registry = Registry::new().with("double", |args: &[Value]| match args {
            [Value::Int(i)] => Ok(Value::Int(i * 2)),
            _ => Err(CallError::Failed("expected one int".into())),
        });
        assert_eq!(registry.call("double", &[Value::Int(21)]).unwrap(), Value::Int(42));
        assert!(registry.contains("double"));
        assert!(!registry.contains("add"));
    }

    #[test]
    fn unknown_callable_is_an_error() {
        let registry = Registry::new();
        let err = registry.call("nope", &[]).unwrap_err();
        assert_eq!(err, CallError::UnknownCallable("nope".into()));
    }

    #[test]
    fn run_task_attaches_the_key() {
        let registry = Registry::builtin();
        let task = Task::new("fail", vec![]);
        let err = registry.run_task(&Key::from("bad"), &task, &[]).unwrap_err();
        assert_eq!(err.key, Key::from("bad"));
        assert!(err.message.contains("task failed"));
    }
}
