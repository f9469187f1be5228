//! Immutable task graph.
//!
//! A [`Graph`] is validated once at construction: every key is unique, every
//! reference resolves and there are no cycles. Everything downstream
//! (plans, executors, the distributed scheduler) relies on that.

use std::collections::{BTreeSet, HashMap};

use indexmap::IndexMap;

use crate::error::GraphError;
use crate::task::{Key, Task};

#[derive(Debug, Clone)]
pub struct Graph {
    tasks: IndexMap<Key, Task>,
    /// Dependency indices per task, distinct and in argument order.
    deps: Vec<Vec<usize>>,
    /// Reverse edges, in insertion order of the dependent.
    dependents: Vec<Vec<usize>>,
}

impl Graph {
    /// Validate and build a graph.
    ///
    /// Checks run in order: duplicate keys, dangling references, cycles.
    pub fn build<I>(tasks: I) -> Result<Self, GraphError>
    where
        I: IntoIterator<Item = (Key, Task)>,
    {
        let mut map: IndexMap<Key, Task> = IndexMap::new();
        for (key, task) in tasks {
            if map.contains_key(&key) {
                return Err(GraphError::DuplicateKey(key));
            }
            map.insert(key, task);
        }

        let mut deps = Vec::with_capacity(map.len());
        for (key, task) in &map {
            let mut idx = Vec::new();
            for dep in task.dependencies() {
                match map.get_index_of(&dep) {
                    Some(i) => idx.push(i),
                    None => {
                        return Err(GraphError::MissingKey { task: Some(key.clone()), missing: dep });
                    }
                }
            }
            deps.push(idx);
        }

        let mut dependents = vec![Vec::new(); map.len()];
        for (i, ds) in deps.iter().enumerate() {
            for &d in ds {
                dependents[d].push(i);
            }
        }

        let graph = Self { tasks: map, deps, dependents };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<(), GraphError> {
        let mut pending: Vec<usize> = self.deps.iter().map(Vec::len).collect();
        let mut ready: Vec<usize> = (0..self.len()).filter(|&i| pending[i] == 0).collect();
        let mut done = 0usize;
        while let Some(i) = ready.pop() {
            done += 1;
            for &d in &self.dependents[i] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    ready.push(d);
                }
            }
        }
        if done == self.len() {
            return Ok(());
        }

        // Every leftover node has at least one leftover dependency, so walking
        // those edges must eventually revisit a node.
        let Some(start) = (0..self.len()).find(|&i| pending[i] > 0) else {
            return Ok(());
        };
        let mut path: Vec<usize> = vec![start];
        let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let next = self.deps[current]
                .iter()
                .copied()
                .find(|&d| pending[d] > 0)
                .unwrap_or(current);
            if let Some(&pos) = seen.get(&next) {
                let mut keys: Vec<Key> = path[pos..].iter().map(|&i| self.key_at(i).clone()).collect();
                keys.push(self.key_at(next).clone());
                return Err(GraphError::Cycle { keys });
            }
            seen.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }

    fn key_at(&self, index: usize) -> &Key {
        self.tasks.get_index(index).map(|(k, _)| k).unwrap_or_else(|| unreachable!("index out of range"))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<&Task> {
        self.tasks.get(key)
    }

    /// Insertion index of a key; the tie-break used by every ordering.
    pub fn position(&self, key: &str) -> Option<usize> {
        self.tasks.get_index_of(key)
    }

    /// Tasks in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Task)> {
        self.tasks.iter()
    }

    pub fn tasks(&self) -> &IndexMap<Key, Task> {
        &self.tasks
    }

    pub fn into_tasks(self) -> IndexMap<Key, Task> {
        self.tasks
    }

    pub fn dependencies(&self, key: &str) -> impl Iterator<Item = &Key> + '_ {
        self.neighbours(key, &self.deps)
    }

    pub fn dependents(&self, key: &str) -> impl Iterator<Item = &Key> + '_ {
        self.neighbours(key, &self.dependents)
    }

    fn neighbours<'a>(&'a self, key: &str, edges: &'a [Vec<usize>]) -> impl Iterator<Item = &'a Key> + 'a {
        self.position(key)
            .map(|i| edges[i].as_slice())
            .unwrap_or(&[])
            .iter()
            .map(move |&j| self.key_at(j))
    }

    fn target_indices(&self, targets: &[Key]) -> Result<Vec<usize>, GraphError> {
        targets
            .iter()
            .map(|t| {
                self.position(t.as_str())
                    .ok_or_else(|| GraphError::MissingKey { task: None, missing: t.clone() })
            })
            .collect()
    }

    /// Indices of every task the targets transitively depend on, targets included.
    fn reachable(&self, targets: &[usize]) -> BTreeSet<usize> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<usize> = targets.to_vec();
        while let Some(i) = stack.pop() {
            if seen.insert(i) {
                stack.extend(self.deps[i].iter().copied());
            }
        }
        seen
    }

    /// Lazy topological order over the tasks reachable from `targets`.
    pub fn topological_order(&self, targets: &[Key]) -> Result<TopologicalOrder<'_>, GraphError> {
        let idx = self.target_indices(targets)?;
        let reachable = self.reachable(&idx);
        Ok(TopologicalOrder { graph: self, reachable })
    }

    /// Sub-graph holding only the tasks the targets need.
    pub fn cull(&self, targets: &[Key]) -> Result<Graph, GraphError> {
        let idx = self.target_indices(targets)?;
        let reachable = self.reachable(&idx);
        let kept: Vec<(Key, Task)> = reachable
            .iter()
            .filter_map(|&i| self.tasks.get_index(i))
            .map(|(k, t)| (k.clone(), t.clone()))
            .collect();
        Graph::build(kept)
    }
}

/// Restartable topological order; see [`Graph::topological_order`].
#[derive(Debug, Clone)]
pub struct TopologicalOrder<'g> {
    graph: &'g Graph,
    reachable: BTreeSet<usize>,
}

impl<'g> TopologicalOrder<'g> {
    /// Start a fresh traversal. Ties break by insertion order.
    pub fn iter(&self) -> TopoIter<'g> {
        let mut pending = HashMap::with_capacity(self.reachable.len());
        let mut ready = BTreeSet::new();
        for &i in &self.reachable {
            let n = self.graph.deps[i].len();
            pending.insert(i, n);
            if n == 0 {
                ready.insert(i);
            }
        }
        TopoIter { graph: self.graph, pending, ready }
    }

    pub fn len(&self) -> usize {
        self.reachable.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reachable.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.graph.position(key).is_some_and(|i| self.reachable.contains(&i))
    }

    pub fn to_vec(&self) -> Vec<Key> {
        self.iter().cloned().collect()
    }
}

impl<'g> IntoIterator for &TopologicalOrder<'g> {
    type Item = &'g Key;
    type IntoIter = TopoIter<'g>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One pass of Kahn's algorithm, advanced on demand.
#[derive(Debug)]
pub struct TopoIter<'g> {
    graph: &'g Graph,
    pending: HashMap<usize, usize>,
    ready: BTreeSet<usize>,
}

impl<'g> Iterator for TopoIter<'g> {
    type Item = &'g Key;

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.ready.pop_first()?;
        for &d in &self.graph.dependents[i] {
            if let Some(n) = self.pending.get_mut(&d) {
                *n -= 1;
                if *n == 0 {
                    self.ready.insert(d);
                }
            }
        }
        Some(self.graph.key_at(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Arg;
    use std::collections::HashSet;

    fn key_set<'a>(keys: impl IntoIterator<Item = &'a Key>) -> HashSet<Key> {
        keys.into_iter().cloned().collect()
    }

    fn task(callable: &str, args: Vec<Arg>) -> Task {
        Task::new(callable, args)
    }

    fn r(k: &str) -> Arg {
        Arg::reference(k)
    }

    fn sample() -> Graph {
        Graph::build(vec![
            (Key::from("a"), task("add", vec![Arg::lit(1), Arg::lit(2)])),
            (Key::from("b"), task("mul", vec![r("a"), Arg::lit(10)])),
            (Key::from("c"), task("sub", vec![r("b"), r("a")])),
            (Key::from("unused"), task("fail", vec![])),
        ])
        .unwrap()
    }

    #[test]
    fn builds_valid_graph() {
        let g = sample();
        assert_eq!(g.len(), 4);
        assert!(g.contains("c"));
        assert_eq!(g.dependencies("c").cloned().collect::<Vec<_>>(), vec![Key::from("b"), Key::from("a")]);
        assert_eq!(g.dependents("a").cloned().collect::<Vec<_>>(), vec![Key::from("b"), Key::from("c")]);
        assert_eq!(g.dependencies("nope").count(), 0);
    }

    #[test]
    fn rejects_self_reference() {
        let err = Graph::build(vec![(Key::from("x"), task("identity", vec![r("x")]))]).unwrap_err();
        assert_eq!(err, GraphError::Cycle { keys: vec![Key::from("x"), Key::from("x")] });
    }

    #[test]
    fn rejects_longer_cycle() {
        let err = Graph::build(vec![
            (Key::from("root"), task("identity", vec![Arg::lit(1)])),
            (Key::from("p"), task("add", vec![r("q"), r("root")])),
            (Key::from("q"), task("add", vec![r("s")])),
            (Key::from("s"), task("add", vec![r("p")])),
        ])
        .unwrap_err();
        match err {
            GraphError::Cycle { keys } => {
                assert_eq!(keys.first(), keys.last());
                let members = key_set(&keys);
                assert_eq!(members, key_set(&[Key::from("p"), Key::from("q"), Key::from("s")]));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn missing_key_is_reported_before_cycles() {
        let err = Graph::build(vec![
            (Key::from("a"), task("add", vec![r("a")])),
            (Key::from("b"), task("add", vec![r("ghost")])),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::MissingKey { task: Some(Key::from("b")), missing: Key::from("ghost") }
        );
    }

    #[test]
    fn rejects_duplicate_key() {
        let err = Graph::build(vec![
            (Key::from("a"), task("identity", vec![Arg::lit(1)])),
            (Key::from("a"), task("identity", vec![Arg::lit(2)])),
        ])
        .unwrap_err();
        assert_eq!(err, GraphError::DuplicateKey(Key::from("a")));
    }

    #[test]
    fn order_respects_dependencies_and_skips_unreachable() {
        let g = sample();
        let order = g.topological_order(&[Key::from("c")]).unwrap();
        assert_eq!(order.to_vec(), vec![Key::from("a"), Key::from("b"), Key::from("c")]);
        assert!(!order.contains("unused"));
        assert_eq!(order.len(), 3);
    }

    #[test]
    fn order_is_restartable() {
        let g = sample();
        let order = g.topological_order(&[Key::from("c"), Key::from("unused")]).unwrap();
        let first: Vec<_> = order.iter().collect();
        let second: Vec<_> = order.iter().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);

        // A partially consumed traversal does not affect a new one.
        let mut partial = order.iter();
        partial.next();
        assert_eq!(order.iter().count(), 4);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let g = Graph::build(vec![
            (Key::from("z"), task("identity", vec![Arg::lit(1)])),
            (Key::from("m"), task("identity", vec![Arg::lit(2)])),
            (Key::from("a"), task("add", vec![r("m"), r("z")])),
        ])
        .unwrap();
        let order = g.topological_order(&[Key::from("a")]).unwrap();
        assert_eq!(order.to_vec(), vec![Key::from("z"), Key::from("m"), Key::from("a")]);
    }

    #[test]
    fn unknown_target_is_missing_key() {
        let g = sample();
        let err = g.topological_order(&[Key::from("nope")]).unwrap_err();
        assert_eq!(err, GraphError::MissingKey { task: None, missing: Key::from("nope") });
    }

    #[test]
    fn cull_keeps_only_needed_tasks() {
        let g = sample();
        let culled = g.cull(&[Key::from("b")]).unwrap();
        assert_eq!(culled.tasks().keys().cloned().collect::<Vec<_>>(), vec![Key::from("a"), Key::from("b")]);
    }

    #[test]
    fn empty_target_list_yields_empty_order() {
        let g = sample();
        let order = g.topological_order(&[]).unwrap();
        assert!(order.is_empty());
        assert_eq!(order.iter().count(), 0);
    }
}
