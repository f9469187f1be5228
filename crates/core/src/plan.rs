//! Per-run bookkeeping shared by the local executors.
//!
//! A [`Plan`] projects a graph onto a set of targets and tracks which tasks
//! are ready, which are still pending and which intermediate values are no
//! longer needed by anything.

use std::collections::{BTreeSet, HashMap};

use crate::error::GraphError;
use crate::graph::Graph;
use crate::task::Key;

#[derive(Debug)]
pub struct Plan {
    order: Vec<Key>,
    index: HashMap<Key, usize>,
    deps: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    /// Dependencies not yet completed.
    pending: Vec<usize>,
    /// Dependents not yet completed, plus one for a target.
    uses: Vec<usize>,
    is_target: Vec<bool>,
    targets: Vec<Key>,
    /// Ready tasks, by position in `order`.
    ready: BTreeSet<usize>,
    completed: usize,
}

impl Plan {
    pub fn new(graph: &Graph, targets: &[Key]) -> Result<Self, GraphError> {
        let order = graph.topological_order(targets)?.to_vec();
        let index: HashMap<Key, usize> =
            order.iter().enumerate().map(|(i, k)| (k.clone(), i)).collect();

        let mut deps = Vec::with_capacity(order.len());
        let mut dependents = vec![Vec::new(); order.len()];
        for (i, key) in order.iter().enumerate() {
            let ds: Vec<usize> = graph.dependencies(key.as_str()).filter_map(|d| index.get(d).copied()).collect();
            for &d in &ds {
                dependents[d].push(i);
            }
            deps.push(ds);
        }

        let mut unique_targets: Vec<Key> = Vec::new();
        let mut is_target = vec![false; order.len()];
        for t in targets {
            if let Some(&i) = index.get(t) {
                if !is_target[i] {
                    is_target[i] = true;
                    unique_targets.push(t.clone());
                }
            }
        }

        let pending: Vec<usize> = deps.iter().map(Vec::len).collect();
        let uses: Vec<usize> = (0..order.len())
            .map(|i| dependents[i].len() + usize::from(is_target[i]))
            .collect();
        let ready = (0..order.len()).filter(|&i| pending[i] == 0).collect();

        Ok(Self {
            order,
            index,
            deps,
            dependents,
            pending,
            uses,
            is_target,
            targets: unique_targets,
            ready,
            completed: 0,
        })
    }

    /// Number of tasks that will run.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Reachable keys in topological order.
    pub fn order(&self) -> &[Key] {
        &self.order
    }

    /// Targets with duplicates removed, in request order.
    pub fn targets(&self) -> &[Key] {
        &self.targets
    }

    pub fn is_target(&self, key: &Key) -> bool {
        self.index.get(key).is_some_and(|&i| self.is_target[i])
    }

    /// Take the earliest ready task, if any.
    pub fn next_ready(&mut self) -> Option<Key> {
        let i = self.ready.pop_first()?;
        Some(self.order[i].clone())
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Record a completed task.
    ///
    /// Dependents whose last dependency this was become ready. Returns the
    /// keys whose values nothing in this run needs anymore.
    pub fn complete(&mut self, key: &Key) -> Vec<Key> {
        let Some(&i) = self.index.get(key) else {
            return Vec::new();
        };
        self.completed += 1;

        for &d in &self.dependents[i] {
            self.pending[d] -= 1;
            if self.pending[d] == 0 {
                self.ready.insert(d);
            }
        }

        let mut releasable = Vec::new();
        for &d in &self.deps[i] {
            self.uses[d] -= 1;
            if self.uses[d] == 0 {
                releasable.push(self.order[d].clone());
            }
        }
        if self.uses[i] == 0 {
            releasable.push(key.clone());
        }
        releasable
    }

    /// Every task has completed.
    pub fn is_finished(&self) -> bool {
        self.completed == self.order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Arg, Task};

    fn diamond() -> Graph {
        Graph::build(vec![
            (Key::from("src"), Task::new("identity", vec![Arg::lit(1)])),
            (Key::from("left"), Task::new("add", vec![Arg::reference("src"), Arg::lit(1)])),
            (Key::from("right"), Task::new("add", vec![Arg::reference("src"), Arg::lit(2)])),
            (Key::from("join"), Task::new("add", vec![Arg::reference("left"), Arg::reference("right")])),
        ])
        .unwrap()
    }

    #[test]
    fn ready_tasks_follow_completions() {
        let g = diamond();
        let mut plan = Plan::new(&g, &[Key::from("join")]).unwrap();
        assert_eq!(plan.len(), 4);

        assert_eq!(plan.next_ready(), Some(Key::from("src")));
        assert_eq!(plan.next_ready(), None);

        let released = plan.complete(&Key::from("src"));
        assert!(released.is_empty());
        assert_eq!(plan.next_ready(), Some(Key::from("left")));
        assert_eq!(plan.next_ready(), Some(Key::from("right")));

        // src is dropped only once both consumers finished
        assert!(plan.complete(&Key::from("left")).is_empty());
        assert_eq!(plan.complete(&Key::from("right")), vec![Key::from("src")]);
        assert_eq!(plan.next_ready(), Some(Key::from("join")));

        let released = plan.complete(&Key::from("join"));
        assert_eq!(released, vec![Key::from("left"), Key::from("right")]);
        assert!(plan.is_finished());
    }

    #[test]
    fn targets_are_never_released() {
        let g = diamond();
        let mut plan = Plan::new(&g, &[Key::from("join"), Key::from("src"), Key::from("join")]).unwrap();
        assert_eq!(plan.targets(), &[Key::from("join"), Key::from("src")]);
        let mut released = Vec::new();
        while let Some(k) = plan.next_ready() {
            released.extend(plan.complete(&k));
        }
        assert!(plan.is_finished());
        assert!(!released.contains(&Key::from("src")));
        assert!(!released.contains(&Key::from("join")));
        assert!(plan.is_target(&Key::from("src")));
    }

    #[test]
    fn unreachable_tasks_are_not_planned() {
        let g = diamond();
        let plan = Plan::new(&g, &[Key::from("left")]).unwrap();
        assert_eq!(plan.order(), &[Key::from("src"), Key::from("left")]);
    }
}
