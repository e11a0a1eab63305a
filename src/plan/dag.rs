//! Dependency graph over task ids.
//!
//! Tasks reference dependencies by id, never by pointer; the graph is an
//! arena (task ids + adjacency by index) so schedulers can read it
//! concurrently without shared mutable pointer graphs. Construction validates
//! unknown dependencies, duplicates and cycles (iterative Kahn's algorithm).

use std::collections::{HashMap, HashSet};

use crate::errors::PlanError;

/// Index into the task arena.
pub type TaskIndex = usize;

/// A validated DAG of task ids.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    ids: Vec<String>,
    index: HashMap<String, TaskIndex>,
    /// index -> tasks that depend on it
    forward: Vec<Vec<TaskIndex>>,
    /// index -> tasks it depends on
    reverse: Vec<Vec<TaskIndex>>,
}

impl TaskGraph {
    /// Build and validate a graph from (id, dependency ids) pairs.
    pub fn build(tasks: &[(String, Vec<String>)]) -> Result<Self, PlanError> {
        let mut index = HashMap::new();
        for (i, (id, _)) in tasks.iter().enumerate() {
            if index.insert(id.clone(), i).is_some() {
                return Err(PlanError::DuplicateTask(id.clone()));
            }
        }

        let mut forward: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];
        let mut reverse: Vec<Vec<TaskIndex>> = vec![Vec::new(); tasks.len()];

        for (to, (id, deps)) in tasks.iter().enumerate() {
            for dep in deps {
                let from = *index.get(dep).ok_or_else(|| PlanError::UnknownDependency {
                    task: id.clone(),
                    dependency: dep.clone(),
                })?;
                forward[from].push(to);
                reverse[to].push(from);
            }
        }

        let graph = Self {
            ids: tasks.iter().map(|(id, _)| id.clone()).collect(),
            index,
            forward,
            reverse,
        };
        graph.validate_acyclic()?;
        Ok(graph)
    }

    /// Kahn's algorithm; leftover in-degree marks the cycle members.
    fn validate_acyclic(&self) -> Result<(), PlanError> {
        let mut in_degree: Vec<usize> = self.reverse.iter().map(|deps| deps.len()).collect();
        let mut queue: Vec<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &self.forward[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.ids.len() {
            let involved: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.ids[i].clone())
                .collect();
            return Err(PlanError::CyclicDependency { involved });
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn index_of(&self, id: &str) -> Option<TaskIndex> {
        self.index.get(id).copied()
    }

    pub fn id_of(&self, index: TaskIndex) -> Option<&str> {
        self.ids.get(index).map(|s| s.as_str())
    }

    /// Tasks that depend on the given task.
    pub fn dependents(&self, index: TaskIndex) -> &[TaskIndex] {
        self.forward.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks the given task depends on.
    pub fn dependencies(&self, index: TaskIndex) -> &[TaskIndex] {
        self.reverse.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Tasks with no dependencies.
    pub fn roots(&self) -> Vec<TaskIndex> {
        self.reverse
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn dependencies_satisfied(&self, index: TaskIndex, done: &HashSet<TaskIndex>) -> bool {
        self.dependencies(index).iter().all(|dep| done.contains(dep))
    }

    /// Parallel batches: batch 0 = roots; batch k = tasks whose dependencies
    /// all sit in batches < k. A scheduling hint, not a correctness
    /// constraint.
    pub fn batches(&self) -> Vec<Vec<String>> {
        let mut batches = Vec::new();
        let mut done: HashSet<TaskIndex> = HashSet::new();

        loop {
            let ready: Vec<TaskIndex> = (0..self.ids.len())
                .filter(|i| !done.contains(i) && self.dependencies_satisfied(*i, &done))
                .collect();
            if ready.is_empty() {
                break;
            }
            for &i in &ready {
                done.insert(i);
            }
            batches.push(ready.into_iter().map(|i| self.ids[i].clone()).collect());
        }
        batches
    }

    /// The batch index of every task, keyed by id.
    pub fn batch_indices(&self) -> HashMap<String, u32> {
        let mut indices = HashMap::new();
        for (batch, ids) in self.batches().into_iter().enumerate() {
            for id in ids {
                indices.insert(id, batch as u32);
            }
        }
        indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(pairs: &[(&str, &[&str])]) -> Vec<(String, Vec<String>)> {
        pairs
            .iter()
            .map(|(id, deps)| {
                (
                    id.to_string(),
                    deps.iter().map(|d| d.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn builds_simple_diamond() {
        let graph = TaskGraph::build(&edges(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]))
        .unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.roots(), vec![0]);
        assert_eq!(graph.dependencies(3), &[1, 2]);
        let dependents_of_a = graph.dependents(0);
        assert!(dependents_of_a.contains(&1));
        assert!(dependents_of_a.contains(&2));
    }

    #[test]
    fn batches_for_diamond() {
        let graph = TaskGraph::build(&edges(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]))
        .unwrap();

        let batches = graph.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec!["a"]);
        assert!(batches[1].contains(&"b".to_string()));
        assert!(batches[1].contains(&"c".to_string()));
        assert_eq!(batches[2], vec!["d"]);

        let indices = graph.batch_indices();
        assert_eq!(indices["a"], 0);
        assert_eq!(indices["d"], 2);
    }

    #[test]
    fn multiple_roots_land_in_batch_zero() {
        let graph =
            TaskGraph::build(&edges(&[("a", &[]), ("b", &[]), ("c", &["a", "b"])])).unwrap();
        let batches = graph.batches();
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1], vec!["c"]);
    }

    #[test]
    fn cycle_is_rejected_with_members() {
        let err = TaskGraph::build(&edges(&[
            ("a", &["c"]),
            ("b", &["a"]),
            ("c", &["b"]),
        ]))
        .unwrap_err();

        match err {
            PlanError::CyclicDependency { involved } => {
                assert_eq!(involved.len(), 3);
                assert!(involved.contains(&"a".to_string()));
            }
            other => panic!("Expected CyclicDependency, got {:?}", other),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = TaskGraph::build(&edges(&[("a", &["a"])])).unwrap_err();
        assert!(matches!(err, PlanError::CyclicDependency { .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let err = TaskGraph::build(&edges(&[("a", &["ghost"])])).unwrap_err();
        match err {
            PlanError::UnknownDependency { task, dependency } => {
                assert_eq!(task, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("Expected UnknownDependency, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let err = TaskGraph::build(&edges(&[("a", &[]), ("a", &[])])).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateTask(_)));
    }

    #[test]
    fn empty_graph_is_fine() {
        let graph = TaskGraph::build(&[]).unwrap();
        assert!(graph.is_empty());
        assert!(graph.batches().is_empty());
    }

    #[test]
    fn dependencies_satisfied_tracks_done_set() {
        let graph =
            TaskGraph::build(&edges(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])])).unwrap();
        let mut done = HashSet::new();

        assert!(graph.dependencies_satisfied(0, &done));
        assert!(!graph.dependencies_satisfied(1, &done));

        done.insert(0);
        assert!(graph.dependencies_satisfied(1, &done));
        assert!(!graph.dependencies_satisfied(2, &done));

        done.insert(1);
        assert!(graph.dependencies_satisfied(2, &done));
    }
}
