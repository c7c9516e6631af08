// Task Graph (DAG) Builder
// Validates task dependencies and derives the batch execution order

use crate::config::models::TaskDef;

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Error type for graph operations
#[derive(Debug, Clone)]
pub struct GraphError {
    pub message: String,
    pub kind: GraphErrorKind,
    /// Task ids forming the cycle, first id repeated at the end
    pub cycle: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Two tasks share an identifier
    DuplicateTask,
    /// Reference to unknown task
    UnknownDependency,
    /// Circular dependency detected
    CyclicDependency,
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph error: {}", self.message)
    }
}

impl std::error::Error for GraphError {}

impl GraphError {
    pub fn duplicate(id: &str) -> Self {
        Self {
            message: format!("task '{}' is defined more than once", id),
            kind: GraphErrorKind::DuplicateTask,
            cycle: Vec::new(),
        }
    }

    pub fn unknown_dependency(task: &str, dep: &str) -> Self {
        Self {
            message: format!("task '{}' depends on unknown task '{}'", task, dep),
            kind: GraphErrorKind::UnknownDependency,
            cycle: Vec::new(),
        }
    }

    pub fn cyclic(cycle: Vec<String>) -> Self {
        Self {
            message: format!("circular dependency detected: {}", cycle.join(" -> ")),
            kind: GraphErrorKind::CyclicDependency,
            cycle,
        }
    }
}

/// Validated directed acyclic graph of tasks
#[derive(Debug, Clone)]
pub struct TaskGraph {
    /// Tasks in definition order
    tasks: Vec<TaskDef>,
    /// Quick lookup of task index by id
    indices: HashMap<String, usize>,
    /// Direct dependents of each task (indices)
    dependents: Vec<Vec<usize>>,
    batches: Vec<Vec<String>>,
}

impl TaskGraph {
    /// Build a graph, rejecting duplicate ids, unknown dependencies and cycles
    pub fn build(tasks: Vec<TaskDef>) -> Result<Self, GraphError> {
        let mut indices = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if indices.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::duplicate(&task.id));
            }
        }

        let mut dependents = vec![Vec::new(); tasks.len()];
        for (i, task) in tasks.iter().enumerate() {
            for dep in &task.depends_on {
                match indices.get(dep) {
                    Some(&d) => dependents[d].push(i),
                    None => return Err(GraphError::unknown_dependency(&task.id, dep)),
                }
            }
        }

        let mut graph = Self {
            tasks,
            indices,
            dependents,
            batches: Vec::new(),
        };
        graph.detect_cycles()?;
        graph.batches = graph.compute_batches();

        Ok(graph)
    }

    /// Detect cycles using DFS with a recursion stack
    fn detect_cycles(&self) -> Result<(), GraphError> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();

        for i in 0..self.tasks.len() {
            if !visited.contains(&i) {
                if let Some(cycle) = self.dfs_cycle(i, &mut visited, &mut path) {
                    return Err(GraphError::cyclic(cycle));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: usize,
        visited: &mut HashSet<usize>,
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        path.push(node);

        for dep in &self.tasks[node].depends_on {
            let dep_idx = self.indices[dep];
            if let Some(pos) = path.iter().position(|&p| p == dep_idx) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| self.tasks[i].id.clone())
                    .collect();
                cycle.push(self.tasks[dep_idx].id.clone());
                return Some(cycle);
            }
            if !visited.contains(&dep_idx) {
                if let Some(cycle) = self.dfs_cycle(dep_idx, visited, path) {
                    return Some(cycle);
                }
            }
        }

        path.pop();
        None
    }

    /// Kahn's algorithm, then level assignment by longest dependency path
    fn compute_batches(&self) -> Vec<Vec<String>> {
        let mut in_degree: Vec<usize> = self.tasks.iter().map(|t| t.depends_on.len()).collect();
        let mut queue: VecDeque<usize> = (0..self.tasks.len())
            .filter(|&i| in_degree[i] == 0)
            .collect();

        let mut level = vec![0usize; self.tasks.len()];
        let mut depth = 0;

        while let Some(node) = queue.pop_front() {
            depth = depth.max(level[node] + 1);
            for &next in &self.dependents[node] {
                level[next] = level[next].max(level[node] + 1);
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        // Iterating indices keeps definition order inside each batch
        let mut batches = vec![Vec::new(); depth];
        for (i, task) in self.tasks.iter().enumerate() {
            batches[level[i]].push(task.id.clone());
        }
        batches
    }

    /// Task ids grouped into batches; every dependency of a task lies in an earlier batch
    pub fn topological_batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    /// Every task that transitively depends on `id`, in definition order
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        let Some(&start) = self.indices.get(id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut stack = self.dependents[start].clone();
        while let Some(node) = stack.pop() {
            if seen.insert(node) {
                stack.extend(self.dependents[node].iter().copied());
            }
        }

        let mut found: Vec<usize> = seen.into_iter().collect();
        found.sort_unstable();
        found.into_iter().map(|i| self.tasks[i].id.as_str()).collect()
    }

    /// Every task that `id` transitively depends on, in definition order
    pub fn ancestors(&self, id: &str) -> Vec<&str> {
        let Some(&start) = self.indices.get(id) else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            for dep in &self.tasks[node].depends_on {
                let d = self.indices[dep];
                if seen.insert(d) {
                    stack.push(d);
                }
            }
        }

        let mut found: Vec<usize> = seen.into_iter().collect();
        found.sort_unstable();
        found.into_iter().map(|i| self.tasks[i].id.as_str()).collect()
    }

    /// Get a task by id
    pub fn get(&self, id: &str) -> Option<&TaskDef> {
        self.indices.get(id).map(|&i| &self.tasks[i])
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks in definition order
    pub fn iter(&self) -> impl Iterator<Item = &TaskDef> {
        self.tasks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn task(id: &str, deps: &[&str]) -> TaskDef {
        TaskDef::barrier(id).depends_on(deps.iter().copied())
    }

    #[test]
    fn test_linear_batches() {
        let graph = TaskGraph::build(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
        ])
        .unwrap();

        assert_eq!(
            graph.topological_batches(),
            &[vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]
        );
    }

    #[test]
    fn test_parallel_batches_keep_definition_order() {
        let graph = TaskGraph::build(vec![
            task("stage_songs", &[]),
            task("stage_events", &[]),
            task("users", &["stage_events"]),
            task("songs", &["stage_songs"]),
            task("songplays", &["users", "songs"]),
        ])
        .unwrap();

        let batches = graph.topological_batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0], vec!["stage_songs", "stage_events"]);
        assert_eq!(batches[1], vec!["users", "songs"]);
        assert_eq!(batches[2], vec!["songplays"]);
    }

    #[test]
    fn test_longest_path_level() {
        // d depends on a directly and through b, so it lands after b
        let graph = TaskGraph::build(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("d", &["a", "b"]),
        ])
        .unwrap();

        assert_eq!(graph.topological_batches()[2], vec!["d"]);
    }

    #[test]
    fn test_cycle_detection_reports_path() {
        let err = TaskGraph::build(vec![
            task("start", &[]),
            task("a", &["start", "c"]),
            task("b", &["a"]),
            task("c", &["b"]),
        ])
        .unwrap_err();

        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert_eq!(err.cycle, vec!["a", "c", "b", "a"]);
        assert!(err.to_string().contains("a -> c -> b -> a"));
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let err = TaskGraph::build(vec![task("a", &["a"])]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::CyclicDependency);
        assert_eq!(err.cycle, vec!["a", "a"]);
    }

    #[test]
    fn test_unknown_dependency() {
        let err = TaskGraph::build(vec![task("a", &["missing"])]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::UnknownDependency);
        assert!(err.message.contains("missing"));
    }

    #[test]
    fn test_duplicate_task() {
        let err = TaskGraph::build(vec![task("a", &[]), task("a", &[])]).unwrap_err();
        assert_eq!(err.kind, GraphErrorKind::DuplicateTask);
    }

    #[test]
    fn test_dependents_and_ancestors() {
        let graph = TaskGraph::build(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("d", &[]),
        ])
        .unwrap();

        assert_eq!(graph.dependents("a"), vec!["b", "c"]);
        assert!(graph.dependents("d").is_empty());
        assert_eq!(graph.ancestors("c"), vec!["a", "b"]);
        assert!(graph.ancestors("unknown").is_empty());
        assert_eq!(graph.len(), 4);
        assert!(graph.get("c").is_some());
    }

    #[test]
    fn test_empty_graph() {
        let graph = TaskGraph::build(Vec::new()).unwrap();
        assert!(graph.is_empty());
        assert!(graph.topological_batches().is_empty());
    }

    /// Random DAGs: each task may only depend on earlier-defined tasks
    fn arb_dag() -> impl Strategy<Value = Vec<TaskDef>> {
        (1usize..24).prop_flat_map(|n| {
            proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n).prop_map(
                move |matrix| {
                    (0..n)
                        .map(|i| {
                            let deps: Vec<String> = (0..i)
                                .filter(|&j| matrix[i][j])
                                .map(|j| format!("t{}", j))
                                .collect();
                            TaskDef::barrier(format!("t{}", i)).depends_on(deps)
                        })
                        .collect()
                },
            )
        })
    }

    proptest! {
        #[test]
        fn prop_batches_respect_dependencies(tasks in arb_dag()) {
            let graph = TaskGraph::build(tasks.clone()).unwrap();

            let mut batch_of = HashMap::new();
            for (b, batch) in graph.topological_batches().iter().enumerate() {
                prop_assert!(!batch.is_empty());
                for id in batch {
                    prop_assert!(batch_of.insert(id.clone(), b).is_none());
                }
            }
            prop_assert_eq!(batch_of.len(), tasks.len());

            for task in &tasks {
                for dep in &task.depends_on {
                    prop_assert!(batch_of[dep] < batch_of[&task.id]);
                }
            }
        }
    }
}
