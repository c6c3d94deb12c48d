//! Parallel DAG execution engine.
//!
//! Builds a dependency graph from task definitions, orders nodes into
//! levels, and executes each level concurrently under a global concurrency
//! cap. Levels are a strict barrier: no task at level `k+1` starts while a
//! level-`k` task is still non-terminal. Nodes whose dependencies failed
//! are marked failed without ever invoking the executor.
//!
//! Nodes are held in a flat vector and reference each other by name, so
//! the node ↔ dependents relation never forms pointer cycles.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::models::{JsonMap, TaskDefinition};
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the DAG engine.
#[derive(Debug, Clone)]
pub struct DagConfig {
    /// Global cap on concurrently running nodes. The cap is a soft barrier:
    /// a new node waits until a slot frees, running work is never preempted.
    pub max_concurrency: usize,
    /// Cadence of the `currently_running` sampler used to report the
    /// parallelism achieved over the execution.
    pub sample_interval: Duration,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            sample_interval: Duration::from_millis(100),
        }
    }
}

// ---------------------------------------------------------------------------
// Graph model
// ---------------------------------------------------------------------------

/// One node of the dependency graph.
#[derive(Debug, Clone)]
pub struct DagNode {
    /// The task this node schedules.
    pub task: TaskDefinition,
    /// Names of tasks that depend on this node (inverse of `depends_on`).
    pub dependents: Vec<String>,
    /// Longest dependency path to any root; roots are level 0. Determines
    /// the scheduling tier.
    pub level: usize,
}

impl DagNode {
    pub fn name(&self) -> &str {
        &self.task.name
    }
}

/// Terminal summary of a parallel execution.
#[derive(Debug)]
pub struct ParallelResult {
    /// Names of nodes whose executor succeeded.
    pub completed: Vec<String>,
    /// Failed node name → failure reason (executor error or
    /// "Dependency failed").
    pub failed: HashMap<String, String>,
    pub duration_ms: i64,
    /// Average of the `currently_running` samples over the execution.
    pub avg_parallelism: f64,
}

/// Runs a single node. Implemented by the orchestrator (persisting task
/// rows) and by test harnesses.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, node: &DagNode) -> Result<JsonMap, String>;

    /// Called instead of `execute` when a dependency of `node` failed.
    async fn dependency_failed(&self, _node: &DagNode) {}
}

/// Compensation hook invoked during rollback, in reverse topological order.
#[async_trait]
pub trait RollbackExecutor: Send + Sync {
    async fn rollback(&self, node: &DagNode) -> Result<(), String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    Running,
    Completed,
    Failed,
}

// ---------------------------------------------------------------------------
// Graph construction
// ---------------------------------------------------------------------------

/// Build the dependency graph for the given tasks.
///
/// # Errors
/// - [`EngineError::InvalidDefinition`] if two tasks share a name.
/// - [`EngineError::UnknownDependency`] if a `depends_on` entry names a
///   task that does not exist.
/// - [`EngineError::CircularDependency`] if the graph has a cycle.
pub fn build_dag(tasks: &[TaskDefinition]) -> Result<Vec<DagNode>, EngineError> {
    let mut by_name: HashMap<&str, &TaskDefinition> = HashMap::new();
    for task in tasks {
        if by_name.insert(task.name.as_str(), task).is_some() {
            return Err(EngineError::InvalidDefinition(format!(
                "duplicate task name '{}'",
                task.name
            )));
        }
    }

    for task in tasks {
        for dep in &task.depends_on {
            if !by_name.contains_key(dep.as_str()) {
                return Err(EngineError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    // Independent Kahn-style cycle check before the level computation.
    assert_acyclic(tasks)?;

    let mut levels: HashMap<String, usize> = HashMap::new();
    let mut visiting: HashSet<String> = HashSet::new();
    for task in tasks {
        node_level(&task.name, &by_name, &mut levels, &mut visiting)?;
    }

    // Dependent lists are built only after all nodes exist.
    let mut dependents: HashMap<&str, Vec<String>> = HashMap::new();
    for task in tasks {
        for dep in &task.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.name.clone());
        }
    }

    Ok(tasks
        .iter()
        .map(|task| DagNode {
            dependents: dependents.remove(task.name.as_str()).unwrap_or_default(),
            level: levels[&task.name],
            task: task.clone(),
        })
        .collect())
}

/// Kahn's algorithm over the `depends_on` relation; a sort that cannot
/// visit every node means the graph contains a cycle.
fn assert_acyclic(tasks: &[TaskDefinition]) -> Result<(), EngineError> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for task in tasks {
        adjacency.entry(task.name.as_str()).or_default();
        in_degree.entry(task.name.as_str()).or_insert(0);
    }

    for task in tasks {
        for dep in &task.depends_on {
            adjacency
                .entry(dep.as_str())
                .or_default()
                .push(task.name.as_str());
            *in_degree.entry(task.name.as_str()).or_insert(0) += 1;
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, &d)| d == 0)
        .map(|(&name, _)| name)
        .collect();

    let mut visited = 0usize;

    while let Some(name) = queue.pop_front() {
        visited += 1;

        if let Some(neighbours) = adjacency.get(name) {
            for &neighbour in neighbours {
                let deg = in_degree.entry(neighbour).or_insert(0);
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(neighbour);
                }
            }
        }
    }

    if visited != tasks.len() {
        // Any node still carrying an in-degree sits on a cycle.
        let on_cycle = in_degree
            .iter()
            .find(|(_, &d)| d > 0)
            .map(|(&name, _)| name.to_owned())
            .unwrap_or_default();
        return Err(EngineError::CircularDependency(on_cycle));
    }

    Ok(())
}

/// DFS with grey (visiting) / black (levels) marking. `level = 1 +
/// max(level of dependencies)`, 0 for roots; revisiting a grey node
/// signals a cycle.
fn node_level(
    name: &str,
    by_name: &HashMap<&str, &TaskDefinition>,
    levels: &mut HashMap<String, usize>,
    visiting: &mut HashSet<String>,
) -> Result<usize, EngineError> {
    if let Some(&level) = levels.get(name) {
        return Ok(level);
    }
    if !visiting.insert(name.to_owned()) {
        return Err(EngineError::CircularDependency(name.to_owned()));
    }

    let mut level = 0;
    for dep in &by_name[name].depends_on {
        level = level.max(node_level(dep, by_name, levels, visiting)? + 1);
    }

    visiting.remove(name);
    levels.insert(name.to_owned(), level);
    Ok(level)
}

// ---------------------------------------------------------------------------
// DagEngine
// ---------------------------------------------------------------------------

/// Executes a validated graph level by level.
pub struct DagEngine {
    config: DagConfig,
}

impl Default for DagEngine {
    fn default() -> Self {
        Self::new(DagConfig::default())
    }
}

impl DagEngine {
    pub fn new(config: DagConfig) -> Self {
        Self { config }
    }

    /// Execute every node of the graph with maximum parallelism under the
    /// concurrency cap.
    ///
    /// Ordering guarantees: a node starts strictly after every transitive
    /// dependency is terminal; nodes at the same level have no mutual
    /// ordering; the level barrier keeps level `k+1` idle until all of
    /// level `k` is terminal.
    pub async fn execute_parallel(
        &self,
        nodes: &[DagNode],
        executor: Arc<dyn NodeExecutor>,
    ) -> ParallelResult {
        let started = Instant::now();

        let states: Arc<Mutex<HashMap<String, NodeState>>> = Arc::new(Mutex::new(
            nodes
                .iter()
                .map(|n| (n.name().to_owned(), NodeState::Pending))
                .collect(),
        ));
        let running = Arc::new(AtomicUsize::new(0));
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency));

        // Sample the live counter for the lifetime of the execution; the
        // average is reported as the parallelism achieved.
        let samples: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let sampler = {
            let samples = samples.clone();
            let running = running.clone();
            let cadence = self.config.sample_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(cadence);
                loop {
                    ticker.tick().await;
                    samples.lock().await.push(running.load(Ordering::Relaxed));
                }
            })
        };

        let mut completed: Vec<String> = Vec::new();
        let mut failed: HashMap<String, String> = HashMap::new();

        let max_level = nodes.iter().map(|n| n.level).max().unwrap_or(0);

        for level in 0..=max_level {
            let mut join_set: JoinSet<(String, Result<(), String>)> = JoinSet::new();

            for node in nodes.iter().filter(|n| n.level == level) {
                let node = node.clone();
                let states = states.clone();
                let running = running.clone();
                let semaphore = semaphore.clone();
                let executor = executor.clone();

                join_set.spawn(async move {
                    let name = node.name().to_owned();

                    // Dependencies are all terminal here (their levels are
                    // strictly lower and the previous barrier has passed).
                    let dependency_failed = {
                        let states = states.lock().await;
                        node.task
                            .depends_on
                            .iter()
                            .any(|dep| states.get(dep) == Some(&NodeState::Failed))
                    };

                    if dependency_failed {
                        executor.dependency_failed(&node).await;
                        states.lock().await.insert(name.clone(), NodeState::Failed);
                        return (name, Err(EngineError::DependencyFailed.to_string()));
                    }

                    // Soft barrier on the concurrency cap.
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("dag semaphore closed");

                    running.fetch_add(1, Ordering::Relaxed);
                    states.lock().await.insert(name.clone(), NodeState::Running);

                    let result = executor.execute(&node).await;

                    running.fetch_sub(1, Ordering::Relaxed);
                    let state = if result.is_ok() {
                        NodeState::Completed
                    } else {
                        NodeState::Failed
                    };
                    states.lock().await.insert(name.clone(), state);

                    (name, result.map(|_| ()))
                });
            }

            // Strict level barrier: every node at this level must be
            // terminal before the next level is scheduled.
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok((name, Ok(()))) => completed.push(name),
                    Ok((name, Err(reason))) => {
                        failed.insert(name, reason);
                    }
                    Err(join_err) => {
                        error!(error = %join_err, "dag node task panicked");
                    }
                }
            }
        }

        sampler.abort();

        let samples = samples.lock().await;
        let avg_parallelism = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<usize>() as f64 / samples.len() as f64
        };

        info!(
            completed = completed.len(),
            failed = failed.len(),
            avg_parallelism,
            "parallel execution finished"
        );

        ParallelResult {
            completed,
            failed,
            duration_ms: started.elapsed().as_millis() as i64,
            avg_parallelism,
        }
    }

    /// Best-effort compensation for a failed execution.
    ///
    /// Rolls back the failed nodes plus every task that transitively
    /// depended on one of them, highest level first. Individual rollback
    /// failures are logged and skipped; the returned list contains the
    /// nodes that rolled back successfully.
    pub async fn rollback(
        &self,
        nodes: &[DagNode],
        failed_ids: &[String],
        rollback_executor: Arc<dyn RollbackExecutor>,
    ) -> Vec<String> {
        let by_name: HashMap<&str, &DagNode> =
            nodes.iter().map(|n| (n.name(), n)).collect();

        // Transitive closure of dependents, unioned with the failed set.
        let mut affected: HashSet<String> = failed_ids
            .iter()
            .filter(|id| by_name.contains_key(id.as_str()))
            .cloned()
            .collect();
        let mut queue: VecDeque<String> = affected.iter().cloned().collect();

        while let Some(name) = queue.pop_front() {
            if let Some(node) = by_name.get(name.as_str()) {
                for dependent in &node.dependents {
                    if affected.insert(dependent.clone()) {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }

        let mut ordered: Vec<&DagNode> = affected
            .iter()
            .filter_map(|name| by_name.get(name.as_str()).copied())
            .collect();
        ordered.sort_by(|a, b| b.level.cmp(&a.level));

        let mut rolled_back = Vec::new();
        for node in ordered {
            match rollback_executor.rollback(node).await {
                Ok(()) => {
                    info!(task = %node.name(), "rolled back");
                    rolled_back.push(node.name().to_owned());
                }
                Err(err) => {
                    warn!(task = %node.name(), error = %err, "rollback failed, continuing");
                }
            }
        }

        rolled_back
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskDefinition;

    fn task(name: &str, deps: &[&str]) -> TaskDefinition {
        TaskDefinition::new(name, "mock", "run").with_depends_on(deps)
    }

    fn diamond() -> Vec<TaskDefinition> {
        vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ]
    }

    // -------------------------------------------------------
    // Graph construction
    // -------------------------------------------------------

    #[test]
    fn diamond_levels_are_computed() {
        let nodes = build_dag(&diamond()).expect("valid dag");
        let level_of = |name: &str| nodes.iter().find(|n| n.name() == name).unwrap().level;

        assert_eq!(level_of("a"), 0);
        assert_eq!(level_of("b"), 1);
        assert_eq!(level_of("c"), 1);
        assert_eq!(level_of("d"), 2);
    }

    #[test]
    fn dependents_are_the_inverse_of_depends_on() {
        let nodes = build_dag(&diamond()).expect("valid dag");
        let node_a = nodes.iter().find(|n| n.name() == "a").unwrap();

        let mut dependents = node_a.dependents.clone();
        dependents.sort();
        assert_eq!(dependents, vec!["b", "c"]);
    }

    #[test]
    fn two_node_cycle_is_rejected() {
        let tasks = vec![task("a", &["b"]), task("b", &["a"])];
        assert!(matches!(
            build_dag(&tasks),
            Err(EngineError::CircularDependency(_))
        ));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let tasks = vec![task("a", &["ghost"])];
        assert!(matches!(
            build_dag(&tasks),
            Err(EngineError::UnknownDependency { task, dependency })
                if task == "a" && dependency == "ghost"
        ));
    }

    #[test]
    fn duplicate_task_name_is_rejected() {
        let tasks = vec![task("a", &[]), task("a", &[])];
        assert!(matches!(
            build_dag(&tasks),
            Err(EngineError::InvalidDefinition(_))
        ));
    }

    // -------------------------------------------------------
    // Parallel execution
    // -------------------------------------------------------

    /// Scripted executor that records start/finish instants per node.
    struct ScriptedExecutor {
        delays: HashMap<String, Duration>,
        failures: HashSet<String>,
        log: Mutex<Vec<(String, Instant, Instant)>>,
    }

    impl ScriptedExecutor {
        fn new() -> Self {
            Self {
                delays: HashMap::new(),
                failures: HashSet::new(),
                log: Mutex::new(Vec::new()),
            }
        }

        fn delay(mut self, name: &str, delay: Duration) -> Self {
            self.delays.insert(name.to_owned(), delay);
            self
        }

        fn failing(mut self, name: &str) -> Self {
            self.failures.insert(name.to_owned());
            self
        }

        async fn span(&self, name: &str) -> Option<(Instant, Instant)> {
            self.log
                .lock()
                .await
                .iter()
                .find(|(n, _, _)| n == name)
                .map(|(_, s, f)| (*s, *f))
        }
    }

    #[async_trait]
    impl NodeExecutor for ScriptedExecutor {
        async fn execute(&self, node: &DagNode) -> Result<JsonMap, String> {
            let started = Instant::now();
            if let Some(delay) = self.delays.get(node.name()) {
                tokio::time::sleep(*delay).await;
            }
            let finished = Instant::now();
            self.log
                .lock()
                .await
                .push((node.name().to_owned(), started, finished));

            if self.failures.contains(node.name()) {
                Err("scripted failure".to_owned())
            } else {
                Ok(JsonMap::new())
            }
        }
    }

    #[tokio::test]
    async fn diamond_runs_levels_in_order() {
        let nodes = build_dag(&diamond()).unwrap();
        let executor = Arc::new(
            ScriptedExecutor::new()
                .delay("b", Duration::from_millis(30))
                .delay("c", Duration::from_millis(30)),
        );

        let engine = DagEngine::default();
        let result = engine.execute_parallel(&nodes, executor.clone()).await;

        assert_eq!(result.completed.len(), 4);
        assert!(result.failed.is_empty());

        let (_, a_end) = executor.span("a").await.unwrap();
        let (b_start, b_end) = executor.span("b").await.unwrap();
        let (c_start, c_end) = executor.span("c").await.unwrap();
        let (d_start, _) = executor.span("d").await.unwrap();

        // A terminates before B and C start; D starts after both end.
        assert!(a_end <= b_start && a_end <= c_start);
        assert!(d_start >= b_end && d_start >= c_end);
    }

    #[tokio::test]
    async fn completed_and_failed_partition_the_nodes() {
        let nodes = build_dag(&diamond()).unwrap();
        let executor = Arc::new(ScriptedExecutor::new().failing("b"));

        let result = DagEngine::default()
            .execute_parallel(&nodes, executor)
            .await;

        let mut all: Vec<String> = result.completed.clone();
        all.extend(result.failed.keys().cloned());
        all.sort();
        assert_eq!(all, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test]
    async fn dependency_failure_propagates_without_running_the_executor() {
        let nodes = build_dag(&diamond()).unwrap();
        let executor = Arc::new(ScriptedExecutor::new().failing("b"));

        let result = DagEngine::default()
            .execute_parallel(&nodes, executor.clone())
            .await;

        assert!(result.completed.contains(&"a".to_owned()));
        assert!(result.completed.contains(&"c".to_owned()));
        assert_eq!(result.failed.get("b").unwrap(), "scripted failure");
        assert_eq!(result.failed.get("d").unwrap(), "Dependency failed");

        // D's executor was never invoked.
        assert!(executor.span("d").await.is_none());
    }

    #[tokio::test]
    async fn parallelism_is_achieved_on_the_diamond() {
        let nodes = build_dag(&diamond()).unwrap();
        let executor = Arc::new(
            ScriptedExecutor::new()
                .delay("b", Duration::from_millis(350))
                .delay("c", Duration::from_millis(350)),
        );

        let engine = DagEngine::new(DagConfig {
            max_concurrency: 2,
            sample_interval: Duration::from_millis(50),
        });
        let result = engine.execute_parallel(&nodes, executor).await;

        assert!(result.failed.is_empty());
        assert!(
            result.avg_parallelism >= 1.5,
            "expected avg parallelism >= 1.5, got {}",
            result.avg_parallelism
        );
    }

    #[tokio::test]
    async fn concurrency_cap_is_respected() {
        // Five roots, cap of 2: the counter must never exceed the cap.
        let tasks: Vec<TaskDefinition> =
            (0..5).map(|i| task(&format!("t{i}"), &[])).collect();
        let nodes = build_dag(&tasks).unwrap();

        let mut executor = ScriptedExecutor::new();
        for i in 0..5 {
            executor = executor.delay(&format!("t{i}"), Duration::from_millis(60));
        }
        let executor = Arc::new(executor);

        let engine = DagEngine::new(DagConfig {
            max_concurrency: 2,
            sample_interval: Duration::from_millis(10),
        });
        let result = engine.execute_parallel(&nodes, executor.clone()).await;

        assert_eq!(result.completed.len(), 5);

        // No instant with more than two overlapping spans.
        let log = executor.log.lock().await;
        for (name, start, _) in log.iter() {
            let overlapping = log
                .iter()
                .filter(|(other, s, f)| other != name && *s <= *start && *start < *f)
                .count();
            assert!(overlapping < 2, "more than 2 nodes ran concurrently");
        }
    }

    #[tokio::test]
    async fn empty_graph_completes_immediately() {
        let nodes = build_dag(&[]).unwrap();
        let executor = Arc::new(ScriptedExecutor::new());

        let result = DagEngine::default()
            .execute_parallel(&nodes, executor)
            .await;

        assert!(result.completed.is_empty());
        assert!(result.failed.is_empty());
    }

    // -------------------------------------------------------
    // Rollback
    // -------------------------------------------------------

    struct RecordingRollback {
        order: Mutex<Vec<String>>,
        failing: HashSet<String>,
    }

    #[async_trait]
    impl RollbackExecutor for RecordingRollback {
        async fn rollback(&self, node: &DagNode) -> Result<(), String> {
            self.order.lock().await.push(node.name().to_owned());
            if self.failing.contains(node.name()) {
                Err("rollback broke".to_owned())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn rollback_covers_transitive_dependents_in_reverse_order() {
        let nodes = build_dag(&diamond()).unwrap();
        let recorder = Arc::new(RecordingRollback {
            order: Mutex::new(Vec::new()),
            failing: HashSet::new(),
        });

        let rolled_back = DagEngine::default()
            .rollback(&nodes, &["b".to_owned()], recorder.clone())
            .await;

        // b failed, d transitively depended on it; d (level 2) first.
        let order = recorder.order.lock().await.clone();
        assert_eq!(order, vec!["d", "b"]);
        assert_eq!(rolled_back, vec!["d", "b"]);
    }

    #[tokio::test]
    async fn rollback_continues_past_individual_failures() {
        let nodes = build_dag(&diamond()).unwrap();
        let recorder = Arc::new(RecordingRollback {
            order: Mutex::new(Vec::new()),
            failing: HashSet::from(["d".to_owned()]),
        });

        let rolled_back = DagEngine::default()
            .rollback(&nodes, &["b".to_owned()], recorder.clone())
            .await;

        // d's rollback failed but b was still attempted and succeeded.
        assert_eq!(recorder.order.lock().await.clone(), vec!["d", "b"]);
        assert_eq!(rolled_back, vec!["b"]);
    }
}
