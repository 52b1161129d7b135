//! Workflow engine (C11): DAG-structured node execution with bounded
//! concurrency and linear retry backoff (spec.md §4.11).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::error::{Result, SpiralError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// What a node's run function receives: the already-computed output of
/// every dependency, keyed by node id, plus a read-only context shared by
/// the whole run (`Execute(workflow, context)`, spec.md §4.11).
#[derive(Clone)]
pub struct NodeInputs {
    pub dependencies: HashMap<String, Vec<u8>>,
    pub context: Arc<serde_json::Value>,
}

type NodeFn = Arc<dyn Fn(NodeInputs) -> futures_result::BoxFuture + Send + Sync>;

mod futures_result {
    use crate::error::Result;
    use std::future::Future;
    use std::pin::Pin;
    pub type BoxFuture = Pin<Box<dyn Future<Output = Result<Vec<u8>>> + Send>>;
}

struct Node {
    id: String,
    dependencies: Vec<String>,
    run: NodeFn,
    max_retries: u32,
    status: NodeStatus,
    attempts: u32,
    output: Option<Vec<u8>>,
    error: Option<String>,
}

/// A DAG of nodes executed with bounded concurrency: nodes whose
/// dependencies have all completed become eligible ("ready") and run as
/// soon as a concurrency slot opens, receiving those dependencies' outputs
/// plus the run's shared context. A failed node (after exhausting retries)
/// cascades `Skipped` to everything that depends on it, directly or
/// transitively.
pub struct Workflow {
    nodes: Mutex<HashMap<String, Node>>,
    order: Mutex<Vec<String>>,
    concurrency: usize,
}

impl Workflow {
    pub fn new(concurrency: usize) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            order: Mutex::new(Vec::new()),
            concurrency,
        }
    }

    /// Adds a node. Fails with [`SpiralError::InvalidArgument`] if `id` is a
    /// duplicate, a dependency doesn't exist yet, or adding this node would
    /// create a cycle.
    pub async fn add_node(
        &self,
        id: &str,
        dependencies: Vec<String>,
        max_retries: u32,
        run: impl Fn(NodeInputs) -> futures_result::BoxFuture + Send + Sync + 'static,
    ) -> Result<()> {
        let mut nodes = self.nodes.lock().await;
        if nodes.contains_key(id) {
            return Err(SpiralError::InvalidArgument(format!(
                "node '{id}' already exists"
            )));
        }
        for dep in &dependencies {
            if !nodes.contains_key(dep) {
                return Err(SpiralError::InvalidArgument(format!(
                    "node '{id}' depends on unknown node '{dep}'"
                )));
            }
        }

        nodes.insert(
            id.to_string(),
            Node {
                id: id.to_string(),
                dependencies: dependencies.clone(),
                run: Arc::new(run),
                max_retries,
                status: NodeStatus::Pending,
                attempts: 0,
                output: None,
                error: None,
            },
        );

        if Self::creates_cycle(&nodes, id) {
            nodes.remove(id);
            return Err(SpiralError::InvalidArgument(format!(
                "adding node '{id}' would create a cycle"
            )));
        }

        drop(nodes);
        self.order.lock().await.push(id.to_string());
        Ok(())
    }

    /// True if, starting from `start`'s dependencies, a walk down the
    /// dependency graph can reach `start` again.
    fn creates_cycle(nodes: &HashMap<String, Node>, start: &str) -> bool {
        fn reaches(
            nodes: &HashMap<String, Node>,
            current: &str,
            target: &str,
            visited: &mut HashSet<String>,
        ) -> bool {
            if current == target {
                return true;
            }
            if !visited.insert(current.to_string()) {
                return false;
            }
            nodes
                .get(current)
                .map(|n| n.dependencies.iter().any(|dep| reaches(nodes, dep, target, visited)))
                .unwrap_or(false)
        }

        let Some(node) = nodes.get(start) else {
            return false;
        };
        let mut visited = HashSet::new();
        node.dependencies
            .iter()
            .any(|dep| reaches(nodes, dep, start, &mut visited))
    }

    /// Runs the whole DAG to completion (or as far as failures allow),
    /// respecting the configured concurrency cap. `context` is handed to
    /// every node's run function unchanged.
    pub async fn run(&self, context: serde_json::Value) -> Result<HashMap<String, NodeStatus>> {
        let context = Arc::new(context);
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut in_flight: VecDeque<tokio::task::JoinHandle<(String, Result<Vec<u8>>)>> =
            VecDeque::new();

        loop {
            let ready = self.ready_nodes().await;
            for id in ready {
                self.mark(&id, NodeStatus::Running).await;
                let permit = semaphore.clone().acquire_owned().await.unwrap();
                let run = self.node_run_fn(&id).await;
                let inputs = self.node_inputs(&id, context.clone()).await;
                let id_owned = id.clone();
                in_flight.push_back(tokio::spawn(async move {
                    let result = run(inputs).await;
                    drop(permit);
                    (id_owned, result)
                }));
            }

            if in_flight.is_empty() {
                break;
            }

            let handle = in_flight.pop_front().unwrap();
            let (id, result) = handle.await.map_err(|e| {
                SpiralError::Internal(anyhow::anyhow!("workflow node task panicked: {e}"))
            })?;
            self.handle_node_result(&id, result).await;
        }

        let nodes = self.nodes.lock().await;
        Ok(nodes.iter().map(|(id, n)| (id.clone(), n.status)).collect())
    }

    /// This node's already-computed output, if it has completed.
    pub async fn node_output(&self, id: &str) -> Option<Vec<u8>> {
        self.nodes.lock().await.get(id).and_then(|n| n.output.clone())
    }

    /// This node's final error message, if it failed permanently.
    pub async fn node_error(&self, id: &str) -> Option<String> {
        self.nodes.lock().await.get(id).and_then(|n| n.error.clone())
    }

    async fn node_run_fn(&self, id: &str) -> NodeFn {
        self.nodes.lock().await.get(id).unwrap().run.clone()
    }

    /// Collects `id`'s dependency outputs into the map its run function
    /// receives, alongside the shared context.
    async fn node_inputs(&self, id: &str, context: Arc<serde_json::Value>) -> NodeInputs {
        let nodes = self.nodes.lock().await;
        let node = nodes.get(id).unwrap();
        let dependencies = node
            .dependencies
            .iter()
            .filter_map(|dep| {
                nodes
                    .get(dep)
                    .and_then(|n| n.output.clone())
                    .map(|output| (dep.clone(), output))
            })
            .collect();
        NodeInputs {
            dependencies,
            context,
        }
    }

    async fn mark(&self, id: &str, status: NodeStatus) {
        if let Some(node) = self.nodes.lock().await.get_mut(id) {
            node.status = status;
        }
    }

    async fn ready_nodes(&self) -> Vec<String> {
        let nodes = self.nodes.lock().await;
        let order = self.order.lock().await;
        let mut ready = Vec::new();
        for id in order.iter() {
            let Some(node) = nodes.get(id) else { continue };
            if node.status != NodeStatus::Pending {
                continue;
            }
            let deps_done = node
                .dependencies
                .iter()
                .all(|d| matches!(nodes.get(d).map(|n| n.status), Some(NodeStatus::Completed)));
            let deps_failed = node.dependencies.iter().any(|d| {
                matches!(
                    nodes.get(d).map(|n| n.status),
                    Some(NodeStatus::Failed) | Some(NodeStatus::Skipped)
                )
            });
            if deps_failed {
                continue; // handled by cascade_skip once the dependency's failure is processed
            }
            if deps_done {
                ready.push(id.clone());
            }
        }
        ready
    }

    async fn handle_node_result(&self, id: &str, result: Result<Vec<u8>>) {
        match result {
            Ok(output) => {
                let mut nodes = self.nodes.lock().await;
                if let Some(node) = nodes.get_mut(id) {
                    node.status = NodeStatus::Completed;
                    node.output = Some(output);
                }
                drop(nodes);
                info!(node = %id, "workflow node completed");
            }
            Err(e) => {
                let should_retry = {
                    let mut nodes = self.nodes.lock().await;
                    let node = nodes.get_mut(id).unwrap();
                    node.attempts += 1;
                    node.attempts <= node.max_retries
                };

                if should_retry {
                    let attempt = self.nodes.lock().await.get(id).unwrap().attempts;
                    let backoff = Duration::from_millis(
                        crate::constants::NODE_RETRY_BASE_BACKOFF_MS * attempt as u64,
                    );
                    warn!(node = %id, attempt, error = %e, "node failed, retrying after backoff");
                    tokio::time::sleep(backoff).await;
                    self.mark(id, NodeStatus::Pending).await;
                } else {
                    error!(node = %id, error = %e, "node failed permanently");
                    let mut nodes = self.nodes.lock().await;
                    if let Some(node) = nodes.get_mut(id) {
                        node.status = NodeStatus::Failed;
                        node.error = Some(e.to_string());
                    }
                    drop(nodes);
                    self.cascade_skip(id).await;
                }
            }
        }
    }

    async fn cascade_skip(&self, failed_id: &str) {
        let mut nodes = self.nodes.lock().await;
        let mut frontier = vec![failed_id.to_string()];
        while let Some(id) = frontier.pop() {
            let dependents: Vec<String> = nodes
                .values()
                .filter(|n| n.dependencies.contains(&id))
                .map(|n| n.id.clone())
                .collect();
            for dep_id in dependents {
                if let Some(n) = nodes.get_mut(&dep_id) {
                    if n.status == NodeStatus::Pending {
                        n.status = NodeStatus::Skipped;
                        frontier.push(dep_id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ok() -> futures_result::BoxFuture {
        Box::pin(async { Ok(vec![]) })
    }

    #[tokio::test]
    async fn linear_chain_completes_in_order() {
        let workflow = Workflow::new(4);
        let order = Arc::new(Mutex::new(Vec::<String>::new()));

        let o1 = order.clone();
        workflow
            .add_node("a", vec![], 0, move |_inputs| {
                let o1 = o1.clone();
                Box::pin(async move {
                    o1.lock().await.push("a".into());
                    Ok(vec![])
                })
            })
            .await
            .unwrap();

        let o2 = order.clone();
        workflow
            .add_node("b", vec!["a".to_string()], 0, move |_inputs| {
                let o2 = o2.clone();
                Box::pin(async move {
                    o2.lock().await.push("b".into());
                    Ok(vec![])
                })
            })
            .await
            .unwrap();

        let statuses = workflow.run(serde_json::Value::Null).await.unwrap();
        assert_eq!(statuses["a"], NodeStatus::Completed);
        assert_eq!(statuses["b"], NodeStatus::Completed);
        assert_eq!(*order.lock().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn dependent_node_receives_dependency_output_and_context() {
        let workflow = Workflow::new(2);
        workflow
            .add_node("a", vec![], 0, |_inputs| {
                Box::pin(async { Ok(b"hello".to_vec()) })
            })
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        workflow
            .add_node("b", vec!["a".to_string()], 0, move |inputs| {
                let seen2 = seen2.clone();
                Box::pin(async move {
                    let dep_output = inputs.dependencies.get("a").cloned();
                    let context_tag = inputs.context["tag"].as_str().map(str::to_string);
                    *seen2.lock().await = Some((dep_output, context_tag));
                    Ok(vec![])
                })
            })
            .await
            .unwrap();

        let statuses = workflow
            .run(serde_json::json!({ "tag": "run-1" }))
            .await
            .unwrap();
        assert_eq!(statuses["b"], NodeStatus::Completed);
        let (dep_output, context_tag) = seen.lock().await.clone().unwrap();
        assert_eq!(dep_output, Some(b"hello".to_vec()));
        assert_eq!(context_tag, Some("run-1".to_string()));
        assert_eq!(workflow.node_output("a").await, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn duplicate_node_id_rejected() {
        let workflow = Workflow::new(2);
        workflow.add_node("a", vec![], 0, |_| ok()).await.unwrap();
        let err = workflow.add_node("a", vec![], 0, |_| ok()).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn unknown_dependency_rejected() {
        let workflow = Workflow::new(2);
        let err = workflow
            .add_node("a", vec!["missing".to_string()], 0, |_| ok())
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn cycle_is_rejected() {
        let workflow = Workflow::new(2);
        workflow.add_node("a", vec![], 0, |_| ok()).await.unwrap();
        workflow
            .add_node("b", vec!["a".to_string()], 0, |_| ok())
            .await
            .unwrap();
        // Would need to retroactively add "a depends on b" to cycle — since
        // deps must already exist, the only way to trigger this path is a
        // self-dependency.
        let err = workflow
            .add_node("c", vec!["c".to_string()], 0, |_| ok())
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn failed_node_skips_dependents() {
        let workflow = Workflow::new(2);
        workflow
            .add_node("a", vec![], 0, |_inputs| {
                Box::pin(async { Err(SpiralError::agent("boom")) })
            })
            .await
            .unwrap();
        workflow
            .add_node("b", vec!["a".to_string()], 0, |_| ok())
            .await
            .unwrap();

        let statuses = workflow.run(serde_json::Value::Null).await.unwrap();
        assert_eq!(statuses["a"], NodeStatus::Failed);
        assert_eq!(statuses["b"], NodeStatus::Skipped);
        assert_eq!(workflow.node_error("a").await, Some("boom".to_string()));
    }

    #[tokio::test]
    async fn retries_before_failing_permanently() {
        let workflow = Workflow::new(1);
        let attempts = Arc::new(AtomicU32::new(0));
        let a2 = attempts.clone();
        workflow
            .add_node("a", vec![], 2, move |_inputs| {
                let a2 = a2.clone();
                Box::pin(async move {
                    let n = a2.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(SpiralError::agent("not yet"))
                    } else {
                        Ok(vec![])
                    }
                })
            })
            .await
            .unwrap();

        let statuses = workflow.run(serde_json::Value::Null).await.unwrap();
        assert_eq!(statuses["a"], NodeStatus::Completed);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn concurrency_cap_limits_parallel_nodes() {
        let workflow = Workflow::new(1);
        let concurrent = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        for id in ["a", "b", "c"] {
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            workflow
                .add_node(id, vec![], 0, move |_inputs| {
                    let concurrent = concurrent.clone();
                    let max_seen = max_seen.clone();
                    Box::pin(async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok(vec![])
                    })
                })
                .await
                .unwrap();
        }

        workflow.run(serde_json::Value::Null).await.unwrap();
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }
}
