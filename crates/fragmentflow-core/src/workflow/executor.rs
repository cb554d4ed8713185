//! Workflow executor: ready-queue DAG execution over a bounded worker pool.
//!
//! The `DagExecutor` validates a workflow, then admits nodes exactly when
//! their last dependency completes (Kahn's algorithm). Admitted nodes run
//! concurrently on a `JoinSet`, bounded by a semaphore of
//! `executor.max_concurrency` permits.
//!
//! # Execution flow
//!
//! 1. Register a `WorkflowExecution` (pending -> running) and seed the result store.
//! 2. Validate; a structural error fails the execution before any node starts.
//! 3. Dispatch entry nodes; on each completion record outputs and release dependents.
//! 4. On failure, retry per the node's policy; exhaustion fails the execution.
//! 5. When nothing is running or ready, collect `final_` outputs.
//!
//! The coordinating task is the only writer of the result store. Execution
//! records live in a registry so callers can inspect or cancel a run in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use fragmentflow_types::config::ExecutorConfig;
use fragmentflow_types::workflow::{
    ExecutionStatus, FragmentNode, LogEntryType, WORKFLOW_LOG_NODE, WorkflowDefinition,
    WorkflowExecution,
};
use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::retry::RetryHandler;
use super::runner::{NodeContext, NodeExecutionError, NodeRunner};
use super::store::ResultStore;
use super::validator::validate;

/// Log message appended when a caller cancels a running execution.
pub const CANCELLED_MESSAGE: &str = "workflow execution cancelled by user";

/// How long in-flight nodes get to wind down after the execution halts.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-attempt timeout: resource hint, then node timeout, then the default.
pub fn node_timeout(node: &FragmentNode, default_ms: u64) -> Duration {
    let ms = node
        .config
        .resources
        .timeout_ms
        .or(node.timeout_ms)
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

/// Result of one node attempt, sent back to the coordinator.
struct NodeOutcome {
    node_id: String,
    attempt: u32,
    result: Result<Value, NodeExecutionError>,
}

/// Why the coordinator stopped before draining the ready queue.
enum Halt {
    Failed(String),
    TimedOut(Duration),
    Cancelled,
}

/// Spawns node attempts onto the worker pool.
struct AttemptSpawner<R> {
    runner: Arc<R>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    execution_id: Uuid,
    default_timeout_ms: u64,
}

impl<R: NodeRunner> AttemptSpawner<R> {
    fn spawn(
        &self,
        tasks: &mut JoinSet<NodeOutcome>,
        node: &FragmentNode,
        inputs: HashMap<String, Value>,
        attempt: u32,
        delay: Option<Duration>,
    ) {
        let node = node.clone();
        let runner = Arc::clone(&self.runner);
        let semaphore = Arc::clone(&self.semaphore);
        let ctx = NodeContext {
            execution_id: self.execution_id,
            attempt,
            timeout: node_timeout(&node, self.default_timeout_ms),
            cancel: self.cancel.clone(),
        };

        tasks.spawn(async move {
            let outcome = |result| NodeOutcome {
                node_id: node.id.clone(),
                attempt,
                result,
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel.cancelled() => return outcome(Err(NodeExecutionError::Cancelled)),
                }
            }

            let _permit = tokio::select! {
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return outcome(Err(NodeExecutionError::Cancelled)),
                },
                _ = ctx.cancel.cancelled() => return outcome(Err(NodeExecutionError::Cancelled)),
            };

            let result = match tokio::time::timeout(ctx.timeout, runner.run(&node, &inputs, &ctx)).await
            {
                Ok(result) => result,
                Err(_) => Err(NodeExecutionError::Timeout(ctx.timeout.as_millis() as u64)),
            };
            outcome(result)
        });
    }
}

/// Ready-queue DAG executor.
///
/// Generic over `R: NodeRunner`; production wiring uses `FragmentExecutor`.
pub struct DagExecutor<R: NodeRunner> {
    runner: Arc<R>,
    config: ExecutorConfig,
    /// Executions started by this executor and not yet evicted with
    /// [`DagExecutor::remove_execution`], keyed by execution id.
    executions: DashMap<Uuid, WorkflowExecution>,
    /// Cancellation tokens for executions still in flight.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<R: NodeRunner> DagExecutor<R> {
    pub fn new(runner: Arc<R>, config: ExecutorConfig) -> Self {
        Self {
            runner,
            config,
            executions: DashMap::new(),
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Execute a workflow to a terminal state.
    ///
    /// Never fails: validation errors, node failures, timeouts and
    /// cancellation are all recorded on the returned execution.
    pub async fn execute(
        &self,
        workflow: &WorkflowDefinition,
        input_data: HashMap<String, Value>,
    ) -> WorkflowExecution {
        let mut execution = WorkflowExecution::new(workflow.id, input_data);
        let execution_id = execution.id;
        execution.status = ExecutionStatus::Running;
        let mut store = ResultStore::seeded(workflow, &execution.input_data);

        let token = CancellationToken::new();
        self.executions.insert(execution_id, execution);
        self.cancellation_tokens.insert(execution_id, token.clone());

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %workflow.id,
            workflow = %workflow.name,
            nodes = workflow.nodes.len(),
            "starting workflow execution"
        );

        let graph = match validate(workflow) {
            Ok(graph) => graph,
            Err(e) => {
                tracing::warn!(execution_id = %execution_id, error = %e, "workflow validation failed");
                self.fail(execution_id, e.to_string());
                return self.finish(execution_id);
            }
        };

        if let Ok(waves) = graph.execution_waves() {
            tracing::debug!(
                execution_id = %execution_id,
                waves = waves.len(),
                plan = ?waves,
                "execution plan"
            );
        }

        let mut remaining = graph.in_degrees();
        let mut ready: VecDeque<String> =
            graph.entry_nodes().into_iter().map(str::to_string).collect();

        let nodes_token = token.child_token();
        let spawner = AttemptSpawner {
            runner: Arc::clone(&self.runner),
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrency.max(1))),
            cancel: nodes_token.clone(),
            execution_id,
            default_timeout_ms: self.config.default_node_timeout_ms,
        };
        let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();
        let workflow_timeout = Duration::from_secs(self.config.workflow_timeout_secs);

        let run = async {
            loop {
                while let Some(node_id) = ready.pop_front() {
                    let Some(node) = workflow.node(&node_id) else {
                        continue;
                    };
                    tracing::debug!(execution_id = %execution_id, node_id = %node.id, "node admitted");
                    self.record(execution_id, |e| {
                        e.log(
                            &node.id,
                            LogEntryType::Start,
                            format!("starting node {}", node.id),
                            Some(json!({ "template": node.config.template })),
                        )
                    });
                    let inputs = store.resolve_inputs(node, &workflow.connections);
                    spawner.spawn(&mut tasks, node, inputs, 1, None);
                }

                let Some(joined) = tasks.join_next().await else {
                    return Ok::<(), Halt>(());
                };
                let outcome = joined.map_err(|e| Halt::Failed(format!("node task failed: {e}")))?;
                let Some(node) = workflow.node(&outcome.node_id) else {
                    continue;
                };

                match outcome.result {
                    Ok(value) => {
                        store.record_node_output(node, value);
                        tracing::info!(
                            execution_id = %execution_id,
                            node_id = %node.id,
                            attempt = outcome.attempt,
                            "node completed"
                        );
                        self.record(execution_id, |e| {
                            e.log(
                                &node.id,
                                LogEntryType::Complete,
                                format!("node {} completed", node.id),
                                Some(json!({ "attempt": outcome.attempt })),
                            )
                        });
                        for next in graph.successors(&node.id) {
                            if let Some(deg) = remaining.get_mut(next) {
                                *deg = deg.saturating_sub(1);
                                if *deg == 0 {
                                    ready.push_back(next.to_string());
                                }
                            }
                        }
                    }
                    Err(err) => {
                        let message = err.to_string();
                        tracing::warn!(
                            execution_id = %execution_id,
                            node_id = %node.id,
                            attempt = outcome.attempt,
                            error = %message,
                            "node failed"
                        );
                        self.record(execution_id, |e| {
                            e.log(
                                &node.id,
                                LogEntryType::Error,
                                message.clone(),
                                Some(json!({ "attempt": outcome.attempt })),
                            )
                        });

                        let policy = &node.config.retry_policy;
                        if !RetryHandler::should_retry(policy, outcome.attempt) {
                            return Err(Halt::Failed(format!(
                                "node '{}' failed after {} attempt(s): {message}",
                                node.id, outcome.attempt
                            )));
                        }

                        let next_attempt = outcome.attempt + 1;
                        let delay = RetryHandler::backoff(policy, outcome.attempt);
                        tracing::info!(
                            execution_id = %execution_id,
                            node_id = %node.id,
                            attempt = next_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying node"
                        );
                        self.record(execution_id, |e| {
                            e.log(
                                &node.id,
                                LogEntryType::Retry,
                                format!(
                                    "retrying node {} (attempt {} of {})",
                                    node.id,
                                    next_attempt,
                                    policy.max_retries + 1
                                ),
                                Some(json!({
                                    "attempt": next_attempt,
                                    "delay_ms": delay.as_millis() as u64,
                                })),
                            )
                        });
                        let inputs = store.resolve_inputs(node, &workflow.connections);
                        spawner.spawn(&mut tasks, node, inputs, next_attempt, Some(delay));
                    }
                }
            }
        };

        let halt = tokio::select! {
            biased;
            _ = token.cancelled() => Some(Halt::Cancelled),
            _ = tokio::time::sleep(workflow_timeout) => Some(Halt::TimedOut(workflow_timeout)),
            res = run => res.err(),
        };

        match halt {
            None => {
                let outputs = store.final_outputs(workflow);
                tracing::info!(
                    execution_id = %execution_id,
                    outputs = outputs.len(),
                    "workflow execution completed"
                );
                self.record(execution_id, |e| {
                    e.log(
                        WORKFLOW_LOG_NODE,
                        LogEntryType::Complete,
                        "workflow execution completed",
                        None,
                    );
                    e.status = ExecutionStatus::Completed;
                    e.completed_at = Some(Utc::now());
                    e.output_data = Some(outputs);
                });
            }
            Some(halt) => {
                nodes_token.cancel();
                self.drain(execution_id, &mut tasks).await;
                match halt {
                    Halt::Failed(message) => self.fail(execution_id, message),
                    Halt::TimedOut(after) => self.fail(
                        execution_id,
                        format!("workflow execution timed out after {}s", after.as_secs()),
                    ),
                    Halt::Cancelled => {
                        tracing::info!(execution_id = %execution_id, "workflow execution cancelled");
                    }
                }
            }
        }

        self.finish(execution_id)
    }

    /// Snapshot of an execution, running or finished.
    pub fn get_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.executions.get(&execution_id).map(|e| e.clone())
    }

    /// Drop a terminal execution from the registry once it is stored
    /// elsewhere. Running executions stay; returns the removed entry.
    pub fn remove_execution(&self, execution_id: Uuid) -> Option<WorkflowExecution> {
        self.executions
            .remove_if(&execution_id, |_, e| e.status.is_terminal())
            .map(|(_, e)| e)
    }

    /// Number of executions held in memory.
    pub fn registry_len(&self) -> usize {
        self.executions.len()
    }

    /// Executions started by this executor, oldest first, optionally
    /// restricted to one workflow.
    pub fn list_executions(&self, workflow_id: Option<Uuid>) -> Vec<WorkflowExecution> {
        let mut list: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|e| workflow_id.is_none_or(|id| e.workflow_id == id))
            .map(|e| e.clone())
            .collect();
        list.sort_by_key(|e| e.id);
        list
    }

    /// Cancel a running execution.
    ///
    /// Returns `false` when the execution is unknown or no longer running.
    /// No further nodes are admitted; in-flight nodes see their context's
    /// cancellation token fire.
    pub fn cancel_execution(&self, execution_id: Uuid) -> bool {
        {
            let Some(mut entry) = self.executions.get_mut(&execution_id) else {
                return false;
            };
            if entry.status != ExecutionStatus::Running {
                return false;
            }
            entry.status = ExecutionStatus::Cancelled;
            entry.completed_at = Some(Utc::now());
            entry.log(WORKFLOW_LOG_NODE, LogEntryType::Error, CANCELLED_MESSAGE, None);
        }

        if let Some(token) = self.cancellation_tokens.get(&execution_id) {
            token.cancel();
        }
        tracing::info!(execution_id = %execution_id, "cancellation requested");
        true
    }

    /// Apply a mutation unless the execution already reached a terminal state.
    fn record(&self, execution_id: Uuid, f: impl FnOnce(&mut WorkflowExecution)) {
        if let Some(mut entry) = self.executions.get_mut(&execution_id) {
            if !entry.status.is_terminal() {
                f(&mut entry);
            }
        }
    }

    fn fail(&self, execution_id: Uuid, message: String) {
        tracing::error!(execution_id = %execution_id, error = %message, "workflow execution failed");
        self.record(execution_id, |e| {
            e.log(WORKFLOW_LOG_NODE, LogEntryType::Error, message.clone(), None);
            e.status = ExecutionStatus::Failed;
            e.completed_at = Some(Utc::now());
            e.error = Some(message);
        });
    }

    /// Wait for cancelled in-flight attempts so their sandboxes are released.
    async fn drain(&self, execution_id: Uuid, tasks: &mut JoinSet<NodeOutcome>) {
        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                execution_id = %execution_id,
                remaining = tasks.len(),
                "in-flight nodes did not stop, aborting"
            );
            tasks.abort_all();
        }
    }

    fn finish(&self, execution_id: Uuid) -> WorkflowExecution {
        self.cancellation_tokens.remove(&execution_id);
        self.get_execution(execution_id)
            .unwrap_or_else(|| WorkflowExecution::new(Uuid::nil(), HashMap::new()))
    }
}
