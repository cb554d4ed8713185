//! Node runner contract used by the DAG executor.
//!
//! The executor resolves a node's inputs and hands the node to a
//! `NodeRunner`; the production runner is `FragmentExecutor`, tests plug
//! in scripted runners.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use fragmentflow_types::workflow::FragmentNode;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::sandbox::SandboxError;

/// Per-attempt context handed to a runner.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub execution_id: Uuid,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Time budget for this attempt.
    pub timeout: Duration,
    /// Fires when the execution is cancelled, times out, or fails elsewhere.
    pub cancel: CancellationToken,
}

/// Node-level failure. Retried per the node's policy.
#[derive(Debug, thiserror::Error)]
pub enum NodeExecutionError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("{name}: {value}")]
    Runtime { name: String, value: String },

    #[error("node timed out after {0}ms")]
    Timeout(u64),

    #[error("node execution cancelled")]
    Cancelled,

    #[error("invalid node: {0}")]
    InvalidNode(String),
}

/// Executes a single node with already-resolved inputs.
///
/// Returns the value stored in the result store under the node id.
pub trait NodeRunner: Send + Sync + 'static {
    fn run(
        &self,
        node: &FragmentNode,
        inputs: &HashMap<String, Value>,
        ctx: &NodeContext,
    ) -> impl Future<Output = Result<Value, NodeExecutionError>> + Send;
}
