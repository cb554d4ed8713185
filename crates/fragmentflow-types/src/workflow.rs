//! Workflow domain types for fragmentflow.
//!
//! A `WorkflowDefinition` is a graph of `FragmentNode`s joined by typed
//! `Connection`s. Executions are tracked as `WorkflowExecution` records
//! carrying an append-only log of `ExecutionLogEntry` values.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Node id used for log entries that describe the execution as a whole.
pub const WORKFLOW_LOG_NODE: &str = "workflow";

/// Prefix marking an output port whose value becomes part of `output_data`.
pub const FINAL_OUTPUT_PREFIX: &str = "final_";

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A workflow: fragment nodes, the typed connections between their ports,
/// and the global variables seeded before any node runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// UUIDv7 assigned on first save.
    pub id: Uuid,
    /// Human-readable workflow name.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered list of nodes. Order is only a tie-breaker for scheduling.
    pub nodes: Vec<FragmentNode>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub variables: Vec<GlobalVariable>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    /// Monotonic version, bumped on every saved edit.
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_version() -> u32 {
    1
}

impl WorkflowDefinition {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&FragmentNode> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// ---------------------------------------------------------------------------
// Fragment Node
// ---------------------------------------------------------------------------

/// A fragment instance placed in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentNode {
    /// Unique within a workflow.
    pub id: String,
    /// Fragment this node was created from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment_id: Option<String>,
    /// Canvas position. Presentation only.
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub inputs: Vec<Port>,
    #[serde(default)]
    pub outputs: Vec<Port>,
    pub config: NodeConfig,
    /// Node ids that must complete before this node starts.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Node-level timeout in milliseconds. `config.resources.timeout_ms` wins
    /// when both are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl FragmentNode {
    pub fn input(&self, port_id: &str) -> Option<&Port> {
        self.inputs.iter().find(|p| p.id == port_id)
    }

    pub fn output(&self, port_id: &str) -> Option<&Port> {
        self.outputs.iter().find(|p| p.id == port_id)
    }
}

/// Canvas position coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// A typed input or output port on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    /// Port id, unique within the node (e.g. "result_output").
    pub id: String,
    /// Name used as the key in resolved inputs and in node results.
    pub name: String,
    pub direction: PortDirection,
    pub data_type: DataType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PortDirection {
    Input,
    Output,
}

/// Data type carried by a port or connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    File,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::String => "string",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Object => "object",
            DataType::Array => "array",
            DataType::File => "file",
        };
        f.write_str(s)
    }
}

/// Execution settings for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Sandbox template id (e.g. "code-interpreter-v1").
    pub template: String,
    /// Environment map. Carries the fragment payload (`CODE`, `FILE_PATH`, ...).
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub resources: ResourceHints,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

/// Resource hints passed to the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    /// Per-attempt timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Per-node retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt (0 = fail immediately).
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Base delay in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_strategy: BackoffStrategy::default(),
            initial_delay_ms: default_initial_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Linear,
    Exponential,
}

// ---------------------------------------------------------------------------
// Connections, Variables, Triggers
// ---------------------------------------------------------------------------

/// Directed edge from an output port to an input port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    pub source: PortRef,
    pub target: PortRef,
    pub data_type: DataType,
}

/// A `(node, port)` pair.
///
/// A source with `node_id` of `"input"` or `"global"` reads the seeded
/// `input.<port_id>` / `global.<port_id>` entry instead of a node output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub node_id: String,
    pub port_id: String,
}

impl PortRef {
    pub fn new(node_id: impl Into<String>, port_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            port_id: port_id.into(),
        }
    }

    /// Result store key for this port (`nodeId.portId`).
    pub fn store_key(&self) -> String {
        format!("{}.{}", self.node_id, self.port_id)
    }

    /// True when the source is the seeded `input` or `global` namespace.
    pub fn is_seeded(&self) -> bool {
        self.node_id == "input" || self.node_id == "global"
    }
}

/// Named constant seeded as `global.<name>` before any node runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalVariable {
    pub name: String,
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<DataType>,
}

/// How a workflow can be started. Stored with the definition; firing
/// triggers is the responsibility of the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    Manual {},
    Schedule {
        cron: String,
    },
    Webhook {
        path: String,
    },
    Event {
        source: String,
        event_type: String,
    },
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Overall status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal once the status has left `pending`/`running`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Pending => write!(f, "pending"),
            ExecutionStatus::Running => write!(f, "running"),
            ExecutionStatus::Completed => write!(f, "completed"),
            ExecutionStatus::Failed => write!(f, "failed"),
            ExecutionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "completed" => Ok(ExecutionStatus::Completed),
            "failed" => Ok(ExecutionStatus::Failed),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            other => Err(format!("invalid execution status: '{other}'")),
        }
    }
}

/// Kind of an execution log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogEntryType {
    Start,
    Complete,
    Error,
    Retry,
}

/// One append-only entry in an execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    /// Originating node, or `"workflow"` for execution-level events.
    pub node_id: String,
    #[serde(rename = "type")]
    pub entry_type: LogEntryType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A single execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// UUIDv7 execution id.
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input_data: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<HashMap<String, serde_json::Value>>,
    #[serde(default)]
    pub logs: Vec<ExecutionLogEntry>,
    /// Human-readable failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkflowExecution {
    /// A fresh `pending` execution.
    pub fn new(workflow_id: Uuid, input_data: HashMap<String, serde_json::Value>) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            input_data,
            output_data: None,
            logs: Vec::new(),
            error: None,
        }
    }

    /// Append a log entry stamped with the current time.
    pub fn log(
        &mut self,
        node_id: &str,
        entry_type: LogEntryType,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        self.logs.push(ExecutionLogEntry {
            timestamp: Utc::now(),
            node_id: node_id.to_string(),
            entry_type,
            message: message.into(),
            data,
        });
    }

    /// Log entries for one node, in order.
    pub fn node_logs<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ExecutionLogEntry> {
        self.logs.iter().filter(move |e| e.node_id == node_id)
    }
}

// ---------------------------------------------------------------------------
// Templates & paging
// ---------------------------------------------------------------------------

/// A named, reusable workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: String,
    pub definition: WorkflowDefinition,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default)]
    pub usage_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Offset pagination for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

/// One page of a list query plus the total count across all pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_workflow() -> WorkflowDefinition {
        let yaml = r#"
id: 01900000-0000-7000-8000-000000000001
name: report-pipeline
nodes:
  - id: fetch
    outputs:
      - id: rows
        name: rows
        direction: output
        data_type: array
    config:
      template: code-interpreter-v1
      environment:
        CODE: "print(1)"
      retry_policy:
        max_retries: 2
        backoff_strategy: exponential
  - id: render
    inputs:
      - id: rows_in
        name: rows
        direction: input
        data_type: array
        required: true
    outputs:
      - id: final_report
        name: report
        direction: output
        data_type: string
    config:
      template: streamlit-developer
      resources:
        timeout_ms: 180000
    dependencies: [fetch]
connections:
  - id: c1
    source: { node_id: fetch, port_id: rows }
    target: { node_id: render, port_id: rows_in }
    data_type: array
variables:
  - name: region
    value: eu
triggers:
  - type: manual
  - type: schedule
    cron: "0 9 * * *"
"#;
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    #[test]
    fn test_workflow_yaml_defaults() {
        let wf = sample_workflow();
        assert_eq!(wf.version, 1);
        assert_eq!(wf.nodes.len(), 2);
        let fetch = wf.node("fetch").unwrap();
        assert_eq!(fetch.config.retry_policy.max_retries, 2);
        assert_eq!(
            fetch.config.retry_policy.backoff_strategy,
            BackoffStrategy::Exponential
        );
        assert_eq!(fetch.config.retry_policy.initial_delay_ms, 1000);
        assert_eq!(fetch.position, Position::default());

        let render = wf.node("render").unwrap();
        assert!(render.input("rows_in").unwrap().required);
        assert_eq!(render.config.resources.timeout_ms, Some(180_000));
        assert_eq!(render.config.retry_policy, RetryPolicy::default());
        assert!(matches!(wf.triggers[1], TriggerConfig::Schedule { .. }));
    }

    #[test]
    fn test_workflow_json_roundtrip() {
        let wf = sample_workflow();
        let json = serde_json::to_string(&wf).unwrap();
        let back: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, wf.id);
        assert_eq!(back.connections[0].source, PortRef::new("fetch", "rows"));
        assert_eq!(back.variables[0].value, json!("eu"));
    }

    #[test]
    fn test_port_ref_keys() {
        let r = PortRef::new("fetch", "rows");
        assert_eq!(r.store_key(), "fetch.rows");
        assert!(!r.is_seeded());
        assert!(PortRef::new("input", "query").is_seeded());
        assert!(PortRef::new("global", "region").is_seeded());
    }

    #[test]
    fn test_execution_status_roundtrip() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            let parsed: ExecutionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!("bogus".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn test_execution_log_append() {
        let mut exec = WorkflowExecution::new(Uuid::now_v7(), HashMap::new());
        assert_eq!(exec.status, ExecutionStatus::Pending);
        exec.log("a", LogEntryType::Start, "starting", None);
        exec.log(WORKFLOW_LOG_NODE, LogEntryType::Error, "boom", Some(json!({"x": 1})));
        exec.log("a", LogEntryType::Complete, "done", None);

        let types: Vec<_> = exec.node_logs("a").map(|e| e.entry_type).collect();
        assert_eq!(types, vec![LogEntryType::Start, LogEntryType::Complete]);

        let json = serde_json::to_value(&exec.logs[1]).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["node_id"], "workflow");
    }
}
