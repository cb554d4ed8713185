//! Workflow engine core: validation, scheduling, and execution of fragment DAGs.
//!
//! - `dag` -- dependency graph built from declared dependencies and connections
//! - `validator` -- structural checks run before any node executes
//! - `store` -- execution-scoped result store (`nodeId.portId` keyed values)
//! - `retry` -- per-node retry budget and backoff
//! - `runner` -- the `NodeRunner` seam between scheduler and node execution
//! - `executor` -- ready-queue DAG executor with a bounded worker pool

pub mod dag;
pub mod executor;
pub mod retry;
pub mod runner;
pub mod store;
pub mod validator;
