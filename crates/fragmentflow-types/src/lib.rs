//! Shared domain types for fragmentflow.
//!
//! Workflow definitions and executions, fragment specs and node templates,
//! provider health and fallback configuration, and the error types shared
//! between the core and infrastructure layers.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod fragment;
pub mod provider;
pub mod workflow;
