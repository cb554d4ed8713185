//! Infrastructure layer for FragmentFlow.
//!
//! Implements the ports defined in `fragmentflow-core`: SQLite persistence
//! for workflows, a local process sandbox, an OpenAI-compatible model
//! invoker, an HTTP health probe, and the `config.toml` loader.

pub mod config;
pub mod llm;
pub mod sandbox;
pub mod sqlite;
