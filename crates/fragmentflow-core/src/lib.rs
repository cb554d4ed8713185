//! Orchestration core for FragmentFlow.
//!
//! Holds the workflow engine, the fragment executor, provider resilience
//! (circuit breakers, health monitoring, fallback chains) and the
//! repository/sandbox ports that the infrastructure layer implements. It
//! depends only on `fragmentflow-types`, never on `fragmentflow-infra` or
//! any database/IO crate.

pub mod fragment;
pub mod llm;
pub mod repository;
pub mod sandbox;
pub mod service;
pub mod workflow;
