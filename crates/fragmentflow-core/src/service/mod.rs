//! Business logic services (use cases).
//!
//! Services orchestrate repository calls and the workflow executor. They
//! depend on traits (ports), never on concrete infrastructure.

pub mod workflow;
