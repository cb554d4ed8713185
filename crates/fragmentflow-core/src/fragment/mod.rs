//! Fragments as workflow nodes.
//!
//! - `mapper` -- built-in node templates and fragment <-> node conversion
//! - `executor` -- runs one node's fragment in a sandbox

pub mod executor;
pub mod mapper;
