//! Model provider resilience and fragment generation.
//!
//! - `breaker`: per-provider circuit breaker
//! - `health`: provider health monitor owning the breakers, plus the probe seam
//! - `fallback`: ordered fallback chains with model substitution
//! - `invoker`: `ModelInvoker` RPITIT trait and its boxed, registry form
//! - `generator`: structured fragment generation over the fallback manager

pub mod breaker;
pub mod fallback;
pub mod generator;
pub mod health;
pub mod invoker;
