//! Node-graph execution engine.
//!
//! A [`model::Graph`] of typed-port nodes is scheduled by [`schedule`]
//! (deterministic topological order with script-chain batching), executed by
//! the [`coordinator::Engine`] through a pluggable [`runner::ScriptRunner`],
//! with heavy values kept out-of-band in the [`store::HandleStore`] and
//! per-node results retained in the [`cache`] between runs.

pub mod cache;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod runner;
pub mod schedule;
pub mod store;

pub use coordinator::{Engine, EngineConfig, Run};
pub use error::{EngineError, GraphError, StoreError};
pub use model::{Graph, GraphDefinition, Node, Value};
pub use runner::{OpRunner, ScriptRunner};
