//! Script runner contract.
//!
//! The runner is the engine's one external capability: given code and
//! resolved inputs it returns outputs, produced handles, or a structured
//! error. The coordinator issues at most one outstanding invocation at a
//! time and passes the handle store in, so all handle mutation stays on
//! the coordinator's control flow.

mod op_runner;

pub use op_runner::OpRunner;

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::Value;
use crate::store::HandleStore;

/// Per-invocation options. Timeout is enforced per invocation, not per
/// overall run.
#[derive(Clone, Debug)]
pub struct ExecuteOptions {
    pub timeout: Duration,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Classification of a script-level failure.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScriptErrorKind {
    ValidationFailed,
    RuntimeError,
    Timeout,
}

/// A structured script failure, recorded on the failing node's state.
#[derive(Error, Serialize, Clone, Debug, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct ScriptFailure {
    pub kind: ScriptErrorKind,
    pub message: String,
    pub line_number: Option<u32>,
    pub stack: Option<String>,
}

impl ScriptFailure {
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            kind: ScriptErrorKind::ValidationFailed,
            message: message.into(),
            line_number: None,
            stack: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self {
            kind: ScriptErrorKind::RuntimeError,
            message: message.into(),
            line_number: None,
            stack: None,
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self {
            kind: ScriptErrorKind::Timeout,
            message: format!("script exceeded {}ms", limit.as_millis()),
            line_number: None,
            stack: None,
        }
    }
}

/// Successful invocation result.
#[derive(Clone, Debug, Default)]
pub struct ScriptSuccess {
    /// Outputs keyed by port name.
    pub outputs: BTreeMap<String, Value>,
    /// Ids of handles created in the store during this invocation.
    pub produced_handles: Vec<Uuid>,
}

impl ScriptSuccess {
    /// A single value on the `default` port.
    pub fn with_default(value: Value) -> Self {
        let mut outputs = BTreeMap::new();
        outputs.insert(crate::model::DEFAULT_PORT.to_string(), value);
        Self {
            outputs,
            produced_handles: Vec::new(),
        }
    }
}

pub type ScriptResult = Result<ScriptSuccess, ScriptFailure>;

/// One node definition inside a chain dispatch.
#[derive(Clone, Debug)]
pub struct ChainNodeDef {
    pub id: Uuid,
    pub code: String,
}

/// An edge internal to a chain dispatch.
#[derive(Clone, Debug)]
pub struct ChainEdge {
    pub from: Uuid,
    pub to: Uuid,
    pub from_port: String,
    pub to_port: String,
}

/// The execution capability consumed by the coordinator.
///
/// The outer `Result` is a transport-level fault (the runner itself broke);
/// the inner `ScriptResult` is the script's own outcome.
pub trait ScriptRunner: Send + Sync {
    /// Execute one script against resolved inputs.
    fn execute(
        &self,
        code: &str,
        inputs: &BTreeMap<String, Value>,
        store: &mut HandleStore,
        opts: &ExecuteOptions,
    ) -> impl Future<Output = Result<ScriptResult, EngineError>> + Send;

    /// Execute a chain of script nodes in one invocation, keeping
    /// intermediate values inside the execution context. Results are keyed
    /// by terminal node id.
    fn execute_chain(
        &self,
        defs: &[ChainNodeDef],
        edges: &[ChainEdge],
        external_inputs: &HashMap<Uuid, BTreeMap<String, Value>>,
        terminals: &[Uuid],
        store: &mut HandleStore,
        opts: &ExecuteOptions,
    ) -> impl Future<Output = Result<HashMap<Uuid, ScriptResult>, EngineError>> + Send;
}
