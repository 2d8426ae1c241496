//! In-process script runner backed by registered named operations.
//!
//! Stands in for a real script execution context: the node's code text
//! names an operation registered on the runner. Chain execution evaluates
//! member definitions in sequence, holding intermediate values as live
//! in-memory bags that never round-trip through serialization.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{OutputBag, Value};
use crate::store::HandleStore;

use super::{
    ChainEdge, ChainNodeDef, ExecuteOptions, ScriptFailure, ScriptResult, ScriptRunner,
};

/// A registered operation: resolved inputs and store access in, script
/// result out.
pub type OpFn =
    Box<dyn Fn(&BTreeMap<String, Value>, &mut HandleStore) -> Result<ScriptResult, EngineError> + Send + Sync>;

#[derive(Default)]
pub struct OpRunner {
    ops: HashMap<String, OpFn>,
    invocations: AtomicUsize,
}

impl OpRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, op: F)
    where
        F: Fn(&BTreeMap<String, Value>, &mut HandleStore) -> Result<ScriptResult, EngineError>
            + Send
            + Sync
            + 'static,
    {
        self.ops.insert(name.to_string(), Box::new(op));
    }

    /// Total number of runner invocations so far. A chain dispatch counts
    /// as one invocation regardless of member count.
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::Relaxed)
    }

    fn run_op(
        &self,
        code: &str,
        inputs: &BTreeMap<String, Value>,
        store: &mut HandleStore,
    ) -> Result<ScriptResult, EngineError> {
        match self.ops.get(code.trim()) {
            Some(op) => op(inputs, store),
            None => Ok(Err(ScriptFailure::validation(format!(
                "unknown operation '{}'",
                code.trim()
            )))),
        }
    }
}

impl ScriptRunner for OpRunner {
    async fn execute(
        &self,
        code: &str,
        inputs: &BTreeMap<String, Value>,
        store: &mut HandleStore,
        _opts: &ExecuteOptions,
    ) -> Result<ScriptResult, EngineError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        self.run_op(code, inputs, store)
    }

    async fn execute_chain(
        &self,
        defs: &[ChainNodeDef],
        edges: &[ChainEdge],
        external_inputs: &HashMap<Uuid, BTreeMap<String, Value>>,
        terminals: &[Uuid],
        store: &mut HandleStore,
        _opts: &ExecuteOptions,
    ) -> Result<HashMap<Uuid, ScriptResult>, EngineError> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        debug!("chain dispatch of {} node(s)", defs.len());

        // Live outputs of already-executed members; values stay in-process
        // for the whole dispatch.
        let mut live: HashMap<Uuid, OutputBag> = HashMap::new();
        let mut produced: Vec<Uuid> = Vec::new();
        let mut results: HashMap<Uuid, ScriptResult> = HashMap::new();

        for def in defs {
            let mut inputs = external_inputs.get(&def.id).cloned().unwrap_or_default();
            for edge in edges.iter().filter(|e| e.to == def.id) {
                let value = live
                    .get(&edge.from)
                    .and_then(|bag| bag.resolve(&edge.from_port))
                    .cloned();
                match value {
                    Some(v) => {
                        inputs.insert(edge.to_port.clone(), v);
                    }
                    None => {
                        let failure = ScriptFailure::validation(format!(
                            "chain input '{}' of node {} unresolved",
                            edge.to_port, def.id
                        ));
                        for &t in terminals {
                            results.insert(t, Err(failure.clone()));
                        }
                        return Ok(results);
                    }
                }
            }

            match self.run_op(&def.code, &inputs, store)? {
                Ok(mut success) => {
                    produced.append(&mut success.produced_handles);
                    live.insert(
                        def.id,
                        success
                            .outputs
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                    );
                    if terminals.contains(&def.id) {
                        // Handles created anywhere in the chain belong to
                        // the terminal's lifetime.
                        success.produced_handles = std::mem::take(&mut produced);
                        results.insert(def.id, Ok(success));
                    }
                }
                Err(failure) => {
                    for &t in terminals {
                        results.entry(t).or_insert_with(|| Err(failure.clone()));
                    }
                    return Ok(results);
                }
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScriptSuccess;
    use serde_json::json;

    fn number(inputs: &BTreeMap<String, Value>, port: &str) -> f64 {
        inputs
            .get(port)
            .and_then(|v| v.as_data())
            .and_then(|v| v.as_f64())
            .unwrap_or_default()
    }

    fn arithmetic_runner() -> OpRunner {
        let mut runner = OpRunner::new();
        runner.register("double", |inputs, _| {
            let n = number(inputs, "in");
            Ok(Ok(ScriptSuccess::with_default(Value::data(json!(n * 2.0)))))
        });
        runner.register("describe", |inputs, _| {
            let n = number(inputs, "in");
            Ok(Ok(ScriptSuccess::with_default(Value::data(json!(format!(
                "{n} units"
            ))))))
        });
        runner.register("fail", |_, _| {
            Ok(Err(ScriptFailure::runtime("boom")))
        });
        runner
    }

    #[tokio::test]
    async fn test_execute_dispatches_registered_op() {
        let runner = arithmetic_runner();
        let mut store = HandleStore::with_default_budget();
        let mut inputs = BTreeMap::new();
        inputs.insert("in".to_string(), Value::data(json!(5)));

        let result = runner
            .execute("double", &inputs, &mut store, &ExecuteOptions::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.outputs["default"], Value::data(json!(10.0)));
        assert_eq!(runner.invocations(), 1);
    }

    #[tokio::test]
    async fn test_unknown_op_is_validation_failure() {
        let runner = arithmetic_runner();
        let mut store = HandleStore::with_default_budget();
        let result = runner
            .execute("nope", &BTreeMap::new(), &mut store, &ExecuteOptions::default())
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(f) if f.kind == super::super::ScriptErrorKind::ValidationFailed
        ));
    }

    #[tokio::test]
    async fn test_chain_counts_as_one_invocation_and_feeds_forward() {
        let runner = arithmetic_runner();
        let mut store = HandleStore::with_default_budget();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let defs = vec![
            ChainNodeDef {
                id: a,
                code: "double".to_string(),
            },
            ChainNodeDef {
                id: b,
                code: "describe".to_string(),
            },
        ];
        let edges = vec![ChainEdge {
            from: a,
            to: b,
            from_port: "default".to_string(),
            to_port: "in".to_string(),
        }];
        let mut external = HashMap::new();
        let mut head_inputs = BTreeMap::new();
        head_inputs.insert("in".to_string(), Value::data(json!(5)));
        external.insert(a, head_inputs);

        let results = runner
            .execute_chain(
                &defs,
                &edges,
                &external,
                &[b],
                &mut store,
                &ExecuteOptions::default(),
            )
            .await
            .unwrap();
        let terminal = results[&b].as_ref().unwrap();
        assert_eq!(
            terminal.outputs["default"],
            Value::data(json!("10 units"))
        );
        assert_eq!(runner.invocations(), 1);
    }

    #[tokio::test]
    async fn test_chain_failure_reported_on_terminal() {
        let runner = arithmetic_runner();
        let mut store = HandleStore::with_default_budget();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let defs = vec![
            ChainNodeDef {
                id: a,
                code: "fail".to_string(),
            },
            ChainNodeDef {
                id: b,
                code: "describe".to_string(),
            },
        ];
        let results = runner
            .execute_chain(
                &defs,
                &[],
                &HashMap::new(),
                &[b],
                &mut store,
                &ExecuteOptions::default(),
            )
            .await
            .unwrap();
        assert!(results[&b].is_err());
    }
}
