//! Execution coordinator: drives full and incremental runs.
//!
//! One control flow per run. The script runner invocation is the only
//! suspension point, and at most one invocation is outstanding at a time;
//! chain detection already captures the only safe form of batching, and
//! downstream nodes need completed upstream outputs. Runs against the same
//! engine are serialized by an explicit lock, not a UI flag.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::cache::{self, ExecutionCache, NodeExecutionState, NodeOutput, NodeStatus};
use crate::error::EngineError;
use crate::model::{DEFAULT_PORT, Graph, Node, NodeKind, OutputBag, Value};
use crate::runner::{
    ChainEdge, ChainNodeDef, ExecuteOptions, ScriptFailure, ScriptRunner, ScriptSuccess,
};
use crate::schedule::{self, Chain, Step};
use crate::store::HandleStore;

const DEFAULT_HANDLE_BUDGET_BYTES: usize = 256 * 1024 * 1024;
const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub handle_budget_bytes: usize,
    pub script_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            handle_budget_bytes: DEFAULT_HANDLE_BUDGET_BYTES,
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Full,
    Incremental,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One progress/log event, consumable by any observer.
#[derive(Serialize, Clone, Debug)]
pub struct RunEvent {
    pub level: LogLevel,
    pub message: String,
    pub node_id: Option<Uuid>,
}

/// The result of one engine invocation. Node-level failures live in
/// `node_states` and `halted`; a run-level failure is an `Err` from the
/// entry point instead.
#[derive(Serialize, Clone, Debug)]
pub struct Run {
    pub id: Uuid,
    pub mode: RunMode,
    pub node_states: HashMap<Uuid, NodeExecutionState>,
    pub logs: Vec<RunEvent>,
    /// Node at which execution halted, if a script failed.
    pub halted: Option<Uuid>,
    pub cancelled: bool,
}

impl Run {
    fn new(mode: RunMode, graph: &Graph) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode,
            node_states: graph
                .nodes()
                .iter()
                .map(|n| (n.id, NodeExecutionState::pending()))
                .collect(),
            logs: Vec::new(),
            halted: None,
            cancelled: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.halted.is_none() && !self.cancelled
    }

    /// Convenience accessor for a node's default output value.
    pub fn output_of(&self, node_id: Uuid) -> Option<&Value> {
        self.node_states
            .get(&node_id)?
            .bag()?
            .resolve(DEFAULT_PORT)
    }
}

/// Status of a fire-and-forget run.
#[derive(Clone, Debug)]
pub enum DetachedStatus {
    Running,
    Finished(Run),
    Failed(String),
}

type EventSink = Box<dyn Fn(&RunEvent) + Send + Sync>;

struct EngineState {
    cache: ExecutionCache,
    store: HandleStore,
}

/// Outcome of one coordinator step.
enum StepOutcome {
    Continue,
    Halt(Uuid),
}

/// The execution engine. Holds the cache and handle store behind one lock
/// so overlapping runs against the same engine queue up instead of racing
/// the cache.
pub struct Engine<R> {
    runner: R,
    config: EngineConfig,
    state: Mutex<EngineState>,
    cancel: AtomicBool,
    sink: Option<EventSink>,
    detached: StdMutex<HashMap<Uuid, DetachedStatus>>,
}

impl<R: ScriptRunner> Engine<R> {
    pub fn new(runner: R) -> Self {
        Self::with_config(runner, EngineConfig::default())
    }

    pub fn with_config(runner: R, config: EngineConfig) -> Self {
        Self {
            runner,
            state: Mutex::new(EngineState {
                cache: ExecutionCache::new(),
                store: HandleStore::new(config.handle_budget_bytes),
            }),
            config,
            cancel: AtomicBool::new(false),
            sink: None,
            detached: StdMutex::new(HashMap::new()),
        }
    }

    /// Install a callback receiving every `RunEvent` in emission order.
    pub fn with_event_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(&RunEvent) + Send + Sync + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Execute every node of the graph in schedule order.
    pub async fn run_full(&self, graph: &Graph) -> Result<Run, EngineError> {
        let mut state = self.state.lock().await;
        let EngineState { cache, store } = &mut *state;
        self.cancel.store(false, Ordering::SeqCst);
        self.drive(graph, RunMode::Full, cache, store).await
    }

    /// Re-execute only stale nodes; everything else is satisfied from the
    /// cache. The schedule still covers the whole graph so downstream
    /// lookups are populated in order.
    pub async fn run_incremental(&self, graph: &Graph) -> Result<Run, EngineError> {
        let mut state = self.state.lock().await;
        let EngineState { cache, store } = &mut *state;
        self.cancel.store(false, Ordering::SeqCst);
        self.drive(graph, RunMode::Incremental, cache, store).await
    }

    /// Flag a node's cached result as out of date (its code or static
    /// value was edited). Downstream nodes go stale transitively at the
    /// next incremental run.
    pub async fn invalidate(&self, node_id: Uuid) -> bool {
        self.state.lock().await.cache.mark_stale(node_id)
    }

    pub async fn clear_cache(&self) {
        self.state.lock().await.cache.clear();
    }

    /// Nodes an incremental run would re-execute.
    pub async fn stale_nodes(&self, graph: &Graph) -> HashSet<Uuid> {
        cache::stale_nodes(graph, &self.state.lock().await.cache)
    }

    /// Request cancellation of the run in progress. Checked between node
    /// steps; a chain dispatch already underway runs to completion.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Dereference a value for a consumer that needs materialized bytes.
    /// Inline data passes through; a handle reference is exported through
    /// the store. `None` means the handle is gone.
    pub async fn materialize(
        &self,
        value: &Value,
    ) -> Result<Option<serde_json::Value>, EngineError> {
        match value {
            Value::Data(v) => Ok(Some(v.clone())),
            Value::Handle(r) => self.state.lock().await.store.serialize(r.handle_id),
        }
    }

    fn emit(&self, run: &mut Run, level: LogLevel, node_id: Option<Uuid>, message: String) {
        match level {
            LogLevel::Debug => log::debug!("{message}"),
            LogLevel::Info => log::info!("{message}"),
            LogLevel::Warn => log::warn!("{message}"),
            LogLevel::Error => log::error!("{message}"),
        }
        let event = RunEvent {
            level,
            message,
            node_id,
        };
        if let Some(sink) = &self.sink {
            sink(&event);
        }
        run.logs.push(event);
    }

    async fn drive(
        &self,
        graph: &Graph,
        mode: RunMode,
        cache: &mut ExecutionCache,
        store: &mut HandleStore,
    ) -> Result<Run, EngineError> {
        let plan = schedule::plan(graph);
        let stale: HashSet<Uuid> = match mode {
            RunMode::Full => graph.nodes().iter().map(|n| n.id).collect(),
            RunMode::Incremental => cache::stale_nodes(graph, cache),
        };

        let mut run = Run::new(mode, graph);
        let started = format!(
            "run {} started: {} node(s), {} step(s), {} stale",
            run.id,
            graph.nodes().len(),
            plan.steps.len(),
            stale.len()
        );
        self.emit(&mut run, LogLevel::Info, None, started);

        for step in &plan.steps {
            if self.cancel.load(Ordering::SeqCst) {
                run.cancelled = true;
                self.emit(&mut run, LogLevel::Warn, None, "run cancelled".to_string());
                break;
            }

            let outcome = match *step {
                Step::Single(id) => {
                    if stale.contains(&id) {
                        self.execute_single(graph, id, &mut run, cache, store)
                            .await?
                    } else {
                        self.reuse_cached(&mut run, cache, id);
                        StepOutcome::Continue
                    }
                }
                Step::Chain(ci) => {
                    let chain = &plan.chains[ci];
                    if chain.nodes.iter().any(|n| stale.contains(n)) {
                        // Intermediates have no externally visible output,
                        // so a partially stale chain re-runs whole.
                        self.execute_chain(graph, chain, &mut run, cache, store)
                            .await?
                    } else {
                        for &id in &chain.nodes {
                            self.reuse_cached(&mut run, cache, id);
                        }
                        StepOutcome::Continue
                    }
                }
            };

            if let StepOutcome::Halt(node_id) = outcome {
                run.halted = Some(node_id);
                self.emit(
                    &mut run,
                    LogLevel::Error,
                    Some(node_id),
                    format!("run halted at node {node_id}"),
                );
                break;
            }
        }

        // Nodes never reached stay untouched in the cache so their last
        // good outputs survive a halted run.
        for (id, state) in &run.node_states {
            if state.status != NodeStatus::Pending {
                cache.insert(*id, state.clone());
            }
        }

        let finished = format!("run {} finished", run.id);
        self.emit(&mut run, LogLevel::Info, None, finished);
        Ok(run)
    }

    fn reuse_cached(&self, run: &mut Run, cache: &ExecutionCache, id: Uuid) {
        if let Some(prior) = cache.get(id) {
            run.node_states.insert(
                id,
                NodeExecutionState {
                    status: NodeStatus::Cached,
                    started_at: prior.started_at,
                    ended_at: prior.ended_at,
                    output: prior.output.clone(),
                    error: None,
                    produced_handles: prior.produced_handles.clone(),
                },
            );
            self.emit(
                run,
                LogLevel::Debug,
                Some(id),
                format!("node {id} satisfied from cache"),
            );
        }
    }

    /// Release handles produced by a node's previous execution before it
    /// re-executes; its old output is superseded.
    fn release_superseded(&self, cache: &ExecutionCache, store: &mut HandleStore, id: Uuid) {
        if let Some(prior) = cache.get(id) {
            for &handle_id in &prior.produced_handles {
                store.release(handle_id);
            }
        }
    }

    fn mark_running(&self, run: &mut Run, id: Uuid) {
        if let Some(state) = run.node_states.get_mut(&id) {
            state.status = NodeStatus::Running;
            state.started_at = Some(SystemTime::now());
        }
    }

    fn complete_node(&self, run: &mut Run, id: Uuid, output: NodeOutput, handles: Vec<Uuid>) {
        if let Some(state) = run.node_states.get_mut(&id) {
            state.status = NodeStatus::Completed;
            state.ended_at = Some(SystemTime::now());
            state.output = Some(output);
            state.error = None;
            state.produced_handles = handles;
        }
        self.emit(
            run,
            LogLevel::Debug,
            Some(id),
            format!("node {id} completed"),
        );
    }

    fn fail_node(&self, run: &mut Run, id: Uuid, failure: ScriptFailure) {
        self.emit(
            run,
            LogLevel::Error,
            Some(id),
            format!("node {id} failed: {failure}"),
        );
        if let Some(state) = run.node_states.get_mut(&id) {
            state.status = NodeStatus::Error;
            state.ended_at = Some(SystemTime::now());
            state.output = None;
            state.error = Some(failure);
            state.produced_handles = Vec::new();
        }
    }

    /// Resolve a node's inputs from upstream bags and port defaults.
    ///
    /// Every declared input port must resolve: from the edge targeting it
    /// (exact source port, else `default`, else single entry), else from
    /// the port's declared default value.
    fn resolve_inputs(
        &self,
        graph: &Graph,
        run: &Run,
        node: &Node,
    ) -> Result<BTreeMap<String, Value>, ScriptFailure> {
        let mut inputs = BTreeMap::new();
        for decl in &node.inputs {
            let edge = graph.edges_into(node.id).find(|e| e.to.port == decl.name);
            let value = match edge {
                Some(edge) => run
                    .node_states
                    .get(&edge.from.node_id)
                    .and_then(|s| s.bag())
                    .and_then(|bag| bag.resolve(&edge.from.port))
                    .cloned(),
                None => decl.default_value.clone().map(Value::from_json),
            };
            match value {
                Some(v) => {
                    inputs.insert(decl.name.clone(), v);
                }
                None => {
                    return Err(ScriptFailure::validation(format!(
                        "unresolved input '{}' on node {}",
                        decl.name, node.id
                    )));
                }
            }
        }
        Ok(inputs)
    }

    async fn execute_single(
        &self,
        graph: &Graph,
        id: Uuid,
        run: &mut Run,
        cache: &ExecutionCache,
        store: &mut HandleStore,
    ) -> Result<StepOutcome, EngineError> {
        let Some(node) = graph.node(id) else {
            return Ok(StepOutcome::Continue);
        };

        match &node.kind {
            NodeKind::Input { value } => {
                let port = node
                    .outputs
                    .first()
                    .map(|p| p.name.as_str())
                    .unwrap_or(DEFAULT_PORT);
                let mut bag = OutputBag::new();
                bag.insert(port, Value::from_json(value.clone()));
                self.complete_node(run, id, NodeOutput::Bag(bag), Vec::new());
                Ok(StepOutcome::Continue)
            }
            NodeKind::Script { code } => {
                let inputs = match self.resolve_inputs(graph, run, node) {
                    Ok(inputs) => inputs,
                    Err(failure) => {
                        self.fail_node(run, id, failure);
                        return Ok(StepOutcome::Halt(id));
                    }
                };
                self.release_superseded(cache, store, id);
                self.mark_running(run, id);

                let opts = ExecuteOptions {
                    timeout: self.config.script_timeout,
                };
                let invocation = self.runner.execute(code, &inputs, store, &opts);
                let result = match tokio::time::timeout(opts.timeout, invocation).await {
                    Ok(result) => result?,
                    Err(_) => Err(ScriptFailure::timeout(opts.timeout)),
                };

                match result {
                    Ok(success) => {
                        let ScriptSuccess {
                            outputs,
                            produced_handles,
                        } = success;
                        let bag: OutputBag = outputs.into_iter().collect();
                        self.complete_node(run, id, NodeOutput::Bag(bag), produced_handles);
                        Ok(StepOutcome::Continue)
                    }
                    Err(failure) => {
                        self.fail_node(run, id, failure);
                        Ok(StepOutcome::Halt(id))
                    }
                }
            }
            NodeKind::Output | NodeKind::Viewer => {
                // The incoming value is kept as-is; a handle reference is
                // only dereferenced when a consumer asks (`materialize`).
                match self.resolve_inputs(graph, run, node) {
                    Ok(inputs) => {
                        let mut bag = OutputBag::new();
                        for (port, value) in inputs {
                            bag.insert(&port, value);
                        }
                        self.complete_node(run, id, NodeOutput::Bag(bag), Vec::new());
                        Ok(StepOutcome::Continue)
                    }
                    Err(failure) => {
                        self.fail_node(run, id, failure);
                        Ok(StepOutcome::Halt(id))
                    }
                }
            }
            NodeKind::Subgraph { .. } => {
                let inputs = match self.resolve_inputs(graph, run, node) {
                    Ok(inputs) => inputs,
                    Err(failure) => {
                        self.fail_node(run, id, failure);
                        return Ok(StepOutcome::Halt(id));
                    }
                };
                self.release_superseded(cache, store, id);
                self.mark_running(run, id);
                match self.execute_subgraph(node, &inputs, store).await? {
                    Ok((bag, handles)) => {
                        self.complete_node(run, id, NodeOutput::Bag(bag), handles);
                        Ok(StepOutcome::Continue)
                    }
                    Err(failure) => {
                        self.fail_node(run, id, failure);
                        Ok(StepOutcome::Halt(id))
                    }
                }
            }
        }
    }

    /// Run a nested graph in place of a subgraph node: bound inner inputs
    /// take the outer values, the inner graph runs full with a fresh cache
    /// (the outer cache tracks only the subgraph node itself), and bound
    /// inner outputs become the node's bag.
    async fn execute_subgraph(
        &self,
        node: &Node,
        inputs: &BTreeMap<String, Value>,
        store: &mut HandleStore,
    ) -> Result<Result<(OutputBag, Vec<Uuid>), ScriptFailure>, EngineError> {
        let NodeKind::Subgraph {
            graph,
            input_bindings,
            output_bindings,
        } = &node.kind
        else {
            return Err(EngineError::Runner(format!(
                "node {} is not a subgraph",
                node.id
            )));
        };

        let mut def = graph.clone();
        for (port, inner_id) in input_bindings {
            let Some(value) = inputs.get(port) else {
                continue;
            };
            if let Some(inner) = def.nodes.iter_mut().find(|n| n.id == *inner_id) {
                if let NodeKind::Input { value: slot } = &mut inner.kind {
                    *slot = value.to_json();
                }
            }
        }

        let inner_graph = match Graph::validate(def) {
            Ok(g) => g,
            Err(e) => {
                return Ok(Err(ScriptFailure::validation(format!(
                    "invalid subgraph: {e}"
                ))));
            }
        };

        let mut inner_cache = ExecutionCache::new();
        let inner_run = self
            .drive_boxed(&inner_graph, RunMode::Full, &mut inner_cache, store)
            .await?;

        let produced: Vec<Uuid> = inner_run
            .node_states
            .values()
            .flat_map(|s| s.produced_handles.iter().copied())
            .collect();

        if let Some(failed) = inner_run.halted {
            for &handle_id in &produced {
                store.release(handle_id);
            }
            let message = inner_run
                .node_states
                .get(&failed)
                .and_then(|s| s.error.as_ref())
                .map(|f| f.message.clone())
                .unwrap_or_else(|| "subgraph execution failed".to_string());
            return Ok(Err(ScriptFailure::runtime(format!(
                "subgraph node {failed} failed: {message}"
            ))));
        }

        let mut bag = OutputBag::new();
        for (port, inner_id) in output_bindings {
            match inner_run.output_of(*inner_id) {
                Some(value) => bag.insert(port, value.clone()),
                None => {
                    for &handle_id in &produced {
                        store.release(handle_id);
                    }
                    return Ok(Err(ScriptFailure::validation(format!(
                        "subgraph output '{port}' was not produced"
                    ))));
                }
            }
        }
        Ok(Ok((bag, produced)))
    }

    fn drive_boxed<'a>(
        &'a self,
        graph: &'a Graph,
        mode: RunMode,
        cache: &'a mut ExecutionCache,
        store: &'a mut HandleStore,
    ) -> Pin<Box<dyn Future<Output = Result<Run, EngineError>> + Send + 'a>> {
        Box::pin(self.drive(graph, mode, cache, store))
    }

    /// Dispatch a multi-node chain as a single runner invocation.
    async fn execute_chain(
        &self,
        graph: &Graph,
        chain: &Chain,
        run: &mut Run,
        cache: &ExecutionCache,
        store: &mut HandleStore,
    ) -> Result<StepOutcome, EngineError> {
        let terminal = chain.terminal();

        let mut defs = Vec::with_capacity(chain.nodes.len());
        for &id in &chain.nodes {
            match graph.node(id).map(|n| &n.kind) {
                Some(NodeKind::Script { code }) => defs.push(ChainNodeDef {
                    id,
                    code: code.clone(),
                }),
                _ => {
                    return Err(EngineError::Runner(format!(
                        "chain member {id} is not a script node"
                    )));
                }
            }
        }

        let internal_edges: Vec<ChainEdge> = graph
            .edges()
            .iter()
            .filter(|e| chain.contains(e.from.node_id) && chain.contains(e.to.node_id))
            .map(|e| ChainEdge {
                from: e.from.node_id,
                to: e.to.node_id,
                from_port: e.from.port.clone(),
                to_port: e.to.port.clone(),
            })
            .collect();

        // Values crossing the boundary into the chain, plus port defaults
        // for unconnected inputs. In-chain edges stay the runner's
        // business.
        let mut external_inputs: HashMap<Uuid, BTreeMap<String, Value>> = HashMap::new();
        for &id in &chain.nodes {
            let Some(node) = graph.node(id) else { continue };
            let mut member_inputs = BTreeMap::new();
            for decl in &node.inputs {
                let edge = graph.edges_into(id).find(|e| e.to.port == decl.name);
                match edge {
                    Some(edge) if chain.contains(edge.from.node_id) => {}
                    Some(edge) => {
                        let value = run
                            .node_states
                            .get(&edge.from.node_id)
                            .and_then(|s| s.bag())
                            .and_then(|bag| bag.resolve(&edge.from.port))
                            .cloned();
                        match value {
                            Some(v) => {
                                member_inputs.insert(decl.name.clone(), v);
                            }
                            None => {
                                let failure = ScriptFailure::validation(format!(
                                    "unresolved input '{}' on chain node {id}",
                                    decl.name
                                ));
                                for &member in &chain.nodes {
                                    self.fail_node(run, member, failure.clone());
                                }
                                return Ok(StepOutcome::Halt(id));
                            }
                        }
                    }
                    None => {
                        if let Some(default) = decl.default_value.clone() {
                            member_inputs.insert(decl.name.clone(), Value::from_json(default));
                        }
                    }
                }
            }
            if !member_inputs.is_empty() {
                external_inputs.insert(id, member_inputs);
            }
        }

        for &id in &chain.nodes {
            self.release_superseded(cache, store, id);
            self.mark_running(run, id);
        }
        self.emit(
            run,
            LogLevel::Debug,
            Some(chain.nodes[0]),
            format!("dispatching chain of {} node(s)", chain.nodes.len()),
        );

        let opts = ExecuteOptions {
            timeout: self.config.script_timeout,
        };
        let terminals = [terminal];
        let invocation = self.runner.execute_chain(
            &defs,
            &internal_edges,
            &external_inputs,
            &terminals,
            store,
            &opts,
        );
        let results = match tokio::time::timeout(opts.timeout, invocation).await {
            Ok(results) => results?,
            Err(_) => {
                let failure = ScriptFailure::timeout(opts.timeout);
                for &member in &chain.nodes {
                    self.fail_node(run, member, failure.clone());
                }
                return Ok(StepOutcome::Halt(terminal));
            }
        };

        match results.get(&terminal) {
            Some(Ok(success)) => {
                for &member in &chain.nodes {
                    if member != terminal {
                        self.complete_node(run, member, NodeOutput::KeptInternal, Vec::new());
                    }
                }
                let bag: OutputBag = success
                    .outputs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                self.complete_node(
                    run,
                    terminal,
                    NodeOutput::Bag(bag),
                    success.produced_handles.clone(),
                );
                Ok(StepOutcome::Continue)
            }
            Some(Err(failure)) => {
                for &member in &chain.nodes {
                    self.fail_node(run, member, failure.clone());
                }
                Ok(StepOutcome::Halt(terminal))
            }
            None => Err(EngineError::Runner(
                "runner returned no result for chain terminal".to_string(),
            )),
        }
    }
}

impl<R: ScriptRunner + 'static> Engine<R> {
    /// Start a fire-and-forget run, tracked by id.
    pub fn spawn_full(self: &Arc<Self>, graph: Graph) -> Uuid {
        let run_id = Uuid::new_v4();
        if let Ok(mut detached) = self.detached.lock() {
            detached.insert(run_id, DetachedStatus::Running);
        }
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let status = match engine.run_full(&graph).await {
                Ok(run) => DetachedStatus::Finished(run),
                Err(e) => DetachedStatus::Failed(e.to_string()),
            };
            if let Ok(mut detached) = engine.detached.lock() {
                detached.insert(run_id, status);
            }
        });
        run_id
    }

    pub fn detached_status(&self, run_id: Uuid) -> Option<DetachedStatus> {
        self.detached
            .lock()
            .ok()
            .and_then(|d| d.get(&run_id).cloned())
    }

    /// Remove and return a finished detached run.
    pub fn take_detached(&self, run_id: Uuid) -> Option<DetachedStatus> {
        let mut detached = self.detached.lock().ok()?;
        match detached.get(&run_id) {
            Some(DetachedStatus::Running) | None => None,
            Some(_) => detached.remove(&run_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Edge, GraphDefinition, HandleRef, PortDecl, PortRef, PortType};
    use crate::runner::{OpRunner, ScriptErrorKind, ScriptResult};
    use crate::store::{RawBuffer, StoreOptions};
    use serde_json::json;

    fn number(inputs: &BTreeMap<String, Value>, port: &str) -> f64 {
        inputs
            .get(port)
            .and_then(|v| v.as_data())
            .and_then(|v| v.as_f64())
            .unwrap_or_default()
    }

    fn script(code: &str) -> Node {
        Node::script(code)
            .with_input("in", PortType::Any)
            .with_output("out", PortType::Any)
    }

    fn ops() -> OpRunner {
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
        runner.register("fail", |_, _| Ok(Err(ScriptFailure::runtime("boom"))));
        runner.register("make_blob", |_, store| {
            let handle = store.store(
                Box::new(RawBuffer(vec![1, 2, 3])),
                "raw",
                StoreOptions::default(),
            )?;
            let mut success = ScriptSuccess::with_default(Value::Handle(HandleRef::new(handle.id)));
            success.produced_handles.push(handle.id);
            Ok(Ok(success))
        });
        runner
    }

    /// Input(5) -> double -> describe -> Viewer; double+describe chain.
    fn pipeline() -> (GraphDefinition, Uuid, Uuid, Uuid, Uuid) {
        let mut def = GraphDefinition::new();
        let input = def.add_node(Node::input(json!(5)));
        let double = def.add_node(script("double"));
        let describe = def.add_node(script("describe"));
        let viewer = def.add_node(Node::viewer());
        def.add_edge(Edge::new(
            PortRef::new(input, "default"),
            PortRef::new(double, "in"),
        ));
        def.add_edge(Edge::new(
            PortRef::new(double, "out"),
            PortRef::new(describe, "in"),
        ));
        def.add_edge(Edge::new(
            PortRef::new(describe, "out"),
            PortRef::new(viewer, "default"),
        ));
        (def, input, double, describe, viewer)
    }

    #[tokio::test]
    async fn test_full_run_worked_example() {
        let (def, input, double, describe, viewer) = pipeline();
        let graph = Graph::validate(def).unwrap();
        let engine = Engine::new(ops());

        let run = engine.run_full(&graph).await.unwrap();
        assert!(run.succeeded());
        assert_eq!(run.output_of(viewer), Some(&Value::data(json!("10 units"))));
        assert_eq!(run.node_states[&input].status, NodeStatus::Completed);
        assert_eq!(run.node_states[&describe].status, NodeStatus::Completed);
        // The chain intermediate never surfaces a value.
        assert_eq!(run.node_states[&double].status, NodeStatus::Completed);
        assert_eq!(
            run.node_states[&double].output,
            Some(NodeOutput::KeptInternal)
        );
        // One dispatch for the whole chain.
        assert_eq!(engine.runner().invocations(), 1);
    }

    #[tokio::test]
    async fn test_incremental_second_run_is_idempotent() {
        let (def, ..) = pipeline();
        let graph = Graph::validate(def).unwrap();
        let engine = Engine::new(ops());

        engine.run_full(&graph).await.unwrap();
        let invocations = engine.runner().invocations();
        assert!(engine.stale_nodes(&graph).await.is_empty());

        let run = engine.run_incremental(&graph).await.unwrap();
        assert_eq!(engine.runner().invocations(), invocations);
        for state in run.node_states.values() {
            assert_eq!(state.status, NodeStatus::Cached);
        }
    }

    #[tokio::test]
    async fn test_incremental_after_input_edit_reruns_stale_subset() {
        let (def, input, double, describe, viewer) = pipeline();
        let graph = Graph::validate(def.clone()).unwrap();
        let engine = Engine::new(ops());
        engine.run_full(&graph).await.unwrap();

        let mut def2 = def;
        if let NodeKind::Input { value } = &mut def2.nodes[0].kind {
            *value = json!(7);
        }
        let graph2 = Graph::validate(def2).unwrap();
        assert!(engine.invalidate(input).await);

        let run = engine.run_incremental(&graph2).await.unwrap();
        // Only the chain dispatch hits the runner again.
        assert_eq!(engine.runner().invocations(), 2);
        assert_eq!(run.output_of(viewer), Some(&Value::data(json!("14 units"))));
        assert_eq!(run.node_states[&input].status, NodeStatus::Completed);
        assert_eq!(run.node_states[&double].status, NodeStatus::Completed);
        assert_eq!(run.node_states[&describe].status, NodeStatus::Completed);
    }

    #[tokio::test]
    async fn test_script_failure_halts_and_keeps_partial_results() {
        let mut def = GraphDefinition::new();
        let input = def.add_node(Node::input(json!(5)));
        let double = def.add_node(script("double"));
        let viewer_a = def.add_node(Node::viewer());
        let failing = def.add_node(script("fail"));
        let viewer_b = def.add_node(Node::viewer());
        def.add_edge(Edge::new(
            PortRef::new(input, "default"),
            PortRef::new(double, "in"),
        ));
        def.add_edge(Edge::new(
            PortRef::new(double, "out"),
            PortRef::new(viewer_a, "default"),
        ));
        def.add_edge(Edge::new(
            PortRef::new(input, "default"),
            PortRef::new(failing, "in"),
        ));
        def.add_edge(Edge::new(
            PortRef::new(failing, "out"),
            PortRef::new(viewer_b, "default"),
        ));
        let graph = Graph::validate(def).unwrap();
        let engine = Engine::new(ops());

        let run = engine.run_full(&graph).await.unwrap();
        assert_eq!(run.halted, Some(failing));
        assert!(!run.succeeded());
        assert_eq!(run.node_states[&viewer_a].status, NodeStatus::Completed);
        assert_eq!(run.node_states[&failing].status, NodeStatus::Error);
        assert_eq!(run.node_states[&viewer_b].status, NodeStatus::Pending);

        // A later incremental run only needs the failed subset.
        let stale = engine.stale_nodes(&graph).await;
        assert_eq!(
            stale,
            HashSet::from([failing, viewer_b]),
            "completed nodes keep their last good output"
        );
    }

    #[tokio::test]
    async fn test_chain_failure_marks_all_members() {
        let mut def = GraphDefinition::new();
        let input = def.add_node(Node::input(json!(5)));
        let failing = def.add_node(script("fail"));
        let describe = def.add_node(script("describe"));
        let viewer = def.add_node(Node::viewer());
        def.add_edge(Edge::new(
            PortRef::new(input, "default"),
            PortRef::new(failing, "in"),
        ));
        def.add_edge(Edge::new(
            PortRef::new(failing, "out"),
            PortRef::new(describe, "in"),
        ));
        def.add_edge(Edge::new(
            PortRef::new(describe, "out"),
            PortRef::new(viewer, "default"),
        ));
        let graph = Graph::validate(def).unwrap();
        let engine = Engine::new(ops());

        let run = engine.run_full(&graph).await.unwrap();
        assert_eq!(run.node_states[&failing].status, NodeStatus::Error);
        assert_eq!(run.node_states[&describe].status, NodeStatus::Error);
        assert_eq!(run.node_states[&viewer].status, NodeStatus::Pending);
        assert!(run.halted.is_some());
    }

    #[tokio::test]
    async fn test_unresolved_input_is_validation_failure() {
        let mut def = GraphDefinition::new();
        let viewer = def.add_node(Node::viewer());
        let graph = Graph::validate(def).unwrap();
        let engine = Engine::new(ops());

        let run = engine.run_full(&graph).await.unwrap();
        assert_eq!(run.halted, Some(viewer));
        let failure = run.node_states[&viewer].error.as_ref().unwrap();
        assert_eq!(failure.kind, ScriptErrorKind::ValidationFailed);
        assert!(failure.message.contains("unresolved input"));
    }

    #[tokio::test]
    async fn test_port_default_value_feeds_unconnected_input() {
        let mut def = GraphDefinition::new();
        let double = def.add_node(
            Node::script("double")
                .with_input_decl(PortDecl::new("in", PortType::Number).with_default(json!(21)))
                .with_output("out", PortType::Number),
        );
        let graph = Graph::validate(def).unwrap();
        let engine = Engine::new(ops());

        let run = engine.run_full(&graph).await.unwrap();
        assert!(run.succeeded());
        assert_eq!(run.output_of(double), Some(&Value::data(json!(42.0))));
    }

    #[tokio::test]
    async fn test_handle_flow_supersession_and_lazy_materialize() {
        let mut def = GraphDefinition::new();
        let blob = def.add_node(Node::script("make_blob").with_output("out", PortType::Handle));
        let viewer = def.add_node(Node::viewer());
        def.add_edge(Edge::new(
            PortRef::new(blob, "out"),
            PortRef::new(viewer, "default"),
        ));
        let graph = Graph::validate(def).unwrap();
        let engine = Engine::new(ops());

        let run = engine.run_full(&graph).await.unwrap();
        let first = run.output_of(viewer).cloned().unwrap();
        let first_ref = first.as_handle().expect("viewer should hold a handle ref");
        assert_eq!(
            engine.materialize(&first).await.unwrap(),
            Some(json!("010203"))
        );

        // Re-running the producer supersedes its previous handle.
        assert!(engine.invalidate(blob).await);
        let run2 = engine.run_incremental(&graph).await.unwrap();
        let second = run2.output_of(viewer).cloned().unwrap();
        assert_ne!(second.as_handle(), Some(first_ref));
        assert_eq!(engine.materialize(&first).await.unwrap(), None);
        assert_eq!(
            engine.materialize(&second).await.unwrap(),
            Some(json!("010203"))
        );
    }

    #[tokio::test]
    async fn test_store_exhaustion_is_run_level_error() {
        let mut def = GraphDefinition::new();
        def.add_node(Node::script("make_blob").with_output("out", PortType::Handle));
        let graph = Graph::validate(def).unwrap();
        let engine = Engine::with_config(
            ops(),
            EngineConfig {
                handle_budget_bytes: 2,
                ..Default::default()
            },
        );

        let err = engine.run_full(&graph).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
    }

    #[tokio::test]
    async fn test_subgraph_binds_inputs_and_outputs() {
        let mut inner = GraphDefinition::new();
        let i_in = inner.add_node(Node::input(json!(0)));
        let i_double = inner.add_node(script("double"));
        let i_out = inner.add_node(Node::output());
        inner.add_edge(Edge::new(
            PortRef::new(i_in, "default"),
            PortRef::new(i_double, "in"),
        ));
        inner.add_edge(Edge::new(
            PortRef::new(i_double, "out"),
            PortRef::new(i_out, "default"),
        ));

        let mut def = GraphDefinition::new();
        let outer_in = def.add_node(Node::input(json!(5)));
        let sub = def.add_node(
            Node::subgraph(
                inner,
                BTreeMap::from([("x".to_string(), i_in)]),
                BTreeMap::from([("default".to_string(), i_out)]),
            )
            .with_input("x", PortType::Number)
            .with_output("default", PortType::Number),
        );
        let viewer = def.add_node(Node::viewer());
        def.add_edge(Edge::new(
            PortRef::new(outer_in, "default"),
            PortRef::new(sub, "x"),
        ));
        def.add_edge(Edge::new(
            PortRef::new(sub, "default"),
            PortRef::new(viewer, "default"),
        ));
        let graph = Graph::validate(def).unwrap();
        let engine = Engine::new(ops());

        let run = engine.run_full(&graph).await.unwrap();
        assert!(run.succeeded());
        assert_eq!(run.output_of(viewer), Some(&Value::data(json!(10.0))));
    }

    #[tokio::test]
    async fn test_event_sink_receives_ordered_events() {
        let (def, ..) = pipeline();
        let graph = Graph::validate(def).unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let engine = Engine::new(ops()).with_event_sink(move |ev| {
            if let Ok(mut seen) = sink_seen.lock() {
                seen.push(ev.message.clone());
            }
        });

        let run = engine.run_full(&graph).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), run.logs.len());
        assert!(seen[0].contains("started"));
        assert!(seen[seen.len() - 1].contains("finished"));
    }

    /// Runner that sleeps before answering; used for timeout and
    /// cancellation tests.
    struct SlowRunner {
        delay: Duration,
    }

    impl ScriptRunner for SlowRunner {
        async fn execute(
            &self,
            _code: &str,
            _inputs: &BTreeMap<String, Value>,
            _store: &mut HandleStore,
            _opts: &ExecuteOptions,
        ) -> Result<ScriptResult, EngineError> {
            tokio::time::sleep(self.delay).await;
            Ok(Ok(ScriptSuccess::with_default(Value::data(json!("done")))))
        }

        async fn execute_chain(
            &self,
            _defs: &[ChainNodeDef],
            _edges: &[ChainEdge],
            _external_inputs: &HashMap<Uuid, BTreeMap<String, Value>>,
            _terminals: &[Uuid],
            _store: &mut HandleStore,
            _opts: &ExecuteOptions,
        ) -> Result<HashMap<Uuid, ScriptResult>, EngineError> {
            Err(EngineError::Runner("chain dispatch not supported".to_string()))
        }
    }

    #[tokio::test]
    async fn test_timeout_marks_node_error() {
        let mut def = GraphDefinition::new();
        let slow = def.add_node(Node::script("slow"));
        let graph = Graph::validate(def).unwrap();
        let engine = Engine::with_config(
            SlowRunner {
                delay: Duration::from_millis(100),
            },
            EngineConfig {
                script_timeout: Duration::from_millis(5),
                ..Default::default()
            },
        );

        let run = engine.run_full(&graph).await.unwrap();
        assert_eq!(run.halted, Some(slow));
        let failure = run.node_states[&slow].error.as_ref().unwrap();
        assert_eq!(failure.kind, ScriptErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_cancellation_between_steps() {
        // Source-only slow scripts: no input ports, so each step reaches
        // the runner and the cancel check between steps is what stops s2.
        let mut def = GraphDefinition::new();
        let s1 = def.add_node(Node::script("slow").with_output("out", PortType::Any));
        let v1 = def.add_node(Node::viewer());
        let s2 = def.add_node(Node::script("slow").with_output("out", PortType::Any));
        let v2 = def.add_node(Node::viewer());
        def.add_edge(Edge::new(
            PortRef::new(s1, "out"),
            PortRef::new(v1, "default"),
        ));
        def.add_edge(Edge::new(
            PortRef::new(s2, "out"),
            PortRef::new(v2, "default"),
        ));
        let graph = Graph::validate(def).unwrap();
        let engine = Arc::new(Engine::new(SlowRunner {
            delay: Duration::from_millis(50),
        }));

        let run_id = engine.spawn_full(graph);
        tokio::time::sleep(Duration::from_millis(10)).await;
        engine.request_cancel();

        let mut finished = None;
        for _ in 0..200 {
            match engine.detached_status(run_id) {
                Some(DetachedStatus::Running) => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                other => {
                    finished = other;
                    break;
                }
            }
        }
        let Some(DetachedStatus::Finished(run)) = finished else {
            panic!("detached run did not finish: {finished:?}");
        };
        assert!(run.cancelled);
        assert_eq!(run.node_states[&s1].status, NodeStatus::Completed);
        assert_eq!(run.node_states[&s2].status, NodeStatus::Pending);
        // A finished detached run can be taken exactly once.
        assert!(engine.take_detached(run_id).is_some());
        assert!(engine.take_detached(run_id).is_none());
    }
}
