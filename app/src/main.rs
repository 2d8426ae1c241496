use anyhow::{Context, Result};
use engine::coordinator::Engine;
use engine::model::{Graph, GraphDefinition, NodeKind};

mod ops;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let path = std::env::args()
        .nth(1)
        .context("usage: app <graph.json>")?;
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    let def: GraphDefinition = serde_json::from_str(&text).context("parsing graph definition")?;
    let graph = Graph::validate(def)?;
    log::info!("loaded graph with {} node(s)", graph.nodes().len());

    let engine = Engine::new(ops::builtin_runner());
    let run = engine.run_full(&graph).await?;

    for node in graph.nodes() {
        if !matches!(node.kind, NodeKind::Viewer | NodeKind::Output) {
            continue;
        }
        match run.output_of(node.id) {
            Some(value) => match engine.materialize(value).await? {
                Some(v) => println!("{}: {v}", node.id),
                None => println!("{}: <released handle>", node.id),
            },
            None => println!("{}: <no output>", node.id),
        }
    }

    if let Some(halted) = run.halted {
        let message = run
            .node_states
            .get(&halted)
            .and_then(|s| s.error.as_ref())
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown failure".to_string());
        anyhow::bail!("run halted at node {halted}: {message}");
    }
    Ok(())
}
