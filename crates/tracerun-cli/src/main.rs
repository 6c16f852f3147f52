use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Runtime;
use tracerun_core::{
    ConfigLoader, DEFAULT_TASK, EchoGenerator, EngineConfig, ExecutionState, Kernel, NodeExecution,
    NodeRegistry, ReplayManager, RunOptions, RunReport, SinkSet, TraceReader, TraceRecord,
    TraceStore, TraceWriter, default_graph, install_default_nodes,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tracerun", version, about = "TraceRun DAG engine interface")]
struct Cli {
    /// Path to a tracerun.toml config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Execute a task against the built-in graph and wait for the result.
    Run(RunArgs),
    /// Render a stored trace record.
    Show(ShowArgs),
    /// Re-run a stored trace under a new trace id.
    Replay(ReplayArgs),
    /// List the registered nodes.
    Nodes(NodesArgs),
}

#[derive(Copy, Clone, Debug, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

trait RenderText {
    fn render_text(&self) -> String;
}

#[derive(Serialize)]
struct RunPayload {
    trace_id: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    dag_output: Value,
}

impl RunPayload {
    fn from_report(report: &RunReport) -> Self {
        Self {
            trace_id: report.trace_id.clone(),
            status: if report.status.is_completed() {
                "completed".to_string()
            } else {
                "failed".to_string()
            },
            error: report.status.error_message().map(str::to_string),
            dag_output: report.dag_output.clone(),
        }
    }
}

impl RenderText for RunPayload {
    fn render_text(&self) -> String {
        let mut sections = vec![
            format!("trace: {}", self.trace_id),
            format!("status: {}", self.status),
        ];
        if let Some(error) = &self.error {
            sections.push(format!("error: {error}"));
        }
        if let Ok(rendered) = serde_json::to_string_pretty(&self.dag_output) {
            sections.push(format!("output:\n{rendered}"));
        }
        sections.join("\n")
    }
}

#[derive(Serialize)]
struct TracePayload {
    record: TraceRecord,
}

impl RenderText for TracePayload {
    fn render_text(&self) -> String {
        let record = &self.record;
        let mut output = String::new();
        let _ = writeln!(output, "trace: {}", record.trace_id);
        let _ = writeln!(output, "task: {}", record.task_name);
        let _ = writeln!(
            output,
            "status: {}",
            if record.is_finalized() {
                "finalized"
            } else {
                "in-progress"
            }
        );
        let _ = writeln!(output, "started: {}", record.start_time.to_rfc3339());
        if let Some(end) = record.end_time {
            let _ = writeln!(output, "ended: {}", end.to_rfc3339());
        }
        if let Some(duration) = record.duration_ms() {
            let _ = writeln!(output, "duration: {duration}ms");
        }
        if let Some(source) = &record.replay_info.source_trace_id {
            let _ = writeln!(
                output,
                "replayed from: {source} (count {})",
                record.replay_info.replay_count
            );
        }
        let _ = writeln!(output, "nodes:");
        for entry in &record.executed_nodes {
            output.push_str(&render_node(entry));
        }
        output
    }
}

fn render_node(entry: &NodeExecution) -> String {
    let mut line = format!(
        "  {} v{} [{}] {}ms",
        entry.node_name, entry.version, entry.status, entry.runtime_ms
    );
    if let Some(hash) = &entry.output_hash {
        let _ = write!(line, " out={}", &hash[..hash.len().min(12)]);
    }
    if let Some(error) = &entry.error_message {
        let _ = write!(line, " error={error}");
    }
    line.push('\n');
    line
}

#[derive(Serialize)]
struct NodesPayload {
    nodes: Vec<String>,
}

impl RenderText for NodesPayload {
    fn render_text(&self) -> String {
        self.nodes.join("\n")
    }
}

fn emit_output<T>(format: OutputFormat, payload: &T) -> Result<()>
where
    T: RenderText + Serialize,
{
    match format {
        OutputFormat::Text => {
            println!("{}", payload.render_text());
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(payload)?);
        }
    }
    Ok(())
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Input payload for the entry node, as a JSON object.
    #[arg(value_name = "INPUT_JSON")]
    input: String,

    /// Task graph to run.
    #[arg(long, default_value = DEFAULT_TASK)]
    task: String,

    /// Per-run deadline in milliseconds (overrides the config).
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Output format (text or JSON).
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Args, Debug)]
struct ShowArgs {
    /// Trace ID to render.
    #[arg(value_name = "TRACE_ID")]
    trace_id: String,

    /// Output format (text or JSON).
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// Trace ID to replay.
    #[arg(value_name = "TRACE_ID")]
    trace_id: String,

    /// Re-run every node body instead of short-circuiting.
    #[arg(long)]
    re_execute: bool,

    /// Output format (text or JSON).
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Args, Debug)]
struct NodesArgs {
    /// Output format (text or JSON).
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

struct Engine {
    kernel: Kernel,
    graph: tracerun_core::FlowGraph,
    store: TraceStore,
    sinks: SinkSet,
    config: EngineConfig,
}

impl Engine {
    fn bootstrap(config: EngineConfig) -> Result<Self> {
        let registry = Arc::new(NodeRegistry::new());
        install_default_nodes(&registry, Arc::new(EchoGenerator))?;
        let graph = default_graph(&registry)?;
        let sinks = SinkSet::from_config(&config.tracing);
        let store = TraceStore::from_config(&config.storage);
        Ok(Self {
            kernel: Kernel::new(registry, sinks.clone()),
            graph,
            store,
            sinks,
            config,
        })
    }

    async fn run_task(&self, task: &str, input: Value, deadline_ms: Option<u64>) -> Result<RunReport> {
        anyhow::ensure!(task == self.graph.name(), "task '{task}' not found");

        let mut writer = TraceWriter::new(self.store.clone(), self.config.tracing.capture_io);
        let trace_id = writer.init_trace(task, None)?;
        let state = ExecutionState::new(input, trace_id);

        let deadline = deadline_ms
            .or((self.config.engine.deadline_ms > 0).then_some(self.config.engine.deadline_ms))
            .map(std::time::Duration::from_millis);
        let options = RunOptions {
            deadline,
            ..RunOptions::default()
        };
        let report = self.kernel.run(&self.graph, state, &mut writer, options).await?;
        Ok(report)
    }
}

async fn run_command(config: EngineConfig, args: RunArgs) -> Result<()> {
    let input: Value = serde_json::from_str(&args.input)
        .with_context(|| "INPUT_JSON must be a valid JSON document")?;
    let engine = Engine::bootstrap(config)?;
    let report = engine.run_task(&args.task, input, args.deadline_ms).await?;
    engine.sinks.close();
    emit_output(args.format, &RunPayload::from_report(&report))
}

async fn show_command(config: EngineConfig, args: ShowArgs) -> Result<()> {
    let reader = TraceReader::new(TraceStore::from_config(&config.storage));
    let record = reader.load(&args.trace_id)?;
    emit_output(args.format, &TracePayload { record })
}

async fn replay_command(config: EngineConfig, args: ReplayArgs) -> Result<()> {
    let mode = if args.re_execute {
        tracerun_core::ReplayMode::ReExecute
    } else {
        config.engine.replay_mode
    };

    let engine = Engine::bootstrap(config)?;
    let manager = ReplayManager::new(TraceReader::new(engine.store.clone()), mode);
    let plan = manager.plan(&args.trace_id, "cli")?;

    let mut writer = TraceWriter::new(engine.store.clone(), engine.config.tracing.capture_io);
    let trace_id = writer.init_trace(&plan.task_name, None)?;
    writer.set_replay_info(plan.replay_info.clone())?;
    let state = plan.state(trace_id);

    let options = RunOptions {
        replay_order: (!plan.replay_map.is_empty()).then(|| plan.replay_order.clone()),
        ..RunOptions::default()
    };
    let report = engine
        .kernel
        .run(&engine.graph, state, &mut writer, options)
        .await?;
    engine.sinks.close();
    emit_output(args.format, &RunPayload::from_report(&report))
}

fn nodes_command(args: NodesArgs) -> Result<()> {
    let registry = NodeRegistry::new();
    install_default_nodes(&registry, Arc::new(EchoGenerator))?;
    emit_output(
        args.format,
        &NodesPayload {
            nodes: registry.names(),
        },
    )
}

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,tracerun_core=info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.clone())?;

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Run(args) => run_command(config, args).await?,
            Command::Show(args) => show_command(config, args).await?,
            Command::Replay(args) => replay_command(config, args).await?,
            Command::Nodes(args) => nodes_command(args)?,
        }
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}
