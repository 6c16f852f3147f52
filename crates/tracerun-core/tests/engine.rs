use std::sync::Arc;

use serde_json::{Value, json};
use tracerun_core::{
    DEFAULT_TASK, EchoGenerator, ExecStatus, ExecutionState, JsonlSink, Kernel, NodeRegistry,
    ReplayManager, ReplayMode, RunOptions, RunReport, SinkSet, TraceReader, TraceStore,
    TraceWriter, default_graph, install_default_nodes,
};

fn engine() -> (Kernel, tracerun_core::FlowGraph) {
    let registry = Arc::new(NodeRegistry::new());
    install_default_nodes(&registry, Arc::new(EchoGenerator)).expect("default nodes register");
    let graph = default_graph(&registry).expect("default graph builds");
    (Kernel::new(registry, SinkSet::empty()), graph)
}

async fn run_default(store: &TraceStore, input: Value) -> RunReport {
    let (kernel, graph) = engine();
    let mut writer = TraceWriter::new(store.clone(), true);
    let trace_id = writer.init_trace(DEFAULT_TASK, None).expect("trace opens");
    let state = ExecutionState::new(input, trace_id);
    kernel
        .run(&graph, state, &mut writer, RunOptions::default())
        .await
        .expect("run returns a report")
}

#[tokio::test]
async fn happy_path_runs_three_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let store = TraceStore::new(dir.path(), false);

    let report = run_default(&store, json!({"query": "hi"})).await;
    assert!(report.status.is_completed());
    assert_eq!(report.dag_output["executor"]["result"], "Executed: hi");
    assert_eq!(report.record.executed_nodes.len(), 3);

    let names: Vec<&str> = report
        .record
        .executed_nodes
        .iter()
        .map(|entry| entry.node_name.as_str())
        .collect();
    assert_eq!(names, vec!["retriever", "llm", "executor"]);

    // Every consecutive pair follows a graph edge.
    let (_, graph) = engine();
    for pair in names.windows(2) {
        assert!(graph.has_edge(pair[0], pair[1]), "no edge {pair:?}");
    }

    // Content hashes are present and recomputable.
    for entry in &report.record.executed_nodes {
        assert_eq!(entry.status, ExecStatus::Success);
        assert_eq!(
            entry.input_hash.as_deref(),
            Some(tracerun_core::content_hash(&entry.input).as_str())
        );
        assert_eq!(
            entry.output_hash.as_deref(),
            Some(tracerun_core::content_hash(entry.output.as_ref().unwrap()).as_str())
        );
    }
}

#[tokio::test]
async fn replay_reproduces_outputs_byte_equal() {
    let dir = tempfile::tempdir().unwrap();
    let store = TraceStore::new(dir.path(), false);

    let original = run_default(&store, json!({"query": "hi"})).await;
    assert!(original.status.is_completed());

    let manager = ReplayManager::new(
        TraceReader::new(store.clone()),
        ReplayMode::ShortCircuit,
    );
    let plan = manager.plan(&original.trace_id, "test").unwrap();

    let (kernel, graph) = engine();
    let mut writer = TraceWriter::new(store.clone(), true);
    let new_id = writer.init_trace(&plan.task_name, None).unwrap();
    writer.set_replay_info(plan.replay_info.clone()).unwrap();
    let state = plan.state(new_id.clone());
    let options = RunOptions {
        replay_order: Some(plan.replay_order.clone()),
        ..RunOptions::default()
    };
    let replayed = kernel.run(&graph, state, &mut writer, options).await.unwrap();

    assert!(replayed.status.is_completed());
    assert_ne!(replayed.trace_id, original.trace_id);
    assert_eq!(replayed.dag_output, original.dag_output);
    assert_eq!(
        replayed.record.replay_info.source_trace_id.as_deref(),
        Some(original.trace_id.as_str())
    );

    assert_eq!(
        replayed.record.executed_nodes.len(),
        original.record.executed_nodes.len()
    );
    for (new_entry, old_entry) in replayed
        .record
        .executed_nodes
        .iter()
        .zip(original.record.executed_nodes.iter())
    {
        assert_eq!(new_entry.status, ExecStatus::SkippedReplay);
        assert_eq!(new_entry.output_hash, old_entry.output_hash);
        assert_eq!(new_entry.output, old_entry.output);
    }
}

#[tokio::test]
async fn partial_replay_executes_missing_nodes_live() {
    let dir = tempfile::tempdir().unwrap();
    let store = TraceStore::new(dir.path(), false);

    let original = run_default(&store, json!({"query": "hi"})).await;
    let manager = ReplayManager::new(
        TraceReader::new(store.clone()),
        ReplayMode::ShortCircuit,
    );
    let mut plan = manager.plan(&original.trace_id, "test").unwrap();
    // Drop the executor's stored output: it must run for real.
    plan.replay_map.remove("executor");

    let (kernel, graph) = engine();
    let mut writer = TraceWriter::new(store.clone(), true);
    let new_id = writer.init_trace(&plan.task_name, None).unwrap();
    let state = plan.state(new_id);
    let options = RunOptions {
        replay_order: Some(plan.replay_order.clone()),
        ..RunOptions::default()
    };
    let replayed = kernel.run(&graph, state, &mut writer, options).await.unwrap();

    assert!(replayed.status.is_completed());
    let statuses: Vec<ExecStatus> = replayed
        .record
        .executed_nodes
        .iter()
        .map(|entry| entry.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            ExecStatus::SkippedReplay,
            ExecStatus::SkippedReplay,
            ExecStatus::Success
        ]
    );
    assert_eq!(replayed.dag_output["executor"]["result"], "Executed: hi");
}

#[tokio::test]
async fn re_execute_mode_runs_every_node() {
    let dir = tempfile::tempdir().unwrap();
    let store = TraceStore::new(dir.path(), false);

    let original = run_default(&store, json!({"query": "hi"})).await;
    let manager = ReplayManager::new(TraceReader::new(store.clone()), ReplayMode::ReExecute);
    let plan = manager.plan(&original.trace_id, "test").unwrap();
    assert!(plan.replay_map.is_empty());

    let (kernel, graph) = engine();
    let mut writer = TraceWriter::new(store.clone(), true);
    let new_id = writer.init_trace(&plan.task_name, None).unwrap();
    let state = plan.state(new_id);
    let replayed = kernel
        .run(&graph, state, &mut writer, RunOptions::default())
        .await
        .unwrap();

    assert!(replayed.status.is_completed());
    for entry in &replayed.record.executed_nodes {
        assert_eq!(entry.status, ExecStatus::Success);
    }
    assert_eq!(replayed.dag_output["executor"]["result"], "Executed: hi");
}

#[tokio::test]
async fn validation_failure_stops_the_dag_at_the_first_node() {
    let dir = tempfile::tempdir().unwrap();
    let store = TraceStore::new(dir.path(), false);

    let report = run_default(&store, json!({"query": 123})).await;
    assert!(!report.status.is_completed());
    assert_eq!(report.record.executed_nodes.len(), 1);
    assert_eq!(
        report.record.executed_nodes[0].status,
        ExecStatus::ValidationError
    );
    assert!(report.record.is_finalized());
    assert!(report.dag_output.as_object().unwrap().is_empty());
}

#[tokio::test]
async fn runs_share_a_sink_without_losing_events() {
    let dir = tempfile::tempdir().unwrap();
    let store = TraceStore::new(dir.path(), false);
    let sink_path = dir.path().join("events.jsonl");
    let sinks = SinkSet::new(vec![Arc::new(JsonlSink::open(&sink_path).unwrap())]);

    let registry = Arc::new(NodeRegistry::new());
    install_default_nodes(&registry, Arc::new(EchoGenerator)).unwrap();
    let graph = default_graph(&registry).unwrap();
    let kernel = Kernel::new(registry, sinks.clone());

    for idx in 0..3 {
        let mut writer = TraceWriter::new(store.clone(), true);
        let trace_id = writer.init_trace(DEFAULT_TASK, None).unwrap();
        let state = ExecutionState::new(json!({"query": format!("q{idx}")}), trace_id);
        let report = kernel
            .run(&graph, state, &mut writer, RunOptions::default())
            .await
            .unwrap();
        assert!(report.status.is_completed());
    }
    sinks.close();

    let raw = std::fs::read_to_string(&sink_path).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 9);
    for line in lines {
        let event: tracerun_core::TraceEvent = serde_json::from_str(line).unwrap();
        assert!(!event.span_id.is_empty());
    }
}

#[tokio::test]
async fn trace_ids_are_unique_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let store = TraceStore::new(dir.path(), false);

    let mut seen = std::collections::HashSet::new();
    for _ in 0..5 {
        let report = run_default(&store, json!({"query": "hi"})).await;
        assert!(seen.insert(report.trace_id.clone()), "duplicate trace id");
    }
}
