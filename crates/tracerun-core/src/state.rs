//! Per-run execution state shared across the nodes of one DAG run.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Node outputs in insertion (= execution) order.
///
/// Iteration order is deterministic, which replay relies on; lookups are
/// linear, which is fine for graphs of tens of nodes.
#[derive(Debug, Clone, Default)]
pub struct OutputMap {
    entries: Vec<(String, Value)>,
}

impl OutputMap {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Record a node's output. Each node is scheduled at most once per run,
    /// so a repeated key replaces the previous value rather than duplicating.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(slot) = self.entries.iter_mut().find(|(key, _)| key == &name) {
            slot.1 = value;
        } else {
            self.entries.push((name, value));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .iter()
            .map(|(key, value)| (key.as_str(), value))
    }

    /// The outputs as a JSON object keyed by node name.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.entries {
            map.insert(key.clone(), value.clone());
        }
        Value::Object(map)
    }
}

/// State handed to the wrapper for every node of a run.
///
/// The kernel owns exactly one of these per run and never shares it across
/// workers; nodes see only their resolved input value, never the state
/// itself.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    /// The payload submitted with the task, shaped for the entry node.
    pub initial_input: Value,
    pub node_outputs: OutputMap,
    /// Parsed-context payload carried for downstream nodes; the kernel never
    /// interprets it.
    pub context: Option<Value>,
    pub trace_id: String,
    pub is_replay: bool,
    pub replay_map: HashMap<String, Value>,
}

impl ExecutionState {
    pub fn new(initial_input: Value, trace_id: impl Into<String>) -> Self {
        Self {
            initial_input,
            node_outputs: OutputMap::default(),
            context: None,
            trace_id: trace_id.into(),
            is_replay: false,
            replay_map: HashMap::new(),
        }
    }

    /// State for a replay run. `is_replay` is only set when there is at
    /// least one stored output to short-circuit with; a re-executing replay
    /// carries an empty map and runs every node live.
    pub fn for_replay(
        initial_input: Value,
        trace_id: impl Into<String>,
        replay_map: HashMap<String, Value>,
    ) -> Self {
        let is_replay = !replay_map.is_empty();
        Self {
            initial_input,
            node_outputs: OutputMap::default(),
            context: None,
            trace_id: trace_id.into(),
            is_replay,
            replay_map,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }
}
