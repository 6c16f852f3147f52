//! Built-in nodes and the default task graph.
//!
//! The default graph is the three-stage `retriever -> llm -> executor`
//! pipeline. The llm stage talks to a [`TextGenerator`] behind a trait
//! object, so inference back-ends plug in without the kernel knowing.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::EngineError;
use crate::graph::{FlowGraph, GraphBuilder};
use crate::node::{NodeHandler, NodeRegistry, NodeSpec};
use crate::schema::{FieldType, Schema};

/// Task name the default graph is registered under.
pub const DEFAULT_TASK: &str = "default";

/// Opaque text inference back-end.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Deterministic generator used when no real back-end is wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoGenerator;

#[async_trait]
impl TextGenerator for EchoGenerator {
    async fn generate(&self, prompt: &str) -> anyhow::Result<String> {
        Ok(format!("Response to: {prompt}"))
    }
}

struct RetrieverNode;

#[async_trait]
impl NodeHandler for RetrieverNode {
    async fn call(&self, input: Value) -> anyhow::Result<Value> {
        let query = input["query"].as_str().unwrap_or_default();
        Ok(json!({
            "documents": [format!("Document for: {query}")],
            "prompt": query,
        }))
    }
}

struct LlmNode {
    generator: Arc<dyn TextGenerator>,
}

#[async_trait]
impl NodeHandler for LlmNode {
    async fn call(&self, input: Value) -> anyhow::Result<Value> {
        let prompt = input["prompt"].as_str().unwrap_or_default();
        let response = self.generator.generate(prompt).await?;
        Ok(json!({
            "response": response,
            "action": prompt,
        }))
    }
}

struct ExecutorNode;

#[async_trait]
impl NodeHandler for ExecutorNode {
    async fn call(&self, input: Value) -> anyhow::Result<Value> {
        let action = input["action"].as_str().unwrap_or_default();
        Ok(json!({
            "result": format!("Executed: {action}"),
        }))
    }
}

/// Register the built-in nodes. Call once at startup, before any graph is
/// built over them.
pub fn install_default_nodes(
    registry: &NodeRegistry,
    generator: Arc<dyn TextGenerator>,
) -> Result<(), EngineError> {
    registry.register(
        NodeSpec::new("retriever", "1.0.0", Arc::new(RetrieverNode))
            .with_tags(["core", "retrieval"])
            .with_input_schema(Schema::input().field("query", FieldType::String))
            .with_output_schema(
                Schema::output()
                    .field("documents", FieldType::List)
                    .field("prompt", FieldType::String),
            ),
    )?;

    registry.register(
        NodeSpec::new("llm", "1.0.0", Arc::new(LlmNode { generator }))
            .with_tags(["core", "inference"])
            .with_upstream("retriever")
            .with_input_schema(Schema::input().field("prompt", FieldType::String))
            .with_output_schema(
                Schema::output()
                    .field("response", FieldType::String)
                    .field("action", FieldType::String),
            ),
    )?;

    registry.register(
        NodeSpec::new("executor", "1.0.0", Arc::new(ExecutorNode))
            .with_tags(["core", "execution"])
            .with_upstream("llm")
            .with_input_schema(Schema::input().field("action", FieldType::String))
            .with_output_schema(Schema::output().field("result", FieldType::String)),
    )?;

    Ok(())
}

/// Build the default three-node linear graph over the registry.
pub fn default_graph(registry: &NodeRegistry) -> Result<FlowGraph, EngineError> {
    GraphBuilder::new(DEFAULT_TASK)
        .add_node("retriever")
        .add_node("llm")
        .add_node("executor")
        .add_edge("retriever", "llm")
        .add_edge("llm", "executor")
        .set_entry("retriever")
        .build(registry)
}
