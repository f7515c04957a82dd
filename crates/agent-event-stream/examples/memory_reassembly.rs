//! Runs a registered agent against the memory consumer and prints the
//! reassembled messages.
//!
//! cargo run -p agent-event-stream --example memory_reassembly

use std::sync::Arc;

use agent_event_stream::prelude::*;
use agent_event_stream::{emit, init_observability};
use serde_json::{Value, json};
use uuid::Uuid;

/// Answers with a shuffled chunk order and one tool call.
struct Weather;

#[async_trait::async_trait]
impl Agent for Weather {
    async fn run(&self, input: Value) -> Result<Value, AgentError> {
        let city = input.get("city").and_then(Value::as_str).unwrap_or("Lisbon");

        let lookup = Uuid::new_v4();
        emit(
            ExecutionRecord::new(lookup, 0, Role::Assistant)
                .with_reasoning("need current conditions")
                .with_tool_call(ToolCall::from_value("weather", json!({ "city": city }))),
        )
        .await?;
        emit(ExecutionRecord::new(lookup, 1, Role::Assistant).terminal()).await?;

        let answer = Uuid::new_v4();
        let chunks = [(2, "and 21°C."), (0, "It is "), (1, "sunny ")];
        for (index, text) in chunks {
            emit(ExecutionRecord::new(answer, index, Role::Assistant).with_content(text)).await?;
        }
        emit(ExecutionRecord::new(answer, 3, Role::Assistant).terminal()).await?;
        Ok(json!({ "city": city }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_observability();

    let consumer = Arc::new(MemoryConsumer::default());
    let mut registry = AgentRegistry::new();
    registry.register("weather", || Ok(Box::new(Weather) as Box<dyn Agent>))?;
    let runner = AgentRunner::new(registry, consumer.clone());

    let run_id = Uuid::new_v4().to_string();
    let (subscriber, mut messages) =
        ReassemblingSubscriber::channel(ReassemblerConfig::default(), 16);
    consumer.subscribe(&run_id, Arc::new(subscriber)).await?;

    let outcome = runner
        .run_with_id(run_id.clone(), "weather", json!({ "city": "Porto" }))
        .await?;
    println!("run {} finished with {}", outcome.run_id, outcome.output);

    while let Some(message) = messages.recv().await {
        for call in &message.tool_calls {
            println!("tool call {} {}", call.name, Value::Object(call.args.clone()));
        }
        if !message.content.is_empty() {
            println!("assistant: {}", message.content);
        }
    }

    let events = consumer.fetch(&run_id, None).await?;
    println!("{} events stored, stats: {:?}", events.len(), consumer.stats());
    Ok(())
}
