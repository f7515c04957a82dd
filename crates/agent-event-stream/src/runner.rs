use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::consumer::EventConsumer;
use crate::context::{ExecutionSnapshot, RunContext};
use crate::errors::RunnerError;
use crate::registry::AgentRegistry;

/// Result of one completed run.
#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub output: Value,
    pub snapshot: ExecutionSnapshot,
}

/// Resolves agents by name and runs them with a bound [`RunContext`].
#[derive(Clone)]
pub struct AgentRunner {
    registry: Arc<AgentRegistry>,
    consumer: Arc<dyn EventConsumer>,
}

impl AgentRunner {
    pub fn new(registry: AgentRegistry, consumer: Arc<dyn EventConsumer>) -> Self {
        Self {
            registry: Arc::new(registry),
            consumer,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn consumer(&self) -> &Arc<dyn EventConsumer> {
        &self.consumer
    }

    /// Runs `agent_name` under a fresh UUID v4 run id.
    pub async fn run(&self, agent_name: &str, input: Value) -> Result<RunOutcome, RunnerError> {
        self.run_with_id(Uuid::new_v4().to_string(), agent_name, input)
            .await
    }

    /// Runs `agent_name` under a caller-chosen run id, so subscribers can be
    /// attached before the first event. The run is closed when the agent
    /// returns, successfully or not.
    pub async fn run_with_id(
        &self,
        run_id: impl Into<String>,
        agent_name: &str,
        input: Value,
    ) -> Result<RunOutcome, RunnerError> {
        let run_id = run_id.into();
        let factory = self
            .registry
            .get(agent_name)
            .ok_or_else(|| RunnerError::AgentNotFound(agent_name.to_string()))?;
        let agent = factory()?;

        let ctx = RunContext::new(run_id.clone(), agent_name, self.consumer.clone());
        info!(run_id = %run_id, agent = agent_name, "run started");
        let result = ctx.clone().scope(agent.run(input)).await;
        let snapshot = ctx.snapshot().await;
        let closed = ctx.close().await;

        match result {
            Ok(output) => {
                closed?;
                info!(run_id = %run_id, agent = agent_name, last_seq = ?snapshot.last_seq, "run finished");
                Ok(RunOutcome {
                    run_id,
                    output,
                    snapshot,
                })
            }
            Err(err) => {
                if let Err(close_err) = closed {
                    warn!(run_id = %run_id, error = %close_err, "closing failed run");
                }
                warn!(run_id = %run_id, agent = agent_name, error = %err, "run failed");
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use crate::consumer::EventConsumer;
    use crate::context::{self, current_agent_name, current_run_id};
    use crate::errors::AgentError;
    use crate::event::AgentEvent;
    use crate::memory::MemoryConsumer;
    use crate::record::{ExecutionRecord, Role};
    use serde_json::json;

    /// Streams its input string back one character per chunk.
    struct Echo;

    #[async_trait::async_trait]
    impl Agent for Echo {
        async fn run(&self, input: Value) -> Result<Value, AgentError> {
            let text = input
                .as_str()
                .ok_or_else(|| AgentError::Failed("expected a string".into()))?;
            let stream = Uuid::new_v4();
            for (i, ch) in text.chars().enumerate() {
                let record =
                    ExecutionRecord::new(stream, i as u64, Role::Assistant).with_content(ch.to_string());
                context::emit(record).await?;
            }
            let last = text.chars().count() as u64;
            context::emit(ExecutionRecord::new(stream, last, Role::Assistant).terminal()).await?;
            Ok(json!({
                "run_id": current_run_id(),
                "agent": current_agent_name(),
            }))
        }
    }

    /// Emits from a spawned task that re-enters the run scope.
    struct Spawner;

    #[async_trait::async_trait]
    impl Agent for Spawner {
        async fn run(&self, _input: Value) -> Result<Value, AgentError> {
            let ctx = context::current().ok_or_else(|| AgentError::Failed("unbound".into()))?;
            let record = ExecutionRecord::new(Uuid::new_v4(), 0, Role::Tool).terminal();
            let task = tokio::spawn(ctx.scope(async move { context::emit(record).await }));
            task.await
                .map_err(|e| AgentError::Failed(e.to_string()))??;
            Ok(Value::Null)
        }
    }

    fn runner(consumer: Arc<MemoryConsumer>) -> AgentRunner {
        let mut registry = AgentRegistry::new();
        registry.register("echo", || Ok(Box::new(Echo) as Box<dyn Agent>)).unwrap();
        registry.register("spawner", || Ok(Box::new(Spawner) as Box<dyn Agent>)).unwrap();
        registry
            .register("broken", || Err(AgentError::Construction("no credentials".into())))
            .unwrap();
        AgentRunner::new(registry, consumer)
    }

    #[tokio::test]
    async fn run_binds_context_and_closes_run() {
        let consumer = Arc::new(MemoryConsumer::default());
        let outcome = runner(consumer.clone())
            .run_with_id("run-1", "echo", json!("hey"))
            .await
            .unwrap();
        assert_eq!(outcome.output, json!({ "run_id": "run-1", "agent": "echo" }));
        assert_eq!(outcome.snapshot.first_seq, Some(1));
        assert_eq!(outcome.snapshot.last_seq, Some(4));

        let events = consumer.fetch("run-1", None).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(AgentEvent::seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert!(events.iter().all(|e| e.agent() == "echo"));
        assert!(events[3].record().is_terminal);
    }

    #[tokio::test]
    async fn generated_run_ids_are_unique() {
        let consumer = Arc::new(MemoryConsumer::default());
        let runner = runner(consumer);
        let a = runner.run("echo", json!("a")).await.unwrap();
        let b = runner.run("echo", json!("b")).await.unwrap();
        assert_ne!(a.run_id, b.run_id);
        assert!(Uuid::parse_str(&a.run_id).is_ok());
    }

    #[tokio::test]
    async fn spawned_tasks_emit_after_reentering_scope() {
        let consumer = Arc::new(MemoryConsumer::default());
        let outcome = runner(consumer.clone())
            .run_with_id("run-2", "spawner", Value::Null)
            .await
            .unwrap();
        assert_eq!(outcome.snapshot.last_seq, Some(1));
    }

    #[tokio::test]
    async fn lookup_and_agent_failures_surface() {
        let runner = runner(Arc::new(MemoryConsumer::default()));
        assert_eq!(
            runner.run("nope", Value::Null).await,
            Err(RunnerError::AgentNotFound("nope".into()))
        );
        assert!(matches!(
            runner.run("broken", Value::Null).await,
            Err(RunnerError::Agent(AgentError::Construction(_)))
        ));
        assert!(matches!(
            runner.run("echo", json!(5)).await,
            Err(RunnerError::Agent(AgentError::Failed(_)))
        ));
    }
}
