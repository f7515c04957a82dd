use std::sync::Arc;

use serde_json::Value;

use crate::errors::AgentError;

/// A runnable agent.
///
/// Implementations report progress with [`emit`](crate::context::emit) while
/// they run; the runner binds the run before calling [`Agent::run`].
#[async_trait::async_trait]
pub trait Agent: Send + Sync {
    async fn run(&self, input: Value) -> Result<Value, AgentError>;
}

/// Builds a fresh agent instance for every run.
pub type AgentFactory = Arc<dyn Fn() -> Result<Box<dyn Agent>, AgentError> + Send + Sync>;

/// Wraps a closure as an [`AgentFactory`].
pub fn agent_factory<F>(f: F) -> AgentFactory
where
    F: Fn() -> Result<Box<dyn Agent>, AgentError> + Send + Sync + 'static,
{
    Arc::new(f)
}
