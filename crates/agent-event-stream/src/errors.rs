/// Errors returned by consumers and by the emission path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsumerError {
    /// Emission was attempted without a bound (or with a closed) run.
    #[error("context error: {0}")]
    Context(String),
    /// The run is not known to this consumer.
    #[error("subscription error: unknown run {run_id}")]
    UnknownRun { run_id: String },
    /// The token does not belong to a live subscription of the run.
    #[error("subscription error: unknown token {token} for run {run_id}")]
    UnknownToken { run_id: String, token: u64 },
    /// Persisting or reading the durable tier failed after local retries.
    #[error("storage error ({run_id}): {message}")]
    Storage { run_id: String, message: String },
    /// Seq regression or gap for a run. Always a bug in the caller.
    #[error("ordering violation ({run_id}): expected seq {expected}, got {actual}")]
    OrderingViolation {
        run_id: String,
        expected: u64,
        actual: u64,
    },
    /// Invalid consumer configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl ConsumerError {
    pub(crate) fn context(message: impl Into<String>) -> Self {
        Self::Context(message.into())
    }

    pub(crate) fn storage(run_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Storage {
            run_id: run_id.into(),
            message: message.into(),
        }
    }

    pub(crate) fn unknown_run(run_id: impl Into<String>) -> Self {
        Self::UnknownRun {
            run_id: run_id.into(),
        }
    }

    /// True for errors that only degrade durability; live delivery already happened.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

/// Failure reported by a subscriber handler. Never propagated to the producer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handler error: {message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Failure reported by an agent implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AgentError {
    /// The agent could not be constructed (missing credentials, bad setup).
    #[error("agent construction failed: {0}")]
    Construction(String),
    /// The agent ran and failed.
    #[error("agent failed: {0}")]
    Failed(String),
    /// An emission inside the agent failed.
    #[error(transparent)]
    Emit(#[from] ConsumerError),
}

/// Registry misuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate agent registration: {0}")]
    Duplicate(String),
    #[error("agent name must not be empty")]
    EmptyName,
}

/// Top-level error for [`AgentRunner`](crate::runner::AgentRunner).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RunnerError {
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Consumer(#[from] ConsumerError),
}
