//! Ordered delivery, durable retention and reassembly of streamed agent output.
//!
//! An agent emits one [`ExecutionRecord`] per delta. Emission wraps it in an
//! [`AgentEvent`] with a gapless, run-scoped `seq` and hands it to an
//! [`EventConsumer`], which fans it out to live subscribers and, for the
//! [`DurableConsumer`], buffers it for batched appends to a per-run log.
//! [`ReassemblingSubscriber`] folds a run's chunks back into whole messages.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agent_event_stream::prelude::*;
//! use uuid::Uuid;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ConsumerError> {
//! let consumer = Arc::new(DurableConsumer::open(DurableConfig::new("./agent_events")).await?);
//! let (reassembler, mut messages) =
//!     ReassemblingSubscriber::channel(ReassemblerConfig::default(), 16);
//! consumer.subscribe("run-1", Arc::new(reassembler)).await?;
//!
//! let ctx = RunContext::new("run-1", "writer", consumer.clone());
//! let stream = Uuid::new_v4();
//! ctx.emit(ExecutionRecord::new(stream, 0, Role::Assistant).with_content("Hi")).await?;
//! ctx.emit(ExecutionRecord::new(stream, 1, Role::Assistant).terminal()).await?;
//! ctx.close().await?;
//!
//! if let Some(message) = messages.recv().await {
//!     println!("{}", message.content);
//! }
//! consumer.shutdown().await?;
//! # Ok(())
//! # }
//! ```

/// Agent trait and factory type.
pub mod agent;
/// Consumer and handler contracts.
pub mod consumer;
/// Run context, seq assignment and the ambient `emit`.
pub mod context;
/// Durable consumer: hot cache plus append-only per-run log.
pub mod durable;
/// Error types.
pub mod errors;
/// The event envelope.
pub mod event;
mod fanout;
/// Memory-only consumer.
pub mod memory;
/// Tracing subscriber setup.
pub mod observability;
/// Common imports.
pub mod prelude;
/// Chunk-to-message reassembly.
pub mod reassembler;
/// Execution record types.
pub mod record;
/// Name-to-factory agent registry.
pub mod registry;
/// Runs registered agents with a bound context.
pub mod runner;

pub use agent::{Agent, AgentFactory, agent_factory};
pub use consumer::{
    ConsumerStats, EventConsumer, EventHandler, SubscriptionStats, SubscriptionToken, handler_fn,
};
pub use context::{
    EmitStreamError, ExecutionSnapshot, RunContext, current_agent_name, current_run_id, emit,
};
pub use durable::{
    DurableConfig, DurableConsumer, RecoveryReport, RetryPolicy, RunSummary, SweepReport,
};
pub use errors::{AgentError, ConsumerError, HandlerError, RegistryError, RunnerError};
pub use event::{AgentEvent, EVENT_VERSION};
pub use fanout::DEFAULT_SUBSCRIBER_QUEUE;
pub use memory::{MemoryConsumer, MemoryConsumerConfig};
pub use observability::{ObservabilitySettings, init_observability, init_observability_with};
pub use reassembler::{
    FinalizedMessage, ReassemblerConfig, ReassemblingSubscriber, StreamReassembler,
};
pub use record::{Content, ExecutionRecord, Role, ToolCall};
pub use registry::AgentRegistry;
pub use runner::{AgentRunner, RunOutcome};
