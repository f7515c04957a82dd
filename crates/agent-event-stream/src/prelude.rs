//! Common imports for emitting, consuming and reassembling agent events.
pub use crate::{
    Agent, AgentError, AgentEvent, AgentRegistry, AgentRunner, ConsumerError, DurableConfig,
    DurableConsumer, EventConsumer, EventHandler, ExecutionRecord, FinalizedMessage,
    MemoryConsumer, ReassemblerConfig, ReassemblingSubscriber, Role, RunContext, ToolCall,
    handler_fn,
};
