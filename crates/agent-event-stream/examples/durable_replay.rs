//! Writes a run through the durable consumer, reopens the storage directory
//! and replays the run from disk.
//!
//! AGENT_EVENTS_LOG_LEVEL=debug cargo run -p agent-event-stream --example durable_replay

use std::sync::Arc;
use std::time::Duration;

use agent_event_stream::{StreamReassembler, init_observability};
use agent_event_stream::prelude::*;
use futures::stream;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_observability();

    let dir = std::env::temp_dir().join(format!("agent-events-demo-{}", Uuid::new_v4()));
    let config = DurableConfig::new(&dir)
        .with_batch_size(4)
        .with_flush_interval(Duration::from_millis(500));

    let consumer = Arc::new(DurableConsumer::open(config.clone()).await?);
    let ctx = RunContext::new("demo-run", "narrator", consumer.clone());
    let stream_id = Uuid::new_v4();
    let deltas = ["Once ", "upon ", "a ", "time"]
        .into_iter()
        .enumerate()
        .map(|(i, text)| {
            Ok::<_, std::io::Error>(
                ExecutionRecord::new(stream_id, i as u64, Role::Assistant).with_content(text),
            )
        })
        .chain(std::iter::once(Ok(
            ExecutionRecord::new(stream_id, 4, Role::Assistant).terminal()
        )));
    let emitted = ctx.emit_stream(stream::iter(deltas)).await?;
    ctx.close().await?;
    consumer.shutdown().await?;
    println!("emitted {emitted} events into {}", dir.display());
    drop(ctx);
    drop(consumer);

    let reopened = DurableConsumer::open(config).await?;
    println!("recovered: {:?}", reopened.recovery_report());
    for summary in reopened.runs() {
        println!(
            "{}: seq {}..={} ({} events)",
            summary.run_id, summary.first_seq, summary.last_seq, summary.events
        );
    }

    let mut reassembler = StreamReassembler::default();
    for event in reopened.fetch("demo-run", None).await? {
        if let Some(message) = reassembler.push(event.record().clone()) {
            println!("replayed message: {}", message.content);
        }
    }

    reopened.purge("demo-run").await?;
    reopened.shutdown().await?;
    let _ = std::fs::remove_dir_all(&dir);
    Ok(())
}
