//! Elastic scaling demo: the pool grows under a backlog and shrinks when
//! the queue goes quiet.
//!
//! Run with: `cargo run --example elastic_scaling`

use std::sync::Arc;
use std::time::Duration;

use mqvisor::{Config, Container, EventKind, ListenerFn, MemoryBroker, Message};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let broker = MemoryBroker::new();
    broker.declare_queue("work");

    let listener = ListenerFn::arc(|_message: Message| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            Ok(())
        })
    });

    let mut cfg = Config::new(["work"]);
    cfg.concurrent_min = 1;
    cfg.concurrent_max = 4;
    cfg.consecutive_active_trigger = 3;
    cfg.consecutive_idle_trigger = 3;
    cfg.start_consumer_min_interval = Duration::from_millis(250);
    cfg.stop_consumer_min_interval = Duration::from_millis(250);
    cfg.receive_timeout = Duration::from_millis(100);

    let container = Container::new(Arc::new(broker.clone()), listener, cfg)?;
    let mut events = container.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event.kind {
                EventKind::ConsumerStarted => println!("+ {}", event.consumer.unwrap_or_default()),
                EventKind::ConsumerStopped => println!("- {}", event.consumer.unwrap_or_default()),
                _ => {}
            }
        }
    });

    container.start().await?;
    for i in 0..400 {
        broker.publish("work", format!("job-{i}"))?;
    }

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        println!(
            "workers={} backlog={}",
            container.worker_count().await,
            broker.message_count("work")
        );
    }

    container.stop().await;
    Ok(())
}
