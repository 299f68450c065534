//! Minimal consume/ack demo against the in-memory broker.
//!
//! Run with: `cargo run --example basic_consume`

use std::sync::Arc;
use std::time::Duration;

use mqvisor::{Config, Container, EventKind, ListenerFn, MemoryBroker, Message};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,mqvisor=debug".into()),
        )
        .init();

    let broker = MemoryBroker::new();
    broker.declare_queue("orders");

    let listener = ListenerFn::arc(|message: Message| {
        Box::pin(async move {
            println!(
                "processing order: {}",
                String::from_utf8_lossy(&message.body)
            );
            Ok(())
        })
    });

    let mut cfg = Config::new(["orders"]);
    cfg.receive_timeout = Duration::from_millis(200);

    let container = Container::new(Arc::new(broker.clone()), listener, cfg)?;
    let mut events = container.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if event.kind == EventKind::ConsumerFailed {
                eprintln!("consumer failed: {:?}", event.reason);
            }
        }
    });

    container.start().await?;
    for i in 1..=5 {
        broker.publish("orders", format!("order #{i}"))?;
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    println!("acked: {}", broker.acked_count("orders"));
    container.stop().await;
    Ok(())
}
