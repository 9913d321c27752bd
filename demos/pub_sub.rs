use anyhow::Result;
use clap::Parser;
use demos::{load_config, Cli};
use domino::{Event, Messenger};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    domino::setup_logger();

    let config = load_config(&Cli::parse())?;
    let messenger = Messenger::in_memory(config);

    messenger.start().await?;

    let orders = messenger.event_queue();
    let audit = messenger.event_queue();

    orders.on_event(|e: &Event| {
        println!("orders  {} {}", e.key, e.content);
        Ok(())
    });
    audit.on_event(|e: &Event| {
        println!("audit   {} {}", e.key, e.content);
        Ok(())
    });

    // subscriptions made before start are applied once the queue exists
    orders.subscribe("orders.*").await?;
    audit.subscribe("#").await?;

    orders.start().await?;
    audit.start().await?;

    messenger.broadcast("orders.created", &json!({ "id": 1 })).await?;
    messenger.broadcast("orders.shipped", &json!({ "id": 1 })).await?;
    messenger.broadcast("users.login", &json!({ "user": "guest" })).await?;

    orders.unsubscribe("orders.*").await?;
    messenger.broadcast("orders.created", &json!({ "id": 2 })).await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}
