use anyhow::Result;
use clap::Parser;
use demos::{load_config, Cli};
use domino::Messenger;
use log::{error, info};
use serde_json::json;
use std::time::Instant;
use tokio::sync::mpsc;

const SERVICE_QUEUE: &str = "svc.echo";

#[tokio::main]
async fn main() -> Result<()> {
    domino::setup_logger();

    let config = load_config(&Cli::parse())?;

    let client = Messenger::in_memory(config.clone());
    client.start().await?;

    // the server shares the broker of the client
    let server = Messenger::new(client.driver(), config);
    let (tx, mut incoming) = mpsc::unbounded_channel();

    server.create_queue(SERVICE_QUEUE).await?;
    server
        .listen(SERVICE_QUEUE, move |delivery| {
            let _ = tx.send(delivery);
        })
        .await?;

    tokio::spawn(async move {
        while let Some(request) = incoming.recv().await {
            let reply = match request.json() {
                Ok(body) => server.reply(&request, &json!({ "echo": body })).await,
                Err(e) => Err(e),
            };

            if let Err(e) = reply {
                error!("Cannot answer request {}: {:?}", request.delivery_tag, e);
            }

            domino::logerr!(server.ack(&request).await);
        }
    });

    let requests = client.request_queue();
    requests.start().await?;

    let requests = &requests;
    let start = Instant::now();
    let pendings = futures::future::try_join_all((0..16).map(|i| async move {
        let payload = json!({ "seq": i });

        requests.request(&payload, SERVICE_QUEUE).await
    }))
    .await?;

    for reply in &pendings {
        info!("Reply {}", reply.json()?);
    }

    println!("{} round trips: {:?}", pendings.len(), start.elapsed());

    let shared = client.request(&json!("via the messenger"), SERVICE_QUEUE).await?;
    println!("Shared request queue got {}", shared.json()?);

    Ok(())
}
