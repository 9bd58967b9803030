use async_trait::async_trait;
use dispatch_q::{Dispatcher, DispatcherConfig, QueueHandler, QueuePayload, QueueResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Serialize, Deserialize)]
struct Greeting {
    sequence: u64,
    text: String,
}

pub struct PrintGreeting;

#[async_trait]
impl QueueHandler for PrintGreeting {
    async fn execute(&self, payload: &QueuePayload) -> QueueResult {
        let greeting: Greeting = match serde_json::from_value(payload.body.clone()) {
            Ok(greeting) => greeting,
            Err(e) => return QueueResult::fail(format!("invalid payload: {e}")),
        };
        info!(sequence = greeting.sequence, text = %greeting.text, "DEMO received greeting");
        QueueResult::ok("printed")
    }
}

/// Rejects first attempts of every third job and panics on multiples of seven.
pub struct Unreliable;

#[async_trait]
impl QueueHandler for Unreliable {
    async fn execute(&self, payload: &QueuePayload) -> QueueResult {
        let sequence = payload.body["sequence"].as_u64().unwrap_or_default();
        if sequence % 7 == 0 {
            panic!("refusing sequence {sequence}");
        }
        if sequence % 3 == 0 && payload.retry == 0 {
            return QueueResult::fail("first attempt rejected");
        }
        info!(sequence, retry = payload.retry, "DEMO2 accepted job");
        QueueResult::ok("accepted")
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = DispatcherConfig::load()?;
    let mut dispatcher = Dispatcher::builder()
        .config(config)
        .retry_backoff(Duration::from_millis(250))
        .on_recovery(|trace| error!(%trace, "Recovered from handler panic"))
        .build()
        .await?;

    dispatcher.register_handler("DEMO", "DEMO", Arc::new(PrintGreeting))?;
    dispatcher.register_handler("DEMO2", "DEMO2", Arc::new(Unreliable))?;

    let queue = dispatcher.queue().clone();
    let max_retry = dispatcher.config().max_retry;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(500));
        for sequence in 1u64.. {
            ticker.tick().await;
            let topic = if sequence % 2 == 0 { "DEMO" } else { "DEMO2" };
            let body = serde_json::to_value(Greeting {
                sequence,
                text: format!("hello #{sequence}"),
            })
            .unwrap_or_default();
            let mut job = QueuePayload::new(topic, body)
                .group(topic)
                .max_retry(max_retry);
            if let Err(e) = queue.push(&mut job).await {
                error!(error = %e, "Failed to enqueue demo job");
            }
        }
    });

    dispatcher.run().await?;
    Ok(())
}
