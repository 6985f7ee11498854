//! Minimal terminal client: every stdin line becomes the new document body,
//! remote changes print as they arrive.

use clap::Parser;
use docrelay::cli::PadArgs;
use docrelay::sync::{SyncClient, SyncConfig, SyncEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let args = PadArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docrelay=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut client = SyncClient::spawn(SyncConfig::new(&args.server, &args.doc_id));
    let mut events = client.take_events().expect("fresh client has events");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SyncEvent::Connected) => eprintln!("[connected]"),
                Some(SyncEvent::Disconnected) => eprintln!("[disconnected, retrying]"),
                Some(SyncEvent::SnapshotApplied { text, version, server_id }) => {
                    println!("-- snapshot v{} from {}: {}", version, server_id, text);
                }
                Some(SyncEvent::RemoteEdit { text, version }) => {
                    println!("-- v{}: {}", version, text);
                }
                Some(SyncEvent::Acked { version, .. }) => {
                    tracing::debug!(version, "edit acknowledged");
                }
                None => break,
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if client.edit(line).await.is_err() {
                        break;
                    }
                }
                _ => break,
            },
        }
    }

    client.shutdown().await;
}
