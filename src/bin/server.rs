use clap::Parser;
use docrelay::cli::ServerArgs;
use docrelay::identity::ReplicaId;
use docrelay::store::RedisStore;
use docrelay::Relay;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let args = ServerArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docrelay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let replica = match &args.server_id {
        Some(id) => ReplicaId::new(id.clone()),
        None => ReplicaId::from_env(),
    };
    tracing::info!(replica = %replica, "starting relay");

    let store = match RedisStore::connect(&args.redis_url).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            tracing::error!("failed to connect to redis at {}: {}", args.redis_url, e);
            std::process::exit(1);
        }
    };

    let relay = Relay::new(replica, store);
    relay.spawn_background();
    let app = relay.router();

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .expect("Invalid address");

    tracing::info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .unwrap();

    tracing::info!("draining pending snapshots");
    relay.shutdown().await;
}
