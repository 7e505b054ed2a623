//! huddle - real-time collaborative retrospective server

use std::process;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use huddle_core::{Database, RoomRepository};

mod bus;
mod config;
mod connection;
mod http;
mod hub;
mod identity;
mod protocol;
mod registry;
mod router;
mod suggester;

use bus::Bus;
use config::Config;
use hub::Hub;
use registry::RoomRegistry;
use router::Router;
use suggester::{ChatCompletion, Suggester};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    info!(database = %config.database_url, "Starting huddle");

    let repo: Arc<dyn RoomRepository> = match Database::open(&config.database_url) {
        Ok(db) => Arc::new(db),
        Err(err) => {
            error!(error = %err, "Failed to open database");
            process::exit(1);
        }
    };

    let hub = Hub::start();
    let registry = Arc::new(RoomRegistry::new(repo.clone()));
    let mut router = Router::new(repo, registry.clone(), hub.clone());

    if let Some(chat) = &config.chat {
        match ChatCompletion::new(chat.endpoint.clone(), chat.api_key.clone(), chat.model.clone())
        {
            Ok(suggester) => {
                info!(model = %chat.model, "Chat completion configured, suggestion features enabled");
                router = router.with_suggester(Arc::new(suggester) as Arc<dyn Suggester>);
            }
            Err(err) => {
                warn!(error = %err, "Failed to build suggestion client, features disabled")
            }
        }
    } else {
        info!("Chat completion not configured, suggestion features disabled");
    }

    if let Some(redis_url) = &config.redis_url {
        match Bus::connect(redis_url).await {
            Ok(bus) => {
                info!("Connected to Redis, cross-instance fan-out enabled");
                let subscriber = bus.clone();
                let sub_hub = hub.clone();
                let sub_registry = registry.clone();
                tokio::spawn(async move {
                    if let Err(err) = subscriber.run(sub_hub, sub_registry).await {
                        error!(error = %err, "Bus subscription ended");
                    }
                });
                router = router.with_bus(bus);
            }
            Err(err) => {
                warn!(error = %err, "Failed to connect to Redis, running in local-only mode")
            }
        }
    } else {
        info!("REDIS_URL not set, running in local-only mode");
    }

    let app = http::app(Arc::new(router));

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr = %config.bind_addr, "Failed to bind");
            process::exit(1);
        }
    };
    info!(addr = %config.bind_addr, "Listening");

    if let Err(err) = axum::serve(listener, app).await {
        error!(error = %err, "Server error");
        process::exit(1);
    }
}
