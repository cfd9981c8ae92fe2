mod access;
mod app;
mod auth;
mod config;
mod crdt;
mod handlers;
mod models;
mod room;
mod routes;
mod store;
mod ws;

use std::panic;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use access::{AccessControl, AppServiceClient, FixedAccess, IdentityProvider, LocalIdentityProvider};
use app::App;
use config::Config;
use models::Role;
use store::{DocumentStore, MemoryStore, PgStore};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set panic hook for better error messages
    panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
    }));

    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to info level, but allow debug for our app
            "cowrite_sync=debug,tower_http=debug,axum::rejection=trace,info".into()
        }))
        .init();

    info!("Starting server...");

    // Load configuration
    let config = Config::load().unwrap_or_else(|e| {
        error!("Failed to load configuration: {}", e);
        warn!("Using default configuration");
        Config::default()
    });

    // Pick the durable store: PostgreSQL when configured, in-memory otherwise
    let store: Arc<dyn DocumentStore> = if let Some(db_url) = &config.db_url {
        match PgStore::connect(db_url).await {
            Ok(store) => {
                info!("Database initialized successfully");
                Arc::new(store)
            }
            Err(e) => {
                error!("Failed to initialize database: {}", e);
                warn!("Falling back to the in-memory store - documents will not survive restarts");
                Arc::new(MemoryStore::new())
            }
        }
    } else {
        warn!("No database URL configured - documents will not survive restarts");
        Arc::new(MemoryStore::new())
    };

    // Identity and access control come from the app service when configured
    let (access, identities): (Arc<dyn AccessControl>, Arc<dyn IdentityProvider>) =
        match (&config.app_service_url, &config.auth_jwt_secret) {
            (Some(url), Some(secret)) => {
                let client = Arc::new(AppServiceClient::new(
                    url.clone(),
                    secret.clone(),
                    config.service_name.clone(),
                ));
                let access: Arc<dyn AccessControl> = client.clone();
                let identities: Arc<dyn IdentityProvider> = client;
                (access, identities)
            }
            _ => {
                warn!("No app service configured - all admitted users get editor access");
                let access: Arc<dyn AccessControl> = Arc::new(FixedAccess { role: Role::Editor });
                let identities: Arc<dyn IdentityProvider> = Arc::new(LocalIdentityProvider);
                (access, identities)
            }
        };

    let app = App::new(config.clone(), store, access, identities);

    let app_routes = routes::create_routes(Arc::clone(&app))
        // Add tracing layer
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.server_address())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to {}", config.server_address()));

    info!("🚀 Server running on http://{}", config.server_address());
    info!("📡 Collaboration WebSocket at ws://{}/ws", config.server_address());

    axum::serve(listener, app_routes)
        .await
        .expect("Server failed to start");
}
