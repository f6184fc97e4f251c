//! Example consumer: serves one mock OData service described by `ODATA_*` environment variables.
//!
//! Run from repo root: `cargo run -p example-consumer`
//! Or from this directory: `cargo run`

use odata_mockserver::{app, AppState, DataAccess, FsFileLoader, MockServerSettings, ServiceRegistry};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("odata_mockserver=info")),
        )
        .init();

    let settings = MockServerSettings::from_env()?;
    let service = DataAccess::load(&settings, Arc::new(FsFileLoader)).await?.build();
    let mut registry = ServiceRegistry::new();
    registry.register(Arc::new(service), &[]);
    let state = AppState::new(registry, settings.clone());

    let services = state.services.clone();
    let interval = settings.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let swept = services.sweep_sticky_sessions(Instant::now());
            if swept > 0 {
                tracing::debug!(swept, "expired sticky sessions removed");
            }
        }
    });

    let listener = TcpListener::bind(&settings.bind_addr).await?;
    tracing::info!(
        "mock service {} listening on http://{}",
        settings.service_path,
        listener.local_addr()?
    );
    axum::serve(listener, app(state)).await?;
    Ok(())
}
