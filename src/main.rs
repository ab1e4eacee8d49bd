use anyhow::Result;
use std::net::SocketAddr;

use llm_dispatch::config::load_config;
use llm_dispatch::logging::{init_tracing, with_bootstrap_logging};
use llm_dispatch::server::{create_router, AppState};
use llm_dispatch::Dispatcher;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/config.yaml".to_string());
    // The configured subscriber depends on the config, so loading logs to a
    // temporary one
    let config = with_bootstrap_logging(|| load_config(&config_path))?;

    init_tracing(&config.logging);
    tracing::info!(
        path = %config_path,
        providers = config.providers.len(),
        "Configuration loaded"
    );

    let dispatcher = Dispatcher::from_config(&config)?;
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let app = create_router(AppState::new(config, dispatcher));

    tracing::info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
