use http::{HeaderValue, Method, header};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_governor::governor::GovernorConfigBuilder;
use tower_http::cors::CorsLayer;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imagegen_bot::config::Config;
use imagegen_bot::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    tracing::info!("✅ Configuration loaded successfully");

    let shutdown = CancellationToken::new();
    let (state, dispatcher) = AppState::new(&config, shutdown.clone()).await?;
    tracing::info!("✅ AppState initialized");

    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(86400));

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(config.rate_limit_per_second)
            .burst_size(config.rate_limit_burst)
            .use_headers()
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Invalid rate limit configuration"))?,
    );

    let app = imagegen_bot::router(state.clone())
        .layer(tower_governor::GovernorLayer::new(governor_conf))
        .layer(cors);

    let maintenance_state = state.clone();
    let maintenance_shutdown = shutdown.clone();
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = maintenance_shutdown.cancelled() => break,
                _ = tokio::time::sleep(sweep_interval) => {}
            }
            let (pruned, swept) = maintenance_state.generation.run_maintenance().await;
            if pruned > 0 || swept > 0 {
                tracing::info!(
                    "🧹 Maintenance removed {} expired credential(s) and {} session(s)",
                    pruned,
                    swept
                );
            }
        }
    });

    tracing::info!("🚀 Server listening on http://{}", config.bind_addr);
    tracing::info!(
        "✅ Background maintenance started (runs every {}s)",
        config.sweep_interval.as_secs()
    );

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("⚠️  Shutdown signal received");
            }
            _ = server_shutdown.cancelled() => {}
        }
    })
    .await?;

    shutdown.cancel();
    if let Err(e) = dispatcher.await {
        tracing::error!("❌ Queue dispatcher ended abnormally: {}", e);
    }
    tracing::info!("✅ Shutdown complete");

    Ok(())
}
