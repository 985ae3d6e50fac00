use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use trade_settlement::price_feed::HttpPriceOracle;
use trade_settlement::{handlers, AppState, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "⏰ Claim reset {:02}:00 UTC, trade period reset {:02}:00 UTC, pool {} KDX",
        config.reward.claim_reset_hour_utc,
        config.reward.trade_period_reset_hour_utc,
        config.reward.daily_pool
    );

    let oracle = Arc::new(HttpPriceOracle::new(&config.price_api_url));
    let bind_addr = config.bind_addr.clone();

    // 创建共享状态
    let state = Arc::new(AppState::new(config, oracle)?);

    // CORS 配置
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = handlers::create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    info!("🚀 Trade Settlement starting on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
