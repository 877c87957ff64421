use checkpoint_flow::api::{self, ApiState};
use checkpoint_flow::config;
use checkpoint_flow::estimation::estimator::LevelEstimator;
use checkpoint_flow::estimation::{RefreshPipeline, spawn_refresh_thread};
use checkpoint_flow::ratelimit::RateLimiter;
use checkpoint_flow::state::AppState;
use checkpoint_flow::store::MemoryStore;
use checkpoint_flow::traffic::remote::HttpTrafficSource;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

fn init_tracing(level: tracing::Level) {
    let subscriber = tracing_subscriber::fmt()
        .with_target(false)
        .with_max_level(level)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = config::load_default()?;
    init_tracing(config.log_level());
    tracing::info!(
        config_path = config::DEFAULT_CONFIG_PATH,
        app = %config.app.name,
        "checkpoint-flow starting"
    );

    if config.checkpoints.is_empty() {
        tracing::warn!("No checkpoints configured in [[checkpoints]]");
    } else {
        tracing::info!(
            count = config.checkpoints.len(),
            "Checkpoints loaded"
        );
    }
    let state = Arc::new(RwLock::new(AppState::new(config.checkpoints.clone())));

    let estimator = LevelEstimator::new(config.estimator_params());
    let mut pipeline = RefreshPipeline::new(
        estimator,
        config.live_window(),
        config.utc_offset_minutes(),
    );
    match config.traffic_endpoint() {
        Some(endpoint) => {
            tracing::info!(endpoint, "Traffic source enabled");
            let source = HttpTrafficSource::new(endpoint, config.traffic_timeout());
            pipeline = pipeline.with_traffic(Box::new(source), config.traffic_ttl());
        }
        None => tracing::info!("No traffic endpoint configured"),
    }

    let stop_flag = Arc::new(AtomicBool::new(false));
    let refresh_interval = config.refresh_interval();
    tracing::info!(
        interval_ms = refresh_interval.as_millis(),
        window_minutes = config.live_window().as_secs() / 60,
        "Starting estimation refresh thread"
    );
    let refresh_handle = spawn_refresh_thread(
        Arc::clone(&state),
        pipeline,
        refresh_interval,
        Arc::clone(&stop_flag),
    );

    let limiter = RateLimiter::new(MemoryStore::new(), config.rate_limit_interval());
    let app = api::router(ApiState {
        state: Arc::clone(&state),
        limiter: Arc::new(limiter),
    });
    let port = config.server_port();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "API server listening");
    axum::serve(listener, app).await?;

    stop_flag.store(true, Ordering::Relaxed);
    if refresh_handle.join().is_err() {
        tracing::warn!("Refresh thread panicked");
    }

    Ok(())
}
