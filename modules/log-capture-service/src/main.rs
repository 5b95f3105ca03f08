//! Log Capture Service: standalone binary that captures this app's logs and
//! serves discovery of every capturing app on the host.
//!
//! Default: http://127.0.0.1:9103/

mod config;
mod routes;

use chrono::Utc;
use config::Config;
use log_capture_service::{DiscoveryRetriever, IngestionEngine, JsonLinesSource};
use routes::AppState;
use std::sync::Arc;
use std::time::Instant;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    env_logger::init();

    let launch_date = Utc::now();
    let config = Config::from_env();
    let convention = config.convention();

    match convention.root() {
        Ok(root) => log::info!("Capture root: {}", root.display()),
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    }

    let engine = match (config.identity(), &config.source_path) {
        (Some(identity), Some(source_path)) => {
            let source = Arc::new(JsonLinesSource::new(source_path));
            log::info!("Reading log records from {}", source.path().display());
            let engine = IngestionEngine::with_options(
                &convention,
                identity,
                &config.device_info(),
                source,
                launch_date,
                config.capture_options(),
            )
            .expect("Failed to start ingestion engine");
            Some(engine)
        }
        _ => {
            log::warn!(
                "LOG_CAPTURE_APP_ID or LOG_CAPTURE_SOURCE_PATH not set, capture disabled"
            );
            None
        }
    };

    let discovery = DiscoveryRetriever::new(&convention).expect("Failed to start discovery");

    let mut apps = discovery.subscribe();
    tokio::spawn(async move {
        while let Some(snapshot) = apps.next().await {
            for app in &snapshot {
                log::debug!(
                    "[DISCOVERY] {} ({}): {} executable(s)",
                    app.display_name,
                    app.id,
                    app.executables.len()
                );
            }
        }
    });

    let state = Arc::new(AppState {
        engine,
        discovery,
        convention,
        start_time: Instant::now(),
    });

    let cors = tower_http::cors::CorsLayer::permissive();

    let app = axum::Router::new()
        // Capture
        .route("/rpc/status", axum::routing::get(routes::status))
        .route("/rpc/export", axum::routing::post(routes::export))
        // Discovery
        .route("/rpc/apps", axum::routing::get(routes::apps))
        .route(
            "/rpc/executables/wait_change",
            axum::routing::post(routes::wait_change),
        )
        .with_state(state.clone())
        .layer(cors);

    let addr = format!("127.0.0.1:{}", config.port);
    log::info!("Log Capture Service listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            log::info!("Shutting down");
        })
        .await
        .expect("Server error");

    match Arc::try_unwrap(state) {
        Ok(state) => {
            if let Some(engine) = state.engine {
                engine.shutdown().await;
            }
            state.discovery.shutdown().await;
        }
        // Dropping still cancels both background tasks
        Err(_) => log::warn!("Service state still shared at exit"),
    }
}
