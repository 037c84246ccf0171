use anyhow::Result;
use faceid_service::{
    api, config::FaceIdConfig, embedder::onnx::OnnxFaceEmbedder, embedder::FaceEmbedder,
    FaceIdState,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Held until exit so buffered file log lines are flushed
    let _log_guard = telemetry::init_with_service("faceid-service");

    info!("Starting face-ID login service...");

    let config = FaceIdConfig::from_env()?;
    info!(
        bind = %config.bind_addr,
        node_id = %config.node_id,
        directory = %config.directory_url,
        login = %config.login_url,
        tolerance = config.match_tolerance,
        policy = ?config.match_policy,
        reference_policy = ?config.reference_policy,
        workers = config.max_concurrent_recognitions,
        "face-ID configuration loaded"
    );

    // Models load once; every request shares them
    let embedder = OnnxFaceEmbedder::load(config.embedder.clone())?;
    info!(
        provider = embedder.execution_provider(),
        "face models loaded"
    );
    let embedder: Arc<dyn FaceEmbedder> = Arc::new(embedder);

    let bind_addr = config.bind_addr.clone();
    let state = FaceIdState::from_config(config, embedder)?;

    let app = api::router(state.clone());

    info!("Binding to {}", bind_addr);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Face-ID service listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    info!("Face-ID service stopped");
    Ok(())
}

#[allow(clippy::expect_used)]
async fn shutdown_signal(state: FaceIdState) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }

    info!("Shutting down gracefully...");
    state.shutdown();
}
