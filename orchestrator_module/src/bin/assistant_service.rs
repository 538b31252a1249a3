use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::task;
use tracing::info;
use tracing_subscriber::EnvFilter;

use orchestrator_module::{
    inbound_queue, Analyzers, AssistantStore, ConnectorRegistry, GoogleClientFactory,
    HttpAnalyzer, MessageAnalyzer, OrchestratorConfig, OrchestratorDeps, SqliteCredentialVault,
    WorkerOrchestrator,
};
use orchestrator_module::google_auth::GoogleOAuthClient;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<WorkerOrchestrator>,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::from_env();
    let store = AssistantStore::new(&config.db_path)?;
    let vault = Arc::new(SqliteCredentialVault::new(
        config.db_path.with_file_name("vault.db"),
    )?);
    let clients = Arc::new(GoogleClientFactory::new(
        vault.clone(),
        GoogleOAuthClient::from_env(),
    ));

    let analyzers = Analyzers::new(
        http_analyzer(config.analyzer_url.clone()),
        http_analyzer(config.analyzer_fallback_url.clone()),
    );
    if !analyzers.is_configured() {
        info!("no analyzer configured; message analysis is disabled");
    }

    // Chat platform sources register on the registry; listeners push into the queue.
    let (sender, receiver) = inbound_queue(config.inbound_queue_capacity);
    let connectors = Arc::new(ConnectorRegistry::new(sender));

    let host: IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);

    let orchestrator = Arc::new(WorkerOrchestrator::new(OrchestratorDeps {
        config,
        store,
        vault,
        clients,
        connectors,
        analyzers,
        inbound: Some(receiver),
    }));

    {
        let orchestrator = orchestrator.clone();
        task::spawn_blocking(move || {
            orchestrator.start_global_processor();
            orchestrator.start_services_for_eligible_users();
        })
        .await?;
    }

    let app = Router::new()
        .route("/health", get(health))
        .route("/workers", get(workers))
        .route("/users/:user_id/services", get(user_services))
        .with_state(AppState {
            orchestrator: orchestrator.clone(),
        });

    info!("assistant service listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await;

    task::spawn_blocking(move || orchestrator.shutdown()).await?;
    serve_result?;
    Ok(())
}

fn http_analyzer(url: Option<String>) -> Option<Arc<dyn MessageAnalyzer>> {
    url.map(|url| {
        Arc::new(HttpAnalyzer::new(
            Some(url),
            std::env::var("ANALYZER_API_KEY").ok(),
        )) as Arc<dyn MessageAnalyzer>
    })
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn workers(State(state): State<AppState>) -> impl IntoResponse {
    let counts = state.orchestrator.worker_counts();
    Json(serde_json::json!({
        "email_pollers": counts.email_pollers,
        "calendar_pollers": counts.calendar_pollers,
        "processor_running": counts.processor_running,
    }))
}

async fn user_services(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    let running = state.orchestrator.is_running_for_user(&user_id);
    Json(serde_json::json!({
        "user_id": user_id,
        "running": running,
    }))
}
