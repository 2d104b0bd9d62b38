//! Example Axum web server guarded by pulse-warden
//!
//! Every request is registered, admitted by the flood sensor and watched by
//! the zombie detector. CPU-heavy handlers call checkpoints so a killed
//! request gives up instead of burning a worker.
//!
//! Run with: cargo run -p tower-warden --example axum_server
//!
//! Set `PULSE_WARDEN_PROFILE` to `strict`, `balanced` or `lenient` to pick a
//! preset, or `PULSE_WARDEN_CONFIG` to a JSON config file.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Extension, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use pulse_warden::registry::WorkRegistry;
use pulse_warden::work::Work;
use pulse_warden::{LimitProfile, Warden, WardenConfig, ZombieAbort};
use pulse_warden_macros::checkpoint;
use serde::{Deserialize, Serialize};
use tower_warden::{WardenLayer, abort_response};
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct WorkParams {
    iterations: Option<u64>,
    delay_ms: Option<u64>,
    parts: Option<u32>,
}

#[derive(Debug, Serialize)]
struct WorkResult {
    request_id: String,
    iterations: u64,
    sum: u64,
    duration_ms: u64,
}

#[derive(Debug, Serialize)]
struct Outstanding {
    id: String,
    name: Option<String>,
    elapsed_ms: u64,
    zombie: bool,
}

fn load_config() -> WardenConfig {
    if let Ok(path) = std::env::var("PULSE_WARDEN_CONFIG") {
        let raw = std::fs::read_to_string(&path).expect("Failed to read config file");
        return serde_json::from_str(&raw).expect("Invalid config file");
    }

    let profile = match std::env::var("PULSE_WARDEN_PROFILE").as_deref() {
        Ok("strict") => LimitProfile::Strict,
        Ok("lenient") => LimitProfile::Lenient,
        _ => LimitProfile::Balanced,
    };
    info!("Using {:?} profile: {}", profile, profile.description());
    profile.create_config()
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pulse_warden=debug".into()),
        )
        .init();

    let warden = Arc::new(Warden::from_config(load_config()).expect("Invalid configuration"));
    warden.start().expect("Failed to start zombie detector");

    // Build application router
    let app = Router::new()
        .route("/", get(home))
        .route("/work", get(cpu_work))
        .route("/slow", get(slow_work))
        .route("/fanout", get(fan_out))
        .route("/status", get(server_status))
        .route("/metrics", get(metrics))
        .layer(WardenLayer::new(warden.clone()))
        .with_state(warden.clone());

    info!("Starting server on http://localhost:3000");
    info!("Try these endpoints:");
    info!("  GET  /                    - Endpoint list");
    info!("  GET  /work?iterations=N   - CPU-intensive work with checkpoints");
    info!("  GET  /slow?delay_ms=N     - I/O simulation");
    info!("  GET  /fanout?parts=N      - Delegated tasks sharing the request id");
    info!("  GET  /status              - Outstanding requests");
    info!("  GET  /metrics             - Warden counters");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000")
        .await
        .expect("Failed to bind to port 3000");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("Server failed");

    warden.close();
}

async fn home() -> &'static str {
    "pulse-warden demo: /work /slow /fanout /status /metrics\n"
}

#[checkpoint(check_interval = 1)]
async fn crunch(iterations: u64) -> Result<u64, ZombieAbort> {
    let mut sum = 0u64;
    let mut i = 0u64;
    while i < iterations {
        let end = (i + 10_000).min(iterations);
        sum = (i..end).fold(sum, u64::wrapping_add);
        i = end;
        tokio::task::yield_now().await;
    }
    Ok(sum)
}

async fn cpu_work(Extension(work): Extension<Arc<Work>>, Query(params): Query<WorkParams>) -> Response {
    let iterations = params.iterations.unwrap_or(100_000);
    let start = Instant::now();

    info!(request_id = work.id(), iterations, "Starting CPU work");

    match crunch(iterations).await {
        Ok(sum) => Json(WorkResult {
            request_id: work.id().to_string(),
            iterations,
            sum,
            duration_ms: start.elapsed().as_millis() as u64,
        })
        .into_response(),
        Err(abort) => {
            warn!(request_id = work.id(), "CPU work abandoned after {:?}", abort.elapsed);
            abort_response(abort)
        }
    }
}

async fn slow_work(Extension(work): Extension<Arc<Work>>, Query(params): Query<WorkParams>) -> Json<WorkResult> {
    let delay_ms = params.delay_ms.unwrap_or(100);
    let start = Instant::now();

    // Killed requests are dropped at this await by the layer
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    Json(WorkResult {
        request_id: work.id().to_string(),
        iterations: 0,
        sum: 0,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

async fn fan_out(
    State(warden): State<Arc<Warden>>,
    Query(params): Query<WorkParams>,
) -> Result<Json<Vec<Option<String>>>, StatusCode> {
    let parts = params.parts.unwrap_or(4);
    let handles: Vec<_> = (0..parts)
        .map(|i| {
            warden.decorator().spawn(format!("part-{i}"), async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                pulse_warden::context::field("root_request_id")
            })
        })
        .collect();

    let mut roots = Vec::with_capacity(handles.len());
    for handle in handles {
        roots.push(handle.await.map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?);
    }
    Ok(Json(roots))
}

async fn server_status(State(warden): State<Arc<Warden>>) -> Json<Vec<Outstanding>> {
    Json(
        warden
            .registry()
            .stream()
            .map(|work| Outstanding {
                id: work.id().to_string(),
                name: work.name().map(str::to_string),
                elapsed_ms: work.elapsed_millis(),
                zombie: work.is_zombie(),
            })
            .collect(),
    )
}

async fn metrics(State(warden): State<Arc<Warden>>) -> Json<pulse_warden::metrics::MetricsSnapshot> {
    Json(warden.metrics().snapshot())
}
