use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use easel_core::{
    hub, ArtifactKind, Catalog, DeviceMap, Engine, Gallery, GenerationRequest, SdLoader,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tower_http::cors::CorsLayer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Easel image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Root directory holding models/, vaes/, loras/, embeddings/, ...
    #[arg(long, default_value = ".")]
    artifact_root: String,

    /// Directory where generated images and their metadata are written
    #[arg(long, default_value = "./generated_images")]
    output_dir: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

struct AppState {
    engine: Arc<Mutex<Engine>>,
    catalog: Catalog,
    gallery: Gallery,
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> Json<Value> {
    let engine = state.engine.clone();
    // The whole resolve-model -> persist span runs single-flight under this
    // lock; sampling is blocking work, so it leaves the async runtime.
    let result = tokio::task::spawn_blocking(move || {
        let mut engine = engine.lock().unwrap_or_else(|poison| poison.into_inner());
        engine.generate(&request)
    })
    .await;

    match result {
        Ok(Ok(outcome)) => Json(json!({
            "success": true,
            "image_url": outcome.url,
            "filename": outcome.filename,
            "seed": outcome.seed,
            "parameters": outcome.request,
            "degradations": outcome.degradations,
        })),
        Ok(Err(err)) => {
            warn!("generation failed: {err}");
            Json(json!({ "success": false, "error": err.to_string() }))
        }
        Err(err) => {
            error!("generation task panicked: {err}");
            Json(json!({ "success": false, "error": "internal generation failure" }))
        }
    }
}

fn list_artifacts(state: &AppState, kind: ArtifactKind) -> Json<Value> {
    let items: Vec<Value> = state
        .catalog
        .discover(kind)
        .into_values()
        .map(|descriptor| {
            json!({
                "id": descriptor.key,
                "name": descriptor.name,
                "description": descriptor.description,
                "origin": descriptor.origin,
            })
        })
        .collect();
    Json(json!({ "items": items }))
}

async fn models_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    list_artifacts(&state, ArtifactKind::BaseModel)
}

async fn vaes_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    list_artifacts(&state, ArtifactKind::Vae)
}

async fn loras_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    list_artifacts(&state, ArtifactKind::Lora)
}

async fn embeddings_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    list_artifacts(&state, ArtifactKind::Embedding)
}

async fn controlnets_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    list_artifacts(&state, ArtifactKind::ControlNet)
}

async fn samplers_handler() -> Json<Value> {
    Json(json!({
        "samplers": [
            "DPM++ 2M",
            "DPM++ 2M Karras",
            "Euler",
            "Euler A",
            "Heun",
            "LMS",
            "LMS Karras",
        ]
    }))
}

async fn gallery_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.gallery.list() {
        Ok(entries) => Json(json!({ "images": entries })),
        Err(err) => {
            warn!("gallery listing failed: {err}");
            Json(json!({ "images": [] }))
        }
    }
}

async fn gallery_latest_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    match state.gallery.latest() {
        Ok(metadata) => Json(json!({ "success": true, "metadata": metadata })),
        Err(err) => Json(json!({ "success": false, "error": err.to_string() })),
    }
}

async fn image_handler(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
) -> impl IntoResponse {
    // Generated files only; no path traversal out of the gallery directory.
    if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
        return StatusCode::NOT_FOUND.into_response();
    }
    match tokio::fs::read(state.gallery.dir().join(&filename)).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
struct DownloadRequest {
    key: String,
    kind: ArtifactKind,
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DownloadRequest>,
) -> Json<Value> {
    match hub::fetch(&request.key, request.kind, &state.catalog).await {
        Ok(path) => Json(json!({ "success": true, "path": path.to_string_lossy() })),
        Err(err) => {
            warn!(key = %request.key, "download failed: {err:#}");
            Json(json!({ "success": false, "error": format!("{err:#}") }))
        }
    }
}

async fn health_handler() -> Json<Value> {
    Json(json!({ "status": "ok", "message": "Backend is running" }))
}

async fn root_handler() -> Json<Value> {
    Json(json!({
        "name": "Easel image generation server",
        "version": env!("CARGO_PKG_VERSION"),
        "health": "/health",
    }))
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/api/generate", post(generate_handler))
        .route("/api/models", get(models_handler))
        .route("/api/vaes", get(vaes_handler))
        .route("/api/loras", get(loras_handler))
        .route("/api/embeddings", get(embeddings_handler))
        .route("/api/controlnets", get(controlnets_handler))
        .route("/api/samplers", get(samplers_handler))
        .route("/api/gallery", get(gallery_handler))
        .route("/api/gallery/latest", get(gallery_latest_handler))
        .route("/api/download", post(download_handler))
        .route("/images/{filename}", get(image_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };
    let catalog = Catalog::new(&args.artifact_root);
    let gallery = Gallery::new(&args.output_dir)?;
    let engine = Engine::new(
        catalog.clone(),
        gallery.clone(),
        Box::new(SdLoader::new(device_map)),
    );

    let state = Arc::new(AppState {
        engine: Arc::new(Mutex::new(engine)),
        catalog,
        gallery,
    });
    let app = build_router(state);

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
