use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use hindsight_ingestion::{
    ExtractedFact, FactExtractor, LlmFactExtractor, RetainContext, RetainPipeline, TaskQueue,
    WorkerPool,
};
use hindsight_models::{
    CrossEncoder, EmbeddingClient, HashingEmbedder, HttpCrossEncoder, HttpEmbedder, HttpLlmClient,
    LexicalCrossEncoder, LlmClient, LlmConfig,
};
use hindsight_retrieval::{RecallConfig, RecallEngine};
use hindsight_schemas::{EngineError, FactType, OperationId, RecallRequest, RetainRequest};
use hindsight_storage::Database;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Level};

#[derive(Clone)]
struct AppState {
    engine: Arc<RecallEngine>,
    pipeline: Arc<RetainPipeline>,
}

/// Extraction fallback when no language model is configured: the whole
/// content becomes a single world fact. Keeps the engine usable for
/// verbatim note-taking setups.
struct VerbatimExtractor;

#[async_trait]
impl FactExtractor for VerbatimExtractor {
    async fn extract(
        &self,
        content: &str,
        _context: Option<&str>,
        _reference: DateTime<Utc>,
    ) -> Result<Vec<ExtractedFact>> {
        Ok(vec![ExtractedFact {
            text: content.trim().to_string(),
            fact_type: FactType::World,
            confidence_score: None,
            occurred_start: None,
            occurred_end: None,
            entities: Vec::new(),
            causal_relations: Vec::new(),
        }])
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Hindsight memory service v0.1.0");

    let db_path =
        std::env::var("HINDSIGHT_DB_PATH").unwrap_or_else(|_| "./hindsight.db".to_string());
    if let Some(parent) = std::path::Path::new(&db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let db = Arc::new(Mutex::new(Database::new(&db_path)?));
    info!("Fact store at {}", db_path);

    let embedder: Arc<dyn EmbeddingClient> = if std::env::var("EMBEDDINGS_URL").is_ok() {
        Arc::new(HttpEmbedder::from_env()?)
    } else {
        warn!("EMBEDDINGS_URL not set, using the local hashing embedder");
        Arc::new(HashingEmbedder::new())
    };

    let encoder: Arc<dyn CrossEncoder> = if std::env::var("RERANKER_URL").is_ok() {
        Arc::new(HttpCrossEncoder::from_env()?)
    } else {
        warn!("RERANKER_URL not set, using the lexical reranker");
        Arc::new(LexicalCrossEncoder::new())
    };

    let use_llm = std::env::var("USE_LLM")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);
    let llm: Option<Arc<dyn LlmClient>> = if use_llm {
        Some(Arc::new(HttpLlmClient::new(LlmConfig::from_env()?)?))
    } else {
        None
    };
    let extractor: Arc<dyn FactExtractor> = match &llm {
        Some(llm) => Arc::new(LlmFactExtractor::new(llm.clone())),
        None => {
            warn!("USE_LLM not set, storing content verbatim");
            Arc::new(VerbatimExtractor)
        }
    };

    let ctx = RetainContext {
        db: db.clone(),
        embedder: embedder.clone(),
        extractor,
        llm,
    };
    let (queue, rx) = TaskQueue::new();
    let _pool = WorkerPool::spawn(
        ctx.clone(),
        queue.clone(),
        rx,
        hindsight_ingestion::worker::DEFAULT_WORKERS,
    );

    let state = AppState {
        engine: Arc::new(RecallEngine::new(
            db,
            embedder,
            encoder,
            RecallConfig::default(),
        )),
        pipeline: Arc::new(RetainPipeline::new(ctx, queue)),
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/recall", post(recall))
        .route("/retain", post(retain))
        .route("/operations/:operation_id", get(operation_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = std::env::var("HINDSIGHT_ADDR").unwrap_or_else(|_| "127.0.0.1:8760".to_string());
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "hindsight",
        "status": "healthy",
        "version": "0.1.0"
    }))
}

async fn recall(
    State(state): State<AppState>,
    Json(request): Json<RecallRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let response = state
        .engine
        .recall(&request)
        .await
        .map_err(|e| (status_for(&e), e.to_string()))?;
    Ok(Json(response))
}

async fn retain(
    State(state): State<AppState>,
    Json(request): Json<RetainRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let response = state
        .pipeline
        .retain(&request)
        .await
        .map_err(|e| (status_for(&e), e.to_string()))?;
    Ok(Json(response))
}

async fn operation_status(
    State(state): State<AppState>,
    Path(operation_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let record = state
        .pipeline
        .operation_status(&OperationId(operation_id))
        .await
        .map_err(|e| (status_for(&e), e.to_string()))?;
    Ok(Json(record))
}

fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Invalid(_) => StatusCode::BAD_REQUEST,
        EngineError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        EngineError::EmbedUnavailable(_)
        | EngineError::LlmUnavailable(_)
        | EngineError::CoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}
