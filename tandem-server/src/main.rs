//! Tandem Server - OpenAI-style chat completions over the tandem engine

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tandem_core::{
    ChatTemplate, Engine, EngineConfig, GenerationMetrics, GenerationRequest, LlamaEvaluator,
    Message, ModelInfo, ModelOptions, SamplingOptions, SchedulerStats, StopReason, TextStream,
};
use tower_http::cors::CorsLayer;
use tracing::{info, warn, Level};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
    model_id: Arc<str>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    messages: Vec<Message>,
    #[serde(default)]
    max_tokens: Option<usize>,
    #[serde(default)]
    stream: bool,
    #[serde(flatten)]
    sampling: SamplingOptions,
}

#[derive(Debug, Serialize)]
struct ChatCompletionResponse {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<Choice>,
    usage: Usage,
    timings: Timings,
}

#[derive(Debug, Serialize)]
struct Choice {
    index: usize,
    message: AssistantMessage,
    finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
struct AssistantMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChunkChoice {
    index: usize,
    delta: Delta,
    finish_reason: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatCompletionChunk {
    id: String,
    object: &'static str,
    created: u64,
    model: String,
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Serialize)]
struct Usage {
    prompt_tokens: usize,
    completion_tokens: usize,
    total_tokens: usize,
}

#[derive(Debug, Serialize)]
struct Timings {
    prompting_speed: f64,
    sampling_speed: f64,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    engine: SchedulerStats,
    model: ModelInfo,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn finish_reason(reason: &StopReason) -> &'static str {
    match reason {
        StopReason::EndOfSequence => "stop",
        StopReason::MaxTokens | StopReason::ContextFull => "length",
        StopReason::Cancelled => "cancelled",
        StopReason::Failed(_) => "error",
    }
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        engine: state.engine.stats(),
        model: state.engine.model_info().clone(),
    })
}

async fn list_models(State(state): State<AppState>) -> Json<serde_json::Value> {
    let info = state.engine.model_info();
    Json(serde_json::json!({
        "object": "list",
        "data": [{
            "id": &*state.model_id,
            "object": "model",
            "owned_by": "tandem",
            "permission": [],
            "context_length": info.context_length,
            "training_context_length": info.training_context_length,
            "layer_count": info.layer_count
        }]
    }))
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    info!(
        "Chat completion request: {} messages, max_tokens={:?}, stream={}",
        req.messages.len(),
        req.max_tokens,
        req.stream
    );

    let mut request = GenerationRequest::new(req.messages, &req.sampling)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    if let Some(max_tokens) = req.max_tokens {
        request = request
            .with_max_tokens(max_tokens)
            .map_err(|e| api_error(StatusCode::BAD_REQUEST, e))?;
    }

    let generation = state
        .engine
        .submit(request)
        .map_err(|e| api_error(StatusCode::SERVICE_UNAVAILABLE, e))?;
    let id = format!("chatcmpl-{}", generation.id());
    let text = generation.text_stream();

    if req.stream {
        Ok(Sse::new(sse_events(text, id, state.model_id.to_string()))
            .keep_alive(KeepAlive::default())
            .into_response())
    } else {
        Ok(complete(text, id, &state.model_id).await?.into_response())
    }
}

/// Collect the whole reply; dropping this future cancels the generation.
async fn complete(
    mut text: TextStream,
    id: String,
    model: &str,
) -> Result<Json<ChatCompletionResponse>, ApiError> {
    let mut content = String::new();
    while let Some(chunk) = text.next().await {
        content.push_str(&chunk);
    }

    let metrics: GenerationMetrics = text
        .metrics()
        .cloned()
        .ok_or_else(|| api_error(StatusCode::INTERNAL_SERVER_ERROR, "engine stopped"))?;
    if let StopReason::Failed(message) = &metrics.stop_reason {
        warn!("Generation {} failed: {}", id, message);
        return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, message));
    }

    info!(
        "Generated {} tokens at {:.2} tok/s (prompt {:.2} tok/s)",
        metrics.generated_tokens, metrics.sampling_speed, metrics.prompting_speed
    );

    Ok(Json(ChatCompletionResponse {
        id,
        object: "chat.completion",
        created: unix_now(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: AssistantMessage {
                role: "assistant",
                content,
            },
            finish_reason: finish_reason(&metrics.stop_reason),
        }],
        usage: Usage {
            prompt_tokens: metrics.prompt_tokens,
            completion_tokens: metrics.generated_tokens,
            total_tokens: metrics.prompt_tokens + metrics.generated_tokens,
        },
        timings: Timings {
            prompting_speed: metrics.prompting_speed,
            sampling_speed: metrics.sampling_speed,
        },
    }))
}

fn chunk_event(
    id: &str,
    model: &str,
    content: Option<String>,
    finish: Option<&'static str>,
) -> Event {
    let chunk = ChatCompletionChunk {
        id: id.to_string(),
        object: "chat.completion.chunk",
        created: unix_now(),
        model: model.to_string(),
        choices: vec![ChunkChoice {
            index: 0,
            delta: Delta { content },
            finish_reason: finish,
        }],
    };
    Event::default().data(serde_json::to_string(&chunk).unwrap_or_default())
}

/// SSE chunks for each decoded piece of text, a final chunk carrying the
/// finish reason, then `[DONE]`. A client disconnect drops the stream and
/// with it the generation.
fn sse_events(
    text: TextStream,
    id: String,
    model: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold(Some(text), move |state| {
        let id = id.clone();
        let model = model.clone();
        async move {
            let mut text = state?;
            match text.next().await {
                Some(chunk) => {
                    Some((chunk_event(&id, &model, Some(chunk), None), Some(text)))
                }
                None => {
                    let reason = text
                        .metrics()
                        .map_or("error", |m| finish_reason(&m.stop_reason));
                    Some((chunk_event(&id, &model, None, Some(reason)), None))
                }
            }
        }
    })
    .map(Ok)
    .chain(stream::once(async { Ok(Event::default().data("[DONE]")) }))
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let model_id = std::env::var("TANDEM_MODEL")
        .unwrap_or_else(|_| "HuggingFaceTB/SmolLM2-135M-Instruct".to_string());
    info!("Selected model: {}", model_id);

    let options = ModelOptions {
        context_length: env_or("TANDEM_CONTEXT_LENGTH", 0),
        gpu_layers: env_or("TANDEM_GPU_LAYERS", 0),
        thread_count: env_or("TANDEM_THREADS", 0),
        batch_thread_count: env_or("TANDEM_THREADS", 0),
        seed: std::env::var("TANDEM_SEED").ok().and_then(|v| v.parse().ok()),
        chat_template: std::env::var("TANDEM_CHAT_TEMPLATE")
            .ok()
            .and_then(|v| ChatTemplate::from_name(&v)),
        ..Default::default()
    };
    let config = EngineConfig::with_max_parallel(env_or("TANDEM_MAX_PARALLEL", 8));

    info!("Initializing engine...");
    let evaluator = LlamaEvaluator::load(&model_id, options)?;
    let engine = Engine::new(evaluator, config)?;
    info!(
        "Engine initialized with {} parallel slots, context {}",
        engine.stats().max_parallel,
        engine.context_length()
    );

    let state = AppState {
        engine: Arc::new(engine),
        model_id: Arc::from(model_id.as_str()),
    };

    // Build router
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let port: u16 = env_or("TANDEM_PORT", 8080);
    let addr = format!("0.0.0.0:{}", port);
    info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
