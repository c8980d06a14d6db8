use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::client::RemoteRequest;
use crate::dispatcher::{Dispatcher, ExecutionRequest};
use crate::error::AiError;
use crate::models::{DispatchOutput, ExecutionMode, ExecutionResult};
use crate::stream::{StreamEvent, StreamSink};
use crate::telemetry;

/**
 * \brief 启动远程执行服务。
 * \param addr 监听地址，如 "127.0.0.1:3000"
 */
pub async fn run(addr: &str, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, dispatcher).await
}

/**
 * \brief 在已绑定的监听器上提供服务（测试可绑定随机端口）。
 */
pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "execution server listening");
    telemetry::log_event("server", &format!("listening on {addr}"));
    axum::serve(listener, router(dispatcher)).await?;
    Ok(())
}

/**
 * \brief 路由：POST /api/ai/execute、POST /api/ai/stream、GET /health。
 */
pub fn router(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route("/api/ai/execute", post(execute))
        .route("/api/ai/stream", post(stream))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(dispatcher)
}

/** \brief 对外错误：`{success:false, error, statusCode}`。 */
struct ApiError(AiError);

impl From<AiError> for ApiError {
    fn from(err: AiError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = status_for(&self.0);
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(error_body(&self.0))).into_response()
    }
}

fn status_for(err: &AiError) -> u16 {
    err.status_code().unwrap_or(match err {
        AiError::Validation(_) | AiError::Config(_) => 400,
        AiError::FileSupport(_) => 422,
        _ => 500,
    })
}

fn error_body(err: &AiError) -> serde_json::Value {
    json!({
        "success": false,
        "error": err.to_string(),
        "statusCode": status_for(err),
    })
}

#[derive(Serialize)]
struct ExecuteReply {
    success: bool,
    #[serde(flatten)]
    result: ExecutionResult,
}

fn into_execution_request(body: RemoteRequest) -> Result<ExecutionRequest, AiError> {
    let mode: ExecutionMode = body.mode.parse()?;
    Ok(ExecutionRequest::new(mode, body.messages, body.config).force_local())
}

async fn execute(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(body): Json<RemoteRequest>,
) -> Result<Response, ApiError> {
    let request = into_execution_request(body)?;
    debug!(mode = %request.mode, models = request.config.models.len(), "execute request");
    match dispatcher.dispatch(request).await? {
        DispatchOutput::TestRace(results) => Ok(Json(json!({ "results": results })).into_response()),
        DispatchOutput::Completion(result) => Ok(Json(ExecuteReply {
            success: true,
            result,
        })
        .into_response()),
    }
}

/**
 * \brief SSE 执行：增量为 `{"chunk"}`，成功以 `[DONE]` 结束，失败发送 `{"error", "statusCode"}`。
 */
async fn stream(
    State(dispatcher): State<Arc<Dispatcher>>,
    Json(body): Json<RemoteRequest>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let cancel = CancellationToken::new();
    let (sink, mut events) = StreamSink::channel();
    let request = into_execution_request(body)?
        .with_stream(sink)
        .with_cancel(cancel.clone());
    debug!(mode = %request.mode, models = request.config.models.len(), "stream request");

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    tokio::spawn(async move {
        let forward = forward_chunks(events, &tx, &cancel);
        let (outcome, ()) = tokio::join!(dispatcher.dispatch(request), forward);

        let last = match outcome {
            Ok(_) => Event::default().data("[DONE]"),
            Err(err) => {
                telemetry::log_error("server", &format!("stream failed: {err}"));
                Event::default().data(error_body(&err).to_string())
            }
        };
        let _ = tx.send(Ok(last));
    });

    Ok(Sse::new(UnboundedReceiverStream::new(rx)).keep_alive(KeepAlive::new()))
}

/**
 * \brief 把 sink 的增量转成 SSE 数据，直到 sink 关闭。
 *
 * 客户端断开（接收端被丢弃）时立即取消执行，不必等到下一个增量。
 */
async fn forward_chunks(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    tx: &mpsc::UnboundedSender<Result<Event, Infallible>>,
    cancel: &CancellationToken,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(StreamEvent::Chunk { chunk }) => {
                    let data = json!({ "chunk": chunk }).to_string();
                    if tx.send(Ok(Event::default().data(data))).is_err() {
                        cancel.cancel();
                    }
                }
                Some(_) => {}
                None => break,
            },
            () = tx.closed(), if !cancel.is_cancelled() => {
                debug!("stream client disconnected, cancelling execution");
                cancel.cancel();
            }
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
