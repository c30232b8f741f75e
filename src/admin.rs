// ============================================================================
// Admin HTTP listener
// ============================================================================
//
//   GET  /health                              liveness, plus bus reachability
//   GET  /metrics                             Prometheus text format
//   PUT  /conversations/{id}/participants     replace cached member list
//   POST /notifications                       push a new-message alert
//
// ============================================================================

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};
use crate::hub::{HubHandle, NewMessageNotification};
use crate::kafka::EventBus;
use crate::metrics;

/// Request bodies are small JSON documents
const MAX_BODY_BYTES: usize = 64 * 1024;

type HttpResult = Result<Response<Full<Bytes>>, Infallible>;

#[derive(Clone)]
pub struct AdminState {
    pub hub: HubHandle,
    /// Present when the event bus is enabled
    pub bus: Option<Arc<EventBus>>,
}

pub async fn http_handler<B>(req: Request<B>, state: AdminState) -> HttpResult
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    let result = match (&method, segments.as_slice()) {
        (&Method::GET, ["health"]) => Ok(health(&state).await),
        (&Method::GET, ["metrics"]) => metrics_response(),
        (&Method::PUT, ["conversations", conversation_id, "participants"])
            if !conversation_id.is_empty() =>
        {
            set_participants(conversation_id, req.into_body(), &state).await
        }
        (&Method::POST, ["notifications"]) => notify(req.into_body(), &state).await,
        _ => Err(AppError::NotFound(format!("Route {} {}", method, path))),
    };

    Ok(result.unwrap_or_else(AppError::to_hyper_response))
}

async fn health(state: &AdminState) -> Response<Full<Bytes>> {
    let connected_users = state.hub.connected_users();
    let Some(bus) = &state.bus else {
        return json_response(
            StatusCode::OK,
            json!({"status": "ok", "connected_users": connected_users, "event_bus": "disabled"}),
        );
    };

    match bus.health().await {
        Ok(()) => json_response(
            StatusCode::OK,
            json!({"status": "ok", "connected_users": connected_users, "event_bus": "ok"}),
        ),
        Err(e) => {
            tracing::error!("Health check failed: {}", e);
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                json!({"status": "degraded", "connected_users": connected_users, "event_bus": "unreachable"}),
            )
        }
    }
}

fn metrics_response() -> AppResult<Response<Full<Bytes>>> {
    let metrics_data = metrics::gather_metrics()
        .map_err(|e| AppError::internal(format!("Failed to gather metrics: {}", e)))?;
    let mut res = Response::new(Full::new(Bytes::from(metrics_data)));
    if let Ok(content_type) = "text/plain; version=0.0.4".parse() {
        res.headers_mut().insert("Content-Type", content_type);
    }
    Ok(res)
}

async fn set_participants<B>(
    conversation_id: &str,
    body: B,
    state: &AdminState,
) -> AppResult<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let participants: Vec<String> = read_json(body).await?;
    if participants.iter().any(|p| p.is_empty()) {
        return Err(AppError::validation("participant ids must not be empty"));
    }

    let count = participants.len();
    state
        .hub
        .set_conversation_participants(conversation_id, participants)
        .await;
    tracing::debug!(participants = count, "Conversation participants updated");

    Ok(json_response(
        StatusCode::OK,
        json!({"conversation_id": conversation_id, "participants": count}),
    ))
}

async fn notify<B>(body: B, state: &AdminState) -> AppResult<Response<Full<Bytes>>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let notification: NewMessageNotification = read_json(body).await?;
    notification.validate().map_err(AppError::Validation)?;

    let outcome = state.hub.notify_new_message(&notification).await?;
    Ok(json_response(
        StatusCode::ACCEPTED,
        json!({"outcome": outcome.as_str()}),
    ))
}

async fn read_json<T, B>(body: B) -> AppResult<T>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let bytes = Limited::new(body, MAX_BODY_BYTES)
        .collect()
        .await
        .map_err(|e| AppError::validation(format!("Unreadable request body: {}", e)))?
        .to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    let mut res = Response::new(Full::new(Bytes::from(body.to_string())));
    *res.status_mut() = status;
    if let Ok(content_type) = "application/json".parse() {
        res.headers_mut().insert("content-type", content_type);
    }
    res
}

/// Serve the admin listener until `shutdown` fires
pub async fn run_http_server(
    listener: TcpListener,
    state: AdminState,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    tracing::info!("HTTP admin server listening on http://{}", listener.local_addr()?);

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| http_handler(req, state.clone()));

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Error serving HTTP connection: {:?}", err);
            }
        });
    }

    tracing::info!("HTTP admin server stopped");
    Ok(())
}
