use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{self, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::form_urlencoded;

use super::registry::HubHandle;
use super::session::run_session;
use crate::config::{HubConfig, LoggingConfig};

/// Header carrying the authenticated user id, set by the fronting gateway
pub const USER_ID_HEADER: &str = "x-user-id";
/// Query parameter fallback for clients that cannot set headers
pub const USER_ID_QUERY_PARAM: &str = "user_id";

/// Accept WebSocket connections until `shutdown` fires. Each connection gets
/// its own task; a failed upgrade only affects that connection.
pub async fn run_websocket_server(
    listener: TcpListener,
    hub: HubHandle,
    config: HubConfig,
    logging: LoggingConfig,
    shutdown: CancellationToken,
) {
    match listener.local_addr() {
        Ok(addr) => info!("WebSocket listener on {}", addr),
        Err(e) => error!("WebSocket listener address unavailable: {}", e),
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        let hub = hub.clone();
        let config = config.clone();
        let logging = logging.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(config.handshake_timeout, upgrade(stream, &config)).await {
                Ok(Ok((ws, user_id))) => run_session(ws, user_id, hub, config, logging).await,
                Ok(Err(e)) => debug!(peer = %peer, error = %e, "WebSocket upgrade rejected"),
                Err(_) => debug!(
                    peer = %peer,
                    timeout = ?config.handshake_timeout,
                    "WebSocket upgrade timed out"
                ),
            }
        });
    }

    info!("WebSocket listener stopped");
}

/// Complete the WebSocket handshake, requiring a user identity on the
/// upgrade request
pub async fn upgrade<S>(
    stream: S,
    config: &HubConfig,
) -> anyhow::Result<(WebSocketStream<S>, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut user_id = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match user_id_from_request(request) {
            Some(id) => {
                user_id = Some(id);
                Ok(response)
            }
            None => {
                let mut rejection = ErrorResponse::new(Some("missing user identity".to_string()));
                *rejection.status_mut() = StatusCode::UNAUTHORIZED;
                Err(rejection)
            }
        }
    };

    let ws = accept_hdr_async_with_config(stream, callback, Some(websocket_config(config))).await?;
    let user_id = user_id.ok_or_else(|| anyhow::anyhow!("handshake completed without a user id"))?;
    Ok((ws, user_id))
}

fn websocket_config(config: &HubConfig) -> WebSocketConfig {
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_frame_bytes);
    ws_config.max_frame_size = Some(config.max_frame_bytes);
    ws_config
}

/// User id from the identity header, falling back to the percent-decoded
/// query string
pub fn user_id_from_request<B>(request: &http::Request<B>) -> Option<String> {
    let from_header = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty());
    if let Some(id) = from_header {
        return Some(id.to_string());
    }

    let query = request.uri().query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == USER_ID_QUERY_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|id| !id.is_empty())
}
