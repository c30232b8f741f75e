// ============================================================================
// Connection Session
// ============================================================================
//
// One session per WebSocket connection, made of two halves:
//
//   read pump  - runs inline; decodes inbound frames and routes them through
//                the hub. Any read error, oversize or malformed frame, or
//                idle deadline ends the session.
//   write pump - spawned; the only writer to the socket. Drains the outbound
//                queue, coalescing whatever is already waiting into a single
//                newline-delimited text message, and sends periodic pings.
//
// Whichever half stops first cancels the session token so the other follows.
// Teardown always unregisters from the hub with the session id, then waits
// for the write pump to close the socket.
//
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::protocol::{InboundFrame, InboundKind, OutboundFrame};
use super::registry::HubHandle;
use crate::config::{HubConfig, LoggingConfig};
use crate::error::{HubError, SessionError};
use crate::metrics;

/// Floor for the keep-alive ticker; a zero period is not a valid interval
const MIN_PING_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Disconnecting,
    Closed,
}

impl SessionState {
    /// Connecting -> Connected -> Disconnecting -> Closed, with a direct
    /// Connecting -> Disconnecting for sessions that never registered
    pub fn can_transition_to(self, next: SessionState) -> bool {
        matches!(
            (self, next),
            (SessionState::Connecting, SessionState::Connected)
                | (SessionState::Connecting, SessionState::Disconnecting)
                | (SessionState::Connected, SessionState::Disconnecting)
                | (SessionState::Disconnecting, SessionState::Closed)
        )
    }

    fn advance(&mut self, next: SessionState) {
        if self.can_transition_to(next) {
            *self = next;
        } else {
            warn!(from = ?*self, to = ?next, "Ignoring invalid session state transition");
        }
    }
}

/// The hub's view of a session: identity plus the sending end of its
/// bounded outbound queue
pub struct SessionHandle {
    session_id: String,
    user_id: String,
    outbound: mpsc::Sender<Arc<OutboundFrame>>,
    cancel: CancellationToken,
}

impl SessionHandle {
    pub fn new(
        user_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<OutboundFrame>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            outbound: tx,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Token that stops both pumps of this session
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn try_enqueue(
        &self,
        frame: Arc<OutboundFrame>,
    ) -> Result<(), TrySendError<Arc<OutboundFrame>>> {
        self.outbound.try_send(frame)
    }

    /// Close the outbound queue and stop the session
    pub(crate) fn close(self) {
        self.cancel.cancel();
    }
}

/// Drive one upgraded connection from registration to socket close
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    user_id: String,
    hub: HubHandle,
    config: HubConfig,
    logging: LoggingConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut state = SessionState::Connecting;
    let user = logging.user_id(&user_id);

    let (handle, outbound) = SessionHandle::new(user_id.as_str(), config.outbound_queue_capacity);
    let session_id = handle.session_id().to_string();
    let cancel = handle.cancellation();
    let (sink, stream) = ws.split();

    if let Err(e) = hub.register(handle).await {
        warn!(user = %user, error = %e, "Rejecting connection, hub unavailable");
        state.advance(SessionState::Disconnecting);
        return;
    }
    state.advance(SessionState::Connected);
    metrics::CONNECTIONS_TOTAL.inc();
    info!(user = %user, session = %session_id, "Session connected");

    let writer = tokio::spawn(write_pump(sink, outbound, cancel.clone(), config.clone()));
    let reason = read_pump(stream, &user_id, &hub, &config, &cancel).await;

    state.advance(SessionState::Disconnecting);
    if reason.is_failure() {
        metrics::SESSION_FAILURES.inc();
        warn!(user = %user, session = %session_id, reason = %reason, "Session failed");
    } else {
        debug!(user = %user, session = %session_id, reason = %reason, "Session ending");
    }

    // A stopped hub has already dropped every session
    let _ = hub.unregister(&user_id, &session_id).await;
    cancel.cancel();

    match writer.await {
        Ok(Err(e)) => debug!(user = %user, error = %e, "Write pump stopped with error"),
        Err(e) => warn!(user = %user, error = %e, "Write pump task failed"),
        Ok(Ok(())) => {}
    }

    state.advance(SessionState::Closed);
    info!(user = %user, session = %session_id, "Session closed");
}

async fn read_pump<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    user_id: &str,
    hub: &HubHandle,
    config: &HubConfig,
    cancel: &CancellationToken,
) -> SessionError
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return SessionError::Cancelled,
            next = tokio::time::timeout(config.read_timeout, stream.next()) => next,
        };

        let message = match next {
            Err(_) => return SessionError::IdleTimeout(config.read_timeout),
            Ok(None) => return SessionError::ClientClosed,
            Ok(Some(Err(e))) => return SessionError::Read(e.to_string()),
            Ok(Some(Ok(message))) => message,
        };

        match message {
            WsMessage::Text(text) => {
                if text.len() > config.max_frame_bytes {
                    return SessionError::Oversized {
                        size: text.len(),
                        max: config.max_frame_bytes,
                    };
                }
                let frame = match InboundFrame::parse(&text) {
                    Ok(frame) => frame,
                    Err(e) => return SessionError::Malformed(e),
                };
                if let Err(e) = route_inbound(hub, user_id, frame).await {
                    return SessionError::Hub(e);
                }
            }
            WsMessage::Binary(_) => {
                return SessionError::Malformed("binary frames are not supported".to_string());
            }
            WsMessage::Close(_) => return SessionError::ClientClosed,
            // Pongs only extend the read deadline; tungstenite answers pings
            WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_) => {}
        }
    }
}

/// Act on one decoded client frame. Returns how many recipients it was
/// routed to.
pub async fn route_inbound(
    hub: &HubHandle,
    sender_id: &str,
    frame: InboundFrame,
) -> Result<usize, HubError> {
    match frame.kind {
        InboundKind::Typing => {
            let outbound = OutboundFrame::typing(
                &frame.conversation_id,
                sender_id,
                frame.is_typing.unwrap_or(false),
            );
            hub.fan_out(&frame.conversation_id, sender_id, outbound).await
        }
        InboundKind::Read => {
            let outbound = OutboundFrame::read_receipt(
                &frame.conversation_id,
                sender_id,
                frame.message_id.as_deref(),
            );
            hub.fan_out(&frame.conversation_id, sender_id, outbound).await
        }
        InboundKind::Presence => Ok(0),
    }
}

async fn write_pump<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut outbound: mpsc::Receiver<Arc<OutboundFrame>>,
    cancel: CancellationToken,
    config: HubConfig,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let period = config.ping_interval.max(MIN_PING_INTERVAL);
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let result = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break Ok(()),
            _ = ping.tick() => {
                if let Err(e) = write_with_deadline(&mut sink, WsMessage::Ping(Vec::new()), &config).await {
                    break Err(e);
                }
            }
            frame = outbound.recv() => {
                // A closed queue means the hub dropped this session
                let Some(frame) = frame else { break Ok(()) };
                let batch = match coalesce(frame, &mut outbound) {
                    Ok(batch) => batch,
                    Err(e) => break Err(e),
                };
                if let Err(e) = write_with_deadline(&mut sink, WsMessage::Text(batch), &config).await {
                    break Err(e);
                }
            }
        }
    };

    cancel.cancel();
    let _ = tokio::time::timeout(config.write_timeout, sink.close()).await;
    result
}

/// Serialize `first` plus every frame already waiting in the queue as
/// newline-delimited JSON
fn coalesce(
    first: Arc<OutboundFrame>,
    outbound: &mut mpsc::Receiver<Arc<OutboundFrame>>,
) -> Result<String, SessionError> {
    let mut batch =
        serde_json::to_string(first.as_ref()).map_err(|e| SessionError::Write(e.to_string()))?;
    while let Ok(next) = outbound.try_recv() {
        batch.push('\n');
        batch.push_str(
            &serde_json::to_string(next.as_ref()).map_err(|e| SessionError::Write(e.to_string()))?,
        );
    }
    Ok(batch)
}

async fn write_with_deadline<S>(
    sink: &mut SplitSink<WebSocketStream<S>, WsMessage>,
    message: WsMessage,
    config: &HubConfig,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(config.write_timeout, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(SessionError::Write(e.to_string())),
        Err(_) => Err(SessionError::Write(format!(
            "no progress within {:?}",
            config.write_timeout
        ))),
    }
}
