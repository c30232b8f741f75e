// ============================================================================
// Connection Hub
// ============================================================================
//
// A single task owns the user -> session registry and processes commands one
// at a time, so registration, removal and delivery are serialized without
// any lock on the registry itself. The loop never awaits a session: frames
// are offered with `try_send` and a full queue evicts that session.
//
// The registry holds the only sender of every session's outbound queue.
// Dropping an entry therefore closes the queue, which is the write pump's
// signal to shut the connection down.
//
// ============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::protocol::{NewMessageNotification, OutboundFrame, PresenceStatus};
use super::session::SessionHandle;
use crate::config::{HubConfig, LoggingConfig};
use crate::error::HubError;
use crate::metrics;

/// Result of offering one frame to one recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Queued on the recipient's session
    Delivered,
    /// No session registered for the recipient; the frame is dropped
    RecipientOffline,
    /// The recipient's queue was full; the session was disconnected
    SessionEvicted,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::RecipientOffline => "recipient_offline",
            DeliveryOutcome::SessionEvicted => "session_evicted",
        }
    }
}

pub enum HubCommand {
    Register(SessionHandle),
    Unregister {
        user_id: String,
        session_id: String,
    },
    Deliver {
        recipient_id: String,
        frame: Arc<OutboundFrame>,
        reply: Option<oneshot::Sender<DeliveryOutcome>>,
    },
}

/// The command loop. Create with [`Hub::new`] and drive with [`Hub::run`].
pub struct Hub {
    commands: mpsc::Receiver<HubCommand>,
    sessions: HashMap<String, SessionHandle>,
    online: Arc<AtomicUsize>,
    logging: LoggingConfig,
}

/// Cloneable front door to the hub, shared by sessions, the admin API and
/// the event bus bridge
#[derive(Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
    participants: Arc<RwLock<HashMap<String, Vec<String>>>>,
    online: Arc<AtomicUsize>,
}

enum Offer {
    Queued,
    Offline,
    Full,
    Closed,
}

impl Hub {
    pub fn new(config: &HubConfig, logging: LoggingConfig) -> (Hub, HubHandle) {
        let (tx, rx) = mpsc::channel(config.command_buffer.max(1));
        let online = Arc::new(AtomicUsize::new(0));

        let hub = Hub {
            commands: rx,
            sessions: HashMap::new(),
            online: Arc::clone(&online),
            logging,
        };
        let handle = HubHandle {
            commands: tx,
            participants: Arc::new(RwLock::new(HashMap::new())),
            online,
        };
        (hub, handle)
    }

    /// Process commands until `shutdown` fires or every handle is dropped.
    /// Remaining sessions are closed on the way out.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Connection hub started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
            }
        }

        let remaining = self.sessions.len();
        for (_, session) in self.sessions.drain() {
            session.close();
        }
        self.sync_online();
        info!(closed_sessions = remaining, "Connection hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(session) => self.register(session),
            HubCommand::Unregister {
                user_id,
                session_id,
            } => self.unregister(&user_id, &session_id),
            HubCommand::Deliver {
                recipient_id,
                frame,
                reply,
            } => {
                let outcome = self.deliver(&recipient_id, frame);
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
        }
    }

    fn register(&mut self, session: SessionHandle) {
        let user_id = session.user_id().to_string();
        let session_id = session.session_id().to_string();

        if let Some(previous) = self.sessions.insert(user_id.clone(), session) {
            // No offline presence: the user never stopped being online
            info!(
                user = %self.logging.user_id(&user_id),
                previous_session = %previous.session_id(),
                session = %session_id,
                "Session superseded by newer connection"
            );
            previous.close();
            metrics::SESSIONS_SUPERSEDED.inc();
        } else {
            info!(
                user = %self.logging.user_id(&user_id),
                session = %session_id,
                "Session registered"
            );
        }
        self.sync_online();

        let frame = Arc::new(OutboundFrame::presence(&user_id, PresenceStatus::Online));
        let overflowed = self.broadcast(&user_id, &frame);
        self.disconnect(overflowed);
    }

    fn unregister(&mut self, user_id: &str, session_id: &str) {
        match self.sessions.get(user_id) {
            Some(current) if current.session_id() == session_id => {
                self.disconnect(VecDeque::from([user_id.to_string()]));
            }
            _ => debug!(
                user = %self.logging.user_id(user_id),
                session = %session_id,
                "Ignoring unregister for a session that is no longer current"
            ),
        }
    }

    fn deliver(&mut self, recipient_id: &str, frame: Arc<OutboundFrame>) -> DeliveryOutcome {
        match self.offer(recipient_id, frame) {
            Offer::Queued => {
                metrics::FRAMES_DELIVERED.inc();
                DeliveryOutcome::Delivered
            }
            Offer::Offline => {
                metrics::FRAMES_RECIPIENT_OFFLINE.inc();
                debug!(
                    recipient = %self.logging.user_id(recipient_id),
                    "Recipient offline, frame dropped"
                );
                DeliveryOutcome::RecipientOffline
            }
            Offer::Closed => {
                // Session is already tearing itself down
                metrics::FRAMES_RECIPIENT_OFFLINE.inc();
                self.disconnect(VecDeque::from([recipient_id.to_string()]));
                DeliveryOutcome::RecipientOffline
            }
            Offer::Full => {
                self.evict(recipient_id);
                DeliveryOutcome::SessionEvicted
            }
        }
    }

    fn offer(&self, recipient_id: &str, frame: Arc<OutboundFrame>) -> Offer {
        let Some(session) = self.sessions.get(recipient_id) else {
            return Offer::Offline;
        };
        match session.try_enqueue(frame) {
            Ok(()) => Offer::Queued,
            Err(TrySendError::Full(_)) => Offer::Full,
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    fn evict(&mut self, user_id: &str) {
        warn!(
            user = %self.logging.user_id(user_id),
            "Outbound queue full, evicting slow session"
        );
        metrics::SESSIONS_EVICTED.inc();
        self.disconnect(VecDeque::from([user_id.to_string()]));
    }

    /// Offer `frame` to every session except `except`. Returns the users
    /// whose queue could not take it.
    fn broadcast(&mut self, except: &str, frame: &Arc<OutboundFrame>) -> VecDeque<String> {
        let mut overflowed = VecDeque::new();
        for (user_id, session) in &self.sessions {
            if user_id == except {
                continue;
            }
            match session.try_enqueue(Arc::clone(frame)) {
                Ok(()) => metrics::FRAMES_DELIVERED.inc(),
                Err(TrySendError::Full(_)) => {
                    warn!(
                        user = %self.logging.user_id(user_id),
                        "Outbound queue full, evicting slow session"
                    );
                    metrics::SESSIONS_EVICTED.inc();
                    overflowed.push_back(user_id.clone());
                }
                Err(TrySendError::Closed(_)) => overflowed.push_back(user_id.clone()),
            }
        }
        overflowed
    }

    /// Remove each user's session and tell everyone else they went offline.
    /// Sessions that overflow on that notice join the worklist, so a cascade
    /// of evictions is processed iteratively.
    fn disconnect(&mut self, mut pending: VecDeque<String>) {
        while let Some(user_id) = pending.pop_front() {
            let Some(session) = self.sessions.remove(&user_id) else {
                continue;
            };
            info!(
                user = %self.logging.user_id(&user_id),
                session = %session.session_id(),
                "Session removed"
            );
            session.close();
            self.sync_online();

            let frame = Arc::new(OutboundFrame::presence(&user_id, PresenceStatus::Offline));
            pending.extend(self.broadcast(&user_id, &frame));
        }
    }

    fn sync_online(&self) {
        let count = self.sessions.len();
        self.online.store(count, Ordering::Relaxed);
        metrics::ACTIVE_SESSIONS.set(count as i64);
    }
}

impl HubHandle {
    pub async fn register(&self, session: SessionHandle) -> Result<(), HubError> {
        self.send(HubCommand::Register(session)).await
    }

    /// Remove `user_id`'s session only if `session_id` is still the current
    /// one; a superseded session's late unregister is a no-op.
    pub async fn unregister(&self, user_id: &str, session_id: &str) -> Result<(), HubError> {
        self.send(HubCommand::Unregister {
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Queue a frame for `recipient_id` without waiting for the outcome
    pub async fn deliver(&self, recipient_id: &str, frame: OutboundFrame) -> Result<(), HubError> {
        self.send(HubCommand::Deliver {
            recipient_id: recipient_id.to_string(),
            frame: Arc::new(frame),
            reply: None,
        })
        .await
    }

    /// Queue a frame for `recipient_id` and report what happened to it
    pub async fn deliver_and_wait(
        &self,
        recipient_id: &str,
        frame: OutboundFrame,
    ) -> Result<DeliveryOutcome, HubError> {
        let (reply, outcome) = oneshot::channel();
        self.send(HubCommand::Deliver {
            recipient_id: recipient_id.to_string(),
            frame: Arc::new(frame),
            reply: Some(reply),
        })
        .await?;
        outcome.await.map_err(|_| HubError::Stopped)
    }

    /// Push a new-message alert to the recipient's session, if any
    pub async fn notify_new_message(
        &self,
        notification: &NewMessageNotification,
    ) -> Result<DeliveryOutcome, HubError> {
        self.deliver_and_wait(
            &notification.recipient_id,
            OutboundFrame::new_message(notification),
        )
        .await
    }

    /// Replace the cached member list of a conversation. An empty list
    /// forgets the conversation.
    pub async fn set_conversation_participants(
        &self,
        conversation_id: &str,
        participants: Vec<String>,
    ) {
        let mut cache = self.participants.write().await;
        if participants.is_empty() {
            cache.remove(conversation_id);
        } else {
            cache.insert(conversation_id.to_string(), participants);
        }
    }

    /// Cached members of a conversation; empty when unknown
    pub async fn conversation_participants(&self, conversation_id: &str) -> Vec<String> {
        self.participants
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Send `frame` to every cached participant of `conversation_id` except
    /// `sender_id`. Returns how many recipients were addressed.
    pub async fn fan_out(
        &self,
        conversation_id: &str,
        sender_id: &str,
        frame: OutboundFrame,
    ) -> Result<usize, HubError> {
        let participants = self.conversation_participants(conversation_id).await;
        let frame = Arc::new(frame);

        let mut addressed = 0;
        for participant in participants.iter().filter(|p| p.as_str() != sender_id) {
            self.send(HubCommand::Deliver {
                recipient_id: participant.clone(),
                frame: Arc::clone(&frame),
                reply: None,
            })
            .await?;
            addressed += 1;
        }
        Ok(addressed)
    }

    /// Number of users with a registered session
    pub fn connected_users(&self) -> usize {
        self.online.load(Ordering::Relaxed)
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::protocol::OutboundKind;
    use tokio::sync::mpsc::error::TryRecvError;

    fn start(capacity: usize) -> (HubHandle, CancellationToken) {
        let config = HubConfig {
            outbound_queue_capacity: capacity,
            ..HubConfig::default()
        };
        let (hub, handle) = Hub::new(&config, LoggingConfig::default());
        let shutdown = CancellationToken::new();
        tokio::spawn(hub.run(shutdown.clone()));
        (handle, shutdown)
    }

    /// Round-trip through the loop so every earlier command has been applied
    async fn settle(hub: &HubHandle) {
        hub.deliver_and_wait("__nobody__", OutboundFrame::presence("x", PresenceStatus::Online))
            .await
            .unwrap();
    }

    async fn connect(
        hub: &HubHandle,
        user_id: &str,
        capacity: usize,
    ) -> (String, CancellationToken, mpsc::Receiver<Arc<OutboundFrame>>) {
        let (session, rx) = SessionHandle::new(user_id, capacity);
        let session_id = session.session_id().to_string();
        let cancel = session.cancellation();
        hub.register(session).await.unwrap();
        settle(hub).await;
        (session_id, cancel, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<OutboundFrame>>) -> Vec<Arc<OutboundFrame>> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_lone_user_receives_no_presence() {
        let (hub, _shutdown) = start(256);
        let (_, _, mut rx) = connect(&hub, "u1", 256).await;

        assert_eq!(hub.connected_users(), 1);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn test_register_announces_online_to_others() {
        let (hub, _shutdown) = start(256);
        let (_, _, mut rx1) = connect(&hub, "u1", 256).await;
        let (_, _, mut rx2) = connect(&hub, "u2", 256).await;

        let frames = drain(&mut rx1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, OutboundKind::Presence);
        assert_eq!(frames[0].user_id.as_deref(), Some("u2"));
        assert_eq!(frames[0].status.as_deref(), Some("online"));
        assert!(drain(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn test_newer_session_supersedes_older() {
        let (hub, _shutdown) = start(256);
        let (_, _, mut watcher) = connect(&hub, "watcher", 256).await;
        let (old_id, old_cancel, mut old_rx) = connect(&hub, "u1", 256).await;
        let (_, new_cancel, mut new_rx) = connect(&hub, "u1", 256).await;
        drain(&mut watcher);

        // Old queue is closed and the old session told to stop
        assert!(matches!(old_rx.try_recv(), Err(TryRecvError::Disconnected)));
        assert!(old_cancel.is_cancelled());
        assert!(!new_cancel.is_cancelled());
        assert_eq!(hub.connected_users(), 2);

        // The old session's late unregister must not remove the new one
        hub.unregister("u1", &old_id).await.unwrap();
        let outcome = hub
            .deliver_and_wait("u1", OutboundFrame::typing("c1", "watcher", true))
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(drain(&mut new_rx).len(), 1);
        assert!(drain(&mut watcher).is_empty(), "no offline presence for a superseded session");
    }

    #[tokio::test]
    async fn test_unregister_current_session_announces_offline() {
        let (hub, _shutdown) = start(256);
        let (_, _, mut rx1) = connect(&hub, "u1", 256).await;
        let (session_id, _, _rx2) = connect(&hub, "u2", 256).await;
        drain(&mut rx1);

        hub.unregister("u2", &session_id).await.unwrap();
        settle(&hub).await;

        assert_eq!(hub.connected_users(), 1);
        let frames = drain(&mut rx1);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status.as_deref(), Some("offline"));
    }

    #[tokio::test]
    async fn test_unregister_unknown_user_is_noop() {
        let (hub, _shutdown) = start(256);
        let (_, _, mut rx1) = connect(&hub, "u1", 256).await;

        hub.unregister("ghost", "no-such-session").await.unwrap();
        settle(&hub).await;

        assert_eq!(hub.connected_users(), 1);
        assert!(drain(&mut rx1).is_empty());
    }

    #[tokio::test]
    async fn test_deliver_to_offline_recipient() {
        let (hub, _shutdown) = start(256);
        let outcome = hub
            .deliver_and_wait("u9", OutboundFrame::typing("c1", "u1", true))
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::RecipientOffline);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_only_the_slow_session() {
        let (hub, _shutdown) = start(256);
        let (_, _, mut fast_rx) = connect(&hub, "fast", 256).await;
        let (_, slow_cancel, _slow_rx) = connect(&hub, "slow", 256).await;
        drain(&mut fast_rx);

        let mut outcomes = Vec::new();
        for i in 0..300 {
            let frame = OutboundFrame::typing("c1", "fast", i % 2 == 0);
            outcomes.push(hub.deliver_and_wait("slow", frame).await.unwrap());
        }

        let delivered = outcomes
            .iter()
            .filter(|o| **o == DeliveryOutcome::Delivered)
            .count();
        assert_eq!(delivered, 256);
        assert_eq!(outcomes[256], DeliveryOutcome::SessionEvicted);
        assert!(
            outcomes[257..]
                .iter()
                .all(|o| *o == DeliveryOutcome::RecipientOffline)
        );
        assert!(slow_cancel.is_cancelled());
        assert_eq!(hub.connected_users(), 1);

        // The healthy session keeps working and saw the slow one go offline
        let frames = drain(&mut fast_rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].user_id.as_deref(), Some("slow"));
        assert_eq!(frames[0].status.as_deref(), Some("offline"));
    }

    #[tokio::test]
    async fn test_eviction_cascade_is_bounded() {
        let (hub, _shutdown) = start(1);
        // Nobody reads: "a" and "b" hold one frame each, "c" has headroom
        let (_, a_cancel, _a) = connect(&hub, "a", 1).await;
        let (_, b_cancel, _b) = connect(&hub, "b", 1).await;
        let (_, c_cancel, _c) = connect(&hub, "c", 4).await;

        // "a" was full after "b" joined, so "c" joining evicted it, and the
        // resulting offline notice overflowed "b" in turn
        assert!(a_cancel.is_cancelled());
        assert!(b_cancel.is_cancelled());
        assert!(!c_cancel.is_cancelled());
        assert_eq!(hub.connected_users(), 1);
    }

    #[tokio::test]
    async fn test_fan_out_skips_sender() {
        let (hub, _shutdown) = start(256);
        let (_, _, mut rx1) = connect(&hub, "u1", 256).await;
        let (_, _, mut rx2) = connect(&hub, "u2", 256).await;
        drain(&mut rx1);

        hub.set_conversation_participants("c1", vec!["u1".into(), "u2".into()])
            .await;
        let addressed = hub
            .fan_out("c1", "u1", OutboundFrame::typing("c1", "u1", true))
            .await
            .unwrap();
        settle(&hub).await;

        assert_eq!(addressed, 1);
        assert!(drain(&mut rx1).is_empty());
        let frames = drain(&mut rx2);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].kind, OutboundKind::Typing);
    }

    #[tokio::test]
    async fn test_fan_out_for_unknown_conversation_addresses_nobody() {
        let (hub, _shutdown) = start(256);
        let addressed = hub
            .fan_out("nope", "u1", OutboundFrame::typing("nope", "u1", true))
            .await
            .unwrap();
        assert_eq!(addressed, 0);
    }

    #[tokio::test]
    async fn test_participants_cache_replace_and_forget() {
        let (hub, _shutdown) = start(256);
        hub.set_conversation_participants("c1", vec!["u1".into()]).await;
        hub.set_conversation_participants("c1", vec!["u1".into(), "u3".into()])
            .await;
        assert_eq!(hub.conversation_participants("c1").await, vec!["u1", "u3"]);

        hub.set_conversation_participants("c1", Vec::new()).await;
        assert!(hub.conversation_participants("c1").await.is_empty());
    }

    #[tokio::test]
    async fn test_notify_new_message() {
        let (hub, _shutdown) = start(256);
        let (_, _, mut rx) = connect(&hub, "u2", 256).await;

        let outcome = hub
            .notify_new_message(&NewMessageNotification {
                recipient_id: "u2".into(),
                sender_id: "u1".into(),
                conversation_id: Some("c1".into()),
                content: "hi".into(),
            })
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered);
        let frames = drain(&mut rx);
        assert_eq!(frames[0].kind, OutboundKind::NewMessage);
        assert_eq!(frames[0].content.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_rejects_commands() {
        let (hub, shutdown) = start(256);
        let (_, cancel, _rx) = connect(&hub, "u1", 256).await;

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), cancel.cancelled())
            .await
            .unwrap();

        // Loop has exited and dropped its receiver
        let mut rejected = false;
        for _ in 0..50 {
            let result = hub
                .deliver("u1", OutboundFrame::typing("c", "x", true))
                .await;
            if result == Err(HubError::Stopped) {
                rejected = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(rejected);
    }
}
