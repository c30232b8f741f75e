//! Real-time connection hub: one WebSocket session per user, a single
//! command loop owning the registry, and the wire protocol spoken to clients.

pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;

pub use protocol::{
    InboundFrame, InboundKind, NewMessageNotification, OutboundFrame, OutboundKind,
    PresenceStatus,
};
pub use registry::{DeliveryOutcome, Hub, HubCommand, HubHandle};
pub use server::{USER_ID_HEADER, USER_ID_QUERY_PARAM, run_websocket_server, upgrade};
pub use session::{SessionHandle, SessionState, route_inbound, run_session};
