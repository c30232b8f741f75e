// ============================================================================
// Event Bus -> Connection Hub bridge
// ============================================================================
//
// Domain services announce new messages on the bus; this handler turns each
// `message.created` event into a `new_message` frame for the recipient's live
// session. Other event types on the topic are ignored. A recipient without a
// session is not an error: offline delivery belongs to the push pipeline.
//
// ============================================================================

use anyhow::Context;
use async_trait::async_trait;
use tracing::debug;

use crate::envelope::EventEnvelope;
use crate::hub::{HubHandle, NewMessageNotification};
use crate::kafka::EventHandler;

pub const MESSAGE_CREATED_EVENT: &str = "message.created";

pub struct NotificationBridge {
    hub: HubHandle,
}

impl NotificationBridge {
    pub fn new(hub: HubHandle) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl EventHandler for NotificationBridge {
    async fn handle(&self, envelope: EventEnvelope) -> anyhow::Result<()> {
        if envelope.event_type != MESSAGE_CREATED_EVENT {
            debug!(event_type = %envelope.event_type, event_id = %envelope.id, "Ignoring event");
            return Ok(());
        }

        let event_id = envelope.id;
        let notification: NewMessageNotification = serde_json::from_value(envelope.data)
            .with_context(|| format!("Event {} has an invalid message payload", event_id))?;
        notification.validate().map_err(anyhow::Error::msg)?;

        let outcome = self.hub.notify_new_message(&notification).await?;
        debug!(event_id = %event_id, outcome = outcome.as_str(), "Bridged new-message event");
        Ok(())
    }
}
