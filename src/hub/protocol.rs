// ============================================================================
// Connection protocol frames
// ============================================================================
//
// Inbound:  {type: "typing"|"read"|"presence", conversation_id, message_id?, is_typing?}
// Outbound: {type, conversation_id?, sender_id?, recipient_id?, content?,
//            user_id?, is_typing?, status?, message_id?}
//
// Absent optional fields are omitted on the wire.
//
// ============================================================================

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    Typing,
    Read,
    /// Client acknowledgment of a presence update
    Presence,
}

/// Frame sent by a connected client
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub kind: InboundKind,
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub is_typing: Option<bool>,
}

impl InboundFrame {
    /// Decode and check a text frame
    pub fn parse(text: &str) -> Result<Self, String> {
        let frame: InboundFrame = serde_json::from_str(text).map_err(|e| e.to_string())?;

        match frame.kind {
            InboundKind::Typing | InboundKind::Read if frame.conversation_id.is_empty() => {
                Err("conversation_id is required".to_string())
            }
            _ => Ok(frame),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    NewMessage,
    Typing,
    Read,
    Presence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PresenceStatus::Online => "online",
            PresenceStatus::Offline => "offline",
        }
    }
}

/// Frame pushed to a connected client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub kind: OutboundKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_typing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl OutboundFrame {
    fn empty(kind: OutboundKind) -> Self {
        Self {
            kind,
            conversation_id: None,
            sender_id: None,
            recipient_id: None,
            content: None,
            user_id: None,
            is_typing: None,
            status: None,
            message_id: None,
        }
    }

    pub fn new_message(notification: &NewMessageNotification) -> Self {
        Self {
            conversation_id: notification.conversation_id.clone(),
            sender_id: Some(notification.sender_id.clone()),
            recipient_id: Some(notification.recipient_id.clone()),
            content: Some(notification.content.clone()),
            ..Self::empty(OutboundKind::NewMessage)
        }
    }

    pub fn typing(conversation_id: &str, user_id: &str, is_typing: bool) -> Self {
        Self {
            conversation_id: Some(conversation_id.to_string()),
            user_id: Some(user_id.to_string()),
            is_typing: Some(is_typing),
            ..Self::empty(OutboundKind::Typing)
        }
    }

    pub fn read_receipt(conversation_id: &str, user_id: &str, message_id: Option<&str>) -> Self {
        Self {
            conversation_id: Some(conversation_id.to_string()),
            user_id: Some(user_id.to_string()),
            status: Some("read".to_string()),
            message_id: message_id.map(str::to_string),
            ..Self::empty(OutboundKind::Read)
        }
    }

    pub fn presence(user_id: &str, status: PresenceStatus) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            status: Some(status.as_str().to_string()),
            ..Self::empty(OutboundKind::Presence)
        }
    }
}

/// New-message alert requested by a domain service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessageNotification {
    pub recipient_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub content: String,
}

impl NewMessageNotification {
    pub fn validate(&self) -> Result<(), String> {
        if self.recipient_id.is_empty() {
            return Err("recipient_id is required".to_string());
        }
        if self.sender_id.is_empty() {
            return Err("sender_id is required".to_string());
        }
        Ok(())
    }
}
