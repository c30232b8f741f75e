// ============================================================================
// Event Envelope
// ============================================================================
//
// Canonical wrapper around every cross-service event. The envelope id is the
// idempotency key: it is assigned once, before the first publish attempt, and
// never regenerated on retry.
//
// ============================================================================

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Schema version stamped on envelopes that don't carry one
pub const DEFAULT_EVENT_VERSION: &str = "1.0";

/// Transport header carrying the event type
pub const HEADER_EVENT_TYPE: &str = "event_type";
/// Transport header carrying the producing service
pub const HEADER_SOURCE: &str = "source";
/// Transport header carrying the causal-chain trace id
pub const HEADER_CORRELATION_ID: &str = "correlation_id";

/// Versioned event envelope exchanged over the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event id (UUID v4), also used as the broker message key
    #[serde(default)]
    pub id: String,

    /// Event tag, e.g. "wallet.debited"
    #[serde(rename = "type")]
    pub event_type: String,

    /// Producing service name
    #[serde(default)]
    pub source: String,

    /// UTC creation time, RFC 3339 on the wire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,

    /// Payload schema version
    #[serde(default)]
    pub version: String,

    /// Trace id linking events of one causal chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Opaque domain payload
    #[serde(default)]
    pub data: serde_json::Value,

    /// Open key/value bag
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Create an envelope with only the caller-meaningful fields set.
    ///
    /// `id`, `timestamp` and `version` stay empty until [`prepare`](Self::prepare)
    /// runs, which the bus does once per publish.
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: String::new(),
            event_type: event_type.into(),
            source: source.into(),
            timestamp: None,
            version: String::new(),
            correlation_id: None,
            data,
            metadata: HashMap::new(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Fill in every missing identity field without touching present ones.
    ///
    /// Calling this again on an already prepared envelope is a no-op, so the
    /// id survives any number of retries.
    pub fn prepare(&mut self, default_source: &str) {
        if self.id.is_empty() {
            self.id = uuid::Uuid::new_v4().to_string();
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
        if self.version.is_empty() {
            self.version = DEFAULT_EVENT_VERSION.to_string();
        }
        if self.source.is_empty() {
            self.source = default_source.to_string();
        }
    }

    /// Validate envelope structure before it leaves the publisher
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            anyhow::bail!("id is required");
        }
        if self.event_type.is_empty() {
            anyhow::bail!("type is required");
        }
        if self.source.is_empty() {
            anyhow::bail!("source is required");
        }
        if self.version.is_empty() {
            anyhow::bail!("version is required");
        }
        if self.timestamp.is_none() {
            anyhow::bail!("timestamp is required");
        }
        if self.data.is_null() {
            anyhow::bail!("data is required");
        }
        Ok(())
    }

    /// Transport headers duplicated from the body for broker-side filtering
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_EVENT_TYPE, self.event_type.clone()),
            (HEADER_SOURCE, self.source.clone()),
        ];
        if let Some(correlation_id) = &self.correlation_id {
            headers.push((HEADER_CORRELATION_ID, correlation_id.clone()));
        }
        headers
    }
}
