// Event bus client
//
// Publishes versioned envelopes to named Kafka topics with bounded retry and
// consumes them under a consumer group named after the subscribing service.
// Delivery is at-least-once: consumers must tolerate duplicates.

pub mod broker;
pub mod bus;
pub mod config;
pub mod metrics;

pub use broker::{
    Broker, InboundRecord, KafkaBroker, OutboundRecord, RecordPosition, TopicReader, TopicWriter,
};
pub use bus::{BusOptions, ConsumeOutcome, EventBus, EventHandler, PublishReceipt};
pub use config::create_client_config;
