/// Hub roles: the authority ("main") hub and edge ("mini") hubs.
///
/// Both implement [`arc_transport::PacketSink`] so they can be registered
/// with a simulator directly, and both talk outward through an
/// [`arc_transport::Network`].
mod authority;
mod edge;

pub use authority::{BroadcastReport, MainHub, SeedEntry};
pub use edge::{AnswerSource, DeliveryStatus, Inbound, MessageReceipt, MiniHub, QueryAnswer, RetransmitReport};

/// Reply text of an edge hub after ingesting an authoritative capsule.
pub const CAPSULE_INGESTED: &str = "Capsule ingested";
/// Reply text of a hub after handling any other complete payload.
pub const PAYLOAD_PROCESSED: &str = "Payload processed";
/// Reply text of the authority when answering a query.
pub const RESPONSE_READY: &str = "Authoritative response ready";
/// Reply text of the authority after relaying a user message.
pub const MESSAGE_RELAYED: &str = "Message relayed";
