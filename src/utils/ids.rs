//! Prefixed identifiers.
//!
//! IDs are a short prefix plus upper-case hex taken from a v4 UUID,
//! e.g. `MSG-3F2A9C01B7D4`.

use uuid::Uuid;

pub const MESSAGE_PREFIX: &str = "MSG";
pub const SUBSCRIPTION_PREFIX: &str = "SUB";
pub const EVENT_PREFIX: &str = "EVT";
pub const OUTBOX_PREFIX: &str = "OBX";
pub const SAGA_PREFIX: &str = "SAGA";

/// Generate `<prefix>-<hex_len upper-case hex chars>`.
pub fn prefixed_id(prefix: &str, hex_len: usize) -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("{}-{}", prefix, &hex[..hex_len.min(hex.len())])
}

pub fn message_id() -> String {
    prefixed_id(MESSAGE_PREFIX, 12)
}

pub fn subscription_id() -> String {
    prefixed_id(SUBSCRIPTION_PREFIX, 8)
}

pub fn event_id() -> String {
    prefixed_id(EVENT_PREFIX, 12)
}

pub fn outbox_id() -> String {
    prefixed_id(OUTBOX_PREFIX, 12)
}

pub fn saga_id() -> String {
    prefixed_id(SAGA_PREFIX, 12)
}
