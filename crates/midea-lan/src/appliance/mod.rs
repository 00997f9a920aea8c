//! Appliance adapters
//!
//! The session engine treats appliance payloads as opaque; an adapter
//! supplies the two capabilities the engine needs (building status queries
//! and decoding status payloads). The four product categories are a set of
//! adapters behind one trait, not a hierarchy; new categories plug in
//! without touching the engine.

use midea_proto::{ApplianceMessage, MessageType};
use std::collections::HashMap;

/// Air conditioner category tag
pub const TYPE_AIR_CONDITIONER: u8 = 0xAC;

/// Dehumidifier category tag
pub const TYPE_DEHUMIDIFIER: u8 = 0xA1;

/// Fan category tag
pub const TYPE_FAN: u8 = 0xFA;

/// Water heater category tag
pub const TYPE_WATER_HEATER: u8 = 0xE2;

/// Decoded appliance state, broadcast to observers
///
/// Keys are appliance-specific except `available`, which is always present
/// in observer notifications.
pub type StatusMap = HashMap<String, serde_json::Value>;

/// Capability set the session engine requires from an appliance
pub trait ApplianceAdapter: Send {
    /// Product category tag this adapter decodes (0xAC, 0xA1, 0xFA, 0xE2)
    fn appliance_type(&self) -> u8;

    /// Appliance-specific status queries issued on every refresh cycle
    fn build_queries(&self) -> Vec<ApplianceMessage>;

    /// Decode one appliance message into status values; may return an
    /// empty map for payloads that carry no state
    fn process_message(&mut self, data: &[u8]) -> StatusMap;

    /// Adapter name for logging
    fn name(&self) -> &'static str {
        "appliance"
    }
}

/// Pass-through adapter for appliances without a dedicated decoder
///
/// Issues one standard QUERY per refresh and surfaces payloads as hex
/// under the `raw` key.
pub struct GenericAdapter {
    appliance_type: u8,
}

impl GenericAdapter {
    /// Create an adapter for the given category tag
    pub fn new(appliance_type: u8) -> Self {
        Self { appliance_type }
    }
}

impl ApplianceAdapter for GenericAdapter {
    fn appliance_type(&self) -> u8 {
        self.appliance_type
    }

    fn build_queries(&self) -> Vec<ApplianceMessage> {
        vec![ApplianceMessage::new(
            self.appliance_type,
            MessageType::Query,
            Vec::new(),
        )]
    }

    fn process_message(&mut self, data: &[u8]) -> StatusMap {
        let mut status = StatusMap::new();
        if !data.is_empty() {
            status.insert("raw".to_string(), hex::encode(data).into());
        }
        status
    }

    fn name(&self) -> &'static str {
        "generic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generic_queries() {
        let adapter = GenericAdapter::new(TYPE_AIR_CONDITIONER);
        let queries = adapter.build_queries();

        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].appliance_type, TYPE_AIR_CONDITIONER);
        assert_eq!(queries[0].message_type, MessageType::Query as u8);
    }

    #[test]
    fn test_generic_process_message() {
        let mut adapter = GenericAdapter::new(TYPE_FAN);

        let status = adapter.process_message(&[0xAA, 0x0B]);
        assert_eq!(status["raw"], serde_json::json!("aa0b"));

        assert!(adapter.process_message(&[]).is_empty());
    }
}
