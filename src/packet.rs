//! # Message Types
//!
//! The message-level view of MQTT used by the control layer. Wire encoding is
//! the transport client's business; the control layer only sees a decoded
//! topic, payload and delivery guarantee.

/// Represents the Quality of Service (QoS) levels for MQTT messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

/// An incoming message as delivered by the transport client.
///
/// Topic and payload borrow from the transport's receive buffer, so a
/// `Publish` never outlives the callback it was delivered in. Anything that
/// must be kept is copied into an event buffer first.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Publish<'a> {
    pub topic: &'a str,
    pub qos: QoS,
    pub payload: &'a [u8],
    pub packet_id: Option<u16>,
}

impl<'a> Publish<'a> {
    /// Creates a QoS 0 message without a packet identifier.
    pub const fn new(topic: &'a str, payload: &'a [u8]) -> Self {
        Self {
            topic,
            qos: QoS::AtMostOnce,
            payload,
            packet_id: None,
        }
    }
}
