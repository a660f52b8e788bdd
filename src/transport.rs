//! # MQTT Transport Abstraction
//!
//! This module defines the `MqttConnection` trait, the narrow view of an MQTT
//! client that the control layer needs: session establishment and teardown
//! plus subscribe/publish/unsubscribe. TLS, sockets and packet encoding stay
//! behind the implementation.
//!
//! With the Rust 2024 Edition, this trait uses native `async fn`, removing the
//! need for the `#[async_trait]` macro.

use crate::packet::{Publish, QoS};

/// Keep-alive interval used when none is configured. Zero disables keep-alive.
pub const DEFAULT_KEEP_ALIVE_SECS: u16 = 0;

/// Parameters for establishing an MQTT session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnectOptions<'a> {
    pub client_id: &'a str,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
}

impl<'a> ConnectOptions<'a> {
    /// Creates options for a clean session with the default keep-alive.
    pub const fn new(client_id: &'a str) -> Self {
        Self {
            client_id,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
            clean_session: true,
        }
    }

    pub const fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive_secs = secs;
        self
    }

    pub const fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }
}

/// A trait representing an MQTT client connection.
#[allow(async_fn_in_trait)]
pub trait MqttConnection {
    /// The error type returned by the client.
    type Error: core::fmt::Debug;

    /// Opens a session with the broker.
    async fn connect(&mut self, options: &ConnectOptions<'_>) -> Result<(), Self::Error>;

    /// Closes the current session.
    async fn disconnect(&mut self) -> Result<(), Self::Error>;

    /// Subscribes to a single topic filter.
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), Self::Error>;

    /// Publishes a message.
    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS)
    -> Result<(), Self::Error>;

    /// Removes a subscription for a single topic filter.
    async fn unsubscribe(&mut self, filter: &str, qos: QoS) -> Result<(), Self::Error>;
}

/// Why the transport dropped the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DisconnectReason {
    /// No ping response within the keep-alive window; the broker may be down.
    BrokerDown,
    /// The network interface went down.
    NetworkDown,
    /// A send or receive operation failed or timed out.
    SendReceiveFailed,
    /// The broker sent a malformed or unexpected packet.
    BadResponse,
    /// Any other reason reported by the client.
    Other,
}

/// Asynchronous notifications delivered by the transport client.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportEvent<'a> {
    /// The session was lost.
    Disconnected(DisconnectReason),
    /// A message arrived on a subscribed topic.
    MessageReceived(Publish<'a>),
}
