//! # OTA Update Session Control over MQTT
//!
//! `myrtio-ota` is a `no_std` control layer that connects an OTA update engine
//! (the agent that parses job documents, downloads file blocks and activates
//! images) to an MQTT client, built upon the [Embassy](https://embassy.dev/)
//! async ecosystem.
//!
//! ## Core Features
//!
//! - **`no_std` & `no_alloc`:** Buffers and tables are fixed-size, sized by
//!   const generics. Topic filters are stored in `heapless` strings.
//! - **Fully Async:** Session handling uses `async/await` with `embassy-time`
//!   timers and `embassy-sync` signals; every wait can be cancelled.
//! - **Rust 2024 Edition:** Uses native `async fn` in traits, removing the need for `async-trait`.
//! - **Client Agnostic:** The `MqttConnection` trait is the only thing the
//!   control layer needs from an MQTT client.
//! - **Wildcard Dispatch:** Incoming messages are matched against subscribed
//!   filters with the standard `+` and `#` rules.
//!
//! ## Architecture
//!
//! The application creates a static [`EventBufferPool`](runtime::EventBufferPool),
//! an [`OtaContext`](runtime::OtaContext) holding the engine and the MQTT
//! client, and runs a [`SessionOrchestrator`](runtime::SessionOrchestrator)
//! in its own task:
//!
//! ```ignore
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//! use myrtio_ota::runtime::{EventBufferPool, OtaContext, SessionConfig, SessionOrchestrator};
//!
//! static POOL: EventBufferPool<CriticalSectionRawMutex> = EventBufferPool::new();
//!
//! let ctx = OtaContext::<CriticalSectionRawMutex, _, _>::new(&POOL, agent, client);
//! let mut session = SessionOrchestrator::new(&ctx, SessionConfig::new("my-thing"));
//! session.run().await?;
//! ```
//!
//! The transport feeds its notifications into the context:
//!
//! ```ignore
//! ctx.on_transport_event(TransportEvent::MessageReceived(publish));
//! ctx.on_transport_event(TransportEvent::Disconnected(DisconnectReason::NetworkDown));
//! ```
//!
//! and the engine talks MQTT only through [`OtaMqttInterface`](runtime::OtaMqttInterface),
//! which the context implements.

#![no_std]

#[cfg(test)]
extern crate std;

// This mod MUST go first, so that the others see its macros.
mod fmt;

pub mod error;
pub mod packet;
pub mod runtime;
pub mod topic;
pub mod transport;

// Re-export key types for easier access at the crate root.
pub use packet::{Publish, QoS};
pub use runtime::{OtaContext, SessionConfig, SessionOrchestrator};
pub use transport::{ConnectOptions, DisconnectReason, MqttConnection, TransportEvent};
