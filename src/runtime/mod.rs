//! OTA Session Runtime
//!
//! Everything between the MQTT transport and the update engine.
//!
//! # Overview
//!
//! - [`EventBufferPool`] holds the fixed set of buffers that carry incoming
//!   payloads into the engine.
//! - [`SubscriptionRegistry`] maps subscribed topic filters to the handler
//!   that processes their messages.
//! - [`MessageRouter`] classifies a message and forwards it to the engine.
//! - [`OtaContext`] owns the shared state and implements the MQTT operations
//!   the engine calls ([`OtaMqttInterface`]).
//! - [`SessionOrchestrator`] keeps the MQTT session alive around the engine.
//!
//! # Execution Contexts
//!
//! The orchestrator task, the engine task and the transport's receive path
//! all share one `OtaContext` by reference. Internal state is guarded by
//! `embassy-sync` primitives parameterized by the raw mutex `M`, so the same
//! code runs with a critical-section mutex on a multi-core target or a
//! thread-mode mutex on a single executor.

pub(crate) mod context;
pub(crate) mod pool;
pub(crate) mod registry;
pub(crate) mod router;
pub(crate) mod session;
pub(crate) mod traits;

#[cfg(test)]
pub(crate) mod testing;

pub use context::{OtaContext, WaitOutcome};
pub use pool::{DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE, EventBuffer, EventBufferPool};
pub use registry::{DEFAULT_MAX_SUBSCRIPTIONS, MAX_FILTER_LEN, SubscriptionRegistry};
pub use router::{
    JOB_ACCEPTED_FILTER, JOB_NOTIFY_FILTER, JOBS_FILTER, JobMessageKind, MessageRouter,
    OtaHandler, STREAMS_FILTER, TOPIC_PREFIX, classify, handler_for_filter,
};
pub use session::{
    DEFAULT_POLL_TIMEOUT, DEFAULT_RECONNECT_DELAY, DEFAULT_STATS_INTERVAL,
    DEFAULT_SUSPEND_POLL_INTERVAL, DEFAULT_SUSPEND_TIMEOUT, SessionConfig, SessionOrchestrator,
    SessionState,
};
pub use traits::{
    AgentEvent, AgentState, AgentStatistics, ImageState, JobEvent, OtaMqttInterface,
    ShutdownOptions, UpdateEngine,
};

// Re-export Publish for engine implementations
pub use crate::packet::Publish;
