//! # Error Types
//!
//! Error types returned by the subscription registry, the message router, the
//! engine-facing MQTT interface and the session orchestrator.
//!
//! None of these errors is fatal to the control layer. Callers log them and
//! continue; only an engine reporting `Stopped` ends a session loop.

/// Reasons a subscription binding could not be registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistryError {
    /// A live record already holds a byte-identical topic filter.
    RecordExists,
    /// Every slot of the registry is occupied.
    RegistryFull,
    /// The filter is empty or longer than `MAX_FILTER_LEN`.
    InvalidFilter,
}

/// Reasons an incoming message was not forwarded to the update engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RouteError {
    /// Every event buffer is currently owned. The message is dropped.
    NoBufferAvailable,
    /// The payload does not fit into an event buffer.
    PayloadTooLarge,
    /// A job message arrived on a topic that is neither job-accepted nor job-notify.
    Unclassified,
    /// The engine refused the event (e.g. its queue is full). The buffer was released.
    EngineRejected,
}

/// Status returned to the update engine from its MQTT interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaMqttError {
    /// The topic filter was empty or malformed, or the topic name was empty.
    InvalidArgument,
    /// The subscription could not be made or bound to a handler.
    SubscribeFailed,
    /// The transport failed to publish the message.
    PublishFailed,
    /// The transport failed to remove the subscription.
    UnsubscribeFailed,
}

/// Failures reported by the update engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineError {
    /// The engine has not been initialized.
    Uninitialized,
    /// The engine could not be initialized.
    InitFailed,
    /// The event queue could not accept the event.
    SignalFailed,
    /// The engine refused to suspend.
    SuspendFailed,
    /// The engine refused to resume.
    ResumeFailed,
    /// The image state could not be updated.
    ImageStateFailed,
    /// Any other engine-specific failure code.
    Other(u32),
}
