//! Update engine traits and the events exchanged with it.
//!
//! The update engine (the OTA agent) owns the block-transfer protocol, the job
//! document parser and the platform activation sequence. The control layer
//! sees it through [`UpdateEngine`] and exposes [`OtaMqttInterface`] back to
//! it, so the engine never touches the transport client directly.
//!
//! # Buffer Ownership
//!
//! Payload-carrying events move an [`EventBuffer`] into the engine. The engine
//! keeps the buffer for as long as it needs the payload and gives it back
//! through [`JobEvent::Processed`] (or simply drops it). Either way the pool
//! slot is freed exactly once.

use crate::error::{EngineError, OtaMqttError};
use crate::packet::QoS;
use crate::runtime::pool::EventBuffer;

/// State reported by the update engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AgentState {
    /// Created but not initialized yet.
    Init,
    /// Initialized and waiting for a start event.
    Ready,
    /// Working on a job (requesting, downloading, closing files).
    Active,
    /// Suspended; waiting for a resume.
    Suspended,
    /// Shutdown requested, not finished yet.
    ShuttingDown,
    /// Stopped for good. Ends the session loop.
    Stopped,
}

/// Events the control layer signals into the engine's event queue.
#[derive(Debug)]
pub enum AgentEvent<'p, const SIZE: usize> {
    /// Start (or restart) the job request cycle.
    Start,
    /// A job document arrived on a job-accepted or job-notify topic.
    ReceivedJobDocument(EventBuffer<'p, SIZE>),
    /// A file block arrived on a stream topic.
    ReceivedFileBlock(EventBuffer<'p, SIZE>),
}

/// Notifications the engine delivers to the application.
#[derive(Debug)]
pub enum JobEvent<'p, const SIZE: usize> {
    /// A new image is ready to be activated.
    Activate,
    /// The job failed; the engine has already handled it.
    Fail,
    /// The new image booted and awaits self-test.
    StartTest,
    /// The engine is done with an event buffer.
    Processed(Option<EventBuffer<'p, SIZE>>),
    /// The new image failed its self-test.
    SelfTestFailed,
}

/// Image state the application reports back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ImageState {
    Testing,
    Accepted,
    Rejected,
    Aborted,
}

/// Options for [`UpdateEngine::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ShutdownOptions {
    /// How long to wait for the engine task to stop, in milliseconds. Zero does not wait.
    pub wait_ms: u32,
    /// Whether the engine should unsubscribe its topics while shutting down.
    pub unsubscribe: bool,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            wait_ms: 0,
            unsubscribe: true,
        }
    }
}

/// Packet counters for the current job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AgentStatistics {
    pub packets_received: u32,
    pub packets_queued: u32,
    pub packets_processed: u32,
    pub packets_dropped: u32,
}

/// The update engine as seen from the control layer.
///
/// Methods take `&self` because the engine is shared between the session
/// task and the transport callback context; implementations synchronize
/// internally (typically by queueing into their own event channel).
pub trait UpdateEngine<'p, const SIZE: usize> {
    /// Initializes the engine for the given client identifier.
    fn init(&self, client_id: &str) -> Result<(), EngineError>;

    /// Queues an event. Must not block.
    ///
    /// On error the event, and any buffer it carries, is dropped.
    fn signal_event(&self, event: AgentEvent<'p, SIZE>) -> Result<(), EngineError>;

    /// Current engine state.
    fn state(&self) -> AgentState;

    /// Requests suspension. Completion is observed through [`state`](Self::state).
    fn suspend(&self) -> Result<(), EngineError>;

    /// Resumes a suspended engine.
    fn resume(&self) -> Result<(), EngineError>;

    /// Packet counters for the current job.
    fn statistics(&self) -> AgentStatistics;

    /// Stops the engine.
    fn shutdown(&self, options: ShutdownOptions) -> Result<(), EngineError>;

    /// Activates the downloaded image. Usually resets the device.
    fn activate_new_image(&self) -> Result<(), EngineError>;

    /// Reports the result of the image self-test.
    fn set_image_state(&self, state: ImageState) -> Result<(), EngineError>;
}

/// The MQTT operations the control layer offers to the update engine.
#[allow(async_fn_in_trait)]
pub trait OtaMqttInterface {
    /// Subscribes to `filter` and binds it to the matching OTA handler.
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), OtaMqttError>;

    /// Publishes `payload` on `topic`. Failures are not retried.
    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), OtaMqttError>;

    /// Unsubscribes from `filter` and drops its handler binding.
    async fn unsubscribe(&self, filter: &str, qos: QoS) -> Result<(), OtaMqttError>;
}
