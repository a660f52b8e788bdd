//! Message classification and forwarding into the update engine.
//!
//! Incoming messages reach the router through the subscription registry,
//! already tagged with the [`OtaHandler`] their filter was bound to. The
//! router copies the payload into a pooled [`EventBuffer`] and signals the
//! matching event to the engine. When the pool is exhausted the message is
//! dropped: there is no backpressure towards the transport or the broker.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::error::RouteError;
use crate::packet::Publish;
use crate::runtime::pool::{EventBuffer, EventBufferPool};
use crate::runtime::traits::{AgentEvent, UpdateEngine};
use crate::topic;

/// Common prefix of every OTA topic.
pub const TOPIC_PREFIX: &str = "$aws/things/+/";

/// Broad filter covering the job topics.
pub const JOBS_FILTER: &str = "$aws/things/+/jobs/#";

/// Broad filter covering the streaming service topics.
pub const STREAMS_FILTER: &str = "$aws/things/+/streams/#";

/// Response to a "describe next job" request.
pub const JOB_ACCEPTED_FILTER: &str = "$aws/things/+/jobs/$next/get/accepted";

/// Notification that the next pending job changed.
pub const JOB_NOTIFY_FILTER: &str = "$aws/things/+/jobs/notify-next";

/// The handler a subscribed filter is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OtaHandler {
    /// Job documents and job notifications.
    Jobs,
    /// File blocks from the streaming service.
    Streams,
}

/// The two kinds of job messages the engine cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JobMessageKind {
    JobAccepted,
    JobNotify,
    Unclassified,
}

const HANDLER_TABLE: [(&str, OtaHandler); 2] = [
    (JOBS_FILTER, OtaHandler::Jobs),
    (STREAMS_FILTER, OtaHandler::Streams),
];

const CLASSIFICATION_TABLE: [(&str, JobMessageKind); 2] = [
    (JOB_ACCEPTED_FILTER, JobMessageKind::JobAccepted),
    (JOB_NOTIFY_FILTER, JobMessageKind::JobNotify),
];

/// Classifies a job topic as job-accepted, job-notify or neither.
pub fn classify(topic_name: &str) -> JobMessageKind {
    CLASSIFICATION_TABLE
        .iter()
        .find(|(pattern, _)| topic::matches(topic_name, pattern))
        .map_or(JobMessageKind::Unclassified, |(_, kind)| *kind)
}

/// Picks the handler for a filter the engine subscribes to.
///
/// A filter belongs to the jobs or streams family when that family's broad
/// filter covers it, so `$aws/things/dev/jobs/#` and
/// `$aws/things/dev/jobs/notify-next` both pick [`OtaHandler::Jobs`].
pub fn handler_for_filter(filter: &str) -> Option<OtaHandler> {
    HANDLER_TABLE
        .iter()
        .find(|(family, _)| topic::covers(filter, family))
        .map(|(_, handler)| *handler)
}

/// Forwards routed messages into the update engine through the buffer pool.
pub struct MessageRouter<'a, 'p, M: RawMutex, E, const N: usize, const SIZE: usize> {
    pool: &'p EventBufferPool<M, N, SIZE>,
    engine: &'a E,
}

impl<M: RawMutex, E, const N: usize, const SIZE: usize> Clone
    for MessageRouter<'_, '_, M, E, N, SIZE>
{
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: RawMutex, E, const N: usize, const SIZE: usize> Copy
    for MessageRouter<'_, '_, M, E, N, SIZE>
{
}

impl<'a, 'p, M, E, const N: usize, const SIZE: usize> MessageRouter<'a, 'p, M, E, N, SIZE>
where
    M: RawMutex + Sync,
    E: UpdateEngine<'p, SIZE>,
{
    pub fn new(pool: &'p EventBufferPool<M, N, SIZE>, engine: &'a E) -> Self {
        Self { pool, engine }
    }

    /// Handles a message delivered to `handler`.
    ///
    /// Job messages that are neither job-accepted nor job-notify are logged
    /// and ignored. Every failure is logged here; callers may ignore the result.
    pub fn route(&self, handler: OtaHandler, msg: &Publish<'_>) -> Result<(), RouteError> {
        match handler {
            OtaHandler::Jobs => match classify(msg.topic) {
                JobMessageKind::JobAccepted | JobMessageKind::JobNotify => {
                    self.forward(msg, AgentEvent::ReceivedJobDocument)
                }
                JobMessageKind::Unclassified => {
                    info!(
                        "ignoring job message on {} ({} bytes)",
                        msg.topic,
                        msg.payload.len()
                    );
                    Err(RouteError::Unclassified)
                }
            },
            OtaHandler::Streams => {
                debug!("received data message, {} bytes", msg.payload.len());
                self.forward(msg, AgentEvent::ReceivedFileBlock)
            }
        }
    }

    fn forward(
        &self,
        msg: &Publish<'_>,
        event: fn(EventBuffer<'p, SIZE>) -> AgentEvent<'p, SIZE>,
    ) -> Result<(), RouteError> {
        let Some(mut buffer) = self.pool.acquire() else {
            warn!("no OTA data buffers available, dropping message on {}", msg.topic);
            return Err(RouteError::NoBufferAvailable);
        };

        if let Err(err) = buffer.fill(msg.payload) {
            error!(
                "payload of {} bytes does not fit a {} byte buffer",
                msg.payload.len(),
                SIZE
            );
            return Err(err);
        }

        self.engine.signal_event(event(buffer)).map_err(|err| {
            error!("OTA agent rejected event: {:?}", err);
            RouteError::EngineRejected
        })
    }
}
