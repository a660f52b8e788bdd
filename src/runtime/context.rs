//! Shared state of one OTA session.
//!
//! `OtaContext` ties the pieces together: the buffer pool, the update engine,
//! the subscription registry and the transport client. It is passed by
//! reference to the three execution contexts that use it:
//!
//! - the session orchestrator task, which connects and disconnects;
//! - the engine task, which calls the [`OtaMqttInterface`] operations;
//! - the transport's receive path, which feeds [`OtaContext::on_transport_event`].

use core::cell::RefCell;
use core::pin::pin;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_futures::select::{Either3, select3};
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use futures::future::{Either, select};

use crate::error::{OtaMqttError, RegistryError};
use crate::packet::{Publish, QoS};
use crate::runtime::pool::{DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE, EventBufferPool};
use crate::runtime::registry::{DEFAULT_MAX_SUBSCRIPTIONS, SubscriptionRegistry};
use crate::runtime::router::{MessageRouter, OtaHandler, handler_for_filter};
use crate::runtime::traits::{
    ImageState, JobEvent, OtaMqttInterface, ShutdownOptions, UpdateEngine,
};
use crate::topic;
use crate::transport::{ConnectOptions, DisconnectReason, MqttConnection, TransportEvent};

/// Result of waiting for the transport to drop the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitOutcome {
    Disconnected(DisconnectReason),
    TimedOut,
    Cancelled,
}

/// The explicit context shared by the orchestrator, the engine and the transport.
///
/// Generic over the raw mutex `M` guarding its internal state, the transport
/// client `C`, the update engine `E`, and the capacities: `K` subscription
/// records, `N` event buffers of `SIZE` bytes.
///
/// # Example
///
/// ```ignore
/// static POOL: EventBufferPool<CriticalSectionRawMutex> = EventBufferPool::new();
///
/// let ctx = OtaContext::<CriticalSectionRawMutex, _, _>::new(&POOL, agent, client);
/// let mut session = SessionOrchestrator::new(&ctx, SessionConfig::new("my-thing"));
/// session.run().await?;
/// ```
pub struct OtaContext<
    'p,
    M: RawMutex,
    C,
    E,
    const K: usize = DEFAULT_MAX_SUBSCRIPTIONS,
    const N: usize = DEFAULT_BUFFER_COUNT,
    const SIZE: usize = DEFAULT_BUFFER_SIZE,
> {
    pool: &'p EventBufferPool<M, N, SIZE>,
    engine: E,
    registry: BlockingMutex<M, RefCell<SubscriptionRegistry<OtaHandler, K>>>,
    client: Mutex<M, C>,
    disconnected: Signal<M, DisconnectReason>,
    cancel_signal: Signal<M, ()>,
    cancelled: AtomicBool,
    session_established: AtomicBool,
}

impl<'p, M, C, E, const K: usize, const N: usize, const SIZE: usize>
    OtaContext<'p, M, C, E, K, N, SIZE>
where
    M: RawMutex,
{
    pub const fn new(pool: &'p EventBufferPool<M, N, SIZE>, engine: E, client: C) -> Self {
        Self {
            pool,
            engine,
            registry: BlockingMutex::new(RefCell::new(SubscriptionRegistry::new())),
            client: Mutex::new(client),
            disconnected: Signal::new(),
            cancel_signal: Signal::new(),
            cancelled: AtomicBool::new(false),
            session_established: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Locks the transport client.
    pub async fn client(&self) -> MutexGuard<'_, M, C> {
        self.client.lock().await
    }

    /// Runs `f` with the subscription registry locked.
    pub fn with_registry<R>(&self, f: impl FnOnce(&SubscriptionRegistry<OtaHandler, K>) -> R) -> R {
        self.registry.lock(|registry| f(&registry.borrow()))
    }

    pub fn is_session_established(&self) -> bool {
        self.session_established.load(Ordering::Acquire)
    }

    /// Requests the session loop to stop.
    ///
    /// Pending waits in [`sleep`](Self::sleep) and
    /// [`wait_for_disconnect`](Self::wait_for_disconnect) return early, and
    /// every later wait returns immediately.
    pub fn cancel(&self) {
        info!("OTA session cancellation requested");
        self.cancelled.store(true, Ordering::Release);
        self.cancel_signal.signal(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Sleeps for `duration`. Returns `false` if cancelled first.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }

        let timer = Timer::after(duration);
        let cancel = self.cancel_signal.wait();
        match select(pin!(timer), pin!(cancel)).await {
            Either::Left(_) => true,
            Either::Right(_) => false,
        }
    }

    /// Waits up to `timeout` for the transport to report a dropped session.
    pub async fn wait_for_disconnect(&self, timeout: Duration) -> WaitOutcome {
        if self.is_cancelled() {
            return WaitOutcome::Cancelled;
        }

        match select3(
            self.disconnected.wait(),
            self.cancel_signal.wait(),
            Timer::after(timeout),
        )
        .await
        {
            Either3::First(reason) => WaitOutcome::Disconnected(reason),
            Either3::Second(()) => WaitOutcome::Cancelled,
            Either3::Third(()) => WaitOutcome::TimedOut,
        }
    }

    /// Clears a pending disconnect indication.
    pub fn reset_signals(&self) {
        self.disconnected.reset();
    }
}

impl<'p, M, C, E, const K: usize, const N: usize, const SIZE: usize>
    OtaContext<'p, M, C, E, K, N, SIZE>
where
    M: RawMutex,
    C: MqttConnection,
{
    /// Opens the MQTT session.
    ///
    /// A disconnect indication left over from an earlier session is discarded
    /// before the transport is asked to connect. A drop reported while the
    /// connect is in flight belongs to the new session and is kept.
    pub async fn connect(&self, options: &ConnectOptions<'_>) -> Result<(), C::Error> {
        self.disconnected.reset();
        self.client.lock().await.connect(options).await?;
        self.session_established.store(true, Ordering::Release);
        info!("MQTT session established for {}", options.client_id);
        Ok(())
    }

    /// Closes the MQTT session if one is established.
    ///
    /// The session is considered closed afterwards even if the transport
    /// reported an error.
    pub async fn disconnect(&self) -> Result<(), C::Error> {
        if !self.is_session_established() {
            debug!("MQTT session already closed");
            return Ok(());
        }

        let result = self.client.lock().await.disconnect().await;
        self.session_established.store(false, Ordering::Release);
        match result {
            Ok(()) => info!("MQTT session closed"),
            Err(_) => warn!("MQTT disconnect failed, dropping the session anyway"),
        }
        result
    }

    /// Binds `filter` to `handler` unless it already is.
    ///
    /// Returns whether a new record was created.
    fn bind(&self, filter: &str, handler: OtaHandler) -> Result<bool, OtaMqttError> {
        let result = self
            .registry
            .lock(|registry| registry.borrow_mut().register(filter, handler));

        match result {
            Ok(()) => Ok(true),
            Err(RegistryError::RecordExists) => Ok(false),
            Err(err) => {
                error!("cannot bind topic filter {}: {:?}", filter, err);
                Err(OtaMqttError::SubscribeFailed)
            }
        }
    }

    fn unbind(&self, filter: &str) -> bool {
        self.registry
            .lock(|registry| registry.borrow_mut().remove(filter))
    }
}

impl<'p, M, C, E, const K: usize, const N: usize, const SIZE: usize> OtaMqttInterface
    for OtaContext<'p, M, C, E, K, N, SIZE>
where
    M: RawMutex,
    C: MqttConnection,
{
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), OtaMqttError> {
        if !topic::is_valid_filter(filter) {
            error!("subscribe called with a malformed topic filter: {}", filter);
            return Err(OtaMqttError::InvalidArgument);
        }

        let bound_here = match handler_for_filter(filter) {
            Some(handler) => self.bind(filter, handler)?,
            None => {
                warn!("no OTA handler for topic filter {}, subscribing anyway", filter);
                false
            }
        };

        if self.client.lock().await.subscribe(filter, qos).await.is_err() {
            error!("failed to subscribe to {}", filter);
            if bound_here {
                self.unbind(filter);
            }
            return Err(OtaMqttError::SubscribeFailed);
        }

        info!("subscribed to {}", filter);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: QoS) -> Result<(), OtaMqttError> {
        if topic.is_empty() {
            error!("publish called with an empty topic");
            return Err(OtaMqttError::InvalidArgument);
        }

        match self.client.lock().await.publish(topic, payload, qos).await {
            Ok(()) => {
                debug!("published {} bytes to {}", payload.len(), topic);
                Ok(())
            }
            Err(_) => {
                error!("failed to publish to {}", topic);
                Err(OtaMqttError::PublishFailed)
            }
        }
    }

    async fn unsubscribe(&self, filter: &str, qos: QoS) -> Result<(), OtaMqttError> {
        if filter.is_empty() {
            error!("unsubscribe called with an empty topic filter");
            return Err(OtaMqttError::InvalidArgument);
        }

        if self.client.lock().await.unsubscribe(filter, qos).await.is_err() {
            error!("failed to unsubscribe from {}", filter);
            return Err(OtaMqttError::UnsubscribeFailed);
        }

        self.unbind(filter);
        info!("unsubscribed from {}", filter);
        Ok(())
    }
}

impl<'p, M, C, E, const K: usize, const N: usize, const SIZE: usize>
    OtaContext<'p, M, C, E, K, N, SIZE>
where
    M: RawMutex + Sync,
    E: UpdateEngine<'p, SIZE>,
{
    pub fn router(&self) -> MessageRouter<'_, 'p, M, E, N, SIZE> {
        MessageRouter::new(self.pool, &self.engine)
    }

    /// Entry point for the transport's receive path.
    pub fn on_transport_event(&self, event: TransportEvent<'_>) {
        match event {
            TransportEvent::Disconnected(reason) => {
                warn!("MQTT session dropped: {:?}", reason);
                self.disconnected.signal(reason);
            }
            TransportEvent::MessageReceived(msg) => {
                self.dispatch(&msg);
            }
        }
    }

    /// Routes `msg` to every handler whose filter matches its topic.
    ///
    /// The matching handlers are collected under the registry lock and routed
    /// after it is released. A handler bound to several overlapping filters
    /// receives the message once. Returns the number of handlers invoked.
    pub fn dispatch(&self, msg: &Publish<'_>) -> usize {
        let mut handlers = heapless::Vec::<OtaHandler, K>::new();
        self.registry.lock(|registry| {
            registry.borrow().dispatch(msg, |handler, _| {
                if !handlers.contains(handler) {
                    // at most one entry per record, so this never overflows
                    let _ = handlers.push(*handler);
                }
            })
        });

        if handlers.is_empty() {
            debug!("no handler for incoming message on {}", msg.topic);
            return 0;
        }

        let router = self.router();
        for handler in &handlers {
            // the router logs every failure it reports
            let _ = router.route(*handler, msg);
        }
        handlers.len()
    }

    /// Application callback for notifications from the engine.
    pub fn on_job_event(&self, event: JobEvent<'p, SIZE>) {
        match event {
            JobEvent::Activate => {
                info!("received activate event, activating new image");
                if let Err(err) = self.engine.activate_new_image() {
                    error!("failed to activate new image: {:?}", err);
                }

                // a successful activation resets the device
                if let Err(err) = self.engine.shutdown(ShutdownOptions::default()) {
                    error!("failed to shut down OTA agent: {:?}", err);
                }
                error!("new image activation failed, manual activation required");
            }
            JobEvent::Fail => {
                info!("OTA job failed, the agent handles it");
            }
            JobEvent::StartTest => {
                info!("new image is under test, accepting it");
                if let Err(err) = self.engine.set_image_state(ImageState::Accepted) {
                    error!("failed to set image state as accepted: {:?}", err);
                }
            }
            JobEvent::Processed(buffer) => {
                if let Some(buffer) = buffer {
                    self.pool.release(buffer);
                }
                let stats = self.engine.statistics();
                debug!(
                    "OTA event processed, {} of {} packets processed",
                    stats.packets_processed,
                    stats.packets_received
                );
            }
            JobEvent::SelfTestFailed => {
                error!("self-test of new image failed, shutting down OTA agent");
                if let Err(err) = self.engine.shutdown(ShutdownOptions::default()) {
                    error!("failed to shut down OTA agent: {:?}", err);
                }
            }
        }
    }
}
