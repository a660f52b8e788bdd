//! The session orchestrator: connect, start or resume the engine, watch for
//! disconnects, suspend, reconnect.
//!
//! ```text
//! Idle --connect ok--> Connected --disconnect--> AwaitingDisconnect
//!   ^                                                  |
//!   |                                          session closed
//!   |                                                  v
//!   +---- next step ---- Suspended <--engine confirms-- Suspending
//!
//! any state --engine Stopped or cancel--> Terminated
//! ```
//!
//! After a successful connect the engine is resumed if it reported
//! `Suspended` at the top of the step, and started otherwise.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Instant};

use crate::error::EngineError;
use crate::runtime::context::{OtaContext, WaitOutcome};
use crate::runtime::traits::{AgentEvent, AgentState, UpdateEngine};
use crate::transport::{ConnectOptions, DisconnectReason, MqttConnection};

/// How long one step waits for a disconnect notification.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause after reading the engine statistics.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_millis(1000);

/// How long to wait for the engine to confirm suspension.
pub const DEFAULT_SUSPEND_TIMEOUT: Duration = Duration::from_millis(5000);

/// How often the engine state is read while waiting for suspension.
pub const DEFAULT_SUSPEND_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Pause between failed connection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1000);

/// Timing and connection parameters of the session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig<'a> {
    pub connect: ConnectOptions<'a>,
    pub poll_timeout: Duration,
    pub stats_interval: Duration,
    pub suspend_timeout: Duration,
    pub suspend_poll_interval: Duration,
    pub reconnect_delay: Duration,
}

impl<'a> SessionConfig<'a> {
    /// Default timings for a clean session as `client_id`.
    pub const fn new(client_id: &'a str) -> Self {
        Self {
            connect: ConnectOptions::new(client_id),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            stats_interval: DEFAULT_STATS_INTERVAL,
            suspend_timeout: DEFAULT_SUSPEND_TIMEOUT,
            suspend_poll_interval: DEFAULT_SUSPEND_POLL_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub const fn with_connect_options(mut self, connect: ConnectOptions<'a>) -> Self {
        self.connect = connect;
        self
    }

    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub const fn with_stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    pub const fn with_suspend_timeout(mut self, timeout: Duration) -> Self {
        self.suspend_timeout = timeout;
        self
    }

    pub const fn with_suspend_poll_interval(mut self, interval: Duration) -> Self {
        self.suspend_poll_interval = interval;
        self
    }

    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Where the session loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    AwaitingDisconnect,
    Suspending,
    Suspended,
    Terminated,
}

enum SuspendWait {
    Suspended,
    TimedOut,
    Cancelled,
}

/// Drives the MQTT session around the update engine.
pub struct SessionOrchestrator<'c, 'p, 'a, M, C, E, const K: usize, const N: usize, const SIZE: usize>
where
    M: RawMutex,
{
    ctx: &'c OtaContext<'p, M, C, E, K, N, SIZE>,
    config: SessionConfig<'a>,
    state: SessionState,
}

impl<'c, 'p, 'a, M, C, E, const K: usize, const N: usize, const SIZE: usize>
    SessionOrchestrator<'c, 'p, 'a, M, C, E, K, N, SIZE>
where
    M: RawMutex + Sync,
    C: MqttConnection,
    E: UpdateEngine<'p, SIZE>,
{
    pub fn new(ctx: &'c OtaContext<'p, M, C, E, K, N, SIZE>, config: SessionConfig<'a>) -> Self {
        Self {
            ctx,
            config,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig<'a> {
        &self.config
    }

    /// Initializes the engine and runs the session loop until the engine
    /// stops or the context is cancelled.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let client_id = self.config.connect.client_id;
        if let Err(err) = self.ctx.engine().init(client_id) {
            error!("failed to initialize OTA agent: {:?}", err);
            return Err(err);
        }
        info!("OTA agent initialized for {}", client_id);

        while self.state != SessionState::Terminated {
            self.step().await;
        }
        Ok(())
    }

    /// Performs one iteration of the session loop.
    ///
    /// Does nothing once the session is terminated.
    pub async fn step(&mut self) {
        if self.state == SessionState::Terminated {
            return;
        }

        let agent = self.ctx.engine().state();
        if agent == AgentState::Stopped || self.ctx.is_cancelled() {
            self.shutdown().await;
            return;
        }

        if !self.ctx.is_session_established() {
            self.establish(agent).await;
        }

        if self.ctx.is_session_established() {
            self.service_session().await;
        }
    }

    async fn establish(&mut self, agent: AgentState) {
        self.transition(SessionState::Idle);
        self.transition(SessionState::Connecting);

        if self.ctx.connect(&self.config.connect).await.is_err() {
            warn!(
                "failed to connect to MQTT broker, retrying in {} ms",
                self.config.reconnect_delay.as_millis()
            );
            self.transition(SessionState::Idle);
            self.ctx.sleep(self.config.reconnect_delay).await;
            return;
        }
        self.transition(SessionState::Connected);

        let result = if agent == AgentState::Suspended {
            info!("resuming OTA agent");
            self.ctx.engine().resume()
        } else {
            info!("starting OTA agent");
            self.ctx.engine().signal_event(AgentEvent::Start)
        };
        if let Err(err) = result {
            error!("failed to start OTA agent: {:?}", err);
        }
    }

    async fn service_session(&mut self) {
        match self.ctx.wait_for_disconnect(self.config.poll_timeout).await {
            WaitOutcome::Disconnected(reason) => self.suspend(reason).await,
            WaitOutcome::TimedOut => {
                let stats = self.ctx.engine().statistics();
                info!(
                    "received: {}   queued: {}   processed: {}   dropped: {}",
                    stats.packets_received,
                    stats.packets_queued,
                    stats.packets_processed,
                    stats.packets_dropped
                );
                self.ctx.sleep(self.config.stats_interval).await;
            }
            WaitOutcome::Cancelled => debug!("session wait cancelled"),
        }
    }

    async fn suspend(&mut self, reason: DisconnectReason) {
        info!("received MQTT disconnect notification: {:?}", reason);
        self.transition(SessionState::AwaitingDisconnect);
        // failures are logged by the context, the session is closed either way
        let _ = self.ctx.disconnect().await;

        self.transition(SessionState::Suspending);
        if let Err(err) = self.ctx.engine().suspend() {
            error!("OTA agent failed to suspend: {:?}", err);
            self.transition(SessionState::Idle);
            return;
        }

        match self.await_suspension().await {
            SuspendWait::Suspended => self.transition(SessionState::Suspended),
            SuspendWait::TimedOut => {
                warn!(
                    "OTA agent not suspended after {} ms",
                    self.config.suspend_timeout.as_millis()
                );
                self.transition(SessionState::Idle);
            }
            SuspendWait::Cancelled => {
                debug!("suspend wait cancelled");
                self.transition(SessionState::Idle);
            }
        }
    }

    async fn await_suspension(&self) -> SuspendWait {
        let deadline = Instant::now() + self.config.suspend_timeout;
        loop {
            if self.ctx.engine().state() == AgentState::Suspended {
                return SuspendWait::Suspended;
            }
            if Instant::now() >= deadline {
                return SuspendWait::TimedOut;
            }
            if !self.ctx.sleep(self.config.suspend_poll_interval).await {
                return SuspendWait::Cancelled;
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.ctx.is_cancelled() {
            info!("OTA session cancelled, shutting down");
        } else {
            info!("OTA agent stopped, shutting down");
        }

        if self.ctx.is_session_established() {
            let _ = self.ctx.disconnect().await;
        }
        self.ctx.reset_signals();
        self.transition(SessionState::Terminated);
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("OTA session state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::{ConnCall, EngineCall, MockConnection, MockEngine, TestPool};
    use crate::transport::TransportEvent;
    use embassy_futures::block_on;
    use embassy_futures::join::join;
    use embassy_time::Timer;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    type TestContext<'p> =
        OtaContext<'p, CriticalSectionRawMutex, MockConnection, MockEngine<'p, 64>, 3, 3, 64>;

    fn context(pool: &TestPool) -> TestContext<'_> {
        OtaContext::new(pool, MockEngine::new(), MockConnection::new())
    }

    fn config() -> SessionConfig<'static> {
        SessionConfig::new("dev")
            .with_poll_timeout(Duration::from_millis(5))
            .with_stats_interval(Duration::from_millis(1))
            .with_suspend_timeout(Duration::from_millis(20))
            .with_suspend_poll_interval(Duration::from_millis(2))
            .with_reconnect_delay(Duration::from_millis(1))
    }

    fn connects(ctx: &TestContext<'_>) -> usize {
        block_on(ctx.client()).count(|call| matches!(call, ConnCall::Connect(_)))
    }

    fn disconnects(ctx: &TestContext<'_>) -> usize {
        block_on(ctx.client()).count(|call| *call == ConnCall::Disconnect)
    }

    #[test]
    fn default_config() {
        let config = SessionConfig::new("dev");
        assert_eq!(config.connect.client_id, "dev");
        assert_eq!(config.poll_timeout, Duration::from_millis(500));
        assert_eq!(config.stats_interval, Duration::from_millis(1000));
        assert_eq!(config.suspend_timeout, Duration::from_millis(5000));
    }

    #[test]
    fn start_suspend_resume_cycle() {
        let pool = TestPool::new();
        let ctx = context(&pool);
        let mut session = SessionOrchestrator::new(&ctx, config());

        block_on(session.step());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(ctx.engine().count(EngineCall::Start), 1);
        assert_eq!(ctx.engine().state(), AgentState::Active);

        ctx.on_transport_event(TransportEvent::Disconnected(DisconnectReason::NetworkDown));
        block_on(session.step());
        assert_eq!(session.state(), SessionState::Suspended);
        assert_eq!(ctx.engine().count(EngineCall::Suspend), 1);
        assert_eq!(disconnects(&ctx), 1);
        assert!(!ctx.is_session_established());

        block_on(session.step());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(ctx.engine().count(EngineCall::Resume), 1);
        assert_eq!(ctx.engine().count(EngineCall::Start), 1);
        assert_eq!(connects(&ctx), 2);
    }

    #[test]
    fn stopped_engine_terminates_once() {
        let pool = TestPool::new();
        let ctx = context(&pool);
        ctx.engine().state_after_stats.set(Some(AgentState::Stopped));
        let mut session = SessionOrchestrator::new(&ctx, config());

        assert_eq!(block_on(session.run()), Ok(()));
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(ctx.engine().count(EngineCall::Init), 1);
        assert_eq!(disconnects(&ctx), 1);
        assert!(!ctx.is_session_established());

        block_on(session.step());
        assert_eq!(disconnects(&ctx), 1);
        assert_eq!(connects(&ctx), 1);
    }

    #[test]
    fn init_failure_is_returned() {
        let pool = TestPool::new();
        let ctx = context(&pool);
        ctx.engine().fail_init.set(true);
        let mut session = SessionOrchestrator::new(&ctx, config());

        assert_eq!(block_on(session.run()), Err(EngineError::InitFailed));
        assert_eq!(connects(&ctx), 0);
    }

    #[test]
    fn failed_connect_retries_on_next_step() {
        let pool = TestPool::new();
        let ctx = context(&pool);
        block_on(ctx.client()).failing_connects = 2;
        let mut session = SessionOrchestrator::new(&ctx, config());

        block_on(session.step());
        assert_eq!(session.state(), SessionState::Idle);
        block_on(session.step());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(ctx.engine().count(EngineCall::Start), 0);

        block_on(session.step());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(ctx.engine().count(EngineCall::Start), 1);
        assert_eq!(connects(&ctx), 3);
    }

    #[test]
    fn suspend_timeout_falls_back_to_idle() {
        let pool = TestPool::new();
        let ctx = context(&pool);
        ctx.engine().confirm_suspend.set(false);
        let mut session = SessionOrchestrator::new(&ctx, config());

        block_on(session.step());
        ctx.on_transport_event(TransportEvent::Disconnected(DisconnectReason::BrokerDown));
        block_on(session.step());
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(ctx.engine().state(), AgentState::Active);

        block_on(session.step());
        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(ctx.engine().count(EngineCall::Start), 2);
        assert_eq!(ctx.engine().count(EngineCall::Resume), 0);
    }

    #[test]
    fn suspend_error_falls_back_to_idle() {
        let pool = TestPool::new();
        let ctx = context(&pool);
        ctx.engine().fail_suspend.set(true);
        let mut session = SessionOrchestrator::new(&ctx, config());

        block_on(session.step());
        ctx.on_transport_event(TransportEvent::Disconnected(DisconnectReason::SendReceiveFailed));
        block_on(session.step());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!ctx.is_session_established());
    }

    #[test]
    fn cancel_ends_suspend_wait_early() {
        let pool = TestPool::new();
        let ctx = context(&pool);
        ctx.engine().confirm_suspend.set(false);
        let mut session = SessionOrchestrator::new(
            &ctx,
            config().with_suspend_timeout(Duration::from_secs(60)),
        );

        block_on(session.step());
        ctx.on_transport_event(TransportEvent::Disconnected(DisconnectReason::NetworkDown));

        let started = Instant::now();
        block_on(join(session.step(), async {
            Timer::after(Duration::from_millis(10)).await;
            ctx.cancel();
        }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(ctx.engine().count(EngineCall::Suspend), 1);

        block_on(session.step());
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(connects(&ctx), 1);
    }

    #[test]
    fn cancel_terminates_connected_session() {
        let pool = TestPool::new();
        let ctx = context(&pool);
        let mut session = SessionOrchestrator::new(&ctx, config());

        block_on(session.step());
        ctx.cancel();
        block_on(session.step());
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(disconnects(&ctx), 1);
    }

    #[test]
    fn cancelled_before_run_never_connects() {
        let pool = TestPool::new();
        let ctx = context(&pool);
        ctx.cancel();
        let mut session = SessionOrchestrator::new(&ctx, config());

        assert_eq!(block_on(session.run()), Ok(()));
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(connects(&ctx), 0);
        assert_eq!(disconnects(&ctx), 0);
    }
}
