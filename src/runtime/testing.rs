//! Test doubles for the update engine and the transport client.

use core::cell::{Cell, RefCell};
use std::string::{String, ToString};
use std::vec::Vec;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_time::{Duration, Timer};

use crate::error::EngineError;
use crate::packet::QoS;
use crate::runtime::pool::EventBufferPool;
use crate::runtime::traits::{
    AgentEvent, AgentState, AgentStatistics, ImageState, ShutdownOptions, UpdateEngine,
};
use crate::transport::{ConnectOptions, MqttConnection};

pub type TestPool = EventBufferPool<CriticalSectionRawMutex, 3, 64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineCall {
    Init,
    Start,
    Resume,
    Suspend,
    Shutdown(ShutdownOptions),
    Activate,
    SetImageState(ImageState),
}

/// Scriptable engine. Starts in `Ready` and confirms suspension immediately.
pub struct MockEngine<'p, const SIZE: usize> {
    pub state: Cell<AgentState>,
    pub calls: RefCell<Vec<EngineCall>>,
    pub received: RefCell<Vec<AgentEvent<'p, SIZE>>>,
    pub reject_events: Cell<bool>,
    pub fail_init: Cell<bool>,
    pub fail_suspend: Cell<bool>,
    pub confirm_suspend: Cell<bool>,
    /// Engine state to report once `statistics` has been read.
    pub state_after_stats: Cell<Option<AgentState>>,
}

impl<'p, const SIZE: usize> MockEngine<'p, SIZE> {
    pub fn new() -> Self {
        Self {
            state: Cell::new(AgentState::Ready),
            calls: RefCell::new(Vec::new()),
            received: RefCell::new(Vec::new()),
            reject_events: Cell::new(false),
            fail_init: Cell::new(false),
            fail_suspend: Cell::new(false),
            confirm_suspend: Cell::new(true),
            state_after_stats: Cell::new(None),
        }
    }

    pub fn count(&self, call: EngineCall) -> usize {
        self.calls.borrow().iter().filter(|c| **c == call).count()
    }

    fn record(&self, call: EngineCall) {
        self.calls.borrow_mut().push(call);
    }
}

impl<'p, const SIZE: usize> UpdateEngine<'p, SIZE> for MockEngine<'p, SIZE> {
    fn init(&self, _client_id: &str) -> Result<(), EngineError> {
        self.record(EngineCall::Init);
        if self.fail_init.get() {
            return Err(EngineError::InitFailed);
        }
        Ok(())
    }

    fn signal_event(&self, event: AgentEvent<'p, SIZE>) -> Result<(), EngineError> {
        if self.reject_events.get() {
            return Err(EngineError::SignalFailed);
        }
        match event {
            AgentEvent::Start => {
                self.record(EngineCall::Start);
                self.state.set(AgentState::Active);
            }
            other => self.received.borrow_mut().push(other),
        }
        Ok(())
    }

    fn state(&self) -> AgentState {
        self.state.get()
    }

    fn suspend(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Suspend);
        if self.fail_suspend.get() {
            return Err(EngineError::SuspendFailed);
        }
        if self.confirm_suspend.get() {
            self.state.set(AgentState::Suspended);
        }
        Ok(())
    }

    fn resume(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Resume);
        self.state.set(AgentState::Active);
        Ok(())
    }

    fn statistics(&self) -> AgentStatistics {
        if let Some(next) = self.state_after_stats.take() {
            self.state.set(next);
        }
        AgentStatistics {
            packets_received: self.received.borrow().len() as u32,
            ..AgentStatistics::default()
        }
    }

    fn shutdown(&self, options: ShutdownOptions) -> Result<(), EngineError> {
        self.record(EngineCall::Shutdown(options));
        self.state.set(AgentState::Stopped);
        Ok(())
    }

    fn activate_new_image(&self) -> Result<(), EngineError> {
        self.record(EngineCall::Activate);
        Ok(())
    }

    fn set_image_state(&self, state: ImageState) -> Result<(), EngineError> {
        self.record(EngineCall::SetImageState(state));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnCall {
    Connect(String),
    Disconnect,
    Subscribe(String),
    Publish(String, Vec<u8>),
    Unsubscribe(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError;

/// Records every call; individual operations can be made to fail.
#[derive(Default)]
pub struct MockConnection {
    pub calls: Vec<ConnCall>,
    /// Number of upcoming connect attempts that fail.
    pub failing_connects: usize,
    pub fail_subscribe: bool,
    pub fail_publish: bool,
    pub fail_unsubscribe: bool,
    pub fail_disconnect: bool,
    /// Time each connect attempt takes before it completes.
    pub connect_delay: Option<Duration>,
}

impl MockConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, matcher: impl Fn(&ConnCall) -> bool) -> usize {
        self.calls.iter().filter(|call| matcher(call)).count()
    }
}

fn outcome(fail: bool) -> Result<(), MockError> {
    if fail { Err(MockError) } else { Ok(()) }
}

impl MqttConnection for MockConnection {
    type Error = MockError;

    async fn connect(&mut self, options: &ConnectOptions<'_>) -> Result<(), Self::Error> {
        self.calls.push(ConnCall::Connect(options.client_id.to_string()));
        if let Some(delay) = self.connect_delay {
            Timer::after(delay).await;
        }
        if self.failing_connects > 0 {
            self.failing_connects -= 1;
            return Err(MockError);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Self::Error> {
        self.calls.push(ConnCall::Disconnect);
        outcome(self.fail_disconnect)
    }

    async fn subscribe(&mut self, filter: &str, _qos: QoS) -> Result<(), Self::Error> {
        self.calls.push(ConnCall::Subscribe(filter.to_string()));
        outcome(self.fail_subscribe)
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], _qos: QoS) -> Result<(), Self::Error> {
        self.calls
            .push(ConnCall::Publish(topic.to_string(), payload.to_vec()));
        outcome(self.fail_publish)
    }

    async fn unsubscribe(&mut self, filter: &str, _qos: QoS) -> Result<(), Self::Error> {
        self.calls.push(ConnCall::Unsubscribe(filter.to_string()));
        outcome(self.fail_unsubscribe)
    }
}
