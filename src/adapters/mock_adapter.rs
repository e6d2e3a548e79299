//! Mock transport for testing
//!
//! This adapter stands in for a BraggMeter on the wire. It provides:
//! - Scripted replies per command (one-shot queue, then a default)
//! - Controllable failure injection
//! - Call logging for test verification

use super::Adapter;
use crate::error::{AppResult, DaqError};
use crate::instrument::protocol::{encode_rejection, encode_response, Command};
use crate::instrument::DeviceStatus;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
enum MockReply {
    Frame(Vec<u8>),
    Drop,
}

#[derive(Debug, Default)]
struct MockState {
    queued: HashMap<Command, VecDeque<MockReply>>,
    defaults: HashMap<Command, MockReply>,
    failures_pending: usize,
    call_log: Vec<Command>,
}

/// Mock device link for testing
///
/// Clones share state, so a test can keep a handle while the driver owns the
/// adapter.
///
/// # Example
///
/// ```
/// use bragg_daq::adapters::MockAdapter;
/// use bragg_daq::instrument::{protocol::Command, DeviceStatus};
///
/// let adapter = MockAdapter::new();
/// adapter.set_status(DeviceStatus::Idle);
/// adapter.set_reply(Command::Peaks(0), "1550.0");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockAdapter {
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    /// Create a mock with no replies scripted
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock that acknowledges start/stop and reports `status`.
    pub fn with_status(status: DeviceStatus) -> Self {
        let adapter = Self::new();
        adapter.set_status(status);
        adapter.set_reply(Command::Start, "");
        adapter.set_reply(Command::Stop, "");
        adapter
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reply with `payload` whenever nothing is queued for `command`
    pub fn set_reply(&self, command: Command, payload: &str) {
        self.state().defaults.insert(
            command,
            MockReply::Frame(encode_response(&command, payload)),
        );
    }

    /// Default status reply
    pub fn set_status(&self, status: DeviceStatus) {
        self.set_reply(Command::Status, &status.code().to_string());
    }

    /// Reply with `payload` once, ahead of the default
    pub fn queue_reply(&self, command: Command, payload: &str) {
        self.queue(command, MockReply::Frame(encode_response(&command, payload)));
    }

    /// Queue a status reply
    pub fn queue_status(&self, status: DeviceStatus) {
        self.queue_reply(Command::Status, &status.code().to_string());
    }

    /// Reply once with arbitrary bytes
    pub fn queue_raw(&self, command: Command, raw: &[u8]) {
        self.queue(command, MockReply::Frame(raw.to_vec()));
    }

    /// Reply once with an error token instead of `ACK`
    pub fn queue_rejection(&self, command: Command, reason: &str) {
        self.queue(command, MockReply::Frame(encode_rejection(&command, reason)));
    }

    /// Drop the connection once when `command` is sent
    pub fn queue_drop(&self, command: Command) {
        self.queue(command, MockReply::Drop);
    }

    fn queue(&self, command: Command, reply: MockReply) {
        self.state()
            .queued
            .entry(command)
            .or_default()
            .push_back(reply);
    }

    /// Fail the next exchange, whatever the command
    pub fn inject_next_failure(&self) {
        self.state().failures_pending += 1;
    }

    /// Commands received so far, in order
    pub fn call_log(&self) -> Vec<Command> {
        self.state().call_log.clone()
    }

    /// Number of times `command` was received
    pub fn count(&self, command: Command) -> usize {
        self.state()
            .call_log
            .iter()
            .filter(|c| **c == command)
            .count()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        self.state().call_log.clear();
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn exchange(&self, request: &[u8]) -> AppResult<Vec<u8>> {
        let line = String::from_utf8_lossy(request);
        let command = Command::parse(&line).ok_or_else(|| {
            DaqError::Disconnected(format!("mock device does not know '{}'", line.trim()))
        })?;

        let mut state = self.state();
        state.call_log.push(command);

        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            return Err(DaqError::Disconnected("injected failure".to_string()));
        }

        let queued = state.queued.get_mut(&command).and_then(VecDeque::pop_front);
        let reply = queued.or_else(|| state.defaults.get(&command).cloned());

        match reply {
            Some(MockReply::Frame(bytes)) => Ok(bytes),
            Some(MockReply::Drop) => Err(DaqError::Disconnected(format!(
                "mock device dropped the connection on {}",
                command
            ))),
            None => Err(DaqError::Disconnected(format!(
                "no reply scripted for {}",
                command
            ))),
        }
    }

    fn endpoint(&self) -> String {
        "mock".to_string()
    }
}
