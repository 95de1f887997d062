//! In-memory transport for tests and offline runs.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{PolyError, PolyResult};
use crate::protocol::Outbound;
use crate::transport::Transport;

/// Records every outbound message instead of publishing it.
#[derive(Debug)]
pub struct RecordingTransport {
    profile_num: String,
    sent: Mutex<Vec<Outbound>>,
    connected: AtomicBool,
    fail_sends: AtomicBool,
    controller_claimed: AtomicBool,
    stops: AtomicUsize,
}

impl RecordingTransport {
    pub fn new(profile_num: impl Into<String>) -> Self {
        Self {
            profile_num: profile_num.into(),
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            controller_claimed: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
        }
    }

    /// Snapshot of everything sent so far.
    pub fn sent(&self) -> Vec<Outbound> {
        self.sent.lock().clone()
    }

    /// Messages of one wire kind, e.g. `"status"`.
    pub fn sent_of(&self, kind: &str) -> Vec<Outbound> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect()
    }

    /// Drain the recorded messages.
    pub fn take(&self) -> Vec<Outbound> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Make every following `send` fail until switched back.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn controller_claimed(&self) -> bool {
        self.controller_claimed.load(Ordering::SeqCst)
    }

    /// Number of times `stop` was called.
    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Transport for RecordingTransport {
    fn profile_num(&self) -> &str {
        &self.profile_num
    }

    fn send(&self, message: &Outbound) -> PolyResult<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(PolyError::Transport(format!(
                "MQTT Send Error: {} rejected",
                message.kind()
            )));
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn claim_controller(&self) -> PolyResult<()> {
        if self.controller_claimed.swap(true, Ordering::SeqCst) {
            return Err(PolyError::Singleton("Controller"));
        }
        Ok(())
    }

    fn release_controller(&self) {
        self.controller_claimed.store(false, Ordering::SeqCst);
    }
}
