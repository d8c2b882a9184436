//! TransportProvider contract (§1, §4.6): starts/stops the anonymizing
//! transport, reports progress/errors, accepts a settings blob, reports
//! the current bridge fingerprint.
//!
//! The real Tor transport (circuits, relays, NTor, congestion control)
//! is not implemented by this crate — it lives entirely behind this
//! trait, supplied by the embedding application.

use async_trait::async_trait;
use futures::channel::mpsc;
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Stopped,
    Bootstrapping,
    Bootstrapped,
}

/// One event in the progress stream of a single bootstrap attempt.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Progress(u8),
    Complete,
    Error(AppError),
}

#[async_trait(?Send)]
pub trait TransportProvider {
    /// Begin bootstrapping with an optional merged settings blob (opaque
    /// JSON, as produced by AutoBootstrapAttempt). Returns a receiver of
    /// progress/complete/error events for this single attempt; dropping
    /// the receiver does not itself stop the transport (see `stop`).
    fn begin_bootstrap(&self, settings: Option<String>) -> mpsc::UnboundedReceiver<TransportEvent>;

    /// Stop whatever bootstrap attempt is in progress.
    async fn stop(&self) -> Result<(), AppError>;

    /// Write a settings blob to the transport without starting a bootstrap
    /// (used by AutoBootstrapAttempt to try a candidate in place).
    async fn apply_settings(&self, settings: &str) -> Result<(), AppError>;

    /// Current status, independent of any particular attempt.
    fn status(&self) -> TransportStatus;

    /// The fingerprint of the bridge currently in use, if any.
    fn bridge_fingerprint(&self) -> Option<String>;
}

/// Deterministic in-memory fake for tests: emits a scripted event
/// sequence when `begin_bootstrap` is called and tracks the settings it
/// was given, so scenario tests can assert on them.
pub struct FakeTransportProvider {
    script: RefCell<Vec<TransportEvent>>,
    status: RefCell<TransportStatus>,
    applied_settings: RefCell<Vec<String>>,
    fingerprint: RefCell<Option<String>>,
    stop_calls: Rc<RefCell<u32>>,
}

impl FakeTransportProvider {
    /// `script` is replayed in order on the next `begin_bootstrap` call.
    pub fn new(script: Vec<TransportEvent>) -> Self {
        Self {
            script: RefCell::new(script),
            status: RefCell::new(TransportStatus::Stopped),
            applied_settings: RefCell::new(Vec::new()),
            fingerprint: RefCell::new(None),
            stop_calls: Rc::new(RefCell::new(0)),
        }
    }

    pub fn set_script(&self, script: Vec<TransportEvent>) {
        *self.script.borrow_mut() = script;
    }

    pub fn applied_settings(&self) -> Vec<String> {
        self.applied_settings.borrow().clone()
    }

    pub fn stop_call_count(&self) -> u32 {
        *self.stop_calls.borrow()
    }

    pub fn set_fingerprint(&self, fp: Option<String>) {
        *self.fingerprint.borrow_mut() = fp;
    }
}

#[async_trait(?Send)]
impl TransportProvider for FakeTransportProvider {
    fn begin_bootstrap(&self, settings: Option<String>) -> mpsc::UnboundedReceiver<TransportEvent> {
        if let Some(s) = settings {
            self.applied_settings.borrow_mut().push(s);
        }
        *self.status.borrow_mut() = TransportStatus::Bootstrapping;

        let (tx, rx) = mpsc::unbounded();
        let events = std::mem::take(&mut *self.script.borrow_mut());
        for event in events {
            if matches!(event, TransportEvent::Complete) {
                *self.status.borrow_mut() = TransportStatus::Bootstrapped;
            }
            let _ = tx.unbounded_send(event);
        }
        rx
    }

    async fn stop(&self) -> Result<(), AppError> {
        *self.stop_calls.borrow_mut() += 1;
        *self.status.borrow_mut() = TransportStatus::Stopped;
        Ok(())
    }

    async fn apply_settings(&self, settings: &str) -> Result<(), AppError> {
        self.applied_settings.borrow_mut().push(settings.to_string());
        Ok(())
    }

    fn status(&self) -> TransportStatus {
        *self.status.borrow()
    }

    fn bridge_fingerprint(&self) -> Option<String> {
        self.fingerprint.borrow().clone()
    }
}
