//! BootstrapAttempt (§4.6): a single attempt to raise the transport to
//! "bootstrapped", racing a probe against transport progress.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{self, Either};
use futures::StreamExt;

use crate::collab::{TransportEvent, TransportProvider};
use crate::error::{AppError, Result};
use crate::moat::InternetReachability;

use super::internet_probe::InternetProbe;
use super::stage::BootstrapOptions;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    Complete,
    Offline,
    Cancelled,
}

/// Single-use: a fresh attempt is created per `begin_bootstrapping` call,
/// per §4.5's "at most one ongoing BootstrapAttempt" invariant.
pub struct BootstrapAttempt<T> {
    transport: Rc<T>,
    probe: Option<Rc<InternetProbe>>,
    cancelled: Cell<bool>,
    cancel_tx: RefCell<Option<oneshot::Sender<()>>>,
}

impl<T: TransportProvider> BootstrapAttempt<T> {
    pub fn new(transport: Rc<T>, probe: Option<Rc<InternetProbe>>) -> Self {
        Self {
            transport,
            probe,
            cancelled: Cell::new(false),
            cancel_tx: RefCell::new(None),
        }
    }

    /// Cancel both sub-operations. Idempotent; a late result from an
    /// already-resolved attempt is discarded by `run` itself.
    pub fn cancel(&self) {
        self.cancelled.set(true);
        if let Some(tx) = self.cancel_tx.borrow_mut().take() {
            let _ = tx.send(());
        }
        if let Some(probe) = &self.probe {
            probe.cancel();
        }
    }

    /// On success the second element is always `None`; an `Offline`
    /// outcome carries the transport error that the probe disambiguated,
    /// so callers can still report `phase`/`reason` (§8 scenario 2).
    pub async fn run(
        &self,
        settings: Option<String>,
        on_progress: &mut dyn FnMut(u8),
        options: &BootstrapOptions,
    ) -> Result<(BootstrapOutcome, Option<AppError>)> {
        if self.cancelled.get() {
            return Ok((BootstrapOutcome::Cancelled, None));
        }

        let (tx, cancel_rx) = oneshot::channel();
        *self.cancel_tx.borrow_mut() = Some(tx);

        let mut events = self.transport.begin_bootstrap(settings);
        let mut cancel_rx = cancel_rx;

        loop {
            match future::select(events.next(), cancel_rx).await {
                Either::Left((Some(TransportEvent::Progress(p)), returned_rx)) => {
                    on_progress(p);
                    cancel_rx = returned_rx;
                }
                Either::Left((Some(TransportEvent::Complete), _)) => {
                    return Ok((BootstrapOutcome::Complete, None));
                }
                Either::Left((Some(TransportEvent::Error(err)), _)) => {
                    return self.resolve_error(err, options).await;
                }
                Either::Left((None, _)) => {
                    return Err(AppError::bootstrap_failed("transport closed without resolving"));
                }
                Either::Right(_) => {
                    return Ok((BootstrapOutcome::Cancelled, None));
                }
            }
        }
    }

    /// On a transport error, disambiguate with the InternetProbe before
    /// deciding Offline vs. propagating the original error.
    async fn resolve_error(
        &self,
        err: AppError,
        options: &BootstrapOptions,
    ) -> Result<(BootstrapOutcome, Option<AppError>)> {
        if options.test_internet {
            if let Some(probe) = &self.probe {
                if matches!(probe.run_immediate(true).await, Ok(InternetReachability::Offline)) {
                    log::warn!("bootstrap error disambiguated as offline by internet probe: {err}");
                    return Ok((BootstrapOutcome::Offline, Some(err)));
                }
            }
        }
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::FakeTransportProvider;
    use crate::moat::MoatClient;

    fn options(test_internet: bool) -> BootstrapOptions {
        BootstrapOptions { region_code: None, test_internet }
    }

    #[test]
    fn test_complete_resolves_complete_and_reports_progress() {
        futures::executor::block_on(async {
            let transport = Rc::new(FakeTransportProvider::new(vec![
                TransportEvent::Progress(10),
                TransportEvent::Progress(60),
                TransportEvent::Complete,
            ]));
            let attempt = BootstrapAttempt::new(transport, None);
            let mut seen = Vec::new();
            let mut on_progress = |p: u8| seen.push(p);
            let (outcome, err) = attempt.run(None, &mut on_progress, &options(false)).await.unwrap();
            assert_eq!(outcome, BootstrapOutcome::Complete);
            assert!(err.is_none());
            assert_eq!(seen, vec![10, 60]);
        });
    }

    #[test]
    fn test_error_without_probe_propagates() {
        futures::executor::block_on(async {
            let transport = Rc::new(FakeTransportProvider::new(vec![TransportEvent::Error(
                AppError::bootstrap_failed("conn reset"),
            )]));
            let attempt = BootstrapAttempt::new(transport, None);
            let mut on_progress = |_p: u8| {};
            let err = attempt.run(None, &mut on_progress, &options(false)).await.unwrap_err();
            assert!(matches!(err, AppError::BootstrapFailed { .. }));
        });
    }

    #[test]
    fn test_error_disambiguated_offline_by_probe() {
        futures::executor::block_on(async {
            use crate::clock::ImmediateSleeper;
            use crate::fetch::{FakeHttpTransport, FetchChannel, HttpTransport};

            let transport = Rc::new(FakeTransportProvider::new(vec![TransportEvent::Error(
                AppError::bootstrap_failed("conn reset"),
            )]));

            let direct = Rc::new(FakeHttpTransport::new());
            direct.script("testInternetConnection", Ok(serde_json::json!({"status": "offline"}).to_string()));
            let front = Rc::new(FakeHttpTransport::new());
            let channel = FetchChannel::new(
                "https://moat.example",
                "https://front.example",
                direct,
                Box::new(move || front.clone() as Rc<dyn HttpTransport>),
            );
            let moat = Rc::new(MoatClient::new(channel));
            let probe = Rc::new(InternetProbe::new(
                moat,
                Rc::new(ImmediateSleeper::new()),
                std::time::Duration::from_secs(25),
                std::time::Duration::from_secs(35),
            ));

            let attempt = BootstrapAttempt::new(transport, Some(probe));
            let mut on_progress = |_p: u8| {};
            let (outcome, err) = attempt.run(None, &mut on_progress, &options(true)).await.unwrap();
            assert_eq!(outcome, BootstrapOutcome::Offline);
            assert!(matches!(err, Some(AppError::BootstrapFailed { .. })));
        });
    }

    #[test]
    fn test_cancel_before_run_resolves_cancelled() {
        futures::executor::block_on(async {
            let transport = Rc::new(FakeTransportProvider::new(vec![TransportEvent::Complete]));
            let attempt = BootstrapAttempt::new(transport, None);
            attempt.cancel();
            let mut on_progress = |_p: u8| {};
            let (outcome, _err) = attempt.run(None, &mut on_progress, &options(false)).await.unwrap();
            assert_eq!(outcome, BootstrapOutcome::Cancelled);
        });
    }
}
