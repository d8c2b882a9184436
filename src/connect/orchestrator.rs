//! ConnectOrchestrator (§4.5): the top-level stage machine coordinating
//! user actions, quick-start, cancellation, and stage transitions.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::clock::Sleeper;
use crate::collab::{EventBus, SettingsStore, TransportProvider};
use crate::config::CoreConfig;
use crate::error::{AppError, BootstrapError, ErrorKind, Result};
use crate::moat::MoatClient;

use super::auto_bootstrap::AutoBootstrapAttempt;
use super::bootstrap_attempt::{BootstrapAttempt, BootstrapOutcome};
use super::internet_probe::build_probe;
use super::stage::{BootstrapOptions, BootstrapStatus, Stage, StageSnapshot};

enum CurrentAttempt<S, T> {
    None,
    Plain(Rc<BootstrapAttempt<T>>),
    Auto(Rc<AutoBootstrapAttempt<S, T>>),
}

impl<S, T> CurrentAttempt<S, T> {
    fn is_none(&self) -> bool {
        matches!(self, CurrentAttempt::None)
    }
}

/// Outcome of a single `begin_bootstrapping` call, carrying whatever the
/// underlying plain/auto attempt discovered: the detected region (auto
/// only) and, for `Offline`, the transport error the probe disambiguated
/// (§8 scenario 2: `phase`/`reason` must survive into `StageSnapshot.error`).
struct AttemptResult {
    outcome: BootstrapOutcome,
    detected_region: Option<String>,
    error: Option<AppError>,
}

pub struct ConnectOrchestrator<S, B, T> {
    transport: Rc<T>,
    settings: Rc<S>,
    events: Rc<B>,
    moat: Rc<MoatClient>,
    sleeper: Rc<dyn Sleeper>,
    config: Rc<CoreConfig>,
    state: RefCell<StageSnapshot>,
    requested_stage: RefCell<Option<Stage>>,
    prompt_at_startup: Cell<bool>,
    current: RefCell<CurrentAttempt<S, T>>,
}

impl<S: SettingsStore, B: EventBus, T: TransportProvider> ConnectOrchestrator<S, B, T> {
    pub fn new(
        transport: Rc<T>,
        settings: Rc<S>,
        events: Rc<B>,
        moat: Rc<MoatClient>,
        sleeper: Rc<dyn Sleeper>,
        config: Rc<CoreConfig>,
        default_region: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            settings,
            events,
            moat,
            sleeper,
            config,
            state: RefCell::new(StageSnapshot::new(default_region)),
            requested_stage: RefCell::new(None),
            prompt_at_startup: Cell::new(false),
            current: RefCell::new(CurrentAttempt::None),
        }
    }

    pub fn snapshot(&self) -> StageSnapshot {
        self.state.borrow().clone()
    }

    pub fn set_prompt_at_startup(&self, value: bool) {
        self.prompt_at_startup.set(value);
    }

    /// Called once the TransportProvider signals it's ready to accept
    /// bootstrap requests. Moves to `Start`, then quick-starts iff
    /// `quickstart_enabled ∧ ¬prompt_at_startup`.
    pub async fn on_transport_ready(&self, quickstart_enabled: bool) {
        self.set_stage_with(|s| s.name = Stage::Start);
        if quickstart_enabled && !self.prompt_at_startup.get() {
            if let Err(err) = self.begin_bootstrapping(None).await {
                log::warn!("quick-start bootstrap did not complete: {err}");
            }
        }
    }

    /// Process-exit recovery (§4.5): force `prompt_at_startup` and request
    /// `Start`, overriding even `Bootstrapped`.
    pub fn handle_transport_exit(&self) {
        self.prompt_at_startup.set(true);
        self.request_stage(Stage::Start, true);
    }

    pub fn start_again(&self) {
        self.request_stage(Stage::Start, false);
    }

    pub fn choose_region(&self) {
        self.request_stage(Stage::ChooseRegion, false);
    }

    pub fn cancel_bootstrapping(&self) {
        match &*self.current.borrow() {
            CurrentAttempt::Plain(attempt) => attempt.cancel(),
            CurrentAttempt::Auto(attempt) => attempt.cancel(),
            CurrentAttempt::None => {}
        }
    }

    /// `region_code = None` is an ordinary bootstrap; `Some(_)` (including
    /// `"automatic"`, meaning "let Moat detect") is an auto-bootstrap.
    pub async fn begin_bootstrapping(&self, region_code: Option<String>) -> Result<()> {
        let begin_stage = self.state.borrow().name;
        let is_auto = region_code.is_some();

        let gate_ok = if is_auto {
            begin_stage.can_begin_auto_bootstrap()
        } else {
            begin_stage.can_begin_bootstrap()
        };
        if !gate_ok {
            return Err(AppError::InvalidState(format!(
                "cannot begin {} bootstrap from stage {:?}",
                if is_auto { "auto" } else { "plain" },
                begin_stage
            )));
        }
        if !self.current.borrow().is_none() {
            return Err(AppError::InvalidState("a bootstrap attempt is already in progress".into()));
        }

        self.set_stage_with(|s| {
            s.bootstrap_trigger = Some(begin_stage);
            s.name = Stage::Bootstrapping;
            s.status = BootstrapStatus::default();
        });

        let options = BootstrapOptions { region_code: region_code.clone(), test_internet: true };

        let result = if is_auto {
            self.run_auto(region_code.as_deref(), &options).await
        } else {
            self.run_plain(&options).await
        };

        self.handle_attempt_result(begin_stage, result).await
    }

    async fn run_plain(&self, options: &BootstrapOptions) -> Result<AttemptResult> {
        let probe = build_probe(options.test_internet, Rc::clone(&self.moat), Rc::clone(&self.sleeper), &self.config);
        let attempt = Rc::new(BootstrapAttempt::new(Rc::clone(&self.transport), probe));
        *self.current.borrow_mut() = CurrentAttempt::Plain(Rc::clone(&attempt));

        let mut progress_cb = self.progress_callback();
        let result = attempt.run(None, &mut progress_cb, options).await;
        *self.current.borrow_mut() = CurrentAttempt::None;
        result.map(|(outcome, error)| AttemptResult { outcome, detected_region: None, error })
    }

    async fn run_auto(&self, region_code: Option<&str>, options: &BootstrapOptions) -> Result<AttemptResult> {
        let region = region_code.filter(|r| *r != "automatic");
        let attempt = Rc::new(AutoBootstrapAttempt::new(
            Rc::clone(&self.transport),
            Rc::clone(&self.moat),
            Rc::clone(&self.settings),
            Rc::clone(&self.sleeper),
            Rc::clone(&self.config),
        ));
        *self.current.borrow_mut() = CurrentAttempt::Auto(Rc::clone(&attempt));

        let mut progress_cb = self.progress_callback();
        let result = attempt.run(region, &mut progress_cb, options).await;
        *self.current.borrow_mut() = CurrentAttempt::None;
        result.map(|out| AttemptResult { outcome: out.outcome, detected_region: out.detected_region, error: None })
    }

    fn progress_callback(&self) -> impl FnMut(u8) + '_ {
        move |progress: u8| {
            {
                let mut state = self.state.borrow_mut();
                state.status.progress = state.status.progress.max(progress);
            }
            self.events.emit("bootstrap-progress", serde_json::json!({ "progress": progress }));
        }
    }

    async fn handle_attempt_result(&self, begin_stage: Stage, outcome: Result<AttemptResult>) -> Result<()> {
        let requested = self.requested_stage.borrow_mut().take();

        match outcome {
            Ok(AttemptResult { outcome: BootstrapOutcome::Complete, .. }) => {
                self.set_stage_with(|s| {
                    s.name = Stage::Bootstrapped;
                    s.try_again = false;
                    s.potentially_blocked = false;
                    s.error = None;
                    s.status.progress = 100;
                });
                self.events.emit("bootstrap-complete", serde_json::json!({}));
                Ok(())
            }
            Ok(AttemptResult { outcome: BootstrapOutcome::Offline, error, .. })
                if matches!(begin_stage, Stage::Start | Stage::Offline) =>
            {
                // The probe, not the transport, classified this as Offline, so
                // report that code even though `error` is the underlying
                // transport failure it disambiguated (phase/reason survive).
                let offline_error = error.as_ref().map(|err| BootstrapError {
                    code: ErrorKind::Offline,
                    ..BootstrapError::from(err)
                });
                self.set_stage_with(|s| {
                    s.name = requested.unwrap_or(Stage::Offline);
                    s.try_again = true;
                    s.error = offline_error;
                });
                Ok(())
            }
            Ok(AttemptResult { outcome: BootstrapOutcome::Offline, detected_region, .. }) => {
                self.transition_after_failure(begin_stage, requested, detected_region, None).await
            }
            Ok(AttemptResult { outcome: BootstrapOutcome::Cancelled, .. }) => {
                self.set_stage_with(|s| s.name = requested.unwrap_or(begin_stage));
                Ok(())
            }
            Err(err) => self.transition_after_failure(begin_stage, requested, None, Some(err)).await,
        }
    }

    async fn transition_after_failure(
        &self,
        begin_stage: Stage,
        requested: Option<Stage>,
        detected_region: Option<String>,
        err: Option<AppError>,
    ) -> Result<()> {
        if let Some(err) = &err {
            log::warn!("bootstrap attempt failed: {err}");
        }
        let bootstrap_error = err.as_ref().map(BootstrapError::from);

        let next_stage = requested.unwrap_or_else(|| match begin_stage {
            Stage::Start | Stage::Offline => Stage::ChooseRegion,
            Stage::ChooseRegion => {
                if detected_region.is_some() {
                    Stage::ConfirmRegion
                } else {
                    Stage::RegionNotFound
                }
            }
            _ => Stage::FinalError,
        });

        self.set_stage_with(|s| {
            s.name = next_stage;
            s.try_again = true;
            s.potentially_blocked = true;
            s.error = bootstrap_error.clone();
            if let Some(region) = &detected_region {
                s.default_region = region.clone();
            }
        });

        if let Some(err) = err {
            self.events.emit("error", serde_json::json!({ "message": err.to_string() }));
            Err(err)
        } else {
            Ok(())
        }
    }

    fn request_stage(&self, stage: Stage, override_bootstrapped: bool) {
        let current_name = self.state.borrow().name;
        if current_name == Stage::Bootstrapped && !override_bootstrapped {
            log::warn!("ignoring stage request to {:?}: already bootstrapped", stage);
            return;
        }
        if !self.current.borrow().is_none() {
            *self.requested_stage.borrow_mut() = Some(stage);
            self.cancel_bootstrapping();
        } else {
            self.set_stage_with(|s| s.name = stage);
        }
    }

    fn set_stage_with(&self, f: impl FnOnce(&mut StageSnapshot)) {
        let snapshot = {
            let mut state = self.state.borrow_mut();
            f(&mut state);
            state.clone()
        };
        self.events.emit(
            "stage-change",
            serde_json::to_value(&snapshot).unwrap_or(serde_json::Value::Null),
        );
    }
}
