//! AutoBootstrapAttempt (§4.7): obtains censorship-circumvention settings
//! from Moat and tries each candidate in turn, delegating each try to a
//! nested BootstrapAttempt.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::channel::oneshot;
use futures::future::{self, Either};

use crate::clock::Sleeper;
use crate::collab::{SettingsStore, TransportProvider, TransportStatus};
use crate::config::CoreConfig;
use crate::error::{AppError, Result};
use crate::moat::{MoatClient, TransportConfig};

use super::bootstrap_attempt::{BootstrapAttempt, BootstrapOutcome};
use super::internet_probe::build_probe;
use super::stage::BootstrapOptions;

/// Persisted key AutoBootstrapAttempt treats as "the settings currently
/// applied to the transport" — snapshotted once at start, restored
/// verbatim on cleanup (Open Question (c)).
const KEY_BRIDGE_STRINGS: &str = "bridges.bridge_strings";

pub struct AutoBootstrapOutcome {
    pub outcome: BootstrapOutcome,
    pub detected_region: Option<String>,
}

pub struct AutoBootstrapAttempt<S, T> {
    transport: Rc<T>,
    moat: Rc<MoatClient>,
    settings: Rc<S>,
    sleeper: Rc<dyn Sleeper>,
    config: Rc<CoreConfig>,
    cancelled: Cell<bool>,
    cancel_tx: RefCell<Option<oneshot::Sender<()>>>,
    current_nested: RefCell<Option<Rc<BootstrapAttempt<T>>>>,
}

impl<S: SettingsStore, T: TransportProvider> AutoBootstrapAttempt<S, T> {
    pub fn new(
        transport: Rc<T>,
        moat: Rc<MoatClient>,
        settings: Rc<S>,
        sleeper: Rc<dyn Sleeper>,
        config: Rc<CoreConfig>,
    ) -> Self {
        Self {
            transport,
            moat,
            settings,
            sleeper,
            config,
            cancelled: Cell::new(false),
            cancel_tx: RefCell::new(None),
            current_nested: RefCell::new(None),
        }
    }

    /// Aborts the current sub-bootstrap and any in-flight Moat request.
    pub fn cancel(&self) {
        self.cancelled.set(true);
        if let Some(tx) = self.cancel_tx.borrow_mut().take() {
            let _ = tx.send(());
        }
        if let Some(nested) = self.current_nested.borrow().as_ref() {
            nested.cancel();
        }
    }

    pub async fn run(
        &self,
        region_code: Option<&str>,
        on_progress: &mut dyn FnMut(u8),
        options: &BootstrapOptions,
    ) -> Result<AutoBootstrapOutcome> {
        let original_settings = self.settings.get(KEY_BRIDGE_STRINGS).await?;

        let result = self.try_settings(region_code, on_progress, options).await;

        let completed = matches!(
            result,
            Ok(AutoBootstrapOutcome { outcome: BootstrapOutcome::Complete, .. })
        );
        if !completed {
            self.restore_settings(original_settings).await;
        }

        result
    }

    async fn try_settings(
        &self,
        region_code: Option<&str>,
        on_progress: &mut dyn FnMut(u8),
        options: &BootstrapOptions,
    ) -> Result<AutoBootstrapOutcome> {
        let transports = self.config.offered_transports();
        let bootstrapped = self.transport.status() == TransportStatus::Bootstrapped;

        let (tx, cancel_rx) = oneshot::channel();
        *self.cancel_tx.borrow_mut() = Some(tx);

        let settings_fut = self.moat.circumvention_settings(bootstrapped, &transports, region_code);
        let moat_settings = match future::select(Box::pin(settings_fut), cancel_rx).await {
            Either::Left((res, _)) => res?,
            Either::Right(_) => {
                return Ok(AutoBootstrapOutcome { outcome: BootstrapOutcome::Cancelled, detected_region: None });
            }
        };

        let detected_region = moat_settings.country.clone();
        let mut candidates = moat_settings.settings;
        if candidates.is_empty() {
            candidates = self
                .moat
                .circumvention_defaults(bootstrapped, &transports)
                .await?
                .settings;
        }
        if candidates.is_empty() {
            return Err(if region_code.is_none() {
                AppError::CannotDetermineCountry
            } else {
                AppError::NoSettingsForCountry
            });
        }

        for candidate in &candidates {
            if self.cancelled.get() {
                return Ok(AutoBootstrapOutcome { outcome: BootstrapOutcome::Cancelled, detected_region });
            }

            let merged = merge_settings(self.settings.get(KEY_BRIDGE_STRINGS).await?, candidate);
            self.transport.apply_settings(&merged).await?;

            let probe = build_probe(options.test_internet, Rc::clone(&self.moat), Rc::clone(&self.sleeper), &self.config);
            let nested = Rc::new(BootstrapAttempt::new(Rc::clone(&self.transport), probe));
            *self.current_nested.borrow_mut() = Some(Rc::clone(&nested));
            let nested_result = nested.run(Some(merged.clone()), on_progress, options).await;
            *self.current_nested.borrow_mut() = None;

            match nested_result {
                Ok((BootstrapOutcome::Complete, _)) => {
                    self.settings.set(KEY_BRIDGE_STRINGS, &merged).await?;
                    return Ok(AutoBootstrapOutcome { outcome: BootstrapOutcome::Complete, detected_region });
                }
                Ok((BootstrapOutcome::Cancelled, _)) => {
                    return Ok(AutoBootstrapOutcome { outcome: BootstrapOutcome::Cancelled, detected_region });
                }
                Ok((BootstrapOutcome::Offline, _)) => {
                    return Ok(AutoBootstrapOutcome { outcome: BootstrapOutcome::Offline, detected_region });
                }
                Err(err) if err.is_retryable_setting_failure() => {
                    log::warn!("circumvention candidate failed, trying next: {err}");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        Err(AppError::AllSettingsFailed)
    }

    async fn restore_settings(&self, original: Option<String>) {
        let restore = original.unwrap_or_default();
        if let Err(err) = self.transport.apply_settings(&restore).await {
            log::warn!("failed to restore original transport settings after auto-bootstrap cleanup: {err}");
        }
    }
}

fn merge_settings(existing: Option<String>, candidate: &TransportConfig) -> String {
    let mut merged = existing
        .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    if let serde_json::Value::Object(ref mut map) = merged {
        if let serde_json::Value::Object(candidate_map) = &candidate.0 {
            for (k, v) in candidate_map {
                map.insert(k.clone(), v.clone());
            }
        }
    }
    merged.to_string()
}
