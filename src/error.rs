//! Error types for the connect/bridge-acquisition core
//!
//! Mirrors the spec's `ErrorKind` taxonomy: a small set of
//! programmatic codes, a fatal/retryable classification, and a
//! `JsValue` conversion for the wasm-bindgen boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wasm_bindgen::JsValue;

pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for programmatic handling, matching `ErrorKind` in the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Offline,
    BootstrapError,
    CannotDetermineCountry,
    NoSettingsForCountry,
    AllSettingsFailed,
    ExternalError,

    // Lox-side kinds, not part of BootstrapError but reported the same way.
    BadInvite,
    NoInvitations,
    NotInitialized,
    NotActive,
    ServerUnreachable,
}

/// Main error type for the bootstrap/Lox core.
#[derive(Error, Debug, Clone)]
pub enum AppError {
    // ===== Bootstrap errors =====
    #[error("device appears offline")]
    Offline,

    #[error("bootstrap failed: {message}")]
    BootstrapFailed {
        message: String,
        phase: Option<String>,
        reason: Option<String>,
    },

    #[error("could not determine country for circumvention settings")]
    CannotDetermineCountry,

    #[error("no circumvention settings available for this country")]
    NoSettingsForCountry,

    #[error("all circumvention settings failed")]
    AllSettingsFailed,

    // ===== Transport / fetch errors =====
    #[error("Lox/Moat server unreachable: {0}")]
    ServerUnreachable(String),

    #[error("HTTP {status} {status_text}")]
    HttpError { status: u16, status_text: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("server returned an error response: {0}")]
    ProcedureError(String),

    // ===== Lox errors =====
    #[error("invalid invitation")]
    BadInvite,

    #[error("no invitations remaining")]
    NoInvitations,

    #[error("credential engine rejected pubkey refresh, retry later")]
    PubkeysNotReady,

    #[error("client has not been initialized")]
    NotInitialized,

    #[error("lox id is not the active id")]
    NotActive,

    // ===== Credential engine =====
    #[error("credential engine error: {0}")]
    CredentialEngine(String),

    // ===== Storage =====
    #[error("settings store error: {0}")]
    Storage(String),

    // ===== Generic =====
    #[error("external error: {0}")]
    External(String),

    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl AppError {
    /// Get the error kind for programmatic handling.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Offline => ErrorKind::Offline,
            AppError::BootstrapFailed { .. } => ErrorKind::BootstrapError,
            AppError::CannotDetermineCountry => ErrorKind::CannotDetermineCountry,
            AppError::NoSettingsForCountry => ErrorKind::NoSettingsForCountry,
            AppError::AllSettingsFailed => ErrorKind::AllSettingsFailed,
            AppError::ServerUnreachable(_) => ErrorKind::ServerUnreachable,
            AppError::HttpError { .. } => ErrorKind::ExternalError,
            AppError::MalformedResponse(_) => ErrorKind::ExternalError,
            AppError::ProcedureError(_) => ErrorKind::ExternalError,
            AppError::BadInvite => ErrorKind::BadInvite,
            AppError::NoInvitations => ErrorKind::NoInvitations,
            AppError::PubkeysNotReady => ErrorKind::ExternalError,
            AppError::NotInitialized => ErrorKind::NotInitialized,
            AppError::NotActive => ErrorKind::NotActive,
            AppError::CredentialEngine(_) => ErrorKind::ExternalError,
            AppError::Storage(_) => ErrorKind::ExternalError,
            AppError::External(_) => ErrorKind::ExternalError,
            AppError::InvalidState(_) => ErrorKind::ExternalError,
        }
    }

    /// Whether this error is fatal to the whole bootstrap attempt (as
    /// opposed to "not ready yet" recoveries like a levelup rejection).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AppError::CannotDetermineCountry
                | AppError::NoSettingsForCountry
                | AppError::AllSettingsFailed
        )
    }

    /// Whether AutoBootstrapAttempt should try the next setting on this error
    /// rather than aborting outright.
    pub fn is_retryable_setting_failure(&self) -> bool {
        matches!(self, AppError::BootstrapFailed { .. } | AppError::Offline)
    }

    /// Whether simply trying the same operation again later is likely to
    /// succeed, as opposed to errors that need a different input or setting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Offline
                | AppError::BootstrapFailed { .. }
                | AppError::ServerUnreachable(_)
                | AppError::HttpError { .. }
                | AppError::ProcedureError(_)
                | AppError::PubkeysNotReady
        )
    }

    /// A user-facing message for display, independent of the `{0}`/Debug
    /// detail embedded in the `thiserror` message.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Offline => {
                "You appear to be offline. Check your internet connection and try again.".into()
            }
            AppError::BootstrapFailed { .. } => {
                "Could not connect. Please try again.".into()
            }
            AppError::CannotDetermineCountry => {
                "Could not determine your location to pick circumvention settings.".into()
            }
            AppError::NoSettingsForCountry => {
                "No circumvention settings are available for your region.".into()
            }
            AppError::AllSettingsFailed => {
                "None of the available connection methods worked.".into()
            }
            AppError::ServerUnreachable(_) => {
                "Could not reach the server. Please try again later.".into()
            }
            AppError::HttpError { .. } | AppError::MalformedResponse(_) | AppError::ProcedureError(_) => {
                "The server returned an unexpected response. Please try again.".into()
            }
            AppError::BadInvite => "That invitation code isn't valid.".into(),
            AppError::NoInvitations => "You have no invitations left to share.".into(),
            AppError::PubkeysNotReady => "Still preparing your invitation. Please try again shortly.".into(),
            AppError::NotInitialized => "Not ready yet. Please try again.".into(),
            AppError::NotActive => "That invitation belongs to a different account.".into(),
            AppError::CredentialEngine(_) | AppError::Storage(_) | AppError::External(_) | AppError::InvalidState(_) => {
                "Something went wrong. Please try again.".into()
            }
        }
    }

    pub fn bootstrap_failed(message: impl Into<String>) -> Self {
        AppError::BootstrapFailed {
            message: message.into(),
            phase: None,
            reason: None,
        }
    }

    pub fn bootstrap_failed_with(
        message: impl Into<String>,
        phase: Option<String>,
        reason: Option<String>,
    ) -> Self {
        AppError::BootstrapFailed {
            message: message.into(),
            phase,
            reason,
        }
    }
}

impl From<AppError> for JsValue {
    fn from(err: AppError) -> Self {
        JsValue::from_str(&err.to_string())
    }
}

/// Error information for the StageSnapshot and JS consumption.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapError {
    pub code: ErrorKind,
    pub message: String,
    pub phase: Option<String>,
    pub reason: Option<String>,
}

impl From<&AppError> for BootstrapError {
    fn from(err: &AppError) -> Self {
        let (phase, reason) = match err {
            AppError::BootstrapFailed { phase, reason, .. } => (phase.clone(), reason.clone()),
            _ => (None, None),
        };
        BootstrapError {
            code: err.kind(),
            message: err.to_string(),
            phase,
            reason,
        }
    }
}
