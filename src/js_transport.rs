//! `web-sys`/`js-sys`-backed `TransportProvider` (§1): the anonymizing
//! transport itself is an external collaborator supplied by the embedding
//! application as a plain JS object exposing `beginBootstrap`, `stop`,
//! `applySettings`, `status`, and `bridgeFingerprint`.
//!
//! `beginBootstrap(settings, onEvent)` is the one callback-shaped method:
//! the JS side invokes `onEvent` once per progress/complete/error event.
//! Wrapping that into an `mpsc::UnboundedReceiver` follows the same
//! callback-to-`Future`/stream bridging idiom as
//! `storage::indexeddb::request_to_future`, generalized from a single
//! resolve/reject pair to a repeated event callback kept alive with
//! `Closure::forget`.

#![cfg(target_arch = "wasm32")]

use async_trait::async_trait;
use futures::channel::mpsc;
use js_sys::{Function, Reflect};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

use crate::collab::{TransportEvent, TransportProvider, TransportStatus};
use crate::error::AppError;

pub struct JsTransportProvider {
    begin_bootstrap: Function,
    stop: Function,
    apply_settings: Function,
    status: Function,
    bridge_fingerprint: Function,
}

impl JsTransportProvider {
    /// `obj` must expose the five methods above as own properties.
    pub fn new(obj: &JsValue) -> Result<Self, JsValue> {
        let get_fn = |name: &str| -> Result<Function, JsValue> {
            Reflect::get(obj, &JsValue::from_str(name))?
                .dyn_into::<Function>()
                .map_err(|_| JsValue::from_str(&format!("transport.{name} is not a function")))
        };
        Ok(Self {
            begin_bootstrap: get_fn("beginBootstrap")?,
            stop: get_fn("stop")?,
            apply_settings: get_fn("applySettings")?,
            status: get_fn("status")?,
            bridge_fingerprint: get_fn("bridgeFingerprint")?,
        })
    }
}

#[async_trait(?Send)]
impl TransportProvider for JsTransportProvider {
    fn begin_bootstrap(&self, settings: Option<String>) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded();

        let on_event = Closure::<dyn FnMut(JsValue)>::new(move |event: JsValue| {
            let parsed = parse_event(&event);
            let _ = tx.unbounded_send(parsed);
        });

        let settings_arg = settings.map(JsValue::from).unwrap_or(JsValue::NULL);
        let _ = self
            .begin_bootstrap
            .call2(&JsValue::NULL, &settings_arg, on_event.as_ref());
        on_event.forget();

        rx
    }

    async fn stop(&self) -> Result<(), AppError> {
        let promise = self
            .stop
            .call0(&JsValue::NULL)
            .map_err(|e| AppError::External(format!("{e:?}")))?;
        JsFuture::from(js_sys::Promise::resolve(&promise))
            .await
            .map_err(|e| AppError::External(format!("{e:?}")))?;
        Ok(())
    }

    async fn apply_settings(&self, settings: &str) -> Result<(), AppError> {
        let promise = self
            .apply_settings
            .call1(&JsValue::NULL, &JsValue::from_str(settings))
            .map_err(|e| AppError::External(format!("{e:?}")))?;
        JsFuture::from(js_sys::Promise::resolve(&promise))
            .await
            .map_err(|e| AppError::External(format!("{e:?}")))?;
        Ok(())
    }

    fn status(&self) -> TransportStatus {
        let value = self.status.call0(&JsValue::NULL).ok();
        match value.as_ref().and_then(JsValue::as_string).as_deref() {
            Some("bootstrapping") => TransportStatus::Bootstrapping,
            Some("bootstrapped") => TransportStatus::Bootstrapped,
            _ => TransportStatus::Stopped,
        }
    }

    fn bridge_fingerprint(&self) -> Option<String> {
        self.bridge_fingerprint
            .call0(&JsValue::NULL)
            .ok()
            .and_then(|v| v.as_string())
    }
}

fn parse_event(event: &JsValue) -> TransportEvent {
    let kind = Reflect::get(event, &JsValue::from_str("type"))
        .ok()
        .and_then(|v| v.as_string())
        .unwrap_or_default();

    match kind.as_str() {
        "progress" => {
            let progress = Reflect::get(event, &JsValue::from_str("progress"))
                .ok()
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0);
            TransportEvent::Progress(progress.clamp(0.0, 100.0) as u8)
        }
        "complete" => TransportEvent::Complete,
        "error" => {
            let message = Reflect::get(event, &JsValue::from_str("message"))
                .ok()
                .and_then(|v| v.as_string())
                .unwrap_or_else(|| "transport error".to_string());
            TransportEvent::Error(AppError::bootstrap_failed(message))
        }
        other => TransportEvent::Error(AppError::bootstrap_failed(format!(
            "unrecognized transport event type {other:?}"
        ))),
    }
}
