//! FetchChannel (§4.1): unified HTTPS request primitive with two modes —
//! direct (post-bootstrap) and domain-fronted (pre-bootstrap) — shared by
//! the Moat and LoxAuthority clients.
//!
//! Modelled as a strategy object per the design notes: `HttpTransport` is
//! the strategy trait (one concrete POST operation), and `FetchChannel`
//! picks direct vs. domain-fronted per call and memoizes the
//! domain-fronted requester the first time it is needed — the same
//! lazy-init-then-reuse shape the teacher crate uses for
//! `network::provider::WasmTcpProvider`.

use async_trait::async_trait;
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{AppError, Result};

/// One HTTP POST operation. Implementations own how the bytes actually
/// leave the process (direct `fetch()`, or routed through a
/// domain-fronting reflector).
#[async_trait(?Send)]
pub trait HttpTransport {
    async fn post_json(&self, url: &str, body: &str) -> Result<String>;
}

/// Picks direct vs. domain-fronted per call based on whether the
/// transport is currently bootstrapped.
pub struct FetchChannel {
    direct_base_url: String,
    front_base_url: String,
    direct: Rc<dyn HttpTransport>,
    front_factory: Box<dyn Fn() -> Rc<dyn HttpTransport>>,
    front: RefCell<Option<Rc<dyn HttpTransport>>>,
}

impl FetchChannel {
    pub fn new(
        direct_base_url: impl Into<String>,
        front_base_url: impl Into<String>,
        direct: Rc<dyn HttpTransport>,
        front_factory: Box<dyn Fn() -> Rc<dyn HttpTransport>>,
    ) -> Self {
        Self {
            direct_base_url: direct_base_url.into(),
            front_base_url: front_base_url.into(),
            direct,
            front_factory,
            front: RefCell::new(None),
        }
    }

    /// `bootstrapped` reflects `TransportProvider::status()` at call time.
    pub async fn fetch(
        &self,
        bootstrapped: bool,
        procedure: &str,
        body: Option<&str>,
    ) -> Result<String> {
        let body = body.unwrap_or("");
        if bootstrapped {
            let url = format!("{}/{}", self.direct_base_url.trim_end_matches('/'), procedure);
            self.direct.post_json(&url, body).await
        } else {
            let url = format!("{}/{}", self.front_base_url.trim_end_matches('/'), procedure);
            let front = self.ensure_front();
            front.post_json(&url, body).await
        }
    }

    /// Initialize the domain-fronted requester on first use, then reuse it.
    fn ensure_front(&self) -> Rc<dyn HttpTransport> {
        if let Some(front) = self.front.borrow().as_ref() {
            return Rc::clone(front);
        }
        let front = (self.front_factory)();
        *self.front.borrow_mut() = Some(Rc::clone(&front));
        front
    }
}

/// `web_sys`-backed direct fetch, one JSON POST per call, matching
/// `lox_client::LoxClient::post_json`'s shape but generalized and
/// returning the raw response text for the caller to interpret (some
/// endpoints, like `pubkeys`, are not JSON envelopes with an `error` key).
#[cfg(target_arch = "wasm32")]
pub struct WasmFetchTransport;

#[cfg(target_arch = "wasm32")]
#[async_trait(?Send)]
impl HttpTransport for WasmFetchTransport {
    async fn post_json(&self, url: &str, body: &str) -> Result<String> {
        use wasm_bindgen::{JsCast, JsValue};
        use wasm_bindgen_futures::JsFuture;
        use web_sys::{Request, RequestInit, RequestMode, Response};

        let opts = RequestInit::new();
        opts.set_method("POST");
        opts.set_mode(RequestMode::Cors);
        opts.set_body(&JsValue::from_str(body));

        let request = Request::new_with_str_and_init(url, &opts)
            .map_err(|e| AppError::ServerUnreachable(format!("{:?}", e)))?;
        request
            .headers()
            .set("Content-Type", "application/vnd.api+json")
            .map_err(|e| AppError::ServerUnreachable(format!("{:?}", e)))?;

        let window = web_sys::window().ok_or_else(|| AppError::ServerUnreachable("no window".into()))?;
        let resp_value = JsFuture::from(window.fetch_with_request(&request))
            .await
            .map_err(|e| AppError::ServerUnreachable(format!("{:?}", e)))?;
        let resp: Response = resp_value
            .dyn_into()
            .map_err(|_| AppError::ServerUnreachable("response was not a Response".into()))?;

        let text = JsFuture::from(
            resp.text()
                .map_err(|e| AppError::ServerUnreachable(format!("{:?}", e)))?,
        )
        .await
        .map_err(|e| AppError::ServerUnreachable(format!("{:?}", e)))?;
        let text = text
            .as_string()
            .ok_or_else(|| AppError::MalformedResponse("response body not a string".into()))?;

        if !resp.ok() {
            return Err(AppError::HttpError {
                status: resp.status(),
                status_text: resp.status_text(),
            });
        }

        Ok(text)
    }
}

/// Deterministic fake for tests: serves scripted responses keyed by
/// procedure (the final URL path segment) and records every call made.
#[derive(Default)]
pub struct FakeHttpTransport {
    responses: RefCell<std::collections::HashMap<String, Result<String>>>,
    calls: RefCell<Vec<(String, String)>>,
}

impl FakeHttpTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, procedure: &str, response: Result<String>) {
        self.responses
            .borrow_mut()
            .insert(procedure.to_string(), response);
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.borrow().clone()
    }
}

#[async_trait(?Send)]
impl HttpTransport for FakeHttpTransport {
    async fn post_json(&self, url: &str, body: &str) -> Result<String> {
        self.calls
            .borrow_mut()
            .push((url.to_string(), body.to_string()));
        let procedure = url.rsplit('/').next().unwrap_or("").to_string();
        match self.responses.borrow().get(&procedure) {
            Some(Ok(text)) => Ok(text.clone()),
            Some(Err(err)) => Err(err.clone()),
            None => Err(AppError::ServerUnreachable(format!(
                "no scripted response for {procedure}"
            ))),
        }
    }
}
