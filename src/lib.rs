//! # Bridge-acquisition and connection-bootstrap core
//!
//! A WASM library bringing an anonymizing network transport from
//! cold-start to "bootstrapped", and managing an anonymous, trust-tiered
//! bridge credential once it is. Compiled in the style of the
//! workspace's existing WASM Tor client: no OS dependencies, only
//! browser APIs (fetch, localStorage, setTimeout), with the actual Tor
//! wire protocol supplied by the embedding application through the
//! `TransportProvider` trait rather than implemented here.
//!
//! ## Architecture
//!
//! ```text
//! BridgeCore (WASM facade)
//!   ├── ConnectOrchestrator  → BootstrapAttempt / AutoBootstrapAttempt → TransportProvider + Moat
//!   └── LoxClient            → CredentialStore + LoxAuthority → CredentialEngine
//! ```

use std::rc::Rc;

use wasm_bindgen::prelude::*;

pub mod bridge_line;
pub mod clock;
pub mod collab;
pub mod config;
pub mod connect;
pub mod credential_engine;
pub mod credential_store;
pub mod error;
pub mod fetch;
#[cfg(target_arch = "wasm32")]
pub mod js_transport;
pub mod lox_authority;
pub mod lox_client;
pub mod moat;

use clock::Sleeper;
use collab::{EventBus, InMemoryEventBus, SubscriptionId};
use config::CoreConfig;
use connect::ConnectOrchestrator;
use credential_engine::{CredentialEngine, HmacCredentialEngine};
use credential_store::CredentialStore;
use fetch::{FetchChannel, HttpTransport};
use lox_authority::LoxAuthorityClient;
use lox_client::LoxClient;
use moat::MoatClient;

#[cfg(target_arch = "wasm32")]
use clock::WasmSleeper;
#[cfg(target_arch = "wasm32")]
use collab::LocalStorageSettingsStore;
#[cfg(target_arch = "wasm32")]
use fetch::WasmFetchTransport;
#[cfg(target_arch = "wasm32")]
use js_transport::JsTransportProvider;

/// Initialize logging and the panic hook. Called once by the host page.
#[wasm_bindgen(start)]
pub fn init() {
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();

    console_log::init_with_level(log::Level::Info).unwrap();
    log::info!("bridge core initialized");
}

#[cfg(target_arch = "wasm32")]
type CoreSettings = LocalStorageSettingsStore;
#[cfg(target_arch = "wasm32")]
type CoreTransport = JsTransportProvider;

/// Top-level facade exposed to JS: owns the `ConnectOrchestrator` and
/// `LoxClient`, wired to `localStorage`, a shared `EventBus`, and
/// whatever `TransportProvider` the embedding page supplies.
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
pub struct BridgeCore {
    connect: Rc<ConnectOrchestrator<CoreSettings, InMemoryEventBus, CoreTransport>>,
    lox: Rc<LoxClient<CoreSettings, InMemoryEventBus>>,
    events: Rc<InMemoryEventBus>,
}

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
impl BridgeCore {
    /// `transport` is a JS object exposing `beginBootstrap`, `stop`,
    /// `applySettings`, `status`, and `bridgeFingerprint`.
    #[wasm_bindgen(constructor)]
    pub async fn new(transport: JsValue, default_region: String) -> std::result::Result<BridgeCore, JsValue> {
        let config = Rc::new(CoreConfig::default());
        let settings = Rc::new(LocalStorageSettingsStore::new()?);
        let events = Rc::new(InMemoryEventBus::new());
        let sleeper: Rc<dyn Sleeper> = Rc::new(WasmSleeper);
        let transport = Rc::new(JsTransportProvider::new(&transport)?);

        let moat_channel = FetchChannel::new(
            config.moat_direct_url.clone(),
            config.moat_front_url.clone(),
            Rc::new(WasmFetchTransport) as Rc<dyn HttpTransport>,
            Box::new(|| Rc::new(WasmFetchTransport) as Rc<dyn HttpTransport>),
        );
        let moat = Rc::new(MoatClient::new(moat_channel));

        let authority_channel = FetchChannel::new(
            config.lox_authority_url.clone(),
            config.lox_authority_url.clone(),
            Rc::new(WasmFetchTransport) as Rc<dyn HttpTransport>,
            Box::new(|| Rc::new(WasmFetchTransport) as Rc<dyn HttpTransport>),
        );
        let authority = Rc::new(LoxAuthorityClient::new(authority_channel));
        let engine: Rc<dyn CredentialEngine> = Rc::new(HmacCredentialEngine::new());
        let store = Rc::new(CredentialStore::new(settings.clone(), events.clone(), config.clone()));

        let lox = Rc::new(LoxClient::new(
            config.clone(),
            settings.clone(),
            events.clone(),
            authority,
            engine,
            store,
        ));
        lox.init().await?;

        let connect = Rc::new(ConnectOrchestrator::new(
            transport,
            settings,
            events.clone(),
            moat,
            sleeper,
            config,
            default_region,
        ));

        Ok(Self { connect, lox, events })
    }

    /// Begin the background-refresh loop if a Lox credential is active.
    /// Runs forever; the caller fires this once at startup and forgets it.
    #[wasm_bindgen(js_name = startBackgroundRefresh)]
    pub fn start_background_refresh(&self) {
        if !self.lox.should_run_background_refresh() {
            return;
        }
        let lox = Rc::clone(&self.lox);
        wasm_bindgen_futures::spawn_local(async move {
            let sleeper = WasmSleeper;
            lox.background_refresh_loop(&sleeper).await;
        });
    }

    // ===== EventBus =====

    #[wasm_bindgen(js_name = on)]
    pub fn subscribe(&self, topic: String, callback: js_sys::Function) -> SubscriptionId {
        self.events.subscribe(
            &topic,
            Box::new(move |payload: &serde_json::Value| {
                let value = serde_wasm_bindgen::to_value(payload).unwrap_or(JsValue::NULL);
                let _ = callback.call1(&JsValue::NULL, &value);
            }),
        )
    }

    #[wasm_bindgen(js_name = off)]
    pub fn unsubscribe(&self, topic: String, id: SubscriptionId) {
        self.events.unsubscribe(&topic, id);
    }

    // ===== ConnectOrchestrator =====

    pub fn snapshot(&self) -> std::result::Result<JsValue, JsValue> {
        Ok(serde_wasm_bindgen::to_value(&self.connect.snapshot())?)
    }

    #[wasm_bindgen(js_name = onTransportReady)]
    pub async fn on_transport_ready(&self, quickstart_enabled: bool) {
        self.connect.on_transport_ready(quickstart_enabled).await;
    }

    #[wasm_bindgen(js_name = handleTransportExit)]
    pub fn handle_transport_exit(&self) {
        self.connect.handle_transport_exit();
    }

    #[wasm_bindgen(js_name = beginBootstrapping)]
    pub async fn begin_bootstrapping(&self, region_code: Option<String>) -> std::result::Result<(), JsValue> {
        self.connect.begin_bootstrapping(region_code).await?;
        Ok(())
    }

    #[wasm_bindgen(js_name = cancelBootstrapping)]
    pub fn cancel_bootstrapping(&self) {
        self.connect.cancel_bootstrapping();
    }

    #[wasm_bindgen(js_name = startAgain)]
    pub fn start_again(&self) {
        self.connect.start_again();
    }

    #[wasm_bindgen(js_name = chooseRegion)]
    pub fn choose_region(&self) {
        self.connect.choose_region();
    }

    // ===== LoxClient =====

    #[wasm_bindgen(js_name = validateInvitation)]
    pub fn validate_invitation(&self, invitation: String) -> std::result::Result<bool, JsValue> {
        Ok(self.lox.validate_invitation(&invitation)?)
    }

    #[wasm_bindgen(js_name = redeemInvite)]
    pub async fn redeem_invite(&self, invitation: String) -> std::result::Result<String, JsValue> {
        Ok(self.lox.redeem_invite(&invitation).await?)
    }

    #[wasm_bindgen(js_name = generateInvite)]
    pub async fn generate_invite(&self, lox_id: String) -> std::result::Result<String, JsValue> {
        Ok(self.lox.generate_invite(&lox_id).await?)
    }

    #[wasm_bindgen(js_name = getRemainingInviteCount)]
    pub fn get_remaining_invite_count(&self, lox_id: String) -> std::result::Result<u32, JsValue> {
        Ok(self.lox.get_remaining_invite_count(&lox_id)?)
    }

    #[wasm_bindgen(js_name = getBridges)]
    pub fn get_bridges(&self, lox_id: String) -> std::result::Result<Vec<String>, JsValue> {
        Ok(self.lox.get_bridges(&lox_id)?)
    }

    #[wasm_bindgen(js_name = getNextUnlock)]
    pub async fn get_next_unlock(&self, lox_id: String) -> std::result::Result<String, JsValue> {
        Ok(self.lox.get_next_unlock(&lox_id).await?)
    }

    #[wasm_bindgen(js_name = getEventData)]
    pub fn get_event_data(&self, lox_id: String) -> std::result::Result<JsValue, JsValue> {
        Ok(serde_wasm_bindgen::to_value(&self.lox.get_event_data(&lox_id))?)
    }

    #[wasm_bindgen(js_name = clearEventData)]
    pub async fn clear_event_data(&self, lox_id: String) -> std::result::Result<(), JsValue> {
        Ok(self.lox.clear_event_data(&lox_id).await?)
    }

    #[wasm_bindgen(js_name = activeLoxId)]
    pub fn active_lox_id(&self) -> Option<String> {
        self.lox.active_lox_id()
    }
}
