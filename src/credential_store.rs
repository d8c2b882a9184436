//! CredentialStore (§4.3): persisted credential map plus the
//! per-LoxId mutation lock that prevents double-spend of a Lox-style
//! single-show credential.
//!
//! The per-id promise chain described by the original design is
//! expressed here as a registry of `futures::lock::Mutex<()>`, one per
//! LoxId, behind an `Rc<RefCell<HashMap<...>>>` — the same
//! single-threaded interior-mutability shape the teacher crate uses
//! for its per-circuit state in `isolation.rs`'s `CircuitCache`.

use std::collections::HashMap;
use std::future::Future;
use std::rc::Rc;
use std::cell::RefCell;

use futures::lock::Mutex as AsyncMutex;
use serde::{Deserialize, Serialize};

use crate::collab::{EventBus, SettingsStore};
use crate::config::CoreConfig;
use crate::error::Result;

const KEY_CREDENTIALS: &str = "lox.settings.credentials";
const KEY_INVITES: &str = "lox.settings.invites";
const KEY_EVENTS: &str = "lox.settings.events";
const KEY_PUBKEYS: &str = "lox.settings.pubkeys";
const KEY_ENCTABLE: &str = "lox.settings.enctable";
const KEY_CONSTANTS: &str = "lox.settings.constants";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EventRecord {
    Levelup { newlevel: u32 },
    Blockage { newlevel: u32 },
}

/// Parse JSON persisted by a previous session; malformed/missing data
/// is treated as empty rather than fatal (§7).
fn parse_or_default<T: Default + for<'de> Deserialize<'de>>(raw: Option<String>) -> T {
    raw.and_then(|s| serde_json::from_str(&s).ok()).unwrap_or_default()
}

pub struct CredentialStore<S, B> {
    settings: Rc<S>,
    events_bus: Rc<B>,
    config: Rc<CoreConfig>,
    credentials: RefCell<HashMap<String, String>>,
    invites: RefCell<Vec<String>>,
    events: RefCell<Vec<EventRecord>>,
    pub_keys: RefCell<Option<String>>,
    enc_table: RefCell<Option<String>>,
    constants: RefCell<Option<String>>,
    locks: RefCell<HashMap<String, Rc<AsyncMutex<()>>>>,
}

impl<S: SettingsStore, B: EventBus> CredentialStore<S, B> {
    pub fn new(settings: Rc<S>, events_bus: Rc<B>, config: Rc<CoreConfig>) -> Self {
        Self {
            settings,
            events_bus,
            config,
            credentials: RefCell::new(HashMap::new()),
            invites: RefCell::new(Vec::new()),
            events: RefCell::new(Vec::new()),
            pub_keys: RefCell::new(None),
            enc_table: RefCell::new(None),
            constants: RefCell::new(None),
            locks: RefCell::new(HashMap::new()),
        }
    }

    /// Hydrate all fields from `SettingsStore` at startup.
    pub async fn load(&self) -> Result<()> {
        *self.credentials.borrow_mut() = parse_or_default(self.settings.get(KEY_CREDENTIALS).await?);
        *self.invites.borrow_mut() = parse_or_default(self.settings.get(KEY_INVITES).await?);
        *self.events.borrow_mut() = parse_or_default(self.settings.get(KEY_EVENTS).await?);
        *self.pub_keys.borrow_mut() = self.settings.get(KEY_PUBKEYS).await?;
        *self.enc_table.borrow_mut() = self.settings.get(KEY_ENCTABLE).await?;
        *self.constants.borrow_mut() = self.settings.get(KEY_CONSTANTS).await?;
        Ok(())
    }

    // ---- credentials ----

    pub fn get_credential(&self, lox_id: &str) -> Option<String> {
        self.credentials.borrow().get(lox_id).cloned()
    }

    pub fn has_credential(&self, lox_id: &str) -> bool {
        self.credentials.borrow().contains_key(lox_id)
    }

    /// Insert a brand-new credential (redeem_invite's allocation path).
    pub async fn insert_credential(&self, lox_id: &str, credential: &str) -> Result<()> {
        self.credentials
            .borrow_mut()
            .insert(lox_id.to_string(), credential.to_string());
        self.persist_credentials().await
    }

    /// Run `mutator` against the current credential for `lox_id` under
    /// that id's exclusive lock. Returning `Ok(Some(new))` writes the
    /// new credential and emits the three update topics (§4.3);
    /// `Ok(None)` leaves the stored credential untouched (no network
    /// success, nothing to persist — e.g. a non-fatal "not ready"
    /// response).
    pub async fn mutate_credential<F, Fut>(&self, lox_id: &str, mutator: F) -> Result<Option<String>>
    where
        F: FnOnce(Option<String>) -> Fut,
        Fut: Future<Output = Result<Option<String>>>,
    {
        let lock = self.lock_for(lox_id);
        let _guard = lock.lock().await;

        let current = self.get_credential(lox_id);
        let outcome = mutator(current).await?;

        if let Some(new_credential) = &outcome {
            self.credentials
                .borrow_mut()
                .insert(lox_id.to_string(), new_credential.clone());
            self.persist_credentials().await?;
            self.events_bus.emit("update-bridges", serde_json::json!({ "loxId": lox_id }));
            self.events_bus
                .emit("update-remaining-invites", serde_json::json!({ "loxId": lox_id }));
            self.events_bus
                .emit("update-next-unlock", serde_json::json!({ "loxId": lox_id }));
        }

        Ok(outcome)
    }

    fn lock_for(&self, lox_id: &str) -> Rc<AsyncMutex<()>> {
        Rc::clone(
            self.locks
                .borrow_mut()
                .entry(lox_id.to_string())
                .or_insert_with(|| Rc::new(AsyncMutex::new(()))),
        )
    }

    async fn persist_credentials(&self) -> Result<()> {
        let json = serde_json::to_string(&*self.credentials.borrow())
            .map_err(|e| crate::error::AppError::Storage(format!("encode credentials: {e}")))?;
        self.settings.set(KEY_CREDENTIALS, &json).await
    }

    // ---- invites (flat history, never cleared by active-id change: Open Question (a)) ----

    pub fn invites(&self) -> Vec<String> {
        self.invites.borrow().clone()
    }

    pub async fn push_invite(&self, invite: String) -> Result<()> {
        let max_invites = self.config.max_invites;
        let mut invites = self.invites.borrow_mut();
        invites.push(invite);
        if invites.len() > max_invites {
            let overflow = invites.len() - max_invites;
            invites.drain(0..overflow);
        }
        let json = serde_json::to_string(&*invites)
            .map_err(|e| crate::error::AppError::Storage(format!("encode invites: {e}")))?;
        drop(invites);
        self.settings.set(KEY_INVITES, &json).await?;
        self.events_bus.emit("new-invite", serde_json::json!({}));
        Ok(())
    }

    // ---- events (cleared on active-id change or acknowledgement) ----

    pub fn events(&self) -> Vec<EventRecord> {
        self.events.borrow().clone()
    }

    pub async fn push_event(&self, event: EventRecord) -> Result<()> {
        self.events.borrow_mut().push(event);
        self.persist_events().await?;
        self.events_bus.emit("update-events", serde_json::json!({}));
        Ok(())
    }

    pub async fn clear_events(&self) -> Result<()> {
        self.events.borrow_mut().clear();
        self.persist_events().await?;
        self.events_bus.emit("update-events", serde_json::json!({}));
        Ok(())
    }

    async fn persist_events(&self) -> Result<()> {
        let json = serde_json::to_string(&*self.events.borrow())
            .map_err(|e| crate::error::AppError::Storage(format!("encode events: {e}")))?;
        self.settings.set(KEY_EVENTS, &json).await
    }

    // ---- public material ----

    pub fn pub_keys(&self) -> Option<String> {
        self.pub_keys.borrow().clone()
    }

    pub async fn set_pub_keys(&self, value: String) -> Result<()> {
        *self.pub_keys.borrow_mut() = Some(value.clone());
        self.settings.set(KEY_PUBKEYS, &value).await
    }

    pub fn enc_table(&self) -> Option<String> {
        self.enc_table.borrow().clone()
    }

    pub async fn set_enc_table(&self, value: String) -> Result<()> {
        *self.enc_table.borrow_mut() = Some(value.clone());
        self.settings.set(KEY_ENCTABLE, &value).await
    }

    pub fn constants(&self) -> Option<String> {
        self.constants.borrow().clone()
    }

    pub async fn set_constants(&self, value: String) -> Result<()> {
        *self.constants.borrow_mut() = Some(value.clone());
        self.settings.set(KEY_CONSTANTS, &value).await
    }
}
