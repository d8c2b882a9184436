//! LoxClient (§4.4): the anonymous-credential client.
//!
//! Manages trust-tiered bridge credentials. Built on `CredentialStore`
//! (persistence + per-id mutation lock), `LoxAuthorityClient` (wire
//! protocol), and `CredentialEngine` (pure crypto, Phase-1 HMAC stand-in).
//!
//! Flow:
//!   1. First visit -> `redeem_invite()` -> level-0 credential
//!   2. `get_bridges()` -> bridge lines from the trust-appropriate pool
//!   3. Background refresh -> `level_up`/trust migration over time
//!   4. Bridge blocked -> blockage migration -> new bridge set
//!
//! Persistence keys are owned by `CredentialStore`; this module only
//! orchestrates the network + crypto steps around them.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use uuid::Uuid;

use crate::clock::Sleeper;
use crate::collab::{EventBus, SettingsStore};
use crate::config::CoreConfig;
use crate::credential_engine::CredentialEngine;
use crate::credential_store::{CredentialStore, EventRecord};
use crate::error::{AppError, Result};
use crate::lox_authority::LoxAuthorityClient;

const KEY_BRIDGES_ENABLED: &str = "bridges.enabled";
const KEY_BRIDGES_SOURCE: &str = "bridges.source";
const KEY_BRIDGES_LOX_ID: &str = "bridges.lox_id";
const LOX_SOURCE: &str = "Lox";

pub struct LoxClient<S, B> {
    config: Rc<CoreConfig>,
    settings: Rc<S>,
    events_bus: Rc<B>,
    authority: Rc<LoxAuthorityClient>,
    engine: Rc<dyn CredentialEngine>,
    store: Rc<CredentialStore<S, B>>,
    active_lox_id: RefCell<Option<String>>,
    // First-round `trustpromo` response cached per LoxId so a failed
    // `trustmig` can retry without re-burning round one (§4.4).
    trust_promo_cache: RefCell<HashMap<String, String>>,
    initialized: Cell<bool>,
}

impl<S: SettingsStore, B: EventBus> LoxClient<S, B> {
    pub fn new(
        config: Rc<CoreConfig>,
        settings: Rc<S>,
        events_bus: Rc<B>,
        authority: Rc<LoxAuthorityClient>,
        engine: Rc<dyn CredentialEngine>,
        store: Rc<CredentialStore<S, B>>,
    ) -> Self {
        Self {
            config,
            settings,
            events_bus,
            authority,
            engine,
            store,
            active_lox_id: RefCell::new(None),
            trust_promo_cache: RefCell::new(HashMap::new()),
            initialized: Cell::new(false),
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.store.load().await?;
        self.recompute_active_lox_id().await?;
        self.initialized.set(true);
        Ok(())
    }

    pub fn active_lox_id(&self) -> Option<String> {
        self.active_lox_id.borrow().clone()
    }

    pub fn settings(&self) -> &Rc<S> {
        &self.settings
    }

    fn require_initialized(&self) -> Result<()> {
        if self.initialized.get() {
            Ok(())
        } else {
            Err(AppError::NotInitialized)
        }
    }

    /// Re-derive `activeLoxId` from `bridges.{enabled,source,lox_id}`.
    /// The embedding wires this to `SettingsStore::watch` (via
    /// `wasm_bindgen_futures::spawn_local`, since `watch`'s callback is
    /// synchronous); tests call it directly after mutating settings.
    pub async fn recompute_active_lox_id(&self) -> Result<()> {
        let enabled = self.settings.get(KEY_BRIDGES_ENABLED).await?.as_deref() == Some("true");
        let source = self.settings.get(KEY_BRIDGES_SOURCE).await?;
        let lox_id = self.settings.get(KEY_BRIDGES_LOX_ID).await?;

        let new_active = if enabled && source.as_deref() == Some(LOX_SOURCE) {
            lox_id
        } else {
            None
        };

        let previous = self.active_lox_id.replace(new_active.clone());
        if previous != new_active {
            // Events are cleared on active-id change; invites are not
            // (Open Question (a), resolved in SPEC_FULL.md §9).
            self.store.clear_events().await?;
            self.events_bus.emit(
                "update-active-lox-id",
                serde_json::json!({ "loxId": new_active }),
            );
        }
        Ok(())
    }

    // ===== Public operations =====

    pub fn validate_invitation(&self, invitation: &str) -> Result<bool> {
        self.require_initialized()?;
        Ok(self.engine.invitation_is_trusted(invitation))
    }

    pub async fn redeem_invite(&self, invitation: &str) -> Result<String> {
        self.require_initialized()?;
        let pub_keys = self.ensure_pub_keys().await?;

        let req = self.engine.open_invite(invitation)?;
        let resp = match self.authority.openreq(true, &req).await {
            Ok(resp) => resp,
            Err(AppError::ProcedureError(_)) => return Err(AppError::BadInvite),
            Err(other) => return Err(other),
        };
        let credential = self.engine.handle_new_lox_credential(&req, &resp, &pub_keys)?;

        let lox_id = loop {
            let candidate = Uuid::new_v4().to_string();
            if !self.store.has_credential(&candidate) {
                break candidate;
            }
        };
        self.store.insert_credential(&lox_id, &credential).await?;
        log::info!("lox: redeemed invitation into new credential {lox_id}");
        Ok(lox_id)
    }

    pub async fn generate_invite(&self, lox_id: &str) -> Result<String> {
        self.require_initialized()?;
        // Per §4.4: if pubkeys aren't already cached, kick off a refresh and
        // fail with "retry later" rather than use them in this same call —
        // fetching fresh keys and issuing an invite in one round trip would
        // link the key-rotation request to this invitation.
        let pub_keys = match self.store.pub_keys() {
            Some(pub_keys) => pub_keys,
            None => {
                if let Err(err) = self.refresh_pub_keys().await {
                    log::warn!("lox: pubkeys refresh triggered by generate_invite failed: {err}");
                }
                return Err(AppError::PubkeysNotReady);
            }
        };
        let enc_table = self.ensure_enc_table().await?;

        let current = self
            .store
            .get_credential(lox_id)
            .ok_or_else(|| AppError::InvalidState(format!("unknown lox id {lox_id}")))?;
        if self.engine.get_trust_level(&current)? < 1 {
            return Err(AppError::NoInvitations);
        }

        let new_credential = self
            .store
            .mutate_credential(lox_id, |current| {
                let engine = Rc::clone(&self.engine);
                let authority = Rc::clone(&self.authority);
                let enc_table = enc_table.clone();
                let pub_keys = pub_keys.clone();
                async move {
                    let current = current.ok_or_else(|| AppError::InvalidState("credential vanished".into()))?;
                    let req = engine.issue_invite(&current, &enc_table, &pub_keys)?;
                    let resp = authority.issueinvite(true, &req).await?;
                    let new_credential = engine.handle_issue_invite(&req, &resp, &pub_keys)?;
                    Ok(Some(new_credential))
                }
            })
            .await?
            .ok_or_else(|| AppError::InvalidState("issue_invite produced no credential".into()))?;

        let invite = self.engine.prepare_invite(&new_credential)?;
        self.store.push_invite(invite.clone()).await?;
        Ok(invite)
    }

    pub fn get_remaining_invite_count(&self, lox_id: &str) -> Result<u32> {
        self.require_initialized()?;
        let cred = self.credential_for(lox_id)?;
        self.engine.get_invites_remaining(&cred)
    }

    pub fn get_bridges(&self, lox_id: &str) -> Result<Vec<String>> {
        self.require_initialized()?;
        let cred = self.credential_for(lox_id)?;
        crate::bridge_line::bridge_lines_from_credential(&cred)
    }

    pub async fn get_next_unlock(&self, lox_id: &str) -> Result<String> {
        self.require_initialized()?;
        let constants = self.ensure_constants().await?;
        let cred = self.credential_for(lox_id)?;
        self.engine.get_next_unlock(&constants, &cred)
    }

    pub fn get_event_data(&self, lox_id: &str) -> Vec<EventRecord> {
        if self.active_lox_id().as_deref() != Some(lox_id) {
            log::warn!("lox: get_event_data called for non-active lox id {lox_id}");
            return Vec::new();
        }
        self.store.events()
    }

    pub async fn clear_event_data(&self, lox_id: &str) -> Result<()> {
        if self.active_lox_id().as_deref() != Some(lox_id) {
            log::warn!("lox: clear_event_data called for non-active lox id {lox_id}");
            return Ok(());
        }
        self.store.clear_events().await
    }

    fn credential_for(&self, lox_id: &str) -> Result<String> {
        self.store
            .get_credential(lox_id)
            .ok_or_else(|| AppError::InvalidState(format!("unknown lox id {lox_id}")))
    }

    // ===== Pubkeys / encTable / constants refresh (Open Question (b):
    // once per session on first use, plus once per background cycle) =====

    async fn ensure_pub_keys(&self) -> Result<String> {
        if let Some(existing) = self.store.pub_keys() {
            return Ok(existing);
        }
        self.refresh_pub_keys().await
    }

    async fn refresh_pub_keys(&self) -> Result<String> {
        let fresh = self.authority.pubkeys(true).await?;
        self.store.set_pub_keys(fresh.clone()).await?;
        Ok(fresh)
    }

    async fn ensure_enc_table(&self) -> Result<String> {
        if let Some(existing) = self.store.enc_table() {
            return Ok(existing);
        }
        let fresh = self.authority.reachability(true).await?;
        self.store.set_enc_table(fresh.clone()).await?;
        Ok(fresh)
    }

    async fn ensure_constants(&self) -> Result<String> {
        if let Some(existing) = self.store.constants() {
            return Ok(existing);
        }
        let fresh = self.authority.constants(true).await?;
        self.store.set_constants(fresh.clone()).await?;
        Ok(fresh)
    }

    // ===== Background refresh (§4.4, every 12h while bridges.source == Lox) =====

    pub fn should_run_background_refresh(&self) -> bool {
        self.active_lox_id().is_some()
    }

    /// Loop forever, sleeping `config.background_refresh_interval`
    /// between cycles. The embedding spawns this once at startup (when
    /// `should_run_background_refresh()` holds) via
    /// `wasm_bindgen_futures::spawn_local`.
    pub async fn background_refresh_loop(&self, sleeper: &dyn Sleeper) {
        loop {
            sleeper.sleep(self.config.background_refresh_interval).await;
            if let Some(lox_id) = self.active_lox_id() {
                if let Err(e) = self.run_background_cycle(&lox_id).await {
                    log::warn!("lox: background refresh cycle failed: {e}");
                }
            }
        }
    }

    pub async fn run_background_cycle(&self, lox_id: &str) -> Result<()> {
        self.refresh_pubkeys_and_rotate(lox_id).await?;
        self.attempt_level_advance(lox_id).await?;
        self.attempt_blockage_migration(lox_id).await?;
        Ok(())
    }

    async fn refresh_pubkeys_and_rotate(&self, lox_id: &str) -> Result<()> {
        let old_pub_keys = self.store.pub_keys().unwrap_or_default();
        let new_pub_keys = self.authority.pubkeys(true).await?;
        if new_pub_keys == old_pub_keys {
            return Ok(());
        }

        // `?` here means: if rotation was attempted and failed, bail out
        // without touching the persisted pubkeys at all. Reaching the
        // line after this either means no rotation was needed (`Ok(None)`)
        // or rotation succeeded (`Ok(Some(..))`) — both are safe points
        // to overwrite the persisted value.
        self.store
            .mutate_credential(lox_id, |current| {
                let engine = Rc::clone(&self.engine);
                let authority = Rc::clone(&self.authority);
                let old_pub_keys = old_pub_keys.clone();
                let new_pub_keys = new_pub_keys.clone();
                async move {
                    let current = current.ok_or_else(|| AppError::InvalidState("credential vanished".into()))?;
                    match engine.check_lox_pubkeys_update(&new_pub_keys, &old_pub_keys, &current)? {
                        None => Ok(None),
                        Some(req) => {
                            let resp = authority.updatecred(true, &req).await?;
                            let updated = engine.handle_update_cred(&req, &resp, &new_pub_keys)?;
                            Ok(Some(updated))
                        }
                    }
                }
            })
            .await?;

        self.store.set_pub_keys(new_pub_keys).await?;
        Ok(())
    }

    async fn attempt_level_advance(&self, lox_id: &str) -> Result<()> {
        let pub_keys = self.ensure_pub_keys().await?;
        let enc_table = self.ensure_enc_table().await?;
        let current_level = self.engine.get_trust_level(&self.credential_for(lox_id)?)?;

        if current_level >= 1 {
            let result = self
                .store
                .mutate_credential(lox_id, |current| {
                    let engine = Rc::clone(&self.engine);
                    let authority = Rc::clone(&self.authority);
                    let enc_table = enc_table.clone();
                    let pub_keys = pub_keys.clone();
                    async move {
                        let current = current.ok_or_else(|| AppError::InvalidState("credential vanished".into()))?;
                        let req = engine.level_up(&current, &enc_table, &pub_keys)?;
                        match authority.levelup(true, &req).await {
                            Ok(resp) => Ok(Some(engine.handle_level_up(&req, &resp, &pub_keys)?)),
                            // A `levelup` error response means "not ready yet" (§4.4), not failure.
                            Err(AppError::ProcedureError(_)) => Ok(None),
                            Err(other) => Err(other),
                        }
                    }
                })
                .await?;

            if let Some(new_credential) = result {
                let new_level = self.engine.get_trust_level(&new_credential)?;
                if new_level > current_level {
                    self.store
                        .push_event(EventRecord::Levelup { newlevel: new_level })
                        .await?;
                }
            }
        } else {
            self.attempt_trust_migration(lox_id, &pub_keys).await?;
        }
        Ok(())
    }

    async fn attempt_trust_migration(&self, lox_id: &str, pub_keys: &str) -> Result<()> {
        let promo = match self.trust_promo_cache.borrow().get(lox_id).cloned() {
            Some(cached) => cached,
            None => {
                let current = self.credential_for(lox_id)?;
                let req = self.engine.trust_promotion(&current, pub_keys)?;
                match self.authority.trustpromo(true, &req).await {
                    Ok(resp) => {
                        let promo = self.engine.handle_trust_promotion(&req, &resp)?;
                        self.trust_promo_cache
                            .borrow_mut()
                            .insert(lox_id.to_string(), promo.clone());
                        promo
                    }
                    // Not yet eligible for trust promotion; try again next cycle.
                    Err(AppError::ProcedureError(_)) => return Ok(()),
                    Err(other) => return Err(other),
                }
            }
        };

        let result = self
            .store
            .mutate_credential(lox_id, |current| {
                let engine = Rc::clone(&self.engine);
                let authority = Rc::clone(&self.authority);
                let promo = promo.clone();
                let pub_keys = pub_keys.to_string();
                async move {
                    let current = current.ok_or_else(|| AppError::InvalidState("credential vanished".into()))?;
                    let req = engine.trust_migration(&current, &promo, &pub_keys)?;
                    let resp = authority.trustmig(true, &req).await?;
                    Ok(Some(engine.handle_trust_migration(&req, &resp, &pub_keys)?))
                }
            })
            .await?;

        if let Some(new_credential) = result {
            self.trust_promo_cache.borrow_mut().remove(lox_id);
            let new_level = self.engine.get_trust_level(&new_credential)?;
            self.store
                .push_event(EventRecord::Levelup { newlevel: new_level })
                .await?;
        }
        Ok(())
    }

    async fn attempt_blockage_migration(&self, lox_id: &str) -> Result<()> {
        let pub_keys = self.ensure_pub_keys().await?;
        let current = self.credential_for(lox_id)?;
        let req = self.engine.check_blockage(&current, &pub_keys)?;
        let resp = match self.authority.checkblockage(true, &req).await {
            Ok(resp) => resp,
            // No blockage detected this cycle.
            Err(AppError::ProcedureError(_)) => return Ok(()),
            Err(other) => return Err(other),
        };
        let migration_cred = self.engine.handle_check_blockage(&current, &resp)?;

        let result = self
            .store
            .mutate_credential(lox_id, |current| {
                let engine = Rc::clone(&self.engine);
                let authority = Rc::clone(&self.authority);
                let migration_cred = migration_cred.clone();
                let pub_keys = pub_keys.clone();
                async move {
                    let current = current.ok_or_else(|| AppError::InvalidState("credential vanished".into()))?;
                    let req2 = engine.blockage_migration(&current, &migration_cred, &pub_keys)?;
                    let resp2 = authority.blockagemigration(true, &req2).await?;
                    Ok(Some(engine.handle_blockage_migration(&current, &resp2, &pub_keys)?))
                }
            })
            .await?;

        if let Some(new_credential) = result {
            let new_level = self.engine.get_trust_level(&new_credential)?;
            self.store
                .push_event(EventRecord::Blockage { newlevel: new_level })
                .await?;
        }
        Ok(())
    }
}
