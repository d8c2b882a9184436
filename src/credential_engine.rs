//! CredentialEngine contract (§4.2): the Lox protocol primitives,
//! treated as a pure, synchronous black box by the rest of this crate.
//!
//! `HmacCredentialEngine` is the shipped Phase-1 implementation,
//! explicitly labeled as a server-linked stand-in the same way the
//! teacher crate's own `lox_client.rs` documents its credential as
//! "Phase 1: HMAC-based credentials (server-linked, same API as BBS+).
//! Phase 2 (future): BBS+ blind signatures for unlinkability." The
//! actual blind-signature math is out of scope; this engine only needs
//! to present the same call shape a Phase-2 engine would.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;

use crate::error::{AppError, Result};

type HmacSha256 = Hmac<Sha256>;

/// A single bridge line embedded in a credential, matching the wire
/// shape described in §3 (`addr: bytes, port: int, info: bytes`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawBridgeLine {
    #[serde(with = "base64_bytes")]
    pub addr: Vec<u8>,
    pub port: u16,
    #[serde(with = "base64_bytes")]
    pub info: Vec<u8>,
}

mod base64_bytes {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        BASE64.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Opaque credential, as produced/consumed by this engine. Never
/// inspected outside `credential_engine`/`bridge_line` except for
/// bridge-line extraction (§3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoxCredential {
    pub id: String,
    pub trust_level: u32,
    pub invites_remaining: u32,
    #[serde(default)]
    pub bridgelines: Vec<RawBridgeLine>,
    pub issued_at_ms: f64,
    pub mac: String,
}

#[derive(Serialize)]
struct SignedPayload<'a> {
    id: &'a str,
    trust_level: u32,
    invites_remaining: u32,
    bridgelines: &'a [RawBridgeLine],
    issued_at_ms: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct PubKeys {
    hmac_key: String,
}

impl LoxCredential {
    fn parse(cred: &str) -> Result<Self> {
        serde_json::from_str(cred).map_err(|e| AppError::CredentialEngine(format!("bad credential: {e}")))
    }

    fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| AppError::CredentialEngine(format!("encode credential: {e}")))
    }

    /// Recomputes the MAC over this credential's own fields and checks it
    /// against `mac`. Used wherever a credential is accepted pre-tagged
    /// from the authority rather than signed by this engine.
    fn verify_mac(&self, key: &[u8]) -> Result<()> {
        let payload = SignedPayload {
            id: &self.id,
            trust_level: self.trust_level,
            invites_remaining: self.invites_remaining,
            bridgelines: &self.bridgelines,
            issued_at_ms: self.issued_at_ms,
        };
        HmacCredentialEngine::verify(key, &payload, &self.mac)
    }
}

/// Pure credential operations consumed by `LoxClient`/`CredentialStore`.
/// Every method is synchronous; errors are fatal to the caller.
pub trait CredentialEngine {
    fn invitation_is_trusted(&self, inv: &str) -> bool;
    fn open_invite(&self, inv: &str) -> Result<String>;
    fn handle_new_lox_credential(&self, req: &str, resp: &str, pub_keys: &str) -> Result<String>;

    fn get_trust_level(&self, cred: &str) -> Result<u32>;
    fn get_invites_remaining(&self, cred: &str) -> Result<u32>;
    fn get_next_unlock(&self, constants: &str, cred: &str) -> Result<String>;

    fn issue_invite(&self, cred: &str, enc_table: &str, pub_keys: &str) -> Result<String>;
    fn handle_issue_invite(&self, req: &str, resp: &str, pub_keys: &str) -> Result<String>;
    fn prepare_invite(&self, cred: &str) -> Result<String>;

    fn level_up(&self, cred: &str, enc_table: &str, pub_keys: &str) -> Result<String>;
    fn handle_level_up(&self, req: &str, resp: &str, pub_keys: &str) -> Result<String>;

    fn trust_promotion(&self, cred: &str, pub_keys: &str) -> Result<String>;
    fn handle_trust_promotion(&self, req: &str, resp: &str) -> Result<String>;
    fn trust_migration(&self, cred: &str, promo: &str, pub_keys: &str) -> Result<String>;
    fn handle_trust_migration(&self, req: &str, resp: &str, pub_keys: &str) -> Result<String>;

    fn check_blockage(&self, cred: &str, pub_keys: &str) -> Result<String>;
    fn handle_check_blockage(&self, cred: &str, resp: &str) -> Result<String>;
    fn blockage_migration(&self, cred: &str, mig_cred: &str, pub_keys: &str) -> Result<String>;
    fn handle_blockage_migration(&self, cred: &str, resp: &str, pub_keys: &str) -> Result<String>;

    /// `None` when no update is needed.
    fn check_lox_pubkeys_update(
        &self,
        new_pub_keys: &str,
        old_pub_keys: &str,
        cred: &str,
    ) -> Result<Option<String>>;
    fn handle_update_cred(&self, req: &str, resp: &str, new_pub_keys: &str) -> Result<String>;
}

/// Phase-1 HMAC-tagged credential engine. Holds no server secret; the
/// "server-linked" key material is whatever the authority publishes
/// through `pubkeys` (§6), from which this engine derives a per-purpose
/// MAC key via HKDF. This authenticates that a credential passed
/// through this engine's own round trip, it is not an unlinkability
/// guarantee — that is Phase 2's job.
#[derive(Default)]
pub struct HmacCredentialEngine;

impl HmacCredentialEngine {
    pub fn new() -> Self {
        Self
    }

    fn mac_key(pub_keys: &str) -> Result<Vec<u8>> {
        let parsed: PubKeys = serde_json::from_str(pub_keys)
            .map_err(|e| AppError::CredentialEngine(format!("bad pubkeys: {e}")))?;
        let ikm = hex::decode(&parsed.hmac_key)
            .map_err(|e| AppError::CredentialEngine(format!("pubkeys.hmac_key not hex: {e}")))?;
        let hk = Hkdf::<Sha256>::new(None, &ikm);
        let mut okm = [0u8; 32];
        hk.expand(b"lox-connect-credential-mac", &mut okm)
            .map_err(|_| AppError::CredentialEngine("hkdf expand failed".into()))?;
        Ok(okm.to_vec())
    }

    fn sign(key: &[u8], payload: &SignedPayload) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(key)
            .map_err(|_| AppError::CredentialEngine("hmac key error".into()))?;
        let canonical = serde_json::to_vec(payload)
            .map_err(|e| AppError::CredentialEngine(format!("encode payload: {e}")))?;
        mac.update(&canonical);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn verify(key: &[u8], payload: &SignedPayload, tag: &str) -> Result<()> {
        let expected = Self::sign(key, payload)?;
        if expected.eq_ignore_ascii_case(tag) {
            Ok(())
        } else {
            Err(AppError::CredentialEngine("credential MAC mismatch".into()))
        }
    }

    fn build_and_sign(
        key: &[u8],
        id: String,
        trust_level: u32,
        invites_remaining: u32,
        bridgelines: Vec<RawBridgeLine>,
        issued_at_ms: f64,
    ) -> Result<LoxCredential> {
        let payload = SignedPayload {
            id: &id,
            trust_level,
            invites_remaining,
            bridgelines: &bridgelines,
            issued_at_ms,
        };
        let mac = Self::sign(key, &payload)?;
        Ok(LoxCredential {
            id,
            trust_level,
            invites_remaining,
            bridgelines,
            issued_at_ms,
            mac,
        })
    }

    fn response_field<'a>(resp: &'a serde_json::Value, field: &str) -> Result<&'a serde_json::Value> {
        resp.get(field)
            .ok_or_else(|| AppError::CredentialEngine(format!("response missing `{field}`")))
    }
}

impl CredentialEngine for HmacCredentialEngine {
    fn invitation_is_trusted(&self, inv: &str) -> bool {
        !inv.is_empty() && inv.len() >= 16 && inv.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    }

    fn open_invite(&self, inv: &str) -> Result<String> {
        if !self.invitation_is_trusted(inv) {
            return Err(AppError::BadInvite);
        }
        Ok(json!({ "invite": inv }).to_string())
    }

    fn handle_new_lox_credential(&self, _req: &str, resp: &str, pub_keys: &str) -> Result<String> {
        let key = Self::mac_key(pub_keys)?;
        let resp: serde_json::Value = serde_json::from_str(resp)
            .map_err(|e| AppError::CredentialEngine(format!("bad openreq response: {e}")))?;
        let id = Self::response_field(&resp, "id")?
            .as_str()
            .ok_or_else(|| AppError::CredentialEngine("id not a string".into()))?
            .to_string();
        let trust_level = Self::response_field(&resp, "trust_level")?
            .as_u64()
            .unwrap_or(0) as u32;
        let invites_remaining = resp.get("invites_remaining").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let bridgelines: Vec<RawBridgeLine> = resp
            .get("bridgelines")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| AppError::CredentialEngine(format!("bad bridgelines: {e}")))?
            .unwrap_or_default();
        let issued_at_ms = resp.get("issued_at_ms").and_then(|v| v.as_f64()).unwrap_or(0.0);

        let cred = Self::build_and_sign(&key, id, trust_level, invites_remaining, bridgelines, issued_at_ms)?;
        cred.to_json()
    }

    fn get_trust_level(&self, cred: &str) -> Result<u32> {
        Ok(LoxCredential::parse(cred)?.trust_level)
    }

    fn get_invites_remaining(&self, cred: &str) -> Result<u32> {
        Ok(LoxCredential::parse(cred)?.invites_remaining)
    }

    fn get_next_unlock(&self, constants: &str, cred: &str) -> Result<String> {
        let cred = LoxCredential::parse(cred)?;
        let constants: serde_json::Value = serde_json::from_str(constants)
            .map_err(|e| AppError::CredentialEngine(format!("bad constants: {e}")))?;
        let days_for_level = constants
            .get("level_up_days")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.get(cred.trust_level as usize))
            .and_then(|v| v.as_f64())
            .unwrap_or(7.0);
        let unlock_at_ms = cred.issued_at_ms + days_for_level * 86_400_000.0;
        Ok(json!({
            "trust_level_unlock_date": unlock_at_ms,
            "next_level": cred.trust_level + 1,
        })
        .to_string())
    }

    fn issue_invite(&self, cred: &str, _enc_table: &str, _pub_keys: &str) -> Result<String> {
        let cred = LoxCredential::parse(cred)?;
        Ok(json!({ "id": cred.id }).to_string())
    }

    fn handle_issue_invite(&self, _req: &str, resp: &str, pub_keys: &str) -> Result<String> {
        let key = Self::mac_key(pub_keys)?;
        let resp: serde_json::Value = serde_json::from_str(resp)
            .map_err(|e| AppError::CredentialEngine(format!("bad issueinvite response: {e}")))?;
        let id = Self::response_field(&resp, "id")?
            .as_str()
            .ok_or_else(|| AppError::CredentialEngine("id not a string".into()))?
            .to_string();
        let trust_level = resp.get("trust_level").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let invites_remaining = Self::response_field(&resp, "invites_remaining")?
            .as_u64()
            .unwrap_or(0) as u32;
        let bridgelines: Vec<RawBridgeLine> = resp
            .get("bridgelines")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| AppError::CredentialEngine(format!("bad bridgelines: {e}")))?
            .unwrap_or_default();
        let issued_at_ms = resp.get("issued_at_ms").and_then(|v| v.as_f64()).unwrap_or(0.0);

        let cred = Self::build_and_sign(&key, id, trust_level, invites_remaining, bridgelines, issued_at_ms)?;
        cred.to_json()
    }

    fn prepare_invite(&self, cred: &str) -> Result<String> {
        let cred = LoxCredential::parse(cred)?;
        let blob = json!({ "id": cred.id, "mac": cred.mac }).to_string();
        Ok(BASE64.encode(blob.as_bytes()))
    }

    fn level_up(&self, cred: &str, _enc_table: &str, _pub_keys: &str) -> Result<String> {
        let cred = LoxCredential::parse(cred)?;
        Ok(json!({ "id": cred.id, "trust_level": cred.trust_level }).to_string())
    }

    fn handle_level_up(&self, _req: &str, resp: &str, pub_keys: &str) -> Result<String> {
        self.handle_issue_invite(_req, resp, pub_keys)
    }

    fn trust_promotion(&self, cred: &str, _pub_keys: &str) -> Result<String> {
        let cred = LoxCredential::parse(cred)?;
        Ok(json!({ "id": cred.id }).to_string())
    }

    fn handle_trust_promotion(&self, _req: &str, resp: &str) -> Result<String> {
        let resp: serde_json::Value = serde_json::from_str(resp)
            .map_err(|e| AppError::CredentialEngine(format!("bad trustpromo response: {e}")))?;
        let promo = Self::response_field(&resp, "promo")?.clone();
        Ok(promo.to_string())
    }

    fn trust_migration(&self, cred: &str, promo: &str, _pub_keys: &str) -> Result<String> {
        let cred = LoxCredential::parse(cred)?;
        let promo: serde_json::Value = serde_json::from_str(promo)
            .map_err(|e| AppError::CredentialEngine(format!("bad promo token: {e}")))?;
        Ok(json!({ "id": cred.id, "promo": promo }).to_string())
    }

    fn handle_trust_migration(&self, _req: &str, resp: &str, pub_keys: &str) -> Result<String> {
        // Unlike the other `handle_*` operations, this one doesn't mint a
        // fresh credential and sign it itself (per §4.2) — trustmig is the
        // final round of the untrusted->trusted handoff and the authority
        // returns an already-tagged credential, so its MAC is the only
        // thing standing between this and accepting arbitrary server input.
        let key = Self::mac_key(pub_keys)?;
        let cred: LoxCredential = serde_json::from_str(resp)
            .map_err(|e| AppError::CredentialEngine(format!("bad trustmig response: {e}")))?;
        cred.verify_mac(&key)?;
        cred.to_json()
    }

    fn check_blockage(&self, cred: &str, _pub_keys: &str) -> Result<String> {
        let cred = LoxCredential::parse(cred)?;
        Ok(json!({ "id": cred.id }).to_string())
    }

    fn handle_check_blockage(&self, _cred: &str, resp: &str) -> Result<String> {
        let resp: serde_json::Value = serde_json::from_str(resp)
            .map_err(|e| AppError::CredentialEngine(format!("bad checkblockage response: {e}")))?;
        let migration_cred = Self::response_field(&resp, "migration_cred")?.clone();
        Ok(migration_cred.to_string())
    }

    fn blockage_migration(&self, cred: &str, mig_cred: &str, _pub_keys: &str) -> Result<String> {
        let cred = LoxCredential::parse(cred)?;
        let mig_cred: serde_json::Value = serde_json::from_str(mig_cred)
            .map_err(|e| AppError::CredentialEngine(format!("bad migration cred: {e}")))?;
        Ok(json!({ "id": cred.id, "migration_cred": mig_cred }).to_string())
    }

    fn handle_blockage_migration(&self, _cred: &str, resp: &str, pub_keys: &str) -> Result<String> {
        self.handle_issue_invite(_cred, resp, pub_keys)
    }

    fn check_lox_pubkeys_update(
        &self,
        new_pub_keys: &str,
        old_pub_keys: &str,
        cred: &str,
    ) -> Result<Option<String>> {
        if new_pub_keys == old_pub_keys {
            return Ok(None);
        }
        let cred = LoxCredential::parse(cred)?;
        Ok(Some(json!({ "id": cred.id }).to_string()))
    }

    fn handle_update_cred(&self, _req: &str, resp: &str, new_pub_keys: &str) -> Result<String> {
        self.handle_issue_invite(_req, resp, new_pub_keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pub_keys() -> String {
        json!({ "hmac_key": hex::encode([7u8; 32]) }).to_string()
    }

    #[test]
    fn test_invitation_syntax_validation() {
        let engine = HmacCredentialEngine::new();
        assert!(engine.invitation_is_trusted("abcdefghijklmnop"));
        assert!(!engine.invitation_is_trusted("short"));
        assert!(!engine.invitation_is_trusted("has spaces in it!!"));
    }

    #[test]
    fn test_open_invite_rejects_bad_syntax() {
        let engine = HmacCredentialEngine::new();
        assert!(matches!(engine.open_invite("bad"), Err(AppError::BadInvite)));
    }

    #[test]
    fn test_handle_new_lox_credential_roundtrip() {
        let engine = HmacCredentialEngine::new();
        let resp = json!({
            "id": "lox-1",
            "trust_level": 0,
            "invites_remaining": 0,
            "bridgelines": [],
            "issued_at_ms": 1000.0,
        })
        .to_string();
        let keys = pub_keys();
        let cred_json = engine.handle_new_lox_credential("{}", &resp, &keys).unwrap();
        assert_eq!(engine.get_trust_level(&cred_json).unwrap(), 0);
    }

    #[test]
    fn test_handle_trust_migration_accepts_valid_mac_and_rejects_tampering() {
        let engine = HmacCredentialEngine::new();
        let keys = pub_keys();
        let resp = json!({
            "id": "lox-1", "trust_level": 1, "invites_remaining": 0,
            "bridgelines": [], "issued_at_ms": 1000.0,
        })
        .to_string();
        // trustmig's response is already a tagged credential, built here the
        // same way the authority would (re-using handle_new_lox_credential
        // just to get a validly-signed one).
        let signed = engine.handle_new_lox_credential("{}", &resp, &keys).unwrap();

        let migrated = engine.handle_trust_migration("{}", &signed, &keys).unwrap();
        assert_eq!(engine.get_trust_level(&migrated).unwrap(), 1);

        let mut tampered: serde_json::Value = serde_json::from_str(&signed).unwrap();
        tampered["trust_level"] = json!(99);
        let tampered = tampered.to_string();
        assert!(matches!(
            engine.handle_trust_migration("{}", &tampered, &keys),
            Err(AppError::CredentialEngine(_))
        ));
    }

    #[test]
    fn test_get_next_unlock_uses_constants_table() {
        let engine = HmacCredentialEngine::new();
        let resp = json!({
            "id": "lox-1", "trust_level": 0, "invites_remaining": 0,
            "bridgelines": [], "issued_at_ms": 0.0,
        })
        .to_string();
        let keys = pub_keys();
        let cred = engine.handle_new_lox_credential("{}", &resp, &keys).unwrap();
        let constants = json!({ "level_up_days": [7.0, 14.0] }).to_string();
        let unlock = engine.get_next_unlock(&constants, &cred).unwrap();
        let unlock: serde_json::Value = serde_json::from_str(&unlock).unwrap();
        assert_eq!(unlock["trust_level_unlock_date"], json!(7.0 * 86_400_000.0));
        assert_eq!(unlock["next_level"], json!(1));
    }

    #[test]
    fn test_check_lox_pubkeys_update_only_when_changed() {
        let engine = HmacCredentialEngine::new();
        let resp = json!({
            "id": "lox-1", "trust_level": 0, "invites_remaining": 0,
            "bridgelines": [], "issued_at_ms": 0.0,
        })
        .to_string();
        let keys = pub_keys();
        let cred = engine.handle_new_lox_credential("{}", &resp, &keys).unwrap();

        assert!(engine
            .check_lox_pubkeys_update(&keys, &keys, &cred)
            .unwrap()
            .is_none());

        let new_keys = json!({ "hmac_key": hex::encode([9u8; 32]) }).to_string();
        assert!(engine
            .check_lox_pubkeys_update(&new_keys, &keys, &cred)
            .unwrap()
            .is_some());
    }
}
