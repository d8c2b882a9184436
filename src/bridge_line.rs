//! BridgeLine derivation (§3): turns a credential's embedded
//! `bridgelines[]` into the bridge-line strings the TransportProvider
//! understands.
//!
//! `info` is a NUL-padded, semicolon-free key=value blob; this module
//! never interprets its bytes as anything other than text to pattern
//! match, mirroring how the teacher's `bridge_config.rs` treats bridge
//! URLs as opaque strings it assembles/splits but never parses deeply.

use std::sync::OnceLock;

use regex::Regex;

use crate::credential_engine::{LoxCredential, RawBridgeLine};
use crate::error::{AppError, Result};

fn type_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"type=([^\s;]+)"#).unwrap())
}

fn fingerprint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"fingerprint="([^"]+)""#).unwrap())
}

fn params_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"params=Some\((\{[^}]*\})\)"#).unwrap())
}

fn trim_trailing_nuls(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
    &bytes[..end]
}

fn bridge_line_from_raw(raw: &RawBridgeLine) -> Result<String> {
    let addr = std::str::from_utf8(trim_trailing_nuls(&raw.addr))
        .map_err(|e| AppError::MalformedResponse(format!("bridge addr not utf8: {e}")))?;
    let info = std::str::from_utf8(trim_trailing_nuls(&raw.info))
        .map_err(|e| AppError::MalformedResponse(format!("bridge info not utf8: {e}")))?;

    let transport = type_re()
        .captures(info)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or("obfs4");
    let fingerprint = fingerprint_re()
        .captures(info)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or("");
    let params = params_re()
        .captures(info)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or("{}");

    Ok(format!("{transport} {addr}:{port} {fingerprint} {params}", port = raw.port))
}

/// Extract every bridge line embedded in `cred_json`, in order.
pub fn bridge_lines_from_credential(cred_json: &str) -> Result<Vec<String>> {
    let cred: LoxCredential = serde_json::from_str(cred_json)
        .map_err(|e| AppError::CredentialEngine(format!("bad credential: {e}")))?;
    cred.bridgelines.iter().map(bridge_line_from_raw).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_engine::RawBridgeLine;

    fn credential_with(raw: Vec<RawBridgeLine>) -> String {
        serde_json::json!({
            "id": "lox-1",
            "trust_level": 1,
            "invites_remaining": 2,
            "bridgelines": raw,
            "issued_at_ms": 0.0,
            "mac": "deadbeef",
        })
        .to_string()
    }

    #[test]
    fn test_bridge_line_formatting() {
        let mut addr = b"203.0.113.5".to_vec();
        addr.extend_from_slice(&[0u8; 4]);
        let mut info = br#"type=obfs4;fingerprint="ABCDEF0123";params=Some({"iat-mode":"0"})"#.to_vec();
        info.extend_from_slice(&[0u8; 2]);

        let raw = RawBridgeLine { addr, port: 443, info };
        let cred = credential_with(vec![raw]);
        let lines = bridge_lines_from_credential(&cred).unwrap();
        assert_eq!(
            lines,
            vec!["obfs4 203.0.113.5:443 ABCDEF0123 {\"iat-mode\":\"0\"}".to_string()]
        );
    }

    #[test]
    fn test_missing_fields_fall_back_to_defaults() {
        let raw = RawBridgeLine {
            addr: b"198.51.100.9".to_vec(),
            port: 9001,
            info: b"no-matching-fields-here".to_vec(),
        };
        let cred = credential_with(vec![raw]);
        let lines = bridge_lines_from_credential(&cred).unwrap();
        assert_eq!(lines, vec!["obfs4 198.51.100.9:9001  {}".to_string()]);
    }

    #[test]
    fn test_multiple_bridgelines_preserve_order() {
        let raw1 = RawBridgeLine {
            addr: b"10.0.0.1".to_vec(),
            port: 1,
            info: br#"type=webtunnel;fingerprint="AAA";params=Some({})"#.to_vec(),
        };
        let raw2 = RawBridgeLine {
            addr: b"10.0.0.2".to_vec(),
            port: 2,
            info: br#"type=snowflake;fingerprint="BBB";params=Some({})"#.to_vec(),
        };
        let cred = credential_with(vec![raw1, raw2]);
        let lines = bridge_lines_from_credential(&cred).unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("webtunnel 10.0.0.1:1"));
        assert!(lines[1].starts_with("snowflake 10.0.0.2:2"));
    }
}
