//! Moat wire client (§6): censorship-circumvention settings and a
//! reachability probe endpoint, reached through a `FetchChannel` shared
//! with `LoxAuthority`.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{AppError, Result};
use crate::fetch::FetchChannel;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig(pub serde_json::Value);

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MoatSettings {
    pub country: Option<String>,
    #[serde(default)]
    pub settings: Vec<TransportConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternetReachability {
    Online,
    Offline,
    Unknown,
}

pub struct MoatClient {
    channel: FetchChannel,
}

impl MoatClient {
    pub fn new(channel: FetchChannel) -> Self {
        Self { channel }
    }

    fn transports_body(transports: &[String], region_code: Option<&str>) -> String {
        json!({
            "types": transports,
            "country": region_code,
        })
        .to_string()
    }

    /// `circumvention_settings`: censorship-circumvention settings for a
    /// region, auto-detected when `region_code` is `None`.
    pub async fn circumvention_settings(
        &self,
        bootstrapped: bool,
        transports: &[String],
        region_code: Option<&str>,
    ) -> Result<MoatSettings> {
        let body = Self::transports_body(transports, region_code);
        let text = self
            .channel
            .fetch(bootstrapped, "circumvention_settings", Some(&body))
            .await?;
        parse_moat_settings(&text)
    }

    /// `circumvention_defaults`: a region-independent fallback list.
    pub async fn circumvention_defaults(
        &self,
        bootstrapped: bool,
        transports: &[String],
    ) -> Result<MoatSettings> {
        let body = json!({ "types": transports }).to_string();
        let text = self
            .channel
            .fetch(bootstrapped, "circumvention_defaults", Some(&body))
            .await?;
        parse_moat_settings(&text)
    }

    /// `circumvention_countries`: the list of countries Moat has settings for.
    pub async fn circumvention_countries(&self, bootstrapped: bool) -> Result<Vec<String>> {
        let text = self
            .channel
            .fetch(bootstrapped, "circumvention_countries", None)
            .await?;
        serde_json::from_str(&text)
            .map_err(|e| AppError::MalformedResponse(format!("circumvention_countries: {e}")))
    }

    /// `testInternetConnection`: used by InternetProbe.
    pub async fn test_internet_connection(&self, bootstrapped: bool) -> Result<InternetReachability> {
        match self
            .channel
            .fetch(bootstrapped, "testInternetConnection", None)
            .await
        {
            Ok(text) => {
                let value: serde_json::Value = serde_json::from_str(&text)
                    .map_err(|e| AppError::MalformedResponse(format!("testInternetConnection: {e}")))?;
                match value.get("status").and_then(|v| v.as_str()) {
                    Some("online") => Ok(InternetReachability::Online),
                    Some("offline") => Ok(InternetReachability::Offline),
                    _ => Ok(InternetReachability::Unknown),
                }
            }
            Err(AppError::ServerUnreachable(_)) => Ok(InternetReachability::Offline),
            Err(other) => Err(other),
        }
    }
}

fn parse_moat_settings(text: &str) -> Result<MoatSettings> {
    if text.trim().is_empty() {
        return Ok(MoatSettings::default());
    }
    serde_json::from_str(text).map_err(|e| AppError::MalformedResponse(format!("moat settings: {e}")))
}
