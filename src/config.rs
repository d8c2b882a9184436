//! Static configuration for the connect/bridge-acquisition core
//!
//! Grounded on the `Default`-with-override pattern the teacher crate
//! uses for `network::NetworkConfig` and `isolation::IsolationConfig`:
//! a plain struct with a `Default` impl plus `with_*` constructors.

use std::time::Duration;

/// Base URLs and tunables for the bootstrap/Lox core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// LoxAuthority base URL, e.g. `https://lox.example.org`.
    pub lox_authority_url: String,

    /// Moat base URL used once the transport is bootstrapped.
    pub moat_direct_url: String,

    /// Moat base URL used via the domain-fronted path, pre-bootstrap.
    pub moat_front_url: String,

    /// Built-in pluggable-transport names always offered to Moat,
    /// alongside `"vanilla"`.
    pub builtin_transports: Vec<String>,

    /// Interval between LoxClient background-refresh cycles.
    pub background_refresh_interval: Duration,

    /// Inclusive bounds for InternetProbe's randomized start delay.
    pub probe_delay_min: Duration,
    pub probe_delay_max: Duration,

    /// Maximum number of entries retained in the invite history.
    pub max_invites: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            lox_authority_url: "https://lox.torproject.org".to_string(),
            moat_direct_url: "https://moat.torproject.org".to_string(),
            moat_front_url: "https://moat.torproject.org.global.prod.fastly.net".to_string(),
            builtin_transports: vec![
                "obfs4".to_string(),
                "webtunnel".to_string(),
                "snowflake".to_string(),
                "meek-azure".to_string(),
            ],
            background_refresh_interval: Duration::from_secs(12 * 60 * 60),
            probe_delay_min: Duration::from_secs(25),
            probe_delay_max: Duration::from_secs(35),
            max_invites: 50,
        }
    }
}

impl CoreConfig {
    /// Transports offered to `Moat::circumvention_settings`/`circumvention_defaults`:
    /// the built-ins plus `"vanilla"`.
    pub fn offered_transports(&self) -> Vec<String> {
        let mut transports = self.builtin_transports.clone();
        transports.push("vanilla".to_string());
        transports
    }

    pub fn with_lox_authority_url(mut self, url: impl Into<String>) -> Self {
        self.lox_authority_url = url.into();
        self
    }

    pub fn with_moat_urls(mut self, direct: impl Into<String>, front: impl Into<String>) -> Self {
        self.moat_direct_url = direct.into();
        self.moat_front_url = front.into();
        self
    }

    pub fn with_background_refresh_interval(mut self, interval: Duration) -> Self {
        self.background_refresh_interval = interval;
        self
    }

    pub fn with_max_invites(mut self, max_invites: usize) -> Self {
        self.max_invites = max_invites;
        self
    }
}
