/// Hub configuration.
///
/// Every struct has working defaults and builder setters; `from_env()`
/// layers `RETRANSMIT_*`, `CAPSULE_*` and hub-specific variables on top.
use std::time::Duration;

use arc_transport::{DEFAULT_REASSEMBLY_TTL, MIN_CHUNK_SIZE_BYTES};

use crate::crypto::{SessionKey, SigningKeypair};
use crate::queue::BackoffPolicy;
use crate::ArcProtocolError;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring {key}={raw:?}: not a valid value");
            None
        }
    }
}

// ── Retransmit ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RetransmitConfig {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Scheduler period.
    pub tick: Duration,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_backoff: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            tick: Duration::from_secs(1),
        }
    }
}

impl RetransmitConfig {
    /// `RETRANSMIT_MAX_RETRIES`, `RETRANSMIT_BASE_BACKOFF_SECONDS`,
    /// `RETRANSMIT_BACKOFF_MULTIPLIER`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("RETRANSMIT_MAX_RETRIES") {
            config.max_retries = v;
        }
        if let Some(v) = env_parse::<f64>("RETRANSMIT_BASE_BACKOFF_SECONDS") {
            if v.is_finite() && v > 0.0 {
                config.base_backoff = Duration::from_secs_f64(v);
            }
        }
        if let Some(v) = env_parse("RETRANSMIT_BACKOFF_MULTIPLIER") {
            config.backoff_multiplier = v;
        }
        config
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn base_backoff(mut self, backoff: Duration) -> Self {
        self.base_backoff = backoff;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn validate(&self) -> Result<(), ArcProtocolError> {
        if self.base_backoff.is_zero() {
            return Err(ArcProtocolError::Config("base_backoff must be positive".into()));
        }
        if !(self.backoff_multiplier > 1.0) {
            return Err(ArcProtocolError::Config(format!(
                "backoff_multiplier must be > 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.tick.is_zero() {
            return Err(ArcProtocolError::Config("retransmit tick must be positive".into()));
        }
        Ok(())
    }

    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_backoff: self.base_backoff,
            multiplier: self.backoff_multiplier,
            max_retries: self.max_retries,
        }
    }
}

// ── Capsules / gossip ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CapsuleConfig {
    /// Cached answers older than this are not served.
    pub capsule_ttl_days: u64,
    /// Authority manifest broadcast period.
    pub manifest_interval: Duration,
    /// Edge manifest poll period.
    pub gossip_interval: Duration,
}

impl Default for CapsuleConfig {
    fn default() -> Self {
        Self {
            capsule_ttl_days: 90,
            manifest_interval: Duration::from_secs(30),
            gossip_interval: Duration::from_secs(45),
        }
    }
}

impl CapsuleConfig {
    /// `CAPSULE_TTL_DAYS`, `CAPSULE_MANIFEST_INTERVAL_SECONDS`,
    /// `CAPSULE_GOSSIP_INTERVAL_SECONDS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("CAPSULE_TTL_DAYS") {
            config.capsule_ttl_days = v;
        }
        if let Some(v) = env_parse("CAPSULE_MANIFEST_INTERVAL_SECONDS") {
            config.manifest_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse("CAPSULE_GOSSIP_INTERVAL_SECONDS") {
            config.gossip_interval = Duration::from_secs(v);
        }
        config
    }

    pub fn capsule_ttl_days(mut self, days: u64) -> Self {
        self.capsule_ttl_days = days;
        self
    }

    pub fn manifest_interval(mut self, interval: Duration) -> Self {
        self.manifest_interval = interval;
        self
    }

    pub fn gossip_interval(mut self, interval: Duration) -> Self {
        self.gossip_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ArcProtocolError> {
        if self.manifest_interval.is_zero() || self.gossip_interval.is_zero() {
            return Err(ArcProtocolError::Config("gossip intervals must be positive".into()));
        }
        Ok(())
    }
}

// ── Edge hub ────────────────────────────────────────────────────────

/// Configuration of an edge ("mini") hub.
///
/// ```rust
/// use arc_protocol::MiniHubConfig;
///
/// let config = MiniHubConfig::new("mini-hub-1")
///     .main_hub_node_id("main-hub")
///     .max_chunk_size_bytes(512);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct MiniHubConfig {
    pub node_id: String,
    pub main_hub_node_id: String,
    /// Size used when chunking outbound payloads.
    pub max_chunk_size_bytes: usize,
    /// Authority verify key (base64). Fetched from the authority when unset.
    pub main_hub_verify_key: Option<String>,
    pub reassembly_ttl: Duration,
    pub session_key: SessionKey,
    pub retransmit: RetransmitConfig,
    pub capsule: CapsuleConfig,
}

impl MiniHubConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            main_hub_node_id: "main-hub".to_string(),
            max_chunk_size_bytes: 800,
            main_hub_verify_key: None,
            reassembly_ttl: DEFAULT_REASSEMBLY_TTL,
            session_key: SessionKey::default(),
            retransmit: RetransmitConfig::default(),
            capsule: CapsuleConfig::default(),
        }
    }

    /// `MINI_HUB_NODE_ID`, `MAIN_HUB_NODE_ID`, `MAIN_HUB_VERIFY_KEY_B64`,
    /// `NETWORK_SIM_MAX_CHUNK_SIZE_BYTES`, `ARC_AI_SESSION_KEY` plus the
    /// retransmit and capsule variables.
    pub fn from_env() -> Self {
        let node_id = std::env::var("MINI_HUB_NODE_ID").unwrap_or_else(|_| "mini-hub-1".into());
        let mut config = Self::new(node_id);
        if let Ok(v) = std::env::var("MAIN_HUB_NODE_ID") {
            config.main_hub_node_id = v;
        }
        config.main_hub_verify_key = std::env::var("MAIN_HUB_VERIFY_KEY_B64").ok();
        if let Some(v) = env_parse("NETWORK_SIM_MAX_CHUNK_SIZE_BYTES") {
            config.max_chunk_size_bytes = v;
        }
        config.session_key = SessionKey::from_env();
        config.retransmit = RetransmitConfig::from_env();
        config.capsule = CapsuleConfig::from_env();
        config
    }

    pub fn main_hub_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.main_hub_node_id = node_id.into();
        self
    }

    pub fn max_chunk_size_bytes(mut self, bytes: usize) -> Self {
        self.max_chunk_size_bytes = bytes;
        self
    }

    pub fn main_hub_verify_key(mut self, key_b64: impl Into<String>) -> Self {
        self.main_hub_verify_key = Some(key_b64.into());
        self
    }

    pub fn reassembly_ttl(mut self, ttl: Duration) -> Self {
        self.reassembly_ttl = ttl;
        self
    }

    pub fn session_key(mut self, key: SessionKey) -> Self {
        self.session_key = key;
        self
    }

    pub fn retransmit(mut self, retransmit: RetransmitConfig) -> Self {
        self.retransmit = retransmit;
        self
    }

    pub fn capsule(mut self, capsule: CapsuleConfig) -> Self {
        self.capsule = capsule;
        self
    }

    pub fn validate(&self) -> Result<(), ArcProtocolError> {
        if self.node_id.is_empty() || self.main_hub_node_id.is_empty() {
            return Err(ArcProtocolError::Config("hub node ids must not be empty".into()));
        }
        if self.max_chunk_size_bytes < MIN_CHUNK_SIZE_BYTES {
            return Err(ArcProtocolError::Config(format!(
                "max_chunk_size_bytes must be >= {MIN_CHUNK_SIZE_BYTES}, got {}",
                self.max_chunk_size_bytes
            )));
        }
        self.retransmit.validate()?;
        self.capsule.validate()
    }
}

// ── Authority hub ───────────────────────────────────────────────────

/// Configuration of the authority ("main") hub.
#[derive(Debug, Clone)]
pub struct MainHubConfig {
    pub node_id: String,
    /// Edge hubs that receive manifest broadcasts and relayed messages.
    pub known_mini_hubs: Vec<String>,
    pub session_key: SessionKey,
    pub signing_keys: SigningKeypair,
    pub capsule: CapsuleConfig,
}

impl MainHubConfig {
    /// Defaults with a freshly generated signing keypair.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            known_mini_hubs: Vec::new(),
            session_key: SessionKey::default(),
            signing_keys: SigningKeypair::generate(),
            capsule: CapsuleConfig::default(),
        }
    }

    /// `MAIN_HUB_NODE_ID`, `MAIN_HUB_KNOWN_MINI_HUBS` (comma separated),
    /// `MAIN_HUB_SIGNING_KEY_B64`, `ARC_AI_SESSION_KEY`, capsule variables.
    ///
    /// Without a signing key an ephemeral one is generated.
    pub fn from_env() -> Result<Self, ArcProtocolError> {
        let node_id = std::env::var("MAIN_HUB_NODE_ID").unwrap_or_else(|_| "main-hub".into());
        let mut config = Self::new(node_id);
        if let Ok(list) = std::env::var("MAIN_HUB_KNOWN_MINI_HUBS") {
            config.known_mini_hubs = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        match std::env::var("MAIN_HUB_SIGNING_KEY_B64") {
            Ok(key) => config.signing_keys = SigningKeypair::from_base64(&key)?,
            Err(_) => tracing::warn!("no MAIN_HUB_SIGNING_KEY_B64 set, using ephemeral signing keys"),
        }
        config.session_key = SessionKey::from_env();
        config.capsule = CapsuleConfig::from_env();
        Ok(config)
    }

    pub fn known_mini_hubs<I, S>(mut self, hubs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_mini_hubs = hubs.into_iter().map(Into::into).collect();
        self
    }

    pub fn session_key(mut self, key: SessionKey) -> Self {
        self.session_key = key;
        self
    }

    pub fn signing_keys(mut self, keys: SigningKeypair) -> Self {
        self.signing_keys = keys;
        self
    }

    pub fn capsule(mut self, capsule: CapsuleConfig) -> Self {
        self.capsule = capsule;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retransmit_defaults() {
        let config = RetransmitConfig::default();
        assert_eq!(config.max_retries, 6);
        assert_eq!(config.base_backoff, Duration::from_millis(500));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.tick, Duration::from_secs(1));
        assert!(config.validate().is_ok());
        assert_eq!(config.policy(), BackoffPolicy::default());
    }

    #[test]
    fn retransmit_validation() {
        assert!(RetransmitConfig::default().backoff_multiplier(1.0).validate().is_err());
        assert!(RetransmitConfig::default().backoff_multiplier(f64::NAN).validate().is_err());
        assert!(RetransmitConfig::default().base_backoff(Duration::ZERO).validate().is_err());
    }

    #[test]
    fn capsule_defaults() {
        let config = CapsuleConfig::default();
        assert_eq!(config.capsule_ttl_days, 90);
        assert_eq!(config.manifest_interval, Duration::from_secs(30));
        assert_eq!(config.gossip_interval, Duration::from_secs(45));
    }

    #[test]
    fn mini_hub_rejects_small_chunks() {
        assert!(MiniHubConfig::new("mh").max_chunk_size_bytes(64).validate().is_err());
        assert!(MiniHubConfig::new("mh").validate().is_ok());
        assert!(MiniHubConfig::new("").validate().is_err());
    }

    #[test]
    fn main_hub_builder() {
        let config = MainHubConfig::new("main-hub").known_mini_hubs(["mh1", "mh2"]);
        assert_eq!(config.known_mini_hubs, vec!["mh1", "mh2"]);
    }
}
