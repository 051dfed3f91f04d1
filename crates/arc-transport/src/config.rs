use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Smallest chunk size and bandwidth the simulator accepts.
pub const MIN_CHUNK_SIZE_BYTES: usize = 128;
pub const MIN_BANDWIDTH_BYTES_PER_SEC: u64 = 128;

/// Network simulator link model.
///
/// Defaults model a slow, lossy rural link. Use the builder methods or
/// [`SimSettings::from_env`] (`NETWORK_SIM_*` variables):
///
/// ```rust
/// use arc_transport::SimSettings;
///
/// let settings = SimSettings::new()
///     .latency_ms(50)
///     .packet_loss_pct(0.0)
///     .max_chunk_size_bytes(256);
/// assert!(settings.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimSettings {
    pub latency_ms: u64,
    /// Per-chunk loss probability, percent in `[0, 100]`.
    pub packet_loss_pct: f64,
    pub max_chunk_size_bytes: usize,
    pub bandwidth_bytes_per_sec: u64,
    pub enable_reordering: bool,
    pub auto_chunk_large_payloads: bool,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl SimSettings {
    pub fn new() -> Self {
        Self {
            latency_ms: 250,
            packet_loss_pct: 5.0,
            max_chunk_size_bytes: 800,
            bandwidth_bytes_per_sec: 1024,
            enable_reordering: false,
            auto_chunk_large_payloads: true,
        }
    }

    /// Defaults overridden by `NETWORK_SIM_LATENCY_MS`,
    /// `NETWORK_SIM_PACKET_LOSS_PCT`, `NETWORK_SIM_MAX_CHUNK_SIZE_BYTES`,
    /// `NETWORK_SIM_BANDWIDTH_BYTES_PER_SEC`, `NETWORK_SIM_ENABLE_REORDERING`
    /// and `NETWORK_SIM_AUTO_CHUNK_LARGE_PAYLOADS`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut settings = Self::new();
        if let Some(v) = env_parse("NETWORK_SIM_LATENCY_MS") {
            settings.latency_ms = v;
        }
        if let Some(v) = env_parse("NETWORK_SIM_PACKET_LOSS_PCT") {
            settings.packet_loss_pct = v;
        }
        if let Some(v) = env_parse("NETWORK_SIM_MAX_CHUNK_SIZE_BYTES") {
            settings.max_chunk_size_bytes = v;
        }
        if let Some(v) = env_parse("NETWORK_SIM_BANDWIDTH_BYTES_PER_SEC") {
            settings.bandwidth_bytes_per_sec = v;
        }
        if let Some(v) = env_parse("NETWORK_SIM_ENABLE_REORDERING") {
            settings.enable_reordering = v;
        }
        if let Some(v) = env_parse("NETWORK_SIM_AUTO_CHUNK_LARGE_PAYLOADS") {
            settings.auto_chunk_large_payloads = v;
        }
        settings
    }

    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn packet_loss_pct(mut self, pct: f64) -> Self {
        self.packet_loss_pct = pct;
        self
    }

    pub fn max_chunk_size_bytes(mut self, bytes: usize) -> Self {
        self.max_chunk_size_bytes = bytes;
        self
    }

    pub fn bandwidth_bytes_per_sec(mut self, bytes: u64) -> Self {
        self.bandwidth_bytes_per_sec = bytes;
        self
    }

    pub fn enable_reordering(mut self, enabled: bool) -> Self {
        self.enable_reordering = enabled;
        self
    }

    pub fn auto_chunk_large_payloads(mut self, enabled: bool) -> Self {
        self.auto_chunk_large_payloads = enabled;
        self
    }

    /// Check the ranges accepted by the control API.
    pub fn validate(&self) -> Result<(), TransportError> {
        if !(0.0..=100.0).contains(&self.packet_loss_pct) {
            return Err(TransportError::Config(format!(
                "packet_loss_pct must be within [0, 100], got {}",
                self.packet_loss_pct
            )));
        }
        if self.max_chunk_size_bytes < MIN_CHUNK_SIZE_BYTES {
            return Err(TransportError::Config(format!(
                "max_chunk_size_bytes must be >= {MIN_CHUNK_SIZE_BYTES}, got {}",
                self.max_chunk_size_bytes
            )));
        }
        if self.bandwidth_bytes_per_sec < MIN_BANDWIDTH_BYTES_PER_SEC {
            return Err(TransportError::Config(format!(
                "bandwidth_bytes_per_sec must be >= {MIN_BANDWIDTH_BYTES_PER_SEC}, got {}",
                self.bandwidth_bytes_per_sec
            )));
        }
        Ok(())
    }

    /// Return a copy with every field present in `update` replaced.
    pub fn merged(&self, update: &SettingsUpdate) -> Self {
        Self {
            latency_ms: update.latency_ms.unwrap_or(self.latency_ms),
            packet_loss_pct: update.packet_loss_pct.unwrap_or(self.packet_loss_pct),
            max_chunk_size_bytes: update
                .max_chunk_size_bytes
                .unwrap_or(self.max_chunk_size_bytes),
            bandwidth_bytes_per_sec: update
                .bandwidth_bytes_per_sec
                .unwrap_or(self.bandwidth_bytes_per_sec),
            enable_reordering: update.enable_reordering.unwrap_or(self.enable_reordering),
            auto_chunk_large_payloads: update
                .auto_chunk_large_payloads
                .unwrap_or(self.auto_chunk_large_payloads),
        }
    }
}

/// Partial settings change; absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_loss_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_chunk_size_bytes: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_bytes_per_sec: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_reordering: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_chunk_large_payloads: Option<bool>,
}

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
