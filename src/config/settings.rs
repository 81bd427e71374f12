//! Configuration structures loaded from TOML.
//!
//! Every field has a built-in default so a missing file or a partial
//! file both yield a runnable configuration.

use super::defaults;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowLensConfig {
    pub ingestion: IngestionSettings,
    pub enrichment: EnrichmentSettings,
    pub resolution: ResolutionSettings,
    pub classification: ClassificationSettings,
    pub cache: CacheSettings,
    pub api: ApiSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionSettings {
    pub netflow_port: u16,
    pub sflow_port: u16,
    pub queue_max_size: usize,
    pub sample_threshold: usize,
    pub drop_threshold: usize,
    pub sample_rate: u32,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    /// Drop flows where both endpoints are external before they enter
    /// the queue
    pub discard_external_flows: bool,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            netflow_port: defaults::NETFLOW_PORT,
            sflow_port: defaults::SFLOW_PORT,
            queue_max_size: defaults::QUEUE_MAX_SIZE,
            sample_threshold: defaults::SAMPLE_THRESHOLD,
            drop_threshold: defaults::DROP_THRESHOLD,
            sample_rate: defaults::SAMPLE_RATE,
            batch_size: defaults::BATCH_SIZE,
            batch_timeout_ms: defaults::BATCH_TIMEOUT_MS,
            discard_external_flows: false,
        }
    }
}

impl IngestionSettings {
    /// Thresholds must be strictly ordered or the queue state machine
    /// degenerates.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.sample_threshold < self.drop_threshold
            && self.drop_threshold < self.queue_max_size)
        {
            return Err(format!(
                "ingestion thresholds must satisfy sample_threshold ({}) < drop_threshold ({}) < queue_max_size ({})",
                self.sample_threshold, self.drop_threshold, self.queue_max_size
            ));
        }
        if self.sample_rate == 0 {
            return Err("sample_rate must be >= 1".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentSettings {
    pub dns_timeout_ms: u64,
    pub dns_cache_size: usize,
    pub dns_cache_ttl_secs: u64,
    pub dns_servers: Vec<String>,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            dns_timeout_ms: defaults::DNS_TIMEOUT_MS,
            dns_cache_size: defaults::DNS_CACHE_SIZE,
            dns_cache_ttl_secs: defaults::DNS_CACHE_TTL_SECS,
            dns_servers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionSettings {
    pub window_seconds: u64,
    pub watermark_delay_secs: u64,
    pub staleness_threshold_secs: u64,
    pub detection_interval_minutes: u64,
    pub spike_ratio: f64,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    pub gateway_rollup_interval_secs: u64,
    pub asset_offline_threshold_secs: u64,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            window_seconds: defaults::WINDOW_SECONDS,
            watermark_delay_secs: defaults::WATERMARK_DELAY_SECS,
            staleness_threshold_secs: defaults::STALENESS_THRESHOLD_SECS,
            detection_interval_minutes: defaults::DETECTION_INTERVAL_MINUTES,
            spike_ratio: defaults::SPIKE_RATIO,
            batch_size: defaults::RESOLUTION_BATCH_SIZE,
            poll_interval_ms: defaults::RESOLUTION_POLL_INTERVAL_MS,
            gateway_rollup_interval_secs: defaults::GATEWAY_ROLLUP_INTERVAL_SECS,
            asset_offline_threshold_secs: defaults::ASSET_OFFLINE_THRESHOLD_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationSettings {
    pub auto_update_threshold: f64,
    pub min_flows: u64,
    pub min_observation_hours: u32,
    pub ml_confidence_threshold: f64,
    pub ml_min_flows: u64,
    pub interval_minutes: u64,
}

impl Default for ClassificationSettings {
    fn default() -> Self {
        Self {
            auto_update_threshold: defaults::AUTO_UPDATE_THRESHOLD,
            min_flows: defaults::MIN_FLOWS,
            min_observation_hours: defaults::MIN_OBSERVATION_HOURS,
            ml_confidence_threshold: defaults::ML_CONFIDENCE_THRESHOLD,
            ml_min_flows: defaults::ML_MIN_FLOWS,
            interval_minutes: defaults::CLASSIFICATION_INTERVAL_MINUTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub topology_cache_ttl_seconds: u64,
    pub max_entries: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            topology_cache_ttl_seconds: defaults::TOPOLOGY_CACHE_TTL_SECS,
            max_entries: defaults::TOPOLOGY_CACHE_MAX_ENTRIES,
            cleanup_interval_secs: defaults::CACHE_CLEANUP_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub bind_addr: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl FlowLensConfig {
    /// Load configuration using the documented order:
    /// `FLOWLENS_CONFIG` env path, `./flowlens.toml`, then defaults.
    pub fn load() -> Self {
        if let Ok(path) = std::env::var("FLOWLENS_CONFIG") {
            match Self::from_file(Path::new(&path)) {
                Ok(config) => {
                    tracing::info!(path = %path, "Configuration loaded from FLOWLENS_CONFIG");
                    return config;
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to load FLOWLENS_CONFIG — falling back");
                }
            }
        }

        let default_path = Path::new("flowlens.toml");
        if default_path.exists() {
            match Self::from_file(default_path) {
                Ok(config) => {
                    tracing::info!("Configuration loaded from ./flowlens.toml");
                    return config;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse ./flowlens.toml — using defaults");
                }
            }
        }

        tracing::info!("Using built-in default configuration");
        Self::default()
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config
            .ingestion
            .validate()
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(config)
    }
}
