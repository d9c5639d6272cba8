// Configuration Management for the Market Cache
// JSON file + environment overrides; constructed explicitly and passed in

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Configuration Structures
// ============================================================================

/// One admission rule: at most `count` weight units per `duration_ms`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitTierConfig {
    pub id: String,
    pub count: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BinanceConfig {
    pub base_url: String,
    pub request_timeout_seconds: u64,

    // Rate limiting (request weight)
    pub rate_limit_tiers: Vec<RateLimitTierConfig>,
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://fapi.binance.com".to_string(),
            request_timeout_seconds: 10,
            rate_limit_tiers: vec![RateLimitTierConfig {
                id: "request_weight".to_string(),
                count: 2400,
                duration_ms: 60_000,
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    // Order book
    pub orderbook_snapshot_depth: u32,
    pub gap_retry_delay_ms: u64,
    pub partial_depth_levels: u32,

    // Bounded windows (0 = default)
    pub trade_window: usize,
    pub candle_window: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            orderbook_snapshot_depth: 1000,
            gap_retry_delay_ms: 1000,
            partial_depth_levels: 20,
            trade_window: 500,
            candle_window: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_format: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_format: false,
        }
    }
}

// ============================================================================
// Configuration Summary
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub base_url: String,
    pub rate_limit_tiers: usize,
    pub orderbook_snapshot_depth: u32,
    pub trade_window: usize,
    pub candle_window: usize,
    pub log_level: String,
}

// ============================================================================
// Configuration Manager
// ============================================================================

pub struct ConfigManager {
    binance: Arc<RwLock<BinanceConfig>>,
    cache: Arc<RwLock<CacheConfig>>,
    monitoring: Arc<RwLock<MonitoringConfig>>,
}

impl ConfigManager {
    pub fn new(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut manager = Self {
            binance: Arc::new(RwLock::new(BinanceConfig::default())),
            cache: Arc::new(RwLock::new(CacheConfig::default())),
            monitoring: Arc::new(RwLock::new(MonitoringConfig::default())),
        };

        if let Some(path) = config_path {
            manager.load_from_file(path)?;
        }

        manager.load_from_env();

        info!("Configuration initialized");
        Ok(manager)
    }

    /// Load configuration from JSON file; missing sections keep their defaults
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        let config_data: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;

        if let Some(binance_data) = config_data.get("binance") {
            *self.binance.write() = serde_json::from_value(binance_data.clone())?;
        }

        if let Some(cache_data) = config_data.get("cache") {
            *self.cache.write() = serde_json::from_value(cache_data.clone())?;
        }

        if let Some(monitoring_data) = config_data.get("monitoring") {
            *self.monitoring.write() = serde_json::from_value(monitoring_data.clone())?;
        }

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    pub fn load_from_env(&mut self) {
        if let Ok(base_url) = std::env::var("MARKET_CACHE_BASE_URL") {
            self.binance.write().base_url = base_url;
        }
        if let Ok(level) = std::env::var("MARKET_CACHE_LOG_LEVEL") {
            self.monitoring.write().log_level = level;
        }
    }

    pub fn save_to_file(&self, config_path: &str) -> Result<(), ConfigError> {
        let mut config_map = HashMap::new();
        config_map.insert("binance", serde_json::to_value(&*self.binance.read())?);
        config_map.insert("cache", serde_json::to_value(&*self.cache.read())?);
        config_map.insert("monitoring", serde_json::to_value(&*self.monitoring.read())?);

        if let Some(parent) = Path::new(config_path).parent() {
            fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&config_map)?;
        fs::write(config_path, json)?;

        info!(path = config_path, "Configuration saved");
        Ok(())
    }

    /// Validate configuration; all problems are reported together
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let binance = self.binance.read();
        let cache = self.cache.read();

        if binance.base_url.is_empty() {
            errors.push("base_url must not be empty".to_string());
        }
        if binance.rate_limit_tiers.is_empty() {
            errors.push("at least one rate limit tier is required".to_string());
        }
        for tier in &binance.rate_limit_tiers {
            if tier.count == 0 {
                errors.push(format!("rate limit tier '{}' must have count > 0", tier.id));
            }
            if tier.duration_ms == 0 {
                errors.push(format!("rate limit tier '{}' must have duration_ms > 0", tier.id));
            }
        }

        if !matches!(cache.partial_depth_levels, 5 | 10 | 20) {
            errors.push("partial_depth_levels must be 5, 10 or 20".to_string());
        }
        if cache.orderbook_snapshot_depth == 0 || cache.orderbook_snapshot_depth > 1000 {
            errors.push("orderbook_snapshot_depth must be between 1 and 1000".to_string());
        }
        if cache.trade_window > 1000 {
            errors.push("trade_window must not exceed 1000".to_string());
        }
        if cache.candle_window > 1500 {
            errors.push("candle_window must not exceed 1500".to_string());
        }

        if !errors.is_empty() {
            for error in &errors {
                warn!(error = %error, "Config validation error");
            }
            return Err(ConfigError::Validation(errors.join("; ")));
        }

        info!("Configuration validated successfully");
        Ok(())
    }

    pub fn get_summary(&self) -> ConfigSummary {
        let binance = self.binance.read();
        let cache = self.cache.read();
        let monitoring = self.monitoring.read();

        ConfigSummary {
            base_url: binance.base_url.clone(),
            rate_limit_tiers: binance.rate_limit_tiers.len(),
            orderbook_snapshot_depth: cache.orderbook_snapshot_depth,
            trade_window: cache.trade_window,
            candle_window: cache.candle_window,
            log_level: monitoring.log_level.clone(),
        }
    }

    pub fn binance(&self) -> BinanceConfig {
        self.binance.read().clone()
    }

    pub fn cache(&self) -> CacheConfig {
        self.cache.read().clone()
    }

    pub fn monitoring(&self) -> MonitoringConfig {
        self.monitoring.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs() {
        let binance = BinanceConfig::default();
        assert_eq!(binance.base_url, "https://fapi.binance.com");
        assert_eq!(binance.rate_limit_tiers.len(), 1);
        assert_eq!(binance.rate_limit_tiers[0].count, 2400);

        let cache = CacheConfig::default();
        assert_eq!(cache.orderbook_snapshot_depth, 1000);
        assert_eq!(cache.gap_retry_delay_ms, 1000);
    }

    #[test]
    fn test_config_manager_defaults_validate() {
        let manager = ConfigManager::new(None).unwrap();
        assert!(manager.validate().is_ok());
    }

    #[test]
    fn test_zero_tier_count_rejected() {
        let manager = ConfigManager::new(None).unwrap();
        manager.binance.write().rate_limit_tiers.push(RateLimitTierConfig {
            id: "burst".to_string(),
            count: 0,
            duration_ms: 1000,
        });

        match manager.validate() {
            Err(ConfigError::Validation(msg)) => assert!(msg.contains("burst")),
            other => panic!("Expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let path_str = path.to_str().unwrap();

        let manager = ConfigManager::new(None).unwrap();
        manager.cache.write().trade_window = 250;
        manager.save_to_file(path_str).unwrap();

        let loaded = ConfigManager::new(Some(path_str)).unwrap();
        assert_eq!(loaded.cache().trade_window, 250);
        assert_eq!(loaded.binance().rate_limit_tiers, manager.binance().rate_limit_tiers);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"cache":{"candle_window":120}}"#).unwrap();

        let loaded = ConfigManager::new(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(loaded.cache().candle_window, 120);
        assert_eq!(loaded.cache().trade_window, 500);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let manager = ConfigManager::new(Some("/nonexistent/market_cache.json")).unwrap();
        let summary = manager.get_summary();
        assert_eq!(summary.trade_window, 500);
        assert_eq!(summary.rate_limit_tiers, 1);
    }
}
