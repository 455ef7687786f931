//! Pool configuration: YAML file with CLI overrides.

use crate::constants::{MAX_EXTRANONCE_SIZE, TEMPLATE_CACHE_SIZE};
use crate::vardiff::VardiffParams;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Stratum listen ports. Port 8888 additionally honors client-supplied
    /// difficulty in the authorize password.
    pub ports: Vec<u16>,
    /// Address of the upstream template fetcher's pub/sub feed.
    pub template_feed: String,
    /// Where finalized blocks are handed back; defaults to the feed address.
    pub submit_endpoint: Option<String>,
    pub initial_difficulty: f64,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
    pub shares_per_min: u32,
    pub var_diff: bool,
    pub pow2_clamp: bool,
    /// Extranonce prefix size in bytes, 0..=3.
    pub extranonce_size: u8,
    pub template_cache_size: usize,
    pub print_stats: bool,
    pub log_to_file: bool,
    pub log_level: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            ports: vec![5555, 8888],
            template_feed: "127.0.0.1:7777".to_string(),
            submit_endpoint: None,
            initial_difficulty: 8192.0,
            min_difficulty: 64.0,
            max_difficulty: 131_072.0,
            shares_per_min: 20,
            var_diff: true,
            pow2_clamp: false,
            extranonce_size: 2,
            template_cache_size: TEMPLATE_CACHE_SIZE,
            print_stats: true,
            log_to_file: false,
            log_level: "info".to_string(),
        }
    }
}

impl PoolConfig {
    pub fn from_yaml(content: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: PoolConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.ports.is_empty() {
            return Err("at least one stratum port is required".into());
        }
        let mut seen = HashSet::new();
        for port in &self.ports {
            if !seen.insert(port) {
                return Err(format!("duplicate stratum port {port}").into());
            }
        }
        if self.extranonce_size > MAX_EXTRANONCE_SIZE {
            return Err(format!("extranonce_size must be 0..={MAX_EXTRANONCE_SIZE}").into());
        }
        if self.min_difficulty <= 0.0 || self.min_difficulty > self.max_difficulty {
            return Err("difficulty range is empty or non-positive".into());
        }
        if self.shares_per_min == 0 {
            return Err("shares_per_min must be positive".into());
        }
        Ok(())
    }

    pub fn submit_endpoint(&self) -> &str {
        self.submit_endpoint.as_deref().unwrap_or(&self.template_feed)
    }

    pub fn vardiff_params(&self) -> VardiffParams {
        VardiffParams {
            expected_shares_per_min: self.shares_per_min as f64,
            min_diff: self.min_difficulty,
            max_diff: self.max_difficulty,
            clamp_pow2: self.pow2_clamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PoolConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.submit_endpoint(), "127.0.0.1:7777");
    }

    #[test]
    fn test_from_yaml_overrides_defaults() {
        let config = PoolConfig::from_yaml(
            r#"
ports: [5555]
template_feed: "10.0.0.2:7777"
initial_difficulty: 2048
shares_per_min: 30
pow2_clamp: true
"#,
        )
        .unwrap();
        assert_eq!(config.ports, vec![5555]);
        assert_eq!(config.initial_difficulty, 2048.0);
        assert_eq!(config.shares_per_min, 30);
        assert!(config.pow2_clamp);
        // Untouched fields keep their defaults.
        assert_eq!(config.extranonce_size, 2);
    }

    #[test]
    fn test_validation_rejects_bad_configs() {
        assert!(PoolConfig::from_yaml("ports: []").is_err());
        assert!(PoolConfig::from_yaml("ports: [5555, 5555]").is_err());
        assert!(PoolConfig::from_yaml("extranonce_size: 4").is_err());
        assert!(PoolConfig::from_yaml("min_difficulty: 1024\nmax_difficulty: 64").is_err());
        assert!(PoolConfig::from_yaml("shares_per_min: 0").is_err());
    }
}
