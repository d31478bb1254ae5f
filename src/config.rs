// src/config.rs
// Environment-driven configuration and startup validation, in the style of
// the teacher's config.rs (warning/error accumulation) and config_manager.rs
// (typed config struct).

use std::env;
use std::net::SocketAddr;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub chain_id: u64,
    pub node_key_path: String,
    pub wire_port: u16,
    pub prepare_timeout_ms: u64,
    pub commit_timeout_ms: u64,
    pub finality_depth: u64,
    pub block_time_ms: u64,
    pub sync_interval_ms: u64,
    pub bft_enabled: bool,
    pub require_authenticated_verify: bool,
    pub dht_bootstrap: Vec<SocketAddr>,
    pub max_connections: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chain_id: 1,
            node_key_path: "./data/node.key".to_string(),
            wire_port: 30333,
            prepare_timeout_ms: 3_000,
            commit_timeout_ms: 3_000,
            finality_depth: 6,
            block_time_ms: 2_000,
            sync_interval_ms: 10_000,
            bft_enabled: true,
            require_authenticated_verify: true,
            dht_bootstrap: Vec::new(),
            max_connections: 50,
        }
    }
}

impl Config {
    /// Load configuration from the environment toggles named in spec §6,
    /// falling back to documented defaults.
    pub fn from_env() -> Self {
        let mut cfg = Config::default();

        if let Ok(v) = env::var("CHAIN_ID") {
            if let Ok(n) = v.parse() {
                cfg.chain_id = n;
            }
        }
        if let Ok(v) = env::var("NODE_KEY_PATH") {
            cfg.node_key_path = v;
        }
        if let Ok(v) = env::var("WIRE_PORT") {
            if let Ok(n) = v.parse() {
                cfg.wire_port = n;
            }
        }
        if let Ok(v) = env::var("PREPARE_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                cfg.prepare_timeout_ms = n;
            }
        }
        if let Ok(v) = env::var("COMMIT_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                cfg.commit_timeout_ms = n;
            }
        }
        if let Ok(v) = env::var("FINALITY_DEPTH") {
            if let Ok(n) = v.parse() {
                cfg.finality_depth = n;
            }
        }
        if let Ok(v) = env::var("BLOCK_TIME_MS") {
            if let Ok(n) = v.parse() {
                cfg.block_time_ms = n;
            }
        }
        if let Ok(v) = env::var("SYNC_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                cfg.sync_interval_ms = n;
            }
        }
        if let Ok(v) = env::var("BFT_ENABLED") {
            cfg.bft_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("REQUIRE_AUTHENTICATED_VERIFY") {
            cfg.require_authenticated_verify = !(v == "0" || v.eq_ignore_ascii_case("false"));
        }
        if let Ok(v) = env::var("DHT_BOOTSTRAP") {
            cfg.dht_bootstrap = v
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
        }
        if let Ok(v) = env::var("MAX_CONNECTIONS") {
            if let Ok(n) = v.parse() {
                cfg.max_connections = n;
            }
        }

        cfg
    }

    /// Validate startup configuration, accumulating warnings/errors rather
    /// than failing fast on the first problem.
    pub fn validate(&self) -> ConfigValidation {
        let mut v = ConfigValidation::new();

        if self.chain_id == 0 {
            v.add_error("CHAIN_ID must be non-zero".into());
        }
        if self.prepare_timeout_ms == 0 || self.commit_timeout_ms == 0 {
            v.add_error("prepare/commit timeouts must be non-zero".into());
        }
        if self.finality_depth == 0 {
            v.add_warning("FINALITY_DEPTH=0 finalizes blocks immediately on apply".into());
        }
        if !self.require_authenticated_verify {
            v.add_warning(
                "REQUIRE_AUTHENTICATED_VERIFY is disabled — this is a test-only configuration, \
                 production builds should require authenticated peer verification"
                    .into(),
            );
        }
        if self.dht_bootstrap.is_empty() {
            v.add_warning("no DHT_BOOTSTRAP peers configured; node will rely on inbound dials".into());
        }

        v
    }
}

pub struct ConfigValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    fn new() -> Self {
        ConfigValidation {
            valid: true,
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    fn add_warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }

    fn add_error(&mut self, msg: String) {
        self.errors.push(msg);
        self.valid = false;
    }

    pub fn print_summary(&self) {
        for w in &self.warnings {
            warn!("config: {}", w);
        }
        for e in &self.errors {
            error!("config: {}", e);
        }
        if self.valid && self.warnings.is_empty() {
            info!("configuration validation passed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        let v = cfg.validate();
        assert!(v.valid);
    }

    #[test]
    fn zero_chain_id_is_an_error() {
        let cfg = Config { chain_id: 0, ..Default::default() };
        let v = cfg.validate();
        assert!(!v.valid);
    }
}
