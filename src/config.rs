//! Configuration loaded from TOML.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration.
//!
//! ```toml
//! [fusion]
//! strategy = "logistic"
//! hedge_discount = 0.85
//!
//! [conflicts]
//! policy = { supersede_when_trusted = { margin = 0.2 } }
//! multi_valued_predicates = ["author", "cites"]
//!
//! [gaps.rails]
//! allowlist = ["arxiv.org", "*.acm.org"]
//! rate_limit = { capacity = 10, refill_every_secs = 6 }
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::conflict::ConflictPolicy;
use crate::error::{GraphError, GraphResult};
use crate::fusion::FusionStrategy;
use crate::ingest::ConsistencyMode;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Fusion strategy and evidence weighting.
    pub fusion: FusionConfig,
    /// Conflict policy and predicate cardinality.
    pub conflicts: ConflictConfig,
    /// Gap detection, prioritization and research.
    pub gaps: GapConfig,
    /// Persistence.
    pub storage: StorageConfig,
    /// gRPC listener.
    pub server: ServerConfig,
}

impl GraphConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Config` for malformed TOML or out-of-range values.
    pub fn from_toml_str(contents: &str) -> GraphResult<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| GraphError::config(format!("failed to parse config TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Config` if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> GraphResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            GraphError::config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::Config` naming the first offending field.
    pub fn validate(&self) -> GraphResult<()> {
        let unit = |field: &str, value: f64| {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(GraphError::config(format!("{field} must be in [0, 1], got {value}")))
            }
        };
        unit("fusion.hedge_discount", self.fusion.hedge_discount)?;
        unit("gaps.priority_floor", self.gaps.priority_floor)?;
        if self.fusion.freshness_half_life_days <= 0.0 {
            return Err(GraphError::config("fusion.freshness_half_life_days must be positive"));
        }
        if let ConflictPolicy::SupersedeWhenTrusted { margin } = self.conflicts.policy {
            unit("conflicts.policy.margin", margin)?;
        }
        if self.gaps.concurrency == 0 {
            return Err(GraphError::config("gaps.concurrency must be at least 1"));
        }
        if self.gaps.rails.rate_limit.capacity == 0 {
            return Err(GraphError::config("gaps.rails.rate_limit.capacity must be at least 1"));
        }
        Ok(())
    }
}

/// `[fusion]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// How per-source evidence combines.
    pub strategy: FusionStrategy,
    /// Multiplier applied to a contribution once per hedge.
    pub hedge_discount: f64,
    /// Half-life used to derive freshness when a source omits it.
    pub freshness_half_life_days: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            strategy: FusionStrategy::Logistic,
            hedge_discount: 0.85,
            freshness_half_life_days: 365.0,
        }
    }
}

/// `[conflicts]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// What to do with a contradicting candidate.
    pub policy: ConflictPolicy,
    /// Predicates whose distinct objects never conflict.
    pub multi_valued_predicates: Vec<String>,
    /// Consistency mode for candidates produced by research.
    pub research_mode: ConsistencyMode,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            policy: ConflictPolicy::Flag,
            multi_valued_predicates: Vec::new(),
            research_mode: ConsistencyMode::Strict,
        }
    }
}

/// `[gaps]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    /// Gaps below this priority stay classified and are never queued.
    pub priority_floor: f64,
    /// Subjects with fewer claims than this have a missing-prerequisite gap.
    pub prerequisite_threshold: usize,
    /// Research attempts allowed per gap.
    pub max_attempts: u32,
    /// Wall-clock budget per gap, from its first research attempt.
    pub research_deadline_secs: u64,
    /// Per-call research timeout.
    pub call_timeout_ms: u64,
    /// Research worker threads.
    pub concurrency: usize,
    /// Domains assigned to gaps that do not name their own.
    pub default_domains: Vec<String>,
    /// Safety rails guarding every research call.
    pub rails: RailConfig,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            priority_floor: 0.3,
            prerequisite_threshold: 2,
            max_attempts: 3,
            research_deadline_secs: 300,
            call_timeout_ms: 30_000,
            concurrency: 4,
            default_domains: Vec::new(),
            rails: RailConfig::default(),
        }
    }
}

/// `[gaps.rails]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RailConfig {
    /// Research call rate limit.
    pub rate_limit: RateLimitConfig,
    /// Exact domain names or `*.suffix` wildcards. Empty denies everything.
    pub allowlist: Vec<String>,
    /// Deepest follow-up gap allowed; reported gaps sit at depth 0.
    pub max_depth: u32,
    /// Require a recorded approval before research starts.
    pub human_in_the_loop: bool,
}

impl Default for RailConfig {
    fn default() -> Self {
        Self {
            rate_limit: RateLimitConfig::default(),
            allowlist: Vec::new(),
            max_depth: 3,
            human_in_the_loop: true,
        }
    }
}

/// Token bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum tokens held.
    pub capacity: u32,
    /// One token is added per period, up to `capacity`.
    pub refill_every_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_every_secs: 6,
        }
    }
}

/// `[storage]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the write-ahead log. In-memory when unset.
    pub data_dir: Option<PathBuf>,
    /// Fsync the log after every append.
    pub sync_on_write: bool,
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address the server binds.
    pub addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 50071)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = GraphConfig::from_toml_str("").unwrap();
        assert_eq!(config, GraphConfig::default());
        assert_eq!(config.fusion.strategy, FusionStrategy::Logistic);
        assert_eq!(config.conflicts.policy, ConflictPolicy::Flag);
        assert_eq!(config.conflicts.research_mode, ConsistencyMode::Strict);
        assert!((config.gaps.priority_floor - 0.3).abs() < f64::EPSILON);
        assert!(config.gaps.rails.human_in_the_loop);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
            [fusion]
            strategy = "noisy_or"
            hedge_discount = 0.9

            [conflicts]
            policy = { supersede_when_trusted = { margin = 0.25 } }
            multi_valued_predicates = ["author"]
            research_mode = "eventual"

            [gaps]
            concurrency = 2
            default_domains = ["arxiv.org"]

            [gaps.rails]
            allowlist = ["arxiv.org", "*.acm.org"]
            max_depth = 5
            human_in_the_loop = false
            rate_limit = { capacity = 3, refill_every_secs = 60 }

            [storage]
            data_dir = "/var/lib/kyrograph"
            sync_on_write = true

            [server]
            addr = "0.0.0.0:9000"
        "#;

        let config = GraphConfig::from_toml_str(toml).unwrap();
        assert_eq!(config.fusion.strategy, FusionStrategy::NoisyOr);
        assert_eq!(
            config.conflicts.policy,
            ConflictPolicy::SupersedeWhenTrusted { margin: 0.25 }
        );
        assert_eq!(config.conflicts.research_mode, ConsistencyMode::Eventual);
        assert_eq!(config.gaps.concurrency, 2);
        assert_eq!(config.gaps.prerequisite_threshold, 2);
        assert_eq!(config.gaps.rails.allowlist.len(), 2);
        assert_eq!(config.gaps.rails.rate_limit.capacity, 3);
        assert!(!config.gaps.rails.human_in_the_loop);
        assert_eq!(
            config.storage.data_dir.as_deref(),
            Some(Path::new("/var/lib/kyrograph"))
        );
        assert_eq!(config.server.addr.port(), 9000);
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        let err = GraphConfig::from_toml_str("[fusion]\nhedge_discount = 1.5\n").unwrap_err();
        assert!(err.to_string().contains("hedge_discount"));

        let err = GraphConfig::from_toml_str("[gaps]\nconcurrency = 0\n").unwrap_err();
        assert!(matches!(err, GraphError::Config { .. }));
    }

    #[test]
    fn test_malformed_toml() {
        assert!(GraphConfig::from_toml_str("[fusion\nstrategy =").is_err());
        assert!(GraphConfig::from_toml_str("[fusion]\nstrategy = \"median\"\n").is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kyrograph.toml");
        std::fs::write(&path, "[gaps]\nmax_attempts = 7\n").unwrap();
        assert_eq!(GraphConfig::from_file(&path).unwrap().gaps.max_attempts, 7);
        assert!(GraphConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
