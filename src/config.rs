//! Configuration System
//!
//! Layered configuration, lowest to highest precedence: built-in defaults,
//! the global config file, workspace `config/config.toml`, workspace
//! `config/{CONTEXT_BROKER_ENV}.toml`, then `CONTEXT_BROKER__SECTION__KEY`
//! environment variables.

use crate::error::ConfigError;
use crate::evidence::AggregatorSettings;
use crate::explain::CoherenceWeights;
use crate::index::lineage::ANY_RELATION;
use crate::ledger::EventType;
use crate::logging::LoggingConfig;
use crate::resolution::{DEFAULT_EXPLORATION_FRACTION, DEFAULT_PENDING_DISCOUNT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::workspace_file::ENV_VAR;

/// Prefix for environment overrides: `CONTEXT_BROKER__BROKER__VECTOR_K=64`.
pub const ENV_PREFIX: &str = "CONTEXT_BROKER";

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub coherence: CoherenceSection,
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Query-time behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    /// Share of resolved rows added from the best unresolved candidates.
    pub exploration_fraction: f64,
    pub channel_timeout_ms: u64,
    pub vector_k: usize,
    pub lineage_depth: u32,
    /// Event type followed by the lineage channel, or `"*"` for all.
    pub lineage_relation: String,
    /// Confidence multiplier when any support is pending.
    pub pending_discount: f64,
    /// Treat a content-hash mismatch as a request fault.
    pub strict_integrity: bool,
    /// Capability that unlocks `policy_view = "raw"`.
    pub admin_capability: String,
}

impl Default for BrokerSection {
    fn default() -> Self {
        let aggregator = AggregatorSettings::default();
        BrokerSection {
            exploration_fraction: DEFAULT_EXPLORATION_FRACTION,
            channel_timeout_ms: aggregator.channel_timeout.as_millis() as u64,
            vector_k: aggregator.vector_k,
            lineage_depth: aggregator.lineage_depth,
            lineage_relation: aggregator.lineage_relation,
            pending_discount: DEFAULT_PENDING_DISCOUNT,
            strict_integrity: false,
            admin_capability: "admin".to_string(),
        }
    }
}

impl BrokerSection {
    pub fn aggregator_settings(&self) -> AggregatorSettings {
        AggregatorSettings {
            channel_timeout: Duration::from_millis(self.channel_timeout_ms),
            vector_k: self.vector_k,
            lineage_depth: self.lineage_depth,
            lineage_relation: self.lineage_relation.clone(),
        }
    }

    fn validate(&self, errors: &mut Vec<ValidationError>) {
        let mut fail = |msg: String| errors.push(ValidationError::Broker(msg));
        if !(0.05..=0.10).contains(&self.exploration_fraction) {
            fail(format!(
                "exploration_fraction must be within [0.05, 0.10], got {}",
                self.exploration_fraction
            ));
        }
        if self.channel_timeout_ms == 0 {
            fail("channel_timeout_ms must be positive".to_string());
        }
        if self.vector_k == 0 {
            fail("vector_k must be positive".to_string());
        }
        if self.lineage_depth == 0 {
            fail("lineage_depth must be at least 1".to_string());
        }
        if self.lineage_relation != ANY_RELATION && EventType::parse(&self.lineage_relation).is_none() {
            fail(format!("unknown lineage_relation '{}'", self.lineage_relation));
        }
        if !(self.pending_discount > 0.0 && self.pending_discount <= 1.0) {
            fail(format!(
                "pending_discount must be within (0, 1], got {}",
                self.pending_discount
            ));
        }
        if self.admin_capability.trim().is_empty() {
            fail("admin_capability cannot be empty".to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoherenceSection {
    pub symbolic_weight: f64,
    pub vector_weight: f64,
    pub lineage_weight: f64,
}

impl Default for CoherenceSection {
    fn default() -> Self {
        let weights = CoherenceWeights::default();
        CoherenceSection {
            symbolic_weight: weights.symbolic,
            vector_weight: weights.vector,
            lineage_weight: weights.lineage,
        }
    }
}

impl CoherenceSection {
    pub fn weights(&self) -> CoherenceWeights {
        CoherenceWeights {
            symbolic: self.symbolic_weight,
            vector: self.vector_weight,
            lineage: self.lineage_weight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    /// NDJSON event log.
    pub path: PathBuf,
    /// Writer identity used for locally issued event ids.
    pub writer_id: String,
}

impl Default for LedgerSection {
    fn default() -> Self {
        LedgerSection {
            path: PathBuf::from(".context-broker/ledger.ndjson"),
            writer_id: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// sled database directory.
    pub bundle_store_path: PathBuf,
    /// Directory of TOML frame definitions.
    pub frames_dir: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        StorageSection {
            bundle_store_path: PathBuf::from(".context-broker/bundles"),
            frames_dir: PathBuf::from("frames"),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Broker(String),
    Coherence(String),
    Ledger(String),
    Storage(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Broker(msg) => write!(f, "broker: {}", msg),
            ValidationError::Coherence(msg) => write!(f, "coherence: {}", msg),
            ValidationError::Ledger(msg) => write!(f, "ledger: {}", msg),
            ValidationError::Storage(msg) => write!(f, "storage: {}", msg),
            ValidationError::Logging(msg) => write!(f, "logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl BrokerConfig {
    /// Collect every violation rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        self.broker.validate(&mut errors);

        let weights = [
            ("symbolic_weight", self.coherence.symbolic_weight),
            ("vector_weight", self.coherence.vector_weight),
            ("lineage_weight", self.coherence.lineage_weight),
        ];
        for (name, weight) in weights {
            if !(weight >= 0.0) {
                errors.push(ValidationError::Coherence(format!(
                    "{} must be non-negative, got {}",
                    name, weight
                )));
            }
        }
        if weights.iter().map(|(_, w)| w.max(0.0)).sum::<f64>() <= 0.0 {
            errors.push(ValidationError::Coherence(
                "weights must not all be zero".to_string(),
            ));
        }

        if self.ledger.path.as_os_str().is_empty() {
            errors.push(ValidationError::Ledger("path cannot be empty".to_string()));
        }
        if self.ledger.writer_id.trim().is_empty() || self.ledger.writer_id.contains(':') {
            errors.push(ValidationError::Ledger(format!(
                "writer_id must be non-empty and contain no ':', got '{}'",
                self.ledger.writer_id
            )));
        }

        if self.storage.bundle_store_path.as_os_str().is_empty() {
            errors.push(ValidationError::Storage(
                "bundle_store_path cannot be empty".to_string(),
            ));
        }
        if self.storage.frames_dir.as_os_str().is_empty() {
            errors.push(ValidationError::Storage("frames_dir cannot be empty".to_string()));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            errors.push(ValidationError::Logging(format!(
                "format must be 'text' or 'json', got '{}'",
                self.logging.format
            )));
        }
        if !matches!(self.logging.output.as_str(), "stdout" | "stderr" | "file") {
            errors.push(ValidationError::Logging(format!(
                "output must be 'stdout', 'stderr', or 'file', got '{}'",
                self.logging.output
            )));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn invalid(errors: Vec<ValidationError>) -> ConfigError {
    ConfigError::Invalid(
        errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate the layered configuration for `workspace_root`.
    pub fn load(workspace_root: &Path) -> Result<BrokerConfig, ConfigError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );
        let config: BrokerConfig = builder.build()?.try_deserialize()?;
        config.validate().map_err(invalid)?;
        Ok(config)
    }

    /// Load a single TOML file over the built-in defaults.
    pub fn load_from_file(path: &Path) -> Result<BrokerConfig, ConfigError> {
        let config: BrokerConfig = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path).required(true))
            .build()?
            .try_deserialize()?;
        config.validate().map_err(invalid)?;
        Ok(config)
    }

    /// Where the global config file is looked up.
    pub fn global_config_path() -> Option<PathBuf> {
        sources::global_file::global_config_path()
    }
}
