//! Merge rules: built-in defaults sit below every other source.

use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with the built-in defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError>
{
    Config::builder()
        .set_default("broker.exploration_fraction", 0.07)?
        .set_default("broker.channel_timeout_ms", 2000_i64)?
        .set_default("broker.vector_k", 32_i64)?
        .set_default("broker.lineage_depth", 3_i64)?
        .set_default("broker.lineage_relation", "derivedFrom")?
        .set_default("broker.pending_discount", 0.8)?
        .set_default("broker.strict_integrity", false)?
        .set_default("broker.admin_capability", "admin")?
        .set_default("coherence.symbolic_weight", 0.4)?
        .set_default("coherence.vector_weight", 0.4)?
        .set_default("coherence.lineage_weight", 0.2)?
        .set_default("ledger.path", ".context-broker/ledger.ndjson")?
        .set_default("ledger.writer_id", "local")?
        .set_default("storage.bundle_store_path", ".context-broker/bundles")?
        .set_default("storage.frames_dir", "frames")
}
