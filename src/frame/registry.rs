//! Frame/Policy registry boundary.
//!
//! The broker reads frames and policies through [`FrameRegistry`]; the registry's
//! CRUD surface lives elsewhere. [`InMemoryFrameRegistry`] keeps every registered
//! version and can be seeded from a directory of TOML frame files.

use crate::error::FrameError;
use crate::frame::FrameDef;
use crate::policy::PolicyRule;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Read-side registry contract.
pub trait FrameRegistry: Send + Sync {
    /// Exact version when `version` is given, the latest otherwise.
    fn get_frame(&self, name: &str, version: Option<u32>) -> Result<Arc<FrameDef>, FrameError>;

    /// Named policy rule list, if registered.
    fn get_policy(&self, name: &str) -> Option<Vec<PolicyRule>>;
}

/// Contents of one frame file.
#[derive(Debug, Default, Deserialize)]
struct FrameFile {
    #[serde(default)]
    frames: Vec<FrameDef>,
    #[serde(default)]
    policies: BTreeMap<String, Vec<PolicyRule>>,
}

#[derive(Default)]
pub struct InMemoryFrameRegistry {
    frames: RwLock<BTreeMap<String, BTreeMap<u32, Arc<FrameDef>>>>,
    policies: RwLock<BTreeMap<String, Vec<PolicyRule>>>,
}

impl InMemoryFrameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a frame version. Re-registering an identical definition is a
    /// no-op; a different definition under an existing version is rejected.
    pub fn register_frame(&self, frame: FrameDef) -> Result<(), FrameError> {
        frame.check()?;
        let mut frames = self.frames.write();
        let versions = frames.entry(frame.name.clone()).or_default();
        if let Some(existing) = versions.get(&frame.version) {
            if **existing == frame {
                return Ok(());
            }
            return Err(FrameError::InvalidDefinition {
                name: frame.name.clone(),
                message: format!("version {} is already registered", frame.version),
            });
        }
        debug!(frame = %frame.name, version = frame.version, "Registered frame");
        versions.insert(frame.version, Arc::new(frame));
        Ok(())
    }

    pub fn register_policy(&self, name: impl Into<String>, rules: Vec<PolicyRule>) {
        self.policies.write().insert(name.into(), rules);
    }

    /// Load every `*.toml` file in `dir`, in file-name order.
    pub fn load_dir(dir: &Path) -> Result<Self, FrameError> {
        let registry = Self::new();
        let read_err = |message: String| FrameError::InvalidDefinition {
            name: dir.display().to_string(),
            message,
        };
        let mut paths: Vec<_> = fs::read_dir(dir)
            .map_err(|e| read_err(format!("cannot read frames directory: {}", e)))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().map_or(false, |ext| ext == "toml"))
            .collect();
        paths.sort();

        for path in &paths {
            let raw = fs::read_to_string(path)
                .map_err(|e| read_err(format!("cannot read {}: {}", path.display(), e)))?;
            let file: FrameFile = toml::from_str(&raw)
                .map_err(|e| read_err(format!("cannot parse {}: {}", path.display(), e)))?;
            for frame in file.frames {
                registry.register_frame(frame)?;
            }
            for (name, rules) in file.policies {
                registry.register_policy(name, rules);
            }
        }
        info!(
            dir = %dir.display(),
            files = paths.len(),
            frames = registry.frames.read().len(),
            "Loaded frame registry"
        );
        Ok(registry)
    }
}

impl FrameRegistry for InMemoryFrameRegistry {
    fn get_frame(&self, name: &str, version: Option<u32>) -> Result<Arc<FrameDef>, FrameError> {
        let frames = self.frames.read();
        let versions = frames.get(name);
        let found = match version {
            Some(v) => versions.and_then(|vs| vs.get(&v)),
            None => versions.and_then(|vs| vs.values().next_back()),
        };
        found.cloned().ok_or_else(|| FrameError::UnknownFrame {
            name: name.to_string(),
            version,
        })
    }

    fn get_policy(&self, name: &str) -> Option<Vec<PolicyRule>> {
        self.policies.read().get(name).cloned()
    }
}
