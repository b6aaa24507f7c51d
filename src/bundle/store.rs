//! Bundle store: validated ingestion into the arena, with optional sled persistence.

use crate::bundle::content::verify_inline;
use crate::bundle::{BundleArena, ContextBundle, SledBundleStore};
use crate::error::{FrameError, IngestError};
use crate::frame::{validate, FrameRegistry};
use crate::types::BundleId;
use parking_lot::RwLock;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Readers take an `Arc` snapshot of the arena; ingestion copies on write only
/// while a snapshot is outstanding.
pub struct BundleStore {
    arena: RwLock<Arc<BundleArena>>,
    persistence: Option<SledBundleStore>,
}

impl BundleStore {
    pub fn in_memory() -> Self {
        BundleStore {
            arena: RwLock::new(Arc::new(BundleArena::new())),
            persistence: None,
        }
    }

    /// Open a sled-backed store and load every persisted bundle into the arena.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IngestError> {
        let persistence = SledBundleStore::new(path.as_ref())?;
        let mut arena = BundleArena::new();
        for bundle in persistence.list_all()? {
            arena.insert(bundle)?;
        }
        info!(path = %path.as_ref().display(), bundles = arena.len(), "Opened bundle store");
        Ok(BundleStore {
            arena: RwLock::new(Arc::new(arena)),
            persistence: Some(persistence),
        })
    }

    /// Validate `bundle` against its frame and admit it.
    ///
    /// The frame version used is written into `bundle.frame.version`, so later
    /// frame revisions never change what this bundle was validated against.
    pub fn ingest(
        &self,
        bundle: ContextBundle,
        registry: &dyn FrameRegistry,
    ) -> Result<BundleId, IngestError> {
        let frame = registry.get_frame(&bundle.frame.name, bundle.frame.version)?;
        verify_inline(&bundle)?;

        let mut valid = validate(&bundle, &frame)?.bundle;
        valid.frame.version = Some(frame.version);
        valid.semantics = valid.semantics.normalized();

        let mut guard = self.arena.write();
        if guard.contains(&valid.id) {
            warn!(bundle_id = %valid.id, "Rejected duplicate bundle id");
            return Err(FrameError::DuplicateBundle(valid.id).into());
        }
        if let Some(persistence) = &self.persistence {
            persistence.put(&valid)?;
        }
        let stored = Arc::make_mut(&mut guard).insert(valid)?;
        debug!(
            bundle_id = %stored.id,
            frame = %stored.frame.name,
            frame_version = frame.version,
            "Ingested bundle"
        );
        Ok(stored.id.clone())
    }

    pub fn get(&self, id: &BundleId) -> Option<Arc<ContextBundle>> {
        self.arena.read().get(id)
    }

    /// Consistent view over everything ingested so far.
    pub fn snapshot(&self) -> Arc<BundleArena> {
        Arc::clone(&self.arena.read())
    }

    pub fn len(&self) -> usize {
        self.arena.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.read().is_empty()
    }

    /// Provenance validation pass over everything ingested so far.
    pub fn validate_provenance(&self) -> Result<(), FrameError> {
        let arena = self.snapshot();
        let missing = arena.missing_parents();
        if !missing.is_empty() {
            debug!(orphans = missing.len(), "Bundles reference parents not yet ingested");
        }
        arena.check_acyclic()
    }

    pub fn flush(&self) -> Result<(), IngestError> {
        if let Some(persistence) = &self.persistence {
            persistence.flush()?;
        }
        Ok(())
    }
}
