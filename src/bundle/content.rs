//! Content dereferencing with integrity verification.
//!
//! Every dereference re-checks `refs.content_hash`. A mismatch is an
//! [`IntegrityError`], never a warning.

use crate::bundle::id::{canonical_bytes, compute_content_hash};
use crate::bundle::{BundleContent, ContextBundle};
use crate::error::IntegrityError;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

/// External location resolver for referenced content.
pub trait ContentSource: Send + Sync {
    fn fetch(&self, content_ref: &str) -> Result<Vec<u8>, String>;
}

/// In-memory content source keyed by reference string.
#[derive(Default)]
pub struct InMemoryContentSource {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryContentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, content_ref: impl Into<String>, bytes: Vec<u8>) {
        self.blobs.write().insert(content_ref.into(), bytes);
    }
}

impl ContentSource for InMemoryContentSource {
    fn fetch(&self, content_ref: &str) -> Result<Vec<u8>, String> {
        self.blobs
            .read()
            .get(content_ref)
            .cloned()
            .ok_or_else(|| format!("no content at {}", content_ref))
    }
}

/// Check inline content against `refs.content_hash` without dereferencing.
pub fn verify_inline(bundle: &ContextBundle) -> Result<(), IntegrityError> {
    match &bundle.content {
        BundleContent::Inline(value) => verify_bytes(bundle, &canonical_bytes(value)),
        BundleContent::Reference => Ok(()),
    }
}

/// Dereference bundle content and verify its hash.
///
/// Referenced bytes are parsed as JSON when possible, then as UTF-8 text.
pub fn resolve_content(
    bundle: &ContextBundle,
    source: Option<&dyn ContentSource>,
) -> Result<Value, IntegrityError> {
    match &bundle.content {
        BundleContent::Inline(value) => {
            verify_bytes(bundle, &canonical_bytes(value))?;
            Ok(value.clone())
        }
        BundleContent::Reference => {
            let content_ref =
                bundle
                    .refs
                    .content_ref
                    .as_deref()
                    .ok_or_else(|| IntegrityError::Unresolvable {
                        bundle_id: bundle.id.clone(),
                        reason: "missing refs.content_ref".to_string(),
                    })?;
            let source = source.ok_or_else(|| IntegrityError::Unresolvable {
                bundle_id: bundle.id.clone(),
                reason: "no content source configured".to_string(),
            })?;
            let bytes = source
                .fetch(content_ref)
                .map_err(|reason| IntegrityError::Unresolvable {
                    bundle_id: bundle.id.clone(),
                    reason,
                })?;
            verify_bytes(bundle, &bytes)?;
            if let Ok(value) = serde_json::from_slice::<Value>(&bytes) {
                return Ok(value);
            }
            String::from_utf8(bytes)
                .map(Value::String)
                .map_err(|_| IntegrityError::Unresolvable {
                    bundle_id: bundle.id.clone(),
                    reason: "content is neither JSON nor UTF-8".to_string(),
                })
        }
    }
}

fn verify_bytes(bundle: &ContextBundle, bytes: &[u8]) -> Result<(), IntegrityError> {
    let actual = hex::encode(compute_content_hash(bytes));
    if !actual.eq_ignore_ascii_case(&bundle.refs.content_hash) {
        return Err(IntegrityError::HashMismatch {
            bundle_id: bundle.id.clone(),
            expected: bundle.refs.content_hash.clone(),
            actual,
        });
    }
    Ok(())
}
