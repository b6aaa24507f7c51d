//! Event signatures.
//!
//! ed25519 over the canonical JSON of every field except `sig`. serde_json
//! maps are key-sorted, so the byte form is stable across processes.

use crate::error::LedgerError;
use crate::ledger::{EventType, LineageEvent};
use crate::types::{BundleId, EventId};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Every signed field, declared in sorted key order.
#[derive(Serialize)]
struct Unsigned<'a> {
    at: &'a DateTime<Utc>,
    by: &'a str,
    event_id: &'a EventId,
    object: &'a BundleId,
    payload: &'a Value,
    refs: &'a [BundleId],
    #[serde(rename = "type")]
    kind: EventType,
}

/// Bytes covered by the signature.
pub fn signing_bytes(event: &LineageEvent) -> Result<Vec<u8>, LedgerError> {
    let unsigned = Unsigned {
        at: &event.at,
        by: &event.by,
        event_id: &event.event_id,
        object: &event.object,
        payload: &event.payload,
        refs: &event.refs,
        kind: event.kind,
    };
    serde_json::to_vec(&unsigned).map_err(|e| LedgerError::MalformedEvent {
        event_id: event.event_id.clone(),
        reason: format!("cannot encode for signing: {}", e),
    })
}

/// Sign `event` in place.
pub fn sign_event(event: &mut LineageEvent, key: &SigningKey) -> Result<(), LedgerError> {
    let signature = key.sign(&signing_bytes(event)?);
    event.sig = hex::encode(signature.to_bytes());
    Ok(())
}

fn decode_signature(sig: &str) -> Option<Signature> {
    let bytes = hex::decode(sig).ok()?;
    let bytes: [u8; 64] = bytes.as_slice().try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

/// Signer identity -> verifying key.
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: RwLock<BTreeMap<String, VerifyingKey>>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, signer: impl Into<String>, key: VerifyingKey) {
        self.keys.write().insert(signer.into(), key);
    }

    /// Register a hex-encoded 32-byte public key.
    pub fn insert_hex(&self, signer: impl Into<String>, public_key: &str) -> Result<(), LedgerError> {
        let signer = signer.into();
        let invalid = || LedgerError::Persistence(format!("invalid public key for {}", signer));
        let bytes = hex::decode(public_key).map_err(|_| invalid())?;
        let bytes: [u8; 32] = bytes.as_slice().try_into().map_err(|_| invalid())?;
        let key = VerifyingKey::from_bytes(&bytes).map_err(|_| invalid())?;
        self.insert(signer, key);
        Ok(())
    }

    pub fn contains(&self, signer: &str) -> bool {
        self.keys.read().contains_key(signer)
    }

    /// Verify `event.sig` against the signer's key. Unknown signers fail.
    pub fn verify(&self, event: &LineageEvent) -> Result<(), LedgerError> {
        let invalid = || LedgerError::InvalidSignature {
            event_id: event.event_id.clone(),
            signer: event.by.clone(),
        };
        let key = self.keys.read().get(&event.by).copied().ok_or_else(invalid)?;
        let signature = decode_signature(&event.sig).ok_or_else(invalid)?;
        key.verify(&signing_bytes(event)?, &signature)
            .map_err(|_| invalid())
    }
}
