//! Ledger state and the single-writer append path.
//!
//! Every snapshot is a watermark over one shared, append-only `LedgerLog`.
//! The writer extends the log under the writer mutex and then publishes a new
//! watermark by swapping an `Arc`, so an append costs the same however long
//! the log is. Entries past a snapshot's watermark stay invisible to it, so a
//! request keeps a stable provenance view for its whole lifetime.

use crate::error::LedgerError;
use crate::ledger::{parse_event_id, KeyRing, LineageEvent, NdjsonLedgerFile};
use crate::types::{BundleId, EventId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Append-only state shared by every snapshot of one ledger.
#[derive(Debug, Default)]
struct LedgerLog {
    /// Append order.
    events: Vec<Arc<LineageEvent>>,
    /// `(event_id, sig)` -> position.
    keys: HashMap<(EventId, String), usize>,
    /// Object or ref id -> event positions, ascending.
    by_object: HashMap<BundleId, Vec<usize>>,
    /// Event id -> positions, ascending. Re-signed events share an id.
    positions: HashMap<EventId, Vec<usize>>,
    /// Event objects plus externally registered ids, with the version at
    /// which each became known.
    known_objects: HashMap<BundleId, u64>,
    /// Bumped by every push and registration.
    version: u64,
}

impl LedgerLog {
    fn push(&mut self, event: LineageEvent) {
        self.version += 1;
        let position = self.events.len();
        self.keys.insert(event.key(), position);
        self.known_objects
            .entry(event.object.clone())
            .or_insert(self.version);
        self.positions
            .entry(event.event_id.clone())
            .or_default()
            .push(position);
        let mut touched: Vec<&BundleId> = std::iter::once(&event.object).chain(&event.refs).collect();
        touched.sort();
        touched.dedup();
        for id in touched {
            self.by_object.entry(id.clone()).or_default().push(position);
        }
        self.events.push(Arc::new(event));
    }

    fn register(&mut self, id: BundleId) {
        self.version += 1;
        self.known_objects.entry(id).or_insert(self.version);
    }
}

/// Immutable ledger view.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    log: Arc<RwLock<LedgerLog>>,
    /// Visible events: `log.events[..len]`.
    len: usize,
    /// Visible registrations: those stamped at or below this version.
    version: u64,
}

impl LedgerSnapshot {
    fn at_head(log: &Arc<RwLock<LedgerLog>>) -> Self {
        let head = log.read();
        LedgerSnapshot {
            log: Arc::clone(log),
            len: head.events.len(),
            version: head.version,
        }
    }

    fn knows(&self, log: &LedgerLog, id: &BundleId) -> bool {
        log.known_objects
            .get(id)
            .map_or(false, |&stamp| stamp <= self.version)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, event: &LineageEvent) -> bool {
        self.log
            .read()
            .keys
            .get(&event.key())
            .map_or(false, |&p| p < self.len)
    }

    /// Events whose object or refs name `id`, ordered by `(at, event_id, sig)`.
    pub fn events_for(&self, id: &BundleId) -> Vec<Arc<LineageEvent>> {
        let mut events: Vec<Arc<LineageEvent>> = {
            let log = self.log.read();
            log.by_object
                .get(id)
                .map(|positions| {
                    positions
                        .iter()
                        .take_while(|&&p| p < self.len)
                        .map(|&p| Arc::clone(&log.events[p]))
                        .collect()
                })
                .unwrap_or_default()
        };
        events.sort_by(|a, b| {
            a.at.cmp(&b.at)
                .then_with(|| a.event_id.cmp(&b.event_id))
                .then_with(|| a.sig.cmp(&b.sig))
        });
        events
    }

    pub fn is_known(&self, id: &BundleId) -> bool {
        self.knows(&self.log.read(), id)
    }

    pub fn is_pending(&self, event: &LineageEvent) -> bool {
        let log = self.log.read();
        event.refs.iter().any(|r| !self.knows(&log, r))
    }

    /// Number of events with at least one unknown ref.
    pub fn pending_count(&self) -> usize {
        let log = self.log.read();
        log.events[..self.len]
            .iter()
            .filter(|e| e.refs.iter().any(|r| !self.knows(&log, r)))
            .count()
    }

    /// Events appended after `cursor`, in append order. An unknown or absent
    /// cursor yields the whole log.
    pub fn since(&self, cursor: Option<&EventId>) -> Vec<Arc<LineageEvent>> {
        let log = self.log.read();
        let start = cursor
            .and_then(|c| log.positions.get(c))
            .and_then(|positions| positions.iter().rev().find(|&&p| p < self.len))
            .map_or(0, |&p| p + 1);
        log.events[start..self.len].to_vec()
    }

    /// Highest sequence `writer` has used, for ids of the `<writer>:<seq>` form.
    pub fn last_sequence(&self, writer: &str) -> Option<u64> {
        let log = self.log.read();
        log.events[..self.len]
            .iter()
            .filter_map(|e| parse_event_id(&e.event_id))
            .filter(|(w, _)| *w == writer)
            .map(|(_, seq)| seq)
            .max()
    }

    /// BLAKE3 over the sorted `(event_id, sig)` keys. Independent of append order.
    pub fn state_digest(&self) -> String {
        let log = self.log.read();
        let mut keys: Vec<&(EventId, String)> = log
            .keys
            .iter()
            .filter(|&(_, &p)| p < self.len)
            .map(|(key, _)| key)
            .collect();
        keys.sort();
        let mut hasher = blake3::Hasher::new();
        for (event_id, sig) in keys {
            hasher.update(event_id.as_str().as_bytes());
            hasher.update(&[0]);
            hasher.update(sig.as_bytes());
            hasher.update(b"\n");
        }
        hasher.finalize().to_hex().to_string()
    }
}

/// Outcome of a pull-based merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Accepted events that still reference unknown objects.
    pub pending: usize,
}

pub struct Ledger {
    keys: Arc<KeyRing>,
    log: Arc<RwLock<LedgerLog>>,
    current: RwLock<Arc<LedgerSnapshot>>,
    /// Single-writer critical section; owns the persistence sink.
    writer: Mutex<Option<NdjsonLedgerFile>>,
}

impl Ledger {
    /// In-memory ledger.
    pub fn new(keys: Arc<KeyRing>) -> Self {
        Self::from_log(keys, LedgerLog::default(), None)
    }

    fn from_log(keys: Arc<KeyRing>, log: LedgerLog, file: Option<NdjsonLedgerFile>) -> Self {
        let log = Arc::new(RwLock::new(log));
        let current = RwLock::new(Arc::new(LedgerSnapshot::at_head(&log)));
        Ledger {
            keys,
            log,
            current,
            writer: Mutex::new(file),
        }
    }

    /// Open an NDJSON-backed ledger, replaying and re-verifying every record.
    pub fn open<P: AsRef<Path>>(path: P, keys: Arc<KeyRing>) -> Result<Self, LedgerError> {
        let (file, records) = NdjsonLedgerFile::open(path.as_ref())?;
        let mut log = LedgerLog::default();
        for (line, event) in records {
            event.check_well_formed()?;
            keys.verify(&event).map_err(|e| {
                LedgerError::Persistence(format!("line {} of {}: {}", line, file.path().display(), e))
            })?;
            if !log.keys.contains_key(&event.key()) {
                log.push(event);
            }
        }
        info!(path = %file.path().display(), events = log.events.len(), "Replayed ledger");
        Ok(Self::from_log(keys, log, Some(file)))
    }

    pub fn keys(&self) -> &KeyRing {
        &self.keys
    }

    /// Current consistent view. Never blocks on appends.
    pub fn snapshot(&self) -> Arc<LedgerSnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Expose everything in the log. Caller holds the writer mutex.
    fn publish(&self) {
        let head = Arc::new(LedgerSnapshot::at_head(&self.log));
        *self.current.write() = head;
    }

    fn admit(&self, event: &LineageEvent) -> Result<(), LedgerError> {
        event.check_well_formed()?;
        self.keys.verify(event)
    }

    /// Verify and append one event. Re-appending an existing `(event_id, sig)`
    /// is a successful no-op.
    pub fn append(&self, event: LineageEvent) -> Result<EventId, LedgerError> {
        if let Err(e) = self.admit(&event) {
            warn!(event_id = %event.event_id, signer = %event.by, error = %e, "Rejected ledger event");
            return Err(e);
        }
        let event_id = event.event_id.clone();

        let mut writer = self.writer.lock();
        let current = self.snapshot();
        if current.contains(&event) {
            debug!(event_id = %event_id, "Event already present");
            return Ok(event_id);
        }
        if let Some(file) = writer.as_mut() {
            file.append(std::slice::from_ref(&event))?;
        }
        self.log.write().push(event);
        self.publish();
        debug!(event_id = %event_id, "Appended ledger event");
        Ok(event_id)
    }

    /// Merge events from a peer. Invalid events are counted and skipped;
    /// only a persistence failure aborts the merge.
    pub fn merge<I>(&self, remote: I) -> Result<MergeReport, LedgerError>
    where
        I: IntoIterator<Item = LineageEvent>,
    {
        let mut report = MergeReport::default();
        let mut admitted = Vec::new();
        for event in remote {
            match self.admit(&event) {
                Ok(()) => admitted.push(event),
                Err(e) => {
                    warn!(event_id = %event.event_id, error = %e, "Skipped remote event");
                    report.rejected += 1;
                }
            }
        }

        let mut writer = self.writer.lock();
        let current = self.snapshot();
        let mut batch: HashSet<(EventId, String)> = HashSet::new();
        let mut fresh = Vec::new();
        for event in admitted {
            if current.contains(&event) || !batch.insert(event.key()) {
                report.duplicates += 1;
                continue;
            }
            fresh.push(event);
        }
        if !fresh.is_empty() {
            if let Some(file) = writer.as_mut() {
                file.append(&fresh)?;
            }
            let mut log = self.log.write();
            for event in &fresh {
                log.push(event.clone());
            }
            drop(log);
            self.publish();
        }
        let next = self.snapshot();
        report.accepted = fresh.len();
        report.pending = fresh.iter().filter(|e| next.is_pending(e)).count();
        info!(
            accepted = report.accepted,
            duplicates = report.duplicates,
            rejected = report.rejected,
            pending = report.pending,
            "Merged remote events"
        );
        Ok(report)
    }

    /// Mark an object as known (e.g. a bundle ingested outside the ledger), so
    /// refs to it stop counting as pending.
    pub fn register_object(&self, id: BundleId) {
        let _writer = self.writer.lock();
        let current = self.snapshot();
        if current.is_known(&id) {
            return;
        }
        self.log.write().register(id);
        self.publish();
    }

    pub fn events_for(&self, id: &BundleId) -> Vec<Arc<LineageEvent>> {
        self.snapshot().events_for(id)
    }

    pub fn since(&self, cursor: Option<&EventId>) -> Vec<Arc<LineageEvent>> {
        self.snapshot().since(cursor)
    }

    pub fn state_digest(&self) -> String {
        self.snapshot().state_digest()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }
}
