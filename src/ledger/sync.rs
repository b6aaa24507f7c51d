//! Pull-based ledger sync.
//!
//! A peer serves `GET {base}/events?since=<event_id>` as NDJSON (see
//! [`export_since`]); [`RemoteLedgerClient`] pulls from it and merges.

use crate::error::LedgerError;
use crate::ledger::persistence::{parse_ndjson, to_ndjson};
use crate::ledger::{Ledger, MergeReport};
use crate::types::EventId;
use parking_lot::Mutex;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

const SYNC_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SYNC_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Body for the sync endpoint: events after `cursor`, as NDJSON.
pub fn export_since(ledger: &Ledger, cursor: Option<&EventId>) -> String {
    let events = ledger.since(cursor);
    to_ndjson(events.iter().map(|e| e.as_ref()))
}

fn map_http_error(error: reqwest::Error) -> LedgerError {
    if error.is_timeout() {
        LedgerError::Sync(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        LedgerError::Sync(format!("Connection error: {}", error))
    } else if let Some(status) = error.status() {
        LedgerError::Sync(format!("Peer returned {}: {}", status, error))
    } else {
        LedgerError::Sync(format!("HTTP error: {}", error))
    }
}

pub struct RemoteLedgerClient {
    client: Client,
    base_url: String,
    /// Last event id pulled from this peer.
    cursor: Mutex<Option<EventId>>,
}

impl RemoteLedgerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .no_proxy()
            .connect_timeout(SYNC_CONNECT_TIMEOUT)
            .timeout(SYNC_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LedgerError::Sync(format!("Failed to create HTTP client: {}", e)))?;
        Ok(RemoteLedgerClient {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cursor: Mutex::new(None),
        })
    }

    pub fn cursor(&self) -> Option<EventId> {
        self.cursor.lock().clone()
    }

    /// Fetch events newer than the remembered cursor, merge them into `ledger`,
    /// and advance the cursor to the last event received.
    pub async fn pull(&self, ledger: &Ledger) -> Result<MergeReport, LedgerError> {
        let url = format!("{}/events", self.base_url);
        let mut request = self.client.get(&url);
        if let Some(cursor) = self.cursor() {
            request = request.query(&[("since", cursor.as_str())]);
        }
        debug!(url = %url, cursor = ?self.cursor(), "Pulling ledger events");

        let body = request
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(map_http_error)?
            .text()
            .await
            .map_err(map_http_error)?;
        let events = parse_ndjson(&body)?;
        let last = events.last().map(|e| e.event_id.clone());

        let report = ledger.merge(events)?;
        if let Some(last) = last {
            *self.cursor.lock() = Some(last);
        }
        info!(peer = %self.base_url, accepted = report.accepted, "Ledger sync complete");
        Ok(report)
    }
}
