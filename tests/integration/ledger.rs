//! Ledger persistence, merge, and pull-sync behavior.

use crate::integration::test_utils::{key_ring, signing_key};
use chrono::{TimeZone, Utc};
use context_broker::error::LedgerError;
use context_broker::ledger::sync::{export_since, RemoteLedgerClient};
use context_broker::ledger::{sign_event, EventType};
use context_broker::{BundleId, EventId, Ledger, LineageEvent};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn signed(writer: u8, seq: u64, kind: EventType, object: &str, refs: &[&str]) -> LineageEvent {
    let by = format!("writer-{}", writer);
    let at = Utc.timestamp_opt(1_700_000_000 + seq as i64, 0).unwrap();
    let mut event = LineageEvent::new(
        EventId::for_writer(&by, seq),
        kind,
        BundleId::from(object),
        by,
        at,
    )
    .with_refs(refs.iter().map(|r| BundleId::from(*r)).collect());
    sign_event(&mut event, &signing_key(writer)).unwrap();
    event
}

#[test]
fn test_ledger_replays_after_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ledger.ndjson");

    let digest = {
        let ledger = Ledger::open(&path, key_ring()).unwrap();
        ledger.append(signed(1, 1, EventType::Created, "c-1", &[])).unwrap();
        ledger
            .append(signed(1, 2, EventType::DerivedFrom, "c-2", &["c-1"]))
            .unwrap();
        ledger.state_digest()
    };

    let reopened = Ledger::open(&path, key_ring()).unwrap();
    assert_eq!(reopened.len(), 2);
    assert_eq!(reopened.state_digest(), digest);
    assert_eq!(reopened.events_for(&BundleId::from("c-1")).len(), 2);
}

#[test]
fn test_tampered_file_fails_replay() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ledger.ndjson");
    {
        let ledger = Ledger::open(&path, key_ring()).unwrap();
        ledger.append(signed(1, 1, EventType::Created, "c-1", &[])).unwrap();
    }
    let raw = std::fs::read_to_string(&path).unwrap();
    std::fs::write(&path, raw.replace("c-1", "c-9")).unwrap();

    assert!(matches!(
        Ledger::open(&path, key_ring()),
        Err(LedgerError::Persistence(_))
    ));
}

#[test]
fn test_interrupted_append_leaves_ledger_openable() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("ledger.ndjson");
    {
        let ledger = Ledger::open(&path, key_ring()).unwrap();
        ledger.append(signed(1, 1, EventType::Created, "c-1", &[])).unwrap();
        ledger.append(signed(1, 2, EventType::Created, "c-2", &[])).unwrap();
    }
    let torn = serde_json::to_string(&signed(1, 3, EventType::Created, "c-3", &[])).unwrap();
    let mut raw = std::fs::read(&path).unwrap();
    raw.extend_from_slice(&torn.as_bytes()[..torn.len() - 7]);
    std::fs::write(&path, raw).unwrap();

    let ledger = Ledger::open(&path, key_ring()).unwrap();
    assert_eq!(ledger.len(), 2);
    ledger.append(signed(1, 3, EventType::Created, "c-3", &[])).unwrap();
    drop(ledger);

    let reopened = Ledger::open(&path, key_ring()).unwrap();
    assert_eq!(reopened.len(), 3);
}

#[test]
fn test_merge_is_idempotent_and_order_independent() {
    let events = vec![
        signed(1, 1, EventType::Created, "c-1", &[]),
        signed(2, 1, EventType::AttestedBy, "c-1", &["s-1"]),
        signed(3, 1, EventType::LinkedTo, "c-1", &["c-2"]),
    ];

    let forward = Ledger::new(key_ring());
    let first = forward.merge(events.clone()).unwrap();
    assert_eq!(first.accepted, 3);
    let digest = forward.state_digest();

    let again = forward.merge(events.clone()).unwrap();
    assert_eq!(again.accepted, 0);
    assert_eq!(again.duplicates, 3);
    assert_eq!(forward.state_digest(), digest);

    let backward = Ledger::new(key_ring());
    backward.merge(events.into_iter().rev()).unwrap();
    assert_eq!(backward.state_digest(), digest);
}

#[test]
fn test_invalid_signature_rejected() {
    let ledger = Ledger::new(key_ring());
    let mut forged = signed(1, 1, EventType::Created, "c-1", &[]);
    forged.object = BundleId::from("c-2");

    assert!(matches!(
        ledger.append(forged.clone()),
        Err(LedgerError::InvalidSignature { .. })
    ));
    let report = ledger
        .merge(vec![forged, signed(2, 1, EventType::Created, "c-3", &[])])
        .unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.accepted, 1);
    assert_eq!(ledger.len(), 1);
}

#[test]
fn test_unknown_signer_rejected() {
    let ledger = Ledger::new(key_ring());
    let event = signed(7, 1, EventType::Created, "c-1", &[]);
    assert!(ledger.append(event).is_err());
    assert!(ledger.is_empty());
}

#[test]
fn test_pending_refs_clear_when_object_arrives() {
    let ledger = Ledger::new(key_ring());
    ledger.register_object(BundleId::from("c-1"));

    let report = ledger
        .merge(vec![signed(2, 1, EventType::AttestedBy, "c-1", &["s-late"])])
        .unwrap();
    assert_eq!(report.pending, 1);
    assert_eq!(ledger.snapshot().pending_count(), 1);

    ledger.register_object(BundleId::from("s-late"));
    assert_eq!(ledger.snapshot().pending_count(), 0);
}

#[test]
fn test_snapshot_is_stable_across_appends() {
    let ledger = Ledger::new(key_ring());
    ledger.append(signed(1, 1, EventType::Created, "c-1", &[])).unwrap();
    let before = ledger.snapshot();
    ledger.append(signed(1, 2, EventType::Created, "c-2", &[])).unwrap();
    assert_eq!(before.len(), 1);
    assert_eq!(ledger.len(), 2);
}

/// Serve `GET /events?since=` from `peer` on an ephemeral port.
async fn serve(peer: Arc<Ledger>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let head = String::from_utf8_lossy(&request);
            let target = head.split_whitespace().nth(1).unwrap_or("/").to_string();
            let url = reqwest::Url::parse(&format!("http://peer{}", target)).unwrap();
            let cursor = url
                .query_pairs()
                .find(|(k, _)| k == "since")
                .map(|(_, v)| EventId::new(v.into_owned()));

            let body = export_since(&peer, cursor.as_ref());
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/x-ndjson\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        }
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_pull_sync_merges_and_advances_cursor() {
    let peer = Arc::new(Ledger::new(key_ring()));
    peer.append(signed(2, 1, EventType::Created, "c-1", &[])).unwrap();
    peer.append(signed(2, 2, EventType::DerivedFrom, "c-2", &["c-1"]))
        .unwrap();

    let base = serve(Arc::clone(&peer)).await;
    let local = Ledger::new(key_ring());
    let client = RemoteLedgerClient::new(base).unwrap();

    let report = client.pull(&local).await.unwrap();
    assert_eq!(report.accepted, 2);
    assert_eq!(client.cursor(), Some(EventId::for_writer("writer-2", 2)));
    assert_eq!(local.state_digest(), peer.state_digest());

    peer.append(signed(2, 3, EventType::LinkedTo, "c-2", &["c-3"]))
        .unwrap();
    let report = client.pull(&local).await.unwrap();
    assert_eq!(report.accepted, 1);
    assert_eq!(report.duplicates, 0);
    assert_eq!(client.cursor(), Some(EventId::for_writer("writer-2", 3)));

    let report = client.pull(&local).await.unwrap();
    assert_eq!(report.accepted, 0);
    assert_eq!(local.state_digest(), peer.state_digest());
}

#[tokio::test]
async fn test_pull_from_unreachable_peer_is_sync_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = RemoteLedgerClient::new(format!("http://{}", addr)).unwrap();
    let result = client.pull(&Ledger::new(key_ring())).await;
    assert!(matches!(result, Err(LedgerError::Sync(_))));
    assert!(client.cursor().is_none());
}
