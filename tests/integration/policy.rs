//! Policy membrane behavior through the full request path.

use crate::integration::test_utils::World;
use chrono::{Duration, Utc};
use context_broker::bundle::{ContextBundle, Origin};
use context_broker::evidence::Channel;
use context_broker::explain::ExplainKind;
use context_broker::frame::FrameDef;
use context_broker::policy::{Condition, PolicyRule, PolicyView};
use context_broker::{BundleId, CancelHandle, ContextBroker, QueryRequest, QueryResponse, Requester};
use serde_json::json;

fn memo(id: &str, email: Option<&str>) -> ContextBundle {
    let mut content = json!({"topic": "budget", "body": "Q3 numbers"});
    if let Some(email) = email {
        content["source"] = json!({"email": email, "name": "Dana"});
    }
    ContextBundle::inline("memo", content)
        .with_id(id)
        .with_origin(Origin::from_domain("intranet.example"))
}

/// World with a `memo` frame whose registry policy masks the source email
/// for analysts and shows everything to auditors.
fn memo_world() -> World {
    let world = World::new();
    world.registry.register_frame(FrameDef::new("memo", 1)).unwrap();
    world.registry.register_policy(
        "memo",
        vec![
            PolicyRule::for_roles(["analyst"]).with_cond(Condition::MaskField {
                field: "source.email".to_string(),
            }),
            PolicyRule::for_roles(["auditor"]),
        ],
    );
    world
}

fn memos() -> QueryRequest {
    QueryRequest::new("budget")
        .with_frame("memo")
        .with_filter("content.topic", json!("budget"))
        .with_evidence(&[Channel::Symbolic])
}

async fn ask(broker: &ContextBroker, request: QueryRequest, requester: &Requester) -> QueryResponse {
    broker
        .query(request, requester, &CancelHandle::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_mask_field_redacts_for_analyst() {
    let world = memo_world();
    let m1 = world.ingest(memo("m-1", Some("dana@intranet.example")));
    let m2 = world.ingest(memo("m-2", None));
    let broker = world.broker();

    let response = ask(&broker, memos(), &Requester::new("ana").with_role("analyst")).await;
    assert_eq!(response.rows.len(), 2);

    let row = response.row(&m1).unwrap();
    assert_eq!(row.content.as_ref().unwrap()["source"]["email"], json!("***"));
    assert_eq!(row.content.as_ref().unwrap()["source"]["name"], json!("Dana"));
    assert_eq!(row.redacted_fields, vec!["source.email".to_string()]);
    assert!(response.row(&m2).unwrap().redacted_fields.is_empty());
    assert_eq!(response.telemetry.redaction_rate, 0.5);

    let entry = response.explain_for(&m1).unwrap();
    assert!(entry
        .why
        .contains(&"policy: redacted source.email by memo/read".to_string()));
    assert_eq!(entry.policy_class.as_deref(), Some("memo/read"));
    let entry = response.explain_for(&m2).unwrap();
    assert!(entry.why.contains(&"policy: allowed by memo/read".to_string()));

    let body = serde_json::to_string(&response).unwrap();
    assert!(!body.contains("dana@intranet.example"));
}

#[tokio::test]
async fn test_auditor_rule_leaves_content_intact() {
    let world = memo_world();
    let m1 = world.ingest(memo("m-1", Some("dana@intranet.example")));

    let response = ask(&world.broker(), memos(), &Requester::new("aud").with_role("auditor")).await;
    let row = response.row(&m1).unwrap();
    assert_eq!(
        row.content.as_ref().unwrap()["source"]["email"],
        json!("dana@intranet.example")
    );
    assert_eq!(response.telemetry.redaction_rate, 0.0);
}

#[tokio::test]
async fn test_no_matching_role_denies_every_candidate() {
    let world = memo_world();
    world.ingest(memo("m-1", Some("dana@intranet.example")));
    world.ingest(memo("m-2", None));

    let response = ask(&world.broker(), memos(), &Requester::new("eve")).await;
    assert!(response.rows.is_empty());
    assert_eq!(response.telemetry.denied, 2);
    assert_eq!(response.telemetry.redaction_rate, 1.0);
    let denials: Vec<&str> = response
        .explain
        .iter()
        .filter(|e| e.kind == ExplainKind::Denial)
        .map(|e| e.id.as_str())
        .collect();
    assert_eq!(denials, vec!["m-1", "m-2"]);
    assert_eq!(
        response.explain[0].why,
        vec!["policy: denied by memo/read (no matching rule)".to_string()]
    );
}

#[tokio::test]
async fn test_raw_view_for_admin_skips_redaction() {
    let world = memo_world();
    let m1 = world.ingest(memo("m-1", Some("dana@intranet.example")));
    let broker = world.broker();
    let request = memos().with_view(PolicyView::Raw);

    let admin = Requester::new("root").with_role("analyst").with_capability("admin");
    let response = ask(&broker, request.clone(), &admin).await;
    let row = response.row(&m1).unwrap();
    assert_eq!(
        row.content.as_ref().unwrap()["source"]["email"],
        json!("dana@intranet.example")
    );
    assert!(row.redacted_fields.is_empty());
    assert!(!response.telemetry.view_downgraded);
    assert!(response
        .explain_for(&m1)
        .unwrap()
        .why
        .contains(&"policy: raw view under memo/read".to_string()));

    // Raw view still needs a matching read rule.
    let roleless_admin = Requester::new("root").with_capability("admin");
    let response = ask(&broker, request.clone(), &roleless_admin).await;
    assert!(response.rows.is_empty());
    assert_eq!(response.telemetry.denied, 1);

    // Without the capability the request is served as effective.
    let analyst = Requester::new("ana").with_role("analyst");
    let response = ask(&broker, request, &analyst).await;
    assert!(response.telemetry.view_downgraded);
    assert_eq!(
        response.row(&m1).unwrap().content.as_ref().unwrap()["source"]["email"],
        json!("***")
    );
}

#[tokio::test]
async fn test_expired_bundle_is_denied() {
    let world = memo_world();
    let mut expired = memo("m-old", None);
    expired.policy.expires_at = Some(Utc::now() - Duration::hours(1));
    world.ingest(expired);
    let mut current = memo("m-new", None);
    current.policy.expires_at = Some(Utc::now() + Duration::days(30));
    world.ingest(current);

    let response = ask(&world.broker(), memos(), &Requester::new("aud").with_role("auditor")).await;
    let ids: Vec<&str> = response.rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["m-new"]);
    let entry = response.explain_for(&BundleId::from("m-old")).unwrap();
    assert_eq!(entry.kind, ExplainKind::Denial);
    assert_eq!(entry.why, vec!["policy: denied by expiry (expired)".to_string()]);
}

#[tokio::test]
async fn test_purpose_tags_gate_access() {
    let world = memo_world();
    let mut tagged = memo("m-1", None);
    tagged.policy.purposes = vec!["research".to_string()];
    let id = world.ingest(tagged);
    let broker = world.broker();

    let response = ask(&broker, memos(), &Requester::new("aud").with_role("auditor")).await;
    assert!(response.rows.is_empty());
    assert_eq!(
        response.explain_for(&id).unwrap().policy_class.as_deref(),
        Some("purpose")
    );

    let researcher = Requester::new("aud")
        .with_role("auditor")
        .with_purpose("research");
    let response = ask(&broker, memos(), &researcher).await;
    assert!(response.row(&id).is_some());
}

#[tokio::test]
async fn test_bundle_read_rules_override_registry_policy() {
    let world = memo_world();
    let id = world.ingest(
        memo("m-1", Some("dana@intranet.example"))
            .with_read_rules(vec![PolicyRule::for_roles(["legal"])]),
    );
    let broker = world.broker();

    let response = ask(&broker, memos(), &Requester::new("ana").with_role("analyst")).await;
    assert!(response.rows.is_empty());

    let response = ask(&broker, memos(), &Requester::new("lee").with_role("legal")).await;
    assert_eq!(
        response.row(&id).unwrap().content.as_ref().unwrap()["source"]["email"],
        json!("dana@intranet.example")
    );
}
