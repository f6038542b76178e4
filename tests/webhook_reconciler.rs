/// Document provider webhook reconciliation over the in-memory store.
mod common;

use common::{submission, Harness, StubTransport};
use rust_whitelist_api::analytics_client::{AnalyticsCommand, EVENT_CHECK_UPDATE};
use rust_whitelist_api::errors::AppError;
use rust_whitelist_api::events::Resource;
use rust_whitelist_api::store::Store;
use serde_json::{json, Value};

const CHECK_HREF: &str = "/v2/applicants/applicant-1/checks/check-1";

fn webhook(resource_type: &str, href: &str) -> Value {
    json!({
        "payload": {
            "resource_type": resource_type,
            "action": "check.completed",
            "object": {
                "id": "check-1",
                "status": "complete",
                "completed_at": "2017-11-21 10:00:00 UTC",
                "href": href
            }
        }
    })
}

fn identify_count(commands: &[AnalyticsCommand]) -> usize {
    commands
        .iter()
        .filter(|c| matches!(c, AnalyticsCommand::Identify { .. }))
        .count()
}

#[tokio::test]
async fn test_redelivered_completion_is_applied_once() {
    let mut h = Harness::new(StubTransport::disabled());
    let (user, _) = h
        .service
        .submit_info(submission("AU"), None, None)
        .await
        .unwrap();

    // Check created for the user, still running.
    let started = h.reconciler.start_check(user.id).await.unwrap();
    assert_eq!(started.id, "check-applicant-1");
    assert_eq!(
        h.store.get_user(user.id).await.unwrap().onfido_id.as_deref(),
        Some("applicant-1")
    );

    h.onfido.serve(
        CHECK_HREF,
        json!({
            "id": "check-applicant-1",
            "status": "complete",
            "result": "clear",
            "reports": [{"id": "report-1"}]
        }),
    );
    h.drain_analytics();

    let body = webhook("check", CHECK_HREF);
    let first = h.reconciler.apply_webhook(&body).await.unwrap();
    assert!(matches!(first, Resource::Check(ref c) if c.user_id == Some(user.id)));
    let after_first = h.drain_analytics();
    assert_eq!(identify_count(&after_first), 1);
    assert!(after_first.iter().any(|c| matches!(
        c,
        AnalyticsCommand::Event { name, .. } if name == EVENT_CHECK_UPDATE
    )));

    let check_before = h.store.get_check("check-applicant-1").await.unwrap();
    h.reconciler.apply_webhook(&body).await.unwrap();
    let after_second = h.drain_analytics();
    // Redelivery re-mirrors the check but does not report the status again.
    assert_eq!(identify_count(&after_second), 0);

    assert_eq!(h.store.get_check("check-applicant-1").await.unwrap(), check_before);
    assert_eq!(h.store.check_count(), 1);
    assert_eq!(h.store.webhooks().len(), 2);
    assert_eq!(h.onfido.fetches(), 2);

    let user = h.store.get_user(user.id).await.unwrap();
    assert_eq!(user.onfido_status.as_deref(), Some("clear"));
    assert_eq!(
        h.service
            .whitelist_status_for_address(user.eth_address.as_deref().unwrap())
            .await
            .unwrap(),
        "approved"
    );
}

#[tokio::test]
async fn test_unknown_resource_type_is_rejected_after_storing() {
    let h = Harness::new(StubTransport::disabled());

    let result = h
        .reconciler
        .apply_webhook(&webhook("applicant", CHECK_HREF))
        .await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
    assert_eq!(h.store.webhooks().len(), 1);
    assert_eq!(h.onfido.fetches(), 0);
}

#[tokio::test]
async fn test_body_without_payload_is_rejected() {
    let h = Harness::new(StubTransport::disabled());

    let result = h.reconciler.apply_webhook(&json!({"event": "x"})).await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
    assert!(h.store.webhooks().is_empty());
}

#[tokio::test]
async fn test_unowned_check_is_mirrored_without_user_update() {
    let h = Harness::new(StubTransport::disabled());
    h.onfido.serve(
        CHECK_HREF,
        json!({"id": "orphan", "status": "complete", "result": "consider"}),
    );

    let resource = h
        .reconciler
        .apply_webhook(&webhook("check", CHECK_HREF))
        .await
        .unwrap();
    assert_eq!(resource.id(), "orphan");
    assert_eq!(resource.user_id(), None);
    assert_eq!(h.store.check_count(), 1);
}

#[tokio::test]
async fn test_report_webhook_is_mirrored() {
    let h = Harness::new(StubTransport::disabled());
    h.onfido.serve(
        "/v2/checks/check-1/reports/report-1",
        json!({"id": "report-1", "name": "document", "status": "complete", "result": "clear"}),
    );

    let resource = h
        .reconciler
        .apply_webhook(&webhook("report", "/v2/checks/check-1/reports/report-1"))
        .await
        .unwrap();
    assert!(matches!(resource, Resource::Report(ref r) if r.name.as_deref() == Some("document")));
    assert_eq!(h.store.report_count(), 1);
}

#[tokio::test]
async fn test_fetch_failure_is_an_external_error() {
    let h = Harness::new(StubTransport::disabled());

    let result = h
        .reconciler
        .apply_webhook(&webhook("check", "/v2/missing"))
        .await;
    assert!(matches!(result, Err(AppError::ExternalApiError(_))));
}

#[tokio::test]
async fn test_completion_before_owner_is_applied_once_owned() {
    let mut h = Harness::new(StubTransport::disabled());
    let (user, _) = h
        .service
        .submit_info(submission("AU"), None, None)
        .await
        .unwrap();
    h.onfido.serve(
        CHECK_HREF,
        json!({"id": "check-applicant-1", "status": "complete", "result": "clear"}),
    );
    let body = webhook("check", CHECK_HREF);

    // Completion arrives before the check is linked to anyone.
    let early = h.reconciler.apply_webhook(&body).await.unwrap();
    assert_eq!(early.user_id(), None);
    assert_eq!(h.store.get_user(user.id).await.unwrap().onfido_status, None);

    h.reconciler.start_check(user.id).await.unwrap();
    h.drain_analytics();

    // Redelivery now finds the owner and copies the result across.
    let owned = h.reconciler.apply_webhook(&body).await.unwrap();
    assert_eq!(owned.user_id(), Some(user.id));
    assert_eq!(identify_count(&h.drain_analytics()), 1);
    assert_eq!(
        h.store.get_user(user.id).await.unwrap().onfido_status.as_deref(),
        Some("clear")
    );

    h.reconciler.apply_webhook(&body).await.unwrap();
    assert_eq!(identify_count(&h.drain_analytics()), 0);
}
