/// HTTP client tests against mocked provider endpoints.
use rust_whitelist_api::analytics_client::{AnalyticsCommand, CustomerIoClient};
use rust_whitelist_api::idm_client::{IdmHttpClient, IdmTransport, ProviderError};
use rust_whitelist_api::models::{NewUser, SocialHandles, User};
use rust_whitelist_api::onfido_client::{OnfidoApi, OnfidoClient};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn user() -> User {
    NewUser {
        email: "ned@example.com".into(),
        eth_address: None,
        eth_amount: None,
        telegram: None,
        first_name: "Ned".into(),
        last_name: "Flanders".into(),
        dob: None,
        phone: "+61412345678".into(),
        address: "744 Evergreen Terrace, Springfield Heights".into(),
        city: "Springfield".into(),
        state_code: None,
        zip_code: "2000".into(),
        country_code: Some("AU".into()),
        ip: None,
        ip_country: None,
        dfp: None,
        confirmed_location: true,
        socials: SocialHandles::default(),
    }
    .into_user(uuid::Uuid::new_v4(), chrono::Utc::now())
}

#[tokio::test]
async fn test_idm_submit_uses_basic_auth() {
    let mock_server = MockServer::start().await;

    // "idm:secret"
    Mock::given(method("POST"))
        .and(path("/im/account/consumer"))
        .and(header("Authorization", "Basic aWRtOnNlY3JldA=="))
        .and(body_partial_json(json!({"tid": "abc123"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"mtid": "abc123", "res": "ACCEPT"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = IdmHttpClient::new(
        format!("{}/im/account/consumer", mock_server.uri()),
        Some("idm".into()),
        Some("secret".into()),
    )
    .unwrap();
    assert!(client.is_enabled());

    let reply = client.submit(&json!({"tid": "abc123"})).await.unwrap();
    assert_eq!(reply["res"], "ACCEPT");
}

#[tokio::test]
async fn test_idm_non_200_is_status_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&mock_server)
        .await;

    let client =
        IdmHttpClient::new(mock_server.uri(), Some("idm".into()), Some("secret".into())).unwrap();
    let err = client.submit(&json!({})).await.unwrap_err();
    assert_eq!(err.status_code(), Some(500));
    assert_eq!(err.detail(), "boom");
}

#[tokio::test]
async fn test_idm_unreadable_body_is_invalid_body() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&mock_server)
        .await;

    let client =
        IdmHttpClient::new(mock_server.uri(), Some("idm".into()), Some("secret".into())).unwrap();
    let err = client.submit(&json!({})).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidBody(_)));
}

#[tokio::test]
async fn test_idm_without_credentials_is_disabled() {
    let client = IdmHttpClient::new("http://127.0.0.1:9".into(), None, None).unwrap();
    assert!(!client.is_enabled());
    assert!(matches!(
        client.submit(&json!({})).await,
        Err(ProviderError::Transport(_))
    ));
}

#[tokio::test]
async fn test_onfido_fetch_resolves_href_with_token() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/checks/chk-1"))
        .and(header("Authorization", "Token token=live_abc"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"id": "chk-1", "status": "complete"})),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = OnfidoClient::new(&mock_server.uri(), Some("live_abc".into())).unwrap();
    let check = client.fetch("/v2/checks/chk-1").await.unwrap();
    assert_eq!(check["status"], "complete");
}

#[tokio::test]
async fn test_onfido_applicant_and_check_creation() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v2/applicants"))
        .and(body_partial_json(json!({
            "first_name": "Ned",
            "addresses": [{"street": "744 Evergreen Terrace, Springfie"}]
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": "app-1"})))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/applicants/app-1/checks"))
        .and(body_partial_json(json!({"type": "express"})))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(json!({"id": "chk-9", "status": "in_progress"})),
        )
        .mount(&mock_server)
        .await;

    let client = OnfidoClient::new(&mock_server.uri(), Some("live_abc".into())).unwrap();
    let applicant = client.create_applicant(&user()).await.unwrap();
    assert_eq!(applicant["id"], "app-1");
    let check = client.create_check("app-1").await.unwrap();
    assert_eq!(check["id"], "chk-9");
}

#[tokio::test]
async fn test_customer_io_identify_and_event() {
    let mock_server = MockServer::start().await;

    // "site:key"
    Mock::given(method("PUT"))
        .and(path("/api/v1/customers/user-1"))
        .and(header("Authorization", "Basic c2l0ZTprZXk="))
        .and(body_partial_json(json!({"state": "info_verified"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/customers/user-1/events"))
        .and(body_partial_json(json!({"name": "transition", "data": {"state_now": "info_verified"}})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = CustomerIoClient::new(
        format!("{}/api/v1/customers", mock_server.uri()),
        Some("site".into()),
        Some("key".into()),
    )
    .unwrap();
    assert!(client.is_enabled());

    client
        .send(&AnalyticsCommand::Identify {
            customer_id: "user-1".into(),
            attributes: json!({"state": "info_verified"}),
        })
        .await
        .unwrap();
    client
        .send(&AnalyticsCommand::Event {
            customer_id: "user-1".into(),
            name: "transition".into(),
            data: json!({"state_now": "info_verified"}),
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn test_customer_io_error_status_is_reported() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&mock_server)
        .await;

    let client =
        CustomerIoClient::new(mock_server.uri(), Some("site".into()), Some("key".into())).unwrap();
    let result = client
        .send(&AnalyticsCommand::Identify {
            customer_id: "user-1".into(),
            attributes: json!({}),
        })
        .await;
    assert!(result.is_err());
}
