use dsync_core::OAuthClient;
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[test]
fn authorize_url_includes_required_params() {
    let client = OAuthClient::with_base_url("https://oauth.example", "app-key", "secret")
        .expect("client should build");
    let url = client
        .authorize_url(Some("state-1"))
        .expect("url should build");

    assert_eq!(url.path(), "/oauth2/authorize");
    let query = url.query().unwrap_or_default();
    assert!(query.contains("response_type=code"));
    assert!(query.contains("client_id=app-key"));
    assert!(query.contains("state=state-1"));
    assert!(!query.contains("redirect_uri"));
}

#[test]
fn authorize_url_omits_state_when_absent() {
    let client = OAuthClient::with_base_url("https://oauth.example", "app-key", "secret").unwrap();
    let url = client.authorize_url(None).unwrap();

    assert!(!url.query().unwrap_or_default().contains("state="));
}

#[tokio::test]
async fn exchange_code_posts_form_data() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=auth-code"))
        .and(body_string_contains("client_id=app-key"))
        .and(body_string_contains("client_secret=secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "token",
            "token_type": "bearer",
            "account_id": "dbid:1",
            "uid": "12345"
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "app-key", "secret").unwrap();
    let token = client.exchange_code("auth-code").await.unwrap();

    assert_eq!(token.access_token, "token");
    assert_eq!(token.token_type, "bearer");
    assert_eq!(token.account_id.as_deref(), Some("dbid:1"));
    assert_eq!(token.expires_in, None);
}

#[tokio::test]
async fn exchange_code_surfaces_rejected_code() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "code doesn't exist or has expired"
        })))
        .mount(&server)
        .await;

    let client = OAuthClient::with_base_url(&server.uri(), "app-key", "secret").unwrap();
    let err = client.exchange_code("stale").await.unwrap_err();

    match err {
        dsync_core::OAuthError::Api { status, body } => {
            assert_eq!(status.as_u16(), 400);
            assert!(body.contains("invalid_grant"));
        }
        other => panic!("unexpected error {other:?}"),
    }
}
