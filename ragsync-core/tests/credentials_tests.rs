//! Credential lifecycle against a mock authorization server

use chrono::{Duration as ChronoDuration, Utc};
use ragsync_core::credentials::{Credential, CredentialManager, OAuthProvider};
use ragsync_core::{SyncConfig, SyncError};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Fixture {
    _dir: TempDir,
    config: SyncConfig,
    manager: CredentialManager,
}

async fn fixture(server: &MockServer, with_registration: bool) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = SyncConfig::with_data_dir(dir.path());
    config.drive_api_url = server.uri();

    if with_registration {
        let registration = json!({
            "installed": {
                "client_id": "test-client.apps",
                "client_secret": "test-secret",
                "auth_uri": "https://accounts.example.com/o/oauth2/auth",
                "token_uri": format!("{}/token", server.uri()),
                "redirect_uris": ["urn:ietf:wg:oauth:2.0:oob"]
            }
        });
        std::fs::write(&config.client_secret_path, registration.to_string()).unwrap();
    }

    let provider = Arc::new(OAuthProvider::new(&config).unwrap());
    let manager = CredentialManager::new(provider, &config.token_path);
    Fixture {
        _dir: dir,
        config,
        manager,
    }
}

fn write_token(config: &SyncConfig, credential: &Credential) {
    std::fs::write(&config.token_path, serde_json::to_string(credential).unwrap()).unwrap();
}

fn expired(refresh_token: Option<&str>) -> Credential {
    Credential {
        access_token: "stale".into(),
        refresh_token: refresh_token.map(String::from),
        expires_at: Some(Utc::now() - ChronoDuration::minutes(5)),
        scopes: vec!["https://www.googleapis.com/auth/drive.readonly".into()],
        identity: Some("me@example.com".into()),
    }
}

#[tokio::test]
async fn test_expired_credential_is_refreshed_and_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "fresh",
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;

    let f = fixture(&server, true).await;
    write_token(&f.config, &expired(Some("r1")));

    let credential = f.manager.ensure_valid().await.unwrap();
    assert_eq!(credential.access_token, "fresh");
    // Refresh responses usually omit these; the old values carry over
    assert_eq!(credential.refresh_token.as_deref(), Some("r1"));
    assert_eq!(credential.identity.as_deref(), Some("me@example.com"));
    assert!(credential.expires_at.unwrap() > Utc::now());

    let persisted: Credential =
        serde_json::from_str(&std::fs::read_to_string(&f.config.token_path).unwrap()).unwrap();
    assert_eq!(persisted.access_token, "fresh");

    // Still valid: no second refresh
    assert_eq!(f.manager.ensure_valid().await.unwrap().access_token, "fresh");
}

#[tokio::test]
async fn test_expired_without_refresh_token_requires_reauthorization() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&server)
        .await;

    let f = fixture(&server, true).await;
    write_token(&f.config, &expired(None));

    let err = f.manager.ensure_valid().await.unwrap_err();
    assert!(matches!(err, SyncError::ReauthorizationRequired(_)));
    assert!(!f.manager.status().await.authenticated);
}

#[tokio::test]
async fn test_rejected_refresh_requires_reauthorization() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Token has been expired or revoked."
        })))
        .mount(&server)
        .await;

    let f = fixture(&server, true).await;
    write_token(&f.config, &expired(Some("revoked")));

    match f.manager.ensure_valid().await {
        Err(SyncError::ReauthorizationRequired(message)) => {
            assert!(message.contains("invalid_grant"))
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_exchange_code_persists_and_reports_identity() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=authorization_code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access",
            "refresh_token": "new-refresh",
            "token_type": "Bearer",
            "expires_in": 3599,
            "scope": "https://www.googleapis.com/auth/drive.readonly"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/about"))
        .and(header("authorization", "Bearer new-access"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user": { "emailAddress": "me@example.com", "displayName": "Me" }
        })))
        .mount(&server)
        .await;

    let f = fixture(&server, true).await;
    assert!(!f.manager.status().await.authenticated);

    let identity = f.manager.exchange_code("4/abc").await.unwrap();
    assert_eq!(identity, "me@example.com");
    assert!(f.config.token_path.exists());

    let status = f.manager.status().await;
    assert!(status.authenticated);
    assert_eq!(status.identity.as_deref(), Some("me@example.com"));
}

#[tokio::test]
async fn test_exchange_code_returns_provider_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": "invalid_grant",
            "error_description": "Malformed auth code."
        })))
        .mount(&server)
        .await;

    let f = fixture(&server, true).await;
    match f.manager.exchange_code("bogus").await {
        Err(SyncError::Auth(message)) => assert!(message.contains("invalid_grant")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!f.config.token_path.exists());
}

#[tokio::test]
async fn test_authorization_url() {
    let server = MockServer::start().await;

    let missing = fixture(&server, false).await;
    assert!(matches!(
        missing.manager.authorization_url(),
        Err(SyncError::ConfigurationMissing(_))
    ));

    let f = fixture(&server, true).await;
    let url = f.manager.authorization_url().unwrap();
    assert!(url.starts_with("https://accounts.example.com/o/oauth2/auth?"));
    assert!(url.contains("client_id=test-client.apps"));
    assert!(url.contains("access_type=offline"));
    assert!(url.contains("drive.readonly"));
}

#[tokio::test]
async fn test_exchange_checks_state_and_sends_verifier() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "new-access",
            "refresh_token": "new-refresh",
            "token_type": "Bearer",
            "expires_in": 3599
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/about"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user": { "emailAddress": "me@example.com" }
        })))
        .mount(&server)
        .await;

    let f = fixture(&server, true).await;
    let url = url::Url::parse(&f.manager.authorization_url().unwrap()).unwrap();
    let state = url
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    assert!(url.query_pairs().any(|(k, v)| k == "code_challenge_method" && v == "S256"));

    match f
        .manager
        .exchange_code("http://localhost/?code=4/abc&state=forged")
        .await
    {
        Err(SyncError::Auth(message)) => assert!(message.contains("state")),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!f.config.token_path.exists());

    let callback = format!("http://localhost/?code=4/abc&state={}", state);
    let identity = f.manager.exchange_code(&callback).await.unwrap();
    assert_eq!(identity, "me@example.com");
    assert!(f.config.token_path.exists());
}

#[tokio::test]
async fn test_revoke_is_idempotent() {
    let server = MockServer::start().await;
    let f = fixture(&server, true).await;
    let mut valid = expired(Some("r"));
    valid.expires_at = Some(Utc::now() + ChronoDuration::hours(1));
    write_token(&f.config, &valid);

    assert!(f.manager.status().await.authenticated);
    f.manager.revoke().await.unwrap();
    f.manager.revoke().await.unwrap();
    assert!(!f.config.token_path.exists());
    assert!(!f.manager.status().await.authenticated);
}
