//! Credential lifecycle for the shared remote-store account
//!
//! One delegated-access credential is shared by every remote source. The
//! manager loads it from the token file, refreshes it when it is close to
//! expiry, persists the refreshed token and can revoke it. Talking to the
//! authorization server is the job of a [`TokenProvider`].

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oauth2::basic::{BasicClient, BasicErrorResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse,
    TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Refresh this long before the recorded expiry
pub const EXPIRY_SKEW_SECS: i64 = 60;

/// Out-of-band redirect for installed apps: the user pastes the code back
const OOB_REDIRECT: &str = "urn:ietf:wg:oauth:2.0:oob";

/// Persisted delegated-access token set
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub identity: Option<String>,
}

impl Credential {
    /// True when the token is expired or will be within `skew_secs`.
    /// A credential with no recorded expiry is treated as valid.
    pub fn expires_within(&self, now: DateTime<Utc>, skew_secs: i64) -> bool {
        match self.expires_at {
            Some(at) => at <= now + chrono::Duration::seconds(skew_secs),
            None => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .field("identity", &self.identity)
            .finish()
    }
}

/// What the control interface may see about the credential
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CredentialStatus {
    pub authenticated: bool,
    pub identity: Option<String>,
}

/// Authorization-server operations
#[async_trait]
pub trait TokenProvider: Send + Sync {
    fn authorization_url(&self) -> Result<String>;
    async fn exchange_code(&self, code: &str) -> Result<Credential>;
    async fn refresh(&self, refresh_token: &str) -> Result<Credential>;
    /// Account identity (email) for an access token
    async fn identity(&self, access_token: &str) -> Result<String>;
}

// === Client registration ===

/// OAuth client registration, read from the `credentials.json` artifact
#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_uri: String,
    pub token_uri: String,
    pub redirect_uri: String,
}

#[derive(Deserialize)]
struct RegistrationFile {
    installed: Option<RegistrationBody>,
    web: Option<RegistrationBody>,
}

#[derive(Deserialize)]
struct RegistrationBody {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    auth_uri: String,
    token_uri: String,
    #[serde(default)]
    redirect_uris: Vec<String>,
}

impl ClientRegistration {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SyncError::ConfigurationMissing(format!(
                    "client registration not found at {}",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        };
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let file: RegistrationFile = serde_json::from_str(raw)?;
        let body = file.installed.or(file.web).ok_or_else(|| {
            SyncError::ConfigurationMissing(
                "client registration has neither an 'installed' nor a 'web' entry".into(),
            )
        })?;

        let redirect_uri = body
            .redirect_uris
            .iter()
            .find(|uri| uri.as_str() == OOB_REDIRECT)
            .or_else(|| body.redirect_uris.first())
            .cloned()
            .unwrap_or_else(|| "http://localhost".to_string());

        Ok(Self {
            client_id: body.client_id,
            client_secret: body.client_secret,
            auth_uri: body.auth_uri,
            token_uri: body.token_uri,
            redirect_uri,
        })
    }

    fn client(&self) -> Result<BasicClient> {
        Ok(BasicClient::new(
            ClientId::new(self.client_id.clone()),
            self.client_secret.clone().map(ClientSecret::new),
            AuthUrl::new(self.auth_uri.clone())?,
            Some(TokenUrl::new(self.token_uri.clone())?),
        )
        .set_redirect_uri(RedirectUrl::new(self.redirect_uri.clone())?))
    }
}

// === OAuth provider ===

/// State and PKCE verifier issued with the latest authorization URL
struct PendingAuthorization {
    state: CsrfToken,
    verifier: PkceCodeVerifier,
}

/// Token provider for the remote file store's OAuth server
pub struct OAuthProvider {
    client_secret_path: PathBuf,
    api_base: String,
    scopes: Vec<String>,
    http: reqwest::Client,
    pending: parking_lot::Mutex<Option<PendingAuthorization>>,
}

impl OAuthProvider {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;
        Ok(Self {
            client_secret_path: config.client_secret_path.clone(),
            api_base: config.drive_api_url.trim_end_matches('/').to_string(),
            scopes: config.scopes.clone(),
            http,
            pending: parking_lot::Mutex::new(None),
        })
    }

    fn registration(&self) -> Result<ClientRegistration> {
        ClientRegistration::load(&self.client_secret_path)
    }
}

fn credential_from_response<T: TokenResponse<oauth2::basic::BasicTokenType>>(
    token: &T,
    requested_scopes: &[String],
) -> Credential {
    let scopes = token
        .scopes()
        .map(|s| s.iter().map(|scope| scope.as_str().to_string()).collect())
        .unwrap_or_else(|| requested_scopes.to_vec());
    Credential {
        access_token: token.access_token().secret().clone(),
        refresh_token: token.refresh_token().map(|t| t.secret().clone()),
        expires_at: token
            .expires_in()
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d),
        scopes,
        identity: None,
    }
}

/// Split a pasted callback into its code and state
fn split_callback(input: &str) -> (String, Option<String>) {
    let input = input.trim();
    if let Ok(url) = url::Url::parse(input) {
        let mut code = None;
        let mut state = None;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "code" => code = Some(value.into_owned()),
                "state" => state = Some(value.into_owned()),
                _ => {}
            }
        }
        if let Some(code) = code {
            return (code, state);
        }
    }
    (input.to_string(), None)
}

/// Map an oauth2 failure, keeping the provider's own wording
fn provider_error<RE>(err: RequestTokenError<RE, BasicErrorResponse>) -> SyncError
where
    RE: std::error::Error + 'static,
{
    match err {
        RequestTokenError::ServerResponse(resp) => SyncError::Auth(resp.to_string()),
        RequestTokenError::Request(e) => SyncError::Http(e.to_string()),
        RequestTokenError::Parse(e, _) => SyncError::Auth(format!("malformed token response: {}", e)),
        RequestTokenError::Other(msg) => SyncError::Auth(msg),
    }
}

#[async_trait]
impl TokenProvider for OAuthProvider {
    fn authorization_url(&self) -> Result<String> {
        let client = self.registration()?.client()?;
        let mut request = client.authorize_url(CsrfToken::new_random);
        for scope in &self.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        // Offline access so the grant carries a refresh token
        let (url, state) = request
            .set_pkce_challenge(challenge)
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url();
        *self.pending.lock() = Some(PendingAuthorization { state, verifier });
        Ok(url.to_string())
    }

    /// `code` is either the bare code or the redirect URL the browser landed
    /// on. A `state` in that URL must match the latest authorization URL.
    async fn exchange_code(&self, code: &str) -> Result<Credential> {
        let (code, state) = split_callback(code);
        let pending = {
            let mut slot = self.pending.lock();
            if let Some(returned) = state.as_deref() {
                let expected = slot.as_ref().map(|p| p.state.secret().as_str());
                if expected != Some(returned) {
                    return Err(SyncError::Auth(
                        "authorization state does not match the latest authorization URL"
                            .into(),
                    ));
                }
            }
            slot.take()
        };

        let client = self.registration()?.client()?;
        let mut request = client.exchange_code(AuthorizationCode::new(code));
        if let Some(pending) = pending {
            request = request.set_pkce_verifier(pending.verifier);
        }
        let token = request
            .request_async(async_http_client)
            .await
            .map_err(provider_error)?;
        Ok(credential_from_response(&token, &self.scopes))
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Credential> {
        let client = self.registration()?.client()?;
        let token = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(provider_error)?;
        Ok(credential_from_response(&token, &self.scopes))
    }

    async fn identity(&self, access_token: &str) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct About {
            user: AboutUser,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AboutUser {
            email_address: Option<String>,
            display_name: Option<String>,
        }

        let response = self
            .http
            .get(format!("{}/about", self.api_base))
            .query(&[("fields", "user")])
            .bearer_auth(access_token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SyncError::Http(format!(
                "identity lookup returned {}",
                response.status()
            )));
        }
        let about: About = response.json().await?;
        about
            .user
            .email_address
            .or(about.user.display_name)
            .ok_or_else(|| SyncError::Auth("account has no email address".into()))
    }
}

// === Manager ===

pub struct CredentialManager {
    provider: Arc<dyn TokenProvider>,
    token_path: PathBuf,
    cache: Mutex<Option<Credential>>,
}

impl CredentialManager {
    pub fn new(provider: Arc<dyn TokenProvider>, token_path: impl Into<PathBuf>) -> Self {
        Self {
            provider,
            token_path: token_path.into(),
            cache: Mutex::new(None),
        }
    }

    /// Never fails; any problem reads as unauthenticated.
    pub async fn status(&self) -> CredentialStatus {
        let credential = match self.ensure_valid().await {
            Ok(credential) => credential,
            Err(e) => {
                debug!("Credential unusable: {}", e);
                return CredentialStatus {
                    authenticated: false,
                    identity: None,
                };
            }
        };

        if let Some(identity) = credential.identity {
            return CredentialStatus {
                authenticated: true,
                identity: Some(identity),
            };
        }

        match self.provider.identity(&credential.access_token).await {
            Ok(identity) => {
                if let Err(e) = self.remember_identity(&identity).await {
                    warn!("Could not persist identity: {}", e);
                }
                CredentialStatus {
                    authenticated: true,
                    identity: Some(identity),
                }
            }
            Err(e) => {
                warn!("Identity lookup failed: {}", e);
                CredentialStatus {
                    authenticated: false,
                    identity: None,
                }
            }
        }
    }

    pub fn authorization_url(&self) -> Result<String> {
        self.provider.authorization_url()
    }

    /// Exchange an authorization code and persist the resulting credential.
    /// Provider errors are returned as the provider phrased them.
    pub async fn exchange_code(&self, code: &str) -> Result<String> {
        let mut credential = self.provider.exchange_code(code).await?;

        match self.provider.identity(&credential.access_token).await {
            Ok(identity) => credential.identity = Some(identity),
            Err(e) => warn!("Authorized, but identity lookup failed: {}", e),
        }

        let mut cache = self.cache.lock().await;
        write_token_file(&self.token_path, &credential).await?;
        let identity = credential
            .identity
            .clone()
            .unwrap_or_else(|| "unknown account".to_string());
        *cache = Some(credential);

        info!("Authorized remote access for {}", identity);
        Ok(identity)
    }

    /// A credential that is valid now, refreshing it first when needed.
    pub async fn ensure_valid(&self) -> Result<Credential> {
        let mut cache = self.cache.lock().await;

        if cache.is_none() {
            *cache = read_token_file(&self.token_path).await?;
        }
        let current = match cache.as_ref() {
            Some(credential) => credential.clone(),
            None => {
                return Err(SyncError::ReauthorizationRequired(
                    "no stored credential; authorize first".into(),
                ))
            }
        };

        if !current.expires_within(Utc::now(), EXPIRY_SKEW_SECS) {
            return Ok(current);
        }

        let refresh_token = current.refresh_token.clone().ok_or_else(|| {
            SyncError::ReauthorizationRequired("credential expired and has no refresh token".into())
        })?;

        debug!("Refreshing access token");
        let mut refreshed = match self.provider.refresh(&refresh_token).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!("Token refresh failed: {}", e);
                return Err(SyncError::ReauthorizationRequired(format!(
                    "token refresh failed: {}",
                    e
                )));
            }
        };

        // Providers usually omit these on refresh
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = Some(refresh_token);
        }
        if refreshed.scopes.is_empty() {
            refreshed.scopes = current.scopes.clone();
        }
        refreshed.identity = current.identity.clone();

        write_token_file(&self.token_path, &refreshed).await?;
        *cache = Some(refreshed.clone());
        info!("Access token refreshed");
        Ok(refreshed)
    }

    /// Delete the stored credential. Revoking twice is fine.
    pub async fn revoke(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;
        *cache = None;
        match tokio::fs::remove_file(&self.token_path).await {
            Ok(()) => {
                info!("Stored credential removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remember_identity(&self, identity: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if let Some(credential) = cache.as_mut() {
            credential.identity = Some(identity.to_string());
            write_token_file(&self.token_path, credential).await?;
        }
        Ok(())
    }
}

async fn read_token_file(path: &Path) -> Result<Option<Credential>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => match serde_json::from_str::<Credential>(&raw) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                warn!("Ignoring unreadable token file {}: {}", path.display(), e);
                Ok(None)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn write_token_file(path: &Path, credential: &Credential) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(credential)?).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
    }

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_callback() {
        assert_eq!(split_callback(" 4/0Abc \n"), ("4/0Abc".to_string(), None));
        assert_eq!(
            split_callback("http://localhost/?state=xyz&code=4%2F0Abc&scope=drive"),
            ("4/0Abc".to_string(), Some("xyz".to_string()))
        );
        // A URL without a code is taken as typed
        assert_eq!(
            split_callback("http://localhost/?error=access_denied"),
            ("http://localhost/?error=access_denied".to_string(), None)
        );
    }

    #[test]
    fn test_registration_parsing() {
        let raw = r#"{"installed":{"client_id":"abc.apps","client_secret":"s3cret",
            "auth_uri":"https://accounts.example.com/o/oauth2/auth",
            "token_uri":"https://oauth2.example.com/token",
            "redirect_uris":["http://localhost","urn:ietf:wg:oauth:2.0:oob"]}}"#;
        let reg = ClientRegistration::parse(raw).unwrap();
        assert_eq!(reg.client_id, "abc.apps");
        assert_eq!(reg.redirect_uri, OOB_REDIRECT);

        let web = r#"{"web":{"client_id":"w","auth_uri":"https://a/auth","token_uri":"https://a/token"}}"#;
        let reg = ClientRegistration::parse(web).unwrap();
        assert_eq!(reg.redirect_uri, "http://localhost");
        assert!(reg.client_secret.is_none());
    }

    #[test]
    fn test_missing_registration() {
        let err = ClientRegistration::load(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, SyncError::ConfigurationMissing(_)));
    }

    #[test]
    fn test_expiry_skew() {
        let now = Utc::now();
        let mut credential = Credential {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: Some(now + chrono::Duration::seconds(30)),
            scopes: vec![],
            identity: None,
        };
        assert!(credential.expires_within(now, EXPIRY_SKEW_SECS));
        credential.expires_at = Some(now + chrono::Duration::hours(1));
        assert!(!credential.expires_within(now, EXPIRY_SKEW_SECS));
        credential.expires_at = None;
        assert!(!credential.expires_within(now, EXPIRY_SKEW_SECS));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let credential = Credential {
            access_token: "ya29.secret".into(),
            refresh_token: Some("1//refresh".into()),
            expires_at: None,
            scopes: vec![],
            identity: Some("me@example.com".into()),
        };
        let shown = format!("{:?}", credential);
        assert!(!shown.contains("ya29.secret"));
        assert!(!shown.contains("1//refresh"));
        assert!(shown.contains("me@example.com"));
    }
}
