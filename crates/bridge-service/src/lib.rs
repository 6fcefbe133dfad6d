use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_secretsmanager::error::DisplayErrorContext;
use bridge_config::{Config, ConfigError, SecretConfig};
use bridge_contracts::{
    BridgeOutput, CallPayload, TokenGrant, TokenState, ValidationFailure,
    GRANT_TYPE_CLIENT_CREDENTIALS,
};
use bridge_kernel::{
    callback_url, envelope, grant_expiry, normalize_event, token_fingerprint, token_is_fresh,
};
use chrono::Utc;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("SF_SECRET_NAME is not set")]
    MissingSecretName,
    #[error("secret store failure: {0}")]
    SecretStore(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("OAuth failed {status}: {body}")]
    OAuthRejected { status: u16, body: String },
    #[error("OAuth response invalid: {0}")]
    OAuthResponse(String),
    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http client setup failed: {0}")]
    HttpClient(String),
}

#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Returns the raw secret text stored under `name`.
    async fn fetch_secret(&self, name: &str) -> Result<String, BridgeError>;
}

pub struct SecretsManagerProvider {
    client: aws_sdk_secretsmanager::Client,
}

impl SecretsManagerProvider {
    pub fn new(client: aws_sdk_secretsmanager::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretProvider for SecretsManagerProvider {
    async fn fetch_secret(&self, name: &str) -> Result<String, BridgeError> {
        let out = self
            .client
            .get_secret_value()
            .secret_id(name)
            .send()
            .await
            .map_err(|e| BridgeError::SecretStore(DisplayErrorContext(&e).to_string()))?;
        out.secret_string()
            .map(str::to_string)
            .ok_or_else(|| BridgeError::SecretStore(format!("secret {name} has no SecretString")))
    }
}

/// Serves one fixed secret blob regardless of name.
pub struct StaticSecretProvider {
    secret: String,
    fetches: AtomicUsize,
}

impl StaticSecretProvider {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SecretProvider for StaticSecretProvider {
    async fn fetch_secret(&self, _name: &str) -> Result<String, BridgeError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.secret.clone())
    }
}

#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn get(&self) -> Option<TokenState>;
    async fn set(&self, state: TokenState);
    async fn clear(&self);
}

/// Process-wide cache; survives across invocations in a warm process only.
#[derive(Default)]
pub struct MemoryTokenCache {
    state: Mutex<Option<TokenState>>,
}

impl MemoryTokenCache {
    pub fn seeded(state: TokenState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn get(&self) -> Option<TokenState> {
        self.state.lock().await.clone()
    }

    async fn set(&self, state: TokenState) {
        *self.state.lock().await = Some(state);
    }

    async fn clear(&self) {
        *self.state.lock().await = None;
    }
}

pub struct NoopTokenCache;

#[async_trait]
impl TokenCache for NoopTokenCache {
    async fn get(&self) -> Option<TokenState> {
        None
    }

    async fn set(&self, _state: TokenState) {}

    async fn clear(&self) {}
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

pub fn http_client(cfg: &Config) -> Result<Client, BridgeError> {
    Client::builder()
        .timeout(Duration::from_millis(cfg.http.timeout_ms))
        .build()
        .map_err(|e| BridgeError::HttpClient(e.to_string()))
}

pub struct TokenManager {
    client: Client,
    cache: Arc<dyn TokenCache>,
    clock: Arc<dyn Clock>,
    refresh_margin_ms: i64,
    default_expires_in_secs: i64,
}

impl TokenManager {
    pub fn new(
        cfg: &Config,
        client: Client,
        cache: Arc<dyn TokenCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            cache,
            clock,
            refresh_margin_ms: cfg.token.refresh_margin_ms,
            default_expires_in_secs: cfg.token.default_expires_in_secs,
        }
    }

    /// Returns a bearer token and the base URL it is valid for, exchanging
    /// client credentials when the cached token is absent or near expiry.
    pub async fn get_token(&self, secret: &SecretConfig) -> Result<TokenState, BridgeError> {
        let now = self.clock.now_ms();
        if let Some(cached) = self.cache.get().await {
            if token_is_fresh(&cached, now, self.refresh_margin_ms) {
                debug!(
                    token = %token_fingerprint(&cached.access_token),
                    expires_at = cached.expires_at,
                    "token cache hit"
                );
                return Ok(cached);
            }
        }

        let response = self
            .client
            .post(&secret.token_url)
            .form(&[
                ("grant_type", GRANT_TYPE_CLIENT_CREDENTIALS),
                ("client_id", secret.client_id.as_str()),
                ("client_secret", secret.client_secret.expose_secret()),
            ])
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            error!(status = status.as_u16(), "OAuth token exchange rejected");
            return Err(BridgeError::OAuthRejected {
                status: status.as_u16(),
                body,
            });
        }

        let grant: TokenGrant =
            serde_json::from_str(&body).map_err(|e| BridgeError::OAuthResponse(e.to_string()))?;
        let access_token = grant
            .access_token
            .clone()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| BridgeError::OAuthResponse("access_token missing".to_string()))?;
        let expires_at = grant_expiry(&grant, self.clock.now_ms(), self.default_expires_in_secs)
            .map_err(BridgeError::OAuthResponse)?;
        let instance_url = secret
            .apex_base
            .clone()
            .or(grant.instance_url.filter(|v| !v.is_empty()))
            .ok_or_else(|| BridgeError::OAuthResponse("instance_url missing".to_string()))?;

        let state = TokenState {
            access_token,
            instance_url,
            expires_at,
        };
        self.cache.set(state.clone()).await;
        info!(
            token = %token_fingerprint(&state.access_token),
            expires_at = state.expires_at,
            "token refreshed"
        );
        Ok(state)
    }
}

pub struct CrmClient {
    client: Client,
    callback_path: String,
}

impl CrmClient {
    pub fn new(cfg: &Config, client: Client) -> Self {
        Self {
            client,
            callback_path: cfg.crm.callback_path.clone(),
        }
    }

    /// Posts the payload and returns the body and status for any HTTP
    /// outcome; only transport failures are errors.
    pub async fn post_callback(
        &self,
        base_url: &str,
        payload: &CallPayload,
        token: &str,
    ) -> Result<(String, u16), BridgeError> {
        let url = callback_url(base_url, &self.callback_path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((body, status))
    }
}

pub struct Bridge {
    secret_name: Option<String>,
    secrets: Arc<dyn SecretProvider>,
    tokens: TokenManager,
    crm: CrmClient,
}

impl Bridge {
    pub fn new(
        cfg: &Config,
        secrets: Arc<dyn SecretProvider>,
        cache: Arc<dyn TokenCache>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BridgeError> {
        let client = http_client(cfg)?;
        Ok(Self {
            secret_name: cfg.secret_name.clone(),
            secrets,
            tokens: TokenManager::new(cfg, client.clone(), cache, clock),
            crm: CrmClient::new(cfg, client),
        })
    }

    pub async fn handle(&self, event: &Value) -> Result<BridgeOutput, BridgeError> {
        let payload = match normalize_event(event) {
            Ok(v) => v,
            Err(field) => {
                warn!(missing = %field, "rejecting call event");
                return Ok(BridgeOutput::Rejected(ValidationFailure::missing(field)));
            }
        };

        let secret = self.load_secret().await?;
        let token = self.tokens.get_token(&secret).await?;
        let (body, status) = self
            .crm
            .post_callback(&token.instance_url, &payload, &token.access_token)
            .await?;
        info!(
            aws_key = %payload.aws_key,
            tenant = %payload.tenant_code,
            http_status = status,
            "callback dispatched"
        );
        Ok(BridgeOutput::Dispatched(envelope(&body, status)))
    }

    pub async fn handle_value(&self, event: Value) -> Result<Value, BridgeError> {
        self.handle(&event).await.map(BridgeOutput::into_value)
    }

    async fn load_secret(&self) -> Result<SecretConfig, BridgeError> {
        let name = self
            .secret_name
            .as_deref()
            .ok_or(BridgeError::MissingSecretName)?;
        let text = self.secrets.fetch_secret(name).await?;
        Ok(SecretConfig::from_json(&text)?)
    }
}
