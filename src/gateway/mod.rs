//! Remote gateway.
//!
//! Every outbound call to the document service funnels through
//! [`FeishuGateway`]: it owns authentication state, the process-wide rate
//! gate, retry with exponential backoff, and the asset dedup cache. No
//! other component speaks to the network.

pub mod asset_cache;
mod docs;
mod drive;
mod media;

pub use asset_cache::AssetCache;
pub use docs::BlockUpdate;
pub use drive::{DocumentMeta, DriveEntry};
pub use media::AssetParent;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use crate::config::Config;
use crate::error::{Result, SyncError};

pub const FEISHU_BASE_URL: &str = "https://open.feishu.cn/open-apis";

/// Refresh the tenant token this many seconds before announced expiry.
const TOKEN_REFRESH_SKEW: Duration = Duration::from_secs(120);
/// Fallback TTL when the `expire` field is absent.
const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7200);

const RETRY_BASE_BACKOFF: Duration = Duration::from_secs(1);
const RETRY_BACKOFF_CAP: Duration = Duration::from_secs(10);
const RETRY_AFTER_CAP: Duration = Duration::from_secs(30);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub(crate) const TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_after: Instant,
}

#[derive(Debug, Clone, Default)]
struct UserTokens {
    access: Option<String>,
    refresh: Option<String>,
}

/// Process-wide request gate: no two outbound requests start within less
/// than the configured interval. Orthogonal to worker concurrency — many
/// workers may be parked here at once.
struct RateGate {
    min_interval: Duration,
    last: Mutex<Instant>,
}

impl RateGate {
    fn new(min_interval: Duration) -> Self {
        RateGate {
            min_interval,
            last: Mutex::new(Instant::now() - min_interval),
        }
    }

    async fn wait(&self) {
        let mut last = self.last.lock().await;
        let elapsed = last.elapsed();
        if elapsed < self.min_interval {
            tokio::time::sleep(self.min_interval - elapsed).await;
        }
        *last = Instant::now();
    }
}

pub struct FeishuGateway {
    base_url: String,
    app_id: String,
    app_secret: String,
    http: reqwest::Client,
    tenant_token: Arc<RwLock<Option<CachedToken>>>,
    user_tokens: Arc<RwLock<UserTokens>>,
    rate_gate: RateGate,
    max_retries: u32,
    /// Config file to persist refreshed user tokens into, when known.
    config_path: Option<PathBuf>,
    /// Drive folder receiving standalone file uploads, resolved lazily.
    pub(crate) assets_folder: RwLock<Option<String>>,
    pub(crate) asset_cache: AssetCache,
}

impl FeishuGateway {
    pub fn new(config: &Config) -> Self {
        Self::with_base_url(config, FEISHU_BASE_URL)
    }

    /// Test seam: point the gateway at a mock server.
    pub fn with_base_url(config: &Config, base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        FeishuGateway {
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id: config.feishu_app_id.clone(),
            app_secret: config.feishu_app_secret.clone(),
            http,
            tenant_token: Arc::new(RwLock::new(None)),
            user_tokens: Arc::new(RwLock::new(UserTokens {
                access: config.feishu_user_access_token.clone(),
                refresh: config.feishu_user_refresh_token.clone(),
            })),
            rate_gate: RateGate::new(Duration::from_millis(config.rate_limit_ms)),
            max_retries: config.api_max_retries,
            config_path: config.path.clone(),
            assets_folder: RwLock::new(config.feishu_assets_token.clone()),
            asset_cache: AssetCache::open(
                config
                    .asset_cache_path
                    .clone()
                    .unwrap_or_else(AssetCache::default_path),
            ),
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Current user access token, when one is configured.
    pub async fn user_access_token(&self) -> Option<String> {
        self.user_tokens.read().await.access.clone()
    }

    /// Install a fresh user token pair, e.g. after an interactive login.
    pub async fn set_user_tokens(&self, access: String, refresh: Option<String>) {
        let mut tokens = self.user_tokens.write().await;
        tokens.access = Some(access);
        if refresh.is_some() {
            tokens.refresh = refresh;
        }
    }

    /// Token used for API calls: the user token when present, else the
    /// app-level tenant token.
    pub(crate) async fn auth_token(&self) -> Result<String> {
        if let Some(token) = self.user_access_token().await {
            return Ok(token);
        }
        self.tenant_access_token().await
    }

    /// Get or refresh the tenant access token, cached with proactive
    /// refresh and double-checked locking.
    async fn tenant_access_token(&self) -> Result<String> {
        {
            let cached = self.tenant_token.read().await;
            if let Some(token) = cached.as_ref() {
                if Instant::now() < token.refresh_after {
                    return Ok(token.value.clone());
                }
            }
        }

        let mut cached = self.tenant_token.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_after {
                return Ok(token.value.clone());
            }
        }

        self.rate_gate.wait().await;
        let url = self.url("/auth/v3/tenant_access_token/internal");
        let body = serde_json::json!({
            "app_id": self.app_id,
            "app_secret": self.app_secret,
        });
        let resp = self.http.post(&url).json(&body).send().await?;
        let status = resp.status();
        let data: Value = resp.json().await.unwrap_or(Value::Null);

        let code = data.get("code").and_then(Value::as_i64).unwrap_or(-1);
        if !status.is_success() || code != 0 {
            let msg = data
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("tenant token request failed");
            return Err(SyncError::api(code, msg));
        }

        let value = data
            .get("tenant_access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::api(-1, "missing tenant_access_token"))?
            .to_string();
        let ttl_secs = data
            .get("expire")
            .or_else(|| data.get("expires_in"))
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_TOKEN_TTL.as_secs())
            .max(1);
        let refresh_in = Duration::from_secs(ttl_secs)
            .checked_sub(TOKEN_REFRESH_SKEW)
            .unwrap_or(Duration::from_secs(1));

        *cached = Some(CachedToken {
            value: value.clone(),
            refresh_after: Instant::now() + refresh_in,
        });
        Ok(value)
    }

    /// Refresh the user access token via the refresh-token grant and
    /// persist the new pair. Surfaces `AuthExpired` when no refresh token
    /// is available or the grant is rejected.
    async fn refresh_user_token(&self) -> Result<()> {
        let refresh = self
            .user_tokens
            .read()
            .await
            .refresh
            .clone()
            .ok_or_else(|| SyncError::AuthExpired("no refresh token available".into()))?;

        let pair = crate::auth::refresh_user_token(
            &self.http,
            &self.base_url,
            &self.app_id,
            &self.app_secret,
            &refresh,
        )
        .await
        .map_err(|err| SyncError::AuthExpired(err.to_string()))?;

        tracing::info!("user access token refreshed");
        self.set_user_tokens(pair.access_token.clone(), pair.refresh_token.clone())
            .await;
        if let Some(path) = &self.config_path {
            if let Err(err) =
                crate::config::save_tokens(path, &pair.access_token, pair.refresh_token.as_deref())
            {
                tracing::warn!("failed to persist refreshed tokens: {err}");
            }
        }
        Ok(())
    }

    /// Send a request with the rate gate, retry with exponential backoff,
    /// and envelope decoding.
    ///
    /// Retries transport errors, HTTP 429/5xx and the remote rate-limit
    /// business code, honoring a server `Retry-After` hint. A token-expired
    /// business code triggers one refresh attempt before retrying. After
    /// exhaustion the last error is surfaced with the remote code and
    /// message attached.
    pub(crate) async fn request_json<F>(&self, build: F) -> Result<Value>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let mut backoff = RETRY_BASE_BACKOFF;
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            let token = self.auth_token().await?;
            self.rate_gate.wait().await;

            let resp = match build(&self.http, &token).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt >= self.max_retries {
                        return Err(err.into());
                    }
                    tracing::warn!(attempt, "request failed (network): {err}, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                    attempt += 1;
                    continue;
                }
            };

            let status = resp.status();
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok())
                .map(|secs| Duration::from_secs_f64(secs.max(0.0)).min(RETRY_AFTER_CAP));
            let body: Value = resp.json().await.unwrap_or(Value::Null);

            if status.is_success() {
                let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
                if code == 0 {
                    return Ok(body);
                }
                let msg = body
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string();

                if SyncError::code_is_token_expired(code) && !refreshed {
                    refreshed = true;
                    self.refresh_user_token().await?;
                    continue;
                }
                if SyncError::code_is_retryable(code) && attempt < self.max_retries {
                    tracing::warn!(attempt, code, "rate limited, retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                    attempt += 1;
                    continue;
                }
                return Err(SyncError::Api { code, msg });
            }

            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && attempt < self.max_retries {
                let wait = match (status.as_u16(), retry_after) {
                    (429, Some(hint)) => hint,
                    _ => backoff,
                };
                tracing::warn!(
                    attempt,
                    status = %status,
                    wait_ms = wait.as_millis() as u64,
                    "request failed, retrying"
                );
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                attempt += 1;
                continue;
            }

            let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let msg = body
                .get("msg")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("http status {status}"));
            return Err(SyncError::Api { code, msg });
        }
    }

    /// [`Self::request_json`] for binary response bodies (asset
    /// downloads). Same rate gate, retry and refresh behavior; a JSON
    /// error envelope on an otherwise successful status is decoded and
    /// handled like any other business error.
    pub(crate) async fn request_bytes<F>(&self, build: F) -> Result<Vec<u8>>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let mut backoff = RETRY_BASE_BACKOFF;
        let mut attempt: u32 = 0;
        let mut refreshed = false;

        loop {
            let token = self.auth_token().await?;
            self.rate_gate.wait().await;

            let resp = match build(&self.http, &token).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    if attempt >= self.max_retries {
                        return Err(err.into());
                    }
                    tracing::warn!(attempt, "request failed (network): {err}, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                    attempt += 1;
                    continue;
                }
            };

            let status = resp.status();
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<f64>().ok())
                .map(|secs| Duration::from_secs_f64(secs.max(0.0)).min(RETRY_AFTER_CAP));
            let is_json = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|ct| ct.contains("application/json"));
            let bytes = resp.bytes().await?;

            if status.is_success() {
                // The service reports download failures as a JSON envelope
                // with a 200 status.
                if is_json {
                    let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
                    let code = body.get("code").and_then(Value::as_i64).unwrap_or(0);
                    if code != 0 {
                        let msg = body
                            .get("msg")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string();
                        if SyncError::code_is_token_expired(code) && !refreshed {
                            refreshed = true;
                            self.refresh_user_token().await?;
                            continue;
                        }
                        if SyncError::code_is_retryable(code) && attempt < self.max_retries {
                            tracing::warn!(attempt, code, "rate limited, retrying in {backoff:?}");
                            tokio::time::sleep(backoff).await;
                            backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                            attempt += 1;
                            continue;
                        }
                        return Err(SyncError::Api { code, msg });
                    }
                }
                return Ok(bytes.to_vec());
            }

            let retryable = status.as_u16() == 429 || status.is_server_error();
            if retryable && attempt < self.max_retries {
                let wait = match (status.as_u16(), retry_after) {
                    (429, Some(hint)) => hint,
                    _ => backoff,
                };
                tracing::warn!(
                    attempt,
                    status = %status,
                    wait_ms = wait.as_millis() as u64,
                    "request failed, retrying"
                );
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(RETRY_BACKOFF_CAP);
                attempt += 1;
                continue;
            }

            let body: Value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
            let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let msg = body
                .get("msg")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("http status {status}"));
            return Err(SyncError::Api { code, msg });
        }
    }
}
