//! User authentication flow.
//!
//! App-level calls use the tenant token managed by the gateway. User-level
//! permissions require an OAuth-style browser redirect: a local HTTP
//! listener receives the `?code=` callback, the code is exchanged for an
//! access/refresh token pair, and both are persisted into the config file.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::config::Config;

/// Port of the local callback listener; the matching redirect URI must be
/// registered in the app's developer console.
pub const AUTH_SERVER_PORT: u16 = 8912;

const CALLBACK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

async fn get_app_access_token(
    http: &reqwest::Client,
    base_url: &str,
    app_id: &str,
    app_secret: &str,
) -> anyhow::Result<String> {
    let url = format!("{base_url}/auth/v3/app_access_token/internal");
    let body = serde_json::json!({ "app_id": app_id, "app_secret": app_secret });
    let resp = http.post(&url).json(&body).send().await?;
    let data: Value = resp.json().await?;
    if data.get("code").and_then(Value::as_i64).unwrap_or(-1) != 0 {
        bail!(
            "app_access_token request failed: {}",
            data.get("msg").and_then(Value::as_str).unwrap_or("unknown")
        );
    }
    data.get("app_access_token")
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("missing app_access_token")
}

fn token_pair_from(data: &Value) -> anyhow::Result<TokenPair> {
    let payload = data.get("data").unwrap_or(data);
    let access = payload
        .get("access_token")
        .and_then(Value::as_str)
        .context("missing access_token")?
        .to_string();
    let refresh = payload
        .get("refresh_token")
        .and_then(Value::as_str)
        .map(str::to_string);
    Ok(TokenPair {
        access_token: access,
        refresh_token: refresh,
    })
}

/// Exchange an authorization code for a user token pair.
async fn exchange_code(
    http: &reqwest::Client,
    base_url: &str,
    app_id: &str,
    app_secret: &str,
    code: &str,
) -> anyhow::Result<TokenPair> {
    let app_token = get_app_access_token(http, base_url, app_id, app_secret).await?;
    let url = format!("{base_url}/authen/v1/access_token");
    let body = serde_json::json!({ "grant_type": "authorization_code", "code": code });
    let resp = http
        .post(&url)
        .bearer_auth(&app_token)
        .json(&body)
        .send()
        .await?;
    let data: Value = resp.json().await?;
    if data.get("code").and_then(Value::as_i64).unwrap_or(0) != 0 {
        bail!(
            "code exchange failed: {}",
            data.get("msg").and_then(Value::as_str).unwrap_or("unknown")
        );
    }
    token_pair_from(&data)
}

/// Refresh a user access token via the refresh-token grant.
pub async fn refresh_user_token(
    http: &reqwest::Client,
    base_url: &str,
    app_id: &str,
    app_secret: &str,
    refresh_token: &str,
) -> anyhow::Result<TokenPair> {
    let app_token = get_app_access_token(http, base_url, app_id, app_secret).await?;
    let url = format!("{base_url}/authen/v1/refresh_access_token");
    let body = serde_json::json!({
        "grant_type": "refresh_token",
        "refresh_token": refresh_token,
    });
    let resp = http
        .post(&url)
        .bearer_auth(&app_token)
        .json(&body)
        .send()
        .await?;
    let data: Value = resp.json().await?;
    if data.get("code").and_then(Value::as_i64).unwrap_or(0) != 0 {
        bail!(
            "token refresh failed: {}",
            data.get("msg").and_then(Value::as_str).unwrap_or("unknown")
        );
    }
    token_pair_from(&data)
}

type CodeSender = Arc<Mutex<Option<oneshot::Sender<String>>>>;

async fn callback(
    State(sender): State<CodeSender>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    match params.get("code") {
        Some(code) => {
            if let Some(tx) = sender.lock().take() {
                let _ = tx.send(code.clone());
            }
            Html(
                "<h1>Login successful</h1>\
                 <p>You can close this window and return to the terminal.</p>\
                 <script>window.close()</script>",
            )
        }
        None => Html("<h1>Missing code parameter</h1>"),
    }
}

/// Run the full browser login flow and persist the obtained tokens into
/// the config file. Returns the new access token.
pub async fn login(config: &Config, base_url: &str) -> anyhow::Result<String> {
    if config.feishu_app_id.is_empty() || config.feishu_app_secret.is_empty() {
        bail!("feishu_app_id / feishu_app_secret must be configured before login");
    }

    let redirect_uri = format!("http://127.0.0.1:{AUTH_SERVER_PORT}/callback");
    let auth_url = format!(
        "{base_url}/authen/v1/index?redirect_uri={}&app_id={}",
        urlencoding::encode(&redirect_uri),
        config.feishu_app_id,
    );

    let (tx, rx) = oneshot::channel::<String>();
    let sender: CodeSender = Arc::new(Mutex::new(Some(tx)));
    let app = Router::new()
        .route("/callback", get(callback))
        .with_state(sender);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", AUTH_SERVER_PORT))
        .await
        .with_context(|| format!("port {AUTH_SERVER_PORT} is already in use"))?;
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    tracing::info!("waiting for authorization callback on port {AUTH_SERVER_PORT}");
    if webbrowser::open(&auth_url).is_err() {
        tracing::warn!("could not open a browser; visit this URL to authorize:\n{auth_url}");
    }

    let code = tokio::time::timeout(CALLBACK_TIMEOUT, rx)
        .await
        .context("timed out waiting for the authorization callback")?
        .context("authorization callback channel closed")?;
    server.abort();

    let http = reqwest::Client::new();
    let pair = exchange_code(
        &http,
        base_url,
        &config.feishu_app_id,
        &config.feishu_app_secret,
        &code,
    )
    .await?;

    if let Some(path) = &config.path {
        crate::config::save_tokens(path, &pair.access_token, pair.refresh_token.as_deref())?;
        tracing::info!("tokens saved to {}", path.display());
    }
    Ok(pair.access_token)
}
