//! Directory HTTP Client
//!
//! Talks to the identity directory service: registration, sync, sign-in,
//! token exchange, and transfer-completion notification.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Client;
use serde_json::Value;

use crate::types::{
    AccessToken, Connectivity, DirectoryClient, Identity, NotifyOutcome, Session,
    TransferCompletion,
};

use super::error::DirectoryError;

/// Default token lifetime assumed when the server omits `expiresAt`.
const DEFAULT_TOKEN_TTL_SECS: i64 = 15 * 60;

/// Reachability probe timeout.
const PROBE_TIMEOUT_SECS: u64 = 3;

/// HTTP client for the identity directory.
pub struct DirectoryHttpClient {
    pub api_url: String,
    http: Client,
}

impl DirectoryHttpClient {
    pub fn new(api_url: String) -> Self {
        Self {
            api_url,
            http: Client::new(),
        }
    }

    /// Internal helper: send a request and return the JSON body.
    ///
    /// Non-success statuses become `DirectoryError::Api`, carrying the
    /// structured `code` field from the body when the server sends one.
    async fn request(
        &self,
        method: &str,
        path: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.api_url, path);

        let mut builder = match method {
            "GET" => self.http.get(&url),
            "POST" => self.http.post(&url),
            "PUT" => self.http.put(&url),
            "DELETE" => self.http.delete(&url),
            other => anyhow::bail!("unsupported HTTP method: {other}"),
        };

        builder = builder.header("Content-Type", "application/json");
        if let Some(token) = bearer {
            builder = builder.header("Authorization", format!("Bearer {token}"));
        }
        if let Some(b) = body {
            builder = builder.json(&b);
        }

        let resp = builder.send().await.map_err(DirectoryError::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let parsed: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
            let code = parsed["code"]
                .as_str()
                .or_else(|| parsed["error"]["code"].as_str())
                .map(|s| s.to_string());
            let message = parsed["message"]
                .as_str()
                .or_else(|| parsed["error"]["message"].as_str())
                .map(|s| s.to_string())
                .unwrap_or(text);
            return Err(DirectoryError::Api {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                code,
                message,
            }
            .into());
        }

        let json: Value = resp.json().await.map_err(DirectoryError::Transport)?;
        Ok(json)
    }

    fn parse_token(result: &Value) -> Result<AccessToken> {
        let token = result["token"]
            .as_str()
            .or_else(|| result["accessToken"].as_str())
            .filter(|t| !t.is_empty())
            .context("token response missing token field")?
            .to_string();
        let expires_at = result["expiresAt"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| Utc::now() + Duration::seconds(DEFAULT_TOKEN_TTL_SECS));
        Ok(AccessToken { token, expires_at })
    }
}

#[async_trait]
impl DirectoryClient for DirectoryHttpClient {
    async fn register_identity(
        &self,
        identity: &Identity,
        device_id: &str,
    ) -> Result<Session> {
        let body = serde_json::json!({
            "publicKey": identity.public_key,
            "publicId": identity.public_id,
            "deviceId": device_id,
        });

        let result = self.request("POST", "/v1/identities", None, Some(body)).await?;

        let session_id = result["sessionId"]
            .as_str()
            .or_else(|| result["session"]["id"].as_str())
            .context("registration response missing sessionId")?
            .to_string();

        Ok(Session::online(session_id))
    }

    async fn sync_identity(&self, identity: &Identity, device_id: &str) -> Result<()> {
        let encoded = urlencoding::encode(&identity.public_id);
        let body = serde_json::json!({
            "publicKey": identity.public_key,
            "deviceId": device_id,
        });
        self.request(
            "POST",
            &format!("/v1/identities/{}/sync", encoded),
            None,
            Some(body),
        )
        .await?;
        Ok(())
    }

    async fn sign_in(&self, identity: &Identity, device_id: &str) -> Result<Session> {
        let body = serde_json::json!({
            "publicKey": identity.public_key,
            "deviceId": device_id,
        });

        let result = self.request("POST", "/v1/auth/sign-in", None, Some(body)).await?;

        let session_id = result["sessionId"]
            .as_str()
            .or_else(|| result["session"]["id"].as_str())
            .context("sign-in response missing sessionId")?
            .to_string();

        Ok(Session::online(session_id))
    }

    async fn get_token_by_session(&self, session_id: &str) -> Result<AccessToken> {
        let body = serde_json::json!({ "sessionId": session_id });
        let result = self.request("POST", "/v1/auth/token", None, Some(body)).await?;
        Self::parse_token(&result)
    }

    async fn notify_transfer_complete(
        &self,
        bearer_token: &str,
        completion: &TransferCompletion,
    ) -> Result<NotifyOutcome> {
        let encoded = urlencoding::encode(&completion.transfer_id);
        let body = serde_json::json!({
            "sourceDeviceId": completion.source_device_id,
            "publicKey": completion.public_key,
            "transferCode": completion.transfer_code,
        });

        let result = self
            .request(
                "POST",
                &format!("/v1/transfers/{}/complete", encoded),
                Some(bearer_token),
                Some(body),
            )
            .await?;

        Ok(NotifyOutcome {
            success: result["success"].as_bool().unwrap_or(true),
        })
    }
}

// ─── Connectivity Probe ──────────────────────────────────────────

/// Reachability check against the directory's health endpoint.
pub struct DirectoryProbe {
    api_url: String,
    http: Client,
}

impl DirectoryProbe {
    pub fn new(api_url: String) -> Self {
        Self {
            api_url,
            http: Client::new(),
        }
    }
}

#[async_trait]
impl Connectivity for DirectoryProbe {
    async fn check_if_offline(&self) -> bool {
        let url = format!("{}/v1/health", self.api_url);
        let resp = self
            .http
            .get(&url)
            .timeout(std::time::Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
            .await;

        match resp {
            // Any response at all means the directory is reachable,
            // even an unhealthy one.
            Ok(_) => false,
            Err(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_token_with_expiry() {
        let value = serde_json::json!({
            "token": "abc",
            "expiresAt": "2099-01-01T00:00:00Z",
        });
        let token = DirectoryHttpClient::parse_token(&value).unwrap();
        assert_eq!(token.token, "abc");
        assert!(token.is_valid());
    }

    #[test]
    fn test_parse_token_defaults_expiry_when_missing() {
        let value = serde_json::json!({ "accessToken": "xyz" });
        let token = DirectoryHttpClient::parse_token(&value).unwrap();
        assert_eq!(token.token, "xyz");
        assert!(token.is_valid());
    }

    #[test]
    fn test_parse_token_rejects_missing_or_empty_token() {
        // A success response without a usable token must not mint a
        // "valid" empty bearer.
        let missing = serde_json::json!({ "expiresAt": "2099-01-01T00:00:00Z" });
        assert!(DirectoryHttpClient::parse_token(&missing).is_err());

        let empty = serde_json::json!({ "token": "" });
        assert!(DirectoryHttpClient::parse_token(&empty).is_err());
    }
}
