//! HTTP client for the controller API, with retry on transient failures.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;

use stream_event::{
    HeartbeatRequest, HeartbeatResponse, LogLine, RegisterRequest, RegisterResponse, StatusUpdate,
};

use crate::error::AgentError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRIES: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(500);

pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    admin_token: Option<String>,
    /// Set after registration; shared across the heartbeat loop and test tasks.
    agent_token: std::sync::RwLock<Option<String>>,
}

impl ControllerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            admin_token: None,
            agent_token: std::sync::RwLock::new(None),
        })
    }

    /// Registration bearer (the controller admin token).
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    pub fn set_agent_token(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.agent_token.write() {
            *guard = Some(token.into());
        }
    }

    fn agent_token(&self) -> Option<String> {
        self.agent_token.read().ok().and_then(|g| g.clone())
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, AgentError> {
        self.post_json("/api/v1/agents/register", req, self.admin_token.as_deref())
            .await
    }

    pub async fn heartbeat(
        &self,
        agent_id: &str,
        req: &HeartbeatRequest,
    ) -> Result<HeartbeatResponse, AgentError> {
        self.post_json(
            &format!("/api/v1/agents/{agent_id}/heartbeat"),
            req,
            self.agent_token().as_deref(),
        )
        .await
    }

    pub async fn push_logs(&self, test_id: &str, batch: &[LogLine]) -> Result<(), AgentError> {
        let _: serde_json::Value = self
            .post_json(
                &format!("/api/v1/quicktest/{test_id}/logs"),
                &batch,
                self.agent_token().as_deref(),
            )
            .await?;
        Ok(())
    }

    pub async fn post_status(
        &self,
        test_id: &str,
        update: &StatusUpdate,
    ) -> Result<(), AgentError> {
        let _: serde_json::Value = self
            .post_json(
                &format!("/api/v1/quicktest/{test_id}/status"),
                update,
                self.agent_token().as_deref(),
            )
            .await?;
        Ok(())
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        bearer: Option<&str>,
    ) -> Result<T, AgentError> {
        let url = format!("{}{}", self.base_url, path);
        let mut attempt = 0u32;
        loop {
            let mut req = self.http.post(&url).json(body);
            if let Some(token) = bearer {
                req = req.bearer_auth(token);
            }
            match req.send().await {
                Ok(resp) => return Self::decode(resp).await,
                Err(e) if attempt + 1 < RETRIES && (e.is_timeout() || e.is_connect()) => {
                    attempt += 1;
                    let delay = RETRY_BASE * 2u32.saturating_pow(attempt - 1);
                    tracing::debug!(url = %url, attempt, ?delay, "request failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, AgentError> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AgentError::NotRegistered);
        }
        if !status.is_success() {
            let message = resp
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
                .unwrap_or_else(|| status.to_string());
            return Err(AgentError::Controller {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }
}
