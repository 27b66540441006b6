//! Thin client for remote commands against a running controller.

use anyhow::{bail, Context};
use serde_json::Value;

const DEFAULT_CONTROLLER: &str = "http://127.0.0.1:9100";

pub struct Api {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl Api {
    pub fn new(controller: Option<String>) -> Self {
        let base = controller
            .or_else(|| std::env::var("KITT_CONTROLLER_URL").ok())
            .unwrap_or_else(|| DEFAULT_CONTROLLER.to_string());
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            token: std::env::var("KITT_AUTH_TOKEN")
                .ok()
                .filter(|t| !t.trim().is_empty()),
        }
    }

    pub async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let req = self.http.get(format!("{}{}", self.base, path));
        Self::send(self.authed(req)).await
    }

    pub async fn post(&self, path: &str, body: &Value) -> anyhow::Result<Value> {
        let req = self.http.post(format!("{}{}", self.base, path)).json(body);
        Self::send(self.authed(req)).await
    }

    pub async fn delete(&self, path: &str) -> anyhow::Result<Value> {
        let req = self.http.delete(format!("{}{}", self.base, path));
        Self::send(self.authed(req)).await
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(req: reqwest::RequestBuilder) -> anyhow::Result<Value> {
        let resp = req.send().await.context("controller unreachable")?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("request failed");
            bail!("{status}: {message}");
        }
        Ok(body)
    }
}
