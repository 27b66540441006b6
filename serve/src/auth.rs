//! Request authentication: the admin bearer for write endpoints, CSRF tokens
//! for browser-originated mutations, and per-agent bearer tokens.

use std::collections::HashSet;
use std::sync::Mutex;

use axum::http::HeaderMap;

use kitt::store::AgentRecord;
use kitt::KittError;

use crate::app::AppState;
use crate::error::ApiError;

pub const CSRF_HEADER: &str = "x-csrf-token";

/// Issued CSRF tokens for browser sessions.
#[derive(Default)]
pub struct CsrfTokens {
    issued: Mutex<HashSet<String>>,
}

impl CsrfTokens {
    pub fn issue(&self) -> String {
        use rand::Rng;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        let token = hex::encode(bytes);
        if let Ok(mut issued) = self.issued.lock() {
            issued.insert(token.clone());
        }
        token
    }

    pub fn verify(&self, token: &str) -> bool {
        self.issued
            .lock()
            .map(|issued| issued.contains(token))
            .unwrap_or(false)
    }
}

pub fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Authorizes a state-mutating request: a valid admin bearer, or a CSRF token
/// issued to a browser session when no bearer is supplied.
pub fn require_write(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    match bearer(headers) {
        Some(token) => {
            if constant_time_eq(&token, &state.admin_token) {
                Ok(())
            } else {
                Err(KittError::Auth("invalid bearer token".into()).into())
            }
        }
        None => match headers.get(CSRF_HEADER).and_then(|v| v.to_str().ok()) {
            Some(csrf) if state.csrf.verify(csrf) => Ok(()),
            Some(_) => Err(ApiError::Forbidden("csrf token mismatch".into())),
            None => Err(KittError::Auth("missing bearer token".into()).into()),
        },
    }
}

/// Authorizes an agent-authenticated call: the bearer must hash-match the
/// agent found by id (or by name, as the recovery path).
pub async fn require_agent(
    state: &AppState,
    agent_key: &str,
    headers: &HeaderMap,
) -> Result<AgentRecord, ApiError> {
    let token =
        bearer(headers).ok_or_else(|| ApiError::from(KittError::Auth("missing agent token".into())))?;
    let key = agent_key.to_string();
    let agent = state
        .ctrl
        .run_blocking(move |ctrl| ctrl.agents.authenticate(&key, &token))
        .await?;
    Ok(agent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csrf_round_trip() {
        let tokens = CsrfTokens::default();
        let t = tokens.issue();
        assert!(tokens.verify(&t));
        assert!(!tokens.verify("other"));
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            "Bearer secret-token".parse().unwrap(),
        );
        assert_eq!(bearer(&headers).as_deref(), Some("secret-token"));
        assert!(bearer(&HeaderMap::new()).is_none());
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
