//! Session identity from the bearer credential handed out by the auth service.

use crate::error::EngineError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::Deserialize;

#[derive(Deserialize)]
struct Claims {
    user_id: Option<serde_json::Value>,
    sub: Option<serde_json::Value>,
}

fn claim_to_string(v: serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Session id carried in a JWT-shaped token: `user_id` claim, else `sub`.
///
/// The signature is not verified; the backend does that. Only the claims segment
/// is decoded.
pub fn session_id_from_token(token: &str) -> Result<String, EngineError> {
    let token = token.trim().trim_start_matches("Bearer ").trim();
    let mut parts = token.split('.');
    let claims = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(_), Some(claims), Some(_), None) if !claims.is_empty() => claims,
        _ => {
            return Err(EngineError::InvalidCredential(
                "not a three-part token".to_string(),
            ))
        }
    };
    let raw = URL_SAFE_NO_PAD
        .decode(claims.trim_end_matches('='))
        .map_err(|e| EngineError::InvalidCredential(format!("claims are not base64url: {}", e)))?;
    let claims: Claims = serde_json::from_slice(&raw)
        .map_err(|e| EngineError::InvalidCredential(format!("claims are not JSON: {}", e)))?;
    claims
        .user_id
        .and_then(claim_to_string)
        .or_else(|| claims.sub.and_then(claim_to_string))
        .ok_or_else(|| EngineError::InvalidCredential("no user_id or sub claim".to_string()))
}

/// Pick the session id: explicit id, then MOYO_SESSION_ID env, then the id inside
/// the token (argument or MOYO_AUTH_TOKEN env).
pub fn resolve_session_id(
    explicit: Option<&str>,
    token: Option<&str>,
) -> Result<String, EngineError> {
    if let Some(id) = explicit.map(str::trim).filter(|s| !s.is_empty()) {
        return Ok(id.to_string());
    }
    if let Some(id) = env_value("MOYO_SESSION_ID") {
        return Ok(id);
    }
    match token.map(str::to_string).or_else(|| env_value("MOYO_AUTH_TOKEN")) {
        Some(t) => session_id_from_token(&t),
        None => Err(EngineError::InvalidCredential(
            "no session id or auth token provided".to_string(),
        )),
    }
}

/// Bearer credential from the argument or MOYO_AUTH_TOKEN env.
pub fn resolve_token(token: Option<&str>) -> Option<String> {
    token
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .or_else(|| env_value("MOYO_AUTH_TOKEN"))
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
