//! JWT payload decoding without signature verification
//!
//! The access/id token is forwarded upstream as a bearer string; we never
//! validate its signature here. The payload is only a source of UX fields
//! (email, plan tier, subject, expiry) that degrade gracefully when absent.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;
use tracing::warn;

use crate::constants::PLAN_CLAIM_NAMESPACE;

/// Claims derived from a token payload. All fields default rather than fail
/// when the corresponding claim is missing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Claims {
    pub email: String,
    pub plan: String,
    pub user_id: String,
    /// Milliseconds since epoch, or 0 if absent/unparseable.
    pub expires_at_ms: u64,
}

/// Split a JWT on `.`, base64url-decode the payload segment, and pull out
/// the fields we care about. Returns default (empty) claims on any
/// decode/parse failure rather than propagating an error — a corrupt or
/// opaque token should never abort the caller.
pub fn decode_claims(token: &str) -> Claims {
    match try_decode(token) {
        Ok(claims) => claims,
        Err(reason) => {
            warn!(reason, "failed to decode token claims, using defaults");
            Claims {
                plan: "free".into(),
                ..Default::default()
            }
        }
    }
}

fn try_decode(token: &str) -> std::result::Result<Claims, String> {
    let mut parts = token.split('.');
    let _header = parts.next().ok_or("missing header segment")?;
    let payload = parts.next().ok_or("missing payload segment")?;

    let decoded = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| format!("base64 decode: {e}"))?;
    let value: Value =
        serde_json::from_slice(&decoded).map_err(|e| format!("json parse: {e}"))?;

    let email = value
        .get("email")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let user_id = value
        .get("sub")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let expires_at_ms = value
        .get("exp")
        .and_then(Value::as_u64)
        .map(|secs| secs.saturating_mul(1000))
        .unwrap_or(0);

    let plan = value
        .get(PLAN_CLAIM_NAMESPACE)
        .and_then(|ns| ns.get("chatgpt_plan_type"))
        .and_then(Value::as_str)
        .unwrap_or("free")
        .to_string();

    Ok(Claims {
        email,
        plan,
        user_id,
        expires_at_ms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_jwt(claims: &Value) -> String {
        let header = serde_json::json!({"alg": "none", "typ": "JWT"});
        let encode = |v: &Value| URL_SAFE_NO_PAD.encode(serde_json::to_vec(v).unwrap());
        format!("{}.{}.{}", encode(&header), encode(claims), "sig")
    }

    #[test]
    fn decodes_known_fields() {
        let claims = serde_json::json!({
            "email": "dev@example.com",
            "sub": "user-123",
            "exp": 1_800_000_000u64,
            PLAN_CLAIM_NAMESPACE: { "chatgpt_plan_type": "pro" },
        });
        let jwt = minimal_jwt(&claims);
        let decoded = decode_claims(&jwt);
        assert_eq!(decoded.email, "dev@example.com");
        assert_eq!(decoded.user_id, "user-123");
        assert_eq!(decoded.plan, "pro");
        assert_eq!(decoded.expires_at_ms, 1_800_000_000_000);
    }

    #[test]
    fn defaults_missing_plan_to_free() {
        let claims = serde_json::json!({ "email": "x@example.com", "sub": "u" });
        let jwt = minimal_jwt(&claims);
        let decoded = decode_claims(&jwt);
        assert_eq!(decoded.plan, "free");
        assert_eq!(decoded.expires_at_ms, 0);
    }

    #[test]
    fn malformed_token_yields_defaults_not_panic() {
        let decoded = decode_claims("not-a-jwt");
        assert_eq!(decoded.plan, "free");
        assert_eq!(decoded.email, "");
    }

    #[test]
    fn non_json_payload_yields_defaults() {
        let junk = URL_SAFE_NO_PAD.encode(b"not json");
        let jwt = format!("hdr.{junk}.sig");
        let decoded = decode_claims(&jwt);
        assert_eq!(decoded.plan, "free");
    }
}
