//! On-disk account record schema
//!
//! Two JSON layouts are accepted on read: the current nested form, and a
//! legacy flat form that predates it. Both parse into the same in-memory
//! [`Tokens`]; writes always emit the nested form.

use serde::{Deserialize, Serialize};

/// Token material for one account, as held in memory and as written to disk
/// in the nested `{"tokens": {...}}` form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    pub id_token: String,
    pub access_token: String,
    pub refresh_token: String,
    pub account_id: String,
}

/// Full on-disk record: tokens plus a couple of optional sidecar fields
/// carried through unchanged for the external CLI's benefit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub tokens: Tokens,
    pub last_refresh: Option<String>,
    pub openai_api_key: Option<String>,
}

/// Nested shape: `{"tokens": {...}, "last_refresh": ..., "OPENAI_API_KEY": ...}`
#[derive(Serialize, Deserialize)]
struct NestedRecord {
    tokens: Tokens,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_refresh: Option<String>,
    #[serde(rename = "OPENAI_API_KEY", skip_serializing_if = "Option::is_none")]
    openai_api_key: Option<String>,
}

/// Legacy shape: the token fields live at the top level alongside the
/// sidecar fields.
#[derive(Deserialize)]
struct LegacyRecord {
    id_token: String,
    access_token: String,
    refresh_token: String,
    account_id: String,
    #[serde(default)]
    last_refresh: Option<String>,
    #[serde(rename = "OPENAI_API_KEY", default)]
    openai_api_key: Option<String>,
}

impl AccountRecord {
    /// Parse either the nested or legacy on-disk shape.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        if let Ok(nested) = serde_json::from_slice::<NestedRecord>(bytes) {
            return Ok(Self {
                tokens: nested.tokens,
                last_refresh: nested.last_refresh,
                openai_api_key: nested.openai_api_key,
            });
        }
        let legacy = serde_json::from_slice::<LegacyRecord>(bytes)?;
        Ok(Self {
            tokens: Tokens {
                id_token: legacy.id_token,
                access_token: legacy.access_token,
                refresh_token: legacy.refresh_token,
                account_id: legacy.account_id,
            },
            last_refresh: legacy.last_refresh,
            openai_api_key: legacy.openai_api_key,
        })
    }

    /// Always serialize in the nested form.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        let nested = NestedRecord {
            tokens: self.tokens.clone(),
            last_refresh: self.last_refresh.clone(),
            openai_api_key: self.openai_api_key.clone(),
        };
        serde_json::to_string_pretty(&nested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(suffix: &str) -> Tokens {
        Tokens {
            id_token: format!("id_{suffix}"),
            access_token: format!("at_{suffix}"),
            refresh_token: format!("rt_{suffix}"),
            account_id: format!("acct_{suffix}"),
        }
    }

    #[test]
    fn parses_nested_shape() {
        let json = serde_json::json!({
            "tokens": {
                "id_token": "id_1", "access_token": "at_1",
                "refresh_token": "rt_1", "account_id": "acct_1"
            },
            "last_refresh": "2026-07-01T00:00:00Z",
        });
        let record = AccountRecord::from_json(json.to_string().as_bytes()).unwrap();
        assert_eq!(record.tokens.access_token, "at_1");
        assert_eq!(record.last_refresh.as_deref(), Some("2026-07-01T00:00:00Z"));
    }

    #[test]
    fn parses_legacy_flat_shape() {
        let json = serde_json::json!({
            "id_token": "id_2", "access_token": "at_2",
            "refresh_token": "rt_2", "account_id": "acct_2",
            "OPENAI_API_KEY": "sk-legacy",
        });
        let record = AccountRecord::from_json(json.to_string().as_bytes()).unwrap();
        assert_eq!(record.tokens.access_token, "at_2");
        assert_eq!(record.openai_api_key.as_deref(), Some("sk-legacy"));
    }

    #[test]
    fn writes_are_always_nested() {
        let record = AccountRecord {
            tokens: tokens("3"),
            last_refresh: None,
            openai_api_key: None,
        };
        let json = record.to_json_pretty().unwrap();
        assert!(json.contains("\"tokens\""));
        assert!(json.contains("\"access_token\": \"at_3\""));
    }

    #[test]
    fn roundtrips_through_both_shapes() {
        let record = AccountRecord {
            tokens: tokens("4"),
            last_refresh: Some("now".into()),
            openai_api_key: Some("sk-4".into()),
        };
        let json = record.to_json_pretty().unwrap();
        let reparsed = AccountRecord::from_json(json.as_bytes()).unwrap();
        assert_eq!(reparsed, record);
    }
}
