//! Public OAuth client configuration
//!
//! These values identify the public CLI OAuth client used to mint and
//! refresh tokens. They are not secrets — only the resulting access and
//! refresh tokens, managed by the token store, need protecting.

/// Public OAuth client ID for the CLI application.
pub const OAUTH_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// Token endpoint used for refresh-token exchange.
pub const TOKEN_ENDPOINT: &str = "https://auth.openai.com/oauth/token";

/// Claim key under which the upstream namespaces plan/account metadata in
/// the id token, e.g. `chatgpt_plan_type`, `chatgpt_account_id`.
pub const PLAN_CLAIM_NAMESPACE: &str = "https://api.openai.com/auth";
