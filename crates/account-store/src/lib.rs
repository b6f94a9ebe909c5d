//! Account store and OAuth refresh client
//!
//! Owns the on-disk `<home>/.codex/` layout (per-account credential
//! records, their metadata sidecar, and read-only passthrough of
//! `config.toml`) and the single OAuth operation the core performs at
//! runtime: refreshing an access token from its refresh token.
//!
//! Minting the first refresh token (the PKCE browser flow) and account
//! CRUD/labeling live outside this crate.

pub mod claims;
pub mod constants;
pub mod error;
pub mod oauth;
pub mod schema;
pub mod store;

pub use claims::{Claims, decode_claims};
pub use error::{Error, Result};
pub use oauth::{TokenResponse, refresh_token, refresh_token_at};
pub use schema::{AccountRecord, Tokens};
pub use store::{AccountMeta, AccountSummary, TokenStore};
