//! The IdP client (C2): token acquisition, paginated retrieval of users and groups, and
//! delegated password verification. [`EntraClient`] and [`KeycloakClient`] are the two
//! concrete backends; the data adaptor (C4) only ever sees the [`OAuthClient`] trait.

pub mod entra;
pub mod keycloak;

use async_trait::async_trait;

use crate::error::{Error, Result};

/// A group as normalised from either backend, before the data adaptor's derived-group and
/// membership-closure steps run over it.
#[derive(Debug, Clone, Default)]
pub struct RawGroup {
    pub oauth_id: String,
    pub cn: String,
    pub description: String,
    pub gid_number: i64,
    pub member_uid: Vec<String>,
}

/// A user as normalised from either backend.
#[derive(Debug, Clone, Default)]
pub struct RawUser {
    pub oauth_id: String,
    pub oauth_username: String,
    pub cn: String,
    pub uid: String,
    pub uid_number: i64,
    pub gid_number: i64,
    pub display_name: String,
    pub given_name: String,
    pub sn: String,
    pub mail: String,
    pub home_directory: String,
    pub domain: String,
    pub description: String,
}

#[async_trait]
pub trait OAuthClient: Send + Sync {
    /// Returns a valid application-level access token, fetching and caching a fresh one
    /// on first use.
    async fn bearer_token(&self) -> Result<String>;

    /// Invalidates the cached bearer token, so the next [`OAuthClient::bearer_token`] call
    /// performs a fresh token exchange.
    async fn invalidate_token(&self);

    /// Retrieves every group known to the IdP, paginating as required by the backend.
    async fn groups(&self) -> Result<Vec<RawGroup>>;

    /// Retrieves every user known to the IdP, paginating as required by the backend.
    async fn users(&self) -> Result<Vec<RawUser>>;

    /// Performs a resource-owner password-credentials exchange to validate `username`'s
    /// `password`. Returns `Ok(false)` on an IdP-reported invalid-grant/invalid-client
    /// error; propagates any other failure.
    async fn verify(&self, username: &str, password: &str) -> Result<bool>;
}

/// Runs `attempt`, retrying exactly once — after invalidating `client`'s cached token — if
/// the first attempt fails with [`Error::TokenExpired`]. A bounded two-attempt retry, not
/// an unbounded decorator chain.
pub(crate) async fn retry_once<C, F, Fut, T>(client: &C, attempt: F) -> Result<T>
where
    C: OAuthClient + ?Sized,
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    match attempt().await {
        Err(Error::TokenExpired) => {
            client.invalidate_token().await;
            attempt().await
        }
        other => other,
    }
}

/// Interprets an OAuth token-endpoint error body (`{"error": "invalid_grant", ...}`) the
/// way `verify` is required to: invalid grant / invalid client yields `false`, anything
/// else propagates.
pub(crate) fn interpret_verify_error(status: reqwest::StatusCode, body: &str) -> Result<bool> {
    let code = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| value.get("error").and_then(|v| v.as_str()).map(str::to_string));

    match code.as_deref() {
        Some("invalid_grant") | Some("invalid_client") => Ok(false),
        _ => Err(Error::IdpUnreachable(format!(
            "token endpoint returned {status}: {body}"
        ))),
    }
}
