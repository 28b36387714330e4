//! Microsoft Entra / MS Graph backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::uid_cache::UidCache;

use super::{interpret_verify_error, retry_once, OAuthClient, RawGroup, RawUser};

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Parses a Graph API `createdDateTime` (RFC 3339) for ascending-order sort, so that UID
/// allocation on first contact with an unordered IdP response is still deterministic.
/// Records with a missing or malformed timestamp sort first, matching `datetime.min`'s
/// "sorts before everything real" behaviour in the system this client is modelled on.
fn created_at(value: &Value) -> Option<DateTime<Utc>> {
    value
        .get("createdDateTime")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

pub struct EntraClient {
    http: reqwest::Client,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    uid_cache: Arc<dyn UidCache>,
    token: Mutex<Option<String>>,
}

impl EntraClient {
    #[must_use]
    pub fn new(
        tenant_id: String,
        client_id: String,
        client_secret: String,
        uid_cache: Arc<dyn UidCache>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            tenant_id,
            client_id,
            client_secret,
            uid_cache,
            token: Mutex::new(None),
        }
    }

    fn token_url(&self) -> String {
        format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant_id
        )
    }

    async fn fetch_token(&self) -> Result<String> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", "https://graph.microsoft.com/.default"),
        ];
        let response = self.http.post(self.token_url()).form(&params).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::IdpUnreachable(format!(
                "entra token endpoint returned {status}: {body}"
            )));
        }
        let json: Value = serde_json::from_str(&body)?;
        json.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::IdpUnreachable("entra token response missing access_token".to_string()))
    }

    /// Performs a GET against the Graph API, returning [`Error::TokenExpired`] on a 401 so
    /// the caller can invalidate and retry.
    async fn get(&self, url: &str) -> Result<Value> {
        let token = self.bearer_token().await?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(Value::Object(serde_json::Map::new())),
            StatusCode::UNAUTHORIZED => Err(Error::TokenExpired),
            status if status.is_success() => Ok(response.json().await?),
            status => Err(Error::IdpUnreachable(format!(
                "graph api returned {status} for {url}"
            ))),
        }
    }

    /// Follows `@odata.nextLink` until absent, collecting every page's `value` array.
    async fn get_paginated(&self, first_url: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        let mut next = Some(first_url.to_string());
        while let Some(url) = next {
            let page = retry_once(self, || self.get(&url)).await?;
            if let Some(values) = page.get("value").and_then(Value::as_array) {
                items.extend(values.iter().cloned());
            }
            next = page
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(items)
    }
}

#[async_trait]
impl OAuthClient for EntraClient {
    async fn bearer_token(&self) -> Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            return Ok(token.clone());
        }
        let token = self.fetch_token().await?;
        *guard = Some(token.clone());
        Ok(token)
    }

    async fn invalidate_token(&self) {
        *self.token.lock().await = None;
    }

    async fn groups(&self) -> Result<Vec<RawGroup>> {
        let url = format!(
            "{GRAPH_BASE}/groups?$select=createdDateTime,displayName,id&$top=999"
        );
        let mut raw_groups = self.get_paginated(&url).await?;
        raw_groups.sort_by_key(created_at);

        let mut groups = Vec::with_capacity(raw_groups.len());
        for group in raw_groups {
            let (Some(id), Some(display_name)) = (
                group.get("id").and_then(Value::as_str),
                group.get("displayName").and_then(Value::as_str),
            ) else {
                log::warn!("entra group missing id or displayName, skipping: {group}");
                continue;
            };

            let gid_number = self.uid_cache.get_uid(id, "group", 3000).await?;
            let members_url = format!("{GRAPH_BASE}/groups/{id}/members");
            let members = retry_once(self, || self.get(&members_url)).await?;
            let member_uid = members
                .get("value")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|user| user.get("userPrincipalName").and_then(Value::as_str))
                        .filter_map(|upn| upn.split('@').next())
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            groups.push(RawGroup {
                oauth_id: id.to_string(),
                cn: display_name.to_string(),
                description: id.to_string(),
                gid_number,
                member_uid,
            });
        }
        Ok(groups)
    }

    async fn users(&self) -> Result<Vec<RawUser>> {
        let url = format!(
            "{GRAPH_BASE}/users?$select=createdDateTime,displayName,givenName,id,surname,userPrincipalName&$top=999"
        );
        let mut raw_users = self.get_paginated(&url).await?;
        raw_users.sort_by_key(created_at);

        let mut users = Vec::with_capacity(raw_users.len());
        for user in raw_users {
            let Some(id) = user.get("id").and_then(Value::as_str) else {
                log::warn!("entra user missing id, skipping: {user}");
                continue;
            };
            let Some(upn) = user.get("userPrincipalName").and_then(Value::as_str) else {
                log::warn!("entra user {id} has no userPrincipalName, skipping");
                continue;
            };
            let Some((local_part, domain)) = upn.split_once('@') else {
                log::warn!("entra user {id} has a userPrincipalName with no domain, skipping");
                continue;
            };

            let uid_number = self.uid_cache.get_uid(id, "user", 2000).await?;

            users.push(RawUser {
                oauth_id: id.to_string(),
                // Entra's resource-owner password-credentials grant expects the full UPN
                // (`alice@example.org`), not the bare local part used for `cn`/`uid`.
                oauth_username: upn.to_string(),
                cn: user
                    .get("displayName")
                    .and_then(Value::as_str)
                    .unwrap_or(local_part)
                    .to_string(),
                uid: local_part.to_string(),
                uid_number,
                gid_number: uid_number,
                display_name: user
                    .get("displayName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                given_name: user
                    .get("givenName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                sn: user
                    .get("surname")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                mail: String::new(),
                home_directory: format!("/home/{local_part}"),
                domain: domain.to_string(),
                description: id.to_string(),
            });
        }
        Ok(users)
    }

    async fn verify(&self, username: &str, password: &str) -> Result<bool> {
        let params = [
            ("grant_type", "password"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("username", username),
            ("password", password),
            ("scope", "https://graph.microsoft.com/.default"),
        ];
        let response = self.http.post(self.token_url()).form(&params).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        let body = response.text().await?;
        interpret_verify_error(status, &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_at_parses_rfc3339_and_orders_ascending() {
        let older = serde_json::json!({"createdDateTime": "2024-01-01T00:00:00Z"});
        let newer = serde_json::json!({"createdDateTime": "2024-01-02T00:00:00Z"});
        assert!(created_at(&older) < created_at(&newer));
    }

    #[test]
    fn created_at_is_none_for_missing_or_malformed_timestamp() {
        assert!(created_at(&serde_json::json!({})).is_none());
        assert!(created_at(&serde_json::json!({"createdDateTime": "not-a-date"})).is_none());
    }

    #[test]
    fn missing_timestamp_sorts_before_a_real_one() {
        let mut values = vec![
            serde_json::json!({"createdDateTime": "2024-01-01T00:00:00Z"}),
            serde_json::json!({}),
        ];
        values.sort_by_key(created_at);
        assert_eq!(values[0], serde_json::json!({}));
    }
}
