//! Keycloak backend.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::uid_cache::UidCache;

use super::{interpret_verify_error, retry_once, OAuthClient, RawGroup, RawUser};

const PAGE_SIZE: usize = 100;

pub struct KeycloakClient {
    http: reqwest::Client,
    base_url: String,
    realm: String,
    client_id: String,
    client_secret: String,
    domain_attribute: String,
    writeback_uids: bool,
    uid_cache: Arc<dyn UidCache>,
    token: Mutex<Option<String>>,
}

impl KeycloakClient {
    #[must_use]
    pub fn new(
        base_url: String,
        realm: String,
        client_id: String,
        client_secret: String,
        domain_attribute: String,
        writeback_uids: bool,
        uid_cache: Arc<dyn UidCache>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
            realm,
            client_id,
            client_secret,
            domain_attribute,
            writeback_uids,
            uid_cache,
            token: Mutex::new(None),
        }
    }

    fn token_url(&self) -> String {
        format!(
            "{}/realms/{}/protocol/openid-connect/token",
            self.base_url, self.realm
        )
    }

    fn admin_url(&self, path: &str) -> String {
        format!("{}/admin/realms/{}{path}", self.base_url, self.realm)
    }

    async fn fetch_token(&self) -> Result<String> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ];
        let response = self.http.post(self.token_url()).form(&params).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::IdpUnreachable(format!(
                "keycloak token endpoint returned {status}: {body}"
            )));
        }
        let json: Value = serde_json::from_str(&body)?;
        json.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::IdpUnreachable("keycloak token response missing access_token".to_string())
            })
    }

    async fn get(&self, url: &str) -> Result<Value> {
        let token = self.bearer_token().await?;
        let response = self.http.get(url).bearer_auth(token).send().await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(Value::Array(Vec::new())),
            StatusCode::UNAUTHORIZED => Err(Error::TokenExpired),
            status if status.is_success() => Ok(response.json().await?),
            status => Err(Error::IdpUnreachable(format!(
                "keycloak admin api returned {status} for {url}"
            ))),
        }
    }

    async fn put(&self, url: &str, body: &Value) -> Result<()> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .put(url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;
        match response.status() {
            StatusCode::UNAUTHORIZED => Err(Error::TokenExpired),
            status if status.is_success() => Ok(()),
            status => Err(Error::IdpUnreachable(format!(
                "keycloak admin api PUT returned {status} for {url}"
            ))),
        }
    }

    /// Pages through `{first=N&max=100&briefRepresentation=false}` until a short page.
    async fn get_paginated(&self, path: &str) -> Result<Vec<Value>> {
        let mut items = Vec::new();
        loop {
            let url = self.admin_url(&format!(
                "{path}?first={}&max={PAGE_SIZE}&briefRepresentation=false",
                items.len()
            ));
            let page = retry_once(self, || self.get(&url)).await?;
            let Value::Array(page) = page else {
                break;
            };
            let page_len = page.len();
            items.extend(page);
            if page_len != PAGE_SIZE {
                break;
            }
        }
        Ok(items)
    }
}

/// Reads a dotted-path attribute (`attributes.gid`) off a Keycloak admin-API record,
/// unwrapping a single-element list if the attribute holds one.
fn attribute_value<'a>(record: &'a Value, dotted_path: &str) -> Option<&'a Value> {
    let mut current = record;
    for part in dotted_path.split('.') {
        current = current.get(part)?;
    }
    match current {
        Value::Array(values) => values.first(),
        other => Some(other),
    }
}

fn attribute_str<'a>(record: &'a Value, dotted_path: &str) -> Option<&'a str> {
    attribute_value(record, dotted_path).and_then(Value::as_str)
}

fn attribute_int(record: &Value, dotted_path: &str) -> Option<i64> {
    attribute_value(record, dotted_path).and_then(|value| match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    })
}

#[async_trait]
impl OAuthClient for KeycloakClient {
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
        let raw_groups = self.get_paginated("/groups").await?;

        let mut groups = Vec::with_capacity(raw_groups.len());
        for mut group in raw_groups {
            let Some(id) = group.get("id").and_then(Value::as_str).map(str::to_string) else {
                log::warn!("keycloak group missing id, skipping: {group}");
                continue;
            };
            let name = group
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or(&id)
                .to_string();

            let gid_number = match attribute_int(&group, "attributes.gid") {
                Some(existing) => {
                    self.uid_cache.overwrite_uid(&id, "group", existing).await?;
                    existing
                }
                None => {
                    let allocated = self.uid_cache.get_uid(&id, "group", 3000).await?;
                    if self.writeback_uids {
                        if let Some(map) = group.as_object_mut() {
                            let attributes = map
                                .entry("attributes")
                                .or_insert_with(|| Value::Object(serde_json::Map::new()));
                            if let Some(attributes) = attributes.as_object_mut() {
                                attributes
                                    .insert("gid".to_string(), Value::Array(vec![Value::String(allocated.to_string())]));
                            }
                        }
                        let url = self.admin_url(&format!("/groups/{id}"));
                        retry_once(self, || self.put(&url, &group)).await?;
                    }
                    allocated
                }
            };

            let members_url = self.admin_url(&format!("/groups/{id}/members"));
            let members = retry_once(self, || self.get(&members_url)).await?;
            let member_uid = members
                .as_array()
                .map(|values| {
                    values
                        .iter()
                        .filter_map(|user| user.get("username").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();

            groups.push(RawGroup {
                oauth_id: id.clone(),
                cn: name,
                description: id,
                gid_number,
                member_uid,
            });
        }
        Ok(groups)
    }

    async fn users(&self) -> Result<Vec<RawUser>> {
        let mut raw_users = self.get_paginated("/users").await?;

        raw_users.sort_by(|a, b| {
            a.get("createdTimestamp")
                .and_then(Value::as_i64)
                .cmp(&b.get("createdTimestamp").and_then(Value::as_i64))
        });

        let mut users = Vec::with_capacity(raw_users.len());
        for mut user in raw_users {
            let Some(id) = user.get("id").and_then(Value::as_str).map(str::to_string) else {
                log::warn!("keycloak user missing id, skipping: {user}");
                continue;
            };
            let Some(username) = user
                .get("username")
                .and_then(Value::as_str)
                .map(str::to_string)
            else {
                log::warn!("keycloak user {id} missing username, skipping");
                continue;
            };

            let uid_number = match attribute_int(&user, "attributes.uid") {
                Some(existing) => {
                    self.uid_cache.overwrite_uid(&id, "user", existing).await?;
                    existing
                }
                None => {
                    let allocated = self.uid_cache.get_uid(&id, "user", 2000).await?;
                    if self.writeback_uids {
                        if let Some(map) = user.as_object_mut() {
                            let attributes = map
                                .entry("attributes")
                                .or_insert_with(|| Value::Object(serde_json::Map::new()));
                            if let Some(attributes) = attributes.as_object_mut() {
                                attributes.insert(
                                    "uid".to_string(),
                                    Value::Array(vec![Value::String(allocated.to_string())]),
                                );
                            }
                        }
                        let url = self.admin_url(&format!("/users/{id}"));
                        retry_once(self, || self.put(&url, &user)).await?;
                    }
                    allocated
                }
            };

            let first_name = user.get("firstName").and_then(Value::as_str).unwrap_or_default();
            let last_name = user.get("lastName").and_then(Value::as_str).unwrap_or_default();
            let display_name = [first_name, last_name]
                .into_iter()
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            let domain = attribute_str(&user, &format!("attributes.{}", self.domain_attribute))
                .unwrap_or_default()
                .to_string();

            users.push(RawUser {
                oauth_id: id.clone(),
                oauth_username: username.clone(),
                cn: username.clone(),
                uid: username.clone(),
                uid_number,
                gid_number: uid_number,
                display_name,
                given_name: first_name.to_string(),
                sn: last_name.to_string(),
                mail: user.get("email").and_then(Value::as_str).unwrap_or_default().to_string(),
                home_directory: format!("/home/{username}"),
                domain,
                description: id,
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
    fn attribute_int_unwraps_a_single_element_list() {
        let record = serde_json::json!({"attributes": {"gid": ["3005"]}});
        assert_eq!(attribute_int(&record, "attributes.gid"), Some(3005));
    }

    #[test]
    fn attribute_str_reads_a_configurable_domain_attribute() {
        let record = serde_json::json!({"attributes": {"domain": ["example.org"]}});
        assert_eq!(attribute_str(&record, "attributes.domain"), Some("example.org"));
    }

    #[test]
    fn attribute_value_is_none_when_the_path_is_absent() {
        let record = serde_json::json!({"attributes": {}});
        assert!(attribute_int(&record, "attributes.gid").is_none());
        assert!(attribute_str(&record, "attributes.domain").is_none());
    }
}
