// Keg, the lightweight backend of the Musikverein Leopoldsdorf.
// Copyright (C) 2022  Richard Stöckl
//
// This program is free software; you can redistribute it and/or
// modify it under the terms of the GNU General Public License
// as published by the Free Software Foundation; either version 2
// of the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program; if not, write to the Free Software
// Foundation, Inc., 51 Franklin Street, Fifth Floor, Boston, MA  02110-1301, USA.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Profile,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Which IdP backend to pull users and groups from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    MicrosoftEntra,
    Keycloak,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub backend: Option<Backend>,
    pub client_id: String,
    pub client_secret: String,
    pub domain: String,
    pub port: u16,

    #[serde(default = "default_true")]
    pub allow_anonymous_binds: bool,
    #[serde(default = "default_true")]
    pub enable_primary_groups: bool,
    #[serde(default = "default_true")]
    pub enable_mirrored_groups: bool,
    #[serde(default = "default_true")]
    pub enable_user_domain_verification: bool,

    #[serde(default)]
    pub background_refresh: bool,
    #[serde(default = "default_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,

    #[serde(default = "default_tls_port")]
    pub tls_port: u16,
    pub tls_certificate_path: Option<String>,
    pub tls_private_key_path: Option<String>,

    pub entra_tenant_id: Option<String>,

    pub keycloak_base_url: Option<String>,
    pub keycloak_realm: Option<String>,
    #[serde(default = "default_keycloak_domain_attribute")]
    pub keycloak_domain_attribute: String,
    #[serde(default = "default_true")]
    pub keycloak_writeback_uids: bool,

    pub redis_host: Option<String>,
    pub redis_port: Option<u16>,
}

const fn default_true() -> bool {
    true
}

const fn default_refresh_interval_seconds() -> u64 {
    60
}

const fn default_tls_port() -> u16 {
    1636
}

fn default_keycloak_domain_attribute() -> String {
    "domain".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: None,
            client_id: String::new(),
            client_secret: String::new(),
            domain: String::new(),
            port: 1389,
            allow_anonymous_binds: default_true(),
            enable_primary_groups: default_true(),
            enable_mirrored_groups: default_true(),
            enable_user_domain_verification: default_true(),
            background_refresh: false,
            refresh_interval_seconds: default_refresh_interval_seconds(),
            tls_port: default_tls_port(),
            tls_certificate_path: None,
            tls_private_key_path: None,
            entra_tenant_id: None,
            keycloak_base_url: None,
            keycloak_realm: None,
            keycloak_domain_attribute: default_keycloak_domain_attribute(),
            keycloak_writeback_uids: default_true(),
            redis_host: None,
            redis_port: None,
        }
    }
}

impl Config {
    /// Root DN derived from the configured domain, e.g. `a.b.c` -> `DC=a,DC=b,DC=c`.
    #[must_use]
    pub fn root_dn(&self) -> String {
        self.domain
            .split('.')
            .filter(|part| !part.is_empty())
            .map(|part| format!("DC={part}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Validates cross-field invariants not expressible through serde defaults alone.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if a required key is missing or TLS material is
    /// only partially configured.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(Error::ConfigInvalid("client_id is required".to_string()));
        }
        if self.client_secret.is_empty() {
            return Err(Error::ConfigInvalid(
                "client_secret is required".to_string(),
            ));
        }
        if self.domain.is_empty() {
            return Err(Error::ConfigInvalid("domain is required".to_string()));
        }

        match self.backend {
            Some(Backend::MicrosoftEntra) => {
                if self.entra_tenant_id.is_none() {
                    return Err(Error::ConfigInvalid(
                        "entra_tenant_id is required for the microsoft_entra backend".to_string(),
                    ));
                }
            }
            Some(Backend::Keycloak) => {
                if self.keycloak_base_url.is_none() || self.keycloak_realm.is_none() {
                    return Err(Error::ConfigInvalid(
                        "keycloak_base_url and keycloak_realm are required for the keycloak backend"
                            .to_string(),
                    ));
                }
            }
            None => {
                return Err(Error::ConfigInvalid(
                    "backend must be one of `microsoft_entra` or `keycloak`".to_string(),
                ));
            }
        }

        match (&self.tls_certificate_path, &self.tls_private_key_path) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::ConfigInvalid(
                    "tls_certificate_path and tls_private_key_path must both be set, or neither"
                        .to_string(),
                ));
            }
            _ => {}
        }

        Ok(())
    }
}

pub fn read_config() -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file("apricot.toml").nested())
        .merge(Env::prefixed("APRICOT_").global())
        .select(Profile::from_env_or("APRICOT_PROFILE", "default"))
}
