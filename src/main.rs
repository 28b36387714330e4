// Apricot, a read-only LDAP front-end over an OAuth/OIDC identity provider.
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

use std::sync::Arc;

use log::{error, info};

mod adaptor;
mod attrs;
mod config;
mod directory;
mod error;
mod ldap_server;
mod listener;
mod oauth;
mod refresh;
mod schema;
mod uid_cache;

use config::Backend;
use directory::DirectoryTree;
use oauth::entra::EntraClient;
use oauth::keycloak::KeycloakClient;
use oauth::OAuthClient;
use refresh::RefreshEngine;
use uid_cache::{LocalUidCache, RedisUidCache, UidCache};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match config::read_config().extract::<config::Config>() {
        Ok(config) => config,
        Err(err) => {
            error!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    if let Err(err) = config.validate() {
        error!("{err}");
        std::process::exit(1);
    }
    let config = Arc::new(config);

    let uid_cache: Arc<dyn UidCache> = match (&config.redis_host, config.redis_port) {
        (Some(host), Some(port)) => match RedisUidCache::new(host, port) {
            Ok(cache) => Arc::new(cache),
            Err(err) => {
                error!("failed to initialise the redis uid cache: {err}");
                std::process::exit(1);
            }
        },
        _ => Arc::new(LocalUidCache::new()),
    };

    let client: Arc<dyn OAuthClient> = match build_oauth_client(&config, uid_cache) {
        Ok(client) => client,
        Err(err) => {
            error!("failed to initialise the idp client: {err}");
            std::process::exit(1);
        }
    };

    let tree = Arc::new(DirectoryTree::new(config.root_dn()));
    let refresh = Arc::new(RefreshEngine::new(config.clone(), client.clone(), tree.clone()));

    if let Err(err) = refresh.rebuild().await {
        error!("initial directory rebuild failed, serving once a rebuild succeeds: {err}");
    }
    refresh.clone().spawn_background();

    info!("apricot started for domain {}", config.domain);
    let ctx = ldap_server::Context { config: config.clone(), tree, refresh, client };
    if let Err(err) = listener::run(ctx).await {
        error!("listener failed: {err}");
        std::process::exit(1);
    }
}

fn build_oauth_client(
    config: &Arc<config::Config>,
    uid_cache: Arc<dyn UidCache>,
) -> error::Result<Arc<dyn OAuthClient>> {
    match config.backend {
        Some(Backend::MicrosoftEntra) => Ok(Arc::new(EntraClient::new(
            config.entra_tenant_id.clone().unwrap_or_default(),
            config.client_id.clone(),
            config.client_secret.clone(),
            uid_cache,
        ))),
        Some(Backend::Keycloak) => Ok(Arc::new(KeycloakClient::new(
            config.keycloak_base_url.clone().unwrap_or_default(),
            config.keycloak_realm.clone().unwrap_or_default(),
            config.client_id.clone(),
            config.client_secret.clone(),
            config.keycloak_domain_attribute.clone(),
            config.keycloak_writeback_uids,
            uid_cache,
        ))),
        None => Err(error::Error::ConfigInvalid(
            "backend must be one of `microsoft_entra` or `keycloak`".to_string(),
        )),
    }
}
