//! The refresh engine (C6): chooses between on-demand (per-lookup, TTL-gated) and
//! background-interval rebuild, and drives the data adaptor (C4) through the IdP client (C2)
//! to produce a new directory-tree generation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::adaptor;
use crate::config::Config;
use crate::directory::DirectoryTree;
use crate::error::{Error, Result};
use crate::oauth::OAuthClient;

/// Grounded on `OAuthLDAPTree.root`'s lazy TTL-gated rebuild (on-demand) and
/// `mvl-at-openkeg`'s `member_synchronization_task` (`tokio::time::interval` loop,
/// background).
pub struct RefreshEngine {
    config: Arc<Config>,
    client: Arc<dyn OAuthClient>,
    tree: Arc<DirectoryTree>,
    last_update: Mutex<Option<Instant>>,
}

impl RefreshEngine {
    #[must_use]
    pub fn new(config: Arc<Config>, client: Arc<dyn OAuthClient>, tree: Arc<DirectoryTree>) -> Self {
        Self {
            config,
            client,
            tree,
            last_update: Mutex::new(None),
        }
    }

    /// Runs the full rebuild: fetch groups/users from the IdP, run them through the data
    /// adaptor, build a fresh tree generation, and install it atomically.
    ///
    /// # Errors
    ///
    /// Propagates any [`Error`] raised while retrieving IdP state. The tree is left
    /// unmodified on failure — callers decide whether to serve the previous generation.
    pub async fn rebuild(&self) -> Result<()> {
        log::info!("retrieving oauth data");
        let groups = self.client.groups().await?;
        let users = self.client.users().await?;

        log::info!("rebuilding directory tree: {} groups, {} users", groups.len(), users.len());
        let (validated_groups, validated_users) = adaptor::build_entries(groups, users, &self.config);
        let root_dn = self.config.root_dn();
        let root = crate::directory::build_root(&root_dn, validated_groups, validated_users);
        self.tree.install(root).await;

        *self.last_update.lock().await = Some(Instant::now());
        log::info!("finished rebuilding directory tree");
        Ok(())
    }

    /// On-demand mode: called on the lookup path before every operation. A no-op in
    /// background-refresh mode, where lookups never trigger a rebuild. If the tree is stale
    /// (or has never been built) a synchronous rebuild runs on the calling path; if that
    /// rebuild fails, the previous generation (if any) is served and the error only logged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DirectoryUnavailable`] if a rebuild is required, fails, and no
    /// previous generation exists to fall back to.
    pub async fn ensure_fresh(&self) -> Result<()> {
        if self.config.background_refresh {
            return Ok(());
        }

        let interval = Duration::from_secs(self.config.refresh_interval_seconds);
        let stale = {
            let last_update = self.last_update.lock().await;
            match *last_update {
                None => true,
                Some(instant) => instant.elapsed() > interval,
            }
        };
        if !stale {
            return Ok(());
        }

        match self.rebuild().await {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.tree.current().await.is_some() {
                    log::error!("rebuild failed, serving previous directory generation: {err}");
                    Ok(())
                } else {
                    log::error!("rebuild failed and no previous directory generation exists: {err}");
                    Err(Error::DirectoryUnavailable)
                }
            }
        }
    }

    /// Spawns the background-interval rebuild task. A no-op unless `background_refresh` is
    /// set; the returned handle is intentionally discarded by callers — the task runs for
    /// the lifetime of the process.
    pub fn spawn_background(self: Arc<Self>) {
        if !self.config.background_refresh {
            return;
        }
        let interval = Duration::from_secs(self.config.refresh_interval_seconds);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; the initial rebuild already ran at startup.
            loop {
                ticker.tick().await;
                if let Err(err) = self.rebuild().await {
                    log::error!("background rebuild failed, tree remains at previous generation: {err}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::{RawGroup, RawUser};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingClient {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl OAuthClient for CountingClient {
        async fn bearer_token(&self) -> Result<String> {
            Ok("token".to_string())
        }

        async fn invalidate_token(&self) {}

        async fn groups(&self) -> Result<Vec<RawGroup>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::IdpUnreachable("down".to_string()));
            }
            Ok(Vec::new())
        }

        async fn users(&self) -> Result<Vec<RawUser>> {
            Ok(Vec::new())
        }

        async fn verify(&self, _username: &str, _password: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn config() -> Arc<Config> {
        Arc::new(Config {
            domain: "example.org".to_string(),
            refresh_interval_seconds: 60,
            ..Config::default()
        })
    }

    #[tokio::test]
    async fn ensure_fresh_rebuilds_once_when_stale() {
        let client = Arc::new(CountingClient { calls: AtomicUsize::new(0), fail: false });
        let tree = Arc::new(DirectoryTree::new("DC=example,DC=org".to_string()));
        let engine = RefreshEngine::new(config(), client.clone(), tree);

        engine.ensure_fresh().await.unwrap();
        engine.ensure_fresh().await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ensure_fresh_fails_with_directory_unavailable_when_no_previous_tree() {
        let client = Arc::new(CountingClient { calls: AtomicUsize::new(0), fail: true });
        let tree = Arc::new(DirectoryTree::new("DC=example,DC=org".to_string()));
        let engine = RefreshEngine::new(config(), client, tree);

        let err = engine.ensure_fresh().await.unwrap_err();
        assert!(matches!(err, Error::DirectoryUnavailable));
    }

    #[tokio::test]
    async fn ensure_fresh_serves_previous_tree_on_failed_rebuild() {
        let good_client = Arc::new(CountingClient { calls: AtomicUsize::new(0), fail: false });
        let tree = Arc::new(DirectoryTree::new("DC=example,DC=org".to_string()));
        let warm_engine = RefreshEngine::new(config(), good_client, tree.clone());
        warm_engine.rebuild().await.unwrap();
        assert!(tree.current().await.is_some());

        let failing_client: Arc<dyn OAuthClient> = Arc::new(CountingClient { calls: AtomicUsize::new(0), fail: true });
        let engine = RefreshEngine::new(config(), failing_client, tree.clone());
        *engine.last_update.lock().await = Some(Instant::now() - Duration::from_secs(120));

        engine.ensure_fresh().await.unwrap();
        assert!(tree.current().await.is_some());
    }

    #[tokio::test]
    async fn background_refresh_mode_never_rebuilds_on_lookup() {
        let client = Arc::new(CountingClient { calls: AtomicUsize::new(0), fail: false });
        let tree = Arc::new(DirectoryTree::new("DC=example,DC=org".to_string()));
        let config = Arc::new(Config {
            domain: "example.org".to_string(),
            background_refresh: true,
            ..Config::default()
        });
        let engine = RefreshEngine::new(config, client.clone(), tree);

        engine.ensure_fresh().await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
