//! The directory tree (C5): an ordered, hierarchical store of LDAP entries rooted at the
//! configured domain DN, rebuilt wholesale by the refresh engine (C6) and looked up by the
//! LDAP protocol handler (C7).

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::attrs::{attribute_map, AttributeMap, AttributeMapExt};
use crate::error::{Error, Result};

/// Splits a DN string into its RDN components, most-specific first, e.g.
/// `"CN=alice,OU=users,DC=example,DC=org"` -> `["CN=alice", "OU=users", "DC=example", "DC=org"]`.
#[must_use]
pub fn split_rdns(dn: &str) -> Vec<String> {
    dn.split(',')
        .map(str::trim)
        .filter(|rdn| !rdn.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn rdns_equal_ci(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.eq_ignore_ascii_case(y))
}

/// A single node in the directory tree: a DN, its attribute map, and its children keyed by
/// lower-cased RDN text (case-insensitive matching, case-preserving storage — see
/// `SPEC_FULL.md`'s open question on LDAP attribute-name case sensitivity, which applies
/// equally to RDN matching here).
pub struct DirectoryEntry {
    pub dn: String,
    pub rdn: String,
    pub attributes: AttributeMap,
    children: BTreeMap<String, Arc<DirectoryEntry>>,
}

impl DirectoryEntry {
    #[must_use]
    pub fn new(dn: String, rdn: String, attributes: AttributeMap) -> Self {
        Self {
            dn,
            rdn,
            attributes,
            children: BTreeMap::new(),
        }
    }

    /// Adds `child` under `rdn`. If `rdn` is already present, logs and returns the existing
    /// child instead of overwriting it — mirrors `OAuthLDAPEntry.add_child`'s handling of
    /// `LDAPEntryAlreadyExists`.
    pub fn add_child(&mut self, rdn: String, child: DirectoryEntry) -> Arc<DirectoryEntry> {
        let key = rdn.to_ascii_lowercase();
        if let Some(existing) = self.children.get(&key) {
            log::warn!("refusing to add child '{rdn}' under '{}' as it already exists", self.dn);
            return existing.clone();
        }
        let arc = Arc::new(child);
        self.children.insert(key, arc.clone());
        arc
    }

    #[must_use]
    pub fn child(&self, rdn: &str) -> Option<&Arc<DirectoryEntry>> {
        self.children.get(&rdn.to_ascii_lowercase())
    }

    pub fn children(&self) -> impl Iterator<Item = &Arc<DirectoryEntry>> {
        self.children.values()
    }
}

/// Builds a fresh root entry for `root_dn` with the two fixed OUs attached and every
/// validated group/user attached underneath. Grounded on `OAuthLDAPTree.root`'s rebuild
/// sequence: `dcObject` root, `organizationalUnit` OUs, then one `addChild` per record.
#[must_use]
pub fn build_root(root_dn: &str, groups: Vec<AttributeMap>, users: Vec<AttributeMap>) -> Arc<DirectoryEntry> {
    let mut root = DirectoryEntry::new(
        root_dn.to_string(),
        root_dn.to_string(),
        attribute_map(vec![("objectClass", vec!["dcObject".to_string()])]),
    );

    let mut groups_ou = DirectoryEntry::new(
        format!("OU=groups,{root_dn}"),
        "OU=groups".to_string(),
        attribute_map(vec![
            ("ou", vec!["groups".to_string()]),
            ("objectClass", vec!["organizationalUnit".to_string()]),
        ]),
    );
    for group in groups {
        let cn = group.first_ci("cn").unwrap_or("unknown").to_string();
        let rdn = format!("CN={cn}");
        let dn = format!("{rdn},{}", groups_ou.dn);
        groups_ou.add_child(rdn.clone(), DirectoryEntry::new(dn, rdn, group));
    }

    let mut users_ou = DirectoryEntry::new(
        format!("OU=users,{root_dn}"),
        "OU=users".to_string(),
        attribute_map(vec![
            ("ou", vec!["users".to_string()]),
            ("objectClass", vec!["organizationalUnit".to_string()]),
        ]),
    );
    for user in users {
        let cn = user.first_ci("cn").unwrap_or("unknown").to_string();
        let rdn = format!("CN={cn}");
        let dn = format!("{rdn},{}", users_ou.dn);
        users_ou.add_child(rdn.clone(), DirectoryEntry::new(dn, rdn, user));
    }

    root.add_child("OU=groups".to_string(), groups_ou);
    root.add_child("OU=users".to_string(), users_ou);
    Arc::new(root)
}

/// Holds the currently-visible generation of the directory tree and swaps it atomically on
/// rebuild. Single writer (the refresh engine), many readers (connection handlers) — a
/// lookup started before a rebuild completes observes either the pre- or post-rebuild
/// generation in its entirety, never a hybrid, because [`DirectoryTree::current`] clones the
/// `Arc` under the lock and all subsequent traversal happens against that owned snapshot.
pub struct DirectoryTree {
    root_dn: String,
    generation: RwLock<Option<Arc<DirectoryEntry>>>,
}

impl DirectoryTree {
    #[must_use]
    pub fn new(root_dn: String) -> Self {
        Self {
            root_dn,
            generation: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn root_dn(&self) -> &str {
        &self.root_dn
    }

    /// Returns the entry generation currently visible to readers, if a rebuild has ever
    /// succeeded.
    pub async fn current(&self) -> Option<Arc<DirectoryEntry>> {
        self.generation.read().await.clone()
    }

    /// Atomically replaces the visible generation with `root`.
    pub async fn install(&self, root: Arc<DirectoryEntry>) {
        *self.generation.write().await = Some(root);
    }

    /// Resolves `dn` against the current generation, descending RDN by RDN from the root.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DirectoryUnavailable`] if no generation has ever been built, or
    /// [`Error::NoSuchObject`] if `dn` does not resolve within the current generation.
    pub async fn lookup(&self, dn: &str) -> Result<Arc<DirectoryEntry>> {
        let root = self.current().await.ok_or(Error::DirectoryUnavailable)?;
        self.lookup_in(&root, dn)
    }

    /// Resolves `dn` against an explicitly-supplied generation, bypassing the shared lock.
    /// Used by callers that already hold a snapshot (e.g. a search walking many DNs).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoSuchObject`] if `dn` does not resolve under `root`.
    pub fn lookup_in(&self, root: &Arc<DirectoryEntry>, dn: &str) -> Result<Arc<DirectoryEntry>> {
        let target = split_rdns(dn);
        let root_rdns = split_rdns(&self.root_dn);
        if target.len() < root_rdns.len() {
            return Err(Error::NoSuchObject(dn.to_string()));
        }
        let suffix = &target[target.len() - root_rdns.len()..];
        if !rdns_equal_ci(suffix, &root_rdns) {
            return Err(Error::NoSuchObject(dn.to_string()));
        }

        let mut current = root.clone();
        for rdn in target[..target.len() - root_rdns.len()].iter().rev() {
            current = current
                .child(rdn)
                .cloned()
                .ok_or_else(|| Error::NoSuchObject(dn.to_string()))?;
        }
        Ok(current)
    }

    /// Collects every descendant of `base` (inclusive) within `depth`, used by the LDAP
    /// protocol handler to implement scoped search without depending on an external
    /// in-memory-LDAP-backend crate.
    #[must_use]
    pub fn descendants(entry: &Arc<DirectoryEntry>, depth: SearchDepth) -> Vec<Arc<DirectoryEntry>> {
        match depth {
            SearchDepth::Base => vec![entry.clone()],
            SearchDepth::OneLevel => entry.children().cloned().collect(),
            SearchDepth::Subtree => {
                let mut out = vec![entry.clone()];
                for child in entry.children() {
                    out.extend(Self::descendants(child, SearchDepth::Subtree));
                }
                out
            }
        }
    }
}

/// Mirrors the three LDAP search scopes (`baseObject`, `singleLevel`, `wholeSubtree`)
/// without depending on the wire-protocol crate's own scope type at this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchDepth {
    Base,
    OneLevel,
    Subtree,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups() -> Vec<AttributeMap> {
        vec![attribute_map(vec![("cn", vec!["engineers".to_string()])])]
    }

    fn users() -> Vec<AttributeMap> {
        vec![attribute_map(vec![("cn", vec!["alice".to_string()])])]
    }

    #[test]
    fn dn_round_trips_through_split_and_join() {
        let dn = "CN=alice,OU=users,DC=example,DC=org";
        let rdns = split_rdns(dn);
        assert_eq!(rdns, vec!["CN=alice", "OU=users", "DC=example", "DC=org"]);
        assert_eq!(rdns.join(","), dn);
    }

    #[tokio::test]
    async fn lookup_resolves_a_user_under_the_users_ou() {
        let tree = DirectoryTree::new("DC=example,DC=org".to_string());
        tree.install(build_root("DC=example,DC=org", groups(), users())).await;

        let entry = tree.lookup("CN=alice,OU=users,DC=example,DC=org").await.unwrap();
        assert_eq!(entry.attributes.first_ci("cn").unwrap(), "alice");
    }

    #[tokio::test]
    async fn lookup_is_case_insensitive_on_rdns() {
        let tree = DirectoryTree::new("DC=example,DC=org".to_string());
        tree.install(build_root("DC=example,DC=org", groups(), users())).await;

        let entry = tree.lookup("cn=alice,ou=users,dc=example,dc=org").await.unwrap();
        assert_eq!(entry.attributes.first_ci("cn").unwrap(), "alice");
    }

    #[tokio::test]
    async fn lookup_before_any_rebuild_fails_with_directory_unavailable() {
        let tree = DirectoryTree::new("DC=example,DC=org".to_string());
        let err = tree.lookup("OU=users,DC=example,DC=org").await.unwrap_err();
        assert!(matches!(err, Error::DirectoryUnavailable));
    }

    #[tokio::test]
    async fn lookup_of_unknown_dn_fails_with_no_such_object() {
        let tree = DirectoryTree::new("DC=example,DC=org".to_string());
        tree.install(build_root("DC=example,DC=org", groups(), users())).await;

        let err = tree
            .lookup("CN=carol,OU=users,DC=example,DC=org")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchObject(_)));
    }

    #[tokio::test]
    async fn rebuild_swaps_the_whole_generation_atomically() {
        let tree = DirectoryTree::new("DC=example,DC=org".to_string());
        tree.install(build_root("DC=example,DC=org", groups(), users())).await;
        assert!(tree.lookup("CN=alice,OU=users,DC=example,DC=org").await.is_ok());

        tree.install(build_root("DC=example,DC=org", Vec::new(), Vec::new())).await;
        assert!(tree.lookup("CN=alice,OU=users,DC=example,DC=org").await.is_err());
    }

    #[test]
    fn adding_a_duplicate_rdn_keeps_the_first_child() {
        let mut parent = DirectoryEntry::new("OU=groups,DC=example,DC=org".to_string(), "OU=groups".to_string(), AttributeMap::new());
        parent.add_child(
            "CN=engineers".to_string(),
            DirectoryEntry::new("CN=engineers,OU=groups,DC=example,DC=org".to_string(), "CN=engineers".to_string(), attribute_map(vec![("gidNumber", vec!["1".to_string()])])),
        );
        parent.add_child(
            "CN=engineers".to_string(),
            DirectoryEntry::new("CN=engineers,OU=groups,DC=example,DC=org".to_string(), "CN=engineers".to_string(), attribute_map(vec![("gidNumber", vec!["2".to_string()])])),
        );
        let child = parent.child("cn=engineers").unwrap();
        assert_eq!(child.attributes.first_ci("gidNumber").unwrap(), "1");
    }
}
