//! The data adaptor (C4): turns raw IdP records into validated LDAP entries, synthesising
//! derived groups and the bidirectional `member`/`memberOf` closure along the way.

use crate::attrs::{attribute_map, AttributeMap, AttributeMapExt};
use crate::config::Config;
use crate::oauth::{RawGroup, RawUser};
use crate::schema;

/// An original, primary, or mirror group mid-pipeline, before schema validation.
struct WorkingGroup {
    oauth_id: Option<String>,
    cn: String,
    description: String,
    gid_number: i64,
    member: Vec<String>,
    member_uid: Vec<String>,
    member_of: Vec<String>,
    classes: &'static [&'static str],
}

struct WorkingUser {
    raw: RawUser,
    member_of: Vec<String>,
}

fn user_dn(cn: &str, root_dn: &str) -> String {
    format!("CN={cn},OU=users,{root_dn}")
}

fn group_dn(cn: &str, root_dn: &str) -> String {
    format!("CN={cn},OU=groups,{root_dn}")
}

/// Runs the full C4 algorithm and returns `(validated_groups, validated_users)`, both in
/// the ingestion order C2 returned them in.
#[must_use]
pub fn build_entries(
    groups: Vec<RawGroup>,
    users: Vec<RawUser>,
    config: &Config,
) -> (Vec<AttributeMap>, Vec<AttributeMap>) {
    let root_dn = config.root_dn();

    // Step 1: member from memberUid, for the original groups.
    let mut working_groups: Vec<WorkingGroup> = groups
        .into_iter()
        .map(|g| WorkingGroup {
            member: g
                .member_uid
                .iter()
                .map(|cn| user_dn(cn, &root_dn))
                .collect(),
            oauth_id: Some(g.oauth_id),
            cn: g.cn,
            description: g.description,
            gid_number: g.gid_number,
            member_uid: g.member_uid,
            member_of: Vec::new(),
            classes: &["groupOfNames", "posixGroup", "memberOf", "oauthEntry"],
        })
        .collect();

    // Step 2: primary groups, one per user, mirroring the user itself.
    if config.enable_primary_groups {
        for user in &users {
            working_groups.push(WorkingGroup {
                oauth_id: None,
                cn: user.cn.clone(),
                description: user.description.clone(),
                gid_number: user.gid_number,
                member: vec![user_dn(&user.cn, &root_dn)],
                member_uid: vec![user.cn.clone()],
                member_of: Vec::new(),
                classes: &["groupOfNames", "posixGroup", "memberOf"],
            });
        }
    }

    // Step 3: mirror groups-of-groups, one per original group, only when both flags hold.
    if config.enable_primary_groups && config.enable_mirrored_groups {
        let original_count = working_groups
            .iter()
            .filter(|g| g.oauth_id.is_some())
            .count();
        let mirrors: Vec<WorkingGroup> = working_groups
            .iter()
            .take(original_count)
            .map(|g| WorkingGroup {
                oauth_id: None,
                cn: format!("Primary user groups for {}", g.cn),
                description: format!("Primary user groups for {}", g.cn),
                gid_number: g.gid_number,
                member: g
                    .member
                    .iter()
                    .map(|dn| dn.replacen("OU=users", "OU=groups", 1))
                    .collect(),
                member_uid: Vec::new(),
                member_of: Vec::new(),
                classes: &["groupOfNames", "memberOf"],
            })
            .collect();
        working_groups.extend(mirrors);
    }

    // Step 4: memberOf as the transpose of member, over users and the full group set.
    let group_dns: Vec<String> = working_groups
        .iter()
        .map(|g| group_dn(&g.cn, &root_dn))
        .collect();

    let mut working_users: Vec<WorkingUser> = users
        .into_iter()
        .map(|raw| {
            let dn = user_dn(&raw.cn, &root_dn);
            let member_of = working_groups
                .iter()
                .zip(&group_dns)
                .filter(|(g, _)| g.member.contains(&dn))
                .map(|(_, gdn)| gdn.clone())
                .collect();
            WorkingUser { raw, member_of }
        })
        .collect();

    for index in 0..working_groups.len() {
        let this_dn = group_dns[index].clone();
        let member_of = working_groups
            .iter()
            .zip(&group_dns)
            .filter(|(g, gdn)| **gdn != this_dn && g.member.contains(&this_dn))
            .map(|(_, gdn)| gdn.clone())
            .collect();
        working_groups[index].member_of = member_of;
    }

    // Step 6: domain verification, applied to users before step 7 validation.
    if config.enable_user_domain_verification {
        working_users.retain(|u| {
            let keep = u.raw.domain == config.domain;
            if !keep {
                log::info!(
                    "dropping user {} ({}): domain {} does not match configured domain {}",
                    u.raw.cn,
                    u.raw.oauth_id,
                    u.raw.domain,
                    config.domain
                );
            }
            keep
        });
    }

    // Step 7: schema validation; invalid records are dropped with a logged diagnostic.
    let validated_groups = working_groups
        .into_iter()
        .filter_map(|g| {
            let candidate = group_candidate(&g);
            match schema::validate_record(&candidate, g.classes) {
                Ok(record) => Some(record),
                Err(diagnostic) => {
                    log::warn!("dropping group {}: {diagnostic}", g.cn);
                    None
                }
            }
        })
        .collect();

    let validated_users = working_users
        .into_iter()
        .filter_map(|u| {
            let candidate = user_candidate(&u);
            let classes: &[&str] = &["inetOrgPerson", "posixAccount", "memberOf", "oauthEntry"];
            match schema::validate_record(&candidate, classes) {
                Ok(record) => Some(record),
                Err(diagnostic) => {
                    log::warn!("dropping user {}: {diagnostic}", u.raw.cn);
                    None
                }
            }
        })
        .collect();

    (validated_groups, validated_users)
}

fn group_candidate(g: &WorkingGroup) -> AttributeMap {
    let mut pairs = vec![
        ("cn", vec![g.cn.clone()]),
        ("description", vec![g.description.clone()]),
        ("gidNumber", vec![g.gid_number.to_string()]),
        ("member", g.member.clone()),
        ("memberUid", g.member_uid.clone()),
        ("memberOf", g.member_of.clone()),
    ];
    if let Some(oauth_id) = &g.oauth_id {
        pairs.push(("oauth_id", vec![oauth_id.clone()]));
    }
    attribute_map(pairs)
}

fn user_candidate(u: &WorkingUser) -> AttributeMap {
    let r = &u.raw;
    attribute_map(vec![
        ("cn", vec![r.cn.clone()]),
        ("sn", vec![r.sn.clone()]),
        ("description", vec![r.description.clone()]),
        ("uid", vec![r.uid.clone()]),
        ("uidNumber", vec![r.uid_number.to_string()]),
        ("gidNumber", vec![r.gid_number.to_string()]),
        ("homeDirectory", vec![r.home_directory.clone()]),
        ("displayName", vec![r.display_name.clone()]),
        ("givenName", vec![r.given_name.clone()]),
        ("mail", vec![r.mail.clone()]),
        ("memberOf", u.member_of.clone()),
        ("oauth_id", vec![r.oauth_id.clone()]),
        ("oauth_username", vec![r.oauth_username.clone()]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            domain: "example.org".to_string(),
            ..Config::default()
        }
    }

    fn raw_user(cn: &str, uid: i64, domain: &str) -> RawUser {
        RawUser {
            oauth_id: format!("id-{cn}"),
            oauth_username: cn.to_string(),
            cn: cn.to_string(),
            uid: cn.to_string(),
            uid_number: uid,
            gid_number: uid,
            display_name: cn.to_string(),
            given_name: cn.to_string(),
            sn: cn.to_string(),
            mail: String::new(),
            home_directory: format!("/home/{cn}"),
            domain: domain.to_string(),
            description: format!("id-{cn}"),
        }
    }

    #[test]
    fn primary_group_mirrors_the_user() {
        let config = config();
        let users = vec![raw_user("alice", 2000, "example.org")];
        let (groups, validated_users) = build_entries(Vec::new(), users, &config);

        assert_eq!(validated_users.len(), 1);
        let primary = groups
            .iter()
            .find(|g| g.get_ci("cn").unwrap().first().unwrap() == "alice")
            .unwrap();
        assert_eq!(
            primary.get_ci("memberUid").unwrap(),
            &vec!["alice".to_string()]
        );
        assert_eq!(
            primary.get_ci("member").unwrap(),
            &vec!["CN=alice,OU=users,DC=example,DC=org".to_string()]
        );
    }

    #[test]
    fn mirror_group_replaces_ou_users_with_ou_groups() {
        let config = config();
        let users = vec![raw_user("alice", 2000, "example.org"), raw_user("bob", 2001, "example.org")];
        let group = RawGroup {
            oauth_id: "g-1".to_string(),
            cn: "engineers".to_string(),
            description: "g-1".to_string(),
            gid_number: 3000,
            member_uid: vec!["alice".to_string(), "bob".to_string()],
        };
        let (groups, _) = build_entries(vec![group], users, &config);

        let mirror = groups
            .iter()
            .find(|g| g.get_ci("cn").unwrap().first().unwrap() == "Primary user groups for engineers")
            .unwrap();
        for dn in mirror.get_ci("member").unwrap() {
            assert!(dn.contains("OU=groups"));
            assert!(!dn.contains("OU=users"));
        }
    }

    #[test]
    fn member_of_is_the_transpose_of_member() {
        let config = config();
        let users = vec![raw_user("alice", 2000, "example.org")];
        let group = RawGroup {
            oauth_id: "g-1".to_string(),
            cn: "engineers".to_string(),
            description: "g-1".to_string(),
            gid_number: 3000,
            member_uid: vec!["alice".to_string()],
        };
        let (_, users) = build_entries(vec![group], users, &config);
        let alice = &users[0];
        let member_of = alice.get_ci("memberOf").unwrap();
        assert!(member_of
            .iter()
            .any(|dn| dn == "CN=engineers,OU=groups,DC=example,DC=org"));
    }

    #[test]
    fn domain_filter_drops_mismatched_users() {
        let config = config();
        let users = vec![
            raw_user("alice", 2000, "example.org"),
            raw_user("carol", 2001, "other.com"),
        ];
        let (_, validated_users) = build_entries(Vec::new(), users, &config);
        assert_eq!(validated_users.len(), 1);
        assert_eq!(
            validated_users[0].get_ci("cn").unwrap().first().unwrap(),
            "alice"
        );
    }

    #[test]
    fn domain_filter_disabled_keeps_everyone() {
        let mut config = config();
        config.enable_user_domain_verification = false;
        let users = vec![
            raw_user("alice", 2000, "example.org"),
            raw_user("carol", 2001, "other.com"),
        ];
        let (_, validated_users) = build_entries(Vec::new(), users, &config);
        assert_eq!(validated_users.len(), 2);
    }
}
