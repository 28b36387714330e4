//! The schema validator (C3): a static table of object classes, each with a required/
//! optional field list, replacing the reflection-based class-name collection the system
//! this crate is modelled on uses in its source language.

use crate::attrs::{attribute_map, AttributeMap, AttributeMapExt};

pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
}

const fn field(name: &'static str, required: bool) -> FieldSpec {
    FieldSpec { name, required }
}

pub struct ObjectClass {
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

pub static PERSON: ObjectClass = ObjectClass {
    name: "person",
    fields: &[field("cn", true), field("sn", true)],
};

pub static ORGANIZATIONAL_PERSON: ObjectClass = ObjectClass {
    name: "organizationalPerson",
    fields: &[field("cn", true), field("sn", true), field("description", true)],
};

pub static INET_ORG_PERSON: ObjectClass = ObjectClass {
    name: "inetOrgPerson",
    fields: &[
        field("cn", true),
        field("sn", true),
        field("description", true),
        field("displayName", false),
        field("employeeNumber", false),
        field("givenName", false),
        field("mail", false),
        field("telephoneNumber", false),
    ],
};

pub static POSIX_ACCOUNT: ObjectClass = ObjectClass {
    name: "posixAccount",
    fields: &[
        field("cn", true),
        field("uid", true),
        field("uidNumber", true),
        field("gidNumber", true),
        field("homeDirectory", true),
    ],
};

pub static POSIX_GROUP: ObjectClass = ObjectClass {
    name: "posixGroup",
    fields: &[
        field("description", true),
        field("gidNumber", true),
        field("memberUid", true),
    ],
};

pub static GROUP_OF_NAMES: ObjectClass = ObjectClass {
    name: "groupOfNames",
    fields: &[field("cn", true), field("description", true), field("member", true)],
};

// `memberOf` is a derived, frequently-empty attribute: an entry that belongs to no group
// simply has none, so the field itself is not required.
pub static MEMBER_OF: ObjectClass = ObjectClass {
    name: "memberOf",
    fields: &[field("memberOf", false)],
};

pub static OAUTH_ENTRY: ObjectClass = ObjectClass {
    name: "oauthEntry",
    fields: &[field("oauth_id", true), field("oauth_username", false)],
};

/// `posixAccount`'s own id range, per `ldap_posix_account.py`: applies to both `uidNumber`
/// and `gidNumber` on an entry declaring this class.
const POSIX_ACCOUNT_ID_MIN: i64 = 2000;
const POSIX_ACCOUNT_ID_MAX: i64 = 60000;

/// `posixGroup`'s own `gidNumber` range, per `ldap_posix_group.py`. The floor matches
/// `posixAccount`'s rather than the allocator's group floor (3000) because a synthesised
/// primary user group carries its user's `gidNumber` and is validated against this class.
const POSIX_GROUP_ID_MIN: i64 = 2000;
const POSIX_GROUP_ID_MAX: i64 = 4_294_967_295;

#[must_use]
pub fn by_name(name: &str) -> Option<&'static ObjectClass> {
    match name {
        "person" => Some(&PERSON),
        "organizationalPerson" => Some(&ORGANIZATIONAL_PERSON),
        "inetOrgPerson" => Some(&INET_ORG_PERSON),
        "posixAccount" => Some(&POSIX_ACCOUNT),
        "posixGroup" => Some(&POSIX_GROUP),
        "groupOfNames" => Some(&GROUP_OF_NAMES),
        "memberOf" => Some(&MEMBER_OF),
        "oauthEntry" => Some(&OAUTH_ENTRY),
        _ => None,
    }
}

/// Builds the validated attribute map for a record declaring `class_names`, by unioning
/// each class's fields out of `candidate`. Returns a per-field diagnostic (never panics,
/// never aborts a rebuild) on the first missing required field or out-of-range id.
///
/// # Errors
///
/// Returns `Err(diagnostic)` naming the first missing required field, or the first
/// `uidNumber`/`gidNumber` found outside its object class's allowed range.
pub fn validate_record(
    candidate: &AttributeMap,
    class_names: &[&'static str],
) -> Result<AttributeMap, String> {
    let mut fields = Vec::new();
    let mut object_classes = vec!["top".to_string()];

    for name in class_names {
        let class = by_name(name).ok_or_else(|| format!("unknown object class `{name}`"))?;
        object_classes.push(class.name.to_string());
        for spec in class.fields {
            match candidate.get_ci(spec.name) {
                Some(values) => fields.push((spec.name, values.clone())),
                None if spec.required => {
                    return Err(format!(
                        "missing required field `{}` for object class `{}`",
                        spec.name, class.name
                    ))
                }
                None => {}
            }
        }
    }

    let mut output = attribute_map(fields.into_iter().map(|(k, v)| (k, v)).collect());
    output.set("objectClass", object_classes);

    if class_names.contains(&"posixAccount") {
        validate_id_range(&output, "uidNumber", POSIX_ACCOUNT_ID_MIN, POSIX_ACCOUNT_ID_MAX)?;
        validate_id_range(&output, "gidNumber", POSIX_ACCOUNT_ID_MIN, POSIX_ACCOUNT_ID_MAX)?;
        normalize_home_directory(&mut output);
    }
    if class_names.contains(&"posixGroup") {
        validate_id_range(&output, "gidNumber", POSIX_GROUP_ID_MIN, POSIX_GROUP_ID_MAX)?;
    }

    Ok(output)
}

/// Checks that `field` parses as an integer within `min..=max`, matching
/// `ldap_posix_account.py`'s/`ldap_posix_group.py`'s `validator`s on the same fields.
fn validate_id_range(map: &AttributeMap, field: &str, min: i64, max: i64) -> Result<(), String> {
    let value = map
        .get_ci(field)
        .and_then(|values| values.first())
        .ok_or_else(|| format!("missing required field `{field}`"))?;
    let parsed: i64 = value
        .parse()
        .map_err(|_| format!("field `{field}` = `{value}` is not an integer"))?;
    if parsed < min || parsed > max {
        return Err(format!("field `{field}` = {parsed} is outside the allowed range {min}..={max}"));
    }
    Ok(())
}

/// Lower-cases `homeDirectory` and replaces internal whitespace runs with `-`.
fn normalize_home_directory(map: &mut AttributeMap) {
    if let Some(values) = map.get("homeDirectory").cloned() {
        let normalized = values
            .into_iter()
            .map(|value| value.to_lowercase().split_whitespace().collect::<Vec<_>>().join("-"))
            .collect();
        map.insert("homeDirectory".to_string(), normalized);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(pairs: &[(&str, &str)]) -> AttributeMap {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), vec![(*v).to_string()]))
            .collect()
    }

    #[test]
    fn valid_posix_account_gets_top_plus_classes() {
        let input = candidate(&[
            ("cn", "alice"),
            ("uid", "alice"),
            ("uidNumber", "2000"),
            ("gidNumber", "2000"),
            ("homeDirectory", "/home/alice"),
            ("sn", "alice"),
            ("description", "abc-123"),
            ("oauth_id", "abc-123"),
        ]);
        let record = validate_record(&input, &["inetOrgPerson", "posixAccount", "oauthEntry"]).unwrap();
        let classes = record.get_ci("objectClass").unwrap();
        assert!(classes.contains(&"top".to_string()));
        assert!(classes.contains(&"posixAccount".to_string()));
        assert!(classes.contains(&"inetOrgPerson".to_string()));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let input = candidate(&[("cn", "alice")]);
        let err = validate_record(&input, &["posixAccount"]).unwrap_err();
        assert!(err.contains("uid"));
    }

    #[test]
    fn home_directory_is_lowercased_and_whitespace_collapsed() {
        let input = candidate(&[
            ("cn", "alice"),
            ("uid", "alice"),
            ("uidNumber", "2000"),
            ("gidNumber", "2000"),
            ("homeDirectory", "/Home/Alice Smith"),
        ]);
        let record = validate_record(&input, &["posixAccount"]).unwrap();
        assert_eq!(
            record.get_ci("homeDirectory").unwrap().first().unwrap(),
            "/home/alice-smith"
        );
    }

    #[test]
    fn posix_account_rejects_uid_number_above_the_hard_upper_bound() {
        let input = candidate(&[
            ("cn", "alice"),
            ("uid", "alice"),
            ("uidNumber", "60001"),
            ("gidNumber", "2000"),
            ("homeDirectory", "/home/alice"),
        ]);
        let err = validate_record(&input, &["posixAccount"]).unwrap_err();
        assert!(err.contains("uidNumber"));
    }

    #[test]
    fn posix_account_rejects_uid_number_below_the_floor() {
        let input = candidate(&[
            ("cn", "alice"),
            ("uid", "alice"),
            ("uidNumber", "1999"),
            ("gidNumber", "2000"),
            ("homeDirectory", "/home/alice"),
        ]);
        let err = validate_record(&input, &["posixAccount"]).unwrap_err();
        assert!(err.contains("uidNumber"));
    }

    #[test]
    fn posix_group_floor_allows_a_primary_group_gid_in_the_user_range() {
        let input = candidate(&[("description", "alice"), ("gidNumber", "2000"), ("memberUid", "alice")]);
        let record = validate_record(&input, &["posixGroup"]).unwrap();
        assert_eq!(record.get_ci("gidNumber").unwrap().first().unwrap(), "2000");
    }

    #[test]
    fn posix_group_accepts_gid_numbers_far_above_the_account_ceiling() {
        let input = candidate(&[("description", "engineers"), ("gidNumber", "4000000000"), ("memberUid", "alice")]);
        let record = validate_record(&input, &["posixGroup"]).unwrap();
        assert_eq!(
            record.get_ci("gidNumber").unwrap().first().unwrap(),
            "4000000000"
        );
    }

    #[test]
    fn posix_group_rejects_a_gid_number_below_its_floor() {
        let input = candidate(&[("description", "engineers"), ("gidNumber", "1999"), ("memberUid", "alice")]);
        let err = validate_record(&input, &["posixGroup"]).unwrap_err();
        assert!(err.contains("gidNumber"));
    }
}
