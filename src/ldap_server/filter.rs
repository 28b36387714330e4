//! Minimal LDAP filter evaluator run against a single entry's attribute map. Stands in for
//! the in-memory LDAP server's own filter-matching code that the Python original delegates
//! to (`ldaptor.inmemory.ReadOnlyInMemoryLDAPEntry.search`); no crate in this dependency
//! stack ships an equivalent evaluator, so it is implemented directly here.

use ldap3_server::proto::LdapFilter;

use crate::attrs::{AttributeMap, AttributeMapExt};

/// Evaluates `filter` against `attributes`. Attribute-name matching is case-insensitive
/// (per LDAP rules); value matching for equality/substring filters is also
/// case-insensitive, matching typical LDAP server defaults for the string syntaxes every
/// attribute in this schema uses.
#[must_use]
pub fn matches(attributes: &AttributeMap, filter: &LdapFilter) -> bool {
    match filter {
        LdapFilter::And(filters) => filters.iter().all(|f| matches(attributes, f)),
        LdapFilter::Or(filters) => filters.iter().any(|f| matches(attributes, f)),
        LdapFilter::Not(inner) => !matches(attributes, inner),
        LdapFilter::Equality(name, value) => attributes
            .get_ci(name)
            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case(value))),
        LdapFilter::Present(name) => attributes.get_ci(name).is_some(),
        LdapFilter::Substring(name, substring) => attributes
            .get_ci(name)
            .is_some_and(|values| values.iter().any(|v| substring_matches(v, substring))),
        LdapFilter::GreaterOrEqual(name, value) => attributes
            .get_ci(name)
            .is_some_and(|values| values.iter().any(|v| compare_ci(v, value).is_ge())),
        LdapFilter::LessOrEqual(name, value) => attributes
            .get_ci(name)
            .is_some_and(|values| values.iter().any(|v| compare_ci(v, value).is_le())),
        LdapFilter::Approx(name, value) => attributes
            .get_ci(name)
            .is_some_and(|values| values.iter().any(|v| v.eq_ignore_ascii_case(value))),
        // Extensible-match filters are not needed by any entry this server synthesises.
        _ => false,
    }
}

fn compare_ci(a: &str, b: &str) -> std::cmp::Ordering {
    a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
}

fn substring_matches(value: &str, substring: &ldap3_server::proto::LdapSubstringFilter) -> bool {
    let value = value.to_ascii_lowercase();
    let mut rest = value.as_str();

    if let Some(initial) = &substring.initial {
        let initial = initial.to_ascii_lowercase();
        if !rest.starts_with(&initial) {
            return false;
        }
        rest = &rest[initial.len()..];
    }

    for any in &substring.any {
        let any = any.to_ascii_lowercase();
        match rest.find(&any) {
            Some(pos) => rest = &rest[pos + any.len()..],
            None => return false,
        }
    }

    if let Some(final_) = &substring.final_ {
        let final_ = final_.to_ascii_lowercase();
        if !rest.ends_with(&final_) {
            return false;
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::attribute_map;

    fn entry() -> AttributeMap {
        attribute_map(vec![
            ("cn", vec!["alice".to_string()]),
            ("objectClass", vec!["posixAccount".to_string(), "inetOrgPerson".to_string()]),
        ])
    }

    #[test]
    fn equality_matches_case_insensitively() {
        let filter = LdapFilter::Equality("cn".to_string(), "ALICE".to_string());
        assert!(matches(&entry(), &filter));
    }

    #[test]
    fn and_requires_every_branch() {
        let filter = LdapFilter::And(vec![
            LdapFilter::Equality("objectClass".to_string(), "posixAccount".to_string()),
            LdapFilter::Equality("cn".to_string(), "bob".to_string()),
        ]);
        assert!(!matches(&entry(), &filter));
    }

    #[test]
    fn present_checks_attribute_existence() {
        let filter = LdapFilter::Present("uidNumber".to_string());
        assert!(!matches(&entry(), &filter));
        let filter = LdapFilter::Present("cn".to_string());
        assert!(matches(&entry(), &filter));
    }
}
