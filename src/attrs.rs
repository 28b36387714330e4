//! Shared attribute-map type used by the schema validator, the data adaptor, and the
//! directory tree. Keys are the canonical LDAP attribute name (e.g. `objectClass`,
//! `uidNumber`); lookups are case-insensitive per LDAP attribute-name matching rules,
//! while the canonical case is preserved for encoding back onto the wire.

use std::collections::BTreeMap;

/// Ordered by attribute name so that two builds of the same record compare and serialise
/// identically across consecutive rebuilds of an unchanged IdP view.
pub type AttributeMap = BTreeMap<String, Vec<String>>;

pub trait AttributeMapExt {
    fn get_ci(&self, name: &str) -> Option<&Vec<String>>;
    fn first_ci(&self, name: &str) -> Option<&str>;
    fn set(&mut self, name: &str, values: Vec<String>);
}

impl AttributeMapExt for AttributeMap {
    fn get_ci(&self, name: &str) -> Option<&Vec<String>> {
        self.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }

    fn first_ci(&self, name: &str) -> Option<&str> {
        self.get_ci(name).and_then(|values| values.first()).map(String::as_str)
    }

    fn set(&mut self, name: &str, values: Vec<String>) {
        self.insert(name.to_string(), values);
    }
}

/// Builds an [`AttributeMap`] from `(name, value)` pairs, dropping pairs whose value is
/// empty. Convenience for assembling records in the adaptor.
#[must_use]
pub fn attribute_map(pairs: Vec<(&str, Vec<String>)>) -> AttributeMap {
    pairs
        .into_iter()
        .filter(|(_, values)| !values.is_empty())
        .map(|(key, values)| (key.to_string(), values))
        .collect()
}
