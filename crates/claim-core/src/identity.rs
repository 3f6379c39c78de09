//! Identity of the operating user/session.
//!
//! Sourced once by the surrounding process and threaded into the resolver;
//! nothing in the claim protocol reads the environment on its own.

use std::fmt::{self, Display, Formatter};

/// Environment variables consulted in order when deriving an identity.
pub const IDENTITY_ENV_VARS: [&str; 3] = ["USERNAME", "USER", "APPSTREAM_USER"];

/// Identity used when none of `IDENTITY_ENV_VARS` is populated.
pub const UNKNOWN_IDENTITY: &str = "unknown_user";

/// Case-normalized identity string. Opaque: only equality matters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity(String);

impl Identity {
    /// Normalize a raw identity (trimmed, lowercased).
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_lowercase())
    }

    /// Resolve from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve using an arbitrary variable lookup (first non-empty wins).
    ///
    /// Values are trimmed before the emptiness check, so a variable holding
    /// only whitespace is skipped rather than used as the identity.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        IDENTITY_ENV_VARS
            .iter()
            .filter_map(|name| lookup(name))
            .find(|value| !value.trim().is_empty())
            .map(|value| Self::new(&value))
            .unwrap_or_else(|| Self::new(UNKNOWN_IDENTITY))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the fallback identity.
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_IDENTITY
    }
}

impl Display for Identity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_normalizes_case() {
        assert_eq!(Identity::new("  Alice ").as_str(), "alice");
    }

    #[test]
    fn test_first_populated_variable_wins() {
        let id = Identity::from_lookup(lookup_from(&[("USER", "Bob"), ("APPSTREAM_USER", "carol")]));
        assert_eq!(id.as_str(), "bob");

        let id = Identity::from_lookup(lookup_from(&[("USERNAME", "Dave"), ("USER", "bob")]));
        assert_eq!(id.as_str(), "dave");
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let id = Identity::from_lookup(lookup_from(&[("USERNAME", ""), ("APPSTREAM_USER", "Eve")]));
        assert_eq!(id.as_str(), "eve");
    }

    #[test]
    fn test_whitespace_only_values_are_skipped() {
        let id = Identity::from_lookup(lookup_from(&[("USERNAME", "   "), ("USER", " Frank ")]));
        assert_eq!(id.as_str(), "frank");

        let id = Identity::from_lookup(lookup_from(&[("USERNAME", "\t")]));
        assert!(id.is_unknown());
    }

    #[test]
    fn test_defaults_to_unknown() {
        let id = Identity::from_lookup(lookup_from(&[]));
        assert!(id.is_unknown());
        assert_eq!(id.as_str(), UNKNOWN_IDENTITY);
    }
}
