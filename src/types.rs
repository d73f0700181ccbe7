use std::collections::BTreeSet;
use std::fmt::{Display, Formatter, Result as FormatterResult};

new_type![
    /// An opaque identifier for an association shared between a Relying Party and a Provider.
    ///
    /// Handles are not secret; they travel in the clear so that the receiving party can look up
    /// the corresponding signing key.
    AssociationHandle(String)
];

new_type![
    /// The identifier a client (consumer) was registered under with the authorization server.
    ClientIdentifier(String)
];

new_type![
    /// The username of the account that granted an authorization.
    Username(String)
];

new_secret_type![
    /// A long-lived master secret from which a stateless ("dumb" mode) Provider derives
    /// per-handle verification secrets.
    MasterSecret(Vec<u8>)
];

/// Protocol versions understood by this crate.
///
/// The ordering is meaningful: message parts declare a minimum version, and newer versions
/// admit stronger association types.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[non_exhaustive]
pub enum ProtocolVersion {
    /// OpenID Authentication 1.0.
    V1_0,
    /// OpenID Authentication 1.1.
    V1_1,
    /// OpenID Authentication 2.0.
    V2_0,
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter) -> FormatterResult {
        let s = match self {
            ProtocolVersion::V1_0 => "1.0",
            ProtocolVersion::V1_1 => "1.1",
            ProtocolVersion::V2_0 => "2.0",
        };
        f.write_str(s)
    }
}

/// A set of authorization scopes, serialized on the wire as a space-delimited string.
///
/// Scope comparison is case-sensitive per RFC 6749 section 3.3.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    /// Create an empty scope set.
    pub fn new() -> Self {
        ScopeSet(BTreeSet::new())
    }

    /// Parse a space-delimited scope string. Repeated scopes collapse to one entry.
    pub fn from_space_delimited(s: &str) -> Self {
        ScopeSet(
            s.split(' ')
                .filter(|scope| !scope.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        )
    }

    /// Add a scope to the set.
    pub fn insert(&mut self, scope: impl Into<String>) {
        self.0.insert(scope.into());
    }

    /// Whether every scope in this set also appears in `granted`.
    ///
    /// An empty set is a subset of anything, including another empty set.
    pub fn is_subset_of(&self, granted: &ScopeSet) -> bool {
        self.0.is_subset(&granted.0)
    }

    /// Whether no scopes are present.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate the scopes in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Display for ScopeSet {
    fn fmt(&self, f: &mut Formatter) -> FormatterResult {
        let joined = self
            .0
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        f.write_str(&joined)
    }
}
