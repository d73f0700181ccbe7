//! The protocol-message data model: declarative part schemas, the protection bitset, and the
//! priority-ordered message factory.
//!
//! Message shapes are described by static tables of [`Part`] entries rather than by
//! downcasting through interface hierarchies; binding elements consult the description's
//! capability bitset to decide whether a message carries the fields they operate on.

use crate::kvform::KeyValueFormError;
use crate::types::{AssociationHandle, ProtocolVersion};

use chrono::{DateTime, Utc};
use thiserror::Error;

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter, Result as FormatterResult};
use std::ops::{BitOr, BitOrAssign};

#[cfg(test)]
mod tests;

/// Wire names for the protection slots shared across message kinds.
pub mod parts {
    /// The base64 signature over the signed fields.
    pub const SIGNATURE: &str = "sig";
    /// The comma-separated list of field names covered by the signature.
    pub const SIGNED_LIST: &str = "signed";
    /// The handle of the association used to produce the signature.
    pub const ASSOCIATION_HANDLE: &str = "assoc_handle";
    /// A handle the receiving party should discard as no longer recognized.
    pub const INVALIDATE_HANDLE: &str = "invalidate_handle";
    /// The replay-protection nonce.
    pub const NONCE: &str = "nonce";
    /// The message creation instant, RFC 3339 UTC.
    pub const CREATED: &str = "created";
}

/// The set of security properties applied to (or required of) a message.
///
/// This is a plain bitset so binding elements can report their contribution and the channel
/// can union contributions and compare against a requirement.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Protection(u8);

impl Protection {
    /// No protection.
    pub const NONE: Protection = Protection(0);
    /// Tamper protection via a signature.
    pub const TAMPER: Protection = Protection(1);
    /// Replay protection via a nonce checked against a store.
    pub const REPLAY: Protection = Protection(1 << 1);
    /// Expiration via a creation timestamp and maximum age.
    pub const EXPIRATION: Protection = Protection(1 << 2);
    /// All protections.
    pub const ALL: Protection = Protection(1 | 1 << 1 | 1 << 2);

    /// Whether every protection in `other` is present in `self`.
    pub fn contains(self, other: Protection) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether `self` and `other` share any protection.
    pub fn intersects(self, other: Protection) -> bool {
        self.0 & other.0 != 0
    }

    /// Whether no protection is present.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Protection {
    type Output = Protection;
    fn bitor(self, rhs: Protection) -> Protection {
        Protection(self.0 | rhs.0)
    }
}

impl BitOrAssign for Protection {
    fn bitor_assign(&mut self, rhs: Protection) {
        self.0 |= rhs.0;
    }
}

impl Display for Protection {
    fn fmt(&self, f: &mut Formatter) -> FormatterResult {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut names = Vec::new();
        if self.contains(Protection::TAMPER) {
            names.push("tamper-protection");
        }
        if self.contains(Protection::REPLAY) {
            names.push("replay-protection");
        }
        if self.contains(Protection::EXPIRATION) {
            names.push("expiration");
        }
        f.write_str(&names.join("+"))
    }
}

/// How a message travels between the two parties.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delivery {
    /// Sent synchronously between two trusted network endpoints.
    Direct,
    /// Routed through the user's browser via redirect; the intermediary is untrusted.
    Indirect,
}

/// The protection an individual part demands when present in a serialized message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartProtection {
    /// No per-field requirement.
    None,
    /// The field must be covered by the message signature.
    Signed,
    /// The field must travel encrypted (inside a DataBag or over TLS).
    Encrypted,
}

/// Declarative schema for one message part: the explicit table replacing reflection-driven
/// field mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Part {
    /// The field name on the wire.
    pub name: &'static str,
    /// Whether the part must be present.
    pub required: bool,
    /// Whether an empty value is acceptable.
    pub allow_empty: bool,
    /// The minimum protocol version at which this part may appear.
    pub min_version: ProtocolVersion,
    /// The protection the part demands when present.
    pub protection: PartProtection,
}

impl Part {
    /// A required part with default settings.
    pub const fn required(name: &'static str) -> Self {
        Part {
            name,
            required: true,
            allow_empty: false,
            min_version: ProtocolVersion::V1_0,
            protection: PartProtection::None,
        }
    }

    /// An optional part with default settings.
    pub const fn optional(name: &'static str) -> Self {
        Part {
            name,
            required: false,
            allow_empty: false,
            min_version: ProtocolVersion::V1_0,
            protection: PartProtection::None,
        }
    }

    /// Permit an empty value.
    pub const fn allow_empty(mut self) -> Self {
        self.allow_empty = true;
        self
    }

    /// Restrict the part to protocol versions at or above `version`.
    pub const fn since(mut self, version: ProtocolVersion) -> Self {
        self.min_version = version;
        self
    }

    /// Demand signature coverage when the part is present.
    pub const fn signed(mut self) -> Self {
        self.protection = PartProtection::Signed;
        self
    }

    /// Demand encryption when the part is present.
    pub const fn encrypted(mut self) -> Self {
        self.protection = PartProtection::Encrypted;
        self
    }
}

/// Static description of a message kind.
#[derive(Debug, PartialEq, Eq)]
pub struct MessageDescription {
    /// A short name for the message kind, used in logs and errors.
    pub kind: &'static str,
    /// Whether the message travels directly or through the user's browser.
    pub delivery: Delivery,
    /// The protection the channel must have applied before the message is trusted.
    pub required_protection: Protection,
    /// Which protection slots ([`parts::SIGNATURE`], [`parts::NONCE`], [`parts::CREATED`])
    /// this message carries fields for. Binding elements skip messages lacking their slot.
    pub capabilities: Protection,
    /// The part table.
    pub parts: &'static [Part],
}

/// An extension: a namespaced bundle of extra fields riding on a carrier message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Extension {
    /// The type URI identifying the extension.
    pub type_uri: String,
    /// The namespace alias used on the wire.
    pub alias: String,
    /// The extension's own fields, without the alias prefix.
    pub fields: BTreeMap<String, String>,
}

/// A protocol message: a named, versioned set of key/value parts described by a static
/// [`MessageDescription`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    description: &'static MessageDescription,
    version: ProtocolVersion,
    fields: BTreeMap<String, String>,
    extensions: Vec<Extension>,
}

impl Message {
    /// Create an empty message of the described kind.
    pub fn new(description: &'static MessageDescription, version: ProtocolVersion) -> Self {
        Message {
            description,
            version,
            fields: BTreeMap::new(),
            extensions: Vec::new(),
        }
    }

    /// Create a message from already-deserialized wire fields.
    pub fn from_fields(
        description: &'static MessageDescription,
        version: ProtocolVersion,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Message {
            description,
            version,
            fields,
            extensions: Vec::new(),
        }
    }

    /// The message's static description.
    pub fn description(&self) -> &'static MessageDescription {
        self.description
    }

    /// The protocol version the message was constructed for.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// Whether the message travels directly or through the user's browser.
    pub fn delivery(&self) -> Delivery {
        self.description.delivery
    }

    /// The protection the channel must achieve before this message is trusted.
    pub fn required_protection(&self) -> Protection {
        self.description.required_protection
    }

    /// Whether this message kind carries the fields for the given protection slot.
    pub fn supports(&self, protection: Protection) -> bool {
        self.description.capabilities.contains(protection)
    }

    /// Get a field value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Set a field value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Remove a field, returning its previous value.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.fields.remove(name)
    }

    /// Iterate fields in sorted (deterministic) order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Consume the message, returning its field map.
    pub fn into_fields(self) -> BTreeMap<String, String> {
        self.fields
    }

    /// Attach an extension.
    pub fn add_extension(&mut self, extension: Extension) {
        self.extensions.push(extension);
    }

    /// The extensions attached to this message.
    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// Remove and return all attached extensions.
    pub fn take_extensions(&mut self) -> Vec<Extension> {
        std::mem::take(&mut self.extensions)
    }

    /// Names of the parts that demand signature coverage and are present in this message.
    pub fn signed_critical_parts(&self) -> Vec<&'static str> {
        self.description
            .parts
            .iter()
            .filter(|part| {
                part.protection == PartProtection::Signed && self.fields.contains_key(part.name)
            })
            .map(|part| part.name)
            .collect()
    }

    /// Validate the message's structure against its part table: required parts present,
    /// emptiness rules honored, and no part used below its minimum protocol version.
    ///
    /// Outgoing construction errors are programmer errors and surface here, at call time.
    pub fn ensure_valid(&self) -> Result<(), ProtocolError> {
        for part in self.description.parts {
            let value = self.fields.get(part.name);
            if self.version < part.min_version {
                if value.is_some() {
                    return Err(ProtocolError::VersionTooLow {
                        field: part.name,
                        min: part.min_version,
                        actual: self.version,
                    });
                }
                continue;
            }
            match value {
                None if part.required => {
                    return Err(ProtocolError::MissingRequiredField(part.name));
                }
                Some(value) if value.is_empty() && !part.allow_empty => {
                    return Err(ProtocolError::EmptyField(part.name));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

/// A protocol-level rejection: the message is malformed, under-protected, or failed a
/// security check. Distinct from transport errors, and always fatal to the message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// A part the schema requires is absent.
    #[error("required field `{0}` is missing")]
    MissingRequiredField(&'static str),
    /// A part that may not be empty is empty.
    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),
    /// A part appeared below its minimum protocol version.
    #[error("field `{field}` requires protocol version {min} but the message is {actual}")]
    VersionTooLow {
        /// The offending field.
        field: &'static str,
        /// The field's minimum version.
        min: ProtocolVersion,
        /// The message's version.
        actual: ProtocolVersion,
    },
    /// Signature verification failed.
    #[error("message failed tamper protection checks")]
    TamperDetected,
    /// The message's nonce was seen before.
    #[error("message has already been processed")]
    Replayed,
    /// The message aged past its maximum lifetime.
    #[error("message expired at {expired_at}")]
    Expired {
        /// The instant the message ceased to be acceptable.
        expired_at: DateTime<Utc>,
    },
    /// The pipeline did not achieve the message's required protection.
    #[error("required protection ({required}) not achieved; only ({applied}) was applied")]
    Unprotected {
        /// What the message demands.
        required: Protection,
        /// What the binding elements reported.
        applied: Protection,
    },
    /// Two binding elements claimed the same protection; the pipeline is misassembled.
    #[error("more than one binding element applied {0}")]
    DuplicateProtection(Protection),
    /// A part demanding signature coverage was left out of the signed-parameter list.
    #[error("field `{0}` must be covered by the message signature")]
    UnsignedCriticalField(String),
    /// No association or verification secret is available for the named handle.
    #[error("association handle `{0}` is not recognized")]
    UnknownAssociationHandle(AssociationHandle),
    /// The message violates the protocol in some other way.
    #[error("malformed message: {0}")]
    Malformed(String),
    /// The message body was not valid Key-Value Form.
    #[error(transparent)]
    KeyValueForm(#[from] KeyValueFormError),
}

impl ProtocolError {
    /// The HTTP status a transport layer should translate this rejection into: 401 for
    /// security-check failures, 400 for everything else.
    pub fn http_status(&self) -> http::StatusCode {
        match self {
            ProtocolError::TamperDetected
            | ProtocolError::Replayed
            | ProtocolError::Expired { .. }
            | ProtocolError::Unprotected { .. }
            | ProtocolError::UnknownAssociationHandle(_) => http::StatusCode::UNAUTHORIZED,
            _ => http::StatusCode::BAD_REQUEST,
        }
    }
}

type Predicate = Box<dyn Fn(&BTreeMap<String, String>) -> bool + Send + Sync>;

/// A priority-ordered dispatch table mapping incoming field sets to message kinds.
///
/// Recognizers are evaluated top to bottom; the first whose predicate accepts the fields wins.
/// No match means "not a message this channel handles" rather than an error, since these
/// protocols routinely share endpoints with unrelated traffic.
#[derive(Default)]
pub struct MessageFactory {
    recognizers: Vec<(Predicate, &'static MessageDescription)>,
}

impl MessageFactory {
    /// Create an empty factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a recognizer. Order of registration is the order of evaluation, so register the
    /// most specific shapes first (e.g., the Diffie-Hellman variant of an association request
    /// before the plaintext variant).
    pub fn recognize<F>(mut self, predicate: F, description: &'static MessageDescription) -> Self
    where
        F: Fn(&BTreeMap<String, String>) -> bool + Send + Sync + 'static,
    {
        self.recognizers.push((Box::new(predicate), description));
        self
    }

    /// Pick the message kind for the given fields, if any recognizer matches.
    pub fn instantiate(
        &self,
        version: ProtocolVersion,
        fields: &BTreeMap<String, String>,
    ) -> Option<Message> {
        self.recognizers
            .iter()
            .find(|(predicate, _)| predicate(fields))
            .map(|(_, description)| Message::from_fields(description, version, fields.clone()))
    }
}
