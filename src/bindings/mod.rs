//! Binding elements: the per-message security and serialization steps a channel composes into
//! its processing pipeline.
//!
//! Each element inspects a message, applies or verifies one concern, and reports the
//! [`Protection`] it contributed. `Ok(None)` means the element did not apply to this message
//! kind; any `Err` aborts the pipeline.

use crate::association::{Association, AssociationError, AssociationStore};
use crate::kvform::KeyValueFormEncoding;
use crate::message::{parts, Extension, Message, Protection, ProtocolError};
use crate::nonce::NonceStore;
use crate::types::{AssociationHandle, MasterSecret};

use base64::prelude::BASE64_STANDARD;
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use log::{debug, warn};
use rand::RngCore;

use std::collections::BTreeMap;
use std::sync::Arc;


/// One step in a channel's processing pipeline.
pub trait BindingElement: Send + Sync {
    /// A short name for logs.
    fn name(&self) -> &'static str;

    /// The protection this element is capable of contributing.
    fn protection(&self) -> Protection;

    /// Apply this element to an outgoing message. `Ok(None)` when the element does not apply
    /// to this message kind.
    fn process_outgoing(&self, message: &mut Message) -> Result<Option<Protection>, ProtocolError>;

    /// Verify this element's concern on an incoming message. `Ok(None)` when the element does
    /// not apply to this message kind.
    fn process_incoming(&self, message: &mut Message) -> Result<Option<Protection>, ProtocolError>;
}

/// Stamps a UTC creation instant outgoing and rejects incoming messages older than the
/// configured maximum age, with an allowance for clock skew between the parties.
pub struct ExpirationBindingElement {
    max_age: Duration,
    clock_skew: Duration,
}

impl ExpirationBindingElement {
    /// A maximum message age with a default five-minute skew allowance.
    pub fn new(max_age: Duration) -> Self {
        ExpirationBindingElement {
            max_age,
            clock_skew: Duration::minutes(5),
        }
    }

    /// Override the clock-skew allowance.
    pub fn set_clock_skew(mut self, clock_skew: Duration) -> Self {
        self.clock_skew = clock_skew;
        self
    }
}

impl BindingElement for ExpirationBindingElement {
    fn name(&self) -> &'static str {
        "expiration"
    }

    fn protection(&self) -> Protection {
        Protection::EXPIRATION
    }

    fn process_outgoing(&self, message: &mut Message) -> Result<Option<Protection>, ProtocolError> {
        if !message.supports(Protection::EXPIRATION) {
            return Ok(None);
        }
        message.set(
            parts::CREATED,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        Ok(Some(Protection::EXPIRATION))
    }

    fn process_incoming(&self, message: &mut Message) -> Result<Option<Protection>, ProtocolError> {
        if !message.supports(Protection::EXPIRATION) {
            return Ok(None);
        }
        let created = parse_created(message)?;
        let now = Utc::now();
        let expires_at = created + self.max_age + self.clock_skew;
        if now > expires_at {
            return Err(ProtocolError::Expired { expired_at: expires_at });
        }
        if created > now + self.clock_skew {
            return Err(ProtocolError::Malformed(format!(
                "message claims creation at {}, in the future",
                created
            )));
        }
        Ok(Some(Protection::EXPIRATION))
    }
}

fn parse_created(message: &Message) -> Result<DateTime<Utc>, ProtocolError> {
    let raw = message
        .get(parts::CREATED)
        .ok_or(ProtocolError::MissingRequiredField(parts::CREATED))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|created| created.with_timezone(&Utc))
        .map_err(|_| ProtocolError::Malformed(format!("unparseable creation timestamp `{}`", raw)))
}

/// Stamps a random nonce outgoing and consults a [`NonceStore`] incoming, rejecting any
/// nonce seen before within the validity window.
pub struct ReplayProtectionBindingElement {
    store: Arc<dyn NonceStore>,
    context: String,
}

impl ReplayProtectionBindingElement {
    /// `context` scopes this channel's nonces within a store shared across channels.
    pub fn new(store: Arc<dyn NonceStore>, context: impl Into<String>) -> Self {
        ReplayProtectionBindingElement {
            store,
            context: context.into(),
        }
    }
}

impl BindingElement for ReplayProtectionBindingElement {
    fn name(&self) -> &'static str {
        "replay-protection"
    }

    fn protection(&self) -> Protection {
        Protection::REPLAY
    }

    fn process_outgoing(&self, message: &mut Message) -> Result<Option<Protection>, ProtocolError> {
        if !message.supports(Protection::REPLAY) {
            return Ok(None);
        }
        let mut nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut nonce);
        message.set(parts::NONCE, BASE64_URL_SAFE_NO_PAD.encode(nonce));
        Ok(Some(Protection::REPLAY))
    }

    fn process_incoming(&self, message: &mut Message) -> Result<Option<Protection>, ProtocolError> {
        if !message.supports(Protection::REPLAY) {
            return Ok(None);
        }
        let code = message
            .get(parts::NONCE)
            .ok_or(ProtocolError::MissingRequiredField(parts::NONCE))?
            .to_owned();
        // The issue instant scopes the uniqueness window; absent a timestamp, receipt time is
        // the only instant available.
        let issued = match message.get(parts::CREATED) {
            Some(_) => parse_created(message)?,
            None => Utc::now(),
        };
        if !self.store.store_nonce(&self.context, &code, issued) {
            debug!("replayed nonce in context `{}`", self.context);
            return Err(ProtocolError::Replayed);
        }
        Ok(Some(Protection::REPLAY))
    }
}

/// Folds attached extensions into namespaced wire fields outgoing (`ns.<alias>` names the type
/// URI, `<alias>.<key>` carries each field) and reconstitutes them incoming.
#[derive(Default)]
pub struct ExtensionsBindingElement;

impl ExtensionsBindingElement {
    /// Create the element.
    pub fn new() -> Self {
        ExtensionsBindingElement
    }
}

impl BindingElement for ExtensionsBindingElement {
    fn name(&self) -> &'static str {
        "extensions"
    }

    fn protection(&self) -> Protection {
        Protection::NONE
    }

    fn process_outgoing(&self, message: &mut Message) -> Result<Option<Protection>, ProtocolError> {
        let extensions = message.take_extensions();
        if extensions.is_empty() {
            return Ok(None);
        }
        for extension in extensions {
            message.set(format!("ns.{}", extension.alias), extension.type_uri);
            for (key, value) in extension.fields {
                message.set(format!("{}.{}", extension.alias, key), value);
            }
        }
        Ok(Some(Protection::NONE))
    }

    fn process_incoming(&self, message: &mut Message) -> Result<Option<Protection>, ProtocolError> {
        let aliases: Vec<(String, String)> = message
            .fields()
            .filter_map(|(name, value)| {
                name.strip_prefix("ns.")
                    .map(|alias| (alias.to_owned(), value.to_owned()))
            })
            .collect();
        if aliases.is_empty() {
            return Ok(None);
        }
        for (alias, type_uri) in aliases {
            message.remove(&format!("ns.{}", alias));
            let prefix = format!("{}.", alias);
            let keys: Vec<String> = message
                .fields()
                .filter_map(|(name, _)| name.strip_prefix(&prefix).map(str::to_owned))
                .collect();
            let mut fields = BTreeMap::new();
            for key in keys {
                if let Some(value) = message.remove(&format!("{}{}", prefix, key)) {
                    fields.insert(key, value);
                }
            }
            message.add_extension(Extension {
                type_uri,
                alias,
                fields,
            });
        }
        Ok(Some(Protection::NONE))
    }
}

/// Signs outgoing messages under an association and verifies incoming signatures,
/// falling back to stateless secret derivation when a handle is not in the store.
///
/// Outgoing, a stale or unknown handle named by the message is moved to
/// `invalidate_handle` and replaced with a fresh private-association handle, as a
/// Provider answering a Relying Party whose association has lapsed.
pub struct SigningBindingElement {
    store: Arc<dyn AssociationStore>,
    master: Option<MasterSecret>,
}

impl SigningBindingElement {
    /// A signer/verifier backed by an association store alone. Unknown handles are rejected.
    pub fn new(store: Arc<dyn AssociationStore>) -> Self {
        SigningBindingElement {
            store,
            master: None,
        }
    }

    /// Enable stateless ("dumb" mode) fallback: unknown handles get a secret derived from the
    /// master secret instead of being rejected.
    pub fn set_master_secret(mut self, master: MasterSecret) -> Self {
        self.master = Some(master);
        self
    }

    fn resolve(&self, handle: &AssociationHandle) -> Option<Association> {
        if let Some(association) = self.store.get(handle) {
            return Some(association);
        }
        self.master
            .as_ref()
            .map(|master| Association::stateless(master, handle.clone()))
    }

    /// The Key-Value Form over the listed fields, in list order: the byte string signatures
    /// cover.
    fn signature_base(
        message: &Message,
        signed_list: &[&str],
    ) -> Result<Vec<u8>, ProtocolError> {
        let mut pairs = Vec::with_capacity(signed_list.len());
        for name in signed_list {
            let value = message.get(name).ok_or_else(|| {
                ProtocolError::Malformed(format!("signed list names absent field `{}`", name))
            })?;
            pairs.push((*name, value));
        }
        Ok(KeyValueFormEncoding::encode(pairs)?)
    }
}

impl BindingElement for SigningBindingElement {
    fn name(&self) -> &'static str {
        "signing"
    }

    fn protection(&self) -> Protection {
        Protection::TAMPER
    }

    fn process_outgoing(&self, message: &mut Message) -> Result<Option<Protection>, ProtocolError> {
        if !message.supports(Protection::TAMPER) {
            return Ok(None);
        }
        let named = message
            .get(parts::ASSOCIATION_HANDLE)
            .map(|handle| AssociationHandle::new(handle.to_owned()))
            .ok_or(ProtocolError::MissingRequiredField(parts::ASSOCIATION_HANDLE))?;

        let association = match self.store.get(&named) {
            Some(association) => association,
            None => {
                let master = self
                    .master
                    .as_ref()
                    .ok_or_else(|| ProtocolError::UnknownAssociationHandle(named.clone()))?;
                // The requester's handle has lapsed; tell them to discard it and sign under a
                // fresh private association instead.
                warn!("handle `{}` unknown; signing with a private association", *named);
                let mut fresh = [0u8; 16];
                rand::thread_rng().fill_bytes(&mut fresh);
                let private_handle =
                    AssociationHandle::new(BASE64_URL_SAFE_NO_PAD.encode(fresh));
                message.set(parts::INVALIDATE_HANDLE, named.into_inner());
                message.set(parts::ASSOCIATION_HANDLE, private_handle.to_string());
                Association::stateless(master, private_handle)
            }
        };

        // Sign every present field except the signature slots themselves.
        let signed_list: Vec<String> = message
            .fields()
            .map(|(name, _)| name.to_owned())
            .filter(|name| name != parts::SIGNATURE && name != parts::SIGNED_LIST)
            .collect();
        message.set(parts::SIGNED_LIST, signed_list.join(","));

        let list_refs: Vec<&str> = signed_list.iter().map(String::as_str).collect();
        let base = Self::signature_base(message, &list_refs)?;
        let tag = association.sign(&base).map_err(signing_failure)?;
        message.set(parts::SIGNATURE, BASE64_STANDARD.encode(tag));
        Ok(Some(Protection::TAMPER))
    }

    fn process_incoming(&self, message: &mut Message) -> Result<Option<Protection>, ProtocolError> {
        if !message.supports(Protection::TAMPER) {
            return Ok(None);
        }
        let signature = message
            .get(parts::SIGNATURE)
            .ok_or(ProtocolError::MissingRequiredField(parts::SIGNATURE))?;
        let tag = BASE64_STANDARD
            .decode(signature)
            .map_err(|_| ProtocolError::TamperDetected)?;
        let signed_list: Vec<&str> = message
            .get(parts::SIGNED_LIST)
            .ok_or(ProtocolError::MissingRequiredField(parts::SIGNED_LIST))?
            .split(',')
            .collect();

        // Every part whose schema demands signing must actually be covered.
        for critical in message.signed_critical_parts() {
            if !signed_list.contains(&critical) {
                return Err(ProtocolError::UnsignedCriticalField(critical.to_owned()));
            }
        }

        let handle = message
            .get(parts::ASSOCIATION_HANDLE)
            .map(|handle| AssociationHandle::new(handle.to_owned()))
            .ok_or(ProtocolError::MissingRequiredField(parts::ASSOCIATION_HANDLE))?;
        let association = self
            .resolve(&handle)
            .ok_or(ProtocolError::UnknownAssociationHandle(handle))?;

        let base = Self::signature_base(message, &signed_list)?;
        association.verify(&base, &tag).map_err(|err| match err {
            AssociationError::Expired(_, expired_at) => ProtocolError::Expired { expired_at },
            _ => ProtocolError::TamperDetected,
        })?;
        Ok(Some(Protection::TAMPER))
    }
}

fn signing_failure(err: AssociationError) -> ProtocolError {
    match err {
        AssociationError::Expired(_, expired_at) => ProtocolError::Expired { expired_at },
        other => ProtocolError::Malformed(other.to_string()),
    }
}
