use crate::types::{AssociationHandle, MasterSecret, ProtocolVersion};

use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::Sha256;
use thiserror::Error;

use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FormatterResult};
use std::sync::Mutex;

#[cfg(test)]
mod tests;

/// The HMAC algorithm negotiated for an association.
///
/// OpenID 1.x only defines HMAC-SHA1; OpenID 2.0 adds HMAC-SHA256.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum AssociationType {
    /// `HMAC-SHA1`, with a 20-byte secret.
    HmacSha1,
    /// `HMAC-SHA256`, with a 32-byte secret.
    HmacSha256,
}

impl AssociationType {
    /// The required secret key length in bytes, equal to the hash output length.
    pub fn secret_len(&self) -> usize {
        match self {
            AssociationType::HmacSha1 => 20,
            AssociationType::HmacSha256 => 32,
        }
    }

    /// The `assoc_type` value naming this algorithm on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            AssociationType::HmacSha1 => "HMAC-SHA1",
            AssociationType::HmacSha256 => "HMAC-SHA256",
        }
    }

    /// Resolve a wire `assoc_type` value to an algorithm.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "HMAC-SHA1" => Some(AssociationType::HmacSha1),
            "HMAC-SHA256" => Some(AssociationType::HmacSha256),
            _ => None,
        }
    }

    /// Whether the given protocol version permits negotiating this algorithm.
    pub fn permitted_in(&self, version: ProtocolVersion) -> bool {
        match self {
            AssociationType::HmacSha1 => true,
            AssociationType::HmacSha256 => version >= ProtocolVersion::V2_0,
        }
    }
}

/// Error working with an association.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum AssociationError {
    /// The secret key length does not match the negotiated algorithm.
    #[error("association secret is {actual} bytes but {alg} requires {expected}")]
    SecretLengthMismatch {
        /// The algorithm the association was created with.
        alg: &'static str,
        /// The required key length for that algorithm.
        expected: usize,
        /// The length of the key that was supplied.
        actual: usize,
    },
    /// The association type is not available under the message's protocol version.
    #[error("association type `{0}` is not permitted under protocol version {1}")]
    DisallowedType(&'static str, ProtocolVersion),
    /// The association expired and can no longer sign or verify.
    #[error("association `{0}` expired at {1}")]
    Expired(AssociationHandle, DateTime<Utc>),
    /// The supplied signature does not match the signed data.
    #[error("signature mismatch")]
    BadSignature,
}

/// A shared signing key negotiated between a Relying Party and a Provider, identified by an
/// opaque handle and good for a fixed lifetime.
///
/// Validity is purely a function of wall-clock time against `issued + lifetime`; there is no
/// in-memory revocation state. Revocation is modeled by removing the association from its
/// [`AssociationStore`].
#[derive(Clone, PartialEq, Eq)]
pub struct Association {
    handle: AssociationHandle,
    secret: Vec<u8>,
    assoc_type: AssociationType,
    issued: DateTime<Utc>,
    lifetime: Duration,
}

impl Debug for Association {
    fn fmt(&self, f: &mut Formatter) -> FormatterResult {
        f.debug_struct("Association")
            .field("handle", &self.handle)
            .field("secret", &"[redacted]")
            .field("assoc_type", &self.assoc_type)
            .field("issued", &self.issued)
            .field("lifetime", &self.lifetime)
            .finish()
    }
}

impl Association {
    /// Construct an HMAC association, validating that the secret length matches the algorithm.
    pub fn new_hmac(
        assoc_type: AssociationType,
        handle: AssociationHandle,
        secret: Vec<u8>,
        issued: DateTime<Utc>,
        lifetime: Duration,
    ) -> Result<Self, AssociationError> {
        if secret.len() != assoc_type.secret_len() {
            return Err(AssociationError::SecretLengthMismatch {
                alg: assoc_type.wire_name(),
                expected: assoc_type.secret_len(),
                actual: secret.len(),
            });
        }
        Ok(Association {
            handle,
            secret,
            assoc_type,
            issued,
            lifetime,
        })
    }

    /// Construct an HMAC association for a negotiated protocol version, rejecting algorithms the
    /// version does not admit (OpenID 1.x mandates HMAC-SHA1).
    pub fn for_version(
        version: ProtocolVersion,
        assoc_type: AssociationType,
        handle: AssociationHandle,
        secret: Vec<u8>,
        lifetime: Duration,
    ) -> Result<Self, AssociationError> {
        if !assoc_type.permitted_in(version) {
            return Err(AssociationError::DisallowedType(
                assoc_type.wire_name(),
                version,
            ));
        }
        Self::new_hmac(assoc_type, handle, secret, Utc::now(), lifetime)
    }

    /// Mint a fresh association with a random handle and a random secret of the correct length.
    pub fn generate(assoc_type: AssociationType, lifetime: Duration) -> Self {
        let mut rng = rand::thread_rng();
        let mut handle_bytes = [0u8; 16];
        rng.fill_bytes(&mut handle_bytes);
        let mut secret = vec![0u8; assoc_type.secret_len()];
        rng.fill_bytes(&mut secret);
        Association {
            handle: AssociationHandle::new(BASE64_URL_SAFE_NO_PAD.encode(handle_bytes)),
            secret,
            assoc_type,
            issued: Utc::now(),
            lifetime,
        }
    }

    /// Derive the deterministic association a stateless ("dumb" mode) Provider uses to verify a
    /// signature when it keeps no association store: the secret is the HMAC-SHA256 of the handle
    /// under the Provider's master secret.
    pub fn stateless(master: &MasterSecret, handle: AssociationHandle) -> Self {
        let mut mac = hmac_sha256(master.secret());
        mac.update(handle.as_bytes());
        let secret = mac.finalize().into_bytes().to_vec();
        Association {
            handle,
            secret,
            assoc_type: AssociationType::HmacSha256,
            issued: Utc::now(),
            lifetime: Duration::hours(1),
        }
    }

    /// The handle identifying this association.
    pub fn handle(&self) -> &AssociationHandle {
        &self.handle
    }

    /// The negotiated signing algorithm.
    pub fn association_type(&self) -> AssociationType {
        self.assoc_type
    }

    /// The raw shared secret.
    ///
    /// # Security Warning
    ///
    /// Anyone holding this value can forge signatures under this association.
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// When this association was created (UTC).
    pub fn issued(&self) -> DateTime<Utc> {
        self.issued
    }

    /// The instant after which this association must be rejected for signing and verifying.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued + self.lifetime
    }

    /// Whether the association has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }

    /// Seconds of validity remaining as of `now`, clamped at zero.
    pub fn seconds_till_expiration(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at() - now).num_seconds().max(0)
    }

    /// Sign `data` with this association's HMAC key.
    ///
    /// Fails if the association is expired at the moment of use.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, AssociationError> {
        self.check_not_expired()?;
        Ok(self.compute_tag(data))
    }

    /// Verify that `tag` is a valid signature over `data`, in constant time.
    ///
    /// Fails with [`AssociationError::Expired`] if the association is expired, and
    /// [`AssociationError::BadSignature`] on mismatch.
    pub fn verify(&self, data: &[u8], tag: &[u8]) -> Result<(), AssociationError> {
        self.check_not_expired()?;
        match self.assoc_type {
            AssociationType::HmacSha1 => {
                let mut mac = hmac_sha1(&self.secret);
                mac.update(data);
                mac.verify_slice(tag)
                    .map_err(|_| AssociationError::BadSignature)
            }
            AssociationType::HmacSha256 => {
                let mut mac = hmac_sha256(&self.secret);
                mac.update(data);
                mac.verify_slice(tag)
                    .map_err(|_| AssociationError::BadSignature)
            }
        }
    }

    fn check_not_expired(&self) -> Result<(), AssociationError> {
        let now = Utc::now();
        if self.is_expired(now) {
            return Err(AssociationError::Expired(
                self.handle.clone(),
                self.expires_at(),
            ));
        }
        Ok(())
    }

    fn compute_tag(&self, data: &[u8]) -> Vec<u8> {
        match self.assoc_type {
            AssociationType::HmacSha1 => {
                let mut mac = hmac_sha1(&self.secret);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            AssociationType::HmacSha256 => {
                let mut mac = hmac_sha256(&self.secret);
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

// HMAC accepts keys of any length, so construction cannot fail in practice; the panic documents
// the invariant rather than handling an unreachable error.
fn hmac_sha1(key: &[u8]) -> Hmac<Sha1> {
    Hmac::<Sha1>::new_from_slice(key).unwrap_or_else(|_| unreachable!("HMAC accepts any key size"))
}

fn hmac_sha256(key: &[u8]) -> Hmac<Sha256> {
    Hmac::<Sha256>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key size"))
}

/// Storage for associations, keyed by handle.
///
/// A Relying Party holds many concurrently; a Provider in "smart" mode holds the ones it issued.
/// Implementations must be safe for concurrent use by multiple request workers.
pub trait AssociationStore: Send + Sync {
    /// Store an association, replacing any previous entry for the same handle.
    fn store(&self, association: Association);

    /// Look up an association by handle. Expired associations must not be returned.
    fn get(&self, handle: &AssociationHandle) -> Option<Association>;

    /// Remove the association for `handle`, if any. Removal models revocation.
    fn remove(&self, handle: &AssociationHandle);
}

/// A process-local association store backed by a mutex-guarded map.
///
/// Expired entries are purged lazily on lookup.
#[derive(Default)]
pub struct InMemoryAssociationStore {
    inner: Mutex<HashMap<AssociationHandle, Association>>,
}

impl InMemoryAssociationStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl AssociationStore for InMemoryAssociationStore {
    fn store(&self, association: Association) {
        let mut map = self.inner.lock().expect("association store poisoned");
        map.insert(association.handle().clone(), association);
    }

    fn get(&self, handle: &AssociationHandle) -> Option<Association> {
        let mut map = self.inner.lock().expect("association store poisoned");
        let now = Utc::now();
        if let Some(association) = map.get(handle) {
            if association.is_expired(now) {
                map.remove(handle);
                return None;
            }
            return Some(association.clone());
        }
        None
    }

    fn remove(&self, handle: &AssociationHandle) {
        let mut map = self.inner.lock().expect("association store poisoned");
        map.remove(handle);
    }
}
