//! Diffie-Hellman secret exchange used to bootstrap symmetric associations over
//! non-confidential transports.
//!
//! The Provider masks the association secret by XORing it with a hash of the shared
//! Diffie-Hellman value; the Relying Party recovers it by repeating the XOR with its own
//! independently-computed copy of the shared value. Nothing secret ever crosses the wire.

use crate::association::AssociationType;

use num_bigint::{BigUint, RandBigInt};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use thiserror::Error;


/// The well-known 1536-bit modulus from OpenID Authentication 2.0 section 8.1.2.
///
/// These default parameters SHOULD be preferred; attacker-influenced parameters require the
/// range checks applied in [`DhKeyPair::shared_secret`].
const DEFAULT_MODULUS_HEX: &[u8] = b"DCF93A0B883972EC0E19989AC5A2CE310E1D37717E8D9571BB7623731866E6\
1EF75A2E27898B057F9891C2E27A639C3F29B60814581CD3B2CA3986D2683705577D45C2E7E52DC81C7A171876E5CEA7\
4B1448BFDFAF18828EFD2519F14E45E3826634AF1949E5B535CC829A483B8A76223E5D490A257F05BDFF16F2FB22C583AB";

/// Error during a Diffie-Hellman exchange.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DhError {
    /// The modulus or generator is unusable (zero, one, or generator >= modulus).
    #[error("Diffie-Hellman modulus or generator is invalid")]
    InvalidParameters,
    /// The remote public key does not lie in (1, modulus - 1).
    #[error("remote Diffie-Hellman public key is out of range")]
    PublicKeyOutOfRange,
    /// The hashed shared secret and the association secret differ in length, so the XOR step
    /// would corrupt the secret.
    #[error("shared secret hash is {hashed} bytes but the association secret is {secret} bytes")]
    HashLengthMismatch {
        /// Length of the hashed shared Diffie-Hellman value.
        hashed: usize,
        /// Length of the association secret being masked or unmasked.
        secret: usize,
    },
    /// `no-encryption` sessions carry the secret in the clear (TLS only) and cannot mask it.
    #[error("session type `no-encryption` cannot mask a secret")]
    SessionNotEncrypted,
}

/// The `session_type` negotiated for an association request.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum DhSessionType {
    /// `DH-SHA1`: shared value hashed with SHA-1 (20 bytes).
    Sha1,
    /// `DH-SHA256`: shared value hashed with SHA-256 (32 bytes).
    Sha256,
    /// `no-encryption`: secret sent in the clear, permissible only over TLS.
    NoEncryption,
}

impl DhSessionType {
    /// The `session_type` value naming this session on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            DhSessionType::Sha1 => "DH-SHA1",
            DhSessionType::Sha256 => "DH-SHA256",
            DhSessionType::NoEncryption => "no-encryption",
        }
    }

    /// Resolve a wire `session_type` value.
    pub fn from_wire_name(name: &str) -> Option<Self> {
        match name {
            "DH-SHA1" => Some(DhSessionType::Sha1),
            "DH-SHA256" => Some(DhSessionType::Sha256),
            "no-encryption" => Some(DhSessionType::NoEncryption),
            _ => None,
        }
    }

    /// The hash output length in bytes, or `None` for `no-encryption`.
    pub fn hash_len(&self) -> Option<usize> {
        match self {
            DhSessionType::Sha1 => Some(20),
            DhSessionType::Sha256 => Some(32),
            DhSessionType::NoEncryption => None,
        }
    }

    /// Whether this session can carry an association of the given type: the session hash length
    /// must equal the association secret length so the XOR mask lines up byte for byte.
    pub fn compatible_with(&self, assoc_type: AssociationType) -> bool {
        match self.hash_len() {
            // Any association type can ride a cleartext session.
            None => true,
            Some(len) => len == assoc_type.secret_len(),
        }
    }

    fn hash(&self, data: &[u8]) -> Result<Vec<u8>, DhError> {
        match self {
            DhSessionType::Sha1 => Ok(Sha1::digest(data).to_vec()),
            DhSessionType::Sha256 => Ok(Sha256::digest(data).to_vec()),
            DhSessionType::NoEncryption => Err(DhError::SessionNotEncrypted),
        }
    }
}

/// Modulus and generator for an exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhParameters {
    modulus: BigUint,
    generator: BigUint,
}

impl DhParameters {
    /// The default OpenID 2.0 parameters: the well-known 1536-bit safe prime and generator 2.
    pub fn openid_default() -> Self {
        let modulus = BigUint::parse_bytes(DEFAULT_MODULUS_HEX, 16)
            .unwrap_or_else(|| unreachable!("default modulus constant is valid hex"));
        DhParameters {
            modulus,
            generator: BigUint::from(2u32),
        }
    }

    /// Parameters supplied by the remote party, as big-endian (btwoc) byte strings.
    pub fn from_bytes(modulus: &[u8], generator: &[u8]) -> Result<Self, DhError> {
        let modulus = BigUint::from_bytes_be(modulus);
        let generator = BigUint::from_bytes_be(generator);
        if modulus <= BigUint::from(3u32) || generator <= BigUint::from(1u32) {
            return Err(DhError::InvalidParameters);
        }
        if generator >= modulus {
            return Err(DhError::InvalidParameters);
        }
        Ok(DhParameters { modulus, generator })
    }

    /// The modulus in btwoc form, as sent in `dh_modulus`.
    pub fn modulus_bytes(&self) -> Vec<u8> {
        btwoc(&self.modulus)
    }

    /// The generator in btwoc form, as sent in `dh_gen`.
    pub fn generator_bytes(&self) -> Vec<u8> {
        btwoc(&self.generator)
    }
}

impl Default for DhParameters {
    fn default() -> Self {
        Self::openid_default()
    }
}

/// An ephemeral Diffie-Hellman key pair. Each party generates one per exchange and discards it
/// once the association secret has been recovered.
pub struct DhKeyPair {
    params: DhParameters,
    private: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    /// Generate an ephemeral key pair with a random exponent in [2, modulus - 2].
    pub fn generate(params: DhParameters) -> Self {
        let mut rng = rand::thread_rng();
        let low = BigUint::from(2u32);
        let high = &params.modulus - BigUint::from(1u32);
        let private = rng.gen_biguint_range(&low, &high);
        let public = params.generator.modpow(&private, &params.modulus);
        DhKeyPair {
            params,
            private,
            public,
        }
    }

    /// This party's public value `g^x mod p` in btwoc form, as sent in `dh_consumer_public` or
    /// `dh_server_public`.
    pub fn public_key(&self) -> Vec<u8> {
        btwoc(&self.public)
    }

    /// Compute the shared value `g^(xy) mod p` from the remote party's public value, in btwoc
    /// form ready for hashing.
    ///
    /// The remote value is rejected unless it lies strictly between 1 and modulus - 1; values
    /// outside that range force the shared secret into a trivially small subgroup.
    pub fn shared_secret(&self, remote_public: &[u8]) -> Result<Vec<u8>, DhError> {
        let remote = BigUint::from_bytes_be(remote_public);
        let upper = &self.params.modulus - BigUint::from(1u32);
        if remote <= BigUint::from(1u32) || remote >= upper {
            return Err(DhError::PublicKeyOutOfRange);
        }
        let shared = remote.modpow(&self.private, &self.params.modulus);
        Ok(btwoc(&shared))
    }
}

/// Mask an association secret for transmission: `secret XOR hash(shared value)`.
///
/// The hash output length must equal the secret length exactly, or the call fails before any
/// XOR takes place.
pub fn mask_secret(
    session: DhSessionType,
    key_pair: &DhKeyPair,
    remote_public: &[u8],
    secret: &[u8],
) -> Result<Vec<u8>, DhError> {
    hash_xor_secret(session, key_pair, remote_public, secret)
}

/// Recover an association secret from its masked form. The XOR mask is its own inverse, so this
/// is the same computation as [`mask_secret`] performed with the other party's key pair.
pub fn unmask_secret(
    session: DhSessionType,
    key_pair: &DhKeyPair,
    remote_public: &[u8],
    masked_secret: &[u8],
) -> Result<Vec<u8>, DhError> {
    hash_xor_secret(session, key_pair, remote_public, masked_secret)
}

fn hash_xor_secret(
    session: DhSessionType,
    key_pair: &DhKeyPair,
    remote_public: &[u8],
    plain_or_masked: &[u8],
) -> Result<Vec<u8>, DhError> {
    let shared = key_pair.shared_secret(remote_public)?;
    let digest = session.hash(&shared)?;
    if digest.len() != plain_or_masked.len() {
        return Err(DhError::HashLengthMismatch {
            hashed: digest.len(),
            secret: plain_or_masked.len(),
        });
    }
    Ok(digest
        .iter()
        .zip(plain_or_masked)
        .map(|(h, s)| h ^ s)
        .collect())
}

/// Big-endian two's-complement form per OpenID 2.0 section 4.2: a leading zero byte is added
/// when the most significant bit is set, so the value always parses as a positive integer.
fn btwoc(n: &BigUint) -> Vec<u8> {
    let bytes = n.to_bytes_be();
    if bytes.first().map_or(false, |&b| b > 127) {
        let mut positive = Vec::with_capacity(bytes.len() + 1);
        positive.push(0);
        positive.extend_from_slice(&bytes);
        positive
    } else {
        bytes
    }
}
