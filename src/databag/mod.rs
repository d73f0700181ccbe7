//! Self-protecting serialization for short strings of sensitive state ("data bags"): signed,
//! optionally encrypted and compressed tokens that round-trip through untrusted parties.
//!
//! A serialized bag is, in processing order: URL-encoded fields, optional gzip, optional
//! AES-256-GCM or hybrid RSA encryption, a signature over the processed payload, a
//! length-framed signature+payload pair, base64url, and a key-handle prefix when a key-store
//! key was used.

use crate::keystore::CryptoKeyStore;
use crate::nonce::NonceStore;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use hmac::{Hmac, Mac};
use log::debug;
use rand::RngCore;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::form_urlencoded;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::marker::PhantomData;
use std::sync::Arc;

mod bags;
#[cfg(test)]
mod tests;

pub use bags::{AccessTokenBag, AuthorizationCodeBag, RefreshTokenBag};

/// Reserved field carrying the bag-type discriminator.
const TYPE_FIELD: &str = "t";
/// Reserved field carrying the creation timestamp.
const TIMESTAMP_FIELD: &str = "ts";
/// Reserved field carrying the single-use nonce.
const NONCE_FIELD: &str = "n";

/// Bytes of random nonce attached to single-use bags.
const SINGLE_USE_NONCE_LEN: usize = 6;
/// AES-GCM nonce length in bytes.
const GCM_NONCE_LEN: usize = 12;

/// A value that can ride inside a self-protecting token.
pub trait DataBag: Sized {
    /// The static type discriminator, checked on deserialization so a token minted as one kind
    /// can never be redeemed as another.
    fn bag_type() -> &'static str;

    /// The bag's fields, excluding the reserved `t`/`ts`/`n` names.
    fn to_fields(&self) -> Vec<(String, String)>;

    /// Reconstruct the bag from deserialized fields.
    fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, DataBagError>;

    /// Bag-specific semantic checks, run last in deserialization.
    fn validate(&self) -> Result<(), DataBagError> {
        Ok(())
    }
}

/// Error serializing or deserializing a data bag.
///
/// Integrity failures are deliberately coarse: a caller (and therefore an attacker holding a
/// rejected token) cannot tell a bad signature from a failed decryption or an unknown key
/// handle.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum DataBagError {
    /// The token failed signature verification, decryption, or key resolution.
    #[error("the token failed its integrity checks")]
    Tampered,
    /// The token aged past the formatter's maximum lifetime.
    #[error("the token expired at {expired_at}")]
    Expired {
        /// The instant the token ceased to be acceptable.
        expired_at: DateTime<Utc>,
    },
    /// The single-use token was presented a second time.
    #[error("the token has already been redeemed")]
    Replayed,
    /// The token's structure or fields could not be understood.
    #[error("malformed token: {0}")]
    Malformed(String),
    /// A field the bag requires is absent.
    #[error("token is missing the `{0}` field")]
    MissingField(&'static str),
    /// A cryptographic operation failed while producing a token.
    #[error("crypto failure: {0}")]
    Crypto(String),
    /// The formatter was assembled with an inconsistent configuration.
    #[error("formatter misconfigured: {0}")]
    Misconfigured(&'static str),
}

/// Configures and constructs a [`DataBagFormatter`].
pub struct DataBagFormatterBuilder<T: DataBag> {
    key_store: Option<(Arc<dyn CryptoKeyStore>, String)>,
    rsa_signing_key: Option<RsaPrivateKey>,
    rsa_verification_key: Option<RsaPublicKey>,
    rsa_encryption_key: Option<RsaPublicKey>,
    rsa_decryption_key: Option<RsaPrivateKey>,
    signed: bool,
    encrypted: bool,
    compressed: bool,
    max_age: Option<Duration>,
    decode_once: Option<Arc<dyn NonceStore>>,
    _bag: PhantomData<fn() -> T>,
}

impl<T: DataBag> Default for DataBagFormatterBuilder<T> {
    fn default() -> Self {
        DataBagFormatterBuilder {
            key_store: None,
            rsa_signing_key: None,
            rsa_verification_key: None,
            rsa_encryption_key: None,
            rsa_decryption_key: None,
            signed: false,
            encrypted: false,
            compressed: false,
            max_age: None,
            decode_once: None,
            _bag: PhantomData,
        }
    }
}

impl<T: DataBag> DataBagFormatterBuilder<T> {
    /// Start an unconfigured builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use symmetric keys from the given store bucket for signing (HMAC-SHA256) and
    /// encryption (AES-256-GCM). Tokens carry the key handle so rotation is transparent.
    pub fn set_key_store(mut self, store: Arc<dyn CryptoKeyStore>, bucket: impl Into<String>) -> Self {
        self.key_store = Some((store, bucket.into()));
        self
    }

    /// Sign with RSA PKCS#1 v1.5 over SHA-256 instead of a symmetric key. A verifier-only
    /// party passes `None` for the private key.
    pub fn set_rsa_signing(
        mut self,
        signing_key: Option<RsaPrivateKey>,
        verification_key: RsaPublicKey,
    ) -> Self {
        self.rsa_signing_key = signing_key;
        self.rsa_verification_key = Some(verification_key);
        self
    }

    /// Encrypt hybrid: a fresh AES-256-GCM key per token, itself RSA-encrypted to the
    /// recipient. A sender-only party passes `None` for the decryption key.
    pub fn set_rsa_encryption(
        mut self,
        encryption_key: Option<RsaPublicKey>,
        decryption_key: Option<RsaPrivateKey>,
    ) -> Self {
        self.rsa_encryption_key = encryption_key;
        self.rsa_decryption_key = decryption_key;
        self
    }

    /// Sign tokens.
    pub fn set_signed(mut self) -> Self {
        self.signed = true;
        self
    }

    /// Encrypt tokens.
    pub fn set_encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Gzip the fields before encryption.
    pub fn set_compressed(mut self) -> Self {
        self.compressed = true;
        self
    }

    /// Reject tokens older than `max_age` at deserialization.
    pub fn set_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Make tokens single-use: a random nonce is attached at serialization and recorded in
    /// `store` at deserialization, rejecting any second presentation.
    pub fn set_decode_once(mut self, store: Arc<dyn NonceStore>) -> Self {
        self.decode_once = Some(store);
        self
    }

    /// Validate the configuration and produce the formatter.
    ///
    /// Single-use tokens must also be signed and age-limited: without a signature the nonce is
    /// forgeable, and without a lifetime the nonce store must remember entries forever.
    pub fn build(self) -> Result<DataBagFormatter<T>, DataBagError> {
        if self.signed && self.key_store.is_none() && self.rsa_verification_key.is_none() {
            return Err(DataBagError::Misconfigured(
                "signing requires a key store or an RSA verification key",
            ));
        }
        if self.encrypted
            && self.key_store.is_none()
            && self.rsa_encryption_key.is_none()
            && self.rsa_decryption_key.is_none()
        {
            return Err(DataBagError::Misconfigured(
                "encryption requires a key store or RSA keys",
            ));
        }
        if self.decode_once.is_some() && (!self.signed || self.max_age.is_none()) {
            return Err(DataBagError::Misconfigured(
                "single-use tokens require signing and a maximum age",
            ));
        }
        Ok(DataBagFormatter {
            key_store: self.key_store,
            rsa_signing_key: self.rsa_signing_key,
            rsa_verification_key: self.rsa_verification_key,
            rsa_encryption_key: self.rsa_encryption_key,
            rsa_decryption_key: self.rsa_decryption_key,
            signed: self.signed,
            encrypted: self.encrypted,
            compressed: self.compressed,
            max_age: self.max_age,
            decode_once: self.decode_once,
            _bag: PhantomData,
        })
    }
}

/// Serializes and deserializes one kind of [`DataBag`] with a fixed protection configuration.
pub struct DataBagFormatter<T: DataBag> {
    key_store: Option<(Arc<dyn CryptoKeyStore>, String)>,
    rsa_signing_key: Option<RsaPrivateKey>,
    rsa_verification_key: Option<RsaPublicKey>,
    rsa_encryption_key: Option<RsaPublicKey>,
    rsa_decryption_key: Option<RsaPrivateKey>,
    signed: bool,
    encrypted: bool,
    compressed: bool,
    max_age: Option<Duration>,
    decode_once: Option<Arc<dyn NonceStore>>,
    _bag: PhantomData<fn() -> T>,
}

impl<T: DataBag> DataBagFormatter<T> {
    /// Start configuring a formatter.
    pub fn builder() -> DataBagFormatterBuilder<T> {
        DataBagFormatterBuilder::new()
    }

    /// Serialize a bag into its transport form.
    pub fn serialize(&self, bag: &T) -> Result<String, DataBagError> {
        let mut fields = bag.to_fields();
        fields.push((TYPE_FIELD.to_owned(), T::bag_type().to_owned()));
        fields.push((
            TIMESTAMP_FIELD.to_owned(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        ));
        if self.decode_once.is_some() {
            let mut nonce = [0u8; SINGLE_USE_NONCE_LEN];
            rand::thread_rng().fill_bytes(&mut nonce);
            fields.push((NONCE_FIELD.to_owned(), BASE64_URL_SAFE_NO_PAD.encode(nonce)));
        }

        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (name, value) in &fields {
            serializer.append_pair(name, value);
        }
        let mut payload = serializer.finish().into_bytes();

        if self.compressed {
            payload = gzip(&payload)?;
        }

        // One store key covers both encryption and signing for this token.
        let store_key = match (&self.key_store, self.signed || self.encrypted) {
            (Some((store, bucket)), true) => {
                let life = self.max_age.unwrap_or_else(|| Duration::days(28));
                Some(store.get_current_key(bucket, life))
            }
            _ => None,
        };

        if self.encrypted {
            payload = match (&store_key, &self.rsa_encryption_key) {
                (Some((_, key)), _) => aes_encrypt(key.key(), &payload)?,
                (None, Some(public)) => hybrid_encrypt(public, &payload)?,
                (None, None) => {
                    return Err(DataBagError::Misconfigured("no encryption key available"))
                }
            };
        }

        let signature = if self.signed {
            match (&store_key, &self.rsa_signing_key) {
                (Some((_, key)), _) => hmac_tag(key.key(), &payload),
                (None, Some(private)) => rsa_sign(private, &payload)?,
                (None, None) => {
                    return Err(DataBagError::Misconfigured("no signing key available"))
                }
            }
        } else {
            Vec::new()
        };

        let mut frame = Vec::with_capacity(4 + signature.len() + payload.len());
        frame.extend_from_slice(&(signature.len() as u32).to_le_bytes());
        frame.extend_from_slice(&signature);
        frame.extend_from_slice(&payload);

        let body = BASE64_URL_SAFE_NO_PAD.encode(frame);
        match store_key {
            Some((handle, _)) => Ok(format!("{}!{}", handle, body)),
            None => Ok(body),
        }
    }

    /// Deserialize and check a token, in fixed order: signature, decryption, decompression,
    /// field parsing, type discriminator, expiration, single-use nonce, bag validation.
    ///
    /// A failed signature or expired token never consumes the nonce.
    pub fn deserialize(&self, token: &str) -> Result<T, DataBagError> {
        let (store_key, body) = match &self.key_store {
            Some((store, bucket)) if self.signed || self.encrypted => {
                let (handle, body) = token
                    .split_once('!')
                    .ok_or_else(|| DataBagError::Malformed("missing key handle".to_owned()))?;
                // An unknown handle reads as tampering so rejected tokens leak nothing about
                // key rotation.
                let key = store.get_key(bucket, handle).ok_or(DataBagError::Tampered)?;
                (Some(key), body)
            }
            _ => (None, token),
        };

        let frame = BASE64_URL_SAFE_NO_PAD
            .decode(body)
            .map_err(|_| DataBagError::Malformed("invalid base64".to_owned()))?;
        if frame.len() < 4 {
            return Err(DataBagError::Malformed("truncated frame".to_owned()));
        }
        let sig_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if frame.len() - 4 < sig_len {
            return Err(DataBagError::Malformed("truncated frame".to_owned()));
        }
        let signature = &frame[4..4 + sig_len];
        let mut payload = frame[4 + sig_len..].to_vec();

        if self.signed {
            match (&store_key, &self.rsa_verification_key) {
                (Some(key), _) => hmac_verify(key.key(), &payload, signature)?,
                (None, Some(public)) => rsa_verify(public, &payload, signature)?,
                (None, None) => {
                    return Err(DataBagError::Misconfigured("no verification key available"))
                }
            }
        }

        if self.encrypted {
            payload = match (&store_key, &self.rsa_decryption_key) {
                (Some(key), _) => aes_decrypt(key.key(), &payload)?,
                (None, Some(private)) => hybrid_decrypt(private, &payload)?,
                (None, None) => {
                    return Err(DataBagError::Misconfigured("no decryption key available"))
                }
            };
        }

        if self.compressed {
            payload = gunzip(&payload)?;
        }

        let fields: BTreeMap<String, String> = form_urlencoded::parse(&payload)
            .into_owned()
            .collect();

        match fields.get(TYPE_FIELD).map(String::as_str) {
            Some(actual) if actual == T::bag_type() => {}
            actual => {
                return Err(DataBagError::Malformed(format!(
                    "token is a `{}`, not a `{}`",
                    actual.unwrap_or("?"),
                    T::bag_type()
                )))
            }
        }

        let issued = fields
            .get(TIMESTAMP_FIELD)
            .ok_or(DataBagError::MissingField(TIMESTAMP_FIELD))
            .and_then(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|ts| ts.with_timezone(&Utc))
                    .map_err(|_| DataBagError::Malformed("unparseable timestamp".to_owned()))
            })?;
        if let Some(max_age) = self.max_age {
            let expired_at = issued + max_age;
            if Utc::now() > expired_at {
                return Err(DataBagError::Expired { expired_at });
            }
        }

        if let Some(nonce_store) = &self.decode_once {
            let code = fields
                .get(NONCE_FIELD)
                .ok_or(DataBagError::MissingField(NONCE_FIELD))?;
            let context = format!("{{{}}}", T::bag_type());
            if !nonce_store.store_nonce(&context, code, issued) {
                debug!("single-use `{}` token presented twice", T::bag_type());
                return Err(DataBagError::Replayed);
            }
        }

        let bag = T::from_fields(&fields)?;
        bag.validate()?;
        Ok(bag)
    }
}

fn hmac_tag(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key size"));
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn hmac_verify(key: &[u8], data: &[u8], tag: &[u8]) -> Result<(), DataBagError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts any key size"));
    mac.update(data);
    mac.verify_slice(tag).map_err(|_| DataBagError::Tampered)
}

fn rsa_sign(key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, DataBagError> {
    let digest = Sha256::digest(data);
    key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|err| DataBagError::Crypto(err.to_string()))
}

fn rsa_verify(key: &RsaPublicKey, data: &[u8], tag: &[u8]) -> Result<(), DataBagError> {
    let digest = Sha256::digest(data);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, tag)
        .map_err(|_| DataBagError::Tampered)
}

// AES-256-GCM with a random 96-bit nonce prepended to the ciphertext.
fn aes_encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, DataBagError> {
    if key.len() != 32 {
        return Err(DataBagError::Crypto("AES-256 requires a 32-byte key".to_owned()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce = [0u8; GCM_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|err| DataBagError::Crypto(err.to_string()))?;
    let mut out = nonce.to_vec();
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn aes_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, DataBagError> {
    if data.len() < GCM_NONCE_LEN {
        return Err(DataBagError::Tampered);
    }
    let (nonce, ciphertext) = data.split_at(GCM_NONCE_LEN);
    if key.len() != 32 {
        return Err(DataBagError::Tampered);
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| DataBagError::Tampered)
}

// Hybrid: a fresh AES key per token, RSA-encrypted and length-framed ahead of the payload.
fn hybrid_encrypt(public: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, DataBagError> {
    let mut rng = rand::thread_rng();
    let mut aes_key = [0u8; 32];
    rng.fill_bytes(&mut aes_key);
    let wrapped = public
        .encrypt(&mut rng, Pkcs1v15Encrypt, &aes_key)
        .map_err(|err| DataBagError::Crypto(err.to_string()))?;
    let sealed = aes_encrypt(&aes_key, plaintext)?;

    let mut out = Vec::with_capacity(4 + wrapped.len() + sealed.len());
    out.extend_from_slice(&(wrapped.len() as u32).to_le_bytes());
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&sealed);
    Ok(out)
}

fn hybrid_decrypt(private: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, DataBagError> {
    if data.len() < 4 {
        return Err(DataBagError::Tampered);
    }
    let key_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if data.len() - 4 < key_len {
        return Err(DataBagError::Tampered);
    }
    let aes_key = private
        .decrypt(Pkcs1v15Encrypt, &data[4..4 + key_len])
        .map_err(|_| DataBagError::Tampered)?;
    if aes_key.len() != 32 {
        return Err(DataBagError::Tampered);
    }
    aes_decrypt(&aes_key, &data[4 + key_len..])
}

fn gzip(data: &[u8]) -> Result<Vec<u8>, DataBagError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|err| DataBagError::Crypto(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| DataBagError::Crypto(err.to_string()))
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>, DataBagError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map(|_| out)
        .map_err(|_| DataBagError::Malformed("invalid compressed payload".to_owned()))
}
