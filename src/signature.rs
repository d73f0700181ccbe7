//! Pluggable signature strategies for request signing, keyed by the wire name carried in the
//! message's signature-method field.

use hmac::{Hmac, Mac};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Error signing a base string or verifying a signature over one.
#[derive(Clone, Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum SignatureError {
    /// The signature does not match the base string.
    #[error("signature verification failed")]
    BadSignature,
    /// This method instance holds only verification material.
    #[error("no private key available for signing")]
    MissingPrivateKey,
    /// The underlying cryptographic operation failed.
    #[error("crypto failure: {0}")]
    Crypto(String),
}

/// One signature algorithm, named as it appears on the wire.
pub trait SignatureMethod: Send + Sync {
    /// The wire name (e.g. `HMAC-SHA1`).
    fn name(&self) -> &str;

    /// Sign the base string.
    fn sign(&self, base: &[u8]) -> Result<Vec<u8>, SignatureError>;

    /// Verify a signature over the base string. Symmetric methods compare in constant time.
    fn verify(&self, base: &[u8], signature: &[u8]) -> Result<(), SignatureError>;
}

/// Percent-encode per the RFC 3986 unreserved set, as OAuth 1.0 requires for key construction
/// and Authorization-header parameters.
pub(crate) fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}

fn oauth_key(consumer_secret: &str, token_secret: &str) -> Vec<u8> {
    format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret)
    )
    .into_bytes()
}

/// `HMAC-SHA1` with the OAuth 1.0 key construction: percent-encoded consumer secret and token
/// secret joined by `&`.
pub struct HmacSha1SignatureMethod {
    key: Vec<u8>,
}

impl HmacSha1SignatureMethod {
    /// Build from the two secrets. The token secret is empty for token-request signing.
    pub fn new(consumer_secret: &str, token_secret: &str) -> Self {
        HmacSha1SignatureMethod {
            key: oauth_key(consumer_secret, token_secret),
        }
    }
}

impl SignatureMethod for HmacSha1SignatureMethod {
    fn name(&self) -> &str {
        "HMAC-SHA1"
    }

    fn sign(&self, base: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let mut mac = Hmac::<Sha1>::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key size"));
        mac.update(base);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn verify(&self, base: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let mut mac = Hmac::<Sha1>::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key size"));
        mac.update(base);
        mac.verify_slice(signature)
            .map_err(|_| SignatureError::BadSignature)
    }
}

/// `RSA-SHA1`: PKCS#1 v1.5 over a SHA-1 digest. Senders hold the private key; receivers verify
/// with the public key alone.
pub struct RsaSha1SignatureMethod {
    private_key: Option<RsaPrivateKey>,
    public_key: RsaPublicKey,
}

impl RsaSha1SignatureMethod {
    /// A signer, able to both sign and verify.
    pub fn new_signer(private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        RsaSha1SignatureMethod {
            private_key: Some(private_key),
            public_key,
        }
    }

    /// A verifier holding only the public key.
    pub fn new_verifier(public_key: RsaPublicKey) -> Self {
        RsaSha1SignatureMethod {
            private_key: None,
            public_key,
        }
    }
}

impl SignatureMethod for RsaSha1SignatureMethod {
    fn name(&self) -> &str {
        "RSA-SHA1"
    }

    fn sign(&self, base: &[u8]) -> Result<Vec<u8>, SignatureError> {
        let private_key = self
            .private_key
            .as_ref()
            .ok_or(SignatureError::MissingPrivateKey)?;
        let digest = Sha1::digest(base);
        private_key
            .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
            .map_err(|err| SignatureError::Crypto(err.to_string()))
    }

    fn verify(&self, base: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let digest = Sha1::digest(base);
        self.public_key
            .verify(Pkcs1v15Sign::new::<Sha1>(), &digest, signature)
            .map_err(|_| SignatureError::BadSignature)
    }
}

/// `PLAINTEXT`: the key itself is the signature. Only acceptable when the transport already
/// provides confidentiality and integrity.
pub struct PlaintextSignatureMethod {
    key: Vec<u8>,
}

impl PlaintextSignatureMethod {
    /// Build from the two secrets, with the same key construction as `HMAC-SHA1`.
    pub fn new(consumer_secret: &str, token_secret: &str) -> Self {
        PlaintextSignatureMethod {
            key: oauth_key(consumer_secret, token_secret),
        }
    }
}

impl SignatureMethod for PlaintextSignatureMethod {
    fn name(&self) -> &str {
        "PLAINTEXT"
    }

    fn sign(&self, _base: &[u8]) -> Result<Vec<u8>, SignatureError> {
        Ok(self.key.clone())
    }

    fn verify(&self, _base: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        if self.key.ct_eq(signature).into() {
            Ok(())
        } else {
            Err(SignatureError::BadSignature)
        }
    }
}

/// A priority-ordered registry of signature methods; the first method whose name matches the
/// one the message names is used.
#[derive(Default)]
pub struct SignatureMethodSet {
    methods: Vec<Box<dyn SignatureMethod>>,
}

impl SignatureMethodSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a method. Registration order is preference order.
    pub fn add(mut self, method: impl SignatureMethod + 'static) -> Self {
        self.methods.push(Box::new(method));
        self
    }

    /// Resolve a wire name to a method, if registered.
    pub fn select(&self, name: &str) -> Option<&dyn SignatureMethod> {
        self.methods
            .iter()
            .find(|method| method.name() == name)
            .map(Box::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::{
        HmacSha1SignatureMethod, PlaintextSignatureMethod, SignatureError, SignatureMethod,
        SignatureMethodSet,
    };

    use pretty_assertions::assert_eq;

    #[test]
    fn percent_encoding_matches_rfc3986_unreserved_set() {
        assert_eq!(super::percent_encode("abc-._~XYZ09"), "abc-._~XYZ09");
        assert_eq!(super::percent_encode("a b&c/%"), "a%20b%26c%2F%25");
    }

    #[test]
    fn hmac_sha1_signs_and_verifies() {
        let method = HmacSha1SignatureMethod::new("kd94hf93k423kf44", "pfkkdhi9sl3r4s00");
        let tag = method.sign(b"GET&http%3A%2F%2Fexample.com&a%3D1").unwrap();
        assert_eq!(tag.len(), 20);
        method
            .verify(b"GET&http%3A%2F%2Fexample.com&a%3D1", &tag)
            .unwrap();
        assert_eq!(
            method.verify(b"GET&http%3A%2F%2Fexample.com&a%3D2", &tag),
            Err(SignatureError::BadSignature)
        );
    }

    #[test]
    fn key_construction_distinguishes_secret_boundaries() {
        // ("ab", "c") and ("a", "bc") must not collapse to the same key.
        let left = HmacSha1SignatureMethod::new("ab", "c");
        let right = HmacSha1SignatureMethod::new("a", "bc");
        assert_ne!(left.sign(b"base").unwrap(), right.sign(b"base").unwrap());
    }

    #[test]
    fn plaintext_signature_is_the_key() {
        let method = PlaintextSignatureMethod::new("djr9rjt0jd78jf88", "jjd999tj88uiths3");
        let tag = method.sign(b"ignored").unwrap();
        assert_eq!(tag, b"djr9rjt0jd78jf88&jjd999tj88uiths3".to_vec());
        method.verify(b"anything", &tag).unwrap();
        assert_eq!(
            method.verify(b"anything", b"wrong"),
            Err(SignatureError::BadSignature)
        );
    }

    #[test]
    fn method_set_resolves_by_wire_name() {
        let set = SignatureMethodSet::new()
            .add(HmacSha1SignatureMethod::new("cs", "ts"))
            .add(PlaintextSignatureMethod::new("cs", "ts"));
        assert_eq!(set.select("HMAC-SHA1").map(|m| m.name()), Some("HMAC-SHA1"));
        assert_eq!(set.select("PLAINTEXT").map(|m| m.name()), Some("PLAINTEXT"));
        assert!(set.select("RSA-SHA256").is_none());
    }
}
