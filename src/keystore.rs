use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

use std::collections::HashMap;
use std::fmt::{Debug, Formatter, Result as FormatterResult};
use std::sync::Mutex;

/// Length in bytes of minted symmetric keys, sized for both HMAC-SHA256 and AES-256.
const KEY_LEN: usize = 32;

/// A symmetric key at rest, with the instant it stops being used for new material.
///
/// Tokens signed or encrypted under a key remain verifiable by handle lookup after the key
/// expires; expiration only governs when a fresh key is minted for new tokens.
#[derive(Clone, PartialEq, Eq)]
pub struct CryptoKey {
    key: Vec<u8>,
    expires_at: DateTime<Utc>,
}

impl CryptoKey {
    /// Wrap existing key material.
    pub fn new(key: Vec<u8>, expires_at: DateTime<Utc>) -> Self {
        CryptoKey { key, expires_at }
    }

    /// The raw key material.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// When this key stops being selected for new tokens.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }
}

impl Debug for CryptoKey {
    fn fmt(&self, f: &mut Formatter) -> FormatterResult {
        f.debug_struct("CryptoKey")
            .field("key", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Storage for the symmetric keys that sign and encrypt DataBags, organized into named buckets
/// (one bucket per token kind) with opaque handles identifying individual keys.
///
/// Implementations must be safe for concurrent use by multiple request workers.
pub trait CryptoKeyStore: Send + Sync {
    /// Look up a key by bucket and handle.
    fn get_key(&self, bucket: &str, handle: &str) -> Option<CryptoKey>;

    /// All keys in a bucket with their handles, ordered by expiration, furthest out first.
    fn get_keys(&self, bucket: &str) -> Vec<(String, CryptoKey)>;

    /// Store a key under the given bucket and handle.
    fn store_key(&self, bucket: &str, handle: &str, key: CryptoKey);

    /// Remove a key. Removal models revocation of everything protected under it.
    fn remove_key(&self, bucket: &str, handle: &str);

    /// The key to protect new material with: the freshest key in the bucket that will remain
    /// usable for at least `minimum_remaining_life`, or a newly minted one when none qualifies.
    fn get_current_key(
        &self,
        bucket: &str,
        minimum_remaining_life: Duration,
    ) -> (String, CryptoKey) {
        let now = Utc::now();
        if let Some((handle, key)) = self
            .get_keys(bucket)
            .into_iter()
            .find(|(_, key)| key.expires_at() - now >= minimum_remaining_life)
        {
            return (handle, key);
        }

        let mut rng = rand::thread_rng();
        let mut handle_bytes = [0u8; 8];
        rng.fill_bytes(&mut handle_bytes);
        let handle = BASE64_URL_SAFE_NO_PAD.encode(handle_bytes);
        let mut material = vec![0u8; KEY_LEN];
        rng.fill_bytes(&mut material);
        let key = CryptoKey::new(material, now + minimum_remaining_life * 2);
        self.store_key(bucket, &handle, key.clone());
        (handle, key)
    }
}

/// A process-local crypto key store backed by a mutex-guarded map.
#[derive(Default)]
pub struct InMemoryCryptoKeyStore {
    // bucket -> handle -> key
    inner: Mutex<HashMap<String, HashMap<String, CryptoKey>>>,
}

impl InMemoryCryptoKeyStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CryptoKeyStore for InMemoryCryptoKeyStore {
    fn get_key(&self, bucket: &str, handle: &str) -> Option<CryptoKey> {
        let map = self.inner.lock().expect("key store poisoned");
        map.get(bucket).and_then(|keys| keys.get(handle)).cloned()
    }

    fn get_keys(&self, bucket: &str) -> Vec<(String, CryptoKey)> {
        let map = self.inner.lock().expect("key store poisoned");
        let mut keys: Vec<(String, CryptoKey)> = map
            .get(bucket)
            .map(|keys| {
                keys.iter()
                    .map(|(handle, key)| (handle.clone(), key.clone()))
                    .collect()
            })
            .unwrap_or_default();
        keys.sort_by(|(_, a), (_, b)| b.expires_at().cmp(&a.expires_at()));
        keys
    }

    fn store_key(&self, bucket: &str, handle: &str, key: CryptoKey) {
        let mut map = self.inner.lock().expect("key store poisoned");
        map.entry(bucket.to_owned())
            .or_default()
            .insert(handle.to_owned(), key);
    }

    fn remove_key(&self, bucket: &str, handle: &str) {
        let mut map = self.inner.lock().expect("key store poisoned");
        if let Some(keys) = map.get_mut(bucket) {
            keys.remove(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CryptoKey, CryptoKeyStore, InMemoryCryptoKeyStore};

    use chrono::{Duration, Utc};

    #[test]
    fn current_key_is_minted_and_then_reused() {
        let store = InMemoryCryptoKeyStore::new();
        let (handle, key) = store.get_current_key("codes", Duration::days(1));
        assert_eq!(key.key().len(), 32);

        let (handle2, key2) = store.get_current_key("codes", Duration::days(1));
        assert_eq!(handle, handle2);
        assert_eq!(key, key2);

        assert_eq!(store.get_key("codes", &handle), Some(key));
    }

    #[test]
    fn nearly_expired_key_is_rotated() {
        let store = InMemoryCryptoKeyStore::new();
        store.store_key(
            "codes",
            "old",
            CryptoKey::new(vec![1u8; 32], Utc::now() + Duration::hours(1)),
        );
        let (handle, _) = store.get_current_key("codes", Duration::days(1));
        assert_ne!(handle, "old");
        // The old key stays resolvable so outstanding tokens still verify.
        assert!(store.get_key("codes", "old").is_some());
    }

    #[test]
    fn buckets_are_independent() {
        let store = InMemoryCryptoKeyStore::new();
        let (handle, _) = store.get_current_key("codes", Duration::days(1));
        assert!(store.get_key("tokens", &handle).is_none());

        store.remove_key("codes", &handle);
        assert!(store.get_key("codes", &handle).is_none());
    }

    #[test]
    fn keys_are_ordered_by_freshness() {
        let store = InMemoryCryptoKeyStore::new();
        store.store_key(
            "b",
            "near",
            CryptoKey::new(vec![1u8; 32], Utc::now() + Duration::days(1)),
        );
        store.store_key(
            "b",
            "far",
            CryptoKey::new(vec![2u8; 32], Utc::now() + Duration::days(30)),
        );
        let handles: Vec<String> = store.get_keys("b").into_iter().map(|(h, _)| h).collect();
        assert_eq!(handles, vec!["far".to_string(), "near".to_string()]);
    }
}
