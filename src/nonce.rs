use chrono::{DateTime, Duration, Utc};
use log::debug;

use std::collections::HashMap;
use std::sync::Mutex;

/// Records nonces to detect replayed messages and single-use tokens.
///
/// A duplicate within the validity window is the *expected* signal for "replay detected": it is
/// reported as `false`, never as an error. Implementations must make the insert atomic with
/// respect to concurrent callers presenting the same `(context, code)` pair; a unique
/// constraint or insert-if-absent primitive is the arbiter, never read-then-write.
pub trait NonceStore: Send + Sync {
    /// Atomically record `(context, code)` as used, where `issued` is the UTC instant the
    /// message or token carrying the nonce claims to have been created.
    ///
    /// Returns `false` if the pair was already recorded within the still-valid window.
    fn store_nonce(&self, context: &str, code: &str, issued: DateTime<Utc>) -> bool;
}

/// Purge expired rows after this many successful stores. Compaction is storage hygiene only;
/// correctness relies solely on the uniqueness of live entries.
const COMPACTION_INTERVAL: u32 = 100;

/// A process-local nonce store backed by a mutex-guarded map.
pub struct InMemoryNonceStore {
    max_age: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    // (context, code) -> expiration
    entries: HashMap<(String, String), DateTime<Utc>>,
    stores_since_compaction: u32,
}

impl InMemoryNonceStore {
    /// Create a store that considers nonces live for `max_age` past their issue time. The
    /// window must cover the maximum message lifetime accepted by the callers sharing it.
    pub fn new(max_age: Duration) -> Self {
        InMemoryNonceStore {
            max_age,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                stores_since_compaction: 0,
            }),
        }
    }
}

impl NonceStore for InMemoryNonceStore {
    fn store_nonce(&self, context: &str, code: &str, issued: DateTime<Utc>) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("nonce store poisoned");

        let key = (context.to_owned(), code.to_owned());
        if let Some(&expires) = inner.entries.get(&key) {
            if expires >= now {
                return false;
            }
            // The previous entry aged out; an expiration check elsewhere rejects the stale
            // message itself, so reusing the slot is safe.
        }

        inner.entries.insert(key, issued + self.max_age);

        inner.stores_since_compaction += 1;
        if inner.stores_since_compaction >= COMPACTION_INTERVAL {
            let before = inner.entries.len();
            inner.entries.retain(|_, &mut expires| expires >= now);
            debug!(
                "nonce store compaction removed {} expired entries",
                before - inner.entries.len()
            );
            inner.stores_since_compaction = 0;
        }

        true
    }
}
