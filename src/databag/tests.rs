use super::{
    AccessTokenBag, AuthorizationCodeBag, DataBag, DataBagError, DataBagFormatter, RefreshTokenBag,
};
use crate::keystore::{CryptoKeyStore, InMemoryCryptoKeyStore};
use crate::nonce::InMemoryNonceStore;
use crate::types::{ClientIdentifier, ScopeSet, Username};

use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Duration;
use pretty_assertions::assert_eq;
use url::Url;

use std::sync::Arc;

fn code_bag() -> AuthorizationCodeBag {
    AuthorizationCodeBag::new(
        ClientIdentifier::new("client-1".to_owned()),
        &Url::parse("https://rp.example/callback").unwrap(),
        ScopeSet::from_space_delimited("read write"),
        Some(Username::new("alice".to_owned())),
    )
}

fn refresh_bag() -> RefreshTokenBag {
    RefreshTokenBag::new(
        ClientIdentifier::new("client-1".to_owned()),
        ScopeSet::from_space_delimited("read"),
        Some(Username::new("alice".to_owned())),
    )
}

fn signed_formatter<T: DataBag>(store: Arc<InMemoryCryptoKeyStore>) -> DataBagFormatter<T> {
    DataBagFormatter::builder()
        .set_key_store(store, "test")
        .set_signed()
        .set_max_age(Duration::minutes(5))
        .build()
        .unwrap()
}

/// Flip the lowest bit of the last payload byte without disturbing the framing.
fn tamper(token: &str) -> String {
    let (handle, body) = token.split_once('!').unwrap();
    let mut frame = BASE64_URL_SAFE_NO_PAD.decode(body).unwrap();
    *frame.last_mut().unwrap() ^= 1;
    format!("{}!{}", handle, BASE64_URL_SAFE_NO_PAD.encode(frame))
}

#[test]
fn signed_round_trip() {
    let formatter = signed_formatter::<AuthorizationCodeBag>(Arc::new(InMemoryCryptoKeyStore::new()));
    let bag = code_bag();
    let token = formatter.serialize(&bag).unwrap();
    assert_eq!(formatter.deserialize(&token).unwrap(), bag);
}

#[test]
fn single_bit_flip_is_detected() {
    let formatter = signed_formatter::<AuthorizationCodeBag>(Arc::new(InMemoryCryptoKeyStore::new()));
    let token = formatter.serialize(&code_bag()).unwrap();
    assert_eq!(
        formatter.deserialize(&tamper(&token)),
        Err(DataBagError::Tampered)
    );
}

#[test]
fn encrypted_compressed_round_trip() {
    let formatter: DataBagFormatter<AuthorizationCodeBag> = DataBagFormatter::builder()
        .set_key_store(Arc::new(InMemoryCryptoKeyStore::new()), "test")
        .set_signed()
        .set_encrypted()
        .set_compressed()
        .set_max_age(Duration::minutes(5))
        .build()
        .unwrap();
    let bag = code_bag();
    let token = formatter.serialize(&bag).unwrap();
    // The ciphertext must not expose the plaintext fields.
    assert!(!token.contains("alice"));
    assert_eq!(formatter.deserialize(&token).unwrap(), bag);
}

#[test]
fn rsa_signed_hybrid_encrypted_round_trip() {
    let mut rng = rand::thread_rng();
    let sender_key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();
    let recipient_key = rsa::RsaPrivateKey::new(&mut rng, 2048).unwrap();

    let sender: DataBagFormatter<RefreshTokenBag> = DataBagFormatter::builder()
        .set_rsa_signing(
            Some(sender_key.clone()),
            rsa::RsaPublicKey::from(&sender_key),
        )
        .set_rsa_encryption(Some(rsa::RsaPublicKey::from(&recipient_key)), None)
        .set_signed()
        .set_encrypted()
        .build()
        .unwrap();
    let recipient: DataBagFormatter<RefreshTokenBag> = DataBagFormatter::builder()
        .set_rsa_signing(None, rsa::RsaPublicKey::from(&sender_key))
        .set_rsa_encryption(None, Some(recipient_key))
        .set_signed()
        .set_encrypted()
        .build()
        .unwrap();

    let bag = refresh_bag();
    let token = sender.serialize(&bag).unwrap();
    assert_eq!(recipient.deserialize(&token).unwrap(), bag);

    let mut frame = BASE64_URL_SAFE_NO_PAD.decode(&token).unwrap();
    *frame.last_mut().unwrap() ^= 1;
    assert_eq!(
        recipient.deserialize(&BASE64_URL_SAFE_NO_PAD.encode(frame)),
        Err(DataBagError::Tampered)
    );
}

#[test]
fn single_use_token_cannot_be_redeemed_twice() {
    let formatter: DataBagFormatter<AuthorizationCodeBag> = DataBagFormatter::builder()
        .set_key_store(Arc::new(InMemoryCryptoKeyStore::new()), "codes")
        .set_signed()
        .set_max_age(Duration::minutes(5))
        .set_decode_once(Arc::new(InMemoryNonceStore::new(Duration::minutes(5))))
        .build()
        .unwrap();
    let token = formatter.serialize(&code_bag()).unwrap();
    assert!(formatter.deserialize(&token).is_ok());
    assert_eq!(formatter.deserialize(&token), Err(DataBagError::Replayed));
}

#[test]
fn failed_verification_does_not_consume_the_nonce() {
    let formatter: DataBagFormatter<AuthorizationCodeBag> = DataBagFormatter::builder()
        .set_key_store(Arc::new(InMemoryCryptoKeyStore::new()), "codes")
        .set_signed()
        .set_max_age(Duration::minutes(5))
        .set_decode_once(Arc::new(InMemoryNonceStore::new(Duration::minutes(5))))
        .build()
        .unwrap();
    let token = formatter.serialize(&code_bag()).unwrap();
    assert_eq!(
        formatter.deserialize(&tamper(&token)),
        Err(DataBagError::Tampered)
    );
    // The genuine token still redeems: the tampered copy never reached the nonce store.
    assert!(formatter.deserialize(&token).is_ok());
}

#[test]
fn expired_token_is_rejected() {
    let store = Arc::new(InMemoryCryptoKeyStore::new());
    let minter = signed_formatter::<AuthorizationCodeBag>(Arc::clone(&store));
    let strict: DataBagFormatter<AuthorizationCodeBag> = DataBagFormatter::builder()
        .set_key_store(store, "test")
        .set_signed()
        .set_max_age(Duration::seconds(1))
        .build()
        .unwrap();

    let token = minter.serialize(&code_bag()).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(2500));
    assert!(matches!(
        strict.deserialize(&token),
        Err(DataBagError::Expired { .. })
    ));
    // The longer-lived formatter still accepts it.
    assert!(minter.deserialize(&token).is_ok());
}

#[test]
fn token_type_cannot_be_confused() {
    let store = Arc::new(InMemoryCryptoKeyStore::new());
    let codes = signed_formatter::<AuthorizationCodeBag>(Arc::clone(&store));
    let refreshes = signed_formatter::<RefreshTokenBag>(store);

    let token = codes.serialize(&code_bag()).unwrap();
    assert!(matches!(
        refreshes.deserialize(&token),
        Err(DataBagError::Malformed(_))
    ));
}

#[test]
fn revoked_key_invalidates_outstanding_tokens() {
    let store = Arc::new(InMemoryCryptoKeyStore::new());
    let formatter = signed_formatter::<AuthorizationCodeBag>(Arc::clone(&store));
    let token = formatter.serialize(&code_bag()).unwrap();

    let (handle, _) = token.split_once('!').unwrap();
    store.remove_key("test", handle);
    assert_eq!(formatter.deserialize(&token), Err(DataBagError::Tampered));
}

#[test]
fn callback_hash_round_trips_and_discriminates() {
    let formatter = signed_formatter::<AuthorizationCodeBag>(Arc::new(InMemoryCryptoKeyStore::new()));
    let token = formatter.serialize(&code_bag()).unwrap();
    let bag = formatter.deserialize(&token).unwrap();
    assert!(bag.matches_callback(&Url::parse("https://rp.example/callback").unwrap()));
    assert!(!bag.matches_callback(&Url::parse("https://attacker.example/callback").unwrap()));
}

#[test]
fn access_token_lifetime_round_trips() {
    let formatter = signed_formatter::<AccessTokenBag>(Arc::new(InMemoryCryptoKeyStore::new()));
    let bag = AccessTokenBag::new(
        ClientIdentifier::new("client-1".to_owned()),
        ScopeSet::from_space_delimited("read"),
        None,
        Some(Duration::hours(1)),
    );
    let token = formatter.serialize(&bag).unwrap();
    let recovered = formatter.deserialize(&token).unwrap();
    assert_eq!(recovered.lifetime(), Some(Duration::hours(1)));
    assert!(recovered.username().is_none());
}

#[test]
fn decode_once_demands_signing_and_a_lifetime() {
    let unsigned = DataBagFormatter::<AuthorizationCodeBag>::builder()
        .set_key_store(Arc::new(InMemoryCryptoKeyStore::new()), "codes")
        .set_max_age(Duration::minutes(5))
        .set_decode_once(Arc::new(InMemoryNonceStore::new(Duration::minutes(5))))
        .build();
    assert!(matches!(unsigned, Err(DataBagError::Misconfigured(_))));

    let unbounded = DataBagFormatter::<AuthorizationCodeBag>::builder()
        .set_key_store(Arc::new(InMemoryCryptoKeyStore::new()), "codes")
        .set_signed()
        .set_decode_once(Arc::new(InMemoryNonceStore::new(Duration::minutes(5))))
        .build();
    assert!(matches!(unbounded, Err(DataBagError::Misconfigured(_))));
}

#[test]
fn garbage_tokens_are_malformed_not_panics() {
    let formatter = signed_formatter::<AuthorizationCodeBag>(Arc::new(InMemoryCryptoKeyStore::new()));
    assert!(matches!(
        formatter.deserialize("no-separator"),
        Err(DataBagError::Malformed(_))
    ));
    assert!(matches!(
        formatter.deserialize("handle!***"),
        Err(DataBagError::Tampered) | Err(DataBagError::Malformed(_))
    ));
}
