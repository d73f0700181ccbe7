use super::{
    Association, AssociationError, AssociationStore, AssociationType, InMemoryAssociationStore,
};
use crate::types::{AssociationHandle, MasterSecret, ProtocolVersion};

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

fn handle(s: &str) -> AssociationHandle {
    AssociationHandle::new(s.to_string())
}

#[test]
fn secret_length_is_validated() {
    let err = Association::new_hmac(
        AssociationType::HmacSha256,
        handle("h"),
        vec![0u8; 20],
        Utc::now(),
        Duration::hours(1),
    )
    .unwrap_err();
    assert_eq!(
        err,
        AssociationError::SecretLengthMismatch {
            alg: "HMAC-SHA256",
            expected: 32,
            actual: 20,
        }
    );

    assert!(Association::new_hmac(
        AssociationType::HmacSha1,
        handle("h"),
        vec![0u8; 20],
        Utc::now(),
        Duration::hours(1),
    )
    .is_ok());
}

#[test]
fn sign_and_verify_round_trip() {
    for assoc_type in [AssociationType::HmacSha1, AssociationType::HmacSha256] {
        let association = Association::generate(assoc_type, Duration::hours(1));
        let tag = association.sign(b"claimed_id=alice").unwrap();
        assert_eq!(tag.len(), assoc_type.secret_len());
        association.verify(b"claimed_id=alice", &tag).unwrap();
        assert_eq!(
            association.verify(b"claimed_id=mallory", &tag),
            Err(AssociationError::BadSignature)
        );
    }
}

#[test]
fn expired_association_refuses_to_sign_or_verify() {
    let association = Association::new_hmac(
        AssociationType::HmacSha1,
        handle("old"),
        vec![7u8; 20],
        Utc::now() - Duration::hours(2),
        Duration::hours(1),
    )
    .unwrap();
    assert!(association.is_expired(Utc::now()));
    assert!(matches!(
        association.sign(b"data"),
        Err(AssociationError::Expired(_, _))
    ));
    assert!(matches!(
        association.verify(b"data", &[0u8; 20]),
        Err(AssociationError::Expired(_, _))
    ));
}

#[test]
fn hmac_sha256_requires_openid_2() {
    let err = Association::for_version(
        ProtocolVersion::V1_1,
        AssociationType::HmacSha256,
        handle("h"),
        vec![0u8; 32],
        Duration::hours(1),
    )
    .unwrap_err();
    assert_eq!(
        err,
        AssociationError::DisallowedType("HMAC-SHA256", ProtocolVersion::V1_1)
    );

    assert!(Association::for_version(
        ProtocolVersion::V2_0,
        AssociationType::HmacSha256,
        handle("h"),
        vec![0u8; 32],
        Duration::hours(1),
    )
    .is_ok());
}

#[test]
fn wire_names_round_trip() {
    for assoc_type in [AssociationType::HmacSha1, AssociationType::HmacSha256] {
        assert_eq!(
            AssociationType::from_wire_name(assoc_type.wire_name()),
            Some(assoc_type)
        );
    }
    assert_eq!(AssociationType::from_wire_name("HMAC-SHA512"), None);
}

#[test]
fn store_returns_live_associations_and_purges_expired_ones() {
    let store = InMemoryAssociationStore::new();
    let live = Association::generate(AssociationType::HmacSha1, Duration::hours(1));
    let expired = Association::new_hmac(
        AssociationType::HmacSha1,
        handle("stale"),
        vec![1u8; 20],
        Utc::now() - Duration::hours(2),
        Duration::hours(1),
    )
    .unwrap();
    store.store(live.clone());
    store.store(expired);

    assert_eq!(store.get(live.handle()), Some(live.clone()));
    assert_eq!(store.get(&handle("stale")), None);

    store.remove(live.handle());
    assert_eq!(store.get(live.handle()), None);
}

#[test]
fn stateless_derivation_is_deterministic_per_handle() {
    let master = MasterSecret::new(vec![42u8; 32]);
    let a = Association::stateless(&master, handle("abc"));
    let b = Association::stateless(&master, handle("abc"));
    let c = Association::stateless(&master, handle("xyz"));
    assert_eq!(a.secret(), b.secret());
    assert_ne!(a.secret(), c.secret());
    assert_eq!(a.association_type(), AssociationType::HmacSha256);

    let tag = a.sign(b"assertion").unwrap();
    b.verify(b"assertion", &tag).unwrap();
}
