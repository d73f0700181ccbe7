use super::{
    parts, Delivery, Message, MessageDescription, MessageFactory, Part, Protection, ProtocolError,
};
use crate::types::ProtocolVersion;

use pretty_assertions::assert_eq;

use std::collections::BTreeMap;

static CHECKID_REQUEST: MessageDescription = MessageDescription {
    kind: "checkid_request",
    delivery: Delivery::Indirect,
    required_protection: Protection::NONE,
    capabilities: Protection::NONE,
    parts: &[
        Part::required("mode"),
        Part::required("return_to"),
        Part::optional("claimed_id").since(ProtocolVersion::V2_0),
        Part::optional("trust_root").allow_empty(),
    ],
};

static POSITIVE_ASSERTION: MessageDescription = MessageDescription {
    kind: "positive_assertion",
    delivery: Delivery::Indirect,
    required_protection: Protection::ALL,
    capabilities: Protection::ALL,
    parts: &[
        Part::required("mode"),
        Part::required("claimed_id").signed(),
        Part::required("return_to").signed(),
        Part::required(parts::NONCE),
        Part::required(parts::CREATED),
        Part::required(parts::ASSOCIATION_HANDLE),
        Part::required(parts::SIGNED_LIST),
        Part::required(parts::SIGNATURE),
        Part::optional(parts::INVALIDATE_HANDLE),
    ],
};

static ASSOCIATE_REQUEST_DH: MessageDescription = MessageDescription {
    kind: "associate_request_dh",
    delivery: Delivery::Direct,
    required_protection: Protection::NONE,
    capabilities: Protection::NONE,
    parts: &[
        Part::required("mode"),
        Part::required("session_type"),
        Part::required("dh_consumer_public"),
    ],
};

static ASSOCIATE_REQUEST_PLAIN: MessageDescription = MessageDescription {
    kind: "associate_request_plain",
    delivery: Delivery::Direct,
    required_protection: Protection::NONE,
    capabilities: Protection::NONE,
    parts: &[Part::required("mode"), Part::required("assoc_type")],
};

#[test]
fn protection_bitset_union_and_containment() {
    let applied = Protection::TAMPER | Protection::REPLAY;
    assert!(applied.contains(Protection::TAMPER));
    assert!(applied.contains(Protection::NONE));
    assert!(!applied.contains(Protection::ALL));
    assert!(applied.intersects(Protection::REPLAY));
    assert!(!applied.intersects(Protection::EXPIRATION));

    let mut accumulated = Protection::NONE;
    assert!(accumulated.is_empty());
    accumulated |= Protection::EXPIRATION;
    accumulated |= applied;
    assert_eq!(accumulated, Protection::ALL);
}

#[test]
fn protection_display_names_every_flag() {
    assert_eq!(Protection::NONE.to_string(), "none");
    assert_eq!(Protection::TAMPER.to_string(), "tamper-protection");
    assert_eq!(
        Protection::ALL.to_string(),
        "tamper-protection+replay-protection+expiration"
    );
}

#[test]
fn missing_required_field_fails_validation() {
    let mut message = Message::new(&CHECKID_REQUEST, ProtocolVersion::V2_0);
    message.set("mode", "checkid_setup");
    assert_eq!(
        message.ensure_valid(),
        Err(ProtocolError::MissingRequiredField("return_to"))
    );

    message.set("return_to", "https://rp.example/return");
    assert_eq!(message.ensure_valid(), Ok(()));
}

#[test]
fn empty_values_require_allow_empty() {
    let mut message = Message::new(&CHECKID_REQUEST, ProtocolVersion::V2_0);
    message.set("mode", "checkid_setup");
    message.set("return_to", "");
    assert_eq!(
        message.ensure_valid(),
        Err(ProtocolError::EmptyField("return_to"))
    );

    message.set("return_to", "https://rp.example/return");
    message.set("trust_root", "");
    assert_eq!(message.ensure_valid(), Ok(()));
}

#[test]
fn version_gated_part_is_rejected_below_its_minimum() {
    let mut message = Message::new(&CHECKID_REQUEST, ProtocolVersion::V1_1);
    message.set("mode", "checkid_setup");
    message.set("return_to", "https://rp.example/return");
    message.set("claimed_id", "https://user.example/");
    assert_eq!(
        message.ensure_valid(),
        Err(ProtocolError::VersionTooLow {
            field: "claimed_id",
            min: ProtocolVersion::V2_0,
            actual: ProtocolVersion::V1_1,
        })
    );

    // At V2_0 the same message is fine; below it, the field must simply be absent.
    let fields = message.clone().into_fields();
    let at_v2 = Message::from_fields(&CHECKID_REQUEST, ProtocolVersion::V2_0, fields);
    assert_eq!(at_v2.ensure_valid(), Ok(()));

    message.remove("claimed_id");
    assert_eq!(message.ensure_valid(), Ok(()));
}

#[test]
fn signed_critical_parts_reflect_presence() {
    let mut message = Message::new(&POSITIVE_ASSERTION, ProtocolVersion::V2_0);
    message.set("claimed_id", "https://user.example/");
    assert_eq!(message.signed_critical_parts(), vec!["claimed_id"]);

    message.set("return_to", "https://rp.example/return");
    assert_eq!(
        message.signed_critical_parts(),
        vec!["claimed_id", "return_to"]
    );
}

#[test]
fn factory_picks_first_matching_recognizer() {
    // The DH variant is a superset of the plaintext variant, so it registers first.
    let factory = MessageFactory::new()
        .recognize(
            |fields| {
                fields.get("mode").map(String::as_str) == Some("associate")
                    && fields.contains_key("dh_consumer_public")
            },
            &ASSOCIATE_REQUEST_DH,
        )
        .recognize(
            |fields| fields.get("mode").map(String::as_str) == Some("associate"),
            &ASSOCIATE_REQUEST_PLAIN,
        );

    let mut fields = BTreeMap::new();
    fields.insert("mode".to_owned(), "associate".to_owned());
    fields.insert("assoc_type".to_owned(), "HMAC-SHA256".to_owned());

    let message = factory
        .instantiate(ProtocolVersion::V2_0, &fields)
        .expect("plain variant should match");
    assert_eq!(message.description().kind, "associate_request_plain");

    fields.insert("dh_consumer_public".to_owned(), "AQAB".to_owned());
    let message = factory
        .instantiate(ProtocolVersion::V2_0, &fields)
        .expect("dh variant should match");
    assert_eq!(message.description().kind, "associate_request_dh");
}

#[test]
fn factory_returns_none_for_unrecognized_fields() {
    let factory = MessageFactory::new().recognize(
        |fields| fields.contains_key("mode"),
        &ASSOCIATE_REQUEST_PLAIN,
    );
    let mut fields = BTreeMap::new();
    fields.insert("utm_source".to_owned(), "newsletter".to_owned());
    assert!(factory
        .instantiate(ProtocolVersion::V2_0, &fields)
        .is_none());
}

#[test]
fn http_status_distinguishes_security_failures() {
    assert_eq!(
        ProtocolError::TamperDetected.http_status(),
        http::StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        ProtocolError::Replayed.http_status(),
        http::StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        ProtocolError::MissingRequiredField("mode").http_status(),
        http::StatusCode::BAD_REQUEST
    );
}

#[test]
fn message_fields_iterate_in_sorted_order() {
    let mut message = Message::new(&CHECKID_REQUEST, ProtocolVersion::V2_0);
    message.set("zebra", "1");
    message.set("alpha", "2");
    message.set("mode", "3");
    let names: Vec<&str> = message.fields().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["alpha", "mode", "zebra"]);
}
