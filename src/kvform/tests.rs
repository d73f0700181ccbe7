use super::{ConformanceLevel, KeyValueFormEncoding, KeyValueFormError};

use pretty_assertions::assert_eq;

fn decode_at(level: ConformanceLevel, data: &[u8]) -> Result<Vec<(String, String)>, KeyValueFormError> {
    KeyValueFormEncoding::new(level).decode(data)
}

#[test]
fn encode_decode_round_trip_loose() {
    let encoded = KeyValueFormEncoding::encode([("a", "b")]).unwrap();
    assert_eq!(encoded, b"a:b\n".to_vec());
    let decoded = decode_at(ConformanceLevel::Loose, &encoded).unwrap();
    assert_eq!(decoded, vec![("a".to_string(), "b".to_string())]);
}

#[test]
fn encode_preserves_order() {
    let encoded =
        KeyValueFormEncoding::encode([("mode", "id_res"), ("assoc_handle", "h1")]).unwrap();
    assert_eq!(encoded, b"mode:id_res\nassoc_handle:h1\n".to_vec());
}

#[test]
fn embedded_newline_fails_at_encode_time() {
    assert_eq!(
        KeyValueFormEncoding::encode([("a", "b\nc")]),
        Err(KeyValueFormError::IllegalCharacter('\n', "value"))
    );
    assert_eq!(
        KeyValueFormEncoding::encode([("a\nb", "c")]),
        Err(KeyValueFormError::IllegalCharacter('\n', "key"))
    );
    assert_eq!(
        KeyValueFormEncoding::encode([("a:b", "c")]),
        Err(KeyValueFormError::IllegalCharacter(':', "key"))
    );
}

#[test]
fn colons_in_values_are_fine() {
    let encoded = KeyValueFormEncoding::encode([("url", "https://example.com/")]).unwrap();
    let decoded = decode_at(ConformanceLevel::OpenId20, &encoded).unwrap();
    assert_eq!(
        decoded,
        vec![("url".to_string(), "https://example.com/".to_string())]
    );
}

#[test]
fn loose_mode_trims_and_skips_blank_lines() {
    let decoded = decode_at(ConformanceLevel::Loose, b"  a : b \n\n c:d").unwrap();
    assert_eq!(
        decoded,
        vec![
            ("a".to_string(), "b".to_string()),
            ("c".to_string(), "d".to_string()),
        ]
    );
}

#[test]
fn strict_modes_require_trailing_newline() {
    assert_eq!(
        decode_at(ConformanceLevel::OpenId20, b"a:b"),
        Err(KeyValueFormError::MissingTrailingNewline)
    );
    assert!(decode_at(ConformanceLevel::Loose, b"a:b").is_ok());
    assert!(decode_at(ConformanceLevel::OpenId20, b"a:b\n").is_ok());
}

#[test]
fn strict_modes_reject_whitespace_around_separator() {
    assert_eq!(
        decode_at(ConformanceLevel::OpenId11, b"a :b\n"),
        Err(KeyValueFormError::IllegalWhitespace(1))
    );
    assert_eq!(
        decode_at(ConformanceLevel::OpenId20, b"a: b\n"),
        Err(KeyValueFormError::IllegalWhitespace(1))
    );
}

#[test]
fn openid11_trims_outer_whitespace_but_openid20_keeps_it() {
    let decoded = decode_at(ConformanceLevel::OpenId11, b"a:b \n").unwrap();
    assert_eq!(decoded, vec![("a".to_string(), "b".to_string())]);

    let decoded = decode_at(ConformanceLevel::OpenId20, b"a:b \n").unwrap();
    assert_eq!(decoded, vec![("a".to_string(), "b ".to_string())]);
}

#[test]
fn missing_separator_is_rejected() {
    assert_eq!(
        decode_at(ConformanceLevel::Loose, b"ab\n"),
        Err(KeyValueFormError::MissingSeparator(1))
    );
}

#[test]
fn duplicate_keys_are_rejected() {
    assert_eq!(
        decode_at(ConformanceLevel::Loose, b"a:b\na:c\n"),
        Err(KeyValueFormError::DuplicateKey("a".to_string()))
    );
}

#[test]
fn invalid_utf8_is_rejected() {
    assert_eq!(
        decode_at(ConformanceLevel::Loose, &[0xff, 0xfe]),
        Err(KeyValueFormError::InvalidUtf8)
    );
}
