//! Transport-neutral representations of the HTTP responses a channel produces.
//!
//! The crate performs no I/O; callers hand these to whatever web framework hosts the endpoint.

use http::header::{HeaderMap, HeaderValue, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use http::StatusCode;
use url::Url;

use crate::message::ProtocolError;
use crate::signature::percent_encode;

use std::collections::BTreeMap;

/// MIME type for Key-Value Form direct-response bodies.
pub const CONTENT_TYPE_KVFORM: &str = "text/plain; charset=utf-8";
/// MIME type for HTML auto-post forms.
pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";

/// An HTTP response ready for a hosting framework to emit.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingResponse {
    status_code: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl OutgoingResponse {
    /// A 200 response with a Key-Value Form body.
    pub fn direct(body: Vec<u8>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_KVFORM));
        OutgoingResponse {
            status_code: StatusCode::OK,
            headers,
            body,
        }
    }

    /// A 302 redirect to `location`.
    pub fn redirect(location: &Url) -> Result<Self, ProtocolError> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(location.as_str()).map_err(|_| {
            ProtocolError::Malformed(format!("unrepresentable redirect target `{}`", location))
        })?;
        headers.insert(LOCATION, value);
        Ok(OutgoingResponse {
            status_code: StatusCode::FOUND,
            headers,
            body: Vec::new(),
        })
    }

    /// A 200 response carrying an HTML document (the auto-post form fallback).
    pub fn html(body: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_HTML));
        OutgoingResponse {
            status_code: StatusCode::OK,
            headers,
            body: body.into_bytes(),
        }
    }

    /// A 401 challenge demanding a bearer token for `realm`.
    pub fn bearer_auth_required(realm: &str) -> Result<Self, ProtocolError> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!("Bearer realm=\"{}\"", realm))
            .map_err(|_| ProtocolError::Malformed(format!("unrepresentable realm `{}`", realm)))?;
        headers.insert(WWW_AUTHENTICATE, value);
        Ok(OutgoingResponse {
            status_code: StatusCode::UNAUTHORIZED,
            headers,
            body: Vec::new(),
        })
    }

    /// The response status.
    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The response body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// Render message fields as an OAuth 1.0 `Authorization` header value:
/// `OAuth name="percent-encoded value", ...`.
pub fn oauth_authorization_header<'a, I>(fields: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let params = fields
        .into_iter()
        .map(|(name, value)| format!("{}=\"{}\"", percent_encode(name), percent_encode(value)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("OAuth {}", params)
}

/// Parse an OAuth 1.0 `Authorization` header value back into fields.
///
/// Returns `Ok(None)` when the scheme is not `OAuth`, since endpoints routinely receive
/// Basic or Bearer credentials meant for other handlers.
pub fn parse_oauth_authorization_header(
    header: &str,
) -> Result<Option<BTreeMap<String, String>>, ProtocolError> {
    let rest = match header.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("oauth") => rest,
        _ => return Ok(None),
    };
    let mut fields = BTreeMap::new();
    for param in rest.split(',') {
        let param = param.trim();
        if param.is_empty() {
            continue;
        }
        let (name, value) = param.split_once('=').ok_or_else(|| {
            ProtocolError::Malformed(format!("authorization parameter `{}` has no value", param))
        })?;
        let value = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')).ok_or_else(|| {
            ProtocolError::Malformed(format!("authorization parameter `{}` is not quoted", name))
        })?;
        fields.insert(percent_decode(name)?, percent_decode(value)?);
    }
    Ok(Some(fields))
}

fn percent_decode(input: &str) -> Result<String, ProtocolError> {
    let mut out = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();
    while let Some(byte) = bytes.next() {
        if byte != b'%' {
            out.push(byte);
            continue;
        }
        let hex: Vec<u8> = bytes.by_ref().take(2).collect();
        if hex.len() != 2 {
            return Err(ProtocolError::Malformed(
                "truncated percent escape in authorization header".to_owned(),
            ));
        }
        let decoded = std::str::from_utf8(&hex)
            .ok()
            .and_then(|pair| u8::from_str_radix(pair, 16).ok())
            .ok_or_else(|| {
                ProtocolError::Malformed("invalid percent escape in authorization header".to_owned())
            })?;
        out.push(decoded);
    }
    String::from_utf8(out)
        .map_err(|_| ProtocolError::Malformed("authorization header is not UTF-8".to_owned()))
}
