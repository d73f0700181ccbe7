//! The concrete token payloads carried by [`DataBagFormatter`](super::DataBagFormatter).

use super::{DataBag, DataBagError};
use crate::types::{ClientIdentifier, ScopeSet, Username};

use base64::prelude::BASE64_URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Duration;
use sha2::{Digest, Sha256};
use url::Url;

use std::collections::BTreeMap;

fn required<'a>(
    fields: &'a BTreeMap<String, String>,
    name: &'static str,
) -> Result<&'a str, DataBagError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or(DataBagError::MissingField(name))
}

fn optional_username(fields: &BTreeMap<String, String>) -> Option<Username> {
    fields
        .get("username")
        .map(|username| Username::new(username.clone()))
}

/// The state behind an authorization code: who asked, for what, on whose behalf, and where the
/// code must be redeemed.
///
/// The callback URI is stored as a SHA-256 hash; redemption presents the URI again and the two
/// must match.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AuthorizationCodeBag {
    client_identifier: ClientIdentifier,
    scope: ScopeSet,
    username: Option<Username>,
    callback_uri_hash: Vec<u8>,
}

impl AuthorizationCodeBag {
    /// Record a grant made to `client_identifier` for redemption at `callback`.
    pub fn new(
        client_identifier: ClientIdentifier,
        callback: &Url,
        scope: ScopeSet,
        username: Option<Username>,
    ) -> Self {
        AuthorizationCodeBag {
            client_identifier,
            scope,
            username,
            callback_uri_hash: Sha256::digest(callback.as_str().as_bytes()).to_vec(),
        }
    }

    /// The client the code was issued to.
    pub fn client_identifier(&self) -> &ClientIdentifier {
        &self.client_identifier
    }

    /// The granted scopes.
    pub fn scope(&self) -> &ScopeSet {
        &self.scope
    }

    /// The resource owner, when one authenticated.
    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }

    /// Whether `callback` matches the URI the code was issued for.
    pub fn matches_callback(&self, callback: &Url) -> bool {
        Sha256::digest(callback.as_str().as_bytes()).as_slice() == self.callback_uri_hash
    }
}

impl DataBag for AuthorizationCodeBag {
    fn bag_type() -> &'static str {
        "authorization_code"
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("client_id".to_owned(), self.client_identifier.to_string()),
            ("scope".to_owned(), self.scope.to_string()),
            (
                "cb".to_owned(),
                BASE64_URL_SAFE_NO_PAD.encode(&self.callback_uri_hash),
            ),
        ];
        if let Some(username) = &self.username {
            fields.push(("username".to_owned(), username.to_string()));
        }
        fields
    }

    fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, DataBagError> {
        let callback_uri_hash = BASE64_URL_SAFE_NO_PAD
            .decode(required(fields, "cb")?)
            .map_err(|_| DataBagError::Malformed("invalid callback hash".to_owned()))?;
        Ok(AuthorizationCodeBag {
            client_identifier: ClientIdentifier::new(required(fields, "client_id")?.to_owned()),
            scope: ScopeSet::from_space_delimited(required(fields, "scope")?),
            username: optional_username(fields),
            callback_uri_hash,
        })
    }

    fn validate(&self) -> Result<(), DataBagError> {
        if self.callback_uri_hash.len() != 32 {
            return Err(DataBagError::Malformed(
                "callback hash is not SHA-256 sized".to_owned(),
            ));
        }
        Ok(())
    }
}

/// The state behind a refresh token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RefreshTokenBag {
    client_identifier: ClientIdentifier,
    scope: ScopeSet,
    username: Option<Username>,
}

impl RefreshTokenBag {
    /// Record a long-lived grant to `client_identifier`.
    pub fn new(
        client_identifier: ClientIdentifier,
        scope: ScopeSet,
        username: Option<Username>,
    ) -> Self {
        RefreshTokenBag {
            client_identifier,
            scope,
            username,
        }
    }

    /// The client the token was issued to.
    pub fn client_identifier(&self) -> &ClientIdentifier {
        &self.client_identifier
    }

    /// The granted scopes.
    pub fn scope(&self) -> &ScopeSet {
        &self.scope
    }

    /// The resource owner, when one authenticated.
    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }
}

impl DataBag for RefreshTokenBag {
    fn bag_type() -> &'static str {
        "refresh_token"
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("client_id".to_owned(), self.client_identifier.to_string()),
            ("scope".to_owned(), self.scope.to_string()),
        ];
        if let Some(username) = &self.username {
            fields.push(("username".to_owned(), username.to_string()));
        }
        fields
    }

    fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, DataBagError> {
        Ok(RefreshTokenBag {
            client_identifier: ClientIdentifier::new(required(fields, "client_id")?.to_owned()),
            scope: ScopeSet::from_space_delimited(required(fields, "scope")?),
            username: optional_username(fields),
        })
    }
}

/// The state behind an access token, including its own lifetime so resource servers need no
/// callback to the authorization server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AccessTokenBag {
    client_identifier: ClientIdentifier,
    scope: ScopeSet,
    username: Option<Username>,
    lifetime: Option<Duration>,
}

impl AccessTokenBag {
    /// Record an access grant. `lifetime` of `None` defers entirely to the formatter's
    /// maximum age.
    pub fn new(
        client_identifier: ClientIdentifier,
        scope: ScopeSet,
        username: Option<Username>,
        lifetime: Option<Duration>,
    ) -> Self {
        AccessTokenBag {
            client_identifier,
            scope,
            username,
            lifetime,
        }
    }

    /// The client the token was issued to.
    pub fn client_identifier(&self) -> &ClientIdentifier {
        &self.client_identifier
    }

    /// The granted scopes.
    pub fn scope(&self) -> &ScopeSet {
        &self.scope
    }

    /// The resource owner, when one authenticated.
    pub fn username(&self) -> Option<&Username> {
        self.username.as_ref()
    }

    /// The token's own lifetime, when it carries one.
    pub fn lifetime(&self) -> Option<Duration> {
        self.lifetime
    }
}

impl DataBag for AccessTokenBag {
    fn bag_type() -> &'static str {
        "access_token"
    }

    fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("client_id".to_owned(), self.client_identifier.to_string()),
            ("scope".to_owned(), self.scope.to_string()),
        ];
        if let Some(username) = &self.username {
            fields.push(("username".to_owned(), username.to_string()));
        }
        if let Some(lifetime) = self.lifetime {
            fields.push(("lifetime".to_owned(), lifetime.num_seconds().to_string()));
        }
        fields
    }

    fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self, DataBagError> {
        let lifetime = match fields.get("lifetime") {
            Some(raw) => Some(
                raw.parse::<i64>()
                    .map(Duration::seconds)
                    .map_err(|_| DataBagError::Malformed("unparseable lifetime".to_owned()))?,
            ),
            None => None,
        };
        Ok(AccessTokenBag {
            client_identifier: ClientIdentifier::new(required(fields, "client_id")?.to_owned()),
            scope: ScopeSet::from_space_delimited(required(fields, "scope")?),
            username: optional_username(fields),
            lifetime,
        })
    }
}
