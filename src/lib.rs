#![warn(missing_docs)]
//! Message-channel plumbing for OpenID-style and OAuth-style protocols: a composable
//! binding-element pipeline for signing, replay protection, and expiration; Diffie-Hellman
//! association establishment; self-protecting serialized tokens ("data bags"); and the
//! Key-Value Form codec.
//!
//! The crate performs no network or persistent I/O. Channels produce transport-neutral
//! [`OutgoingResponse`] values and consume raw wire fields, so any web framework can host an
//! endpoint; storage is abstracted behind the [`AssociationStore`], [`NonceStore`], and
//! [`CryptoKeyStore`] traits with process-local implementations included.
//!
//! # Example
//!
//! Minting and redeeming a single-use authorization code:
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use chrono::Duration;
//! use url::Url;
//!
//! use openauth_messaging::{
//!     AuthorizationCodeBag, ClientIdentifier, DataBagFormatter, InMemoryCryptoKeyStore,
//!     InMemoryNonceStore, ScopeSet, Username,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let formatter: DataBagFormatter<AuthorizationCodeBag> = DataBagFormatter::builder()
//!     .set_key_store(Arc::new(InMemoryCryptoKeyStore::new()), "codes")
//!     .set_signed()
//!     .set_max_age(Duration::minutes(10))
//!     .set_decode_once(Arc::new(InMemoryNonceStore::new(Duration::minutes(10))))
//!     .build()?;
//!
//! let callback = Url::parse("https://client.example/cb")?;
//! let code = formatter.serialize(&AuthorizationCodeBag::new(
//!     ClientIdentifier::new("client-1".to_string()),
//!     &callback,
//!     ScopeSet::from_space_delimited("read"),
//!     Some(Username::new("alice".to_string())),
//! ))?;
//!
//! // The code redeems exactly once, and only for the callback it was issued to.
//! let bag = formatter.deserialize(&code)?;
//! assert!(bag.matches_callback(&callback));
//! assert!(formatter.deserialize(&code).is_err());
//! # Ok(()) }
//! ```

#[macro_use]
mod macros;

pub mod association;
pub mod bindings;
pub mod channel;
pub mod databag;
pub mod dh;
pub mod http;
pub mod keystore;
pub mod kvform;
pub mod message;
pub mod nonce;
pub mod signature;
mod types;

pub use crate::association::{
    Association, AssociationError, AssociationStore, AssociationType, InMemoryAssociationStore,
};
pub use crate::bindings::{
    BindingElement, ExpirationBindingElement, ExtensionsBindingElement,
    ReplayProtectionBindingElement, SigningBindingElement,
};
pub use crate::channel::{Channel, ChannelBuilder};
pub use crate::databag::{
    AccessTokenBag, AuthorizationCodeBag, DataBag, DataBagError, DataBagFormatter,
    DataBagFormatterBuilder, RefreshTokenBag,
};
pub use crate::dh::{
    mask_secret, unmask_secret, DhError, DhKeyPair, DhParameters, DhSessionType,
};
pub use crate::http::{
    oauth_authorization_header, parse_oauth_authorization_header, OutgoingResponse,
};
pub use crate::keystore::{CryptoKey, CryptoKeyStore, InMemoryCryptoKeyStore};
pub use crate::kvform::{ConformanceLevel, KeyValueFormEncoding, KeyValueFormError};
pub use crate::message::{
    Delivery, Extension, Message, MessageDescription, MessageFactory, Part, PartProtection,
    Protection, ProtocolError,
};
pub use crate::nonce::{InMemoryNonceStore, NonceStore};
pub use crate::signature::{
    HmacSha1SignatureMethod, PlaintextSignatureMethod, RsaSha1SignatureMethod, SignatureError,
    SignatureMethod, SignatureMethodSet,
};
pub use crate::types::{
    AssociationHandle, ClientIdentifier, MasterSecret, ProtocolVersion, ScopeSet, Username,
};
