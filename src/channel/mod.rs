//! The message channel: an immutable pipeline of binding elements plus the serialization
//! glue that turns prepared messages into HTTP responses and raw fields into verified
//! messages.

use crate::bindings::BindingElement;
use crate::http::OutgoingResponse;
use crate::kvform::{ConformanceLevel, KeyValueFormEncoding};
use crate::message::{Delivery, Message, MessageFactory, Protection, ProtocolError};
use crate::types::ProtocolVersion;

use log::debug;
use url::Url;

use std::collections::BTreeMap;


/// Indirect messages whose GET URL would exceed this many bytes are delivered as an HTML
/// auto-post form instead, staying clear of user-agent URL length limits.
const INDIRECT_GET_TO_POST_THRESHOLD: usize = 2 * 1024;

/// Assembles a [`Channel`].
pub struct ChannelBuilder {
    elements: Vec<Box<dyn BindingElement>>,
    promoted_incoming: Vec<&'static str>,
    factory: MessageFactory,
    conformance: ConformanceLevel,
}

impl ChannelBuilder {
    /// Start with a message factory and no binding elements.
    pub fn new(factory: MessageFactory) -> Self {
        ChannelBuilder {
            elements: Vec::new(),
            promoted_incoming: Vec::new(),
            factory,
            conformance: ConformanceLevel::Loose,
        }
    }

    /// Append a binding element. Registration order is the outgoing processing order;
    /// incoming runs in reverse.
    pub fn add_element(mut self, element: impl BindingElement + 'static) -> Self {
        self.elements.push(Box::new(element));
        self
    }

    /// Move the named element to the front of the incoming order, ahead of the plain
    /// reversal. Verifying signatures before anything else is the usual reason.
    pub fn promote_incoming(mut self, name: &'static str) -> Self {
        self.promoted_incoming.push(name);
        self
    }

    /// Decode Key-Value Form bodies at the given strictness.
    pub fn set_kv_conformance(mut self, conformance: ConformanceLevel) -> Self {
        self.conformance = conformance;
        self
    }

    /// Produce the channel.
    pub fn build(self) -> Channel {
        let mut incoming_order: Vec<usize> = (0..self.elements.len()).rev().collect();
        for name in self.promoted_incoming.iter().rev() {
            if let Some(position) = incoming_order
                .iter()
                .position(|&index| self.elements[index].name() == *name)
            {
                let index = incoming_order.remove(position);
                incoming_order.insert(0, index);
            }
        }
        Channel {
            elements: self.elements,
            incoming_order,
            factory: self.factory,
            codec: KeyValueFormEncoding::new(self.conformance),
        }
    }
}

/// A configured message channel. Immutable and safe to share across request workers.
pub struct Channel {
    elements: Vec<Box<dyn BindingElement>>,
    incoming_order: Vec<usize>,
    factory: MessageFactory,
    codec: KeyValueFormEncoding,
}

impl Channel {
    /// Run the outgoing pipeline over a message, then validate it and check that the
    /// elements together achieved the protection the message requires.
    ///
    /// Validation runs after the pipeline because the pipeline is what populates the
    /// signature, nonce, and timestamp parts the schema requires.
    pub fn prepare_outgoing(&self, message: &mut Message) -> Result<(), ProtocolError> {
        let mut applied = Protection::NONE;
        for element in &self.elements {
            if let Some(contributed) = element.process_outgoing(message)? {
                applied = accumulate(applied, contributed)?;
            }
        }
        message.ensure_valid()?;
        ensure_protected(message, applied)
    }

    /// Prepare a direct message and encode it as a Key-Value Form response body.
    pub fn send_direct_response(
        &self,
        mut message: Message,
    ) -> Result<OutgoingResponse, ProtocolError> {
        self.prepare_outgoing(&mut message)?;
        let body = KeyValueFormEncoding::encode(message.fields())?;
        Ok(OutgoingResponse::direct(body))
    }

    /// Prepare an indirect message and deliver it via the user's browser: a 302 redirect
    /// with query parameters, or an HTML auto-post form once the URL would grow too long.
    pub fn send_indirect(
        &self,
        mut message: Message,
        recipient: &Url,
    ) -> Result<OutgoingResponse, ProtocolError> {
        if message.delivery() != Delivery::Indirect {
            return Err(ProtocolError::Malformed(format!(
                "`{}` is a direct message and cannot travel via the user's browser",
                message.description().kind
            )));
        }
        self.prepare_outgoing(&mut message)?;

        let mut target = recipient.clone();
        target
            .query_pairs_mut()
            .extend_pairs(message.fields());
        if target.as_str().len() <= INDIRECT_GET_TO_POST_THRESHOLD {
            debug!("delivering `{}` as a redirect", message.description().kind);
            return OutgoingResponse::redirect(&target);
        }

        debug!(
            "delivering `{}` as an auto-post form ({} byte URL)",
            message.description().kind,
            target.as_str().len()
        );
        Ok(OutgoingResponse::html(auto_post_form(recipient, &message)))
    }

    /// Decode a Key-Value Form direct-response body into raw fields.
    pub fn parse_direct_response(
        &self,
        body: &[u8],
    ) -> Result<BTreeMap<String, String>, ProtocolError> {
        Ok(self.codec.decode(body)?.into_iter().collect())
    }

    /// Receive raw wire fields: dispatch through the factory, run the incoming pipeline, and
    /// check the achieved protection.
    ///
    /// `Ok(None)` means no registered message kind matched; the endpoint may share its URL
    /// with unrelated traffic. Any element failure aborts immediately.
    pub fn receive(
        &self,
        version: ProtocolVersion,
        fields: &BTreeMap<String, String>,
    ) -> Result<Option<Message>, ProtocolError> {
        let mut message = match self.factory.instantiate(version, fields) {
            Some(message) => message,
            None => {
                debug!("incoming fields match no registered message kind");
                return Ok(None);
            }
        };

        let mut applied = Protection::NONE;
        for &index in &self.incoming_order {
            if let Some(contributed) = self.elements[index].process_incoming(&mut message)? {
                applied = accumulate(applied, contributed)?;
            }
        }
        ensure_protected(&message, applied)?;
        message.ensure_valid()?;
        Ok(Some(message))
    }
}

fn accumulate(applied: Protection, contributed: Protection) -> Result<Protection, ProtocolError> {
    if !contributed.is_empty() && applied.intersects(contributed) {
        return Err(ProtocolError::DuplicateProtection(contributed));
    }
    Ok(applied | contributed)
}

fn ensure_protected(message: &Message, applied: Protection) -> Result<(), ProtocolError> {
    let required = message.required_protection();
    if !applied.contains(required) {
        return Err(ProtocolError::Unprotected { required, applied });
    }
    Ok(())
}

fn auto_post_form(recipient: &Url, message: &Message) -> String {
    let mut inputs = String::new();
    for (name, value) in message.fields() {
        inputs.push_str(&format!(
            "<input type=\"hidden\" name=\"{}\" value=\"{}\"/>\n",
            html_escape(name),
            html_escape(value)
        ));
    }
    format!(
        "<!DOCTYPE html>\n<html><head><title>Redirecting...</title></head>\n<body onload=\"document.forms[0].submit()\">\n<form action=\"{}\" method=\"post\">\n{}<noscript><input type=\"submit\" value=\"Continue\"/></noscript>\n</form>\n</body></html>\n",
        html_escape(recipient.as_str()),
        inputs
    )
}

fn html_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}
