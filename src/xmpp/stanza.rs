//! Stanza classification and error construction.
//!
//! A stanza is a `message`, `presence` or `iq` element exchanged on a
//! bound stream. This module wraps [`Element`] with parsed addressing,
//! and provides the RFC 6120 error vocabulary: stanza error replies and
//! stream error elements.

use std::fmt;

use crate::jid::Jid;
use crate::xmpp::element::{ATTR_FROM, ATTR_ID, ATTR_TO, ATTR_TYPE, Element};

/// The three stanza kinds of RFC 6120.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

impl StanzaKind {
    pub fn from_name(name: &str) -> Option<StanzaKind> {
        match name {
            "message" => Some(StanzaKind::Message),
            "presence" => Some(StanzaKind::Presence),
            "iq" => Some(StanzaKind::Iq),
            _ => None,
        }
    }
}

/// Why an element failed to classify as a stanza.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StanzaError {
    #[error("not a stanza: <{0}/>")]
    NotStanza(String),
    #[error("invalid '{attr}' address: {reason}")]
    BadAddress { attr: &'static str, reason: String },
}

/// A routable stanza: an element plus its parsed addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stanza {
    el: Element,
    kind: StanzaKind,
    to: Option<Jid>,
    from: Option<Jid>,
}

impl Stanza {
    pub fn kind(&self) -> StanzaKind {
        self.kind
    }

    pub fn to(&self) -> Option<&Jid> {
        self.to.as_ref()
    }

    pub fn from(&self) -> Option<&Jid> {
        self.from.as_ref()
    }

    pub fn id(&self) -> Option<&str> {
        self.el.attribute(ATTR_ID)
    }

    pub fn type_(&self) -> Option<&str> {
        self.el.attribute(ATTR_TYPE)
    }

    pub fn is_error(&self) -> bool {
        self.type_() == Some("error")
    }

    /// Whether this is an `iq` of type `get` or `set`.
    pub fn is_iq_request(&self) -> bool {
        self.kind == StanzaKind::Iq && matches!(self.type_(), Some("get") | Some("set"))
    }

    pub fn element(&self) -> &Element {
        &self.el
    }

    pub fn into_element(self) -> Element {
        self.el
    }

    /// Re-parse after attribute mutation.
    pub fn with_addressing(mut el: Element, from: &Jid, to: Option<&Jid>) -> Result<Stanza, StanzaError> {
        el.set_attribute(ATTR_FROM, from.to_string());
        if let Some(to) = to {
            el.set_attribute(ATTR_TO, to.to_string());
        }
        Stanza::try_from(el)
    }
}

impl TryFrom<Element> for Stanza {
    type Error = StanzaError;

    fn try_from(el: Element) -> Result<Self, Self::Error> {
        let kind = StanzaKind::from_name(el.name())
            .ok_or_else(|| StanzaError::NotStanza(el.name().to_owned()))?;
        let to = parse_address(&el, ATTR_TO)?;
        let from = parse_address(&el, ATTR_FROM)?;
        Ok(Stanza { el, kind, to, from })
    }
}

fn parse_address(el: &Element, attr: &'static str) -> Result<Option<Jid>, StanzaError> {
    match el.attribute(attr) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e: crate::jid::JidError| StanzaError::BadAddress {
                attr,
                reason: e.to_string(),
            }),
    }
}

/// Whether a broadcast presence marks the resource *available*.
///
/// Absence of a `type` attribute means available per RFC 6121; anything
/// else (unavailable, subscription traffic, errors) does not.
pub fn presence_is_available(presence: &Element) -> bool {
    matches!(presence.attribute(ATTR_TYPE), None | Some("available"))
}

/// The broadcast priority of a presence, defaulting to 0.
pub fn presence_priority(presence: &Element) -> i8 {
    presence
        .child("priority")
        .and_then(|p| p.text().trim().parse().ok())
        .unwrap_or(0)
}

// =============================================================================
// Stanza errors
// =============================================================================

/// RFC 6120 §8.3 defined conditions used by the routing core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaErrorCondition {
    ServiceUnavailable,
    ItemNotFound,
    InternalServerError,
    RemoteServerNotFound,
}

impl StanzaErrorCondition {
    pub fn name(&self) -> &'static str {
        match self {
            StanzaErrorCondition::ServiceUnavailable => "service-unavailable",
            StanzaErrorCondition::ItemNotFound => "item-not-found",
            StanzaErrorCondition::InternalServerError => "internal-server-error",
            StanzaErrorCondition::RemoteServerNotFound => "remote-server-not-found",
        }
    }

    /// The `error/@type` paired with the condition.
    pub fn error_type(&self) -> &'static str {
        match self {
            StanzaErrorCondition::ServiceUnavailable => "cancel",
            StanzaErrorCondition::ItemNotFound => "cancel",
            StanzaErrorCondition::InternalServerError => "wait",
            StanzaErrorCondition::RemoteServerNotFound => "cancel",
        }
    }
}

impl fmt::Display for StanzaErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const STANZAS_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-stanzas";

/// Build the error reply for a stanza: addressing swapped, original id
/// kept, `<error/>` appended.
pub fn error_reply(original: &Stanza, condition: StanzaErrorCondition) -> Option<Stanza> {
    // Never reply to an error with an error.
    if original.is_error() {
        return None;
    }
    let mut el = Element::builder(original.element().name());
    if let Some(from) = original.from() {
        el = el.attr(ATTR_TO, from.to_string());
    }
    if let Some(to) = original.to() {
        el = el.attr(ATTR_FROM, to.to_string());
    }
    if let Some(id) = original.id() {
        el = el.attr(ATTR_ID, id);
    }
    let el = el
        .attr(ATTR_TYPE, "error")
        .child(
            Element::builder("error")
                .attr(ATTR_TYPE, condition.error_type())
                .child(Element::builder(condition.name()).ns(STANZAS_NAMESPACE).build())
                .build(),
        )
        .build();
    Stanza::try_from(el).ok()
}

// =============================================================================
// Stream errors
// =============================================================================

/// RFC 6120 §4.9 stream error conditions used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamErrorCondition {
    ConnectionTimeout,
    PolicyViolation,
    Conflict,
    HostUnknown,
    InvalidXml,
    NotAuthorized,
    SystemShutdown,
    InternalServerError,
}

impl StreamErrorCondition {
    pub fn name(&self) -> &'static str {
        match self {
            StreamErrorCondition::ConnectionTimeout => "connection-timeout",
            StreamErrorCondition::PolicyViolation => "policy-violation",
            StreamErrorCondition::Conflict => "conflict",
            StreamErrorCondition::HostUnknown => "host-unknown",
            StreamErrorCondition::InvalidXml => "invalid-xml",
            StreamErrorCondition::NotAuthorized => "not-authorized",
            StreamErrorCondition::SystemShutdown => "system-shutdown",
            StreamErrorCondition::InternalServerError => "internal-server-error",
        }
    }

    pub fn from_name(name: &str) -> Option<StreamErrorCondition> {
        match name {
            "connection-timeout" => Some(StreamErrorCondition::ConnectionTimeout),
            "policy-violation" => Some(StreamErrorCondition::PolicyViolation),
            "conflict" => Some(StreamErrorCondition::Conflict),
            "host-unknown" => Some(StreamErrorCondition::HostUnknown),
            "invalid-xml" => Some(StreamErrorCondition::InvalidXml),
            "not-authorized" => Some(StreamErrorCondition::NotAuthorized),
            "system-shutdown" => Some(StreamErrorCondition::SystemShutdown),
            "internal-server-error" => Some(StreamErrorCondition::InternalServerError),
            _ => None,
        }
    }
}

impl fmt::Display for StreamErrorCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const STREAMS_NAMESPACE: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Build a `<stream:error/>` element for the given condition.
pub fn stream_error(condition: StreamErrorCondition) -> Element {
    Element::builder("stream:error")
        .child(Element::builder(condition.name()).ns(STREAMS_NAMESPACE).build())
        .build()
}
