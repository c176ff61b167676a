//! XMPP data model: elements, stanzas, error vocabulary and the wire
//! parsing seam.
//!
//! Chorus deliberately does not ship an XML parser. The transport hands
//! raw bytes to an [`ElementParser`] supplied by the embedder (or the
//! test harness), which yields [`StreamEvent`]s; everything above that
//! seam works with the typed [`Element`] tree.

mod element;
mod stanza;

pub use element::{
    ATTR_FROM, ATTR_ID, ATTR_TO, ATTR_TYPE, ATTR_XMLNS, Element, ElementBuilder,
};
pub use stanza::{
    Stanza, StanzaError, StanzaErrorCondition, StanzaKind, StreamErrorCondition, error_reply,
    presence_is_available, presence_priority, stream_error,
};

use std::collections::BTreeMap;

/// One parsed unit from the inbound byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The opening `<stream:stream>` header, with its attributes.
    StreamOpen { attrs: BTreeMap<String, String> },
    /// A complete first-level element.
    Element(Element),
    /// The closing `</stream:stream>` tag.
    StreamClosed,
}

/// Incremental parser turning transport bytes into [`StreamEvent`]s.
///
/// Implementations keep whatever buffering they need between calls;
/// `feed` may yield zero or more events per chunk. A parse failure is
/// fatal for the stream and surfaces as `invalid-xml`.
pub trait ElementParser: Send + Sync {
    fn feed(&mut self, chunk: &[u8]) -> crate::error::Result<Vec<StreamEvent>>;
}
