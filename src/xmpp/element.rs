//! Generic XML element model.
//!
//! Chorus routes and queues *elements*; it does not parse XML off the
//! wire itself (that is the embedder's [`ElementParser`] seam). This
//! module provides the typed tree the rest of the crate works with,
//! plus a builder and XML serialization for outbound writes.
//!
//! [`ElementParser`]: crate::xmpp::ElementParser

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known attribute names.
pub const ATTR_TO: &str = "to";
pub const ATTR_FROM: &str = "from";
pub const ATTR_ID: &str = "id";
pub const ATTR_TYPE: &str = "type";
pub const ATTR_XMLNS: &str = "xmlns";

/// A single XML element: name, attributes, children and character data.
///
/// Attributes are kept sorted so serialization is deterministic, which
/// keeps cluster RPC frames and test assertions stable.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Element {
    name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<Element>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    text: String,
}

impl Element {
    /// Start building an element with the given name.
    pub fn builder(name: impl Into<String>) -> ElementBuilder {
        ElementBuilder {
            el: Element {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(name.into(), value.into());
    }

    pub fn remove_attribute(&mut self, name: &str) {
        self.attrs.remove(name);
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn namespace(&self) -> Option<&str> {
        self.attribute(ATTR_XMLNS)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn children(&self) -> &[Element] {
        &self.children
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    /// First child matching both name and `xmlns`.
    pub fn child_ns(&self, name: &str, ns: &str) -> Option<&Element> {
        self.children
            .iter()
            .find(|c| c.name == name && c.namespace() == Some(ns))
    }

    pub fn add_child(&mut self, child: Element) {
        self.children.push(child);
    }

    /// Serialized length in bytes of the XML form.
    pub fn serialized_len(&self) -> usize {
        self.to_string().len()
    }
}

/// Builder for [`Element`].
#[derive(Debug, Clone)]
pub struct ElementBuilder {
    el: Element,
}

impl ElementBuilder {
    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.el.attrs.insert(name.into(), value.into());
        self
    }

    pub fn ns(self, xmlns: impl Into<String>) -> Self {
        self.attr(ATTR_XMLNS, xmlns)
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.el.text = text.into();
        self
    }

    pub fn child(mut self, child: Element) -> Self {
        self.el.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.el.children.extend(children);
        self
    }

    pub fn build(self) -> Element {
        self.el
    }
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}", self.name)?;
        for (k, v) in &self.attrs {
            write!(f, " {}='{}'", k, escape_attr(v))?;
        }
        if self.children.is_empty() && self.text.is_empty() {
            return write!(f, "/>");
        }
        write!(f, ">")?;
        if !self.text.is_empty() {
            write!(f, "{}", escape_text(&self.text))?;
        }
        for child in &self.children {
            write!(f, "{child}")?;
        }
        write!(f, "</{}>", self.name)
    }
}

fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn escape_attr(s: &str) -> String {
    escape_text(s).replace('\'', "&apos;").replace('"', "&quot;")
}
