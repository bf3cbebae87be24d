//! A small owned XML tree.
//!
//! Documents are assembled as [`Element`] trees and written out in
//! Canonical XML 1.0 form (no declaration, attributes sorted, empty elements
//! expanded, redundant namespace declarations dropped). Writing the canonical
//! form directly means the bytes that get signed are exactly the bytes that
//! get transmitted. Replies are read back into the same tree with
//! `quick_xml`'s pull parser.

use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error(transparent)]
    Parse(#[from] quick_xml::Error),
    #[error("Document has no root element")]
    NoRoot,
    #[error("Element <{0}> is never closed")]
    Unclosed(String),
    #[error("Unexpected content outside the root element")]
    TrailingContent,
    #[error("Invalid UTF-8 in {0}")]
    Utf8(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            children: Vec::new(),
        }
    }

    /// `<name>text</name>`
    pub fn leaf(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(name).with_text(text)
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.push_child(child);
        self
    }

    pub fn with_children(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        self.children
            .extend(children.into_iter().map(Node::Element));
        self
    }

    pub fn with_optional_child(self, child: Option<Element>) -> Self {
        match child {
            Some(child) => self.with_child(child),
            None => self,
        }
    }

    pub fn push_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name without its namespace prefix.
    pub fn local_name(&self) -> &str {
        local(&self.name)
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn child_elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    /// First direct child with the given local name.
    pub fn child(&self, local_name: &str) -> Option<&Element> {
        self.child_elements()
            .find(|child| child.local_name() == local_name)
    }

    pub fn children_named<'a>(
        &'a self,
        local_name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.child_elements()
            .filter(move |child| child.local_name() == local_name)
    }

    /// Depth-first search of this element and everything below it.
    pub fn find(&self, local_name: &str) -> Option<&Element> {
        if self.local_name() == local_name {
            return Some(self);
        }
        self.child_elements()
            .find_map(|child| child.find(local_name))
    }

    /// Concatenated text of this element and its descendants.
    pub fn text(&self) -> String {
        let mut text = String::new();
        self.collect_text(&mut text);
        text
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Element(element) => element.collect_text(out),
            }
        }
    }

    pub fn child_text(&self, local_name: &str) -> Option<String> {
        self.child(local_name).map(Element::text)
    }

    /// Copy of the subtree with namespace prefixes removed from element
    /// names. Replies occasionally prefix the payload elements, which the
    /// typed decoders do not expect.
    pub fn without_prefixes(&self) -> Element {
        Element {
            name: self.local_name().to_string(),
            attributes: self.attributes.clone(),
            children: self
                .children
                .iter()
                .map(|node| match node {
                    Node::Element(element) => Node::Element(element.without_prefixes()),
                    Node::Text(text) => Node::Text(text.clone()),
                })
                .collect(),
        }
    }

    /// Canonical form of this element as a standalone document.
    pub fn to_xml(&self) -> String {
        self.to_canonical(None)
    }

    /// Canonical form of this element as a subset of a larger document, with
    /// `inherited_namespace` being the default namespace in scope at its
    /// parent. The namespace is rendered on the element even when it does not
    /// declare it itself.
    pub fn to_canonical(&self, inherited_namespace: Option<&str>) -> String {
        let mut out = String::new();
        write_canonical(self, &mut out, inherited_namespace.unwrap_or(""), true);
        out
    }

    /// Parses a document into a tree. Comments, processing instructions and
    /// the XML declaration are dropped; CDATA becomes plain text.
    pub fn parse(xml: &str) -> Result<Element, XmlError> {
        let mut reader = Reader::from_str(xml);
        let mut stack: Vec<Element> = Vec::new();
        let mut root = None;

        loop {
            match reader.read_event()? {
                Event::Start(start) => stack.push(element_from_start(&start)?),
                Event::Empty(start) => {
                    let element = element_from_start(&start)?;
                    attach(&mut stack, &mut root, element)?;
                }
                Event::End(_) => {
                    // Mismatched end tags are reported by the reader itself.
                    if let Some(element) = stack.pop() {
                        attach(&mut stack, &mut root, element)?;
                    }
                }
                Event::Text(text) => match stack.last_mut() {
                    Some(parent) => parent
                        .children
                        .push(Node::Text(text.unescape()?.into_owned())),
                    None if text.iter().all(u8::is_ascii_whitespace) => {}
                    None => return Err(XmlError::TrailingContent),
                },
                Event::CData(data) => {
                    let text = String::from_utf8(data.into_inner().into_owned())
                        .map_err(|_| XmlError::Utf8("CDATA section"))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Text(text)),
                        None => return Err(XmlError::TrailingContent),
                    }
                }
                Event::Eof => break,
                Event::Decl(_) | Event::PI(_) | Event::Comment(_) | Event::DocType(_) => {}
            }
        }

        if let Some(open) = stack.pop() {
            return Err(XmlError::Unclosed(open.name));
        }
        root.ok_or(XmlError::NoRoot)
    }
}

fn local(name: &str) -> &str {
    name.rsplit_once(':').map_or(name, |(_, local)| local)
}

fn element_from_start(start: &BytesStart<'_>) -> Result<Element, XmlError> {
    let name = std::str::from_utf8(start.name().as_ref())
        .map_err(|_| XmlError::Utf8("element name"))?
        .to_string();

    let mut element = Element::new(name);
    for attribute in start.attributes() {
        let attribute = attribute.map_err(quick_xml::Error::from)?;
        let key = std::str::from_utf8(attribute.key.as_ref())
            .map_err(|_| XmlError::Utf8("attribute name"))?
            .to_string();
        let value = attribute.unescape_value()?.into_owned();
        element.attributes.push((key, value));
    }
    Ok(element)
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => parent.push_child(element),
        None if root.is_none() => *root = Some(element),
        None => return Err(XmlError::TrailingContent),
    }
    Ok(())
}

fn write_canonical(element: &Element, out: &mut String, in_scope: &str, apex: bool) {
    out.push('<');
    out.push_str(&element.name);

    let declared = element.attribute("xmlns");
    let own_namespace = declared.unwrap_or(in_scope);
    let render_default = if apex {
        !own_namespace.is_empty()
    } else {
        declared.is_some() && own_namespace != in_scope
    };
    if render_default {
        push_attribute(out, "xmlns", own_namespace);
    }

    let mut prefixed: Vec<&(String, String)> = element
        .attributes
        .iter()
        .filter(|(key, _)| key.starts_with("xmlns:"))
        .collect();
    prefixed.sort_by(|a, b| a.0.cmp(&b.0));

    let mut plain: Vec<&(String, String)> = element
        .attributes
        .iter()
        .filter(|(key, _)| key != "xmlns" && !key.starts_with("xmlns:"))
        .collect();
    plain.sort_by(|a, b| a.0.cmp(&b.0));

    for (key, value) in prefixed.into_iter().chain(plain) {
        push_attribute(out, key, value);
    }
    out.push('>');

    for node in &element.children {
        match node {
            Node::Text(text) => escape_text(out, text),
            Node::Element(child) => write_canonical(child, out, own_namespace, false),
        }
    }

    out.push_str("</");
    out.push_str(&element.name);
    out.push('>');
}

fn push_attribute(out: &mut String, key: &str, value: &str) {
    out.push(' ');
    out.push_str(key);
    out.push_str("=\"");
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn escape_text(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            c => out.push(c),
        }
    }
}
