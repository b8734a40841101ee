use crate::error::{Error, Result};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::OnceLock;

/// An element node: tag name, ordered attributes, child nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub tag: String,
    pub attrs: IndexMap<String, String>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Element { tag: tag.into(), attrs: IndexMap::new(), children: Vec::new() }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(name.into(), value.into());
    }

    /// Removes an attribute, preserving the order of the remaining ones.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        self.attrs.shift_remove(name)
    }
}

/// One node of a rendered fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// An ordered list of sibling nodes produced by a render, the unit the
/// hookup attacher walks. The tree is owned by this crate; how markup turns
/// into one of these is the [`FragmentBuilder`] collaborator's business.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub nodes: Vec<Node>,
}

impl Fragment {
    pub fn new() -> Self {
        Fragment::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Serializes the fragment back to markup.
    pub fn to_markup(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            write_node(&mut out, node);
        }
        out
    }
}

fn write_node(out: &mut String, node: &Node) {
    match node {
        Node::Text(text) => out.push_str(text),
        Node::Element(el) => {
            let _ = write!(out, "<{}", el.tag);
            for (name, value) in &el.attrs {
                let _ = write!(out, " {}=\"{}\"", name, value);
            }
            out.push('>');
            for child in &el.children {
                write_node(out, child);
            }
            let _ = write!(out, "</{}>", el.tag);
        }
    }
}

/// Collaborator turning engine-produced markup into a [`Fragment`].
pub trait FragmentBuilder {
    fn build(&self, markup: &str) -> Result<Fragment>;
}

/// Default builder: parses the well-formed markup subset template engines
/// emit. Tags with single- or double-quoted (or bare) attribute values,
/// self-closing and void elements, and raw text. Not a general HTML parser.
#[derive(Debug, Default)]
pub struct MarkupBuilder;

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta",
    "param", "source", "track", "wbr",
];

fn attr_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"([A-Za-z_][\w:.-]*)(?:\s*=\s*(?:'([^']*)'|"([^"]*)"|([^\s'">]+)))?"#)
            .unwrap()
    })
}

impl FragmentBuilder for MarkupBuilder {
    fn build(&self, markup: &str) -> Result<Fragment> {
        let mut root = Vec::new();
        let mut stack: Vec<Element> = Vec::new();
        let mut rest = markup;

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix("</") {
                let end = after.find('>').ok_or_else(|| {
                    Error::MarkupError(format!("unterminated closing tag near '{}'", snippet(rest)))
                })?;
                let name = after[..end].trim();
                let element = stack.pop().ok_or_else(|| {
                    Error::MarkupError(format!("stray closing tag '</{}>'", name))
                })?;
                if element.tag != name {
                    return Err(Error::MarkupError(format!(
                        "mismatched closing tag: expected '</{}>', found '</{}>'",
                        element.tag, name
                    )));
                }
                append(&mut stack, &mut root, Node::Element(element));
                rest = &after[end + 1..];
            } else if rest.starts_with('<')
                && rest[1..].starts_with(|c: char| c.is_ascii_alphabetic())
            {
                let end = rest.find('>').ok_or_else(|| {
                    Error::MarkupError(format!("unterminated tag near '{}'", snippet(rest)))
                })?;
                let header = rest[1..end].trim_end();
                let self_closing = header.ends_with('/');
                let header = header.trim_end_matches('/').trim_end();
                let (name, attr_src) =
                    header.split_once(char::is_whitespace).unwrap_or((header, ""));
                let mut element = Element::new(name);
                for caps in attr_regex().captures_iter(attr_src) {
                    let attr = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                    let value = caps
                        .get(2)
                        .or_else(|| caps.get(3))
                        .or_else(|| caps.get(4))
                        .map(|m| m.as_str())
                        .unwrap_or_default();
                    element.set_attr(attr, value);
                }
                if self_closing || VOID_ELEMENTS.contains(&element.tag.as_str()) {
                    append(&mut stack, &mut root, Node::Element(element));
                } else {
                    stack.push(element);
                }
                rest = &rest[end + 1..];
            } else {
                let end = rest[1..].find('<').map(|i| i + 1).unwrap_or(rest.len());
                let text = &rest[..end];
                if !text.is_empty() {
                    append(&mut stack, &mut root, Node::Text(text.to_string()));
                }
                rest = &rest[end..];
            }
        }

        if let Some(open) = stack.pop() {
            return Err(Error::MarkupError(format!("unclosed element '<{}>'", open.tag)));
        }
        Ok(Fragment { nodes: root })
    }
}

fn append(stack: &mut [Element], root: &mut Vec<Node>, node: Node) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => root.push(node),
    }
}

fn snippet(src: &str) -> &str {
    &src[..src.len().min(24)]
}
