//! Fragment parsing and serialization on top of `scraper`.
//!
//! Stored post bodies are HTML fragments, so everything here parses with
//! `Html::parse_fragment` and writes back only the children of the synthetic
//! `<html>` root.

use std::borrow::Cow;

use scraper::{ElementRef, Html, Node};

const VOID_ELEMENTS: [&str; 18] = [
    "area", "base", "basefont", "bgsound", "br", "col", "embed", "frame", "hr", "img", "input",
    "keygen", "link", "meta", "param", "source", "track", "wbr",
];

const RAW_TEXT_ELEMENTS: [&str; 8] = [
    "iframe",
    "noembed",
    "noframes",
    "noscript",
    "plaintext",
    "script",
    "style",
    "xmp",
];

/// Elements that carry content without children.
const EMBED_ELEMENTS: [&str; 9] = [
    "audio", "canvas", "iframe", "object", "svg", "td", "textarea", "th", "video",
];

#[derive(Debug, Clone, Default)]
pub struct FragmentWriter {
    pub skip_attribute: Option<String>,
    pub skip_element: Option<String>,
    pub prune_empty: bool,
}

impl FragmentWriter {
    pub fn verbatim() -> Self {
        Self::default()
    }

    pub fn render(&self, html: &Html) -> String {
        let mut out = String::new();
        self.write_children(html.root_element(), &mut out);
        out
    }

    fn write_children(&self, element: ElementRef<'_>, out: &mut String) {
        let raw_text = RAW_TEXT_ELEMENTS.contains(&element.value().name());
        for child in element.children() {
            match child.value() {
                Node::Text(text) => {
                    if raw_text {
                        out.push_str(text);
                    } else {
                        escape_text(text, out);
                    }
                }
                Node::Element(_) => {
                    if let Some(child_element) = ElementRef::wrap(child) {
                        self.write_element(child_element, out);
                    }
                }
                Node::Comment(comment) => {
                    out.push_str("<!--");
                    out.push_str(comment);
                    out.push_str("-->");
                }
                Node::Doctype(doctype) => {
                    out.push_str("<!DOCTYPE ");
                    out.push_str(doctype.name());
                    out.push('>');
                }
                _ => {}
            }
        }
    }

    fn write_element(&self, element: ElementRef<'_>, out: &mut String) {
        let name = element.value().name();
        if self
            .skip_element
            .as_deref()
            .is_some_and(|skip| skip.eq_ignore_ascii_case(name))
        {
            return;
        }
        if self.prune_empty && is_empty_element(element) {
            return;
        }

        out.push('<');
        out.push_str(name);
        // `attrs()` yields local names only; foreign content needs the prefix back.
        for (qualname, value) in element.value().attrs.iter() {
            let attribute = match &qualname.prefix {
                Some(prefix) => Cow::Owned(format!("{}:{}", &**prefix, &*qualname.local)),
                None => Cow::Borrowed(&*qualname.local),
            };
            if self
                .skip_attribute
                .as_deref()
                .is_some_and(|skip| skip.eq_ignore_ascii_case(&attribute))
            {
                continue;
            }
            out.push(' ');
            out.push_str(&attribute);
            out.push_str("=\"");
            escape_attribute(value, out);
            out.push('"');
        }
        out.push('>');

        if VOID_ELEMENTS.contains(&name) {
            return;
        }
        self.write_children(element, out);
        out.push_str("</");
        out.push_str(name);
        out.push('>');
    }
}

pub fn parse_fragment(text: &str) -> Html {
    Html::parse_fragment(text)
}

pub fn parse_errors(html: &Html) -> &[Cow<'static, str>] {
    &html.errors
}

pub fn has_attribute(html: &Html, attribute: &str) -> bool {
    elements(html).any(|element| {
        element
            .value()
            .attrs()
            .any(|(name, _)| name.eq_ignore_ascii_case(attribute))
    })
}

pub fn has_element(html: &Html, tag: &str) -> bool {
    elements(html).any(|element| element.value().name().eq_ignore_ascii_case(tag))
}

pub fn has_empty_element(html: &Html) -> bool {
    elements(html).any(is_empty_element)
}

fn elements(html: &Html) -> impl Iterator<Item = ElementRef<'_>> {
    html.root_element()
        .descendants()
        .skip(1)
        .filter_map(ElementRef::wrap)
}

fn is_empty_element(element: ElementRef<'_>) -> bool {
    let name = element.value().name();
    if VOID_ELEMENTS.contains(&name) || EMBED_ELEMENTS.contains(&name) {
        return false;
    }
    element.children().all(|child| match child.value() {
        Node::Text(text) => text.trim().is_empty(),
        Node::Comment(_) => true,
        Node::Element(_) => ElementRef::wrap(child).is_some_and(is_empty_element),
        _ => false,
    })
}

fn escape_text(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            other => out.push(other),
        }
    }
}

fn escape_attribute(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
}
