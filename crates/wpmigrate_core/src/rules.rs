use log::{debug, warn};

use crate::error::{MigrateError, Result};
use crate::html::{self, FragmentWriter};

pub trait Rule {
    fn name(&self) -> &str;
    fn transform(&self, text: &str) -> Result<String>;
}

/// Ordered rules applied left to right to one field.
#[derive(Default)]
pub struct RuleChain {
    rules: Vec<Box<dyn Rule>>,
}

impl RuleChain {
    pub fn new(rules: Vec<Box<dyn Rule>>) -> Self {
        Self { rules }
    }

    pub fn push(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|rule| rule.name()).collect()
    }

    /// A rule that refuses its input is skipped; the text passes through unchanged.
    pub fn apply(&self, text: &str) -> String {
        let mut current = text.to_string();
        for rule in &self.rules {
            match rule.transform(&current) {
                Ok(next) => {
                    if next != current {
                        debug!("rule {} rewrote content", rule.name());
                    }
                    current = next;
                }
                Err(error) => {
                    warn!("rule {} skipped: {error}", rule.name());
                }
            }
        }
        current
    }
}

fn strict_check(rule: &str, parsed: &scraper::Html, strict: bool) -> Result<()> {
    if !strict {
        return Ok(());
    }
    let errors = html::parse_errors(parsed);
    match errors.first() {
        Some(first) => Err(MigrateError::malformed(
            rule,
            format!("{} parse error(s), first: {first}", errors.len()),
        )),
        None => Ok(()),
    }
}

#[derive(Debug, Clone)]
pub struct StripAttribute {
    name: String,
    label: String,
    strict: bool,
}

impl StripAttribute {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: format!("strip-attribute[{name}]"),
            name,
            strict: false,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

impl Rule for StripAttribute {
    fn name(&self) -> &str {
        &self.label
    }

    fn transform(&self, text: &str) -> Result<String> {
        let parsed = html::parse_fragment(text);
        strict_check(&self.label, &parsed, self.strict)?;
        if !html::has_attribute(&parsed, &self.name) {
            return Ok(text.to_string());
        }
        let writer = FragmentWriter {
            skip_attribute: Some(self.name.clone()),
            ..FragmentWriter::default()
        };
        Ok(writer.render(&parsed))
    }
}

/// Removes matching elements together with everything inside them.
#[derive(Debug, Clone)]
pub struct StripElement {
    tag: String,
    label: String,
    strict: bool,
}

impl StripElement {
    pub fn new(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self {
            label: format!("strip-element[{tag}]"),
            tag,
            strict: false,
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

impl Rule for StripElement {
    fn name(&self) -> &str {
        &self.label
    }

    fn transform(&self, text: &str) -> Result<String> {
        let parsed = html::parse_fragment(text);
        strict_check(&self.label, &parsed, self.strict)?;
        if !html::has_element(&parsed, &self.tag) {
            return Ok(text.to_string());
        }
        let writer = FragmentWriter {
            skip_element: Some(self.tag.clone()),
            ..FragmentWriter::default()
        };
        Ok(writer.render(&parsed))
    }
}

#[derive(Debug, Clone)]
pub struct CharacterSubstitution {
    table: Vec<(String, String)>,
}

impl CharacterSubstitution {
    pub fn new(table: Vec<(String, String)>) -> Self {
        let table = table
            .into_iter()
            .filter(|(pattern, _)| !pattern.is_empty())
            .collect();
        Self { table }
    }

    pub fn smart_quotes() -> Self {
        let pairs: [(&str, &str); 29] = [
            ("\u{2018}", "'"),
            ("\u{2019}", "'"),
            ("&#8216;", "'"),
            ("&#8217;", "'"),
            ("&lsquo;", "'"),
            ("&rsquo;", "'"),
            ("\u{91}", "'"),
            ("\u{92}", "'"),
            ("\u{201c}", "\""),
            ("\u{201d}", "\""),
            ("&#8220;", "\""),
            ("&#8221;", "\""),
            ("&ldquo;", "\""),
            ("&rdquo;", "\""),
            ("\u{93}", "\""),
            ("\u{94}", "\""),
            ("\u{2013}", "-"),
            ("\u{2014}", "-"),
            ("&#8211;", "-"),
            ("&#8212;", "-"),
            ("&ndash;", "-"),
            ("&mdash;", "-"),
            ("\u{97}", "-"),
            ("\u{2026}", "..."),
            ("&#8230;", "..."),
            ("&hellip;", "..."),
            ("&#169;", "\u{a9}"),
            ("&#174;", "\u{ae}"),
            ("&#153;", "\u{2122}"),
        ];
        Self::new(
            pairs
                .iter()
                .map(|(pattern, replacement)| (pattern.to_string(), replacement.to_string()))
                .collect(),
        )
    }

    pub fn table(&self) -> &[(String, String)] {
        &self.table
    }
}

impl Rule for CharacterSubstitution {
    fn name(&self) -> &str {
        "character-substitution"
    }

    fn transform(&self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        let mut state = MarkupState::Text;
        'scan: while let Some(ch) = rest.chars().next() {
            for (pattern, replacement) in &self.table {
                if let Some(tail) = rest.strip_prefix(pattern.as_str()) {
                    if state == MarkupState::Text {
                        out.push_str(replacement);
                    } else {
                        escape_quotes(replacement, &mut out);
                    }
                    rest = tail;
                    continue 'scan;
                }
            }
            rest = &rest[ch.len_utf8()..];
            state = state.advance(ch, rest);
            out.push(ch);
        }
        Ok(out)
    }
}

/// Where the substitution scan sits relative to tag markup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkupState {
    Text,
    Tag,
    Quoted(char),
}

impl MarkupState {
    fn advance(self, ch: char, rest: &str) -> Self {
        match (self, ch) {
            (Self::Text, '<') => {
                let opens_tag = rest
                    .chars()
                    .next()
                    .is_some_and(|next| next.is_ascii_alphabetic() || next == '/');
                if opens_tag { Self::Tag } else { Self::Text }
            }
            (Self::Tag, '"' | '\'') => Self::Quoted(ch),
            (Self::Tag, '>') => Self::Text,
            (Self::Quoted(quote), ch) if ch == quote => Self::Tag,
            (state, _) => state,
        }
    }
}

/// Inside a tag a bare quote would end the attribute value.
fn escape_quotes(value: &str, out: &mut String) {
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
}

/// Reparses and reserializes, which closes any unclosed tags.
#[derive(Debug, Clone, Copy, Default)]
pub struct RepairMarkup;

impl Rule for RepairMarkup {
    fn name(&self) -> &str {
        "repair-markup"
    }

    fn transform(&self, text: &str) -> Result<String> {
        let parsed = html::parse_fragment(text);
        Ok(FragmentWriter::verbatim().render(&parsed))
    }
}

#[derive(Debug, Clone, Default)]
pub struct PruneEmptyElements {
    strict: bool,
}

impl PruneEmptyElements {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

impl Rule for PruneEmptyElements {
    fn name(&self) -> &str {
        "prune-empty"
    }

    fn transform(&self, text: &str) -> Result<String> {
        let parsed = html::parse_fragment(text);
        strict_check(self.name(), &parsed, self.strict)?;
        if !html::has_empty_element(&parsed) {
            return Ok(text.to_string());
        }
        let writer = FragmentWriter {
            prune_empty: true,
            ..FragmentWriter::default()
        };
        Ok(writer.render(&parsed))
    }
}
