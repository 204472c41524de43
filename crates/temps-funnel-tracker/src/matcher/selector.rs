//! CSS selector subset used by `event` steps
//!
//! Supported: type selectors, `*`, `#id`, `.class`, `[attr]`,
//! `[attr=value]`, compound selectors, descendant and child combinators, and
//! comma-separated lists.

use crate::error::{TrackerError, TrackerResult};
use crate::interactions::Element;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttributeTest {
    Exists,
    Equals(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    ids: Vec<String>,
    classes: Vec<String>,
    attributes: Vec<(String, AttributeTest)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Complex {
    compounds: Vec<Compound>,
    // combinators[i] joins compounds[i] and compounds[i + 1]
    combinators: Vec<Combinator>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    alternatives: Vec<Complex>,
}

impl Selector {
    pub fn parse(input: &str) -> TrackerResult<Self> {
        Parser::new(input).parse_list()
    }

    /// Whether `element` itself matches
    pub fn matches(&self, element: &Element) -> bool {
        self.alternatives
            .iter()
            .any(|complex| complex.matches_at(complex.compounds.len() - 1, element))
    }

    /// Nearest element, starting at `element` and walking up, that matches
    pub fn closest<'a>(&self, element: &'a Element) -> Option<&'a Element> {
        element.ancestors_inclusive().find(|el| self.matches(el))
    }
}

impl Complex {
    fn matches_at(&self, index: usize, element: &Element) -> bool {
        if !self.compounds[index].matches(element) {
            return false;
        }
        if index == 0 {
            return true;
        }
        match self.combinators[index - 1] {
            Combinator::Child => element
                .parent()
                .map(|parent| self.matches_at(index - 1, parent))
                .unwrap_or(false),
            Combinator::Descendant => element
                .ancestors_inclusive()
                .skip(1)
                .any(|ancestor| self.matches_at(index - 1, ancestor)),
        }
    }
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none()
            && self.ids.is_empty()
            && self.classes.is_empty()
            && self.attributes.is_empty()
    }

    fn matches(&self, element: &Element) -> bool {
        if let Some(tag) = &self.tag {
            if tag != "*" && !tag.eq_ignore_ascii_case(&element.tag) {
                return false;
            }
        }
        if !self
            .ids
            .iter()
            .all(|id| element.id.as_deref() == Some(id.as_str()))
        {
            return false;
        }
        if !self.classes.iter().all(|class| element.has_class(class)) {
            return false;
        }
        self.attributes.iter().all(|(name, test)| {
            match (element.attribute(name), test) {
                (Some(_), AttributeTest::Exists) => true,
                (Some(actual), AttributeTest::Equals(expected)) => actual == *expected,
                (None, _) => false,
            }
        })
    }
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, reason: impl Into<String>) -> TrackerError {
        TrackerError::Selector {
            selector: self.source.to_string(),
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while self.peek().map(char::is_whitespace).unwrap_or(false) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn parse_list(&mut self) -> TrackerResult<Selector> {
        let mut alternatives = Vec::new();
        loop {
            self.skip_whitespace();
            alternatives.push(self.parse_complex()?);
            self.skip_whitespace();
            match self.bump() {
                None => break,
                Some(',') => continue,
                Some(c) => return Err(self.error(format!("unexpected '{}'", c))),
            }
        }
        Ok(Selector { alternatives })
    }

    fn parse_complex(&mut self) -> TrackerResult<Complex> {
        let mut compounds = vec![self.parse_compound()?];
        let mut combinators = Vec::new();

        loop {
            let had_space = self.skip_whitespace();
            let combinator = match self.peek() {
                Some('>') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    Combinator::Child
                }
                Some(',') | None => break,
                Some(_) if had_space => Combinator::Descendant,
                Some(c) => return Err(self.error(format!("unexpected '{}'", c))),
            };
            combinators.push(combinator);
            compounds.push(self.parse_compound()?);
        }

        Ok(Complex {
            compounds,
            combinators,
        })
    }

    fn parse_compound(&mut self) -> TrackerResult<Compound> {
        let mut compound = Compound::default();

        match self.peek() {
            Some('*') => {
                self.pos += 1;
                compound.tag = Some("*".to_string());
            }
            Some(c) if is_ident_char(c) => {
                compound.tag = Some(self.parse_ident()?);
            }
            _ => {}
        }

        loop {
            match self.peek() {
                Some('#') => {
                    self.pos += 1;
                    compound.ids.push(self.parse_ident()?);
                }
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.parse_ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attributes.push(self.parse_attribute()?);
                }
                _ => break,
            }
        }

        if compound.is_empty() {
            return Err(match self.peek() {
                Some(c) => self.error(format!("unexpected '{}'", c)),
                None => self.error("expected a selector"),
            });
        }
        Ok(compound)
    }

    fn parse_attribute(&mut self) -> TrackerResult<(String, AttributeTest)> {
        self.skip_whitespace();
        let name = self.parse_ident()?;
        self.skip_whitespace();
        match self.bump() {
            Some(']') => Ok((name, AttributeTest::Exists)),
            Some('=') => {
                self.skip_whitespace();
                let value = match self.peek() {
                    Some(quote @ ('"' | '\'')) => {
                        self.pos += 1;
                        self.parse_quoted(quote)?
                    }
                    _ => self.parse_ident()?,
                };
                self.skip_whitespace();
                match self.bump() {
                    Some(']') => Ok((name, AttributeTest::Equals(value))),
                    _ => Err(self.error("unterminated attribute selector")),
                }
            }
            _ => Err(self.error("unterminated attribute selector")),
        }
    }

    fn parse_quoted(&mut self, quote: char) -> TrackerResult<String> {
        let mut value = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => return Ok(value),
                Some('\\') => match self.bump() {
                    Some(c) => value.push(c),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => value.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn parse_ident(&mut self) -> TrackerResult<String> {
        let start = self.pos;
        while self.peek().map(is_ident_char).unwrap_or(false) {
            self.pos += 1;
        }
        if self.pos == start {
            return Err(match self.peek() {
                Some(c) => self.error(format!("expected identifier, found '{}'", c)),
                None => self.error("expected identifier"),
            });
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn button_in_form() -> Element {
        let body = Element::new("body");
        let form = Element::new("form").with_id("checkout").child_of(body);
        let div = Element::new("div").with_class("actions").child_of(form);
        Element::new("button")
            .with_class("btn")
            .with_class("btn-primary")
            .with_attribute("data-action", "buy")
            .child_of(div)
    }

    #[test]
    fn test_simple_selectors() {
        let button = button_in_form();
        assert!(Selector::parse("button").unwrap().matches(&button));
        assert!(Selector::parse("BUTTON").unwrap().matches(&button));
        assert!(Selector::parse("*").unwrap().matches(&button));
        assert!(Selector::parse(".btn.btn-primary").unwrap().matches(&button));
        assert!(Selector::parse("[data-action]").unwrap().matches(&button));
        assert!(Selector::parse("[data-action=buy]").unwrap().matches(&button));
        assert!(Selector::parse("button[data-action='buy']")
            .unwrap()
            .matches(&button));
        assert!(!Selector::parse("[data-action=\"sell\"]")
            .unwrap()
            .matches(&button));
        assert!(!Selector::parse("a.btn").unwrap().matches(&button));
    }

    #[test]
    fn test_combinators() {
        let button = button_in_form();
        assert!(Selector::parse("form button").unwrap().matches(&button));
        assert!(Selector::parse("#checkout .actions > .btn")
            .unwrap()
            .matches(&button));
        assert!(Selector::parse("div>button").unwrap().matches(&button));
        assert!(!Selector::parse("form > button").unwrap().matches(&button));
        assert!(!Selector::parse("nav button").unwrap().matches(&button));
    }

    #[test]
    fn test_selector_list() {
        let button = button_in_form();
        let selector = Selector::parse("a.nav, .btn-primary").unwrap();
        assert!(selector.matches(&button));
    }

    #[test]
    fn test_closest_walks_ancestors() {
        let button = button_in_form();
        let selector = Selector::parse("#checkout").unwrap();
        let found = selector.closest(&button).unwrap();
        assert_eq!(found.tag, "form");
        assert!(Selector::parse("#missing").unwrap().closest(&button).is_none());
    }

    #[test]
    fn test_malformed_selectors() {
        for input in ["", "div[", "[=x]", ".", "div >", "a,,b", "#id)", "[a='x]"] {
            assert!(
                matches!(Selector::parse(input), Err(TrackerError::Selector { .. })),
                "expected '{}' to be rejected",
                input
            );
        }
    }
}
