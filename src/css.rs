//! CSS Scoping Module for the nlib rendering engine
//!
//! Rewrites author selectors so they only match inside one component:
//! - every compound gets `[nlib-cid="<tag>"]` unless it is already scoped
//! - `:host` becomes `[nlib-hid="<tag>"]`, `:host(sel)` keeps `sel`
//! - `:deep` is dropped and stops scoping for everything right of it
//! - `:host-context(sel)` is replaced by `sel` followed by the host marker
//!
//! Whole sheets go through [`scope_stylesheet`], which parses the sheet with
//! lightningcss and rewrites the selectors of its style rules.

use lightningcss::rules::{CssRule, CssRuleList};
use lightningcss::selector::SelectorList;
use lightningcss::stylesheet::{ParserOptions, PrinterOptions, StyleSheet as CssSheet};
use lightningcss::traits::{ParseWithOptions, ToCss};

use crate::error::{EngineError, Result, ERR_CSS_HOST_CONTEXT, ERR_CSS_SELECTOR, ERR_CSS_STYLESHEET};

/// Written onto every non-shadow element rendered by a component template.
pub const CSS_COMPONENT_ID_ATTR: &str = "nlib-cid";
/// Written onto the component host element.
pub const CSS_HOST_ID_ATTR: &str = "nlib-hid";

/// A compiled, scoped style sheet. Shadow components adopt it; the others
/// inject it into the document head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleSheet {
    pub css: String,
}

impl StyleSheet {
    pub fn new(css: impl Into<String>) -> Self {
        Self { css: css.into() }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SELECTOR MODEL
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq)]
enum Simple {
    /// Type or universal selector.
    Type(String),
    Class(String),
    Id(String),
    /// Raw text including the brackets.
    Attribute(String),
    PseudoClass { name: String, argument: Option<String> },
    PseudoElement(String),
}

impl Simple {
    fn is_pseudo(&self) -> bool {
        matches!(self, Simple::PseudoClass { .. } | Simple::PseudoElement(_))
    }

    fn is_pseudo_class(&self, pseudo: &str) -> bool {
        matches!(self, Simple::PseudoClass { name, .. } if name == pseudo)
    }

    fn render(&self, out: &mut String) {
        match self {
            Simple::Type(name) => out.push_str(name),
            Simple::Class(name) => {
                out.push('.');
                out.push_str(name);
            }
            Simple::Id(name) => {
                out.push('#');
                out.push_str(name);
            }
            Simple::Attribute(raw) => out.push_str(raw),
            Simple::PseudoClass { name, argument } => {
                out.push(':');
                out.push_str(name);
                if let Some(argument) = argument {
                    out.push('(');
                    out.push_str(argument);
                    out.push(')');
                }
            }
            Simple::PseudoElement(raw) => {
                out.push_str("::");
                out.push_str(raw);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
    NextSibling,
    SubsequentSibling,
}

impl Combinator {
    fn as_str(self) -> &'static str {
        match self {
            Combinator::Descendant => " ",
            Combinator::Child => " > ",
            Combinator::NextSibling => " + ",
            Combinator::SubsequentSibling => " ~ ",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Compound {
    /// How this compound attaches to the previous one; ignored for the first.
    combinator: Combinator,
    items: Vec<Simple>,
}

type Complex = Vec<Compound>;

fn attribute_marker(name: &str, tag: &str) -> Simple {
    Simple::Attribute(format!("[{}=\"{}\"]", name, tag))
}

/// True for `[nlib-cid=tag]` / `[nlib-hid=tag]` in any quoting.
fn is_scoped(item: &Simple, tag: &str) -> bool {
    let Simple::Attribute(raw) = item else {
        return false;
    };
    let inner = raw.trim_start_matches('[').trim_end_matches(']');
    let Some((name, value)) = inner.split_once('=') else {
        return false;
    };
    let name = name.trim();
    let value = value.trim().trim_matches(|c| c == '"' || c == '\'');
    (name == CSS_COMPONENT_ID_ATTR || name == CSS_HOST_ID_ATTR) && value == tag
}

// ═══════════════════════════════════════════════════════════════════════════════
// PARSER
// ═══════════════════════════════════════════════════════════════════════════════

struct SelectorParser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_' || c == '\\' || !c.is_ascii()
}

impl<'a> SelectorParser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            pos: 0,
        }
    }

    fn error(&self, message: &str) -> EngineError {
        EngineError::css(
            ERR_CSS_SELECTOR,
            format!("{} at offset {} in selector '{}'", message, self.pos, self.source),
        )
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while self.peek().map_or(false, char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn ident(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '\\' {
                self.pos += 2;
                continue;
            }
            if !is_ident_char(c) {
                break;
            }
            self.pos += 1;
        }
        let end = self.pos.min(self.chars.len());
        if end == start {
            return Err(self.error("Expected identifier"));
        }
        Ok(self.chars[start..end].iter().collect())
    }

    /// Text up to the matching `close`, honoring nesting and quotes.
    fn balanced(&mut self, open: char, close: char) -> Result<String> {
        let start = self.pos;
        let mut depth = 1;
        let mut quote: Option<char> = None;
        while let Some(c) = self.peek() {
            self.pos += 1;
            match quote {
                Some(q) if c == q => quote = None,
                Some(_) if c == '\\' => self.pos += 1,
                Some(_) => {}
                None if c == '"' || c == '\'' => quote = Some(c),
                None if c == open => depth += 1,
                None if c == close => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(self.chars[start..self.pos - 1].iter().collect());
                    }
                }
                None => {}
            }
        }
        Err(self.error(&format!("Unclosed '{}'", open)))
    }

    fn compound(&mut self, combinator: Combinator) -> Result<Compound> {
        let mut items = vec![];
        while let Some(c) = self.peek() {
            match c {
                '*' => {
                    self.pos += 1;
                    items.push(Simple::Type("*".to_string()));
                }
                '.' => {
                    self.pos += 1;
                    items.push(Simple::Class(self.ident()?));
                }
                '#' => {
                    self.pos += 1;
                    items.push(Simple::Id(self.ident()?));
                }
                '[' => {
                    self.pos += 1;
                    let inner = self.balanced('[', ']')?;
                    items.push(Simple::Attribute(format!("[{}]", inner)));
                }
                ':' => {
                    self.pos += 1;
                    if self.peek() == Some(':') {
                        self.pos += 1;
                        let mut name = self.ident()?;
                        if self.peek() == Some('(') {
                            self.pos += 1;
                            name = format!("{}({})", name, self.balanced('(', ')')?);
                        }
                        items.push(Simple::PseudoElement(name));
                    } else {
                        let name = self.ident()?.to_ascii_lowercase();
                        let argument = if self.peek() == Some('(') {
                            self.pos += 1;
                            Some(self.balanced('(', ')')?.trim().to_string())
                        } else {
                            None
                        };
                        items.push(Simple::PseudoClass { name, argument });
                    }
                }
                c if is_ident_char(c) && items.is_empty() => {
                    items.push(Simple::Type(self.ident()?));
                }
                _ => break,
            }
        }
        if items.is_empty() {
            return Err(self.error("Expected selector"));
        }
        Ok(Compound { combinator, items })
    }

    fn complex(&mut self) -> Result<Complex> {
        let mut compounds = vec![];
        self.skip_whitespace();
        let mut combinator = Combinator::Descendant;
        loop {
            compounds.push(self.compound(combinator)?);
            let had_space = self.skip_whitespace();
            combinator = match self.peek() {
                None | Some(',') | Some(')') => break,
                Some('>') => Combinator::Child,
                Some('+') => Combinator::NextSibling,
                Some('~') => Combinator::SubsequentSibling,
                Some(_) if had_space => Combinator::Descendant,
                Some(_) => return Err(self.error("Unexpected character")),
            };
            if combinator != Combinator::Descendant {
                self.pos += 1;
                self.skip_whitespace();
            }
        }
        Ok(compounds)
    }

    fn selector_list(&mut self) -> Result<Vec<Complex>> {
        let mut list = vec![self.complex()?];
        while self.peek() == Some(',') {
            self.pos += 1;
            list.push(self.complex()?);
        }
        if self.pos < self.chars.len() {
            return Err(self.error("Unexpected character"));
        }
        Ok(list)
    }
}

fn parse_selector_list(selector: &str) -> Result<Vec<Complex>> {
    SelectorParser::new(selector).selector_list()
}

fn render_complex(complex: &Complex) -> String {
    let mut out = String::new();
    for (i, compound) in complex.iter().enumerate() {
        if i > 0 {
            out.push_str(compound.combinator.as_str());
        }
        for item in &compound.items {
            item.render(&mut out);
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCOPING
// ═══════════════════════════════════════════════════════════════════════════════

/// Replaces `:host` / `:host(sel)` with the host marker. Qualifiers written
/// before `:host` in the same compound are dropped.
fn rewrite_host(compound: &mut Compound, tag: &str) {
    let Some(index) = compound.items.iter().position(|i| i.is_pseudo_class("host")) else {
        return;
    };
    let mut items = vec![attribute_marker(CSS_HOST_ID_ATTR, tag)];
    if let Simple::PseudoClass {
        argument: Some(argument),
        ..
    } = &compound.items[index]
    {
        if let Ok(inner) = SelectorParser::new(argument).compound(Combinator::Descendant) {
            items.extend(inner.items);
        }
    }
    items.extend(
        compound.items[index + 1..]
            .iter()
            .filter(|i| !i.is_pseudo_class("host"))
            .cloned(),
    );
    compound.items = items;
}

fn add_component_marker(compound: &mut Compound, tag: &str) {
    let index = compound
        .items
        .iter()
        .position(Simple::is_pseudo)
        .unwrap_or(compound.items.len());
    compound
        .items
        .insert(index, attribute_marker(CSS_COMPONENT_ID_ATTR, tag));
}

fn expand_host_context(compounds: Complex, tag: &str, original: &str) -> Result<Complex> {
    let mut out: Complex = vec![];
    for (i, compound) in compounds.iter().enumerate() {
        let Some(argument) = compound.items.iter().find_map(|item| match item {
            Simple::PseudoClass {
                name,
                argument: Some(argument),
            } if name == "host-context" => Some(argument.clone()),
            _ => None,
        }) else {
            out.push(compound.clone());
            continue;
        };
        if compound.items.len() > 1 {
            return Err(EngineError::css(
                ERR_CSS_HOST_CONTEXT,
                format!(":host-context() can't be combined with other css rules. Found: {}", original),
            ));
        }
        let mut inner = parse_selector_list(&argument)?;
        if inner.len() != 1 {
            return Err(EngineError::css(
                ERR_CSS_HOST_CONTEXT,
                format!(":host-context() currently only supports a single rule. Found: {}", original),
            ));
        }
        let mut replacement = inner.remove(0);
        if let Some(first) = replacement.first_mut() {
            first.combinator = compound.combinator;
        }
        out.extend(replacement);
        let next_scoped = compounds
            .get(i + 1)
            .map_or(false, |next| next.items.iter().any(|item| is_scoped(item, tag)));
        if !next_scoped {
            out.push(Compound {
                combinator: Combinator::Descendant,
                items: vec![attribute_marker(CSS_HOST_ID_ATTR, tag)],
            });
        }
    }
    Ok(out)
}

fn scope_complex(mut compounds: Complex, tag: &str, original: &str) -> Result<String> {
    if compounds
        .first()
        .and_then(|c| c.items.first())
        .map_or(false, |item| item.is_pseudo_class("deep"))
    {
        compounds.insert(
            0,
            Compound {
                combinator: Combinator::Descendant,
                items: vec![Simple::PseudoClass {
                    name: "host".to_string(),
                    argument: None,
                }],
            },
        );
    }

    for compound in compounds.iter_mut() {
        rewrite_host(compound, tag);
    }

    for compound in compounds.iter_mut() {
        let scoped = compound.items.iter().any(|item| is_scoped(item, tag));
        let host_context = compound.items.iter().any(|item| item.is_pseudo_class("host-context"));
        if compound.items.iter().any(|item| item.is_pseudo_class("deep")) {
            compound.items.retain(|item| !item.is_pseudo_class("deep"));
            break;
        }
        if !scoped && !host_context {
            add_component_marker(compound, tag);
        }
    }

    let compounds = expand_host_context(compounds, tag, original)?;
    let mut kept: Complex = compounds.into_iter().filter(|c| !c.items.is_empty()).collect();
    if let Some(first) = kept.first_mut() {
        first.combinator = Combinator::Descendant;
    }
    Ok(render_complex(&kept))
}

/// Scopes a selector list to the component `tag`.
pub fn scope_css_selector(selector: &str, tag: &str) -> Result<String> {
    let list = parse_selector_list(selector.trim()).map_err(|e| {
        tracing::debug!(selector, component = tag, "failed to parse selector");
        e
    })?;
    let scoped = list
        .into_iter()
        .map(|complex| scope_complex(complex, tag, selector))
        .collect::<Result<Vec<_>>>()?;
    Ok(scoped.join(", "))
}

// ═══════════════════════════════════════════════════════════════════════════════
// STYLE SHEETS
// ═══════════════════════════════════════════════════════════════════════════════

fn parse_sheet<'i>(css: &'i str) -> Result<CssSheet<'i>> {
    CssSheet::parse(css, ParserOptions::default()).map_err(|e| {
        EngineError::css(ERR_CSS_STYLESHEET, format!("CSS parse error: {}", e)).context(css.to_string())
    })
}

/// Grouping at-rules whose style rules are scoped. Keyframes and every other
/// at-rule are printed as written.
fn grouped_rules<'a, 'i>(rule: &'a CssRule<'i>) -> Option<&'a CssRuleList<'i>> {
    match rule {
        CssRule::Media(media) => Some(&media.rules),
        CssRule::Supports(supports) => Some(&supports.rules),
        CssRule::LayerBlock(layer) => Some(&layer.rules),
        CssRule::Container(container) => Some(&container.rules),
        _ => None,
    }
}

fn grouped_rules_mut<'a, 'i>(rule: &'a mut CssRule<'i>) -> Option<&'a mut CssRuleList<'i>> {
    match rule {
        CssRule::Media(media) => Some(&mut media.rules),
        CssRule::Supports(supports) => Some(&mut supports.rules),
        CssRule::LayerBlock(layer) => Some(&mut layer.rules),
        CssRule::Container(container) => Some(&mut container.rules),
        _ => None,
    }
}

/// Scoped selector text for every style rule, in document order. Nested
/// rules inside a style rule resolve `&` against the scoped parent.
fn collect_scoped(rules: &CssRuleList, tag: &str, out: &mut Vec<String>) -> Result<()> {
    for rule in &rules.0 {
        if let CssRule::Style(style) = rule {
            let selector = style
                .selectors
                .to_css_string(PrinterOptions::default())
                .map_err(|e| EngineError::css(ERR_CSS_STYLESHEET, format!("CSS print error: {}", e)))?;
            out.push(scope_css_selector(&selector, tag)?);
        } else if let Some(inner) = grouped_rules(rule) {
            collect_scoped(inner, tag, out)?;
        }
    }
    Ok(())
}

fn replace_selectors<'i>(rules: &mut CssRuleList<'i>, scoped: &mut std::slice::Iter<'i, String>) -> Result<()> {
    for rule in rules.0.iter_mut() {
        if let CssRule::Style(style) = rule {
            let Some(selector) = scoped.next() else { break };
            style.selectors = SelectorList::parse_string_with_options(selector, ParserOptions::default())
                .map_err(|e| {
                    EngineError::css(ERR_CSS_SELECTOR, format!("Scoped selector does not parse: {:?}", e))
                        .context(selector.clone())
                })?;
        } else if let Some(inner) = grouped_rules_mut(rule) {
            replace_selectors(inner, scoped)?;
        }
    }
    Ok(())
}

/// Scopes the selectors of every style rule in a whole style sheet and
/// prints it through lightningcss.
pub fn scope_stylesheet(css: &str, tag: &str) -> Result<String> {
    // Replacement selectors borrow their text, which has to outlive the sheet
    // they are written into.
    let scoped = {
        let sheet = parse_sheet(css)?;
        let mut scoped = vec![];
        collect_scoped(&sheet.rules, tag, &mut scoped)?;
        scoped
    };

    let mut sheet = parse_sheet(css)?;
    replace_selectors(&mut sheet.rules, &mut scoped.iter())?;
    let printed = sheet
        .to_css(PrinterOptions::default())
        .map_err(|e| EngineError::css(ERR_CSS_STYLESHEET, format!("CSS print error: {}", e)))?;
    Ok(printed.code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn scope(selector: &str) -> String {
        scope_css_selector(selector, "nl-x").unwrap()
    }

    #[test]
    fn test_host_inside_compound() {
        assert_eq!(scope(".btn:host .ok"), r#"[nlib-hid="nl-x"] .ok[nlib-cid="nl-x"]"#);
    }

    #[test]
    fn test_every_compound_is_scoped() {
        assert_eq!(
            scope("div > .a + p ~ #b"),
            r#"div[nlib-cid="nl-x"] > .a[nlib-cid="nl-x"] + p[nlib-cid="nl-x"] ~ #b[nlib-cid="nl-x"]"#
        );
        assert_eq!(
            scope("a:hover, li::before"),
            r#"a[nlib-cid="nl-x"]:hover, li[nlib-cid="nl-x"]::before"#
        );
        assert_eq!(scope(r#"input[type="text"]"#), r#"input[type="text"][nlib-cid="nl-x"]"#);
    }

    #[test]
    fn test_scoped_compounds_are_left_alone() {
        let once = scope(".a .b");
        assert_eq!(scope(&once), once);
    }

    #[test]
    fn test_host_forms() {
        assert_eq!(scope(":host"), r#"[nlib-hid="nl-x"]"#);
        assert_eq!(scope(":host(.active) span"), r#"[nlib-hid="nl-x"].active span[nlib-cid="nl-x"]"#);
        assert_eq!(scope(":host:hover"), r#"[nlib-hid="nl-x"]:hover"#);
    }

    #[test]
    fn test_deep_stops_scoping() {
        assert_eq!(scope(".a :deep .b"), r#".a[nlib-cid="nl-x"] .b"#);
        assert_eq!(scope(":deep .b .c"), r#"[nlib-hid="nl-x"] .b .c"#);
    }

    #[test]
    fn test_host_context() {
        assert_eq!(scope(":host-context(.dark)"), r#".dark [nlib-hid="nl-x"]"#);
        assert_eq!(scope(":host-context(body.dark) .x"), r#"body.dark .x[nlib-cid="nl-x"]"#);
        let err = scope_css_selector(".a:host-context(.dark)", "nl-x").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Css);
        assert_eq!(err.code, ERR_CSS_HOST_CONTEXT);
        assert!(scope_css_selector(":host-context(.a, .b)", "nl-x").is_err());
    }

    #[test]
    fn test_invalid_selectors() {
        assert_eq!(scope_css_selector("", "nl-x").unwrap_err().code, ERR_CSS_SELECTOR);
        assert!(scope_css_selector(".a[", "nl-x").is_err());
        assert!(scope_css_selector(".a >", "nl-x").is_err());
    }

    #[test]
    fn test_stylesheet_skips_at_rules_and_keyframes() {
        let css = "/* c */ .a { color: red; }\n@media (max-width: 10px) { .b { color: blue; } }\n@keyframes spin { from { opacity: 0; } to { opacity: 1; } }";
        let printed = scope_stylesheet(css, "nl-x").unwrap();
        assert!(printed.contains(".a[nlib-cid"));
        assert!(printed.contains(".b[nlib-cid"));
        assert!(printed.contains("@media (max-width: 10px)"));
        assert!(printed.contains("@keyframes spin"));
        assert!(!printed.contains("from[nlib-cid"));
        assert!(!printed.contains("to[nlib-cid"));
    }

    #[test]
    fn test_stylesheet_scopes_nested_group_rules() {
        let css = "@media screen { @supports (display: grid) { .grid > li { display: grid; } } }\n:host { color: red; }";
        let printed = scope_stylesheet(css, "nl-x").unwrap();
        assert!(printed.contains("@supports (display: grid)"));
        assert!(printed.contains(".grid[nlib-cid"));
        assert!(printed.contains("li[nlib-cid"));
        assert!(printed.contains("[nlib-hid"));
        assert!(!printed.contains(":host"));
    }

    #[test]
    fn test_stylesheet_ignores_braces_in_strings() {
        let css = r#".a::after { content: "}"; } .b { color: red; }"#;
        let printed = scope_stylesheet(css, "nl-x").unwrap();
        assert!(printed.contains(".a[nlib-cid"));
        assert!(printed.contains(".b[nlib-cid"));
        assert!(printed.contains(r#""}""#));
    }

    #[test]
    fn test_stylesheet_reports_invalid_selectors() {
        let err = scope_stylesheet(".a:host-context(.x) { color: red }", "nl-x").unwrap_err();
        assert_eq!(err.code, ERR_CSS_HOST_CONTEXT);
    }
}
