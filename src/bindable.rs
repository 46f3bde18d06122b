//! Bindable String Module for the nlib rendering engine
//!
//! Splits template text into literal and bound segments. `{{ expr }}` binds an
//! escaped value, `{{{ expr }}}` binds raw HTML. Quoted strings and template
//! literals inside a binding are skipped so that a `}}` inside them does not
//! close the binding.

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::lexer::{Lexer, ParsedToken, PatternMatch, TokenDef, TokenPattern};

const MODE_FREE_TEXT: &str = "freeText";
const MODE_BOUND: &str = "bound";
const MODE_INTERPOLATION: &str = "interpolation";
const MODE_BACKTICK: &str = "backtick";

const START_BINDING: &str = "startBinding";
const END_BINDING: &str = "endBinding";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Escaping {
    Escaped,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Segment {
    #[serde(rename = "string")]
    Literal { text: String },
    #[serde(rename = "bind")]
    Bound {
        #[serde(rename = "text")]
        source: String,
        #[serde(rename = "bindMethod")]
        escaping: Escaping,
    },
}

impl Segment {
    pub fn literal(text: impl Into<String>) -> Self {
        Segment::Literal { text: text.into() }
    }

    pub fn escaped(source: impl Into<String>) -> Self {
        Segment::Bound {
            source: source.into(),
            escaping: Escaping::Escaped,
        }
    }

    pub fn raw(source: impl Into<String>) -> Self {
        Segment::Bound {
            source: source.into(),
            escaping: Escaping::Raw,
        }
    }

    pub fn is_bound(&self) -> bool {
        matches!(self, Segment::Bound { .. })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONTEXT-SENSITIVE MATCHERS
// ═══════════════════════════════════════════════════════════════════════════════

fn is_quote(c: char) -> bool {
    c == '\'' || c == '"' || c == '`'
}

/// Length of the brace run that opened the current binding.
fn open_brace_count(tokens: &[ParsedToken]) -> usize {
    tokens
        .iter()
        .rev()
        .find(|t| t.name == START_BINDING)
        .map(|t| t.result.len())
        .unwrap_or(2)
}

fn match_end_binding(text: &str, offset: usize, tokens: &[ParsedToken]) -> Option<PatternMatch> {
    let closer = "}".repeat(open_brace_count(tokens));
    text[offset..].starts_with(&closer).then(|| PatternMatch {
        consumed: closer.len(),
        result: closer,
    })
}

/// Literal text up to the next `{{`. Never starts with `{`.
fn match_free_text(text: &str, offset: usize, _: &[ParsedToken]) -> Option<PatternMatch> {
    let rest = &text[offset..];
    let first = rest.chars().next()?;
    if first == '{' {
        return None;
    }
    let from = first.len_utf8();
    let end = rest[from..].find("{{")? + from;
    Some(PatternMatch {
        consumed: end,
        result: rest[..end].to_string(),
    })
}

/// Unquoted expression text, lazily up to a quote or the binding closer.
fn match_expression_text(text: &str, offset: usize, tokens: &[ParsedToken]) -> Option<PatternMatch> {
    let closer = "}".repeat(open_brace_count(tokens));
    scan_unquoted(&text[offset..], |rest| rest.starts_with(&closer))
}

/// Unquoted text inside `${ }`, up to a quote or the closing brace.
fn match_interpolation_text(text: &str, offset: usize, _: &[ParsedToken]) -> Option<PatternMatch> {
    scan_unquoted(&text[offset..], |rest| rest.starts_with('}'))
}

fn scan_unquoted(rest: &str, stop: impl Fn(&str) -> bool) -> Option<PatternMatch> {
    let first = rest.chars().next()?;
    if is_quote(first) {
        return None;
    }
    for (i, c) in rest.char_indices().skip(1) {
        if is_quote(c) || stop(&rest[i..]) {
            return Some(PatternMatch {
                consumed: i,
                result: rest[..i].to_string(),
            });
        }
    }
    None
}

fn match_quoted(quote: char) -> impl Fn(&str, usize, &[ParsedToken]) -> Option<PatternMatch> {
    move |text, offset, _| {
        let rest = &text[offset..];
        if !rest.starts_with(quote) {
            return None;
        }
        let mut escaped = false;
        for (i, c) in rest.char_indices().skip(1) {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                let end = i + c.len_utf8();
                return Some(PatternMatch {
                    consumed: end,
                    result: rest[..end].to_string(),
                });
            }
        }
        None
    }
}

/// Template literal text up to the closing backtick or the next `${`.
fn match_backtick_text(text: &str, offset: usize, _: &[ParsedToken]) -> Option<PatternMatch> {
    let rest = &text[offset..];
    let mut escaped = false;
    for (i, c) in rest.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if c == '\\' {
            escaped = true;
            continue;
        }
        if c == '`' || rest[i..].starts_with("${") {
            if i == 0 {
                return None;
            }
            return Some(PatternMatch {
                consumed: i,
                result: rest[..i].to_string(),
            });
        }
    }
    None
}

fn build_bindable_lexer() -> Result<Lexer> {
    let pattern = |p: &str| TokenPattern::regex(p).unwrap();
    Lexer::builder(MODE_FREE_TEXT)
        .token(TokenDef::new("freeText", TokenPattern::custom(match_free_text)))
        .token(TokenDef::new(START_BINDING, pattern(r"\{\{\{?")).push(MODE_BOUND))
        .token(TokenDef::new(
            "remainingText",
            TokenPattern::group(r"(?s)(.+)", 1).unwrap(),
        ))
        .token(TokenDef::new(END_BINDING, TokenPattern::custom(match_end_binding)).pop())
        .token(TokenDef::new("jsSingleQuote", TokenPattern::custom(match_quoted('\''))))
        .token(TokenDef::new("jsDoubleQuote", TokenPattern::custom(match_quoted('"'))))
        .token(TokenDef::new("jsNoQuotes", TokenPattern::custom(match_expression_text)))
        .token(TokenDef::new(
            "jsInterpolationNoQuotes",
            TokenPattern::custom(match_interpolation_text),
        ))
        .token(TokenDef::new("jsStartBacktickQuote", pattern("`")).push(MODE_BACKTICK))
        .token(TokenDef::new("jsEndBacktickQuote", pattern("`")).pop())
        .token(TokenDef::new("jsBacktickValue", TokenPattern::custom(match_backtick_text)))
        .token(TokenDef::new("jsStartInterpolation", pattern(r"\$\{")).push(MODE_INTERPOLATION))
        .token(TokenDef::new("jsEndInterpolation", pattern(r"\}")).pop())
        .mode(MODE_FREE_TEXT, &["freeText", START_BINDING, "remainingText"])
        .mode(
            MODE_BOUND,
            &[
                END_BINDING,
                "jsSingleQuote",
                "jsDoubleQuote",
                "jsNoQuotes",
                "jsStartBacktickQuote",
            ],
        )
        .mode(
            MODE_INTERPOLATION,
            &[
                "jsEndInterpolation",
                "jsSingleQuote",
                "jsDoubleQuote",
                "jsInterpolationNoQuotes",
                "jsStartBacktickQuote",
            ],
        )
        .mode(
            MODE_BACKTICK,
            &["jsStartInterpolation", "jsEndBacktickQuote", "jsBacktickValue"],
        )
        .build()
}

lazy_static! {
    static ref BINDABLE_LEXER: Lexer = build_bindable_lexer().unwrap();
}

// ═══════════════════════════════════════════════════════════════════════════════
// PUBLIC API
// ═══════════════════════════════════════════════════════════════════════════════

pub fn parse_bindable(text: &str) -> Result<Vec<Segment>> {
    let tokens = BINDABLE_LEXER.tokenize(text)?;
    let mut segments: Vec<Segment> = Vec::new();

    for token in tokens {
        if token.name == START_BINDING {
            segments.push(Segment::Bound {
                source: String::new(),
                escaping: if token.result.len() == 2 {
                    Escaping::Escaped
                } else {
                    Escaping::Raw
                },
            });
        } else if token.name == END_BINDING {
            continue;
        } else if token.mode == MODE_FREE_TEXT {
            match segments.last_mut() {
                Some(Segment::Literal { text }) => text.push_str(&token.result),
                _ => segments.push(Segment::literal(token.result)),
            }
        } else if let Some(Segment::Bound { source, .. }) = segments.last_mut() {
            source.push_str(&token.result);
        }
    }

    Ok(segments)
}

/// Writes segments back in template syntax.
pub fn serialize_segments(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Literal { text } => out.push_str(text),
            Segment::Bound {
                source,
                escaping: Escaping::Escaped,
            } => {
                out.push_str("{{");
                out.push_str(source);
                out.push_str("}}");
            }
            Segment::Bound {
                source,
                escaping: Escaping::Raw,
            } => {
                out.push_str("{{{");
                out.push_str(source);
                out.push_str("}}}");
            }
        }
    }
    out
}

/// The joined text when no segment is bound.
pub fn literal_text(segments: &[Segment]) -> Option<String> {
    if segments.iter().any(Segment::is_bound) {
        return None;
    }
    Some(serialize_segments(segments))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_is_one_literal() {
        assert_eq!(
            parse_bindable("hello {world}").unwrap(),
            vec![Segment::literal("hello {world}")]
        );
        assert!(parse_bindable("").unwrap().is_empty());
    }

    #[test]
    fn test_escaped_and_raw_bindings() {
        let segments = parse_bindable("Hi {{this.name}}, {{{this.html}}}!").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::literal("Hi "),
                Segment::escaped("this.name"),
                Segment::literal(", "),
                Segment::raw("this.html"),
                Segment::literal("!"),
            ]
        );
    }

    #[test]
    fn test_quotes_hide_closing_braces() {
        let segments = parse_bindable(r#"{{ this.f('}}', "a\"}}") }}"#).unwrap();
        assert_eq!(segments, vec![Segment::escaped(r#" this.f('}}', "a\"}}") "#)]);
    }

    #[test]
    fn test_template_literal_interpolation() {
        let segments = parse_bindable("a{{ `x ${this.n} }}` }}b").unwrap();
        assert_eq!(
            segments,
            vec![
                Segment::literal("a"),
                Segment::escaped(" `x ${this.n} }}` "),
                Segment::literal("b"),
            ]
        );
    }

    #[test]
    fn test_raw_binding_needs_three_closing_braces() {
        let segments = parse_bindable("{{{ a ? {b: 1} : c }}}").unwrap();
        assert_eq!(segments, vec![Segment::raw(" a ? {b: 1} : c ")]);
    }

    #[test]
    fn test_unclosed_binding_is_a_lex_error() {
        let err = parse_bindable("{{ this.name").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Lex);
    }

    #[test]
    fn test_serialize_round_trip() {
        for source in ["a {{ b }} c", "{{{ raw }}}", "x{{y}}{{{z}}}w", "plain"] {
            let parsed = parse_bindable(source).unwrap();
            assert_eq!(serialize_segments(&parsed), source);
            assert_eq!(parse_bindable(&serialize_segments(&parsed)).unwrap(), parsed);
        }
    }

    #[test]
    fn test_segments_serialize_as_node_data_json() {
        let json = serde_json::to_value(Segment::raw("x")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "bind", "text": "x", "bindMethod": "raw"}));
        let back: Segment = serde_json::from_value(json).unwrap();
        assert_eq!(back, Segment::raw("x"));
    }
}
