//! Lexer Module for the nlib rendering engine
//!
//! A mode-stack tokenizer. Tokens are tried in the order their mode lists
//! them; the first match wins, is appended to the output, and then the mode
//! stack is popped and/or pushed.

use indexmap::IndexMap;
use regex::Regex;
use std::fmt;
use std::sync::Arc;

use crate::error::{EngineError, Result, ERR_LEX_DEFINITION, ERR_LEX_NO_TOKEN};

/// What a pattern returns when it matches at the current offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    /// Number of bytes consumed from the input.
    pub consumed: usize,
    pub result: String,
}

pub type MatchFn = dyn Fn(&str, usize, &[ParsedToken]) -> Option<PatternMatch> + Send + Sync;

#[derive(Clone)]
pub enum TokenPattern {
    /// Matched at the offset; the whole match is the result.
    Regex(Regex),
    /// Matched at the offset; the given group is the result.
    Group { regex: Regex, group: usize },
    /// Context-sensitive matcher over `(text, offset, emitted tokens)`.
    Custom(Arc<MatchFn>),
}

impl TokenPattern {
    /// Compiles `pattern` anchored at the match offset.
    pub fn regex(pattern: &str) -> std::result::Result<Self, regex::Error> {
        Ok(TokenPattern::Regex(Regex::new(&format!("^(?:{})", pattern))?))
    }

    pub fn group(pattern: &str, group: usize) -> std::result::Result<Self, regex::Error> {
        Ok(TokenPattern::Group {
            regex: Regex::new(&format!("^(?:{})", pattern))?,
            group,
        })
    }

    pub fn custom(
        f: impl Fn(&str, usize, &[ParsedToken]) -> Option<PatternMatch> + Send + Sync + 'static,
    ) -> Self {
        TokenPattern::Custom(Arc::new(f))
    }

    fn exec(&self, text: &str, offset: usize, tokens: &[ParsedToken]) -> Option<PatternMatch> {
        match self {
            TokenPattern::Regex(regex) => regex.find(&text[offset..]).map(|m| PatternMatch {
                consumed: m.end(),
                result: m.as_str().to_string(),
            }),
            TokenPattern::Group { regex, group } => {
                let caps = regex.captures(&text[offset..])?;
                let whole = caps.get(0)?;
                Some(PatternMatch {
                    consumed: whole.end(),
                    result: caps
                        .get(*group)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default(),
                })
            }
            TokenPattern::Custom(f) => f(text, offset, tokens),
        }
    }
}

impl fmt::Debug for TokenPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenPattern::Regex(regex) => write!(f, "/{}/", regex.as_str()),
            TokenPattern::Group { regex, group } => write!(f, "/{}/ group {}", regex.as_str(), group),
            TokenPattern::Custom(_) => write!(f, "<custom>"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenDef {
    pub name: String,
    pub pattern: TokenPattern,
    pub pop_mode: bool,
    pub push_mode: Option<String>,
}

impl TokenDef {
    pub fn new(name: &str, pattern: TokenPattern) -> Self {
        Self {
            name: name.to_string(),
            pattern,
            pop_mode: false,
            push_mode: None,
        }
    }

    pub fn pop(mut self) -> Self {
        self.pop_mode = true;
        self
    }

    pub fn push(mut self, mode: &str) -> Self {
        self.push_mode = Some(mode.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedToken {
    pub name: String,
    pub mode: String,
    pub result: String,
    pub start: usize,
    pub end: usize,
}

// ═══════════════════════════════════════════════════════════════════════════════
// LEXER
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct Lexer {
    default_mode: String,
    tokens: IndexMap<String, TokenDef>,
    modes: IndexMap<String, Vec<String>>,
}

pub struct LexerBuilder {
    default_mode: String,
    tokens: IndexMap<String, TokenDef>,
    modes: IndexMap<String, Vec<String>>,
}

impl LexerBuilder {
    pub fn token(mut self, token: TokenDef) -> Self {
        self.tokens.insert(token.name.clone(), token);
        self
    }

    pub fn mode(mut self, name: &str, tokens: &[&str]) -> Self {
        self.modes
            .insert(name.to_string(), tokens.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Lexer> {
        if !self.modes.contains_key(&self.default_mode) {
            return Err(EngineError::lex(
                ERR_LEX_DEFINITION,
                format!("default mode '{}' is not declared", self.default_mode),
            ));
        }
        for (mode, names) in &self.modes {
            for name in names {
                let token = self.tokens.get(name).ok_or_else(|| {
                    EngineError::lex(
                        ERR_LEX_DEFINITION,
                        format!("mode '{}' references unknown token '{}'", mode, name),
                    )
                })?;
                if let Some(push) = &token.push_mode {
                    if !self.modes.contains_key(push) {
                        return Err(EngineError::lex(
                            ERR_LEX_DEFINITION,
                            format!("token '{}' pushes unknown mode '{}'", name, push),
                        ));
                    }
                }
            }
        }
        Ok(Lexer {
            default_mode: self.default_mode,
            tokens: self.tokens,
            modes: self.modes,
        })
    }
}

impl Lexer {
    pub fn builder(default_mode: &str) -> LexerBuilder {
        LexerBuilder {
            default_mode: default_mode.to_string(),
            tokens: IndexMap::new(),
            modes: IndexMap::new(),
        }
    }

    pub fn tokenize(&self, text: &str) -> Result<Vec<ParsedToken>> {
        let mut tokens: Vec<ParsedToken> = Vec::new();
        let mut mode_stack: Vec<&str> = vec![self.default_mode.as_str()];
        let mut offset = 0;

        while offset < text.len() {
            let mode = mode_stack.last().copied().unwrap_or(self.default_mode.as_str());
            let candidates = self.modes.get(mode).map(Vec::as_slice).unwrap_or(&[]);

            let mut matched = None;
            for name in candidates {
                let Some(token) = self.tokens.get(name) else {
                    continue;
                };
                let Some(m) = token.pattern.exec(text, offset, &tokens) else {
                    continue;
                };
                // An empty match that does not switch modes would never advance.
                if m.consumed == 0 && !token.pop_mode && token.push_mode.is_none() {
                    continue;
                }
                matched = Some((token, m));
                break;
            }

            let Some((token, m)) = matched else {
                return Err(self.no_token_error(mode, offset, text, &tokens));
            };

            tokens.push(ParsedToken {
                name: token.name.clone(),
                mode: mode.to_string(),
                result: m.result,
                start: offset,
                end: offset + m.consumed,
            });
            if token.pop_mode {
                mode_stack.pop();
            }
            if let Some(push) = &token.push_mode {
                mode_stack.push(push.as_str());
            }
            offset += m.consumed;
        }

        Ok(tokens)
    }

    fn no_token_error(
        &self,
        mode: &str,
        offset: usize,
        text: &str,
        tokens: &[ParsedToken],
    ) -> EngineError {
        let stream = tokens
            .iter()
            .map(|t| format!("- {} => '{}'", t.name, t.result))
            .collect::<Vec<_>>()
            .join("\n");
        EngineError::lex(
            ERR_LEX_NO_TOKEN,
            format!("No token matched in mode '{}' at offset {}", mode, offset),
        )
        .context(format!("tokens:\n{}\ntext:\n{}", stream, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word_lexer() -> Lexer {
        Lexer::builder("outer")
            .token(TokenDef::new("word", TokenPattern::regex(r"[a-z]+").unwrap()))
            .token(TokenDef::new("space", TokenPattern::regex(r"\s+").unwrap()))
            .token(TokenDef::new("open", TokenPattern::regex(r"\(").unwrap()).push("inner"))
            .token(TokenDef::new("close", TokenPattern::regex(r"\)").unwrap()).pop())
            .token(TokenDef::new("digits", TokenPattern::group(r"#(\d+)", 1).unwrap()))
            .mode("outer", &["word", "space", "open"])
            .mode("inner", &["digits", "close"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_mode_stack_push_and_pop() {
        let tokens = word_lexer().tokenize("ab (#12) cd").unwrap();
        let names: Vec<&str> = tokens.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["word", "space", "open", "digits", "close", "space", "word"]);
        assert_eq!(tokens[3].result, "12");
        assert_eq!(tokens[3].mode, "inner");
        assert_eq!((tokens[3].start, tokens[3].end), (4, 7));
    }

    #[test]
    fn test_no_token_reports_mode_offset_and_stream() {
        let err = word_lexer().tokenize("ab (x)").unwrap_err();
        assert_eq!(err.code, ERR_LEX_NO_TOKEN);
        assert!(err.message.contains("'inner'"));
        assert!(err.message.contains("offset 4"));
        let context = err.context.unwrap();
        assert!(context.contains("- word => 'ab'"));
        assert!(context.contains("- open => '('"));
    }

    #[test]
    fn test_custom_pattern_sees_emitted_tokens() {
        let lexer = Lexer::builder("main")
            .token(TokenDef::new("a", TokenPattern::regex("a").unwrap()))
            .token(TokenDef::new(
                "echo",
                TokenPattern::custom(|text, offset, tokens| {
                    let n = tokens.iter().filter(|t| t.name == "a").count();
                    let expected = "b".repeat(n);
                    text[offset..].starts_with(&expected).then(|| PatternMatch {
                        consumed: expected.len(),
                        result: expected,
                    })
                }),
            ))
            .mode("main", &["a", "echo"])
            .build()
            .unwrap();
        let tokens = lexer.tokenize("aabb").unwrap();
        assert_eq!(tokens.last().unwrap().result, "bb");
        assert!(lexer.tokenize("aab").is_err());
    }

    #[test]
    fn test_build_rejects_unknown_tokens() {
        let err = Lexer::builder("main")
            .mode("main", &["missing"])
            .build()
            .unwrap_err();
        assert_eq!(err.code, ERR_LEX_DEFINITION);
    }

    #[test]
    fn test_empty_input_yields_no_tokens() {
        assert!(word_lexer().tokenize("").unwrap().is_empty());
    }
}
