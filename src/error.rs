//! Error Module for the nlib rendering engine
//!
//! Every failure the engine can raise is an [`EngineError`] tagged with one of
//! the kinds below and a stable code. The code maps to a guarantee string that
//! states what the engine promises once the error has been raised.

use serde::Serialize;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR CODES
// ═══════════════════════════════════════════════════════════════════════════════

pub const ERR_LEX_NO_TOKEN: &str = "NLIB-ERR-LEX-001";
pub const ERR_LEX_DEFINITION: &str = "NLIB-ERR-LEX-002";
pub const ERR_PARSE_HTML: &str = "NLIB-ERR-PARSE-001";
pub const ERR_PARSE_EXPRESSION: &str = "NLIB-ERR-PARSE-002";
pub const ERR_PARSE_DIRECTIVE: &str = "NLIB-ERR-PARSE-003";
pub const ERR_PARSE_NODE_DATA: &str = "NLIB-ERR-PARSE-004";
pub const ERR_BIND_EVALUATION: &str = "NLIB-ERR-BIND-001";
pub const ERR_TREE_HAS_PARENT: &str = "NLIB-ERR-TREE-001";
pub const ERR_TREE_NOT_A_CHILD: &str = "NLIB-ERR-TREE-002";
pub const ERR_TREE_CAPABILITY: &str = "NLIB-ERR-TREE-003";
pub const ERR_TREE_CYCLE: &str = "NLIB-ERR-TREE-004";
pub const ERR_TREE_ATTRIBUTE_NAME: &str = "NLIB-ERR-TREE-005";
pub const ERR_TREE_HOST: &str = "NLIB-ERR-TREE-006";
pub const ERR_CSS_SELECTOR: &str = "NLIB-ERR-CSS-001";
pub const ERR_CSS_HOST_CONTEXT: &str = "NLIB-ERR-CSS-002";
pub const ERR_CSS_STYLESHEET: &str = "NLIB-ERR-CSS-003";
pub const ERR_NAMING_NO_DASH: &str = "NLIB-ERR-NAMING-001";
pub const ERR_NAMING_PREFIX: &str = "NLIB-ERR-NAMING-002";
pub const ERR_CONFLICT_DEFINED: &str = "NLIB-ERR-CONFLICT-001";
pub const ERR_CONFLICT_SHADOW: &str = "NLIB-ERR-CONFLICT-002";

// ═══════════════════════════════════════════════════════════════════════════════
// ERROR KINDS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Tokenizer dead-end
    Lex,
    /// Malformed HTML data, expression syntax or directive syntax
    Parse,
    /// An expression threw while rendering
    Bind,
    /// Illegal tree mutation
    Tree,
    /// Unsupported selector combination
    Css,
    /// Tag prefix violation
    Naming,
    /// Registration clash
    Conflict,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Lex => "LexError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::Bind => "BindError",
            ErrorKind::Tree => "TreeError",
            ErrorKind::Css => "CssError",
            ErrorKind::Naming => "NamingError",
            ErrorKind::Conflict => "ConflictError",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// GUARANTEES
// ═══════════════════════════════════════════════════════════════════════════════

fn get_guarantee(code: &str) -> &'static str {
    match code {
        ERR_LEX_NO_TOKEN => "Templates are tokenized completely or not at all.",
        ERR_LEX_DEFINITION => "Every mode only references declared tokens.",
        ERR_PARSE_HTML | ERR_PARSE_NODE_DATA => {
            "A component with malformed template data is never registered."
        }
        ERR_PARSE_EXPRESSION => "Every binding expression is parsed at registration time.",
        ERR_PARSE_DIRECTIVE => "Structural directives are validated at registration time.",
        ERR_BIND_EVALUATION => {
            "A failing binding yields an empty value and never aborts the render."
        }
        ERR_TREE_HAS_PARENT | ERR_TREE_NOT_A_CHILD | ERR_TREE_CYCLE => {
            "Every child node has exactly one parent, and the tree has no cycles."
        }
        ERR_TREE_CAPABILITY => "A node's capabilities are fixed at creation.",
        ERR_TREE_ATTRIBUTE_NAME => "Attribute names are never empty.",
        ERR_TREE_HOST => "Host DOM mutations keep the document a tree.",
        ERR_CSS_SELECTOR | ERR_CSS_HOST_CONTEXT | ERR_CSS_STYLESHEET => {
            "Component styles only match inside their own component."
        }
        ERR_NAMING_NO_DASH | ERR_NAMING_PREFIX => {
            "Component tags are namespaced by the package that registers them."
        }
        ERR_CONFLICT_DEFINED => "A tag is defined at most once per registry.",
        ERR_CONFLICT_SHADOW => "An element hosts at most one shadow root.",
        _ => "Unknown invariant.",
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE ERROR
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Error, Serialize)]
#[serde(rename_all = "camelCase")]
#[error("{}: [{code}] {message}", .kind.as_str())]
pub struct EngineError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
    pub guarantee: String,
    pub context: Option<String>,
    pub hints: Vec<String>,
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn new(kind: ErrorKind, code: &str, message: impl Into<String>) -> Self {
        Self::with_details(kind, code, message, None, vec![])
    }

    pub fn with_details(
        kind: ErrorKind,
        code: &str,
        message: impl Into<String>,
        context: Option<String>,
        hints: Vec<String>,
    ) -> Self {
        EngineError {
            kind,
            code: code.to_string(),
            message: message.into(),
            guarantee: get_guarantee(code).to_string(),
            context,
            hints,
        }
    }

    pub fn lex(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Lex, code, message)
    }

    pub fn parse(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, code, message)
    }

    pub fn bind(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Bind, ERR_BIND_EVALUATION, message)
    }

    pub fn tree(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Tree, code, message)
    }

    pub fn css(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Css, code, message)
    }

    pub fn naming(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Naming, code, message)
    }

    pub fn conflict(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, code, message)
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.push(hint.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_kind_and_code() {
        let err = EngineError::tree(ERR_TREE_HAS_PARENT, "node already has a parent");
        assert_eq!(
            err.to_string(),
            "TreeError: [NLIB-ERR-TREE-001] node already has a parent"
        );
        assert!(err.guarantee.contains("exactly one parent"));
    }

    #[test]
    fn test_builder_adds_context_and_hints() {
        let err = EngineError::naming(ERR_NAMING_PREFIX, "bad tag")
            .context("tag: foo-bar")
            .hint("nlib-button");
        assert_eq!(err.kind, ErrorKind::Naming);
        assert_eq!(err.context.as_deref(), Some("tag: foo-bar"));
        assert_eq!(err.hints, vec!["nlib-button".to_string()]);
    }

    #[test]
    fn test_serializes_as_json() {
        let err = EngineError::css(ERR_CSS_HOST_CONTEXT, "combined");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "css");
        assert_eq!(json["code"], ERR_CSS_HOST_CONTEXT);
    }
}
