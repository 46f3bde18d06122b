//! Engine configuration.

use serde::Deserialize;

use crate::error::{EngineError, Result, ERR_PARSE_NODE_DATA};

pub const DEFAULT_LIBRARY_ID: &str = "nils-library";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineOptions {
    /// Id of the package that hosts the engine.
    pub library_id: String,
    /// Attribute the connector replaces with a component element.
    pub tag_replacer_attribute: String,
    /// Head comment after which global component styles are inserted.
    pub style_comment: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::for_library(DEFAULT_LIBRARY_ID)
    }
}

impl EngineOptions {
    pub fn for_library(library_id: &str) -> Self {
        Self {
            library_id: library_id.to_string(),
            tag_replacer_attribute: format!("data-{}-tag-replacer", library_id),
            style_comment: format!("{} styling", library_id),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            EngineError::parse(ERR_PARSE_NODE_DATA, format!("Invalid engine options: {}", e)).context(json.to_string())
        })
    }

    pub fn style_element_id(&self, tag: &str) -> String {
        format!("{}-element-{}", self.library_id, tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = EngineOptions::default();
        assert_eq!(options.tag_replacer_attribute, "data-nils-library-tag-replacer");
        assert_eq!(options.style_comment, "nils-library styling");
        assert_eq!(options.style_element_id("nl-x"), "nils-library-element-nl-x");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options = EngineOptions::from_json(r#"{"styleComment": "custom"}"#).unwrap();
        assert_eq!(options.library_id, DEFAULT_LIBRARY_ID);
        assert_eq!(options.style_comment, "custom");
        assert!(EngineOptions::from_json("{").is_err());
    }
}
