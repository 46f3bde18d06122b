//! Package Module for the nlib rendering engine
//!
//! Components are registered through the scope of the package that owns them.
//! A scope enforces the tag naming rule for its package and carries a tracing
//! span so everything logged during registration is attributed to it.

use lazy_static::lazy_static;
use regex::Regex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::component::{register, validate_tag, ComponentConfig, ComponentDefinition};
use crate::config::EngineOptions;
use crate::dom::Dom;
use crate::error::{EngineError, Result, ERR_NAMING_PREFIX};

lazy_static! {
    /// First letter of every word in a package id.
    static ref INITIALS_RE: Regex = Regex::new(r"(?i)(?:^|[^a-z])([a-z])").unwrap();
}

thread_local! {
    static SCOPES: RefCell<HashMap<String, Rc<ModuleScope>>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PackageKind {
    Module,
    System,
    World,
}

impl PackageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PackageKind::Module => "module",
            PackageKind::System => "system",
            PackageKind::World => "world",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Package {
    pub kind: PackageKind,
    pub id: String,
}

impl Package {
    pub fn new(kind: PackageKind, id: &str) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.kind.as_str(), self.id)
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NAMING
// ═══════════════════════════════════════════════════════════════════════════════

/// True if `tag` starts with `<id>-`, or with an abbreviation of the id: at
/// least two characters found in order within the id, followed by `-`.
pub fn is_prefixed(package_id: &str, tag: &str) -> bool {
    let tag = tag.to_lowercase();
    if tag.starts_with(&format!("{}-", package_id)) {
        return true;
    }
    let Some((prefix, _)) = tag.split_once('-') else {
        return false;
    };
    if prefix.is_empty() || prefix.chars().count() < 2 {
        return false;
    }

    let mut from = 0;
    for ch in prefix.chars() {
        match package_id[from..].find(ch) {
            Some(offset) => from += offset,
            None => return false,
        }
    }
    true
}

pub fn naming_examples(package_id: &str) -> Vec<String> {
    let mut examples = vec!["nlib-button".to_string(), format!("{}-button", package_id)];
    let initials: String = INITIALS_RE
        .captures_iter(package_id)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect();
    if initials.chars().count() >= 2 {
        examples.push(format!("{}-button", initials));
    }
    examples
}

pub fn validate_prefix(package_id: &str, tag: &str) -> Result<()> {
    if is_prefixed(package_id, tag) {
        return Ok(());
    }
    let examples = naming_examples(package_id);
    let listed: Vec<String> = examples.iter().map(|e| format!("\"{}\"", e)).collect();
    let mut err = EngineError::naming(
        ERR_NAMING_PREFIX,
        format!(
            "Components need to be prefixed with the module name ({}) or an abbreviation of it (minimum 2 characters) followed by a minus \"-\". Example: {}. Found: {}",
            package_id,
            listed.join(", "),
            tag
        ),
    );
    for example in examples {
        err = err.hint(format!("Rename to {}", example));
    }
    Err(err)
}

// ═══════════════════════════════════════════════════════════════════════════════
// MODULE SCOPE
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-package entry point for registering components.
pub struct ModuleScope {
    package: Package,
    options: EngineOptions,
    span: tracing::Span,
}

impl ModuleScope {
    /// Returns the scope of `package`, creating it on first use.
    pub fn get(package: &Package) -> Rc<ModuleScope> {
        Self::get_with_options(package, EngineOptions::default())
    }

    /// Like [`ModuleScope::get`]; `options` only apply when the scope is new.
    pub fn get_with_options(package: &Package, options: EngineOptions) -> Rc<ModuleScope> {
        SCOPES.with(|scopes| {
            scopes
                .borrow_mut()
                .entry(package.key())
                .or_insert_with(|| {
                    tracing::debug!(package = %package, "module scope created");
                    Rc::new(ModuleScope {
                        package: package.clone(),
                        options,
                        span: tracing::info_span!("package", key = %package.key()),
                    })
                })
                .clone()
        })
    }

    pub fn package(&self) -> &Package {
        &self.package
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }

    /// Registers a component after checking its tag belongs to this package.
    pub fn component(&self, dom: &Dom, config: ComponentConfig) -> Result<Rc<ComponentDefinition>> {
        let _entered = self.span.enter();
        validate_tag(&config.tag)?;
        validate_prefix(&self.package.id, &config.tag)?;
        register(dom, config, &self.options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ObjectController;
    use crate::error::ErrorKind;

    #[test]
    fn test_full_and_abbreviated_prefixes() {
        assert!(is_prefixed("nils-library", "nils-library-button"));
        assert!(is_prefixed("nils-library", "nl-button"));
        assert!(is_prefixed("nils-library", "nlib-button"));
        assert!(is_prefixed("nils-library", "nils-lib-button"));
        assert!(!is_prefixed("nils-library", "n-button"));
        assert!(!is_prefixed("nils-library", "ln-button"));
        assert!(!is_prefixed("nils-library", "xy-button"));
    }

    #[test]
    fn test_prefix_check_ignores_case() {
        assert!(is_prefixed("nils-library", "NL-Button"));
        assert!(is_prefixed("nils-library", "NLib-Button"));
        assert!(is_prefixed("nils-library", "Nils-Library-Button"));
        assert!(!is_prefixed("nils-library", "XY-Button"));
    }

    #[test]
    fn test_naming_examples() {
        assert_eq!(
            naming_examples("my-cool-module"),
            vec!["nlib-button", "my-cool-module-button", "mcm-button"]
        );
        assert_eq!(naming_examples("single"), vec!["nlib-button", "single-button"]);
    }

    #[test]
    fn test_scope_rejects_foreign_prefix() {
        let package = Package::new(PackageKind::Module, "nils-library");
        let scope = ModuleScope::get(&package);
        assert!(Rc::ptr_eq(&scope, &ModuleScope::get(&package)));

        let dom = Dom::new();
        let err = scope
            .component(&dom, ComponentConfig::new("foo-button", ObjectController::new))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Naming);
        assert!(err.message.contains("Found: foo-button"));
        assert!(err.message.contains("\"nlib-button\", \"nils-library-button\", \"nl-button\""));

        scope
            .component(&dom, ComponentConfig::new("nl-scoped-ok", ObjectController::new).html("<p></p>"))
            .unwrap();
        assert!(dom.definition("nl-scoped-ok").is_some());
    }

    #[test]
    fn test_scopes_keyed_by_kind() {
        let module = ModuleScope::get(&Package::new(PackageKind::Module, "shared-id"));
        let system = ModuleScope::get(&Package::new(PackageKind::System, "shared-id"));
        assert!(!Rc::ptr_eq(&module, &system));
        assert_eq!(system.package().key(), "system/shared-id");
    }
}
