//! Compiled-template cache.
//!
//! Templates are keyed by the SHA-256 of their source and compile options,
//! so identical templates registered by several packages compile once.

use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::Result;
use crate::template::{compile_source, CompileOptions, CompiledTemplate, TemplateSource};

thread_local! {
    static TEMPLATES: RefCell<HashMap<String, Rc<CompiledTemplate>>> = RefCell::new(HashMap::new());
}

pub struct TemplateCache;

impl TemplateCache {
    pub fn compute_hash(source: &TemplateSource, options: &CompileOptions) -> String {
        let mut hasher = Sha256::new();
        match source {
            TemplateSource::Html(html) => {
                hasher.update(b"html\0");
                hasher.update(html.as_bytes());
            }
            TemplateSource::Nodes(nodes) => {
                hasher.update(b"nodes\0");
                hasher.update(serde_json::to_string(nodes).unwrap_or_default().as_bytes());
            }
        }
        hasher.update(b"\0");
        hasher.update(options.tag.as_bytes());
        hasher.update(if options.scoped { b"\0scoped" } else { b"\0shadow" });
        format!("{:x}", hasher.finalize())
    }

    pub fn get(hash: &str) -> Option<Rc<CompiledTemplate>> {
        TEMPLATES.with(|cache| cache.borrow().get(hash).cloned())
    }

    /// Returns the cached template or compiles and stores it. Failed
    /// compilations are not cached.
    pub fn get_or_compile(source: &TemplateSource, options: &CompileOptions) -> Result<Rc<CompiledTemplate>> {
        let hash = Self::compute_hash(source, options);
        if let Some(hit) = Self::get(&hash) {
            tracing::debug!(component = %options.tag, hash = %&hash[..12], "template cache hit");
            return Ok(hit);
        }
        let compiled = Rc::new(compile_source(source, options)?);
        TEMPLATES.with(|cache| cache.borrow_mut().insert(hash, compiled.clone()));
        Ok(compiled)
    }

    pub fn len() -> usize {
        TEMPLATES.with(|cache| cache.borrow().len())
    }

    pub fn clear() {
        TEMPLATES.with(|cache| cache.borrow_mut().clear());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_sources_compile_once() {
        let source = TemplateSource::from("<p>{{this.cached}}</p>");
        let options = CompileOptions::new("nl-cache", true);
        let a = TemplateCache::get_or_compile(&source, &options).unwrap();
        let b = TemplateCache::get_or_compile(&source, &options).unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_hash_depends_on_options() {
        let source = TemplateSource::from("<p></p>");
        let scoped = TemplateCache::compute_hash(&source, &CompileOptions::new("nl-a", true));
        let shadow = TemplateCache::compute_hash(&source, &CompileOptions::new("nl-a", false));
        let other = TemplateCache::compute_hash(&source, &CompileOptions::new("nl-b", true));
        assert_ne!(scoped, shadow);
        assert_ne!(scoped, other);
        assert_eq!(scoped.len(), 64);
    }

    #[test]
    fn test_failed_compile_is_not_cached() {
        let source = TemplateSource::from("<p *nope=\"x\"></p>");
        let options = CompileOptions::new("nl-cache-fail", true);
        assert!(TemplateCache::get_or_compile(&source, &options).is_err());
        let hash = TemplateCache::compute_hash(&source, &options);
        assert!(TemplateCache::get(&hash).is_none());
    }
}
