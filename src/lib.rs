//! # nlib rendering engine
//!
//! Components declare an HTML template, an optional stylesheet and a
//! controller. The engine turns that into live DOM:
//!
//! 1. **Parse**: template HTML becomes node-data (`parse`), with `{{ }}`
//!    segments split out of text and attributes (`bindable`, built on `lexer`).
//! 2. **Compile**: node-data compiles into a template with directives
//!    (`*if`, `*for`), property bindings `[x]`, events `(x)` and two-way
//!    bindings `[(x)]` (`template`, `expr`, `scope`), cached by content hash
//!    (`cache`).
//! 3. **Evaluate**: each render evaluates the template against the controller
//!    into a virtual tree (`eval`, `vnode`), reusing nodes by position and loop
//!    identity.
//! 4. **Diff**: the virtual tree is reconciled with the host DOM, batched
//!    through a shared render queue (`render`, `queue`, `dom`).
//!
//! Styles are scoped per component (`css`) unless the component renders into a
//! shadow root. Component registration, lifecycle and slots live in
//! `component`; per-package naming lives in `package`.
//!
//! ## Invariants
//!
//! 1. **Single queue**: every deferred DOM write goes through `queue`; a
//!    task queued twice before a drain runs once.
//! 2. **Local bind errors**: an expression that fails renders as `undefined`
//!    for that binding only and is logged; the rest of the template renders.
//! 3. **Stable identity**: unchanged `*for` items keep their virtual and DOM
//!    nodes across renders.
//! 4. **Scoped styles**: a non-shadow component's selectors only match
//!    elements carrying its `nlib-cid` / `nlib-hid` attributes.

#[cfg(feature = "napi")]
use napi_derive::napi;

pub mod bindable;
pub mod cache;
pub mod component;
pub mod config;
pub mod connector;
pub mod controller;
pub mod css;
pub mod dom;
pub mod error;
pub mod eval;
pub mod expr;
pub mod lexer;
pub mod package;
pub mod parse;
pub mod queue;
pub mod render;
pub mod scope;
pub mod template;
pub mod value;
pub mod vnode;

#[cfg(test)]
mod e2e_tests;

pub use bindable::{parse_bindable, Segment};
pub use cache::TemplateCache;
pub use component::{register, ComponentConfig, ComponentDefinition, ComponentElement};
pub use config::EngineOptions;
pub use connector::TagReplacer;
pub use controller::{
    AttributeBinding, Controller, ControllerHandle, Deduplicate, EventBinding, InitContext, ObjectController,
    OutputBinding, Stoppable,
};
pub use css::{scope_css_selector, scope_stylesheet};
pub use dom::{Dom, NodeId, ShadowRootMode};
pub use error::{EngineError, ErrorKind, Result};
pub use package::{ModuleScope, Package, PackageKind};
pub use parse::{parse_html, NodeData};
pub use render::{render_dom, render_into, RenderOptions};
pub use template::{compile, CompileOptions, CompiledTemplate, TemplateInstance, TemplateSource};
pub use value::{DataType, Value};
pub use vnode::VNode;

// ═══════════════════════════════════════════════════════════════════════════════
// NATIVE BRIDGE
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(feature = "napi")]
fn to_napi_error(e: EngineError) -> napi::Error {
    napi::Error::from_reason(e.to_string())
}

/// Scopes a whole stylesheet to `tag`.
#[cfg(feature = "napi")]
#[napi]
pub fn scope_css(css: String, tag: String) -> napi::Result<String> {
    scope_stylesheet(&css, &tag.to_lowercase()).map_err(to_napi_error)
}

/// Parses template HTML into node-data JSON, ready for `TemplateSource::Nodes`.
#[cfg(feature = "napi")]
#[napi]
pub fn parse_template(html: String) -> napi::Result<String> {
    let nodes = parse_html(&html).map_err(to_napi_error)?;
    serde_json::to_string(&nodes).map_err(|e| napi::Error::from_reason(format!("Node-data serialize error: {}", e)))
}

/// Splits text into literal and `{{ }}` segments, as JSON.
#[cfg(feature = "napi")]
#[napi(js_name = "parseBindable")]
pub fn parse_bindable_text(text: String) -> napi::Result<String> {
    let segments = parse_bindable(&text).map_err(to_napi_error)?;
    serde_json::to_string(&segments).map_err(|e| napi::Error::from_reason(format!("Segment serialize error: {}", e)))
}
