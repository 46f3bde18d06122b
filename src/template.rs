//! Template Module for the nlib rendering engine
//!
//! A component's node-data is compiled once into a tree of binding
//! instructions. Each instance re-executes that tree against its controller
//! scope and refreshes a virtual fragment; nodes are cached by template
//! position and loop identity so unchanged parts keep their virtual (and
//! therefore DOM) nodes between renders.

use lazy_static::lazy_static;
use regex::Regex;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::bindable::{serialize_segments, Escaping, Segment};
use crate::css::CSS_COMPONENT_ID_ATTR;
use crate::dom::{Event, Listener};
use crate::error::{EngineError, Result, ERR_PARSE_DIRECTIVE};
use crate::eval::{evaluate, execute, Scope};
use crate::expr::{parse_expression, parse_program, AssignmentOperator, Expr, Program};
use crate::parse::{attribute_literal, contains_slot, parse_html, parse_static_html, ElementData, NodeData};
use crate::scope::ScopeValidator;
use crate::value::Value;
use crate::vnode::VNode;

lazy_static! {
    static ref FOR_RE: Regex =
        Regex::new(r"^\s*(?:let\s+)?([A-Za-z_$][\w$]*)\s+of\s+([^;]+?)\s*(?:;\s*(.*?))?\s*$").unwrap();
    static ref LET_ALIAS_RE: Regex =
        Regex::new(r"^let\s+([A-Za-z_$][\w$]*)\s*=\s*([A-Za-z_$][\w$]*)$").unwrap();
    static ref AS_ALIAS_RE: Regex =
        Regex::new(r"^([A-Za-z_$][\w$]*)\s+as\s+([A-Za-z_$][\w$]*)$").unwrap();
    static ref NEWLINE_WHITESPACE_RE: Regex = Regex::new(r"^\s*\n\s*$").unwrap();
}

/// Locals every `*for` expansion binds.
pub const LOOP_LOCALS: [&str; 6] = ["index", "first", "last", "even", "odd", "count"];

pub const EVENT_LOCAL: &str = "$event";

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILED FORM
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Component tag, used for `cid` markers and diagnostics.
    pub tag: String,
    /// Write the `cid` attribute on every element (non-shadow components).
    pub scoped: bool,
}

impl CompileOptions {
    pub fn new(tag: &str, scoped: bool) -> Self {
        Self {
            tag: tag.to_string(),
            scoped,
        }
    }
}

/// Where a compiled template comes from.
#[derive(Debug, Clone)]
pub enum TemplateSource {
    Html(String),
    Nodes(Vec<NodeData>),
}

impl TemplateSource {
    pub fn parse(&self) -> Result<Vec<NodeData>> {
        match self {
            TemplateSource::Html(html) => parse_html(html),
            TemplateSource::Nodes(nodes) => Ok(nodes.clone()),
        }
    }
}

impl From<&str> for TemplateSource {
    fn from(html: &str) -> Self {
        TemplateSource::Html(html.to_string())
    }
}

#[derive(Debug, Clone)]
pub enum TextPart {
    Literal(String),
    Escaped { source: String, expr: Expr },
    Html { source: String, expr: Expr },
}

#[derive(Debug, Clone)]
pub enum AttributePart {
    Literal(String),
    Bound { source: String, expr: Expr },
}

#[derive(Debug, Clone)]
pub enum TemplateAttribute {
    Static { name: String, value: String },
    /// Literal text mixed with bindings; assembled into one string per render.
    Interpolated { name: String, parts: Vec<AttributePart> },
    /// `[name]="expr"`: the value is passed through untouched.
    Property { name: String, source: String, expr: Expr },
}

impl TemplateAttribute {
    pub fn name(&self) -> &str {
        match self {
            TemplateAttribute::Static { name, .. }
            | TemplateAttribute::Interpolated { name, .. }
            | TemplateAttribute::Property { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventHandler {
    pub event_type: String,
    pub program: Rc<Program>,
    /// Write half of `[(x)]`: `$event` is the event detail when present.
    pub two_way: bool,
}

#[derive(Debug, Clone)]
pub enum Directive {
    If {
        source: String,
        expr: Expr,
    },
    For {
        item: String,
        source: String,
        iterable: Expr,
        /// `(alias, loop local)` pairs.
        aliases: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone)]
pub struct ElementNode {
    pub id: usize,
    pub tag: String,
    pub namespace: Option<String>,
    pub attributes: Vec<TemplateAttribute>,
    pub events: Vec<EventHandler>,
    /// In written order; earlier directives wrap later ones.
    pub directives: Vec<Directive>,
    pub children: Vec<TemplateNode>,
}

#[derive(Debug, Clone)]
pub enum TemplateNode {
    Element(ElementNode),
    Text { id: usize, parts: Vec<TextPart> },
    Comment { id: usize, text: String },
}

#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    pub tag: String,
    pub nodes: Vec<TemplateNode>,
    pub has_slots: bool,
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPILER
// ═══════════════════════════════════════════════════════════════════════════════

pub fn compile(nodes: &[NodeData], options: &CompileOptions) -> Result<CompiledTemplate> {
    let mut compiler = Compiler {
        options,
        next_id: 0,
        locals: vec![],
        unknown: 0,
    };
    let compiled = compiler.nodes(nodes)?;
    if compiler.unknown > 0 {
        tracing::debug!(
            component = %options.tag,
            unknown = compiler.unknown,
            "template references unknown identifiers"
        );
    }
    Ok(CompiledTemplate {
        tag: options.tag.clone(),
        nodes: compiled,
        has_slots: contains_slot(nodes),
    })
}

pub fn compile_source(source: &TemplateSource, options: &CompileOptions) -> Result<CompiledTemplate> {
    compile(&source.parse()?, options)
}

struct Compiler<'a> {
    options: &'a CompileOptions,
    next_id: usize,
    locals: Vec<String>,
    unknown: usize,
}

fn directive_error(name: &str, value: &str, message: impl Into<String>) -> EngineError {
    EngineError::parse(ERR_PARSE_DIRECTIVE, message)
        .context(format!("{}=\"{}\"", name, value))
        .hint("Supported directives: *if=\"expr\", *for=\"item of expr; let i = index\"")
}

impl Compiler<'_> {
    fn id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn validate(&mut self, expr: &Expr, source: &str) {
        let mut validator = ScopeValidator::new(&self.options.tag);
        validator.add_locals(self.locals.iter().cloned());
        self.unknown += validator.verify(expr, source);
    }

    /// Event programs also see `$event`.
    fn validate_program(&mut self, program: &Program) {
        let mut validator = ScopeValidator::new(&self.options.tag);
        validator.add_locals(self.locals.iter().cloned());
        validator.add_locals([EVENT_LOCAL.to_string()]);
        self.unknown += validator.verify_program(program);
    }

    fn expression(&mut self, source: &str) -> Result<Expr> {
        let expr = parse_expression(source)?;
        self.validate(&expr, source);
        Ok(expr)
    }

    fn nodes(&mut self, nodes: &[NodeData]) -> Result<Vec<TemplateNode>> {
        let mut out = vec![];
        for node in nodes {
            match node {
                NodeData::Element(el) => out.push(TemplateNode::Element(self.element(el)?)),
                NodeData::Text(text) => {
                    if let Some(node) = self.text(&text.text)? {
                        out.push(node);
                    }
                }
                NodeData::Comment(comment) => out.push(TemplateNode::Comment {
                    id: self.id(),
                    text: comment
                        .text
                        .iter()
                        .map(|segment| match segment {
                            Segment::Literal { text } => text.clone(),
                            Segment::Bound { source, .. } => source.clone(),
                        })
                        .collect(),
                }),
            }
        }
        Ok(out)
    }

    fn text(&mut self, segments: &[Segment]) -> Result<Option<TemplateNode>> {
        let only_literal = segments.iter().all(|s| !s.is_bound());
        let joined: String = segments
            .iter()
            .filter_map(|s| match s {
                Segment::Literal { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if only_literal && (joined.is_empty() || NEWLINE_WHITESPACE_RE.is_match(&joined)) {
            return Ok(None);
        }

        let mut parts = vec![];
        for segment in segments {
            parts.push(match segment {
                Segment::Literal { text } => TextPart::Literal(text.clone()),
                Segment::Bound {
                    source,
                    escaping: Escaping::Escaped,
                } => TextPart::Escaped {
                    source: source.clone(),
                    expr: self.expression(source)?,
                },
                Segment::Bound {
                    source,
                    escaping: Escaping::Raw,
                } => TextPart::Html {
                    source: source.clone(),
                    expr: self.expression(source)?,
                },
            });
        }
        Ok(Some(TemplateNode::Text { id: self.id(), parts }))
    }

    fn element(&mut self, el: &ElementData) -> Result<ElementNode> {
        let id = self.id();
        let depth = self.locals.len();

        // Directives first: their locals are visible to every other binding.
        let mut directives = vec![];
        for attr in el.attributes.values() {
            if let Some(directive) = attr.name.strip_prefix('*') {
                let value = attribute_literal(attr).unwrap_or_default();
                directives.push(self.directive(directive, &attr.name, &value)?);
            }
        }

        let mut attributes = vec![];
        let mut events = vec![];
        for attr in el.attributes.values() {
            let name = attr.name.as_str();
            if name.starts_with('*') {
                continue;
            }
            let raw = || attribute_literal(attr).unwrap_or_default();
            if let Some(inner) = name.strip_prefix("[(").and_then(|n| n.strip_suffix(")]")) {
                let source = raw();
                let target = self.expression(&source)?;
                if !target.is_assignable() {
                    return Err(EngineError::parse(
                        ERR_PARSE_DIRECTIVE,
                        "Two-way bindings need an assignable expression",
                    )
                    .context(format!("{}=\"{}\"", name, source)));
                }
                attributes.push(TemplateAttribute::Property {
                    name: inner.to_string(),
                    source: source.clone(),
                    expr: target.clone(),
                });
                events.push(EventHandler {
                    event_type: format!("{}change", inner.to_lowercase()),
                    program: Rc::new(Program {
                        source: format!("{} = {}", source, EVENT_LOCAL),
                        statements: vec![Expr::Assign {
                            operator: AssignmentOperator::Assign,
                            target: Box::new(target),
                            value: Box::new(Expr::Identifier(EVENT_LOCAL.to_string())),
                        }],
                    }),
                    two_way: true,
                });
            } else if let Some(inner) = name.strip_prefix('[').and_then(|n| n.strip_suffix(']')) {
                let source = raw();
                attributes.push(TemplateAttribute::Property {
                    name: inner.to_string(),
                    expr: self.expression(&source)?,
                    source,
                });
            } else if let Some(inner) = name.strip_prefix('(').and_then(|n| n.strip_suffix(')')) {
                let source = raw();
                let program = parse_program(&source)?;
                self.validate_program(&program);
                events.push(EventHandler {
                    event_type: inner.to_string(),
                    program: Rc::new(program),
                    two_way: false,
                });
            } else if let Some(value) = attribute_literal(attr) {
                attributes.push(TemplateAttribute::Static {
                    name: name.to_string(),
                    value,
                });
            } else {
                let mut parts = vec![];
                for segment in &attr.value {
                    parts.push(match segment {
                        Segment::Literal { text } => AttributePart::Literal(text.clone()),
                        Segment::Bound { source, .. } => AttributePart::Bound {
                            source: source.clone(),
                            expr: self.expression(source)?,
                        },
                    });
                }
                attributes.push(TemplateAttribute::Interpolated {
                    name: name.to_string(),
                    parts,
                });
            }
        }
        if self.options.scoped {
            attributes.push(TemplateAttribute::Static {
                name: CSS_COMPONENT_ID_ATTR.to_string(),
                value: self.options.tag.clone(),
            });
        }

        let children = self.nodes(&el.children)?;
        self.locals.truncate(depth);
        Ok(ElementNode {
            id,
            tag: el.tag.clone(),
            namespace: el.namespace.clone(),
            attributes,
            events,
            directives,
            children,
        })
    }

    fn directive(&mut self, directive: &str, name: &str, value: &str) -> Result<Directive> {
        match directive {
            "if" => Ok(Directive::If {
                source: value.to_string(),
                expr: self.expression(value)?,
            }),
            "for" => {
                let caps = FOR_RE
                    .captures(value)
                    .ok_or_else(|| directive_error(name, value, "Expected `item of iterable`"))?;
                let item = caps[1].to_string();
                let source = caps[2].to_string();
                let iterable = self.expression(&source)?;

                let mut aliases = vec![];
                if let Some(rest) = caps.get(3) {
                    for alias in rest.as_str().split([';', ',']).map(str::trim).filter(|a| !a.is_empty()) {
                        let (name_part, local) = if let Some(c) = LET_ALIAS_RE.captures(alias) {
                            (c[1].to_string(), c[2].to_string())
                        } else if let Some(c) = AS_ALIAS_RE.captures(alias) {
                            (c[2].to_string(), c[1].to_string())
                        } else {
                            return Err(directive_error(name, value, format!("Invalid loop alias `{}`", alias)));
                        };
                        if !LOOP_LOCALS.contains(&local.as_str()) {
                            return Err(directive_error(
                                name,
                                value,
                                format!("Unknown loop local `{}`", local),
                            ));
                        }
                        aliases.push((name_part, local));
                    }
                }

                self.locals.push(item.clone());
                self.locals.extend(LOOP_LOCALS.iter().map(|l| l.to_string()));
                self.locals.extend(aliases.iter().map(|(alias, _)| alias.clone()));
                Ok(Directive::For {
                    item,
                    source,
                    iterable,
                    aliases,
                })
            }
            other => Err(directive_error(
                name,
                value,
                format!("Unknown structural directive `*{}`", other),
            )),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// INSTANCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Template position plus the loop identities leading to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    node: usize,
    part: usize,
    path: Rc<str>,
}

enum Cached {
    Element { vnode: VNode, scope: Rc<RefCell<Scope>> },
    Text(VNode),
    Html { source: String, nodes: Vec<VNode> },
}

/// The per-element executable form of a compiled template.
pub struct TemplateInstance {
    template: Rc<CompiledTemplate>,
    root: VNode,
    cache: RefCell<HashMap<CacheKey, Cached>>,
}

fn bind_value(component: &str, source: &str, expr: &Expr, scope: &Scope) -> Value {
    match evaluate(expr, scope) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                component = component,
                expression = source,
                error = %e.message,
                "binding failed to evaluate"
            );
            Value::Undefined
        }
    }
}

/// Text is kept in source form; the renderer decodes entities.
fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
}

fn iterate(value: Value) -> std::result::Result<Vec<Value>, String> {
    match value {
        Value::Array(items) => Ok(items.as_ref().clone()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        Value::Undefined | Value::Null => Ok(vec![]),
        other => Err(format!("{} is not iterable", other.type_of())),
    }
}

fn loop_local(local: &str, index: usize, count: usize) -> Value {
    match local {
        "index" => Value::from(index),
        "first" => Value::Bool(index == 0),
        "last" => Value::Bool(index + 1 == count),
        "even" => Value::Bool(index % 2 == 0),
        "odd" => Value::Bool(index % 2 == 1),
        "count" => Value::from(count),
        _ => Value::Undefined,
    }
}

/// Builds plain virtual nodes for `{{{ raw }}}` output.
fn static_vnode(node: &NodeData) -> Result<VNode> {
    Ok(match node {
        NodeData::Element(el) => {
            let vnode = VNode::element_ns(&el.tag, el.namespace.as_deref());
            for attr in el.attributes.values() {
                vnode.set_attribute(&attr.name, attribute_literal(attr).unwrap_or_default())?;
            }
            for child in &el.children {
                vnode.append_child(&static_vnode(child)?)?;
            }
            vnode
        }
        NodeData::Text(text) => VNode::text(&escape_text(&serialize_segments(&text.text))),
        NodeData::Comment(text) => VNode::comment(&serialize_segments(&text.text)),
    })
}

impl TemplateInstance {
    pub fn new(template: Rc<CompiledTemplate>) -> Self {
        Self {
            template,
            root: VNode::fragment(),
            cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn template(&self) -> &Rc<CompiledTemplate> {
        &self.template
    }

    /// The fragment whose children are the template's top-level nodes.
    pub fn root(&self) -> &VNode {
        &self.root
    }

    /// Refreshes the virtual tree for `scope`. Controller writes made while
    /// evaluating do not request another render.
    pub fn render(&self, scope: &Scope) -> Result<()> {
        let guard = match scope.this() {
            Value::Controller(handle) => Some((handle.clone(), handle.set_rendering(true))),
            _ => None,
        };
        let result = self.render_inner(scope);
        if let Some((handle, previous)) = guard {
            handle.set_rendering(previous);
        }
        result
    }

    fn render_inner(&self, scope: &Scope) -> Result<()> {
        let mut used = HashSet::new();
        let root_path: Rc<str> = Rc::from("");
        let children = self.render_nodes(&self.template.nodes, scope, &root_path, &mut used)?;
        self.root.remove_all_children();
        self.root.append_children(&children)?;
        self.cache.borrow_mut().retain(|key, _| used.contains(key));
        Ok(())
    }

    fn render_nodes(
        &self,
        nodes: &[TemplateNode],
        scope: &Scope,
        path: &Rc<str>,
        used: &mut HashSet<CacheKey>,
    ) -> Result<Vec<VNode>> {
        let mut out = vec![];
        for node in nodes {
            match node {
                TemplateNode::Element(el) => self.expand(el, 0, scope, path, used, &mut out)?,
                TemplateNode::Text { id, parts } => self.render_text(*id, parts, scope, path, used, &mut out)?,
                TemplateNode::Comment { id, text } => {
                    let key = CacheKey {
                        node: *id,
                        part: 0,
                        path: path.clone(),
                    };
                    let vnode = self.cached_leaf(&key, || VNode::comment(text));
                    used.insert(key);
                    out.push(vnode);
                }
            }
        }
        Ok(out)
    }

    fn cached_leaf(&self, key: &CacheKey, create: impl FnOnce() -> VNode) -> VNode {
        let mut cache = self.cache.borrow_mut();
        match cache.get(key) {
            Some(Cached::Text(vnode)) => vnode.clone(),
            _ => {
                let vnode = create();
                cache.insert(key.clone(), Cached::Text(vnode.clone()));
                vnode
            }
        }
    }

    fn expand(
        &self,
        el: &ElementNode,
        directive: usize,
        scope: &Scope,
        path: &Rc<str>,
        used: &mut HashSet<CacheKey>,
        out: &mut Vec<VNode>,
    ) -> Result<()> {
        let tag = &self.template.tag;
        match el.directives.get(directive) {
            None => {
                out.push(self.render_element(el, scope, path, used)?);
                Ok(())
            }
            Some(Directive::If { source, expr }) => {
                if bind_value(tag, source, expr, scope).is_truthy() {
                    self.expand(el, directive + 1, scope, path, used, out)?;
                }
                Ok(())
            }
            Some(Directive::For {
                item,
                source,
                iterable,
                aliases,
            }) => {
                let items = match iterate(bind_value(tag, source, iterable, scope)) {
                    Ok(items) => items,
                    Err(message) => {
                        tracing::warn!(component = %tag, expression = %source, error = %message, "*for over a non-iterable");
                        vec![]
                    }
                };
                let count = items.len();
                let mut occurrences: HashMap<String, usize> = HashMap::new();
                for (index, value) in items.into_iter().enumerate() {
                    let identity = value.identity_key();
                    let seen = occurrences.entry(identity.clone()).or_insert(0);
                    let item_path: Rc<str> = Rc::from(format!("{}/{}.{}:{}#{}", path, el.id, directive, identity, seen));
                    *seen += 1;

                    let mut locals: Vec<(String, Value)> = vec![(item.clone(), value)];
                    locals.extend(LOOP_LOCALS.iter().map(|l| (l.to_string(), loop_local(l, index, count))));
                    locals.extend(
                        aliases
                            .iter()
                            .map(|(alias, local)| (alias.clone(), loop_local(local, index, count))),
                    );
                    let item_scope = scope.with_locals(locals);
                    self.expand(el, directive + 1, &item_scope, &item_path, used, out)?;
                }
                Ok(())
            }
        }
    }

    fn render_element(
        &self,
        el: &ElementNode,
        scope: &Scope,
        path: &Rc<str>,
        used: &mut HashSet<CacheKey>,
    ) -> Result<VNode> {
        let key = CacheKey {
            node: el.id,
            part: 0,
            path: path.clone(),
        };
        let cached = match self.cache.borrow().get(&key) {
            Some(Cached::Element { vnode, scope }) => Some((vnode.clone(), scope.clone())),
            _ => None,
        };
        let vnode = match cached {
            Some((vnode, cell)) => {
                *cell.borrow_mut() = scope.clone();
                vnode
            }
            None => {
                let vnode = VNode::element_ns(&el.tag, el.namespace.as_deref());
                let cell = Rc::new(RefCell::new(scope.clone()));
                for handler in &el.events {
                    vnode.add_event_listener(&handler.event_type, &self.listener(handler, cell.clone()))?;
                }
                self.cache.borrow_mut().insert(
                    key.clone(),
                    Cached::Element {
                        vnode: vnode.clone(),
                        scope: cell,
                    },
                );
                vnode
            }
        };
        used.insert(key);

        let tag = &self.template.tag;
        let mut present = HashSet::new();
        for attr in &el.attributes {
            let value = match attr {
                TemplateAttribute::Static { value, .. } => Value::String(value.clone()),
                TemplateAttribute::Interpolated { parts, .. } => Value::String(
                    parts
                        .iter()
                        .map(|part| match part {
                            AttributePart::Literal(text) => text.clone(),
                            AttributePart::Bound { source, expr } => bind_value(tag, source, expr, scope).to_display(),
                        })
                        .collect(),
                ),
                TemplateAttribute::Property { source, expr, .. } => bind_value(tag, source, expr, scope),
            };
            present.insert(attr.name().to_string());
            vnode.set_attribute(attr.name(), value)?;
        }
        for name in vnode.attributes().keys() {
            if !present.contains(name) {
                vnode.remove_attribute(name)?;
            }
        }

        let child_path: Rc<str> = Rc::from(format!("{}/{}", path, el.id));
        let children = self.render_nodes(&el.children, scope, &child_path, used)?;
        vnode.remove_all_children();
        vnode.append_children(&children)?;
        Ok(vnode)
    }

    fn listener(&self, handler: &EventHandler, scope: Rc<RefCell<Scope>>) -> Listener {
        let program = handler.program.clone();
        let two_way = handler.two_way;
        let tag = self.template.tag.clone();
        Listener::new(move |event: &Rc<Event>| {
            let payload = if two_way && event.is_custom() {
                event.detail().clone()
            } else {
                Value::Event(event.clone())
            };
            let scope = scope.borrow().with_local(EVENT_LOCAL, payload);
            if let Err(e) = execute(&program, &scope) {
                tracing::warn!(
                    component = %tag,
                    statement = %program.source,
                    error = %e.message,
                    "event binding failed"
                );
            }
        })
    }

    fn render_text(
        &self,
        id: usize,
        parts: &[TextPart],
        scope: &Scope,
        path: &Rc<str>,
        used: &mut HashSet<CacheKey>,
        out: &mut Vec<VNode>,
    ) -> Result<()> {
        let tag = &self.template.tag;
        let mut pending: Option<(usize, String)> = None;
        let flush = |pending: &mut Option<(usize, String)>, used: &mut HashSet<CacheKey>, out: &mut Vec<VNode>| -> Result<()> {
            if let Some((part, text)) = pending.take() {
                let key = CacheKey {
                    node: id,
                    part,
                    path: path.clone(),
                };
                let vnode = self.cached_leaf(&key, || VNode::text(""));
                vnode.set_text(&escape_text(&text))?;
                used.insert(key);
                out.push(vnode);
            }
            Ok(())
        };

        for (index, part) in parts.iter().enumerate() {
            match part {
                TextPart::Literal(text) => pending.get_or_insert_with(|| (index, String::new())).1.push_str(text),
                TextPart::Escaped { source, expr } => {
                    let value = bind_value(tag, source, expr, scope).to_display();
                    pending.get_or_insert_with(|| (index, String::new())).1.push_str(&value);
                }
                TextPart::Html { source, expr } => {
                    flush(&mut pending, used, out)?;
                    let html = bind_value(tag, source, expr, scope).to_display();
                    let key = CacheKey {
                        node: id,
                        part: index,
                        path: path.clone(),
                    };
                    out.extend(self.render_html(&key, html)?);
                    used.insert(key);
                }
            }
        }
        flush(&mut pending, used, out)
    }

    fn render_html(&self, key: &CacheKey, html: String) -> Result<Vec<VNode>> {
        if let Some(Cached::Html { source, nodes }) = self.cache.borrow().get(key) {
            if *source == html {
                return Ok(nodes.clone());
            }
        }
        let nodes = match parse_static_html(&html) {
            Ok(data) => data.iter().map(static_vnode).collect::<Result<Vec<_>>>()?,
            Err(e) => {
                tracing::warn!(component = %self.template.tag, error = %e, "raw HTML binding could not be parsed");
                vec![]
            }
        };
        self.cache.borrow_mut().insert(
            key.clone(),
            Cached::Html {
                source: html,
                nodes: nodes.clone(),
            },
        );
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{ControllerHandle, ObjectController};
    use crate::error::ErrorKind;

    fn instance(html: &str, scoped: bool) -> TemplateInstance {
        let template = compile_source(&TemplateSource::from(html), &CompileOptions::new("nl-test", scoped)).unwrap();
        TemplateInstance::new(Rc::new(template))
    }

    fn scope_with(fields: Vec<(&str, Value)>) -> Scope {
        let mut controller = ObjectController::new();
        for (name, value) in fields {
            controller = controller.field(name, value);
        }
        Scope::new(Value::Controller(ControllerHandle::new(controller, vec![])))
    }

    #[test]
    fn test_text_and_cid() {
        let inst = instance("<span>Hi {{this.name}}</span>", true);
        inst.render(&scope_with(vec![("name", Value::from("A"))])).unwrap();
        assert_eq!(inst.root().to_html(), r#"<span nlib-cid="nl-test">Hi A</span>"#);
    }

    #[test]
    fn test_if_and_for() {
        let inst = instance(
            r#"<ul><li *for="x of this.items; let i = index" *if="x !== 2">{{i}}:{{x}}</li></ul>"#,
            false,
        );
        let items = Value::array(vec![Value::from(1), Value::from(2), Value::from(3)]);
        inst.render(&scope_with(vec![("items", items)])).unwrap();
        assert_eq!(inst.root().to_html(), "<ul><li>0:1</li><li>2:3</li></ul>");
    }

    #[test]
    fn test_loop_items_keep_identity() {
        let inst = instance(r#"<p *for="x of this.items">{{x}}</p>"#, false);
        let scope = scope_with(vec![(
            "items",
            Value::array(vec![Value::from(1), Value::from(2), Value::from(3)]),
        )]);
        inst.render(&scope).unwrap();
        let before = inst.root().child_nodes();

        let Value::Controller(handle) = scope.this().clone() else { unreachable!() };
        handle
            .set("items", Value::array(vec![Value::from(1), Value::from(3)]))
            .unwrap();
        inst.render(&scope).unwrap();
        let after = inst.root().child_nodes();
        assert_eq!(after.len(), 2);
        assert!(after[0].ptr_eq(&before[0]));
        assert!(after[1].ptr_eq(&before[2]));
    }

    #[test]
    fn test_bind_errors_are_local() {
        let inst = instance(r#"<b title="{{missing.x}}">{{this.a}}{{nope}}</b>"#, false);
        inst.render(&scope_with(vec![("a", Value::from("ok"))])).unwrap();
        assert_eq!(inst.root().to_html(), r#"<b title="">ok</b>"#);
    }

    #[test]
    fn test_raw_html() {
        let inst = instance("<div>{{{this.html}}}</div>", true);
        inst.render(&scope_with(vec![("html", Value::from("<i>x</i> y"))])).unwrap();
        assert_eq!(inst.root().to_html(), r#"<div nlib-cid="nl-test"><i>x</i> y</div>"#);
    }

    #[test]
    fn test_property_binding_keeps_value() {
        let inst = instance(r#"<input [disabled]="this.off">"#, false);
        inst.render(&scope_with(vec![("off", Value::Bool(true))])).unwrap();
        let input = inst.root().first_child().unwrap();
        assert_eq!(input.get_attribute("disabled"), Some(Value::Bool(true)));
    }

    #[test]
    fn test_unknown_directive() {
        let err = compile_source(
            &TemplateSource::from(r#"<div *switch="x"></div>"#),
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert_eq!(err.code, ERR_PARSE_DIRECTIVE);
    }

    #[test]
    fn test_bad_for_alias() {
        let err = compile_source(
            &TemplateSource::from(r#"<div *for="x of this.items; let i = position"></div>"#),
            &CompileOptions::default(),
        )
        .unwrap_err();
        assert_eq!(err.code, ERR_PARSE_DIRECTIVE);
    }

    #[test]
    fn test_has_slots() {
        let template = compile_source(
            &TemplateSource::from("<div><slot name=\"a\"></slot></div>"),
            &CompileOptions::default(),
        )
        .unwrap();
        assert!(template.has_slots);
    }
}
