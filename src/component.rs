//! Component Module for the nlib rendering engine
//!
//! Registration compiles a component's template and style once and defines a
//! custom element for its tag. Every element instance owns a controller
//! handle and a template instance, renders synchronously on connect and
//! re-renders through the shared queue whenever the controller changes.

use indexmap::IndexMap;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::cache::TemplateCache;
use crate::config::EngineOptions;
use crate::controller::{
    AttributeBinding, Controller, ControllerHandle, EventBinding, EventTarget, InitContext, OutputBinding,
    Stoppable,
};
use crate::css::{scope_stylesheet, StyleSheet, CSS_COMPONENT_ID_ATTR, CSS_HOST_ID_ATTR};
use crate::dom::{
    CustomElement, Dom, ElementDefinition, Listener, MutationObserverInit, MutationRecord, NodeId, NodeType,
    ShadowRootMode, WeakDom,
};
use crate::error::{EngineError, Result, ERR_NAMING_NO_DASH};
use crate::eval::Scope;
use crate::parse::NodeData;
use crate::queue::{self, Task};
use crate::render::{dom_node_of, render_into, set_anchor, RenderOptions};
use crate::template::{CompileOptions, CompiledTemplate, TemplateInstance, TemplateSource};
use crate::value::{parse_by_type, parse_string, serialize_attribute, Value};
use crate::vnode::{NodeKind, VNode};

pub const SLOT_ATTR: &str = "slot";
pub const DATA_SLOT_ATTR: &str = "data-slot";
const SLOT_PLACEHOLDER: &str = "slot placeholder";

pub type ControllerFactory = Rc<dyn Fn() -> Box<dyn Controller>>;

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct ComponentConfig {
    pub tag: String,
    pub html: Option<TemplateSource>,
    pub style: Option<String>,
    /// `Some` renders into a shadow root of that mode.
    pub shadow_mode: Option<ShadowRootMode>,
    pub attributes: Vec<AttributeBinding>,
    pub events: Vec<EventBinding>,
    pub outputs: Vec<OutputBinding>,
    pub controller: ControllerFactory,
}

impl ComponentConfig {
    pub fn new<C: Controller>(tag: &str, controller: impl Fn() -> C + 'static) -> Self {
        Self {
            tag: tag.to_string(),
            html: None,
            style: None,
            shadow_mode: None,
            attributes: vec![],
            events: vec![],
            outputs: vec![],
            controller: Rc::new(move || Box::new(controller()) as Box<dyn Controller>),
        }
    }

    pub fn html(mut self, html: &str) -> Self {
        self.html = Some(TemplateSource::Html(html.to_string()));
        self
    }

    /// Precompiled node-data, e.g. from `parse_template` at build time.
    pub fn nodes(mut self, nodes: Vec<NodeData>) -> Self {
        self.html = Some(TemplateSource::Nodes(nodes));
        self
    }

    pub fn style(mut self, css: &str) -> Self {
        self.style = Some(css.to_string());
        self
    }

    pub fn shadow(mut self, mode: ShadowRootMode) -> Self {
        self.shadow_mode = Some(mode);
        self
    }

    pub fn attribute(mut self, binding: AttributeBinding) -> Self {
        self.attributes.push(binding);
        self
    }

    pub fn bind_event(mut self, binding: EventBinding) -> Self {
        self.events.push(binding);
        self
    }

    pub fn output(mut self, binding: OutputBinding) -> Self {
        self.outputs.push(binding);
        self
    }
}

/// Everything an element instance needs from its registration.
struct ComponentInfo {
    tag: String,
    template: Option<Rc<CompiledTemplate>>,
    sheet: Option<Rc<StyleSheet>>,
    shadow_mode: Option<ShadowRootMode>,
    attributes: Vec<AttributeBinding>,
    events: Vec<EventBinding>,
    outputs: Vec<OutputBinding>,
    controller: ControllerFactory,
}

impl ComponentInfo {
    fn has_slots(&self) -> bool {
        self.shadow_mode.is_none() && self.template.as_ref().map_or(false, |t| t.has_slots)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REGISTRATION
// ═══════════════════════════════════════════════════════════════════════════════

pub fn validate_tag(tag: &str) -> Result<()> {
    if !tag.contains('-') {
        return Err(EngineError::naming(
            ERR_NAMING_NO_DASH,
            format!("Custom components need to have a dash included in their name. Found: {}", tag),
        )
        .hint("https://html.spec.whatwg.org/multipage/custom-elements.html#valid-custom-element-name"));
    }
    Ok(())
}

/// Compiles `config` and defines its element on `dom`.
pub fn register(dom: &Dom, config: ComponentConfig, options: &EngineOptions) -> Result<Rc<ComponentDefinition>> {
    let tag = config.tag.to_lowercase();
    validate_tag(&tag)?;
    let scoped = config.shadow_mode.is_none();

    let template = match &config.html {
        Some(source) => Some(TemplateCache::get_or_compile(source, &CompileOptions::new(&tag, scoped))?),
        None => None,
    };

    let style = match &config.style {
        Some(css) if scoped => Some(scope_stylesheet(css, &tag)?),
        Some(css) => Some(css.clone()),
        None => None,
    };
    let sheet = style.map(|css| Rc::new(StyleSheet::new(css)));
    if let (true, Some(sheet)) = (scoped, &sheet) {
        inject_global_style(dom, options, &tag, &sheet.css)?;
    }

    let definition = Rc::new(ComponentDefinition {
        info: Rc::new(ComponentInfo {
            tag: tag.clone(),
            template,
            sheet,
            shadow_mode: config.shadow_mode,
            attributes: config.attributes,
            events: config.events,
            outputs: config.outputs,
            controller: config.controller,
        }),
    });
    dom.define(&tag, definition.clone())?;
    tracing::debug!(component = %tag, shadow = !scoped, "component registered");
    Ok(definition)
}

/// Inserts `<style id="<library>-element-<tag>">` after the library's head
/// comment, creating the comment on first use.
fn inject_global_style(dom: &Dom, options: &EngineOptions, tag: &str, css: &str) -> Result<()> {
    let head = dom.head();
    let comment = dom
        .children(head)
        .into_iter()
        .find(|node| {
            dom.node_type(*node) == NodeType::Comment
                && dom.node_value(*node).as_deref() == Some(options.style_comment.as_str())
        });
    let comment = match comment {
        Some(comment) => comment,
        None => {
            let comment = dom.create_comment(&options.style_comment);
            dom.append_child(head, comment)?;
            comment
        }
    };

    let style = dom.create_element("style");
    dom.set_attribute(style, "id", &options.style_element_id(tag));
    let text = dom.create_text_node(css);
    dom.append_child(style, text)?;
    dom.insert_before(head, style, dom.next_sibling(comment))
}

/// The registry entry for a component tag.
pub struct ComponentDefinition {
    info: Rc<ComponentInfo>,
}

impl std::fmt::Debug for ComponentDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentDefinition").field("tag", &self.info.tag).finish_non_exhaustive()
    }
}

impl ComponentDefinition {
    pub fn tag(&self) -> &str {
        &self.info.tag
    }

    pub fn template(&self) -> Option<&Rc<CompiledTemplate>> {
        self.info.template.as_ref()
    }

    pub fn style_sheet(&self) -> Option<&Rc<StyleSheet>> {
        self.info.sheet.as_ref()
    }

    /// True if `definition` was registered through [`register`].
    pub fn is_component(definition: &Rc<dyn ElementDefinition>) -> bool {
        definition.as_any().downcast_ref::<ComponentDefinition>().is_some()
    }
}

impl ElementDefinition for ComponentDefinition {
    fn observed_attributes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.info.attributes.iter().map(|a| a.attribute.clone()).collect();
        names.dedup();
        names
    }

    fn construct(&self, dom: &Dom, node: NodeId) -> Rc<dyn CustomElement> {
        ComponentElement::create(self.info.clone(), dom, node)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ELEMENT
// ═══════════════════════════════════════════════════════════════════════════════

struct SlotReplacement {
    placeholder: NodeId,
    elements: Vec<NodeId>,
}

#[derive(Default)]
struct ElementState {
    instance: Option<Rc<TemplateInstance>>,
    stoppables: Vec<Stoppable>,
    listeners_registered: bool,
    connected: bool,
    slots_by_name: IndexMap<String, Vec<VNode>>,
    replacements: IndexMap<String, SlotReplacement>,
}

/// A connected instance of a registered component.
pub struct ComponentElement {
    this: Weak<ComponentElement>,
    info: Rc<ComponentInfo>,
    dom: WeakDom,
    node: NodeId,
    handle: ControllerHandle,
    shadow_root: Option<NodeId>,
    task: Task,
    skip_attribute_callback: Cell<bool>,
    state: RefCell<ElementState>,
}

impl ComponentElement {
    fn create(info: Rc<ComponentInfo>, dom: &Dom, node: NodeId) -> Rc<Self> {
        let handle = ControllerHandle::from_boxed((info.controller)(), info.outputs.iter().cloned());
        handle.set_host(Some(dom.element_ref(node)));

        let shadow_root = info.shadow_mode.and_then(|mode| match dom.attach_shadow(node, mode) {
            Ok(root) => {
                if let Some(sheet) = &info.sheet {
                    dom.adopt_style_sheet(root, sheet.clone());
                }
                Some(root)
            }
            Err(e) => {
                tracing::error!(component = %info.tag, error = %e, "could not attach a shadow root");
                None
            }
        });

        let element = Rc::new_cyclic(|weak: &Weak<ComponentElement>| {
            let queued = weak.clone();
            let task: Task = Rc::new(move || {
                if let Some(element) = queued.upgrade() {
                    element.render_queued();
                }
            });
            ComponentElement {
                this: weak.clone(),
                info,
                dom: dom.downgrade(),
                node,
                handle,
                shadow_root,
                task,
                skip_attribute_callback: Cell::new(false),
                state: RefCell::new(ElementState::default()),
            }
        });

        let weak = Rc::downgrade(&element);
        element.handle.set_on_change(Some(Rc::new(move || {
            if let Some(element) = weak.upgrade() {
                let _ = element.mark_changed();
            }
        })));
        element
    }

    pub fn controller(&self) -> &ControllerHandle {
        &self.handle
    }

    pub fn tag(&self) -> &str {
        &self.info.tag
    }

    pub fn shadow_root(&self) -> Option<NodeId> {
        self.shadow_root
    }

    /// Where the template renders: the shadow root, or the host itself.
    pub fn render_root(&self) -> NodeId {
        self.shadow_root.unwrap_or(self.node)
    }

    pub fn template_root(&self) -> Option<VNode> {
        self.state.borrow().instance.as_ref().map(|i| i.root().clone())
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().connected
    }

    /// Schedules a re-render for the next drain.
    pub fn mark_changed(&self) -> Option<queue::Drained> {
        let ready = {
            let state = self.state.borrow();
            state.connected && state.instance.is_some()
        };
        ready.then(|| queue::add(&self.task))
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Attributes
    // ───────────────────────────────────────────────────────────────────────────

    /// Returns whether any attribute binding listens to `name`.
    fn set_controller_from_attribute(&self, name: &str, value: &Value) -> bool {
        let name = name.to_lowercase();
        let mut listening = false;
        for binding in self.info.attributes.iter().filter(|b| b.attribute == name) {
            listening = true;
            let parsed = parse_by_type(binding.data_type, value);
            self.handle.set_from_attribute(&binding.property, parsed);
        }
        listening
    }

    /// Property-channel write from a parent template (`[name]="expr"`).
    /// The value reaches the controller; it is reflected onto the host
    /// attribute when that attribute exists or `name` is not a bound attribute.
    pub fn set_input(&self, dom: &Dom, node: NodeId, name: &str, value: Value) {
        let listening = self.set_controller_from_attribute(name, &value);
        if listening {
            self.skip_attribute_callback.set(true);
        }
        if dom.has_attribute(node, name) || !listening {
            match serialize_attribute(&value) {
                Some(text) => dom.set_attribute(node, name, &text),
                None => dom.remove_attribute(node, name),
            }
        }
        self.skip_attribute_callback.set(false);
    }

    fn read_all_attributes(&self, dom: &Dom) {
        for name in dom.attribute_names(self.node) {
            let value = Value::from(dom.get_attribute(self.node, &name).as_deref());
            self.set_controller_from_attribute(&name, &value);
        }
    }

    fn update_closest(&self, dom: &Dom, name: &str) {
        let value = dom
            .closest_with_attribute(self.node, name)
            .and_then(|node| dom.get_attribute(node, name));
        self.set_controller_from_attribute(name, &Value::from(value.as_deref()));
    }

    fn listen_for_closest(self: &Rc<Self>, dom: &Dom) {
        let names: Vec<String> = self
            .info
            .attributes
            .iter()
            .filter(|a| a.closest)
            .map(|a| a.attribute.clone())
            .collect();
        if names.is_empty() {
            return;
        }

        let weak = Rc::downgrade(self);
        let observer = dom.create_observer(move |dom, records| {
            let Some(element) = weak.upgrade() else { return };
            for record in records {
                if let MutationRecord::Attributes { name, .. } = record {
                    element.update_closest(dom, name);
                }
            }
        });
        let teardown = dom.downgrade();
        self.add_stoppable(Stoppable::new(move || {
            if let Some(dom) = teardown.upgrade() {
                dom.disconnect_observer(observer);
            }
        }));

        let ancestors = dom.ancestors(self.node).into_iter().filter(|n| dom.is_element(*n));
        for node in std::iter::once(self.node).chain(ancestors) {
            dom.observe(
                observer,
                node,
                MutationObserverInit {
                    attributes: true,
                    attribute_filter: Some(names.clone()),
                    ..Default::default()
                },
            );
        }
        for name in &names {
            self.update_closest(dom, name);
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Lifetimes and listeners
    // ───────────────────────────────────────────────────────────────────────────

    fn add_stoppable(&self, stoppable: Stoppable) {
        if !self.is_connected() {
            stoppable.stop();
            return;
        }
        self.state.borrow_mut().stoppables.push(stoppable);
    }

    fn register_event_listeners(&self, dom: &Dom) {
        if std::mem::replace(&mut self.state.borrow_mut().listeners_registered, true) {
            return;
        }
        for binding in &self.info.events {
            let (target, event_type) = binding.target();
            let target = match target {
                EventTarget::Window => dom.window(),
                EventTarget::Document => dom.document(),
                EventTarget::Body => dom.body(),
                EventTarget::Host => self.render_root(),
            };
            let handle = self.handle.clone();
            let method = binding.method.clone();
            let tag = self.info.tag.clone();
            let listener = Listener::new(move |event| {
                if let Err(e) = handle.call(&method, &[Value::Event(event.clone())]) {
                    tracing::warn!(component = %tag, method = %method, error = %e, "event binding failed");
                }
            });
            dom.add_event_listener(target, event_type, &listener);

            let teardown = dom.downgrade();
            let event_type = event_type.to_string();
            self.add_stoppable(Stoppable::new(move || {
                if let Some(dom) = teardown.upgrade() {
                    dom.remove_event_listener(target, &event_type, &listener);
                }
            }));
        }
    }

    fn observe_slots(self: &Rc<Self>, dom: &Dom) {
        let weak = Rc::downgrade(self);
        let observer = dom.create_observer(move |dom, records| {
            let Some(element) = weak.upgrade() else { return };
            let slot_related = |node: &NodeId| {
                dom.is_element(*node) && (dom.has_attribute(*node, SLOT_ATTR) || dom.has_attribute(*node, DATA_SLOT_ATTR))
            };
            let relevant = records.iter().any(|record| match record {
                MutationRecord::ChildList { added, removed, .. } => {
                    added.iter().any(slot_related) || removed.iter().any(slot_related)
                }
                MutationRecord::Attributes { .. } => true,
            });
            if relevant {
                element.apply_slots(dom);
            }
        });
        dom.observe(
            observer,
            self.node,
            MutationObserverInit {
                child_list: true,
                attributes: true,
                subtree: true,
                attribute_filter: Some(vec![SLOT_ATTR.to_string(), DATA_SLOT_ATTR.to_string()]),
            },
        );
        let teardown = dom.downgrade();
        self.add_stoppable(Stoppable::new(move || {
            if let Some(dom) = teardown.upgrade() {
                dom.disconnect_observer(observer);
            }
        }));
    }

    fn init_context(self: &Rc<Self>, dom: &Dom) -> InitContext {
        let changed = Rc::downgrade(self);
        let stoppables = Rc::downgrade(self);
        InitContext::new(
            dom.clone(),
            self.render_root(),
            Rc::new(move || {
                if let Some(element) = changed.upgrade() {
                    let _ = element.mark_changed();
                }
            }),
            Rc::new(move |stoppable| match stoppables.upgrade() {
                Some(element) => element.add_stoppable(stoppable),
                None => stoppable.stop(),
            }),
        )
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Rendering
    // ───────────────────────────────────────────────────────────────────────────

    fn render(&self, dom: &Dom, options: RenderOptions) {
        let instance = {
            let mut state = self.state.borrow_mut();
            match (&state.instance, &self.info.template) {
                (Some(instance), _) => instance.clone(),
                (None, Some(template)) => {
                    let instance = Rc::new(TemplateInstance::new(template.clone()));
                    state.instance = Some(instance.clone());
                    instance
                }
                (None, None) => return,
            }
        };

        let scope = Scope::new(Value::Controller(self.handle.clone()));
        if let Err(e) = instance.render(&scope) {
            tracing::error!(component = %self.info.tag, error = %e, "template render failed");
            return;
        }
        if let Err(e) = render_into(dom, self.render_root(), instance.root(), options) {
            tracing::error!(component = %self.info.tag, error = %e, "could not render into the host");
            return;
        }
        if self.info.has_slots() {
            self.find_slots(instance.root());
            self.apply_slots(dom);
        }
    }

    /// Runs from the render queue. The queue is already draining, so the
    /// diff is applied inline.
    fn render_queued(&self) {
        let Some(dom) = self.dom.upgrade() else { return };
        if self.is_connected() {
            self.render(&dom, RenderOptions::DEEP_SYNC);
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Slots
    // ───────────────────────────────────────────────────────────────────────────

    fn find_slots(&self, root: &VNode) {
        let mut state = self.state.borrow_mut();
        state.slots_by_name.retain(|_, slots| {
            slots.retain(|slot| root.contains(slot));
            !slots.is_empty()
        });

        let mut pending = vec![root.clone()];
        while let Some(node) = pending.pop() {
            if node.kind() == NodeKind::Element && node.tag() == "slot" {
                let name = node
                    .get_attribute("name")
                    .map(|v| parse_string(&v).to_display())
                    .unwrap_or_default();
                let slots = state.slots_by_name.entry(name).or_default();
                if !slots.iter().any(|s| s.ptr_eq(&node)) {
                    slots.push(node.clone());
                }
            }
            let mut children = node.child_nodes();
            children.reverse();
            pending.extend(children);
        }
    }

    fn slot_name_of(dom: &Dom, node: NodeId) -> Option<String> {
        dom.get_attribute(node, SLOT_ATTR)
            .or_else(|| dom.get_attribute(node, DATA_SLOT_ATTR))
    }

    fn rendered_slot_vnode(&self, name: &str) -> Option<VNode> {
        self.state
            .borrow()
            .slots_by_name
            .get(name)
            .and_then(|slots| slots.iter().find(|slot| dom_node_of(slot).is_some()).cloned())
    }

    fn rendered_slot(&self, name: &str) -> Option<NodeId> {
        self.rendered_slot_vnode(name).as_ref().and_then(dom_node_of)
    }

    /// Moves host children marked `slot="x"` / `data-slot="x"` to the slot
    /// named `x`, leaving a placeholder comment so the slot can come back
    /// once its replacements are gone.
    fn apply_slots(&self, dom: &Dom) {
        let host = self.node;
        let tag = self.info.tag.clone();
        let slot_names: Vec<String> = self.state.borrow().slots_by_name.keys().cloned().collect();

        let mut replacements_by_name: IndexMap<String, Vec<NodeId>> = IndexMap::new();
        for name in &slot_names {
            let candidates = dom
                .element_children(host)
                .into_iter()
                .filter(|child| {
                    (dom.get_attribute(*child, SLOT_ATTR).as_deref() == Some(name.as_str())
                        || dom.get_attribute(*child, DATA_SLOT_ATTR).as_deref() == Some(name.as_str()))
                        && dom.get_attribute(*child, CSS_COMPONENT_ID_ATTR).as_deref() != Some(tag.as_str())
                })
                .collect();
            replacements_by_name.insert(name.clone(), candidates);
        }

        // Replacements that moved to another slot or lost their slot name.
        let mut orphans = vec![];
        {
            let mut state = self.state.borrow_mut();
            let ElementState {
                replacements,
                slots_by_name,
                ..
            } = &mut *state;
            for (name, replacement) in replacements.iter_mut() {
                let mut kept = vec![];
                for element in replacement.elements.drain(..) {
                    match Self::slot_name_of(dom, element) {
                        Some(current) if current == *name && slots_by_name.contains_key(name) => kept.push(element),
                        Some(current) => replacements_by_name.entry(current).or_default().push(element),
                        None => orphans.push(element),
                    }
                }
                replacement.elements = kept;
            }
        }

        for name in &slot_names {
            let Some(slot) = self.rendered_slot(name) else { continue };
            let mut incoming = replacements_by_name.get(name).cloned().unwrap_or_default();

            let existing = {
                let mut state = self.state.borrow_mut();
                state.replacements.get_mut(name).map(|replacement| {
                    replacement.elements.retain(|e| dom.contains(host, *e));
                    incoming.retain(|e| !replacement.elements.contains(e));
                    replacement.elements.extend(incoming.iter().copied());
                    (replacement.placeholder, !replacement.elements.is_empty())
                })
            };
            let (reference, has_replacements) = match existing {
                Some(found) => found,
                None if !incoming.is_empty() => {
                    let placeholder = dom.create_comment(SLOT_PLACEHOLDER);
                    if let Some(parent) = dom.parent(slot) {
                        if let Err(e) = dom.insert_before(parent, placeholder, Some(slot)) {
                            tracing::warn!(component = %tag, error = %e, "could not place slot placeholder");
                            continue;
                        }
                    }
                    self.state.borrow_mut().replacements.insert(
                        name.clone(),
                        SlotReplacement {
                            placeholder,
                            elements: incoming.clone(),
                        },
                    );
                    (placeholder, true)
                }
                None => (slot, false),
            };

            if let Some(parent) = dom.parent(reference) {
                for element in incoming.iter().rev() {
                    dom.remove(*element);
                    if let Err(e) = dom.insert_before(parent, *element, Some(reference)) {
                        tracing::warn!(component = %tag, slot = %name, error = %e, "could not move slot replacement");
                    }
                }
            }

            let slot_in_dom = dom.contains(host, slot);
            if slot_in_dom && has_replacements {
                dom.remove(slot);
                tracing::debug!(component = %tag, slot = %name, "slot replaced");
            } else if !slot_in_dom && !has_replacements {
                let restored = self.state.borrow_mut().replacements.shift_remove(name);
                if let Some(replacement) = restored {
                    if let Some(parent) = dom.parent(replacement.placeholder) {
                        if let Err(e) = dom.insert_before(parent, slot, Some(replacement.placeholder)) {
                            tracing::warn!(component = %tag, slot = %name, error = %e, "could not restore slot");
                        }
                    }
                    dom.remove(replacement.placeholder);
                    tracing::debug!(component = %tag, slot = %name, "slot restored");
                }
            }

            // Template siblings rendered later go in front of the slotted
            // content instead of the detached slot.
            let anchor = self
                .state
                .borrow()
                .replacements
                .get(name)
                .map(|r| r.elements.first().copied().unwrap_or(r.placeholder));
            if let Some(vnode) = self.rendered_slot_vnode(name) {
                set_anchor(&vnode, anchor);
            }
        }

        // Elements naming a slot this template does not render go back to
        // the host.
        let mut unsupported = orphans;
        for (name, elements) in &replacements_by_name {
            if self.rendered_slot(name).is_none() {
                unsupported.extend(elements.iter().copied());
            }
        }
        for element in unsupported {
            if dom.parent(element) != Some(host) {
                dom.remove(element);
                if let Err(e) = dom.append_child(host, element) {
                    tracing::warn!(component = %tag, error = %e, "could not return slot replacement to host");
                }
            }
        }
    }

    fn connect(self: &Rc<Self>, dom: &Dom) {
        self.state.borrow_mut().connected = true;
        if self.shadow_root.is_none() {
            dom.set_attribute(self.node, CSS_HOST_ID_ATTR, &self.info.tag);
        }
        self.read_all_attributes(dom);
        self.listen_for_closest(dom);
        if self.info.has_slots() {
            self.observe_slots(dom);
        }

        self.render(dom, RenderOptions::DEEP_SYNC);
        self.register_event_listeners(dom);

        if let Some(hook) = self.handle.on_init_hook() {
            hook(&self.handle, self.init_context(dom));
        }
    }
}

impl CustomElement for ComponentElement {
    fn connected(&self, dom: &Dom, _node: NodeId) {
        if let Some(this) = self.this.upgrade() {
            this.connect(dom);
        }
    }

    fn disconnected(&self, _dom: &Dom, _node: NodeId) {
        let stoppables = {
            let mut state = self.state.borrow_mut();
            state.connected = false;
            state.listeners_registered = false;
            std::mem::take(&mut state.stoppables)
        };
        for stoppable in stoppables {
            stoppable.stop();
        }
    }

    fn attribute_changed(
        &self,
        _dom: &Dom,
        _node: NodeId,
        name: &str,
        old_value: Option<&str>,
        new_value: Option<&str>,
    ) {
        if self.skip_attribute_callback.get() || old_value == new_value {
            return;
        }
        self.set_controller_from_attribute(name, &Value::from(new_value));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ObjectController;
    use crate::error::ErrorKind;
    use crate::value::DataType;

    fn greeter() -> ObjectController {
        ObjectController::new().field("name", "A")
    }

    #[test]
    fn test_tag_needs_dash() {
        let dom = Dom::new();
        let err = register(&dom, ComponentConfig::new("greet", greeter), &EngineOptions::default()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Naming);
    }

    #[test]
    fn test_global_style_injection() {
        let dom = Dom::new();
        let options = EngineOptions::default();
        register(
            &dom,
            ComponentConfig::new("nl-styled", greeter).html("<p></p>").style("p { color: red }"),
            &options,
        )
        .unwrap();
        let head = dom.inner_html(dom.head());
        assert!(head.starts_with("<!--nils-library styling--><style id=\"nils-library-element-nl-styled\">"));
        assert!(head.contains("nlib-cid"));
    }

    #[test]
    fn test_shadow_component_adopts_sheet() {
        let dom = Dom::new();
        register(
            &dom,
            ComponentConfig::new("nl-shadowed", greeter)
                .html("<b>{{this.name}}</b>")
                .style("b { color: red }")
                .shadow(ShadowRootMode::Open),
            &EngineOptions::default(),
        )
        .unwrap();
        let host = dom.create_element("nl-shadowed");
        dom.append_child(dom.body(), host).unwrap();

        let root = dom.shadow_root(host).unwrap();
        assert_eq!(dom.inner_html(root), "<b>A</b>");
        assert_eq!(dom.adopted_style_sheets(root).len(), 1);
        assert!(!dom.has_attribute(host, CSS_HOST_ID_ATTR));
    }

    #[test]
    fn test_attribute_binding_and_reflection() {
        let dom = Dom::new();
        register(
            &dom,
            ComponentConfig::new("nl-count", || ObjectController::new().field("count", 0))
                .html("<i>{{this.count}}</i>")
                .attribute(AttributeBinding::new("count").data_type(DataType::Number)),
            &EngineOptions::default(),
        )
        .unwrap();
        let host = dom.create_element("nl-count");
        dom.set_attribute(host, "count", "3");
        dom.append_child(dom.body(), host).unwrap();

        let element = dom.custom_element(host).unwrap();
        let component = element.as_any().downcast_ref::<ComponentElement>().unwrap();
        assert_eq!(component.controller().get("count"), Value::from(3));
        assert_eq!(dom.text_content(host), "3");

        component.set_input(&dom, host, "count", Value::from(5));
        assert_eq!(dom.get_attribute(host, "count").as_deref(), Some("5"));
        dom.settle();
        assert_eq!(dom.text_content(host), "5");
    }

    #[test]
    fn test_bound_events_and_teardown() {
        let dom = Dom::new();
        register(
            &dom,
            ComponentConfig::new("nl-clicks", || {
                ObjectController::new().field("clicks", 0).method("onClick", |this, _| {
                    let next = this.get("clicks").to_number() + 1.0;
                    this.set("clicks", Value::Number(next))?;
                    Ok(Value::Undefined)
                })
            })
            .html("<span>{{this.clicks}}</span>")
            .bind_event(EventBinding::new("click", "onClick")),
            &EngineOptions::default(),
        )
        .unwrap();
        let host = dom.create_element("nl-clicks");
        dom.append_child(dom.body(), host).unwrap();

        dom.dispatch_event(host, Rc::new(crate::dom::Event::new("click", false)));
        dom.settle();
        assert_eq!(dom.text_content(host), "1");

        dom.remove(host);
        dom.dispatch_event(host, Rc::new(crate::dom::Event::new("click", false)));
        let element = dom.custom_element(host).unwrap();
        let component = element.as_any().downcast_ref::<ComponentElement>().unwrap();
        assert_eq!(component.controller().get("clicks"), Value::from(1));
    }

    #[test]
    fn test_slots_relocate_and_restore() {
        let dom = Dom::new();
        register(
            &dom,
            ComponentConfig::new("nl-card", greeter)
                .html(r#"<header><slot name="title"></slot></header>"#),
            &EngineOptions::default(),
        )
        .unwrap();
        let host = dom.create_element("nl-card");
        let title = dom.create_element("h1");
        dom.set_attribute(title, "slot", "title");
        dom.append_child(host, title).unwrap();
        dom.append_child(dom.body(), host).unwrap();
        dom.settle();

        let header = dom
            .element_children(host)
            .into_iter()
            .find(|n| dom.local_name(*n).as_deref() == Some("header"))
            .unwrap();
        assert_eq!(dom.parent(title), Some(header));
        assert_eq!(
            dom.inner_html(header),
            r#"<h1 slot="title"></h1><!--slot placeholder-->"#
        );

        dom.remove(title);
        dom.settle();
        assert_eq!(
            dom.inner_html(header),
            r#"<slot name="title" nlib-cid="nl-card"></slot>"#
        );
    }

    #[test]
    fn test_sibling_lands_before_slotted_content() {
        let dom = Dom::new();
        register(
            &dom,
            ComponentConfig::new("nl-bar", || ObjectController::new().field("show", false))
                .html(r#"<header><b *if="this.show">x</b><slot name="title"></slot></header>"#),
            &EngineOptions::default(),
        )
        .unwrap();
        let host = dom.create_element("nl-bar");
        let title = dom.create_element("h1");
        dom.set_attribute(title, "slot", "title");
        dom.append_child(host, title).unwrap();
        dom.append_child(dom.body(), host).unwrap();
        dom.settle();

        let header = dom.parent(title).unwrap();
        let element = dom.custom_element(host).unwrap();
        let component = element.as_any().downcast_ref::<ComponentElement>().unwrap();
        component.controller().set("show", Value::from(true)).unwrap();
        dom.settle();

        assert_eq!(
            dom.inner_html(header),
            r#"<b nlib-cid="nl-bar">x</b><h1 slot="title"></h1><!--slot placeholder-->"#
        );
    }
}
