//! Host DOM for the nlib rendering engine
//!
//! An arena-backed, single-threaded document the renderer patches and the
//! component elements live in. It models the parts of the browser DOM the
//! engine relies on: namespaced elements and attributes, IDL properties,
//! event dispatch with bubbling, mutation observers, shadow roots and a
//! custom element registry.
//!
//! Callbacks (event listeners, custom element reactions, observer callbacks)
//! are always invoked after the internal borrow has been released, so they
//! may freely call back into the document.

use indexmap::IndexMap;
use lazy_static::lazy_static;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::css::StyleSheet;
use crate::error::{EngineError, Result, ERR_CONFLICT_DEFINED, ERR_CONFLICT_SHADOW, ERR_TREE_HOST};
use crate::parse::{is_void_element, HTML_NAMESPACE};
use crate::queue;
use crate::value::Value;

pub const XLINK_NAMESPACE: &str = "http://www.w3.org/1999/xlink";
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";
pub const XMLNS_NAMESPACE: &str = "http://www.w3.org/2000/xmlns/";

/// Upper bound on microtask checkpoint rounds in [`Dom::settle`].
const MAX_SETTLE_ROUNDS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Window,
    Document,
    Element,
    Text,
    Comment,
    Fragment,
    ShadowRoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShadowRootMode {
    Open,
    Closed,
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

pub struct Event {
    event_type: String,
    detail: Value,
    bubbles: bool,
    custom: bool,
    target: Cell<Option<NodeId>>,
    current_target: Cell<Option<NodeId>>,
    propagation_stopped: Cell<bool>,
    default_prevented: Cell<bool>,
    dom: RefCell<Option<WeakDom>>,
}

impl Event {
    pub fn new(event_type: &str, bubbles: bool) -> Self {
        Self::build(event_type, Value::Null, bubbles, false)
    }

    pub fn custom(event_type: &str, detail: Value, bubbles: bool) -> Self {
        Self::build(event_type, detail, bubbles, true)
    }

    fn build(event_type: &str, detail: Value, bubbles: bool, custom: bool) -> Self {
        Self {
            event_type: event_type.to_string(),
            detail,
            bubbles,
            custom,
            target: Cell::new(None),
            current_target: Cell::new(None),
            propagation_stopped: Cell::new(false),
            default_prevented: Cell::new(false),
            dom: RefCell::new(None),
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn detail(&self) -> &Value {
        &self.detail
    }

    pub fn is_custom(&self) -> bool {
        self.custom
    }

    pub fn bubbles(&self) -> bool {
        self.bubbles
    }

    pub fn class_name(&self) -> &'static str {
        if self.custom {
            "CustomEvent"
        } else {
            "Event"
        }
    }

    pub fn target(&self) -> Option<NodeId> {
        self.target.get()
    }

    pub fn current_target(&self) -> Option<NodeId> {
        self.current_target.get()
    }

    pub fn target_ref(&self) -> Option<ElementRef> {
        self.element_ref(self.target.get())
    }

    pub fn current_target_ref(&self) -> Option<ElementRef> {
        self.element_ref(self.current_target.get())
    }

    fn element_ref(&self, node: Option<NodeId>) -> Option<ElementRef> {
        let dom = self.dom.borrow().clone()?;
        Some(ElementRef { dom, node: node? })
    }

    pub fn stop_propagation(&self) {
        self.propagation_stopped.set(true);
    }

    pub fn prevent_default(&self) {
        self.default_prevented.set(true);
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented.get()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("type", &self.event_type)
            .field("detail", &self.detail)
            .field("bubbles", &self.bubbles)
            .finish()
    }
}

static LISTENER_GUID: AtomicU64 = AtomicU64::new(1);

/// An event callback with a stable identity. Clones share the identity.
#[derive(Clone)]
pub struct Listener {
    guid: u64,
    callback: Rc<dyn Fn(&Rc<Event>)>,
}

impl Listener {
    pub fn new(callback: impl Fn(&Rc<Event>) + 'static) -> Self {
        Self {
            guid: LISTENER_GUID.fetch_add(1, Ordering::Relaxed),
            callback: Rc::new(callback),
        }
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn invoke(&self, event: &Rc<Event>) {
        (self.callback)(event)
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener#{}", self.guid)
    }
}

impl PartialEq for Listener {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// IDL PROPERTIES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlType {
    String,
    Number,
    Boolean,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlProperty {
    pub ty: IdlType,
    /// Reflected properties read and write the content attribute.
    pub reflect: bool,
}

lazy_static! {
    /// `(tag, attribute)` to IDL property; `*` applies to every HTML element.
    static ref IDL_PROPERTIES: HashMap<(&'static str, &'static str), IdlProperty> = {
        use IdlType::*;
        let reflected = |ty| IdlProperty { ty, reflect: true };
        let internal = |ty| IdlProperty { ty, reflect: false };
        let mut m = HashMap::new();
        m.insert(("*", "id"), reflected(String));
        m.insert(("*", "title"), reflected(String));
        m.insert(("*", "lang"), reflected(String));
        m.insert(("*", "dir"), reflected(String));
        m.insert(("*", "hidden"), reflected(Boolean));
        m.insert(("*", "tabindex"), reflected(Number));
        for tag in ["input", "textarea", "select"] {
            m.insert((tag, "value"), internal(String));
            m.insert((tag, "disabled"), reflected(Boolean));
            m.insert((tag, "required"), reflected(Boolean));
            m.insert((tag, "name"), reflected(String));
        }
        m.insert(("input", "checked"), internal(Boolean));
        m.insert(("input", "type"), reflected(String));
        m.insert(("input", "placeholder"), reflected(String));
        m.insert(("input", "readonly"), reflected(Boolean));
        m.insert(("input", "min"), reflected(String));
        m.insert(("input", "max"), reflected(String));
        m.insert(("input", "step"), reflected(String));
        m.insert(("textarea", "placeholder"), reflected(String));
        m.insert(("textarea", "readonly"), reflected(Boolean));
        m.insert(("select", "multiple"), reflected(Boolean));
        m.insert(("option", "selected"), internal(Boolean));
        m.insert(("option", "value"), reflected(String));
        m.insert(("option", "disabled"), reflected(Boolean));
        m.insert(("button", "disabled"), reflected(Boolean));
        m.insert(("button", "type"), reflected(String));
        m.insert(("fieldset", "disabled"), reflected(Boolean));
        m.insert(("details", "open"), reflected(Boolean));
        m.insert(("dialog", "open"), reflected(Boolean));
        m.insert(("img", "src"), reflected(String));
        m.insert(("img", "alt"), reflected(String));
        m.insert(("a", "href"), reflected(String));
        m
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// CUSTOM ELEMENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle reactions of an upgraded element.
pub trait CustomElement: Any {
    fn connected(&self, _dom: &Dom, _node: NodeId) {}
    fn disconnected(&self, _dom: &Dom, _node: NodeId) {}
    fn attribute_changed(
        &self,
        _dom: &Dom,
        _node: NodeId,
        _name: &str,
        _old_value: Option<&str>,
        _new_value: Option<&str>,
    ) {
    }
    fn as_any(&self) -> &dyn Any;
}

/// A registered custom element constructor.
pub trait ElementDefinition: Any {
    fn observed_attributes(&self) -> Vec<String> {
        vec![]
    }
    fn construct(&self, dom: &Dom, node: NodeId) -> Rc<dyn CustomElement>;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone)]
struct CustomSlot {
    element: Rc<dyn CustomElement>,
    observed: Rc<Vec<String>>,
}

enum Reaction {
    Connected(Rc<dyn CustomElement>, NodeId),
    Disconnected(Rc<dyn CustomElement>, NodeId),
    AttributeChanged {
        element: Rc<dyn CustomElement>,
        node: NodeId,
        name: String,
        old_value: Option<String>,
        new_value: Option<String>,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// MUTATION OBSERVERS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct MutationObserverInit {
    pub child_list: bool,
    pub attributes: bool,
    pub subtree: bool,
    pub attribute_filter: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationRecord {
    ChildList {
        target: NodeId,
        added: Vec<NodeId>,
        removed: Vec<NodeId>,
    },
    Attributes {
        target: NodeId,
        name: String,
        old_value: Option<String>,
    },
}

impl MutationRecord {
    pub fn target(&self) -> NodeId {
        match self {
            MutationRecord::ChildList { target, .. } | MutationRecord::Attributes { target, .. } => {
                *target
            }
        }
    }
}

pub type MutationCallback = Rc<dyn Fn(&Dom, &[MutationRecord])>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Observer {
    callback: MutationCallback,
    registrations: Vec<(NodeId, MutationObserverInit)>,
    records: Vec<MutationRecord>,
}

#[derive(Default)]
struct ObserverState {
    next_id: u64,
    observers: IndexMap<ObserverId, Observer>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// TREE STORAGE
// ═══════════════════════════════════════════════════════════════════════════════

enum NodeKind {
    Window,
    Document,
    Element { local_name: String, namespace: String },
    Text(String),
    Comment(String),
    Fragment,
    ShadowRoot { mode: ShadowRootMode, host: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub name: String,
    pub namespace: Option<String>,
    pub value: String,
}

impl Attr {
    fn local_name(&self) -> &str {
        self.name.split_once(':').map(|(_, l)| l).unwrap_or(&self.name)
    }
}

struct NodeRecord {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    attributes: Vec<Attr>,
    properties: HashMap<String, Value>,
    listeners: Vec<(String, Listener)>,
    shadow_root: Option<NodeId>,
    custom: Option<CustomSlot>,
    adopted_style_sheets: Vec<Rc<StyleSheet>>,
}

impl NodeRecord {
    fn new(kind: NodeKind) -> Self {
        Self {
            kind,
            parent: None,
            children: vec![],
            attributes: vec![],
            properties: HashMap::new(),
            listeners: vec![],
            shadow_root: None,
            custom: None,
            adopted_style_sheets: vec![],
        }
    }
}

struct Tree {
    nodes: Vec<NodeRecord>,
    window: NodeId,
    document: NodeId,
    head: NodeId,
    body: NodeId,
}

impl Tree {
    fn node(&self, id: NodeId) -> &NodeRecord {
        &self.nodes[id.0]
    }

    fn node_mut(&mut self, id: NodeId) -> &mut NodeRecord {
        &mut self.nodes[id.0]
    }

    fn alloc(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(NodeRecord::new(kind));
        NodeId(self.nodes.len() - 1)
    }

    fn is_element(&self, id: NodeId) -> bool {
        matches!(self.node(id).kind, NodeKind::Element { .. })
    }

    fn local_name(&self, id: NodeId) -> Option<&str> {
        match &self.node(id).kind {
            NodeKind::Element { local_name, .. } => Some(local_name),
            _ => None,
        }
    }

    fn is_html(&self, id: NodeId) -> bool {
        matches!(&self.node(id).kind, NodeKind::Element { namespace, .. } if namespace == HTML_NAMESPACE)
    }

    /// Parent, or the host for shadow roots.
    fn composed_parent(&self, id: NodeId) -> Option<NodeId> {
        match &self.node(id).kind {
            NodeKind::ShadowRoot { host, .. } => Some(*host),
            _ => self.node(id).parent,
        }
    }

    fn is_connected(&self, id: NodeId) -> bool {
        let mut current = Some(id);
        while let Some(node) = current {
            if node == self.document {
                return true;
            }
            current = self.composed_parent(node);
        }
        false
    }

    /// Inclusive ancestor check across shadow boundaries.
    fn is_host_including_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.composed_parent(n);
        }
        false
    }

    fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        while let Some(n) = current {
            if n == ancestor {
                return true;
            }
            current = self.node(n).parent;
        }
        false
    }

    /// Custom elements in shadow-including tree order.
    fn collect_custom(&self, root: NodeId, out: &mut Vec<(Rc<dyn CustomElement>, NodeId)>) {
        let record = self.node(root);
        if let Some(slot) = &record.custom {
            out.push((slot.element.clone(), root));
        }
        if let Some(shadow) = record.shadow_root {
            self.collect_custom(shadow, out);
        }
        for child in &record.children {
            self.collect_custom(*child, out);
        }
    }

    fn descendants(&self, root: NodeId, out: &mut Vec<NodeId>) {
        for child in &self.node(root).children {
            out.push(*child);
            self.descendants(*child, out);
        }
    }

    fn find_attr(&self, id: NodeId, name: &str) -> Option<usize> {
        let name = self.normalize_attr_name(id, name);
        self.node(id).attributes.iter().position(|a| a.name == name)
    }

    fn normalize_attr_name(&self, id: NodeId, name: &str) -> String {
        if self.is_html(id) {
            name.to_ascii_lowercase()
        } else {
            name.to_string()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DOCUMENT HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

struct DomShared {
    tree: RefCell<Tree>,
    registry: RefCell<IndexMap<String, Rc<dyn ElementDefinition>>>,
    observers: RefCell<ObserverState>,
}

/// Shared handle to one document.
#[derive(Clone)]
pub struct Dom(Rc<DomShared>);

#[derive(Clone)]
pub struct WeakDom(Weak<DomShared>);

impl WeakDom {
    pub fn upgrade(&self) -> Option<Dom> {
        self.0.upgrade().map(Dom)
    }

    fn ptr_eq(&self, other: &WeakDom) -> bool {
        Weak::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Dom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dom({} nodes)", self.0.tree.borrow().nodes.len())
    }
}

impl Default for Dom {
    fn default() -> Self {
        Self::new()
    }
}

impl Dom {
    /// Creates `window`, `document`, `<html>`, `<head>` and `<body>`.
    pub fn new() -> Self {
        let mut tree = Tree {
            nodes: vec![],
            window: NodeId(0),
            document: NodeId(0),
            head: NodeId(0),
            body: NodeId(0),
        };
        let element = |name: &str| NodeKind::Element {
            local_name: name.to_string(),
            namespace: HTML_NAMESPACE.to_string(),
        };
        tree.window = tree.alloc(NodeKind::Window);
        tree.document = tree.alloc(NodeKind::Document);
        let html = tree.alloc(element("html"));
        tree.head = tree.alloc(element("head"));
        tree.body = tree.alloc(element("body"));
        let document = tree.document;
        let (head, body) = (tree.head, tree.body);
        tree.node_mut(document).children.push(html);
        tree.node_mut(html).parent = Some(document);
        for child in [head, body] {
            tree.node_mut(html).children.push(child);
            tree.node_mut(child).parent = Some(html);
        }
        Dom(Rc::new(DomShared {
            tree: RefCell::new(tree),
            registry: RefCell::new(IndexMap::new()),
            observers: RefCell::new(ObserverState::default()),
        }))
    }

    pub fn downgrade(&self) -> WeakDom {
        WeakDom(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Dom) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn window(&self) -> NodeId {
        self.0.tree.borrow().window
    }

    pub fn document(&self) -> NodeId {
        self.0.tree.borrow().document
    }

    pub fn head(&self) -> NodeId {
        self.0.tree.borrow().head
    }

    pub fn body(&self) -> NodeId {
        self.0.tree.borrow().body
    }

    pub fn element_ref(&self, node: NodeId) -> ElementRef {
        ElementRef {
            dom: self.downgrade(),
            node,
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Node creation
    // ───────────────────────────────────────────────────────────────────────────

    pub fn create_element(&self, tag: &str) -> NodeId {
        self.create_element_ns(HTML_NAMESPACE, &tag.to_ascii_lowercase())
    }

    pub fn create_element_ns(&self, namespace: &str, local_name: &str) -> NodeId {
        let id = self.0.tree.borrow_mut().alloc(NodeKind::Element {
            local_name: local_name.to_string(),
            namespace: namespace.to_string(),
        });
        if namespace == HTML_NAMESPACE {
            let definition = self.definition(local_name);
            if let Some(definition) = definition {
                self.upgrade_element(&definition, id);
            }
        }
        id
    }

    pub fn create_text_node(&self, data: &str) -> NodeId {
        self.0
            .tree
            .borrow_mut()
            .alloc(NodeKind::Text(data.to_string()))
    }

    pub fn create_comment(&self, data: &str) -> NodeId {
        self.0
            .tree
            .borrow_mut()
            .alloc(NodeKind::Comment(data.to_string()))
    }

    pub fn create_document_fragment(&self) -> NodeId {
        self.0.tree.borrow_mut().alloc(NodeKind::Fragment)
    }

    fn upgrade_element(&self, definition: &Rc<dyn ElementDefinition>, id: NodeId) {
        let observed = Rc::new(definition.observed_attributes());
        let element = definition.construct(self, id);
        self.0.tree.borrow_mut().node_mut(id).custom = Some(CustomSlot { element, observed });
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Inspection
    // ───────────────────────────────────────────────────────────────────────────

    pub fn node_type(&self, id: NodeId) -> NodeType {
        match self.0.tree.borrow().node(id).kind {
            NodeKind::Window => NodeType::Window,
            NodeKind::Document => NodeType::Document,
            NodeKind::Element { .. } => NodeType::Element,
            NodeKind::Text(_) => NodeType::Text,
            NodeKind::Comment(_) => NodeType::Comment,
            NodeKind::Fragment => NodeType::Fragment,
            NodeKind::ShadowRoot { .. } => NodeType::ShadowRoot,
        }
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.0.tree.borrow().is_element(id)
    }

    pub fn local_name(&self, id: NodeId) -> Option<String> {
        self.0.tree.borrow().local_name(id).map(str::to_string)
    }

    pub fn namespace(&self, id: NodeId) -> Option<String> {
        match &self.0.tree.borrow().node(id).kind {
            NodeKind::Element { namespace, .. } => Some(namespace.clone()),
            _ => None,
        }
    }

    /// `nodeName` as the browser reports it.
    pub fn node_name(&self, id: NodeId) -> String {
        let tree = self.0.tree.borrow();
        match &tree.node(id).kind {
            NodeKind::Element { local_name, .. } if tree.is_html(id) => local_name.to_uppercase(),
            NodeKind::Element { local_name, .. } => local_name.clone(),
            NodeKind::Text(_) => "#text".to_string(),
            NodeKind::Comment(_) => "#comment".to_string(),
            NodeKind::Fragment | NodeKind::ShadowRoot { .. } => "#document-fragment".to_string(),
            NodeKind::Document => "#document".to_string(),
            NodeKind::Window => "#window".to_string(),
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.0.tree.borrow().node(id).parent
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.0.tree.borrow().node(id).children.clone()
    }

    pub fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        let tree = self.0.tree.borrow();
        tree.node(id)
            .children
            .iter()
            .copied()
            .filter(|c| tree.is_element(*c))
            .collect()
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.0.tree.borrow().node(id).children.first().copied()
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let tree = self.0.tree.borrow();
        let parent = tree.node(id).parent?;
        let siblings = &tree.node(parent).children;
        let index = siblings.iter().position(|c| *c == id)?;
        siblings.get(index + 1).copied()
    }

    pub fn previous_sibling(&self, id: NodeId) -> Option<NodeId> {
        let tree = self.0.tree.borrow();
        let parent = tree.node(id).parent?;
        let siblings = &tree.node(parent).children;
        let index = siblings.iter().position(|c| *c == id)?;
        index.checked_sub(1).map(|i| siblings[i])
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.0.tree.borrow().is_connected(id)
    }

    /// Inclusive descendant check within one tree.
    pub fn contains(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.0.tree.borrow().contains(ancestor, node)
    }

    /// All descendants in tree order, excluding `root`.
    pub fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = vec![];
        self.0.tree.borrow().descendants(root, &mut out);
        out
    }

    /// Element ancestors of `id`, nearest first, excluding `id`.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let tree = self.0.tree.borrow();
        let mut out = vec![];
        let mut current = tree.node(id).parent;
        while let Some(node) = current {
            out.push(node);
            current = tree.node(node).parent;
        }
        out
    }

    /// `closest('[attr]')`
    pub fn closest_with_attribute(&self, id: NodeId, attr: &str) -> Option<NodeId> {
        let tree = self.0.tree.borrow();
        let mut current = Some(id);
        while let Some(node) = current {
            if tree.is_element(node) && tree.find_attr(node, attr).is_some() {
                return Some(node);
            }
            current = tree.node(node).parent;
        }
        None
    }

    /// Elements in the subtree of `root` (inclusive) carrying `attr`.
    pub fn query_with_attribute(&self, root: NodeId, attr: &str) -> Vec<NodeId> {
        let tree = self.0.tree.borrow();
        let mut candidates = vec![root];
        tree.descendants(root, &mut candidates);
        candidates
            .into_iter()
            .filter(|n| tree.is_element(*n) && tree.find_attr(*n, attr).is_some())
            .collect()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Tree mutation
    // ───────────────────────────────────────────────────────────────────────────

    pub fn append_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        self.insert_before(parent, child, None)
    }

    pub fn prepend(&self, parent: NodeId, child: NodeId) -> Result<()> {
        let first = self.first_child(parent);
        self.insert_before(parent, child, first)
    }

    pub fn insert_before(&self, parent: NodeId, child: NodeId, reference: Option<NodeId>) -> Result<()> {
        let mut reactions = vec![];
        {
            let mut tree = self.0.tree.borrow_mut();
            let parent_ok = matches!(
                tree.node(parent).kind,
                NodeKind::Document | NodeKind::Element { .. } | NodeKind::Fragment | NodeKind::ShadowRoot { .. }
            );
            let child_ok = !matches!(
                tree.node(child).kind,
                NodeKind::Document | NodeKind::Window | NodeKind::ShadowRoot { .. }
            );
            if !parent_ok || !child_ok {
                return Err(EngineError::tree(ERR_TREE_HOST, "Node cannot be inserted here"));
            }
            if tree.is_host_including_ancestor(child, parent) {
                return Err(EngineError::tree(
                    ERR_TREE_HOST,
                    "The new child element contains the parent",
                ));
            }
            let mut reference = reference;
            if let Some(r) = reference {
                if tree.node(r).parent != Some(parent) {
                    return Err(EngineError::tree(
                        ERR_TREE_HOST,
                        "The node before which the new node is to be inserted is not a child of this node",
                    ));
                }
                if r == child {
                    let siblings = &tree.node(parent).children;
                    let index = siblings.iter().position(|c| *c == r).unwrap_or(0);
                    reference = siblings.get(index + 1).copied();
                }
            }

            let nodes = if matches!(tree.node(child).kind, NodeKind::Fragment) {
                let moved = std::mem::take(&mut tree.node_mut(child).children);
                for node in &moved {
                    tree.node_mut(*node).parent = None;
                }
                if !moved.is_empty() {
                    self.queue_child_list(&tree, child, vec![], moved.clone());
                }
                moved
            } else {
                if let Some(old_parent) = tree.node(child).parent {
                    self.detach(&mut tree, old_parent, child, &mut reactions);
                }
                vec![child]
            };

            let connected = tree.is_connected(parent);
            for node in &nodes {
                let index = match reference {
                    Some(r) => tree
                        .node(parent)
                        .children
                        .iter()
                        .position(|c| *c == r)
                        .unwrap_or(tree.node(parent).children.len()),
                    None => tree.node(parent).children.len(),
                };
                tree.node_mut(parent).children.insert(index, *node);
                tree.node_mut(*node).parent = Some(parent);
                if connected {
                    let mut custom = vec![];
                    tree.collect_custom(*node, &mut custom);
                    reactions.extend(custom.into_iter().map(|(e, n)| Reaction::Connected(e, n)));
                }
            }
            if !nodes.is_empty() {
                self.queue_child_list(&tree, parent, nodes, vec![]);
            }
        }
        self.run_reactions(reactions);
        Ok(())
    }

    pub fn remove_child(&self, parent: NodeId, child: NodeId) -> Result<()> {
        let mut reactions = vec![];
        {
            let mut tree = self.0.tree.borrow_mut();
            if tree.node(child).parent != Some(parent) {
                return Err(EngineError::tree(
                    ERR_TREE_HOST,
                    "The node to be removed is not a child of this node",
                ));
            }
            self.detach(&mut tree, parent, child, &mut reactions);
        }
        self.run_reactions(reactions);
        Ok(())
    }

    /// Removes `node` from its parent, if any.
    pub fn remove(&self, node: NodeId) {
        if let Some(parent) = self.parent(node) {
            // The parent link was just read, so removal cannot fail.
            let _ = self.remove_child(parent, node);
        }
    }

    pub fn replace_child(&self, parent: NodeId, new_child: NodeId, old_child: NodeId) -> Result<()> {
        if new_child == old_child {
            return Ok(());
        }
        self.insert_before(parent, new_child, Some(old_child))?;
        self.remove_child(parent, old_child)
    }

    fn detach(&self, tree: &mut Tree, parent: NodeId, child: NodeId, reactions: &mut Vec<Reaction>) {
        let was_connected = tree.is_connected(parent);
        tree.node_mut(parent).children.retain(|c| *c != child);
        tree.node_mut(child).parent = None;
        self.queue_child_list(tree, parent, vec![], vec![child]);
        if was_connected {
            let mut custom = vec![];
            tree.collect_custom(child, &mut custom);
            reactions.extend(custom.into_iter().map(|(e, n)| Reaction::Disconnected(e, n)));
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Attributes
    // ───────────────────────────────────────────────────────────────────────────

    pub fn get_attribute(&self, id: NodeId, name: &str) -> Option<String> {
        let tree = self.0.tree.borrow();
        tree.find_attr(id, name)
            .map(|i| tree.node(id).attributes[i].value.clone())
    }

    pub fn has_attribute(&self, id: NodeId, name: &str) -> bool {
        self.0.tree.borrow().find_attr(id, name).is_some()
    }

    pub fn attribute_names(&self, id: NodeId) -> Vec<String> {
        self.0
            .tree
            .borrow()
            .node(id)
            .attributes
            .iter()
            .map(|a| a.name.clone())
            .collect()
    }

    pub fn attributes(&self, id: NodeId) -> Vec<Attr> {
        self.0.tree.borrow().node(id).attributes.clone()
    }

    pub fn set_attribute(&self, id: NodeId, name: &str, value: &str) {
        let mut reactions = vec![];
        {
            let mut tree = self.0.tree.borrow_mut();
            let name = tree.normalize_attr_name(id, name);
            let old_value = match tree.find_attr(id, &name) {
                Some(i) => Some(std::mem::replace(
                    &mut tree.node_mut(id).attributes[i].value,
                    value.to_string(),
                )),
                None => {
                    tree.node_mut(id).attributes.push(Attr {
                        name: name.clone(),
                        namespace: None,
                        value: value.to_string(),
                    });
                    None
                }
            };
            self.attribute_changed(&tree, id, &name, old_value, Some(value.to_string()), &mut reactions);
        }
        self.run_reactions(reactions);
    }

    pub fn remove_attribute(&self, id: NodeId, name: &str) {
        let mut reactions = vec![];
        {
            let mut tree = self.0.tree.borrow_mut();
            let Some(index) = tree.find_attr(id, name) else {
                return;
            };
            let removed = tree.node_mut(id).attributes.remove(index);
            self.attribute_changed(&tree, id, &removed.name, Some(removed.value), None, &mut reactions);
        }
        self.run_reactions(reactions);
    }

    pub fn set_attribute_ns(&self, id: NodeId, namespace: Option<&str>, qualified_name: &str, value: &str) {
        let mut reactions = vec![];
        {
            let mut tree = self.0.tree.borrow_mut();
            let local = qualified_name
                .split_once(':')
                .map(|(_, l)| l)
                .unwrap_or(qualified_name);
            let position = tree
                .node(id)
                .attributes
                .iter()
                .position(|a| a.namespace.as_deref() == namespace && a.local_name() == local);
            let old_value = match position {
                Some(i) => Some(std::mem::replace(
                    &mut tree.node_mut(id).attributes[i].value,
                    value.to_string(),
                )),
                None => {
                    tree.node_mut(id).attributes.push(Attr {
                        name: qualified_name.to_string(),
                        namespace: namespace.map(str::to_string),
                        value: value.to_string(),
                    });
                    None
                }
            };
            self.attribute_changed(&tree, id, qualified_name, old_value, Some(value.to_string()), &mut reactions);
        }
        self.run_reactions(reactions);
    }

    pub fn remove_attribute_ns(&self, id: NodeId, namespace: Option<&str>, local_name: &str) {
        let mut reactions = vec![];
        {
            let mut tree = self.0.tree.borrow_mut();
            let Some(index) = tree
                .node(id)
                .attributes
                .iter()
                .position(|a| a.namespace.as_deref() == namespace && a.local_name() == local_name)
            else {
                return;
            };
            let removed = tree.node_mut(id).attributes.remove(index);
            self.attribute_changed(&tree, id, &removed.name, Some(removed.value), None, &mut reactions);
        }
        self.run_reactions(reactions);
    }

    fn attribute_changed(
        &self,
        tree: &Tree,
        id: NodeId,
        name: &str,
        old_value: Option<String>,
        new_value: Option<String>,
        reactions: &mut Vec<Reaction>,
    ) {
        self.queue_attribute(tree, id, name, old_value.clone());
        if let Some(slot) = &tree.node(id).custom {
            if slot.observed.iter().any(|o| o == name) {
                reactions.push(Reaction::AttributeChanged {
                    element: slot.element.clone(),
                    node: id,
                    name: name.to_string(),
                    old_value,
                    new_value,
                });
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Character data
    // ───────────────────────────────────────────────────────────────────────────

    pub fn node_value(&self, id: NodeId) -> Option<String> {
        match &self.0.tree.borrow().node(id).kind {
            NodeKind::Text(data) | NodeKind::Comment(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn set_node_value(&self, id: NodeId, value: &str) {
        let mut tree = self.0.tree.borrow_mut();
        match &mut tree.node_mut(id).kind {
            NodeKind::Text(data) | NodeKind::Comment(data) => *data = value.to_string(),
            _ => {}
        }
    }

    pub fn text_content(&self, id: NodeId) -> String {
        fn collect(tree: &Tree, id: NodeId, out: &mut String) {
            match &tree.node(id).kind {
                NodeKind::Text(data) => out.push_str(data),
                NodeKind::Comment(_) => {}
                _ => {
                    for child in &tree.node(id).children {
                        collect(tree, *child, out);
                    }
                }
            }
        }
        let mut out = String::new();
        collect(&self.0.tree.borrow(), id, &mut out);
        out
    }

    // ───────────────────────────────────────────────────────────────────────────
    // IDL properties
    // ───────────────────────────────────────────────────────────────────────────

    pub fn idl_property(&self, id: NodeId, name: &str) -> Option<IdlProperty> {
        let tree = self.0.tree.borrow();
        if !tree.is_html(id) {
            return None;
        }
        let tag = tree.local_name(id)?;
        let name = name.to_ascii_lowercase();
        IDL_PROPERTIES
            .get(&(tag, name.as_str()))
            .or_else(|| IDL_PROPERTIES.get(&("*", name.as_str())))
            .copied()
    }

    /// Writes a property. Reflected IDL properties write through to the
    /// content attribute.
    pub fn set_property(&self, id: NodeId, name: &str, value: Value) {
        match self.idl_property(id, name) {
            Some(IdlProperty { ty: IdlType::Boolean, reflect: true }) => {
                if crate::value::parse_boolean(&value) {
                    self.set_attribute(id, name, "");
                } else {
                    self.remove_attribute(id, name);
                }
            }
            Some(IdlProperty { reflect: true, .. }) => {
                self.set_attribute(id, name, &value.to_js_string());
            }
            Some(IdlProperty { ty, reflect: false }) => {
                let coerced = match ty {
                    IdlType::Boolean => Value::Bool(crate::value::parse_boolean(&value)),
                    IdlType::Number => Value::Number(value.to_number()),
                    IdlType::String => Value::String(value.to_display()),
                };
                self.0
                    .tree
                    .borrow_mut()
                    .node_mut(id)
                    .properties
                    .insert(name.to_ascii_lowercase(), coerced);
            }
            None => {
                self.0
                    .tree
                    .borrow_mut()
                    .node_mut(id)
                    .properties
                    .insert(name.to_string(), value);
            }
        }
    }

    pub fn get_property(&self, id: NodeId, name: &str) -> Value {
        match self.idl_property(id, name) {
            Some(IdlProperty { ty, reflect: true }) => {
                let attr = self.get_attribute(id, name);
                match ty {
                    IdlType::Boolean => Value::Bool(attr.is_some()),
                    IdlType::Number => attr
                        .map(|a| Value::Number(Value::from(a).to_number()))
                        .unwrap_or(Value::Number(0.0)),
                    IdlType::String => Value::String(attr.unwrap_or_default()),
                }
            }
            Some(IdlProperty { ty, reflect: false }) => {
                let stored = self
                    .0
                    .tree
                    .borrow()
                    .node(id)
                    .properties
                    .get(&name.to_ascii_lowercase())
                    .cloned();
                stored.unwrap_or_else(|| match ty {
                    IdlType::Boolean => Value::Bool(self.has_attribute(id, name)),
                    _ => Value::String(self.get_attribute(id, name).unwrap_or_default()),
                })
            }
            None => self
                .0
                .tree
                .borrow()
                .node(id)
                .properties
                .get(name)
                .cloned()
                .unwrap_or(Value::Undefined),
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Events
    // ───────────────────────────────────────────────────────────────────────────

    /// Registers `listener`; a listener already registered for the same type
    /// is not added twice.
    pub fn add_event_listener(&self, target: NodeId, event_type: &str, listener: &Listener) {
        let mut tree = self.0.tree.borrow_mut();
        let listeners = &mut tree.node_mut(target).listeners;
        if !listeners
            .iter()
            .any(|(t, l)| t == event_type && l.guid == listener.guid)
        {
            listeners.push((event_type.to_string(), listener.clone()));
        }
    }

    pub fn remove_event_listener(&self, target: NodeId, event_type: &str, listener: &Listener) {
        self.0
            .tree
            .borrow_mut()
            .node_mut(target)
            .listeners
            .retain(|(t, l)| !(t == event_type && l.guid == listener.guid));
    }

    pub fn listener_count(&self, target: NodeId, event_type: &str) -> usize {
        self.0
            .tree
            .borrow()
            .node(target)
            .listeners
            .iter()
            .filter(|(t, _)| t == event_type)
            .count()
    }

    /// Dispatches `event` at `target`, bubbling through the composed path up
    /// to the window when the event bubbles. Returns false if a listener
    /// called `preventDefault`.
    pub fn dispatch_event(&self, target: NodeId, event: Rc<Event>) -> bool {
        *event.dom.borrow_mut() = Some(self.downgrade());
        event.target.set(Some(target));

        let path = {
            let tree = self.0.tree.borrow();
            let mut path = vec![target];
            if event.bubbles {
                let mut current = tree.composed_parent(target);
                while let Some(node) = current {
                    path.push(node);
                    current = if node == tree.document {
                        Some(tree.window)
                    } else {
                        tree.composed_parent(node)
                    };
                }
            }
            path
        };

        for node in path {
            event.current_target.set(Some(node));
            let listeners: Vec<Listener> = self
                .0
                .tree
                .borrow()
                .node(node)
                .listeners
                .iter()
                .filter(|(t, _)| *t == event.event_type)
                .map(|(_, l)| l.clone())
                .collect();
            for listener in listeners {
                let still_registered = self
                    .0
                    .tree
                    .borrow()
                    .node(node)
                    .listeners
                    .iter()
                    .any(|(t, l)| *t == event.event_type && l.guid == listener.guid);
                if still_registered {
                    listener.invoke(&event);
                }
            }
            if event.propagation_stopped.get() {
                break;
            }
        }
        event.current_target.set(None);
        !event.default_prevented.get()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Shadow roots
    // ───────────────────────────────────────────────────────────────────────────

    pub fn attach_shadow(&self, host: NodeId, mode: ShadowRootMode) -> Result<NodeId> {
        let mut tree = self.0.tree.borrow_mut();
        if tree.node(host).shadow_root.is_some() {
            return Err(EngineError::conflict(
                ERR_CONFLICT_SHADOW,
                "Shadow root cannot be created on a host which already hosts a shadow tree",
            ));
        }
        let root = tree.alloc(NodeKind::ShadowRoot { mode, host });
        tree.node_mut(host).shadow_root = Some(root);
        Ok(root)
    }

    pub fn shadow_root(&self, host: NodeId) -> Option<NodeId> {
        self.0.tree.borrow().node(host).shadow_root
    }

    pub fn shadow_root_mode(&self, root: NodeId) -> Option<ShadowRootMode> {
        match self.0.tree.borrow().node(root).kind {
            NodeKind::ShadowRoot { mode, .. } => Some(mode),
            _ => None,
        }
    }

    pub fn adopt_style_sheet(&self, root: NodeId, sheet: Rc<StyleSheet>) {
        let mut tree = self.0.tree.borrow_mut();
        let sheets = &mut tree.node_mut(root).adopted_style_sheets;
        if !sheets.iter().any(|s| Rc::ptr_eq(s, &sheet)) {
            sheets.push(sheet);
        }
    }

    pub fn adopted_style_sheets(&self, root: NodeId) -> Vec<Rc<StyleSheet>> {
        self.0.tree.borrow().node(root).adopted_style_sheets.clone()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Custom element registry
    // ───────────────────────────────────────────────────────────────────────────

    /// Defines `tag` and upgrades existing elements with that name.
    pub fn define(&self, tag: &str, definition: Rc<dyn ElementDefinition>) -> Result<()> {
        {
            let mut registry = self.0.registry.borrow_mut();
            if registry.contains_key(tag) {
                return Err(EngineError::conflict(
                    ERR_CONFLICT_DEFINED,
                    format!("the name \"{}\" has already been used with this registry", tag),
                ));
            }
            registry.insert(tag.to_string(), definition.clone());
        }

        let pending: Vec<NodeId> = {
            let tree = self.0.tree.borrow();
            (0..tree.nodes.len())
                .map(NodeId)
                .filter(|id| tree.is_html(*id) && tree.local_name(*id) == Some(tag))
                .filter(|id| tree.node(*id).custom.is_none())
                .collect()
        };
        let mut reactions = vec![];
        for id in pending {
            self.upgrade_element(&definition, id);
            if self.is_connected(id) {
                if let Some(element) = self.custom_element(id) {
                    reactions.push(Reaction::Connected(element, id));
                }
            }
        }
        self.run_reactions(reactions);
        Ok(())
    }

    pub fn definition(&self, tag: &str) -> Option<Rc<dyn ElementDefinition>> {
        self.0.registry.borrow().get(tag).cloned()
    }

    pub fn custom_element(&self, id: NodeId) -> Option<Rc<dyn CustomElement>> {
        self.0
            .tree
            .borrow()
            .node(id)
            .custom
            .as_ref()
            .map(|slot| slot.element.clone())
    }

    fn run_reactions(&self, reactions: Vec<Reaction>) {
        for reaction in reactions {
            match reaction {
                Reaction::Connected(element, node) => element.connected(self, node),
                Reaction::Disconnected(element, node) => element.disconnected(self, node),
                Reaction::AttributeChanged {
                    element,
                    node,
                    name,
                    old_value,
                    new_value,
                } => element.attribute_changed(
                    self,
                    node,
                    &name,
                    old_value.as_deref(),
                    new_value.as_deref(),
                ),
            }
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Mutation observers
    // ───────────────────────────────────────────────────────────────────────────

    pub fn create_observer(&self, callback: impl Fn(&Dom, &[MutationRecord]) + 'static) -> ObserverId {
        let mut state = self.0.observers.borrow_mut();
        state.next_id += 1;
        let id = ObserverId(state.next_id);
        state.observers.insert(
            id,
            Observer {
                callback: Rc::new(callback),
                registrations: vec![],
                records: vec![],
            },
        );
        id
    }

    pub fn observe(&self, observer: ObserverId, target: NodeId, init: MutationObserverInit) {
        if let Some(obs) = self.0.observers.borrow_mut().observers.get_mut(&observer) {
            obs.registrations.retain(|(node, _)| *node != target);
            obs.registrations.push((target, init));
        }
    }

    /// Stops observing and drops undelivered records.
    pub fn disconnect_observer(&self, observer: ObserverId) {
        self.0.observers.borrow_mut().observers.shift_remove(&observer);
    }

    fn queue_child_list(&self, tree: &Tree, target: NodeId, added: Vec<NodeId>, removed: Vec<NodeId>) {
        let record = MutationRecord::ChildList {
            target,
            added,
            removed,
        };
        self.queue_record(tree, target, record, |init| init.child_list);
    }

    fn queue_attribute(&self, tree: &Tree, target: NodeId, name: &str, old_value: Option<String>) {
        let record = MutationRecord::Attributes {
            target,
            name: name.to_string(),
            old_value,
        };
        self.queue_record(tree, target, record, |init| {
            let wants_attributes = init.attributes || init.attribute_filter.is_some();
            wants_attributes
                && init
                    .attribute_filter
                    .as_ref()
                    .map_or(true, |filter| filter.iter().any(|f| f == name))
        });
    }

    fn queue_record(
        &self,
        tree: &Tree,
        target: NodeId,
        record: MutationRecord,
        accepts: impl Fn(&MutationObserverInit) -> bool,
    ) {
        let mut state = self.0.observers.borrow_mut();
        for observer in state.observers.values_mut() {
            let interested = observer.registrations.iter().any(|(node, init)| {
                let in_scope = *node == target || (init.subtree && tree.contains(*node, target));
                in_scope && accepts(init)
            });
            if interested {
                observer.records.push(record.clone());
            }
        }
    }

    /// Delivers queued mutation records. Returns how many observers ran.
    pub fn deliver_mutation_records(&self) -> usize {
        let batches: Vec<(MutationCallback, Vec<MutationRecord>)> = {
            let mut state = self.0.observers.borrow_mut();
            state
                .observers
                .values_mut()
                .filter(|o| !o.records.is_empty())
                .map(|o| (o.callback.clone(), std::mem::take(&mut o.records)))
                .collect()
        };
        let count = batches.len();
        for (callback, records) in batches {
            callback(self, &records);
        }
        count
    }

    /// Runs microtask checkpoints until neither observers nor the render
    /// queue have pending work.
    pub fn settle(&self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let delivered = self.deliver_mutation_records();
            let drained = queue::drain();
            if delivered == 0 && drained == 0 {
                return;
            }
        }
        tracing::warn!(rounds = MAX_SETTLE_ROUNDS, "document did not settle");
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Serialization
    // ───────────────────────────────────────────────────────────────────────────

    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        serialize_node(&self.0.tree.borrow(), id, &mut out);
        out
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        let tree = self.0.tree.borrow();
        let mut out = String::new();
        for child in &tree.node(id).children {
            serialize_node(&tree, *child, &mut out);
        }
        out
    }
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\u{a0}', "&nbsp;")
}

fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('\u{a0}', "&nbsp;")
}

fn serialize_node(tree: &Tree, id: NodeId, out: &mut String) {
    let record = tree.node(id);
    match &record.kind {
        NodeKind::Text(data) => {
            let raw_parent = record
                .parent
                .and_then(|p| tree.local_name(p))
                .map_or(false, |tag| tag == "style" || tag == "script");
            if raw_parent {
                out.push_str(data);
            } else {
                out.push_str(&escape_text(data));
            }
        }
        NodeKind::Comment(data) => {
            out.push_str("<!--");
            out.push_str(data);
            out.push_str("-->");
        }
        NodeKind::Element { local_name, .. } => {
            out.push('<');
            out.push_str(local_name);
            for attr in &record.attributes {
                out.push(' ');
                out.push_str(&attr.name);
                out.push_str("=\"");
                out.push_str(&escape_attribute(&attr.value));
                out.push('"');
            }
            out.push('>');
            if tree.is_html(id) && is_void_element(local_name) {
                return;
            }
            for child in &record.children {
                serialize_node(tree, *child, out);
            }
            out.push_str("</");
            out.push_str(local_name);
            out.push('>');
        }
        _ => {
            for child in &record.children {
                serialize_node(tree, *child, out);
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ELEMENT REFERENCES
// ═══════════════════════════════════════════════════════════════════════════════

/// A node as seen from template expressions (`$event.target`).
#[derive(Clone)]
pub struct ElementRef {
    dom: WeakDom,
    node: NodeId,
}

impl ElementRef {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn dom(&self) -> Option<Dom> {
        self.dom.upgrade()
    }

    pub fn local_name(&self) -> String {
        self.dom()
            .and_then(|dom| dom.local_name(self.node))
            .unwrap_or_default()
    }

    /// Member read: IDL properties first, then attributes.
    pub fn get(&self, key: &str) -> Value {
        let Some(dom) = self.dom() else {
            return Value::Undefined;
        };
        match key {
            "tagName" | "nodeName" => Value::String(dom.node_name(self.node)),
            "localName" => Value::from(dom.local_name(self.node).as_deref()),
            "textContent" => Value::String(dom.text_content(self.node)),
            "isConnected" => Value::Bool(dom.is_connected(self.node)),
            "parentElement" | "parentNode" => dom
                .parent(self.node)
                .map(|p| Value::Element(dom.element_ref(p)))
                .unwrap_or(Value::Null),
            _ => {
                if dom.idl_property(self.node, key).is_some() {
                    return dom.get_property(self.node, key);
                }
                match dom.get_property(self.node, key) {
                    Value::Undefined => dom
                        .get_attribute(self.node, key)
                        .map(Value::String)
                        .unwrap_or(Value::Undefined),
                    value => value,
                }
            }
        }
    }

    pub fn get_attribute(&self, name: &str) -> Value {
        self.dom()
            .and_then(|dom| dom.get_attribute(self.node, name))
            .map(Value::String)
            .unwrap_or(Value::Null)
    }
}

impl PartialEq for ElementRef {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node && self.dom.ptr_eq(&other.dom)
    }
}

impl fmt::Debug for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ElementRef({:?})", self.node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_skeleton() {
        let dom = Dom::new();
        assert_eq!(dom.outer_html(dom.body()), "<body></body>");
        assert!(dom.is_connected(dom.body()));
        assert_eq!(dom.parent(dom.head()), dom.parent(dom.body()));
    }

    #[test]
    fn test_insert_move_and_remove() {
        let dom = Dom::new();
        let a = dom.create_element("div");
        let b = dom.create_element("span");
        let c = dom.create_text_node("x");
        dom.append_child(dom.body(), a).unwrap();
        dom.append_child(a, c).unwrap();
        dom.insert_before(a, b, Some(c)).unwrap();
        assert_eq!(dom.children(a), vec![b, c]);
        dom.append_child(dom.body(), c).unwrap();
        assert_eq!(dom.children(a), vec![b]);
        assert_eq!(dom.parent(c), Some(dom.body()));
        dom.remove(b);
        assert_eq!(dom.outer_html(dom.body()), "<body><div></div>x</body>");
    }

    #[test]
    fn test_hierarchy_errors() {
        let dom = Dom::new();
        let a = dom.create_element("div");
        let b = dom.create_element("div");
        dom.append_child(a, b).unwrap();
        assert!(dom.append_child(b, a).is_err());
        assert!(dom.remove_child(dom.body(), b).is_err());
        let stray = dom.create_element("p");
        assert!(dom.insert_before(a, dom.create_element("i"), Some(stray)).is_err());
    }

    #[test]
    fn test_fragment_insertion_moves_children() {
        let dom = Dom::new();
        let fragment = dom.create_document_fragment();
        let a = dom.create_element("a");
        let b = dom.create_element("b");
        dom.append_child(fragment, a).unwrap();
        dom.append_child(fragment, b).unwrap();
        dom.append_child(dom.body(), fragment).unwrap();
        assert_eq!(dom.children(dom.body()), vec![a, b]);
        assert!(dom.children(fragment).is_empty());
    }

    #[test]
    fn test_attribute_case_and_namespaces() {
        let dom = Dom::new();
        let el = dom.create_element("div");
        dom.set_attribute(el, "Data-X", "1");
        assert_eq!(dom.get_attribute(el, "data-x").as_deref(), Some("1"));
        dom.set_attribute_ns(el, Some(XLINK_NAMESPACE), "xlink:href", "#a");
        assert_eq!(dom.get_attribute(el, "xlink:href").as_deref(), Some("#a"));
        dom.remove_attribute_ns(el, Some(XLINK_NAMESPACE), "href");
        assert!(!dom.has_attribute(el, "xlink:href"));
        assert_eq!(dom.outer_html(el), r#"<div data-x="1"></div>"#);
    }

    #[test]
    fn test_idl_properties() {
        let dom = Dom::new();
        let input = dom.create_element("input");
        dom.set_property(input, "disabled", Value::Bool(true));
        assert!(dom.has_attribute(input, "disabled"));
        dom.set_property(input, "disabled", Value::Bool(false));
        assert!(!dom.has_attribute(input, "disabled"));

        dom.set_attribute(input, "value", "a");
        assert_eq!(dom.get_property(input, "value"), Value::from("a"));
        dom.set_property(input, "value", Value::from("b"));
        assert_eq!(dom.get_property(input, "value"), Value::from("b"));
        assert_eq!(dom.get_attribute(input, "value").as_deref(), Some("a"));
        assert!(dom.idl_property(dom.create_element("div"), "value").is_none());
    }

    #[test]
    fn test_event_bubbling_and_stop_propagation() {
        let dom = Dom::new();
        let outer = dom.create_element("div");
        let inner = dom.create_element("button");
        dom.append_child(dom.body(), outer).unwrap();
        dom.append_child(outer, inner).unwrap();

        let log = Rc::new(RefCell::new(vec![]));
        let log_outer = log.clone();
        let outer_listener = Listener::new(move |e| {
            log_outer.borrow_mut().push(format!("outer:{:?}", e.target()));
        });
        let log_window = log.clone();
        let window_listener = Listener::new(move |_| log_window.borrow_mut().push("window".to_string()));
        dom.add_event_listener(outer, "ping", &outer_listener);
        dom.add_event_listener(outer, "ping", &outer_listener);
        dom.add_event_listener(dom.window(), "ping", &window_listener);

        dom.dispatch_event(inner, Rc::new(Event::custom("ping", Value::from(1), true)));
        assert_eq!(*log.borrow(), vec![format!("outer:{:?}", Some(inner)), "window".to_string()]);

        log.borrow_mut().clear();
        dom.dispatch_event(inner, Rc::new(Event::new("ping", false)));
        assert!(log.borrow().is_empty());

        dom.remove_event_listener(outer, "ping", &outer_listener);
        dom.dispatch_event(inner, Rc::new(Event::new("ping", true)));
        assert_eq!(*log.borrow(), vec!["window".to_string()]);
    }

    #[test]
    fn test_mutation_observer_filters_and_delivers() {
        let dom = Dom::new();
        let host = dom.create_element("div");
        dom.append_child(dom.body(), host).unwrap();
        let seen = Rc::new(RefCell::new(vec![]));
        let seen_cb = seen.clone();
        let observer = dom.create_observer(move |_, records| {
            seen_cb.borrow_mut().extend(records.iter().cloned());
        });
        dom.observe(
            observer,
            host,
            MutationObserverInit {
                child_list: true,
                subtree: true,
                attribute_filter: Some(vec!["slot".to_string()]),
                ..Default::default()
            },
        );
        let child = dom.create_element("p");
        dom.append_child(host, child).unwrap();
        dom.set_attribute(child, "class", "x");
        dom.set_attribute(child, "slot", "a");
        assert!(seen.borrow().is_empty());
        assert_eq!(dom.deliver_mutation_records(), 1);
        assert_eq!(
            *seen.borrow(),
            vec![
                MutationRecord::ChildList {
                    target: host,
                    added: vec![child],
                    removed: vec![]
                },
                MutationRecord::Attributes {
                    target: child,
                    name: "slot".to_string(),
                    old_value: None
                },
            ]
        );
        dom.disconnect_observer(observer);
        dom.set_attribute(child, "slot", "b");
        assert_eq!(dom.deliver_mutation_records(), 0);
    }

    struct Recorder {
        log: Rc<RefCell<Vec<String>>>,
    }

    impl CustomElement for Recorder {
        fn connected(&self, _dom: &Dom, _node: NodeId) {
            self.log.borrow_mut().push("connected".to_string());
        }
        fn disconnected(&self, _dom: &Dom, _node: NodeId) {
            self.log.borrow_mut().push("disconnected".to_string());
        }
        fn attribute_changed(&self, _: &Dom, _: NodeId, name: &str, old: Option<&str>, new: Option<&str>) {
            self.log
                .borrow_mut()
                .push(format!("{}:{:?}->{:?}", name, old, new));
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    struct RecordingDefinition {
        log: Rc<RefCell<Vec<String>>>,
    }

    impl ElementDefinition for RecordingDefinition {
        fn observed_attributes(&self) -> Vec<String> {
            vec!["count".to_string()]
        }
        fn construct(&self, _dom: &Dom, _node: NodeId) -> Rc<dyn CustomElement> {
            self.log.borrow_mut().push("constructed".to_string());
            Rc::new(Recorder { log: self.log.clone() })
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_custom_element_reactions() {
        let dom = Dom::new();
        let log = Rc::new(RefCell::new(vec![]));
        dom.define("x-recorder", Rc::new(RecordingDefinition { log: log.clone() }))
            .unwrap();
        assert!(dom
            .define("x-recorder", Rc::new(RecordingDefinition { log: log.clone() }))
            .is_err());

        let el = dom.create_element("x-recorder");
        dom.set_attribute(el, "count", "1");
        dom.set_attribute(el, "other", "1");
        dom.append_child(dom.body(), el).unwrap();
        dom.remove(el);
        assert_eq!(
            *log.borrow(),
            vec!["constructed", "count:None->Some(\"1\")", "connected", "disconnected"]
        );
        assert!(dom.custom_element(el).is_some());
    }

    #[test]
    fn test_define_upgrades_connected_elements() {
        let dom = Dom::new();
        let el = dom.create_element("x-late");
        dom.append_child(dom.body(), el).unwrap();
        let log = Rc::new(RefCell::new(vec![]));
        dom.define("x-late", Rc::new(RecordingDefinition { log: log.clone() }))
            .unwrap();
        assert_eq!(*log.borrow(), vec!["constructed", "connected"]);
    }

    #[test]
    fn test_shadow_root_is_connected_through_host() {
        let dom = Dom::new();
        let host = dom.create_element("div");
        let root = dom.attach_shadow(host, ShadowRootMode::Open).unwrap();
        assert!(dom.attach_shadow(host, ShadowRootMode::Open).is_err());
        let inner = dom.create_element("p");
        dom.append_child(root, inner).unwrap();
        assert!(!dom.is_connected(inner));
        dom.append_child(dom.body(), host).unwrap();
        assert!(dom.is_connected(inner));
        assert_eq!(dom.inner_html(root), "<p></p>");
        assert_eq!(dom.outer_html(host), "<div></div>");
    }

    #[test]
    fn test_closest_and_query() {
        let dom = Dom::new();
        let outer = dom.create_element("section");
        let inner = dom.create_element("div");
        dom.set_attribute(outer, "theme", "dark");
        dom.append_child(outer, inner).unwrap();
        assert_eq!(dom.closest_with_attribute(inner, "theme"), Some(outer));
        assert_eq!(dom.query_with_attribute(outer, "theme"), vec![outer]);
        assert_eq!(dom.closest_with_attribute(inner, "nope"), None);
    }
}
