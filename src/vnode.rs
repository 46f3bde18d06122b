//! Virtual Node Module for the nlib rendering engine
//!
//! One record type for every virtual node; what a node supports is decided by
//! a capability set fixed at creation. Parent links are weak so trees never
//! form reference cycles.

use indexmap::IndexMap;
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::bindable::{serialize_segments, Segment};
use crate::dom::Listener;
use crate::error::{
    EngineError, Result, ERR_TREE_ATTRIBUTE_NAME, ERR_TREE_CAPABILITY, ERR_TREE_CYCLE,
    ERR_TREE_HAS_PARENT, ERR_TREE_NOT_A_CHILD,
};
use crate::parse::{
    correct_svg_attribute_name, escape_bare_ampersands, is_void_element, HTML_NAMESPACE, SVG_NAMESPACE,
};
use crate::render::RenderState;
use crate::value::{serialize_attribute, Value};

// ═══════════════════════════════════════════════════════════════════════════════
// CAPABILITIES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const ATTRIBUTE: Capabilities = Capabilities(1);
    pub const CHILD: Capabilities = Capabilities(1 << 1);
    pub const PARENT: Capabilities = Capabilities(1 << 2);
    pub const EVENT: Capabilities = Capabilities(1 << 3);
    pub const TEXT: Capabilities = Capabilities(1 << 4);

    pub const fn union(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 | other.0)
    }

    pub const fn contains(self, other: Capabilities) -> bool {
        self.0 & other.0 == other.0
    }

    fn describe(self) -> &'static str {
        match self {
            Capabilities::ATTRIBUTE => "attribute",
            Capabilities::CHILD => "child",
            Capabilities::PARENT => "parent",
            Capabilities::EVENT => "event",
            Capabilities::TEXT => "text",
            _ => "mixed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Element,
    Text,
    Comment,
    Fragment,
}

impl NodeKind {
    pub fn capabilities(self) -> Capabilities {
        use Capabilities as C;
        match self {
            NodeKind::Element => C::ATTRIBUTE.union(C::CHILD).union(C::PARENT).union(C::EVENT),
            NodeKind::Text | NodeKind::Comment => C::CHILD.union(C::TEXT),
            NodeKind::Fragment => C::PARENT,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// NODE
// ═══════════════════════════════════════════════════════════════════════════════

struct Inner {
    kind: NodeKind,
    tag: String,
    namespace: Option<String>,
    parent: RefCell<Weak<Inner>>,
    children: RefCell<Vec<VNode>>,
    attributes: RefCell<IndexMap<String, Value>>,
    listeners: RefCell<Vec<(String, Listener)>>,
    text: RefCell<Vec<Segment>>,
    render_state: RefCell<Option<RenderState>>,
}

/// Shared handle to a virtual node. Clones are the same node.
#[derive(Clone)]
pub struct VNode(Rc<Inner>);

impl VNode {
    fn with(kind: NodeKind, tag: &str, namespace: Option<&str>) -> Self {
        VNode(Rc::new(Inner {
            kind,
            tag: tag.to_string(),
            namespace: namespace.map(str::to_string),
            parent: RefCell::new(Weak::new()),
            children: RefCell::new(vec![]),
            attributes: RefCell::new(IndexMap::new()),
            listeners: RefCell::new(vec![]),
            text: RefCell::new(vec![]),
            render_state: RefCell::new(None),
        }))
    }

    pub fn element(tag: &str) -> Self {
        Self::with(NodeKind::Element, &tag.to_ascii_lowercase(), Some(HTML_NAMESPACE))
    }

    pub fn element_ns(tag: &str, namespace: Option<&str>) -> Self {
        match namespace {
            None | Some(HTML_NAMESPACE) => Self::element(tag),
            Some(ns) => Self::with(NodeKind::Element, tag, Some(ns)),
        }
    }

    pub fn text(text: &str) -> Self {
        Self::text_segments(vec![Segment::literal(text)])
    }

    pub fn text_segments(segments: Vec<Segment>) -> Self {
        let node = Self::with(NodeKind::Text, "", None);
        *node.0.text.borrow_mut() = segments;
        node
    }

    pub fn comment(text: &str) -> Self {
        let node = Self::with(NodeKind::Comment, "", None);
        *node.0.text.borrow_mut() = vec![Segment::literal(text)];
        node
    }

    pub fn fragment() -> Self {
        Self::with(NodeKind::Fragment, "", None)
    }

    pub fn ptr_eq(&self, other: &VNode) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Address-based identity, stable for the node's lifetime.
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn kind(&self) -> NodeKind {
        self.0.kind
    }

    pub fn capabilities(&self) -> Capabilities {
        self.0.kind.capabilities()
    }

    pub fn is_attribute_node(&self) -> bool {
        self.capabilities().contains(Capabilities::ATTRIBUTE)
    }

    pub fn is_parent_node(&self) -> bool {
        self.capabilities().contains(Capabilities::PARENT)
    }

    pub fn is_child_node(&self) -> bool {
        self.capabilities().contains(Capabilities::CHILD)
    }

    pub fn is_event_node(&self) -> bool {
        self.capabilities().contains(Capabilities::EVENT)
    }

    pub fn is_text_node(&self) -> bool {
        self.capabilities().contains(Capabilities::TEXT)
    }

    fn require(&self, capability: Capabilities, operation: &str) -> Result<()> {
        if self.capabilities().contains(capability) {
            Ok(())
        } else {
            Err(EngineError::tree(
                ERR_TREE_CAPABILITY,
                format!(
                    "{} is not a {} node and does not support {}",
                    self.node_name(),
                    capability.describe(),
                    operation
                ),
            ))
        }
    }

    pub fn node_name(&self) -> String {
        match self.0.kind {
            NodeKind::Element if self.is_html() => self.0.tag.to_uppercase(),
            NodeKind::Element => self.0.tag.clone(),
            NodeKind::Text => "#text".to_string(),
            NodeKind::Comment => "#comment".to_string(),
            NodeKind::Fragment => "#document-fragment".to_string(),
        }
    }

    /// Local name of an element, empty for other kinds.
    pub fn tag(&self) -> &str {
        &self.0.tag
    }

    pub fn namespace(&self) -> Option<&str> {
        self.0.namespace.as_deref()
    }

    fn is_html(&self) -> bool {
        self.0.namespace.as_deref() == Some(HTML_NAMESPACE)
    }

    pub fn render_state(&self) -> Ref<'_, Option<RenderState>> {
        self.0.render_state.borrow()
    }

    pub fn render_state_mut(&self) -> RefMut<'_, Option<RenderState>> {
        self.0.render_state.borrow_mut()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Attributes
    // ───────────────────────────────────────────────────────────────────────────

    fn attribute_key(&self, name: &str) -> Result<String> {
        if name.is_empty() || name.chars().any(|c| c.is_whitespace() || c == '"' || c == '\'' || c == '=' || c == '>' || c == '/') {
            return Err(EngineError::tree(
                ERR_TREE_ATTRIBUTE_NAME,
                format!("'{}' is not a valid attribute name", name),
            ));
        }
        Ok(if self.0.namespace.as_deref() == Some(SVG_NAMESPACE) {
            correct_svg_attribute_name(name, Some(SVG_NAMESPACE))
        } else {
            name.to_ascii_lowercase()
        })
    }

    pub fn set_attribute(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.require(Capabilities::ATTRIBUTE, "setAttribute")?;
        let key = self.attribute_key(name)?;
        self.0.attributes.borrow_mut().insert(key, value.into());
        Ok(())
    }

    pub fn get_attribute(&self, name: &str) -> Option<Value> {
        let key = self.attribute_key(name).ok()?;
        self.0.attributes.borrow().get(&key).cloned()
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.get_attribute(name).is_some()
    }

    pub fn remove_attribute(&self, name: &str) -> Result<()> {
        self.require(Capabilities::ATTRIBUTE, "removeAttribute")?;
        let key = self.attribute_key(name)?;
        self.0.attributes.borrow_mut().shift_remove(&key);
        Ok(())
    }

    /// Snapshot of the attribute map in insertion order.
    pub fn attributes(&self) -> IndexMap<String, Value> {
        self.0.attributes.borrow().clone()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Listeners
    // ───────────────────────────────────────────────────────────────────────────

    pub fn add_event_listener(&self, event_type: &str, listener: &Listener) -> Result<()> {
        self.require(Capabilities::EVENT, "addEventListener")?;
        let mut listeners = self.0.listeners.borrow_mut();
        if !listeners
            .iter()
            .any(|(t, l)| t == event_type && l.guid() == listener.guid())
        {
            listeners.push((event_type.to_string(), listener.clone()));
        }
        Ok(())
    }

    pub fn remove_event_listener(&self, event_type: &str, listener: &Listener) -> Result<()> {
        self.require(Capabilities::EVENT, "removeEventListener")?;
        self.0
            .listeners
            .borrow_mut()
            .retain(|(t, l)| !(t == event_type && l.guid() == listener.guid()));
        Ok(())
    }

    pub fn listeners(&self) -> Vec<(String, Listener)> {
        self.0.listeners.borrow().clone()
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Text
    // ───────────────────────────────────────────────────────────────────────────

    pub fn set_text(&self, text: &str) -> Result<()> {
        self.set_segments(vec![Segment::literal(text)])
    }

    pub fn set_segments(&self, segments: Vec<Segment>) -> Result<()> {
        self.require(Capabilities::TEXT, "text")?;
        *self.0.text.borrow_mut() = segments;
        Ok(())
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.0.text.borrow().clone()
    }

    /// Joined text; bound segments appear in template syntax.
    pub fn text_content(&self) -> String {
        match self.0.kind {
            NodeKind::Text | NodeKind::Comment => serialize_segments(&self.0.text.borrow()),
            _ => self
                .0
                .children
                .borrow()
                .iter()
                .filter(|c| c.kind() != NodeKind::Comment)
                .map(|c| c.text_content())
                .collect(),
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Tree
    // ───────────────────────────────────────────────────────────────────────────

    pub fn parent_node(&self) -> Option<VNode> {
        self.0.parent.borrow().upgrade().map(VNode)
    }

    /// Read-only snapshot; mutate through the tree operations.
    pub fn child_nodes(&self) -> Vec<VNode> {
        self.0.children.borrow().clone()
    }

    pub fn first_child(&self) -> Option<VNode> {
        self.0.children.borrow().first().cloned()
    }

    pub fn last_child(&self) -> Option<VNode> {
        self.0.children.borrow().last().cloned()
    }

    fn index_in_parent(&self) -> Option<(VNode, usize)> {
        let parent = self.parent_node()?;
        let index = parent
            .0
            .children
            .borrow()
            .iter()
            .position(|c| c.ptr_eq(self))?;
        Some((parent, index))
    }

    pub fn next_sibling(&self) -> Option<VNode> {
        let (parent, index) = self.index_in_parent()?;
        let sibling = parent.0.children.borrow().get(index + 1).cloned();
        sibling
    }

    pub fn previous_sibling(&self) -> Option<VNode> {
        let (parent, index) = self.index_in_parent()?;
        let sibling = index
            .checked_sub(1)
            .and_then(|i| parent.0.children.borrow().get(i).cloned());
        sibling
    }

    pub fn root_node(&self) -> VNode {
        let mut current = self.clone();
        while let Some(parent) = current.parent_node() {
            current = parent;
        }
        current
    }

    /// Inclusive: a node contains itself.
    pub fn contains(&self, other: &VNode) -> bool {
        let mut current = Some(other.clone());
        while let Some(node) = current {
            if node.ptr_eq(self) {
                return true;
            }
            current = node.parent_node();
        }
        false
    }

    fn check_insertable(&self, child: &VNode) -> Result<()> {
        self.require(Capabilities::PARENT, "children")?;
        if !child.is_child_node() {
            return Err(EngineError::tree(
                ERR_TREE_CAPABILITY,
                format!("{} cannot be inserted as a child", child.node_name()),
            ));
        }
        if child.parent_node().is_some() {
            return Err(EngineError::tree(
                ERR_TREE_HAS_PARENT,
                format!("{} already has a parent", child.node_name()),
            ));
        }
        if child.contains(self) {
            return Err(EngineError::tree(
                ERR_TREE_CYCLE,
                format!("{} is an ancestor of {}", child.node_name(), self.node_name()),
            ));
        }
        Ok(())
    }

    fn insert_at(&self, index: usize, child: &VNode) -> Result<()> {
        self.check_insertable(child)?;
        *child.0.parent.borrow_mut() = Rc::downgrade(&self.0);
        let mut children = self.0.children.borrow_mut();
        let index = index.min(children.len());
        children.insert(index, child.clone());
        Ok(())
    }

    fn position_of(&self, child: &VNode) -> Result<usize> {
        self.0
            .children
            .borrow()
            .iter()
            .position(|c| c.ptr_eq(child))
            .ok_or_else(|| {
                EngineError::tree(
                    ERR_TREE_NOT_A_CHILD,
                    format!("{} is not a child of {}", child.node_name(), self.node_name()),
                )
            })
    }

    pub fn append_child(&self, child: &VNode) -> Result<()> {
        let len = self.0.children.borrow().len();
        self.insert_at(len, child)
    }

    pub fn append_children(&self, children: &[VNode]) -> Result<()> {
        for child in children {
            self.append_child(child)?;
        }
        Ok(())
    }

    pub fn prepend_child(&self, child: &VNode) -> Result<()> {
        self.insert_at(0, child)
    }

    pub fn insert_before(&self, child: &VNode, reference: &VNode) -> Result<()> {
        self.check_insertable(child)?;
        let index = self.position_of(reference)?;
        self.insert_at(index, child)
    }

    pub fn insert_after(&self, child: &VNode, reference: &VNode) -> Result<()> {
        self.check_insertable(child)?;
        let index = self.position_of(reference)?;
        self.insert_at(index + 1, child)
    }

    pub fn remove_child(&self, child: &VNode) -> Result<()> {
        let index = self.position_of(child)?;
        self.0.children.borrow_mut().remove(index);
        *child.0.parent.borrow_mut() = Weak::new();
        Ok(())
    }

    pub fn remove_all_children(&self) {
        let children = std::mem::take(&mut *self.0.children.borrow_mut());
        for child in children {
            *child.0.parent.borrow_mut() = Weak::new();
        }
    }

    pub fn replace_child(&self, new_child: &VNode, old_child: &VNode) -> Result<()> {
        if new_child.ptr_eq(old_child) {
            self.position_of(old_child)?;
            return Ok(());
        }
        self.check_insertable(new_child)?;
        let index = self.position_of(old_child)?;
        self.remove_child(old_child)?;
        self.insert_at(index, new_child)
    }

    /// Detaches this node from its parent, if any.
    pub fn remove(&self) {
        if let Some(parent) = self.parent_node() {
            // Parent link implies membership.
            let _ = parent.remove_child(self);
        }
    }

    pub fn before(&self, node: &VNode) -> Result<()> {
        let parent = self.parent_or_err()?;
        parent.insert_before(node, self)
    }

    pub fn after(&self, node: &VNode) -> Result<()> {
        let parent = self.parent_or_err()?;
        parent.insert_after(node, self)
    }

    pub fn replace_with(&self, node: &VNode) -> Result<()> {
        let parent = self.parent_or_err()?;
        parent.replace_child(node, self)
    }

    fn parent_or_err(&self) -> Result<VNode> {
        self.parent_node().ok_or_else(|| {
            EngineError::tree(
                ERR_TREE_NOT_A_CHILD,
                format!("{} has no parent", self.node_name()),
            )
        })
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Cloning and serialization
    // ───────────────────────────────────────────────────────────────────────────

    /// Copies attributes, listeners (same callbacks) and text. Render state
    /// and the parent link are not copied.
    pub fn clone_node(&self, deep: bool) -> VNode {
        let copy = Self::with(self.0.kind, &self.0.tag, self.0.namespace.as_deref());
        *copy.0.attributes.borrow_mut() = self.0.attributes.borrow().clone();
        *copy.0.listeners.borrow_mut() = self.0.listeners.borrow().clone();
        *copy.0.text.borrow_mut() = self.0.text.borrow().clone();
        if deep {
            for child in self.0.children.borrow().iter() {
                let child_copy = child.clone_node(true);
                *child_copy.0.parent.borrow_mut() = Rc::downgrade(&copy.0);
                copy.0.children.borrow_mut().push(child_copy);
            }
        }
        copy
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        self.write_html(&mut out);
        out
    }

    fn write_html(&self, out: &mut String) {
        match self.0.kind {
            NodeKind::Text => out.push_str(
                &escape_bare_ampersands(&self.text_content())
                    .replace('<', "&lt;")
                    .replace('>', "&gt;"),
            ),
            NodeKind::Comment => {
                out.push_str("<!--");
                out.push_str(&self.text_content());
                out.push_str("-->");
            }
            NodeKind::Fragment => {
                for child in self.0.children.borrow().iter() {
                    child.write_html(out);
                }
            }
            NodeKind::Element => {
                out.push('<');
                out.push_str(&self.0.tag);
                for (name, value) in self.0.attributes.borrow().iter() {
                    if let Some(text) = serialize_attribute(value) {
                        out.push_str(&format!(" {}=\"{}\"", name, text.replace('&', "&amp;").replace('"', "&quot;")));
                    }
                }
                out.push('>');
                if self.is_html() && is_void_element(&self.0.tag) {
                    return;
                }
                for child in self.0.children.borrow().iter() {
                    child.write_html(out);
                }
                out.push_str("</");
                out.push_str(&self.0.tag);
                out.push('>');
            }
        }
    }
}

impl fmt::Display for VNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_html())
    }
}

impl fmt::Debug for VNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VNode({})", self.to_html())
    }
}

impl PartialEq for VNode {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn div() -> VNode {
        VNode::element("div")
    }

    #[test]
    fn test_capability_sets() {
        let el = div();
        assert!(el.is_attribute_node() && el.is_parent_node() && el.is_child_node() && el.is_event_node());
        assert!(!el.is_text_node());
        let text = VNode::text("x");
        assert!(text.is_child_node() && text.is_text_node());
        assert!(!text.is_parent_node());
        let fragment = VNode::fragment();
        assert!(fragment.is_parent_node() && !fragment.is_child_node());
        assert_eq!(el.node_name(), "DIV");
        assert_eq!(text.node_name(), "#text");
    }

    #[test]
    fn test_insert_rejects_node_with_parent() {
        let (a, b, child) = (div(), div(), VNode::text("x"));
        a.append_child(&child).unwrap();
        let err = b.append_child(&child).unwrap_err();
        assert_eq!(err.code, ERR_TREE_HAS_PARENT);
        assert_eq!(err.kind, ErrorKind::Tree);
    }

    #[test]
    fn test_insert_rejects_cycles_and_capabilities() {
        let (a, b) = (div(), div());
        a.append_child(&b).unwrap();
        assert_eq!(b.append_child(&a).unwrap_err().code, ERR_TREE_CYCLE);
        assert_eq!(a.append_child(&a).unwrap_err().code, ERR_TREE_CYCLE);
        let text = VNode::text("t");
        assert_eq!(text.append_child(&div()).unwrap_err().code, ERR_TREE_CAPABILITY);
        assert_eq!(a.append_child(&VNode::fragment()).unwrap_err().code, ERR_TREE_CAPABILITY);
        assert_eq!(text.set_attribute("a", "b").unwrap_err().code, ERR_TREE_CAPABILITY);
        assert_eq!(a.set_attribute("", "b").unwrap_err().code, ERR_TREE_ATTRIBUTE_NAME);
    }

    #[test]
    fn test_sibling_operations_keep_parent_links() {
        let parent = div();
        let (a, b, c) = (VNode::text("a"), VNode::text("b"), VNode::text("c"));
        parent.append_child(&b).unwrap();
        parent.prepend_child(&a).unwrap();
        parent.insert_after(&c, &b).unwrap();
        assert_eq!(parent.text_content(), "abc");
        assert!(a.next_sibling().unwrap().ptr_eq(&b));
        assert!(c.previous_sibling().unwrap().ptr_eq(&b));
        for child in parent.child_nodes() {
            assert!(child.parent_node().unwrap().ptr_eq(&parent));
            let count = parent.child_nodes().iter().filter(|c| c.ptr_eq(&child)).count();
            assert_eq!(count, 1);
        }

        let d = VNode::text("d");
        parent.replace_child(&d, &b).unwrap();
        assert!(b.parent_node().is_none());
        assert_eq!(parent.text_content(), "adc");
        assert_eq!(parent.remove_child(&b).unwrap_err().code, ERR_TREE_NOT_A_CHILD);

        a.remove();
        c.before(&b).unwrap();
        assert_eq!(parent.text_content(), "dbc");
        parent.remove_all_children();
        assert!(parent.child_nodes().is_empty());
        assert!(d.parent_node().is_none());
    }

    #[test]
    fn test_contains_is_transitive_and_inclusive() {
        let (a, b, c) = (div(), div(), VNode::text("c"));
        a.append_child(&b).unwrap();
        b.append_child(&c).unwrap();
        assert!(a.contains(&c));
        assert!(a.contains(&a));
        assert!(!c.contains(&a));
        assert!(c.root_node().ptr_eq(&a));
    }

    #[test]
    fn test_attribute_keys_are_normalized() {
        let el = div();
        el.set_attribute("Data-X", "1").unwrap();
        assert_eq!(el.get_attribute("data-x"), Some(Value::from("1")));
        let svg = VNode::element_ns("svg", Some(SVG_NAMESPACE));
        svg.set_attribute("viewbox", "0 0 1 1").unwrap();
        assert!(svg.attributes().contains_key("viewBox"));
        assert_eq!(svg.node_name(), "svg");
    }

    #[test]
    fn test_deep_clone_serializes_equal_and_shares_nothing() {
        let root = div();
        root.set_attribute("class", "a").unwrap();
        let listener = Listener::new(|_| {});
        root.add_event_listener("click", &listener).unwrap();
        let span = VNode::element("span");
        span.append_child(&VNode::text("hi <b>")).unwrap();
        root.append_child(&span).unwrap();

        let copy = root.clone_node(true);
        assert_eq!(copy.to_html(), root.to_html());
        assert_eq!(root.to_html(), r#"<div class="a"><span>hi &lt;b&gt;</span></div>"#);
        assert!(!copy.ptr_eq(&root));
        let (orig_span, copy_span) = (root.first_child().unwrap(), copy.first_child().unwrap());
        assert!(!orig_span.ptr_eq(&copy_span));
        assert!(!orig_span.first_child().unwrap().ptr_eq(&copy_span.first_child().unwrap()));
        assert!(copy_span.parent_node().unwrap().ptr_eq(&copy));
        assert_eq!(copy.listeners()[0].1.guid(), listener.guid());

        let shallow = root.clone_node(false);
        assert!(shallow.child_nodes().is_empty());
    }

    #[test]
    fn test_text_ampersands_serialize_once() {
        let p = VNode::element("p");
        p.append_child(&VNode::text("a & b")).unwrap();
        p.append_child(&VNode::text(" c &amp; d")).unwrap();
        assert_eq!(p.to_html(), "<p>a &amp; b c &amp; d</p>");
    }

    #[test]
    fn test_listener_dedup_by_identity() {
        let el = div();
        let listener = Listener::new(|_| {});
        el.add_event_listener("click", &listener).unwrap();
        el.add_event_listener("click", &listener.clone()).unwrap();
        assert_eq!(el.listeners().len(), 1);
        el.remove_event_listener("click", &listener).unwrap();
        assert!(el.listeners().is_empty());
    }
}
