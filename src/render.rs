//! Render Module for the nlib rendering engine
//!
//! Turns virtual trees into host DOM. A node rendered for the first time is
//! built and populated on the spot; a node rendered before is diffed against
//! the shallow copy kept from its last render and patched through a list of
//! [`DomAction`]s. Actions are coalesced per `(node, channel)` before they are
//! applied, either inline (`sync`) or from the shared render queue.

use indexmap::IndexMap;
use std::cell::RefCell;
use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use crate::component::ComponentElement;
use crate::dom::{
    Dom, IdlType, Listener, NodeId, NodeType, XLINK_NAMESPACE, XMLNS_NAMESPACE, XML_NAMESPACE,
};
use crate::error::Result;
use crate::parse::decode_entities;
use crate::queue::{self, Drained, Task};
use crate::value::{parse_boolean, serialize_attribute, Value};
use crate::vnode::{NodeKind, VNode};

/// Per-node bookkeeping kept between renders.
#[derive(Debug, Clone)]
pub struct RenderState {
    pub dom_node: NodeId,
    /// Shallow copy of the node as of the last render that changed it.
    pub last_rendered_self: Option<VNode>,
    pub last_rendered_children: Vec<VNode>,
    /// Stand-in for `dom_node` in its parent while the node is displaced,
    /// e.g. a `<slot>` replaced by slotted content.
    pub anchor: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub enum DomAction {
    SetAttribute {
        node: NodeId,
        name: String,
        value: Value,
        prevent_idl: bool,
    },
    RemoveAttribute {
        node: NodeId,
        name: String,
    },
    AddEventListener {
        node: NodeId,
        event_type: String,
        listener: Listener,
    },
    RemoveEventListener {
        node: NodeId,
        event_type: String,
        listener: Listener,
    },
    NodeValue {
        node: NodeId,
        value: String,
    },
    RemoveNode {
        node: NodeId,
    },
    AddNodeToEnd {
        node: NodeId,
        parent: NodeId,
    },
    AddNodeBefore {
        node: NodeId,
        parent: NodeId,
        before: NodeId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ActionKey {
    Attribute(NodeId, String),
    Event(NodeId, u64),
    Dml(NodeId),
    NodeValue(NodeId),
}

impl DomAction {
    pub fn name(&self) -> &'static str {
        match self {
            DomAction::SetAttribute { .. } => "setAttribute",
            DomAction::RemoveAttribute { .. } => "removeAttribute",
            DomAction::AddEventListener { .. } => "addEventListener",
            DomAction::RemoveEventListener { .. } => "removeEventListener",
            DomAction::NodeValue { .. } => "nodeValue",
            DomAction::RemoveNode { .. } => "removeNode",
            DomAction::AddNodeToEnd { .. } => "addNodeToEnd",
            DomAction::AddNodeBefore { .. } => "addNodeBefore",
        }
    }

    pub fn node(&self) -> NodeId {
        match self {
            DomAction::SetAttribute { node, .. }
            | DomAction::RemoveAttribute { node, .. }
            | DomAction::AddEventListener { node, .. }
            | DomAction::RemoveEventListener { node, .. }
            | DomAction::NodeValue { node, .. }
            | DomAction::RemoveNode { node }
            | DomAction::AddNodeToEnd { node, .. }
            | DomAction::AddNodeBefore { node, .. } => *node,
        }
    }

    fn key(&self) -> ActionKey {
        match self {
            DomAction::SetAttribute { node, name, .. } | DomAction::RemoveAttribute { node, name } => {
                ActionKey::Attribute(*node, name.clone())
            }
            DomAction::AddEventListener { node, listener, .. }
            | DomAction::RemoveEventListener { node, listener, .. } => {
                ActionKey::Event(*node, listener.guid())
            }
            DomAction::NodeValue { node, .. } => ActionKey::NodeValue(*node),
            DomAction::RemoveNode { node }
            | DomAction::AddNodeToEnd { node, .. }
            | DomAction::AddNodeBefore { node, .. } => ActionKey::Dml(*node),
        }
    }
}

/// Keeps the last action per key; a replaced action moves to the end.
pub fn coalesce(actions: impl IntoIterator<Item = DomAction>) -> Vec<DomAction> {
    let mut map: IndexMap<ActionKey, DomAction> = IndexMap::new();
    push_coalesced(&mut map, actions);
    map.into_values().collect()
}

fn push_coalesced(map: &mut IndexMap<ActionKey, DomAction>, actions: impl IntoIterator<Item = DomAction>) {
    for action in actions {
        let key = action.key();
        map.shift_remove(&key);
        map.insert(key, action);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Diff the children of nodes that were rendered before.
    pub deep_update: bool,
    /// Apply the diff inline instead of through the render queue.
    pub sync: bool,
}

impl RenderOptions {
    pub const DEEP_SYNC: RenderOptions = RenderOptions {
        deep_update: true,
        sync: true,
    };
    pub const DEEP: RenderOptions = RenderOptions {
        deep_update: true,
        sync: false,
    };
}

pub struct RenderOutput {
    /// Root DOM nodes; a fragment root yields its children.
    pub nodes: Vec<NodeId>,
    /// Coalesced diff actions of this render (first-time construction is
    /// not reported).
    pub actions: Vec<DomAction>,
    /// Present when the actions were handed to the render queue.
    pub drained: Option<Drained>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// DEFERRED ACTIONS
// ═══════════════════════════════════════════════════════════════════════════════

struct PendingActions {
    dom: Dom,
    actions: IndexMap<ActionKey, DomAction>,
}

thread_local! {
    static PENDING: RefCell<Vec<PendingActions>> = RefCell::new(vec![]);
    static FLUSH_TASK: Task = Rc::new(flush_pending);
}

fn flush_pending() {
    let batches = PENDING.with(|pending| std::mem::take(&mut *pending.borrow_mut()));
    for batch in batches {
        apply_actions(&batch.dom, batch.actions.into_values());
    }
}

fn defer(dom: &Dom, actions: Vec<DomAction>) -> Drained {
    PENDING.with(|pending| {
        let mut pending = pending.borrow_mut();
        match pending.iter_mut().find(|p| p.dom.ptr_eq(dom)) {
            Some(batch) => push_coalesced(&mut batch.actions, actions),
            None => {
                let mut map = IndexMap::new();
                push_coalesced(&mut map, actions);
                pending.push(PendingActions {
                    dom: dom.clone(),
                    actions: map,
                });
            }
        }
    });
    FLUSH_TASK.with(queue::add)
}

// ═══════════════════════════════════════════════════════════════════════════════
// RENDERING
// ═══════════════════════════════════════════════════════════════════════════════

/// Renders `vnode` into DOM nodes owned by the virtual tree.
pub fn render_dom(dom: &Dom, vnode: &VNode, options: RenderOptions) -> Result<RenderOutput> {
    if vnode.render_state().is_none() {
        let dom_node = match vnode.kind() {
            NodeKind::Fragment => dom.create_document_fragment(),
            _ => create_dom_node(dom, vnode),
        };
        if vnode.kind() != NodeKind::Fragment {
            *vnode.render_state_mut() = Some(RenderState {
                dom_node,
                last_rendered_self: None,
                last_rendered_children: vec![],
                anchor: None,
            });
            build(dom, vnode)?;
            return Ok(RenderOutput {
                nodes: vec![dom_node],
                actions: vec![],
                drained: None,
            });
        }
        *vnode.render_state_mut() = Some(RenderState {
            dom_node,
            last_rendered_self: None,
            last_rendered_children: vec![],
            anchor: None,
        });
    }
    run(dom, vnode, options)
}

/// Renders a fragment root whose children live directly in `container`.
/// Non-fragment roots are rendered and appended to `container` once.
pub fn render_into(dom: &Dom, container: NodeId, vnode: &VNode, options: RenderOptions) -> Result<RenderOutput> {
    if vnode.kind() == NodeKind::Fragment {
        if vnode.render_state().is_none() {
            *vnode.render_state_mut() = Some(RenderState {
                dom_node: container,
                last_rendered_self: None,
                last_rendered_children: vec![],
                anchor: None,
            });
        }
        return run(dom, vnode, options);
    }
    let output = render_dom(dom, vnode, options)?;
    for node in &output.nodes {
        if dom.parent(*node) != Some(container) {
            dom.append_child(container, *node)?;
        }
    }
    Ok(output)
}

pub fn dom_node_of(vnode: &VNode) -> Option<NodeId> {
    vnode.render_state().as_ref().map(|state| state.dom_node)
}

/// The DOM node siblings are inserted before: the anchor when set.
pub fn anchor_of(vnode: &VNode) -> Option<NodeId> {
    vnode.render_state().as_ref().map(|state| state.anchor.unwrap_or(state.dom_node))
}

pub fn set_anchor(vnode: &VNode, anchor: Option<NodeId>) {
    if let Some(state) = vnode.render_state_mut().as_mut() {
        state.anchor = anchor;
    }
}

fn run(dom: &Dom, root: &VNode, options: RenderOptions) -> Result<RenderOutput> {
    let mut actions = vec![];
    let mut pending = VecDeque::from([root.clone()]);
    let mut first = true;
    while let Some(node) = pending.pop_front() {
        let is_root = std::mem::replace(&mut first, false);
        diff_node(dom, &node, options.deep_update || is_root, &mut actions, &mut pending)?;
    }

    let actions = coalesce(actions);
    let drained = if actions.is_empty() {
        None
    } else if options.sync {
        apply_actions(dom, actions.clone());
        None
    } else {
        Some(defer(dom, actions.clone()))
    };
    Ok(RenderOutput {
        nodes: root_nodes(root),
        actions,
        drained,
    })
}

fn root_nodes(root: &VNode) -> Vec<NodeId> {
    match root.kind() {
        NodeKind::Fragment => root.child_nodes().iter().filter_map(dom_node_of).collect(),
        _ => dom_node_of(root).into_iter().collect(),
    }
}

fn create_dom_node(dom: &Dom, vnode: &VNode) -> NodeId {
    match vnode.kind() {
        NodeKind::Element => match vnode.namespace() {
            Some(ns) => dom.create_element_ns(ns, vnode.tag()),
            None => dom.create_element(vnode.tag()),
        },
        NodeKind::Text => dom.create_text_node(&decode_entities(&vnode.text_content())),
        NodeKind::Comment => dom.create_comment(&vnode.text_content()),
        NodeKind::Fragment => dom.create_document_fragment(),
    }
}

/// First-time construction of `vnode` and its subtree. The node's render
/// state must already hold its DOM node.
fn build(dom: &Dom, vnode: &VNode) -> Result<()> {
    let Some(dom_node) = dom_node_of(vnode) else {
        return Ok(());
    };
    let mut setup = vec![];
    if vnode.is_attribute_node() {
        for (name, value) in vnode.attributes() {
            setup.push(set_attribute_action(dom_node, &name, value));
        }
    }
    if vnode.is_event_node() {
        for (event_type, listener) in vnode.listeners() {
            setup.push(DomAction::AddEventListener {
                node: dom_node,
                event_type,
                listener,
            });
        }
    }
    apply_actions(dom, setup);

    let children = vnode.child_nodes();
    for child in &children {
        let child_node = create_dom_node(dom, child);
        *child.render_state_mut() = Some(RenderState {
            dom_node: child_node,
            last_rendered_self: None,
            last_rendered_children: vec![],
            anchor: None,
        });
        build(dom, child)?;
        dom.append_child(dom_node, child_node)?;
    }

    if let Some(state) = vnode.render_state_mut().as_mut() {
        state.last_rendered_self = Some(vnode.clone_node(false));
        state.last_rendered_children = children;
    }
    Ok(())
}

fn set_attribute_action(node: NodeId, name: &str, value: Value) -> DomAction {
    match name.strip_prefix("attr.") {
        Some(stripped) => DomAction::SetAttribute {
            node,
            name: stripped.to_string(),
            value,
            prevent_idl: true,
        },
        None => DomAction::SetAttribute {
            node,
            name: name.to_string(),
            value,
            prevent_idl: false,
        },
    }
}

/// Attribute values compare by identity for primitives and by shape for
/// arrays and objects.
fn same_value(a: &Value, b: &Value) -> bool {
    if a.strict_equals(b) {
        return true;
    }
    match (a, b) {
        (Value::Array(_) | Value::Object(_), Value::Array(_) | Value::Object(_)) => a.to_json() == b.to_json(),
        (Value::Number(x), Value::Number(y)) => x.is_nan() && y.is_nan(),
        _ => false,
    }
}

fn diff_node(
    dom: &Dom,
    node: &VNode,
    diff_children: bool,
    actions: &mut Vec<DomAction>,
    pending: &mut VecDeque<VNode>,
) -> Result<()> {
    let Some((dom_node, previous)) = node
        .render_state()
        .as_ref()
        .map(|s| (s.dom_node, s.last_rendered_self.clone()))
    else {
        return Ok(());
    };

    let Some(previous) = previous else {
        // Fragment roots are never built; their first pass diffs an empty
        // child list so every child is inserted.
        let children = node.child_nodes();
        let mut own = vec![];
        diff_children_of(dom, node, dom_node, &children, &mut own)?;
        if let Some(state) = node.render_state_mut().as_mut() {
            state.last_rendered_self = Some(node.clone_node(false));
            state.last_rendered_children = children;
        }
        actions.extend(own);
        return Ok(());
    };

    let mut own = vec![];
    if node.is_attribute_node() {
        let current = node.attributes();
        let before = previous.attributes();
        for (name, value) in &current {
            if !before.get(name).map_or(false, |old| same_value(old, value)) {
                own.push(set_attribute_action(dom_node, name, value.clone()));
            }
        }
        for name in before.keys() {
            if !current.contains_key(name) {
                own.push(DomAction::RemoveAttribute {
                    node: dom_node,
                    name: name.strip_prefix("attr.").unwrap_or(name).to_string(),
                });
            }
        }
    }

    if node.is_event_node() {
        let current = node.listeners();
        let mut old: Vec<(String, Listener)> = previous.listeners();
        for (event_type, listener) in current {
            match old.iter().position(|(_, l)| l.guid() == listener.guid()) {
                Some(index) => {
                    old.remove(index);
                }
                None => own.push(DomAction::AddEventListener {
                    node: dom_node,
                    event_type,
                    listener,
                }),
            }
        }
        for (event_type, listener) in old {
            own.push(DomAction::RemoveEventListener {
                node: dom_node,
                event_type,
                listener,
            });
        }
    }

    if node.is_text_node() {
        let text = node.text_content();
        if text != previous.text_content() {
            own.push(DomAction::NodeValue {
                node: dom_node,
                value: text,
            });
        }
    }

    if diff_children && node.is_parent_node() {
        let children = node.child_nodes();
        diff_children_of(dom, node, dom_node, &children, &mut own)?;
        for child in &children {
            pending.push_back(child.clone());
        }
        if let Some(state) = node.render_state_mut().as_mut() {
            state.last_rendered_children = children;
        }
    }

    if !own.is_empty() {
        if let Some(state) = node.render_state_mut().as_mut() {
            state.last_rendered_self = Some(node.clone_node(false));
        }
    }
    actions.extend(own);
    Ok(())
}

/// Removals first, then insertions right to left so every anchor is
/// already in place. Children whose relative order changed are moved.
fn diff_children_of(
    dom: &Dom,
    node: &VNode,
    dom_node: NodeId,
    children: &[VNode],
    actions: &mut Vec<DomAction>,
) -> Result<()> {
    let previous = node
        .render_state()
        .as_ref()
        .map(|s| s.last_rendered_children.clone())
        .unwrap_or_default();

    for child in children {
        if child.render_state().is_none() {
            let child_node = create_dom_node(dom, child);
            *child.render_state_mut() = Some(RenderState {
                dom_node: child_node,
                last_rendered_self: None,
                last_rendered_children: vec![],
                anchor: None,
            });
            build(dom, child)?;
        }
    }

    let current_ids: HashSet<usize> = children.iter().map(VNode::id).collect();
    let previous_ids: HashSet<usize> = previous.iter().map(VNode::id).collect();
    for old in &previous {
        if !current_ids.contains(&old.id()) {
            if let Some(old_node) = dom_node_of(old) {
                actions.push(DomAction::RemoveNode { node: old_node });
            }
        }
    }

    let retained_before: Vec<usize> = previous
        .iter()
        .map(VNode::id)
        .filter(|id| current_ids.contains(id))
        .collect();
    let retained_now: Vec<usize> = children
        .iter()
        .map(VNode::id)
        .filter(|id| previous_ids.contains(id))
        .collect();
    let moved: HashSet<usize> = retained_now
        .iter()
        .enumerate()
        .filter(|(i, id)| retained_before.get(*i) != Some(*id))
        .map(|(_, id)| *id)
        .collect();

    for i in (0..children.len()).rev() {
        let child = &children[i];
        if previous_ids.contains(&child.id()) && !moved.contains(&child.id()) {
            continue;
        }
        let Some(child_node) = dom_node_of(child) else {
            continue;
        };
        match children.get(i + 1).and_then(anchor_of) {
            Some(before) => actions.push(DomAction::AddNodeBefore {
                node: child_node,
                parent: dom_node,
                before,
            }),
            None => actions.push(DomAction::AddNodeToEnd {
                node: child_node,
                parent: dom_node,
            }),
        }
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// APPLYING ACTIONS
// ═══════════════════════════════════════════════════════════════════════════════

pub fn apply_actions(dom: &Dom, actions: impl IntoIterator<Item = DomAction>) {
    for action in actions {
        let name = action.name();
        if let Err(e) = apply_action(dom, action) {
            tracing::error!(action = name, error = %e, "failed to apply DOM action");
        }
    }
}

fn split_namespace(name: &str) -> Option<(&'static str, &str)> {
    let (prefix, local) = name.split_once(':')?;
    let namespace = match prefix {
        "xlink" => XLINK_NAMESPACE,
        "xml" => XML_NAMESPACE,
        "xmlns" => XMLNS_NAMESPACE,
        _ => return None,
    };
    Some((namespace, local))
}

fn idl_compatible(ty: IdlType, value: &Value) -> bool {
    matches!(
        (ty, value),
        (IdlType::Boolean, Value::Bool(_))
            | (IdlType::Number, Value::Number(_))
            | (IdlType::String, Value::String(_))
    )
}

fn write_attribute(dom: &Dom, node: NodeId, name: &str, value: &Value) {
    match (split_namespace(name), serialize_attribute(value)) {
        (Some((ns, local)), None) => dom.remove_attribute_ns(node, Some(ns), local),
        (Some((ns, _)), Some(text)) => dom.set_attribute_ns(node, Some(ns), name, &text),
        (None, None) => dom.remove_attribute(node, name),
        (None, Some(text)) => dom.set_attribute(node, name, &text),
    }
}

fn apply_action(dom: &Dom, action: DomAction) -> Result<()> {
    match action {
        DomAction::SetAttribute {
            node,
            name,
            value,
            prevent_idl,
        } => {
            if !prevent_idl {
                if let Some(element) = dom.custom_element(node) {
                    if let Some(component) = element.as_any().downcast_ref::<ComponentElement>() {
                        component.set_input(dom, node, &name, value);
                        return Ok(());
                    }
                }
                if let Some(idl) = dom.idl_property(node, &name) {
                    if idl.ty == IdlType::Boolean {
                        dom.set_property(node, &name, Value::Bool(parse_boolean(&value)));
                        if idl.reflect {
                            return Ok(());
                        }
                    } else if idl_compatible(idl.ty, &value) {
                        dom.set_property(node, &name, value);
                        return Ok(());
                    }
                }
            }
            write_attribute(dom, node, &name, &value);
        }
        DomAction::RemoveAttribute { node, name } => match split_namespace(&name) {
            Some((ns, local)) => dom.remove_attribute_ns(node, Some(ns), local),
            None => dom.remove_attribute(node, &name),
        },
        DomAction::AddEventListener {
            node,
            event_type,
            listener,
        } => dom.add_event_listener(node, &event_type, &listener),
        DomAction::RemoveEventListener {
            node,
            event_type,
            listener,
        } => dom.remove_event_listener(node, &event_type, &listener),
        DomAction::NodeValue { node, value } => {
            let value = if dom.node_type(node) == NodeType::Text {
                decode_entities(&value)
            } else {
                value
            };
            dom.set_node_value(node, &value);
        }
        DomAction::RemoveNode { node } => dom.remove(node),
        DomAction::AddNodeToEnd { node, parent } => dom.append_child(parent, node)?,
        DomAction::AddNodeBefore { node, parent, before } => {
            let parent = dom.parent(before).unwrap_or(parent);
            dom.insert_before(parent, node, Some(before))?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn list(items: &[&str]) -> (VNode, Vec<VNode>) {
        let ul = VNode::element("ul");
        let lis: Vec<VNode> = items
            .iter()
            .map(|text| {
                let li = VNode::element("li");
                li.append_child(&VNode::text(text)).unwrap();
                li
            })
            .collect();
        ul.append_children(&lis).unwrap();
        (ul, lis)
    }

    #[test]
    fn test_first_render_builds_synchronously() {
        let dom = Dom::new();
        let (ul, _) = list(&["a", "b"]);
        ul.set_attribute("class", "x").unwrap();
        let output = render_dom(&dom, &ul, RenderOptions::default()).unwrap();
        assert!(output.actions.is_empty());
        assert!(output.drained.is_none());
        assert_eq!(dom.outer_html(output.nodes[0]), r#"<ul class="x"><li>a</li><li>b</li></ul>"#);
    }

    #[test]
    fn test_rerender_without_changes_is_idempotent() {
        let dom = Dom::new();
        let (ul, _) = list(&["a", "b"]);
        render_dom(&dom, &ul, RenderOptions::DEEP_SYNC).unwrap();
        let again = render_dom(&dom, &ul, RenderOptions::DEEP_SYNC).unwrap();
        assert!(again.actions.is_empty());
    }

    #[test]
    fn test_attribute_and_text_diff() {
        let dom = Dom::new();
        let (ul, lis) = list(&["a"]);
        ul.set_attribute("class", "x").unwrap();
        ul.set_attribute("title", "t").unwrap();
        let root = render_dom(&dom, &ul, RenderOptions::DEEP_SYNC).unwrap().nodes[0];

        ul.set_attribute("class", "y").unwrap();
        ul.remove_attribute("title").unwrap();
        lis[0].first_child().unwrap().set_text("b &amp; c").unwrap();
        let output = render_dom(&dom, &ul, RenderOptions::DEEP_SYNC).unwrap();
        let names: Vec<&str> = output.actions.iter().map(DomAction::name).collect();
        assert_eq!(names, vec!["setAttribute", "removeAttribute", "nodeValue"]);
        assert_eq!(dom.outer_html(root), r#"<ul class="y"><li>b &amp; c</li></ul>"#);
        assert_eq!(dom.text_content(root), "b & c");
    }

    #[test]
    fn test_children_diff_keeps_identity() {
        let dom = Dom::new();
        let (ul, lis) = list(&["1", "2", "3"]);
        let root = render_dom(&dom, &ul, RenderOptions::DEEP_SYNC).unwrap().nodes[0];
        let before = dom.children(root);

        ul.remove_child(&lis[1]).unwrap();
        let output = render_dom(&dom, &ul, RenderOptions::DEEP_SYNC).unwrap();
        assert_eq!(output.actions.len(), 1);
        assert!(matches!(output.actions[0], DomAction::RemoveNode { node } if node == before[1]));
        assert_eq!(dom.children(root), vec![before[0], before[2]]);
    }

    #[test]
    fn test_insert_uses_next_sibling_as_anchor() {
        let dom = Dom::new();
        let (ul, lis) = list(&["a", "c"]);
        let root = render_dom(&dom, &ul, RenderOptions::DEEP_SYNC).unwrap().nodes[0];
        let b = VNode::element("li");
        b.append_child(&VNode::text("b")).unwrap();
        ul.insert_before(&b, &lis[1]).unwrap();
        let d = VNode::element("li");
        ul.append_child(&d).unwrap();

        let output = render_dom(&dom, &ul, RenderOptions::DEEP_SYNC).unwrap();
        let names: Vec<&str> = output.actions.iter().map(DomAction::name).collect();
        assert_eq!(names, vec!["addNodeToEnd", "addNodeBefore"]);
        assert_eq!(dom.inner_html(root), "<li>a</li><li>b</li><li>c</li><li></li>");
    }

    #[test]
    fn test_reordered_children_are_moved() {
        let dom = Dom::new();
        let (ul, lis) = list(&["a", "b", "c"]);
        let root = render_dom(&dom, &ul, RenderOptions::DEEP_SYNC).unwrap().nodes[0];
        ul.remove_child(&lis[0]).unwrap();
        ul.append_child(&lis[0]).unwrap();
        render_dom(&dom, &ul, RenderOptions::DEEP_SYNC).unwrap();
        assert_eq!(dom.inner_html(root), "<li>b</li><li>c</li><li>a</li>");
    }

    #[test]
    fn test_listener_diff_and_coalescing() {
        let dom = Dom::new();
        let button = VNode::element("button");
        let first = Listener::new(|_| {});
        button.add_event_listener("click", &first).unwrap();
        let node = render_dom(&dom, &button, RenderOptions::DEEP_SYNC).unwrap().nodes[0];
        assert_eq!(dom.listener_count(node, "click"), 1);

        let second = Listener::new(|_| {});
        button.remove_event_listener("click", &first).unwrap();
        button.add_event_listener("click", &second).unwrap();
        render_dom(&dom, &button, RenderOptions::DEEP_SYNC).unwrap();
        assert_eq!(dom.listener_count(node, "click"), 1);

        let coalesced = coalesce(vec![
            DomAction::AddEventListener {
                node,
                event_type: "click".to_string(),
                listener: first.clone(),
            },
            DomAction::RemoveEventListener {
                node,
                event_type: "click".to_string(),
                listener: first.clone(),
            },
            DomAction::SetAttribute {
                node,
                name: "a".to_string(),
                value: Value::from(1),
                prevent_idl: false,
            },
            DomAction::SetAttribute {
                node,
                name: "a".to_string(),
                value: Value::from(2),
                prevent_idl: false,
            },
        ]);
        assert_eq!(coalesced.len(), 2);
        assert_eq!(coalesced[0].name(), "removeEventListener");
        assert!(matches!(&coalesced[1], DomAction::SetAttribute { value, .. } if *value == Value::from(2)));
    }

    #[test]
    fn test_deferred_actions_apply_on_drain() {
        let dom = Dom::new();
        let (ul, _) = list(&["a"]);
        let root = render_dom(&dom, &ul, RenderOptions::DEEP).unwrap().nodes[0];
        ul.set_attribute("id", "main").unwrap();
        let output = render_dom(&dom, &ul, RenderOptions::DEEP).unwrap();
        assert_eq!(dom.get_attribute(root, "id"), None);
        let drained = output.drained.expect("queued");
        queue::drain();
        assert!(drained.now_or_never().is_some());
        assert_eq!(dom.get_attribute(root, "id").as_deref(), Some("main"));
    }

    #[test]
    fn test_boolean_false_removes_attribute_and_idl_routing() {
        let dom = Dom::new();
        let input = VNode::element("input");
        input.set_attribute("disabled", true).unwrap();
        input.set_attribute("value", "typed").unwrap();
        input.set_attribute("attr.value", "initial").unwrap();
        input.set_attribute("xlink:href", "#a").unwrap();
        let node = render_dom(&dom, &input, RenderOptions::DEEP_SYNC).unwrap().nodes[0];
        assert!(dom.has_attribute(node, "disabled"));
        assert_eq!(dom.get_property(node, "value"), Value::from("typed"));
        assert_eq!(dom.get_attribute(node, "value").as_deref(), Some("initial"));
        assert_eq!(dom.get_attribute(node, "xlink:href").as_deref(), Some("#a"));

        input.set_attribute("disabled", false).unwrap();
        render_dom(&dom, &input, RenderOptions::DEEP_SYNC).unwrap();
        assert!(!dom.has_attribute(node, "disabled"));
    }

    #[test]
    fn test_fragment_root_renders_into_container() {
        let dom = Dom::new();
        let root = VNode::fragment();
        let (a, b) = (VNode::element("a"), VNode::element("b"));
        root.append_children(&[a.clone(), b.clone()]).unwrap();
        let host = dom.create_element("div");
        let output = render_into(&dom, host, &root, RenderOptions::DEEP_SYNC).unwrap();
        assert_eq!(output.nodes.len(), 2);
        assert_eq!(dom.inner_html(host), "<a></a><b></b>");

        root.remove_child(&a).unwrap();
        render_into(&dom, host, &root, RenderOptions::DEEP_SYNC).unwrap();
        assert_eq!(dom.inner_html(host), "<b></b>");
        assert!(render_into(&dom, host, &root, RenderOptions::DEEP_SYNC).unwrap().actions.is_empty());
    }
}
