//! End-to-end scenarios: registration through first render, queued updates
//! and the diff actions they produce.

use std::cell::Cell;
use std::rc::Rc;

use crate::component::{ComponentConfig, ComponentElement};
use crate::controller::{AttributeBinding, ControllerHandle, Deduplicate, ObjectController, OutputBinding};
use crate::css::scope_css_selector;
use crate::dom::{Dom, Event, Listener, MutationObserverInit, NodeId};
use crate::eval::Scope;
use crate::package::{ModuleScope, Package, PackageKind};
use crate::queue;
use crate::render::{render_dom, render_into, RenderOptions};
use crate::template::{compile_source, CompileOptions, TemplateInstance, TemplateSource};
use crate::value::{DataType, Value};
use crate::vnode::VNode;

fn library() -> Rc<ModuleScope> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    ModuleScope::get(&Package::new(PackageKind::Module, "nils-library"))
}

fn controller_of(dom: &Dom, node: NodeId) -> ControllerHandle {
    let element = dom.custom_element(node).unwrap();
    element
        .as_any()
        .downcast_ref::<ComponentElement>()
        .unwrap()
        .controller()
        .clone()
}

fn mount(dom: &Dom, tag: &str) -> NodeId {
    let host = dom.create_element(tag);
    dom.append_child(dom.body(), host).unwrap();
    host
}

fn instance(html: &str) -> (TemplateInstance, ControllerHandle) {
    let template = compile_source(&TemplateSource::from(html), &CompileOptions::new("nl-e2e", false)).unwrap();
    let handle = ControllerHandle::new(
        ObjectController::new()
            .field("show", false)
            .field("items", vec![Value::from(1), Value::from(2), Value::from(3)]),
        vec![],
    );
    (TemplateInstance::new(Rc::new(template)), handle)
}

fn render_instance(dom: &Dom, container: NodeId, instance: &TemplateInstance, handle: &ControllerHandle) -> Vec<&'static str> {
    instance.render(&Scope::new(Value::Controller(handle.clone()))).unwrap();
    render_into(dom, container, instance.root(), RenderOptions::DEEP_SYNC)
        .unwrap()
        .actions
        .iter()
        .map(|a| a.name())
        .collect()
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCENARIOS
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_greeting_renders_and_updates_text_only() {
    let dom = Dom::new();
    library()
        .component(
            &dom,
            ComponentConfig::new("nl-greet", || ObjectController::new().field("name", "A"))
                .html("<span>Hi {{this.name}}</span>"),
        )
        .unwrap();
    let host = mount(&dom, "nl-greet");
    assert_eq!(
        dom.outer_html(host),
        r#"<nl-greet nlib-hid="nl-greet"><span nlib-cid="nl-greet">Hi A</span></nl-greet>"#
    );

    let span = dom.element_children(host)[0];
    let records = Rc::new(Cell::new(0));
    let seen = records.clone();
    let observer = dom.create_observer(move |_, batch| seen.set(seen.get() + batch.len()));
    dom.observe(
        observer,
        host,
        MutationObserverInit {
            child_list: true,
            attributes: true,
            subtree: true,
            attribute_filter: None,
        },
    );

    controller_of(&dom, host).set("name", Value::from("B")).unwrap();
    dom.settle();
    assert_eq!(dom.text_content(span), "Hi B");
    assert_eq!(dom.element_children(host), vec![span]);
    assert_eq!(records.get(), 0);
}

#[test]
fn test_if_adds_one_subtree() {
    let dom = Dom::new();
    let container = dom.create_element("div");
    let (instance, handle) = instance(r#"<div *if="this.show"><b>x</b></div><p>end</p>"#);

    render_instance(&dom, container, &instance, &handle);
    assert_eq!(dom.inner_html(container), "<p>end</p>");

    handle.set("show", Value::from(true)).unwrap();
    let actions = render_instance(&dom, container, &instance, &handle);
    assert_eq!(actions, vec!["addNodeBefore"]);
    assert_eq!(dom.inner_html(container), "<div><b>x</b></div><p>end</p>");
}

#[test]
fn test_for_removes_only_the_dropped_item() {
    let dom = Dom::new();
    let container = dom.create_element("ul");
    let (instance, handle) = instance(r#"<li *for="x of this.items">{{x}}</li>"#);

    render_instance(&dom, container, &instance, &handle);
    let before = dom.element_children(container);
    assert_eq!(before.len(), 3);

    handle
        .set("items", Value::from(vec![Value::from(1), Value::from(3)]))
        .unwrap();
    let actions = render_instance(&dom, container, &instance, &handle);
    assert_eq!(actions, vec!["removeNode"]);
    assert_eq!(dom.element_children(container), vec![before[0], before[2]]);
    assert_eq!(dom.inner_html(container), "<li>1</li><li>3</li>");
}

#[test]
fn test_attribute_and_input_reflection() {
    let dom = Dom::new();
    let scope = library();
    scope
        .component(
            &dom,
            ComponentConfig::new("nl-counter", || ObjectController::new().field("c", 0))
                .html("<i>{{this.c}}</i>")
                .attribute(AttributeBinding::new("c").name("count").data_type(DataType::Number)),
        )
        .unwrap();
    scope
        .component(
            &dom,
            ComponentConfig::new("nl-panel", || ObjectController::new().field("c", 1))
                .html(r#"<nl-counter [count]="this.c"></nl-counter>"#),
        )
        .unwrap();

    let panel = mount(&dom, "nl-panel");
    let counter = dom.element_children(panel)[0];
    assert_eq!(controller_of(&dom, counter).get("c"), Value::Number(1.0));

    dom.set_attribute(counter, "count", "7");
    assert_eq!(controller_of(&dom, counter).get("c"), Value::Number(7.0));

    controller_of(&dom, panel).set("c", Value::from(9)).unwrap();
    dom.settle();
    assert_eq!(controller_of(&dom, counter).get("c"), Value::Number(9.0));
    assert_eq!(dom.get_attribute(counter, "count").as_deref(), Some("9"));
    assert_eq!(dom.text_content(counter), "9");
}

#[test]
fn test_deduplicated_output_events() {
    let dom = Dom::new();
    library()
        .component(
            &dom,
            ComponentConfig::new("nl-field", || ObjectController::new().field("value", ""))
                .html("<input>")
                .output(OutputBinding::new("value").event_name("change").deduplicate(Deduplicate::Always)),
        )
        .unwrap();
    let host = mount(&dom, "nl-field");

    let details = Rc::new(std::cell::RefCell::new(vec![]));
    let seen = details.clone();
    dom.add_event_listener(
        host,
        "change",
        &Listener::new(move |event| seen.borrow_mut().push(event.detail().clone())),
    );

    let controller = controller_of(&dom, host);
    controller.set("value", Value::from("a")).unwrap();
    controller.set("value", Value::from("a")).unwrap();
    assert_eq!(details.borrow().len(), 1);
    controller.set("value", Value::from("b")).unwrap();
    assert_eq!(*details.borrow(), vec![Value::from("a"), Value::from("b")]);
}

#[test]
fn test_host_selector_scoping() {
    assert_eq!(
        scope_css_selector(".btn:host .ok", "nl-x").unwrap(),
        r#"[nlib-hid="nl-x"] .ok[nlib-cid="nl-x"]"#
    );
}

#[test]
fn test_nested_template_html_renders_every_level() {
    let dom = Dom::new();
    library()
        .component(
            &dom,
            ComponentConfig::new("nl-list", || {
                ObjectController::new()
                    .field("title", "T & U")
                    .field("items", vec![Value::from("a"), Value::from("b")])
            })
            .html(r#"<section><h2>{{this.title}}</h2><ul><li *for="x of this.items"><b>{{x}}</b></li></ul></section>"#),
        )
        .unwrap();
    let host = mount(&dom, "nl-list");
    assert_eq!(
        dom.inner_html(host),
        concat!(
            r#"<section nlib-cid="nl-list"><h2 nlib-cid="nl-list">T &amp; U</h2><ul nlib-cid="nl-list">"#,
            r#"<li nlib-cid="nl-list"><b nlib-cid="nl-list">a</b></li>"#,
            r#"<li nlib-cid="nl-list"><b nlib-cid="nl-list">b</b></li>"#,
            r#"</ul></section>"#
        )
    );
}

#[test]
fn test_loop_items_land_before_slotted_content() {
    let dom = Dom::new();
    library()
        .component(
            &dom,
            ComponentConfig::new("nl-nav", || ObjectController::new().field("links", Vec::<Value>::new()))
                .html(r#"<nav><a *for="x of this.links">{{x}}</a><slot name="end"></slot></nav>"#),
        )
        .unwrap();
    let host = dom.create_element("nl-nav");
    let end = dom.create_element("span");
    dom.set_attribute(end, "slot", "end");
    dom.append_child(host, end).unwrap();
    dom.append_child(dom.body(), host).unwrap();
    dom.settle();
    let nav = dom.parent(end).unwrap();

    controller_of(&dom, host)
        .set("links", Value::from(vec![Value::from("a"), Value::from("b")]))
        .unwrap();
    dom.settle();
    assert_eq!(
        dom.inner_html(nav),
        r#"<a nlib-cid="nl-nav">a</a><a nlib-cid="nl-nav">b</a><span slot="end"></span><!--slot placeholder-->"#
    );
}

#[test]
fn test_static_text_serializes_ampersands_once() {
    let (instance, handle) = instance("<p>a & b</p>");
    instance.render(&Scope::new(Value::Controller(handle))).unwrap();
    assert_eq!(instance.root().to_html(), "<p>a &amp; b</p>");
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROPERTIES
// ═══════════════════════════════════════════════════════════════════════════════

#[test]
fn test_children_have_one_parent() {
    let parent = VNode::element("div");
    let child = VNode::element("span");
    parent.append_child(&child).unwrap();
    let other = VNode::element("p");
    other.append_child(&child).unwrap_or_else(|_| {
        child.remove();
        other.append_child(&child).unwrap();
    });

    assert!(parent.child_nodes().is_empty());
    assert_eq!(other.child_nodes().iter().filter(|c| c.ptr_eq(&child)).count(), 1);
    assert!(child.parent_node().unwrap().ptr_eq(&other));
}

#[test]
fn test_second_render_is_a_no_op() {
    let dom = Dom::new();
    let root = VNode::element("section");
    root.set_attribute("title", "t").unwrap();
    let text = VNode::text("hello");
    root.append_child(&text).unwrap();

    render_dom(&dom, &root, RenderOptions::DEEP_SYNC).unwrap();
    let again = render_dom(&dom, &root, RenderOptions::DEEP_SYNC).unwrap();
    assert!(again.actions.is_empty());
}

#[test]
fn test_same_shape_rerender_emits_nothing() {
    let dom = Dom::new();
    let container = dom.create_element("div");
    let (instance, handle) = instance(r#"<ul title="{{this.show}}"><li *for="x of this.items">{{x}}</li></ul>"#);
    render_instance(&dom, container, &instance, &handle);

    handle
        .set("items", Value::from(vec![Value::from(1), Value::from(2), Value::from(3)]))
        .unwrap();
    assert!(render_instance(&dom, container, &instance, &handle).is_empty());
}

#[test]
fn test_deep_clone_is_detached() {
    let root = VNode::element("div");
    root.set_attribute("class", "a").unwrap();
    let child = VNode::element("b");
    child.append_child(&VNode::text("x")).unwrap();
    root.append_child(&child).unwrap();

    let copy = root.clone_node(true);
    assert_eq!(copy.to_html(), root.to_html());
    assert!(!copy.ptr_eq(&root));
    assert!(!copy.child_nodes()[0].ptr_eq(&child));
    assert!(!root.contains(&copy.child_nodes()[0]));
}

#[test]
fn test_plain_selectors_scope_every_compound() {
    assert_eq!(
        scope_css_selector("ul > li.item a", "nl-x").unwrap(),
        r#"ul[nlib-cid="nl-x"] > li.item[nlib-cid="nl-x"] a[nlib-cid="nl-x"]"#
    );
}

#[test]
fn test_listener_runs_once_after_add_remove_cycles() {
    let dom = Dom::new();
    let calls = Rc::new(Cell::new(0));
    let seen = calls.clone();
    let listener = Listener::new(move |_| seen.set(seen.get() + 1));

    let button = VNode::element("button");
    button.add_event_listener("click", &listener).unwrap();
    let node = render_dom(&dom, &button, RenderOptions::DEEP_SYNC).unwrap().nodes[0];

    for _ in 0..2 {
        button.remove_event_listener("click", &listener).unwrap();
        button.add_event_listener("click", &listener).unwrap();
        let _ = render_dom(&dom, &button, RenderOptions::DEEP).unwrap();
    }
    queue::drain();

    dom.dispatch_event(node, Rc::new(Event::new("click", true)));
    assert_eq!(calls.get(), 1);
}
