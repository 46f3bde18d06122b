//! Controller Module for the nlib rendering engine
//!
//! A controller is the author-written object whose properties drive one
//! component instance. The engine never touches it directly: every read and
//! write goes through a [`ControllerHandle`], which turns writes into output
//! events and render requests.

use indexmap::IndexMap;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::dom::{Dom, ElementRef, Event, NodeId};
use crate::value::{DataType, Function, Value};

pub type Method = Rc<dyn Fn(&ControllerHandle, &[Value]) -> Result<Value, String>>;
pub type InitHook = Rc<dyn Fn(&ControllerHandle, InitContext)>;

pub trait Controller: Any {
    fn get(&self, key: &str) -> Value;
    fn set(&mut self, key: &str, value: Value);

    fn method(&self, _name: &str) -> Option<Method> {
        None
    }

    fn on_init(&self) -> Option<InitHook> {
        None
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

// ═══════════════════════════════════════════════════════════════════════════════
// OBJECT CONTROLLER
// ═══════════════════════════════════════════════════════════════════════════════

/// A controller assembled from named fields and closures.
#[derive(Default, Clone)]
pub struct ObjectController {
    fields: IndexMap<String, Value>,
    methods: IndexMap<String, Method>,
    init: Option<InitHook>,
}

impl ObjectController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn method(
        mut self,
        name: &str,
        f: impl Fn(&ControllerHandle, &[Value]) -> Result<Value, String> + 'static,
    ) -> Self {
        self.methods.insert(name.to_string(), Rc::new(f));
        self
    }

    pub fn on_init(mut self, f: impl Fn(&ControllerHandle, InitContext) + 'static) -> Self {
        self.init = Some(Rc::new(f));
        self
    }

    pub fn fields(&self) -> &IndexMap<String, Value> {
        &self.fields
    }
}

impl Controller for ObjectController {
    fn get(&self, key: &str) -> Value {
        self.fields.get(key).cloned().unwrap_or_default()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.fields.insert(key.to_string(), value);
    }

    fn method(&self, name: &str) -> Option<Method> {
        self.methods.get(name).cloned()
    }

    fn on_init(&self) -> Option<InitHook> {
        self.init.clone()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BINDINGS
// ═══════════════════════════════════════════════════════════════════════════════

/// Binds a controller property to a host attribute.
#[derive(Debug, Clone)]
pub struct AttributeBinding {
    pub attribute: String,
    pub property: String,
    pub data_type: DataType,
    /// Read the attribute from the nearest ancestor that has it.
    pub closest: bool,
}

impl AttributeBinding {
    pub fn new(property: &str) -> Self {
        Self {
            attribute: property.to_lowercase(),
            property: property.to_string(),
            data_type: DataType::String,
            closest: false,
        }
    }

    pub fn name(mut self, attribute: &str) -> Self {
        self.attribute = attribute.to_lowercase();
        self
    }

    pub fn data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn closest(mut self, closest: bool) -> Self {
        self.closest = closest;
        self
    }
}

/// Where a bound event listener attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTarget {
    Host,
    Window,
    Document,
    Body,
}

/// Binds a controller method as a DOM listener.
#[derive(Debug, Clone)]
pub struct EventBinding {
    pub name: String,
    pub method: String,
}

impl EventBinding {
    pub fn new(name: &str, method: &str) -> Self {
        Self {
            name: name.to_string(),
            method: method.to_string(),
        }
    }

    /// Splits a `window:` / `document:` / `body:` prefix off the event name.
    pub fn target(&self) -> (EventTarget, &str) {
        let lower = self.name.to_lowercase();
        for (prefix, target) in [
            ("window:", EventTarget::Window),
            ("document:", EventTarget::Document),
            ("body:", EventTarget::Body),
        ] {
            if lower.starts_with(prefix) {
                return (target, &self.name[prefix.len()..]);
            }
        }
        (EventTarget::Host, &self.name)
    }
}

#[derive(Clone, Default)]
pub enum Deduplicate {
    #[default]
    Never,
    Always,
    /// Skips the emit when the comparator returns true for `(last, next)`.
    With(Rc<dyn Fn(&Value, &Value) -> bool>),
}

impl fmt::Debug for Deduplicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deduplicate::Never => write!(f, "Never"),
            Deduplicate::Always => write!(f, "Always"),
            Deduplicate::With(_) => write!(f, "With(..)"),
        }
    }
}

/// Writing the property dispatches a `CustomEvent` from the host.
#[derive(Debug, Clone)]
pub struct OutputBinding {
    pub property: String,
    pub event_name: String,
    pub bubbles: bool,
    pub deduplicate: Deduplicate,
}

impl OutputBinding {
    pub fn new(property: &str) -> Self {
        Self {
            property: property.to_string(),
            event_name: property.to_string(),
            bubbles: false,
            deduplicate: Deduplicate::Never,
        }
    }

    pub fn event_name(mut self, name: &str) -> Self {
        self.event_name = name.to_string();
        self
    }

    pub fn bubbles(mut self, bubbles: bool) -> Self {
        self.bubbles = bubbles;
        self
    }

    pub fn deduplicate(mut self, deduplicate: Deduplicate) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    fn is_duplicate(&self, last: &Value, next: &Value) -> bool {
        match &self.deduplicate {
            Deduplicate::Never => false,
            Deduplicate::Always => last.strict_equals(next),
            Deduplicate::With(same) => same(last, next) || last.strict_equals(next),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LIFETIMES
// ═══════════════════════════════════════════════════════════════════════════════

/// A teardown callback that runs at most once.
pub struct Stoppable(RefCell<Option<Box<dyn FnOnce()>>>);

impl Stoppable {
    pub fn new(stop: impl FnOnce() + 'static) -> Self {
        Self(RefCell::new(Some(Box::new(stop))))
    }

    pub fn stop(&self) {
        let stop = self.0.borrow_mut().take();
        if let Some(stop) = stop {
            stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.0.borrow().is_none()
    }
}

impl fmt::Debug for Stoppable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stoppable").field("stopped", &self.is_stopped()).finish()
    }
}

/// Handed to the controller's init hook after the first render.
#[derive(Clone)]
pub struct InitContext {
    /// The render root: the shadow root, or the host itself.
    pub html: NodeId,
    pub dom: Dom,
    mark_changed: Rc<dyn Fn()>,
    add_stoppable: Rc<dyn Fn(Stoppable)>,
}

impl InitContext {
    pub fn new(
        dom: Dom,
        html: NodeId,
        mark_changed: Rc<dyn Fn()>,
        add_stoppable: Rc<dyn Fn(Stoppable)>,
    ) -> Self {
        Self {
            html,
            dom,
            mark_changed,
            add_stoppable,
        }
    }

    pub fn mark_changed(&self) {
        (self.mark_changed)()
    }

    /// Registers teardown work; after disconnection it is stopped at once.
    pub fn add_stoppable(&self, stoppable: Stoppable) {
        (self.add_stoppable)(stoppable)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HANDLE
// ═══════════════════════════════════════════════════════════════════════════════

struct Inner {
    controller: RefCell<Box<dyn Controller>>,
    outputs: IndexMap<String, OutputBinding>,
    emitted: RefCell<HashMap<String, Value>>,
    host: RefCell<Option<ElementRef>>,
    on_change: RefCell<Option<Rc<dyn Fn()>>>,
    rendering: Cell<bool>,
}

/// Shared, interposed access to one controller instance.
#[derive(Clone)]
pub struct ControllerHandle(Rc<Inner>);

impl ControllerHandle {
    pub fn new(controller: impl Controller, outputs: impl IntoIterator<Item = OutputBinding>) -> Self {
        Self::from_boxed(Box::new(controller), outputs)
    }

    pub fn from_boxed(
        controller: Box<dyn Controller>,
        outputs: impl IntoIterator<Item = OutputBinding>,
    ) -> Self {
        Self(Rc::new(Inner {
            controller: RefCell::new(controller),
            outputs: outputs
                .into_iter()
                .map(|output| (output.property.clone(), output))
                .collect(),
            emitted: RefCell::new(HashMap::new()),
            host: RefCell::new(None),
            on_change: RefCell::new(None),
            rendering: Cell::new(false),
        }))
    }

    pub fn ptr_eq(&self, other: &ControllerHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn address(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Methods come back as functions bound to this handle.
    pub fn get(&self, key: &str) -> Value {
        if self.has_method(key) {
            let this = self.clone();
            let name = key.to_string();
            return Value::Function(Function::new(key, move |args| this.call(&name, args)));
        }
        self.0.controller.borrow().get(key)
    }

    pub fn set(&self, key: &str, value: Value) -> Result<(), String> {
        self.write(key, value, false);
        Ok(())
    }

    /// Write that originates from a host attribute; outputs do not emit.
    pub fn set_from_attribute(&self, key: &str, value: Value) {
        self.write(key, value, true);
    }

    fn write(&self, key: &str, value: Value, from_attribute: bool) {
        let Some(output) = self.0.outputs.get(key) else {
            self.0.controller.borrow_mut().set(key, value);
            self.mark_changed();
            return;
        };

        let previous = self.0.emitted.borrow().get(key).cloned();
        if let Some(previous) = previous {
            if output.is_duplicate(&previous, &value) {
                return;
            }
        }
        self.0.emitted.borrow_mut().insert(key.to_string(), value.clone());
        self.0.controller.borrow_mut().set(key, value.clone());

        let host = self.0.host.borrow().clone();
        if let (false, Some(host)) = (from_attribute, host) {
            if let Some(dom) = host.dom() {
                let event_name = output.event_name.to_lowercase();
                let event = match &value {
                    Value::Event(source) => Event::custom(&event_name, source.detail().clone(), source.bubbles()),
                    _ => Event::custom(&event_name, value, output.bubbles),
                };
                dom.dispatch_event(host.node(), Rc::new(event));
            }
        }
        self.mark_changed();
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.0.controller.borrow().method(name).is_some()
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, String> {
        let method = self.0.controller.borrow().method(name);
        let Some(method) = method else {
            return Err(format!("this.{} is not a function", name));
        };
        let result = method(self, args);
        self.mark_changed();
        result
    }

    pub fn on_init_hook(&self) -> Option<InitHook> {
        self.0.controller.borrow().on_init()
    }

    /// Requests a render unless one is currently in progress.
    pub fn mark_changed(&self) {
        if self.0.rendering.get() {
            return;
        }
        let on_change = self.0.on_change.borrow().clone();
        if let Some(on_change) = on_change {
            on_change();
        }
    }

    pub fn set_rendering(&self, rendering: bool) -> bool {
        self.0.rendering.replace(rendering)
    }

    pub fn is_rendering(&self) -> bool {
        self.0.rendering.get()
    }

    pub fn set_host(&self, host: Option<ElementRef>) {
        *self.0.host.borrow_mut() = host;
    }

    pub fn host(&self) -> Option<ElementRef> {
        self.0.host.borrow().clone()
    }

    pub fn set_on_change(&self, on_change: Option<Rc<dyn Fn()>>) {
        *self.0.on_change.borrow_mut() = on_change;
    }

    pub fn is_output(&self, property: &str) -> bool {
        self.0.outputs.contains_key(property)
    }

    /// Borrows the concrete controller.
    pub fn with<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let controller = self.0.controller.borrow();
        controller.as_any().downcast_ref::<T>().map(f)
    }

    /// Mutates the concrete controller and marks it changed.
    pub fn with_mut<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let result = {
            let mut controller = self.0.controller.borrow_mut();
            controller.as_any_mut().downcast_mut::<T>().map(f)
        };
        self.mark_changed();
        result
    }
}

impl fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ControllerHandle({:#x})", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::Listener;

    fn counting_handle(outputs: Vec<OutputBinding>) -> (ControllerHandle, Rc<Cell<usize>>) {
        let handle = ControllerHandle::new(ObjectController::new().field("value", 0), outputs);
        let changes = Rc::new(Cell::new(0));
        let counter = changes.clone();
        handle.set_on_change(Some(Rc::new(move || counter.set(counter.get() + 1))));
        (handle, changes)
    }

    #[test]
    fn test_write_marks_changed() {
        let (handle, changes) = counting_handle(vec![]);
        handle.set("value", Value::from(3)).unwrap();
        assert_eq!(handle.get("value"), Value::from(3));
        assert_eq!(changes.get(), 1);
    }

    #[test]
    fn test_render_absorbs_changes() {
        let (handle, changes) = counting_handle(vec![]);
        handle.set_rendering(true);
        handle.set("value", Value::from(1)).unwrap();
        handle.set_rendering(false);
        assert_eq!(changes.get(), 0);
    }

    #[test]
    fn test_methods_are_bound() {
        let handle = ControllerHandle::new(
            ObjectController::new().field("n", 1).method("inc", |this, args| {
                let by = args.first().map(|v| v.to_number()).unwrap_or(1.0);
                let next = this.get("n").to_number() + by;
                this.set("n", Value::Number(next))?;
                Ok(Value::Number(next))
            }),
            vec![],
        );
        let Value::Function(inc) = handle.get("inc") else {
            panic!("expected a function");
        };
        assert_eq!(inc.call(&[Value::from(4)]).unwrap(), Value::from(5));
        assert_eq!(handle.get("n"), Value::from(5));
        assert!(handle.call("missing", &[]).is_err());
    }

    #[test]
    fn test_output_dispatch_and_deduplicate() {
        let dom = Dom::new();
        let host = dom.create_element("div");
        dom.append_child(dom.body(), host).unwrap();
        let output = OutputBinding::new("value")
            .event_name("Change")
            .deduplicate(Deduplicate::Always);
        let (handle, _) = counting_handle(vec![output]);
        handle.set_host(Some(dom.element_ref(host)));

        let seen = Rc::new(RefCell::new(vec![]));
        let sink = seen.clone();
        dom.add_event_listener(
            host,
            "change",
            &Listener::new(move |event| sink.borrow_mut().push(event.detail().clone())),
        );

        handle.set("value", Value::from("a")).unwrap();
        handle.set("value", Value::from("a")).unwrap();
        handle.set("value", Value::from("b")).unwrap();
        assert_eq!(*seen.borrow(), vec![Value::from("a"), Value::from("b")]);

        handle.set_from_attribute("value", Value::from("c"));
        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(handle.get("value"), Value::from("c"));
    }

    #[test]
    fn test_stoppable_runs_once() {
        let count = Rc::new(Cell::new(0));
        let c = count.clone();
        let stoppable = Stoppable::new(move || c.set(c.get() + 1));
        stoppable.stop();
        stoppable.stop();
        assert_eq!(count.get(), 1);
        assert!(stoppable.is_stopped());
    }

    #[test]
    fn test_event_binding_targets() {
        assert_eq!(EventBinding::new("window:resize", "m").target(), (EventTarget::Window, "resize"));
        assert_eq!(EventBinding::new("Body:click", "m").target(), (EventTarget::Body, "click"));
        assert_eq!(EventBinding::new("click", "m").target(), (EventTarget::Host, "click"));
    }
}
