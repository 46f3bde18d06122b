//! Tag replacer for markup produced by hosts that strip custom elements.
//!
//! An element such as `<div data-nils-library-tag-replacer="nl-card">` is
//! swapped for `<nl-card>`, keeping its children and every other attribute.
//! Only tags defined through [`crate::component::register`] are eligible.

use crate::component::ComponentDefinition;
use crate::config::EngineOptions;
use crate::dom::{Dom, MutationObserverInit, MutationRecord, NodeId, ObserverId};
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct TagReplacer {
    attribute: String,
}

impl Default for TagReplacer {
    fn default() -> Self {
        Self::new(&EngineOptions::default())
    }
}

impl TagReplacer {
    pub fn new(options: &EngineOptions) -> Self {
        Self {
            attribute: options.tag_replacer_attribute.clone(),
        }
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Replaces `root` (or its marked descendants) and returns how many
    /// elements were swapped.
    pub fn inject(&self, dom: &Dom, root: NodeId) -> usize {
        let targets = if dom.is_element(root) && dom.has_attribute(root, &self.attribute) {
            vec![root]
        } else {
            dom.query_with_attribute(root, &self.attribute)
        };

        let mut replaced = 0;
        for node in targets {
            match self.replace(dom, node) {
                Ok(true) => replaced += 1,
                Ok(false) => {}
                Err(e) => tracing::warn!(attribute = %self.attribute, error = %e, "tag replacement failed"),
            }
        }
        replaced
    }

    fn replace(&self, dom: &Dom, node: NodeId) -> Result<bool> {
        let Some(parent) = dom.parent(node) else {
            return Ok(false);
        };
        let Some(tag) = dom.get_attribute(node, &self.attribute) else {
            return Ok(false);
        };
        let tag = tag.to_lowercase();
        match dom.definition(&tag) {
            Some(definition) if ComponentDefinition::is_component(&definition) => {}
            _ => {
                tracing::debug!(tag = %tag, "tag replacer skipped a non-component tag");
                return Ok(false);
            }
        }

        let children = dom.children(node);
        for child in &children {
            dom.remove_child(node, *child)?;
        }
        let element = dom.create_element(&tag);
        for child in children {
            dom.append_child(element, child)?;
        }
        for attr in dom.attributes(node) {
            if attr.name == self.attribute && attr.namespace.is_none() {
                continue;
            }
            dom.set_attribute_ns(element, attr.namespace.as_deref(), &attr.name, &attr.value);
        }

        dom.replace_child(parent, element, node)?;
        tracing::debug!(tag = %tag, "replaced marked element");
        Ok(true)
    }

    /// Replaces marked elements already in the body, then every marked
    /// element added to the document later.
    pub fn observe(&self, dom: &Dom) -> ObserverId {
        let replacer = self.clone();
        let observer = dom.create_observer(move |dom, records| {
            for record in records {
                if let MutationRecord::ChildList { added, .. } = record {
                    for node in added.iter().filter(|n| dom.is_element(**n)) {
                        replacer.inject(dom, *node);
                    }
                }
            }
        });
        self.inject(dom, dom.body());
        dom.observe(
            observer,
            dom.document(),
            MutationObserverInit {
                child_list: true,
                subtree: true,
                ..Default::default()
            },
        );
        observer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{register, ComponentConfig};
    use crate::controller::ObjectController;
    use crate::dom::{CustomElement, ElementDefinition};
    use std::any::Any;
    use std::rc::Rc;

    struct Plain;

    impl CustomElement for Plain {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    impl ElementDefinition for Plain {
        fn construct(&self, _dom: &Dom, _node: NodeId) -> Rc<dyn CustomElement> {
            Rc::new(Plain)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn setup() -> Dom {
        let dom = Dom::new();
        register(
            &dom,
            ComponentConfig::new("nl-badge", || ObjectController::new().field("label", "x"))
                .html("<b>{{this.label}}</b>"),
            &EngineOptions::default(),
        )
        .unwrap();
        dom.define("nl-plain", Rc::new(Plain)).unwrap();
        dom
    }

    #[test]
    fn test_replaces_component_tags_only() {
        let dom = setup();
        let replacer = TagReplacer::default();
        let marked = dom.create_element("div");
        dom.set_attribute(marked, replacer.attribute(), "nl-badge");
        dom.set_attribute(marked, "class", "big");
        let child = dom.create_text_node("kept");
        dom.append_child(marked, child).unwrap();
        let plain = dom.create_element("span");
        dom.set_attribute(plain, replacer.attribute(), "nl-plain");
        dom.append_child(dom.body(), marked).unwrap();
        dom.append_child(dom.body(), plain).unwrap();

        assert_eq!(replacer.inject(&dom, dom.body()), 1);
        let replaced = dom.element_children(dom.body())[0];
        assert_eq!(dom.local_name(replaced).as_deref(), Some("nl-badge"));
        assert_eq!(dom.get_attribute(replaced, "class").as_deref(), Some("big"));
        assert!(!dom.has_attribute(replaced, replacer.attribute()));
        assert_eq!(dom.parent(child), Some(replaced));
        assert!(dom.text_content(replaced).contains("kept"));
        assert!(dom.has_attribute(plain, replacer.attribute()));
    }

    #[test]
    fn test_observer_replaces_added_elements() {
        let dom = setup();
        let replacer = TagReplacer::default();
        replacer.observe(&dom);

        let wrapper = dom.create_element("section");
        let marked = dom.create_element("div");
        dom.set_attribute(marked, replacer.attribute(), "nl-badge");
        dom.append_child(wrapper, marked).unwrap();
        dom.append_child(dom.body(), wrapper).unwrap();
        dom.settle();

        assert_eq!(dom.inner_html(wrapper), r#"<nl-badge nlib-hid="nl-badge"><b nlib-cid="nl-badge">x</b></nl-badge>"#);
    }
}
