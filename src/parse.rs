//! Parse Module for the nlib rendering engine
//!
//! Turns template HTML into neutral node-data. The host HTML parser
//! (html5ever) builds the document; the body content is then walked and every
//! textual attribute value and text node is split into bindable segments.

use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use markup5ever_rcdom::{Handle, NodeData as DomNodeData, RcDom};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use crate::bindable::{literal_text, parse_bindable, serialize_segments, Segment};
use crate::error::{EngineError, Result, ERR_PARSE_HTML, ERR_PARSE_NODE_DATA};

pub const HTML_NAMESPACE: &str = "http://www.w3.org/1999/xhtml";
pub const SVG_NAMESPACE: &str = "http://www.w3.org/2000/svg";
pub const MATHML_NAMESPACE: &str = "http://www.w3.org/1998/Math/MathML";

// ═══════════════════════════════════════════════════════════════════════════════
// SVG ATTRIBUTE CASE MAPPING
// ═══════════════════════════════════════════════════════════════════════════════

lazy_static! {
    /// HTML tokenizers lowercase attribute names; SVG needs these back in
    /// their canonical case.
    static ref SVG_ATTR_CASE_MAP: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert("viewbox", "viewBox");
        m.insert("preserveaspectratio", "preserveAspectRatio");
        m.insert("basefrequency", "baseFrequency");
        m.insert("clippathunits", "clipPathUnits");
        m.insert("filterunits", "filterUnits");
        m.insert("gradienttransform", "gradientTransform");
        m.insert("gradientunits", "gradientUnits");
        m.insert("markerheight", "markerHeight");
        m.insert("markerunits", "markerUnits");
        m.insert("markerwidth", "markerWidth");
        m.insert("maskcontentunits", "maskContentUnits");
        m.insert("maskunits", "maskUnits");
        m.insert("numoctaves", "numOctaves");
        m.insert("pathlength", "pathLength");
        m.insert("patterncontentunits", "patternContentUnits");
        m.insert("patterntransform", "patternTransform");
        m.insert("patternunits", "patternUnits");
        m.insert("primitiveunits", "primitiveUnits");
        m.insert("refx", "refX");
        m.insert("refy", "refY");
        m.insert("repeatcount", "repeatCount");
        m.insert("spreadmethod", "spreadMethod");
        m.insert("startoffset", "startOffset");
        m.insert("stddeviation", "stdDeviation");
        m.insert("textlength", "textLength");
        m.insert("attributename", "attributeName");
        m.insert("calcmode", "calcMode");
        m.insert("keytimes", "keyTimes");
        m.insert("keysplines", "keySplines");
        m
    };

    /// `[prop]`, `(event)` and `[(twoWay)]` carry an expression, not a
    /// templated string.
    static ref BINDING_ATTR_RE: Regex = Regex::new(r"^\[.*\]$|^\(.*\)$|^\[\(.*\)\]$").unwrap();

    static ref ENTITY_RE: Regex =
        Regex::new(r"&(#[0-9]+|#[xX][0-9a-fA-F]+|[a-zA-Z][a-zA-Z0-9]*);").unwrap();

    static ref VOID_ELEMENTS: HashSet<&'static str> = [
        "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta",
        "source", "track", "wbr",
    ]
    .into_iter()
    .collect();
}

thread_local! {
    static ENTITY_CACHE: RefCell<HashMap<String, String>> = RefCell::new(HashMap::new());
}

/// Restores canonical casing for attributes of SVG elements.
pub fn correct_svg_attribute_name(attr_name: &str, namespace: Option<&str>) -> String {
    if namespace == Some(SVG_NAMESPACE) {
        if let Some(&corrected) = SVG_ATTR_CASE_MAP.get(attr_name.to_lowercase().as_str()) {
            return corrected.to_string();
        }
        return attr_name.to_string();
    }
    attr_name.to_lowercase()
}

pub fn is_binding_attribute(name: &str) -> bool {
    BINDING_ATTR_RE.is_match(name)
}

pub fn is_void_element(tag: &str) -> bool {
    VOID_ELEMENTS.contains(tag)
}

// ═══════════════════════════════════════════════════════════════════════════════
// NODE DATA
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NodeData {
    Element(ElementData),
    Text(TextData),
    Comment(TextData),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementData {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default)]
    pub attributes: IndexMap<String, AttributeData>,
    #[serde(default)]
    pub children: Vec<NodeData>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttributeData {
    pub name: String,
    #[serde(default)]
    pub value: Vec<Segment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextData {
    #[serde(default)]
    pub text: Vec<Segment>,
}

impl NodeData {
    pub fn element(tag: &str) -> Self {
        NodeData::Element(ElementData {
            tag: tag.to_string(),
            namespace: None,
            attributes: IndexMap::new(),
            children: vec![],
        })
    }

    /// Template syntax for this node, the inverse of parsing.
    pub fn to_raw_string(&self) -> String {
        match self {
            NodeData::Text(t) => serialize_segments(&t.text),
            NodeData::Comment(c) => format!("<!--{}-->", serialize_segments(&c.text)),
            NodeData::Element(el) => {
                let mut out = format!("<{}", el.tag);
                for attr in el.attributes.values() {
                    out.push_str(&format!(
                        " {}=\"{}\"",
                        attr.name,
                        serialize_segments(&attr.value).replace('"', "&quot;")
                    ));
                }
                out.push('>');
                if is_void_element(&el.tag) {
                    return out;
                }
                for child in &el.children {
                    out.push_str(&child.to_raw_string());
                }
                out.push_str(&format!("</{}>", el.tag));
                out
            }
        }
    }
}

/// Parses precompiled node-data JSON.
pub fn node_data_from_json(json: &str) -> Result<Vec<NodeData>> {
    serde_json::from_str(json).map_err(|e| {
        EngineError::parse(ERR_PARSE_NODE_DATA, format!("Invalid node data: {}", e))
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// NODE PARSING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseMode {
    /// Text and attribute values are bindable strings.
    Template,
    /// Everything is literal; used for raw HTML produced at render time.
    Static,
}

fn text_segments(text: &str, mode: ParseMode) -> Result<Vec<Segment>> {
    match mode {
        ParseMode::Template => parse_bindable(text),
        ParseMode::Static => Ok(vec![Segment::literal(text)]),
    }
}

fn parse_dom_node(handle: &Handle, mode: ParseMode) -> Result<Option<NodeData>> {
    match &handle.data {
        DomNodeData::Text { contents } => {
            let text = contents.borrow().to_string();
            Ok(Some(NodeData::Text(TextData {
                text: text_segments(&text, mode)?,
            })))
        }

        DomNodeData::Comment { contents } => Ok(Some(NodeData::Comment(TextData {
            text: vec![Segment::literal(contents.to_string())],
        }))),

        DomNodeData::Element { name, attrs, .. } => {
            let namespace = match &*name.ns {
                HTML_NAMESPACE => None,
                other => Some(other.to_string()),
            };
            let tag = name.local.to_string();

            let mut attributes = IndexMap::new();
            for attr in attrs.borrow().iter() {
                let local = attr.name.local.to_string();
                let qualified = match &attr.name.prefix {
                    Some(prefix) => format!("{}:{}", prefix, local),
                    None => local,
                };
                let attr_name = correct_svg_attribute_name(&qualified, namespace.as_deref());
                let raw_value = attr.value.to_string();
                let value = if mode == ParseMode::Static
                    || is_binding_attribute(&attr_name)
                    || attr_name.starts_with('*')
                {
                    vec![Segment::literal(raw_value)]
                } else {
                    parse_bindable(&raw_value)?
                };
                attributes.insert(
                    attr_name.clone(),
                    AttributeData {
                        name: attr_name,
                        value,
                    },
                );
            }

            let mut children = Vec::new();
            for child in handle.children.borrow().iter() {
                if let Some(node) = parse_dom_node(child, mode)? {
                    children.push(node);
                }
            }

            Ok(Some(NodeData::Element(ElementData {
                tag,
                namespace,
                attributes,
                children,
            })))
        }

        _ => Ok(None),
    }
}

fn find_body(handle: &Handle) -> Option<Handle> {
    if let DomNodeData::Element { name, .. } = &handle.data {
        if &*name.local == "body" && &*name.ns == HTML_NAMESPACE {
            return Some(handle.clone());
        }
    }
    for child in handle.children.borrow().iter() {
        if let Some(body) = find_body(child) {
            return Some(body);
        }
    }
    None
}

fn parse_document_tree(html: &str) -> Result<RcDom> {
    parse_document(RcDom::default(), Default::default())
        .from_utf8()
        .read_from(&mut html.as_bytes())
        .map_err(|e| EngineError::parse(ERR_PARSE_HTML, format!("Failed to parse HTML: {}", e)))
}

fn parse_with(html: &str, mode: ParseMode) -> Result<Vec<NodeData>> {
    // Dropping the RcDom detaches every node's children, so walk while it lives.
    let dom = parse_document_tree(html)?;
    let Some(body) = find_body(&dom.document) else {
        return Ok(vec![]);
    };
    let mut nodes = Vec::new();
    for child in body.children.borrow().iter() {
        if let Some(node) = parse_dom_node(child, mode)? {
            nodes.push(node);
        }
    }
    Ok(nodes)
}

/// Parses a component template into node-data with bindable segments.
pub fn parse_html(html: &str) -> Result<Vec<NodeData>> {
    parse_with(html, ParseMode::Template)
}

/// Parses HTML whose text must be taken literally.
pub fn parse_static_html(html: &str) -> Result<Vec<NodeData>> {
    parse_with(html, ParseMode::Static)
}

/// True if any element in the tree is a `<slot>`.
pub fn contains_slot(nodes: &[NodeData]) -> bool {
    nodes.iter().any(|node| match node {
        NodeData::Element(el) => el.tag == "slot" || contains_slot(&el.children),
        _ => false,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENTITY DECODING
// ═══════════════════════════════════════════════════════════════════════════════

fn collect_text(handle: &Handle, out: &mut String) {
    if let DomNodeData::Text { contents } = &handle.data {
        out.push_str(&contents.borrow());
    }
    for child in handle.children.borrow().iter() {
        collect_text(child, out);
    }
}

fn decode_entity(entity: &str) -> String {
    if let Some(cached) = ENTITY_CACHE.with(|cache| cache.borrow().get(entity).cloned()) {
        return cached;
    }
    let numeric = entity
        .strip_prefix("&#")
        .and_then(|rest| rest.strip_suffix(';'))
        .and_then(|digits| match digits.strip_prefix(|c: char| c == 'x' || c == 'X') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => digits.parse::<u32>().ok(),
        });
    let decoded = match numeric {
        Some(code) => char::from_u32(code)
            .map(|c| c.to_string())
            .unwrap_or_else(|| entity.to_string()),
        None => match parse_document_tree(&format!("<p>{}</p>", entity)) {
            Ok(dom) => match find_body(&dom.document) {
                Some(body) => {
                    let mut text = String::new();
                    collect_text(&body, &mut text);
                    text
                }
                None => entity.to_string(),
            },
            Err(_) => entity.to_string(),
        },
    };
    ENTITY_CACHE.with(|cache| {
        cache
            .borrow_mut()
            .insert(entity.to_string(), decoded.clone())
    });
    decoded
}

/// Decodes HTML entities in text node content. Whitespace is left untouched.
pub fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    ENTITY_RE
        .replace_all(text, |caps: &regex::Captures| decode_entity(&caps[0]))
        .into_owned()
}

/// Escapes every `&` that does not already start an entity. Virtual text
/// keeps entities encoded until it reaches the DOM.
pub fn escape_bare_ampersands(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len() + 8);
    let mut last = 0;
    for found in text.match_indices('&') {
        let at = found.0;
        if at < last {
            continue;
        }
        out.push_str(&text[last..at]);
        match ENTITY_RE.find_at(text, at).filter(|m| m.start() == at) {
            Some(entity) => {
                out.push_str(entity.as_str());
                last = entity.end();
            }
            None => {
                out.push_str("&amp;");
                last = at + 1;
            }
        }
    }
    out.push_str(&text[last..]);
    out
}

/// Joined literal text of an attribute, if it has no bindings.
pub fn attribute_literal(attr: &AttributeData) -> Option<String> {
    literal_text(&attr.value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element(node: &NodeData) -> &ElementData {
        match node {
            NodeData::Element(el) => el,
            other => panic!("expected element, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_elements_and_text() {
        let nodes = parse_html(r#"<span class="a {{this.b}}">Hi {{this.name}}</span>"#).unwrap();
        assert_eq!(nodes.len(), 1);
        let span = element(&nodes[0]);
        assert_eq!(span.tag, "span");
        assert_eq!(span.namespace, None);
        assert_eq!(
            span.attributes["class"].value,
            vec![Segment::literal("a "), Segment::escaped("this.b")]
        );
        assert_eq!(
            span.children,
            vec![NodeData::Text(TextData {
                text: vec![Segment::literal("Hi "), Segment::escaped("this.name")]
            })]
        );
    }

    #[test]
    fn test_bare_ampersands_are_escaped_once() {
        assert_eq!(escape_bare_ampersands("a & b"), "a &amp; b");
        assert_eq!(escape_bare_ampersands("a &amp; b &#38; &lt;"), "a &amp; b &#38; &lt;");
        assert_eq!(escape_bare_ampersands("&&amp;&"), "&amp;&amp;&amp;");
    }

    #[test]
    fn test_body_children_survive_the_parse() {
        let nodes = parse_html("<p>hi</p>").unwrap();
        assert_eq!(nodes.len(), 1);
        let p = element(&nodes[0]);
        assert_eq!(p.tag, "p");
        assert_eq!(p.children, vec![NodeData::Text(TextData { text: vec![Segment::literal("hi")] })]);

        let nested = parse_static_html("<ul><li>a</li><li>b</li></ul> tail").unwrap();
        assert_eq!(nested.len(), 2);
        assert_eq!(element(&nested[0]).children.len(), 2);
    }

    #[test]
    fn test_binding_attributes_keep_raw_value() {
        let nodes =
            parse_html(r#"<input [value]="this.v" (input)="this.v = $event.target.value" [(x)]="{{y}}" *if="this.ok">"#)
                .unwrap();
        let input = element(&nodes[0]);
        assert_eq!(input.attributes["[value]"].value, vec![Segment::literal("this.v")]);
        assert_eq!(
            input.attributes["(input)"].value,
            vec![Segment::literal("this.v = $event.target.value")]
        );
        assert_eq!(input.attributes["[(x)]"].value, vec![Segment::literal("{{y}}")]);
        assert_eq!(input.attributes["*if"].value, vec![Segment::literal("this.ok")]);
    }

    #[test]
    fn test_svg_namespace_and_casing() {
        let nodes = parse_html(r#"<svg viewBox="0 0 10 10"><circle r="1"></circle></svg>"#).unwrap();
        let svg = element(&nodes[0]);
        assert_eq!(svg.namespace.as_deref(), Some(SVG_NAMESPACE));
        assert!(svg.attributes.contains_key("viewBox"));
        assert_eq!(element(&svg.children[0]).tag, "circle");
    }

    #[test]
    fn test_svg_attribute_correction() {
        assert_eq!(correct_svg_attribute_name("viewbox", Some(SVG_NAMESPACE)), "viewBox");
        assert_eq!(correct_svg_attribute_name("class", Some(SVG_NAMESPACE)), "class");
        assert_eq!(correct_svg_attribute_name("viewBox", None), "viewbox");
    }

    #[test]
    fn test_comments_and_slots() {
        let nodes = parse_html("<div><!-- note --><slot name=\"a\"></slot></div>").unwrap();
        let div = element(&nodes[0]);
        assert_eq!(
            div.children[0],
            NodeData::Comment(TextData {
                text: vec![Segment::literal(" note ")]
            })
        );
        assert!(contains_slot(&nodes));
        assert!(!contains_slot(&parse_html("<p></p>").unwrap()));
    }

    #[test]
    fn test_static_html_keeps_braces() {
        let nodes = parse_static_html("<b>{{ not bound</b>").unwrap();
        let b = element(&nodes[0]);
        assert_eq!(
            b.children[0],
            NodeData::Text(TextData {
                text: vec![Segment::literal("{{ not bound")]
            })
        );
    }

    #[test]
    fn test_unbalanced_binding_fails() {
        assert!(parse_html("<p>{{ oops</p>").is_err());
    }

    #[test]
    fn test_node_data_json_round_trip() {
        let nodes = parse_html("<p id=\"x\">a{{b}}</p>").unwrap();
        let json = serde_json::to_string(&nodes).unwrap();
        assert_eq!(node_data_from_json(&json).unwrap(), nodes);
        assert_eq!(nodes[0].to_raw_string(), "<p id=\"x\">a{{b}}</p>");
    }

    #[test]
    fn test_decode_entities_preserves_leading_space() {
        assert_eq!(decode_entities("  a &amp; b"), "  a & b");
        assert_eq!(decode_entities("&#65;&#x42;&lt;"), "AB<");
        assert_eq!(decode_entities("&nbsp;x"), "\u{a0}x");
        assert_eq!(decode_entities("plain"), "plain");
    }
}
