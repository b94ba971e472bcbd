//! Rendered output of a component.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Elements that never take children or a closing tag.
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source",
    "track", "wbr",
];

pub fn is_void_element(tag: &str) -> bool {
    VOID_ELEMENTS.contains(&tag.to_ascii_lowercase().as_str())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum VNode {
    Element {
        tag: String,
        attrs: BTreeMap<String, String>,
        /// Event name to handler id, valid for the render that produced it.
        events: BTreeMap<String, usize>,
        children: Vec<VNode>,
    },
    Text {
        value: String,
    },
    /// Registered (or unresolved PascalCase) sub-component.
    Component {
        name: String,
        props: serde_json::Map<String, serde_json::Value>,
        events: BTreeMap<String, usize>,
        children: Vec<VNode>,
    },
}

impl VNode {
    pub fn text(value: impl Into<String>) -> Self {
        VNode::Text {
            value: value.into(),
        }
    }

    pub fn children(&self) -> &[VNode] {
        match self {
            VNode::Element { children, .. } | VNode::Component { children, .. } => children,
            VNode::Text { .. } => &[],
        }
    }

    /// Concatenated text of this node and its descendants.
    pub fn text_content(&self) -> String {
        match self {
            VNode::Text { value } => value.clone(),
            _ => self.children().iter().map(VNode::text_content).collect(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        match self {
            VNode::Element { attrs, .. } => attrs.get(name).map(String::as_str),
            _ => None,
        }
    }

    pub fn to_html(&self) -> String {
        let mut out = String::new();
        self.write_html(&mut out);
        out
    }

    fn write_html(&self, out: &mut String) {
        match self {
            VNode::Text { value } => out.push_str(&escape_text(value)),
            VNode::Element {
                tag,
                attrs,
                children,
                ..
            } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attrs {
                    write_attr(out, name, value);
                }
                out.push('>');
                if is_void_element(tag) {
                    return;
                }
                for child in children {
                    child.write_html(out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
            VNode::Component {
                name,
                props,
                children,
                ..
            } => {
                out.push('<');
                out.push_str(name);
                for (key, value) in props {
                    let text = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    write_attr(out, key, &text);
                }
                out.push('>');
                for child in children {
                    child.write_html(out);
                }
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
        }
    }
}

/// HTML for a list of root nodes.
pub fn to_html(nodes: &[VNode]) -> String {
    nodes.iter().map(VNode::to_html).collect()
}

fn write_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    if !value.is_empty() {
        out.push_str("=\"");
        out.push_str(&escape_attr(value));
        out.push('"');
    }
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    escape_text(value).replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_html_escapes_text_and_attributes() {
        let mut attrs = BTreeMap::new();
        attrs.insert("title".to_string(), "a \"b\" <c>".to_string());
        attrs.insert("disabled".to_string(), String::new());
        let node = VNode::Element {
            tag: "button".to_string(),
            attrs,
            events: BTreeMap::new(),
            children: vec![VNode::text("1 < 2 & 3")],
        };
        assert_eq!(
            node.to_html(),
            "<button disabled title=\"a &quot;b&quot; &lt;c&gt;\">1 &lt; 2 &amp; 3</button>"
        );
    }

    #[test]
    fn test_void_elements_have_no_closing_tag() {
        let node = VNode::Element {
            tag: "br".to_string(),
            attrs: BTreeMap::new(),
            events: BTreeMap::new(),
            children: vec![],
        };
        assert_eq!(node.to_html(), "<br>");
    }

    #[test]
    fn test_serializes_with_kind_tag() {
        let node = VNode::text("hi");
        assert_eq!(serde_json::to_value(&node).unwrap(), json!({ "kind": "text", "value": "hi" }));
    }
}
