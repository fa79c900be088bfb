use quick_xml::events::Event;
use quick_xml::Reader;

use crate::error::TopologyError;

/// A plain XML element tree. Attribute order and child order are preserved so
/// a parsed document can be edited and written back without structural churn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
    pub text: String,
}

impl XmlNode {
    pub fn new(name: impl Into<String>) -> Self {
        XmlNode { name: name.into(), ..Default::default() }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> {
        self.children.iter().filter(move |c| c.name == name)
    }
}

/// Parse a document into its root element. Comments and the XML declaration
/// are dropped.
pub fn parse(input: &str) -> Result<XmlNode, TopologyError> {
    let mut reader = Reader::from_str(input);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = Vec::new();
    let mut root: Option<XmlNode> = None;

    loop {
        match reader.read_event().map_err(|e| TopologyError::Xml(e.to_string()))? {
            Event::Start(start) => {
                let node = node_from_start(&start)?;
                stack.push(node);
            }
            Event::Empty(start) => {
                let node = node_from_start(&start)?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Text(text) => {
                if let Some(top) = stack.last_mut() {
                    let t = text.unescape().map_err(|e| TopologyError::Xml(e.to_string()))?;
                    top.text.push_str(t.trim());
                }
            }
            Event::End(_) => {
                let node = stack.pop().ok_or_else(|| {
                    TopologyError::Xml("unbalanced closing tag".to_string())
                })?;
                attach(&mut stack, &mut root, node)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        return Err(TopologyError::Xml("unclosed element".to_string()));
    }
    root.ok_or_else(|| TopologyError::Xml("document has no root element".to_string()))
}

fn node_from_start(start: &quick_xml::events::BytesStart<'_>) -> Result<XmlNode, TopologyError> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut node = XmlNode::new(name);
    for attr in start.attributes() {
        let attr = attr.map_err(|e| TopologyError::Xml(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| TopologyError::Xml(e.to_string()))?
            .into_owned();
        node.attrs.push((key, value));
    }
    Ok(node)
}

fn attach(
    stack: &mut [XmlNode],
    root: &mut Option<XmlNode>,
    node: XmlNode,
) -> Result<(), TopologyError> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(node);
            Ok(())
        }
        None => Err(TopologyError::Xml("multiple root elements".to_string())),
    }
}

/// Serialize an element tree back to an indented document.
pub fn write(node: &XmlNode) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    write_node(node, 0, &mut out);
    out
}

fn write_node(node: &XmlNode, depth: usize, out: &mut String) {
    let indent = "    ".repeat(depth);
    out.push_str(&indent);
    out.push('<');
    out.push_str(&node.name);
    for (k, v) in &node.attrs {
        out.push(' ');
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&escape(v));
        out.push('"');
    }
    if node.children.is_empty() && node.text.is_empty() {
        out.push_str("/>\n");
        return;
    }
    out.push('>');
    if node.children.is_empty() {
        out.push_str(&escape(&node.text));
    } else {
        out.push('\n');
        for child in &node.children {
            write_node(child, depth + 1, out);
        }
        out.push_str(&indent);
    }
    out.push_str("</");
    out.push_str(&node.name);
    out.push_str(">\n");
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trip_preserves_structure() {
        let doc = r#"<topology name="t"><main name="main"><group name="g" n="4"><collection name="c"/></group></main></topology>"#;
        let root = parse(doc).unwrap();
        assert_eq!(root.name, "topology");
        assert_eq!(root.attr("name"), Some("t"));
        let main = root.child("main").unwrap();
        let group = main.child("group").unwrap();
        assert_eq!(group.attr("n"), Some("4"));

        let reparsed = parse(&write(&root)).unwrap();
        assert_eq!(reparsed, root);
    }

    #[test]
    fn parse_reads_text_content() {
        let doc = "<decltask name=\"t\"><exe>/usr/bin/device --foo</exe></decltask>";
        let root = parse(doc).unwrap();
        assert_eq!(root.child("exe").unwrap().text, "/usr/bin/device --foo");
    }

    #[test]
    fn set_attr_overwrites_in_place() {
        let mut node = parse("<group name=\"g\" n=\"4\"/>").unwrap();
        node.set_attr("n", "2");
        assert_eq!(node.attr("n"), Some("2"));
        assert_eq!(node.attrs.len(), 2);
    }

    #[test]
    fn reject_garbage() {
        assert!(parse("").is_err());
        assert!(parse("<a><b></a>").is_err());
    }

    #[test]
    fn escaped_attributes_round_trip() {
        let root = parse("<t v=\"a &amp; b\"/>").unwrap();
        assert_eq!(root.attr("v"), Some("a & b"));
        let again = parse(&write(&root)).unwrap();
        assert_eq!(again.attr("v"), Some("a & b"));
    }
}
