//! XML to JSON conversion with xml2js-style shapes.
//!
//! The root element becomes the single key of the result. Every child element
//! maps to an array so repeated siblings never change the shape. Attributes
//! live under `"$"`, and the text of an element that also has attributes or
//! children lives under `"_"`. Text-only leaves collapse to plain strings.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

const ATTR_KEY: &str = "$";
const TEXT_KEY: &str = "_";

#[derive(Debug, Default)]
struct Node {
    name: String,
    attrs: Map<String, Value>,
    text: String,
    children: Map<String, Value>,
}

impl Node {
    fn open(start: &BytesStart<'_>) -> Result<Self, String> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attrs = Map::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| e.to_string())?;
            let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
            let value = attr.unescape_value().map_err(|e| e.to_string())?;
            attrs.insert(key, Value::String(value.into_owned()));
        }
        Ok(Self {
            name,
            attrs,
            ..Self::default()
        })
    }

    fn push_child(&mut self, name: String, value: Value) {
        let slot = self
            .children
            .entry(name)
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = slot {
            items.push(value);
        }
    }

    fn finish(self) -> (String, Value) {
        if self.attrs.is_empty() && self.children.is_empty() {
            return (self.name, Value::String(self.text));
        }

        let mut obj = Map::new();
        if !self.attrs.is_empty() {
            obj.insert(ATTR_KEY.to_string(), Value::Object(self.attrs));
        }
        for (key, value) in self.children {
            obj.insert(key, value);
        }
        if !self.text.trim().is_empty() {
            obj.insert(TEXT_KEY.to_string(), Value::String(self.text));
        }
        (self.name, Value::Object(obj))
    }
}

/// Parses `input` and returns its JSON form, or the parser's message.
pub fn xml_to_json(input: &str) -> Result<Value, String> {
    let mut reader = Reader::from_str(input);
    let mut stack: Vec<Node> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("{e} at position {}", reader.buffer_position()))?;
        match event {
            Event::Start(start) => {
                if root.is_some() {
                    return Err("Multiple root elements".to_string());
                }
                stack.push(Node::open(&start)?);
            }
            Event::Empty(start) => {
                if root.is_some() {
                    return Err("Multiple root elements".to_string());
                }
                let node = Node::open(&start)?;
                close(node, &mut stack, &mut root);
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| "Unexpected close tag".to_string())?;
                close(node, &mut stack, &mut root);
            }
            Event::Text(text) => {
                let text = text.unescape().map_err(|e| e.to_string())?;
                match stack.last_mut() {
                    Some(node) => node.text.push_str(&text),
                    None if text.trim().is_empty() => {}
                    None => return Err("Non-whitespace outside of root element".to_string()),
                }
            }
            Event::CData(data) => {
                let text = String::from_utf8_lossy(&data.into_inner()).into_owned();
                match stack.last_mut() {
                    Some(node) => node.text.push_str(&text),
                    None => return Err("CDATA outside of root element".to_string()),
                }
            }
            Event::Eof => break,
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
        }
    }

    if !stack.is_empty() {
        return Err("Unclosed root tag".to_string());
    }
    let (name, value) = root.ok_or_else(|| "Document has no root element".to_string())?;
    let mut out = Map::new();
    out.insert(name, value);
    Ok(Value::Object(out))
}

fn close(node: Node, stack: &mut [Node], root: &mut Option<(String, Value)>) {
    let (name, value) = node.finish();
    match stack.last_mut() {
        Some(parent) => parent.push_child(name, value),
        None => *root = Some((name, value)),
    }
}
