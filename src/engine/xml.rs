//! # XML Payload Conversion
//!
//! The `xml_to_json` processor lets JSON-oriented pipelines address into XML
//! upstreams: it parses the current request's response text and stores the
//! converted document under the response's `json` facet, so generators and
//! later requests can use plain paths into it.
//!
//! Conversion rules: an element becomes a map of its children, repeated child
//! names collect into a list, attributes are prefixed with `@`, character
//! data of a mixed element lands under `#text`, and an element with nothing
//! but character data collapses to a string (or null when empty).

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

use crate::core::error::{GatewayResult, ServiceError};
use crate::engine::environment::Environment;
use crate::engine::operations::{Operation, Scope};

/// Parses `self.response.text` as XML into `self.response.json`.
pub struct XmlToJsonOperation {
    definition: Map<String, Value>,
}

impl XmlToJsonOperation {
    pub fn new(definition: Map<String, Value>) -> GatewayResult<Box<dyn Operation>> {
        Ok(Box::new(Self { definition }))
    }
}

impl Operation for XmlToJsonOperation {
    fn definition(&self) -> &Map<String, Value> {
        &self.definition
    }

    fn execute(&self, environment: &mut Environment, scope: &Scope) -> GatewayResult<()> {
        let text = environment.get(&scope.rewrite("self.response.text"))?;
        let Some(text) = text.as_str() else {
            return Err(xml_error("response text is not a string"));
        };
        let document = xml_to_value(text)?;
        environment.set(&scope.rewrite("self.response.json"), document)?;
        Ok(())
    }
}

fn xml_error<E: std::fmt::Display>(cause: E) -> ServiceError {
    ServiceError::internal(format!("Error with XML response: {cause}"))
}

/// An element whose closing tag has not been seen yet.
struct PartialElement {
    name: String,
    attributes: Map<String, Value>,
    children: Vec<(String, Value)>,
    text: String,
}

impl PartialElement {
    fn open(start: &BytesStart) -> GatewayResult<Self> {
        let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
        let mut attributes = Map::new();
        for attribute in start.attributes() {
            let attribute = attribute.map_err(xml_error)?;
            let key = format!("@{}", String::from_utf8_lossy(attribute.key.as_ref()));
            let value = attribute.unescape_value().map_err(xml_error)?.into_owned();
            attributes.insert(key, Value::String(value));
        }
        Ok(Self {
            name,
            attributes,
            children: Vec::new(),
            text: String::new(),
        })
    }

    fn finish(self) -> (String, Value) {
        let text = self.text.trim().to_string();
        if self.attributes.is_empty() && self.children.is_empty() {
            let value = if text.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            };
            return (self.name, value);
        }
        let mut object = self.attributes;
        for (name, value) in self.children {
            match object.get_mut(&name) {
                None => {
                    object.insert(name, value);
                }
                Some(Value::Array(items)) => items.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
            }
        }
        if !text.is_empty() {
            object.insert("#text".to_string(), Value::String(text));
        }
        (self.name, Value::Object(object))
    }
}

fn attach(
    child: (String, Value),
    stack: &mut [PartialElement],
    root: &mut Option<(String, Value)>,
) -> GatewayResult<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(child);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(child);
            Ok(())
        }
        None => Err(xml_error("content after the document root")),
    }
}

/// Convert an XML document into a JSON value keyed by its root element.
pub fn xml_to_value(text: &str) -> GatewayResult<Value> {
    let mut reader = Reader::from_str(text);
    reader.trim_text(true);
    let mut stack: Vec<PartialElement> = Vec::new();
    let mut root: Option<(String, Value)> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(start) => stack.push(PartialElement::open(&start)?),
            Event::Empty(start) => {
                let element = PartialElement::open(&start)?;
                attach(element.finish(), &mut stack, &mut root)?;
            }
            Event::Text(content) => {
                if let Some(element) = stack.last_mut() {
                    element.text.push_str(&content.unescape().map_err(xml_error)?);
                }
            }
            Event::CData(content) => {
                if let Some(element) = stack.last_mut() {
                    element
                        .text
                        .push_str(&String::from_utf8_lossy(&content.into_inner()));
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| xml_error("closing tag without an open element"))?;
                attach(element.finish(), &mut stack, &mut root)?;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some(element) = stack.last() {
        return Err(xml_error(format!("unclosed element '{}'", element.name)));
    }
    let (name, value) = root.ok_or_else(|| xml_error("document has no root element"))?;
    let mut document = Map::new();
    document.insert(name, value);
    Ok(Value::Object(document))
}
