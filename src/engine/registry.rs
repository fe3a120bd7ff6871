//! # Operation Registry
//!
//! A startup-time registry mapping declared implementation names to
//! constructors. Registration is explicit, so the set of valid names in a
//! gateway definition is closed: resolution of an unknown name, or a
//! descriptor missing its kind key, is a fatal configuration error rather
//! than a per-request failure.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::core::error::{GatewayResult, ServiceError};
use crate::engine::operations::{CopyOperation, DeleteOperation, Operation, SetOperation};
use crate::engine::xml::XmlToJsonOperation;

/// The stage a declarative operation descriptor belongs to; doubles as the
/// descriptor's kind key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Builder,
    Processor,
    Generator,
}

impl OperationKind {
    /// The descriptor key naming the implementation, e.g.
    /// `{"builder": "set", ...}`.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Builder => "builder",
            Self::Processor => "processor",
            Self::Generator => "generator",
        }
    }
}

/// Constructor for one registered operation implementation.
pub type OperationCtor = fn(Map<String, Value>) -> GatewayResult<Box<dyn Operation>>;

/// Name → constructor tables for builders, processors and generators.
pub struct OperationRegistry {
    entries: HashMap<(OperationKind, String), OperationCtor>,
}

impl OperationRegistry {
    /// Empty registry; most callers want [`OperationRegistry::with_builtins`].
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// The built-in implementations: `set`, `copy` and `delete` are available
    /// at every stage; `xml_to_json` only makes sense with an upstream
    /// response at hand, so it registers as a processor.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for kind in [
            OperationKind::Builder,
            OperationKind::Processor,
            OperationKind::Generator,
        ] {
            registry.register(kind, "set", SetOperation::new);
            registry.register(kind, "copy", CopyOperation::new);
            registry.register(kind, "delete", DeleteOperation::new);
        }
        registry.register(OperationKind::Processor, "xml_to_json", XmlToJsonOperation::new);
        registry
    }

    pub fn register(&mut self, kind: OperationKind, name: &str, ctor: OperationCtor) {
        self.entries.insert((kind, name.to_string()), ctor);
    }

    /// Instantiate the operation a descriptor names.
    pub fn resolve(
        &self,
        kind: OperationKind,
        descriptor: &Value,
    ) -> GatewayResult<Box<dyn Operation>> {
        let definition = descriptor.as_object().ok_or_else(|| {
            ServiceError::configuration(format!(
                "{} definition must be an object: {descriptor}",
                kind.key()
            ))
        })?;
        let name = definition
            .get(kind.key())
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::configuration(format!(
                    "{} definition does not include '{}' key: {descriptor}",
                    kind.key(),
                    kind.key()
                ))
            })?;
        let ctor = self.entries.get(&(kind, name.to_string())).ok_or_else(|| {
            ServiceError::configuration(format!(
                "unknown {} implementation '{name}'",
                kind.key()
            ))
        })?;
        ctor(definition.clone())
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
