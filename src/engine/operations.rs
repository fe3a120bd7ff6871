//! # Declarative Operations
//!
//! Builders, processors and generators all share one contract: a declarative
//! map validated at construction, gated by an optional `if` path and executed
//! against the environment, with reference errors wrapped into the
//! configuration-error taxonomy at the boundary.
//!
//! Two keys are reserved across all kinds:
//!
//! - `if`: a path whose successful resolution gates execution. An
//!   unresolvable path means "condition false", so the operation is skipped
//!   silently, never raised.
//! - `self.` prefix: rewritten at execution time to the current pipeline
//!   stage's concrete address (`requests[i]` or `response`), so operations
//!   are stage-relative without hardcoding indices.

use serde_json::{Map, Value};
use tracing::debug;

use crate::core::error::{GatewayResult, ServiceError};
use crate::engine::environment::Environment;

/// Keys that never count as payload for a `set` operation.
const RESERVED_KEYS: &[&str] = &["builder", "processor", "generator", "after_hook", "if"];

/// The pipeline stage an operation runs in. `self.` keys are rewritten to
/// this stage's concrete environment address.
#[derive(Debug, Clone, PartialEq)]
pub struct Scope(String);

impl Scope {
    pub fn request(index: usize) -> Self {
        Self(format!("requests[{index}]"))
    }

    pub fn response() -> Self {
        Self("response".to_string())
    }

    /// Rewrite a `self.`-prefixed key to this scope; other keys pass through.
    pub fn rewrite(&self, key: &str) -> String {
        match key.strip_prefix("self.") {
            Some(rest) => format!("{}.{rest}", self.0),
            None => key.to_string(),
        }
    }

    pub fn address(&self) -> &str {
        &self.0
    }
}

/// A polymorphic unit of declarative behavior with a uniform
/// validate → conditionally-execute → error-wrap lifecycle.
pub trait Operation: Send + Sync {
    /// The raw declarative map this operation was built from.
    fn definition(&self) -> &Map<String, Value>;

    /// The operation body. Reference errors convert into configuration
    /// errors on their way out, so they never escape raw.
    fn execute(&self, environment: &mut Environment, scope: &Scope) -> GatewayResult<()>;

    /// Conditionally execute: an `if` path that does not resolve skips the
    /// operation silently.
    fn run(&self, environment: &mut Environment, scope: &Scope) -> GatewayResult<()> {
        if let Some(condition) = self.definition().get("if") {
            let Some(condition) = condition.as_str() else {
                return Err(ServiceError::configuration(format!(
                    "'if' must be a path string: {condition}"
                )));
            };
            let gate = scope.rewrite(condition);
            if environment.get(&gate).is_err() {
                debug!(condition = %gate, "operation condition not met, skipping");
                return Ok(());
            }
        }
        self.execute(environment, scope)
    }
}

fn require_path(
    definition: &Map<String, Value>,
    key: &str,
    operation: &str,
) -> GatewayResult<String> {
    match definition.get(key).and_then(Value::as_str) {
        Some(value) => Ok(value.to_string()),
        None => Err(ServiceError::configuration(format!(
            "{operation} definition must include a '{key}' key: {}",
            Value::Object(definition.clone())
        ))),
    }
}

/// Writes every non-reserved key/value pair of its definition into the
/// environment.
pub struct SetOperation {
    definition: Map<String, Value>,
}

impl SetOperation {
    pub fn new(definition: Map<String, Value>) -> GatewayResult<Box<dyn Operation>> {
        Ok(Box::new(Self { definition }))
    }
}

impl Operation for SetOperation {
    fn definition(&self) -> &Map<String, Value> {
        &self.definition
    }

    fn execute(&self, environment: &mut Environment, scope: &Scope) -> GatewayResult<()> {
        for (key, value) in &self.definition {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            environment.set(&scope.rewrite(key), value.clone())?;
        }
        Ok(())
    }
}

/// Copies the value at `from` to `to`.
pub struct CopyOperation {
    definition: Map<String, Value>,
    to: String,
    from: String,
}

impl CopyOperation {
    pub fn new(definition: Map<String, Value>) -> GatewayResult<Box<dyn Operation>> {
        let to = require_path(&definition, "to", "CopyOperation")?;
        let from = require_path(&definition, "from", "CopyOperation")?;
        Ok(Box::new(Self { definition, to, from }))
    }
}

impl Operation for CopyOperation {
    fn definition(&self) -> &Map<String, Value> {
        &self.definition
    }

    fn execute(&self, environment: &mut Environment, scope: &Scope) -> GatewayResult<()> {
        let value = environment.get(&scope.rewrite(&self.from))?;
        environment.set(&scope.rewrite(&self.to), value)?;
        Ok(())
    }
}

/// Removes the value at `key`.
pub struct DeleteOperation {
    definition: Map<String, Value>,
    key: String,
}

impl DeleteOperation {
    pub fn new(definition: Map<String, Value>) -> GatewayResult<Box<dyn Operation>> {
        let key = require_path(&definition, "key", "DeleteOperation")?;
        Ok(Box::new(Self { definition, key }))
    }
}

impl Operation for DeleteOperation {
    fn definition(&self) -> &Map<String, Value> {
        &self.definition
    }

    fn execute(&self, environment: &mut Environment, scope: &Scope) -> GatewayResult<()> {
        environment.pop(&scope.rewrite(&self.key))?;
        Ok(())
    }
}
