//! # Gateway Request Environment
//!
//! The aggregate root for one inbound call. It owns the route record, the
//! ordered upstream requests, the outbound response, gateway constants and
//! the error state, and exposes path-based `get`/`set`/`pop` plus `${...}`
//! string interpolation over that owned tree.
//!
//! The addressable tree is heterogeneous: JSON maps and sequences mix with
//! fixed-shape records (route, request, upstream response, response). Maps
//! auto-create missing intermediate objects on `set` only; sequences accept
//! in-range integer subscripts only; records accept only their declared field
//! names, even mid-path, since records cannot gain new fields dynamically.
//!
//! Traversal resolves to a parent node plus final key before mutating, never
//! to raw pointers into the tree, so `set` and `pop` mutate in place safely.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::core::error::{GatewayResult, ReferenceError, ServiceError};
use crate::engine::entities::{
    GatewayRequest, GatewayResponse, HttpMethod, RouteState, UpstreamResponse,
};
use crate::engine::path::{parse_path, Segment, Subscript};

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("token regex"))
}

/// Per-call owned aggregate of route, requests, response, constants and error
/// state, addressable by path.
#[derive(Debug)]
pub struct Environment {
    /// Gateway-level named values. Directly declared constants always win
    /// over included ones; the merge happens at definition load time.
    pub constants: Value,
    pub route: RouteState,
    /// Append-only; order reflects declaration order.
    pub requests: Vec<GatewayRequest>,
    pub response: Option<GatewayResponse>,
    /// Descriptors to run once handling completes, success or failure.
    pub after_hooks: Value,
    error: Option<String>,
}

impl Environment {
    pub fn new(route: RouteState, constants: Value, after_hooks: Value) -> Self {
        Self {
            constants,
            route,
            requests: Vec::new(),
            response: None,
            after_hooks,
            error: None,
        }
    }

    /// Record the first unhandled or service error. Write-once: later calls
    /// with a non-empty value are ignored.
    pub fn record_error<S: Into<String>>(&mut self, message: S) {
        let message = message.into();
        if self.error.is_none() && !message.is_empty() {
            self.error = Some(message);
        }
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Interpolate `${...}` tokens in the request against the current
    /// environment, then append it. Tokens may reference any earlier
    /// request's already-populated response but never a later one.
    pub fn evaluate_and_add_request(&mut self, mut request: GatewayRequest) -> GatewayResult<()> {
        self.interpolate_string_field(&mut request.url)?;
        self.interpolate_value(&mut request.headers)?;
        self.interpolate_value(&mut request.text)?;
        self.interpolate_value(&mut request.json)?;
        self.interpolate_value(&mut request.data)?;
        self.interpolate_value(&mut request.builders)?;
        self.interpolate_value(&mut request.processors)?;
        self.requests.push(request);
        Ok(())
    }

    /// Interpolate the response definition copy and attach it. At most one
    /// response exists per call.
    pub fn evaluate_and_add_response(&mut self, mut response: GatewayResponse) -> GatewayResult<()> {
        self.interpolate_value(&mut response.headers)?;
        self.interpolate_value(&mut response.text)?;
        self.interpolate_value(&mut response.json)?;
        self.interpolate_value(&mut response.data)?;
        self.interpolate_value(&mut response.generators)?;
        self.response = Some(response);
        Ok(())
    }

    /// Get a value from the environment. Records are coerced to JSON values.
    pub fn get(&self, path: &str) -> Result<Value, ReferenceError> {
        let segments = self.resolve_subscripts(parse_path(path)?, path)?;
        let mut node = Node::Root(self);
        for segment in &segments {
            node = node.child(&segment.key, path)?;
            if let Some(subscript) = &segment.subscript {
                node = node.subscript(subscript, path)?;
            }
        }
        Ok(node.into_value())
    }

    /// Set a value. Missing intermediate map keys are created; missing
    /// sequences are not, and out-of-range indices fail.
    pub fn set(&mut self, path: &str, value: Value) -> Result<(), ReferenceError> {
        let segments = self.resolve_subscripts(parse_path(path)?, path)?;
        let (last, parents) = segments.split_last().expect("parse_path yields segments");

        let mut node = NodeMut::Root(self);
        for segment in parents {
            node = node.child(&segment.key, true, path)?;
            if let Some(subscript) = &segment.subscript {
                node = node.subscript(subscript, path)?;
            }
        }
        node.assign(last, value, path)
    }

    /// Remove and return a value. Record fields are reset to null rather than
    /// removed, since records keep their shape.
    pub fn pop(&mut self, path: &str) -> Result<Value, ReferenceError> {
        let segments = self.resolve_subscripts(parse_path(path)?, path)?;
        let (last, parents) = segments.split_last().expect("parse_path yields segments");

        let mut node = NodeMut::Root(self);
        for segment in parents {
            node = node.child(&segment.key, false, path)?;
            if let Some(subscript) = &segment.subscript {
                node = node.subscript(subscript, path)?;
            }
        }
        node.remove(last, path)
    }

    /// Resolve dynamic (unquoted expression) subscripts into literal indices
    /// or keys before traversal.
    fn resolve_subscripts(
        &self,
        mut segments: Vec<Segment>,
        path: &str,
    ) -> Result<Vec<Segment>, ReferenceError> {
        for segment in &mut segments {
            if let Some(Subscript::Expr(expr)) = &segment.subscript {
                let resolved = self.get(expr)?;
                segment.subscript = Some(match resolved {
                    Value::String(s) => Subscript::Key(s),
                    Value::Number(n) => match n.as_u64() {
                        Some(i) => Subscript::Index(i as usize),
                        None => {
                            return Err(ReferenceError::new(format!(
                                "subscript '{expr}' did not resolve to a non-negative integer \
                                 (from: {path})"
                            )))
                        }
                    },
                    other => {
                        return Err(ReferenceError::new(format!(
                            "subscript '{expr}' resolved to non-scalar {other} (from: {path})"
                        )))
                    }
                });
            }
        }
        Ok(segments)
    }

    fn interpolate_value(&self, value: &mut Value) -> GatewayResult<()> {
        match value {
            Value::String(s) => self.interpolate_string_field(s)?,
            Value::Object(map) => {
                for (_, v) in map.iter_mut() {
                    self.interpolate_value(v)?;
                }
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.interpolate_value(item)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Replace every `${path}` token in the string. Resolved values must be
    /// strings or numbers; anything else is a fatal configuration error.
    fn interpolate_string_field(&self, s: &mut String) -> GatewayResult<()> {
        let original = s.clone();
        for capture in token_regex().captures_iter(&original) {
            let token = &capture[0];
            let key = &capture[1];
            let value = self.get(key).map_err(|e| {
                ServiceError::internal_with_log(
                    "Gateway route reference error",
                    format!("Key not found in env: \"{key}\". Error: {e}"),
                )
            })?;
            let replacement = match &value {
                Value::String(v) => v.clone(),
                Value::Number(n) => n.to_string(),
                _ => {
                    return Err(ServiceError::internal_with_log(
                        "Gateway route reference error",
                        format!("Env {key} is not a Number or str, cannot replace."),
                    ))
                }
            };
            debug!(token, %replacement, "interpolated environment token");
            *s = s.replace(token, &replacement);
        }
        Ok(())
    }

    /// Index of the request carrying the given name, if any.
    fn request_index_by_name(&self, name: &str) -> Option<usize> {
        self.requests
            .iter()
            .position(|r| r.name.as_deref() == Some(name))
    }
}

/// Immutable traversal cursor. `Owned` carries computed scalars (typed record
/// fields coerced to JSON) so the walk never hands out raw pointers.
enum Node<'a> {
    Root(&'a Environment),
    Value(&'a Value),
    Owned(Value),
    Route(&'a RouteState),
    Requests(&'a Environment),
    Request(&'a GatewayRequest),
    Upstream(&'a UpstreamResponse),
    Response(&'a GatewayResponse),
}

fn missing(part: &str, path: &str) -> ReferenceError {
    ReferenceError::new(format!("Env does not contain '{part}' (from: {path})"))
}

impl<'a> Node<'a> {
    fn child(self, key: &str, path: &str) -> Result<Node<'a>, ReferenceError> {
        match self {
            Node::Root(env) => match key {
                "constants" => Ok(Node::Value(&env.constants)),
                "route" => Ok(Node::Route(&env.route)),
                "requests" => Ok(Node::Requests(env)),
                "response" => env
                    .response
                    .as_ref()
                    .map(Node::Response)
                    .ok_or_else(|| missing(key, path)),
                "after_hooks" => Ok(Node::Value(&env.after_hooks)),
                "error" => env
                    .error
                    .as_ref()
                    .map(|e| Node::Owned(Value::String(e.clone())))
                    .ok_or_else(|| missing(key, path)),
                _ => Err(missing(key, path)),
            },
            Node::Value(value) => match value.get(key) {
                Some(v) => Ok(Node::Value(v)),
                None => Err(missing(key, path)),
            },
            Node::Owned(value) => match value.get(key) {
                Some(v) => Ok(Node::Owned(v.clone())),
                None => Err(missing(key, path)),
            },
            Node::Route(route) => match key {
                "path" => Ok(Node::Owned(Value::String(route.path.clone()))),
                "method" => Ok(Node::Owned(Value::String(route.method.to_string()))),
                "plugins" => Ok(Node::Value(&route.plugins)),
                "headers" => Ok(Node::Value(&route.headers)),
                "dynamic" => Ok(Node::Value(&route.dynamic)),
                "query" => Ok(Node::Value(&route.query)),
                "text" => Ok(Node::Value(&route.text)),
                "json" => Ok(Node::Value(&route.json)),
                "data" => Ok(Node::Value(&route.data)),
                "extra" => Ok(Node::Value(&route.extra)),
                _ => Err(missing(key, path)),
            },
            Node::Requests(_) => Err(missing(key, path)),
            Node::Request(request) => match key {
                "url" => Ok(Node::Owned(Value::String(request.url.clone()))),
                "method" => Ok(Node::Owned(Value::String(request.method.to_string()))),
                "name" => match &request.name {
                    Some(name) => Ok(Node::Owned(Value::String(name.clone()))),
                    None => Err(missing(key, path)),
                },
                "headers" => Ok(Node::Value(&request.headers)),
                "text" => Ok(Node::Value(&request.text)),
                "json" => Ok(Node::Value(&request.json)),
                "data" => Ok(Node::Value(&request.data)),
                "builders" => Ok(Node::Value(&request.builders)),
                "processors" => Ok(Node::Value(&request.processors)),
                "response" => request
                    .response
                    .as_ref()
                    .map(Node::Upstream)
                    .ok_or_else(|| missing(key, path)),
                _ => Err(missing(key, path)),
            },
            Node::Upstream(response) => match key {
                "status" => Ok(Node::Owned(json!(response.status))),
                "headers" => Ok(Node::Value(&response.headers)),
                "text" => Ok(Node::Owned(Value::String(response.text.clone()))),
                "json" => Ok(Node::Value(&response.json)),
                "data" => Ok(Node::Value(&response.data)),
                _ => Err(missing(key, path)),
            },
            Node::Response(response) => match key {
                "status" => match response.status {
                    Some(status) => Ok(Node::Owned(json!(status))),
                    None => Err(missing(key, path)),
                },
                "headers" => Ok(Node::Value(&response.headers)),
                "text" => Ok(Node::Value(&response.text)),
                "json" => Ok(Node::Value(&response.json)),
                "data" => Ok(Node::Value(&response.data)),
                "generators" => Ok(Node::Value(&response.generators)),
                _ => Err(missing(key, path)),
            },
        }
    }

    fn subscript(self, subscript: &Subscript, path: &str) -> Result<Node<'a>, ReferenceError> {
        match self {
            Node::Requests(env) => match subscript {
                Subscript::Index(i) => env
                    .requests
                    .get(*i)
                    .map(Node::Request)
                    .ok_or_else(|| out_of_range("requests", *i, path)),
                Subscript::Key(name) => env
                    .request_index_by_name(name)
                    .map(|i| Node::Request(&env.requests[i]))
                    .ok_or_else(|| missing(name, path)),
                Subscript::Expr(_) => unreachable!("subscripts resolved before traversal"),
            },
            Node::Value(value) => subscript_value(value, subscript, path).map(Node::Value),
            Node::Owned(value) => {
                subscript_value(&value, subscript, path).map(|v| Node::Owned(v.clone()))
            }
            _ => Err(ReferenceError::new(format!(
                "subscript not applicable (from: {path})"
            ))),
        }
    }

    fn into_value(self) -> Value {
        match self {
            Node::Root(env) => json!({
                "constants": env.constants,
                "route": env.route,
                "requests": env.requests,
                "response": env.response,
            }),
            Node::Value(v) => v.clone(),
            Node::Owned(v) => v,
            Node::Route(route) => serde_json::to_value(route).unwrap_or(Value::Null),
            Node::Requests(env) => serde_json::to_value(&env.requests).unwrap_or(Value::Null),
            Node::Request(request) => serde_json::to_value(request).unwrap_or(Value::Null),
            Node::Upstream(response) => serde_json::to_value(response).unwrap_or(Value::Null),
            Node::Response(response) => serde_json::to_value(response).unwrap_or(Value::Null),
        }
    }
}

fn out_of_range(part: &str, index: usize, path: &str) -> ReferenceError {
    ReferenceError::new(format!(
        "Env '{part}[{index}]' list index out of range (from: {path})"
    ))
}

fn subscript_value<'a>(
    value: &'a Value,
    subscript: &Subscript,
    path: &str,
) -> Result<&'a Value, ReferenceError> {
    match (value, subscript) {
        (Value::Array(items), Subscript::Index(i)) => items
            .get(*i)
            .ok_or_else(|| out_of_range("sequence", *i, path)),
        (Value::Object(map), Subscript::Key(key)) => {
            map.get(key).ok_or_else(|| missing(key, path))
        }
        (Value::Object(_), Subscript::Index(i)) => Err(ReferenceError::new(format!(
            "integer subscript [{i}] applied to a map (from: {path})"
        ))),
        (Value::Array(_), Subscript::Key(key)) => Err(ReferenceError::new(format!(
            "string subscript [\"{key}\"] applied to a sequence (from: {path})"
        ))),
        _ => Err(ReferenceError::new(format!(
            "value is not subscriptable (from: {path})"
        ))),
    }
}

/// Mutable traversal cursor for `set`/`pop`.
enum NodeMut<'a> {
    Root(&'a mut Environment),
    Value(&'a mut Value),
    Route(&'a mut RouteState),
    Requests(&'a mut Vec<GatewayRequest>),
    Request(&'a mut GatewayRequest),
    Upstream(&'a mut UpstreamResponse),
    Response(&'a mut GatewayResponse),
}

impl<'a> NodeMut<'a> {
    /// Descend one intermediate key. On `set` traversal (`create` true),
    /// missing map keys are auto-created as empty objects; records and
    /// sequences are never auto-created.
    fn child(self, key: &str, create: bool, path: &str) -> Result<NodeMut<'a>, ReferenceError> {
        match self {
            NodeMut::Root(env) => match key {
                "constants" => Ok(NodeMut::Value(&mut env.constants)),
                "route" => Ok(NodeMut::Route(&mut env.route)),
                "requests" => Ok(NodeMut::Requests(&mut env.requests)),
                "response" => env
                    .response
                    .as_mut()
                    .map(NodeMut::Response)
                    .ok_or_else(|| missing(key, path)),
                "after_hooks" => Ok(NodeMut::Value(&mut env.after_hooks)),
                _ => Err(missing(key, path)),
            },
            NodeMut::Value(value) => match value {
                Value::Object(map) => {
                    if !map.contains_key(key) {
                        if create {
                            map.insert(key.to_string(), Value::Object(Default::default()));
                        } else {
                            return Err(missing(key, path));
                        }
                    }
                    Ok(NodeMut::Value(map.get_mut(key).expect("key just ensured")))
                }
                _ => Err(missing(key, path)),
            },
            NodeMut::Route(route) => match key {
                "plugins" => Ok(NodeMut::Value(&mut route.plugins)),
                "headers" => Ok(NodeMut::Value(&mut route.headers)),
                "dynamic" => Ok(NodeMut::Value(&mut route.dynamic)),
                "query" => Ok(NodeMut::Value(&mut route.query)),
                "text" => Ok(NodeMut::Value(&mut route.text)),
                "json" => Ok(NodeMut::Value(&mut route.json)),
                "data" => Ok(NodeMut::Value(&mut route.data)),
                "extra" => Ok(NodeMut::Value(&mut route.extra)),
                _ => Err(missing(key, path)),
            },
            NodeMut::Requests(_) => Err(missing(key, path)),
            NodeMut::Request(request) => match key {
                "headers" => Ok(NodeMut::Value(&mut request.headers)),
                "text" => Ok(NodeMut::Value(&mut request.text)),
                "json" => Ok(NodeMut::Value(&mut request.json)),
                "data" => Ok(NodeMut::Value(&mut request.data)),
                "builders" => Ok(NodeMut::Value(&mut request.builders)),
                "processors" => Ok(NodeMut::Value(&mut request.processors)),
                "response" => request
                    .response
                    .as_mut()
                    .map(NodeMut::Upstream)
                    .ok_or_else(|| missing(key, path)),
                _ => Err(missing(key, path)),
            },
            NodeMut::Upstream(response) => match key {
                "headers" => Ok(NodeMut::Value(&mut response.headers)),
                "json" => Ok(NodeMut::Value(&mut response.json)),
                "data" => Ok(NodeMut::Value(&mut response.data)),
                _ => Err(missing(key, path)),
            },
            NodeMut::Response(response) => match key {
                "headers" => Ok(NodeMut::Value(&mut response.headers)),
                "text" => Ok(NodeMut::Value(&mut response.text)),
                "json" => Ok(NodeMut::Value(&mut response.json)),
                "data" => Ok(NodeMut::Value(&mut response.data)),
                "generators" => Ok(NodeMut::Value(&mut response.generators)),
                _ => Err(missing(key, path)),
            },
        }
    }

    fn subscript(self, subscript: &Subscript, path: &str) -> Result<NodeMut<'a>, ReferenceError> {
        match self {
            NodeMut::Requests(requests) => match subscript {
                Subscript::Index(i) => requests
                    .get_mut(*i)
                    .map(NodeMut::Request)
                    .ok_or_else(|| out_of_range("requests", *i, path)),
                Subscript::Key(name) => requests
                    .iter_mut()
                    .find(|r| r.name.as_deref() == Some(name.as_str()))
                    .map(NodeMut::Request)
                    .ok_or_else(|| missing(name, path)),
                Subscript::Expr(_) => unreachable!("subscripts resolved before traversal"),
            },
            NodeMut::Value(value) => match (&mut *value, subscript) {
                (Value::Array(items), Subscript::Index(i)) => items
                    .get_mut(*i)
                    .map(NodeMut::Value)
                    .ok_or_else(|| out_of_range("sequence", *i, path)),
                (Value::Object(map), Subscript::Key(key)) => map
                    .get_mut(key)
                    .map(NodeMut::Value)
                    .ok_or_else(|| missing(key, path)),
                (Value::Object(_), Subscript::Index(i)) => Err(ReferenceError::new(format!(
                    "integer subscript [{i}] applied to a map (from: {path})"
                ))),
                (Value::Array(_), Subscript::Key(key)) => Err(ReferenceError::new(format!(
                    "string subscript [\"{key}\"] applied to a sequence (from: {path})"
                ))),
                _ => Err(ReferenceError::new(format!(
                    "value is not subscriptable (from: {path})"
                ))),
            },
            _ => Err(ReferenceError::new(format!(
                "subscript not applicable (from: {path})"
            ))),
        }
    }

    /// Assign `value` at the final segment.
    fn assign(self, last: &Segment, value: Value, path: &str) -> Result<(), ReferenceError> {
        match &last.subscript {
            None => self.assign_key(&last.key, value, path),
            Some(subscript) => {
                // Final segment like `b[2]`: descend into `b` (which must
                // already exist), then assign at the subscript.
                let container = self.child(&last.key, false, path)?;
                container.assign_subscript(subscript, value, path)
            }
        }
    }

    fn assign_key(self, key: &str, value: Value, path: &str) -> Result<(), ReferenceError> {
        match self {
            NodeMut::Root(env) => match key {
                "constants" => {
                    env.constants = value;
                    Ok(())
                }
                "error" => match value {
                    Value::String(message) => {
                        env.record_error(message);
                        Ok(())
                    }
                    other => Err(ReferenceError::new(format!(
                        "'error' must be a string, got {other} (from: {path})"
                    ))),
                },
                _ => Err(ReferenceError::new(format!(
                    "cannot assign to '{key}' (from: {path})"
                ))),
            },
            NodeMut::Value(node) => match node {
                Value::Object(map) => {
                    map.insert(key.to_string(), value);
                    Ok(())
                }
                // A set into a missing map facet (e.g. a null `route.query`)
                // replaces the null with a fresh object.
                Value::Null => {
                    let mut map = serde_json::Map::new();
                    map.insert(key.to_string(), value);
                    *node = Value::Object(map);
                    Ok(())
                }
                _ => Err(missing(key, path)),
            },
            NodeMut::Route(route) => route_assign(route, key, value, path),
            NodeMut::Requests(_) => Err(ReferenceError::new(format!(
                "cannot assign to the request sequence (from: {path})"
            ))),
            NodeMut::Request(request) => request_assign(request, key, value, path),
            NodeMut::Upstream(response) => upstream_assign(response, key, value, path),
            NodeMut::Response(response) => response_assign(response, key, value, path),
        }
    }

    fn assign_subscript(
        self,
        subscript: &Subscript,
        value: Value,
        path: &str,
    ) -> Result<(), ReferenceError> {
        match self {
            NodeMut::Value(node) => match (&mut *node, subscript) {
                (Value::Array(items), Subscript::Index(i)) => {
                    if *i >= items.len() {
                        return Err(out_of_range("sequence", *i, path));
                    }
                    items[*i] = value;
                    Ok(())
                }
                (Value::Object(map), Subscript::Key(key)) => {
                    map.insert(key.clone(), value);
                    Ok(())
                }
                _ => Err(ReferenceError::new(format!(
                    "subscript assignment not applicable (from: {path})"
                ))),
            },
            _ => Err(ReferenceError::new(format!(
                "subscript assignment not applicable (from: {path})"
            ))),
        }
    }

    /// Remove at the final segment, returning the removed value.
    fn remove(self, last: &Segment, path: &str) -> Result<Value, ReferenceError> {
        match &last.subscript {
            None => self.remove_key(&last.key, path),
            Some(subscript) => {
                let container = self.child(&last.key, false, path)?;
                container.remove_subscript(subscript, path)
            }
        }
    }

    fn remove_key(self, key: &str, path: &str) -> Result<Value, ReferenceError> {
        match self {
            NodeMut::Root(env) => match key {
                "error" => env
                    .error
                    .take()
                    .map(Value::String)
                    .ok_or_else(|| missing(key, path)),
                _ => Err(ReferenceError::new(format!(
                    "cannot remove '{key}' (from: {path})"
                ))),
            },
            NodeMut::Value(node) => match node {
                Value::Object(map) => map.remove(key).ok_or_else(|| missing(key, path)),
                _ => Err(missing(key, path)),
            },
            NodeMut::Route(route) => {
                let slot = match key {
                    "query" => &mut route.query,
                    "text" => &mut route.text,
                    "json" => &mut route.json,
                    "data" => &mut route.data,
                    "headers" => &mut route.headers,
                    "dynamic" => &mut route.dynamic,
                    "extra" => &mut route.extra,
                    _ => return Err(missing(key, path)),
                };
                Ok(std::mem::replace(slot, Value::Null))
            }
            NodeMut::Request(request) => {
                let slot = match key {
                    "headers" => &mut request.headers,
                    "text" => &mut request.text,
                    "json" => &mut request.json,
                    "data" => &mut request.data,
                    _ => return Err(missing(key, path)),
                };
                Ok(std::mem::replace(slot, Value::Null))
            }
            NodeMut::Upstream(response) => {
                let slot = match key {
                    "headers" => &mut response.headers,
                    "json" => &mut response.json,
                    "data" => &mut response.data,
                    _ => return Err(missing(key, path)),
                };
                Ok(std::mem::replace(slot, Value::Null))
            }
            NodeMut::Response(response) => {
                let slot = match key {
                    "headers" => &mut response.headers,
                    "text" => &mut response.text,
                    "json" => &mut response.json,
                    "data" => &mut response.data,
                    _ => return Err(missing(key, path)),
                };
                Ok(std::mem::replace(slot, Value::Null))
            }
            NodeMut::Requests(_) => Err(missing(key, path)),
        }
    }

    fn remove_subscript(self, subscript: &Subscript, path: &str) -> Result<Value, ReferenceError> {
        match self {
            NodeMut::Value(node) => match (&mut *node, subscript) {
                (Value::Array(items), Subscript::Index(i)) => {
                    if *i >= items.len() {
                        return Err(out_of_range("sequence", *i, path));
                    }
                    Ok(items.remove(*i))
                }
                (Value::Object(map), Subscript::Key(key)) => {
                    map.remove(key).ok_or_else(|| missing(key, path))
                }
                _ => Err(ReferenceError::new(format!(
                    "subscript removal not applicable (from: {path})"
                ))),
            },
            _ => Err(ReferenceError::new(format!(
                "subscript removal not applicable (from: {path})"
            ))),
        }
    }
}

fn route_assign(
    route: &mut RouteState,
    key: &str,
    value: Value,
    path: &str,
) -> Result<(), ReferenceError> {
    match key {
        "path" => match value {
            Value::String(s) => {
                route.path = s;
                Ok(())
            }
            other => Err(type_mismatch(key, "string", &other, path)),
        },
        "method" => assign_method(&mut route.method, value, path),
        "plugins" => {
            route.plugins = value;
            Ok(())
        }
        "headers" => {
            route.headers = value;
            Ok(())
        }
        "dynamic" => {
            route.dynamic = value;
            Ok(())
        }
        "query" => {
            route.query = value;
            Ok(())
        }
        "text" => {
            route.text = value;
            Ok(())
        }
        "json" => {
            route.json = value;
            Ok(())
        }
        "data" => {
            route.data = value;
            Ok(())
        }
        "extra" => {
            route.extra = value;
            Ok(())
        }
        _ => Err(missing(key, path)),
    }
}

fn request_assign(
    request: &mut GatewayRequest,
    key: &str,
    value: Value,
    path: &str,
) -> Result<(), ReferenceError> {
    match key {
        "url" => match value {
            Value::String(s) => {
                request.url = s;
                Ok(())
            }
            other => Err(type_mismatch(key, "string", &other, path)),
        },
        "method" => assign_method(&mut request.method, value, path),
        "name" => match value {
            Value::String(s) => {
                request.name = Some(s);
                Ok(())
            }
            Value::Null => {
                request.name = None;
                Ok(())
            }
            other => Err(type_mismatch(key, "string", &other, path)),
        },
        "headers" => {
            request.headers = value;
            Ok(())
        }
        "text" => {
            request.text = value;
            Ok(())
        }
        "json" => {
            request.json = value;
            Ok(())
        }
        "data" => {
            request.data = value;
            Ok(())
        }
        "builders" => {
            request.builders = value;
            Ok(())
        }
        "processors" => {
            request.processors = value;
            Ok(())
        }
        _ => Err(missing(key, path)),
    }
}

fn upstream_assign(
    response: &mut UpstreamResponse,
    key: &str,
    value: Value,
    path: &str,
) -> Result<(), ReferenceError> {
    match key {
        "status" => match value.as_u64() {
            Some(status) if status <= u16::MAX as u64 => {
                response.status = status as u16;
                Ok(())
            }
            _ => Err(type_mismatch(key, "status code", &value, path)),
        },
        "text" => match value {
            Value::String(s) => {
                response.text = s;
                Ok(())
            }
            other => Err(type_mismatch(key, "string", &other, path)),
        },
        "headers" => {
            response.headers = value;
            Ok(())
        }
        "json" => {
            response.json = value;
            Ok(())
        }
        "data" => {
            response.data = value;
            Ok(())
        }
        _ => Err(missing(key, path)),
    }
}

fn response_assign(
    response: &mut GatewayResponse,
    key: &str,
    value: Value,
    path: &str,
) -> Result<(), ReferenceError> {
    match key {
        "status" => match value.as_u64() {
            Some(status) if status <= u16::MAX as u64 => {
                response.status = Some(status as u16);
                Ok(())
            }
            _ => Err(type_mismatch(key, "status code", &value, path)),
        },
        "headers" => {
            response.headers = value;
            Ok(())
        }
        "text" => {
            response.text = value;
            Ok(())
        }
        "json" => {
            response.json = value;
            Ok(())
        }
        "data" => {
            response.data = value;
            Ok(())
        }
        "generators" => {
            response.generators = value;
            Ok(())
        }
        _ => Err(missing(key, path)),
    }
}

fn assign_method(
    slot: &mut HttpMethod,
    value: Value,
    path: &str,
) -> Result<(), ReferenceError> {
    match &value {
        Value::String(s) => match HttpMethod::parse(s) {
            Some(method) => {
                *slot = method;
                Ok(())
            }
            None => Err(ReferenceError::new(format!(
                "'{s}' is not a supported HTTP method (from: {path})"
            ))),
        },
        other => Err(type_mismatch("method", "string", other, path)),
    }
}

fn type_mismatch(key: &str, expected: &str, got: &Value, path: &str) -> ReferenceError {
    ReferenceError::new(format!(
        "field '{key}' requires a {expected}, got {got} (from: {path})"
    ))
}
