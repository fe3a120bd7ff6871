//! # Entity Model
//!
//! Plain value objects for routes, upstream requests and the outbound
//! response. Each comes in two flavors: an immutable `*Definition` loaded
//! from a gateway definition file, and a derived per-call record that is a
//! deep copy of the definition plus the request-time facets the pipeline
//! fills in. No behavior lives here; the environment and the controller
//! interpret these records.
//!
//! Open-ended facets (headers, parsed bodies, operation descriptors) are kept
//! as `serde_json::Value` so the environment can address into them uniformly;
//! the records themselves stay fixed-shape.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// HTTP methods the gateway can declare for routes and upstream requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PUT")]
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Self::Get),
            "POST" => Some(Self::Post),
            "PUT" => Some(Self::Put),
            _ => None,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declarative route: path pattern, method and ordered plugin descriptors.
/// Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    /// Path pattern with named dynamic segments, e.g. `/items/{item_id}`.
    pub path: String,
    pub method: HttpMethod,
    #[serde(default)]
    pub plugins: Vec<Value>,
}

/// Per-call route record: the definition plus the captured facets of the
/// inbound HTTP request. Created once per inbound call.
#[derive(Debug, Clone, Serialize)]
pub struct RouteState {
    pub path: String,
    pub method: HttpMethod,
    pub plugins: Value,
    /// Inbound headers, verbatim, as a JSON object.
    pub headers: Value,
    /// Captured dynamic path segment values.
    pub dynamic: Value,
    /// Query parameters: single values as strings, repeated keys as lists.
    pub query: Value,
    /// Raw request body.
    pub text: Value,
    /// Parsed JSON body, when the request carried one.
    pub json: Value,
    /// Parsed form body, when the request carried one.
    pub data: Value,
    /// Open-ended map that plugins populate (e.g. verified identity).
    pub extra: Value,
}

impl RouteState {
    pub fn new(definition: &RouteDefinition) -> Self {
        Self {
            path: definition.path.clone(),
            method: definition.method,
            plugins: Value::Array(definition.plugins.clone()),
            headers: Value::Object(Default::default()),
            dynamic: Value::Object(Default::default()),
            query: Value::Null,
            text: Value::Null,
            json: Value::Null,
            data: Value::Null,
            extra: Value::Object(Default::default()),
        }
    }
}

/// Declarative upstream request. `includes` fragments are merged into the
/// definition at load time, before this struct is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestDefinition {
    pub url: String,
    pub method: HttpMethod,
    /// Optional name for addressing this request as `requests["name"]`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub headers: Value,
    #[serde(default)]
    pub text: Value,
    #[serde(default)]
    pub json: Value,
    #[serde(default)]
    pub data: Value,
    /// Pre-send operations, run with `self` bound to this request.
    #[serde(default)]
    pub builders: Value,
    /// Post-receive operations, run with `self` bound to this request.
    #[serde(default)]
    pub processors: Value,
}

/// Per-call copy of a [`RequestDefinition`], plus the upstream response once
/// the call has been made.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayRequest {
    pub url: String,
    pub method: HttpMethod,
    pub name: Option<String>,
    pub headers: Value,
    pub text: Value,
    pub json: Value,
    pub data: Value,
    pub builders: Value,
    pub processors: Value,
    pub response: Option<UpstreamResponse>,
}

impl GatewayRequest {
    pub fn materialize(definition: &RequestDefinition) -> Self {
        Self {
            url: definition.url.clone(),
            method: definition.method,
            name: definition.name.clone(),
            headers: definition.headers.clone(),
            text: definition.text.clone(),
            json: definition.json.clone(),
            data: definition.data.clone(),
            builders: definition.builders.clone(),
            processors: definition.processors.clone(),
            response: None,
        }
    }
}

/// The response received from one upstream call. At most one of `json`/`data`
/// is populated, chosen by the upstream Content-Type.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Value,
    pub text: String,
    pub json: Value,
    pub data: Value,
}

/// Declarative outbound response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseDefinition {
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: Value,
    #[serde(default)]
    pub text: Value,
    #[serde(default)]
    pub json: Value,
    #[serde(default)]
    pub data: Value,
    /// Final-response operations, run with `self` bound to the response.
    #[serde(default)]
    pub generators: Value,
}

/// Per-call copy of a [`ResponseDefinition`].
#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    pub status: Option<u16>,
    pub headers: Value,
    pub text: Value,
    pub json: Value,
    pub data: Value,
    pub generators: Value,
}

impl GatewayResponse {
    pub fn materialize(definition: &ResponseDefinition) -> Self {
        Self {
            status: definition.status,
            headers: definition.headers.clone(),
            text: definition.text.clone(),
            json: definition.json.clone(),
            data: definition.data.clone(),
            generators: definition.generators.clone(),
        }
    }
}
