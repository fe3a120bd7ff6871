//! # Declarative API Gateway
//!
//! An API gateway whose routes are data, not code. Each route is a JSON
//! definition describing the upstream requests to make and the response to
//! assemble; a generic engine interprets those definitions at request time
//! through a path-addressable environment, a declarative operations pipeline
//! and a small set of plugins.
//!
//! The crate splits into:
//!
//! - [`core`]: the error taxonomy, process settings and definition loading.
//! - [`engine`]: the environment, path grammar, operations, their registry
//!   and the per-route controller.
//! - [`plugins`]: cross-cutting route behavior (CORS, ticket validation).
//! - [`hooks`]: post-response side effects.
//! - [`gateway`]: the HTTP server and the outer call boundary.
//! - [`observability`]: logging setup.

pub mod core;
pub mod engine;
pub mod gateway;
pub mod hooks;
pub mod observability;
pub mod plugins;

pub use crate::core::config::Settings;
pub use crate::core::error::{GatewayResult, ReferenceError, ServiceError};
pub use crate::engine::environment::Environment;
