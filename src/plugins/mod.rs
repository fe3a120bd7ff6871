//! # Plugin System
//!
//! Plugins wrap a route's handling routine. Each plugin may read or mutate
//! the environment before the pipeline runs and inspect it again after the
//! pipeline returns. The chain is applied in declared order: `before` phases
//! run first-to-last, `after` phases last-to-first, so the first declared
//! plugin is outermost.
//!
//! Environment construction and the exception-to-response boundary live in
//! the server layer, outside every declared plugin.

pub mod cors;
pub mod ticket_validation;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::core::config::Settings;
use crate::core::error::{GatewayResult, ServiceError};
use crate::engine::environment::Environment;
use crate::plugins::cors::CorsPlugin;
use crate::plugins::ticket_validation::{AuthorityCache, TicketValidationPlugin};

/// Facts about the raw inbound call that are not part of the environment's
/// route facets.
#[derive(Debug, Clone)]
pub struct InboundCall {
    /// Absolute request URL as seen by the server, e.g.
    /// `http://gw.local/items/42`.
    pub url: String,
}

/// A unit of cross-cutting route behavior resolved from a plugin descriptor.
#[async_trait]
pub trait GatewayPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Runs before the declarative pipeline. Returning an error aborts the
    /// call; the error is mapped to a response by the outer boundary.
    async fn before(
        &self,
        _environment: &mut Environment,
        _inbound: &InboundCall,
    ) -> GatewayResult<()> {
        Ok(())
    }

    /// Runs after the pipeline returns, with the response attached.
    async fn after(&self, _environment: &mut Environment) -> GatewayResult<()> {
        Ok(())
    }
}

/// Ordered plugin chain for one route.
#[derive(Clone, Default)]
pub struct PluginChain {
    plugins: Vec<Arc<dyn GatewayPlugin>>,
}

impl PluginChain {
    pub fn new(plugins: Vec<Arc<dyn GatewayPlugin>>) -> Self {
        Self { plugins }
    }

    pub async fn before(
        &self,
        environment: &mut Environment,
        inbound: &InboundCall,
    ) -> GatewayResult<()> {
        for plugin in &self.plugins {
            plugin.before(environment, inbound).await?;
        }
        Ok(())
    }

    pub async fn after(&self, environment: &mut Environment) -> GatewayResult<()> {
        for plugin in self.plugins.iter().rev() {
            plugin.after(environment).await?;
        }
        Ok(())
    }
}

type PluginCtor =
    Box<dyn Fn(&Map<String, Value>) -> GatewayResult<Arc<dyn GatewayPlugin>> + Send + Sync>;

/// Startup-time registry of plugin implementation names. Shared collaborators
/// (HTTP client, authority cache, settings) are captured at registration, so
/// resolving a descriptor never does I/O.
pub struct PluginFactory {
    entries: HashMap<String, PluginCtor>,
}

impl PluginFactory {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register the built-in plugins against the process-wide collaborators.
    pub fn with_builtins(
        settings: &Settings,
        http: reqwest::Client,
        authority: Arc<AuthorityCache>,
    ) -> Self {
        let mut factory = Self::new();

        let cors_pattern = settings.cors_origin_pattern.clone();
        factory.register("cors", move |definition| {
            CorsPlugin::from_definition(definition, cors_pattern.as_deref())
                .map(|p| Arc::new(p) as Arc<dyn GatewayPlugin>)
        });

        let ticket_settings = settings.ticket_validation.clone();
        factory.register("ticket_validation", move |definition| {
            let settings = ticket_settings.clone().ok_or_else(|| {
                ServiceError::configuration(
                    "ticket_validation plugin declared but GATEWAY_TICKET_* settings are missing",
                )
            })?;
            Ok(Arc::new(TicketValidationPlugin::new(
                definition.clone(),
                settings,
                http.clone(),
                authority.clone(),
            )) as Arc<dyn GatewayPlugin>)
        });

        factory
    }

    pub fn register<F>(&mut self, name: &str, ctor: F)
    where
        F: Fn(&Map<String, Value>) -> GatewayResult<Arc<dyn GatewayPlugin>> + Send + Sync + 'static,
    {
        self.entries.insert(name.to_string(), Box::new(ctor));
    }

    /// Instantiate the plugin a descriptor names. Unknown names are fatal
    /// configuration errors.
    pub fn resolve(&self, descriptor: &Value) -> GatewayResult<Arc<dyn GatewayPlugin>> {
        let definition = descriptor.as_object().ok_or_else(|| {
            ServiceError::configuration(format!("plugin definition must be an object: {descriptor}"))
        })?;
        let name = definition
            .get("plugin")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ServiceError::configuration(format!(
                    "plugin definition does not include 'plugin' key: {descriptor}"
                ))
            })?;
        let ctor = self.entries.get(name).ok_or_else(|| {
            ServiceError::configuration(format!("unknown plugin implementation '{name}'"))
        })?;
        ctor(definition)
    }

    /// Resolve every descriptor of a route into a chain, preserving order.
    pub fn resolve_chain(&self, descriptors: &[Value]) -> GatewayResult<PluginChain> {
        let mut plugins = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            plugins.push(self.resolve(descriptor)?);
        }
        Ok(PluginChain::new(plugins))
    }
}

impl Default for PluginFactory {
    fn default() -> Self {
        Self::new()
    }
}
