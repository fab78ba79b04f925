//! The `EventBus` facade.
//!
//! Owns the name → [`ConnectionManager`] registry and the bus-wide settings.
//! Application code publishes domain events through it, commits request
//! outboxes and subscribes handlers.
//!
//! # Example
//!
//! ```no_run
//! use courier_core::{DomainEvent, RequestContext};
//! use courier_core::transport::BrokerConnector;
//! use courier_runtime::bus::{EventBus, PublishOptions};
//! use courier_runtime::config::ServerConfig;
//! use std::sync::Arc;
//!
//! # async fn example(connector: Arc<dyn BrokerConnector>) -> Result<(), Box<dyn std::error::Error>> {
//! let bus = EventBus::builder()
//!     .connector("amqp", connector)
//!     .server("default", ServerConfig::new("amqp", "amqp://localhost:5672/%2f", "orders"))
//!     .build()?;
//! bus.start()?;
//!
//! let ctx = bus.new_context();
//! bus.publish(
//!     Some(&ctx),
//!     &DomainEvent::new("OrderCreated").with("order_id", 1),
//!     PublishOptions::default(),
//! )?;
//!
//! // The unit of work succeeded.
//! bus.commit(&ctx);
//! # Ok(())
//! # }
//! ```

use crate::config::{BusConfig, BusSettings, ConfigError, DEFAULT_SERVER, ServerConfig};
use crate::consumer::{Consumer, Subscription};
use crate::error::{ManagerError, PublishError};
use crate::health::HealthReport;
use crate::manager::ConnectionManager;
use courier_core::context::{OutboxMessage, OutboxSink, RequestContext};
use courier_core::envelope::Envelope;
use courier_core::environment::{Clock, SystemClock};
use courier_core::event::DomainEvent;
use courier_core::transport::BrokerConnector;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Connectors by identifier (the `server` field of a [`ServerConfig`]).
pub type Connectors = HashMap<String, Arc<dyn BrokerConnector>>;

/// Where and when a message is published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    /// Logical server name.
    pub server: String,
    /// Hold the message in the request outbox until commit.
    pub deferred: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            deferred: true,
        }
    }
}

impl PublishOptions {
    /// Publish to `server`, deferred.
    #[must_use]
    pub fn to(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            deferred: true,
        }
    }

    /// Publish to the default server without waiting for commit.
    #[must_use]
    pub fn immediate() -> Self {
        Self::default().deferred(false)
    }

    /// Set whether to wait for commit.
    #[must_use]
    pub const fn deferred(mut self, deferred: bool) -> Self {
        self.deferred = deferred;
        self
    }
}

/// Name → connection manager lookup shared by the bus.
#[derive(Clone, Default)]
pub struct ServerRegistry {
    servers: Arc<RwLock<BTreeMap<String, ConnectionManager>>>,
}

impl ServerRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `manager` under its name, replacing any previous one.
    pub fn insert(&self, manager: ConnectionManager) {
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(manager.name().to_string(), manager);
    }

    /// Look up a manager by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownServer`] if no manager has that name.
    pub fn lookup(&self, name: &str) -> Result<ConnectionManager, ConfigError> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownServer(name.to_string()))
    }

    /// Every registered manager, ordered by name.
    #[must_use]
    pub fn managers(&self) -> Vec<ConnectionManager> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Registered names, ordered.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

impl fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.names())
            .finish()
    }
}

/// Builder for [`EventBus`].
#[derive(Default)]
pub struct EventBusBuilder {
    connectors: Connectors,
    servers: Vec<(String, ServerConfig)>,
    settings: BusSettings,
    clock: Option<Arc<dyn Clock>>,
}

impl EventBusBuilder {
    /// Register a connector under `id`.
    #[must_use]
    pub fn connector(mut self, id: impl Into<String>, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connectors.insert(id.into(), connector);
        self
    }

    /// Add a server.
    #[must_use]
    pub fn server(mut self, name: impl Into<String>, config: ServerConfig) -> Self {
        self.servers.push((name.into(), config));
        self
    }

    /// Bus-wide settings.
    #[must_use]
    pub fn settings(mut self, settings: BusSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Clock used to timestamp published messages.
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Create the managers and the bus.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownConnector`] if a server names an
    /// unregistered connector, or any server validation error.
    pub fn build(self) -> Result<EventBus, ConfigError> {
        let registry = ServerRegistry::new();
        for (name, config) in self.servers {
            let connector = self
                .connectors
                .get(&config.server)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownConnector(config.server.clone()))?;
            registry.insert(ConnectionManager::new(name, &config, connector)?);
        }

        Ok(EventBus {
            registry,
            settings: self.settings,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
        })
    }
}

/// Publish/subscribe facade over a set of broker servers.
#[derive(Clone)]
pub struct EventBus {
    registry: ServerRegistry,
    settings: BusSettings,
    clock: Arc<dyn Clock>,
}

impl EventBus {
    /// Start building a bus.
    #[must_use]
    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    /// Build a bus from configuration.
    ///
    /// # Errors
    ///
    /// Returns any validation error, or [`ConfigError::UnknownConnector`].
    pub fn from_config(config: &BusConfig, connectors: &Connectors) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut builder = Self::builder().settings(config.settings()?);
        for (id, connector) in connectors {
            builder = builder.connector(id.clone(), Arc::clone(connector));
        }
        for (name, server) in &config.servers {
            builder = builder.server(name.clone(), server.clone());
        }
        builder.build()
    }

    /// The server registry.
    #[must_use]
    pub const fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// Bus-wide settings.
    #[must_use]
    pub const fn settings(&self) -> &BusSettings {
        &self.settings
    }

    /// Look up a server by name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownServer`] if no server has that name.
    pub fn lookup_server(&self, name: &str) -> Result<ConnectionManager, ConfigError> {
        self.registry.lookup(name)
    }

    /// Start every server.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::AlreadyStarted`] for the first server that was
    /// already started.
    pub fn start(&self) -> Result<(), ManagerError> {
        for manager in self.registry.managers() {
            manager.start()?;
        }
        Ok(())
    }

    /// Shut every server down.
    pub async fn shutdown(&self) {
        for manager in self.registry.managers() {
            manager.shutdown().await;
        }
    }

    /// Subscribe a handler on `server`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownServer`] if no server has that name.
    pub fn subscribe(
        &self,
        server: &str,
        subscription: Subscription,
    ) -> Result<Arc<Consumer>, ConfigError> {
        let manager = self.lookup_server(server)?;
        Ok(manager.subscribe(subscription, &self.settings))
    }

    /// A fresh context for an inbound unit of work.
    #[must_use]
    pub fn new_context(&self) -> RequestContext {
        RequestContext::new()
    }

    /// Publish a domain event under its event name.
    ///
    /// With `options.deferred` and a context, the message waits in the
    /// context's outbox until [`commit`](Self::commit); otherwise it goes
    /// straight to the server's publisher. Without a context a fresh trace id
    /// is generated.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Config`] for an unknown server or
    /// [`PublishError::Envelope`] if the event cannot be serialized.
    pub fn publish(
        &self,
        ctx: Option<&RequestContext>,
        event: &DomainEvent,
        options: PublishOptions,
    ) -> Result<(), PublishError> {
        let manager = self.lookup_server(&options.server)?;
        let envelope = match ctx {
            Some(ctx) => Envelope::for_event(event, ctx, &self.settings.context_fields)?,
            None => Envelope::for_event(
                event,
                &RequestContext::new(),
                &self.settings.context_fields,
            )?,
        };
        self.dispatch(ctx, &manager, event.event_name(), &envelope, options.deferred)
    }

    /// Publish an arbitrary serializable payload under `routing_key`.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish).
    pub fn publish_message<M: Serialize + ?Sized>(
        &self,
        ctx: Option<&RequestContext>,
        routing_key: &str,
        message: &M,
        options: PublishOptions,
    ) -> Result<(), PublishError> {
        let manager = self.lookup_server(&options.server)?;
        let occur_on = self.clock.now();
        let envelope = match ctx {
            Some(ctx) => Envelope::for_message(
                routing_key,
                message,
                occur_on,
                ctx,
                &self.settings.context_fields,
            )?,
            None => Envelope::for_message(
                routing_key,
                message,
                occur_on,
                &RequestContext::new(),
                &self.settings.context_fields,
            )?,
        };
        self.dispatch(ctx, &manager, routing_key, &envelope, options.deferred)
    }

    fn dispatch(
        &self,
        ctx: Option<&RequestContext>,
        manager: &ConnectionManager,
        routing_key: &str,
        envelope: &Envelope,
        deferred: bool,
    ) -> Result<(), PublishError> {
        let body = envelope.to_json()?;
        match ctx {
            Some(ctx) if deferred => {
                let sink: Arc<dyn OutboxSink> = Arc::new(manager.outbound().clone());
                ctx.enqueue(OutboxMessage::new(manager.name(), routing_key, body, sink));
                debug!(
                    server = %manager.name(),
                    routing_key = %routing_key,
                    trace_id = %ctx.trace_id(),
                    "Deferred message until commit"
                );
            },
            _ => manager.publish(routing_key, body),
        }
        Ok(())
    }

    /// Hand every message in `ctx`'s outbox to its publisher, in order.
    ///
    /// Returns the number of messages handed off.
    pub fn commit(&self, ctx: &RequestContext) -> usize {
        ctx.commit()
    }

    /// Aggregated health of every server.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        HealthReport::new(
            self.registry
                .managers()
                .iter()
                .map(ConnectionManager::health)
                .collect(),
        )
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
