//! Shared server context.
//!
//! Built once at startup and handed to the hub, which passes it on to every
//! topic actor. There is no other process-wide state.

use crate::actors::metrics::ActorMetrics;
use crate::config::Config;
use crate::plugins::{NoopPlugins, PluginHooks};
use crate::push::{NoopPush, PushDispatcher};
use crate::session::SessionStore;
use crate::store::Store;
use std::sync::Arc;

/// Collaborators shared by all actors.
#[derive(Clone)]
pub struct ServerContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub push: Arc<dyn PushDispatcher>,
    pub plugins: Arc<dyn PluginHooks>,
    pub sessions: Arc<SessionStore>,
    pub metrics: Arc<ActorMetrics>,
}

impl ServerContext {
    /// Context with no-op push and plugins and a fresh session registry.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        let sessions = Arc::new(SessionStore::from_config(&config));
        Self {
            config: Arc::new(config),
            store,
            push: Arc::new(NoopPush),
            plugins: Arc::new(NoopPlugins),
            sessions,
            metrics: ActorMetrics::new(),
        }
    }

    #[must_use]
    pub fn with_push(mut self, push: Arc<dyn PushDispatcher>) -> Self {
        self.push = push;
        self
    }

    #[must_use]
    pub fn with_plugins(mut self, plugins: Arc<dyn PluginHooks>) -> Self {
        self.plugins = plugins;
        self
    }
}
