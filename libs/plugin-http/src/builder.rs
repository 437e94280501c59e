use crate::chain::{ChainEntry, Plugin, PluginChain, RequestMatcher};
use crate::client::{HttpClient, PluginClient, SendPlugin};
use crate::config::PluginClientConfig;
use std::sync::Arc;

/// Builder for a [`PluginClient`].
///
/// Plugins run in the order they are added; the transport given to
/// [`PluginClientBuilder::build`] becomes the terminal entry.
pub struct PluginClientBuilder {
    entries: Vec<ChainEntry>,
    config: PluginClientConfig,
}

impl PluginClientBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(PluginClientConfig::default())
    }

    #[must_use]
    pub fn with_config(config: PluginClientConfig) -> Self {
        Self {
            entries: Vec::new(),
            config,
        }
    }

    /// Append a plugin.
    #[must_use]
    pub fn plugin(mut self, plugin: impl Plugin) -> Self {
        self.entries.push(ChainEntry::new(plugin));
        self
    }

    /// Append a shared plugin instance.
    #[must_use]
    pub fn shared_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.entries.push(ChainEntry::from_arc(plugin));
        self
    }

    /// Append a plugin that only runs for requests accepted by every matcher.
    #[must_use]
    pub fn conditional(mut self, matchers: Vec<Arc<dyn RequestMatcher>>, plugin: impl Plugin) -> Self {
        self.entries.push(ChainEntry::conditional(matchers, plugin));
        self
    }

    /// Restart ceiling per dispatch (default: 10)
    #[must_use]
    pub fn max_restarts(mut self, max_restarts: usize) -> Self {
        self.config.max_restarts = max_restarts;
        self
    }

    /// Finish the chain with `transport` as terminal client.
    #[must_use]
    pub fn build(self, transport: impl HttpClient + 'static) -> PluginClient {
        self.build_shared(Arc::new(transport))
    }

    #[must_use]
    pub fn build_shared(mut self, transport: Arc<dyn HttpClient>) -> PluginClient {
        self.entries.push(ChainEntry::new(SendPlugin::new(transport)));
        tracing::debug!(
            plugins = self.entries.len() - 1,
            max_restarts = self.config.max_restarts,
            "built plugin client"
        );
        PluginClient::from_chain(PluginChain::new(self.entries, self.config.max_restarts))
    }
}

impl Default for PluginClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
