use crate::config::{CompressionConfig, ConfigError};
use crate::registry::ProviderRegistry;
use crate::service::CompressionService;
use std::sync::Arc;
use tower::Layer;

/// Configuration and providers shared by every response, immutable after the
/// layer is built.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) config: CompressionConfig,
    pub(crate) registry: ProviderRegistry,
}

/// A Tower layer that negotiates and applies response body compression.
///
/// The layer wraps services so that each response is checked for eligibility,
/// matched against the client's `Accept-Encoding` preferences, and streamed
/// through the chosen provider's encoder with headers adjusted accordingly.
#[derive(Debug, Clone)]
pub struct CompressionLayer {
    shared: Arc<Shared>,
}

impl CompressionLayer {
    /// Creates a layer with the default policy and the default provider set
    /// (gzip only).
    #[cfg(feature = "gzip")]
    pub fn new() -> Self {
        // Defaults are known-valid: the allow-list is non-empty and the
        // registry holds the gzip provider.
        Self {
            shared: Arc::new(Shared {
                config: CompressionConfig::default(),
                registry: ProviderRegistry::default(),
            }),
        }
    }

    /// Creates a layer from an explicit configuration and provider registry.
    ///
    /// Fails when the configuration could never compress anything: an empty
    /// MIME allow-list or an empty registry is a deployment mistake, reported
    /// here rather than silently ignored per response.
    pub fn with_config(
        config: CompressionConfig,
        registry: ProviderRegistry,
    ) -> Result<Self, ConfigError> {
        config.validate(&registry)?;
        Ok(Self {
            shared: Arc::new(Shared { config, registry }),
        })
    }
}

#[cfg(feature = "gzip")]
impl Default for CompressionLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService::new(inner, Arc::clone(&self.shared))
    }
}
