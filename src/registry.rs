//! Registry of content-coding providers.
//!
//! A provider pairs an encoding token with a factory for the encoder that
//! transforms body bytes. The registry is populated at startup, immutable
//! afterwards, and shared across responses; its insertion order is the
//! preference order used to break ties during negotiation.

use compression_codecs::EncodeV2;
use std::fmt;
use std::sync::Arc;

#[cfg(feature = "brotli")]
use compression_codecs::brotli::{BrotliEncoder, params::EncoderParams as BrotliParams};
#[cfg(feature = "deflate")]
use compression_codecs::deflate::DeflateEncoder;
#[cfg(feature = "gzip")]
use compression_codecs::gzip::GzipEncoder;
#[cfg(feature = "zstd")]
use compression_codecs::zstd::ZstdEncoder;
#[cfg(any(feature = "gzip", feature = "deflate"))]
use compression_core::Level;

type EncoderFactory = Arc<dyn Fn() -> Box<dyn EncodeV2 + Send> + Send + Sync>;

/// A content-coding provider: an encoding token plus an encoder factory.
#[derive(Clone)]
pub struct Provider {
    token: String,
    factory: EncoderFactory,
}

impl Provider {
    /// Creates a provider for a custom coding.
    ///
    /// The token is the `Content-Encoding` value the provider produces; the
    /// factory is invoked once per compressed response.
    pub fn new<F>(token: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn EncodeV2 + Send> + Send + Sync + 'static,
    {
        Self {
            token: token.into().to_ascii_lowercase(),
            factory: Arc::new(factory),
        }
    }

    /// The gzip provider.
    #[cfg(feature = "gzip")]
    pub fn gzip() -> Self {
        Self::new("gzip", || Box::new(GzipEncoder::new(Level::Default.into())))
    }

    /// The deflate provider.
    #[cfg(feature = "deflate")]
    pub fn deflate() -> Self {
        Self::new("deflate", || {
            Box::new(DeflateEncoder::new(Level::Default.into()))
        })
    }

    /// The brotli provider.
    #[cfg(feature = "brotli")]
    pub fn brotli() -> Self {
        Self::new("br", || Box::new(BrotliEncoder::new(BrotliParams::default())))
    }

    /// The zstd provider.
    #[cfg(feature = "zstd")]
    pub fn zstd() -> Self {
        Self::new("zstd", || Box::new(ZstdEncoder::new(3))) // level 3 is a good default
    }

    /// The encoding token this provider produces.
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Ordered collection of providers, keyed by encoding token.
///
/// Re-registering a token replaces the factory but keeps the original
/// position, so preference order is stable.
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: Vec<Provider>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    pub fn empty() -> Self {
        Self {
            providers: Vec::new(),
        }
    }

    /// Adds a provider, replacing any existing provider for the same token
    /// in place.
    pub fn register(mut self, provider: Provider) -> Self {
        match self
            .providers
            .iter_mut()
            .find(|existing| existing.token == provider.token)
        {
            Some(existing) => *existing = provider,
            None => self.providers.push(provider),
        }
        self
    }

    /// The registered tokens, in preference order.
    pub fn tokens(&self) -> impl Iterator<Item = &str> {
        self.providers.iter().map(|p| p.token.as_str())
    }

    /// Whether the registry has no providers.
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Whether a provider for `token` is registered.
    pub(crate) fn supports(&self, token: &str) -> bool {
        self.providers
            .iter()
            .any(|p| p.token.eq_ignore_ascii_case(token))
    }

    /// Builds a fresh encoder for `token`, if a provider is registered.
    pub(crate) fn encoder(&self, token: &str) -> Option<Box<dyn EncodeV2 + Send>> {
        self.providers
            .iter()
            .find(|p| p.token.eq_ignore_ascii_case(token))
            .map(|p| (p.factory)())
    }
}

/// The default provider set: gzip only.
#[cfg(feature = "gzip")]
impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::empty().register(Provider::gzip())
    }
}
