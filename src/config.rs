//! Compression policy configuration and startup validation.

use crate::registry::ProviderRegistry;
use http::header::HeaderValue;
use thiserror::Error;

/// Rejected configuration, reported when the layer is constructed.
///
/// A layer that could never compress anything is a deployment mistake, so it
/// refuses to initialize instead of silently passing every response through.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The compressible MIME type list is empty.
    #[error("no compressible MIME types are configured")]
    NoMimeTypes,
    /// The provider registry has no providers.
    #[error("no compression providers are registered")]
    NoProviders,
    /// A registered token cannot be carried in a `Content-Encoding` header.
    #[error("provider token {0:?} is not a valid header value")]
    InvalidProviderToken(String),
}

/// Policy knobs for the compression layer.
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub(crate) mime_types: Vec<String>,
    pub(crate) enable_https: bool,
    pub(crate) min_size: usize,
}

impl CompressionConfig {
    /// Creates a configuration with the default policy: the common text and
    /// structured-data media types, compression over TLS disabled, and no
    /// minimum size.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the list of compressible base media types.
    ///
    /// Matching strips parameters (`charset=...`) and ignores case, so list
    /// entries should be bare types like `text/html`.
    pub fn mime_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mime_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Opts in to compressing responses served over encrypted connections.
    ///
    /// Disabled by default: compressing attacker-influenced content over TLS
    /// enables compression-oracle attacks, so the host must opt in.
    pub fn enable_https(mut self, enabled: bool) -> Self {
        self.enable_https = enabled;
        self
    }

    /// Sets the minimum declared `Content-Length` required for compression.
    ///
    /// Responses that declare a smaller length are passed through. Responses
    /// with no declared length are unaffected. Zero (the default) disables
    /// the gate.
    pub fn min_size(mut self, size: usize) -> Self {
        self.min_size = size;
        self
    }

    pub(crate) fn validate(&self, registry: &ProviderRegistry) -> Result<(), ConfigError> {
        if self.mime_types.is_empty() {
            return Err(ConfigError::NoMimeTypes);
        }
        if registry.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        for token in registry.tokens() {
            if HeaderValue::from_str(token).is_err() {
                return Err(ConfigError::InvalidProviderToken(token.to_owned()));
            }
        }
        Ok(())
    }

    pub(crate) fn allows_mime_type(&self, base_media_type: &str) -> bool {
        !base_media_type.is_empty()
            && self
                .mime_types
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(base_media_type))
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            mime_types: vec![
                "text/plain".to_owned(),
                "text/html".to_owned(),
                "text/css".to_owned(),
                "text/xml".to_owned(),
                "application/json".to_owned(),
                "application/javascript".to_owned(),
                "application/xml".to_owned(),
                "image/svg+xml".to_owned(),
            ],
            enable_https: false,
            min_size: 0,
        }
    }
}
