//! Negotiated HTTP response compression middleware for Tower.
//!
//! This crate provides a Tower layer that decides, per response, whether the
//! body should be compressed and with which content coding, based on the
//! client's `Accept-Encoding` preferences, the configured policy, and the
//! registered providers.
//!
//! # Example
//!
//! ```ignore
//! use http_negotiated_compression::{
//!     CompressionConfig, CompressionLayer, Provider, ProviderRegistry,
//! };
//! use tower::ServiceBuilder;
//!
//! let layer = CompressionLayer::with_config(
//!     CompressionConfig::new()
//!         .mime_types(["text/html", "application/json"])
//!         .enable_https(true),
//!     ProviderRegistry::empty()
//!         .register(Provider::gzip()),
//! )?;
//!
//! let service = ServiceBuilder::new().layer(layer).service(my_service);
//! ```
//!
//! # Decision Rules
//!
//! A response is left uncompressed when:
//! - The request carries no `Accept-Encoding` header (absence means no
//!   compression was requested)
//! - Negotiation picks `identity`: no registered coding has an effective
//!   quality above identity's, with exact explicit ties going to identity
//! - The connection is encrypted and compression over TLS was not opted in
//! - A `Content-Range` header is present (partial content)
//! - The response is already encoded with a coding this layer provides
//! - The `Content-Type` base media type is not in the configured allow-list
//! - A declared `Content-Length` is below the configured minimum size
//!
//! A misconfiguration that could never compress anything — an empty MIME
//! allow-list or an empty provider registry — is rejected when the layer is
//! built, not silently tolerated per response.
//!
//! # Response Modifications
//!
//! When compression is applied:
//! - The chosen token is appended to `Content-Encoding`, stacking onto any
//!   coding the response already declared
//! - `Content-Length` is removed (the encoded size is unknown)
//! - `Content-Digest` and `Digest` are removed (they describe the original
//!   bytes)
//! - `Accept-Ranges` is removed
//! - `Vary` gains `Accept-Encoding`

#![deny(missing_docs)]

mod accept;
mod body;
mod config;
mod eligibility;
mod future;
mod layer;
mod negotiate;
mod registry;
mod service;

pub use accept::EncodingPreference;
pub use body::CompressionBody;
pub use config::{CompressionConfig, ConfigError};
pub use eligibility::{EligibilityDecision, EligibilityReason};
pub use future::ResponseFuture;
pub use layer::CompressionLayer;
pub use negotiate::NegotiationResult;
pub use registry::{Provider, ProviderRegistry};
pub use service::{CompressionService, EncryptedConnection};
