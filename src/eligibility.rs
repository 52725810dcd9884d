//! Structural eligibility of a response for compression, independent of what
//! the client accepts.

use crate::config::CompressionConfig;
use crate::registry::ProviderRegistry;
use http::header::{self, HeaderMap};

/// Why a response was ruled out of compression, or [`Ok`](EligibilityReason::Ok)
/// when it was not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EligibilityReason {
    /// The response is a candidate for compression.
    Ok,
    /// The connection is encrypted and compression over TLS is not opted in.
    HttpsDisallowed,
    /// The response carries `Content-Range`; partial content is not re-encoded.
    PartialContent,
    /// The response is already encoded with a coding this layer provides.
    AlreadyEncoded,
    /// The content type is not in the compressible allow-list.
    MimeTypeNotAllowed,
}

/// One-shot eligibility verdict for a response, computed before any body byte
/// is emitted and immutable afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EligibilityDecision {
    /// Whether the response may be compressed.
    pub eligible: bool,
    /// The first rule that ruled the response out, or `Ok`.
    pub reason: EligibilityReason,
}

impl EligibilityDecision {
    fn permitted() -> Self {
        Self {
            eligible: true,
            reason: EligibilityReason::Ok,
        }
    }

    fn refused(reason: EligibilityReason) -> Self {
        Self {
            eligible: false,
            reason,
        }
    }
}

/// Evaluates the ordered eligibility rules; the first failing rule wins.
///
/// A pre-existing `Content-Encoding` with foreign tokens does not disqualify
/// the response: the negotiated coding stacks onto it. Only a coding this
/// registry itself supplies blocks re-encoding.
pub(crate) fn evaluate(
    headers: &HeaderMap,
    encrypted: bool,
    config: &CompressionConfig,
    registry: &ProviderRegistry,
) -> EligibilityDecision {
    if encrypted && !config.enable_https {
        return EligibilityDecision::refused(EligibilityReason::HttpsDisallowed);
    }

    if headers.contains_key(header::CONTENT_RANGE) {
        return EligibilityDecision::refused(EligibilityReason::PartialContent);
    }

    if already_encoded_by_us(headers, registry) {
        return EligibilityDecision::refused(EligibilityReason::AlreadyEncoded);
    }

    if !config.allows_mime_type(base_media_type(headers)) {
        return EligibilityDecision::refused(EligibilityReason::MimeTypeNotAllowed);
    }

    EligibilityDecision::permitted()
}

/// The response's base media type with parameters stripped, or `""` when the
/// header is absent or unreadable.
fn base_media_type(headers: &HeaderMap) -> &str {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|ct| ct.split(';').next())
        .map(str::trim)
        .unwrap_or("")
}

/// Whether any existing `Content-Encoding` token names a coding the registry
/// supplies.
fn already_encoded_by_us(headers: &HeaderMap, registry: &ProviderRegistry) -> bool {
    headers
        .get_all(header::CONTENT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .any(|coding| registry.supports(coding))
}
