use crate::accept::EncodingPreference;
use crate::body::CompressionBody;
use crate::eligibility::{self, EligibilityDecision};
use crate::layer::Shared;
use crate::negotiate::{NegotiationResult, negotiate};
use http::{Response, header};
use pin_project_lite::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, trace, warn};

pin_project! {
    /// Future for compression service responses.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        preferences: Vec<EncodingPreference>,
        encrypted: bool,
        shared: Arc<Shared>,
    }
}

impl<F> ResponseFuture<F> {
    pub(crate) fn new(
        inner: F,
        preferences: Vec<EncodingPreference>,
        encrypted: bool,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            inner,
            preferences,
            encrypted,
            shared,
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<Response<B>, E>>,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        match this.inner.poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(response)) => {
                let response =
                    wrap_response(response, this.preferences, *this.encrypted, this.shared);
                Poll::Ready(Ok(response))
            }
        }
    }
}

/// The per-response decision state: eligibility plus negotiation outcome.
///
/// Computed exactly once, while the response value is still owned by this
/// layer — before any body frame can be polled — so headers can never be
/// mutated after they were handed off.
pub(crate) struct CompressionContext {
    pub(crate) eligibility: EligibilityDecision,
    pub(crate) negotiation: NegotiationResult,
}

impl CompressionContext {
    pub(crate) fn decide(
        headers: &header::HeaderMap,
        preferences: &[EncodingPreference],
        encrypted: bool,
        shared: &Shared,
    ) -> Self {
        let eligibility =
            eligibility::evaluate(headers, encrypted, &shared.config, &shared.registry);

        let negotiation = if eligibility.eligible
            && !below_min_size(headers, shared.config.min_size)
        {
            negotiate(preferences, shared.registry.tokens())
        } else {
            NegotiationResult { chosen: None }
        };

        Self {
            eligibility,
            negotiation,
        }
    }

    fn chosen(&self) -> Option<&str> {
        self.negotiation.chosen.as_deref()
    }
}

/// Applies the compression decision to the response: either passes it through
/// untouched or rewrites headers once and swaps the body for the encoding
/// stream.
fn wrap_response<B>(
    response: Response<B>,
    preferences: &[EncodingPreference],
    encrypted: bool,
    shared: &Shared,
) -> Response<CompressionBody<B>> {
    let (mut parts, body) = response.into_parts();

    let context = CompressionContext::decide(&parts.headers, preferences, encrypted, shared);

    let Some(token) = context.chosen() else {
        trace!(
            reason = ?context.eligibility.reason,
            "response left uncompressed"
        );
        return Response::from_parts(parts, CompressionBody::passthrough(body));
    };

    let Some(encoder) = shared.registry.encoder(token) else {
        // Negotiation only yields registered tokens.
        return Response::from_parts(parts, CompressionBody::passthrough(body));
    };
    let Some(content_encoding) = stacked_content_encoding(&parts.headers, token) else {
        warn!("existing content-encoding is not readable, leaving response untouched");
        return Response::from_parts(parts, CompressionBody::passthrough(body));
    };

    let eager_flush = wants_eager_flush(&parts.headers);

    debug!(encoding = token, "compressing response body");

    // Header mutation happens here, exactly once, before the response (and
    // with it the first body byte) leaves this layer.
    parts.headers.insert(header::CONTENT_ENCODING, content_encoding);

    // The compressed length is unknown until the encoder finishes.
    parts.headers.remove(header::CONTENT_LENGTH);

    // Digests of the original bytes no longer describe the transmitted body.
    parts.headers.remove("content-digest");
    parts.headers.remove("digest");

    // Byte ranges cannot be served over the transformed representation.
    parts.headers.remove(header::ACCEPT_RANGES);

    add_vary_accept_encoding(&mut parts.headers);

    Response::from_parts(parts, CompressionBody::encoded(body, encoder, eager_flush))
}

/// Builds the `Content-Encoding` value with `token` stacked onto any codings
/// the response already declares, preserving their order.
///
/// Returns `None` when an existing value cannot be read as a string; the
/// response is then left untouched rather than corrupting its coding list.
fn stacked_content_encoding(
    headers: &header::HeaderMap,
    token: &str,
) -> Option<header::HeaderValue> {
    let mut combined = String::new();
    for existing in headers.get_all(header::CONTENT_ENCODING) {
        let existing = existing.to_str().ok()?.trim();
        if existing.is_empty() {
            continue;
        }
        if !combined.is_empty() {
            combined.push_str(", ");
        }
        combined.push_str(existing);
    }

    if !combined.is_empty() {
        combined.push_str(", ");
    }
    combined.push_str(token);

    header::HeaderValue::from_str(&combined).ok()
}

/// Adds Accept-Encoding to the Vary header unless it is already covered.
fn add_vary_accept_encoding(headers: &mut header::HeaderMap) {
    for vary in headers.get_all(header::VARY) {
        if let Ok(vary_str) = vary.to_str() {
            let covered = vary_str.split(',').any(|v| {
                let v = v.trim();
                v.eq_ignore_ascii_case("*") || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }

    headers.append(
        header::VARY,
        header::HeaderValue::from_static("accept-encoding"),
    );
}

/// Whether the response should be flushed through the encoder after every
/// chunk instead of letting the codec buffer for ratio.
fn wants_eager_flush(headers: &header::HeaderMap) -> bool {
    let buffering_disabled = headers
        .get("x-accel-buffering")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("no"));

    buffering_disabled
        || headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

/// Whether a declared Content-Length is below the configured threshold.
fn below_min_size(headers: &header::HeaderMap, min_size: usize) -> bool {
    if min_size == 0 {
        return false;
    }
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .is_some_and(|len| len < min_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accept::parse_accept_encoding;
    use crate::body::EncodeState;
    use crate::config::CompressionConfig;
    use crate::registry::ProviderRegistry;

    #[cfg(feature = "gzip")]
    fn shared() -> Shared {
        Shared {
            config: CompressionConfig::default(),
            registry: ProviderRegistry::default(),
        }
    }

    #[cfg(feature = "gzip")]
    fn shared_with(config: CompressionConfig) -> Shared {
        Shared {
            config,
            registry: ProviderRegistry::default(),
        }
    }

    fn prefs(value: &str) -> Vec<EncodingPreference> {
        parse_accept_encoding([value])
    }

    fn make_response<I>(headers: I) -> Response<&'static str>
    where
        I: IntoIterator<Item = (&'static str, &'static str)>,
    {
        let mut response = Response::new("hello world");
        for (name, value) in headers {
            response
                .headers_mut()
                .append(name, header::HeaderValue::from_static(value));
        }
        response
    }

    fn text_response() -> Response<&'static str> {
        make_response([("content-type", "text/plain")])
    }

    fn is_compressed<B>(response: &Response<CompressionBody<B>>) -> bool {
        matches!(response.body(), CompressionBody::Encoded { .. })
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_compress_when_gzip_accepted() {
        let wrapped = wrap_response(text_response(), &prefs("gzip, deflate"), false, &shared());

        assert!(is_compressed(&wrapped));
        assert_eq!(
            wrapped.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
        match wrapped.body() {
            CompressionBody::Encoded { state, .. } => {
                assert_eq!(state.state(), EncodeState::Streaming);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_no_compress_without_accept_encoding() {
        let wrapped = wrap_response(text_response(), &[], false, &shared());

        assert!(!is_compressed(&wrapped));
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_gzip_beats_downweighted_identity() {
        for header_value in [
            "identity;q=0.5, gzip;q=1",
            "identity;q=0, gzip;q=0.8",
            "identity;q=0.5, gzip",
        ] {
            let wrapped = wrap_response(text_response(), &prefs(header_value), false, &shared());
            assert!(is_compressed(&wrapped), "expected {header_value:?} to compress");
        }
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_identity_preferred_over_gzip() {
        let wrapped = wrap_response(
            text_response(),
            &prefs("gzip;q=0.5, identity;q=0.8"),
            false,
            &shared(),
        );
        assert!(!is_compressed(&wrapped));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_wildcard_compresses() {
        let wrapped = wrap_response(text_response(), &prefs("*"), false, &shared());
        assert!(is_compressed(&wrapped));
        assert_eq!(
            wrapped.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_unknown_encoding_passes_through() {
        let wrapped = wrap_response(text_response(), &prefs("unknown"), false, &shared());
        assert!(!is_compressed(&wrapped));
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_identity_passes_through() {
        let wrapped = wrap_response(text_response(), &prefs("identity"), false, &shared());
        assert!(!is_compressed(&wrapped));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_mime_matching_ignores_case_and_parameters() {
        for content_type in ["text/PLAIN", "text/plain; charset=ISO-8859-4"] {
            let mut response = Response::new("hello world");
            response.headers_mut().insert(
                header::CONTENT_TYPE,
                header::HeaderValue::from_str(content_type).unwrap(),
            );
            let wrapped = wrap_response(response, &prefs("gzip"), false, &shared());
            assert!(
                is_compressed(&wrapped),
                "expected {content_type:?} to compress"
            );
        }
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_unlisted_mime_type_passes_through() {
        let wrapped = wrap_response(
            make_response([("content-type", "text/plain2")]),
            &prefs("gzip"),
            false,
            &shared(),
        );
        assert!(!is_compressed(&wrapped));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_missing_content_type_passes_through() {
        let wrapped = wrap_response(make_response([]), &prefs("gzip"), false, &shared());
        assert!(!is_compressed(&wrapped));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_range_response_never_compressed() {
        let wrapped = wrap_response(
            make_response([
                ("content-type", "text/plain"),
                ("content-range", "bytes 0-99/200"),
            ]),
            &prefs("gzip"),
            false,
            &shared(),
        );
        assert!(!is_compressed(&wrapped));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_foreign_content_encoding_stacks() {
        let wrapped = wrap_response(
            make_response([
                ("content-type", "text/plain"),
                ("content-encoding", "something"),
            ]),
            &prefs("gzip"),
            false,
            &shared(),
        );

        assert!(is_compressed(&wrapped));
        assert_eq!(
            wrapped.headers().get(header::CONTENT_ENCODING).unwrap(),
            "something, gzip"
        );
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_own_coding_is_not_reapplied() {
        let wrapped = wrap_response(
            make_response([
                ("content-type", "text/plain"),
                ("content-encoding", "gzip"),
            ]),
            &prefs("gzip"),
            false,
            &shared(),
        );

        assert!(!is_compressed(&wrapped));
        assert_eq!(
            wrapped.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_encrypted_connection_not_compressed_by_default() {
        let wrapped = wrap_response(text_response(), &prefs("gzip"), true, &shared());
        assert!(!is_compressed(&wrapped));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_encrypted_connection_compressed_when_opted_in() {
        let shared = shared_with(CompressionConfig::default().enable_https(true));
        let wrapped = wrap_response(text_response(), &prefs("gzip"), true, &shared);
        assert!(is_compressed(&wrapped));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_content_digest_removed_when_compressing() {
        let wrapped = wrap_response(
            make_response([
                ("content-type", "text/plain"),
                ("content-digest", "sha-256=:abc:"),
                ("digest", "sha-256=abc"),
            ]),
            &prefs("gzip"),
            false,
            &shared(),
        );

        assert!(is_compressed(&wrapped));
        assert!(wrapped.headers().get("content-digest").is_none());
        assert!(wrapped.headers().get("digest").is_none());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_content_digest_kept_when_not_compressing() {
        let wrapped = wrap_response(
            make_response([
                ("content-type", "text/plain"),
                ("content-digest", "sha-256=:abc:"),
            ]),
            &[],
            false,
            &shared(),
        );

        assert!(!is_compressed(&wrapped));
        assert!(wrapped.headers().get("content-digest").is_some());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_content_length_removed_when_compressing() {
        let wrapped = wrap_response(
            make_response([("content-type", "text/plain"), ("content-length", "11")]),
            &prefs("gzip"),
            false,
            &shared(),
        );

        assert!(is_compressed(&wrapped));
        assert!(wrapped.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_below_min_size_passes_through() {
        let shared = shared_with(CompressionConfig::default().min_size(100));
        let wrapped = wrap_response(
            make_response([("content-type", "text/plain"), ("content-length", "5")]),
            &prefs("gzip"),
            false,
            &shared,
        );
        assert!(!is_compressed(&wrapped));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_above_min_size_compresses() {
        let shared = shared_with(CompressionConfig::default().min_size(100));
        let wrapped = wrap_response(
            make_response([("content-type", "text/plain"), ("content-length", "200")]),
            &prefs("gzip"),
            false,
            &shared,
        );
        assert!(is_compressed(&wrapped));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_unknown_size_compresses() {
        let shared = shared_with(CompressionConfig::default().min_size(100));
        let wrapped = wrap_response(text_response(), &prefs("gzip"), false, &shared);
        assert!(is_compressed(&wrapped));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_vary_header_added() {
        let wrapped = wrap_response(text_response(), &prefs("gzip"), false, &shared());
        assert_eq!(
            wrapped.headers().get(header::VARY).unwrap(),
            "accept-encoding"
        );
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_vary_header_appended() {
        let wrapped = wrap_response(
            make_response([("content-type", "text/plain"), ("vary", "origin")]),
            &prefs("gzip"),
            false,
            &shared(),
        );

        let vary_values: Vec<_> = wrapped
            .headers()
            .get_all(header::VARY)
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(vary_values, vec!["origin", "accept-encoding"]);
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_vary_header_not_duplicated() {
        let wrapped = wrap_response(
            make_response([("content-type", "text/plain"), ("vary", "accept-encoding")]),
            &prefs("gzip"),
            false,
            &shared(),
        );
        assert_eq!(
            wrapped.headers().get(header::VARY).unwrap(),
            "accept-encoding"
        );
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_vary_star_not_modified() {
        let wrapped = wrap_response(
            make_response([("content-type", "text/plain"), ("vary", "*")]),
            &prefs("gzip"),
            false,
            &shared(),
        );
        assert_eq!(wrapped.headers().get(header::VARY).unwrap(), "*");
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_accept_ranges_removed_when_compressing() {
        let wrapped = wrap_response(
            make_response([("content-type", "text/plain"), ("accept-ranges", "bytes")]),
            &prefs("gzip"),
            false,
            &shared(),
        );
        assert!(wrapped.headers().get(header::ACCEPT_RANGES).is_none());
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_accept_ranges_kept_when_not_compressing() {
        let wrapped = wrap_response(
            make_response([("content-type", "text/plain"), ("accept-ranges", "bytes")]),
            &[],
            false,
            &shared(),
        );
        assert_eq!(
            wrapped.headers().get(header::ACCEPT_RANGES).unwrap(),
            "bytes"
        );
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_eager_flush_for_x_accel_buffering() {
        for value in [("x-accel-buffering", "no"), ("x-accel-buffering", "NO")] {
            let wrapped = wrap_response(
                make_response([("content-type", "text/plain"), value]),
                &prefs("gzip"),
                false,
                &shared(),
            );
            match wrapped.body() {
                CompressionBody::Encoded { state, .. } => assert!(state.always_flush()),
                _ => panic!("expected compressed body"),
            }
        }
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_eager_flush_for_event_stream() {
        let shared = shared_with(CompressionConfig::default().mime_types(["text/event-stream"]));
        let wrapped = wrap_response(
            make_response([("content-type", "text/event-stream; charset=utf-8")]),
            &prefs("gzip"),
            false,
            &shared,
        );
        match wrapped.body() {
            CompressionBody::Encoded { state, .. } => assert!(state.always_flush()),
            _ => panic!("expected compressed body"),
        }
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_no_eager_flush_by_default() {
        let wrapped = wrap_response(text_response(), &prefs("gzip"), false, &shared());
        match wrapped.body() {
            CompressionBody::Encoded { state, .. } => assert!(!state.always_flush()),
            _ => panic!("expected compressed body"),
        }
    }

    #[cfg(feature = "gzip")]
    fn drain_bytes<B>(body: &mut CompressionBody<B>) -> Vec<u8>
    where
        B: http_body::Body + Unpin,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
        CompressionBody<B>: Unpin,
    {
        use http_body::Body as _;
        use std::task::Poll;

        let waker = std::task::Waker::noop();
        let mut cx = std::task::Context::from_waker(waker);
        let mut data = Vec::new();
        while let Poll::Ready(Some(result)) =
            std::pin::Pin::new(&mut *body).poll_frame(&mut cx)
        {
            if let Ok(bytes) = result.unwrap().into_data() {
                data.extend_from_slice(&bytes);
            }
        }
        data
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_round_trip_reproduces_original_bytes() {
        use bytes::Bytes;
        use http_body_util::Full;
        use std::io::Read;

        let original = b"hello world, hello world, hello world".as_slice();
        let mut response = Response::new(Full::new(Bytes::from_static(original)));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain"),
        );

        let mut wrapped = wrap_response(response, &prefs("gzip, deflate"), false, &shared());
        assert_eq!(
            wrapped.headers().get(header::CONTENT_ENCODING).unwrap(),
            "gzip"
        );

        let compressed = drain_bytes(wrapped.body_mut());
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_passthrough_is_byte_identical() {
        use bytes::Bytes;
        use http_body_util::Full;

        let original = b"hello world".as_slice();
        let mut response = Response::new(Full::new(Bytes::from_static(original)));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain"),
        );

        let mut wrapped = wrap_response(response, &prefs("unknown"), false, &shared());
        assert!(wrapped.headers().get(header::CONTENT_ENCODING).is_none());
        assert_eq!(drain_bytes(wrapped.body_mut()), original);
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_stacked_body_is_gzip_of_original() {
        use bytes::Bytes;
        use http_body_util::Full;
        use std::io::Read;

        // The upstream coding is opaque to this layer: the body bytes are
        // whatever the upstream produced, and gzip stacks on top of them.
        let upstream = b"upstream-encoded payload".as_slice();
        let mut response = Response::new(Full::new(Bytes::from_static(upstream)));
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain"),
        );
        response.headers_mut().insert(
            header::CONTENT_ENCODING,
            header::HeaderValue::from_static("something"),
        );

        let mut wrapped = wrap_response(response, &prefs("gzip"), false, &shared());
        assert_eq!(
            wrapped.headers().get(header::CONTENT_ENCODING).unwrap(),
            "something, gzip"
        );

        let compressed = drain_bytes(wrapped.body_mut());
        let mut decoder = flate2::read::GzDecoder::new(&compressed[..]);
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, upstream);
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_decision_reason_is_recorded() {
        let response = make_response([
            ("content-type", "text/plain"),
            ("content-range", "bytes 0-99/200"),
        ]);
        let (parts, _) = response.into_parts();
        let context = CompressionContext::decide(&parts.headers, &prefs("gzip"), false, &shared());
        assert!(!context.eligibility.eligible);
        assert_eq!(context.negotiation.chosen, None);
    }
}
