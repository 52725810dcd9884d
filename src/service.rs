use crate::accept::parse_accept_encoding;
use crate::future::ResponseFuture;
use crate::layer::Shared;
use http::{Request, uri::Scheme};
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::Service;

/// Request-extension marker a host inserts when the connection is encrypted.
///
/// Middlewares running behind in-process TLS termination usually see
/// origin-form request targets with no scheme, so the URI alone cannot carry
/// the transport-security bit. Hosts that terminate TLS insert this marker;
/// requests whose URI scheme is `https` are recognized either way.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptedConnection;

/// A Tower service that negotiates and applies response body compression.
#[derive(Debug, Clone)]
pub struct CompressionService<S> {
    inner: S,
    shared: Arc<Shared>,
}

impl<S> CompressionService<S> {
    pub(crate) fn new(inner: S, shared: Arc<Shared>) -> Self {
        Self { inner, shared }
    }

    /// Returns a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the inner service.
    pub fn inner_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Consumes this service, returning the inner service.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

fn connection_is_encrypted<B>(req: &Request<B>) -> bool {
    req.extensions().get::<EncryptedConnection>().is_some()
        || req.uri().scheme() == Some(&Scheme::HTTPS)
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CompressionService<S>
where
    S: Service<Request<ReqBody>, Response = http::Response<ResBody>>,
{
    type Response = http::Response<crate::body::CompressionBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        // Capture the request-side inputs before the inner service consumes
        // the request: every Accept-Encoding occurrence plus the transport
        // security bit.
        let preferences = parse_accept_encoding(
            req.headers()
                .get_all(http::header::ACCEPT_ENCODING)
                .iter()
                .filter_map(|v| v.to_str().ok()),
        );
        let encrypted = connection_is_encrypted(&req);

        let inner = self.inner.call(req);

        ResponseFuture::new(inner, preferences, encrypted, Arc::clone(&self.shared))
    }
}
