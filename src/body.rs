use bytes::{Buf, Bytes, BytesMut};
use compression_codecs::EncodeV2;
use compression_core::util::{PartialBuffer, WriteBuffer};
use http_body::{Body, Frame};
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB output buffer

pin_project! {
    /// A response body that is either streamed through a negotiated encoder
    /// or passed through unchanged.
    #[project = CompressionBodyProj]
    #[allow(missing_docs)]
    pub enum CompressionBody<B> {
        /// Body streamed through the negotiated encoder.
        Encoded {
            #[pin]
            inner: B,
            state: ActiveEncoder,
        },
        /// Body forwarded without transformation.
        Passthrough {
            #[pin]
            inner: B,
        },
    }
}

/// Drives one response body through its encoder.
///
/// The encoder is finished exactly once, when the inner stream ends; trailer
/// frames are buffered until the encoded tail has been emitted so they still
/// arrive last.
pub struct ActiveEncoder {
    encoder: Box<dyn EncodeV2 + Send>,
    output_buffer: Vec<u8>,
    always_flush: bool,
    state: EncodeState,
    pending_trailers: Option<http::HeaderMap>,
}

/// Progress of the encoding stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EncodeState {
    /// Pulling frames from the inner body and encoding them.
    Streaming,
    /// Inner body finished; draining the encoder's tail.
    Draining,
    /// Tail emitted; buffered trailers still to deliver.
    Trailers,
    /// Stream complete.
    Done,
}

impl ActiveEncoder {
    fn new(encoder: Box<dyn EncodeV2 + Send>, always_flush: bool) -> Self {
        Self {
            encoder,
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
            always_flush,
            state: EncodeState::Streaming,
            pending_trailers: None,
        }
    }

    pub(crate) fn state(&self) -> EncodeState {
        self.state
    }

    pub(crate) fn always_flush(&self) -> bool {
        self.always_flush
    }

    fn poll_encoded<B>(
        &mut self,
        cx: &mut Context<'_>,
        mut inner: Pin<&mut B>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>>
    where
        B: Body,
        B::Data: Buf,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        loop {
            match self.state {
                EncodeState::Done => return Poll::Ready(None),

                EncodeState::Trailers => {
                    self.state = EncodeState::Done;
                    return match self.pending_trailers.take() {
                        Some(trailers) => Poll::Ready(Some(Ok(Frame::trailers(trailers)))),
                        None => Poll::Ready(None),
                    };
                }

                EncodeState::Draining => {
                    let mut output =
                        WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());

                    match self.encoder.finish(&mut output) {
                        Ok(done) => {
                            let written = output.written_len();
                            if done {
                                self.state = if self.pending_trailers.is_some() {
                                    EncodeState::Trailers
                                } else {
                                    EncodeState::Done
                                };
                            }
                            if written > 0 {
                                let data = Bytes::copy_from_slice(&self.output_buffer[..written]);
                                return Poll::Ready(Some(Ok(Frame::data(data))));
                            }
                            // Nothing produced this round; keep draining or
                            // fall through to trailers.
                        }
                        Err(e) => return Poll::Ready(Some(Err(io::Error::other(e)))),
                    }
                }

                EncodeState::Streaming => match inner.as_mut().poll_frame(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(None) => {
                        self.state = EncodeState::Draining;
                    }
                    Poll::Ready(Some(Err(e))) => {
                        return Poll::Ready(Some(Err(io::Error::other(e.into()))));
                    }
                    Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                        Ok(mut data) => {
                            let input = data.copy_to_bytes(data.remaining());
                            match self.encode_chunk(&input) {
                                Ok(Some(encoded)) => {
                                    return Poll::Ready(Some(Ok(Frame::data(encoded))));
                                }
                                // The encoder buffered everything; pull more
                                // input instead of yielding an empty frame.
                                Ok(None) => {}
                                Err(e) => return Poll::Ready(Some(Err(e))),
                            }
                        }
                        Err(frame) => {
                            if let Ok(trailers) = frame.into_trailers() {
                                self.pending_trailers = Some(trailers);
                                self.state = EncodeState::Draining;
                            }
                        }
                    },
                },
            }
        }
    }

    /// Runs one input chunk through the encoder, returning the bytes it
    /// produced, if any.
    fn encode_chunk(&mut self, input: &[u8]) -> Result<Option<Bytes>, io::Error> {
        let mut input_buf = PartialBuffer::new(input);
        let mut encoded = BytesMut::new();

        while input_buf.written_len() < input.len() {
            let consumed_before = input_buf.written_len();
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());

            self.encoder
                .encode(&mut input_buf, &mut output)
                .map_err(io::Error::other)?;

            let written = output.written_len();
            if written > 0 {
                encoded.extend_from_slice(&self.output_buffer[..written]);
            } else if input_buf.written_len() == consumed_before {
                // No forward progress; stop rather than spin.
                break;
            }
        }

        if self.always_flush {
            loop {
                let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
                let done = self
                    .encoder
                    .flush(&mut output)
                    .map_err(io::Error::other)?;

                let written = output.written_len();
                if written > 0 {
                    encoded.extend_from_slice(&self.output_buffer[..written]);
                }
                if done {
                    break;
                }
            }
        }

        Ok((!encoded.is_empty()).then(|| encoded.freeze()))
    }
}

impl<B> CompressionBody<B> {
    /// Creates a body that streams through the given encoder.
    pub fn encoded(inner: B, encoder: Box<dyn EncodeV2 + Send>, always_flush: bool) -> Self {
        Self::Encoded {
            inner,
            state: ActiveEncoder::new(encoder, always_flush),
        }
    }

    /// Creates a body that forwards the inner body unchanged.
    pub fn passthrough(inner: B) -> Self {
        Self::Passthrough { inner }
    }
}

impl<B> Body for CompressionBody<B>
where
    B: Body,
    B::Data: Buf,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            CompressionBodyProj::Passthrough { inner } => match inner.poll_frame(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Ready(Some(Ok(frame))) => {
                    let frame = frame.map_data(|mut data| data.copy_to_bytes(data.remaining()));
                    Poll::Ready(Some(Ok(frame)))
                }
                Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(io::Error::other(e.into())))),
            },
            CompressionBodyProj::Encoded { inner, state } => state.poll_encoded(cx, inner),
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            CompressionBody::Passthrough { inner } => inner.is_end_stream(),
            CompressionBody::Encoded { state, .. } => state.state() == EncodeState::Done,
        }
    }

    fn size_hint(&self) -> http_body::SizeHint {
        match self {
            CompressionBody::Passthrough { inner } => inner.size_hint(),
            // Encoded length is unknown until the encoder finishes.
            CompressionBody::Encoded { .. } => http_body::SizeHint::default(),
        }
    }
}
