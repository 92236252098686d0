//! Framed halves of a proxy transport.
//!
//! Both ends split their transport: one task reads frames while responses
//! or requests are written from another, so a slow statement on one
//! transaction never holds up traffic for the others.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use futures_util::Sink;
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

pin_project! {
    /// A read-only stream of decoded frames.
    pub struct FrameReader<T, C> {
        #[pin]
        inner: FramedRead<T, C>,
    }
}

impl<T, C> FrameReader<T, C>
where
    T: AsyncRead,
    C: Decoder,
{
    /// Create a frame reader over `transport`.
    pub fn new(transport: T, codec: C) -> Self {
        Self {
            inner: FramedRead::new(transport, codec),
        }
    }

    /// Get a reference to the underlying transport.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    /// Get a reference to the codec.
    pub fn codec(&self) -> &C {
        self.inner.decoder()
    }
}

impl<T, C> Stream for FrameReader<T, C>
where
    T: AsyncRead + Unpin,
    C: Decoder,
{
    type Item = Result<C::Item, C::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

impl<T, C> std::fmt::Debug for FrameReader<T, C>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("transport", self.inner.get_ref())
            .finish()
    }
}

pin_project! {
    /// A write-only sink of frames.
    pub struct FrameWriter<T, C> {
        #[pin]
        inner: FramedWrite<T, C>,
    }
}

impl<T, C> FrameWriter<T, C>
where
    T: AsyncWrite,
{
    /// Create a frame writer over `transport`.
    pub fn new(transport: T, codec: C) -> Self {
        Self {
            inner: FramedWrite::new(transport, codec),
        }
    }

    /// Get a reference to the underlying transport.
    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }
}

impl<T, C, I> Sink<I> for FrameWriter<T, C>
where
    T: AsyncWrite + Unpin,
    C: Encoder<I>,
{
    type Error = C::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        self.project().inner.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.project().inner.poll_close(cx)
    }
}

impl<T, C> std::fmt::Debug for FrameWriter<T, C>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("transport", self.inner.get_ref())
            .finish()
    }
}
