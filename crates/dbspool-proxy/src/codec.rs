//! Length-prefixed JSON frame codec.
//!
//! ```text
//! +----------------+---------------------------+
//! | length (u32 BE)| JSON body (length bytes)  |
//! +----------------+---------------------------+
//! ```

use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProxyError;
use crate::protocol::{RequestFrame, ResponseFrame};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default maximum frame body size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Proxy transport settings.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ProxyConfig {
    /// Largest frame body accepted or produced.
    pub max_frame_size: usize,
}

impl ProxyConfig {
    /// Create a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum frame body size.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// Codec that decodes `In` frames and encodes `Out` frames.
pub struct FrameCodec<In, Out> {
    max_frame_size: usize,
    _marker: PhantomData<fn(Out) -> In>,
}

/// Codec for the server side of a proxy connection.
pub type ServerCodec = FrameCodec<RequestFrame, ResponseFrame>;

/// Codec for the client side of a proxy connection.
pub type ClientCodec = FrameCodec<ResponseFrame, RequestFrame>;

impl<In, Out> FrameCodec<In, Out> {
    /// Create a codec with the default frame limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&ProxyConfig::default())
    }

    /// Create a codec using the limits in `config`.
    #[must_use]
    pub fn with_config(config: &ProxyConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            _marker: PhantomData,
        }
    }

    /// The frame size limit.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In, Out> std::fmt::Debug for FrameCodec<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

impl<In, Out> Decoder for FrameCodec<In, Out>
where
    In: DeserializeOwned,
{
    type Item = In;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_frame_size {
            return Err(ProxyError::FrameTooLarge {
                size: length,
                max: self.max_frame_size,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let body = src.split_to(length);
        let item = serde_json::from_slice(&body)?;

        tracing::trace!(length, "decoded proxy frame");
        Ok(Some(item))
    }
}

impl<In, Out> Encoder<Out> for FrameCodec<In, Out>
where
    Out: Serialize,
{
    type Error = ProxyError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > self.max_frame_size {
            return Err(ProxyError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }
        let length = u32::try_from(body.len()).map_err(|_| ProxyError::FrameTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?;

        dst.reserve(LENGTH_PREFIX_SIZE + body.len());
        dst.put_u32(length);
        dst.put_slice(&body);

        tracing::trace!(length = body.len(), "encoded proxy frame");
        Ok(())
    }
}
