//! Framed codec for engine communication.
//!
//! Uses AnyDelimiterCodec for newline framing + the protocol module for
//! classification. Works over any AsyncRead/AsyncWrite (child stdio, in-memory
//! pipes).

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use super::protocol::{self, ResponseEvent};
use crate::error::BridgeError;

/// Lines longer than this are dropped as unparseable.
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("engine stream i/o: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Command(#[from] BridgeError),
}

impl From<AnyDelimiterCodecError> for CodecError {
    fn from(err: AnyDelimiterCodecError) -> Self {
        match err {
            AnyDelimiterCodecError::Io(e) => Self::Io(e),
            AnyDelimiterCodecError::MaxChunkLengthExceeded => {
                Self::Io(io::Error::new(io::ErrorKind::InvalidData, "line too long"))
            }
        }
    }
}

/// Codec that frames engine lines and classifies each into a [`ResponseEvent`].
///
/// A decoded item is itself a `Result`: lines that cannot be classified come
/// out as `Err(UnparseableLine)` so the stream keeps going past them. Only I/O
/// failures end the stream.
pub struct UciCodec {
    inner: AnyDelimiterCodec,
    max_length: usize,
}

impl Default for UciCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl UciCodec {
    pub fn new() -> Self {
        Self::with_max_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            inner: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max_length),
            max_length,
        }
    }

    fn classify(
        &self,
        chunk: Result<Option<tokio_util::bytes::Bytes>, AnyDelimiterCodecError>,
    ) -> Result<Option<Result<ResponseEvent, BridgeError>>, CodecError> {
        match chunk {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes);
                let line = line.trim_end_matches('\r');
                tracing::trace!(target: "xqbridge::wire", %line, "engine >>");
                Ok(Some(protocol::decode(line)))
            }
            Ok(None) => Ok(None),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => {
                tracing::debug!(max_length = self.max_length, "Dropping over-long engine line");
                Ok(Some(Err(BridgeError::UnparseableLine(format!(
                    "<line longer than {} bytes>",
                    self.max_length
                )))))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Decoder for UciCodec {
    type Item = Result<ResponseEvent, BridgeError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let chunk = self.inner.decode(src);
        self.classify(chunk)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let chunk = self.inner.decode_eof(src);
        self.classify(chunk)
    }
}

/// Writes one already encoded line (see [`Command::encode`](super::protocol::Command::encode)) plus the terminator.
impl Encoder<&str> for UciCodec {
    type Error = CodecError;

    fn encode(&mut self, line: &str, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if line.chars().any(char::is_control) {
            return Err(BridgeError::InvalidCommand(format!(
                "line {line:?} contains a control character"
            ))
            .into());
        }
        tracing::trace!(target: "xqbridge::wire", %line, "engine <<");
        self.inner.encode(line, dst)?;
        Ok(())
    }
}
