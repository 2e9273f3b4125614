//! This module contains definition of errors made when tokenizing

use thiserror::Error;

/// Error for the tokenizer
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PacketError {
    /// The packet continues past the end of the given buffer.
    ///
    /// Callers that stream chunked buffers should splice the tail of the
    /// current chunk with the head of the next one and retry.
    #[error("Packet extends past end of buffer")]
    NeedMoreBytes,
    /// The bytes do not form a valid packet
    #[error("Invalid packet")]
    Invalid,
}

pub(crate) type PacketResult<T> = core::result::Result<T, PacketError>;
