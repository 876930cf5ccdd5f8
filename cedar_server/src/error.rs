use crate::packet::ProtocolState;
use cedar_common::{
  chunk::ColumnError,
  math::{BlockId, ColumnId, Dimension},
  util::BufferError,
};
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Every way the server can fail. Connection-level errors (the first few
/// variants) terminate only the offending connection; the rest are reported
/// to the caller that hit them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("{0}")]
  Buffer(#[from] BufferError),
  #[error("{0}")]
  IO(#[from] io::Error),
  #[error("unexpected packet {id:#04x} in state {state:?}")]
  UnexpectedPacket { state: ProtocolState, id: u8 },
  #[error("packet of {0} bytes is too long")]
  PacketTooLong(usize),
  #[error("bad frame: {0}")]
  BadFrame(&'static str),
  #[error("{0} while decompressing packet")]
  PacketDecompress(String),
  #[error("client sent an invalid verify token")]
  BadVerifyToken,
  #[error("unable to decrypt {what}: {source}")]
  Decrypt {
    what:   &'static str,
    source: rsa::Error,
  },
  #[error("shared secret has length {0}, expected 16")]
  BadSharedSecret(usize),
  #[error("{0}")]
  BadColumnBlob(#[from] ColumnError),
  #[error("no generator registered for world type {world_type:?} in dimension {dimension}")]
  NoGenerator {
    world_type: String,
    dimension:  Dimension,
  },
  #[error("block {block} is not inside {column}")]
  OutOfColumn {
    block:  BlockId,
    column: ColumnId,
  },
  #[error("could not generate rsa key: {0}")]
  KeyGen(rsa::Error),
}

impl Error {
  pub fn io_kind(&self) -> Option<io::ErrorKind> {
    match self {
      Self::IO(e) => Some(e.kind()),
      _ => None,
    }
  }

  /// Whether this is a normal end-of-connection, rather than something worth
  /// logging at warning level.
  pub fn is_normal_disconnect(&self) -> bool {
    matches!(
      self.io_kind(),
      Some(
        io::ErrorKind::BrokenPipe
          | io::ErrorKind::ConnectionReset
          | io::ErrorKind::ConnectionAborted
      )
    )
  }
}
