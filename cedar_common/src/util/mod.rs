mod buffer;
mod hash;
mod pool;

pub use buffer::{read_partial_varint, varint_len, Buffer, BufferError, BufferErrorKind};
pub use hash::djb2;
pub use pool::{TaskHandle, TaskStatus, ThreadPool, WorkerStats};

use rand::{rngs::OsRng, RngCore};
use std::{error::Error, fmt, num::ParseIntError, str::FromStr};

/// Returns the number of logical cores on the system.
pub fn num_cpus() -> usize { num_cpus::get() }

/// A 128 bit UUID, stored as a single number.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct UUID(u128);

impl Default for UUID {
  fn default() -> UUID { UUID::from_u128(0) }
}

#[derive(Debug)]
pub enum UUIDParseError {
  Int(ParseIntError),
  Length(usize),
}

impl fmt::Display for UUIDParseError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "error while parsing uuid: {}",
      match self {
        Self::Int(e) => format!("int parsing error: {}", e),
        Self::Length(len) => format!("invalid length: {}", len),
      }
    )
  }
}

impl Error for UUIDParseError {}

impl UUID {
  /// Generates a random UUID. This uses rand::OsRng, so it will be secure.
  pub fn random() -> Self {
    let mut arr = [0; 16];
    OsRng.fill_bytes(&mut arr);
    UUID::from_be_bytes(arr)
  }
  pub fn from_be_bytes(v: [u8; 16]) -> Self { UUID(u128::from_be_bytes(v)) }
  pub fn from_u128(v: u128) -> Self { UUID(v) }
  /// Returns the uuid represented as a hex string, with no dashes or other
  /// characters.
  pub fn as_str(&self) -> String { format!("{:x}", self.0) }
  /// Returns the uuid represented as a string with dashes. This is the form
  /// used in login packets and in json.
  pub fn as_dashed_str(&self) -> String {
    format!(
      "{:x}-{:x}-{:x}-{:x}-{:x}",
      //          11111111222233334444555555555555
      (self.0 & 0xffffffff000000000000000000000000) >> (24 * 4), // 4 bits per digit
      (self.0 & 0x00000000ffff00000000000000000000) >> (20 * 4),
      (self.0 & 0x000000000000ffff0000000000000000) >> (16 * 4),
      (self.0 & 0x0000000000000000ffff000000000000) >> (12 * 4),
      (self.0 & 0x00000000000000000000ffffffffffff),
    )
  }
  pub fn as_u128(&self) -> u128 { self.0 }
  /// Returns the big-endian representation of the underlying `u128`. This is
  /// the byte order that the Java Edition protocol uses.
  pub fn as_be_bytes(&self) -> [u8; 16] { self.0.to_be_bytes() }
}

impl FromStr for UUID {
  type Err = UUIDParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if s.len() != 32 {
      return Err(UUIDParseError::Length(s.len()));
    }
    match u128::from_str_radix(s, 16) {
      Ok(v) => Ok(Self::from_u128(v)),
      Err(e) => Err(UUIDParseError::Int(e)),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn uuid_str() {
    let id = UUID::from_u128(0x11111111222233334444555555555555);
    assert_eq!(id.as_str(), "11111111222233334444555555555555");
    assert_eq!(id.as_dashed_str(), "11111111-2222-3333-4444-555555555555");
    assert_eq!("11111111222233334444555555555555".parse::<UUID>().unwrap(), id);
  }
}
