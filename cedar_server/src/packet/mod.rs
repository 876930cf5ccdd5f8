//! Wire packets.
//!
//! [`Packet`] is a raw frame body: a packet id followed by its payload bytes.
//! The typed views live in [`sb`] (serverbound) and [`cb`] (clientbound).
//! [`frame`] and [`deframe`] handle the length prefix and the optional
//! compression sub-frame; encryption happens outside this module, on the whole
//! framed byte stream.

pub mod cb;
pub mod sb;
pub mod status;

use crate::{Error, Result};
use cedar_common::util::{self, Buffer};
use miniz_oxide::{deflate::compress_to_vec_zlib, inflate::decompress_to_vec_zlib};
use std::ops::{Deref, DerefMut};

/// The protocol version this server speaks (1.8.x).
pub const PROTOCOL_VERSION: i32 = 47;
pub const VERSION_NAME: &str = "1.8.9";

/// The largest size that an uncompressed or compressed packet can be. This is
/// about 2 mb, and is the same size used in vanilla.
pub const MAX_PACKET_SIZE: usize = 0x1fffff;

/// The four connection states. Every session starts in `Handshaking`; the
/// handshake packet moves it to `Status` or `Login`, and a successful login
/// moves it to `Play`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
  Handshaking,
  Status,
  Login,
  Play,
}

impl ProtocolState {
  /// The state the client asked for in its handshake. Anything unknown is
  /// None, and should kill the connection.
  pub fn from_next(next: i32) -> Option<Self> {
    match next {
      1 => Some(Self::Status),
      2 => Some(Self::Login),
      _ => None,
    }
  }

  pub(crate) fn index(&self) -> usize {
    match self {
      Self::Handshaking => 0,
      Self::Status => 1,
      Self::Login => 2,
      Self::Play => 3,
    }
  }
}

/// A raw packet: the id varint followed by the payload. Reads start right
/// after the id; writes append to the end.
#[derive(Debug)]
pub struct Packet {
  id:  u8,
  buf: Buffer<Vec<u8>>,
}

impl Packet {
  /// Creates an outgoing packet with the given id and an empty payload.
  pub fn new(id: u8) -> Self {
    let mut buf = Buffer::new(Vec::with_capacity(64));
    buf.write_varint(id as i32);
    Packet { id, buf }
  }

  /// Parses the id out of a frame body. The remaining bytes are the payload.
  pub fn from_buf(data: Vec<u8>) -> Result<Self> {
    let mut buf = Buffer::new(data);
    let id = buf.read_varint()?;
    let id = u8::try_from(id).map_err(|_| Error::BadFrame("packet id out of range"))?;
    Ok(Packet { id, buf })
  }

  pub fn id(&self) -> u8 { self.id }

  /// Returns the frame body: id varint plus payload.
  pub fn serialize(self) -> Vec<u8> { self.buf.into_inner() }
}

impl Deref for Packet {
  type Target = Buffer<Vec<u8>>;

  fn deref(&self) -> &Self::Target { &self.buf }
}
impl DerefMut for Packet {
  fn deref_mut(&mut self) -> &mut Self::Target { &mut self.buf }
}

/// Wraps a frame body in the outer frame: length prefix, and a compression
/// sub-frame when `compression` is non-negative. The result is what goes
/// through the cipher and onto the wire.
pub fn frame(p: Packet, compression: i32) -> Vec<u8> {
  let body = p.serialize();
  let mut data = Vec::with_capacity(body.len() + 6);
  let mut buf = Buffer::new(&mut data);

  if compression >= 0 {
    // as usize won't wrap here, because `compression >= 0`
    if body.len() > compression as usize {
      let compressed = compress_to_vec_zlib(&body, 1);
      let uncompressed_len = util::varint_len(body.len() as i32);
      buf.write_varint((uncompressed_len + compressed.len()) as i32);
      buf.write_varint(body.len() as i32);
      buf.write_buf(&compressed);
    } else {
      // The 1 is for the zero uncompressed_length
      buf.write_varint(body.len() as i32 + 1);
      buf.write_varint(0);
      buf.write_buf(&body);
    }
  } else {
    buf.write_varint(body.len() as i32);
    buf.write_buf(&body);
  }
  data
}

/// Pulls one frame out of `recv`, which holds already-decrypted bytes.
/// Returns `Ok(None)` when only a partial frame is buffered; the caller
/// should read more from the socket and try again.
pub fn deframe(recv: &mut Vec<u8>, compression: i32) -> Result<Option<Packet>> {
  let (len, read) = util::read_partial_varint(recv);
  if read < 0 {
    return Err(Error::BadFrame("length prefix is not a valid varint"));
  }
  if read == 0 {
    return Ok(None);
  }
  let read = read as usize;
  if len < 0 || len as usize > MAX_PACKET_SIZE {
    return Err(Error::PacketTooLong(len as usize));
  }
  let len = len as usize;
  if recv.len() < len + read {
    return Ok(None);
  }

  recv.drain(0..read);
  let body: Vec<u8> = recv.drain(0..len).collect();

  if compression >= 0 {
    let mut buf = Buffer::new(body);
    let uncompressed_len = buf.read_varint()?;
    if uncompressed_len < 0 || uncompressed_len as usize > MAX_PACKET_SIZE {
      return Err(Error::PacketTooLong(uncompressed_len as usize));
    }
    if uncompressed_len == 0 {
      Ok(Some(Packet::from_buf(buf.read_all())?))
    } else {
      let decompressed = decompress_to_vec_zlib(&buf.read_all())
        .map_err(|e| Error::PacketDecompress(format!("{e:?}")))?;
      if decompressed.len() != uncompressed_len as usize {
        return Err(Error::PacketDecompress(format!(
          "uncompressed length {} does not match prefix {uncompressed_len}",
          decompressed.len()
        )));
      }
      Ok(Some(Packet::from_buf(decompressed)?))
    }
  } else {
    Ok(Some(Packet::from_buf(body)?))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn round_trip(payload_len: usize, compression: i32) {
    let mut p = Packet::new(0x23);
    for i in 0..payload_len {
      p.write_u8(i as u8);
    }
    let mut wire = frame(p, compression);
    let parsed = deframe(&mut wire, compression).unwrap().expect("should be a whole frame");
    assert!(wire.is_empty(), "frame should be fully consumed");
    assert_eq!(parsed.id(), 0x23);
    let mut parsed = parsed;
    for i in 0..payload_len {
      assert_eq!(parsed.read_u8().unwrap(), i as u8);
    }
  }

  #[test]
  fn frame_round_trip_uncompressed() {
    round_trip(0, -1);
    round_trip(10, -1);
    round_trip(1000, -1);
  }

  #[test]
  fn frame_round_trip_compressed() {
    // Below the threshold: sent with a zero uncompressed-length marker.
    round_trip(10, 256);
    // Above the threshold: the body is actually deflated.
    round_trip(257, 256);
    round_trip(100_000, 256);
  }

  #[test]
  fn partial_frames_wait_for_more_data() {
    let mut p = Packet::new(1);
    p.write_u64(42);
    let wire = frame(p, -1);
    for split in 0..wire.len() {
      let mut partial = wire[..split].to_vec();
      assert!(deframe(&mut partial, -1).unwrap().is_none(), "split at {split}");
    }
  }

  #[test]
  fn two_frames_in_one_buffer() {
    let mut a = Packet::new(1);
    a.write_u8(1);
    let mut b = Packet::new(2);
    b.write_u8(2);
    let mut wire = frame(a, -1);
    wire.extend(frame(b, -1));
    let first = deframe(&mut wire, -1).unwrap().unwrap();
    assert_eq!(first.id(), 1);
    let second = deframe(&mut wire, -1).unwrap().unwrap();
    assert_eq!(second.id(), 2);
    assert!(deframe(&mut wire, -1).unwrap().is_none());
  }

  #[test]
  fn oversized_frame_is_rejected() {
    let mut wire = vec![];
    let mut buf = Buffer::new(&mut wire);
    buf.write_varint(MAX_PACKET_SIZE as i32 + 1);
    assert!(deframe(&mut wire, -1).is_err());
  }
}
