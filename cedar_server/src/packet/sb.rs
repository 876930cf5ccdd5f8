//! Serverbound packets, one variant per (state, id) pair the server
//! understands.

use super::{Packet as Tcp, ProtocolState};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
  // Handshaking
  Handshake { protocol: i32, address: String, port: u16, next: i32 },

  // Status
  StatusRequest,
  Ping { payload: i64 },

  // Login
  LoginStart { username: String },
  EncryptionResponse { secret: Vec<u8>, token: Vec<u8> },

  // Play
  KeepAlive { id: i32 },
  ChatMessage { message: String },
  PlayerPosition { x: f64, y: f64, z: f64, on_ground: bool },
}

impl Packet {
  /// Decodes the payload of `p` according to the session state it arrived in.
  /// An id with no meaning in that state is an error, and should kill the
  /// connection.
  pub fn parse(state: ProtocolState, mut p: Tcp) -> Result<Self> {
    Ok(match (state, p.id()) {
      (ProtocolState::Handshaking, 0x00) => Packet::Handshake {
        protocol: p.read_varint()?,
        // Max length according to vanilla.
        address:  p.read_str(255)?,
        port:     p.read_u16()?,
        next:     p.read_varint()?,
      },

      (ProtocolState::Status, 0x00) => Packet::StatusRequest,
      (ProtocolState::Status, 0x01) => Packet::Ping { payload: p.read_i64()? },

      (ProtocolState::Login, 0x00) => Packet::LoginStart { username: p.read_str(16)? },
      (ProtocolState::Login, 0x01) => {
        let len = p.read_varint()?;
        let secret = p.read_buf(len_checked(len)?)?;
        let len = p.read_varint()?;
        let token = p.read_buf(len_checked(len)?)?;
        Packet::EncryptionResponse { secret, token }
      }

      (ProtocolState::Play, 0x00) => Packet::KeepAlive { id: p.read_varint()? },
      (ProtocolState::Play, 0x01) => Packet::ChatMessage { message: p.read_str(256)? },
      (ProtocolState::Play, 0x04) => Packet::PlayerPosition {
        x:         p.read_f64()?,
        y:         p.read_f64()?,
        z:         p.read_f64()?,
        on_ground: p.read_bool()?,
      },

      (state, id) => return Err(Error::UnexpectedPacket { state, id }),
    })
  }
}

fn len_checked(len: i32) -> Result<usize> {
  // An RSA-1024 ciphertext is 128 bytes; anything much bigger is garbage.
  if (0..=512).contains(&len) {
    Ok(len as usize)
  } else {
    Err(Error::BadFrame("encrypted blob has unreasonable length"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tcp(id: u8, write: impl FnOnce(&mut Tcp)) -> Tcp {
    let mut p = Tcp::new(id);
    write(&mut p);
    Tcp::from_buf(p.serialize()).unwrap()
  }

  #[test]
  fn parse_handshake() {
    let p = tcp(0x00, |p| {
      p.write_varint(47);
      p.write_str("localhost");
      p.write_u16(25565);
      p.write_varint(2);
    });
    let parsed = Packet::parse(ProtocolState::Handshaking, p).unwrap();
    assert_eq!(
      parsed,
      Packet::Handshake { protocol: 47, address: "localhost".into(), port: 25565, next: 2 }
    );
  }

  #[test]
  fn parse_login_start() {
    let p = tcp(0x00, |p| p.write_str("Alice"));
    let parsed = Packet::parse(ProtocolState::Login, p).unwrap();
    assert_eq!(parsed, Packet::LoginStart { username: "Alice".into() });
  }

  #[test]
  fn id_is_state_dependent() {
    // 0x01 is a ping in Status, but an encryption response in Login.
    let p = tcp(0x01, |p| p.write_i64(42));
    assert_eq!(
      Packet::parse(ProtocolState::Status, p).unwrap(),
      Packet::Ping { payload: 42 }
    );
    let p = tcp(0x05, |_| {});
    assert!(matches!(
      Packet::parse(ProtocolState::Status, p),
      Err(Error::UnexpectedPacket { state: ProtocolState::Status, id: 0x05 })
    ));
  }
}
