//! Clientbound packets.

use super::Packet as Tcp;
use cedar_common::{
  chunk::{Block, Column},
  math::{BlockId, ColumnId},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
  // Status
  StatusResponse { json: String },
  Pong { payload: i64 },

  // Login
  LoginDisconnect { reason: String },
  EncryptionRequest { server_id: String, public_key: Vec<u8>, verify_token: Vec<u8> },
  LoginSuccess { uuid: String, username: String },
  SetCompression { threshold: i32 },

  // Play
  KeepAlive { id: i32 },
  ChatMessage { json: String },
  ColumnData { column: ColumnId, data: Vec<u8> },
  UnloadColumn { column: ColumnId },
  BlockChange { block: BlockId, ty: u16, meta: u8 },
  Disconnect { reason: String },
}

impl Packet {
  pub fn id(&self) -> u8 {
    match self {
      Packet::StatusResponse { .. } => 0x00,
      Packet::Pong { .. } => 0x01,
      Packet::LoginDisconnect { .. } => 0x00,
      Packet::EncryptionRequest { .. } => 0x01,
      Packet::LoginSuccess { .. } => 0x02,
      Packet::SetCompression { .. } => 0x03,
      Packet::KeepAlive { .. } => 0x00,
      Packet::ChatMessage { .. } => 0x02,
      Packet::ColumnData { .. } => 0x21,
      Packet::UnloadColumn { .. } => 0x21,
      Packet::BlockChange { .. } => 0x23,
      Packet::Disconnect { .. } => 0x40,
    }
  }

  pub fn to_tcp(&self) -> Tcp {
    let mut p = Tcp::new(self.id());
    match self {
      Packet::StatusResponse { json } => p.write_str(json),
      Packet::Pong { payload } => p.write_i64(*payload),
      Packet::LoginDisconnect { reason } | Packet::Disconnect { reason } => {
        p.write_str(&chat_json(reason))
      }
      Packet::EncryptionRequest { server_id, public_key, verify_token } => {
        p.write_str(server_id);
        p.write_varint(public_key.len() as i32);
        p.write_buf(public_key);
        p.write_varint(verify_token.len() as i32);
        p.write_buf(verify_token);
      }
      Packet::LoginSuccess { uuid, username } => {
        p.write_str(uuid);
        p.write_str(username);
      }
      Packet::SetCompression { threshold } => p.write_varint(*threshold),
      Packet::KeepAlive { id } => p.write_varint(*id),
      Packet::ChatMessage { json } => {
        p.write_str(json);
        p.write_u8(0); // chat position
      }
      Packet::ColumnData { column, data } => {
        p.write_i32(column.x);
        p.write_i32(column.z);
        p.write_bool(true); // ground-up continuous
        p.write_u16(0xffff); // every section is present
        p.write_varint(data.len() as i32);
        p.write_buf(data);
      }
      // An empty continuous column data packet tells the client to forget the
      // column.
      Packet::UnloadColumn { column } => {
        p.write_i32(column.x);
        p.write_i32(column.z);
        p.write_bool(true);
        p.write_u16(0);
        p.write_varint(0);
      }
      Packet::BlockChange { block, ty, meta } => {
        p.write_u64(encode_position(block));
        p.write_varint(((*ty as i32) << 4) | (*meta as i32 & 15));
      }
    }
    p
  }
}

/// Wraps a plain message in the chat json the client expects.
fn chat_json(msg: &str) -> String {
  serde_json::json!({ "text": msg }).to_string()
}

/// The 1.8 packed block position: 26 bits of x, 12 bits of y, 26 bits of z.
fn encode_position(b: &BlockId) -> u64 {
  ((b.x as u64 & 0x3ffffff) << 38) | ((b.y as u64 & 0xfff) << 26) | (b.z as u64 & 0x3ffffff)
}

/// Serializes a full column in the chunk-data body format: a little-endian
/// `id << 4 | meta` word per block, then block light nibbles, then sky light
/// nibbles, then the biome array.
pub fn encode_column(col: &Column) -> Vec<u8> {
  let mut data = Vec::with_capacity(16 * 16 * 256 * 3 + 256);
  for y in 0..=255u8 {
    for z in 0..16 {
      for x in 0..16 {
        let b = col.block(x, y, z);
        let v = (b.id() << 4) | b.metadata() as u16;
        data.push(v as u8);
        data.push((v >> 8) as u8);
      }
    }
  }
  push_nibbles(&mut data, col, |b| b.light());
  push_nibbles(&mut data, col, |b| b.skylight());
  for z in 0..16 {
    for x in 0..16 {
      data.push(col.biome(x, z));
    }
  }
  data
}

fn push_nibbles(data: &mut Vec<u8>, col: &Column, get: impl Fn(Block) -> u8) {
  let mut pending = None;
  for y in 0..=255u8 {
    for z in 0..16 {
      for x in 0..16 {
        let v = get(col.block(x, y, z)) & 15;
        match pending.take() {
          None => pending = Some(v),
          Some(low) => data.push(low | (v << 4)),
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use cedar_common::util::Buffer;
  use pretty_assertions::assert_eq;

  #[test]
  fn position_packing() {
    let b = BlockId::new(5, 64, 5, 0);
    assert_eq!(encode_position(&b), (5 << 38) | (64 << 26) | 5);
    // Negative coordinates use the masked two's complement form.
    let b = BlockId::new(-1, 0, -1, 0);
    assert_eq!(encode_position(&b), (0x3ffffff << 38) | 0x3ffffff);
  }

  #[test]
  fn block_change_wire_format() {
    let p = Packet::BlockChange { block: BlockId::new(1, 2, 3, 0), ty: 1, meta: 0 };
    let body = p.to_tcp().serialize();
    let mut buf = Buffer::new(body);
    assert_eq!(buf.read_varint().unwrap(), 0x23);
    assert_eq!(buf.read_u64().unwrap(), (1 << 38) | (2 << 26) | 3);
    assert_eq!(buf.read_varint().unwrap(), 1 << 4);
  }

  #[test]
  fn column_body_layout() {
    let mut col = Column::new();
    let mut b = Block::new(1);
    b.set_metadata(2).set_light(7).set_skylight(15);
    col.set_block(0, 0, 0, b);
    col.set_biome(0, 0, 9);
    let data = encode_column(&col);
    assert_eq!(data.len(), 65536 * 2 + 32768 * 2 + 256);
    // First block word, little endian.
    assert_eq!(data[0], (1 << 4) | 2);
    assert_eq!(data[1], 0);
    // Block light nibbles sit after the block words.
    assert_eq!(data[65536 * 2], 7);
    assert_eq!(data[65536 * 2 + 32768], 15);
    // Biomes are the trailer.
    assert_eq!(data[65536 * 2 + 32768 * 2], 9);
  }
}
