//! Session tests: drive the protocol state machine through the router the
//! way the reactor would, and decode the outbound queue the way a client
//! would (decrypt, deframe, decompress).

use super::{conn::Client, WakeEvent};
use crate::{
  data::MemoryProvider,
  module::{HandshakeModule, KeepAliveModule, LoginModule, PlayModule, StatusModule},
  packet::{self, Packet, ProtocolState, PROTOCOL_VERSION},
  server::Server,
};
use aes::{
  cipher::{AsyncStreamCipher, NewCipher},
  Aes128,
};
use cfb8::Cfb8;
use crossbeam_channel::Receiver;
use mio::{Poll, Token, Waker};
use rand::rngs::OsRng;
use rsa::Pkcs1v15Encrypt;
use std::sync::Arc;

fn test_server() -> Arc<Server> {
  let server = Server::new(Arc::new(MemoryProvider::new())).unwrap();
  server.add_module(HandshakeModule);
  server.add_module(StatusModule);
  server.add_module(LoginModule);
  server.add_module(KeepAliveModule);
  server.add_module(PlayModule);
  server.install();
  server
}

/// A fake connection: a real `Client`, plus the client's half of the wire
/// (its own cipher and compression state) so we can check what it would
/// actually decode.
struct Harness {
  client:      Arc<Client>,
  // The poll must outlive the waker, so it sits here even though no one
  // polls it.
  _poll:       Poll,
  _wake_rx:    Receiver<WakeEvent>,
  cipher:      Option<Cfb8<Aes128>>,
  compression: i32,
}

impl Harness {
  fn new(server: &Arc<Server>) -> Self {
    let poll = Poll::new().unwrap();
    let waker = Arc::new(Waker::new(poll.registry(), Token(0)).unwrap());
    let (tx, rx) = crossbeam_channel::unbounded();
    let addr = "127.0.0.1:54321".parse().unwrap();
    let client = Arc::new(Client::new(Token(1), addr, server.next_eid(), tx, waker));
    Harness { client, _poll: poll, _wake_rx: rx, cipher: None, compression: -1 }
  }

  /// Hands a serverbound packet to the router, exactly as the read path
  /// does.
  fn dispatch(&self, server: &Arc<Server>, id: u8, write: impl FnOnce(&mut Packet)) {
    let mut p = Packet::new(id);
    write(&mut p);
    let p = Packet::from_buf(p.serialize()).unwrap();
    server.router().dispatch(server, &self.client, p).unwrap();
  }

  /// Pops everything the server queued and decodes it client-side. Frames
  /// are decoded with the compression/encryption state the client would
  /// have at that point, including mid-stream switches.
  fn read_outbound(&mut self) -> Vec<Packet> {
    let mut stream = vec![];
    while let Some(handle) = self.client.front_send() {
      stream.extend_from_slice(handle.data());
      self.client.pop_send();
    }
    if let Some(c) = &mut self.cipher {
      c.decrypt(&mut stream);
    }
    let mut out = vec![];
    while let Some(p) = packet::deframe(&mut stream, self.compression).unwrap() {
      // A real client switches codecs when set-compression arrives during
      // login: encrypted, compression still off. Mirror that here so the
      // frames behind it decode correctly.
      if p.id() == 0x03 && self.compression < 0 && self.cipher.is_some() {
        let mut p = p;
        self.compression = p.read_varint().unwrap();
        continue;
      }
      out.push(p);
    }
    assert!(stream.is_empty(), "trailing bytes after the last frame");
    out
  }
}

#[test]
fn status_ping() {
  let server = test_server();
  let mut h = Harness::new(&server);

  h.dispatch(&server, 0x00, |p| {
    p.write_varint(PROTOCOL_VERSION);
    p.write_str("localhost");
    p.write_u16(25565);
    p.write_varint(1);
  });
  assert_eq!(h.client.state(), ProtocolState::Status);

  h.dispatch(&server, 0x00, |_| {});
  h.dispatch(&server, 0x01, |p| p.write_i64(42));

  let packets = h.read_outbound();
  assert_eq!(packets.len(), 2);

  let mut response = packets.into_iter().next().unwrap();
  assert_eq!(response.id(), 0x00);
  let json = response.read_str(32767).unwrap();
  let doc: serde_json::Value = serde_json::from_str(&json).unwrap();
  assert_eq!(doc["players"]["max"], server.settings().max_players);
  assert_eq!(doc["version"]["protocol"], PROTOCOL_VERSION);

  // The pong echoes our payload, and the session is closing afterwards.
  let mut h2 = Harness::new(&server);
  h2.client.set_state(ProtocolState::Status);
  h2.dispatch(&server, 0x01, |p| p.write_i64(42));
  let mut pong = h2.read_outbound().into_iter().next().unwrap();
  assert_eq!(pong.id(), 0x01);
  assert_eq!(pong.read_i64().unwrap(), 42);
  assert!(h2.client.closing());
}

#[test]
fn handshake_to_play() {
  let server = test_server();
  let mut h = Harness::new(&server);

  let logins = Arc::new(parking_lot::Mutex::new(vec![]));
  let l = logins.clone();
  server.events().on_login(move |client| l.lock().push(client.eid()));

  h.dispatch(&server, 0x00, |p| {
    p.write_varint(PROTOCOL_VERSION);
    p.write_str("localhost");
    p.write_u16(25565);
    p.write_varint(2);
  });
  assert_eq!(h.client.state(), ProtocolState::Login);

  h.dispatch(&server, 0x00, |p| p.write_str("Alice"));
  let mut request = h.read_outbound().into_iter().next().unwrap();
  assert_eq!(request.id(), 0x01);
  let server_id = request.read_str(20).unwrap();
  assert_eq!(server_id.len(), 20);
  let key_len = request.read_varint().unwrap();
  let der = request.read_buf(key_len as usize).unwrap();
  assert!(!der.is_empty());
  let token_len = request.read_varint().unwrap();
  let token = request.read_buf(token_len as usize).unwrap();
  assert_eq!(token.len(), 16);

  // Encrypt the shared secret (16 zero bytes) and the echoed token against
  // the server's public key, like a real client.
  let secret = [0u8; 16];
  let public = server.private_key().to_public_key();
  let enc_secret = public.encrypt(&mut OsRng, Pkcs1v15Encrypt, &secret).unwrap();
  let enc_token = public.encrypt(&mut OsRng, Pkcs1v15Encrypt, &token).unwrap();
  h.dispatch(&server, 0x01, |p| {
    p.write_varint(enc_secret.len() as i32);
    p.write_buf(&enc_secret);
    p.write_varint(enc_token.len() as i32);
    p.write_buf(&enc_token);
  });

  // Everything from here on is encrypted with the shared secret.
  h.cipher = Some(Cfb8::new_from_slices(&secret, &secret).unwrap());
  assert!(h.client.encryption_enabled());

  let packets = h.read_outbound();
  // The set-compression frame was consumed by the harness, leaving login
  // success.
  assert_eq!(h.compression, server.settings().compression_threshold);
  let mut success = packets.into_iter().next().unwrap();
  assert_eq!(success.id(), 0x02);
  let uuid = success.read_str(36).unwrap();
  assert_eq!(uuid.split('-').count(), 5);
  assert_eq!(success.read_str(16).unwrap(), "Alice");

  assert_eq!(h.client.state(), ProtocolState::Play);
  assert_eq!(*logins.lock(), vec![h.client.eid()]);

  // And the keep-alive round trip works in Play.
  assert!(h.client.begin_keep_alive(77));
  h.dispatch(&server, 0x00, |p| p.write_varint(77));
  assert!(h.client.keep_alive_outstanding().is_none());
}

#[test]
fn bad_verify_token_disconnects() {
  let server = test_server();
  let mut h = Harness::new(&server);
  h.client.set_state(ProtocolState::Login);
  h.dispatch(&server, 0x00, |p| p.write_str("Mallory"));
  let _ = h.read_outbound();

  let public = server.private_key().to_public_key();
  let enc_secret = public.encrypt(&mut OsRng, Pkcs1v15Encrypt, &[0u8; 16]).unwrap();
  let enc_token = public.encrypt(&mut OsRng, Pkcs1v15Encrypt, b"not the real one").unwrap();
  h.dispatch(&server, 0x01, |p| {
    p.write_varint(enc_secret.len() as i32);
    p.write_buf(&enc_secret);
    p.write_varint(enc_token.len() as i32);
    p.write_buf(&enc_token);
  });
  assert!(h.client.closing());
  assert_ne!(h.client.state(), ProtocolState::Play);
}

#[test]
fn unexpected_packet_is_fatal() {
  let server = test_server();
  let h = Harness::new(&server);
  // A play packet during handshaking doesn't parse.
  let mut p = Packet::new(0x04);
  p.write_f64(0.0);
  p.write_f64(64.0);
  p.write_f64(0.0);
  p.write_bool(true);
  let p = Packet::from_buf(p.serialize()).unwrap();
  assert!(server.router().dispatch(&server, &h.client, p).is_err());
}

#[test]
fn uuid_is_dashed_and_stable() {
  let server = test_server();
  let uuid = server.offline_uuid("Alice").as_dashed_str();
  assert_eq!(uuid.split('-').count(), 5);
}
