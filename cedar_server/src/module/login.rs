use super::Module;
use crate::{
  net::Client,
  packet::{cb, sb, ProtocolState},
  server::Server,
  Error, Result,
};
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng, RngCore};
use rsa::Pkcs1v15Encrypt;
use std::sync::Arc;

/// Drives authentication: login start, the encryption round-trip, and the
/// switch to `Play`.
pub struct LoginModule;

impl Module for LoginModule {
  fn name(&self) -> &'static str { "Login Handler" }
  fn priority(&self) -> u32 { 2 }

  fn install(&self, server: &Arc<Server>) {
    let mut router = server.router_mut();

    router.set(ProtocolState::Login, 0x00, |server, ev| {
      let sb::Packet::LoginStart { username } = &ev.packet else { return };
      if ev.client.username().is_some() {
        ev.client.disconnect("client sent two login packets");
        return;
      }
      ev.client.set_username(username.clone());

      // Make sure to actually generate a token
      let mut token = [0u8; 16];
      OsRng.fill_bytes(&mut token);
      *ev.client.verify_token.lock() = Some(token);
      let server_id: String = (0..20).map(|_| OsRng.sample(Alphanumeric) as char).collect();

      ev.client.send(cb::Packet::EncryptionRequest {
        server_id,
        public_key: server.public_key_der().to_vec(),
        verify_token: token.to_vec(),
      });
      // Wait for the encryption response to enable encryption.
    });

    router.set(ProtocolState::Login, 0x01, |server, ev| {
      let sb::Packet::EncryptionResponse { secret, token } = &ev.packet else { return };
      match finish_login(server, &ev.client, secret, token) {
        Ok(()) => server.events().fire_login(&ev.client),
        Err(e) => {
          warn!("login failed for {:?}: {e}", ev.client.addr());
          ev.client.disconnect(&e.to_string());
        }
      }
    });
  }
}

fn finish_login(
  server: &Arc<Server>,
  client: &Arc<Client>,
  secret: &[u8],
  token: &[u8],
) -> Result<()> {
  let Some(username) = client.username() else {
    return Err(Error::BadFrame("encryption response before login start"));
  };
  let expected = client
    .verify_token
    .lock()
    .take()
    .ok_or(Error::BadFrame("encryption response before encryption request"))?;

  let key = server.private_key();
  let decrypted_token = key
    .decrypt(Pkcs1v15Encrypt, token)
    .map_err(|e| Error::Decrypt { what: "verify token", source: e })?;
  if decrypted_token != expected {
    return Err(Error::BadVerifyToken);
  }
  let decrypted_secret = key
    .decrypt(Pkcs1v15Encrypt, secret)
    .map_err(|e| Error::Decrypt { what: "shared secret", source: e })?;
  let len = decrypted_secret.len();
  let secret: [u8; 16] = decrypted_secret.try_into().map_err(|_| Error::BadSharedSecret(len))?;

  // The client's cipher is live as soon as it sends the response, so ours
  // has to be before we queue anything else.
  client.enable_encryption(&secret);

  let threshold = server.settings().compression_threshold;
  if threshold > 0 {
    client.send(cb::Packet::SetCompression { threshold });
    client.set_compression(threshold);
  }

  let uuid = server.offline_uuid(&username);
  client.send(cb::Packet::LoginSuccess { uuid: uuid.as_dashed_str(), username: username.clone() });
  client.set_state(ProtocolState::Play);
  info!("{username} has joined the game");
  Ok(())
}
