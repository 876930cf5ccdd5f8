use super::Module;
use crate::{
  packet::{sb, ProtocolState, PROTOCOL_VERSION},
  server::Server,
};
use std::sync::Arc;

/// Drives the one packet of the `Handshaking` state: the client announces
/// its protocol version and which state it wants next.
pub struct HandshakeModule;

impl Module for HandshakeModule {
  fn name(&self) -> &'static str { "Handshake Handler" }
  fn priority(&self) -> u32 { 2 }

  fn install(&self, server: &Arc<Server>) {
    server.router_mut().set(ProtocolState::Handshaking, 0x00, |_server, ev| {
      let sb::Packet::Handshake { protocol, next, .. } = ev.packet else { return };
      match ProtocolState::from_next(next) {
        Some(ProtocolState::Status) => ev.client.set_state(ProtocolState::Status),
        Some(ProtocolState::Login) => {
          // Move first, so a version mismatch disconnects with a proper
          // login-disconnect packet.
          ev.client.set_state(ProtocolState::Login);
          if protocol != PROTOCOL_VERSION {
            ev.client.disconnect(&format!(
              "this server speaks protocol {PROTOCOL_VERSION}, the client sent {protocol}"
            ));
          }
        }
        _ => ev.client.disconnect(&format!("cannot switch to state {next}")),
      }
    });
  }
}
