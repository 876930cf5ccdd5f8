use super::Module;
use crate::{
  packet::{cb, sb, ProtocolState},
  server::Server,
};
use std::sync::Arc;

/// Answers server-list pings: a json status document, then a pong echo,
/// after which the client is dropped (the status state never advances).
pub struct StatusModule;

impl Module for StatusModule {
  fn name(&self) -> &'static str { "Status Handler" }
  fn priority(&self) -> u32 { 2 }

  fn install(&self, server: &Arc<Server>) {
    let mut router = server.router_mut();
    router.set(ProtocolState::Status, 0x00, |server, ev| {
      let status = server.build_status();
      ev.client.send(cb::Packet::StatusResponse {
        json: serde_json::to_string(&status).unwrap(),
      });
    });
    router.set(ProtocolState::Status, 0x01, |_server, ev| {
      let sb::Packet::Ping { payload } = ev.packet else { return };
      ev.client.send(cb::Packet::Pong { payload });
      // The client has everything it asked for.
      ev.client.disconnect("status complete");
    });
  }
}
