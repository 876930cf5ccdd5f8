use super::Module;
use crate::{
  packet::{cb, sb, ProtocolState},
  server::Server,
};
use std::sync::Arc;

/// Sends each playing client a random keep-alive token on an interval, and
/// disconnects clients that don't echo it back within the timeout.
pub struct KeepAliveModule;

impl Module for KeepAliveModule {
  fn name(&self) -> &'static str { "Keep Alive" }
  fn priority(&self) -> u32 { 3 }

  fn install(&self, server: &Arc<Server>) {
    server.router_mut().set(ProtocolState::Play, 0x00, |_server, ev| {
      let sb::Packet::KeepAlive { id } = ev.packet else { return };
      ev.client.ack_keep_alive(id);
    });
    schedule(server);
  }
}

fn schedule(server: &Arc<Server>) {
  let s = server.clone();
  server.pool().spawn_after(server.settings().keep_alive_interval, move || {
    if s.is_shutdown() {
      return;
    }
    tick(&s);
    schedule(&s);
  });
}

fn tick(server: &Arc<Server>) {
  let timeout = server.settings().keep_alive_timeout;
  for client in server.net().clients() {
    if client.state() != ProtocolState::Play || client.closing() {
      continue;
    }
    if let Some(outstanding) = client.keep_alive_outstanding() {
      if outstanding > timeout {
        info!("{:?} timed out", client.username().unwrap_or_default());
        client.disconnect("keep-alive timed out");
      }
      continue;
    }
    let id: i32 = rand::random();
    if client.begin_keep_alive(id) {
      client.send(cb::Packet::KeepAlive { id });
    }
  }
}
