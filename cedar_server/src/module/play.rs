use super::Module;
use crate::{
  packet::{cb, sb, ProtocolState},
  server::Server,
};
use cedar_common::math::{BlockId, ColumnId};
use std::sync::Arc;

/// The gameplay routes: chat relay and position-driven column
/// subscriptions, plus cleanup of a session's subscriptions when it dies.
pub struct PlayModule;

impl Module for PlayModule {
  fn name(&self) -> &'static str { "Play Handler" }
  fn priority(&self) -> u32 { 3 }

  fn install(&self, server: &Arc<Server>) {
    {
      let mut router = server.router_mut();

      router.set(ProtocolState::Play, 0x01, |server, ev| {
        let sb::Packet::ChatMessage { message } = &ev.packet else { return };
        let Some(name) = ev.client.username() else { return };
        server.data().write_chat_log(&name, "*", message, "");
        let json = serde_json::json!({ "text": format!("<{name}> {message}") }).to_string();
        for other in server.net().clients() {
          if other.state() == ProtocolState::Play {
            other.send(cb::Packet::ChatMessage { json: json.clone() });
          }
        }
      });

      router.set(ProtocolState::Play, 0x04, |server, ev| {
        let sb::Packet::PlayerPosition { x, y, z, .. } = ev.packet else { return };
        ev.client.set_position((x, y, z));
        let col = ColumnId::containing(BlockId::new(x.floor() as i32, 0, z.floor() as i32, 0));
        // Subscribing may generate terrain, which is too slow to do while
        // holding up this connection's packet stream.
        let world = server.world().clone();
        let eid = ev.client.eid();
        server.pool().spawn(move || {
          if let Err(e) = world.subscribe(eid, col) {
            warn!("could not subscribe client {eid} to {col}: {e}");
          }
        });
      });
    }

    // A dead session silently drops everything it was subscribed to.
    let world = server.world().clone();
    server.events().on_disconnect(move |client, _reason| {
      world.unsubscribe_all(client.eid(), true);
    });
  }
}
