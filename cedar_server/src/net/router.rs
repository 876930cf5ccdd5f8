use super::conn::Client;
use crate::{
  packet::{sb, Packet, ProtocolState},
  server::Server,
  Error, Result,
};
use std::sync::Arc;

/// What a handler receives: the session the packet arrived on, and the parsed
/// packet.
pub struct ReceiveEvent {
  pub client: Arc<Client>,
  pub packet: sb::Packet,
}

pub type Handler = Box<dyn Fn(&Arc<Server>, ReceiveEvent) + Send + Sync>;

/// Routes incoming packets to handlers by `(state, id)`.
///
/// Routes are installed while modules load and are read-only afterwards.
/// Handlers run on the pool thread that read the packet, while the
/// connection's read lock is held, so packets from one connection are handled
/// strictly in arrival order. Different connections run concurrently.
pub struct PacketRouter {
  routes:           Vec<Option<Handler>>,
  /// When false, a packet with no installed handler kills the connection.
  ignore_unhandled: bool,
}

const STATES: usize = 4;
const IDS: usize = 256;

impl PacketRouter {
  pub fn new(ignore_unhandled: bool) -> Self {
    PacketRouter { routes: (0..STATES * IDS).map(|_| None).collect(), ignore_unhandled }
  }

  fn index(state: ProtocolState, id: u8) -> usize { state.index() * IDS + id as usize }

  /// Installs a handler. Replaces whatever was there, so load order between
  /// modules matters.
  pub fn set(
    &mut self,
    state: ProtocolState,
    id: u8,
    handler: impl Fn(&Arc<Server>, ReceiveEvent) + Send + Sync + 'static,
  ) {
    self.routes[Self::index(state, id)] = Some(Box::new(handler));
  }

  pub fn has_route(&self, state: ProtocolState, id: u8) -> bool {
    self.routes[Self::index(state, id)].is_some()
  }

  /// Decodes and dispatches one raw packet. Errors kill the connection.
  pub fn dispatch(&self, server: &Arc<Server>, client: &Arc<Client>, p: Packet) -> Result<()> {
    let state = client.state();
    let id = p.id();
    let packet = sb::Packet::parse(state, p)?;
    match &self.routes[Self::index(state, id)] {
      Some(handler) => {
        handler(server, ReceiveEvent { client: client.clone(), packet });
        Ok(())
      }
      None if self.ignore_unhandled => {
        debug!("packet {id:#04x} in state {state:?} has no recognized handler");
        Ok(())
      }
      None => Err(Error::UnexpectedPacket { state, id }),
    }
  }
}
