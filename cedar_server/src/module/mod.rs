//! The module system.
//!
//! Everything that reacts to packets or events, including the protocol state
//! machine itself, is a module: a small capability that installs its routes
//! and hooks into the server. Modules install in ascending priority order
//! (lower first); shutdown hooks fire in reverse.

mod handshake;
mod keep_alive;
mod login;
mod play;
mod status;
mod terrain;

pub use handshake::HandshakeModule;
pub use keep_alive::KeepAliveModule;
pub use login::LoginModule;
pub use play::PlayModule;
pub use status::StatusModule;
pub use terrain::TerrainModule;

use crate::server::Server;
use std::sync::Arc;

pub trait Module: Send + Sync {
  fn name(&self) -> &'static str;
  /// Lower priorities install first.
  fn priority(&self) -> u32 { 100 }
  /// Registers routes and hooks. Called exactly once, before the server
  /// starts accepting connections.
  fn install(&self, server: &Arc<Server>);
}
