//! Connection-level event buses.
//!
//! Modules register hooks here during install; the core fires them at the
//! right spots. Block-set hooks live on the [`World`](crate::world::World)
//! instead, next to the data they guard.

use crate::net::Client;
use parking_lot::RwLock;
use std::{net::SocketAddr, sync::Arc};

type AcceptHook = Box<dyn Fn(&SocketAddr) -> bool + Send + Sync>;
type ClientHook = Box<dyn Fn(&Arc<Client>) + Send + Sync>;
type DisconnectHook = Box<dyn Fn(&Arc<Client>, &str) + Send + Sync>;
type ShutdownHook = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct Events {
  on_accept:     RwLock<Vec<AcceptHook>>,
  on_connect:    RwLock<Vec<ClientHook>>,
  on_login:      RwLock<Vec<ClientHook>>,
  on_disconnect: RwLock<Vec<DisconnectHook>>,
  on_shutdown:   RwLock<Vec<(u32, ShutdownHook)>>,
}

impl Events {
  pub fn new() -> Self { Events::default() }

  /// Registers an accept filter. Any filter returning `false` rejects the
  /// connection before a session exists.
  pub fn on_accept(&self, hook: impl Fn(&SocketAddr) -> bool + Send + Sync + 'static) {
    self.on_accept.write().push(Box::new(hook));
  }
  /// Fires after a session is created. Runs on the pool.
  pub fn on_connect(&self, hook: impl Fn(&Arc<Client>) + Send + Sync + 'static) {
    self.on_connect.write().push(Box::new(hook));
  }
  /// Fires when a session finishes login and enters Play.
  pub fn on_login(&self, hook: impl Fn(&Arc<Client>) + Send + Sync + 'static) {
    self.on_login.write().push(Box::new(hook));
  }
  /// Fires once per session, after its socket is fully closed.
  pub fn on_disconnect(&self, hook: impl Fn(&Arc<Client>, &str) + Send + Sync + 'static) {
    self.on_disconnect.write().push(Box::new(hook));
  }
  /// Registers a shutdown hook with the module's priority. Hooks fire in
  /// reverse priority order (highest first), the opposite of install order.
  pub fn on_shutdown(&self, priority: u32, hook: impl Fn() + Send + Sync + 'static) {
    self.on_shutdown.write().push((priority, Box::new(hook)));
  }

  pub(crate) fn allow_accept(&self, addr: &SocketAddr) -> bool {
    self.on_accept.read().iter().all(|hook| hook(addr))
  }
  pub(crate) fn fire_connect(&self, client: &Arc<Client>) {
    for hook in self.on_connect.read().iter() {
      hook(client);
    }
  }
  pub(crate) fn fire_login(&self, client: &Arc<Client>) {
    for hook in self.on_login.read().iter() {
      hook(client);
    }
  }
  pub(crate) fn fire_disconnect(&self, client: &Arc<Client>, reason: &str) {
    for hook in self.on_disconnect.read().iter() {
      hook(client, reason);
    }
  }
  pub(crate) fn fire_shutdown(&self) {
    let mut lock = self.on_shutdown.write();
    lock.sort_by(|a, b| b.0.cmp(&a.0));
    for (_, hook) in lock.iter() {
      hook();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;

  #[test]
  fn accept_filters_veto() {
    let events = Events::new();
    let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
    assert!(events.allow_accept(&addr));
    events.on_accept(|_| true);
    assert!(events.allow_accept(&addr));
    events.on_accept(|a| a.port() != 1);
    assert!(!events.allow_accept(&addr));
  }

  #[test]
  fn shutdown_fires_in_reverse_priority() {
    let events = Events::new();
    let order = Arc::new(Mutex::new(vec![]));
    for (priority, name) in [(1, "core"), (50, "world"), (10, "net")] {
      let order = order.clone();
      events.on_shutdown(priority, move || order.lock().push(name));
    }
    events.fire_shutdown();
    assert_eq!(*order.lock(), vec!["world", "net", "core"]);
  }
}
