//! The server object: one value that owns the pool, the connection handler,
//! the world, the provider, and the module registry. There are no globals;
//! modules get the server passed into `install`.

use crate::{
  config::Settings,
  data::{DataProvider, LogLevel},
  event::Events,
  module::Module,
  net::{crypto, ConnectionHandler, PacketRouter},
  packet::{cb, status, ProtocolState, PROTOCOL_VERSION, VERSION_NAME},
  world::{PacketSink, World},
  Error, Result,
};
use base64::Engine;
use cedar_common::util::{ThreadPool, UUID};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use rsa::RsaPrivateKey;
use std::sync::{
  atomic::{AtomicBool, AtomicI32, Ordering},
  Arc,
};

pub struct Server {
  settings: Settings,
  data:     Arc<dyn DataProvider>,
  pool:     Arc<ThreadPool>,
  net:      Arc<ConnectionHandler>,
  world:    Arc<World>,
  router:   RwLock<PacketRouter>,
  events:   Events,
  modules:  Mutex<Vec<Arc<dyn Module>>>,

  key:            RsaPrivateKey,
  public_key_der: Vec<u8>,
  favicon:        Option<String>,

  eids:      AtomicI32,
  installed: AtomicBool,
  stopping:  AtomicBool,
}

impl Server {
  pub fn new(data: Arc<dyn DataProvider>) -> Result<Arc<Self>> {
    let settings = Settings::load(&*data);
    let pool = Arc::new(ThreadPool::new("server", settings.num_threads));
    let net = Arc::new(ConnectionHandler::new()?);
    let world =
      World::new(data.clone(), pool.clone(), settings.seed, settings.world_type.clone());
    let key = crypto::generate_key().map_err(Error::KeyGen)?;
    let public_key_der = crypto::encode_public_key(&key);
    let favicon = settings.favicon.as_ref().and_then(|path| match std::fs::read(path) {
      Ok(png) => Some(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(png)
      )),
      Err(e) => {
        warn!("could not read favicon {path}: {e}");
        None
      }
    });

    let server = Arc::new(Server {
      settings,
      data,
      pool,
      net,
      world,
      // Packets nobody routes are ignored; bad packets for the state are
      // still fatal in the decoder.
      router: RwLock::new(PacketRouter::new(true)),
      events: Events::new(),
      modules: Mutex::new(vec![]),
      key,
      public_key_der,
      favicon,
      // All players think they are EID 1, so server-assigned ids start
      // above that. EID 0 is invalid.
      eids: AtomicI32::new(2),
      installed: AtomicBool::new(false),
      stopping: AtomicBool::new(false),
    });
    server.world.set_sink(server.net.clone());
    Ok(server)
  }

  pub fn settings(&self) -> &Settings { &self.settings }
  pub fn data(&self) -> &Arc<dyn DataProvider> { &self.data }
  pub fn pool(&self) -> &Arc<ThreadPool> { &self.pool }
  pub fn net(&self) -> &Arc<ConnectionHandler> { &self.net }
  pub fn world(&self) -> &Arc<World> { &self.world }
  pub fn events(&self) -> &Events { &self.events }
  pub fn private_key(&self) -> &RsaPrivateKey { &self.key }
  pub fn public_key_der(&self) -> &[u8] { &self.public_key_der }

  pub fn router(&self) -> RwLockReadGuard<'_, PacketRouter> { self.router.read() }
  /// Routes may only be changed during module install.
  pub fn router_mut(&self) -> RwLockWriteGuard<'_, PacketRouter> { self.router.write() }

  /// Returns a new, unique entity id.
  pub fn next_eid(&self) -> i32 { self.eids.fetch_add(1, Ordering::SeqCst) }

  /// The uuid for a username when there is no authentication service: an md5
  /// of the name, so it is stable across sessions.
  pub fn offline_uuid(&self, username: &str) -> UUID {
    UUID::from_be_bytes(*md5::compute(username.as_bytes()))
  }

  pub fn add_module(&self, module: impl Module + 'static) {
    self.modules.lock().push(Arc::new(module));
  }

  /// Installs every registered module, lowest priority first. Idempotent.
  pub fn install(self: &Arc<Self>) {
    if self.installed.swap(true, Ordering::SeqCst) {
      return;
    }
    let mut modules = self.modules.lock().clone();
    modules.sort_by_key(|m| m.priority());
    for module in &modules {
      info!("installing {} (priority {})", module.name(), module.priority());
      module.install(self);
    }
    self
      .data
      .write_log(&format!("{} installed {} modules", self.settings.server_id, modules.len()),
        LogLevel::Info);
  }

  /// Installs modules, starts the periodic tasks, and runs the connection
  /// handler. Blocks until [`shutdown`](Self::shutdown); on the way out it
  /// fires shutdown hooks, saves the world, and tears down the pool.
  pub fn run(self: &Arc<Self>) -> Result<()> {
    self.install();
    self.schedule_maintenance();
    self.schedule_save();

    let res = self.net.run(self);

    info!("running shutdown hooks");
    self.events.fire_shutdown();
    self.world.save_all();
    self.data.write_log("server stopped", LogLevel::Info);
    self.pool.shutdown();
    res
  }

  /// Asks the server to stop. Safe to call from any thread (including a
  /// signal handler); the actual teardown happens on the thread inside
  /// [`run`](Self::run).
  pub fn shutdown(&self) {
    if self.stopping.swap(true, Ordering::SeqCst) {
      return;
    }
    info!("shutting down");
    self.net.stop();
  }

  pub fn is_shutdown(&self) -> bool { self.stopping.load(Ordering::SeqCst) }

  fn schedule_maintenance(self: &Arc<Self>) {
    let s = self.clone();
    self.pool.spawn_after(self.settings.maintenance_interval, move || {
      if s.is_shutdown() {
        return;
      }
      s.world.maintain();
      s.schedule_maintenance();
    });
  }

  fn schedule_save(self: &Arc<Self>) {
    let s = self.clone();
    self.pool.spawn_after(self.settings.save_frequency, move || {
      if s.is_shutdown() {
        return;
      }
      s.world.save_all();
      s.schedule_save();
    });
  }

  /// Builds the json document served to server-list pings.
  pub fn build_status(&self) -> status::JsonStatus {
    let playing: Vec<_> =
      self.net.clients().into_iter().filter(|c| c.state() == ProtocolState::Play).collect();
    status::JsonStatus {
      version:     status::JsonVersion { name: VERSION_NAME.into(), protocol: PROTOCOL_VERSION },
      players:     status::JsonPlayers {
        max:    self.settings.max_players,
        online: playing.len() as i32,
        sample: playing
          .iter()
          .filter_map(|c| {
            let name = c.username()?;
            let id = self.offline_uuid(&name).as_dashed_str();
            Some(status::JsonPlayer { name, id })
          })
          .collect(),
      },
      description: status::JsonDescription { text: self.settings.motd.clone() },
      favicon:     self.favicon.clone(),
    }
  }

  #[cfg(not(target_family = "unix"))]
  pub fn stop_on_ctrlc(self: &Arc<Self>) {}
  #[cfg(target_family = "unix")]
  pub fn stop_on_ctrlc(self: &Arc<Self>) {
    use parking_lot::lock_api::RawMutex;

    static CTRLC: Mutex<Option<Arc<Server>>> =
      Mutex::const_new(parking_lot::RawMutex::INIT, None);

    let mut lock = CTRLC.lock();
    if lock.is_some() {
      panic!("cannot stop this server on ctrlc, as another server is already registered");
    }
    *lock = Some(self.clone());

    use nix::{
      libc,
      sys::signal::{signal, SigHandler, Signal},
    };

    extern "C" fn handle_sigint(_sig: libc::c_int) {
      let lock = CTRLC.lock();
      println!();
      if let Some(server) = &*lock {
        server.shutdown();
      }
    }

    let handler = SigHandler::Handler(handle_sigint);
    unsafe { signal(Signal::SIGINT, handler) }.unwrap();
  }
}

impl PacketSink for ConnectionHandler {
  fn send_to(&self, eid: i32, p: cb::Packet) {
    if let Some(client) = self.client_by_eid(eid) {
      client.send(p);
    }
  }
}
