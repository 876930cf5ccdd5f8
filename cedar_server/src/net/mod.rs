//! The connection handler.
//!
//! One dispatcher thread runs the mio poll loop. Socket readiness and wake
//! events are handed to the worker pool; per-connection state is guarded by a
//! mutex, so reads on one connection are serialized (which keeps packet
//! handling in arrival order) while different connections proceed in
//! parallel.

pub mod crypto;
pub mod router;
pub mod send;

mod conn;

#[cfg(test)]
mod tests;

pub use conn::Client;
pub use router::{PacketRouter, ReceiveEvent};
pub use send::{SendHandle, SendState};

use crate::{packet, server::Server, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use mio::{
  net::{TcpListener, TcpStream},
  Events, Interest, Poll, Token, Waker,
};
use parking_lot::{Mutex, RwLock};
use std::{
  collections::HashMap,
  io,
  io::{Read, Write},
  sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
  },
};

const WAKE: Token = Token(0xffff_fffe);
const LISTEN_BASE: usize = 0xffff_ff00;

#[derive(Debug)]
pub enum WakeEvent {
  /// A packet was queued for this connection; try to flush it.
  Flush(Token),
  /// The connection asked to close once its queue drains.
  Close(Token),
}

struct Connection {
  stream:  TcpStream,
  recv:    Vec<u8>,
  garbage: Vec<u8>,
  closed:  bool,
}

struct ConnEntry {
  conn:   Mutex<Connection>,
  client: Arc<Client>,
}

/// A snapshot of the handler's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStats {
  pub accepted:       u64,
  pub disconnected:   u64,
  pub bytes_sent:     u64,
  pub bytes_received: u64,
  pub listening:      usize,
  pub connected:      usize,
}

#[derive(Default)]
struct Counters {
  accepted:       AtomicU64,
  disconnected:   AtomicU64,
  bytes_sent:     AtomicU64,
  bytes_received: AtomicU64,
}

pub struct ConnectionHandler {
  connections: RwLock<HashMap<Token, Arc<ConnEntry>>>,
  poll:        Mutex<Option<Poll>>,
  waker:       Arc<Waker>,
  wake_tx:     Sender<WakeEvent>,
  wake_rx:     Receiver<WakeEvent>,
  counters:    Counters,
  listening:   AtomicUsize,
  running:     AtomicBool,
}

impl ConnectionHandler {
  pub fn new() -> io::Result<Self> {
    let poll = Poll::new()?;
    let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
    let (wake_tx, wake_rx) = crossbeam_channel::unbounded();
    Ok(ConnectionHandler {
      connections: RwLock::new(HashMap::new()),
      poll: Mutex::new(Some(poll)),
      waker,
      wake_tx,
      wake_rx,
      counters: Counters::default(),
      listening: AtomicUsize::new(0),
      running: AtomicBool::new(false),
    })
  }

  pub fn stats(&self) -> ConnectionStats {
    ConnectionStats {
      accepted:       self.counters.accepted.load(Ordering::Relaxed),
      disconnected:   self.counters.disconnected.load(Ordering::Relaxed),
      bytes_sent:     self.counters.bytes_sent.load(Ordering::Relaxed),
      bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
      listening:      self.listening.load(Ordering::Relaxed),
      connected:      self.connections.read().len(),
    }
  }

  /// Returns a snapshot of every live session.
  pub fn clients(&self) -> Vec<Arc<Client>> {
    self.connections.read().values().map(|e| e.client.clone()).collect()
  }

  pub fn client_by_eid(&self, eid: i32) -> Option<Arc<Client>> {
    self.connections.read().values().find(|e| e.client.eid() == eid).map(|e| e.client.clone())
  }

  /// Asks the dispatcher loop to exit. `run` finishes closing everything.
  pub fn stop(&self) {
    self.running.store(false, Ordering::SeqCst);
    let _ = self.waker.wake();
  }

  /// Runs the dispatcher loop. Blocks until [`stop`](Self::stop) is called.
  pub fn run(self: &Arc<Self>, server: &Arc<Server>) -> Result<()> {
    let mut poll = self.poll.lock().take().expect("connection handler run twice");
    let mut events = Events::with_capacity(128);

    let mut listeners = vec![];
    for (i, addr) in server.settings().binds.iter().enumerate() {
      let mut listener = match TcpListener::bind(*addr) {
        Ok(l) => l,
        Err(e) => {
          warn!("could not bind {addr}: {e}");
          continue;
        }
      };
      poll.registry().register(&mut listener, Token(LISTEN_BASE + i), Interest::READABLE)?;
      info!("listening on {addr}");
      listeners.push(listener);
    }
    if listeners.is_empty() {
      return Err(
        io::Error::new(io::ErrorKind::AddrNotAvailable, "no listen address could be bound").into(),
      );
    }
    self.listening.store(listeners.len(), Ordering::Relaxed);
    self.running.store(true, Ordering::SeqCst);

    let mut next_token = 0_usize;

    while self.running.load(Ordering::SeqCst) {
      loop {
        match poll.poll(&mut events, None) {
          Ok(()) => break,
          Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
          Err(e) => return Err(e.into()),
        }
      }

      for event in events.iter() {
        match event.token() {
          WAKE => self.drain_wake_events(server),
          Token(t) if t >= LISTEN_BASE => {
            let listener = &mut listeners[t - LISTEN_BASE];
            self.accept_loop(server, listener, poll.registry(), &mut next_token)?;
          }
          tok => {
            let this = self.clone();
            let server = server.clone();
            let readable = event.is_readable();
            let writable = event.is_writable();
            let pool = server.pool().clone();
            pool.spawn(move || this.handle_io(&server, tok, readable, writable));
          }
        }
      }
    }

    // Tear down whatever is still connected.
    let entries: Vec<_> = self.connections.read().values().cloned().collect();
    for entry in entries {
      self.finish_close(server, &entry);
    }
    self.listening.store(0, Ordering::Relaxed);
    Ok(())
  }

  fn accept_loop(
    self: &Arc<Self>,
    server: &Arc<Server>,
    listener: &mut TcpListener,
    registry: &mio::Registry,
    next_token: &mut usize,
  ) -> Result<()> {
    loop {
      let (mut stream, addr) = match listener.accept() {
        Ok(v) => v,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
        Err(e) => return Err(e.into()),
      };
      if !server.events().allow_accept(&addr) {
        // An accept hook rejected the peer; the socket just gets dropped.
        continue;
      }
      let tok = Token(*next_token);
      *next_token += 1;
      registry.register(&mut stream, tok, Interest::READABLE | Interest::WRITABLE)?;

      let client = Arc::new(Client::new(
        tok,
        addr,
        server.next_eid(),
        self.wake_tx.clone(),
        self.waker.clone(),
      ));
      self.connections.write().insert(
        tok,
        Arc::new(ConnEntry {
          conn:   Mutex::new(Connection {
            stream,
            recv: Vec::with_capacity(1024),
            garbage: vec![0; 64 * 1024],
            closed: false,
          }),
          client: client.clone(),
        }),
      );
      self.counters.accepted.fetch_add(1, Ordering::Relaxed);

      let s = server.clone();
      server.pool().spawn(move || s.events().fire_connect(&client));
    }
  }

  fn drain_wake_events(self: &Arc<Self>, server: &Arc<Server>) {
    loop {
      match self.wake_rx.try_recv() {
        Ok(WakeEvent::Flush(tok)) => {
          let this = self.clone();
          let server = server.clone();
          let pool = server.pool().clone();
          pool.spawn(move || this.handle_io(&server, tok, false, true));
        }
        Ok(WakeEvent::Close(tok)) => {
          let this = self.clone();
          let server = server.clone();
          let pool = server.pool().clone();
          pool.spawn(move || {
            if let Some(entry) = this.entry(tok) {
              // Give the queue one last flush; if it can't drain now, the
              // writable path finishes the close later.
              let _ = this.flush_conn(&server, &entry);
            }
          });
        }
        Err(TryRecvError::Empty) => break,
        Err(TryRecvError::Disconnected) => break,
      }
    }
  }

  fn entry(&self, tok: Token) -> Option<Arc<ConnEntry>> {
    self.connections.read().get(&tok).cloned()
  }

  fn handle_io(self: &Arc<Self>, server: &Arc<Server>, tok: Token, readable: bool, writable: bool) {
    let Some(entry) = self.entry(tok) else { return };
    if readable {
      match self.read_conn(server, &entry) {
        Ok(()) => {}
        Err(e) => {
          self.close_with_error(server, &entry, e);
          return;
        }
      }
    }
    if writable || entry.client.closing() {
      match self.flush_conn(server, &entry) {
        Ok(()) => {}
        Err(e) => self.close_with_error(server, &entry, e),
      }
    }
  }

  /// Reads until the socket runs dry, handing every complete frame to the
  /// router. Holding the connection lock across dispatch is what keeps one
  /// connection's packets in order.
  fn read_conn(&self, server: &Arc<Server>, entry: &Arc<ConnEntry>) -> Result<()> {
    let mut conn = entry.conn.lock();
    if conn.closed {
      return Ok(());
    }
    let client = &entry.client;
    loop {
      let Connection { stream, recv, garbage, .. } = &mut *conn;
      let n = match stream.read(garbage) {
        Ok(0) => {
          return Err(
            io::Error::new(io::ErrorKind::ConnectionAborted, "client has disconnected").into(),
          )
        }
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
        Err(e) => return Err(e.into()),
      };
      self.counters.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
      client.add_received(n as u64);
      client.decrypt_into(&mut garbage[..n], recv);

      while let Some(p) = packet::deframe(recv, client.compression())? {
        if client.closing() {
          // Reads after a disconnect are discarded.
          continue;
        }
        server.router().dispatch(server, client, p)?;
      }
    }
  }

  /// Pushes queued sends at the socket, in submission order. Completes each
  /// handle as its last byte is written.
  fn flush_conn(&self, server: &Arc<Server>, entry: &Arc<ConnEntry>) -> Result<()> {
    let mut conn = entry.conn.lock();
    if conn.closed {
      return Ok(());
    }
    let client = &entry.client;
    while let Some(handle) = client.front_send() {
      match conn.stream.write(handle.remaining()) {
        Ok(n) => {
          self.counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
          client.add_sent(n as u64);
          if handle.advance(n) {
            handle.complete(SendState::Succeeded);
            client.pop_send();
          }
        }
        // Socket is full; the writable event picks this back up.
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
        Err(e) => return Err(e.into()),
      }
    }
    if client.closing() && client.queue_empty() {
      drop(conn);
      self.finish_close(server, entry);
    }
    Ok(())
  }

  fn close_with_error(&self, server: &Arc<Server>, entry: &Arc<ConnEntry>, e: crate::Error) {
    if e.is_normal_disconnect() {
      info!("{:?} has disconnected", entry.client.addr());
    } else {
      warn!("error in connection to {:?}: {}", entry.client.addr(), e);
      entry.client.set_close_reason(&e.to_string());
    }
    self.finish_close(server, entry);
  }

  /// The one place a connection actually dies: fails pending sends, closes
  /// the socket, removes the entry, and fires the disconnect hook.
  fn finish_close(&self, server: &Arc<Server>, entry: &Arc<ConnEntry>) {
    {
      let mut conn = entry.conn.lock();
      if conn.closed {
        return;
      }
      conn.closed = true;
    }
    entry.client.fail_pending();
    // Dropping the entry drops the stream, which closes the socket and
    // removes it from the poller.
    self.connections.write().remove(&entry.client.token());
    self.counters.disconnected.fetch_add(1, Ordering::Relaxed);
    let reason = entry.client.close_reason();
    server.events().fire_disconnect(&entry.client, &reason);
  }
}
