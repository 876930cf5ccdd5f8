use super::{
  crypto::Cipher,
  send::{SendHandle, SendState},
  WakeEvent,
};
use crate::packet::{self, cb, ProtocolState};
use crossbeam_channel::Sender;
use mio::{Token, Waker};
use parking_lot::Mutex;
use std::{
  collections::VecDeque,
  fmt,
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering},
    Arc,
  },
  time::{Duration, Instant},
};

struct KeepAliveState {
  /// The token we sent and when we sent it. Cleared when the client echoes
  /// it back.
  pending: Option<(i32, Instant)>,
}

/// One connected session. The handler owns the socket; everything else about
/// the connection lives here, shared between the handler, the router, and any
/// module that retained the client.
pub struct Client {
  tok:  Token,
  addr: SocketAddr,
  /// Server-unique entity id, assigned on accept.
  eid:  i32,

  state:       Mutex<ProtocolState>,
  username:    Mutex<Option<String>>,
  /// The verify token sent in our encryption request, awaiting the client's
  /// echo.
  pub(crate) verify_token: Mutex<Option<[u8; 16]>>,

  cipher:      Cipher,
  /// Negative while compression is off.
  compression: AtomicI32,

  queue:        Mutex<VecDeque<Arc<SendHandle>>>,
  closing:      AtomicBool,
  close_reason: Mutex<Option<String>>,

  bytes_received: AtomicU64,
  bytes_sent:     AtomicU64,
  latency_ms:     AtomicU32,

  keep_alive: Mutex<KeepAliveState>,
  position:   Mutex<(f64, f64, f64)>,

  wake:  Sender<WakeEvent>,
  waker: Arc<Waker>,
}

impl fmt::Debug for Client {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.debug_struct("Client")
      .field("addr", &self.addr)
      .field("eid", &self.eid)
      .field("state", &self.state())
      .field("username", &self.username())
      .finish()
  }
}

impl Client {
  pub(super) fn new(
    tok: Token,
    addr: SocketAddr,
    eid: i32,
    wake: Sender<WakeEvent>,
    waker: Arc<Waker>,
  ) -> Self {
    Client {
      tok,
      addr,
      eid,
      state: Mutex::new(ProtocolState::Handshaking),
      username: Mutex::new(None),
      verify_token: Mutex::new(None),
      cipher: Cipher::new(),
      compression: AtomicI32::new(-1),
      queue: Mutex::new(VecDeque::new()),
      closing: AtomicBool::new(false),
      close_reason: Mutex::new(None),
      bytes_received: AtomicU64::new(0),
      bytes_sent: AtomicU64::new(0),
      latency_ms: AtomicU32::new(0),
      keep_alive: Mutex::new(KeepAliveState { pending: None }),
      position: Mutex::new((0.0, 64.0, 0.0)),
      wake,
      waker,
    }
  }

  pub fn token(&self) -> Token { self.tok }
  pub fn addr(&self) -> SocketAddr { self.addr }
  pub fn eid(&self) -> i32 { self.eid }

  pub fn state(&self) -> ProtocolState { *self.state.lock() }
  pub fn set_state(&self, state: ProtocolState) { *self.state.lock() = state; }

  pub fn username(&self) -> Option<String> { self.username.lock().clone() }
  pub fn set_username(&self, name: String) { *self.username.lock() = Some(name); }

  pub fn latency_ms(&self) -> u32 { self.latency_ms.load(Ordering::Relaxed) }
  pub(crate) fn set_latency_ms(&self, ms: u32) { self.latency_ms.store(ms, Ordering::Relaxed) }

  pub fn bytes_received(&self) -> u64 { self.bytes_received.load(Ordering::Relaxed) }
  pub fn bytes_sent(&self) -> u64 { self.bytes_sent.load(Ordering::Relaxed) }
  pub(super) fn add_received(&self, n: u64) {
    self.bytes_received.fetch_add(n, Ordering::Relaxed);
  }
  pub(super) fn add_sent(&self, n: u64) { self.bytes_sent.fetch_add(n, Ordering::Relaxed); }

  pub fn position(&self) -> (f64, f64, f64) { *self.position.lock() }
  pub fn set_position(&self, pos: (f64, f64, f64)) { *self.position.lock() = pos; }

  /// Records an outbound keep-alive token. Returns `false` (and records
  /// nothing) if one is already outstanding.
  pub fn begin_keep_alive(&self, id: i32) -> bool {
    let mut ka = self.keep_alive.lock();
    if ka.pending.is_some() {
      return false;
    }
    ka.pending = Some((id, Instant::now()));
    true
  }

  /// How long the current keep-alive has gone unanswered, if one is out.
  pub fn keep_alive_outstanding(&self) -> Option<Duration> {
    self.keep_alive.lock().pending.map(|(_, at)| at.elapsed())
  }

  /// Handles an echoed keep-alive token. A match clears the outstanding
  /// entry and updates the measured latency; a mismatch is ignored (the
  /// timeout deals with clients that answer garbage).
  pub fn ack_keep_alive(&self, id: i32) -> bool {
    let mut ka = self.keep_alive.lock();
    match ka.pending {
      Some((expected, at)) if expected == id => {
        ka.pending = None;
        drop(ka);
        self.set_latency_ms(at.elapsed().as_millis() as u32);
        true
      }
      _ => false,
    }
  }

  /// Turns on AES-128/CFB-8 in both directions. Anything sent after this is
  /// encrypted; the caller must make sure the client expects that.
  pub fn enable_encryption(&self, secret: &[u8; 16]) { self.cipher.enable(secret) }
  pub fn encryption_enabled(&self) -> bool { self.cipher.enabled() }

  /// Sets the compression threshold. Must be called after the set-compression
  /// packet has been queued, and before anything else is.
  pub fn set_compression(&self, threshold: i32) {
    self.compression.store(threshold, Ordering::SeqCst);
  }
  pub fn compression(&self) -> i32 { self.compression.load(Ordering::SeqCst) }

  pub fn closing(&self) -> bool { self.closing.load(Ordering::SeqCst) }

  /// The reason given for the disconnect, for the disconnect hook. Only the
  /// first reason recorded sticks.
  pub fn close_reason(&self) -> String {
    self.close_reason.lock().clone().unwrap_or_else(|| "connection closed".into())
  }
  pub(crate) fn set_close_reason(&self, reason: &str) {
    let mut lock = self.close_reason.lock();
    if lock.is_none() {
      *lock = Some(reason.into());
    }
  }

  /// Queues a packet for this client. The packet is framed, compressed if
  /// eligible, and encrypted, all before this returns; the encryption lock is
  /// held across encrypt-and-enqueue so the peer's decryptor stays in sync.
  /// The returned handle can be watched or waited on.
  pub fn send(&self, p: cb::Packet) -> Arc<SendHandle> {
    let mut bytes = packet::frame(p.to_tcp(), self.compression());
    let handle = self.cipher.with_encrypt(|cipher| {
      if let Some(c) = cipher {
        use aes::cipher::AsyncStreamCipher;
        c.encrypt(&mut bytes);
      }
      let handle = SendHandle::new(bytes);
      if self.closing() {
        handle.complete(SendState::Failed);
      } else {
        self.queue.lock().push_back(handle.clone());
      }
      handle
    });
    self.wake(WakeEvent::Flush(self.tok));
    handle
  }

  /// Sends a disconnect packet appropriate for the current state (when there
  /// is one), then starts closing the connection. Everything still queued
  /// gets a chance to flush; new sends fail.
  pub fn disconnect(&self, reason: &str) {
    self.set_close_reason(reason);
    match self.state() {
      ProtocolState::Login => {
        self.send(cb::Packet::LoginDisconnect { reason: reason.into() });
      }
      ProtocolState::Play => {
        self.send(cb::Packet::Disconnect { reason: reason.into() });
      }
      // Status and handshaking clients just get dropped.
      _ => {}
    }
    self.closing.store(true, Ordering::SeqCst);
    self.wake(WakeEvent::Close(self.tok));
  }

  fn wake(&self, ev: WakeEvent) {
    // Failures mean the handler is gone, and the connection is dead anyway.
    if self.wake.send(ev).is_ok() {
      let _ = self.waker.wake();
    }
  }

  /// Decrypts freshly read bytes (when encryption is on) and appends them to
  /// `recv`. The decrypt lock covers both steps.
  pub(super) fn decrypt_into(&self, data: &mut [u8], recv: &mut Vec<u8>) {
    self.cipher.with_decrypt(|cipher| {
      if let Some(c) = cipher {
        use aes::cipher::AsyncStreamCipher;
        c.decrypt(data);
      }
      recv.extend_from_slice(data);
    });
  }

  /// Pops send handles off the queue for the writer. Returns the front
  /// without removing it; the writer removes it once fully sent.
  pub(super) fn front_send(&self) -> Option<Arc<SendHandle>> {
    self.queue.lock().front().cloned()
  }
  pub(super) fn pop_send(&self) { self.queue.lock().pop_front(); }
  pub(super) fn queue_empty(&self) -> bool { self.queue.lock().is_empty() }

  /// Fails every queued send. Called when the connection dies.
  pub(super) fn fail_pending(&self) {
    let handles: Vec<_> = self.queue.lock().drain(..).collect();
    for h in handles {
      h.complete(SendState::Failed);
    }
  }
}
