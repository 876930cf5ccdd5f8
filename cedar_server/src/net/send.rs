use parking_lot::{Condvar, Mutex};
use std::sync::{
  atomic::{AtomicUsize, Ordering},
  Arc,
};

/// The lifecycle of one queued outbound payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendState {
  /// Queued, no bytes on the wire yet.
  Pending,
  /// Some bytes have been written.
  InProgress,
  Succeeded,
  /// The connection died before all bytes were written.
  Failed,
}

impl SendState {
  pub fn is_terminal(&self) -> bool {
    matches!(self, SendState::Succeeded | SendState::Failed)
  }
}

type Callback = Box<dyn FnOnce(SendState) + Send>;

struct SendInner {
  state:     SendState,
  callbacks: Vec<Callback>,
}

/// One queued outbound payload. The bytes are already encrypted by the time
/// the handle is constructed; the writer just pushes them at the socket.
///
/// Callbacks fire exactly once, after the terminal state is set. A callback
/// added after completion fires immediately.
pub struct SendHandle {
  data:  Vec<u8>,
  sent:  AtomicUsize,
  inner: Mutex<SendInner>,
  done:  Condvar,
}

impl SendHandle {
  pub fn new(data: Vec<u8>) -> Arc<Self> {
    Arc::new(SendHandle {
      data,
      sent: AtomicUsize::new(0),
      inner: Mutex::new(SendInner { state: SendState::Pending, callbacks: vec![] }),
      done: Condvar::new(),
    })
  }

  pub fn data(&self) -> &[u8] { &self.data }
  /// How many bytes of this payload have hit the socket so far.
  pub fn sent(&self) -> usize { self.sent.load(Ordering::SeqCst) }
  pub fn remaining(&self) -> &[u8] { &self.data[self.sent()..] }

  pub fn state(&self) -> SendState { self.inner.lock().state }

  /// Records `n` more bytes written. Returns `true` once the whole payload is
  /// out, at which point the writer should call [`complete`](Self::complete).
  pub(crate) fn advance(&self, n: usize) -> bool {
    let total = self.sent.fetch_add(n, Ordering::SeqCst) + n;
    let mut inner = self.inner.lock();
    if inner.state == SendState::Pending {
      inner.state = SendState::InProgress;
    }
    total >= self.data.len()
  }

  /// Moves the handle to a terminal state, waking waiters and firing
  /// callbacks. Does nothing if the handle is already terminal.
  pub(crate) fn complete(&self, state: SendState) {
    let callbacks = {
      let mut inner = self.inner.lock();
      if inner.state.is_terminal() {
        return;
      }
      inner.state = state;
      std::mem::take(&mut inner.callbacks)
    };
    self.done.notify_all();
    // Fired outside the lock, so a callback can inspect the handle.
    for cb in callbacks {
      cb(state);
    }
  }

  /// Blocks until the payload either fully sends or fails.
  pub fn wait(&self) -> SendState {
    let mut inner = self.inner.lock();
    while !inner.state.is_terminal() {
      self.done.wait(&mut inner);
    }
    inner.state
  }

  /// Registers a completion callback.
  pub fn on_complete(&self, cb: impl FnOnce(SendState) + Send + 'static) {
    let state = {
      let mut inner = self.inner.lock();
      if inner.state.is_terminal() {
        inner.state
      } else {
        inner.callbacks.push(Box::new(cb));
        return;
      }
    };
    cb(state);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicBool;

  #[test]
  fn advance_and_complete() {
    let h = SendHandle::new(vec![0; 10]);
    assert_eq!(h.state(), SendState::Pending);
    assert!(!h.advance(4));
    assert_eq!(h.state(), SendState::InProgress);
    assert_eq!(h.remaining().len(), 6);
    assert!(h.advance(6));
    h.complete(SendState::Succeeded);
    assert_eq!(h.wait(), SendState::Succeeded);
  }

  #[test]
  fn callbacks_fire_once() {
    let h = SendHandle::new(vec![1]);
    let fired = Arc::new(AtomicBool::new(false));
    let f = fired.clone();
    h.on_complete(move |state| {
      assert_eq!(state, SendState::Failed);
      assert!(!f.swap(true, Ordering::SeqCst), "callback fired twice");
    });
    h.complete(SendState::Failed);
    // A second completion is ignored.
    h.complete(SendState::Succeeded);
    assert!(fired.load(Ordering::SeqCst));
    assert_eq!(h.state(), SendState::Failed);
  }
}
