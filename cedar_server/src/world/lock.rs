//! The world lock.
//!
//! Writers name the footprint they want (the whole world, a set of columns,
//! or a set of blocks), and the lock admits any set of requests whose
//! footprints don't overlap. Contending requests are granted strictly in
//! arrival order: a queued request never overtakes an earlier one it contends
//! with, though it may start ahead of an earlier request it is independent
//! of.
//!
//! Holding a guard while acquiring another request is not supported and can
//! deadlock; block writes inside populators go through the populator's outer
//! handle instead of re-entering.

use cedar_common::{
  math::{BlockId, ColumnId},
  util::ThreadPool,
};
use parking_lot::{Condvar, Mutex};
use std::{collections::VecDeque, sync::Arc};

/// A lock footprint.
#[derive(Debug, Clone, Default)]
pub struct LockRequest {
  world:   bool,
  columns: Vec<ColumnId>,
  blocks:  Vec<BlockId>,
}

impl LockRequest {
  /// Requests the entire world. Contends with every non-empty request.
  pub fn world() -> Self { LockRequest { world: true, ..Default::default() } }
  pub fn column(c: ColumnId) -> Self { LockRequest { columns: vec![c], ..Default::default() } }
  pub fn columns(columns: Vec<ColumnId>) -> Self { LockRequest { columns, ..Default::default() } }
  pub fn block(b: BlockId) -> Self { LockRequest { blocks: vec![b], ..Default::default() } }
  pub fn blocks(blocks: Vec<BlockId>) -> Self { LockRequest { blocks, ..Default::default() } }

  pub fn add_column(mut self, c: ColumnId) -> Self {
    self.columns.push(c);
    self
  }
  pub fn add_block(mut self, b: BlockId) -> Self {
    self.blocks.push(b);
    self
  }

  pub fn is_empty(&self) -> bool {
    !self.world && self.columns.is_empty() && self.blocks.is_empty()
  }

  /// Whether two requests overlap: the world overlaps anything non-empty,
  /// equal columns overlap, equal blocks overlap, and a block overlaps the
  /// column containing it.
  pub fn contends_with(&self, other: &LockRequest) -> bool {
    if self.world {
      return !other.is_empty();
    }
    if other.world {
      return !self.is_empty();
    }
    for a in &self.columns {
      if other.columns.contains(a) {
        return true;
      }
    }
    for a in &self.blocks {
      if other.blocks.contains(a) {
        return true;
      }
      if other.columns.contains(&a.containing()) {
        return true;
      }
    }
    for b in &other.blocks {
      if self.columns.contains(&b.containing()) {
        return true;
      }
    }
    false
  }
}

struct SyncWaiter {
  granted: Mutex<bool>,
  cond:    Condvar,
}

enum Waiter {
  Sync(Arc<SyncWaiter>),
  Async(Box<dyn FnOnce(WorldLockGuard) + Send>),
}

struct Pending {
  id:      u64,
  request: LockRequest,
  waiter:  Waiter,
}

#[derive(Default)]
struct LockState {
  held:    Vec<(u64, LockRequest)>,
  queue:   VecDeque<Pending>,
  next_id: u64,
}

pub struct WorldLock {
  state: Mutex<LockState>,
  pool:  Arc<ThreadPool>,
}

/// A held footprint. Dropping it releases the lock and wakes whatever queued
/// requests become grantable.
pub struct WorldLockGuard {
  lock: Arc<WorldLock>,
  id:   u64,
}

impl Drop for WorldLockGuard {
  fn drop(&mut self) {
    let lock = self.lock.clone();
    lock.release(self.id);
  }
}

impl WorldLock {
  pub fn new(pool: Arc<ThreadPool>) -> Arc<Self> {
    Arc::new(WorldLock { state: Mutex::new(LockState::default()), pool })
  }

  fn grantable(state: &LockState, request: &LockRequest) -> bool {
    state.held.iter().all(|(_, held)| !held.contends_with(request))
      && state.queue.iter().all(|p| !p.request.contends_with(request))
  }

  /// Acquires the footprint, blocking until it is granted.
  pub fn acquire(self: &Arc<Self>, request: LockRequest) -> WorldLockGuard {
    let waiter = Arc::new(SyncWaiter { granted: Mutex::new(false), cond: Condvar::new() });
    let id = {
      let mut s = self.state.lock();
      let id = s.next_id;
      s.next_id += 1;
      if Self::grantable(&s, &request) {
        s.held.push((id, request));
        return WorldLockGuard { lock: self.clone(), id };
      }
      s.queue.push_back(Pending { id, request, waiter: Waiter::Sync(waiter.clone()) });
      id
    };
    let mut granted = waiter.granted.lock();
    while !*granted {
      waiter.cond.wait(&mut granted);
    }
    WorldLockGuard { lock: self.clone(), id }
  }

  /// Acquires the footprint asynchronously. The callback runs on the pool
  /// once the lock is granted, and receives the guard.
  pub fn acquire_async(
    self: &Arc<Self>,
    request: LockRequest,
    callback: impl FnOnce(WorldLockGuard) + Send + 'static,
  ) {
    let mut s = self.state.lock();
    let id = s.next_id;
    s.next_id += 1;
    if Self::grantable(&s, &request) {
      s.held.push((id, request));
      drop(s);
      let guard = WorldLockGuard { lock: self.clone(), id };
      self.pool.spawn(move || callback(guard));
      return;
    }
    s.queue.push_back(Pending { id, request, waiter: Waiter::Async(Box::new(callback)) });
  }

  fn release(self: &Arc<Self>, id: u64) {
    let woken = {
      let mut s = self.state.lock();
      s.held.retain(|(held_id, _)| *held_id != id);

      // Walk the queue front to back. An entry is granted when it contends
      // with nothing held and nothing still queued ahead of it; entries we
      // skip stay in the queue and keep blocking anything behind them that
      // overlaps.
      let mut woken = vec![];
      let mut i = 0;
      while i < s.queue.len() {
        let contends_held =
          s.held.iter().any(|(_, held)| held.contends_with(&s.queue[i].request));
        let contends_ahead =
          (0..i).any(|j| s.queue[j].request.contends_with(&s.queue[i].request));
        if contends_held || contends_ahead {
          i += 1;
          continue;
        }
        let pending = s.queue.remove(i).expect("index is in bounds");
        s.held.push((pending.id, pending.request));
        woken.push((pending.id, pending.waiter));
      }
      woken
    };

    for (id, waiter) in woken {
      match waiter {
        Waiter::Sync(w) => {
          *w.granted.lock() = true;
          w.cond.notify_one();
        }
        Waiter::Async(callback) => {
          let guard = WorldLockGuard { lock: self.clone(), id };
          self.pool.spawn(move || callback(guard));
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::Duration,
  };

  fn pool() -> Arc<ThreadPool> { Arc::new(ThreadPool::new("lock-test", 2)) }

  #[test]
  fn contention_rules() {
    let world = LockRequest::world();
    let col = LockRequest::column(ColumnId::new(0, 0, 0));
    let other_col = LockRequest::column(ColumnId::new(1, 0, 0));
    let block = LockRequest::block(BlockId::new(5, 64, 5, 0));
    let other_block = LockRequest::block(BlockId::new(17, 64, 5, 0));
    let empty = LockRequest::default();

    assert!(world.contends_with(&col));
    assert!(world.contends_with(&block));
    assert!(!world.contends_with(&empty));
    assert!(col.contends_with(&col));
    assert!(!col.contends_with(&other_col));
    // The block at (5, 64, 5) is inside column (0, 0).
    assert!(col.contends_with(&block));
    assert!(block.contends_with(&col));
    assert!(!block.contends_with(&other_block));
    assert!(other_block.contends_with(&other_col));
  }

  #[test]
  fn non_contending_requests_run_concurrently() {
    let lock = WorldLock::new(pool());
    let a = lock.acquire(LockRequest::block(BlockId::new(0, 0, 0, 0)));
    // This would hang forever if independent blocks contended.
    let b = lock.acquire(LockRequest::block(BlockId::new(1, 0, 0, 0)));
    drop(a);
    drop(b);
  }

  #[test]
  fn fifo_grant_order() {
    // T1 holds the world, then two requests for the same block queue up
    // behind it. Neither may pass T1, and between themselves they must be
    // granted in arrival order.
    let lock = WorldLock::new(pool());
    let world = lock.acquire(LockRequest::world());

    let order = Arc::new(Mutex::new(vec![]));
    let mut threads = vec![];
    for name in ["t2", "t3"] {
      let lock = lock.clone();
      let order = order.clone();
      threads.push(thread::spawn(move || {
        let _guard = lock.acquire(LockRequest::block(BlockId::new(0, 0, 0, 0)));
        order.lock().push(name);
      }));
      // Make the arrival order deterministic.
      thread::sleep(Duration::from_millis(30));
    }
    assert!(order.lock().is_empty(), "nothing may be granted while the world is held");

    drop(world);
    for t in threads {
      t.join().unwrap();
    }
    assert_eq!(*order.lock(), vec!["t2", "t3"]);
  }

  #[test]
  fn contending_writers_are_exclusive() {
    let lock = WorldLock::new(pool());
    let counter = Arc::new(AtomicUsize::new(0));
    let mut threads = vec![];
    for _ in 0..4 {
      let lock = lock.clone();
      let counter = counter.clone();
      threads.push(thread::spawn(move || {
        for _ in 0..50 {
          let _guard = lock.acquire(LockRequest::block(BlockId::new(3, 60, 3, 0)));
          let seen = counter.fetch_add(1, Ordering::SeqCst);
          assert_eq!(seen, 0, "two holders inside a contending footprint");
          counter.fetch_sub(1, Ordering::SeqCst);
        }
      }));
    }
    for t in threads {
      t.join().unwrap();
    }
  }

  #[test]
  fn async_acquire_runs_on_the_pool() {
    let lock = WorldLock::new(pool());
    let held = lock.acquire(LockRequest::world());
    let (tx, rx) = crossbeam_channel::bounded(1);
    lock.acquire_async(LockRequest::world(), move |guard| {
      tx.send(()).unwrap();
      drop(guard);
    });
    // Not granted while we still hold the world.
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    drop(held);
    rx.recv_timeout(Duration::from_secs(5)).expect("callback should fire after release");
  }
}
