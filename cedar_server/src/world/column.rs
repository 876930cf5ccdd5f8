use crate::{Error, Result};
use cedar_common::{
  chunk::{Block, Column},
  math::{BlockId, ColumnId},
};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use std::{
  collections::HashSet,
  ops::Deref,
  sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
  },
};

/// The lifecycle of a column. States only ever advance (`Unloaded` is
/// terminal); a regress is an invariant break and panics the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ColumnState {
  /// Checking the data provider for a persisted copy.
  Loading,
  /// Running the block and biome generators.
  Generating,
  /// Terrain exists, but populators have not run. Only populating threads
  /// may read columns in this state.
  Generated,
  /// Populators are running (or failed and will be retried).
  Populating,
  /// The steady state. Everything may read.
  Populated,
  /// Evicted from the world map.
  Unloaded,
}

/// What [`ColumnContainer::wait_until`] tells the caller to do next.
#[derive(Debug, PartialEq, Eq)]
pub enum WaitUntil {
  /// The column is at (or past) the requested state.
  Reached,
  /// Nobody is driving the state machine, so the caller must: call
  /// `World::process` once, then ask again.
  MustProcess,
}

struct StateInner {
  state:      ColumnState,
  /// Exactly one thread at a time may be running a processing step.
  processing: bool,
}

/// A column in the world map, along with everything the world tracks about
/// it: lifecycle state, interest count, the dirty flag, and which clients
/// are subscribed to block changes in it.
pub struct ColumnContainer {
  id:          ColumnId,
  state:       Mutex<StateInner>,
  cond:        Condvar,
  data:        RwLock<Column>,
  dirty:       AtomicBool,
  interest:    AtomicU32,
  subscribers: Mutex<HashSet<i32>>,
}

impl ColumnContainer {
  pub fn new(id: ColumnId) -> Self {
    ColumnContainer {
      id,
      state: Mutex::new(StateInner { state: ColumnState::Loading, processing: false }),
      cond: Condvar::new(),
      data: RwLock::new(Column::new()),
      dirty: AtomicBool::new(false),
      interest: AtomicU32::new(0),
      subscribers: Mutex::new(HashSet::new()),
    }
  }

  pub fn id(&self) -> ColumnId { self.id }
  pub fn state(&self) -> ColumnState { self.state.lock().state }

  /// Blocks until the column reaches `target` or later. If no other thread is
  /// currently driving the state machine, this claims the processing slot and
  /// returns [`WaitUntil::MustProcess`] instead; the caller then owns one
  /// processing step.
  pub fn wait_until(&self, target: ColumnState) -> WaitUntil {
    let mut s = self.state.lock();
    loop {
      if s.state >= target {
        return WaitUntil::Reached;
      }
      if !s.processing {
        s.processing = true;
        return WaitUntil::MustProcess;
      }
      self.cond.wait(&mut s);
    }
  }

  /// Advances the state while keeping the processing claim. Panics on a
  /// regress; the caller routes that through the server panic hook.
  pub(super) fn transition(&self, next: ColumnState) {
    let mut s = self.state.lock();
    assert!(
      next >= s.state,
      "column {} state regressed from {:?} to {next:?}",
      self.id,
      s.state
    );
    s.state = next;
    self.cond.notify_all();
  }

  /// Releases the processing claim taken by a `MustProcess` return.
  pub(super) fn finish_processing(&self) {
    let mut s = self.state.lock();
    s.processing = false;
    self.cond.notify_all();
  }

  pub fn interest(&self) -> u32 { self.interest.load(Ordering::SeqCst) }
  pub(super) fn begin_interest(&self) { self.interest.fetch_add(1, Ordering::SeqCst); }
  pub(super) fn end_interest(&self) {
    let prev = self.interest.fetch_sub(1, Ordering::SeqCst);
    assert!(prev > 0, "interest count underflow on column {}", self.id);
  }

  pub fn dirty(&self) -> bool { self.dirty.load(Ordering::SeqCst) }
  pub fn mark_dirty(&self) { self.dirty.store(true, Ordering::SeqCst); }
  /// Clears the dirty flag, returning whether it was set. The save path
  /// clears before persisting, so a write racing the save just re-dirties.
  pub(super) fn clean(&self) -> bool { self.dirty.swap(false, Ordering::SeqCst) }

  pub(super) fn read(&self) -> RwLockReadGuard<'_, Column> { self.data.read() }
  pub(super) fn replace(&self, column: Column) { *self.data.write() = column; }
  pub(super) fn with_write<R>(&self, f: impl FnOnce(&mut Column) -> R) -> R {
    f(&mut self.data.write())
  }

  /// Reads one block, by absolute position.
  pub fn block_at(&self, id: BlockId) -> Result<Block> {
    let (x, y, z) = rel(self.id, id)?;
    Ok(self.data.read().block(x, y, z))
  }
  /// Writes one block, by absolute position. Content only; the caller deals
  /// with locking, dirtiness and propagation.
  pub(super) fn set_block_at(&self, id: BlockId, b: Block) -> Result<()> {
    let (x, y, z) = rel(self.id, id)?;
    self.data.write().set_block(x, y, z, b);
    Ok(())
  }

  pub fn subscribers(&self) -> Vec<i32> { self.subscribers.lock().iter().copied().collect() }
  pub(super) fn add_subscriber(&self, eid: i32) -> bool { self.subscribers.lock().insert(eid) }
  pub(super) fn remove_subscriber(&self, eid: i32) -> bool {
    self.subscribers.lock().remove(&eid)
  }
}

fn rel(col: ColumnId, block: BlockId) -> Result<(u8, u8, u8)> {
  if !col.contains(block) || !(0..256).contains(&block.y) {
    return Err(Error::OutOfColumn { block, column: col });
  }
  let (x, y, z) = block.column_rel();
  Ok((x, y as u8, z))
}

/// Counted interest in a column. As long as at least one of these is alive,
/// maintenance will not evict the column. Dropping it releases the interest.
pub struct ColumnRef {
  col: Arc<ColumnContainer>,
}

impl ColumnRef {
  pub(super) fn new(col: Arc<ColumnContainer>) -> Self {
    // Interest is taken by the world while it still holds the map lock, not
    // here, so that a column can't be evicted between lookup and wrap.
    ColumnRef { col }
  }

  pub fn container(&self) -> &Arc<ColumnContainer> { &self.col }
}

impl Deref for ColumnRef {
  type Target = ColumnContainer;

  fn deref(&self) -> &Self::Target { &self.col }
}

impl Drop for ColumnRef {
  fn drop(&mut self) { self.col.end_interest(); }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn states_are_ordered() {
    assert!(ColumnState::Loading < ColumnState::Generating);
    assert!(ColumnState::Generating < ColumnState::Generated);
    assert!(ColumnState::Generated < ColumnState::Populating);
    assert!(ColumnState::Populating < ColumnState::Populated);
    assert!(ColumnState::Populated < ColumnState::Unloaded);
  }

  #[test]
  fn wait_until_hands_out_processing() {
    let col = ColumnContainer::new(ColumnId::new(0, 0, 0));
    // Nothing is processing, so the first caller gets told to do it.
    assert_eq!(col.wait_until(ColumnState::Generated), WaitUntil::MustProcess);
    col.transition(ColumnState::Generating);
    col.transition(ColumnState::Generated);
    col.finish_processing();
    assert_eq!(col.wait_until(ColumnState::Generated), WaitUntil::Reached);
  }

  #[test]
  #[should_panic(expected = "state regressed")]
  fn regress_panics() {
    let col = ColumnContainer::new(ColumnId::new(0, 0, 0));
    col.transition(ColumnState::Populated);
    col.transition(ColumnState::Generating);
  }

  #[test]
  fn block_position_checks() {
    let col = ColumnContainer::new(ColumnId::new(0, 0, 0));
    assert!(col.block_at(BlockId::new(5, 64, 5, 0)).is_ok());
    // Wrong column.
    assert!(col.block_at(BlockId::new(16, 64, 5, 0)).is_err());
    // Below and above the world.
    assert!(col.block_at(BlockId::new(5, -1, 5, 0)).is_err());
    assert!(col.block_at(BlockId::new(5, 256, 5, 0)).is_err());
  }
}
