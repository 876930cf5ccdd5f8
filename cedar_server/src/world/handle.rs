use super::{ColumnState, World};
use crate::Result;
use cedar_common::{chunk::Block, math::BlockId};

/// What a write through a [`WorldHandle`] does to the column's dirty flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStrategy {
  /// Writes mark the column dirty, so it gets saved.
  Dirty,
  /// Writes leave the flag alone. Used for scratch edits that will be
  /// regenerated anyway.
  Clean,
}

/// How far a [`WorldHandle`] drives a column it touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStrategy {
  /// Touched columns are generated but not populated. This is what
  /// populators use on their neighbors: requiring only `Generated` is what
  /// keeps population from recursing forever.
  Generate,
  /// Touched columns are fully populated before access.
  Populate,
}

/// A scoped write session against the world. Populators receive one of these
/// with `(Dirty, Generate)`; writes go straight at the column content and do
/// not take the world lock, since the handle's columns are not yet visible to
/// ordinary readers.
pub struct WorldHandle<'a> {
  world:  &'a World,
  write:  WriteStrategy,
  access: AccessStrategy,
}

impl<'a> WorldHandle<'a> {
  pub(super) fn new(world: &'a World, write: WriteStrategy, access: AccessStrategy) -> Self {
    WorldHandle { world, write, access }
  }

  pub fn write_strategy(&self) -> WriteStrategy { self.write }
  pub fn access_strategy(&self) -> AccessStrategy { self.access }

  fn target(&self) -> ColumnState {
    match self.access {
      AccessStrategy::Generate => ColumnState::Generated,
      AccessStrategy::Populate => ColumnState::Populated,
    }
  }

  /// Reads a block, driving the containing column to this handle's target
  /// state first.
  pub fn get_block(&self, id: BlockId) -> Result<Block> {
    let col = self.world.get_column(id.containing());
    self.world.prepare(&col, self.target())?;
    col.block_at(id)
  }

  /// Writes a block, driving the containing column to this handle's target
  /// state first.
  pub fn set_block(&self, id: BlockId, b: Block) -> Result<()> {
    let col = self.world.get_column(id.containing());
    self.world.prepare(&col, self.target())?;
    col.set_block_at(id, b)?;
    if self.write == WriteStrategy::Dirty {
      col.mark_dirty();
    }
    Ok(())
  }
}
