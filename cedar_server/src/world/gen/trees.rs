use super::{block_ids, PopulateEvent, Populator};
use crate::Result;
use cedar_common::{chunk::Block, math::BlockId};
use rand::{Rng, SeedableRng};
use wyhash::WyRng;

/// Scatters a few oak trees on top of the grass. Canopies near a column edge
/// spill into the neighboring column, which only needs to be generated, not
/// populated, so population never recurses.
pub struct TreePopulator {
  seed:          u64,
  per_column:    u32,
}

impl TreePopulator {
  pub fn new(seed: u64) -> Self { TreePopulator { seed, per_column: 3 } }

  /// A deterministic rng per column, so population order doesn't change the
  /// world.
  fn rng_for(&self, ev: &PopulateEvent) -> WyRng {
    let id = ev.column;
    WyRng::seed_from_u64(
      self
        .seed
        .wrapping_mul(31)
        .wrapping_add(id.x as u64)
        .wrapping_mul(31)
        .wrapping_add(id.z as u64)
        .wrapping_mul(31)
        .wrapping_add(id.dimension as u64),
    )
  }
}

impl Populator for TreePopulator {
  fn populate(&self, ev: &PopulateEvent) -> Result<()> {
    let mut rng = self.rng_for(ev);
    let dim = ev.column.dimension;
    for _ in 0..self.per_column {
      let x = ev.column.block_start_x() + rng.gen_range(0..16);
      let z = ev.column.block_start_z() + rng.gen_range(0..16);

      // Find the grass surface.
      let Some(surface) = (1..255).rev().find_map(|y| {
        let b = ev.world.get_block(BlockId::new(x, y, z, dim)).ok()?;
        (b.id() == block_ids::GRASS).then_some(y)
      }) else {
        continue;
      };

      let height = rng.gen_range(4..7);
      for dy in 1..=height {
        ev.world.set_block(BlockId::new(x, surface + dy, z, dim), Block::new(block_ids::LOG))?;
      }
      // A flat 3x3 canopy; corners may land in a neighboring column.
      for dx in -1..=1 {
        for dz in -1..=1 {
          let pos = BlockId::new(x + dx, surface + height + 1, z + dz, dim);
          if ev.world.get_block(pos)?.id() == block_ids::AIR {
            ev.world.set_block(pos, Block::new(block_ids::LEAVES))?;
          }
        }
      }
    }
    Ok(())
  }
}
