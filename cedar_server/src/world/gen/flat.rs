use super::{biome_ids, block_ids, Generator};
use cedar_common::{
  chunk::Block,
  math::{BlockId, Dimension},
};

/// A superflat world: one layer of bedrock, a few of stone, and a grassy
/// top, with plains all around.
pub struct FlatGenerator {
  /// Total ground height, including the bedrock layer. Clamped to 2..=254.
  layers: i32,
}

impl FlatGenerator {
  pub fn new(layers: i32) -> Self { FlatGenerator { layers: layers.clamp(2, 254) } }
}

impl Default for FlatGenerator {
  fn default() -> Self { FlatGenerator::new(4) }
}

impl Generator for FlatGenerator {
  fn block(&self, id: BlockId) -> Block {
    let ty = if id.y == 0 {
      block_ids::BEDROCK
    } else if id.y < self.layers - 1 {
      block_ids::STONE
    } else if id.y == self.layers - 1 {
      block_ids::GRASS
    } else {
      block_ids::AIR
    };
    let mut b = Block::new(ty);
    if ty == block_ids::AIR {
      b.set_skylight(15);
    }
    b
  }

  fn biome(&self, _x: i32, _z: i32, _dimension: Dimension) -> u8 { biome_ids::PLAINS }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn layer_stack() {
    let gen = FlatGenerator::new(4);
    assert_eq!(gen.block(BlockId::new(0, 0, 0, 0)).id(), block_ids::BEDROCK);
    assert_eq!(gen.block(BlockId::new(0, 1, 0, 0)).id(), block_ids::STONE);
    assert_eq!(gen.block(BlockId::new(0, 2, 0, 0)).id(), block_ids::STONE);
    assert_eq!(gen.block(BlockId::new(0, 3, 0, 0)).id(), block_ids::GRASS);
    let air = gen.block(BlockId::new(0, 4, 0, 0));
    assert_eq!(air.id(), block_ids::AIR);
    assert_eq!(air.skylight(), 15);
    assert_eq!(gen.biome(-100, 3, 0), biome_ids::PLAINS);
  }

  #[test]
  fn degenerate_heights_are_clamped() {
    let gen = FlatGenerator::new(0);
    assert_eq!(gen.block(BlockId::new(0, 0, 0, 0)).id(), block_ids::BEDROCK);
    assert_eq!(gen.block(BlockId::new(0, 1, 0, 0)).id(), block_ids::GRASS);
  }
}
