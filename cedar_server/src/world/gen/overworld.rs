use super::{biome_ids, block_ids, Generator};
use cedar_common::{
  chunk::Block,
  math::{BlockId, Dimension},
};
use noise::{BasicMulti, NoiseFn, Seedable};

const SEA_FLOOR: f64 = 60.0;
const HILLS: f64 = 18.0;

/// The default overworld: a noise heightmap with stone under a few layers of
/// dirt and a grassy surface.
pub struct OverworldGenerator {
  height: BasicMulti,
  biomes: BasicMulti,
}

impl OverworldGenerator {
  pub fn new(seed: u64) -> Self {
    let mut height = BasicMulti::new().set_seed(seed as u32);
    height.octaves = 3;
    let mut biomes = BasicMulti::new().set_seed((seed >> 32) as u32 ^ 0x5eed);
    biomes.octaves = 1;
    OverworldGenerator { height, biomes }
  }

  fn height_at(&self, x: i32, z: i32) -> i32 {
    let n = self.height.get([x as f64 / 128.0, z as f64 / 128.0]);
    (SEA_FLOOR + n * HILLS) as i32
  }
}

impl Generator for OverworldGenerator {
  fn block(&self, id: BlockId) -> Block {
    let surface = self.height_at(id.x, id.z);
    let ty = if id.y == 0 {
      block_ids::BEDROCK
    } else if id.y < surface - 3 {
      block_ids::STONE
    } else if id.y < surface {
      block_ids::DIRT
    } else if id.y == surface {
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

  fn biome(&self, x: i32, z: i32, _dimension: Dimension) -> u8 {
    if self.biomes.get([x as f64 / 256.0, z as f64 / 256.0]) > 0.1 {
      biome_ids::FOREST
    } else {
      biome_ids::PLAINS
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn deterministic_for_a_seed() {
    let a = OverworldGenerator::new(12345);
    let b = OverworldGenerator::new(12345);
    for (x, z) in [(0, 0), (100, -40), (-512, 512)] {
      assert_eq!(a.height_at(x, z), b.height_at(x, z));
      assert_eq!(a.biome(x, z, 0), b.biome(x, z, 0));
    }
  }

  #[test]
  fn column_shape() {
    let gen = OverworldGenerator::new(1);
    let surface = gen.height_at(8, 8);
    assert!(surface > 16 && surface < 128, "surface {surface} out of range");
    assert_eq!(gen.block(BlockId::new(8, 0, 8, 0)).id(), block_ids::BEDROCK);
    assert_eq!(gen.block(BlockId::new(8, surface, 8, 0)).id(), block_ids::GRASS);
    assert_eq!(gen.block(BlockId::new(8, surface - 1, 8, 0)).id(), block_ids::DIRT);
    assert_eq!(gen.block(BlockId::new(8, surface + 1, 8, 0)).id(), block_ids::AIR);
  }
}
