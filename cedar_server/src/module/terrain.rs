use super::Module;
use crate::{
  server::Server,
  world::gen::{FlatGenerator, OverworldGenerator, TreePopulator},
};
use std::sync::Arc;

/// Registers the built-in generators and populators: the noise overworld as
/// the dimension 0 default, the superflat generator under the `FLAT` world
/// type, and the tree populator.
pub struct TerrainModule;

impl Module for TerrainModule {
  fn name(&self) -> &'static str { "World Support" }
  fn priority(&self) -> u32 { 1 }

  fn install(&self, server: &Arc<Server>) {
    let world = server.world();
    let seed = world.seed();
    world.add_default_generator(0, Arc::new(OverworldGenerator::new(seed)));
    world.add_generator("FLAT", 0, Arc::new(FlatGenerator::default()));
    world.add_populator(0, 10, Arc::new(TreePopulator::new(seed)));

    let w = world.clone();
    server.events().on_shutdown(self.priority(), move || w.save_all());
  }
}
