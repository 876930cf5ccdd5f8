#[macro_use]
extern crate log;

use cedar_server::{
  data::FileProvider,
  module::{
    HandshakeModule, KeepAliveModule, LoginModule, PlayModule, StatusModule, TerrainModule,
  },
  Server,
};
use clap::Parser;
use std::{path::PathBuf, sync::Arc};

#[derive(Parser, Debug)]
#[clap(about, version, author)]
struct Args {
  /// The directory the file-backed data provider keeps settings and column
  /// blobs under.
  #[clap(long, default_value = "data")]
  data_dir:  PathBuf,
  /// Log level (error, warn, info, debug, trace).
  #[clap(long, default_value = "info")]
  log_level: log::LevelFilter,
}

fn main() {
  let args = Args::parse();
  cedar_common::init_with_level("server", args.log_level);

  let data = match FileProvider::new(&args.data_dir) {
    Ok(v) => Arc::new(v),
    Err(e) => {
      error!("could not open data directory {:?}: {e}", args.data_dir);
      return;
    }
  };

  let server = match Server::new(data) {
    Ok(v) => v,
    Err(e) => {
      error!("could not create server: {e}");
      return;
    }
  };

  server.add_module(TerrainModule);
  server.add_module(HandshakeModule);
  server.add_module(StatusModule);
  server.add_module(LoginModule);
  server.add_module(KeepAliveModule);
  server.add_module(PlayModule);

  server.stop_on_ctrlc();

  match server.run() {
    Ok(()) => {}
    Err(e) => error!("error in connection handler: {e}"),
  }
}
