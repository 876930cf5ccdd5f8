use crate::data::DataProvider;
use cedar_common::util;
use rand::{rngs::OsRng, RngCore};
use std::{net::SocketAddr, time::Duration};

pub const DEFAULT_WORLD_TYPE: &str = "DEFAULT";

/// Everything the server reads from the provider's settings table, resolved
/// against defaults. Settings are read once at install time and are read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
  /// The addresses to listen on.
  pub binds:                 Vec<SocketAddr>,
  /// The number of workers in the pool.
  pub num_threads:           u32,
  pub motd:                  String,
  /// Path to a png served in the status response, if set.
  pub favicon:               Option<String>,
  pub server_id:             String,
  pub max_players:           i32,
  pub maintenance_interval:  Duration,
  pub save_frequency:        Duration,
  pub keep_alive_interval:   Duration,
  pub keep_alive_timeout:    Duration,
  /// Packets this size and above are compressed. 0 disables compression.
  pub compression_threshold: i32,
  pub seed:                  u64,
  pub world_type:            String,
}

const DEFAULT_BINDS: &str = "0.0.0.0:25565;[::]:25565";

fn parse_binds(v: &str) -> Vec<SocketAddr> {
  let mut out = vec![];
  for part in v.split(';') {
    let part = part.trim();
    if part.is_empty() {
      continue;
    }
    match part.parse() {
      Ok(addr) => out.push(addr),
      Err(e) => warn!("ignoring invalid bind address {part:?}: {e}"),
    }
  }
  out
}

fn get_or<T: std::str::FromStr>(data: &dyn DataProvider, key: &str, default: T) -> T {
  match data.get_setting(key) {
    Some(v) => match v.parse() {
      Ok(v) => v,
      Err(_) => {
        warn!("setting {key} has invalid value {v:?}, using default");
        default
      }
    },
    None => default,
  }
}

/// Resolves the world seed. An integer setting is used as-is; any other
/// string is NFC-normalized and hashed with djb2; an absent setting gets a
/// fresh seed from the system CSPRNG, which is written back so the world
/// stays stable across restarts.
fn resolve_seed(data: &dyn DataProvider) -> u64 {
  match data.get_setting("seed") {
    Some(v) => match v.parse::<u64>() {
      Ok(seed) => {
        info!("set seed to {seed}");
        seed
      }
      Err(_) => {
        let seed = util::djb2(&v);
        info!("set seed to {v:?} => {seed}");
        seed
      }
    },
    None => {
      let mut bytes = [0; 8];
      OsRng.fill_bytes(&mut bytes);
      let seed = u64::from_be_bytes(bytes);
      data.set_setting("seed", &seed.to_string());
      info!("generated new seed - {seed}");
      seed
    }
  }
}

impl Settings {
  pub fn load(data: &dyn DataProvider) -> Self {
    let binds_str = data.get_setting("binds").unwrap_or_else(|| DEFAULT_BINDS.into());
    let mut binds = parse_binds(&binds_str);
    if binds.is_empty() {
      warn!("no usable bind addresses in {binds_str:?}, falling back to defaults");
      binds = parse_binds(DEFAULT_BINDS);
    }
    let world_type = match data.get_setting("world_type") {
      Some(v) if !v.is_empty() => v,
      _ => DEFAULT_WORLD_TYPE.into(),
    };
    info!("set world type to {world_type:?}");
    Settings {
      binds,
      num_threads: get_or(data, "num_threads", util::num_cpus() as u32).max(1),
      motd: data.get_setting("motd").unwrap_or_else(|| "A Cedar Server".into()),
      favicon: data.get_setting("favicon"),
      server_id: data.get_setting("server_id").unwrap_or_else(|| "Cedar".into()),
      max_players: get_or(data, "max_players", 20),
      maintenance_interval: Duration::from_millis(get_or(data, "maintenance_interval", 300_000)),
      save_frequency: Duration::from_millis(get_or(data, "save_frequency", 300_000)),
      keep_alive_interval: Duration::from_millis(get_or(data, "keep_alive_interval", 10_000)),
      keep_alive_timeout: Duration::from_millis(get_or(data, "keep_alive_timeout", 30_000)),
      compression_threshold: get_or(data, "compression_threshold", 256),
      seed: resolve_seed(data),
      world_type,
    }
  }
}
