//! The persistence seam.
//!
//! The server itself never touches disk or a database directly. Everything it
//! stores goes through a [`DataProvider`]: settings as key/value strings,
//! columns as binary blobs, and lists (bans, whitelists and the like, which
//! live in modules) as multi-value keys. Providers are allowed to block; the
//! server only calls them from pool tasks.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
  collections::HashMap,
  fs, io,
  path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
  Debug,
  Info,
  Warning,
  Error,
}

pub trait DataProvider: Send + Sync {
  fn get_setting(&self, key: &str) -> Option<String>;
  fn set_setting(&self, key: &str, value: &str);
  fn delete_setting(&self, key: &str);

  fn get_binary(&self, key: &str) -> Option<Vec<u8>>;
  fn save_binary(&self, key: &str, bytes: &[u8]) -> io::Result<()>;

  fn get_values(&self, key: &str) -> Vec<Option<String>>;
  fn insert_value(&self, key: &str, value: &str);
  fn delete_values(&self, key: &str, value: &str);
  fn delete_key(&self, key: &str);

  fn write_log(&self, text: &str, level: LogLevel);
  fn write_chat_log(&self, from: &str, to: &str, message: &str, notes: &str);
}

/// Keeps everything in memory. Used by tests, and useful for throwaway
/// servers.
#[derive(Default)]
pub struct MemoryProvider {
  settings: Mutex<HashMap<String, String>>,
  binaries: Mutex<HashMap<String, Vec<u8>>>,
  values:   Mutex<HashMap<String, Vec<Option<String>>>>,
}

impl MemoryProvider {
  pub fn new() -> Self { MemoryProvider::default() }
}

impl DataProvider for MemoryProvider {
  fn get_setting(&self, key: &str) -> Option<String> { self.settings.lock().get(key).cloned() }
  fn set_setting(&self, key: &str, value: &str) {
    self.settings.lock().insert(key.into(), value.into());
  }
  fn delete_setting(&self, key: &str) { self.settings.lock().remove(key); }

  fn get_binary(&self, key: &str) -> Option<Vec<u8>> { self.binaries.lock().get(key).cloned() }
  fn save_binary(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
    self.binaries.lock().insert(key.into(), bytes.to_vec());
    Ok(())
  }

  fn get_values(&self, key: &str) -> Vec<Option<String>> {
    self.values.lock().get(key).cloned().unwrap_or_default()
  }
  fn insert_value(&self, key: &str, value: &str) {
    self.values.lock().entry(key.into()).or_default().push(Some(value.into()));
  }
  fn delete_values(&self, key: &str, value: &str) {
    if let Some(list) = self.values.lock().get_mut(key) {
      list.retain(|v| v.as_deref() != Some(value));
    }
  }
  fn delete_key(&self, key: &str) { self.values.lock().remove(key); }

  fn write_log(&self, _text: &str, _level: LogLevel) {}
  fn write_chat_log(&self, _from: &str, _to: &str, _message: &str, _notes: &str) {}
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct FileState {
  settings: HashMap<String, String>,
  values:   HashMap<String, Vec<Option<String>>>,
}

/// Stores settings and lists in a json file, and binary blobs as individual
/// files under `blobs/`. Writes go straight to disk; the server calls us from
/// pool tasks, so blocking here is fine.
pub struct FileProvider {
  dir:   PathBuf,
  state: Mutex<FileState>,
}

impl FileProvider {
  pub fn new(dir: impl AsRef<Path>) -> io::Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    fs::create_dir_all(dir.join("blobs"))?;
    let state = match fs::read(dir.join("data.json")) {
      Ok(data) => serde_json::from_slice(&data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
      Err(e) if e.kind() == io::ErrorKind::NotFound => FileState::default(),
      Err(e) => return Err(e),
    };
    Ok(FileProvider { dir, state: Mutex::new(state) })
  }

  fn flush(&self, state: &FileState) {
    let data = serde_json::to_vec_pretty(state).expect("settings are always serializable");
    if let Err(e) = fs::write(self.dir.join("data.json"), data) {
      error!("could not write data.json: {e}");
    }
  }

  fn blob_path(&self, key: &str) -> PathBuf {
    // Keys are things like `column_-3_7_0`, which are already safe file names.
    self.dir.join("blobs").join(key)
  }
}

impl DataProvider for FileProvider {
  fn get_setting(&self, key: &str) -> Option<String> {
    self.state.lock().settings.get(key).cloned()
  }
  fn set_setting(&self, key: &str, value: &str) {
    let mut state = self.state.lock();
    state.settings.insert(key.into(), value.into());
    self.flush(&state);
  }
  fn delete_setting(&self, key: &str) {
    let mut state = self.state.lock();
    state.settings.remove(key);
    self.flush(&state);
  }

  fn get_binary(&self, key: &str) -> Option<Vec<u8>> { fs::read(self.blob_path(key)).ok() }
  fn save_binary(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
    fs::write(self.blob_path(key), bytes)
  }

  fn get_values(&self, key: &str) -> Vec<Option<String>> {
    self.state.lock().values.get(key).cloned().unwrap_or_default()
  }
  fn insert_value(&self, key: &str, value: &str) {
    let mut state = self.state.lock();
    state.values.entry(key.into()).or_default().push(Some(value.into()));
    self.flush(&state);
  }
  fn delete_values(&self, key: &str, value: &str) {
    let mut state = self.state.lock();
    if let Some(list) = state.values.get_mut(key) {
      list.retain(|v| v.as_deref() != Some(value));
      self.flush(&state);
    }
  }
  fn delete_key(&self, key: &str) {
    let mut state = self.state.lock();
    state.values.remove(key);
    self.flush(&state);
  }

  fn write_log(&self, text: &str, level: LogLevel) {
    let line = format!("[{level:?}] {text}\n");
    if let Err(e) = fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(self.dir.join("server.log"))
      .and_then(|mut f| io::Write::write_all(&mut f, line.as_bytes()))
    {
      error!("could not append to server.log: {e}");
    }
  }
  fn write_chat_log(&self, from: &str, to: &str, message: &str, notes: &str) {
    let line = if notes.is_empty() {
      format!("{from} -> {to}: {message}\n")
    } else {
      format!("{from} -> {to}: {message} ({notes})\n")
    };
    if let Err(e) = fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(self.dir.join("chat.log"))
      .and_then(|mut f| io::Write::write_all(&mut f, line.as_bytes()))
    {
      error!("could not append to chat.log: {e}");
    }
  }
}
