//! The json document returned for a server list ping.

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct JsonStatus {
  pub version:     JsonVersion,
  pub players:     JsonPlayers,
  pub description: JsonDescription,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub favicon:     Option<String>,
}

#[derive(Debug, Serialize)]
pub struct JsonVersion {
  pub name:     String,
  pub protocol: i32,
}

#[derive(Debug, Serialize)]
pub struct JsonPlayers {
  pub max:    i32,
  pub online: i32,
  pub sample: Vec<JsonPlayer>,
}

#[derive(Debug, Serialize)]
pub struct JsonPlayer {
  pub name: String,
  pub id:   String,
}

#[derive(Debug, Serialize)]
pub struct JsonDescription {
  pub text: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn serializes_without_favicon() {
    let status = JsonStatus {
      version:     JsonVersion { name: "1.8.9".into(), protocol: 47 },
      players:     JsonPlayers { max: 20, online: 0, sample: vec![] },
      description: JsonDescription { text: "hello".into() },
      favicon:     None,
    };
    let json = serde_json::to_string(&status).unwrap();
    assert!(json.contains("\"protocol\":47"));
    assert!(json.contains("\"max\":20"));
    assert!(!json.contains("favicon"));
  }
}
