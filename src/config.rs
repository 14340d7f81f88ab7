//! JSON configuration file for kurafuto.

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// A single backend Minecraft Classic server. The first entry in
/// `Config::servers` is the hub: the default upstream every client is
/// proxied to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub name: String,
    pub motd: String,
    pub address: String,
    pub port: u16,
    #[serde(rename = "verify-names")]
    pub verify_names: bool,
    pub heartbeat: bool,
    #[serde(rename = "edge-commands")]
    pub edge_commands: bool,
    pub servers: Vec<ServerEntry>,
    #[serde(
        rename = "ignore-packets",
        deserialize_with = "de_id_list",
        serialize_with = "se_id_list",
        default
    )]
    pub ignore_packets: HashSet<u8>,
    #[serde(
        rename = "drop-packets",
        deserialize_with = "de_id_list",
        serialize_with = "se_id_list",
        default
    )]
    pub drop_packets: HashSet<u8>,
    #[serde(rename = "drop-extensions", default)]
    pub drop_extensions: HashSet<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: "kurafuto".to_string(),
            motd: "A Kurafuto proxy".to_string(),
            address: "0.0.0.0".to_string(),
            port: 25565,
            verify_names: false,
            heartbeat: false,
            edge_commands: false,
            servers: Vec::new(),
            ignore_packets: HashSet::new(),
            drop_packets: HashSet::new(),
            drop_extensions: HashSet::new(),
        }
    }
}

/// Comma-separated packet ids, each decimal or `0x`-prefixed hex, e.g.
/// `"0x0d,3"`. Used for both `ignore-packets` and `drop-packets`.
fn parse_id_list(s: &str) -> Result<HashSet<u8>> {
    let mut out = HashSet::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let id = if let Some(hex) = part.strip_prefix("0x").or_else(|| part.strip_prefix("0X")) {
            u8::from_str_radix(hex, 16)
        } else {
            part.parse::<u8>()
        }
        .with_context(|| format!("invalid packet id '{part}'"))?;
        out.insert(id);
    }
    Ok(out)
}

fn de_id_list<'de, D>(deserializer: D) -> std::result::Result<HashSet<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_id_list(&s).map_err(serde::de::Error::custom)
}

fn se_id_list<S>(ids: &HashSet<u8>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    let mut ids: Vec<u8> = ids.iter().copied().collect();
    ids.sort_unstable();
    let s = ids
        .iter()
        .map(|id| format!("0x{id:02x}"))
        .collect::<Vec<_>>()
        .join(",");
    serializer.serialize_str(&s)
}

static NAME_PATTERN: &str = r"^[A-Za-z_-][A-Za-z0-9_-]*$";

fn validate_server_names(servers: &[ServerEntry]) -> Result<()> {
    let re = Regex::new(NAME_PATTERN).expect("static regex is valid");
    for server in servers {
        if !re.is_match(&server.name) {
            bail!(
                "server name '{}' does not match {}",
                server.name,
                NAME_PATTERN
            );
        }
    }
    Ok(())
}

impl Config {
    /// The hub is the first configured server; every newly connected client
    /// is dialed to it by default.
    pub fn hub(&self) -> Result<&ServerEntry> {
        self.servers
            .first()
            .context("kurafuto: need at least 1 server in config")
    }

    /// Re-serializes the loaded config, pretty-printed, for `-v 2` startup
    /// logging.
    pub fn to_pretty_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Loads and validates a config file from disk.
pub fn load(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config = serde_json::from_str(&contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    if config.servers.is_empty() {
        bail!("kurafuto: need at least 1 server in config");
    }
    validate_server_names(&config.servers)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "name": "Test Proxy",
            "motd": "Welcome!",
            "address": "0.0.0.0",
            "port": 25565,
            "verify-names": true,
            "edge-commands": true,
            "servers": [
                {"name": "hub", "address": "127.0.0.1", "port": 25566}
            ],
            "drop-packets": "0x0d,3",
            "ignore-packets": "1"
        }"#
    }

    #[test]
    fn parses_full_config() {
        let config: Config = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(config.name, "Test Proxy");
        assert!(config.verify_names);
        assert!(config.edge_commands);
        assert_eq!(config.servers[0].name, "hub");
        assert_eq!(config.drop_packets, HashSet::from([0x0d, 3]));
        assert_eq!(config.ignore_packets, HashSet::from([1]));
    }

    #[test]
    fn rejects_bad_server_name() {
        let servers = vec![ServerEntry {
            name: "bad name!".to_string(),
            address: "x".to_string(),
            port: 1,
        }];
        assert!(validate_server_names(&servers).is_err());
    }

    #[test]
    fn accepts_good_server_name() {
        let servers = vec![ServerEntry {
            name: "hub-1".to_string(),
            address: "x".to_string(),
            port: 1,
        }];
        assert!(validate_server_names(&servers).is_ok());
    }

    #[test]
    fn round_trips_through_pretty_json() {
        let config: Config = serde_json::from_str(sample_json()).unwrap();
        let json = config.to_pretty_json().unwrap();
        let reparsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(reparsed.drop_packets, config.drop_packets);
    }
}
