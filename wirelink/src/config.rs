//! Flags, config file, and the merged runtime configuration they produce.
//!
//! The config file lives at `{config_path}/wirelink.{iface}.{toml,json}`,
//! matching the `wirelink.<iface>.<ext>` convention the original tool uses;
//! a missing file is not an error, an unparseable one is.

use crate::{error::ConfigError, trust::Level};
use ipnet::IpNet;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};
use wireguard_control::{InterfaceName, Key};

/// Command line flags. `--router`/`--no-router` model the config file's
/// tri-state `Router *bool`: autodetect unless one of them is passed.
#[derive(clap::Parser, Debug)]
#[command(name = "wirelink", about = "Automatic WireGuard mesh configuration", version)]
pub struct Cli {
    /// Interface on which to operate.
    #[arg(long, default_value = "wg0")]
    pub iface: InterfaceName,

    /// Force router mode on.
    #[arg(long, conflicts_with = "no_router")]
    pub router: bool,

    /// Force router mode off.
    #[arg(long)]
    pub no_router: bool,

    /// Enable debug logging output.
    #[arg(long)]
    pub debug: bool,

    /// Send facts to every trusted peer regardless of FactExchanger config.
    #[arg(long)]
    pub chatty: bool,

    /// Dump the effective configuration instead of running.
    #[arg(long)]
    pub dump: bool,

    /// Directory to search for `wirelink.<iface>.{toml,json}`.
    #[arg(long, default_value = "/etc/wireguard")]
    pub config_path: PathBuf,
}

impl Cli {
    pub fn router_override(&self) -> Option<bool> {
        if self.router {
            Some(true)
        } else if self.no_router {
            Some(false)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    port: Option<u16>,
    router: Option<bool>,
    chatty: Option<bool>,
    peers: Vec<PeerFileEntry>,
    report_ifaces: Vec<String>,
    hide_ifaces: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PeerFileEntry {
    public_key: String,
    name: Option<String>,
    trust: Option<String>,
    #[serde(default)]
    fact_exchanger: bool,
    #[serde(default)]
    endpoints: Vec<String>,
    #[serde(default)]
    allowed_ips: Vec<String>,
    #[serde(default)]
    basic: bool,
}

/// A single configured peer, as distinct from whatever the kernel currently
/// reports: this is the operator's stated intent, which the local-fact
/// collector and trust evaluator both read from.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub name: Option<String>,
    pub trust: Option<Level>,
    pub fact_exchanger: bool,
    pub endpoints: Vec<String>,
    pub allowed_ips: Vec<IpNet>,
    pub basic: bool,
}

/// Accessors mirroring the original tool's `Peers` map, each falling back to
/// a sensible default for a peer that isn't explicitly configured.
#[derive(Debug, Clone, Default)]
pub struct PeerEntries(HashMap<Key, PeerEntry>);

impl PeerEntries {
    pub fn insert(&mut self, key: Key, entry: PeerEntry) {
        self.0.insert(key, entry);
    }

    pub fn name(&self, peer: &Key) -> String {
        self.0
            .get(peer)
            .and_then(|p| p.name.clone())
            .unwrap_or_else(|| peer.to_base64())
    }

    pub fn trust(&self, peer: &Key, default: Level) -> Level {
        self.0.get(peer).and_then(|p| p.trust).unwrap_or(default)
    }

    pub fn is_fact_exchanger(&self, peer: &Key) -> bool {
        self.0.get(peer).is_some_and(|p| p.fact_exchanger)
    }

    pub fn is_basic(&self, peer: &Key) -> bool {
        self.0.get(peer).is_some_and(|p| p.basic)
    }

    pub fn allowed_ips(&self, peer: &Key) -> &[IpNet] {
        self.0.get(peer).map_or(&[], |p| p.allowed_ips.as_slice())
    }

    pub fn endpoints(&self, peer: &Key) -> &[String] {
        self.0.get(peer).map_or(&[], |p| p.endpoints.as_slice())
    }

    pub fn trust_levels(&self) -> HashMap<Key, Level> {
        self.0
            .iter()
            .filter_map(|(k, p)| p.trust.map(|t| (k.clone(), t)))
            .collect()
    }

    pub fn fact_exchangers(&self) -> HashMap<Key, bool> {
        self.0.iter().map(|(k, p)| (k.clone(), p.fact_exchanger)).collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.0.keys()
    }
}

/// The fully resolved, ready-to-use configuration: CLI flags plus whatever
/// the config file contributed.
#[derive(Debug, Clone)]
pub struct Config {
    pub iface: InterfaceName,
    pub port: Option<u16>,
    pub router: Option<bool>,
    pub chatty: bool,
    pub debug: bool,
    pub dump: bool,
    pub peers: PeerEntries,
    pub report_ifaces: Vec<String>,
    pub hide_ifaces: Vec<String>,
}

impl Config {
    /// Loads and merges the config file (if present) with CLI flags. CLI
    /// flags win over file contents for the settings they control.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let file = load_file_config(&cli.config_path, &cli.iface)?;

        let mut peers = HashMap::new();
        for entry in file.peers {
            let key = Key::from_base64(&entry.public_key).map_err(|source| ConfigError::InvalidPublicKey {
                peer: entry.name.clone().unwrap_or_else(|| entry.public_key.clone()),
                source,
            })?;
            let trust = entry
                .trust
                .as_deref()
                .filter(|t| !t.is_empty())
                .map(|t| Level::parse(t).ok_or_else(|| ConfigError::InvalidTrustLevel(t.to_string())))
                .transpose()?;
            let allowed_ips = entry
                .allowed_ips
                .iter()
                .map(|raw| {
                    raw.parse::<IpNet>().map_err(|source| ConfigError::InvalidCidr {
                        peer: entry.name.clone().unwrap_or_else(|| entry.public_key.clone()),
                        value: raw.clone(),
                        source,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            for endpoint in &entry.endpoints {
                if let Err(reason) = validate_endpoint_syntax(endpoint) {
                    return Err(ConfigError::InvalidEndpoint {
                        peer: entry.name.clone().unwrap_or_else(|| entry.public_key.clone()),
                        value: endpoint.clone(),
                        reason,
                    });
                }
            }

            peers.insert(
                key,
                PeerEntry {
                    name: entry.name,
                    trust,
                    fact_exchanger: entry.fact_exchanger,
                    endpoints: entry.endpoints,
                    allowed_ips,
                    basic: entry.basic,
                },
            );
        }

        Ok(Config {
            iface: cli.iface.clone(),
            port: file.port,
            router: cli.router_override().or(file.router),
            chatty: cli.chatty || file.chatty.unwrap_or(false),
            debug: cli.debug,
            dump: cli.dump,
            peers: PeerEntries(peers),
            report_ifaces: file.report_ifaces,
            hide_ifaces: file.hide_ifaces,
        })
    }
}

/// Checks that an endpoint is syntactically `host:port`, without resolving
/// it: a hostname that doesn't exist yet (or only resolves on the peer's
/// side of a split-horizon DNS setup) is not a configuration error, only a
/// genuinely malformed `host:port` string is.
fn validate_endpoint_syntax(value: &str) -> Result<(), String> {
    if value.parse::<std::net::SocketAddr>().is_ok() {
        return Ok(());
    }
    let Some((host, port)) = value.rsplit_once(':') else {
        return Err("expected host:port".to_string());
    };
    if host.is_empty() {
        return Err("missing host".to_string());
    }
    port.parse::<u16>().map_err(|_| format!("invalid port '{port}'"))?;
    Ok(())
}

fn load_file_config(config_path: &std::path::Path, iface: &InterfaceName) -> Result<FileConfig, ConfigError> {
    for (ext, parse): (&str, fn(&str) -> Result<FileConfig, crate::error::ParseFormatError>) = &[
        ("toml", |s| toml::from_str(s).map_err(Into::into)),
        ("json", |s| serde_json::from_str(s).map_err(Into::into)),
    ] {
        let path = config_path.join(format!("wirelink.{iface}.{ext}"));
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                return parse(&contents).map_err(|source| ConfigError::Parse { path, source });
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(source) => return Err(ConfigError::Read { path, source }),
        }
    }

    let yaml_path = config_path.join(format!("wirelink.{iface}.yaml"));
    if yaml_path.exists() {
        return Err(ConfigError::Parse {
            path: yaml_path,
            source: crate::error::YamlNotSupported.into(),
        });
    }

    Ok(FileConfig::default())
}
