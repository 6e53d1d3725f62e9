//! Process configuration: CLI flags plus the optional external proxy list.
//!
//! Everything the server needs at runtime is collected into one [`Config`]
//! that the binary builds from the parsed [`Cli`] and hands around behind an
//! `Arc`. The external proxy list is a JSON side file; one entry may omit
//! `addr` to describe this server itself, contributing only its coordinates
//! (and optionally the base address) to the configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use thiserror::Error;

/// File probed for proxy entries when `--external-proxies` is not given.
pub const DEFAULT_PROXY_FILE: &str = "external_proxies.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read external proxy list {path}: {source}")]
    ProxyFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse external proxy list {path}: {source}")]
    ProxyParse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("the external proxy list may mark at most one entry as this server (missing addr)")]
    MultipleLocalProxies,
}

/// World Beacon -- rendezvous, relay, and NAT traversal for game sessions.
#[derive(Parser, Debug)]
#[command(name = "world-beacon-server")]
#[command(about = "Rendezvous, relay, and NAT traversal server for World Beacon game sessions")]
#[command(version)]
pub struct Cli {
    /// Port to bind to.
    #[arg(short = 'p', long, default_value_t = 9646, env = "WORLD_BEACON_PORT")]
    pub port: u16,

    /// Base address to use for proxy connections.
    #[arg(short = 'a', long, env = "WORLD_BEACON_BASE_ADDR")]
    pub base_addr: Option<String>,

    /// Port to use for Java Edition proxy connections.
    #[arg(
        short = 'j',
        long,
        default_value_t = 25565,
        env = "WORLD_BEACON_IN_JAVA_PORT"
    )]
    pub in_java_port: u16,

    /// External port to use for Java Edition proxy connections.
    /// Defaults to the in-java-port.
    #[arg(short = 'J', long, env = "WORLD_BEACON_EX_JAVA_PORT")]
    pub ex_java_port: Option<u16>,

    /// UDP port for hole-punch coordination. 0 disables punching.
    #[arg(long, default_value_t = 0, env = "WORLD_BEACON_PUNCH_PORT")]
    pub punch_port: u16,

    /// Seconds between analytics snapshots. 0 disables analytics.
    #[arg(long, default_value_t = 0, env = "WORLD_BEACON_ANALYTICS_INTERVAL_SECS")]
    pub analytics_interval_secs: u64,

    /// CSV file analytics snapshots are appended to.
    #[arg(
        long,
        value_name = "FILE",
        default_value = "analytics.csv",
        env = "WORLD_BEACON_ANALYTICS_FILE"
    )]
    pub analytics_file: PathBuf,

    /// Shut down cleanly after this many seconds. Useful for restart scripts.
    #[arg(long, env = "WORLD_BEACON_SHUTDOWN_AFTER_SECS")]
    pub shutdown_after_secs: Option<u64>,

    /// How long a new session may wait for a colliding connection ID to clear.
    #[arg(long, default_value_t = 500, env = "WORLD_BEACON_ID_COLLISION_GRACE_MS")]
    pub id_collision_grace_ms: u64,

    /// How long a relay circuit survives its owner's disconnect before closing.
    #[arg(
        long,
        default_value_t = 5,
        env = "WORLD_BEACON_RELAY_RECONNECT_GRACE_SECS"
    )]
    pub relay_reconnect_grace_secs: u64,

    /// Path to the external proxy list. Without this flag,
    /// external_proxies.json in the working directory is used when present.
    #[arg(long, value_name = "FILE", env = "WORLD_BEACON_EXTERNAL_PROXIES")]
    pub external_proxies: Option<PathBuf>,

    /// Path to the IP geolocation CSV database.
    #[arg(long, value_name = "FILE", env = "WORLD_BEACON_GEO_DB")]
    pub geo_db: Option<PathBuf>,

    /// Directory for daily-rolling log files, in addition to stdout.
    #[arg(long, value_name = "DIR", env = "WORLD_BEACON_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "world_beacon_server=trace".
    /// Takes precedence over RUST_LOG.
    #[arg(long, env = "WORLD_BEACON_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExternalProxy {
    #[serde(default)]
    addr: Option<String>,
    #[serde(default = "default_proxy_port")]
    port: u16,
    #[serde(default)]
    base_addr: Option<String>,
    #[serde(default)]
    mc_port: Option<u16>,
    lat_long: (f64, f64),
}

fn default_proxy_port() -> u16 {
    25565
}

/// One entry from the external proxy list.
///
/// `base_addr` defaults to `addr` and `mc_port` to `port`, so most entries
/// only spell out `addr` and `latLong`. Sessions are pointed at whichever
/// entry is closest to them, and a granted proxy join is rendered against
/// that entry's `base_addr`/`mc_port`.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "RawExternalProxy")]
pub struct ExternalProxy {
    pub addr: Option<String>,
    pub port: u16,
    pub base_addr: Option<String>,
    pub mc_port: u16,
    /// `[lat, lon]` in degrees; drives closest-proxy selection.
    pub lat_long: (f64, f64),
}

impl From<RawExternalProxy> for ExternalProxy {
    fn from(raw: RawExternalProxy) -> Self {
        Self {
            base_addr: raw
                .base_addr
                .filter(|addr| !addr.is_empty())
                .or_else(|| raw.addr.clone()),
            mc_port: raw.mc_port.unwrap_or(raw.port),
            addr: raw.addr,
            port: raw.port,
            lat_long: raw.lat_long,
        }
    }
}

/// Resolved runtime configuration.
#[derive(Debug)]
pub struct Config {
    pub port: u16,
    pub base_addr: Option<String>,
    pub in_java_port: u16,
    pub ex_java_port: u16,
    pub punch_port: u16,
    /// Zero means analytics are disabled.
    pub analytics_interval: Duration,
    pub analytics_file: PathBuf,
    pub shutdown_after: Option<Duration>,
    pub id_collision_grace: Duration,
    pub relay_reconnect_grace: Duration,
    pub external_proxies: Option<Vec<Arc<ExternalProxy>>>,
    pub geo_db: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub log_level: Option<String>,
}

impl Config {
    /// Resolves the parsed CLI into a runtime configuration, loading and
    /// validating the external proxy list along the way.
    pub fn load(cli: Cli) -> Result<Self, ConfigError> {
        let external_proxies = match &cli.external_proxies {
            Some(path) => Some(load_proxies(path)?),
            None => {
                let fallback = Path::new(DEFAULT_PROXY_FILE);
                if fallback.exists() {
                    Some(load_proxies(fallback)?)
                } else {
                    None
                }
            }
        };

        let mut base_addr = cli.base_addr;
        if let Some(proxies) = &external_proxies {
            if proxies.iter().filter(|proxy| proxy.addr.is_none()).count() > 1 {
                return Err(ConfigError::MultipleLocalProxies);
            }
            let local_base = proxies
                .iter()
                .find(|proxy| proxy.addr.is_none())
                .and_then(|proxy| proxy.base_addr.clone());
            if let Some(local_base) = local_base {
                if base_addr.is_none() {
                    base_addr = Some(local_base);
                } else {
                    tracing::info!(
                        "Both the CLI and the external proxy list specify a base address \
                         for the local server."
                    );
                    tracing::info!("--base-addr from the CLI takes precedence.");
                }
            }
        }

        Ok(Self {
            port: cli.port,
            base_addr,
            in_java_port: cli.in_java_port,
            ex_java_port: cli.ex_java_port.unwrap_or(cli.in_java_port),
            punch_port: cli.punch_port,
            analytics_interval: Duration::from_secs(cli.analytics_interval_secs),
            analytics_file: cli.analytics_file,
            shutdown_after: cli.shutdown_after_secs.map(Duration::from_secs),
            id_collision_grace: Duration::from_millis(cli.id_collision_grace_ms),
            relay_reconnect_grace: Duration::from_secs(cli.relay_reconnect_grace_secs),
            external_proxies,
            geo_db: cli.geo_db,
            log_dir: cli.log_dir,
            log_level: cli.log_level,
        })
    }
}

fn load_proxies(path: &Path) -> Result<Vec<Arc<ExternalProxy>>, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ProxyFile {
        path: path.to_path_buf(),
        source,
    })?;
    let proxies: Vec<ExternalProxy> =
        serde_json::from_str(&contents).map_err(|source| ConfigError::ProxyParse {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(proxies.into_iter().map(Arc::new).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        let mut full = vec!["world-beacon-server"];
        full.extend_from_slice(args);
        Cli::try_parse_from(full).expect("CLI should parse")
    }

    fn proxy_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(contents.as_bytes()).expect("write proxies");
        file
    }

    #[test]
    fn cli_defaults_match_the_documented_ports() {
        let config = Config::load(parse(&[])).expect("load");
        assert_eq!(config.port, 9646);
        assert_eq!(config.in_java_port, 25565);
        assert_eq!(config.ex_java_port, 25565);
        assert_eq!(config.punch_port, 0);
        assert_eq!(config.base_addr, None);
        assert_eq!(config.analytics_interval, Duration::ZERO);
        assert_eq!(config.shutdown_after, None);
        assert_eq!(config.id_collision_grace, Duration::from_millis(500));
        assert_eq!(config.relay_reconnect_grace, Duration::from_secs(5));
    }

    #[test]
    fn explicit_flags_override_the_defaults() {
        let config = Config::load(parse(&[
            "--port",
            "9647",
            "--base-addr",
            "wh.example.com",
            "--in-java-port",
            "25566",
            "--ex-java-port",
            "443",
            "--punch-port",
            "9648",
            "--shutdown-after-secs",
            "3600",
        ]))
        .expect("load");
        assert_eq!(config.port, 9647);
        assert_eq!(config.base_addr.as_deref(), Some("wh.example.com"));
        assert_eq!(config.in_java_port, 25566);
        assert_eq!(config.ex_java_port, 443);
        assert_eq!(config.punch_port, 9648);
        assert_eq!(config.shutdown_after, Some(Duration::from_secs(3600)));
    }

    #[test]
    fn short_flags_are_the_historical_ones() {
        let cli = parse(&["-p", "1234", "-a", "base.example.com", "-j", "42", "-J", "43"]);
        assert_eq!(cli.port, 1234);
        assert_eq!(cli.base_addr.as_deref(), Some("base.example.com"));
        assert_eq!(cli.in_java_port, 42);
        assert_eq!(cli.ex_java_port, Some(43));
    }

    #[test]
    fn proxy_entries_fill_in_their_defaults() {
        let parsed: Vec<ExternalProxy> = serde_json::from_str(
            r#"[
                {"addr": "eu.example.com", "latLong": [50.0, 8.0]},
                {"addr": "us.example.com", "port": 25570, "mcPort": 443, "latLong": [39.0, -98.0]},
                {"baseAddr": "local.example.com", "latLong": [35.0, 139.0]}
            ]"#,
        )
        .expect("parse proxies");

        assert_eq!(parsed[0].addr.as_deref(), Some("eu.example.com"));
        assert_eq!(parsed[0].port, 25565);
        assert_eq!(parsed[0].base_addr.as_deref(), Some("eu.example.com"));
        assert_eq!(parsed[0].mc_port, 25565);

        assert_eq!(parsed[1].port, 25570);
        assert_eq!(parsed[1].base_addr.as_deref(), Some("us.example.com"));
        assert_eq!(parsed[1].mc_port, 443);

        assert_eq!(parsed[2].addr, None);
        assert_eq!(parsed[2].base_addr.as_deref(), Some("local.example.com"));
        assert_eq!(parsed[2].lat_long, (35.0, 139.0));
    }

    #[test]
    fn a_local_entry_contributes_the_base_address() {
        let file = proxy_file(
            r#"[
                {"addr": "eu.example.com", "latLong": [50.0, 8.0]},
                {"baseAddr": "local.example.com", "latLong": [35.0, 139.0]}
            ]"#,
        );
        let path = file.path().to_str().expect("utf-8 temp path");

        let adopted =
            Config::load(parse(&["--external-proxies", path])).expect("load");
        assert_eq!(adopted.base_addr.as_deref(), Some("local.example.com"));

        let overridden = Config::load(parse(&[
            "--external-proxies",
            path,
            "--base-addr",
            "cli.example.com",
        ]))
        .expect("load");
        assert_eq!(overridden.base_addr.as_deref(), Some("cli.example.com"));
    }

    #[test]
    fn more_than_one_local_entry_is_rejected() {
        let file = proxy_file(
            r#"[
                {"latLong": [1.0, 2.0]},
                {"latLong": [3.0, 4.0]}
            ]"#,
        );
        let path = file.path().to_str().expect("utf-8 temp path");

        let err = Config::load(parse(&["--external-proxies", path]))
            .expect_err("two local entries");
        assert!(matches!(err, ConfigError::MultipleLocalProxies));
    }

    #[test]
    fn a_missing_explicit_proxy_file_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nope.json");
        let err = Config::load(parse(&[
            "--external-proxies",
            path.to_str().expect("utf-8 temp path"),
        ]))
        .expect_err("missing file");
        assert!(matches!(err, ConfigError::ProxyFile { .. }));
    }

    #[test]
    fn a_malformed_proxy_file_names_itself() {
        let file = proxy_file(r#"{"not": "a list"}"#);
        let err = Config::load(parse(&[
            "--external-proxies",
            file.path().to_str().expect("utf-8 temp path"),
        ]))
        .expect_err("malformed file");
        let rendered = err.to_string();
        assert!(rendered.contains("failed to parse external proxy list"), "{rendered}");
    }
}
