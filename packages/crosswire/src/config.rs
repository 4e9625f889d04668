use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::EndpointId;
use crate::relay::DEFAULT_TOPIC;
use crate::relay::backoff::BackoffPolicy;

// =============================================================================
// File config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   config.toml:     [bus]
//                    url = "redis://10.0.0.5:6379"
//
//   env var:         CROSSWIRE_BUS__URL=redis://10.0.0.5:6379   (double underscore = nesting)
//
//   (single underscore stays within field names: CROSSWIRE_SERVER__PLAIN_PORT)
//
// Certificate paths under [[server.secure]] are relative to the config dir.

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub bus: BusFileConfig,
}

/// Listening endpoints (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    /// Insecure endpoint port
    #[serde(default = "default_plain_port")]
    pub plain_port: u16,
    /// Set to false to run TLS endpoints only
    #[serde(default = "default_plain_enabled")]
    pub plain_enabled: bool,
    #[serde(default = "default_secure_endpoints")]
    pub secure: Vec<SecureEndpointFileConfig>,
    /// Per-connection outbound queue length
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            plain_port: default_plain_port(),
            plain_enabled: default_plain_enabled(),
            secure: default_secure_endpoints(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

/// One `[[server.secure]]` entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureEndpointFileConfig {
    pub port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Redis,
    /// In-process only; direct messages reach other endpoints of this process
    Memory,
}

/// Cross-process bus (lives under `[bus]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusFileConfig {
    #[serde(default = "default_bus_kind")]
    pub kind: BusKind,
    /// Redis URL including host, port and credentials
    #[serde(default = "default_bus_url")]
    pub url: String,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default)]
    pub backoff: BackoffFileConfig,
}

impl Default for BusFileConfig {
    fn default() -> Self {
        Self {
            kind: default_bus_kind(),
            url: default_bus_url(),
            topic: default_topic(),
            backoff: BackoffFileConfig::default(),
        }
    }
}

/// Reconnect policy (lives under `[bus.backoff]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffFileConfig {
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_elapsed_secs")]
    pub max_elapsed_secs: u64,
}

impl Default for BackoffFileConfig {
    fn default() -> Self {
        Self {
            step_ms: default_step_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
            max_elapsed_secs: default_max_elapsed_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_plain_port() -> u16 {
    4002
}
fn default_plain_enabled() -> bool {
    true
}
fn default_secure_endpoints() -> Vec<SecureEndpointFileConfig> {
    vec![
        SecureEndpointFileConfig {
            port: 4000,
            cert_path: PathBuf::from("./ssl/swan.crt"),
            key_path: PathBuf::from("./ssl/swan.key"),
        },
        SecureEndpointFileConfig {
            port: 4001,
            cert_path: PathBuf::from("./ssl/public.crt"),
            key_path: PathBuf::from("./ssl/public.key"),
        },
    ]
}
fn default_outbound_queue() -> usize {
    100
}
fn default_bus_kind() -> BusKind {
    BusKind::Redis
}
fn default_bus_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_topic() -> String {
    DEFAULT_TOPIC.to_string()
}
fn default_step_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    3000
}
fn default_max_attempts() -> u32 {
    10
}
fn default_max_elapsed_secs() -> u64 {
    60 * 60
}

/// Build a figment that layers: defaults → config.toml → CROSSWIRE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CROSSWIRE_BUS__KIND=memory`  →  `bus.kind = "memory"`
///   `CROSSWIRE_SERVER__PLAIN_PORT=9000`  →  `server.plain_port = 9000`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("CROSSWIRE_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// TLS material for one secure endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// One listening endpoint (runtime view).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointConfig {
    pub port: EndpointId,
    pub tls: Option<TlsPaths>,
}

/// Server configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    /// Secure endpoints first, then the plain endpoint
    pub endpoints: Vec<EndpointConfig>,
    pub outbound_queue: usize,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Result<Self> {
        let mut endpoints: Vec<EndpointConfig> = fc
            .secure
            .iter()
            .map(|s| EndpointConfig {
                port: s.port,
                tls: Some(TlsPaths {
                    cert_path: s.cert_path.clone(),
                    key_path: s.key_path.clone(),
                }),
            })
            .collect();
        if fc.plain_enabled {
            endpoints.push(EndpointConfig {
                port: fc.plain_port,
                tls: None,
            });
        }

        if endpoints.is_empty() {
            bail!("no endpoints configured");
        }
        let mut seen = HashSet::new();
        for endpoint in &endpoints {
            // port 0 asks the OS for a free port, so repeats are fine
            if endpoint.port != 0 && !seen.insert(endpoint.port) {
                bail!("port {} is configured more than once", endpoint.port);
            }
        }

        Ok(Self {
            host: fc.host.clone(),
            endpoints,
            outbound_queue: fc.outbound_queue.max(1),
        })
    }
}

/// Bus configuration (runtime view).
#[derive(Clone, Debug)]
pub struct BusConfig {
    pub kind: BusKind,
    pub url: String,
    pub topic: String,
    pub backoff: BackoffPolicy,
}

impl BusConfig {
    pub fn from_file(fc: &BusFileConfig) -> Self {
        Self {
            kind: fc.kind,
            url: fc.url.clone(),
            topic: fc.topic.clone(),
            backoff: BackoffPolicy {
                step: Duration::from_millis(fc.backoff.step_ms),
                max_delay: Duration::from_millis(fc.backoff.max_delay_ms),
                max_attempts: fc.backoff.max_attempts,
                max_elapsed: Duration::from_secs(fc.backoff.max_elapsed_secs),
            },
        }
    }
}

/// Fully resolved configuration.
#[derive(Clone, Debug)]
pub struct CrosswireConfig {
    pub config_dir: PathBuf,
    pub server: ServerConfig,
    pub bus: BusConfig,
}

impl CrosswireConfig {
    /// Resolve from `config_dir` (defaults to the working directory).
    pub fn load(config_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = config_dir.unwrap_or_else(|| PathBuf::from("."));
        let fc: FileConfig = load_config(&config_dir)
            .extract()
            .with_context(|| format!("invalid configuration in {}", config_dir.display()))?;
        Self::from_file(config_dir, &fc)
    }

    pub fn from_file(config_dir: PathBuf, fc: &FileConfig) -> Result<Self> {
        let server = ServerConfig::from_file(&fc.server)?;
        let bus = BusConfig::from_file(&fc.bus);

        // Relative certificate paths are taken from the config directory.
        let endpoints = server
            .endpoints
            .into_iter()
            .map(|mut e| {
                if let Some(tls) = e.tls.as_mut() {
                    tls.cert_path = resolve(&config_dir, &tls.cert_path);
                    tls.key_path = resolve(&config_dir, &tls.key_path);
                }
                e
            })
            .collect();

        Ok(Self {
            server: ServerConfig { endpoints, ..server },
            bus,
            config_dir,
        })
    }

    pub fn config_toml_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }
}

fn resolve(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
