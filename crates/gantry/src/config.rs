use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::tunnel::codec::ProxyKind;

/// File names probed when only a directory is known, in preference order.
const CONFIG_FILE_NAMES: [&str; 3] = ["gantry.toml", "gantry.yaml", "gantry.yml"];

/// Where the active config path came from; shown in the startup log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigOrigin {
    CliFlag,
    EnvVar,
    WorkingDir,
    UserDir,
}

impl ConfigOrigin {
    fn as_str(self) -> &'static str {
        match self {
            ConfigOrigin::CliFlag => "--config",
            ConfigOrigin::EnvVar => "GANTRY_CONFIG",
            ConfigOrigin::WorkingDir => "working dir",
            ConfigOrigin::UserDir => "user dir",
        }
    }
}

impl std::fmt::Display for ConfigOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigPath {
    pub path: PathBuf,
    pub origin: ConfigOrigin,
}

/// Picks the config file to use: the `--config` flag, then `GANTRY_CONFIG`,
/// then a `gantry.*` file in the working directory, then the per-user config
/// directory. The chosen path may not exist yet; `seed_config_file` fills it
/// in.
pub fn locate_config(flag: Option<PathBuf>) -> anyhow::Result<ConfigPath> {
    if let Some(p) = flag {
        return Ok(ConfigPath {
            path: expand_candidate(p)?,
            origin: ConfigOrigin::CliFlag,
        });
    }

    // clap also feeds GANTRY_CONFIG into the flag; probing the variable again
    // here only serves to report the true origin when the flag was absent.
    match std::env::var_os("GANTRY_CONFIG") {
        Some(v) if !v.is_empty() => {
            return Ok(ConfigPath {
                path: expand_candidate(PathBuf::from(v))?,
                origin: ConfigOrigin::EnvVar,
            });
        }
        _ => {}
    }

    if let Some(found) = first_existing_in(Path::new(".")) {
        return Ok(ConfigPath {
            path: found,
            origin: ConfigOrigin::WorkingDir,
        });
    }

    let dirs = ProjectDirs::from("net", "gantry", "gantry")
        .ok_or_else(|| anyhow::anyhow!("config: cannot determine a per-user config directory"))?;
    Ok(ConfigPath {
        path: dirs.config_dir().join(CONFIG_FILE_NAMES[0]),
        origin: ConfigOrigin::UserDir,
    })
}

fn first_existing_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

/// Turns a user-supplied path into a concrete file path: directories are
/// probed for a `gantry.*` file, and a bare stem that does not exist yet
/// gets the `.toml` extension so it can be seeded.
fn expand_candidate(p: PathBuf) -> anyhow::Result<PathBuf> {
    anyhow::ensure!(
        !p.as_os_str().is_empty(),
        "config: the config path is empty"
    );
    if p.is_dir() {
        return Ok(first_existing_in(&p).unwrap_or_else(|| p.join(CONFIG_FILE_NAMES[0])));
    }
    if p.exists() || p.extension().is_some() {
        return Ok(p);
    }
    Ok(p.with_extension("toml"))
}

/// Writes a commented starter config if `path` does not exist yet. Returns
/// whether this call created the file.
pub fn seed_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.is_file() {
        return Ok(false);
    }
    if path.exists() {
        anyhow::bail!("config: {} is not a regular file", path.display());
    }

    let template = starter_template(path)?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("config: creating {}", dir.display()))?;
    }

    // create_new loses the race to a concurrent writer instead of clobbering
    // its file.
    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut f) => {
            use std::io::Write;
            f.write_all(template.as_bytes())
                .with_context(|| format!("config: seeding {}", path.display()))?;
            Ok(true)
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("config: seeding {}", path.display())),
    }
}

#[derive(Debug, Clone, Copy)]
enum ConfigFormat {
    Toml,
    Yaml,
}

fn format_of(path: &Path) -> anyhow::Result<ConfigFormat> {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("toml") => Ok(ConfigFormat::Toml),
        Some("yaml") | Some("yml") => Ok(ConfigFormat::Yaml),
        _ => anyhow::bail!(
            "config: {} must end in .toml, .yaml or .yml",
            path.display()
        ),
    }
}

fn starter_template(path: &Path) -> anyhow::Result<&'static str> {
    Ok(match format_of(path)? {
        ConfigFormat::Toml => STARTER_TOML,
        ConfigFormat::Yaml => STARTER_YAML,
    })
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let format = format_of(path)?;
    let text = fs::read_to_string(path)
        .with_context(|| format!("config: reading {}", path.display()))?;

    let fc: FileConfig = match format {
        ConfigFormat::Toml => {
            toml::from_str(&text).with_context(|| format!("config: toml in {}", path.display()))?
        }
        ConfigFormat::Yaml => serde_yaml::from_str(&text)
            .with_context(|| format!("config: yaml in {}", path.display()))?,
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub bind_port: u16,
    pub enable_tls: bool,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub auth_token: String,
    /// Inclusive public-port range enforced at registration; (0, 0) disables it.
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub handshake_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub shutdown_grace: Duration,
    pub udp_flow_idle_timeout: Duration,
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }

    pub fn port_range(&self) -> Option<(u16, u16)> {
        if self.port_range_start == 0 && self.port_range_end == 0 {
            None
        } else {
            Some((self.port_range_start, self.port_range_end))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server: String,
    pub token: String,
    pub tls: bool,
    pub tls_server_name: String,
    pub tls_insecure_skip_verify: bool,
    pub dial_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Sorted by name so registration order is deterministic.
    pub proxies: Vec<ProxyConfig>,
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub name: String,
    pub kind: ProxyKind,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    server: Option<FileServer>,
    client: Option<FileClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    add_source: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    bind_addr: Option<String>,
    bind_port: Option<u16>,
    #[serde(default)]
    enable_tls: bool,
    tls_cert_file: Option<String>,
    tls_key_file: Option<String>,
    auth_token: Option<String>,
    port_range_start: Option<u16>,
    port_range_end: Option<u16>,
    handshake_timeout_ms: Option<i64>,
    heartbeat_timeout_ms: Option<i64>,
    shutdown_grace_ms: Option<i64>,
    udp_flow_idle_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server: Option<String>,
    token: Option<String>,
    #[serde(default)]
    tls: bool,
    tls_server_name: Option<String>,
    #[serde(default)]
    tls_insecure_skip_verify: bool,
    dial_timeout_ms: Option<i64>,
    heartbeat_interval_ms: Option<i64>,
    heartbeat_timeout_ms: Option<i64>,
    #[serde(default)]
    proxies: BTreeMap<String, FileProxy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProxy {
    #[serde(rename = "type")]
    proxy_type: String,
    local_port: u16,
    remote_port: u16,
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    Duration::from_millis(v.map_or(default_ms, |ms| ms.max(0) as u64))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            logging: LoggingConfig::default(),
            server: None,
            client: None,
        };

        if let Some(l) = fc.logging {
            if let Some(v) = l.level {
                cfg.logging.level = v;
            }
            if let Some(v) = l.format {
                cfg.logging.format = v;
            }
            if let Some(v) = l.output {
                cfg.logging.output = v;
            }
            if let Some(v) = l.add_source {
                cfg.logging.add_source = v;
            }
        }

        if let Some(s) = fc.server {
            let auth_token = s.auth_token.unwrap_or_default().trim().to_string();
            if auth_token.is_empty() {
                anyhow::bail!("config: server.auth_token is required");
            }

            let start = s.port_range_start.unwrap_or(0);
            let end = s.port_range_end.unwrap_or(0);
            if (start == 0) != (end == 0) {
                anyhow::bail!(
                    "config: server.port_range_start and port_range_end must be set together"
                );
            }
            if start > end {
                anyhow::bail!("config: server.port_range_start {start} > port_range_end {end}");
            }

            cfg.server = Some(ServerConfig {
                bind_addr: s
                    .bind_addr
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .unwrap_or_else(|| "0.0.0.0".into()),
                bind_port: s.bind_port.unwrap_or(9000),
                enable_tls: s.enable_tls,
                tls_cert_file: s.tls_cert_file.unwrap_or_default().trim().to_string(),
                tls_key_file: s.tls_key_file.unwrap_or_default().trim().to_string(),
                auth_token,
                port_range_start: start,
                port_range_end: end,
                handshake_timeout: millis(s.handshake_timeout_ms, 10_000),
                heartbeat_timeout: millis(s.heartbeat_timeout_ms, 90_000),
                shutdown_grace: millis(s.shutdown_grace_ms, 5_000),
                udp_flow_idle_timeout: millis(s.udp_flow_idle_timeout_ms, 60_000),
            });
        }

        if let Some(c) = fc.client {
            let mut proxies = Vec::with_capacity(c.proxies.len());
            for (name, p) in c.proxies {
                let name = name.trim().to_string();
                if name.is_empty() {
                    anyhow::bail!("config: client proxy with empty name");
                }
                if name.len() > crate::tunnel::codec::MAX_NAME_BYTES {
                    anyhow::bail!("config: client proxy name {name:?} is too long");
                }
                let Some(kind) = ProxyKind::parse(&p.proxy_type) else {
                    anyhow::bail!(
                        "config: client proxy {name:?} has unknown type {:?} (expected tcp|udp)",
                        p.proxy_type
                    );
                };
                if p.local_port == 0 || p.remote_port == 0 {
                    anyhow::bail!("config: client proxy {name:?} ports must be in 1..=65535");
                }
                proxies.push(ProxyConfig {
                    name,
                    kind,
                    local_port: p.local_port,
                    remote_port: p.remote_port,
                });
            }

            cfg.client = Some(ClientConfig {
                server: c
                    .server
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .unwrap_or_else(|| "localhost:9000".into()),
                token: c.token.unwrap_or_default().trim().to_string(),
                tls: c.tls,
                tls_server_name: c.tls_server_name.unwrap_or_default().trim().to_string(),
                tls_insecure_skip_verify: c.tls_insecure_skip_verify,
                dial_timeout: millis(c.dial_timeout_ms, 5_000),
                heartbeat_interval: millis(c.heartbeat_interval_ms, 30_000),
                heartbeat_timeout: millis(c.heartbeat_timeout_ms, 90_000),
                proxies,
            });
        }

        Ok(cfg)
    }
}

const STARTER_TOML: &str = r#"# gantry configuration
#
# gantry runs in server mode, client mode, or both, depending on which
# sections are present.
#
# Server mode: accept tunnel sessions from clients and expose their
# registered ports on this host's public interface.
#
# [server]
# bind_addr = "0.0.0.0"
# bind_port = 9000
# auth_token = "change-me"
# enable_tls = false
# tls_cert_file = ""            # empty with enable_tls: self-signed
# tls_key_file = ""
# port_range_start = 0          # 0 = any port may be registered
# port_range_end = 0

[logging]
level = "info"                  # debug | info | warn | error
format = "text"                 # text | json
output = "stderr"               # stderr | stdout | discard | <file path>

# Client mode: connect out to a gantry server and expose local loopback
# services through it.
#
# [client]
# server = "tunnel.example.net:9000"
# token = "change-me"
# tls = false
#
# [client.proxies.web]
# type = "tcp"
# local_port = 3000
# remote_port = 8080
"#;

const STARTER_YAML: &str = r#"# gantry configuration
#
# gantry runs in server mode, client mode, or both, depending on which
# sections are present.

logging:
  level: info          # debug | info | warn | error
  format: text         # text | json
  output: stderr       # stderr | stdout | discard | <file path>

# server:
#   bind_addr: 0.0.0.0
#   bind_port: 9000
#   auth_token: change-me
#   enable_tls: false
#   tls_cert_file: ""  # empty with enable_tls: self-signed
#   tls_key_file: ""
#   port_range_start: 0
#   port_range_end: 0

# client:
#   server: tunnel.example.net:9000
#   token: change-me
#   tls: false
#   proxies:
#     web:
#       type: tcp
#       local_port: 3000
#       remote_port: 8080
"#;
