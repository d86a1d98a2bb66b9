use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::subway::net::normalize_bind_addr;
use crate::subway::tunnel::frame::TunnelProto;
use crate::subway::tunnel::registry::normalize_subdomain;
use crate::subway::tunnel::stream::DEFAULT_WINDOW;
use crate::subway::tunnel::transport::{DEFAULT_WS_PATH, parse_transport};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps SUBWAY_CONFIG into the flag already; this covers callers that
    // bypass the CLI.
    if let Some(p) = std::env::var_os("SUBWAY_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(&p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("subway.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["subway.toml", "subway.yaml", "subway.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no subway.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/subway/subway.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("com", "subway", "subway")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("subway.toml"))
    }
}

/// Writes the runnable default template when `path` does not exist yet.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match config_ext(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        ext => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub server: Option<ServerConfig>,
    pub client: Option<ClientConfig>,
    pub session: SessionSettings,
    pub stream: StreamSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub transport: String,
    pub ws_path: String,
    /// Public HTTP ingress; empty disables it.
    pub http_addr: String,
    pub domain: String,
    pub public_scheme: String,
    pub tcp_bind_host: String,
    pub auth_tokens: Vec<String>,
    pub tls: TlsServerConfig,
    pub max_header_bytes: usize,
    pub header_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct TlsServerConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub transport: String,
    pub ws_path: String,
    pub subdomain: String,
    pub token: String,
    pub proto: TunnelProto,
    pub local_addr: String,
    pub remote_port: u16,
    pub dial_timeout: Duration,
    pub tls: TlsClientConfig,
}

#[derive(Debug, Clone, Default)]
pub struct TlsClientConfig {
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub ca_file: String,
}

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub window: u32,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub handshake_timeout: Duration,
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Client side: how long dialing the local service may take.
    pub dial_timeout: Duration,
    /// Inactivity after which a stream is reset; zero disables.
    pub idle_timeout: Duration,
    pub buffer_size: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    server: Option<FileServer>,
    client: Option<FileClient>,
    session: Option<FileSession>,
    stream: Option<FileStream>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    transport: Option<String>,
    ws_path: Option<String>,
    http_addr: Option<String>,
    domain: Option<String>,
    public_scheme: Option<String>,
    tcp_bind_host: Option<String>,
    #[serde(default)]
    auth_tokens: Vec<String>,
    tls: Option<FileTlsServer>,
    max_header_bytes: Option<i64>,
    header_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTlsServer {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    server_addr: String,
    transport: Option<String>,
    ws_path: Option<String>,
    subdomain: String,
    token: Option<String>,
    proto: Option<String>,
    local_addr: Option<String>,
    #[serde(default)]
    remote_port: u16,
    dial_timeout_ms: Option<i64>,
    tls: Option<FileTlsClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTlsClient {
    server_name: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
    ca_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSession {
    window: Option<u32>,
    heartbeat_interval_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    handshake_timeout_ms: Option<i64>,
    drain_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileStream {
    dial_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    buffer_size: Option<i64>,
}

fn trimmed(v: &Option<String>) -> String {
    v.as_deref().unwrap_or("").trim().to_string()
}

fn or_default(v: &Option<String>, default: &str) -> String {
    let s = trimmed(v);
    if s.is_empty() { default.to_string() } else { s }
}

/// Negative values clamp to zero; `None` takes the default.
fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) => Duration::from_millis(ms.max(0) as u64),
        None => Duration::from_millis(default_ms),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: normalize_bind_addr(&fc.admin_addr).into_owned(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            server: None,
            client: None,
            session: SessionSettings {
                window: DEFAULT_WINDOW,
                heartbeat_interval: Duration::from_secs(15),
                idle_timeout: Duration::from_secs(60),
                handshake_timeout: Duration::from_secs(10),
                drain_timeout: Duration::from_secs(5),
            },
            stream: StreamSettings {
                dial_timeout: Duration::from_secs(10),
                idle_timeout: Duration::from_secs(30),
                buffer_size: 32 * 1024,
            },
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            cfg.logging.level = or_default(&l.level, &cfg.logging.level);
            cfg.logging.format = or_default(&l.format, &cfg.logging.format);
            cfg.logging.output = or_default(&l.output, &cfg.logging.output);
            cfg.logging.add_source = l.add_source;
        }

        // --- Session / stream ---
        if let Some(s) = &fc.session {
            let d = cfg.session;
            cfg.session = SessionSettings {
                window: s.window.filter(|w| *w > 0).unwrap_or(d.window),
                heartbeat_interval: millis(s.heartbeat_interval_ms, 15_000),
                idle_timeout: millis(s.idle_timeout_ms, 60_000),
                handshake_timeout: millis(s.handshake_timeout_ms, 10_000),
                drain_timeout: millis(s.drain_timeout_ms, 5_000),
            };
            if cfg.session.handshake_timeout.is_zero() {
                cfg.session.handshake_timeout = d.handshake_timeout;
            }
        }
        if let Some(s) = &fc.stream {
            cfg.stream.dial_timeout = millis(s.dial_timeout_ms, 10_000);
            if cfg.stream.dial_timeout.is_zero() {
                cfg.stream.dial_timeout = Duration::from_secs(10);
            }
            cfg.stream.idle_timeout = millis(s.idle_timeout_ms, 30_000);
            if let Some(n) = s.buffer_size.filter(|n| *n > 0) {
                cfg.stream.buffer_size = n as usize;
            }
        }

        // --- Server ---
        if let Some(s) = &fc.server {
            let transport = parse_transport(s.transport.as_deref().unwrap_or(""))
                .context("config: server.transport")?;
            let domain = trimmed(&s.domain).to_ascii_lowercase();
            if domain.is_empty() {
                anyhow::bail!("config: server.domain is required");
            }
            let public_scheme = or_default(&s.public_scheme, "http").to_ascii_lowercase();
            if public_scheme != "http" && public_scheme != "https" {
                anyhow::bail!(
                    "config: server.public_scheme must be http or https, got {public_scheme:?}"
                );
            }
            let max_header_bytes = match s.max_header_bytes {
                Some(n) if n > 0 => n as usize,
                _ => 64 * 1024,
            };
            let mut header_timeout = millis(s.header_timeout_ms, 10_000);
            if header_timeout.is_zero() {
                header_timeout = Duration::from_secs(10);
            }
            cfg.server = Some(ServerConfig {
                listen_addr: normalize_bind_addr(&or_default(&s.listen_addr, ":7000")).into_owned(),
                transport,
                ws_path: or_default(&s.ws_path, DEFAULT_WS_PATH),
                http_addr: normalize_bind_addr(&trimmed(&s.http_addr)).into_owned(),
                domain,
                public_scheme,
                tcp_bind_host: or_default(&s.tcp_bind_host, "0.0.0.0"),
                auth_tokens: s
                    .auth_tokens
                    .iter()
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect(),
                tls: TlsServerConfig {
                    cert_file: s.tls.as_ref().map(|t| trimmed(&t.cert_file)).unwrap_or_default(),
                    key_file: s.tls.as_ref().map(|t| trimmed(&t.key_file)).unwrap_or_default(),
                },
                max_header_bytes,
                header_timeout,
            });
        }

        // --- Client ---
        if let Some(c) = &fc.client {
            let server_addr = c.server_addr.trim().to_string();
            if server_addr.is_empty() {
                anyhow::bail!("config: client.server_addr is required");
            }
            let Some(subdomain) = normalize_subdomain(&c.subdomain) else {
                anyhow::bail!("config: client.subdomain {:?} is not a valid DNS label", c.subdomain);
            };
            let proto_raw = or_default(&c.proto, "http");
            let Some(proto) = TunnelProto::parse(&proto_raw) else {
                anyhow::bail!("config: client.proto must be http or tcp, got {proto_raw:?}");
            };
            let mut dial_timeout = millis(c.dial_timeout_ms, 10_000);
            if dial_timeout.is_zero() {
                dial_timeout = Duration::from_secs(10);
            }
            cfg.client = Some(ClientConfig {
                server_addr,
                transport: parse_transport(c.transport.as_deref().unwrap_or(""))
                    .context("config: client.transport")?,
                ws_path: or_default(&c.ws_path, DEFAULT_WS_PATH),
                subdomain,
                token: trimmed(&c.token),
                proto,
                local_addr: or_default(&c.local_addr, "127.0.0.1:8080"),
                remote_port: c.remote_port,
                dial_timeout,
                tls: TlsClientConfig {
                    server_name: c.tls.as_ref().map(|t| trimmed(&t.server_name)).unwrap_or_default(),
                    insecure_skip_verify: c.tls.as_ref().is_some_and(|t| t.insecure_skip_verify),
                    ca_file: c.tls.as_ref().map(|t| trimmed(&t.ca_file)).unwrap_or_default(),
                },
            });
        }

        if cfg.server.is_none() && cfg.client.is_none() {
            anyhow::bail!("config: nothing to run (configure [server] and/or [client])");
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# subway configuration (auto-generated)
#
# This file was created because subway could not find a configuration file at
# the resolved config path. It starts a tunnel server that accepts clients on
# :7000 and serves their HTTP tunnels on :8000 as <subdomain>.localhost.
#
# To run a tunnel client instead (or as well), add a [client] section:
#
#   [client]
#   server_addr = "tunnel.example.com:7000"
#   subdomain = "myapp"
#   token = "secret"
#   local_addr = "127.0.0.1:3000"

admin_addr = ":9090"

[server]
listen_addr = ":7000"
transport = "tcp" # tcp | tls | ws | wss
http_addr = ":8000"
domain = "localhost"
auth_tokens = [] # empty: any client may register

[session]
window = 65536
heartbeat_interval_ms = 15000
idle_timeout_ms = 60000
handshake_timeout_ms = 10000
drain_timeout_ms = 5000

[stream]
dial_timeout_ms = 10000
idle_timeout_ms = 30000

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# subway configuration (auto-generated)
#
# This file was created because subway could not find a configuration file at
# the resolved config path. It starts a tunnel server that accepts clients on
# :7000 and serves their HTTP tunnels on :8000 as <subdomain>.localhost.
#
# To run a tunnel client instead (or as well), add a client section:
#
#   client:
#     server_addr: "tunnel.example.com:7000"
#     subdomain: "myapp"
#     token: "secret"
#     local_addr: "127.0.0.1:3000"

admin_addr: ":9090"

server:
  listen_addr: ":7000"
  transport: "tcp" # tcp | tls | ws | wss
  http_addr: ":8000"
  domain: "localhost"
  auth_tokens: [] # empty: any client may register

session:
  window: 65536
  heartbeat_interval_ms: 15000
  idle_timeout_ms: 60000
  handshake_timeout_ms: 10000
  drain_timeout_ms: 5000

stream:
  dial_timeout_ms: 10000
  idle_timeout_ms: 30000

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;
