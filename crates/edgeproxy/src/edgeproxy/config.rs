use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::edgeproxy::client::{
    auth::{DEFAULT_AUDIENCE, DEFAULT_TOKEN_TTL, JwtSignerConfig},
    mux::{DEFAULT_KEEPALIVE_INTERVAL, DEFAULT_OPEN_RETRY_DELAY, DEFAULT_RECONNECT_DELAY},
};
use crate::edgeproxy::server::auth::JwtVerifierConfig;

pub const ENV_CONFIG: &str = "EDGEPROXY_CONFIG";

const DEFAULT_SERVER_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ACL_POLL_INTERVAL: Duration = Duration::from_secs(1);

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

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    // clap folds EDGEPROXY_CONFIG into the flag; report it as env when they agree.
    let env_path = std::env::var_os(ENV_CONFIG).filter(|p| !p.is_empty());

    if let Some(p) = explicit_flag_path {
        let source = match &env_path {
            Some(e) if Path::new(e) == p => ConfigPathSource::Env,
            _ => ConfigPathSource::Flag,
        };
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source,
        });
    }

    if let Some(p) = env_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(Path::new(&p))?,
            source: ConfigPathSource::Env,
        });
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
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|_| p.join("edgeproxy.toml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["edgeproxy.toml", "edgeproxy.yaml", "edgeproxy.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).map(|m| m.is_file()).unwrap_or(false) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no edgeproxy.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/edgeproxy/edgeproxy.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "edgeproxy", "edgeproxy")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("edgeproxy.toml"))
    }
}

/// Writes the default config when `path` does not exist. Returns whether it did.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    use std::io::Write;
    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// `(mtime_ms, len)` of a file, used to notice edits by polling.
pub fn file_sig(path: &Path) -> anyhow::Result<(u64, u64)> {
    let meta = fs::metadata(path)?;
    let m = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    Ok((m, meta.len()))
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        other => anyhow::bail!("config: unsupported config extension {other}"),
    };

    Config::from_file_config(fc, path)
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
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub auth: ServerAuthConfig,
    pub authorization: AuthorizationConfig,
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum ServerAuthConfig {
    None,
    Jwt(JwtVerifierConfig),
}

#[derive(Debug, Clone)]
pub enum AuthorizationConfig {
    None,
    Acl {
        policy_file: PathBuf,
        reload_poll_interval: Duration,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTransport {
    WebsocketMux,
    Websocket,
    Direct,
}

impl ClientTransport {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientTransport::WebsocketMux => "websocket-mux",
            ClientTransport::Websocket => "websocket",
            ClientTransport::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub transport: ClientTransport,
    pub endpoints: Vec<String>,
    pub keepalive_interval: Duration,
    pub reconnect_delay: Duration,
    pub open_retry_delay: Duration,
    pub auth: ClientAuthConfig,
    pub socks5: Option<Socks5Config>,
    pub http_proxy: Option<HttpProxyConfig>,
    pub port_forwards: Vec<PortForwardConfig>,
}

#[derive(Debug, Clone)]
pub enum ClientAuthConfig {
    None,
    Jwt(JwtSignerConfig),
}

#[derive(Debug, Clone)]
pub struct Socks5Config {
    pub listen_addr: String,
}

#[derive(Debug, Clone)]
pub struct HttpProxyConfig {
    pub listen_addr: String,
}

#[derive(Debug, Clone)]
pub struct PortForwardConfig {
    pub listen_addr: String,
    pub network: String,
    pub destination: String,
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
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServer {
    listen_addr: Option<String>,
    auth: Option<FileServerAuth>,
    authorization: Option<FileAuthorization>,
    dial_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileServerAuth {
    mode: Option<String>,
    #[serde(default)]
    public_key_files: Vec<String>,
    audience: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAuthorization {
    mode: Option<String>,
    policy_file: Option<String>,
    reload_poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClient {
    transport: Option<String>,
    #[serde(default)]
    endpoints: Vec<String>,
    keepalive_interval_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    open_retry_delay_ms: Option<u64>,
    auth: Option<FileClientAuth>,
    socks5: Option<FileSocks5>,
    http_proxy: Option<FileHttpProxy>,
    #[serde(default)]
    port_forwards: Vec<FilePortForward>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileClientAuth {
    mode: Option<String>,
    key_file: Option<String>,
    certificate_file: Option<String>,
    subject: Option<String>,
    audience: Option<String>,
    token_ttl_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSocks5 {
    listen_addr: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileHttpProxy {
    listen_addr: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePortForward {
    listen_addr: String,
    network: Option<String>,
    destination: String,
}

fn trimmed(s: Option<&String>) -> Option<String> {
    s.map(|s| s.trim()).filter(|s| !s.is_empty()).map(str::to_string)
}

fn lower_or(s: Option<&String>, default: &str) -> String {
    trimmed(s).map(|s| s.to_ascii_lowercase()).unwrap_or_else(|| default.to_string())
}

fn millis_or(ms: Option<u64>, default: Duration) -> Duration {
    match ms {
        Some(0) | None => default,
        Some(ms) => Duration::from_millis(ms),
    }
}

/// Relative paths in the config are relative to the config file's directory.
fn resolve_path(base: &Path, p: &str) -> PathBuf {
    let p = Path::new(p.trim());
    if p.is_absolute() {
        return p.to_path_buf();
    }
    match base.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.join(p),
        _ => p.to_path_buf(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig, config_path: &Path) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig::default();
        if let Some(l) = &fc.logging {
            if let Some(level) = trimmed(l.level.as_ref()) {
                logging.level = level;
            }
            if let Some(format) = trimmed(l.format.as_ref()) {
                logging.format = format;
            }
            if let Some(output) = trimmed(l.output.as_ref()) {
                logging.output = output;
            }
            logging.add_source = l.add_source;
        }

        let server = fc
            .server
            .map(|s| ServerConfig::from_file(s, config_path))
            .transpose()?;
        let client = fc
            .client
            .map(|c| ClientConfig::from_file(c, config_path))
            .transpose()?;

        Ok(Config {
            logging,
            server,
            client,
        })
    }
}

impl ServerConfig {
    fn from_file(s: FileServer, config_path: &Path) -> anyhow::Result<Self> {
        let listen_addr = trimmed(s.listen_addr.as_ref()).unwrap_or_else(|| "127.0.0.1:8080".into());

        let auth = match s.auth {
            None => ServerAuthConfig::None,
            Some(a) => match lower_or(a.mode.as_ref(), "none").as_str() {
                "none" => ServerAuthConfig::None,
                "jwt" => {
                    let public_key_files: Vec<PathBuf> = a
                        .public_key_files
                        .iter()
                        .filter(|p| !p.trim().is_empty())
                        .map(|p| resolve_path(config_path, p))
                        .collect();
                    if public_key_files.is_empty() {
                        anyhow::bail!("config: server.auth.public_key_files is required for mode \"jwt\"");
                    }
                    ServerAuthConfig::Jwt(JwtVerifierConfig {
                        public_key_files,
                        audience: trimmed(a.audience.as_ref()).unwrap_or_else(|| DEFAULT_AUDIENCE.into()),
                    })
                }
                other => anyhow::bail!("config: server.auth.mode {other:?} (expected none|jwt)"),
            },
        };

        let authorization = match s.authorization {
            None => AuthorizationConfig::None,
            Some(a) => match lower_or(a.mode.as_ref(), "none").as_str() {
                "none" => AuthorizationConfig::None,
                "acl" => {
                    let Some(policy_file) = trimmed(a.policy_file.as_ref()) else {
                        anyhow::bail!("config: server.authorization.policy_file is required for mode \"acl\"");
                    };
                    AuthorizationConfig::Acl {
                        policy_file: resolve_path(config_path, &policy_file),
                        reload_poll_interval: millis_or(a.reload_poll_interval_ms, DEFAULT_ACL_POLL_INTERVAL),
                    }
                }
                other => anyhow::bail!("config: server.authorization.mode {other:?} (expected none|acl)"),
            },
        };

        Ok(Self {
            listen_addr,
            auth,
            authorization,
            dial_timeout: millis_or(s.dial_timeout_ms, DEFAULT_SERVER_DIAL_TIMEOUT),
        })
    }
}

impl ClientConfig {
    fn from_file(c: FileClient, config_path: &Path) -> anyhow::Result<Self> {
        let transport = match lower_or(c.transport.as_ref(), "websocket-mux").as_str() {
            "websocket-mux" => ClientTransport::WebsocketMux,
            "websocket" => ClientTransport::Websocket,
            "direct" => ClientTransport::Direct,
            other => anyhow::bail!(
                "config: client.transport {other:?} (expected websocket-mux|websocket|direct)"
            ),
        };

        let mut endpoints = Vec::with_capacity(c.endpoints.len());
        for (i, ep) in c.endpoints.iter().enumerate() {
            let ep = ep.trim();
            if !(ep.starts_with("ws://") || ep.starts_with("wss://")) {
                anyhow::bail!("config: client.endpoints[{i}] must be a ws:// or wss:// URL, got {ep:?}");
            }
            endpoints.push(ep.to_string());
        }
        if endpoints.is_empty() && transport != ClientTransport::Direct {
            anyhow::bail!(
                "config: client.endpoints is required for transport {:?}",
                transport.as_str()
            );
        }

        let auth = match c.auth {
            None => ClientAuthConfig::None,
            Some(a) => match lower_or(a.mode.as_ref(), "none").as_str() {
                "none" => ClientAuthConfig::None,
                "jwt" => {
                    let Some(key_file) = trimmed(a.key_file.as_ref()) else {
                        anyhow::bail!("config: client.auth.key_file is required for mode \"jwt\"");
                    };
                    let Some(subject) = trimmed(a.subject.as_ref()) else {
                        anyhow::bail!("config: client.auth.subject is required for mode \"jwt\"");
                    };
                    ClientAuthConfig::Jwt(JwtSignerConfig {
                        key_file: resolve_path(config_path, &key_file),
                        certificate_file: trimmed(a.certificate_file.as_ref())
                            .map(|p| resolve_path(config_path, &p)),
                        subject,
                        audience: trimmed(a.audience.as_ref()).unwrap_or_else(|| DEFAULT_AUDIENCE.into()),
                        ttl: match a.token_ttl_secs {
                            Some(0) | None => DEFAULT_TOKEN_TTL,
                            Some(s) => Duration::from_secs(s),
                        },
                    })
                }
                other => anyhow::bail!("config: client.auth.mode {other:?} (expected none|jwt)"),
            },
        };

        let socks5 = c.socks5.map(|s| Socks5Config {
            listen_addr: s.listen_addr.trim().to_string(),
        });

        let http_proxy = c.http_proxy.map(|h| HttpProxyConfig {
            listen_addr: h.listen_addr.trim().to_string(),
        });

        let mut port_forwards = Vec::with_capacity(c.port_forwards.len());
        for (i, pf) in c.port_forwards.iter().enumerate() {
            let network = lower_or(pf.network.as_ref(), "tcp");
            if network != "tcp" {
                anyhow::bail!("config: client.port_forwards[{i}].network {network:?} is not supported (expected tcp)");
            }
            let destination = pf.destination.trim();
            if destination.is_empty() {
                anyhow::bail!("config: client.port_forwards[{i}].destination is empty");
            }
            port_forwards.push(PortForwardConfig {
                listen_addr: pf.listen_addr.trim().to_string(),
                network,
                destination: destination.to_string(),
            });
        }

        if socks5.is_none() && http_proxy.is_none() && port_forwards.is_empty() {
            anyhow::bail!("config: client needs socks5, http_proxy and/or port_forwards");
        }

        Ok(Self {
            transport,
            endpoints,
            keepalive_interval: millis_or(c.keepalive_interval_ms, DEFAULT_KEEPALIVE_INTERVAL),
            reconnect_delay: millis_or(c.reconnect_delay_ms, DEFAULT_RECONNECT_DELAY),
            open_retry_delay: millis_or(c.open_retry_delay_ms, DEFAULT_OPEN_RETRY_DELAY),
            auth,
            socks5,
            http_proxy,
            port_forwards,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# edgeproxy configuration (auto-generated)
#
# This file was created because edgeproxy could not find a configuration file at
# the resolved config path. As written it runs a tunnel server on loopback with no
# authentication and every forward allowed.

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

[server]
listen_addr = "127.0.0.1:8080"
dial_timeout_ms = 10000

[server.auth]
mode = "none" # none | jwt
# public_key_files = ["/etc/edgeproxy/client.pub.pem"]
# audience = "edgeproxy"

[server.authorization]
mode = "none" # none | acl
# policy_file = "acl.toml"
# reload_poll_interval_ms = 1000

# [client]
# transport = "websocket-mux" # websocket-mux | websocket | direct
# endpoints = ["wss://edge.example.com/"]
#
# [client.auth]
# mode = "jwt"
# key_file = "client.key.pem"
# subject = "laptop-1"
#
# [client.socks5]
# listen_addr = "127.0.0.1:1080"
#
# [client.http_proxy]
# listen_addr = "127.0.0.1:3128"
#
# [[client.port_forwards]]
# listen_addr = "127.0.0.1:5432"
# destination = "db.internal:5432"
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# edgeproxy configuration (auto-generated)
#
# This file was created because edgeproxy could not find a configuration file at
# the resolved config path. As written it runs a tunnel server on loopback with no
# authentication and every forward allowed.

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

server:
  listen_addr: "127.0.0.1:8080"
  dial_timeout_ms: 10000
  auth:
    mode: "none" # none | jwt
    # public_key_files: ["/etc/edgeproxy/client.pub.pem"]
  authorization:
    mode: "none" # none | acl
    # policy_file: "acl.yaml"

# client:
#   transport: "websocket-mux" # websocket-mux | websocket | direct
#   endpoints: ["wss://edge.example.com/"]
#   socks5:
#     listen_addr: "127.0.0.1:1080"
#   http_proxy:
#     listen_addr: "127.0.0.1:3128"
#   port_forwards:
#     - listen_addr: "127.0.0.1:5432"
#       destination: "db.internal:5432"
"#;

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("edgeproxy_cfg_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn default_templates_are_runnable() {
        for name in ["edgeproxy.toml", "edgeproxy.yaml"] {
            let dir = temp_dir("template");
            let path = dir.join("nested").join(name);

            assert!(ensure_config_file(&path).expect("create"));
            assert!(!ensure_config_file(&path).expect("exists"));

            let cfg = load_config(&path).expect("load default");
            let server = cfg.server.expect("server section");
            assert_eq!(server.listen_addr, "127.0.0.1:8080");
            assert!(matches!(server.auth, ServerAuthConfig::None));
            assert!(matches!(server.authorization, AuthorizationConfig::None));
            assert!(cfg.client.is_none());

            let _ = std::fs::remove_dir_all(&dir);
        }
    }

    #[test]
    fn client_section_applies_defaults_and_relative_paths() {
        let dir = temp_dir("client");
        let path = dir.join("edgeproxy.toml");
        std::fs::write(
            &path,
            r#"
[client]
endpoints = ["wss://a.example/", " ws://b.example/ "]
reconnect_delay_ms = 250

[client.auth]
mode = "JWT"
key_file = "keys/client.pem"
subject = "laptop-1"

[client.socks5]
listen_addr = "127.0.0.1:1080"

[client.http_proxy]
listen_addr = " 127.0.0.1:3128 "

[[client.port_forwards]]
listen_addr = ":5432"
destination = "db.internal:5432"
"#,
        )
        .unwrap();

        let cfg = load_config(&path).unwrap();
        assert!(cfg.server.is_none());
        let c = cfg.client.unwrap();
        assert_eq!(c.transport, ClientTransport::WebsocketMux);
        assert_eq!(c.endpoints, vec!["wss://a.example/", "ws://b.example/"]);
        assert_eq!(c.reconnect_delay, Duration::from_millis(250));
        assert_eq!(c.keepalive_interval, DEFAULT_KEEPALIVE_INTERVAL);
        match c.auth {
            ClientAuthConfig::Jwt(j) => {
                assert_eq!(j.key_file, dir.join("keys/client.pem"));
                assert_eq!(j.audience, DEFAULT_AUDIENCE);
                assert_eq!(j.ttl, DEFAULT_TOKEN_TTL);
            }
            other => panic!("unexpected auth: {other:?}"),
        }
        assert_eq!(c.http_proxy.unwrap().listen_addr, "127.0.0.1:3128");
        assert_eq!(c.port_forwards[0].network, "tcp");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn validation_names_the_offending_key() {
        let dir = temp_dir("invalid");
        let path = dir.join("edgeproxy.yaml");

        let cases = [
            (
                "client:\n  endpoints: [\"wss://ok/\", \"http://nope/\"]\n  socks5:\n    listen_addr: \":1080\"\n",
                "client.endpoints[1]",
            ),
            (
                "client:\n  transport: websocket\n  socks5:\n    listen_addr: \":1080\"\n",
                "client.endpoints",
            ),
            (
                "client:\n  transport: direct\n  port_forwards:\n    - listen_addr: \":1\"\n      network: udp\n      destination: \"x:1\"\n",
                "client.port_forwards[0].network",
            ),
            ("server:\n  auth:\n    mode: jwt\n", "server.auth.public_key_files"),
            ("server:\n  authorization:\n    mode: acl\n", "server.authorization.policy_file"),
            ("server:\n  auth:\n    mode: mtls\n", "server.auth.mode"),
            ("client:\n  transport: direct\n", "http_proxy"),
            ("servers: {}\n", "servers"),
        ];
        for (yaml, needle) in cases {
            std::fs::write(&path, yaml).unwrap();
            let err = load_config(&path).expect_err(yaml);
            let msg = format!("{err:#}");
            assert!(msg.contains(needle), "expected {needle:?} in: {msg}");
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_directory_discovers_config() {
        let dir = temp_dir("discover");
        std::fs::write(dir.join("edgeproxy.yml"), "server: {}\n").unwrap();
        assert_eq!(normalize_explicit_path(&dir).unwrap(), dir.join("edgeproxy.yml"));

        let missing = dir.join("other");
        assert_eq!(normalize_explicit_path(&missing).unwrap(), dir.join("other.toml"));

        let _ = std::fs::remove_dir_all(&dir);
    }
}
