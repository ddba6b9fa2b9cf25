use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::radtunnel::socks::Credentials;
use crate::radtunnel::tunnel::{relay::RelayOptions, transport::parse_transport};

pub const CONFIG_ENV: &str = "RADTUNNEL_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl ConfigPathSource {
    /// Whether the user named this path; a missing explicit file is an error.
    pub fn is_explicit(self) -> bool {
        matches!(self, ConfigPathSource::Flag | ConfigPathSource::Env)
    }
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
    resolve_config_path_in(explicit_flag_path, Path::new("."))
}

fn resolve_config_path_in(
    explicit_flag_path: Option<PathBuf>,
    cwd: &Path,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps RADTUNNEL_CONFIG into the flag already; this covers callers
    // that bypass the CLI.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(cwd) {
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
    if fs::metadata(p).is_ok_and(|m| m.is_dir()) {
        return Ok(discover_config_path(p).unwrap_or_else(|| p.join("radtunnel.toml")));
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["radtunnel.toml", "radtunnel.yaml", "radtunnel.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/radtunnel/radtunnel.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("net", "radtunnel", "radtunnel")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("radtunnel.toml"))
    }
}

/// Load the resolved file, or fall back to built-in defaults when an
/// implicit location has no file. Never creates a file.
pub fn load_resolved(resolved: &ResolvedConfigPath) -> anyhow::Result<Option<Config>> {
    match fs::metadata(&resolved.path) {
        Ok(_) => load_config(&resolved.path).map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && !resolved.source.is_explicit() => {
            Ok(None)
        }
        Err(err) => Err(err).with_context(|| format!("config: stat {}", resolved.path.display())),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            ext
        ),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: Option<String>,
    pub shutdown_grace: Duration,
    pub logging: LoggingConfig,
    pub socks: SocksConfig,
    pub mid: MidConfig,
    pub rad: RadConfig,
    pub relay: RelayOptions,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct SocksConfig {
    pub listen_addr: String,
    pub handshake_timeout: Duration,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone)]
pub struct MidConfig {
    pub tunnel_addr: String,
    pub transport: String,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub liveness_interval: Duration,
    pub liveness_miss_limit: u32,
    pub dial_reply_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RadConfig {
    pub server_addr: String,
    pub transport: String,
    pub server_name: String,
    pub ca_file: Option<PathBuf>,
    pub insecure_skip_verify: bool,
    pub connect_timeout: Duration,
    pub liveness_interval: Duration,
    pub max_liveness_failures: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    admin_addr: Option<String>,
    shutdown_grace_ms: Option<u64>,
    logging: Option<FileLogging>,
    socks: Option<FileSocks>,
    mid: Option<FileMid>,
    rad: Option<FileRad>,
    relay: Option<FileRelay>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSocks {
    listen_addr: Option<String>,
    handshake_timeout_ms: Option<u64>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileMid {
    tunnel_addr: Option<String>,
    transport: Option<String>,
    cert_file: Option<String>,
    key_file: Option<String>,
    liveness_interval_ms: Option<u64>,
    liveness_miss_limit: Option<u32>,
    dial_reply_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRad {
    server_addr: Option<String>,
    transport: Option<String>,
    server_name: Option<String>,
    ca_file: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
    connect_timeout_ms: Option<u64>,
    liveness_interval_ms: Option<u64>,
    max_liveness_failures: Option<u32>,
    backoff_initial_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileRelay {
    dial_timeout_ms: Option<u64>,
    frame_timeout_ms: Option<u64>,
    buffer_size: Option<usize>,
    half_close_timeout_ms: Option<u64>,
}

fn ms(v: Option<u64>, default_ms: u64) -> Duration {
    Duration::from_millis(v.filter(|v| *v > 0).unwrap_or(default_ms))
}

fn non_empty(v: Option<String>, default: &str) -> String {
    v.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn opt_path(v: Option<String>) -> Option<PathBuf> {
    v.map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
}

impl Config {
    /// The configuration used when no file exists.
    pub fn defaults() -> anyhow::Result<Config> {
        Config::from_file_config(FileConfig::default())
    }

    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let lg = fc.logging.unwrap_or_default();
        let logging = LoggingConfig {
            level: non_empty(lg.level, "info").to_ascii_lowercase(),
            format: non_empty(lg.format, "text").to_ascii_lowercase(),
            output: non_empty(lg.output, "stderr"),
            add_source: lg.add_source,
        };
        if !matches!(logging.format.as_str(), "text" | "json") {
            anyhow::bail!(
                "config: logging.format must be text or json, got {:?}",
                logging.format
            );
        }

        let sc = fc.socks.unwrap_or_default();
        let username = sc.username.unwrap_or_default();
        let password = sc.password.unwrap_or_default();
        let credentials = match (username.is_empty(), password.is_empty()) {
            (true, true) => None,
            (false, false) => Some(Credentials { username, password }),
            _ => anyhow::bail!("config: socks.username and socks.password must be set together"),
        };
        if credentials
            .as_ref()
            .is_some_and(|c| c.username.len() > 255 || c.password.len() > 255)
        {
            anyhow::bail!("config: socks credentials are limited to 255 bytes each");
        }
        let socks = SocksConfig {
            listen_addr: non_empty(sc.listen_addr, "0.0.0.0:1080"),
            handshake_timeout: ms(sc.handshake_timeout_ms, 10_000),
            credentials,
        };

        let m = fc.mid.unwrap_or_default();
        let mid = MidConfig {
            tunnel_addr: non_empty(m.tunnel_addr, "0.0.0.0:8100"),
            transport: parse_transport(m.transport.as_deref().unwrap_or(""))
                .context("config: mid.transport")?,
            cert_file: opt_path(m.cert_file),
            key_file: opt_path(m.key_file),
            liveness_interval: ms(m.liveness_interval_ms, 5_000),
            liveness_miss_limit: m.liveness_miss_limit.filter(|v| *v > 0).unwrap_or(3),
            dial_reply_timeout: ms(m.dial_reply_timeout_ms, 15_000),
        };
        if mid.cert_file.is_some() != mid.key_file.is_some() {
            anyhow::bail!("config: mid.cert_file and mid.key_file must be set together");
        }

        let r = fc.rad.unwrap_or_default();
        let rad = RadConfig {
            server_addr: non_empty(r.server_addr, "localhost:8100"),
            transport: parse_transport(r.transport.as_deref().unwrap_or(""))
                .context("config: rad.transport")?,
            server_name: r.server_name.map(|s| s.trim().to_string()).unwrap_or_default(),
            ca_file: opt_path(r.ca_file),
            insecure_skip_verify: r.insecure_skip_verify,
            connect_timeout: ms(r.connect_timeout_ms, 10_000),
            liveness_interval: ms(r.liveness_interval_ms, 5_000),
            max_liveness_failures: r.max_liveness_failures.filter(|v| *v > 0).unwrap_or(3),
            backoff_initial: ms(r.backoff_initial_ms, 500),
            backoff_max: ms(r.backoff_max_ms, 30_000),
        };
        if rad.backoff_max < rad.backoff_initial {
            anyhow::bail!("config: rad.backoff_max_ms must not be below rad.backoff_initial_ms");
        }

        let rl = fc.relay.unwrap_or_default();
        let defaults = RelayOptions::default();
        let relay = RelayOptions {
            dial_timeout: ms(rl.dial_timeout_ms, defaults.dial_timeout.as_millis() as u64),
            frame_timeout: ms(rl.frame_timeout_ms, defaults.frame_timeout.as_millis() as u64),
            buffer_size: rl.buffer_size.filter(|v| *v > 0).unwrap_or(defaults.buffer_size),
            half_close_timeout: ms(
                rl.half_close_timeout_ms,
                defaults.half_close_timeout.as_millis() as u64,
            ),
        };

        Ok(Config {
            admin_addr: fc
                .admin_addr
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            shutdown_grace: ms(fc.shutdown_grace_ms, 5_000),
            logging,
            socks,
            mid,
            rad,
            relay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "radtunnel_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::defaults().unwrap();
        assert_eq!(cfg.socks.listen_addr, "0.0.0.0:1080");
        assert!(cfg.socks.credentials.is_none());
        assert_eq!(cfg.mid.tunnel_addr, "0.0.0.0:8100");
        assert_eq!(cfg.mid.transport, "quic");
        assert_eq!(cfg.mid.liveness_miss_limit, 3);
        assert_eq!(cfg.rad.server_addr, "localhost:8100");
        assert_eq!(cfg.rad.liveness_interval, Duration::from_secs(5));
        assert_eq!(cfg.rad.max_liveness_failures, 3);
        assert!(!cfg.rad.insecure_skip_verify);
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(5));
        assert!(cfg.admin_addr.is_none());
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = temp_dir("toml");
        let cfg_path = dir.join("radtunnel.toml");
        let toml = r#"
admin_addr = "127.0.0.1:9100"
shutdown_grace_ms = 2500

[logging]
level = "DEBUG"
format = "json"

[socks]
listen_addr = "127.0.0.1:1081"
username = "alice"
password = "s3cret"

[mid]
tunnel_addr = ":9000"
transport = "tcp"
liveness_interval_ms = 1000
liveness_miss_limit = 5

[rad]
server_addr = "tcp://mid.example.net:9000"
insecure_skip_verify = true

[relay]
buffer_size = 65536
half_close_timeout_ms = 750
"#;
        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).unwrap();

        assert_eq!(cfg.admin_addr.as_deref(), Some("127.0.0.1:9100"));
        assert_eq!(cfg.shutdown_grace, Duration::from_millis(2500));
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(
            cfg.socks.credentials,
            Some(Credentials {
                username: "alice".into(),
                password: "s3cret".into()
            })
        );
        assert_eq!(cfg.mid.tunnel_addr, ":9000");
        assert_eq!(cfg.mid.transport, "tcp");
        assert_eq!(cfg.mid.liveness_miss_limit, 5);
        assert_eq!(cfg.rad.server_addr, "tcp://mid.example.net:9000");
        assert!(cfg.rad.insecure_skip_verify);
        assert_eq!(cfg.relay.buffer_size, 65536);
        assert_eq!(cfg.relay.half_close_timeout, Duration::from_millis(750));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_is_accepted() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("radtunnel.yaml");
        let yaml = "mid:\n  transport: quic\n  dial_reply_timeout_ms: 3000\nrad:\n  server_addr: 10.0.0.1\n";
        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).unwrap();
        assert_eq!(cfg.mid.dial_reply_timeout, Duration::from_secs(3));
        assert_eq!(cfg.rad.server_addr, "10.0.0.1");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_fields_and_bad_values_are_rejected() {
        let dir = temp_dir("reject");

        let p = dir.join("a.toml");
        std::fs::write(&p, "[mid]\nlisten = \"0.0.0.0:8100\"\n").expect("write");
        assert!(load_config(&p).is_err());

        let p = dir.join("b.toml");
        std::fs::write(&p, "[mid]\ntransport = \"kcp\"\n").expect("write");
        let err = format!("{:#}", load_config(&p).unwrap_err());
        assert!(err.contains("mid.transport"));

        let p = dir.join("c.toml");
        std::fs::write(&p, "[socks]\nusername = \"alice\"\n").expect("write");
        let err = load_config(&p).unwrap_err().to_string();
        assert!(err.contains("set together"));

        let p = dir.join("d.ini");
        std::fs::write(&p, "").expect("write");
        assert!(load_config(&p).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn path_resolution_prefers_flag_then_cwd() {
        let dir = temp_dir("resolve");
        std::fs::write(dir.join("radtunnel.yml"), "").expect("write");

        let r = resolve_config_path_in(Some(dir.join("custom.toml")), &dir).unwrap();
        assert_eq!(r.source, ConfigPathSource::Flag);
        assert_eq!(r.path, dir.join("custom.toml"));

        // A directory flag is searched for a radtunnel.* file.
        let r = resolve_config_path_in(Some(dir.clone()), Path::new("/nonexistent")).unwrap();
        assert_eq!(r.path, dir.join("radtunnel.yml"));

        if std::env::var_os(CONFIG_ENV).is_none() {
            let r = resolve_config_path_in(None, &dir).unwrap();
            assert_eq!(r.source, ConfigPathSource::Cwd);
            assert_eq!(r.path, dir.join("radtunnel.yml"));
        }

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_implicit_file_falls_back_to_defaults() {
        let dir = temp_dir("missing");
        let implicit = ResolvedConfigPath {
            path: dir.join("radtunnel.toml"),
            source: ConfigPathSource::Default,
        };
        assert!(load_resolved(&implicit).unwrap().is_none());
        assert!(!implicit.path.exists());

        let explicit = ResolvedConfigPath {
            path: dir.join("radtunnel.toml"),
            source: ConfigPathSource::Flag,
        };
        assert!(load_resolved(&explicit).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
