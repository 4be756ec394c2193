use crate::descriptor::DEFAULT_SERVER_NAME;
use crate::guard::{DEFAULT_MAX_LIVE, DEFAULT_SAMPLE_RATE, MAX_CEILING};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Clone URL schemes git understands for `<scheme>://service/owner/name.git`
const SUPPORTED_SCHEMES: [&str; 5] = ["http", "https", "ssh", "git", "file"];

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and transport settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Checkout location and external tools
    #[serde(default)]
    pub provisioner: ProvisionerConfig,

    /// Concurrency ceilings
    #[serde(default)]
    pub guard: GuardConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy listen port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the operator API, bound to 127.0.0.1 (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the operator API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Domain label expected after the service in request hostnames.
    /// Empty means hostnames end directly in `<service>:<port>`
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Timeout for forwarding to a located backend (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Upper bound for waiting on in-flight resolutions at shutdown (default: 300)
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,

    /// Maximum idle connections per backend host (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.pool_idle_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            server_name: default_server_name(),
            request_timeout_secs: default_request_timeout(),
            drain_timeout_secs: default_drain_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvisionerConfig {
    /// Root of all checkouts (default: /opt/src)
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Scheme used to build clone URLs (default: https)
    #[serde(default = "default_clone_scheme")]
    pub clone_scheme: String,

    #[serde(default = "default_git_path")]
    pub git_path: String,

    #[serde(default = "default_docker_path")]
    pub docker_path: String,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            clone_scheme: default_clone_scheme(),
            git_path: default_git_path(),
            docker_path: default_docker_path(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GuardConfig {
    /// Background provisioning ceiling. Derived from the CPU count when unset
    pub max_background: Option<usize>,

    /// Live resolution ceiling (default: 100)
    #[serde(default = "default_max_live")]
    pub max_live: usize,

    /// Sample concurrency roughly once every N admissions (default: 10)
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_background: None,
            max_live: default_max_live(),
            sample_rate: default_sample_rate(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    /// Keep successful provisioning results so later requests only locate
    #[serde(default = "default_true")]
    pub retain_provisioned: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            retain_provisioned: true,
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    3000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_server_name() -> String {
    DEFAULT_SERVER_NAME.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_drain_timeout() -> u64 {
    300
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("/opt/src")
}

fn default_clone_scheme() -> String {
    "https".to_string()
}

fn default_git_path() -> String {
    "git".to_string()
}

fn default_docker_path() -> String {
    "docker".to_string()
}

fn default_max_live() -> usize {
    DEFAULT_MAX_LIVE
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }

        if self.server.request_timeout_secs == 0 {
            errors.push("server: 'request_timeout_secs' must be greater than 0".to_string());
        }

        if !self
            .server
            .server_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        {
            errors.push(format!(
                "server: 'server_name' contains unsupported characters: {}",
                self.server.server_name
            ));
        }

        if !SUPPORTED_SCHEMES.contains(&self.provisioner.clone_scheme.as_str()) {
            errors.push(format!(
                "provisioner: unsupported 'clone_scheme' {}, expected one of {}",
                self.provisioner.clone_scheme,
                SUPPORTED_SCHEMES.join(", ")
            ));
        }

        if self.provisioner.git_path.is_empty() {
            errors.push("provisioner: 'git_path' must not be empty".to_string());
        }

        if self.provisioner.docker_path.is_empty() {
            errors.push("provisioner: 'docker_path' must not be empty".to_string());
        }

        if let Some(max_background) = self.guard.max_background {
            if max_background == 0 {
                errors.push("guard: 'max_background' must be greater than 0".to_string());
            } else if max_background > MAX_CEILING {
                errors.push(format!("guard: 'max_background' must be at most {}", MAX_CEILING));
            }
        }

        if self.guard.max_live == 0 {
            errors.push("guard: 'max_live' must be greater than 0".to_string());
        } else if self.guard.max_live > MAX_CEILING {
            errors.push(format!("guard: 'max_live' must be at most {}", MAX_CEILING));
        }

        if self.guard.sample_rate == 0 {
            errors.push("guard: 'sample_rate' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
