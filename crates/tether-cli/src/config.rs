//! Configuration file management for tether.
//!
//! Provides a TOML config file at `~/.config/tether/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tether_core::agent::CallbackTokens;
use tether_core::settings::{LocalSettings, Settings, TunnelSettings};
use tether_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub operator: OperatorSection,
    #[serde(default)]
    pub tunnel: TunnelSection,
    #[serde(default)]
    pub local: LocalSection,
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub exec: ExecSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: DbConfig::DEFAULT_URL.to_owned(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    /// Address remote workloads use to reach `tether serve`.
    pub callback_url: String,
    /// Hex-encoded callback token secret. Callbacks are unsigned without it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            callback_url: Settings::default().callback_url,
            secret: None,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatorSection {
    /// User id the CLI acts as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSection {
    pub host: String,
    pub first_port: u16,
    pub last_port: u16,
}

impl Default for TunnelSection {
    fn default() -> Self {
        let tunnel = TunnelSettings::default();
        Self {
            host: tunnel.host,
            first_port: *tunnel.ports.start(),
            last_port: *tunnel.ports.end(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSection {
    pub docker: String,
    pub network: String,
    pub data_dir: String,
    pub registry: String,
}

impl Default for LocalSection {
    fn default() -> Self {
        let local = LocalSettings::default();
        Self {
            docker: local.docker,
            network: local.network,
            data_dir: local.data_dir,
            registry: local.registry,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSection {
    pub registry: String,
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            registry: Settings::default().remote_registry,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecSection {
    pub timeout_secs: u64,
}

impl Default for ExecSection {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_EXEC_TIMEOUT_SECS,
        }
    }
}

pub const DEFAULT_EXEC_TIMEOUT_SECS: u64 = 120;

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the tether config directory.
///
/// Always XDG layout: `$XDG_CONFIG_HOME/tether` or `~/.config/tether`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("tether");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("tether")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// The file is left readable by its owner only on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

/// 32 random bytes, hex-encoded.
pub fn generate_agent_secret() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct TetherConfig {
    pub db_config: DbConfig,
    pub settings: Settings,
    pub exec_timeout: Duration,
    operator: Option<Uuid>,
}

impl TetherConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - DB URL: `cli_db_url` > `TETHER_DATABASE_URL` > `database.url`
    /// - Callback URL: `TETHER_CALLBACK_URL` > `agent.callback_url`
    /// - Agent secret: `TETHER_AGENT_SECRET` > `agent.secret` > none
    /// - Tunnel host: `TETHER_TUNNEL_HOST` > `tunnel.host`
    /// - Exec timeout: `TETHER_EXEC_TIMEOUT` > `exec.timeout_secs`
    /// - Operator: `TETHER_USER` > `operator.user` > none
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config().unwrap_or_default();

        let db_url = match cli_db_url {
            Some(url) => url.to_owned(),
            None => env_or("TETHER_DATABASE_URL", file.database.url),
        };

        let callback_url = env_or("TETHER_CALLBACK_URL", file.agent.callback_url);

        let callback_tokens = match std::env::var("TETHER_AGENT_SECRET").ok().or(file.agent.secret) {
            Some(secret) => Some(
                CallbackTokens::from_hex(&secret).context("invalid agent secret")?,
            ),
            None => None,
        };

        if file.tunnel.first_port > file.tunnel.last_port {
            bail!(
                "tunnel.first_port ({}) is above tunnel.last_port ({})",
                file.tunnel.first_port,
                file.tunnel.last_port
            );
        }
        let tunnel = TunnelSettings {
            host: env_or("TETHER_TUNNEL_HOST", file.tunnel.host),
            ports: file.tunnel.first_port..=file.tunnel.last_port,
        };

        let timeout_secs = match std::env::var("TETHER_EXEC_TIMEOUT") {
            Ok(raw) => raw
                .parse::<u64>()
                .with_context(|| format!("TETHER_EXEC_TIMEOUT is not a number of seconds: {raw:?}"))?,
            Err(_) => file.exec.timeout_secs,
        };
        if timeout_secs == 0 {
            bail!("exec timeout must be at least one second");
        }

        let operator = match std::env::var("TETHER_USER") {
            Ok(raw) => Some(
                Uuid::parse_str(&raw).with_context(|| format!("TETHER_USER is not a UUID: {raw:?}"))?,
            ),
            Err(_) => file.operator.user,
        };

        let settings = Settings {
            callback_url,
            callback_tokens,
            local: LocalSettings {
                docker: file.local.docker,
                network: file.local.network,
                data_dir: file.local.data_dir,
                registry: file.local.registry,
            },
            remote_registry: file.remote.registry,
            tunnel,
        };

        Ok(Self {
            db_config: DbConfig::new(db_url),
            settings,
            exec_timeout: Duration::from_secs(timeout_secs),
            operator,
        })
    }

    /// The user the CLI acts as.
    pub fn operator(&self) -> Result<Uuid> {
        match self.operator {
            Some(user) => Ok(user),
            None => bail!(
                "no operator user; set TETHER_USER or operator.user in {}",
                config_path().display()
            ),
        }
    }
}

fn env_or(var: &str, fallback: String) -> String {
    std::env::var(var).unwrap_or(fallback)
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
