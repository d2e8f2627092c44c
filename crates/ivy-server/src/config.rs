//! The server's configuration file and resolution rules.
//!
//! `ivy init` writes a TOML file under the XDG config home. At startup the
//! file is combined with the environment and CLI flags: flags beat the
//! environment, which beats the file, which beats built-in defaults. The
//! two secrets have no default and must come from somewhere.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use ivy_core::config::CoreConfig;
use ivy_db::config::DbConfig;

// -----------------------------------------------------------------------
// File shape
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    pub auth: AuthSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub agent: AgentSection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    /// Hex-encoded token encryption key (64 hex chars = 32 bytes).
    pub token_encryption_key: String,
    /// Hex-encoded session-token secret (64+ hex chars = 32+ bytes).
    pub jwt_secret: String,
}

/// Engine tuning knobs. Everything here is optional; absent fields keep
/// the engine defaults.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EngineSection {
    pub data_dir: Option<PathBuf>,
    pub agent_max_retries: Option<i32>,
    pub sync_interval_seconds: Option<u64>,
    pub sse_heartbeat_seconds: Option<u64>,
    pub sse_connection_timeout_minutes: Option<u64>,
    pub sse_max_connections_per_user: Option<usize>,
    pub log_tail_poll_ms: Option<u64>,
    pub event_channel_buffer: Option<usize>,
}

impl EngineSection {
    /// Fold the section's overrides into an engine config.
    fn apply(&self, mut core: CoreConfig) -> CoreConfig {
        if let Some(ref data_dir) = self.data_dir {
            core = core.with_data_dir(data_dir.clone());
        }
        if let Some(max) = self.agent_max_retries {
            core = core.with_agent_max_retries(max);
        }
        if let Some(secs) = self.sync_interval_seconds {
            core = core.with_sync_interval_seconds(secs);
        }
        if let Some(secs) = self.sse_heartbeat_seconds {
            core.sse_heartbeat = std::time::Duration::from_secs(secs);
        }
        if let Some(mins) = self.sse_connection_timeout_minutes {
            core.sse_connection_timeout = std::time::Duration::from_secs(mins * 60);
        }
        if let Some(max) = self.sse_max_connections_per_user {
            core.sse_max_connections_per_user = max;
        }
        if let Some(ms) = self.log_tail_poll_ms {
            core.log_tail_poll = std::time::Duration::from_millis(ms);
        }
        if let Some(buffer) = self.event_channel_buffer {
            core.event_channel_buffer = buffer;
        }
        core
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AgentSection {
    /// Agent runtime binary.
    pub binary: String,
    /// Arguments for structured streaming output.
    pub args: Vec<String>,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
        }
    }
}

impl ConfigFile {
    /// Read and parse the file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("no readable config at {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("malformed TOML in {}", path.display()))
    }

    /// Write the file to `path`, creating parent directories. The file
    /// holds secrets, so it is made owner-only on Unix.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        let text = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, &text)
            .with_context(|| format!("failed to write {}", path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("failed to restrict {}", path.display()))?;
        }

        Ok(())
    }
}

/// Default config-file location: `$XDG_CONFIG_HOME/ivy/config.toml`,
/// falling back to `~/.config/ivy/config.toml`.
pub fn default_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".config")
        });
    base.join("ivy").join("config.toml")
}

/// Mint a fresh secret: 32 random bytes, hex-encoded.
pub fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::random();
    hex::encode(bytes)
}

// -----------------------------------------------------------------------
// Resolution
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct IvyConfig {
    pub db_config: DbConfig,
    pub core: CoreConfig,
    pub agent: AgentSection,
}

impl IvyConfig {
    /// Resolve against the real environment and the default config path.
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = ConfigFile::load(&default_path()).ok();
        Self::assemble(cli_db_url, |key| std::env::var(key).ok(), file)
    }

    /// Resolution core, with the environment injected so it can be tested
    /// without mutating process state.
    fn assemble(
        cli_db_url: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
        file: Option<ConfigFile>,
    ) -> Result<Self> {
        let db_url = cli_db_url
            .map(str::to_owned)
            .or_else(|| env("IVY_DATABASE_URL"))
            .or_else(|| file.as_ref().map(|f| f.database.url.clone()))
            .unwrap_or_else(|| DbConfig::FALLBACK_URL.to_owned());

        let secret = |env_key: &str, from_file: fn(&ConfigFile) -> &str| {
            env(env_key).or_else(|| file.as_ref().map(|f| from_file(f).to_owned()))
        };
        let token_key = secret("IVY_TOKEN_ENCRYPTION_KEY", |f| {
            &f.auth.token_encryption_key
        });
        let jwt = secret("IVY_JWT_SECRET", |f| &f.auth.jwt_secret);

        let (Some(token_key), Some(jwt)) = (token_key, jwt) else {
            bail!(
                "secrets not configured; set IVY_TOKEN_ENCRYPTION_KEY and IVY_JWT_SECRET \
                 or run `ivy init` first"
            );
        };

        let mut core = CoreConfig::from_hex_keys(&token_key, &jwt)?;
        let mut agent = AgentSection::default();
        if let Some(file) = file {
            core = file.engine.apply(core);
            agent = file.agent;
        }

        Ok(Self {
            db_config: DbConfig::new(db_url),
            core,
            agent,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with(url: &str) -> ConfigFile {
        ConfigFile {
            database: DatabaseSection {
                url: url.to_string(),
            },
            auth: AuthSection {
                token_encryption_key: "aa".repeat(32),
                jwt_secret: "bb".repeat(32),
            },
            engine: EngineSection::default(),
            agent: AgentSection::default(),
        }
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn cli_flag_beats_env_and_file() {
        let config = IvyConfig::assemble(
            Some("postgresql://cli:5432/clidb"),
            |_| Some("postgresql://env:5432/envdb".into()),
            Some(file_with("postgresql://file:5432/filedb")),
        )
        .unwrap();
        assert_eq!(config.db_config.url(), "postgresql://cli:5432/clidb");
    }

    #[test]
    fn env_beats_file() {
        let config = IvyConfig::assemble(
            None,
            |key| match key {
                "IVY_DATABASE_URL" => Some("postgresql://env:5432/envdb".into()),
                _ => None,
            },
            Some(file_with("postgresql://file:5432/filedb")),
        )
        .unwrap();
        assert_eq!(config.db_config.url(), "postgresql://env:5432/envdb");
        // Secrets still come from the file when the env has none.
        assert_eq!(config.core.token_encryption_key, vec![0xaa; 32]);
    }

    #[test]
    fn fallback_url_without_any_source() {
        let config = IvyConfig::assemble(
            None,
            |key| match key {
                "IVY_TOKEN_ENCRYPTION_KEY" => Some("cc".repeat(32)),
                "IVY_JWT_SECRET" => Some("dd".repeat(32)),
                _ => None,
            },
            None,
        )
        .unwrap();
        assert_eq!(config.db_config.url(), DbConfig::FALLBACK_URL);
    }

    #[test]
    fn missing_secrets_are_an_error() {
        let result = IvyConfig::assemble(Some("postgresql://x:5432/x"), no_env, None);
        let msg = result.unwrap_err().to_string();
        assert!(msg.contains("secrets not configured"), "got: {msg}");
    }

    #[test]
    fn engine_section_tunes_the_core() {
        let mut file = file_with("postgresql://file:5432/filedb");
        file.engine.agent_max_retries = Some(3);
        file.engine.sync_interval_seconds = Some(2); // below the clamp floor

        let config = IvyConfig::assemble(None, no_env, Some(file)).unwrap();
        assert_eq!(config.core.agent_max_retries, 3);
        assert_eq!(
            config.core.sync_interval,
            std::time::Duration::from_secs(5),
            "clamp applies to file values too"
        );
    }

    #[test]
    fn file_survives_a_toml_round_trip() {
        let mut original = file_with("postgresql://testhost:5432/testdb");
        original.engine.event_channel_buffer = Some(250);

        let text = toml::to_string_pretty(&original).unwrap();
        let parsed: ConfigFile = toml::from_str(&text).unwrap();
        assert_eq!(parsed.database.url, original.database.url);
        assert_eq!(parsed.engine.event_channel_buffer, Some(250));
        assert_eq!(parsed.agent.binary, "claude");
    }

    #[test]
    fn sections_other_than_database_and_auth_are_optional() {
        let text = r#"
[database]
url = "postgresql://localhost:5432/ivy"

[auth]
token_encryption_key = "00"
jwt_secret = "00"
"#;
        let parsed: ConfigFile = toml::from_str(text).unwrap();
        assert!(parsed.engine.data_dir.is_none());
        assert_eq!(parsed.agent.binary, "claude");
    }

    #[test]
    fn write_then_load_round_trips_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let original = file_with("postgresql://disk:5432/diskdb");
        original.write(&path).unwrap();

        let loaded = ConfigFile::load(&path).unwrap();
        assert_eq!(loaded.database.url, "postgresql://disk:5432/diskdb");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "config holds secrets");
        }
    }

    #[test]
    fn load_missing_file_errors() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(ConfigFile::load(&tmp.path().join("absent.toml")).is_err());
    }

    #[test]
    fn generated_secrets_are_distinct_64_char_hex() {
        let a = generate_secret();
        let b = generate_secret();
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
