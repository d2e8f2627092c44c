//! Engine configuration.
//!
//! Every option recognized by the engine, with its default. The server
//! binary resolves these from its TOML config file and environment before
//! constructing the engine; tests construct them directly.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Floor for the background reconciler interval.
const MIN_SYNC_INTERVAL_SECS: u64 = 5;

/// Fully resolved engine configuration.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Root of the persistent state layout (clones, prompts, logs).
    pub data_dir: PathBuf,
    /// Worker retry budget.
    pub agent_max_retries: i32,
    /// Background reconciler tick, clamped to at least five seconds.
    pub sync_interval: Duration,
    /// SSE heartbeat interval.
    pub sse_heartbeat: Duration,
    /// SSE connection lifetime; clients reconnect after this.
    pub sse_connection_timeout: Duration,
    /// Maximum subscriber connections per user per project.
    pub sse_max_connections_per_user: usize,
    /// Delay between EOF retries while tailing a log file.
    pub log_tail_poll: Duration,
    /// Bounded buffer size for each event-hub subscriber.
    pub event_channel_buffer: usize,
    /// Key for the credential store's token encryption (32 bytes).
    pub token_encryption_key: Vec<u8>,
    /// Secret for session tokens issued by the transport layer (32+ bytes).
    pub jwt_secret: Vec<u8>,
}

impl CoreConfig {
    /// Build a config with validated secrets and every other option at its
    /// default.
    pub fn new(token_encryption_key: Vec<u8>, jwt_secret: Vec<u8>) -> Result<Self> {
        if token_encryption_key.len() != 32 {
            bail!(
                "token_encryption_key must be exactly 32 bytes, got {}",
                token_encryption_key.len()
            );
        }
        if jwt_secret.len() < 32 {
            bail!("jwt_secret must be at least 32 bytes, got {}", jwt_secret.len());
        }

        Ok(Self {
            data_dir: PathBuf::from("/data"),
            agent_max_retries: 10,
            sync_interval: Duration::from_secs(30),
            sse_heartbeat: Duration::from_secs(30),
            sse_connection_timeout: Duration::from_secs(60 * 60),
            sse_max_connections_per_user: 5,
            log_tail_poll: Duration::from_millis(100),
            event_channel_buffer: 100,
            token_encryption_key,
            jwt_secret,
        })
    }

    /// Build a config from hex-encoded secrets, as stored in the config
    /// file and environment.
    pub fn from_hex_keys(token_key_hex: &str, jwt_secret_hex: &str) -> Result<Self> {
        let token_key =
            hex::decode(token_key_hex).context("token_encryption_key is not valid hex")?;
        let jwt = hex::decode(jwt_secret_hex).context("jwt_secret is not valid hex")?;
        Self::new(token_key, jwt)
    }

    /// Set the reconciler interval, clamping to the five-second floor.
    pub fn with_sync_interval_seconds(mut self, seconds: u64) -> Self {
        self.sync_interval = Duration::from_secs(seconds.max(MIN_SYNC_INTERVAL_SECS));
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_agent_max_retries(mut self, max: i32) -> Self {
        self.agent_max_retries = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys() -> (Vec<u8>, Vec<u8>) {
        (vec![0xaa; 32], vec![0x55; 48])
    }

    #[test]
    fn defaults_match_documented_values() {
        let (tk, jk) = keys();
        let cfg = CoreConfig::new(tk, jk).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/data"));
        assert_eq!(cfg.agent_max_retries, 10);
        assert_eq!(cfg.sync_interval, Duration::from_secs(30));
        assert_eq!(cfg.sse_heartbeat, Duration::from_secs(30));
        assert_eq!(cfg.sse_connection_timeout, Duration::from_secs(3600));
        assert_eq!(cfg.sse_max_connections_per_user, 5);
        assert_eq!(cfg.log_tail_poll, Duration::from_millis(100));
        assert_eq!(cfg.event_channel_buffer, 100);
    }

    #[test]
    fn sync_interval_clamped_to_floor() {
        let (tk, jk) = keys();
        let cfg = CoreConfig::new(tk, jk)
            .unwrap()
            .with_sync_interval_seconds(1);
        assert_eq!(cfg.sync_interval, Duration::from_secs(5));
    }

    #[test]
    fn sync_interval_above_floor_kept() {
        let (tk, jk) = keys();
        let cfg = CoreConfig::new(tk, jk)
            .unwrap()
            .with_sync_interval_seconds(90);
        assert_eq!(cfg.sync_interval, Duration::from_secs(90));
    }

    #[test]
    fn short_token_key_rejected() {
        let result = CoreConfig::new(vec![0u8; 16], vec![0u8; 32]);
        assert!(result.is_err());
    }

    #[test]
    fn short_jwt_secret_rejected() {
        let result = CoreConfig::new(vec![0u8; 32], vec![0u8; 31]);
        assert!(result.is_err());
    }

    #[test]
    fn hex_keys_decode() {
        let cfg = CoreConfig::from_hex_keys(&"ab".repeat(32), &"cd".repeat(32)).unwrap();
        assert_eq!(cfg.token_encryption_key.len(), 32);
        assert_eq!(cfg.jwt_secret.len(), 32);
    }

    #[test]
    fn bad_hex_rejected() {
        assert!(CoreConfig::from_hex_keys("zz", &"cd".repeat(32)).is_err());
    }
}
