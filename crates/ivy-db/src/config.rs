//! Where the durable store lives.

use std::env;

/// Resolved PostgreSQL endpoint for the ivy store.
///
/// Holds the full connection URL and derives sibling URLs on the same
/// server: the `postgres` admin database for `CREATE DATABASE`, and
/// per-test databases.
#[derive(Debug, Clone)]
pub struct DbConfig {
    url: String,
}

impl DbConfig {
    /// Used when nothing else is configured: a local server with an `ivy`
    /// database.
    pub const FALLBACK_URL: &str = "postgresql://localhost:5432/ivy";

    /// Resolve the URL: an explicit value (CLI flag or config file) wins,
    /// then `IVY_DATABASE_URL`, then the local fallback.
    pub fn resolve(explicit: Option<&str>) -> Self {
        let url = explicit
            .map(str::to_owned)
            .or_else(|| env::var("IVY_DATABASE_URL").ok())
            .unwrap_or_else(|| Self::FALLBACK_URL.to_owned());
        Self { url }
    }

    /// Wrap an already-known URL (tests, other config layers).
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The database name at the end of the URL path, if the URL names one.
    ///
    /// `postgresql://host:5432/ivy` yields `ivy`; a bare server URL yields
    /// `None` (the trailing segment would be `host:port`, not a name).
    pub fn database(&self) -> Option<&str> {
        let tail = self.url.rsplit('/').next()?;
        (!tail.is_empty() && !tail.contains(':') && !tail.contains('@')).then_some(tail)
    }

    /// A config for a different database on the same server.
    pub fn sibling(&self, database: &str) -> Self {
        let server = match (self.database(), self.url.rfind('/')) {
            (Some(_), Some(cut)) => &self.url[..cut],
            _ => self.url.as_str(),
        };
        Self {
            url: format!("{server}/{database}"),
        }
    }

    /// The server's `postgres` admin database, for statements that cannot
    /// run inside the target database.
    pub fn admin(&self) -> Self {
        self.sibling("postgres")
    }
}
