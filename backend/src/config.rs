use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use santa_core::DEFAULT_MAX_ATTEMPTS;
use tracing::warn;

const DEFAULT_BIND: &str = "0.0.0.0:3000";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub bind: SocketAddr,
    pub persist_path: Option<PathBuf>,
    /// Retry budget handed to the assignment generator.
    pub max_attempts: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            persist_path: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Config {
    /// Reads `SANTA_BIND`, `PERSIST_PATH` and `SANTA_MAX_ATTEMPTS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let bind = match lookup("SANTA_BIND") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(value = %raw, "invalid SANTA_BIND, using {DEFAULT_BIND}");
                default_bind()
            }),
            None => default_bind(),
        };

        let persist_path = lookup("PERSIST_PATH")
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from);

        let max_attempts = lookup("SANTA_MAX_ATTEMPTS")
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        Self {
            bind,
            persist_path,
            max_attempts,
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}
