//! Engine configuration from environment variables
//!
//! Every setting has a default; values that fail to parse are logged and
//! replaced by the default rather than aborting startup.

use crate::assembler::ChunkingPolicy;
use crate::runtime::RuntimeConfig;
use crate::transport::{BackoffStrategy, ReconnectPolicy};
use std::str::FromStr;
use std::time::Duration;

/// Which backend answers submissions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Local responder, no network
    Simulated,
    /// Request/response endpoint; replies are chunked locally
    Http { url: String },
    /// Streaming backend over a WebSocket
    Socket { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub port: u16,
    pub backend: BackendKind,
    pub reconnect: ReconnectPolicy,
    pub runtime: RuntimeConfig,
    pub chunking: ChunkingPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            backend: BackendKind::Simulated,
            reconnect: ReconnectPolicy::default(),
            runtime: RuntimeConfig::default(),
            chunking: ChunkingPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(&|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let vars = Vars(lookup);

        let reconnect = ReconnectPolicy {
            base_delay: vars.millis("CHATLINE_RECONNECT_BASE_MS", defaults.reconnect.base_delay),
            max_delay: vars.millis("CHATLINE_RECONNECT_MAX_MS", defaults.reconnect.max_delay),
            max_attempts: vars
                .get("CHATLINE_RECONNECT_MAX_ATTEMPTS")
                .and_then(|raw| parse_or_warn("CHATLINE_RECONNECT_MAX_ATTEMPTS", &raw)),
            strategy: match vars.get("CHATLINE_RECONNECT_STRATEGY").as_deref() {
                None | Some("exponential") => BackoffStrategy::Exponential,
                Some("fixed") => BackoffStrategy::Fixed,
                Some(other) => {
                    tracing::warn!(
                        value = %other,
                        "Unknown CHATLINE_RECONNECT_STRATEGY, using exponential"
                    );
                    BackoffStrategy::Exponential
                }
            },
        };

        let runtime = RuntimeConfig {
            submit_timeout: vars.millis(
                "CHATLINE_SUBMIT_TIMEOUT_MS",
                defaults.runtime.submit_timeout,
            ),
            ready_timeout: vars.millis(
                "CHATLINE_READY_TIMEOUT_MS",
                defaults.runtime.ready_timeout,
            ),
        };

        let chunking = ChunkingPolicy {
            min_chars: vars.parse("CHATLINE_CHUNK_MIN", defaults.chunking.min_chars),
            max_chars: vars.parse("CHATLINE_CHUNK_MAX", defaults.chunking.max_chars),
            delay: vars.millis("CHATLINE_CHUNK_DELAY_MS", defaults.chunking.delay),
        }
        .normalized();

        Self {
            port: vars.parse("CHATLINE_PORT", defaults.port),
            backend: backend_kind(&vars),
            reconnect,
            runtime,
            chunking,
        }
    }
}

fn backend_kind(vars: &Vars<'_>) -> BackendKind {
    let kind = vars.get("CHATLINE_BACKEND");
    let url = vars.get("CHATLINE_BACKEND_URL");
    match (kind.as_deref(), url) {
        (None | Some("simulated"), _) => BackendKind::Simulated,
        (Some("http"), Some(url)) => BackendKind::Http { url },
        (Some("socket"), Some(url)) => BackendKind::Socket { url },
        (Some(kind @ ("http" | "socket")), None) => {
            tracing::warn!(
                backend = %kind,
                "CHATLINE_BACKEND_URL not set, using simulated backend"
            );
            BackendKind::Simulated
        }
        (Some(other), _) => {
            tracing::warn!(backend = %other, "Unknown CHATLINE_BACKEND, using simulated backend");
            BackendKind::Simulated
        }
    }
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    /// Set and non-blank
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|raw| parse_or_warn(key, &raw))
            .unwrap_or(default)
    }

    fn millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|raw| parse_or_warn::<u64>(key, &raw))
            .map_or(default, Duration::from_millis)
    }
}

fn parse_or_warn<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    let parsed = raw.parse().ok();
    if parsed.is_none() {
        tracing::warn!(key = %key, value = %raw, "Invalid value, using default");
    }
    parsed
}
