//! Front door service configuration (env-driven).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::acceptor::DEFAULT_MAX_CONNECTIONS;

const DEFAULT_LISTENERS: &str = "tcp@[::]:1883";

/// Transport of one configured listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    Tcp,
    Tls,
    Ws,
    Wss,
    /// WebSocket over HTTP/1.1 or HTTP/2, plain text.
    H2,
    /// WebSocket over HTTPS, HTTP/1.1 or HTTP/2.
    H2s,
}

impl ListenerKind {
    /// Whether certificate and key are needed.
    pub fn needs_tls(self) -> bool {
        matches!(self, ListenerKind::Tls | ListenerKind::Wss | ListenerKind::H2s)
    }
}

impl FromStr for ListenerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "tcp" => ListenerKind::Tcp,
            "tls" => ListenerKind::Tls,
            "ws" => ListenerKind::Ws,
            "wss" => ListenerKind::Wss,
            "h2" => ListenerKind::H2,
            "h2s" => ListenerKind::H2s,
            other => bail!("unknown listener kind {other:?} (expected tcp, tls, ws, wss, h2, h2s)"),
        })
    }
}

/// One `<kind>@<addr>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerBinding {
    pub kind: ListenerKind,
    pub addr: SocketAddr,
}

impl FromStr for ListenerBinding {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (kind, addr) = s
            .split_once('@')
            .with_context(|| format!("listener {s:?} must look like <kind>@<addr>"))?;
        Ok(Self {
            kind: kind.trim().parse()?,
            addr: addr
                .trim()
                .parse()
                .with_context(|| format!("invalid listener address {addr:?}"))?,
        })
    }
}

/// Front door configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listeners to bind.
    pub listeners: Vec<ListenerBinding>,

    /// PEM certificate chain for TLS listeners.
    pub tls_cert: Option<PathBuf>,

    /// PEM private key for TLS listeners.
    pub tls_key: Option<PathBuf>,

    /// Expect PROXY protocol headers from a load balancer.
    pub trust_proxy: bool,

    /// Max concurrent connections per listener.
    pub max_connections: usize,

    /// Give up on clients that send no decidable header in time.
    pub sniff_timeout: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listeners = var("FRONTDOOR_LISTENERS")
            .unwrap_or_else(|| DEFAULT_LISTENERS.to_string())
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| entry.parse::<ListenerBinding>())
            .collect::<Result<Vec<ListenerBinding>>>()
            .context("FRONTDOOR_LISTENERS is invalid.")?;
        if listeners.is_empty() {
            bail!("FRONTDOOR_LISTENERS names no listener.");
        }

        let tls_cert = var("FRONTDOOR_TLS_CERT").map(PathBuf::from);
        let tls_key = var("FRONTDOOR_TLS_KEY").map(PathBuf::from);
        if listeners.iter().any(|l| l.kind.needs_tls()) && (tls_cert.is_none() || tls_key.is_none())
        {
            bail!("TLS listeners need FRONTDOOR_TLS_CERT and FRONTDOOR_TLS_KEY.");
        }

        let trust_proxy = var("FRONTDOOR_TRUST_PROXY")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        let max_connections: usize = var("FRONTDOOR_MAX_CONNECTIONS")
            .map(|v| v.parse())
            .transpose()
            .context("FRONTDOOR_MAX_CONNECTIONS must be an integer.")?
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(1);

        let sniff_timeout = var("FRONTDOOR_SNIFF_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("FRONTDOOR_SNIFF_TIMEOUT_MS must be an integer (milliseconds).")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let log_level = var("FRONTDOOR_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listeners,
            tls_cert,
            tls_key,
            trust_proxy,
            max_connections,
            sniff_timeout,
            log_level,
        })
    }
}
