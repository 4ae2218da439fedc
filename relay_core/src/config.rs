use anyhow::{Context, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Default listen port when `PORT` is unset
pub const DEFAULT_PORT: u16 = 12345;

const PORT_VAR: &str = "PORT";
const HOST_VAR: &str = "RELAY_HOST";
const SESSION_TTL_VAR: &str = "RELAY_SESSION_TTL_SECS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Evict sessions that never started streaming after this long.
    /// `None` keeps them until both parties show up.
    pub session_ttl: Option<Duration>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            session_ttl: None,
        }
    }
}

impl RelayConfig {
    /// Read configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; unset or blank values keep defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(port) = get(PORT_VAR) {
            config.port = port
                .parse()
                .with_context(|| format!("Invalid {}: {:?}", PORT_VAR, port))?;
        }

        if let Some(host) = get(HOST_VAR) {
            config.host = host
                .parse()
                .with_context(|| format!("Invalid {}: {:?}", HOST_VAR, host))?;
        }

        if let Some(ttl) = get(SESSION_TTL_VAR) {
            let secs: u64 = ttl
                .parse()
                .with_context(|| format!("Invalid {}: {:?}", SESSION_TTL_VAR, ttl))?;
            config.session_ttl = (secs > 0).then(|| Duration::from_secs(secs));
        }

        Ok(config)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RelayConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:12345");
    }

    #[test]
    fn test_overrides() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("RELAY_HOST", "127.0.0.1"),
            ("RELAY_SESSION_TTL_SECS", "600"),
        ]))
        .unwrap();

        assert_eq!(config.socket_addr().to_string(), "127.0.0.1:8080");
        assert_eq!(config.session_ttl, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_zero_ttl_disables_eviction() {
        let config = RelayConfig::from_lookup(lookup(&[("RELAY_SESSION_TTL_SECS", "0")])).unwrap();
        assert_eq!(config.session_ttl, None);
    }

    #[test]
    fn test_blank_port_keeps_default() {
        let config = RelayConfig::from_lookup(lookup(&[("PORT", "  ")])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_invalid_port_rejected() {
        let err = RelayConfig::from_lookup(lookup(&[("PORT", "70000")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
