use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use uuid::Uuid;

/// Default public resolver used for tunnelled UDP/DNS traffic.
pub const DEFAULT_DOH_URL: &str = "https://1.1.1.1/dns-query";

#[derive(Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
}

#[derive(Clone, Deserialize)]
pub struct TunnelConfig {
    /// Access token. Inbound handshakes must carry this identity; the
    /// subscription path matches its canonical hyphenated form.
    pub user_id: Uuid,
    /// DNS-over-HTTPS endpoint that services UDP/port-53 traffic.
    #[serde(default = "default_doh_url")]
    pub doh_url: String,
}

fn default_doh_url() -> String {
    DEFAULT_DOH_URL.to_string()
}

pub fn load_config() -> Result<Config> {
    let content = fs::read_to_string("config.toml").context("Failed to read config.toml file")?;
    toml::from_str(&content).context("Failed to parse config.toml as valid TOML")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(
            r#"
            [listen]
            ip = "0.0.0.0"
            port = 8080

            [tunnel]
            user_id = "9a53bb10-73b3-4f0e-a015-0c65f0b356af"
            doh_url = "https://dns.google/dns-query"
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.port, 8080);
        assert_eq!(
            config.tunnel.user_id.to_string(),
            "9a53bb10-73b3-4f0e-a015-0c65f0b356af"
        );
        assert_eq!(config.tunnel.doh_url, "https://dns.google/dns-query");
    }

    #[test]
    fn resolver_defaults_when_omitted() {
        let config: Config = toml::from_str(
            r#"
            [listen]
            ip = "127.0.0.1"
            port = 9000

            [tunnel]
            user_id = "9a53bb10-73b3-4f0e-a015-0c65f0b356af"
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnel.doh_url, DEFAULT_DOH_URL);
    }

    #[test]
    fn rejects_malformed_token() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [listen]
            ip = "127.0.0.1"
            port = 9000

            [tunnel]
            user_id = "not-a-uuid"
            "#,
        );
        assert!(result.is_err());
    }
}
