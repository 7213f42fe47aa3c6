//! API server configuration

use std::net::SocketAddr;

use anyhow::{anyhow, Context};

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub database_url: String,
    pub bind_address: SocketAddr,
    /// Bearer token required on every admin route
    pub admin_api_token: String,
}

impl ApiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| anyhow!("DATABASE_URL must be set"))?;

        let bind_address = lookup("BIND_ADDRESS")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("BIND_ADDRESS must be host:port")?;

        let admin_api_token = lookup("ADMIN_API_TOKEN").unwrap_or_default();
        // A short token is as good as none
        if admin_api_token.len() < 16 {
            return Err(anyhow!("ADMIN_API_TOKEN must be at least 16 characters"));
        }

        Ok(Self {
            database_url,
            bind_address,
            admin_api_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_bind_address() {
        let config = ApiConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/netbill"),
            ("ADMIN_API_TOKEN", "0123456789abcdef"),
        ]))
        .unwrap();
        assert_eq!(config.bind_address.port(), 8080);
    }

    #[test]
    fn test_rejects_missing_or_weak_settings() {
        assert!(ApiConfig::from_lookup(lookup_from(&[("ADMIN_API_TOKEN", "0123456789abcdef")])).is_err());
        assert!(ApiConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/netbill"),
            ("ADMIN_API_TOKEN", "short"),
        ]))
        .is_err());
        assert!(ApiConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/netbill"),
            ("ADMIN_API_TOKEN", "0123456789abcdef"),
            ("BIND_ADDRESS", "nowhere"),
        ]))
        .is_err());
    }
}
