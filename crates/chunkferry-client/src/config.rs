use chunkferry_core::Credentials;
use reqwest::Url;

const DEFAULT_SERVER_URL: &str = "http://localhost:5000";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),
    #[error("invalid server URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Where to connect and as whom.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_url: Url,
    pub username: String,
    pub auth_token: String,
}

impl ClientConfig {
    /// Loads `.env` if present, then reads `CHUNKFERRY_SERVER_URL`,
    /// `CHUNKFERRY_USERNAME` and `CHUNKFERRY_AUTH_TOKEN`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw_url = lookup("CHUNKFERRY_SERVER_URL").unwrap_or_else(|| DEFAULT_SERVER_URL.into());
        let server_url = Url::parse(&raw_url).map_err(|e| ConfigError::InvalidUrl {
            url: raw_url.clone(),
            reason: e.to_string(),
        })?;
        if server_url.cannot_be_a_base() {
            return Err(ConfigError::InvalidUrl {
                url: raw_url,
                reason: "not a base URL".into(),
            });
        }

        let required = |key: &'static str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };
        Ok(Self {
            server_url,
            username: required("CHUNKFERRY_USERNAME")?,
            auth_token: required("CHUNKFERRY_AUTH_TOKEN")?,
        })
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(&self.username, &self.auth_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| vars.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_to_localhost() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("CHUNKFERRY_USERNAME", "alice"),
            ("CHUNKFERRY_AUTH_TOKEN", "pw"),
        ]))
        .unwrap();
        assert_eq!(config.server_url.as_str(), "http://localhost:5000/");
        assert_eq!(config.credentials().owner, "alice");
    }

    #[test]
    fn credentials_are_required() {
        let err = ClientConfig::from_lookup(lookup(&[("CHUNKFERRY_USERNAME", "alice")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CHUNKFERRY_AUTH_TOKEN")));
    }

    #[test]
    fn rejects_bad_urls() {
        let err = ClientConfig::from_lookup(lookup(&[
            ("CHUNKFERRY_SERVER_URL", "not a url"),
            ("CHUNKFERRY_USERNAME", "alice"),
            ("CHUNKFERRY_AUTH_TOKEN", "pw"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidUrl { .. }));
    }
}
