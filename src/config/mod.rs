//! Configuration for the proxy.
//!
//! Everything is loaded once from the environment at startup; there is no
//! config file and no reload. Validation failures are fatal at startup only.

use std::collections::HashMap;

use log::info;

use crate::errors::Error;

pub mod tls;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// A pre-provisioned database account the proxy may log in as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAccount {
    /// The OIDC role name this account is mapped from (lowercased).
    pub role: String,
    pub username: String,
    pub password: String,
}

/// Identity-provider coordinates derived from `AUTH0_TENANT`/`AUDIENCE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcSettings {
    pub issuer: String,
    pub audience: String,
    pub jwks_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Production,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub db_host: String,
    pub db_port: u16,

    /// Account used when no role mapping matches (`GPRXY_USER`/`GPRXY_PASS`).
    pub fallback_user: String,
    pub fallback_pass: String,

    pub tls_certificate: Option<String>,
    pub tls_private_key: Option<String>,

    pub oidc: Option<OidcSettings>,

    pub role_mappings: Vec<ServiceAccount>,
    pub default_role: Option<String>,

    pub log_level: LogLevel,
}

impl Config {
    pub fn from_env() -> Result<Config, Error> {
        Config::from_vars(std::env::vars())
    }

    /// Build the configuration from explicit key/value pairs. `from_env` is
    /// a thin wrapper; tests feed pairs directly.
    pub fn from_vars<I>(vars: I) -> Result<Config, Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let host = vars
            .get("PROXY_HOST")
            .cloned()
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_port(&vars, "PROXY_PORT", 7777)?;

        let db_host = vars
            .get("DB_HOST")
            .cloned()
            .ok_or_else(|| Error::BadConfig("DB_HOST is required".into()))?;
        let db_port = parse_port(&vars, "DB_PORT", 5432)?;

        let fallback_user = vars
            .get("GPRXY_USER")
            .cloned()
            .ok_or_else(|| Error::BadConfig("GPRXY_USER is required".into()))?;
        let fallback_pass = vars
            .get("GPRXY_PASS")
            .cloned()
            .ok_or_else(|| Error::BadConfig("GPRXY_PASS is required".into()))?;

        let (tls_certificate, tls_private_key) =
            match (vars.get("PROXY_CERT"), vars.get("PROXY_KEY")) {
                (Some(cert), Some(key)) => (Some(cert.clone()), Some(key.clone())),
                (None, None) => (None, None),
                _ => {
                    return Err(Error::BadConfig(
                        "PROXY_CERT and PROXY_KEY must be set together".into(),
                    ))
                }
            };

        let oidc = match (vars.get("AUTH0_TENANT"), vars.get("AUDIENCE")) {
            (Some(tenant), Some(audience)) => Some(OidcSettings {
                issuer: format!("https://{tenant}/"),
                jwks_url: format!("https://{tenant}/.well-known/jwks.json"),
                audience: audience.clone(),
            }),
            (None, None) => None,
            _ => {
                return Err(Error::BadConfig(
                    "AUTH0_TENANT and AUDIENCE must be set together".into(),
                ))
            }
        };

        let mut role_mappings = Vec::new();
        for (key, value) in &vars {
            if let Some(role) = key.strip_prefix("ROLE_MAPPING_") {
                if role.is_empty() {
                    return Err(Error::BadConfig(format!("{key} has an empty role name")));
                }
                let (username, password) = value.split_once(':').ok_or_else(|| {
                    Error::BadConfig(format!("{key} must look like username:password"))
                })?;
                if username.is_empty() {
                    return Err(Error::BadConfig(format!("{key} has an empty username")));
                }
                role_mappings.push(ServiceAccount {
                    role: role.to_lowercase(),
                    username: username.to_string(),
                    password: password.to_string(),
                });
            }
        }
        // Environment iteration order is arbitrary; keep logs and tests stable.
        role_mappings.sort_by(|a, b| a.role.cmp(&b.role));

        let default_role = vars
            .get("DEFAULT_ROLE")
            .map(|role| role.trim().to_lowercase());
        if let Some(default_role) = &default_role {
            if !role_mappings.iter().any(|m| &m.role == default_role) {
                return Err(Error::BadConfig(format!(
                    "DEFAULT_ROLE {default_role:?} has no ROLE_MAPPING_ entry"
                )));
            }
        }

        let log_level = match vars.get("LOG_LEVEL").map(String::as_str) {
            Some("debug") => LogLevel::Debug,
            Some("production") | None => LogLevel::Production,
            Some(other) => {
                return Err(Error::BadConfig(format!(
                    "LOG_LEVEL must be 'debug' or 'production', got {other:?}"
                )))
            }
        };

        Ok(Config {
            host,
            port,
            db_host,
            db_port,
            fallback_user,
            fallback_pass,
            tls_certificate,
            tls_private_key,
            oidc,
            role_mappings,
            default_role,
            log_level,
        })
    }

    /// Log a redacted summary of the effective configuration.
    pub fn show(&self) {
        info!("Listen: {}:{}", self.host, self.port);
        info!("Backend: {}:{}", self.db_host, self.db_port);
        info!(
            "TLS: {}",
            if self.tls_certificate.is_some() {
                "enabled"
            } else {
                "disabled"
            }
        );
        match &self.oidc {
            Some(oidc) => info!("OIDC issuer: {}", oidc.issuer),
            None => info!("OIDC: disabled"),
        }
        for mapping in &self.role_mappings {
            info!("Role mapping: {} -> {}", mapping.role, mapping.username);
        }
        if let Some(default_role) = &self.default_role {
            info!("Default role: {default_role}");
        }
        info!("Fallback service account: {}", self.fallback_user);
    }
}

fn parse_port(vars: &HashMap<String, String>, key: &str, default: u16) -> Result<u16, Error> {
    match vars.get(key) {
        Some(value) => value
            .parse()
            .map_err(|_| Error::BadConfig(format!("{key} is not a port number: {value}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> Vec<(String, String)> {
        vec![
            ("DB_HOST".to_string(), "db.internal".to_string()),
            ("GPRXY_USER".to_string(), "gprxy".to_string()),
            ("GPRXY_PASS".to_string(), "gprxy-pass".to_string()),
        ]
    }

    #[test]
    fn minimal_environment_gets_defaults() {
        let config = Config::from_vars(base_vars()).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 7777);
        assert_eq!(config.db_port, 5432);
        assert!(config.oidc.is_none());
        assert!(config.tls_certificate.is_none());
        assert_eq!(config.log_level, LogLevel::Production);
    }

    #[test]
    fn missing_backend_host_is_fatal() {
        let vars = vec![
            ("GPRXY_USER".to_string(), "gprxy".to_string()),
            ("GPRXY_PASS".to_string(), "x".to_string()),
        ];
        assert!(matches!(
            Config::from_vars(vars),
            Err(Error::BadConfig(_))
        ));
    }

    #[test]
    fn tenant_derives_issuer_and_jwks_url() {
        let mut vars = base_vars();
        vars.push(("AUTH0_TENANT".to_string(), "corp.auth0.com".to_string()));
        vars.push(("AUDIENCE".to_string(), "https://db-api".to_string()));

        let config = Config::from_vars(vars).unwrap();
        let oidc = config.oidc.unwrap();
        assert_eq!(oidc.issuer, "https://corp.auth0.com/");
        assert_eq!(
            oidc.jwks_url,
            "https://corp.auth0.com/.well-known/jwks.json"
        );
        assert_eq!(oidc.audience, "https://db-api");
    }

    #[test]
    fn tenant_without_audience_is_fatal() {
        let mut vars = base_vars();
        vars.push(("AUTH0_TENANT".to_string(), "corp.auth0.com".to_string()));
        assert!(Config::from_vars(vars).is_err());
    }

    #[test]
    fn role_mappings_are_parsed_and_normalized() {
        let mut vars = base_vars();
        vars.push(("ROLE_MAPPING_ADMIN".to_string(), "svc_admin:s3cr3t".to_string()));
        vars.push(("ROLE_MAPPING_ANALYST".to_string(), "svc_ro:pass:with:colons".to_string()));
        vars.push(("DEFAULT_ROLE".to_string(), "Analyst".to_string()));

        let config = Config::from_vars(vars).unwrap();
        assert_eq!(config.role_mappings.len(), 2);
        assert_eq!(config.role_mappings[0].role, "admin");
        assert_eq!(config.role_mappings[0].username, "svc_admin");
        assert_eq!(config.role_mappings[0].password, "s3cr3t");
        // Only the first colon separates username from password.
        assert_eq!(config.role_mappings[1].password, "pass:with:colons");
        assert_eq!(config.default_role.as_deref(), Some("analyst"));
    }

    #[test]
    fn mapping_without_colon_is_fatal() {
        let mut vars = base_vars();
        vars.push(("ROLE_MAPPING_ADMIN".to_string(), "svc_admin".to_string()));
        assert!(Config::from_vars(vars).is_err());
    }

    #[test]
    fn default_role_without_mapping_is_fatal() {
        let mut vars = base_vars();
        vars.push(("DEFAULT_ROLE".to_string(), "ghost".to_string()));
        assert!(Config::from_vars(vars).is_err());
    }

    #[test]
    fn cert_without_key_is_fatal() {
        let mut vars = base_vars();
        vars.push(("PROXY_CERT".to_string(), "/etc/cert.pem".to_string()));
        assert!(Config::from_vars(vars).is_err());
    }

    #[test]
    fn unknown_log_level_is_fatal() {
        let mut vars = base_vars();
        vars.push(("LOG_LEVEL".to_string(), "verbose".to_string()));
        assert!(Config::from_vars(vars).is_err());
    }
}
