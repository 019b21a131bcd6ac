//! Process configuration read from environment variables.

use crate::lifecycle::TransitionPolicy;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Mongo { uri: String, database: String },
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub storage: StorageBackend,
    pub jwt_secret: String,
    pub client_url: Option<String>,
    pub environment: Environment,
    pub allow_admin_registration: bool,
    pub cookie_secure: bool,
    pub status_transitions: TransitionPolicy,
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid {
            name,
            value: value.to_string(),
        }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).filter(|it| !it.trim().is_empty());

        let port = match var("PORT") {
            Some(port) => port.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "PORT",
                value: port,
            })?,
            None => 5000,
        };

        let storage = match var("STORAGE").as_deref().map(str::trim) {
            None | Some("mongo") => StorageBackend::Mongo {
                uri: var("MONGODB_URI").ok_or(ConfigError::Missing("MONGODB_URI"))?,
                database: var("DATABASE_NAME").unwrap_or_else(|| "courier".to_string()),
            },
            Some("memory") => StorageBackend::Memory,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "STORAGE",
                    value: other.to_string(),
                })
            }
        };

        let jwt_secret = var("JWT_SECRET").ok_or(ConfigError::Missing("JWT_SECRET"))?;

        let environment = match var("APP_ENV").as_deref().map(str::trim) {
            None | Some("development") => Environment::Development,
            Some("production") => Environment::Production,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "APP_ENV",
                    value: other.to_string(),
                })
            }
        };

        let allow_admin_registration = var("ALLOW_ADMIN_REGISTRATION")
            .map(|it| parse_bool("ALLOW_ADMIN_REGISTRATION", &it))
            .transpose()?
            .unwrap_or(false);

        let cookie_secure = var("COOKIE_SECURE")
            .map(|it| parse_bool("COOKIE_SECURE", &it))
            .transpose()?
            .unwrap_or(!environment.is_development());

        let status_transitions = match var("STATUS_TRANSITIONS") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "STATUS_TRANSITIONS",
                value,
            })?,
            None => TransitionPolicy::default(),
        };

        Ok(Self {
            port,
            storage,
            jwt_secret,
            client_url: var("CLIENT_URL"),
            environment,
            allow_admin_registration,
            cookie_secure,
            status_transitions,
        })
    }
}
