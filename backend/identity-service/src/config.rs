//! Configuration management for Identity Service
//!
//! Loads settings from environment variables, with a `.env` file honoured in
//! debug builds.
//!
//! # Example
//!
//! ```no_run
//! use identity_service::config::Settings;
//!
//! fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load()?;
//!     println!("JWT issuer: {}", settings.jwt.issuer);
//!     Ok(())
//! }
//! ```

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::info;

use crate::security::DEFAULT_TOKEN_TIMEOUT_SECS;

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub event_bus: EventBusSettings,
    pub jwt: JwtSettings,
    pub providers: ProviderSettings,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self> {
        // Load .env file in development
        if cfg!(debug_assertions) && dotenvy::dotenv().is_ok() {
            info!("Loaded .env file for development");
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(&lookup);
        Ok(Settings {
            database: DatabaseSettings::from_vars(&vars)?,
            event_bus: EventBusSettings::from_vars(&vars)?,
            jwt: JwtSettings::from_vars(&vars)?,
            providers: ProviderSettings::from_vars(&vars)?,
        })
    }
}

struct Vars<'a>(&'a dyn Fn(&str) -> Option<String>);

impl Vars<'_> {
    /// Value of `key`, with blank values treated as unset
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|value| !value.trim().is_empty())
    }

    fn require(&self, key: &str) -> Result<String> {
        self.get(key).ok_or_else(|| anyhow!("{} must be set", key))
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        match self.get(key) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .with_context(|| format!("Invalid {}", key)),
            None => Ok(default),
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|value| {
                value
                    .split(',')
                    .map(|item| item.trim().to_string())
                    .filter(|item| !item.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL URL; the in-memory repository is used when unset
    pub url: Option<String>,
    pub max_connections: u32,
}

impl DatabaseSettings {
    fn from_vars(vars: &Vars<'_>) -> Result<Self> {
        Ok(Self {
            url: vars.get("DATABASE_URL"),
            max_connections: vars.parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventBusProvider {
    Kafka,
    InProc,
}

impl FromStr for EventBusProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "kafka" => Ok(Self::Kafka),
            "inproc" => Ok(Self::InProc),
            other => bail!("unknown event bus provider: {}", other),
        }
    }
}

/// Event transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusSettings {
    pub provider: EventBusProvider,
    pub brokers: Vec<String>,
    pub topic: String,
    pub group_id: String,
}

impl EventBusSettings {
    fn from_vars(vars: &Vars<'_>) -> Result<Self> {
        let brokers = vars.list("KAFKA_BROKERS");
        let provider = match vars.get("EVENT_BUS_PROVIDER") {
            Some(value) => value
                .parse::<EventBusProvider>()
                .context("Invalid EVENT_BUS_PROVIDER")?,
            None if brokers.is_empty() => EventBusProvider::InProc,
            None => EventBusProvider::Kafka,
        };

        if provider == EventBusProvider::Kafka && brokers.is_empty() {
            bail!("KAFKA_BROKERS must be set when EVENT_BUS_PROVIDER=kafka");
        }

        Ok(Self {
            provider,
            brokers,
            topic: vars
                .get("KAFKA_TOPIC")
                .unwrap_or_else(|| "identity.users".to_string()),
            group_id: vars
                .get("KAFKA_GROUP_ID")
                .unwrap_or_else(|| "identity-service-projection".to_string()),
        })
    }
}

/// Session token settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtSettings {
    /// Ed25519 private key (PKCS#8 PEM)
    pub private_key: String,
    /// Ed25519 public key (SPKI PEM)
    pub public_key: String,
    pub issuer: String,
    pub audiences: Vec<String>,
    pub timeout_secs: i64,
}

impl JwtSettings {
    fn from_vars(vars: &Vars<'_>) -> Result<Self> {
        let timeout_secs = vars.parse_or("JWT_TIMEOUT_SECS", DEFAULT_TOKEN_TIMEOUT_SECS)?;
        if timeout_secs <= 0 {
            bail!("JWT_TIMEOUT_SECS must be positive");
        }

        Ok(Self {
            private_key: pem(vars.require("JWT_PRIVATE_KEY")?),
            public_key: pem(vars.require("JWT_PUBLIC_KEY")?),
            issuer: vars
                .get("JWT_ISSUER")
                .unwrap_or_else(|| "identity-service".to_string()),
            audiences: vars.list("JWT_AUDIENCES"),
            timeout_secs,
        })
    }
}

/// PEM values often arrive with escaped newlines
fn pem(value: String) -> String {
    value.replace("\\n", "\n")
}

/// Identity-provider settings. A provider is enabled only when its
/// settings are present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub google_client_id: Option<String>,
    pub line: Option<LineSettings>,
    pub passkeys: Option<PasskeySettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineSettings {
    pub channel_id: String,
    pub channel_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasskeySettings {
    pub base_url: String,
    pub tenant_id: String,
    pub api_key: String,
    pub audience: String,
}

impl ProviderSettings {
    fn from_vars(vars: &Vars<'_>) -> Result<Self> {
        let line = match vars.get("LINE_CHANNEL_ID") {
            Some(channel_id) => Some(LineSettings {
                channel_id,
                channel_secret: vars.require("LINE_CHANNEL_SECRET")?,
                redirect_uri: vars.require("LINE_REDIRECT_URI")?,
            }),
            None => None,
        };

        let passkeys = match vars.get("PASSKEYS_TENANT_ID") {
            Some(tenant_id) => Some(PasskeySettings {
                base_url: vars.require("PASSKEYS_BASE_URL")?,
                tenant_id,
                api_key: vars.require("PASSKEYS_API_KEY")?,
                audience: vars.require("PASSKEYS_AUDIENCE")?,
            }),
            None => None,
        };

        Ok(Self {
            google_client_id: vars.get("GOOGLE_CLIENT_ID"),
            line,
            passkeys,
        })
    }
}
