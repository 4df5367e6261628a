use std::env;
use std::fmt;

use crate::error::{Result, TrainerError};

pub const HOST_VAR: &str = "HPC_RABBITMQ_HOST";
pub const USER_VAR: &str = "HPC_RABBITMQ_USER";
pub const PASSWORD_VAR: &str = "HPC_RABBITMQ_PASSWORD";
pub const PORT_VAR: &str = "HPC_RABBITMQ_PORT";
pub const VHOST_VAR: &str = "HPC_RABBITMQ_VHOST";
pub const HEARTBEAT_VAR: &str = "HPC_RABBITMQ_HEARTBEAT";

const DEFAULT_PORT: u16 = 5672;
const DEFAULT_VHOST: &str = "/";
const DEFAULT_HEARTBEAT_SECS: u16 = 60;

/// Broker coordinates and credentials, validated once before any connection.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat_secs: u16,
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .ok_or_else(|| TrainerError::Configuration(format!("{} must be set", key)))
        };
        let host = required(HOST_VAR)?;
        let user = required(USER_VAR)?;
        let password = required(PASSWORD_VAR)?;

        let port = match lookup(PORT_VAR) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                TrainerError::Configuration(format!("{} is not a valid port: {:?}", PORT_VAR, raw))
            })?,
            None => DEFAULT_PORT,
        };
        let heartbeat_secs = match lookup(HEARTBEAT_VAR) {
            Some(raw) => raw.trim().parse::<u16>().map_err(|_| {
                TrainerError::Configuration(format!(
                    "{} must be a number of seconds, got {:?}",
                    HEARTBEAT_VAR, raw
                ))
            })?,
            None => DEFAULT_HEARTBEAT_SECS,
        };
        let vhost = lookup(VHOST_VAR).unwrap_or_else(|| DEFAULT_VHOST.to_string());

        let config = Self {
            host: host.trim().to_string(),
            port,
            user,
            password,
            vhost,
            heartbeat_secs,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() || self.host.contains(['/', ' ']) {
            return Err(TrainerError::Configuration(format!(
                "broker host {:?} is not a host name",
                self.host
            )));
        }
        if self.user.contains(':') {
            return Err(TrainerError::Configuration(format!(
                "{} must not contain ':'",
                USER_VAR
            )));
        }
        if self.port == 0 {
            return Err(TrainerError::Configuration(format!("{} must not be 0", PORT_VAR)));
        }
        Ok(())
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .field("heartbeat_secs", &self.heartbeat_secs)
            .finish()
    }
}
