//! Simulator configuration loaded at startup.

use attestation_core::SecureElement;
use thiserror::Error;

/// How each session's secure element gets its key.
#[derive(Clone, PartialEq, Eq)]
pub enum KeyProvisioning {
    /// Every session signs with this fixed secret.
    Fixed([u8; 32]),
    /// Every session generates its own key.
    PerSession,
    /// No key at all; signing requests end the session.
    Unprovisioned,
}

impl std::fmt::Debug for KeyProvisioning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(_) => write!(f, "Fixed(<redacted>)"),
            Self::PerSession => write!(f, "PerSession"),
            Self::Unprovisioned => write!(f, "Unprovisioned"),
        }
    }
}

/// Configuration for the device simulator.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// TCP address the simulator listens on
    pub listen_addr: String,
    /// Key source for session secure elements
    pub provisioning: KeyProvisioning,
    /// Longest accepted command line, excluding the terminator
    pub max_line_bytes: usize,
    /// Emit logs as JSON
    pub log_json: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:1234".to_string(),
            provisioning: KeyProvisioning::PerSession,
            max_line_bytes: 256,
            log_json: false,
        }
    }
}

impl SimConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("SIM_LISTEN_ADDR") {
            config.listen_addr = addr;
        }

        if let Some(max) = lookup("SIM_MAX_LINE_BYTES") {
            config.max_line_bytes = max
                .parse()
                .ok()
                .filter(|n: &usize| *n >= 65)
                .ok_or(ConfigError::InvalidValue("SIM_MAX_LINE_BYTES"))?;
        }

        if let Some(flag) = lookup("SIM_LOG_JSON") {
            config.log_json = parse_bool(&flag).ok_or(ConfigError::InvalidValue("SIM_LOG_JSON"))?;
        }

        let provision = match lookup("SIM_PROVISION_KEY") {
            Some(flag) => {
                parse_bool(&flag).ok_or(ConfigError::InvalidValue("SIM_PROVISION_KEY"))?
            }
            None => true,
        };

        config.provisioning = match lookup("SIM_SIGNING_KEY") {
            Some(secret) => {
                let mut bytes = [0u8; 32];
                hex::decode_to_slice(secret.trim(), &mut bytes)
                    .map_err(|_| ConfigError::InvalidValue("SIM_SIGNING_KEY"))?;
                KeyProvisioning::Fixed(bytes)
            }
            None if provision => KeyProvisioning::PerSession,
            None => KeyProvisioning::Unprovisioned,
        };

        Ok(config)
    }

    /// Build the secure element for a new session.
    pub fn secure_element(&self) -> SecureElement {
        match &self.provisioning {
            KeyProvisioning::Fixed(secret) => SecureElement::from_secret_bytes(secret),
            KeyProvisioning::PerSession => SecureElement::generate(),
            KeyProvisioning::Unprovisioned => SecureElement::unprovisioned(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {0}")]
    InvalidValue(&'static str),
}
