//! Broker connection configuration.

use std::path::PathBuf;
use std::time::Duration;

use mqlink_client::{ConnectOptions, QoS, Will, DEFAULT_KEEP_ALIVE, DEFAULT_PORT, DEFAULT_TLS_PORT};
use serde::Deserialize;

/// Default connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    /// Broker port. Defaults to 8883 with `tls = true`, 1883 otherwise.
    pub port: Option<u16>,
    /// Client identifier (empty = generated).
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub clean_session: bool,
    /// Keep alive in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Force TLS on or off. Unset enables TLS only on port 8883.
    pub tls: Option<bool>,
    /// PEM file replacing the built-in root certificates.
    pub ca_file: Option<PathBuf>,
    /// Skip server certificate verification.
    pub insecure: bool,
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            client_id: String::new(),
            username: None,
            password: None,
            clean_session: true,
            keep_alive: DEFAULT_KEEP_ALIVE,
            tls: None,
            ca_file: None,
            insecure: false,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl BrokerConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.tls == Some(true) {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        })
    }

    /// Build client connect options, checked the same way `connect` checks
    /// them.
    pub fn to_options(&self, will: Option<&WillConfig>) -> Result<ConnectOptions, String> {
        let mut options = ConnectOptions::new(&self.host)
            .port(self.port())
            .client_id(&self.client_id)
            .clean_session(self.clean_session)
            .keep_alive(self.keep_alive)
            .insecure(self.insecure)
            .connect_timeout(Duration::from_millis(self.connect_timeout_ms));

        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => options = options.credentials(user, pass.as_bytes()),
            (Some(user), None) => options = options.username(user),
            (None, Some(_)) => return Err("broker.password requires broker.username".into()),
            (None, None) => {}
        }
        if let Some(tls) = self.tls {
            options = options.tls(tls);
        }
        if let Some(ca_file) = &self.ca_file {
            options = options.ca_file(ca_file);
        }
        if let Some(will) = will {
            options = options.will(will.to_will()?);
        }

        options.validate().map_err(|e| format!("broker: {}", e))?;
        Ok(options)
    }
}

/// Last will registered at connect time.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WillConfig {
    pub topic: String,
    pub payload: String,
    pub qos: u8,
    pub retain: bool,
}

impl WillConfig {
    pub fn to_will(&self) -> Result<Will, String> {
        let qos = QoS::try_from(self.qos).map_err(|e| format!("will.qos: {}", e))?;
        Ok(Will::new(self.topic.clone(), self.payload.clone())
            .qos(qos)
            .retain(self.retain))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = BrokerConfig::default().to_options(None).unwrap();
        assert_eq!(options.broker, "localhost");
        assert_eq!(options.port, 1883);
        assert!(!options.use_tls());
        assert!(options.client_id.is_empty());
    }

    #[test]
    fn test_tls_changes_default_port() {
        let config = BrokerConfig {
            tls: Some(true),
            ..Default::default()
        };
        assert_eq!(config.port(), 8883);

        let config = BrokerConfig {
            tls: Some(true),
            port: Some(8884),
            ..Default::default()
        };
        let options = config.to_options(None).unwrap();
        assert_eq!(options.port, 8884);
        assert!(options.use_tls());
    }

    #[test]
    fn test_password_without_username_fails() {
        let config = BrokerConfig {
            password: Some("secret".into()),
            ..Default::default()
        };
        assert!(config.to_options(None).is_err());
    }

    #[test]
    fn test_credentials_and_will() {
        let config = BrokerConfig {
            username: Some("user".into()),
            password: Some("secret".into()),
            ..Default::default()
        };
        let will = WillConfig {
            topic: "clients/c1/status".into(),
            payload: "offline".into(),
            qos: 1,
            retain: true,
        };
        let options = config.to_options(Some(&will)).unwrap();
        assert_eq!(options.username.as_deref(), Some("user"));
        assert_eq!(options.password.as_deref(), Some(&b"secret"[..]));

        let will = options.will.unwrap();
        assert_eq!(will.qos, QoS::AtLeastOnce);
        assert!(will.retain);
    }

    #[test]
    fn test_invalid_will_fails() {
        let will = WillConfig {
            topic: "status/#".into(),
            ..Default::default()
        };
        assert!(BrokerConfig::default().to_options(Some(&will)).is_err());

        let will = WillConfig {
            topic: "status".into(),
            qos: 3,
            ..Default::default()
        };
        assert!(BrokerConfig::default().to_options(Some(&will)).is_err());
    }
}
