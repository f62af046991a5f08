//! Connect options and session manager configuration.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::will::Will;

/// Default plain MQTT port.
pub const DEFAULT_PORT: u16 = 1883;
/// Port on which TLS is enabled unless explicitly overridden.
pub const DEFAULT_TLS_PORT: u16 = 8883;
/// Default keep-alive in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 60;
/// Default bound on waiting for an engine's background context to stop.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

const CLIENT_ID_PREFIX: &str = "mqlink-";

/// Everything needed to open one broker connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Broker host name or IP address.
    pub broker: String,
    pub port: u16,
    /// Client identifier. Empty means one is generated at connect time.
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Vec<u8>>,
    pub clean_session: bool,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,
    /// Explicit TLS switch. `None` enables TLS iff `port` is 8883.
    pub tls: Option<bool>,
    /// PEM bundle replacing the built-in root certificates.
    pub ca_file: Option<PathBuf>,
    /// Accept any server certificate.
    pub insecure: bool,
    pub will: Option<Will>,
    /// Bound on TCP connect, TLS handshake and CONNACK wait.
    pub connect_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: DEFAULT_PORT,
            client_id: String::new(),
            username: None,
            password: None,
            clean_session: true,
            keep_alive: DEFAULT_KEEP_ALIVE,
            tls: None,
            ca_file: None,
            insecure: false,
            will: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnectOptions {
    /// Create options for the given broker host with all defaults.
    pub fn new(broker: impl Into<String>) -> Self {
        Self {
            broker: broker.into(),
            ..Default::default()
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set username and password.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set a username without a password.
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Force TLS on or off regardless of the port.
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls = Some(enabled);
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    pub fn insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Whether the connection is wrapped in TLS.
    pub fn use_tls(&self) -> bool {
        self.tls.unwrap_or(self.port == DEFAULT_TLS_PORT)
    }

    /// Check the options without touching the network.
    pub fn validate(&self) -> Result<()> {
        if self.broker.is_empty() {
            return Err(ClientError::InvalidOptions("broker must not be empty".into()));
        }
        if self.broker.chars().any(char::is_whitespace) {
            return Err(ClientError::InvalidOptions(format!(
                "broker '{}' contains whitespace",
                self.broker
            )));
        }
        if self.port == 0 {
            return Err(ClientError::InvalidOptions("port must not be 0".into()));
        }
        if self.client_id.len() > u16::MAX as usize {
            return Err(ClientError::InvalidOptions("client id is too long".into()));
        }
        if self.password.is_some() && self.username.is_none() {
            return Err(ClientError::InvalidOptions(
                "password requires a username".into(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::InvalidOptions(
                "connect timeout must be non-zero".into(),
            ));
        }
        if let Some(will) = &self.will {
            will.validate()?;
        }
        Ok(())
    }

    /// Validate and fill in the generated client id.
    pub(crate) fn resolve(mut self) -> Result<Self> {
        self.validate()?;
        if self.client_id.is_empty() {
            self.client_id = generate_client_id();
        }
        Ok(self)
    }
}

/// Generate a client id of the form `mqlink-<16 hex digits>`.
///
/// 23 characters, the longest id every 3.1.1 broker must accept.
pub fn generate_client_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("{}{}", CLIENT_ID_PREFIX, &random[..16])
}

/// Session manager configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long disconnect, reconnect and teardown wait for an engine to stop
    /// before abandoning it.
    pub stop_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

impl SessionConfig {
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ConnectOptions::new("broker.local");
        assert_eq!(opts.port, 1883);
        assert_eq!(opts.keep_alive, 60);
        assert!(opts.clean_session);
        assert!(!opts.use_tls());
        assert!(opts.client_id.is_empty());
    }

    #[test]
    fn test_tls_follows_port_unless_overridden() {
        assert!(ConnectOptions::new("b").port(8883).use_tls());
        assert!(!ConnectOptions::new("b").port(8883).tls(false).use_tls());
        assert!(ConnectOptions::new("b").port(1883).tls(true).use_tls());
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        assert!(ConnectOptions::new("").validate().is_err());
        assert!(ConnectOptions::new("bad host").validate().is_err());
        assert!(ConnectOptions::new("b").port(0).validate().is_err());

        let mut opts = ConnectOptions::new("b");
        opts.password = Some(b"secret".to_vec());
        assert!(matches!(
            opts.validate(),
            Err(ClientError::InvalidOptions(_))
        ));

        let opts = ConnectOptions::new("b").will(Will::new("status/#", "gone"));
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_resolve_generates_client_id() {
        let opts = ConnectOptions::new("b").resolve().unwrap();
        assert!(opts.client_id.starts_with("mqlink-"));
        assert_eq!(opts.client_id.len(), "mqlink-".len() + 16);

        let kept = ConnectOptions::new("b").client_id("c1").resolve().unwrap();
        assert_eq!(kept.client_id, "c1");
    }

    #[test]
    fn test_generated_ids_differ() {
        assert_ne!(generate_client_id(), generate_client_id());
    }

    #[test]
    fn test_generated_id_fits_minimum_broker_limit() {
        let id = generate_client_id();
        assert_eq!(id.len(), 23);
        assert!(id["mqlink-".len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
