// Startup parameters for the relay

use crate::relay::error::BrokerError;
use crate::relay::outbox::DEFAULT_MAX_CHUNK;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Secure listener settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Capacity and pacing knobs of the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Maximum number of simultaneously admitted connections
    pub max_clients: usize,
    /// Largest chunk handed to the transport in one write
    pub max_chunk: usize,
    /// Capacity of the inbound and outbound queues (`0` = unbounded)
    pub queue_capacity: usize,
    /// Longest time the broker loop waits for transport events
    pub poll_interval_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_clients: 64,
            max_chunk: DEFAULT_MAX_CHUNK,
            queue_capacity: 100,
            poll_interval_ms: 50,
        }
    }
}

impl Limits {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check the limits alone; used when the caller brings its own transport
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.max_clients == 0 {
            return Err(BrokerError::config("max_clients must be at least 1"));
        }
        if self.max_chunk == 0 {
            return Err(BrokerError::config("max_chunk must be at least 1"));
        }
        Ok(())
    }
}

/// Broker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Name of the server: 'localhost', 'example.com', ...
    pub hostname: String,
    /// Directory holding the static web content
    pub web_dir: PathBuf,
    /// Plain listener port; `None` disables it, `Some(0)` picks a free port
    pub port: Option<u16>,
    /// Secure listener
    pub tls: Option<TlsConfig>,
    pub limits: Limits,
    /// Send outbound messages as binary frames instead of text
    pub binary_frames: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            web_dir: PathBuf::from("."),
            port: None,
            tls: None,
            limits: Limits::default(),
            binary_frames: false,
        }
    }
}

impl BrokerConfig {
    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text)
            .map_err(|e| BrokerError::config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Check listeners, document root, TLS material and limits
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.port.is_none() && self.tls.is_none() {
            return Err(BrokerError::config("at least one port must be configured"));
        }

        if let Some(tls) = &self.tls {
            if self.port == Some(tls.port) {
                return Err(BrokerError::config("port and TLS port cannot be the same"));
            }
            if !tls.cert_path.is_file() {
                return Err(BrokerError::config(format!(
                    "cannot find TLS certificate: {}",
                    tls.cert_path.display()
                )));
            }
            if !tls.key_path.is_file() {
                return Err(BrokerError::config(format!(
                    "cannot find TLS key: {}",
                    tls.key_path.display()
                )));
            }
        }

        if !self.web_dir.is_dir() {
            return Err(BrokerError::config(format!(
                "invalid web directory: {}",
                self.web_dir.display()
            )));
        }

        self.limits.validate()
    }

    /// Multi-line summary of the configuration
    pub fn describe(&self) -> String {
        let port = self.port.map_or_else(|| "-".to_string(), |p| p.to_string());
        let (tls_port, cert, key) = match &self.tls {
            Some(tls) => (
                tls.port.to_string(),
                tls.cert_path.display().to_string(),
                tls.key_path.display().to_string(),
            ),
            None => ("-".to_string(), String::new(), String::new()),
        };

        let mut out = String::new();
        let _ = writeln!(out, "Hostname:      {}", self.hostname);
        let _ = writeln!(out, "Web directory: {}", self.web_dir.display());
        let _ = writeln!(out, "HTTP port:     {}", port);
        let _ = writeln!(out, "HTTP enabled:  {}", self.port.is_some());
        let _ = writeln!(out, "TLS port:      {}", tls_port);
        let _ = writeln!(out, "TLS cert path: {}", cert);
        let _ = writeln!(out, "TLS key path:  {}", key);
        let _ = writeln!(out, "TLS enabled:   {}", self.tls.is_some());
        let _ = writeln!(out, "Max clients:   {}", self.limits.max_clients);
        let _ = writeln!(out, "Max chunk:     {}", self.limits.max_chunk);
        let _ = writeln!(out, "Queue size:    {}", self.limits.queue_capacity);
        out
    }
}
