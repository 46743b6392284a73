// CLI arguments for the relay binary

use crate::relay::config::{BrokerConfig, TlsConfig};
use crate::relay::error::BrokerError;
use clap::Parser;
use std::path::PathBuf;

/// wsrelay - relay messages between WebSocket clients and the application
#[derive(Debug, Parser)]
#[command(name = "wsrelay")]
#[command(author, version, about, long_about = None)]
pub struct RelayCli {
    /// JSON configuration file; flags below override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Server name (e.g. localhost, example.com)
    #[arg(long)]
    pub hostname: Option<String>,

    /// Directory containing the static web content
    #[arg(short = 'd', long)]
    pub web_dir: Option<PathBuf>,

    /// Port for plain WebSocket connections
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Port for secure connections (requires --cert and --key)
    #[arg(long, requires_all = ["cert", "key"])]
    pub tls_port: Option<u16>,

    /// TLS certificate file
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// TLS private key file
    #[arg(long)]
    pub key: Option<PathBuf>,

    /// Maximum number of connected clients
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Send outbound messages as binary frames
    #[arg(long)]
    pub binary: bool,

    /// Reply to every inbound message with the same payload
    #[arg(long)]
    pub echo: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    pub print_config: bool,
}

impl RelayCli {
    /// Build the broker configuration from the file (if any) and the flags
    pub fn broker_config(&self) -> Result<BrokerConfig, BrokerError> {
        let mut config = match &self.config {
            Some(path) => BrokerConfig::load(path)?,
            None => BrokerConfig {
                port: Some(8080),
                ..Default::default()
            },
        };

        if let Some(hostname) = &self.hostname {
            config.hostname = hostname.clone();
        }
        if let Some(web_dir) = &self.web_dir {
            config.web_dir = web_dir.clone();
        }
        if let Some(port) = self.port {
            config.port = Some(port);
        }
        if let (Some(port), Some(cert), Some(key)) = (self.tls_port, &self.cert, &self.key) {
            config.tls = Some(TlsConfig {
                port,
                cert_path: cert.clone(),
                key_path: key.clone(),
            });
        }
        if let Some(max_clients) = self.max_clients {
            config.limits.max_clients = max_clients;
        }
        if self.binary {
            config.binary_frames = true;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cli_parsing() {
        let cli = RelayCli::try_parse_from(["wsrelay", "--port", "9001", "--echo"]).unwrap();
        assert!(cli.echo);

        let config = cli.broker_config().unwrap();
        assert_eq!(config.port, Some(9001));
        assert!(config.tls.is_none());
    }

    #[test]
    fn test_tls_port_requires_material() {
        assert!(RelayCli::try_parse_from(["wsrelay", "--tls-port", "8443"]).is_err());
    }

    #[test]
    fn test_flags_override_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("relay.json");
        std::fs::write(&path, r#"{ "port": 7000, "hostname": "example.com" }"#).unwrap();

        let cli = RelayCli::try_parse_from([
            "wsrelay",
            "--config",
            path.to_str().unwrap(),
            "--port",
            "7001",
            "--max-clients",
            "5",
        ])
        .unwrap();

        let config = cli.broker_config().unwrap();
        assert_eq!(config.hostname, "example.com");
        assert_eq!(config.port, Some(7001));
        assert_eq!(config.limits.max_clients, 5);
    }
}
