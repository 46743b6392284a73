//! Test utilities and fixtures for wsrelay
//!
//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wsrelay::relay::{BrokerConfig, Limits};

/// Create a temporary directory for testing
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Limits with a short poll interval so loopback tests turn quickly
pub fn fast_limits() -> Limits {
    Limits {
        poll_interval_ms: 5,
        ..Default::default()
    }
}

/// A configuration that listens on a free local port
pub fn local_config(web_dir: &TempDir) -> BrokerConfig {
    BrokerConfig {
        hostname: "127.0.0.1".to_string(),
        web_dir: web_dir.path().to_path_buf(),
        port: Some(0),
        limits: fast_limits(),
        ..Default::default()
    }
}

/// Wait timeout used across tests
pub const WAIT: Duration = Duration::from_secs(5);
