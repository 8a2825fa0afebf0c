//! Relay profile configuration.
//!
//! A profile is a JSON file in the usual shadowsocks layout. Every field has
//! a default so a partial file plus command-line overrides is enough.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use shroud_header::Address;
use thiserror::Error;

use crate::dispatcher::{DispatchSettings, DEFAULT_DRAIN_TIMEOUT, DEFAULT_JOIN_GRACE};
use crate::relay::CipherParams;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Errors loading or checking a profile.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Every problem found, in field order.
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// A relay profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Remote endpoint host. Bind address in server mode.
    #[serde(default)]
    pub server: String,

    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Local endpoint bind address.
    #[serde(default = "default_local_address")]
    pub local_address: String,

    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// Cipher name, passed through to sessions.
    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub password: String,

    /// Idle timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// `host:port` to forward connections with malformed headers to. Empty
    /// means none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_redirect: Option<String>,

    /// Require authenticated headers.
    #[serde(default)]
    pub auth: bool,

    /// Worker pool size. Defaults to available parallelism.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// How long auto-bans last. Unset bans until restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ban_ttl_secs: Option<u64>,

    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,
}

fn default_server_port() -> u16 {
    8388
}

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

fn default_local_port() -> u16 {
    1080
}

fn default_method() -> String {
    "aes-256-cfb".to_string()
}

fn default_timeout() -> u64 {
    600
}

fn default_drain_timeout_secs() -> u64 {
    DEFAULT_DRAIN_TIMEOUT.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            server: String::new(),
            server_port: default_server_port(),
            local_address: default_local_address(),
            local_port: default_local_port(),
            method: default_method(),
            password: String::new(),
            timeout: default_timeout(),
            http_redirect: None,
            auth: false,
            workers: None,
            ban_ttl_secs: None,
            drain_timeout_secs: default_drain_timeout_secs(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

impl Profile {
    /// Load a profile from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check the profile for the given mode, reporting every problem.
    pub fn validate(&self, server_mode: bool) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.server.is_empty() {
            problems.push("server must be set".to_string());
        } else if server_mode && self.server.parse::<IpAddr>().is_err() {
            problems.push(format!("server '{}' must be an IP address to bind", self.server));
        } else if let Err(e) = self.server_address() {
            collect(&mut problems, e);
        }
        if self.server_port == 0 {
            problems.push("server_port must be non-zero".to_string());
        }

        if !server_mode && self.local_address.parse::<IpAddr>().is_err() {
            problems.push(format!(
                "local_address '{}' must be an IP address",
                self.local_address
            ));
        }

        if self.method.is_empty() {
            problems.push("method must be set".to_string());
        }
        if self.password.is_empty() {
            problems.push("password must be set".to_string());
        }
        if self.timeout == 0 {
            problems.push("timeout must be at least 1 second".to_string());
        }
        if self.workers == Some(0) {
            problems.push("workers must be at least 1".to_string());
        }

        if let Err(e) = self.redirect_address() {
            collect(&mut problems, e);
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// The remote endpoint as a header address.
    pub fn server_address(&self) -> Result<Address, ConfigError> {
        match self.server.parse::<IpAddr>() {
            Ok(ip) => Ok((ip, self.server_port).into()),
            Err(_) => Address::domain(self.server.clone(), self.server_port)
                .map_err(|e| ConfigError::Invalid(vec![format!("server: {}", e)])),
        }
    }

    /// Redirect target, if one is configured.
    pub fn redirect_address(&self) -> Result<Option<Address>, ConfigError> {
        match self.http_redirect.as_deref() {
            None | Some("") => Ok(None),
            Some(target) => target
                .parse::<Address>()
                .map(Some)
                .map_err(|e| ConfigError::Invalid(vec![format!("http_redirect: {}", e)])),
        }
    }

    /// Address to listen on for the given mode.
    pub fn bind_addr(&self, server_mode: bool) -> Result<SocketAddr, ConfigError> {
        let (host, port, field) = if server_mode {
            (&self.server, self.server_port, "server")
        } else {
            (&self.local_address, self.local_port, "local_address")
        };
        let ip = host.parse::<IpAddr>().map_err(|_| {
            ConfigError::Invalid(vec![format!("{} '{}' is not an IP address", field, host)])
        })?;
        Ok(SocketAddr::new(ip, port))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn ban_ttl(&self) -> Option<Duration> {
        self.ban_ttl_secs.map(Duration::from_secs)
    }

    /// Dispatcher settings for the given mode.
    pub fn to_settings(
        &self,
        server_mode: bool,
        auto_ban: bool,
    ) -> Result<DispatchSettings, ConfigError> {
        Ok(DispatchSettings {
            timeout: self.idle_timeout(),
            server_addr: self.server_address()?,
            cipher: CipherParams::new(self.method.clone(), self.password.clone()),
            is_local: !server_mode,
            auto_ban,
            auth: self.auth,
            redirect: self.redirect_address()?,
            workers: self.workers.unwrap_or_else(DispatchSettings::default_workers),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
            join_grace: DEFAULT_JOIN_GRACE,
        })
    }
}

fn collect(problems: &mut Vec<String>, error: ConfigError) {
    match error {
        ConfigError::Invalid(mut found) => problems.append(&mut found),
        other => problems.push(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> Profile {
        Profile {
            server: "127.0.0.1".to_string(),
            password: "secret".to_string(),
            ..Profile::default()
        }
    }

    #[test]
    fn test_from_file_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"server": "198.51.100.4", "server_port": 443, "password": "pw", "auth": true}}"#
        )
        .unwrap();

        let profile = Profile::from_file(file.path()).unwrap();
        assert_eq!(profile.server, "198.51.100.4");
        assert_eq!(profile.server_port, 443);
        assert!(profile.auth);
        assert_eq!(profile.local_port, 1080);
        assert_eq!(profile.timeout, 600);
        assert_eq!(profile.drain_timeout_secs, 5);
        assert_eq!(profile.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_from_file_errors() {
        let err = Profile::from_file("/nonexistent/profile.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = Profile::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let profile = Profile {
            server: String::new(),
            password: String::new(),
            timeout: 0,
            workers: Some(0),
            ..Profile::default()
        };

        match profile.validate(false) {
            Err(ConfigError::Invalid(problems)) => assert_eq!(problems.len(), 4),
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_server_mode_needs_ip() {
        let profile = Profile {
            server: "relay.example.com".to_string(),
            ..valid()
        };
        assert!(profile.validate(false).is_ok());
        assert!(profile.validate(true).is_err());
    }

    #[test]
    fn test_redirect_parsing() {
        let mut profile = valid();
        assert_eq!(profile.redirect_address().unwrap(), None);

        profile.http_redirect = Some(String::new());
        assert_eq!(profile.redirect_address().unwrap(), None);

        profile.http_redirect = Some("127.0.0.1:8080".to_string());
        assert_eq!(
            profile.redirect_address().unwrap(),
            Some("127.0.0.1:8080".parse().unwrap())
        );

        profile.http_redirect = Some("no-port".to_string());
        assert!(profile.validate(false).is_err());
    }

    #[test]
    fn test_to_settings() {
        let profile = Profile {
            workers: Some(3),
            timeout: 30,
            ..valid()
        };

        let settings = profile.to_settings(true, true).unwrap();
        assert!(!settings.is_local);
        assert!(settings.auto_ban);
        assert_eq!(settings.workers, 3);
        assert_eq!(settings.timeout, Duration::from_secs(30));
        assert_eq!(settings.server_addr, "127.0.0.1:8388".parse().unwrap());

        let local = Profile::default();
        assert_eq!(
            local.bind_addr(false).unwrap(),
            "127.0.0.1:1080".parse().unwrap()
        );
    }
}
