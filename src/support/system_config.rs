//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Tridove.
//
// Tridove is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Tridove is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of  MERCHANTABILITY or
// FITNESS FOR  A PARTICULAR PURPOSE.  See the  GNU General  Public License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Tridove. If not, see <http://www.gnu.org/licenses/>.

use std::path::PathBuf;

use serde::Deserialize;

/// The system-wide configuration for Tridove.
///
/// This is stored in a file named `tridove.toml` under the Tridove system
/// root, which is typically `/usr/local/etc/tridove` or `/etc/tridove`.
#[derive(Clone, Debug, Deserialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub server: ServerConfig,

    /// Configuration for TLS. If absent, only the cleartext listeners are
    /// bound and STARTTLS/STLS are not offered.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub pop3: Pop3Config,

    #[serde(default)]
    pub imap: ImapConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// The host name used in greetings and Received headers.
    ///
    /// If empty, the system host name is used.
    #[serde(default)]
    pub host_name: String,
    /// The address all listeners bind to.
    #[serde(default = "defaults::bind_address")]
    pub bind_address: String,
    /// The number of runtime worker threads.
    #[serde(default = "defaults::worker_threads")]
    pub worker_threads: usize,
    /// Seconds a connection may sit idle before it is dropped.
    #[serde(default = "defaults::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StorageConfig {
    /// The directory under which all mailboxes live, laid out as
    /// `<root>/<domain>/<user>/`.
    #[serde(default = "defaults::maildir_root")]
    pub maildir_root: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DatabaseConfig {
    /// The path of the SQLite user directory.
    #[serde(default = "defaults::database_path")]
    pub path: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "defaults::smtp_port")]
    pub port: u16,
    #[serde(default = "defaults::smtp_submission_port")]
    pub submission_port: u16,
    #[serde(default = "defaults::smtp_tls_port")]
    pub tls_port: u16,
    #[serde(default = "defaults::max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "defaults::max_recipients")]
    pub max_recipients: usize,
    /// If true, MAIL FROM is rejected until the client authenticates.
    #[serde(default)]
    pub require_auth: bool,
    /// If true, unauthenticated clients may relay to remote domains.
    #[serde(default)]
    pub allow_relay: bool,
    /// Domains considered local in addition to those in the user directory.
    #[serde(default)]
    pub local_domains: Vec<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Pop3Config {
    #[serde(default = "defaults::pop3_port")]
    pub port: u16,
    #[serde(default = "defaults::pop3_tls_port")]
    pub tls_port: u16,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ImapConfig {
    #[serde(default = "defaults::imap_port")]
    pub port: u16,
    #[serde(default = "defaults::imap_tls_port")]
    pub tls_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl Default for Pop3Config {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

impl Default for ImapConfig {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn bind_address() -> String {
        "0.0.0.0".to_owned()
    }

    pub fn worker_threads() -> usize {
        4
    }

    pub fn idle_timeout_secs() -> u64 {
        300
    }

    pub fn maildir_root() -> PathBuf {
        "/var/mail/tridove".to_owned().into()
    }

    pub fn database_path() -> PathBuf {
        "/var/mail/tridove/users.sqlite".to_owned().into()
    }

    pub fn smtp_port() -> u16 {
        25
    }

    pub fn smtp_submission_port() -> u16 {
        587
    }

    pub fn smtp_tls_port() -> u16 {
        465
    }

    pub fn max_message_size() -> usize {
        32 * 1024 * 1024
    }

    pub fn max_recipients() -> usize {
        100
    }

    pub fn pop3_port() -> u16 {
        110
    }

    pub fn pop3_tls_port() -> u16 {
        995
    }

    pub fn imap_port() -> u16 {
        143
    }

    pub fn imap_tls_port() -> u16 {
        993
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: SystemConfig = toml::from_str("").unwrap();
        assert_eq!(4, config.server.worker_threads);
        assert_eq!(300, config.server.idle_timeout_secs);
        assert_eq!(25, config.smtp.port);
        assert_eq!(587, config.smtp.submission_port);
        assert_eq!(465, config.smtp.tls_port);
        assert_eq!(110, config.pop3.port);
        assert_eq!(995, config.pop3.tls_port);
        assert_eq!(143, config.imap.port);
        assert_eq!(993, config.imap.tls_port);
        assert!(config.tls.is_none());
        assert!(!config.smtp.require_auth);
        assert!(!config.smtp.allow_relay);
    }

    #[test]
    fn partial_config_overrides() {
        let config: SystemConfig = toml::from_str(
            r#"
[server]
host_name = "mail.example.com"
worker_threads = 8

[tls]
private_key = "key.pem"
certificate_chain = "cert.pem"

[smtp]
require_auth = true
local_domains = ["example.com"]
"#,
        )
        .unwrap();
        assert_eq!("mail.example.com", config.server.host_name);
        assert_eq!(8, config.server.worker_threads);
        assert!(config.tls.is_some());
        assert!(config.smtp.require_auth);
        assert_eq!(vec!["example.com".to_owned()], config.smtp.local_domains);
        // Unrelated sections keep their defaults
        assert_eq!(110, config.pop3.port);
    }
}
