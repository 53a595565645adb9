//! SSH connection parameters of an asset

use serde::{Deserialize, Serialize};

/// How to reach and authenticate against an SSH asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    /// Authentication method
    pub auth: AuthMethod,

    /// Per-asset dial timeout; the pool default applies when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,

    /// Jump hosts, first hop first (ProxyJump)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub proxy_chain: Vec<ProxyHopConfig>,
}

impl SshConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>, auth: AuthMethod) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            auth,
            connect_timeout_secs: None,
            proxy_chain: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_jump(mut self, hop: ProxyHopConfig) -> Self {
        self.proxy_chain.push(hop);
        self
    }

    /// `host:port` for logging
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration for a single proxy hop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHopConfig {
    /// Jump host address
    pub host: String,

    /// Jump host port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for the jump host
    pub username: String,

    /// Authentication method for the jump host
    pub auth: AuthMethod,
}

/// Authentication methods supported
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// Password authentication
    Password { password: String },

    /// SSH key authentication
    Key {
        /// Path to private key file (`~/` is expanded)
        key_path: String,
        /// Optional passphrase for encrypted keys
        #[serde(default)]
        passphrase: Option<String>,
    },

    /// SSH certificate authentication (OpenSSH certificates)
    Certificate {
        key_path: String,
        /// Path to certificate file (*-cert.pub)
        cert_path: String,
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    pub fn certificate(
        key_path: impl Into<String>,
        cert_path: impl Into<String>,
        passphrase: Option<String>,
    ) -> Self {
        Self::Certificate {
            key_path: key_path.into(),
            cert_path: cert_path.into(),
            passphrase,
        }
    }

    /// Short label for logs
    pub fn kind(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "key",
            AuthMethod::Certificate { .. } => "certificate",
        }
    }
}

// Secrets never reach the logs
impl std::fmt::Debug for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::Password { .. } => f.write_str("Password { .. }"),
            AuthMethod::Key { key_path, .. } => {
                f.debug_struct("Key").field("key_path", key_path).finish_non_exhaustive()
            }
            AuthMethod::Certificate {
                key_path, cert_path, ..
            } => f
                .debug_struct("Certificate")
                .field("key_path", key_path)
                .field("cert_path", cert_path)
                .finish_non_exhaustive(),
        }
    }
}

/// Expand a leading `~` so russh::keys can open the path
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home.to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

fn default_port() -> u16 {
    22
}
