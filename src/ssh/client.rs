//! SSH client: dial, authenticate, and the russh callback handler

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::Channel;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::config::{expand_tilde, AuthMethod, SshConfig};
use super::error::SshError;
use super::proxy::connect_via_chain;
use crate::forwarding::remote::{handle_forwarded_connection, RemoteForwardRouter};

/// Timeouts applied to a single dial
#[derive(Debug, Clone, Copy)]
pub struct DialOptions {
    pub connect_timeout: Duration,
    /// russh protocol keepalive; the pool runs its own probe on top
    pub ssh_keepalive: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            ssh_keepalive: Duration::from_secs(30),
        }
    }
}

impl DialOptions {
    pub(crate) fn client_config(&self) -> Arc<client::Config> {
        Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(self.ssh_keepalive),
            keepalive_max: 3,
            ..Default::default()
        })
    }
}

/// An authenticated connection plus the jump hosts it runs through
pub struct SshConnection {
    pub handle: Handle<ClientHandler>,
    /// Intermediate hops, first hop first; must outlive `handle`
    pub jump_handles: Vec<Handle<ClientHandler>>,
}

/// Dial and authenticate against `config`, directly or through its jump chain.
///
/// `router` receives the server-initiated `forwarded-tcpip` channels of the
/// target connection.
pub async fn connect(
    config: &SshConfig,
    router: Arc<RemoteForwardRouter>,
    opts: &DialOptions,
) -> Result<SshConnection, SshError> {
    let opts = match config.connect_timeout_secs {
        Some(secs) => DialOptions {
            connect_timeout: Duration::from_secs(secs),
            ..*opts
        },
        None => *opts,
    };

    if !config.proxy_chain.is_empty() {
        return connect_via_chain(config, router, &opts).await;
    }

    let endpoint = config.endpoint();
    info!("Connecting to SSH server at {}", endpoint);

    let stream = connect_tcp(&config.host, config.port, opts.connect_timeout).await?;
    let handler = ClientHandler::new(config.host.clone(), config.port, router);
    let mut handle = handshake(stream, handler, &endpoint, &opts).await?;

    authenticate(&mut handle, &config.username, &config.auth, &endpoint).await?;

    Ok(SshConnection {
        handle,
        jump_handles: Vec::new(),
    })
}

/// Resolve and open the TCP leg, classifying failures
pub(crate) async fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TcpStream, SshError> {
    let endpoint = format!("{}:{}", host, port);

    let attempt = async {
        let addrs: Vec<_> = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| SshError::HostUnreachable(format!("Failed to resolve {}: {}", endpoint, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(SshError::HostUnreachable(format!(
                "No address found for {}",
                endpoint
            )));
        }

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY on {}: {}", endpoint, e);
                    }
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => SshError::from_connect_io(e, &endpoint),
            None => SshError::HostUnreachable(endpoint.clone()),
        })
    };

    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {} timed out", endpoint)))?
}

/// Run the SSH handshake over an established byte stream
pub(crate) async fn handshake<S>(
    stream: S,
    handler: ClientHandler,
    endpoint: &str,
    opts: &DialOptions,
) -> Result<Handle<ClientHandler>, SshError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let handle = tokio::time::timeout(
        opts.connect_timeout,
        client::connect_stream(opts.client_config(), stream, handler),
    )
    .await
    .map_err(|_| SshError::Timeout(format!("SSH handshake with {} timed out", endpoint)))??;

    debug!("SSH handshake with {} completed", endpoint);
    Ok(handle)
}

/// Authenticate `username` on a freshly handshaken connection
pub(crate) async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    auth: &AuthMethod,
    endpoint: &str,
) -> Result<(), SshError> {
    debug!("Authenticating {}@{} with {}", username, endpoint, auth.kind());

    let result = match auth {
        AuthMethod::Password { password } => handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
        AuthMethod::Key {
            key_path,
            passphrase,
        } => {
            let key = russh::keys::load_secret_key(expand_tilde(key_path), passphrase.as_deref())?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
        AuthMethod::Certificate {
            key_path,
            cert_path,
            passphrase,
        } => {
            let key = russh::keys::load_secret_key(expand_tilde(key_path), passphrase.as_deref())?;
            let cert = russh::keys::load_openssh_certificate(expand_tilde(cert_path))
                .map_err(|e| SshError::CertificateError(e.to_string()))?;
            handle
                .authenticate_openssh_cert(username, Arc::new(key), cert)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
    };

    if !result.success() {
        return Err(SshError::AuthenticationFailed(format!(
            "{} rejected credentials for {}",
            endpoint, username
        )));
    }

    info!("SSH authentication successful for {}@{}", username, endpoint);
    Ok(())
}

/// russh callback handler
///
/// Accepts the server host key (host-key policy lives with the asset store)
/// and hands `forwarded-tcpip` channels to the connection's router.
pub struct ClientHandler {
    host: String,
    port: u16,
    router: Arc<RemoteForwardRouter>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, router: Arc<RemoteForwardRouter>) -> Self {
        Self { host, port, router }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        info!(
            "Accepting {:?} host key for {}:{}",
            server_public_key.algorithm(),
            self.host,
            self.port
        );
        Ok(true)
    }

    /// Someone connected to a port the server forwards back to us
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "forwarded-tcpip {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let Some(route) = self.router.lookup(connected_address, connected_port) else {
            warn!(
                "No remote forward registered for {}:{}, dropping channel",
                connected_address, connected_port
            );
            let _ = channel.close().await;
            return Ok(());
        };

        // Must not block the russh event loop
        tokio::spawn(handle_forwarded_connection(channel, route));
        Ok(())
    }
}
