//! ProxyJump: SSH through a chain of jump hosts
//!
//! Each hop after the first is reached over a `direct-tcpip` channel of the
//! previous hop, and the SSH handshake runs on top of that channel stream:
//!
//! ```text
//! engine --SSH--> [jump1] --direct-tcpip--> [jump2] --direct-tcpip--> [target]
//! ```
//!
//! Only the target connection routes `forwarded-tcpip` channels; jump hops get
//! an empty router.

use std::sync::Arc;

use russh::client::Handle;
use tracing::info;

use super::client::{
    authenticate, connect_tcp, handshake, ClientHandler, DialOptions, SshConnection,
};
use super::config::{AuthMethod, SshConfig};
use super::error::SshError;
use crate::forwarding::remote::RemoteForwardRouter;

struct Hop<'a> {
    host: &'a str,
    port: u16,
    username: &'a str,
    auth: &'a AuthMethod,
}

impl Hop<'_> {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub(crate) async fn connect_via_chain(
    config: &SshConfig,
    router: Arc<RemoteForwardRouter>,
    opts: &DialOptions,
) -> Result<SshConnection, SshError> {
    let mut hops: Vec<Hop<'_>> = config
        .proxy_chain
        .iter()
        .map(|h| Hop {
            host: &h.host,
            port: h.port,
            username: &h.username,
            auth: &h.auth,
        })
        .collect();
    hops.push(Hop {
        host: &config.host,
        port: config.port,
        username: &config.username,
        auth: &config.auth,
    });

    info!(
        "Connecting to {} through {} jump host(s)",
        config.endpoint(),
        config.proxy_chain.len()
    );

    let last = hops.len() - 1;
    let mut jump_handles: Vec<Handle<ClientHandler>> = Vec::with_capacity(last);

    for (idx, hop) in hops.iter().enumerate() {
        let endpoint = hop.endpoint();
        let hop_router = if idx == last {
            router.clone()
        } else {
            Arc::new(RemoteForwardRouter::new())
        };
        let handler = ClientHandler::new(hop.host.to_string(), hop.port, hop_router);

        let mut handle = match jump_handles.last() {
            None => {
                let stream = connect_tcp(hop.host, hop.port, opts.connect_timeout).await?;
                handshake(stream, handler, &endpoint, opts).await?
            }
            Some(previous) => {
                let channel = previous
                    .channel_open_direct_tcpip(hop.host, hop.port as u32, "127.0.0.1", 0)
                    .await
                    .map_err(|e| {
                        SshError::HostUnreachable(format!(
                            "Jump host could not reach {}: {}",
                            endpoint, e
                        ))
                    })?;
                handshake(channel.into_stream(), handler, &endpoint, opts).await?
            }
        };

        authenticate(&mut handle, hop.username, hop.auth, &endpoint).await?;

        if idx == last {
            return Ok(SshConnection {
                handle,
                jump_handles,
            });
        }
        info!("Jump host {} ready (hop {}/{})", endpoint, idx + 1, last);
        jump_handles.push(handle);
    }

    // hops always contains the target
    Err(SshError::ConnectionFailed("empty proxy chain".into()))
}
