//! Listeners: the server side of every transport scheme.

use std::sync::Arc;

use tokio::net::{TcpListener, UnixListener};

use crate::errors::NetError;
use crate::stream::{fdpipe, Stream};
use crate::tls;
use crate::url;

/// A bound listener accepting [`Stream`]s for one URL scheme.
pub struct Listener {
    inner: Inner,
    url: String,
}

enum Inner {
    Tcp(TcpListener),
    Tls(TcpListener, tokio_rustls::TlsAcceptor),
    Quic(quinn::Endpoint),
    Unix(UnixListener),
    Pipe(UnixListener),
}

impl Listener {
    /// Bind a listener; the scheme selects the transport.
    ///
    /// `tcps://` and `quic://` load their certificate from the file named
    /// by `QILOOP_CERT_CONF` or fall back to a generated self-signed one.
    pub async fn bind(addr: &str) -> Result<Self, NetError> {
        let (scheme, rest) = url::split(addr)?;
        match scheme {
            "tcp" => {
                let listener = bind_tcp(rest).await?;
                let url = local_url("tcp", &listener, rest);
                Ok(Self { inner: Inner::Tcp(listener), url })
            },
            "tcps" => {
                let listener = bind_tcp(rest).await?;
                let url = local_url("tcps", &listener, rest);
                let config = tls::server_config(false)?;
                let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));
                Ok(Self { inner: Inner::Tls(listener, acceptor), url })
            },
            "quic" => {
                let local: std::net::SocketAddr = tokio::net::lookup_host(rest)
                    .await
                    .map_err(|e| NetError::Connect(format!("quic://{rest}: {e}")))?
                    .next()
                    .ok_or_else(|| NetError::Connect(format!("quic://{rest}: no address")))?;
                let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(
                    tls::server_config(true)?,
                )
                .map_err(|e| NetError::Tls(format!("quic tls config: {e}")))?;
                let config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
                let endpoint = quinn::Endpoint::server(config, local)
                    .map_err(|e| NetError::Connect(format!("quic://{rest}: {e}")))?;
                let url = endpoint
                    .local_addr()
                    .map_or_else(|_| format!("quic://{rest}"), |a| format!("quic://{a}"));
                Ok(Self { inner: Inner::Quic(endpoint), url })
            },
            "unix" => {
                let listener = bind_unix(rest)?;
                Ok(Self { inner: Inner::Unix(listener), url: format!("unix://{rest}") })
            },
            "pipe" => {
                let listener = bind_unix(rest)?;
                Ok(Self { inner: Inner::Pipe(listener), url: format!("pipe://{rest}") })
            },
            _ => Err(NetError::UnsupportedScheme(addr.to_string())),
        }
    }

    /// The bound URL, with the kernel-assigned port resolved.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Accept the next connection.
    pub async fn accept(&self) -> Result<Stream, NetError> {
        match &self.inner {
            Inner::Tcp(listener) => {
                let (conn, peer) = listener.accept().await.map_err(NetError::from)?;
                let (read, write) = conn.into_split();
                Ok(Stream::from_parts(read, write, format!("tcp://{peer}")))
            },
            Inner::Tls(listener, acceptor) => {
                let (conn, peer) = listener.accept().await.map_err(NetError::from)?;
                let stream = acceptor
                    .accept(conn)
                    .await
                    .map_err(|e| NetError::Tls(format!("handshake with {peer} failed: {e}")))?;
                let (read, write) = tokio::io::split(stream);
                Ok(Stream::from_parts(read, write, format!("tcps://{peer}")))
            },
            Inner::Quic(endpoint) => {
                let incoming = endpoint.accept().await.ok_or(NetError::Closed)?;
                let connection = incoming
                    .await
                    .map_err(|e| NetError::Connect(format!("quic accept: {e}")))?;
                // One bidirectional stream per connection; the client opens it.
                let (send, recv) = connection
                    .accept_bi()
                    .await
                    .map_err(|e| NetError::Connect(format!("quic accept stream: {e}")))?;
                let peer = format!("quic://{}", connection.remote_address());
                Ok(Stream::from_parts(recv, send, peer).hold(connection))
            },
            Inner::Unix(listener) => {
                let (conn, _) = listener.accept().await.map_err(NetError::from)?;
                let path = self.url.trim_start_matches("unix://").to_string();
                let (read, write) = conn.into_split();
                Ok(Stream::from_parts(read, write, format!("unix://{path}")))
            },
            Inner::Pipe(listener) => {
                let (conn, _) = listener.accept().await.map_err(NetError::from)?;
                let path = self.url.trim_start_matches("pipe://");
                fdpipe::accept(conn, path).await
            },
        }
    }
}

async fn bind_tcp(host_port: &str) -> Result<TcpListener, NetError> {
    TcpListener::bind(host_port)
        .await
        .map_err(|e| NetError::Connect(format!("bind {host_port}: {e}")))
}

fn bind_unix(path: &str) -> Result<UnixListener, NetError> {
    // A stale socket file from a previous run would fail the bind.
    let _ = std::fs::remove_file(path);
    UnixListener::bind(path).map_err(|e| NetError::Connect(format!("bind {path}: {e}")))
}

fn local_url(scheme: &str, listener: &TcpListener, requested: &str) -> String {
    listener
        .local_addr()
        .map_or_else(|_| format!("{scheme}://{requested}"), |a| format!("{scheme}://{a}"))
}
