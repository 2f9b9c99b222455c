//! The byte-stream abstraction and per-scheme dialers.
//!
//! A [`Stream`] is one bidirectional, fully-ordered byte channel, already
//! split into read and write halves (the endpoint gives the read half to
//! its reader task and keeps the write half behind a lock). The transport
//! behind it is invisible above this module.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};

use crate::errors::NetError;
use crate::tls;
use crate::url;

/// Boxed read half of a stream.
pub(crate) type ReadHalf = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of a stream.
pub(crate) type WriteHalf = Box<dyn AsyncWrite + Send + Unpin>;
/// Transport guts that must outlive the halves (QUIC endpoint/connection).
pub(crate) type Hold = Vec<Box<dyn std::any::Any + Send + Sync>>;

/// One bidirectional byte channel with a peer label for logs.
pub struct Stream {
    reader: ReadHalf,
    writer: WriteHalf,
    peer: String,
    hold: Hold,
}

impl Stream {
    /// Assemble a stream from raw halves.
    pub fn from_parts(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        peer: impl Into<String>,
    ) -> Self {
        Self { reader: Box::new(reader), writer: Box::new(writer), peer: peer.into(), hold: Vec::new() }
    }

    /// Keep a transport handle alive as long as the stream.
    pub(crate) fn hold(mut self, guard: impl std::any::Any + Send + Sync) -> Self {
        self.hold.push(Box::new(guard));
        self
    }

    /// Peer identification for logs, e.g. `tcp://10.0.0.1:9559`.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn into_parts(self) -> (ReadHalf, WriteHalf, String, Hold) {
        (self.reader, self.writer, self.peer, self.hold)
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("peer", &self.peer).finish()
    }
}

/// An in-memory connected pair of streams.
///
/// The loopback analog of a socket pair, used by tests and in-process
/// sessions.
pub fn pipe() -> (Stream, Stream) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        Stream::from_parts(a_read, a_write, "pipe://a"),
        Stream::from_parts(b_read, b_write, "pipe://b"),
    )
}

/// Connect to `addr`; the scheme selects the transport.
///
/// Supported: `tcp://host:port`, `tcps://host:port` (TLS, certificate
/// verification skipped), `quic://host:port` (ALPN `qi-messaging`, one
/// bidirectional stream per connection), `unix:///path`, `pipe:///path`
/// (a Unix socket used only to exchange a pipe fd pair).
pub async fn dial(addr: &str) -> Result<Stream, NetError> {
    let (scheme, rest) = url::split(addr)?;
    match scheme {
        "tcp" => dial_tcp(rest).await,
        "tcps" => dial_tls(rest).await,
        "quic" => dial_quic(rest).await,
        "unix" => dial_unix(rest).await,
        "pipe" => fdpipe::dial(rest).await,
        _ => Err(NetError::UnsupportedScheme(addr.to_string())),
    }
}

async fn dial_tcp(host_port: &str) -> Result<Stream, NetError> {
    let conn = TcpStream::connect(host_port)
        .await
        .map_err(|e| NetError::Connect(format!("tcp://{host_port}: {e}")))?;
    let peer = conn
        .peer_addr()
        .map_or_else(|_| format!("tcp://{host_port}"), |a| format!("tcp://{a}"));
    let (read, write) = conn.into_split();
    Ok(Stream::from_parts(read, write, peer))
}

async fn dial_tls(host_port: &str) -> Result<Stream, NetError> {
    let conn = TcpStream::connect(host_port)
        .await
        .map_err(|e| NetError::Connect(format!("tcps://{host_port}: {e}")))?;
    let peer = conn
        .peer_addr()
        .map_or_else(|_| format!("tcps://{host_port}"), |a| format!("tcps://{a}"));

    let server_name = rustls::pki_types::ServerName::try_from(url::host(host_port).to_string())
        .map_err(|e| NetError::Tls(format!("invalid server name: {e}")))?;
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls::client_config(false)));
    let stream = connector
        .connect(server_name, conn)
        .await
        .map_err(|e| NetError::Tls(format!("handshake with {host_port} failed: {e}")))?;

    let (read, write) = tokio::io::split(stream);
    Ok(Stream::from_parts(read, write, peer))
}

async fn dial_quic(host_port: &str) -> Result<Stream, NetError> {
    let remote = tokio::net::lookup_host(host_port)
        .await
        .map_err(|e| NetError::Connect(format!("quic://{host_port}: {e}")))?
        .next()
        .ok_or_else(|| NetError::Connect(format!("quic://{host_port}: no address")))?;

    let bind: std::net::SocketAddr = if remote.is_ipv6() {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    };
    let mut endpoint = quinn::Endpoint::client(bind)
        .map_err(|e| NetError::Connect(format!("quic endpoint: {e}")))?;

    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(tls::client_config(true))
        .map_err(|e| NetError::Tls(format!("quic tls config: {e}")))?;
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));

    let connection = endpoint
        .connect(remote, url::host(host_port))
        .map_err(|e| NetError::Connect(format!("quic://{host_port}: {e}")))?
        .await
        .map_err(|e| NetError::Connect(format!("quic://{host_port}: {e}")))?;

    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| NetError::Connect(format!("quic://{host_port}: open stream: {e}")))?;

    let peer = format!("quic://{}", connection.remote_address());
    Ok(Stream::from_parts(recv, send, peer).hold(endpoint).hold(connection))
}

async fn dial_unix(path: &str) -> Result<Stream, NetError> {
    let conn = UnixStream::connect(path)
        .await
        .map_err(|e| NetError::Connect(format!("unix://{path}: {e}")))?;
    let (read, write) = conn.into_split();
    Ok(Stream::from_parts(read, write, format!("unix://{path}")))
}

/// The `pipe://` transport: a Unix socket exchanges one pipe fd pair per
/// direction, and the pipes become the carrier.
pub(crate) mod fdpipe {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

    use async_send_fd::{AsyncRecvFd, AsyncSendFd};
    use tokio::net::unix::pipe;
    use tokio::net::UnixStream;

    use super::Stream;
    use crate::errors::NetError;

    /// Claim ownership of a descriptor received over a Unix socket.
    #[allow(unsafe_code)]
    fn claim(fd: RawFd) -> OwnedFd {
        // SAFETY: recvmsg installed a fresh descriptor in this process;
        // nothing else owns it yet.
        unsafe { OwnedFd::from_raw_fd(fd) }
    }

    /// Client side: receive (read fd, write fd) and wrap them.
    pub(crate) async fn dial(path: &str) -> Result<Stream, NetError> {
        let sock = UnixStream::connect(path)
            .await
            .map_err(|e| NetError::Connect(format!("pipe://{path}: {e}")))?;
        let read_fd = claim(
            sock.recv_fd().await.map_err(|e| NetError::Connect(format!("pipe://{path}: {e}")))?,
        );
        let write_fd = claim(
            sock.recv_fd().await.map_err(|e| NetError::Connect(format!("pipe://{path}: {e}")))?,
        );
        wrap(read_fd, write_fd, format!("pipe://{path}"))
    }

    /// Server side: create both pipes on accept and hand the peer ends to
    /// the client.
    pub(crate) async fn accept(sock: UnixStream, path: &str) -> Result<Stream, NetError> {
        let (down_read, down_write) =
            std::io::pipe().map_err(|e| NetError::Io(format!("pipe: {e}")))?;
        let (up_read, up_write) =
            std::io::pipe().map_err(|e| NetError::Io(format!("pipe: {e}")))?;

        // The client reads the downstream pipe and writes the upstream one.
        sock.send_fd(down_read.as_raw_fd())
            .await
            .map_err(|e| NetError::Connect(format!("pipe://{path}: send fd: {e}")))?;
        sock.send_fd(up_write.as_raw_fd())
            .await
            .map_err(|e| NetError::Connect(format!("pipe://{path}: send fd: {e}")))?;
        drop(down_read);
        drop(up_write);

        wrap(OwnedFd::from(up_read), OwnedFd::from(down_write), format!("pipe://{path}"))
    }

    fn wrap(read_fd: OwnedFd, write_fd: OwnedFd, peer: String) -> Result<Stream, NetError> {
        let reader = pipe::Receiver::from_owned_fd(read_fd)
            .map_err(|e| NetError::Io(format!("pipe receiver: {e}")))?;
        let writer = pipe::Sender::from_owned_fd(write_fd)
            .map_err(|e| NetError::Io(format!("pipe sender: {e}")))?;
        Ok(Stream::from_parts(reader, writer, peer))
    }
}
