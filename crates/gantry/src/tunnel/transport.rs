use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;

/// Marker for the byte streams the tunnel moves around. Boxing behind this
/// trait erases whether the bytes ride a yamux substream, a TCP socket or a
/// TLS session, which is all the pumps need to know.
pub trait StreamIo: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T> StreamIo for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn StreamIo>;

/// One logical stream of a multiplexed session. The id is unique within the
/// session and is what the server advertises in the `NewStream` header.
pub struct RawStream {
    pub id: u32,
    pub io: BoxedStream,
}

#[derive(Debug, Clone, Default)]
pub struct TlsListenOptions {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct TlsDialOptions {
    pub server_name: String,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TransportListenOptions {
    pub tls: TlsListenOptions,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    pub tls: TlsDialOptions,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;
    async fn dial(
        &self,
        addr: &str,
        opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>>;
    fn local_addr(&self) -> Option<SocketAddr>;
    async fn close(&self) -> anyhow::Result<()>;
}

/// The multiplexer contract: ordered, independent, bidirectional sub-streams
/// over one reliable byte stream, with per-stream flow control provided by
/// the mux library. Session termination surfaces as errors from
/// `open_stream`/`accept_stream`.
#[async_trait]
pub trait TransportSession: Send + Sync {
    async fn open_stream(&self) -> anyhow::Result<RawStream>;
    async fn accept_stream(&self) -> anyhow::Result<RawStream>;
    async fn close(&self);
    fn remote_addr(&self) -> Option<SocketAddr>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "tls" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|tls)"),
    }
}

pub mod mux;
pub mod tcp;
pub mod tls;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        "tls" => Ok(Arc::new(tls::TlsTransport::new())),
        _ => unreachable!(),
    }
}
