use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::net;
use crate::tunnel::transport::{
    mux::MuxSession, Transport, TransportDialOptions, TransportListenOptions, TransportListener,
    TransportSession,
};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let ln = TcpListener::bind(net::normalize_bind_addr(addr).as_ref()).await?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    async fn dial(
        &self,
        addr: &str,
        _opts: TransportDialOptions,
    ) -> anyhow::Result<Arc<dyn TransportSession>> {
        let c = TcpStream::connect(addr).await?;
        let remote = c.peer_addr().ok();
        Ok(Arc::new(MuxSession::client(c, remote)))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<Arc<dyn TransportSession>> {
        let (c, peer) = self.ln.accept().await?;
        Ok(Arc::new(MuxSession::server(c, Some(peer))))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }

    async fn close(&self) -> anyhow::Result<()> {
        // TcpListener has no async close; drop closes.
        Ok(())
    }
}
