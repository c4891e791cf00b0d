use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};

use crate::tunnel::transport::{RawStream, TransportSession};

/// Byte streams a yamux session can ride on.
pub trait SessionIo: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static {}
impl<T> SessionIo for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static
{}

/// Yamux-backed implementation of the session contract, shared by the plain
/// TCP and TLS transports.
///
/// A driver task owns the yamux state machine and must keep polling it for
/// any stream to make progress; substreams the peer opens fan into a queue
/// consumed by `accept_stream`, while `open_stream` goes through the yamux
/// control handle. Once the driver exits, both operations report the session
/// as gone.
pub struct MuxSession {
    control: Mutex<tokio_yamux::Control>,
    inbound: Mutex<mpsc::UnboundedReceiver<tokio_yamux::StreamHandle>>,
    peer: Option<SocketAddr>,
    driver: tokio::task::JoinHandle<()>,
}

impl MuxSession {
    pub fn server<S: SessionIo>(io: S, peer: Option<SocketAddr>) -> Self {
        Self::start(
            tokio_yamux::Session::new_server(io, tokio_yamux::Config::default()),
            peer,
        )
    }

    pub fn client<S: SessionIo>(io: S, peer: Option<SocketAddr>) -> Self {
        Self::start(
            tokio_yamux::Session::new_client(io, tokio_yamux::Config::default()),
            peer,
        )
    }

    fn start<S: SessionIo>(mut session: tokio_yamux::Session<S>, peer: Option<SocketAddr>) -> Self {
        let control = session.control();
        let (tx, rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(async move {
            loop {
                match session.next().await {
                    Some(Ok(substream)) => {
                        if tx.send(substream).is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        tracing::debug!(err = %err, "tunnel: mux session failed");
                        break;
                    }
                    None => break,
                }
            }
        });

        Self {
            control: Mutex::new(control),
            inbound: Mutex::new(rx),
            peer,
            driver,
        }
    }
}

fn raw(substream: tokio_yamux::StreamHandle) -> RawStream {
    RawStream {
        id: substream.id(),
        io: Box::new(substream),
    }
}

#[async_trait]
impl TransportSession for MuxSession {
    async fn open_stream(&self) -> anyhow::Result<RawStream> {
        let substream = self.control.lock().await.open_stream().await?;
        Ok(raw(substream))
    }

    async fn accept_stream(&self) -> anyhow::Result<RawStream> {
        let substream = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("tunnel: mux session is gone"))?;
        Ok(raw(substream))
    }

    async fn close(&self) {
        // Try a graceful goaway first; the driver must stay alive to flush
        // it, so the hard abort comes after the deadline.
        let graceful = async {
            let mut ctrl = self.control.lock().await;
            ctrl.close().await;
        };
        let _ = tokio::time::timeout(Duration::from_millis(500), graceful).await;
        self.driver.abort();
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}
