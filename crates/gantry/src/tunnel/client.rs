use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use crate::config::ProxyConfig;
use crate::net;
use crate::tunnel::codec::{self, ControlMsg, ProxyKind};
use crate::tunnel::flow;
use crate::tunnel::transport::{transport_by_name, RawStream, TlsDialOptions, TransportDialOptions};

/// The server closed the session before it ever became healthy, which is how
/// an authentication or handshake rejection looks from this side. Retrying
/// would loop forever, so it is fatal.
#[derive(Debug, thiserror::Error)]
#[error("server rejected the session (handshake or authentication)")]
pub struct SessionRejected;

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub token: String,
    pub tls: bool,
    pub tls_opts: TlsDialOptions,
    pub dial_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub proxies: Vec<ProxyConfig>,
}

pub struct Client {
    opts: ClientOptions,
    by_name: Arc<HashMap<String, ProxyConfig>>,
}

impl Client {
    pub fn new(mut opts: ClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server address is required");
        }
        if opts.proxies.is_empty() {
            anyhow::bail!("tunnel: client has no proxies configured");
        }
        if opts.dial_timeout == Duration::ZERO {
            opts.dial_timeout = Duration::from_secs(5);
        }

        let by_name: HashMap<String, ProxyConfig> = opts
            .proxies
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        Ok(Self {
            opts,
            by_name: Arc::new(by_name),
        })
    }

    /// Runs the client until shutdown, reconnecting with backoff on session
    /// loss. A session the server rejects outright is not retried.
    pub async fn run(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is::<SessionRejected>() => {
                    tracing::error!(server = %self.opts.server_addr, err = %err, "tunnel: giving up");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "tunnel: disconnected; retrying"
                    );
                }
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(Duration::from_secs(10));
        }
    }

    async fn run_once(
        &self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let tr = transport_by_name(if self.opts.tls { "tls" } else { "tcp" })?;

        let dial = tr.dial(
            &self.opts.server_addr,
            TransportDialOptions {
                tls: self.opts.tls_opts.clone(),
            },
        );
        let sess = timeout(self.opts.dial_timeout, dial)
            .await
            .context("tunnel: dial timed out")??;

        // The control stream is the first stream of the session: handshake,
        // then one Register per configured proxy.
        let ctrl = sess.open_stream().await?;
        let mut ctrl_io = ctrl.io;
        codec::write_handshake(&mut ctrl_io, codec::AUTH_TOKEN, self.opts.token.as_bytes()).await?;
        for p in &self.opts.proxies {
            codec::write_register(&mut ctrl_io, p.kind, p.remote_port, p.local_port, &p.name)
                .await?;
        }

        tracing::info!(
            transport = %tr.name(),
            server = %self.opts.server_addr,
            proxies = self.opts.proxies.len(),
            "tunnel: connected"
        );

        // A session is healthy once the server has echoed a heartbeat or
        // opened a stream to us; a session that dies before that was
        // rejected.
        let healthy = Arc::new(AtomicBool::new(false));

        let (mut ctrl_rd, mut ctrl_wr) = tokio::io::split(ctrl_io);

        let heartbeat_interval = self.opts.heartbeat_interval;
        let emitter = tokio::spawn(async move {
            let mut tick = tokio::time::interval(heartbeat_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if codec::write_heartbeat(&mut ctrl_wr).await.is_err() {
                    break;
                }
            }
        });

        let heartbeat_timeout = self.opts.heartbeat_timeout;
        let watchdog_healthy = healthy.clone();
        let mut watchdog = tokio::spawn(async move {
            loop {
                match timeout(heartbeat_timeout, codec::read_record(&mut ctrl_rd)).await {
                    Err(_) => {
                        tracing::warn!(
                            grace = %humantime::format_duration(heartbeat_timeout),
                            "tunnel: no heartbeat echo within grace"
                        );
                        break;
                    }
                    Ok(Err(_)) => break,
                    Ok(Ok(record)) => match codec::parse_control(&record) {
                        Ok(ControlMsg::Heartbeat) => {
                            watchdog_healthy.store(true, Ordering::Relaxed);
                        }
                        other => {
                            tracing::debug!(msg = ?other, "tunnel: unexpected control message");
                        }
                    },
                }
            }
        });

        // Demultiplex server-initiated streams until the session or the
        // control stream dies.
        let session_err = loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        emitter.abort();
                        watchdog.abort();
                        sess.close().await;
                        tracing::info!("tunnel: client shut down");
                        return Ok(());
                    }
                }
                _ = &mut watchdog => {
                    break anyhow::anyhow!("tunnel: control stream lost");
                }
                st = sess.accept_stream() => {
                    match st {
                        Ok(st) => {
                            healthy.store(true, Ordering::Relaxed);
                            let by_name = self.by_name.clone();
                            let proxies = self.opts.proxies.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_stream(by_name, proxies, st).await {
                                    tracing::debug!(err = %err, "tunnel: inbound stream ended");
                                }
                            });
                        }
                        Err(err) => break err,
                    }
                }
            }
        };

        emitter.abort();
        watchdog.abort();
        sess.close().await;

        if healthy.load(Ordering::Relaxed) {
            Err(session_err.context("tunnel: session lost"))
        } else {
            Err(SessionRejected.into())
        }
    }
}

/// Routes one server-initiated stream to a loopback service: reads the
/// `NewStream` header, resolves the target proxy (by name, then by remote
/// port, then any sole proxy), and pumps bytes until either side finishes.
async fn handle_stream(
    by_name: Arc<HashMap<String, ProxyConfig>>,
    proxies: Vec<ProxyConfig>,
    mut st: RawStream,
) -> anyhow::Result<()> {
    let hdr = codec::read_stream_header(&mut st.io).await?;

    let target = resolve_target(&by_name, &proxies, &hdr);
    let Some(target) = target else {
        tracing::warn!(
            proxy = %hdr.name,
            remote_port = hdr.remote_port,
            "tunnel: no proxy configured for inbound stream"
        );
        let _ = st.io.shutdown().await;
        return Ok(());
    };

    tracing::debug!(
        proxy = %target.name,
        stream = hdr.stream_id,
        local_port = target.local_port,
        "tunnel: inbound stream"
    );

    match target.kind {
        ProxyKind::Tcp => {
            let local = TcpStream::connect(net::loopback_addr(target.local_port))
                .await
                .with_context(|| {
                    format!("tunnel: dial loopback service :{}", target.local_port)
                })?;
            match flow::splice(st.io, local).await {
                Ok((rx, tx)) => {
                    tracing::debug!(proxy = %target.name, stream = hdr.stream_id, rx, tx, "tunnel: stream closed");
                }
                Err(err) => {
                    tracing::debug!(proxy = %target.name, stream = hdr.stream_id, err = %err, "tunnel: stream failed");
                }
            }
        }
        ProxyKind::Udp => {
            pump_udp(st.io, target.local_port).await?;
        }
    }

    Ok(())
}

fn resolve_target<'a>(
    by_name: &'a HashMap<String, ProxyConfig>,
    proxies: &'a [ProxyConfig],
    hdr: &codec::StreamHeader,
) -> Option<&'a ProxyConfig> {
    if !hdr.name.is_empty() {
        if let Some(p) = by_name.get(&hdr.name) {
            return Some(p);
        }
    }
    if let Some(p) = proxies.iter().find(|p| p.remote_port == hdr.remote_port) {
        return Some(p);
    }
    // Last resort: a lone configured proxy serves everything.
    let first = proxies.first()?;
    tracing::warn!(
        proxy = %hdr.name,
        remote_port = hdr.remote_port,
        fallback = %first.name,
        "tunnel: falling back to first configured proxy"
    );
    Some(first)
}

/// Pumps framed datagrams between a tunnel stream and a loopback UDP
/// service. Two tasks, one per direction; the first to finish winds the
/// flow down.
async fn pump_udp(
    io: crate::tunnel::transport::BoxedStream,
    local_port: u16,
) -> anyhow::Result<()> {
    let sock = UdpSocket::bind("127.0.0.1:0").await?;
    sock.connect(net::loopback_addr(local_port)).await?;
    let sock = Arc::new(sock);

    let (mut rd, mut wr) = tokio::io::split(io);

    let to_local = sock.clone();
    let mut t1 = tokio::spawn(async move {
        let mut buf = Vec::new();
        loop {
            let n = match codec::read_datagram(&mut rd, &mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if to_local.send(&buf[..n]).await.is_err() {
                break;
            }
        }
    });

    let from_local = sock;
    let mut t2 = tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = match from_local.recv(&mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if n > codec::MAX_DATAGRAM_BYTES {
                continue;
            }
            if codec::write_datagram(&mut wr, &buf[..n]).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut t1 => t2.abort(),
        _ = &mut t2 => t1.abort(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(name: &str, kind: ProxyKind, local: u16, remote: u16) -> ProxyConfig {
        ProxyConfig {
            name: name.into(),
            kind,
            local_port: local,
            remote_port: remote,
        }
    }

    fn header(name: &str, remote_port: u16) -> codec::StreamHeader {
        codec::StreamHeader {
            stream_id: 1,
            remote_port,
            name: name.into(),
        }
    }

    #[test]
    fn resolves_by_name_first() {
        let proxies = vec![
            proxy("web", ProxyKind::Tcp, 3000, 8080),
            proxy("api", ProxyKind::Tcp, 3001, 8081),
        ];
        let by_name: HashMap<_, _> = proxies
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        // Name wins even when the port matches another proxy.
        let got = resolve_target(&by_name, &proxies, &header("api", 8080)).unwrap();
        assert_eq!(got.name, "api");
    }

    #[test]
    fn falls_back_to_remote_port_then_sole_proxy() {
        let proxies = vec![
            proxy("web", ProxyKind::Tcp, 3000, 8080),
            proxy("api", ProxyKind::Tcp, 3001, 8081),
        ];
        let by_name: HashMap<_, _> = proxies
            .iter()
            .map(|p| (p.name.clone(), p.clone()))
            .collect();

        let got = resolve_target(&by_name, &proxies, &header("stale", 8081)).unwrap();
        assert_eq!(got.name, "api");

        let got = resolve_target(&by_name, &proxies, &header("", 9999)).unwrap();
        assert_eq!(got.name, "web");

        assert!(resolve_target(&HashMap::new(), &[], &header("x", 1)).is_none());
    }

    #[test]
    fn rejects_empty_options() {
        assert!(Client::new(ClientOptions {
            server_addr: "".into(),
            token: "t".into(),
            tls: false,
            tls_opts: TlsDialOptions::default(),
            dial_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            proxies: vec![proxy("web", ProxyKind::Tcp, 1, 2)],
        })
        .is_err());

        assert!(Client::new(ClientOptions {
            server_addr: "localhost:9000".into(),
            token: "t".into(),
            tls: false,
            tls_opts: TlsDialOptions::default(),
            dial_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            proxies: vec![],
        })
        .is_err());
    }
}
