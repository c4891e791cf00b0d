use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::Context;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{watch, Mutex},
};

use crate::net;
use crate::tunnel::codec;
use crate::tunnel::flow;
use crate::tunnel::registry::{FlowGauge, ListenerHandle, ProxyRegistration};
use crate::tunnel::transport::{BoxedStream, TransportSession};

/// Binds the public TCP port for a registration and starts its accept loop.
/// Every accepted external connection gets a fresh stream to the owning
/// client, headed by one `NewStream` record.
pub async fn start_tcp_listener(
    reg: Arc<ProxyRegistration>,
    sess: Arc<dyn TransportSession>,
    flows: Arc<FlowGauge>,
) -> anyhow::Result<ListenerHandle> {
    let ln = TcpListener::bind(net::public_bind_addr(reg.remote_port))
        .await
        .with_context(|| format!("tunnel: bind public tcp port {}", reg.remote_port))?;

    tracing::info!(proxy = %reg.name, port = reg.remote_port, "tunnel: tcp proxy listening");

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(tcp_accept_loop(ln, reg, sess, flows, stop_rx));
    Ok(ListenerHandle::new(stop_tx, task))
}

async fn tcp_accept_loop(
    ln: TcpListener,
    reg: Arc<ProxyRegistration>,
    sess: Arc<dyn TransportSession>,
    flows: Arc<FlowGauge>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (c, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        // Accept errors after close are normal termination.
                        tracing::debug!(proxy = %reg.name, err = %err, "tunnel: tcp listener closed");
                        break;
                    }
                };

                let reg = reg.clone();
                let sess = sess.clone();
                let guard = flows.start();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(err) = forward_tcp_conn(&reg, sess, c, peer).await {
                        tracing::debug!(proxy = %reg.name, peer = %peer, err = %err, "tunnel: tcp flow dropped");
                    }
                });
            }
        }
    }
}

async fn forward_tcp_conn(
    reg: &ProxyRegistration,
    sess: Arc<dyn TransportSession>,
    external: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let mut st = sess
        .open_stream()
        .await
        .context("tunnel: open stream to client")?;

    codec::write_stream_header(&mut st.io, st.id, reg.remote_port, &reg.name)
        .await
        .context("tunnel: write stream header")?;

    tracing::debug!(
        proxy = %reg.name,
        peer = %peer,
        stream = st.id,
        "tunnel: tcp flow opened"
    );

    match flow::splice(external, st.io).await {
        Ok((from_external, from_client)) => {
            tracing::debug!(
                proxy = %reg.name,
                peer = %peer,
                rx = from_external,
                tx = from_client,
                "tunnel: tcp flow closed"
            );
        }
        Err(err) => {
            tracing::debug!(proxy = %reg.name, peer = %peer, err = %err, "tunnel: tcp flow failed");
        }
    }
    Ok(())
}

/// Binds the public UDP socket for a registration and starts its read loop.
///
/// Flows are keyed by the datagram's source address: the first datagram from
/// a peer opens a stream (header + framed datagram), later datagrams reuse
/// it, and a per-flow task pumps framed records from the client back out to
/// that peer. Idle flows are swept out periodically.
pub async fn start_udp_listener(
    reg: Arc<ProxyRegistration>,
    sess: Arc<dyn TransportSession>,
    flows: Arc<FlowGauge>,
    idle_timeout: Duration,
) -> anyhow::Result<ListenerHandle> {
    let sock = UdpSocket::bind(net::public_bind_addr(reg.remote_port))
        .await
        .with_context(|| format!("tunnel: bind public udp port {}", reg.remote_port))?;

    tracing::info!(proxy = %reg.name, port = reg.remote_port, "tunnel: udp proxy listening");

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(udp_read_loop(
        Arc::new(sock),
        reg,
        sess,
        flows,
        idle_timeout,
        stop_rx,
    ));
    Ok(ListenerHandle::new(stop_tx, task))
}

struct UdpFlow {
    wr: Mutex<tokio::io::WriteHalf<BoxedStream>>,
    task: tokio::task::JoinHandle<()>,
    last: Instant,
    _guard: crate::tunnel::registry::FlowGuard,
}

async fn udp_read_loop(
    sock: Arc<UdpSocket>,
    reg: Arc<ProxyRegistration>,
    sess: Arc<dyn TransportSession>,
    flows: Arc<FlowGauge>,
    idle_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut peers: HashMap<SocketAddr, UdpFlow> = HashMap::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut tick = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {
                if idle_timeout > Duration::ZERO {
                    let now = Instant::now();
                    let dead: Vec<SocketAddr> = peers
                        .iter()
                        .filter_map(|(k, v)| (now.duration_since(v.last) > idle_timeout).then_some(*k))
                        .collect();
                    for k in dead {
                        if let Some(f) = peers.remove(&k) {
                            f.task.abort();
                            tracing::debug!(proxy = %reg.name, peer = %k, "tunnel: udp flow idled out");
                        }
                    }
                }
            }
            res = sock.recv_from(&mut buf) => {
                let (n, peer) = match res {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::debug!(proxy = %reg.name, err = %err, "tunnel: udp listener closed");
                        break;
                    }
                };

                if n > codec::MAX_DATAGRAM_BYTES {
                    continue;
                }

                if !peers.contains_key(&peer) {
                    match open_udp_flow(&reg, &sess, &sock, &flows, peer).await {
                        Ok(f) => {
                            peers.insert(peer, f);
                            tracing::debug!(proxy = %reg.name, peer = %peer, "tunnel: udp flow opened");
                        }
                        Err(err) => {
                            // Datagram dropped; the external sender sees nothing.
                            tracing::warn!(proxy = %reg.name, peer = %peer, err = %err, "tunnel: udp flow open failed");
                            continue;
                        }
                    }
                }

                let mut write_failed = false;
                if let Some(f) = peers.get_mut(&peer) {
                    f.last = Instant::now();
                    let mut wr = f.wr.lock().await;
                    if let Err(err) = codec::write_datagram(&mut *wr, &buf[..n]).await {
                        tracing::debug!(proxy = %reg.name, peer = %peer, err = %err, "tunnel: udp flow write failed");
                        write_failed = true;
                    }
                }
                // A broken flow is dropped; the next datagram re-opens it.
                if write_failed {
                    if let Some(f) = peers.remove(&peer) {
                        f.task.abort();
                    }
                }
            }
        }
    }

    for (_k, f) in peers.drain() {
        f.task.abort();
    }
}

async fn open_udp_flow(
    reg: &Arc<ProxyRegistration>,
    sess: &Arc<dyn TransportSession>,
    sock: &Arc<UdpSocket>,
    flows: &Arc<FlowGauge>,
    peer: SocketAddr,
) -> anyhow::Result<UdpFlow> {
    let mut st = sess
        .open_stream()
        .await
        .context("tunnel: open stream to client")?;

    codec::write_stream_header(&mut st.io, st.id, reg.remote_port, &reg.name)
        .await
        .context("tunnel: write stream header")?;

    let (mut rd, wr) = tokio::io::split(st.io);

    let sock = sock.clone();
    let name = reg.name.clone();
    let task = tokio::spawn(async move {
        let mut dbuf = Vec::new();
        loop {
            match codec::read_datagram(&mut rd, &mut dbuf).await {
                Ok(n) => {
                    if sock.send_to(&dbuf[..n], peer).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(proxy = %name, peer = %peer, err = %err, "tunnel: udp flow ended");
                    break;
                }
            }
        }
    });

    Ok(UdpFlow {
        wr: Mutex::new(wr),
        task,
        last: Instant::now(),
        _guard: flows.start(),
    })
}

/// Closes client-opened streams the server does not expect. The only
/// client-initiated stream is the control stream; anything else is closed
/// quietly. Returns when the session dies.
pub async fn close_unexpected_streams(sess: Arc<dyn TransportSession>) {
    loop {
        match sess.accept_stream().await {
            Ok(mut st) => {
                let _ = tokio::time::timeout(Duration::from_secs(1), st.io.shutdown()).await;
            }
            Err(_) => break,
        }
    }
}
