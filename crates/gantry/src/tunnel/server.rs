use std::{sync::Arc, time::Duration};

use anyhow::Context;
use tokio::time::timeout;

use crate::tunnel::codec::{self, ControlMsg, ProxyKind};
use crate::tunnel::listener;
use crate::tunnel::registry::{ClientRecord, Registry, RegistryError};
use crate::tunnel::transport::{
    transport_by_name, TlsListenOptions, TransportListenOptions, TransportSession,
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub listen_addr: String,
    pub enable_tls: bool,
    pub tls: TlsListenOptions,
    pub auth_token: String,
    pub handshake_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub shutdown_grace: Duration,
    pub udp_flow_idle_timeout: Duration,
}

pub struct Server {
    opts: ServerOptions,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(opts: ServerOptions, registry: Arc<Registry>) -> Self {
        Self { opts, registry }
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Accepts client sessions until the shutdown signal fires, then winds
    /// down: transport listener first, then every public listener, then a
    /// bounded wait for in-flight flows, then the sessions themselves.
    pub async fn listen_and_serve(
        &self,
        ctx: tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let tr = transport_by_name(if self.opts.enable_tls { "tls" } else { "tcp" })?;

        let ln = tr
            .listen(
                &self.opts.listen_addr,
                TransportListenOptions {
                    tls: self.opts.tls.clone(),
                },
            )
            .await
            .with_context(|| format!("tunnel: listen on {}", self.opts.listen_addr))?;

        tracing::info!(
            addr = %self.opts.listen_addr,
            transport = %tr.name(),
            "tunnel: listening for client sessions"
        );

        let mut shutdown = ctx.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                sess = ln.accept() => {
                    let sess = sess?;
                    let registry = self.registry.clone();
                    let opts = self.opts.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_session(registry, sess, opts).await {
                            tracing::warn!(err = %err, "tunnel: session ended with error");
                        }
                    });
                }
            }
        }

        tracing::info!("tunnel: shutting down");
        ln.close().await?;
        self.registry.close_all_listeners().await;
        if !self
            .registry
            .flows()
            .wait_idle(self.opts.shutdown_grace)
            .await
        {
            tracing::warn!(
                grace = %humantime::format_duration(self.opts.shutdown_grace),
                "tunnel: shutdown grace expired with flows still open"
            );
        }
        self.registry.close_all_sessions().await;
        tracing::info!("tunnel: stopped");
        Ok(())
    }
}

async fn handle_session(
    registry: Arc<Registry>,
    sess: Arc<dyn TransportSession>,
    opts: ServerOptions,
) -> anyhow::Result<()> {
    let client = registry.add_client(sess.clone()).await;
    let cid = client.id;

    let res = serve_session(&registry, &client, &opts).await;

    registry.remove_client(cid).await;
    sess.close().await;
    res
}

async fn serve_session(
    registry: &Arc<Registry>,
    client: &Arc<ClientRecord>,
    opts: &ServerOptions,
) -> anyhow::Result<()> {
    let sess = client.sess.clone();
    let cid = client.id;

    // The first stream of a session is the control stream.
    let ctrl = timeout(opts.handshake_timeout, sess.accept_stream())
        .await
        .context("tunnel: timed out waiting for control stream")??;
    let mut ctrl = ctrl.io;

    let hs = match timeout(opts.handshake_timeout, codec::read_handshake(&mut ctrl)).await {
        Err(_) => {
            tracing::warn!(cid, client = %client.remote, "tunnel: handshake timed out");
            return Ok(());
        }
        Ok(Err(err)) => {
            tracing::warn!(cid, client = %client.remote, err = %err, "tunnel: handshake rejected");
            return Ok(());
        }
        Ok(Ok(hs)) => hs,
    };

    // Token is the only supported method; mTLS is reserved. Authentication
    // failure closes the session without a response.
    match hs.auth_method {
        codec::AUTH_TOKEN => {
            if opts.auth_token.is_empty() {
                tracing::warn!(cid, "tunnel: no auth token configured, rejecting client");
                return Ok(());
            }
            if hs.auth_payload != opts.auth_token.as_bytes() {
                tracing::warn!(cid, client = %client.remote, "tunnel: authentication failed");
                return Ok(());
            }
        }
        method => {
            tracing::warn!(cid, method, "tunnel: unsupported auth method");
            return Ok(());
        }
    }

    tracing::info!(cid, client = %client.remote, "tunnel: client authenticated");

    // The client only ever opens the control stream; close anything else.
    let watchdog = tokio::spawn(listener::close_unexpected_streams(sess.clone()));

    loop {
        let record = match timeout(opts.heartbeat_timeout, codec::read_record(&mut ctrl)).await {
            Err(_) => {
                tracing::warn!(
                    cid,
                    grace = %humantime::format_duration(opts.heartbeat_timeout),
                    "tunnel: heartbeat grace expired"
                );
                break;
            }
            Ok(Err(codec::CodecError::Io(err)))
                if err.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                tracing::info!(cid, "tunnel: control stream closed");
                break;
            }
            Ok(Err(err)) => {
                tracing::info!(cid, err = %err, "tunnel: control stream failed");
                break;
            }
            Ok(Ok(record)) => record,
        };

        // Malformed records are skipped; the session survives.
        match codec::parse_control(&record) {
            Ok(ControlMsg::Register {
                kind,
                remote_port,
                local_port,
                name,
            }) => {
                handle_register(registry, client, opts, kind, remote_port, local_port, &name)
                    .await;
            }
            Ok(ControlMsg::Heartbeat) => {
                if let Err(err) = codec::write_heartbeat(&mut ctrl).await {
                    tracing::info!(cid, err = %err, "tunnel: heartbeat echo failed");
                    break;
                }
            }
            Ok(ControlMsg::Other(t)) => {
                tracing::debug!(cid, msg_type = t, "tunnel: skipping unhandled control message");
            }
            Err(err) => {
                tracing::warn!(cid, err = %err, "tunnel: skipping malformed control message");
            }
        }
    }

    watchdog.abort();
    Ok(())
}

/// Registers a proxy and starts its public listener. The registry lock is
/// released before the bind; a failed bind reverts the registration. All
/// failures reject only this registration, never the session.
async fn handle_register(
    registry: &Arc<Registry>,
    client: &Arc<ClientRecord>,
    opts: &ServerOptions,
    kind: ProxyKind,
    remote_port: u16,
    local_port: u16,
    name: &str,
) {
    let cid = client.id;

    let reg = match registry
        .register_proxy(client, name, kind, remote_port, local_port)
        .await
    {
        Ok(reg) => reg,
        Err(err @ (RegistryError::PortInUse(_)
        | RegistryError::PortOutOfRange { .. }
        | RegistryError::DuplicateName(_))) => {
            tracing::warn!(cid, proxy = name, err = %err, "tunnel: registration rejected");
            return;
        }
        Err(err) => {
            tracing::warn!(cid, proxy = name, err = %err, "tunnel: registration failed");
            return;
        }
    };

    let started = match kind {
        ProxyKind::Tcp => {
            listener::start_tcp_listener(reg.clone(), client.sess.clone(), registry.flows()).await
        }
        ProxyKind::Udp => {
            listener::start_udp_listener(
                reg.clone(),
                client.sess.clone(),
                registry.flows(),
                opts.udp_flow_idle_timeout,
            )
            .await
        }
    };

    match started {
        Ok(handle) => {
            reg.attach_listener(handle);
            tracing::info!(
                cid,
                proxy = name,
                kind = %kind,
                remote_port,
                local_port,
                "tunnel: proxy registered"
            );
        }
        Err(err) => {
            registry.revert_proxy(client, &reg).await;
            tracing::warn!(cid, proxy = name, err = %err, "tunnel: public listener bind failed");
        }
    }
}
