use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::task::JoinSet;

use crate::{config, logging, tunnel};
use crate::tunnel::registry::Registry;
use crate::tunnel::transport::{TlsDialOptions, TlsListenOptions};

pub async fn run(
    config_path: Option<PathBuf>,
    port_override: Option<u16>,
    server_override: Option<String>,
) -> anyhow::Result<()> {
    let located = config::locate_config(config_path)?;
    let seeded = config::seed_config_file(&located.path)?;

    let mut cfg = config::load_config(&located.path)
        .with_context(|| format!("load config: {}", located.path.display()))?;

    let _log_guard = logging::init(&cfg.logging)?;

    if seeded {
        tracing::warn!(path = %located.path.display(), origin = %located.origin, "config: wrote starter config");
    }

    if let Some(port) = port_override {
        if let Some(s) = cfg.server.as_mut() {
            s.bind_port = port;
        }
    }
    if let Some(addr) = server_override {
        if let Some(c) = cfg.client.as_mut() {
            c.server = addr;
        }
    }

    let server_enabled = cfg.server.is_some();
    let client_enabled = cfg.client.as_ref().is_some_and(|c| !c.proxies.is_empty());

    if !server_enabled && !client_enabled {
        anyhow::bail!("config: nothing to run (add a [server] section and/or a [client] section with proxies)");
    }

    tracing::info!(
        config = %located.path.display(),
        server_enabled,
        client_enabled,
        "gantry: starting"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = JoinSet::new();

    if let Some(sc) = cfg.server.take() {
        let registry = Arc::new(Registry::new(sc.port_range()));
        let server = tunnel::server::Server::new(
            tunnel::server::ServerOptions {
                listen_addr: sc.listen_addr(),
                enable_tls: sc.enable_tls,
                tls: TlsListenOptions {
                    cert_file: sc.tls_cert_file.clone(),
                    key_file: sc.tls_key_file.clone(),
                },
                auth_token: sc.auth_token.clone(),
                handshake_timeout: sc.handshake_timeout,
                heartbeat_timeout: sc.heartbeat_timeout,
                shutdown_grace: sc.shutdown_grace,
                udp_flow_idle_timeout: sc.udp_flow_idle_timeout,
            },
            registry,
        );
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    if let Some(cc) = cfg.client.take().filter(|c| !c.proxies.is_empty()) {
        let client = tunnel::client::Client::new(tunnel::client::ClientOptions {
            server_addr: cc.server.clone(),
            token: cc.token.clone(),
            tls: cc.tls,
            tls_opts: TlsDialOptions {
                server_name: cc.tls_server_name.clone(),
                insecure_skip_verify: cc.tls_insecure_skip_verify,
            },
            dial_timeout: cc.dial_timeout,
            heartbeat_interval: cc.heartbeat_interval,
            heartbeat_timeout: cc.heartbeat_timeout,
            proxies: cc.proxies,
        })?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.run(shutdown).await });
    }

    let mut signal_seen = false;
    loop {
        tokio::select! {
            _ = wait_for_signal(), if !signal_seen => {
                tracing::info!("shutdown signal received");
                signal_seen = true;
                let _ = shutdown_tx.send(true);
            }
            joined = tasks.join_next() => {
                match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        let _ = shutdown_tx.send(true);
                        tasks.abort_all();
                        while tasks.join_next().await.is_some() {}
                        return Err(err);
                    }
                    Some(Err(join_err)) if join_err.is_cancelled() => {}
                    Some(Err(join_err)) => {
                        let _ = shutdown_tx.send(true);
                        tasks.abort_all();
                        while tasks.join_next().await.is_some() {}
                        return Err(join_err).context("task panicked");
                    }
                }
            }
        }
    }

    tracing::info!("gantry: stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(err = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
