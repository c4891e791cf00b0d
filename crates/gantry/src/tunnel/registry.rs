use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use thiserror::Error;
use tokio::sync::{watch, Notify, RwLock};

use crate::tunnel::codec::ProxyKind;
use crate::tunnel::transport::TransportSession;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("public port {0} already in use")]
    PortInUse(u16),
    #[error("public port {port} outside allowed range {start}..={end}")]
    PortOutOfRange { port: u16, start: u16, end: u16 },
    #[error("proxy name {0:?} already registered by this client")]
    DuplicateName(String),
    #[error("unknown client {0}")]
    UnknownClient(u64),
}

/// Stop handle for a running public listener: a stop signal for the accept
/// loop plus the task itself. Closing drops the bound socket, releasing the
/// public port.
pub struct ListenerHandle {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl ListenerHandle {
    pub fn new(stop: watch::Sender<bool>, task: tokio::task::JoinHandle<()>) -> Self {
        Self { stop, task }
    }

    pub fn close(&self) {
        let _ = self.stop.send(true);
        self.task.abort();
    }
}

/// One registered proxy: a public port on the server mapped to a loopback
/// port on the owning client. Active iff a listener is attached.
pub struct ProxyRegistration {
    pub name: String,
    pub kind: ProxyKind,
    pub remote_port: u16,
    pub local_port: u16,
    listener: StdMutex<Option<ListenerHandle>>,
}

impl ProxyRegistration {
    fn new(name: &str, kind: ProxyKind, remote_port: u16, local_port: u16) -> Self {
        Self {
            name: name.to_string(),
            kind,
            remote_port,
            local_port,
            listener: StdMutex::new(None),
        }
    }

    pub fn attach_listener(&self, handle: ListenerHandle) {
        *self.listener.lock().unwrap() = Some(handle);
    }

    pub fn close_listener(&self) {
        if let Some(h) = self.listener.lock().unwrap().take() {
            h.close();
        }
    }

    pub fn is_active(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }
}

impl std::fmt::Debug for ProxyRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRegistration")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("remote_port", &self.remote_port)
            .field("local_port", &self.local_port)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Server-side record of one connected client session.
pub struct ClientRecord {
    pub id: u64,
    pub sess: Arc<dyn TransportSession>,
    pub remote: String,
    proxies: tokio::sync::Mutex<HashMap<String, Arc<ProxyRegistration>>>,
}

struct State {
    clients: HashMap<u64, Arc<ClientRecord>>,
    ports: HashMap<u16, Arc<ProxyRegistration>>,
}

/// Tracks in-flight public flows so shutdown can wait for them to drain.
pub struct FlowGauge {
    active: AtomicUsize,
    notify: Notify,
}

impl FlowGauge {
    fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn start(self: &Arc<Self>) -> FlowGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        FlowGuard(self.clone())
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Waits until no flows remain, bounded by `grace`. Returns whether the
    /// gauge drained in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.notify.notified();
            if self.active() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active() == 0;
            }
        }
    }
}

pub struct FlowGuard(Arc<FlowGauge>);

impl Drop for FlowGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }
}

/// The server's shared mutable state: connected clients and the global
/// `remote_port -> registration` index, both behind one registry lock. Each
/// client's own `name -> registration` map has its own lock so per-client
/// edits do not serialize against unrelated clients.
///
/// Locks are held only around in-memory mutation; listener binds happen in
/// the caller after `register_proxy` returns.
pub struct Registry {
    state: RwLock<State>,
    next_id: AtomicU64,
    port_range: Option<(u16, u16)>,
    flows: Arc<FlowGauge>,
}

impl Registry {
    pub fn new(port_range: Option<(u16, u16)>) -> Self {
        Self {
            state: RwLock::new(State {
                clients: HashMap::new(),
                ports: HashMap::new(),
            }),
            next_id: AtomicU64::new(1),
            port_range,
            flows: Arc::new(FlowGauge::new()),
        }
    }

    pub fn flows(&self) -> Arc<FlowGauge> {
        self.flows.clone()
    }

    pub async fn add_client(
        &self,
        sess: Arc<dyn TransportSession>,
    ) -> Arc<ClientRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let remote = sess.remote_addr().map(|a| a.to_string()).unwrap_or_default();
        let client = Arc::new(ClientRecord {
            id,
            sess,
            remote,
            proxies: tokio::sync::Mutex::new(HashMap::new()),
        });
        self.state.write().await.clients.insert(id, client.clone());
        client
    }

    /// Removes a client and everything it owns: every listener is closed and
    /// every port-index entry cleared. Idempotent.
    pub async fn remove_client(&self, id: u64) {
        let Some(client) = self.state.write().await.clients.remove(&id) else {
            return;
        };

        let regs: Vec<Arc<ProxyRegistration>> =
            client.proxies.lock().await.drain().map(|(_, r)| r).collect();

        for reg in &regs {
            reg.close_listener();
        }

        let mut st = self.state.write().await;
        for reg in &regs {
            st.ports.remove(&reg.remote_port);
        }
        drop(st);

        tracing::info!(cid = id, proxies = regs.len(), "tunnel: client removed");
    }

    /// Creates a registration and inserts it into both indexes. The caller
    /// binds the public listener afterwards, outside the registry lock, and
    /// either attaches it or reverts the registration.
    pub async fn register_proxy(
        &self,
        client: &Arc<ClientRecord>,
        name: &str,
        kind: ProxyKind,
        remote_port: u16,
        local_port: u16,
    ) -> Result<Arc<ProxyRegistration>, RegistryError> {
        if let Some((start, end)) = self.port_range {
            if remote_port < start || remote_port > end {
                return Err(RegistryError::PortOutOfRange {
                    port: remote_port,
                    start,
                    end,
                });
            }
        }

        {
            let proxies = client.proxies.lock().await;
            if proxies.contains_key(name) {
                return Err(RegistryError::DuplicateName(name.to_string()));
            }
        }

        let reg = Arc::new(ProxyRegistration::new(name, kind, remote_port, local_port));

        {
            let mut st = self.state.write().await;
            if !st.clients.contains_key(&client.id) {
                return Err(RegistryError::UnknownClient(client.id));
            }
            if st.ports.contains_key(&remote_port) {
                return Err(RegistryError::PortInUse(remote_port));
            }
            st.ports.insert(remote_port, reg.clone());
        }

        client.proxies.lock().await.insert(reg.name.clone(), reg.clone());
        Ok(reg)
    }

    /// Undoes `register_proxy` after a listener bind failure.
    pub async fn revert_proxy(&self, client: &Arc<ClientRecord>, reg: &Arc<ProxyRegistration>) {
        reg.close_listener();
        client.proxies.lock().await.remove(&reg.name);
        self.state.write().await.ports.remove(&reg.remote_port);
    }

    pub async fn port_registered(&self, remote_port: u16) -> bool {
        self.state.read().await.ports.contains_key(&remote_port)
    }

    pub async fn port_active(&self, remote_port: u16) -> bool {
        self.state
            .read()
            .await
            .ports
            .get(&remote_port)
            .is_some_and(|r| r.is_active())
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    /// Closes every public listener across all clients. Used at shutdown.
    pub async fn close_all_listeners(&self) {
        let st = self.state.read().await;
        for reg in st.ports.values() {
            reg.close_listener();
        }
    }

    /// Force-closes every client session. Called after the shutdown grace.
    pub async fn close_all_sessions(&self) {
        let sessions: Vec<Arc<dyn TransportSession>> = {
            let st = self.state.read().await;
            st.clients.values().map(|c| c.sess.clone()).collect()
        };
        for sess in sessions {
            sess.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::transport::RawStream;
    use std::net::SocketAddr;

    struct FakeSession;

    #[async_trait::async_trait]
    impl TransportSession for FakeSession {
        async fn open_stream(&self) -> anyhow::Result<RawStream> {
            anyhow::bail!("not implemented")
        }

        async fn accept_stream(&self) -> anyhow::Result<RawStream> {
            anyhow::bail!("not implemented")
        }

        async fn close(&self) {}

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn idle_listener_handle() -> ListenerHandle {
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {}
        });
        ListenerHandle::new(tx, task)
    }

    #[tokio::test]
    async fn register_enforces_port_uniqueness() {
        let registry = Registry::new(None);
        let c1 = registry.add_client(Arc::new(FakeSession)).await;
        let c2 = registry.add_client(Arc::new(FakeSession)).await;
        assert_ne!(c1.id, c2.id);

        registry
            .register_proxy(&c1, "web", ProxyKind::Tcp, 8080, 3000)
            .await
            .unwrap();
        let err = registry
            .register_proxy(&c2, "web", ProxyKind::Tcp, 8080, 4000)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::PortInUse(8080)));
    }

    #[tokio::test]
    async fn concurrent_registrations_one_wins() {
        let registry = Arc::new(Registry::new(None));
        let c1 = registry.add_client(Arc::new(FakeSession)).await;
        let c2 = registry.add_client(Arc::new(FakeSession)).await;

        let r1 = {
            let registry = registry.clone();
            let c1 = c1.clone();
            tokio::spawn(async move {
                registry
                    .register_proxy(&c1, "a", ProxyKind::Tcp, 9090, 1)
                    .await
            })
        };
        let r2 = {
            let registry = registry.clone();
            let c2 = c2.clone();
            tokio::spawn(async move {
                registry
                    .register_proxy(&c2, "b", ProxyKind::Tcp, 9090, 2)
                    .await
            })
        };

        let (r1, r2) = (r1.await.unwrap(), r2.await.unwrap());
        assert_eq!(r1.is_ok() as u8 + r2.is_ok() as u8, 1);
        assert!(registry.port_registered(9090).await);
    }

    #[tokio::test]
    async fn register_enforces_name_uniqueness_per_client() {
        let registry = Registry::new(None);
        let c1 = registry.add_client(Arc::new(FakeSession)).await;
        let c2 = registry.add_client(Arc::new(FakeSession)).await;

        registry
            .register_proxy(&c1, "web", ProxyKind::Tcp, 8080, 3000)
            .await
            .unwrap();
        let err = registry
            .register_proxy(&c1, "web", ProxyKind::Tcp, 8081, 3000)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateName(_)));

        // Same name on another client is fine.
        registry
            .register_proxy(&c2, "web", ProxyKind::Tcp, 8082, 3000)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn register_enforces_port_range() {
        let registry = Registry::new(Some((8000, 8999)));
        let c = registry.add_client(Arc::new(FakeSession)).await;

        let err = registry
            .register_proxy(&c, "low", ProxyKind::Tcp, 7999, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::PortOutOfRange { port: 7999, .. }));

        registry
            .register_proxy(&c, "ok", ProxyKind::Tcp, 8000, 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn remove_client_clears_ports_and_is_idempotent() {
        let registry = Registry::new(None);
        let c = registry.add_client(Arc::new(FakeSession)).await;

        let reg = registry
            .register_proxy(&c, "web", ProxyKind::Tcp, 8080, 3000)
            .await
            .unwrap();
        reg.attach_listener(idle_listener_handle());
        assert!(registry.port_active(8080).await);

        registry.remove_client(c.id).await;
        registry.remove_client(c.id).await;
        assert!(!registry.port_registered(8080).await);
        assert_eq!(registry.client_count().await, 0);
        assert!(!reg.is_active());

        // The port is registrable again.
        let c2 = registry.add_client(Arc::new(FakeSession)).await;
        registry
            .register_proxy(&c2, "web", ProxyKind::Tcp, 8080, 3000)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn revert_proxy_undoes_registration() {
        let registry = Registry::new(None);
        let c = registry.add_client(Arc::new(FakeSession)).await;

        let reg = registry
            .register_proxy(&c, "web", ProxyKind::Tcp, 8080, 3000)
            .await
            .unwrap();
        registry.revert_proxy(&c, &reg).await;
        assert!(!registry.port_registered(8080).await);

        registry
            .register_proxy(&c, "web", ProxyKind::Tcp, 8080, 3000)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn flow_gauge_drains() {
        let registry = Registry::new(None);
        let flows = registry.flows();

        let guard = flows.start();
        assert_eq!(flows.active(), 1);
        assert!(!flows.wait_idle(Duration::from_millis(20)).await);

        drop(guard);
        assert!(flows.wait_idle(Duration::from_millis(20)).await);
        assert_eq!(flows.active(), 0);
    }
}
