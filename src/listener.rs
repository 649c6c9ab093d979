use crate::config::ParloConfig;
use crate::error::Result;
use crate::network_client::{ClientHandler, NetworkClient};
use crate::socket::TcpStreamSocket;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Thread-safe bookkeeping of the connections a listener currently owns,
/// keyed by connection identity.
#[derive(Default)]
pub struct ClientRegistry {
    clients: RwLock<FxHashMap<Uuid, Arc<NetworkClient>>>,
}

impl ClientRegistry {
    pub fn add(&self, client: Arc<NetworkClient>) {
        self.lock_write().insert(client.id(), client);
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<NetworkClient>> {
        self.lock_write().remove(&id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.lock_read().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock_read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_read().is_empty()
    }

    /// A point-in-time copy of the live clients, e.g. for broadcasting.
    pub fn snapshot(&self) -> Vec<Arc<NetworkClient>> {
        self.lock_read().values().cloned().collect()
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, FxHashMap<Uuid, Arc<NetworkClient>>> {
        self.clients.read().expect("client registry lock poisoned")
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, FxHashMap<Uuid, Arc<NetworkClient>>> {
        self.clients.write().expect("client registry lock poisoned")
    }
}

/// Accepts inbound connections and turns each into a [`NetworkClient`].
///
/// The listener owns the strong handles to its clients (via the registry);
/// each client keeps only a weak back-reference, so tearing the listener
/// down releases every connection.
pub struct Listener {
    acceptor: TokioTcpListener,
    config: Arc<ParloConfig>,
    clients: ClientRegistry,
    running: AtomicBool,
    apply_compression: AtomicBool,
    on_client_connected: RwLock<Option<ClientHandler>>,
    stop_accept: Notify,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Listener {
    /// Binds the accept socket. The accept loop starts separately via
    /// [`start_accepting`](Listener::start_accepting).
    pub async fn bind(endpoint: SocketAddr, config: Arc<ParloConfig>) -> Result<Arc<Listener>> {
        config.validate()?;

        let acceptor = TokioTcpListener::bind(endpoint).await?;
        info!("listening on {}", acceptor.local_addr()?);

        Ok(Arc::new(Listener {
            acceptor,
            config,
            clients: ClientRegistry::default(),
            running: AtomicBool::new(false),
            apply_compression: AtomicBool::new(false),
            on_client_connected: RwLock::new(None),
            stop_accept: Notify::new(),
            accept_task: Mutex::new(None),
        }))
    }

    /// The actual bound address - useful when binding to port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.acceptor.local_addr()?)
    }

    pub fn start_accepting(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            warn!("accept loop is already running");
            return;
        }

        let task = tokio::spawn(Self::accept_loop(Arc::downgrade(self)));
        *self.accept_task.lock().expect("accept task lock poisoned") = Some(task);
    }

    /// Stops and joins the accept loop. Existing connections stay up.
    pub async fn stop_accepting(&self) {
        self.running.store(false, Ordering::Release);
        self.stop_accept.notify_waiters();

        let handle = self.accept_task.lock().expect("accept task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Whether newly accepted clients get payload compression enabled.
    pub fn set_apply_compression(&self, apply: bool) {
        self.apply_compression.store(apply, Ordering::Release);
    }

    pub fn set_on_client_connected(&self, handler: ClientHandler) {
        *self.on_client_connected.write().expect("handler lock poisoned") = Some(handler);
    }

    async fn accept_loop(weak: Weak<Listener>) {
        loop {
            let Some(listener) = weak.upgrade() else { break };
            if !listener.running.load(Ordering::Acquire) {
                break;
            }

            let stopped = listener.stop_accept.notified();
            tokio::select! {
                _ = stopped => break,
                result = listener.acceptor.accept() => {
                    match result {
                        Ok((stream, peer)) => listener.handle_accepted(stream, peer),
                        Err(e) => error!("error accepting connection: {}", e),
                    }
                }
            }
        }
        debug!("accept loop ended");
    }

    fn handle_accepted(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        info!("new client connected from {}", peer);

        if let Err(e) = stream.set_linger(Some(self.config.accept_linger)) {
            warn!("could not set linger on accepted socket: {}", e);
        }
        let socket = Arc::new(TcpStreamSocket::new(stream));

        let client = NetworkClient::new(self.config.clone());
        client.set_owner(Arc::downgrade(self));
        client.set_on_client_disconnected(Arc::new(|client| {
            Self::forget_client(client, "client disconnected");
        }));
        client.set_on_connection_lost(Arc::new(|client| {
            Self::forget_client(client, "client connection lost");
        }));
        if self.apply_compression.load(Ordering::Acquire) {
            client.set_apply_compression(true);
        }

        // register before any byte is processed, so a goodbye racing in
        // cannot try to remove an unregistered client
        self.clients.add(client.clone());
        client.attach_and_start(socket);

        let handler = self.on_client_connected.read().expect("handler lock poisoned").clone();
        if let Some(handler) = handler {
            handler(&client);
        }
    }

    fn forget_client(client: &Arc<NetworkClient>, why: &str) {
        info!(client = %client.id(), "{}", why);
        if let Some(listener) = client.owner().upgrade() {
            listener.clients.remove(client.id());
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(handle) = self.accept_task.get_mut().expect("accept task lock poisoned").take() {
            handle.abort();
        }
    }
}
