//! TCP accept loop, route table and connection registry.

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    close::CloseCode,
    connection::{Connection, Handler, WeakConnection},
    options::ServerConfig,
    protocol::Message,
    Result,
};

/// Maps request paths to handlers.
///
/// Paths are matched exactly against the request target with its query string removed. Requests
/// that match no route go to the fallback handler, or are closed with 1003 when there is none.
#[derive(Clone, Default)]
pub struct Routes {
    routes: HashMap<String, Arc<dyn Handler>>,
    fallback: Option<Arc<dyn Handler>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `path`, replacing any previous handler for it.
    pub fn route(mut self, path: impl Into<String>, handler: impl Handler) -> Self {
        self.routes.insert(path.into(), Arc::new(handler));
        self
    }

    /// Handler for every path without a route of its own.
    pub fn fallback(mut self, handler: impl Handler) -> Self {
        self.fallback = Some(Arc::new(handler));
        self
    }

    pub fn resolve(&self, path: &str) -> Option<Arc<dyn Handler>> {
        self.routes
            .get(path)
            .or(self.fallback.as_ref())
            .map(Arc::clone)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }
}

impl fmt::Debug for Routes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut paths: Vec<_> = self.paths().collect();
        paths.sort_unstable();
        f.debug_struct("Routes")
            .field("paths", &paths)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

struct Shared {
    config: ServerConfig,
    local_addr: SocketAddr,
    /// Every connection whose task is still running, closed or not.
    registry: Mutex<HashMap<u64, WeakConnection>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Shared {
    /// Adds `connection` to the registry unless the server is full.
    fn register(&self, connection: &Connection) -> bool {
        let mut registry = self.registry.lock();
        registry.retain(|_, weak| weak.upgrade().is_some());
        let open = registry
            .values()
            .filter_map(WeakConnection::upgrade)
            .filter(|conn| !conn.is_closed())
            .count();
        if open >= self.config.max_connections {
            return false;
        }
        registry.insert(connection.id(), connection.downgrade());
        true
    }

    fn unregister(&self, id: u64) {
        self.registry.lock().remove(&id);
    }

    fn tracked(&self) -> Vec<Connection> {
        self.registry
            .lock()
            .values()
            .filter_map(WeakConnection::upgrade)
            .collect()
    }

    fn connections(&self) -> Vec<Connection> {
        let mut connections = self.tracked();
        connections.retain(|conn| !conn.is_closed());
        connections
    }
}

/// A bound WebSocket server.
///
/// Created with [`Server::bind`], given routes, then driven by [`Server::run`]. A
/// [`ServerHandle`] taken before `run` controls the server from other tasks.
///
/// # Example
/// ```no_run
/// use haru_ws::{Connection, Server, ServerConfig};
///
/// # async fn example() -> haru_ws::Result<()> {
/// let server = Server::bind("127.0.0.1:0", ServerConfig::default())
///     .await?
///     .route("/echo", |ws: Connection| async move {
///         while let Ok(message) = ws.recv(None).await {
///             ws.send(message).await?;
///         }
///         Ok(())
///     });
///
/// let handle = server.handle();
/// tokio::spawn(server.run());
/// // ...
/// handle.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct Server {
    listener: TcpListener,
    routes: Routes,
    shared: Arc<Shared>,
}

impl Server {
    /// Binds the listening socket.
    pub async fn bind(addr: impl ToSocketAddrs, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            routes: Routes::default(),
            shared: Arc::new(Shared {
                config,
                local_addr,
                registry: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        })
    }

    pub fn route(self, path: impl Into<String>, handler: impl Handler) -> Self {
        Self {
            routes: self.routes.route(path, handler),
            ..self
        }
    }

    pub fn fallback(self, handler: impl Handler) -> Self {
        Self {
            routes: self.routes.fallback(handler),
            ..self
        }
    }

    /// Replaces the whole route table.
    pub fn routes(self, routes: Routes) -> Self {
        Self { routes, ..self }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accepts connections until [`ServerHandle::shutdown`] is called, then releases the
    /// listener.
    pub async fn run(self) -> Result<()> {
        let Self {
            listener,
            routes,
            shared,
        } = self;
        let routes = Arc::new(routes);
        log::info!("listening on ws://{} ({routes:?})", shared.local_addr);

        loop {
            let accepted = tokio::select! {
                _ = shared.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    // usually out of file descriptors; give in-flight connections time to finish
                    log::error!("accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if shared.config.options.no_delay {
                if let Err(err) = stream.set_nodelay(true) {
                    log::debug!("set_nodelay for {peer_addr} failed: {err}");
                }
            }

            shared.tracker.spawn(handle_connection(
                Arc::clone(&shared),
                Arc::clone(&routes),
                stream,
                peer_addr,
            ));
        }

        drop(listener);
        log::info!("server on ws://{} stopped accepting", shared.local_addr);
        Ok(())
    }
}

async fn handle_connection(
    shared: Arc<Shared>,
    routes: Arc<Routes>,
    stream: TcpStream,
    peer_addr: SocketAddr,
) {
    let options = shared.config.options.clone();
    let upgraded = tokio::select! {
        _ = shared.cancel.cancelled() => return,
        upgraded = Connection::upgrade(stream, Some(peer_addr), options) => upgraded,
    };
    let Ok(connection) = upgraded else {
        return;
    };

    if shared.cancel.is_cancelled() {
        let _ = connection
            .close(CloseCode::GoingAway, "Server shutting down")
            .await;
        return;
    }

    if !shared.register(&connection) {
        log::warn!(
            "rejecting {peer_addr}: {} connections open",
            shared.config.max_connections
        );
        let _ = connection
            .close(CloseCode::TryAgainLater, "Server is at capacity")
            .await;
        return;
    }

    let path = connection
        .request()
        .map(|request| request.path().to_string())
        .unwrap_or_default();
    log::info!("{peer_addr} connected to {path}");

    match routes.resolve(&path) {
        Some(handler) => connection.run(handler).await,
        None => {
            log::warn!("no route for {path} from {peer_addr}");
            let _ = connection.close(CloseCode::Unsupported, "Unknown path").await;
        }
    }

    shared.unregister(connection.id());
    log::info!(
        "{peer_addr} disconnected ({})",
        connection.close_code().unwrap_or(CloseCode::Abnormal)
    );
}

/// Controls a running [`Server`] from other tasks. Cheap to clone.
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections().len()
    }

    /// Snapshot of the open connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.shared.connections()
    }

    /// Sends `message` to every open connection and returns how many sends succeeded.
    ///
    /// Failures are logged and do not affect the other connections.
    pub async fn broadcast(&self, message: impl Into<Message>) -> usize {
        let message = message.into();
        let connections = self.shared.connections();

        let results = join_all(connections.iter().map(|conn| {
            let message = message.clone();
            async move { (conn, conn.send(message).await) }
        }))
        .await;

        results
            .into_iter()
            .filter(|(conn, result)| match result {
                Ok(()) => true,
                Err(err) => {
                    log::error!("broadcast to {conn:?} failed: {err}");
                    false
                }
            })
            .count()
    }

    /// Stops the server.
    ///
    /// The accept loop stops and releases the listener and every open connection is closed with
    /// 1001, each close bounded by its `close_timeout`. Connection tasks then get
    /// `shutdown_timeout` to finish. Handlers still running after that are aborted, whether or not
    /// their connection is already closed.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.cancel.is_cancelled() {
            return;
        }
        log::info!("shutting down server on ws://{}", shared.local_addr);
        shared.cancel.cancel();

        let connections = shared.connections();
        join_all(connections.iter().map(|conn| async move {
            if let Err(err) = conn.close(CloseCode::GoingAway, "Server shutting down").await {
                log::debug!("closing {conn:?} failed: {err}");
            }
        }))
        .await;

        shared.tracker.close();
        if tokio::time::timeout(shared.config.shutdown_timeout, shared.tracker.wait())
            .await
            .is_err()
        {
            let leftover = shared.tracked();
            log::warn!(
                "{} connections still running after {:?}, aborting",
                leftover.len(),
                shared.config.shutdown_timeout
            );
            for conn in &leftover {
                conn.abort().await;
            }
            shared.tracker.wait().await;
        }
        log::info!("server on ws://{} shut down", shared.local_addr);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

/// Binds `addr` with the default [`ServerConfig`], sends every path to `handler` and runs the
/// accept loop on a background task.
pub async fn serve(addr: impl ToSocketAddrs, handler: impl Handler) -> Result<ServerHandle> {
    let server = Server::bind(addr, ServerConfig::default())
        .await?
        .fallback(handler);
    let handle = server.handle();

    tokio::spawn(async move {
        if let Err(err) = server.run().await {
            log::error!("server stopped: {err}");
        }
    });
    Ok(handle)
}
