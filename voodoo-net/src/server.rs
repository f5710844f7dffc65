//! Server: acceptor task, per-connection reader/writer tasks, single dispatch loop.
//!
//! Readers push whole request frames into one channel; `run` drains it and
//! serves requests one at a time, so each connection is answered in the order it
//! wrote. A reader holds back its next frame until the previous one has been
//! served, so every connection has at most one request queued and a busy
//! connection cannot get ahead of the others. Handlers execute with no server
//! lock held.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use voodoo_core::wire::encode_frame;
use voodoo_core::{Host, Reply, Request};

use crate::context::{CallContext, CleanupTable, ConnectionId};
use crate::transport::{read_frame, write_raw, TransportError};

/// Lifecycle. Dropping a server that is `Listening` or `Running` is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Listening,
    Running,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server already listening")]
    AlreadyListening,
    #[error("server is not listening")]
    NotListening,
    #[error("server already running")]
    AlreadyRunning,
    #[error("server not stopped")]
    NotStopped,
    #[error("could not listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },
}

struct Connection {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

type Connections = Arc<Mutex<HashMap<ConnectionId, Connection>>>;

enum Event {
    Request {
        conn: ConnectionId,
        payload: Vec<u8>,
        served: oneshot::Sender<()>,
    },
    Closed {
        conn: ConnectionId,
        reason: Option<TransportError>,
    },
}

fn lock<T>(m: &StdMutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Server {
    host: Arc<Host<CallContext>>,
    cleanups: Arc<CleanupTable>,
    connections: Connections,
    next_conn: Arc<AtomicU64>,
    // Holds at most one request per connection plus its close events.
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<Event>>>,
    shutdown: watch::Sender<bool>,
    state: StdMutex<ServerState>,
    acceptor: StdMutex<Option<JoinHandle<()>>>,
    local_addr: StdMutex<Option<SocketAddr>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Self {
            host: Arc::new(Host::new()),
            cleanups: Arc::new(CleanupTable::default()),
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_conn: Arc::new(AtomicU64::new(0)),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            shutdown,
            state: StdMutex::new(ServerState::Created),
            acceptor: StdMutex::new(None),
            local_addr: StdMutex::new(None),
        }
    }

    /// Method and interface registries served by this server.
    pub fn host(&self) -> &Arc<Host<CallContext>> {
        &self.host
    }

    pub fn state(&self) -> ServerState {
        *lock(&self.state)
    }

    /// Address actually bound, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Listen on all interfaces.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr, ServerError> {
        self.listen_on(SocketAddr::from(([0, 0, 0, 0], port))).await
    }

    /// Bind `addr` and start accepting connections in the background.
    pub async fn listen_on(&self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        {
            let mut state = lock(&self.state);
            if *state != ServerState::Created {
                return Err(ServerError::AlreadyListening);
            }
            *state = ServerState::Listening;
        }
        let bound = match TcpListener::bind(addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        let (listener, local) = match bound {
            Ok(b) => b,
            Err(source) => {
                *lock(&self.state) = ServerState::Created;
                return Err(ServerError::Bind { addr, source });
            }
        };
        *lock(&self.local_addr) = Some(local);
        tracing::info!(addr = %local, "listening");

        let acceptor = tokio::spawn(accept_loop(
            listener,
            self.shutdown.subscribe(),
            self.connections.clone(),
            self.next_conn.clone(),
            self.events_tx.clone(),
        ));
        *lock(&self.acceptor) = Some(acceptor);
        Ok(local)
    }

    /// Dispatch loop. Returns once `stop` is called; remaining connections are
    /// closed and their cleanup chains run before it does.
    pub async fn run(&self) -> Result<(), ServerError> {
        {
            let mut state = lock(&self.state);
            match *state {
                ServerState::Listening => *state = ServerState::Running,
                ServerState::Running => return Err(ServerError::AlreadyRunning),
                ServerState::Created | ServerState::Stopped => {
                    return Err(ServerError::NotListening)
                }
            }
        }
        let Some(mut events) = lock(&self.events_rx).take() else {
            return Err(ServerError::AlreadyRunning);
        };
        let mut shutdown = self.shutdown.subscribe();

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(Event::Request { conn, payload, served }) => {
                        self.serve(conn, &payload).await;
                        let _ = served.send(());
                    }
                    Some(Event::Closed { conn, reason }) => self.disconnect(conn, reason).await,
                    None => break,
                },
            }
        }

        let remaining: Vec<ConnectionId> = self.connections.lock().await.keys().copied().collect();
        for conn in remaining {
            self.disconnect(conn, None).await;
        }
        tracing::info!("dispatch loop stopped");
        Ok(())
    }

    /// Ask the acceptor and the dispatch loop to finish.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        tracing::info!("stop requested");
    }

    /// Wait for the acceptor to exit. Must follow `stop`.
    pub async fn join(&self) -> Result<(), ServerError> {
        if !*self.shutdown.borrow() {
            return Err(ServerError::NotStopped);
        }
        let acceptor = lock(&self.acceptor).take();
        if let Some(handle) = acceptor {
            if let Err(e) = handle.await {
                tracing::warn!("acceptor task failed: {e}");
            }
        }
        *lock(&self.state) = ServerState::Stopped;
        Ok(())
    }

    async fn serve(&self, conn: ConnectionId, payload: &[u8]) {
        let request = match Request::decode(payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(%conn, "undecodable request: {e}");
                self.disconnect(conn, None).await;
                return;
            }
        };
        let (peer, outbound) = {
            let connections = self.connections.lock().await;
            match connections.get(&conn) {
                Some(c) => (c.peer, c.outbound.clone()),
                None => return,
            }
        };

        let ctx = CallContext::new(conn, peer, self.cleanups.clone());
        tracing::debug!(%conn, method = %request.method, args = request.args.len(), "dispatch");
        let reply = match self.host.handle(&ctx, request.method, &request.args) {
            Ok(values) => Reply::Ok(values),
            Err(e) => {
                tracing::warn!(%conn, method = %request.method, "call failed: {e}");
                Reply::fault(e)
            }
        };
        drop(ctx);

        let frame = match reply
            .encode()
            .map_err(|e| e.to_string())
            .and_then(|p| encode_frame(&p).map_err(|e| e.to_string()))
        {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(%conn, method = %request.method, "reply not encodable: {e}");
                let fault = Reply::fault(format!("reply not encodable: {e}"))
                    .encode()
                    .ok()
                    .and_then(|p| encode_frame(&p).ok());
                match fault {
                    Some(frame) => frame,
                    None => {
                        self.disconnect(conn, None).await;
                        return;
                    }
                }
            }
        };
        // A closed writer shows up as a Closed event; nothing to do here.
        let _ = outbound.send(frame);
    }

    /// Forget the connection and run its cleanup chain, newest entry first.
    async fn disconnect(&self, conn: ConnectionId, reason: Option<TransportError>) {
        let removed = self.connections.lock().await.remove(&conn);
        if let Some(c) = removed {
            c.reader.abort();
            match &reason {
                Some(e) if !e.is_eof() => {
                    tracing::warn!(%conn, peer = %c.peer, "connection lost: {e}")
                }
                _ => tracing::info!(%conn, peer = %c.peer, "connection closed"),
            }
        }
        for (id, action) in self.cleanups.drain(conn) {
            tracing::debug!(%conn, cleanup = %id, "running cleanup");
            action();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let state = *lock(&self.state);
        if matches!(state, ServerState::Listening | ServerState::Running)
            && !std::thread::panicking()
        {
            panic!("server dropped while {state:?}: call stop() and join() first");
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    connections: Connections,
    next_conn: Arc<AtomicU64>,
    events: mpsc::UnboundedSender<Event>,
) {
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = ConnectionId::new(next_conn.fetch_add(1, Ordering::SeqCst) + 1);
                    add_connection(stream, peer, conn, &connections, &events).await;
                }
                Err(e) => tracing::warn!("accept failed: {e}"),
            },
        }
    }
    tracing::info!("acceptor stopped");
}

async fn add_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn: ConnectionId,
    connections: &Connections,
    events: &mpsc::UnboundedSender<Event>,
) {
    let _ = stream.set_nodelay(true);
    let (reader, writer) = stream.into_split();
    let (outbound, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(writer, rx, conn, events.clone()));

    // Registered before the reader can produce a request for it.
    let mut connections = connections.lock().await;
    let reader = tokio::spawn(read_loop(reader, conn, events.clone()));
    connections.insert(
        conn,
        Connection {
            peer,
            outbound,
            reader,
        },
    );
    tracing::info!(%conn, %peer, "accepted connection");
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    conn: ConnectionId,
    events: mpsc::UnboundedSender<Event>,
) {
    let reason = loop {
        let payload = match read_frame(&mut reader).await {
            Ok(payload) => payload,
            Err(e) => break e,
        };
        let (served, done) = oneshot::channel();
        let request = Event::Request {
            conn,
            payload,
            served,
        };
        if events.send(request).is_err() {
            return;
        }
        // Later frames stay in the socket until this one is answered.
        if done.await.is_err() {
            return;
        }
    };
    let _ = events.send(Event::Closed {
        conn,
        reason: Some(reason),
    });
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    conn: ConnectionId,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_raw(&mut writer, &frame).await {
            let _ = events.send(Event::Closed {
                conn,
                reason: Some(e),
            });
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn listen_twice_fails() {
        let server = Server::new();
        server.listen_on(loopback()).await.unwrap();
        assert!(matches!(
            server.listen_on(loopback()).await,
            Err(ServerError::AlreadyListening)
        ));
        server.stop();
        server.join().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn listen_binds_every_interface() {
        let server = Server::new();
        let addr = server.listen(0).await.unwrap();
        assert!(addr.ip().is_unspecified());
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert_eq!(server.state(), ServerState::Listening);
        server.stop();
        server.join().await.unwrap();
    }

    #[tokio::test]
    async fn run_requires_listen() {
        let server = Server::new();
        assert!(matches!(server.run().await, Err(ServerError::NotListening)));
        assert_eq!(server.state(), ServerState::Created);
    }

    #[tokio::test]
    async fn join_requires_stop() {
        let server = Server::new();
        server.listen_on(loopback()).await.unwrap();
        assert!(matches!(server.join().await, Err(ServerError::NotStopped)));
        server.stop();
        server.join().await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_leaves_server_reusable() {
        let taken = TcpListener::bind(loopback()).await.unwrap();
        let addr = taken.local_addr().unwrap();
        let server = Server::new();
        assert!(matches!(
            server.listen_on(addr).await,
            Err(ServerError::Bind { .. })
        ));
        assert_eq!(server.state(), ServerState::Created);
    }

    #[tokio::test]
    #[should_panic(expected = "server dropped while Listening")]
    async fn drop_while_listening_panics() {
        let server = Server::new();
        server.listen_on(loopback()).await.unwrap();
        drop(server);
    }

    #[tokio::test]
    async fn stop_ends_run() {
        let server = Arc::new(Server::new());
        server.listen_on(loopback()).await.unwrap();
        let runner = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        tokio::task::yield_now().await;
        server.stop();
        runner.await.unwrap().unwrap();
        server.join().await.unwrap();
    }
}
