//! Client: one outbound connection driven by a background task.
//!
//! Calls are queued to the connection task, which writes each request and reads
//! its reply before taking the next one. Cloning a `Client` shares the
//! connection.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use voodoo_core::wire::{encode_frame, FrameError};
use voodoo_core::{CodecError, Id, Reply, Request, Value, RELEASE};

use crate::transport::{read_frame, write_raw, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client not connected")]
    NotConnected,
    #[error("client already connected")]
    AlreadyConnected,
    #[error("could not connect: {0}")]
    Connect(std::io::Error),
    #[error("connection failed: {0}")]
    Transport(#[from] TransportError),
    #[error("connection closed")]
    Disconnected,
    #[error("remote fault: {0}")]
    Fault(String),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),
}

struct Outbound {
    frame: Vec<u8>,
    /// `None` for fire-and-forget calls; the reply is read and discarded.
    reply: Option<oneshot::Sender<Result<Vec<u8>, TransportError>>>,
}

struct Link {
    outbound: mpsc::UnboundedSender<Outbound>,
    peer: SocketAddr,
}

#[derive(Default)]
struct Inner {
    link: OnceLock<Link>,
}

#[derive(Clone, Default)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.link.get().is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.link.get().map(|l| l.peer)
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<(), ClientError> {
        if self.is_connected() {
            return Err(ClientError::AlreadyConnected);
        }
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(ClientError::Connect)?;
        let _ = stream.set_nodelay(true);
        let peer = stream.peer_addr().map_err(ClientError::Connect)?;
        let (outbound, rx) = mpsc::unbounded_channel();
        self.inner
            .link
            .set(Link { outbound, peer })
            .map_err(|_| ClientError::AlreadyConnected)?;
        let (reader, writer) = stream.into_split();
        tokio::spawn(run_link(reader, writer, rx, peer));
        tracing::info!(%peer, "connected");
        Ok(())
    }

    /// Invoke `method` and wait for its results.
    pub async fn call(&self, method: Id, args: Vec<Value>) -> Result<Vec<Value>, ClientError> {
        let payload = Request::new(method, args).encode()?;
        let reply = self.roundtrip(encode_frame(&payload)?).await?;
        match Reply::decode(&reply)? {
            Reply::Ok(values) => Ok(values),
            Reply::Fault(message) => Err(ClientError::Fault(message)),
        }
    }

    /// Like `call`, with `buffer` appended as the final, raw byte-buffer argument.
    pub async fn call2(
        &self,
        method: Id,
        buffer: impl Into<Vec<u8>>,
        mut args: Vec<Value>,
    ) -> Result<Vec<Value>, ClientError> {
        args.push(Value::Buffer(buffer.into()));
        self.call(method, args).await
    }

    /// Send RELEASE to `id` without waiting for the reply.
    pub fn release(&self, id: Id) -> Result<(), ClientError> {
        let payload = Request::new(id, vec![Value::I32(RELEASE)]).encode()?;
        let frame = encode_frame(&payload)?;
        self.link()?
            .outbound
            .send(Outbound { frame, reply: None })
            .map_err(|_| ClientError::Disconnected)
    }

    async fn roundtrip(&self, frame: Vec<u8>) -> Result<Vec<u8>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.link()?
            .outbound
            .send(Outbound {
                frame,
                reply: Some(tx),
            })
            .map_err(|_| ClientError::Disconnected)?;
        let reply = rx.await.map_err(|_| ClientError::Disconnected)?;
        Ok(reply?)
    }

    fn link(&self) -> Result<&Link, ClientError> {
        self.inner.link.get().ok_or(ClientError::NotConnected)
    }
}

async fn run_link(
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    peer: SocketAddr,
) {
    while let Some(out) = rx.recv().await {
        let result = match write_raw(&mut writer, &out.frame).await {
            Ok(()) => read_frame(&mut reader).await,
            Err(e) => Err(e),
        };
        let failed = match &result {
            Err(e) if !e.is_eof() => {
                tracing::warn!(%peer, "connection lost: {e}");
                true
            }
            Err(_) => {
                tracing::info!(%peer, "server closed connection");
                true
            }
            Ok(_) => false,
        };
        if let Some(reply) = out.reply {
            let _ = reply.send(result);
        }
        if failed {
            // Dropping `rx` fails every queued and later call with Disconnected.
            break;
        }
    }
}
