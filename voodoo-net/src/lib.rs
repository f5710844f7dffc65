//! Voodoo RPC over TCP.
//! Server accept/dispatch loop with per-connection cleanup, client with typed
//! calls, and the remote object / proxy pair built on both.

pub mod client;
pub mod context;
pub mod remote;
pub mod server;
pub mod transport;

pub use client::{Client, ClientError};
pub use context::{CallContext, CleanupScope, ConnectionId};
pub use remote::{publish, Interface, Proxy};
pub use server::{Server, ServerError, ServerState};
pub use transport::TransportError;
