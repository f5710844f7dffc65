//! Voodoo RPC core.
//! Transport-free: identifiers, tagged values, packet layout, registries and dispatch.
//! The network side lives in voodoo-net and drives everything here.

pub mod host;
pub mod id;
pub mod interface;
pub mod value;
pub mod wire;

pub use host::{arg, Handler, Host, HostError};
pub use id::{Id, IdAllocator, IdError};
pub use interface::{Invocation, MethodTag, RELEASE};
pub use value::{
    decode_values, encode_values, CodecError, FromValue, PacketReader, PacketWriter, Tag, Value,
};
pub use wire::{encode_frame, frame_len, FrameError, Reply, Request, MAX_FRAME_LEN};

/// Default TCP port a server listens on and a client connects to.
pub const DEFAULT_PORT: u16 = 5000;

/// Default host a client connects to.
pub const DEFAULT_HOST: &str = "127.0.0.1";
