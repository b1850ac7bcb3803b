//! RPC router and multiplexer: typed calls between many peers sharing one
//! namespace of routes, over the unix domain socket, child stdio pipes, and
//! the UI websocket.

pub mod auth;
pub mod frame;
pub mod router;
pub mod server;
pub mod socket;
pub mod stdio;

pub use auth::{SwapTokenTable, TokenSigner, TokenSwapEntry, make_auth_token};
pub use frame::{RpcContext, RpcMessage};
pub use router::{DEFAULT_CALL_TIMEOUT, PEER_CHANNEL_SIZE, RpcError, RpcRouter, StreamHandle};
pub use server::RpcServer;
pub use socket::{attach_stdio_peer, run_domain_socket_listener};
pub use stdio::{PacketParser, encode_packet};
