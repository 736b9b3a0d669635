pub mod client;
pub mod jsonrpc;

pub use client::{default_socket_path, SocketClient};
pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION};
