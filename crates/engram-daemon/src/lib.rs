//! Memory-server daemon.
//!
//! JSON-RPC 2.0 over NDJSON on a Unix-domain socket: one request per line,
//! one response per line. Exposes the pattern store, the reasoning bank,
//! and selected vector-store operations to other processes. Limits
//! (connections, request timeout, message size) reject with typed errors;
//! they never crash the server.

pub mod protocol;
pub mod server;

pub use protocol::{RpcError, RpcRequest, RpcResponse};
pub use server::{DaemonServer, DaemonState, ShutdownHandler};
