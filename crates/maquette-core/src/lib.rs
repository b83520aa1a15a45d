//! Maquette Core - RPC dispatch and multi-instance coordination for the
//! Maquette CAD bridge.
//!
//! This crate provides everything the bridge needs short of the HTTP transport
//! itself: the command registry and router (with the write-safety smoke gate),
//! the port-locking protocol that keeps server instances on disjoint ports,
//! the process lifecycle manager (start / attach / stop / force-stop), and the
//! rotating per-port log sink. The `maquette-rpc` crate layers the axum server
//! and the bridge CLI on top.
//!
//! # Example
//!
//! ```rust,ignore
//! use maquette_core::{CommandRegistry, FnCommand, CommandKind, RpcRouter};
//! use std::sync::Arc;
//!
//! let registry = CommandRegistry::load(&commands_path)?;
//! let router = RpcRouter::new(registry);
//! router.register(Arc::new(FnCommand::new("ping", CommandKind::Read, |_| {
//!     Ok(serde_json::json!({"pong": true}))
//! })))?;
//! let response = router.dispatch("ping", None, serde_json::json!(1)).await;
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod logsink;
pub mod platform;
pub mod portlock;
pub mod registry;
pub mod router;
pub mod rpc;

// Re-export commonly used types
pub use command::{Command, CommandKind, FnCommand};
pub use config::{BridgeConfig, BridgeSettings, PortConfig};
pub use error::{BridgeError, Result};
pub use lifecycle::{BridgeStatus, LifecycleManager, LifecycleState, StartOutcome, StopOutcome};
pub use logsink::LogSink;
pub use portlock::{LockRecord, PortClaim, PortLocker};
pub use registry::{CommandMeta, CommandRegistry};
pub use router::RpcRouter;
pub use rpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, PARSE_ERROR_CODE};
