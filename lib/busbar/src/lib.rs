//! Busbar is a client/server connection engine for a message-oriented
//! IPC bus: the lifecycle state machine, non-blocking send/receive
//! queues integrated with an external readiness loop, deadline-tracked
//! reply dispatch, and the server-side object tree with methods,
//! properties, introspection and object-manager support.
//!
//! Wire marshalling, socket and kernel transport primitives, the auth
//! handshake and match-rule parsing live behind the collaborator
//! contracts in [`transport`] and [`filter`].

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod address;
pub mod builtin;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod filter;
pub mod message;
pub mod reply;
pub mod support;
pub mod transport;
pub mod tree;

pub use crate::address::{AddressList, Endpoint};
pub use crate::config::Limits;
pub use crate::connection::{Connection, State, TIMEOUT_NEVER};
pub use crate::dispatch::DispatchCtx;
pub use crate::message::{Message, MessageType, Value};
pub use crate::support::{BusError, BusResult, ErrorUtils, Fault, Handled};
pub use crate::transport::{Connector, Transport, TransportKind, WriteOutcome};
pub use crate::tree::vtable::{PropertyFlags, PropertyRef, Vtable};
pub use crate::tree::ObjectTree;
