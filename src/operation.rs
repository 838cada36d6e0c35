//! Contract with the operation layer.
//!
//! The operation layer serializes request/response exchanges onto a connection.
//! It registers each exchange with [`Connection::add_operation`] and removes it again
//! with [`Connection::remove_operation`] once it completes.

use futures::future::BoxFuture;
use std::{
    io::{ErrorKind, Result},
    sync::Arc,
};

use crate::Connection;

/// A single request/response exchange carried over a connection.
pub trait Operation: Send + Sync {
    /// Whether the request was sent by the remote end.
    fn is_incoming(&self) -> bool;

    /// Cancels an outgoing operation with `error`.
    ///
    /// Must not complete before the operation has removed itself from its connection.
    fn cancel(&self, error: ErrorKind) -> BoxFuture<'_, ()>;

    /// Cancels an incoming operation with `error`.
    ///
    /// Must not complete before the operation has removed itself from its connection.
    fn cancel_incoming(&self, error: ErrorKind) -> BoxFuture<'_, ()>;
}

/// Receive side of the operation layer.
pub trait OperationLayer: Send + Sync {
    /// Processes data received on `connection`.
    ///
    /// Called from the host driver's delivery context, thus must not block.
    fn recv(&self, connection: &Arc<Connection>, data: &[u8]);
}

/// Handler for incoming requests on an enabled connection.
pub type RequestHandler = Arc<dyn Fn(&Arc<dyn Operation>) -> Result<()> + Send + Sync>;
